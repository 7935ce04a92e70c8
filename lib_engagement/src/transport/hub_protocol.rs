//! # Hub Protocol Codec
//!
//! The JSON flavour of the SignalR hub protocol. Every message is a JSON object
//! terminated by the record separator `0x1E`; one WebSocket frame may carry several.
//!
//! | `type` | Message     | Direction        |
//! |--------|-------------|------------------|
//! | 1      | Invocation  | both             |
//! | 3      | Completion  | server → client  |
//! | 6      | Ping        | both             |
//! | 7      | Close       | server → client  |

use serde_json::{json, Value};

use crate::core::events::{id_text, Comment, HubCommand, LikesUpdate, PushEvent, ResourceId};
use crate::error::TransportError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Streaming and acknowledgement messages the client does not use.
    Ignored(u64),
}

/// `{"protocol":"json","version":1}` plus the separator.
pub fn handshake_request() -> String {
    frame(json!({ "protocol": "json", "version": 1 }))
}

/// Checks the server's handshake reply (`{}` on success).
pub fn parse_handshake_response(record: &str) -> Result<(), TransportError> {
    let value: Value = serde_json::from_str(record)
        .map_err(|e| TransportError::Handshake(format!("malformed handshake response: {}", e)))?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(TransportError::Handshake(error.to_string())),
        None => Ok(()),
    }
}

/// Splits a frame into its records, dropping the empty tail after the last separator.
pub fn split_records(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn parse_message(record: &str) -> Result<HubMessage, TransportError> {
    let value: Value = serde_json::from_str(record)
        .map_err(|e| TransportError::Protocol(format!("malformed message: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::Protocol(format!("message without type: {}", record)))?;
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

    let message = match kind {
        INVOCATION => HubMessage::Invocation {
            invocation_id: text("invocationId"),
            target: text("target")
                .ok_or_else(|| TransportError::Protocol("invocation without target".to_string()))?,
            arguments: value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: text("invocationId")
                .ok_or_else(|| TransportError::Protocol("completion without invocationId".to_string()))?,
            error: text("error"),
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: text("error"),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        other => HubMessage::Ignored(other),
    };
    Ok(message)
}

/// Encodes a blocking invocation of `command` awaiting completion `invocation_id`.
pub fn encode_command(invocation_id: &str, command: &HubCommand) -> String {
    frame(json!({
        "type": INVOCATION,
        "invocationId": invocation_id,
        "target": command.method(),
        "arguments": [command.resource_id().as_str()],
    }))
}

pub fn encode_ping() -> String {
    frame(json!({ "type": PING }))
}

fn frame(value: Value) -> String {
    let mut out = value.to_string();
    out.push(RECORD_SEPARATOR);
    out
}

/// Maps a server invocation to a push event. Unknown targets yield `Ok(None)`.
pub fn decode_event(target: &str, arguments: &[Value]) -> Result<Option<PushEvent>, TransportError> {
    let event = match target {
        "UpdateLikes" => PushEvent::UpdateLikes(decode_likes(arguments)?),
        "ReceiveComment" => PushEvent::ReceiveComment(decode_comment(target, arguments)?),
        "UpdateComment" => PushEvent::UpdateComment(decode_comment(target, arguments)?),
        "DeleteComment" => PushEvent::DeleteComment {
            comment_id: arguments
                .first()
                .and_then(id_text)
                .ok_or_else(|| bad_arguments(target, arguments))?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// `UpdateLikes(count, resourceId[, liked])`, or a single object argument with
/// `likesCount`/`count`, `templateId` and an optional `likedByCurrentUser`.
fn decode_likes(arguments: &[Value]) -> Result<LikesUpdate, TransportError> {
    let update = match arguments {
        [Value::Object(fields)] => {
            let count = fields
                .get("likesCount")
                .or_else(|| fields.get("count"))
                .and_then(Value::as_i64);
            let resource_id = fields.get("templateId").and_then(id_text);
            count.zip(resource_id).map(|(count, resource_id)| LikesUpdate {
                resource_id: ResourceId::new(resource_id),
                count,
                liked_by_current_user: fields.get("likedByCurrentUser").and_then(Value::as_bool),
            })
        }
        [count, resource_id, rest @ ..] => count.as_i64().zip(id_text(resource_id)).map(|(count, id)| {
            LikesUpdate {
                resource_id: ResourceId::new(id),
                count,
                liked_by_current_user: rest.first().and_then(Value::as_bool),
            }
        }),
        _ => None,
    };
    update.ok_or_else(|| bad_arguments("UpdateLikes", arguments))
}

fn decode_comment(target: &str, arguments: &[Value]) -> Result<Comment, TransportError> {
    let raw = arguments
        .first()
        .ok_or_else(|| bad_arguments(target, arguments))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| TransportError::Protocol(format!("{} carried an invalid comment: {}", target, e)))
}

fn bad_arguments(target: &str, arguments: &[Value]) -> TransportError {
    TransportError::Protocol(format!(
        "unexpected arguments for {}: {}",
        target,
        Value::from(arguments.to_vec())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_end_with_the_record_separator() {
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        let join = encode_command("7", &HubCommand::JoinGroup(ResourceId::from("t1")));
        assert!(join.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(join.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(
            value,
            json!({"type": 1, "invocationId": "7", "target": "JoinTemplateGroup", "arguments": ["t1"]})
        );
    }

    #[test]
    fn handshake_errors_are_reported() {
        assert!(parse_handshake_response("{}").is_ok());
        assert_eq!(
            parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#),
            Err(TransportError::Handshake("Requested protocol 'json' is not available.".into()))
        );
    }

    #[test]
    fn one_frame_may_carry_several_messages() {
        let payload = "{\"type\":6}\u{1e}{\"type\":3,\"invocationId\":\"1\"}\u{1e}";
        let messages: Vec<HubMessage> = split_records(payload)
            .map(|r| parse_message(r).unwrap())
            .collect();
        assert_eq!(
            messages,
            vec![
                HubMessage::Ping,
                HubMessage::Completion { invocation_id: "1".into(), error: None },
            ]
        );
    }

    #[test]
    fn close_and_unknown_types() {
        assert_eq!(
            parse_message(r#"{"type":7,"error":"bye","allowReconnect":true}"#).unwrap(),
            HubMessage::Close { error: Some("bye".into()), allow_reconnect: true }
        );
        assert_eq!(parse_message(r#"{"type":2}"#).unwrap(), HubMessage::Ignored(2));
        assert!(parse_message(r#"{"target":"x"}"#).is_err());
    }

    #[test]
    fn likes_updates_decode_from_positional_or_object_arguments() {
        assert_eq!(
            decode_event("UpdateLikes", &[json!(4), json!("t1")]).unwrap(),
            Some(PushEvent::likes("t1", 4))
        );
        assert_eq!(
            decode_event("UpdateLikes", &[json!(4), json!(12), json!(true)]).unwrap(),
            Some(PushEvent::UpdateLikes(LikesUpdate {
                resource_id: "12".into(),
                count: 4,
                liked_by_current_user: Some(true),
            }))
        );
        assert_eq!(
            decode_event("UpdateLikes", &[json!({"templateId": "t2", "likesCount": 1})]).unwrap(),
            Some(PushEvent::likes("t2", 1))
        );
        assert!(decode_event("UpdateLikes", &[json!(4)]).is_err());
    }

    #[test]
    fn comment_events_decode() {
        let comment = json!({
            "id": "c1",
            "templateId": "t1",
            "userName": "Ann",
            "content": "hi",
            "createdAt": "2024-05-01T10:00:00Z"
        });
        match decode_event("ReceiveComment", &[comment]).unwrap() {
            Some(PushEvent::ReceiveComment(c)) => {
                assert_eq!(c.id, "c1");
                assert_eq!(c.author_name.as_deref(), Some("Ann"));
                assert_eq!(c.resource_id, ResourceId::from("t1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            decode_event("DeleteComment", &[json!("c1")]).unwrap(),
            Some(PushEvent::DeleteComment { comment_id: "c1".into() })
        );
        assert_eq!(decode_event("SomethingElse", &[]).unwrap(), None);
    }

    #[test]
    fn comments_from_servers_with_numeric_keys_and_local_timestamps_decode() {
        let comment = json!({
            "id": 7,
            "templateId": 12,
            "userName": "Ann",
            "content": "hi",
            "createdAt": "2024-05-01T10:00:00.123"
        });
        match decode_event("UpdateComment", &[comment]).unwrap() {
            Some(PushEvent::UpdateComment(c)) => {
                assert_eq!(c.id, "7");
                assert_eq!(c.resource_id, ResourceId::from("12"));
                assert_eq!(c.created_at.to_rfc3339(), "2024-05-01T10:00:00.123+00:00");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            decode_event("DeleteComment", &[json!(7)]).unwrap(),
            Some(PushEvent::DeleteComment { comment_id: "7".into() })
        );
    }
}
