//! # Engagement Data Model
//!
//! Identifiers, push events and hub commands shared by every engine component.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key of a likeable/commentable resource (a form template).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Wraps a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A comment as pushed by the hub.
///
/// Keys may arrive as strings or numbers, and timestamps without an offset are
/// taken as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(deserialize_with = "wire::id")]
    pub id: String,
    #[serde(rename = "templateId", deserialize_with = "wire::resource_id")]
    pub resource_id: ResourceId,
    #[serde(default, deserialize_with = "wire::optional_id")]
    pub author_id: Option<String>,
    #[serde(default, alias = "userName")]
    pub author_name: Option<String>,
    pub content: String,
    #[serde(deserialize_with = "wire::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Identifiers arrive as strings or numbers depending on the server's key type.
pub(crate) fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, or an offset-less ISO 8601 timestamp read as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc()))
}

mod wire {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::{id_text, parse_timestamp, ResourceId};

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let value = Value::deserialize(deserializer)?;
        id_text(&value).ok_or_else(|| D::Error::custom(format!("expected a string or numeric id, got {}", value)))
    }

    pub fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            value => id_text(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected a string or numeric id, got {}", value))),
        }
    }

    pub fn resource_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ResourceId, D::Error> {
        id(deserializer).map(ResourceId::new)
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(|e| D::Error::custom(format!("invalid timestamp {}: {}", raw, e)))
    }

    pub fn optional_timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid timestamp {}: {}", raw, e))),
            None => Ok(None),
        }
    }
}

/// Aggregate like count pushed for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikesUpdate {
    pub resource_id: ResourceId,
    /// Raw count from the server; negative values are clamped when merged.
    pub count: i64,
    /// The current user's own flag, when the server includes it.
    pub liked_by_current_user: Option<bool>,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    UpdateLikes(LikesUpdate),
    ReceiveComment(Comment),
    UpdateComment(Comment),
    DeleteComment { comment_id: String },
}

/// Discriminant of [`PushEvent`], used as the dispatcher routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UpdateLikes,
    ReceiveComment,
    UpdateComment,
    DeleteComment,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 4] = [
        EventKind::UpdateLikes,
        EventKind::ReceiveComment,
        EventKind::UpdateComment,
        EventKind::DeleteComment,
    ];

    /// Name of the hub method carrying this event.
    pub fn target(self) -> &'static str {
        match self {
            EventKind::UpdateLikes => "UpdateLikes",
            EventKind::ReceiveComment => "ReceiveComment",
            EventKind::UpdateComment => "UpdateComment",
            EventKind::DeleteComment => "DeleteComment",
        }
    }
}

impl PushEvent {
    /// Routing key of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::UpdateLikes(_) => EventKind::UpdateLikes,
            PushEvent::ReceiveComment(_) => EventKind::ReceiveComment,
            PushEvent::UpdateComment(_) => EventKind::UpdateComment,
            PushEvent::DeleteComment { .. } => EventKind::DeleteComment,
        }
    }

    /// Shorthand for a likes update without the per-user flag.
    pub fn likes(resource_id: impl Into<ResourceId>, count: i64) -> Self {
        PushEvent::UpdateLikes(LikesUpdate {
            resource_id: resource_id.into(),
            count,
            liked_by_current_user: None,
        })
    }
}

/// Membership operation on a resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupOp {
    Join,
    Leave,
}

impl fmt::Display for GroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupOp::Join => f.write_str("join"),
            GroupOp::Leave => f.write_str("leave"),
        }
    }
}

/// Client → server commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HubCommand {
    JoinGroup(ResourceId),
    LeaveGroup(ResourceId),
}

impl HubCommand {
    /// Builds the command for a group operation.
    pub fn for_op(op: GroupOp, resource_id: ResourceId) -> Self {
        match op {
            GroupOp::Join => HubCommand::JoinGroup(resource_id),
            GroupOp::Leave => HubCommand::LeaveGroup(resource_id),
        }
    }

    /// Hub method invoked on the server.
    pub fn method(&self) -> &'static str {
        match self {
            HubCommand::JoinGroup(_) => "JoinTemplateGroup",
            HubCommand::LeaveGroup(_) => "LeaveTemplateGroup",
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        match self {
            HubCommand::JoinGroup(id) | HubCommand::LeaveGroup(id) => id,
        }
    }
}

/// Local like intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Like,
    Unlike,
}

impl MutationKind {
    /// Change applied to the like count.
    pub fn delta(self) -> i64 {
        match self {
            MutationKind::Like => 1,
            MutationKind::Unlike => -1,
        }
    }

    /// The flag this mutation produces.
    pub fn liked(self) -> bool {
        matches!(self, MutationKind::Like)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Like => f.write_str("like"),
            MutationKind::Unlike => f.write_str("unlike"),
        }
    }
}
