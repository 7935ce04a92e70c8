//! # WebSocket Hub Transport
//!
//! A [`PushTransport`] speaking the SignalR JSON hub protocol.
//!
//! ## Connection sequence:
//! 1.  `POST {hub}/negotiate?negotiateVersion=1` returns a connection token.
//! 2.  WebSocket upgrade at `{hub}?id={token}` (`http` → `ws`, `https` → `wss`).
//! 3.  Handshake `{"protocol":"json","version":1}`, answered by `{}`.
//!
//! Once connected, a writer task drains outgoing frames and sends a keep-alive ping
//! on every idle interval, and a reader task decodes server invocations into
//! [`PushEvent`]s and resolves pending invocations from their completions. The event
//! stream returned by `connect` ends when the reader stops, which the connection
//! manager treats as an unexpected drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::EngineConfig;
use crate::core::connection::{EventStream, PushTransport};
use crate::core::events::{HubCommand, PushEvent};
use crate::core::lock;
use crate::error::TransportError;
use crate::retrieve::ky_http::{ApiClient, ApiResponse};
use crate::transport::hub_protocol::{self, HubMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<(), TransportError>>;
/// Invocations awaiting completion, by invocation id.
type Pending = Arc<Mutex<HashMap<String, (&'static str, Responder)>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_token: Option<String>,
    connection_id: Option<String>,
    /// Redirect to another service (e.g. a managed SignalR endpoint).
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

/// Where to open the WebSocket.
struct Endpoint {
    url: Url,
    bearer: Option<String>,
}

/// One live connection.
struct Live {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Pending,
    cancel: CancellationToken,
}

pub struct WsTransport {
    config: EngineConfig,
    http: ApiClient,
    live: Mutex<Option<Live>>,
    next_invocation: AtomicU64,
}

impl WsTransport {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let http = ApiClient::new(
            &config.hub_url(),
            config.access_token.clone(),
            config.rest_max_retries,
        )?;
        Ok(Self {
            config,
            http,
            live: Mutex::new(None),
            next_invocation: AtomicU64::new(0),
        })
    }

    async fn negotiate(&self) -> Result<Endpoint, TransportError> {
        let response: ApiResponse<NegotiateResponse> = self
            .http
            .request(Method::POST, "negotiate?negotiateVersion=1", None, None::<()>)
            .await
            .map_err(|e| TransportError::Negotiation(format!("{:#}", e)))?;
        if !response.success {
            return Err(TransportError::Negotiation(format!(
                "status {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            )));
        }
        let negotiated = response
            .data
            .ok_or_else(|| TransportError::Negotiation("empty negotiate response".to_string()))?;
        if let Some(error) = negotiated.error {
            return Err(TransportError::Negotiation(error));
        }

        let (base, bearer) = match negotiated.url {
            Some(redirect) => (redirect, negotiated.access_token),
            None => (self.config.hub_url(), self.config.access_token.clone()),
        };
        let token = negotiated.connection_token.or(negotiated.connection_id);
        let url = websocket_url(&base, token.as_deref())?;
        Ok(Endpoint { url, bearer })
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<WsStream, TransportError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        if let Some(token) = &endpoint.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Negotiation(format!("invalid access token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let limit = self.config.handshake_timeout();
        let (ws_stream, _) = timeout(limit, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(ws_stream)
    }

    /// Sends the protocol handshake and waits for its reply. Returns any records
    /// that arrived in the same frame after the reply.
    async fn handshake(
        &self,
        write: &mut SplitSink<WsStream, WsMessage>,
        read: &mut SplitStream<WsStream>,
    ) -> Result<Vec<String>, TransportError> {
        write
            .send(WsMessage::Text(hub_protocol::handshake_request().into()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let limit = self.config.handshake_timeout();
        let deadline = Instant::now() + limit;
        loop {
            let next = tokio::time::timeout_at(deadline, read.next())
                .await
                .map_err(|_| TransportError::Timeout(limit))?;
            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    let mut records = hub_protocol::split_records(text.as_str());
                    let reply = records
                        .next()
                        .ok_or_else(|| TransportError::Handshake("empty handshake reply".to_string()))?;
                    hub_protocol::parse_handshake_response(reply)?;
                    return Ok(records.map(str::to_string).collect());
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(TransportError::Handshake(format!("server closed: {:?}", frame)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
                None => return Err(TransportError::ConnectionClosed),
            }
        }
    }

    fn replace_live(&self, next: Option<Live>) {
        let previous = std::mem::replace(&mut *lock(&self.live), next);
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self) -> Result<EventStream, TransportError> {
        self.replace_live(None);

        let endpoint = self.negotiate().await?;
        log::info!("Connecting to hub: {}", endpoint.url);
        let ws_stream = self.open(&endpoint).await?;
        let (mut write, mut read) = ws_stream.split();
        let early_records = self.handshake(&mut write, &mut read).await?;
        log::info!("Hub handshake completed");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        for record in &early_records {
            handle_record(record, &events_tx, &pending, &cancel);
        }

        tokio::spawn(run_writer(
            write,
            outgoing_rx,
            self.config.keep_alive_interval(),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            read,
            events_tx,
            Arc::clone(&pending),
            server_timeout(self.config.keep_alive_interval()),
            cancel.clone(),
        ));

        self.replace_live(Some(Live {
            outgoing: outgoing_tx,
            pending,
            cancel,
        }));
        Ok(events_rx)
    }

    async fn invoke(&self, command: HubCommand) -> Result<(), TransportError> {
        let (outgoing, pending) = {
            let live = lock(&self.live);
            match live.as_ref() {
                Some(live) if !live.cancel.is_cancelled() => {
                    (live.outgoing.clone(), Arc::clone(&live.pending))
                }
                _ => return Err(TransportError::NotConnected),
            }
        };

        let invocation_id = (self.next_invocation.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        lock(&pending).insert(invocation_id.clone(), (command.method(), tx));

        log::debug!("Invoking {}({}) as #{}", command.method(), command.resource_id(), invocation_id);
        if outgoing
            .send(hub_protocol::encode_command(&invocation_id, &command))
            .is_err()
        {
            lock(&pending).remove(&invocation_id);
            return Err(TransportError::ConnectionClosed);
        }

        let limit = self.config.invocation_timeout();
        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                lock(&pending).remove(&invocation_id);
                Err(TransportError::Timeout(limit))
            }
        }
    }

    async fn disconnect(&self) {
        self.replace_live(None);
    }
}

/// `http(s)://host/hub` → `ws(s)://host/hub?id={token}`.
fn websocket_url(base: &str, token: Option<&str>) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)
        .map_err(|e| TransportError::Negotiation(format!("invalid hub URL {}: {}", base, e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Negotiation(format!("unsupported scheme {}", other)));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Negotiation(format!("cannot switch {} to {}", base, scheme)))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}

/// The server is considered gone after two missed keep-alive intervals.
fn server_timeout(keep_alive: Option<Duration>) -> Option<Duration> {
    keep_alive.map(|interval| interval * 2)
}

async fn run_writer(
    mut write: SplitSink<WsStream, WsMessage>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    keep_alive: Option<Duration>,
    cancel: CancellationToken,
) {
    // Without keep-alive the timer never fires.
    let period = keep_alive.unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick(), if keep_alive.is_some() => hub_protocol::encode_ping(),
        };
        if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
            log::warn!("Hub write failed: {}", e);
            cancel.cancel();
            return;
        }
        ping.reset();
    }

    let _ = write.close().await;
    log::debug!("Hub writer stopped");
}

async fn run_reader(
    mut read: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<PushEvent>,
    pending: Pending,
    server_timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = next_with_timeout(&mut read, server_timeout) => next,
        };
        match next {
            Err(limit) => {
                log::warn!("No message from the hub for {:?}; dropping the connection", limit);
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                for record in hub_protocol::split_records(text.as_str()) {
                    if !handle_record(record, &events, &pending, &cancel) {
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                log::info!("Hub closed the WebSocket: {:?}", frame);
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                log::error!("Hub read error: {}", e);
                break;
            }
            Ok(None) => {
                log::info!("Hub stream ended");
                break;
            }
        }
    }

    cancel.cancel();
    for (_, (method, responder)) in lock(&pending).drain() {
        log::debug!("Abandoning pending {} invocation", method);
        let _ = responder.send(Err(TransportError::ConnectionClosed));
    }
    log::debug!("Hub reader stopped");
}

async fn next_with_timeout(
    read: &mut SplitStream<WsStream>,
    limit: Option<Duration>,
) -> Result<Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>, Duration> {
    match limit {
        Some(limit) => timeout(limit, read.next()).await.map_err(|_| limit),
        None => Ok(read.next().await),
    }
}

/// Handles one record. Returns `false` once the server asked to close.
fn handle_record(
    record: &str,
    events: &mpsc::UnboundedSender<PushEvent>,
    pending: &Pending,
    cancel: &CancellationToken,
) -> bool {
    let message = match hub_protocol::parse_message(record) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Skipping hub record: {}", e);
            return true;
        }
    };

    match message {
        HubMessage::Invocation { target, arguments, .. } => {
            match hub_protocol::decode_event(&target, &arguments) {
                Ok(Some(event)) => {
                    log::trace!("Hub event {}", target);
                    let _ = events.send(event);
                }
                Ok(None) => log::debug!("Ignoring hub invocation of unknown target {}", target),
                Err(e) => log::warn!("Dropping {} event: {}", target, e),
            }
        }
        HubMessage::Completion { invocation_id, error } => {
            match lock(pending).remove(&invocation_id) {
                Some((method, responder)) => {
                    let result = match error {
                        Some(message) => Err(TransportError::Invocation {
                            method: method.to_string(),
                            message,
                        }),
                        None => Ok(()),
                    };
                    let _ = responder.send(result);
                }
                None => log::debug!("Completion for unknown invocation #{}", invocation_id),
            }
        }
        HubMessage::Ping => log::trace!("Hub ping"),
        HubMessage::Close { error, allow_reconnect } => {
            log::info!(
                "Hub sent close (error: {}, reconnect allowed: {})",
                error.as_deref().unwrap_or("none"),
                allow_reconnect
            );
            cancel.cancel();
            return false;
        }
        HubMessage::Ignored(kind) => log::trace!("Ignoring hub message type {}", kind),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn websocket_urls_switch_scheme_and_carry_the_token() {
        let url = websocket_url("https://localhost:7236/hubs/comments", Some("a+b")).unwrap();
        assert_eq!(url.as_str(), "wss://localhost:7236/hubs/comments?id=a%2Bb");

        let plain = websocket_url("http://api.test/hubs/comments", None).unwrap();
        assert_eq!(plain.as_str(), "ws://api.test/hubs/comments");

        assert!(websocket_url("ftp://api.test/hub", None).is_err());
    }

    #[test]
    fn negotiate_responses_decode() {
        let raw = json!({
            "negotiateVersion": 1,
            "connectionId": "abc",
            "connectionToken": "tok",
            "availableTransports": [{"transport": "WebSockets", "transferFormats": ["Text", "Binary"]}]
        });
        let parsed: NegotiateResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.connection_token.as_deref(), Some("tok"));
        assert_eq!(parsed.url, None);
    }

    #[tokio::test]
    async fn records_route_events_and_completions() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert("1".into(), ("JoinTemplateGroup", tx));

        let push = r#"{"type":1,"target":"UpdateLikes","arguments":[3,"t1"]}"#;
        assert!(handle_record(push, &events_tx, &pending, &cancel));
        assert_eq!(events_rx.recv().await.unwrap(), PushEvent::likes("t1", 3));

        let failed = r#"{"type":3,"invocationId":"1","error":"no such group"}"#;
        assert!(handle_record(failed, &events_tx, &pending, &cancel));
        assert_eq!(
            rx.await.unwrap(),
            Err(TransportError::Invocation {
                method: "JoinTemplateGroup".into(),
                message: "no such group".into(),
            })
        );

        assert!(!handle_record(r#"{"type":7}"#, &events_tx, &pending, &cancel));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn invoke_without_connection_fails_fast() {
        let transport = WsTransport::new(EngineConfig::default()).unwrap();
        let err = transport
            .invoke(HubCommand::JoinGroup("t1".into()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }
}
