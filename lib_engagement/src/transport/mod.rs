//! # Hub Transport
//!
//! The concrete push transport: SignalR JSON hub protocol over WebSocket.

/// Encoding and decoding of hub protocol records.
pub mod hub_protocol;
/// `PushTransport` implementation over `tokio-tungstenite`.
pub mod ws_transport;

pub use ws_transport::WsTransport;
