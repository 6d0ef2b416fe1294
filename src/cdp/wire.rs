//! Wire types for the Chrome DevTools Protocol's JSON-RPC-over-WebSocket
//! envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outgoing CDP command.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A CDP protocol-level error, carried inside a [`Response`].
#[derive(Debug, Clone, Deserialize)]
pub struct CdpErrorBody {
    pub code: i64,
    pub message: String,
}

/// An incoming response to a previously sent [`Command`], correlated by id.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CdpErrorBody>,
}

/// An incoming, unsolicited CDP event (no `id` field).
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Either shape a raw inbound WebSocket text frame can take: a correlated
/// response or a broadcast event, distinguished by the presence of `id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Response(Response),
    Event(Event),
}
