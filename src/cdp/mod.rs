//! A minimal per-target Chrome DevTools Protocol client.
//!
//! Each [`CdpSession`] owns exactly one WebSocket connection to a single
//! tab's `webSocketDebuggerUrl` (as discovered via shepherd's CDP HTTP
//! endpoints, see [`crate::driver::shepherd`]). This does not attempt to
//! multiplex multiple targets behind one browser-level connection the way
//! a full CDP client library would: the specification's tabs connect
//! directly to their own debugger endpoint, so a session here is scoped to
//! exactly one of those.

pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::{AutomationError, Result};
use wire::{Command, Event, Inbound, Response};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// A live CDP WebSocket session bound to one tab.
///
/// Cloning shares the same underlying connection; cheap to hand out to
/// collaborating components (the tab itself, its behavior runner, its
/// network-idle monitor).
#[derive(Clone)]
pub struct CdpSession {
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
    write_tx: mpsc::UnboundedSender<Message>,
    events_tx: broadcast::Sender<Event>,
    enabled_domains: Arc<Mutex<std::collections::HashSet<String>>>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<tokio::sync::Notify>,
}

impl CdpSession {
    /// Connects to `ws_url` (a tab's `webSocketDebuggerUrl`) and spawns the
    /// background read/write tasks that service it.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(ws_url).await?;
        let (mut write, mut read) = stream.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, _events_rx) = broadcast::channel(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(tokio::sync::Notify::new());

        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let read_pending = pending.clone();
        let read_events_tx = events_tx.clone();
        let read_closed = closed.clone();
        let read_close_notify = close_notify.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("CDP websocket read error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<Inbound>(&text) {
                    Ok(Inbound::Response(response)) => {
                        let mut guard = read_pending.lock().await;
                        if let Some(tx) = guard.remove(&response.id) {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(Inbound::Event(event)) => {
                        let _ = read_events_tx.send(event);
                    }
                    Err(e) => debug!("unparseable CDP frame: {} ({:?})", e, text),
                }
            }
            read_closed.store(true, Ordering::SeqCst);
            read_close_notify.notify_waiters();
        });

        Ok(Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            write_tx,
            events_tx,
            enabled_domains: Arc::new(Mutex::new(std::collections::HashSet::new())),
            closed,
            close_notify,
        })
    }

    /// Sends a CDP command and awaits its correlated response, returning
    /// the `result` payload or a [`AutomationError::Cdp`] if the remote end
    /// reported a protocol error.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let command = Command {
            id,
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_string(&command)?;
        self.write_tx
            .send(Message::Text(payload))
            .map_err(|_| AutomationError::Other("CDP connection closed".to_string()))?;

        let response = rx
            .await
            .map_err(|_| AutomationError::Other("CDP connection closed before response".to_string()))?;

        if let Some(error) = response.error {
            return Err(AutomationError::Cdp {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Enables `domain` (e.g. `"Page"`, `"Network"`, `"Runtime"`) exactly
    /// once per session, skipping the round-trip on repeat calls.
    pub async fn ensure_domain(&self, domain: &str) -> Result<()> {
        let mut enabled = self.enabled_domains.lock().await;
        if enabled.contains(domain) {
            return Ok(());
        }
        self.send(&format!("{}.enable", domain), None).await?;
        enabled.insert(domain.to_string());
        Ok(())
    }

    /// Subscribes to all inbound CDP events on this session.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Whether the underlying WebSocket has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves when the underlying WebSocket closes, for any reason.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}
