//! `BaseTab`: the CDP session lifecycle shared by every tab variant —
//! connect, reconnect on devtools takeover, evaluate, navigate, close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::behavior::BehaviorHost;
use crate::cdp::CdpSession;
use crate::config::AutomationConfig;
use crate::netidle::NetworkIdleMonitor;
use crate::types::{CloseReason, TabClosedInfo};
use crate::{AutomationError, Result};

use super::{TabData, TabState};

/// Interval between reconnect attempts after a devtools-takeover detach.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Shared CDP lifecycle plumbing. Not itself registered under
/// [`super::create_tab`]'s `TAB_CLASSES`-equivalent dispatch — `BehaviorTab`
/// and `CrawlerTab` both wrap one behind an `Arc`, which lets the
/// background event-reader task hold a second, ordinary `Arc` clone rather
/// than needing any unsafe back-reference trick.
pub struct BaseTab {
    data: TabData,
    config: Arc<AutomationConfig>,
    http: Client,
    session: Mutex<Option<CdpSession>>,
    state: Mutex<TabState>,
    net_idle: NetworkIdleMonitor,
    close_listeners: Mutex<Vec<mpsc::UnboundedSender<TabClosedInfo>>>,
    closed_once: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    /// Destination for outlinks harvested mid-behavior-run (see
    /// [`BehaviorHost::harvest_outlinks`]); unset for tab variants that have
    /// nowhere to put them (`BehaviorTab`).
    outlink_sink: Mutex<Option<mpsc::UnboundedSender<Vec<String>>>>,
}

impl BaseTab {
    /// Constructs a not-yet-connected tab.
    pub fn new(data: TabData, config: Arc<AutomationConfig>, http: Client) -> Self {
        Self {
            data,
            config,
            http,
            session: Mutex::new(None),
            state: Mutex::new(TabState::New),
            net_idle: NetworkIdleMonitor::with_defaults(),
            close_listeners: Mutex::new(Vec::new()),
            closed_once: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            event_task: Mutex::new(None),
            outlink_sink: Mutex::new(None),
        }
    }

    /// Registers where mid-behavior-run outlink harvests should be sent.
    pub async fn set_outlink_sink(&self, tx: mpsc::UnboundedSender<Vec<String>>) {
        *self.outlink_sink.lock().await = Some(tx);
    }

    /// This tab's id.
    pub fn id(&self) -> &str {
        &self.data.id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TabState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: TabState) {
        *self.state.lock().await = state;
    }

    /// Opens the WebSocket session, subscribes to the events this tab
    /// cares about, and enables Page/Network/Runtime. Entry point for both
    /// the initial connect and every reconnect attempt.
    ///
    /// Takes `self: &Arc<Self>` so the background event-reader task can
    /// hold its own strong reference back to this tab.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.set_state(TabState::Connecting).await;

        let session = CdpSession::connect(&self.data.ws_url).await?;
        self.spawn_event_loop(session.clone());

        session.ensure_domain("Page").await?;
        session.ensure_domain("Network").await?;
        session.ensure_domain("Runtime").await?;

        if self.config.net_cache_disabled {
            session
                .send("Network.setCacheDisabled", Some(json!({"cacheDisabled": true})))
                .await?;
        }

        *self.session.lock().await = Some(session);
        self.set_state(TabState::Running).await;
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Spawns the background task that reads CDP events/connection-close
    /// off `session` and reacts on this tab's behalf. Replaces any
    /// previous event task (from a prior reconnect).
    fn spawn_event_loop(self: &Arc<Self>, session: CdpSession) {
        let tab = self.clone();
        let handle = tokio::spawn(async move {
            let mut events = session.subscribe();
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) => tab.handle_event(&event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = session.closed() => {
                        tab.on_connection_closed().await;
                        break;
                    }
                }
            }
        });
        // Dropping the previous handle (if any) does not abort it; callers
        // that reconnect are expected to have already torn down the prior
        // session via `dispose`/`stop_reconnecting`.
        if let Ok(mut guard) = self.event_task.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn handle_event(self: &Arc<Self>, event: &crate::cdp::wire::Event) {
        match event.method.as_str() {
            "Inspector.detached" => {
                let reason = event
                    .params
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if reason == "replaced_with_devtools" {
                    self.begin_reconnect_loop().await;
                }
            }
            "Inspector.targetCrashed" => {
                self.emit_closed(CloseReason::TargetCrashed).await;
            }
            "Network.requestWillBeSent" => {
                if let Some(id) = event.params.get("requestId").and_then(|v| v.as_str()) {
                    self.net_idle.req_started(id).await;
                }
            }
            "Network.loadingFinished" | "Network.loadingFailed" => {
                if let Some(id) = event.params.get("requestId").and_then(|v| v.as_str()) {
                    self.net_idle.req_finished(id).await;
                }
            }
            _ => {}
        }
    }

    /// Enters `Reconnecting`: spawns a task that retries `init()` every
    /// [`RECONNECT_INTERVAL`] until it succeeds, then clears the flag.
    /// A no-op if a reconnect is already in progress.
    async fn begin_reconnect_loop(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("tab {} entering Reconnecting after devtools takeover", self.id());
        let tab = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match tab.init().await {
                    Ok(()) => {
                        info!("tab {} reconnected", tab.id());
                        tab.finish_reconnect();
                        break;
                    }
                    Err(e) => {
                        warn!("tab {} reconnect attempt failed: {}", tab.id(), e);
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                    }
                }
            }
        });
        *self.reconnect_task.lock().await = Some(handle);
    }

    /// Whether a devtools-takeover reconnect is in progress.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Clears the reconnecting flag once `init()` has succeeded again.
    pub fn finish_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Cancels an in-progress reconnect loop.
    pub async fn stop_reconnecting(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
    }

    async fn on_connection_closed(self: &Arc<Self>) {
        if self.is_reconnecting() {
            return;
        }
        self.emit_closed(CloseReason::ConnectionClosed).await;
    }

    /// Navigates to `url`. Navigation errors are swallowed and reported as
    /// `Ok(true)` rather than propagated, per spec §4.6.
    pub async fn goto(&self, url: &str) -> Result<bool> {
        let session = self.session().await?;
        let nav = session.send("Page.navigate", Some(json!({"url": url})));
        match timeout(Duration::from_secs(self.config.navigation_timeout), nav).await {
            Ok(Ok(_)) => Ok(false),
            Ok(Err(e)) => {
                warn!("navigation to {} failed: {}", url, e);
                Ok(true)
            }
            Err(_) => {
                warn!("navigation to {} timed out", url);
                Ok(true)
            }
        }
    }

    /// Evaluates `js` in the page's main execution context.
    pub async fn evaluate_in_page(&self, js: &str) -> Result<Value> {
        let session = self.session().await?;
        let result = session
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": js,
                    "userGesture": true,
                    "awaitPromise": true,
                    "returnByValue": true,
                })),
            )
            .await?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Evaluates `js` in a specific frame's isolated world, with CLI API
    /// access (matching `evaluate_expression(withCliAPI=True)` upstream).
    pub async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<Value> {
        let session = self.session().await?;
        let result = session
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": js,
                    "userGesture": true,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "includeCommandLineAPI": true,
                    "contextId": frame_id,
                })),
            )
            .await?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Awaits this tab's network-idle signal.
    pub async fn wait_for_net_idle(&self, _global_wait_secs: u64) -> Result<()> {
        self.net_idle.wait_for_idle().await;
        Ok(())
    }

    /// Captures (and, if configured, uploads) a screenshot.
    pub async fn capture_screenshot(&self) -> Result<()> {
        let session = self.session().await?;
        crate::screenshot::capture_and_upload(&session, &self.config, &self.http).await
    }

    /// Harvests outlinks: primary path reads `window.$wbOutlinks$` on the
    /// main frame, falling back to a tab-level evaluate on any exception;
    /// clears the page-side set afterward, swallowing secondary errors.
    pub async fn collect_outlinks(&self) -> Result<Vec<String>> {
        let links = match self.evaluate_in_page("window.$wbOutlinks$").await {
            Ok(value) => value,
            Err(e) => {
                warn!("outlink collection failed, falling back: {}", e);
                self.evaluate_in_page("window.$wbOutlinks$ || []").await?
            }
        };
        if let Err(e) = self.evaluate_in_page("window.$wbOutlinkSet$.clear()").await {
            debug!("clearing outlink set failed (ignored): {}", e);
        }
        Ok(links
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// DOM-walking fallback outlink harvester, for behaviors that never
    /// populate `window.$wbOutlinks$`. Walks the flattened document and
    /// reads `href` off every anchor/area node.
    pub async fn collect_outlinks_manual(&self) -> Result<Vec<String>> {
        let session = self.session().await?;
        session.ensure_domain("DOM").await?;
        let document = session
            .send("DOM.getFlattenedDocument", Some(json!({"depth": -1, "pierce": true})))
            .await?;
        let mut hrefs = Vec::new();
        if let Some(nodes) = document.get("nodes").and_then(|v| v.as_array()) {
            for node in nodes {
                let local_name = node.get("localName").and_then(|v| v.as_str()).unwrap_or("");
                if local_name != "a" && local_name != "area" {
                    continue;
                }
                let node_id = match node.get("nodeId") {
                    Some(v) => v.clone(),
                    None => continue,
                };
                let resolved = session
                    .send("DOM.resolveNode", Some(json!({"nodeId": node_id})))
                    .await?;
                let object_id = resolved
                    .get("object")
                    .and_then(|o| o.get("objectId"))
                    .cloned();
                let object_id = match object_id {
                    Some(v) => v,
                    None => continue,
                };
                let result = session
                    .send(
                        "Runtime.callFunctionOn",
                        Some(json!({
                            "functionDeclaration": "function () { return this.href; }",
                            "objectId": object_id,
                        })),
                    )
                    .await?;
                if let Some(href) = result
                    .get("result")
                    .and_then(|r| r.get("value"))
                    .and_then(|v| v.as_str())
                {
                    hrefs.push(href.to_string());
                }
                let _ = session
                    .send("Runtime.releaseObject", Some(json!({"objectId": object_id})))
                    .await;
            }
        }
        Ok(hrefs)
    }

    /// Sets the in-page pause flag.
    pub async fn set_page_paused(&self, paused: bool) -> Result<()> {
        self.evaluate_in_page(&format!("window.$WBBehaviorPaused = {};", paused))
            .await?;
        Ok(())
    }

    /// Current page URL, per `window.location.href`.
    pub async fn page_url(&self) -> Result<String> {
        let value = self.evaluate_in_page("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn session(&self) -> Result<CdpSession> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| AutomationError::Other("tab has no active CDP session".to_string()))
    }

    /// Registers a listener invoked exactly once when this tab closes.
    pub async fn on_closed(&self, listener: mpsc::UnboundedSender<TabClosedInfo>) {
        self.close_listeners.lock().await.push(listener);
    }

    /// Emits `Closed(reason)` to every registered listener, exactly once.
    pub async fn emit_closed(&self, reason: CloseReason) {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(TabState::Closed).await;
        let info = TabClosedInfo::new(self.data.id.clone(), reason);
        for listener in self.close_listeners.lock().await.iter() {
            let _ = listener.send(info.clone());
        }
    }

    /// Disposes the CDP client and any background tasks.
    pub async fn dispose(&self) {
        self.stop_reconnecting().await;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.session.lock().await.take();
    }
}

#[async_trait]
impl BehaviorHost for BaseTab {
    async fn evaluate_in_page(&self, expr: &str) -> Result<Value> {
        BaseTab::evaluate_in_page(self, expr).await
    }

    async fn evaluate_in_frame(&self, frame_id: &str, expr: &str) -> Result<Value> {
        BaseTab::evaluate_in_frame(self, frame_id, expr).await
    }

    async fn wait_for_net_idle(&self, global_wait_secs: u64) -> Result<()> {
        BaseTab::wait_for_net_idle(self, global_wait_secs).await
    }

    async fn harvest_outlinks(&self) -> Result<()> {
        let tx = self.outlink_sink.lock().await.clone();
        let tx = match tx {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let links = BaseTab::collect_outlinks(self).await?;
        if !links.is_empty() {
            let _ = tx.send(links);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<AutomationConfig> {
        Arc::new(AutomationConfig::from_env())
    }

    fn new_tab() -> Arc<BaseTab> {
        Arc::new(BaseTab::new(
            TabData {
                id: "t1".to_string(),
                ws_url: "ws://localhost:9222/devtools/page/t1".to_string(),
            },
            test_config(),
            Client::new(),
        ))
    }

    #[tokio::test]
    async fn test_new_tab_starts_in_new_state() {
        let tab = new_tab();
        assert_eq!(tab.state().await, TabState::New);
    }

    #[tokio::test]
    async fn test_emit_closed_is_idempotent() {
        let tab = new_tab();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tab.on_closed(tx).await;

        tab.emit_closed(CloseReason::Gracefully).await;
        tab.emit_closed(CloseReason::TargetCrashed).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.reason, CloseReason::Gracefully);
        assert!(rx.try_recv().is_err());
        assert_eq!(tab.state().await, TabState::Closed);
    }

    #[tokio::test]
    async fn test_finish_reconnect_clears_flag() {
        let tab = new_tab();
        assert!(!tab.is_reconnecting());
        tab.reconnecting.store(true, Ordering::SeqCst);
        assert!(tab.is_reconnecting());
        tab.finish_reconnect();
        assert!(!tab.is_reconnecting());
    }

    #[tokio::test]
    async fn test_session_missing_returns_error() {
        let tab = new_tab();
        let result = tab.session().await;
        assert!(result.is_err());
    }
}
