//! A `Browser` owns every tab opened against one Chrome instance and
//! aggregates their close reasons into a single exit record.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::AutomationConfig;
use crate::redis_conn::RedisConn;
use crate::tab::{create_tab, Tab, TabData};
use crate::types::{BrowserExitInfo, CloseReason, TabClosedInfo};
use crate::Result;

/// Owns the tabs opened against a single Chrome instance and the aggregate
/// exit record they produce once all of them have closed.
///
/// `Browser::init` dispatches every [`TabData`] through [`create_tab`] and
/// registers a shared closed-tab listener; the browser's own `Exiting`
/// signal fires exactly once, when the last tab closes.
pub struct Browser {
    autoid: String,
    reqid: String,
    tabs: Mutex<HashMap<String, Arc<dyn Tab>>>,
    tab_closed_reasons: Mutex<Vec<TabClosedInfo>>,
    closed_rx: Mutex<mpsc::UnboundedReceiver<TabClosedInfo>>,
    closed_tx: mpsc::UnboundedSender<TabClosedInfo>,
    exit_tx: Mutex<Option<mpsc::UnboundedSender<BrowserExitInfo>>>,
    running: Mutex<bool>,
}

impl Browser {
    /// Constructs an empty browser for `autoid`/`reqid`; no tabs exist
    /// until [`Browser::init`] is called.
    pub fn new(autoid: impl Into<String>, reqid: impl Into<String>) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            autoid: autoid.into(),
            reqid: reqid.into(),
            tabs: Mutex::new(HashMap::new()),
            tab_closed_reasons: Mutex::new(Vec::new()),
            closed_rx: Mutex::new(closed_rx),
            closed_tx,
            exit_tx: Mutex::new(None),
            running: Mutex::new(false),
        }
    }

    /// A channel this browser will send exactly one [`BrowserExitInfo`] to,
    /// once every tab it owns has closed.
    pub async fn subscribe_exit(&self) -> mpsc::UnboundedReceiver<BrowserExitInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.exit_tx.lock().await = Some(tx);
        rx
    }

    /// Opens and initializes one tab of `config.tab_type` per entry in
    /// `tab_datas`.
    pub async fn init<C>(
        &self,
        tab_datas: Vec<TabData>,
        config: Arc<AutomationConfig>,
        http: Client,
        redis: C,
    ) -> Result<()>
    where
        C: RedisConn + Clone + 'static,
    {
        self.tabs.lock().await.clear();
        self.tab_closed_reasons.lock().await.clear();
        *self.running.lock().await = true;

        let mut tabs = self.tabs.lock().await;
        for data in tab_datas {
            let id = data.id.clone();
            let tab = create_tab(
                config.tab_type,
                data,
                config.clone(),
                http.clone(),
                redis.clone(),
            );
            tab.on_closed(self.closed_tx.clone());
            tab.init().await?;
            tabs.insert(id, tab);
        }
        drop(tabs);

        info!("Browser {}/{}: initialized", self.autoid, self.reqid);
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Spawns the listener that folds incoming `TabClosedInfo` events into
    /// this browser's own bookkeeping, auto-closing once the tab map is
    /// empty. Must be called once, after [`Browser::init`].
    pub fn spawn_closed_listener(self: &Arc<Self>) {
        let browser = self.clone();
        tokio::spawn(async move {
            loop {
                let info = {
                    let mut rx = browser.closed_rx.lock().await;
                    rx.recv().await
                };
                let info = match info {
                    Some(info) => info,
                    None => break,
                };
                browser.tab_closed(info).await;
            }
        });
    }

    async fn tab_closed(&self, info: TabClosedInfo) {
        let empty = {
            let mut tabs = self.tabs.lock().await;
            tabs.remove(&info.tab_id);
            tabs.is_empty()
        };
        self.tab_closed_reasons.lock().await.push(info);
        if empty && *self.running.lock().await {
            debug!(
                "Browser {}/{}: last tab closed, exiting",
                self.autoid, self.reqid
            );
            self.emit_exit().await;
        }
    }

    async fn emit_exit(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }
        *running = false;
        drop(running);

        let reasons = self.tab_closed_reasons.lock().await.clone();
        let info = BrowserExitInfo::new(self.autoid.clone(), self.reqid.clone(), reasons);
        if let Some(tx) = self.exit_tx.lock().await.as_ref() {
            let _ = tx.send(info);
        }
    }

    /// Closes every owned tab, gracefully or forcefully, then emits
    /// `Exiting`. A no-op if the browser has already exited.
    pub async fn close(&self, gracefully: bool) {
        if !*self.running.lock().await {
            return;
        }
        self.clear_tabs(gracefully).await;
        self.emit_exit().await;
    }

    /// Gracefully shuts every tab down if the browser is still running;
    /// otherwise a no-op.
    pub async fn shutdown_gracefully(&self) {
        if !*self.running.lock().await {
            return;
        }
        self.close(true).await;
    }

    async fn clear_tabs(&self, close_gracefully: bool) {
        let tabs: Vec<Arc<dyn Tab>> = {
            let mut tabs = self.tabs.lock().await;
            let drained: Vec<_> = tabs.values().cloned().collect();
            tabs.clear();
            drained
        };
        for tab in tabs {
            let tab_id = tab.id().to_string();
            let result = if close_gracefully {
                tab.shutdown_gracefully().await
            } else {
                tab.close().await
            };
            let reason = if result.is_ok() {
                if close_gracefully {
                    CloseReason::Gracefully
                } else {
                    CloseReason::Closed
                }
            } else {
                CloseReason::Closed
            };
            self.tab_closed_reasons
                .lock()
                .await
                .push(TabClosedInfo::new(tab_id, reason));
        }
    }

    /// Number of tabs currently open.
    pub async fn tab_count(&self) -> usize {
        self.tabs.lock().await.len()
    }

    /// Whether this browser is still considered running (has not yet
    /// emitted its exit record).
    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Pauses behaviors on every owned tab, best-effort.
    pub async fn pause_all(&self) {
        let tabs: Vec<Arc<dyn Tab>> = self.tabs.lock().await.values().cloned().collect();
        for tab in tabs {
            if let Err(e) = tab.pause_behaviors().await {
                warn!("Browser: failed to pause tab {}: {}", tab.id(), e);
            }
        }
    }

    /// Resumes behaviors on every owned tab, best-effort.
    pub async fn resume_all(&self) {
        let tabs: Vec<Arc<dyn Tab>> = self.tabs.lock().await.values().cloned().collect();
        for tab in tabs {
            if let Err(e) = tab.resume_behaviors().await {
                warn!("Browser: failed to resume tab {}: {}", tab.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_browser_has_no_tabs() {
        let browser = Browser::new("auto1", "req1");
        assert_eq!(browser.tab_count().await, 0);
        assert!(!browser.is_running().await);
    }

    #[tokio::test]
    async fn test_close_on_never_started_browser_is_noop() {
        let browser = Browser::new("auto1", "req1");
        browser.close(true).await;
        assert_eq!(browser.tab_count().await, 0);
    }

    #[tokio::test]
    async fn test_tab_closed_emits_exit_once_map_empties() {
        let browser = Arc::new(Browser::new("auto1", "req1"));
        *browser.running.lock().await = true;
        let mut exit_rx = browser.subscribe_exit().await;
        browser.spawn_closed_listener();

        browser
            .closed_tx
            .send(TabClosedInfo::new("only-tab", CloseReason::Gracefully))
            .unwrap();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(1), exit_rx.recv())
            .await
            .expect("exit info should arrive")
            .expect("channel should not close first");
        assert_eq!(exit.autoid, "auto1");
        assert_eq!(exit.tab_closed_reasons.len(), 1);
        assert!(!browser.is_running().await);
    }
}
