//! `BehaviorTab`: a tab that runs a single behavior against whatever page
//! it is currently on, restarting the behavior when the page changes or a
//! `resume` command arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::behavior::manager::{BehaviorManager, RemoteBehaviorManager};
use crate::behavior::Behavior;
use crate::config::AutomationConfig;
use crate::types::TabClosedInfo;
use crate::Result;

use super::base::BaseTab;
use super::{Tab, TabData, TabState};

/// Page-side expression checking whether the pause-flag global exists at
/// all, used to decide whether a fresh navigation needs a fresh behavior.
const PAUSE_FLAG_EXISTS_EXPR: &str = "typeof window.$WBBehaviorPaused !== 'undefined'";

/// A tab hosting exactly one behavior at a time, re-targeted at the
/// current page URL whenever the page changes or behaviors resume.
pub struct BehaviorTab {
    base: Arc<BaseTab>,
    behavior_manager: Arc<RemoteBehaviorManager>,
    running_behavior: Mutex<Option<Arc<dyn Behavior>>>,
    behavior_task: Mutex<Option<JoinHandle<()>>>,
    curr_behavior_url: Mutex<Option<String>>,
    host_paused: AtomicBool,
}

impl BehaviorTab {
    /// Constructs a `BehaviorTab` wrapping `base`, resolving behaviors
    /// through the remote behavior service described by `config`.
    pub fn new(base: Arc<BaseTab>, config: Arc<AutomationConfig>, http: Client) -> Self {
        let behavior_manager = Arc::new(RemoteBehaviorManager::new(
            http,
            config.behavior_endpoint.clone(),
            config.behavior_info_endpoint.clone(),
        ));
        Self {
            base,
            behavior_manager,
            running_behavior: Mutex::new(None),
            behavior_task: Mutex::new(None),
            curr_behavior_url: Mutex::new(None),
            host_paused: AtomicBool::new(false),
        }
    }

    async fn ensure_behavior_run_task_end(&self) {
        if let Some(task) = self.behavior_task.lock().await.take() {
            if !task.is_finished() {
                task.abort();
                let _ = task.await;
            }
        }
        if let Some(behavior) = self.running_behavior.lock().await.take() {
            behavior.end().await;
        }
    }

    async fn run_behavior_for_current_url(&self) {
        let url = self
            .curr_behavior_url
            .lock()
            .await
            .clone()
            .unwrap_or_default();
        let behavior = match self
            .behavior_manager
            .behavior_for_url(&url, self.base.clone())
            .await
        {
            Ok(behavior) => Arc::new(behavior) as Arc<dyn Behavior>,
            Err(e) => {
                tracing::error!("BehaviorTab: failed to resolve behavior for {}: {}", url, e);
                return;
            }
        };
        debug!("BehaviorTab: starting behavior for {}", url);
        *self.running_behavior.lock().await = Some(behavior.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = behavior.run().await {
                tracing::error!("BehaviorTab: behavior run aborted: {}", e);
            }
        });
        *self.behavior_task.lock().await = Some(handle);
    }
}

#[async_trait]
impl Tab for BehaviorTab {
    fn id(&self) -> &str {
        self.base.id()
    }

    async fn state(&self) -> TabState {
        self.base.state().await
    }

    async fn init(&self) -> Result<()> {
        if self.base.state().await == TabState::Running {
            return Ok(());
        }
        BaseTab::init(&self.base).await?;
        let url = self.base.page_url().await.unwrap_or_default();
        *self.curr_behavior_url.lock().await = Some(url);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<bool> {
        self.base.goto(url).await
    }

    async fn evaluate_in_page(&self, js: &str) -> Result<Value> {
        self.base.evaluate_in_page(js).await
    }

    async fn wait_for_net_idle(&self, global_wait_secs: u64) -> Result<()> {
        self.base.wait_for_net_idle(global_wait_secs).await
    }

    async fn capture_screenshot(&self) -> Result<()> {
        self.base.capture_screenshot().await
    }

    async fn pause_behaviors(&self) -> Result<()> {
        self.host_paused.store(true, Ordering::SeqCst);
        self.base.set_page_paused(true).await
    }

    /// Per spec §4.6: reads the current page URL; if the URL changed (and
    /// the in-page paused flag does not claim otherwise), the pause flag
    /// global is absent, or no behavior is currently running, cancels any
    /// prior behavior and starts a fresh one for the new URL.
    async fn resume_behaviors(&self) -> Result<()> {
        self.host_paused.store(false, Ordering::SeqCst);
        self.base.set_page_paused(false).await?;

        let url = self.base.page_url().await.unwrap_or_default();
        let pause_flag_exists = self
            .base
            .evaluate_in_page(PAUSE_FLAG_EXISTS_EXPR)
            .await
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let prev_url = self.curr_behavior_url.lock().await.clone();
        let url_changed = prev_url.as_deref() != Some(url.as_str()) && !pause_flag_exists;

        let behavior_not_running = match self.running_behavior.lock().await.as_ref() {
            Some(behavior) => behavior.done(),
            None => true,
        };

        if behavior_not_running || url_changed {
            self.ensure_behavior_run_task_end().await;
            *self.curr_behavior_url.lock().await = Some(url);
            info!("BehaviorTab: restarting behavior after resume");
            self.run_behavior_for_current_url().await;
        }
        Ok(())
    }

    async fn collect_outlinks(&self) -> Result<Vec<String>> {
        self.base.collect_outlinks().await
    }

    async fn shutdown_gracefully(&self) -> Result<()> {
        self.ensure_behavior_run_task_end().await;
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.ensure_behavior_run_task_end().await;
        self.base.dispose().await;
        self.base.emit_closed(crate::types::CloseReason::Closed).await;
        Ok(())
    }

    fn on_closed(&self, listener: mpsc::UnboundedSender<TabClosedInfo>) {
        let base = self.base.clone();
        tokio::spawn(async move {
            base.on_closed(listener).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tab::TabData;

    fn test_tab() -> BehaviorTab {
        let base = Arc::new(BaseTab::new(
            TabData {
                id: "t1".to_string(),
                ws_url: "ws://localhost:9222/devtools/page/t1".to_string(),
            },
            Arc::new(AutomationConfig::from_env()),
            Client::new(),
        ));
        BehaviorTab::new(base, Arc::new(AutomationConfig::from_env()), Client::new())
    }

    #[tokio::test]
    async fn test_new_tab_has_no_running_behavior() {
        let tab = test_tab();
        assert!(tab.running_behavior.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_pause_marks_host_paused() {
        let tab = test_tab();
        // `pause_behaviors` will fail at the in-page evaluate (no live
        // session), but the host-side flag flips regardless.
        let _ = tab.pause_behaviors().await;
        assert!(tab.host_paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ensure_behavior_run_task_end_is_noop_when_idle() {
        let tab = test_tab();
        tab.ensure_behavior_run_task_end().await;
        assert!(tab.behavior_task.lock().await.is_none());
    }
}
