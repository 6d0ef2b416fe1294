//! `CrawlerTab`: drives a single tab through a Redis-backed frontier,
//! running a behavior on each page and folding the outlinks it finds back
//! into the frontier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::behavior::manager::{BehaviorManager, RemoteBehaviorManager};
use crate::behavior::Behavior;
use crate::config::AutomationConfig;
use crate::frontier::Frontier;
use crate::redis_conn::RedisConn;
use crate::types::{CloseReason, TabClosedInfo};
use crate::Result;

use super::base::BaseTab;
use super::{Tab, TabState};

/// JS injected once per navigation to neutralize page-side unload hooks
/// that would otherwise block or delay navigation away from the page.
const NICE_JS: &str = r#"
window.onbeforeunload = null;
window.addEventListener('beforeunload', function (e) { e.stopImmediatePropagation(); }, true);
window.addEventListener('unload', function (e) { e.stopImmediatePropagation(); }, true);
"#;

/// How often the crawl loop re-polls an empty frontier when waiting for it
/// to be populated by another tab.
const WAIT_FOR_Q_INTERVAL: Duration = Duration::from_millis(500);

/// A tab that repeatedly pulls a URL from the shared frontier, navigates to
/// it, runs that page's behavior, and harvests outlinks back into the
/// frontier, until the frontier is exhausted or shutdown is requested.
pub struct CrawlerTab<C: RedisConn + Clone + 'static> {
    base: Arc<BaseTab>,
    config: Arc<AutomationConfig>,
    behavior_manager: Arc<RemoteBehaviorManager>,
    frontier: Arc<Mutex<Option<Frontier<C>>>>,
    redis: C,
    crawl_task: Mutex<Option<JoinHandle<()>>>,
    graceful_shutdown: Arc<AtomicBool>,
}

impl<C: RedisConn + Clone + 'static> CrawlerTab<C> {
    /// Constructs a `CrawlerTab` wrapping `base`, driven against `redis`.
    pub fn new(base: Arc<BaseTab>, config: Arc<AutomationConfig>, http: Client, redis: C) -> Self {
        let behavior_manager = Arc::new(RemoteBehaviorManager::new(
            http,
            config.behavior_endpoint.clone(),
            config.behavior_info_endpoint.clone(),
        ));
        Self {
            base,
            config,
            behavior_manager,
            frontier: Arc::new(Mutex::new(None)),
            redis,
            crawl_task: Mutex::new(None),
            graceful_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn inject_nice_js(&self) {
        if let Err(e) = self.base.evaluate_in_page(NICE_JS).await {
            debug!("CrawlerTab: nice.js injection failed: {}", e);
        }
    }

    /// Wires the tab's mid-behavior-run outlink harvest (see
    /// [`crate::behavior::BehaviorHost::harvest_outlinks`]) into this
    /// tab's frontier, so long-running behaviors don't lose outlinks found
    /// before the behavior itself finishes.
    fn spawn_outlink_sink(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let base = self.base.clone();
        let frontier = self.frontier.clone();
        tokio::spawn(async move {
            base.set_outlink_sink(tx).await;
        });
        tokio::spawn(async move {
            while let Some(links) = rx.recv().await {
                let mut guard = frontier.lock().await;
                if let Some(f) = guard.as_mut() {
                    if let Err(e) = f.add_all(links).await {
                        warn!("CrawlerTab: failed to enqueue mid-run outlinks: {}", e);
                    }
                }
            }
        });
    }

    fn spawn_crawl_loop(&self) {
        let base = self.base.clone();
        let config = self.config.clone();
        let behavior_manager = self.behavior_manager.clone();
        let frontier = self.frontier.clone();
        let graceful_shutdown = self.graceful_shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                if graceful_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let next = {
                    let mut guard = frontier.lock().await;
                    match guard.as_mut() {
                        Some(f) => f.next_url().await,
                        None => break,
                    }
                };
                let url = match next {
                    Ok(Some(url)) => url,
                    Ok(None) => {
                        if config.wait_for_q {
                            let mut guard = frontier.lock().await;
                            if let Some(f) = guard.as_mut() {
                                if f.wait_for_populated_q(WAIT_FOR_Q_INTERVAL).await.is_err() {
                                    break;
                                }
                            }
                            continue;
                        }
                        debug!("CrawlerTab: frontier exhausted, ending crawl");
                        break;
                    }
                    Err(e) => {
                        warn!("CrawlerTab: frontier error, ending crawl: {}", e);
                        break;
                    }
                };

                if let Err(e) = base.goto(&url).await {
                    warn!("CrawlerTab: navigation error for {}: {}", url, e);
                }

                if graceful_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                // Behaviors are resolved against the post-redirect URL, not
                // the URL that was requested.
                let behavior_url = base.page_url().await.unwrap_or(url.clone());
                let behavior = match behavior_manager
                    .behavior_for_url(&behavior_url, base.clone())
                    .await
                {
                    Ok(behavior) => Some(behavior),
                    Err(e) => {
                        warn!(
                            "CrawlerTab: failed to resolve behavior for {}: {}",
                            behavior_url, e
                        );
                        None
                    }
                };

                if let Some(behavior) = behavior {
                    let max_seconds = if config.behavior_time_unbounded() {
                        -1
                    } else {
                        config.max_behavior_time
                    };
                    if let Err(e) = behavior.timed_run(max_seconds).await {
                        warn!("CrawlerTab: behavior run failed for {}: {}", behavior_url, e);
                    }
                }

                match base.collect_outlinks().await {
                    Ok(outlinks) => {
                        let mut guard = frontier.lock().await;
                        if let Some(f) = guard.as_mut() {
                            if let Err(e) = f.add_all(outlinks).await {
                                warn!("CrawlerTab: failed to enqueue outlinks: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("CrawlerTab: failed to collect outlinks: {}", e),
                }

                debug!("CrawlerTab: finished processing {}", url);

                if graceful_shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }

            // A graceful shutdown drives its own Closed event via
            // `shutdown_gracefully`/`close`; a natural end (frontier
            // exhausted) emits `crawl-done` here instead, per spec §4.6.
            if !graceful_shutdown.load(Ordering::SeqCst) {
                info!("CrawlerTab: crawl-done, frontier exhausted");
                base.dispose().await;
                base.emit_closed(CloseReason::CrawlEnd).await;
            }
        });

        // Best-effort stash; `shutdown_gracefully` awaits this same slot.
        if let Ok(mut guard) = self.crawl_task.try_lock() {
            *guard = Some(handle);
        }
    }
}

#[async_trait]
impl<C: RedisConn + Clone + 'static> Tab for CrawlerTab<C> {
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
        self.inject_nice_js().await;

        let frontier = Frontier::init(self.redis.clone(), self.config.redis_keys()).await?;
        if self.config.wait_for_q {
            let mut f = frontier;
            f.wait_for_populated_q(WAIT_FOR_Q_INTERVAL).await?;
            *self.frontier.lock().await = Some(f);
        } else {
            *self.frontier.lock().await = Some(frontier);
        }

        self.spawn_outlink_sink();
        self.spawn_crawl_loop();
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
        self.base.set_page_paused(true).await
    }

    async fn resume_behaviors(&self) -> Result<()> {
        self.base.set_page_paused(false).await
    }

    async fn collect_outlinks(&self) -> Result<Vec<String>> {
        self.base.collect_outlinks().await
    }

    async fn shutdown_gracefully(&self) -> Result<()> {
        self.graceful_shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.crawl_task.lock().await.take() {
            let _ = task.await;
        }
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.graceful_shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.crawl_task.lock().await.take() {
            if !task.is_finished() {
                task.abort();
                let _ = task.await;
            }
        }
        self.base.dispose().await;
        self.base.emit_closed(CloseReason::Closed).await;
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
    use crate::redis_conn::fake::FakeRedis;
    use crate::tab::TabData;

    fn test_tab() -> CrawlerTab<FakeRedis> {
        let config = Arc::new(AutomationConfig::from_env());
        let base = Arc::new(BaseTab::new(
            TabData {
                id: "t1".to_string(),
                ws_url: "ws://localhost:9222/devtools/page/t1".to_string(),
            },
            config.clone(),
            Client::new(),
        ));
        CrawlerTab::new(base, config, Client::new(), FakeRedis::new())
    }

    #[tokio::test]
    async fn test_new_tab_has_no_frontier_until_init() {
        let tab = test_tab();
        assert!(tab.frontier.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_close_sets_graceful_shutdown_flag() {
        let tab = test_tab();
        tab.close().await.unwrap();
        assert!(tab.graceful_shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_gracefully_is_idempotent_with_no_crawl_task() {
        let tab = test_tab();
        tab.shutdown_gracefully().await.unwrap();
        assert!(tab.crawl_task.lock().await.is_none());
    }
}
