//! Tab state machine and the capability surface shared by every tab
//! variant.

pub mod base;
pub mod behavior_tab;
pub mod crawler_tab;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::{AutomationConfig, TabType};
use crate::redis_conn::RedisConn;
use crate::types::TabClosedInfo;
use crate::Result;

use base::BaseTab;
use behavior_tab::BehaviorTab;
use crawler_tab::CrawlerTab;

/// A tab's position in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    /// Constructed but not yet connected.
    New,
    /// WebSocket handshake to `webSocketDebuggerUrl` in progress.
    Connecting,
    /// Connected; domains enabled; able to navigate and evaluate.
    Running,
    /// Connection dropped for a devtools takeover; retrying `init()`.
    Reconnecting,
    /// `Inspector.targetCrashed` fired; terminal.
    Crashed,
    /// Draining behaviors/crawl loop before closing.
    Closing,
    /// Terminal; `Closed` has been emitted exactly once.
    Closed,
}

/// Raw tab descriptor as returned by CDP HTTP discovery (`GET /json`).
#[derive(Debug, Clone)]
pub struct TabData {
    /// CDP target id.
    pub id: String,
    /// Direct WebSocket URL for this tab's own debugger session.
    pub ws_url: String,
}

/// Capability set shared by every tab variant: own a CDP session; expose
/// navigation, evaluation, shutdown; host behaviors or a crawl loop.
#[async_trait]
pub trait Tab: Send + Sync {
    /// This tab's id.
    fn id(&self) -> &str;

    /// Current lifecycle state.
    async fn state(&self) -> TabState;

    /// Connects the CDP session and enables the domains this tab needs.
    async fn init(&self) -> Result<()>;

    /// Navigates to `url`; returns `true` if an error occurred (navigation
    /// errors are logged and swallowed rather than propagated, per spec).
    async fn goto(&self, url: &str) -> Result<bool>;

    /// Evaluates `js` in the page's main execution context.
    async fn evaluate_in_page(&self, js: &str) -> Result<Value>;

    /// Awaits the tab's network-idle signal.
    async fn wait_for_net_idle(&self, global_wait_secs: u64) -> Result<()>;

    /// Captures (and, if configured, uploads) a screenshot of the page.
    async fn capture_screenshot(&self) -> Result<()>;

    /// Pauses any running behavior.
    async fn pause_behaviors(&self) -> Result<()>;

    /// Resumes (or restarts) behaviors.
    async fn resume_behaviors(&self) -> Result<()>;

    /// Harvests outlinks discovered by the page/behavior since the last
    /// call, clearing the page-side outlink set.
    async fn collect_outlinks(&self) -> Result<Vec<String>>;

    /// Cooperative shutdown: drains in-flight work, then `close`s.
    async fn shutdown_gracefully(&self) -> Result<()>;

    /// Forceful shutdown: disposes the CDP client, emits Closed.
    async fn close(&self) -> Result<()>;

    /// Registers a listener invoked exactly once when this tab closes.
    fn on_closed(&self, listener: tokio::sync::mpsc::UnboundedSender<TabClosedInfo>);
}

/// Constructs the concrete tab implementation named by `tab_type`,
/// mirroring the original `TAB_CLASSES` factory map.
pub fn create_tab<C>(
    tab_type: TabType,
    data: TabData,
    config: Arc<AutomationConfig>,
    http: Client,
    redis: C,
) -> Arc<dyn Tab>
where
    C: RedisConn + Clone + 'static,
{
    let base = Arc::new(BaseTab::new(data, config.clone(), http.clone()));
    match tab_type {
        TabType::BehaviorTab => {
            debug!("constructing BehaviorTab for {}", base.id());
            Arc::new(BehaviorTab::new(base, config, http))
        }
        TabType::CrawlerTab => {
            debug!("constructing CrawlerTab for {}", base.id());
            Arc::new(CrawlerTab::new(base, config, http, redis))
        }
    }
}
