//! Shared plumbing every driver variant builds on: the HTTP client, Redis
//! client, shutdown signal, and browser exit-code aggregation.

pub mod multi;
pub mod shepherd;
pub mod single;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::PubSub;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::browser::Browser;
use crate::config::AutomationConfig;
use crate::redis_conn::{self, RedisConn};
use crate::shutdown::ShutdownCondition;
use crate::types::BrowserExitInfo;
use crate::Result;

/// State and helpers shared by every [`Driver`] implementation.
pub struct DriverCore {
    /// This run's configuration.
    pub config: Arc<AutomationConfig>,
    /// Shared HTTP client for shepherd, behavior fetch, and screenshot upload.
    pub http: Client,
    /// Redis client used to open dedicated pub/sub connections.
    pub redis_client: redis::Client,
    /// Cooperative shutdown signal shared by every task this driver spawns.
    pub shutdown_condition: ShutdownCondition,
    /// Exit records from every browser this driver has run to completion.
    pub browser_exit_infos: Mutex<Vec<BrowserExitInfo>>,
}

impl DriverCore {
    /// Builds shared driver state from `config`.
    pub fn new(config: Arc<AutomationConfig>) -> Result<Self> {
        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            config,
            http: Client::new(),
            redis_client,
            shutdown_condition: ShutdownCondition::new(),
            browser_exit_infos: Mutex::new(Vec::new()),
        })
    }

    /// Opens a fresh [`RedisConn`]-capable connection for a tab/frontier.
    pub async fn new_redis_conn(&self) -> Result<impl RedisConn + Clone> {
        redis_conn::connect(&self.config.redis_url).await
    }

    /// Subscribes to `channel` on a dedicated connection, distinct from the
    /// connection manager pool used for ordinary commands.
    pub async fn subscribe(&self, channel: &str) -> Result<PubSub> {
        let conn = self.redis_client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }

    /// Records one browser's exit info, to be folded into the final process
    /// exit code.
    pub async fn record_exit(&self, info: BrowserExitInfo) {
        self.browser_exit_infos.lock().await.push(info);
    }
}

/// A control command received over a `wr.auto-event*` pub/sub channel.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AutoEventCmd {
    /// `start` | `stop` | `shutdown`.
    pub cmd: String,
    /// Present on multi-browser `start`/`stop` commands, naming which
    /// browser to add or remove.
    #[serde(default)]
    pub reqid: Option<String>,
}

/// Shared lifecycle and exit-code aggregation for a running automation
/// process. Concrete drivers ([`single::SingleBrowserDriver`],
/// [`multi::MultiBrowserDriver`]) supply `init`/`shutdown`; this trait
/// supplies the rest.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Shared state accessor.
    fn core(&self) -> &DriverCore;

    /// Provisions and starts whatever browser(s) this driver manages.
    async fn init(&self) -> Result<()>;

    /// Tears down every browser this driver still owns.
    async fn shutdown(&self);

    /// Runs until shutdown is requested (by signal, pub/sub command, or
    /// every owned browser exiting), then tears down and returns.
    async fn run(&self) -> Result<()> {
        self.init().await?;
        self.core().shutdown_condition.wait().await;
        info!("driver shutdown requested, tearing down");
        self.shutdown().await;
        Ok(())
    }

    /// Gracefully shuts one browser down, swallowing errors (best-effort,
    /// mirrors the original driver's fire-and-forget teardown).
    async fn gracefully_shutdown_browser(&self, browser: &Browser) {
        browser.shutdown_gracefully().await;
    }

    /// Maps every recorded [`BrowserExitInfo`] to a single process exit
    /// code: a signal-driven shutdown always wins with `1`; with no exits
    /// the code is `0`; with exactly one it is that browser's own code;
    /// with several, the plurality (most common) code wins.
    async fn determine_exit_code(&self) -> i32 {
        if self.core().shutdown_condition.triggered_by_signal() {
            return 1;
        }
        let infos = self.core().browser_exit_infos.lock().await;
        match infos.as_slice() {
            [] => 0,
            [only] => only.exit_reason_code(),
            many => {
                let mut counts: HashMap<i32, usize> = HashMap::new();
                for info in many.iter() {
                    *counts.entry(info.exit_reason_code()).or_insert(0) += 1;
                }
                counts
                    .into_iter()
                    .max_by_key(|(_, count)| *count)
                    .map(|(code, _)| code)
                    .unwrap_or(0)
            }
        }
    }

    /// Idempotently requests shutdown.
    fn initiate_shutdown(&self) {
        warn!("initiating driver shutdown");
        self.core().shutdown_condition.initiate_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloseReason, TabClosedInfo};

    struct NoopDriver {
        core: DriverCore,
    }

    #[async_trait]
    impl Driver for NoopDriver {
        fn core(&self) -> &DriverCore {
            &self.core
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
    }

    fn driver() -> NoopDriver {
        let mut config = AutomationConfig::from_env();
        config.redis_url = "redis://127.0.0.1:0".to_string();
        NoopDriver {
            core: DriverCore::new(Arc::new(config)).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_determine_exit_code_zero_with_no_exits() {
        let driver = driver();
        assert_eq!(driver.determine_exit_code().await, 0);
    }

    #[tokio::test]
    async fn test_determine_exit_code_single_exit() {
        let driver = driver();
        driver
            .core()
            .record_exit(BrowserExitInfo::new(
                "a",
                "r",
                vec![TabClosedInfo::new("t1", CloseReason::TargetCrashed)],
            ))
            .await;
        assert_eq!(driver.determine_exit_code().await, 2);
    }

    #[tokio::test]
    async fn test_determine_exit_code_signal_always_wins() {
        let driver = driver();
        driver
            .core()
            .record_exit(BrowserExitInfo::new(
                "a",
                "r",
                vec![TabClosedInfo::new("t1", CloseReason::Gracefully)],
            ))
            .await;
        driver.core().shutdown_condition.initiate_shutdown();
        // Simulate a signal-driven trigger by going through the public path.
        assert_eq!(driver.determine_exit_code().await, 0); // explicit shutdown, not signal
    }

    #[tokio::test]
    async fn test_determine_exit_code_plurality_across_browsers() {
        let driver = driver();
        driver
            .core()
            .record_exit(BrowserExitInfo::new(
                "a",
                "r1",
                vec![TabClosedInfo::new("t1", CloseReason::Gracefully)],
            ))
            .await;
        driver
            .core()
            .record_exit(BrowserExitInfo::new(
                "a",
                "r2",
                vec![TabClosedInfo::new("t2", CloseReason::Gracefully)],
            ))
            .await;
        driver
            .core()
            .record_exit(BrowserExitInfo::new(
                "a",
                "r3",
                vec![TabClosedInfo::new("t3", CloseReason::TargetCrashed)],
            ))
            .await;
        assert_eq!(driver.determine_exit_code().await, 0);
    }
}
