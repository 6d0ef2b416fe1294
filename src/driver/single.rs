//! Drives exactly one browser, reconnecting to (or staging) it as needed
//! and taking pause/resume/shutdown commands from a per-request pub/sub
//! channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{shepherd, AutoEventCmd, Driver, DriverCore};
use crate::browser::Browser;
use crate::config::AutomationConfig;
use crate::Result;

/// Owns a single browser for the lifetime of the process, controlled via
/// the `wr.auto-event:{reqid}` pub/sub channel.
pub struct SingleBrowserDriver {
    core: DriverCore,
    browser: Mutex<Option<Arc<Browser>>>,
}

impl SingleBrowserDriver {
    /// Builds a driver around `config`. Does not contact shepherd or Redis
    /// until [`Driver::init`] is called.
    pub fn new(config: Arc<AutomationConfig>) -> Result<Self> {
        Ok(Self {
            core: DriverCore::new(config)?,
            browser: Mutex::new(None),
        })
    }

    async fn resolve_browser_ip(&self) -> Result<String> {
        let config = &self.core.config;
        if let Some(ip) = &config.browser_host_ip {
            return Ok(ip.clone());
        }
        let reqid = shepherd::stage_new_browser(&self.core.http, &config.shepherd_host, &config.browser_id).await?;
        shepherd::init_new_browser(&self.core.http, &config.shepherd_host, &reqid).await
    }

    fn spawn_control_channel(self: &Arc<Self>) {
        let driver = self.clone();
        let channel = format!("wr.auto-event:{}", self.core.config.reqid);
        tokio::spawn(async move {
            let mut pubsub = match driver.core.subscribe(&channel).await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!("SingleBrowserDriver: failed to subscribe to {}: {}", channel, e);
                    return;
                }
            };
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let cmd: AutoEventCmd = match serde_json::from_str(&payload) {
                    Ok(cmd) => cmd,
                    Err(_) => continue,
                };
                driver.handle_cmd(&cmd.cmd).await;
            }
        });
    }

    async fn handle_cmd(&self, cmd: &str) {
        let browser = self.browser.lock().await.clone();
        match cmd {
            "stop" => {
                info!("SingleBrowserDriver: pausing behaviors");
                if let Some(browser) = browser {
                    browser.pause_all().await;
                }
            }
            "start" => {
                info!("SingleBrowserDriver: resuming behaviors");
                if let Some(browser) = browser {
                    browser.resume_all().await;
                }
            }
            "shutdown" => {
                info!("SingleBrowserDriver: shutdown requested over pub/sub");
                self.initiate_shutdown();
            }
            other => warn!("SingleBrowserDriver: unrecognized command {:?}", other),
        }
    }

    fn spawn_exit_listener(self: &Arc<Self>, mut exit_rx: tokio::sync::mpsc::UnboundedReceiver<crate::types::BrowserExitInfo>) {
        let driver = self.clone();
        tokio::spawn(async move {
            if let Some(info) = exit_rx.recv().await {
                info!("SingleBrowserDriver: browser exited, initiating shutdown");
                driver.core.record_exit(info).await;
                *driver.browser.lock().await = None;
                driver.initiate_shutdown();
            }
        });
    }
}

#[async_trait]
impl Driver for SingleBrowserDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(browser) = self.browser.lock().await.take() {
            self.gracefully_shutdown_browser(&browser).await;
        }
    }
}

/// Provisions (or reconnects to) the single browser this driver runs,
/// wires up its exit and control-channel listeners, and starts crawling.
/// Split out from [`Driver::init`] because it needs `Arc<Self>` to spawn
/// self-referencing background tasks.
pub async fn start(driver: &Arc<SingleBrowserDriver>) -> Result<()> {
    let ip = driver.resolve_browser_ip().await?;
    let config = driver.core.config.clone();
    let tabs = shepherd::wait_for_tabs(&driver.core.http, &ip, config.cdp_port, config.num_tabs).await?;

    let browser = Arc::new(Browser::new(config.autoid.clone(), config.reqid.clone()));
    let redis = driver.core.new_redis_conn().await?;
    browser
        .init(tabs, config.clone(), driver.core.http.clone(), redis)
        .await?;
    browser.spawn_closed_listener();

    let exit_rx = browser.subscribe_exit().await;
    *driver.browser.lock().await = Some(browser);

    driver.spawn_exit_listener(exit_rx);
    driver.spawn_control_channel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_driver_has_no_browser_until_start() {
        let config = Arc::new(AutomationConfig::from_env());
        let driver = SingleBrowserDriver::new(config).unwrap();
        assert!(driver.browser.try_lock().unwrap().is_none());
    }
}
