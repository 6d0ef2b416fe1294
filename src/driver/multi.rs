//! Drives a dynamic set of browsers, added and removed over a shared
//! `auto-event` pub/sub channel, shutting down once every owned browser has
//! exited.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{shepherd, AutoEventCmd, Driver, DriverCore};
use crate::browser::Browser;
use crate::config::AutomationConfig;
use crate::Result;

/// Owns zero or more browsers, keyed by `reqid`, added and removed in
/// response to commands on the shared `auto-event` channel.
pub struct MultiBrowserDriver {
    core: DriverCore,
    browsers: Mutex<HashMap<String, Arc<Browser>>>,
}

impl MultiBrowserDriver {
    /// Builds a driver around `config`. Starts with no browsers; use
    /// [`add_browser`](Self::add_browser) or the control channel to add one.
    pub fn new(config: Arc<AutomationConfig>) -> Result<Self> {
        Ok(Self {
            core: DriverCore::new(config)?,
            browsers: Mutex::new(HashMap::new()),
        })
    }

    /// Adds a browser for `reqid`: reconnects to an already-provisioned
    /// instance if shepherd still knows its IP, otherwise stages and
    /// initializes a new one.
    pub async fn add_browser(self: &Arc<Self>, reqid: &str) -> Result<()> {
        if self.browsers.lock().await.contains_key(reqid) {
            return Ok(());
        }
        let config = self.core.config.clone();
        let ip = match shepherd::get_ip_for_reqid(&self.core.http, &config.shepherd_host, reqid).await? {
            Some(ip) => ip,
            None => shepherd::init_new_browser(&self.core.http, &config.shepherd_host, reqid).await?,
        };
        let tabs = shepherd::wait_for_tabs(&self.core.http, &ip, config.cdp_port, config.num_tabs).await?;

        let browser = Arc::new(Browser::new(config.autoid.clone(), reqid.to_string()));
        let redis = self.core.new_redis_conn().await?;
        browser
            .init(tabs, config.clone(), self.core.http.clone(), redis)
            .await?;
        browser.spawn_closed_listener();

        let exit_rx = browser.subscribe_exit().await;
        self.browsers
            .lock()
            .await
            .insert(reqid.to_string(), browser);
        self.spawn_exit_listener(reqid.to_string(), exit_rx);
        info!("MultiBrowserDriver: added browser {}", reqid);
        Ok(())
    }

    /// Gracefully removes the browser for `reqid`, if one is owned.
    pub async fn remove_browser(&self, reqid: &str) {
        let browser = self.browsers.lock().await.remove(reqid);
        if let Some(browser) = browser {
            info!("MultiBrowserDriver: removing browser {}", reqid);
            self.gracefully_shutdown_browser(&browser).await;
        }
    }

    fn spawn_exit_listener(
        self: &Arc<Self>,
        reqid: String,
        mut exit_rx: tokio::sync::mpsc::UnboundedReceiver<crate::types::BrowserExitInfo>,
    ) {
        let driver = self.clone();
        tokio::spawn(async move {
            if let Some(info) = exit_rx.recv().await {
                driver.core.record_exit(info).await;
                driver.browsers.lock().await.remove(&reqid);
                if driver.browsers.lock().await.is_empty() {
                    info!("MultiBrowserDriver: no browsers remain, initiating shutdown");
                    driver.initiate_shutdown();
                }
            }
        });
    }

    fn spawn_control_channel(self: &Arc<Self>) {
        let driver = self.clone();
        tokio::spawn(async move {
            let mut pubsub = match driver.core.subscribe("auto-event").await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!("MultiBrowserDriver: failed to subscribe to auto-event: {}", e);
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
                driver.handle_cmd(cmd).await;
            }
        });
    }

    async fn handle_cmd(self: &Arc<Self>, cmd: AutoEventCmd) {
        match cmd.cmd.as_str() {
            "start" => {
                if let Some(reqid) = cmd.reqid {
                    if let Err(e) = self.add_browser(&reqid).await {
                        warn!("MultiBrowserDriver: failed to add browser {}: {}", reqid, e);
                    }
                }
            }
            "stop" => {
                if let Some(reqid) = cmd.reqid {
                    self.remove_browser(&reqid).await;
                }
            }
            "shutdown" => {
                info!("MultiBrowserDriver: shutdown requested over pub/sub");
                self.initiate_shutdown();
            }
            other => warn!("MultiBrowserDriver: unrecognized command {:?}", other),
        }
    }
}

#[async_trait]
impl Driver for MultiBrowserDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        let browsers: Vec<_> = self.browsers.lock().await.drain().map(|(_, b)| b).collect();
        for browser in browsers {
            self.gracefully_shutdown_browser(&browser).await;
        }
    }
}

/// Starts this driver: adds the browser named by the run's own `reqid`
/// (if one is configured) and starts the shared control channel listener.
/// Split out from [`Driver::init`] because it needs `Arc<Self>` to spawn
/// self-referencing background tasks.
pub async fn start(driver: &Arc<MultiBrowserDriver>) -> Result<()> {
    let reqid = driver.core.config.reqid.clone();
    if !reqid.is_empty() {
        driver.add_browser(&reqid).await?;
    }
    driver.spawn_control_channel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_driver_has_no_browsers() {
        let config = Arc::new(AutomationConfig::from_env());
        let driver = MultiBrowserDriver::new(config).unwrap();
        assert!(driver.browsers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_browser_is_noop() {
        let config = Arc::new(AutomationConfig::from_env());
        let driver = MultiBrowserDriver::new(config).unwrap();
        driver.remove_browser("nope").await;
        assert!(driver.browsers.lock().await.is_empty());
    }
}
