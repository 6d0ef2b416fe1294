//! The shepherd HTTP provisioning protocol: stage a browser, poll until it
//! is ready, then discover its tabs over CDP's own HTTP endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use crate::tab::TabData;
use crate::{AutomationError, Result};

/// Interval between polls while waiting for a browser (or its tabs) to
/// become ready.
const WAIT_TIME: Duration = Duration::from_millis(500);

fn req_browser_url(shepherd_host: &str, browser_id: &str) -> String {
    format!("{}/request_browser/{}", shepherd_host, browser_id)
}

fn init_browser_url(shepherd_host: &str, reqid: &str) -> String {
    format!("{}/init_browser?reqid={}", shepherd_host, reqid)
}

fn get_browser_info_url(shepherd_host: &str, reqid: &str) -> String {
    format!("{}/info/{}", shepherd_host, reqid)
}

fn cdp_json_url(ip: &str, cdp_port: u16) -> String {
    format!("http://{}:{}/json", ip, cdp_port)
}

fn cdp_json_new_url(ip: &str, cdp_port: u16) -> String {
    format!("http://{}:{}/json/new", ip, cdp_port)
}

#[derive(Debug, Deserialize)]
struct StageResponse {
    reqid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    cmd_port: Option<u16>,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TabInfo {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Requests a new browser instance of `browser_id` from shepherd, returning
/// the `reqid` that identifies the provisioning request.
pub async fn stage_new_browser(http: &Client, shepherd_host: &str, browser_id: &str) -> Result<String> {
    let url = req_browser_url(shepherd_host, browser_id);
    let body: StageResponse = http.post(&url).send().await?.json().await?;
    body.reqid
        .ok_or_else(|| AutomationError::BrowserStaging(format!("no reqid in response from {}", url)))
}

/// Polls `init_browser` until shepherd reports the staged browser has a
/// `cmd_port`, returning the browser's IP.
pub async fn init_new_browser(http: &Client, shepherd_host: &str, reqid: &str) -> Result<String> {
    let url = init_browser_url(shepherd_host, reqid);
    loop {
        let response = http
            .get(&url)
            .header("Host", "localhost")
            .send()
            .await?;
        let parsed: std::result::Result<InitResponse, _> = response.json().await;
        match parsed {
            Ok(InitResponse {
                cmd_port: Some(_),
                ip: Some(ip),
            }) => return Ok(ip),
            Ok(_) => {
                debug!("shepherd: browser {} not ready yet", reqid);
                sleep(WAIT_TIME).await;
            }
            Err(e) => {
                return Err(AutomationError::BrowserInit(format!(
                    "init_browser response for {} was not parseable: {}",
                    reqid, e
                )));
            }
        }
    }
}

/// Looks up the IP of an already-provisioned browser for `reqid`.
pub async fn get_ip_for_reqid(http: &Client, shepherd_host: &str, reqid: &str) -> Result<Option<String>> {
    let url = get_browser_info_url(shepherd_host, reqid);
    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Ok(None);
    }
    let value: Value = response.json().await?;
    Ok(value.get("ip").and_then(|v| v.as_str()).map(str::to_string))
}

/// Lists open, directly connectable tabs for the browser at `ip`.
pub async fn find_browser_tabs(http: &Client, ip: &str, cdp_port: u16) -> Result<Vec<TabData>> {
    let response = http.get(cdp_json_url(ip, cdp_port)).send().await?;
    let tabs: Vec<TabInfo> = response.json().await.unwrap_or_default();
    Ok(tabs
        .into_iter()
        .filter(|t| t.kind == "page")
        .filter_map(|t| {
            t.web_socket_debugger_url.map(|ws_url| TabData {
                id: t.id,
                ws_url,
            })
        })
        .collect())
}

/// Opens one additional tab on the browser at `ip` via CDP's `/json/new`.
pub async fn create_browser_tab(http: &Client, ip: &str, cdp_port: u16) -> Result<TabData> {
    let response = http.put(cdp_json_new_url(ip, cdp_port)).send().await;
    let response = match response {
        Ok(r) => r,
        Err(_) => http.get(cdp_json_new_url(ip, cdp_port)).send().await?,
    };
    let tab: TabInfo = response.json().await?;
    tab.web_socket_debugger_url
        .map(|ws_url| TabData { id: tab.id, ws_url })
        .ok_or_else(|| AutomationError::BrowserInit(format!("no websocket url for new tab on {}", ip)))
}

/// Polls `find_browser_tabs` until at least one tab exists, then opens
/// additional tabs (via [`create_browser_tab`]) until there are `num_tabs`.
pub async fn wait_for_tabs(http: &Client, ip: &str, cdp_port: u16, num_tabs: usize) -> Result<Vec<TabData>> {
    let mut tabs = loop {
        let tabs = find_browser_tabs(http, ip, cdp_port).await?;
        if !tabs.is_empty() {
            break tabs;
        }
        sleep(WAIT_TIME).await;
    };
    while tabs.len() < num_tabs {
        tabs.push(create_browser_tab(http, ip, cdp_port).await?);
    }
    Ok(tabs)
}
