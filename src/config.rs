//! Run configuration, built once from the environment and held immutable
//! for the life of a run.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which concrete [`crate::tab`] implementation a browser's tabs should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabType {
    /// A tab that only runs a single behavior against whatever page it is on.
    BehaviorTab,
    /// A tab that drives the crawl loop against the shared frontier.
    CrawlerTab,
}

impl Default for TabType {
    fn default() -> Self {
        TabType::BehaviorTab
    }
}

impl TabType {
    fn from_env_str(s: &str) -> Self {
        match s {
            "CrawlerTab" => TabType::CrawlerTab,
            _ => TabType::BehaviorTab,
        }
    }
}

/// Redis key names derived from an `autoid`, per `a:{autoid}` + suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    /// `a:{id}:info` — hash of crawl metadata.
    pub info: String,
    /// `a:{id}:q` — FIFO queue of pending URLs.
    pub queue: String,
    /// `a:{id}:qp` — set of URLs currently being crawled.
    pub pending: String,
    /// `a:{id}:seen` — set of URLs ever enqueued.
    pub seen: String,
    /// `a:{id}:scope` — set of JSON scope rules.
    pub scope: String,
    /// `a:{id}:br:done` — optional end-of-crawl marker.
    pub auto_done: String,
}

impl RedisKeys {
    /// Derives all keys for a given `autoid`.
    pub fn new(autoid: &str) -> Self {
        let prefix = format!("a:{}", autoid);
        Self {
            info: format!("{}:info", prefix),
            queue: format!("{}:q", prefix),
            pending: format!("{}:qp", prefix),
            seen: format!("{}:seen", prefix),
            scope: format!("{}:scope", prefix),
            auto_done: format!("{}:br:done", prefix),
        }
    }
}

/// Immutable configuration for one automation run.
///
/// Constructed once via [`AutomationConfig::from_env`]; never mutated
/// afterward. Unrecognized environment keys passed through
/// [`AutomationConfig::with_overrides`] land in `additional_configuration`.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Identifier for this running automation.
    pub autoid: String,
    /// Identifier for the provisioning request that created the browser(s).
    pub reqid: String,
    /// Browser image/spec identifier passed to shepherd.
    pub browser_id: String,
    /// Number of tabs to open against each browser.
    pub num_tabs: usize,
    /// Which tab implementation to construct for each opened tab.
    pub tab_type: TabType,
    /// Wall-clock budget for one behavior run, in seconds. `-1` disables.
    pub max_behavior_time: i64,
    /// Navigation timeout, in seconds.
    pub navigation_timeout: u64,
    /// Whether the CDP network cache should be disabled on each tab.
    pub net_cache_disabled: bool,
    /// Whether a CrawlerTab should block until the frontier is populated.
    pub wait_for_q: bool,
    /// Base URL of the shepherd browser-provisioning service.
    pub shepherd_host: String,
    /// Preset IP:port of an already-running browser. Presence selects
    /// [`crate::driver::single::SingleBrowserDriver`]; absence selects
    /// [`crate::driver::multi::MultiBrowserDriver`].
    pub browser_host_ip: Option<String>,
    /// Redis connection URL.
    pub redis_url: String,
    /// Base URL for fetching a behavior's JS source.
    pub behavior_endpoint: String,
    /// Base URL for fetching a behavior's JSON info.
    pub behavior_info_endpoint: String,
    /// Base URL for uploading screenshots, if screenshotting is enabled.
    pub screenshot_api_url: Option<String>,
    /// `file://`-relative target path used when composing a screenshot upload.
    pub screenshot_target_uri: Option<String>,
    /// Image format requested from `Page.captureScreenshot` (`png`/`jpeg`).
    pub screenshot_format: String,
    /// Port the CDP HTTP discovery endpoints are served on.
    pub cdp_port: u16,
    /// Raw Chrome launch options, passed through to shepherd as JSON.
    pub chrome_opts: Value,
    /// Recognized-options map of extra keys, accessed by name.
    pub additional_configuration: HashMap<String, Value>,
}

/// Reads a typed environment variable, falling back to `default` when unset
/// or unparseable. Mirrors the original `env(key, type_, default)` helper.
fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_int(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_json_object(key: &str) -> Value {
    env::var(key)
        .ok()
        .and_then(|v| serde_json::from_str(&v).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

impl AutomationConfig {
    /// Builds a config from the process environment, applying the defaults
    /// documented in the external interfaces section of the specification.
    pub fn from_env() -> Self {
        let behavior_api_url = env_str("BEHAVIOR_API_URL", "http://localhost:3030");
        let behavior_endpoint = env::var("FETCH_BEHAVIOR_ENDPOINT")
            .unwrap_or_else(|_| format!("{}/behavior?url=", behavior_api_url));
        // Fixed per spec §9(c): the original source mis-shadowed this
        // default with `REQ_BROWSER_PATH` in one code path. This endpoint
        // gets its own dedicated env var instead.
        let behavior_info_endpoint = env::var("FETCH_BEHAVIOR_INFO_ENDPOINT")
            .unwrap_or_else(|_| format!("{}/info?url=", behavior_api_url));

        Self {
            autoid: env_str("AUTO_ID", ""),
            reqid: env_str("REQ_ID", ""),
            browser_id: env_str("BROWSER_ID", "chrome:67"),
            num_tabs: env_u64("NUM_TABS", 1).max(1) as usize,
            tab_type: env::var("TAB_TYPE")
                .map(|v| TabType::from_env_str(&v))
                .unwrap_or_default(),
            max_behavior_time: env_int("BEHAVIOR_RUN_TIME", 60),
            navigation_timeout: env_u64("NAV_TO", 30),
            net_cache_disabled: env_bool("CRAWL_NO_NETCACHE", true),
            wait_for_q: env_bool("WAIT_FOR_Q", true),
            shepherd_host: env_str("SHEPHERD_HOST", "http://shepherd:9020"),
            browser_host_ip: env_opt_str("BROWSER_HOST"),
            redis_url: env_str("REDIS_URL", "redis://localhost"),
            behavior_endpoint,
            behavior_info_endpoint,
            screenshot_api_url: env_opt_str("SCREENSHOT_API_URL"),
            screenshot_target_uri: env_opt_str("SCREENSHOT_TARGET_URI"),
            screenshot_format: env_str("SCREENSHOT_FORMAT", "png"),
            cdp_port: env_u64("CDP_PORT", 9222) as u16,
            chrome_opts: env_json_object("CHROME_OPTS"),
            additional_configuration: HashMap::new(),
        }
    }

    /// Merges additional, unrecognized key/value pairs into
    /// `additional_configuration`, returning `self` for chaining.
    pub fn with_overrides(mut self, overrides: HashMap<String, Value>) -> Self {
        self.additional_configuration.extend(overrides);
        self
    }

    /// Looks up a value by name, first among recognized fields exposed via
    /// this accessor, then in `additional_configuration`.
    pub fn config_value(&self, key: &str) -> Option<Value> {
        match key {
            "autoid" => Some(Value::String(self.autoid.clone())),
            "reqid" => Some(Value::String(self.reqid.clone())),
            "browser_id" => Some(Value::String(self.browser_id.clone())),
            "num_tabs" => Some(Value::Number(self.num_tabs.into())),
            _ => self.additional_configuration.get(key).cloned(),
        }
    }

    /// Derives this run's [`RedisKeys`] from `autoid`.
    pub fn redis_keys(&self) -> RedisKeys {
        RedisKeys::new(&self.autoid)
    }

    /// Whether screenshot capture/upload is configured for this run.
    pub fn should_take_screenshot(&self) -> bool {
        self.screenshot_api_url.is_some()
    }

    /// Whether the behavior time bound is disabled (`-1`).
    pub fn behavior_time_unbounded(&self) -> bool {
        self.max_behavior_time < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys_derivation() {
        let keys = RedisKeys::new("abc123");
        assert_eq!(keys.info, "a:abc123:info");
        assert_eq!(keys.queue, "a:abc123:q");
        assert_eq!(keys.pending, "a:abc123:qp");
        assert_eq!(keys.seen, "a:abc123:seen");
        assert_eq!(keys.scope, "a:abc123:scope");
        assert_eq!(keys.auto_done, "a:abc123:br:done");
    }

    #[test]
    fn test_tab_type_default_is_behavior_tab() {
        assert_eq!(TabType::default(), TabType::BehaviorTab);
    }

    #[test]
    fn test_tab_type_from_env_str() {
        assert_eq!(TabType::from_env_str("CrawlerTab"), TabType::CrawlerTab);
        assert_eq!(TabType::from_env_str("BehaviorTab"), TabType::BehaviorTab);
        assert_eq!(TabType::from_env_str("garbage"), TabType::BehaviorTab);
    }

    #[test]
    fn test_env_bool_truthy_values() {
        std::env::set_var("TEST_ENV_BOOL_TRUE", "true");
        assert!(env_bool("TEST_ENV_BOOL_TRUE", false));
        std::env::set_var("TEST_ENV_BOOL_TRUE", "1");
        assert!(env_bool("TEST_ENV_BOOL_TRUE", false));
        std::env::remove_var("TEST_ENV_BOOL_TRUE");
    }

    #[test]
    fn test_env_bool_falls_back_to_default_when_unset() {
        std::env::remove_var("TEST_ENV_BOOL_UNSET");
        assert!(env_bool("TEST_ENV_BOOL_UNSET", true));
        assert!(!env_bool("TEST_ENV_BOOL_UNSET", false));
    }

    #[test]
    fn test_env_int_parses_or_defaults() {
        std::env::set_var("TEST_ENV_INT", "-1");
        assert_eq!(env_int("TEST_ENV_INT", 60), -1);
        std::env::remove_var("TEST_ENV_INT");
        assert_eq!(env_int("TEST_ENV_INT", 60), 60);
    }

    #[test]
    fn test_env_json_object_defaults_to_empty_object() {
        std::env::remove_var("TEST_ENV_JSON_UNSET");
        let v = env_json_object("TEST_ENV_JSON_UNSET");
        assert!(v.is_object());
        assert_eq!(v.as_object().unwrap().len(), 0);
    }

    #[test]
    fn test_config_value_recognized_vs_additional() {
        let mut overrides = HashMap::new();
        overrides.insert("custom_flag".to_string(), Value::Bool(true));
        let config = AutomationConfig::from_env().with_overrides(overrides);
        assert_eq!(config.config_value("custom_flag"), Some(Value::Bool(true)));
        assert!(config.config_value("nonexistent").is_none());
    }

    #[test]
    fn test_should_take_screenshot_false_by_default() {
        std::env::remove_var("SCREENSHOT_API_URL");
        let config = AutomationConfig::from_env();
        assert!(!config.should_take_screenshot());
    }

    #[test]
    fn test_behavior_time_unbounded() {
        std::env::set_var("BEHAVIOR_RUN_TIME", "-1");
        let config = AutomationConfig::from_env();
        assert!(config.behavior_time_unbounded());
        std::env::remove_var("BEHAVIOR_RUN_TIME");
    }

    #[test]
    fn test_num_tabs_clamped_to_at_least_one() {
        std::env::set_var("NUM_TABS", "0");
        let config = AutomationConfig::from_env();
        assert_eq!(config.num_tabs, 1);
        std::env::remove_var("NUM_TABS");
    }
}
