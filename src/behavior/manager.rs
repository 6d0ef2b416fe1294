//! Resolving a behavior script for a given page URL.
//!
//! Two variants share one contract: a remote variant that fetches behavior
//! JS and info over HTTP from an external behavior service, and a local
//! variant that matches a configured rule list against the filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::runner::BehaviorRunner;
use super::BehaviorHost;
use crate::scope::ScopeRule;
use crate::Result;

/// Resolves a [`BehaviorRunner`] and its info document for a given URL.
#[async_trait]
pub trait BehaviorManager<H: BehaviorHost>: Send + Sync {
    /// Builds a behavior runner bound to `host` for `url`.
    async fn behavior_for_url(&self, url: &str, host: Arc<H>) -> Result<BehaviorRunner<H>>;

    /// Fetches the JSON info document describing the behavior for `url`.
    async fn behavior_info_for_url(&self, url: &str) -> Result<Value>;
}

/// Fetches behavior JS and info from an external behavior service over
/// HTTP. Behaviors are authored and versioned externally; fetching per URL
/// keeps this host agnostic to site specifics.
pub struct RemoteBehaviorManager {
    http: reqwest::Client,
    behavior_endpoint: String,
    behavior_info_endpoint: String,
}

impl RemoteBehaviorManager {
    /// Constructs a manager pointed at the given endpoint bases (each is
    /// expected to accept a URL appended directly, per spec §4.3).
    pub fn new(
        http: reqwest::Client,
        behavior_endpoint: impl Into<String>,
        behavior_info_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            behavior_endpoint: behavior_endpoint.into(),
            behavior_info_endpoint: behavior_info_endpoint.into(),
        }
    }

    async fn fetch_behavior_js(&self, url: &str) -> Result<String> {
        let endpoint = format!("{}{}", self.behavior_endpoint, url);
        Ok(self.http.get(endpoint).send().await?.text().await?)
    }
}

#[async_trait]
impl<H: BehaviorHost> BehaviorManager<H> for RemoteBehaviorManager {
    async fn behavior_for_url(&self, url: &str, host: Arc<H>) -> Result<BehaviorRunner<H>> {
        let js = self.fetch_behavior_js(url).await?;
        Ok(BehaviorRunner::new(host, js).with_collect_outlinks(true))
    }

    async fn behavior_info_for_url(&self, url: &str) -> Result<Value> {
        let endpoint = format!("{}{}", self.behavior_info_endpoint, url);
        Ok(self.http.get(endpoint).send().await?.json().await?)
    }
}

/// A local match rule plus the behavior configuration it resolves to.
#[derive(Debug, Clone)]
pub struct LocalBehaviorConfig {
    /// Filesystem path to the behavior's JS source.
    pub resource: PathBuf,
    /// Whether this behavior wants automatic per-step outlink collection.
    pub collect_outlinks: bool,
}

/// Matches a configured rule list against the candidate URL; first hit
/// wins, otherwise the manager's default configuration is used. Reuses
/// [`ScopeRule`] matching rather than inventing a parallel rule language.
pub struct LocalBehaviorManager {
    matchers: Vec<(ScopeRule, LocalBehaviorConfig)>,
    default_config: LocalBehaviorConfig,
}

impl LocalBehaviorManager {
    /// Constructs a manager from an ordered matcher list and a fallback
    /// configuration used when no matcher applies.
    pub fn new(
        matchers: Vec<(ScopeRule, LocalBehaviorConfig)>,
        default_config: LocalBehaviorConfig,
    ) -> Self {
        Self {
            matchers,
            default_config,
        }
    }

    fn config_for_url(&self, url: &str) -> &LocalBehaviorConfig {
        let surt = crate::scope::surt(url);
        self.matchers
            .iter()
            .find(|(rule, _)| rule.applies(url, &surt, None))
            .map(|(_, config)| config)
            .unwrap_or(&self.default_config)
    }

    async fn read_js(&self, config: &LocalBehaviorConfig) -> Result<String> {
        Ok(tokio::fs::read_to_string(&config.resource).await?)
    }
}

#[async_trait]
impl<H: BehaviorHost> BehaviorManager<H> for LocalBehaviorManager {
    async fn behavior_for_url(&self, url: &str, host: Arc<H>) -> Result<BehaviorRunner<H>> {
        let config = self.config_for_url(url);
        let js = self.read_js(config).await?;
        Ok(BehaviorRunner::new(host, js).with_collect_outlinks(config.collect_outlinks))
    }

    async fn behavior_info_for_url(&self, url: &str) -> Result<Value> {
        let config = self.config_for_url(url);
        Ok(serde_json::json!({
            "resource": config.resource.display().to_string(),
            "collect_outlinks": config.collect_outlinks,
        }))
    }
}

impl From<std::io::Error> for crate::AutomationError {
    fn from(e: std::io::Error) -> Self {
        crate::AutomationError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    struct NoopHost;

    #[async_trait]
    impl BehaviorHost for NoopHost {
        async fn evaluate_in_page(&self, _expr: &str) -> Result<JsonValue> {
            Ok(JsonValue::Null)
        }
        async fn evaluate_in_frame(&self, _frame_id: &str, _expr: &str) -> Result<JsonValue> {
            Ok(JsonValue::Null)
        }
        async fn wait_for_net_idle(&self, _global_wait_secs: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_local_manager_first_match_wins() {
        let matchers = vec![(
            ScopeRule::Domain("example.com".to_string()),
            LocalBehaviorConfig {
                resource: PathBuf::from("/behaviors/example.js"),
                collect_outlinks: true,
            },
        )];
        let default_config = LocalBehaviorConfig {
            resource: PathBuf::from("/behaviors/default.js"),
            collect_outlinks: false,
        };
        let manager = LocalBehaviorManager::new(matchers, default_config);

        let matched = manager.config_for_url("https://example.com/a");
        assert_eq!(matched.resource, PathBuf::from("/behaviors/example.js"));

        let fallback = manager.config_for_url("https://other.com/a");
        assert_eq!(fallback.resource, PathBuf::from("/behaviors/default.js"));
    }

    #[tokio::test]
    async fn test_local_manager_behavior_info_reflects_matched_config() {
        let default_config = LocalBehaviorConfig {
            resource: PathBuf::from("/behaviors/default.js"),
            collect_outlinks: false,
        };
        let manager = LocalBehaviorManager::new(vec![], default_config);
        let info = BehaviorManager::<NoopHost>::behavior_info_for_url(&manager, "https://x.test/y")
            .await
            .unwrap();
        assert_eq!(info["collect_outlinks"], JsonValue::Bool(false));
    }
}
