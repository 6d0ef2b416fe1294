//! Scope rule matching: deciding whether a candidate URL is eligible to be
//! enqueued onto the frontier.

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::redis_conn::RedisConn;
use crate::Result;

/// One scope rule. A URL is in-scope if any configured rule applies to it,
/// evaluated in insertion order with short-circuit on the first match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ScopeRule {
    /// SURT-prefix match: the candidate's SURT form starts with `value`.
    SurtPrefix(String),
    /// SSURT (host-reversed, scheme-agnostic) prefix match.
    Ssurt(String),
    /// Regex match against the raw URL.
    Regex(String),
    /// Exact domain (or subdomain) match.
    Domain(String),
    /// Plain substring match against the raw URL.
    Substring(String),
    /// Regex match against the *referring* page's URL rather than the
    /// candidate URL itself.
    ParentUrlRegex(String),
    /// Exact URL match.
    UrlMatch(String),
}

impl ScopeRule {
    /// Lax matching: the behavior used by [`Scope::in_scope`]. Prefix/
    /// substring rules match as prefixes/substrings; see
    /// [`Self::applies_strict`] for exact-match semantics.
    pub fn applies(&self, url: &str, surt: &str, parent_url: Option<&str>) -> bool {
        match self {
            ScopeRule::SurtPrefix(value) => surt.starts_with(value.as_str()),
            ScopeRule::Ssurt(value) => ssurt(url).starts_with(value.as_str()),
            ScopeRule::Regex(pattern) => regex_matches(pattern, url),
            ScopeRule::Domain(domain) => url_domain(url)
                .map(|d| d == *domain || d.ends_with(&format!(".{}", domain)))
                .unwrap_or(false),
            ScopeRule::Substring(needle) => url.contains(needle.as_str()),
            ScopeRule::ParentUrlRegex(pattern) => {
                parent_url.map(|p| regex_matches(pattern, p)).unwrap_or(false)
            }
            ScopeRule::UrlMatch(exact) => url == exact,
        }
    }

    /// Strict (exact, non-prefix) matching, per the `StrictMatchRule`
    /// variant in the original source: domain/surt/ssurt/substring become
    /// exact-equality checks; regex rules are unaffected since they are
    /// already exact by construction.
    pub fn applies_strict(&self, url: &str, surt: &str, parent_url: Option<&str>) -> bool {
        match self {
            ScopeRule::SurtPrefix(value) => surt == value,
            ScopeRule::Ssurt(value) => ssurt(url) == *value,
            ScopeRule::Domain(domain) => url_domain(url).map(|d| d == *domain).unwrap_or(false),
            ScopeRule::Substring(needle) => url == needle,
            other => other.applies(url, surt, parent_url),
        }
    }
}

fn regex_matches(pattern: &str, haystack: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(haystack),
        Err(e) => {
            warn!("invalid scope regex {:?}: {}", pattern, e);
            false
        }
    }
}

fn url_domain(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
}

/// Computes the SURT (Sort-friendly URI Reordering Transform) of a URL:
/// scheme and authority are reversed into `host,reversed)/path?query`,
/// e.g. `http://example.com/a` → `com,example)/a`.
pub fn surt(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return url.to_string(),
    };
    let host = match parsed.host_str() {
        Some(h) => h,
        None => return url.to_string(),
    };
    let reversed_host: Vec<&str> = host.split('.').rev().collect();
    let mut out = reversed_host.join(",");
    out.push(')');
    out.push_str(parsed.path());
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// SSURT: like SURT but keeps the scheme as a prefix, used by rules that
/// need to distinguish `http` from `https`.
pub fn ssurt(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return url.to_string(),
    };
    format!("{}:{}", parsed.scheme(), surt(url))
}

/// Suffix that is always out-of-scope, regardless of configured rules.
const TIMELINE_SUFFIX: &str = "#timeline";

/// Redis-backed scope engine for one crawl. Loads its rule set once at
/// `init()`; subsequent `in_scope` calls are pure reads.
pub struct Scope {
    rules: Vec<ScopeRule>,
    /// `true` when the loaded rule set was empty: every URL (other than the
    /// `#timeline` exclusion) is considered in-scope.
    all_links: bool,
}

impl Scope {
    /// Constructs an already-initialized scope from an explicit rule set,
    /// useful for tests and for the local/offline configuration path.
    pub fn from_rules(rules: Vec<ScopeRule>) -> Self {
        let all_links = rules.is_empty();
        Self { rules, all_links }
    }

    /// Loads the scope rule set for `autoid` from `a:{id}:scope`.
    /// Malformed rule JSON is skipped with a warning rather than aborting.
    pub async fn init<C>(conn: &mut C, scope_key: &str) -> Result<Self>
    where
        C: RedisConn,
    {
        let raw: Vec<String> = conn.smembers(scope_key).await?;
        let mut rules = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<ScopeRule>(&entry) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("skipping malformed scope rule {:?}: {}", entry, e),
            }
        }
        Ok(Self::from_rules(rules))
    }

    /// Whether `url` is in scope for this crawl. `#timeline`-suffixed URLs
    /// are always excluded, checked before rule evaluation. An empty rule
    /// set matches everything else.
    pub fn in_scope(&self, url: &str) -> bool {
        self.in_scope_with_parent(url, None)
    }

    /// As [`Self::in_scope`], but also supplies the referring page's URL so
    /// that `parent-url-regex` rules can match.
    pub fn in_scope_with_parent(&self, url: &str, parent_url: Option<&str>) -> bool {
        if url.ends_with(TIMELINE_SUFFIX) {
            return false;
        }
        if self.all_links {
            return true;
        }
        let surt_form = surt(url);
        self.rules
            .iter()
            .any(|rule| rule.applies(url, &surt_form, parent_url))
    }

    /// Number of loaded rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
