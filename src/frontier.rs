//! The pending-URL queue: a Redis-backed FIFO frontier with depth bounds,
//! seen/pending bookkeeping, and scope checking.

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use crate::config::RedisKeys;
use crate::redis_conn::RedisConn;
use crate::scope::Scope;
use crate::Result;

/// One queued URL at a given crawl depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierEntry {
    /// The URL to visit.
    pub url: String,
    /// Link depth from the seed, starting at 0.
    pub depth: u32,
}

/// Redis-backed frontier owned by a single tab.
///
/// `add`'s two writes (`RPUSH` then `SADD`) are not transactional: a crash
/// between them leaves `seen` without a matching `q` entry, which is
/// accepted as the URL simply never gets crawled (see spec §4.2).
pub struct Frontier<C> {
    conn: C,
    keys: RedisKeys,
    scope: Scope,
    crawl_depth: u32,
    current_depth: u32,
    /// The previously-returned URL, removed from `pending` lazily on the
    /// *next* call to `next_url` rather than immediately — the "one step
    /// behind" bookkeeping window preserved intentionally from the source.
    prev_pending: Option<String>,
}

impl<C: RedisConn> Frontier<C> {
    /// Initializes a frontier: reads `crawl_depth` from the info hash
    /// (defaulting to 0) and loads the scope rule set.
    pub async fn init(mut conn: C, keys: RedisKeys) -> Result<Self> {
        let crawl_depth = conn
            .hget(&keys.info, "crawl_depth")
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let scope = Scope::init(&mut conn, &keys.scope).await?;
        Ok(Self {
            conn,
            keys,
            scope,
            crawl_depth,
            current_depth: 0,
            prev_pending: None,
        })
    }

    /// True iff the queue is currently empty.
    pub async fn exhausted(&mut self) -> Result<bool> {
        Ok(self.q_len().await? == 0)
    }

    /// Current queue length.
    pub async fn q_len(&mut self) -> Result<i64> {
        self.conn.llen(&self.keys.queue).await
    }

    /// Whether `url` has ever been enqueued in this run.
    pub async fn is_seen(&mut self, url: &str) -> Result<bool> {
        self.conn.sismember(&self.keys.seen, url).await
    }

    /// Removes the *previous* pending URL (if any), pops the head of the
    /// queue, adds the popped URL to `pending`, records its depth as the
    /// current depth, and returns it.
    pub async fn next_url(&mut self) -> Result<Option<String>> {
        if let Some(prev) = self.prev_pending.take() {
            self.conn.srem(&self.keys.pending, &prev).await?;
        }
        let raw = match self.conn.lpop(&self.keys.queue).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let entry: FrontierEntry = serde_json::from_str(&raw)?;
        self.conn.sadd(&self.keys.pending, &entry.url).await?;
        self.current_depth = entry.depth;
        self.prev_pending = Some(entry.url.clone());
        Ok(Some(entry.url))
    }

    /// Adds one URL at `depth` if it is in-scope and not already seen.
    pub async fn add(&mut self, url: &str, depth: u32) -> Result<()> {
        if !self.scope.in_scope(url) {
            return Ok(());
        }
        if self.is_seen(url).await? {
            return Ok(());
        }
        let entry = FrontierEntry {
            url: url.to_string(),
            depth,
        };
        let payload = serde_json::to_string(&entry)?;
        self.conn.rpush(&self.keys.queue, &payload).await?;
        self.conn.sadd(&self.keys.seen, url).await?;
        Ok(())
    }

    /// Adds every URL in `urls` at `current_depth + 1`. No-ops entirely if
    /// that depth would exceed `crawl_depth`.
    pub async fn add_all<I, S>(&mut self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next_depth = self.current_depth + 1;
        if next_depth > self.crawl_depth {
            return Ok(());
        }
        for url in urls {
            self.add(url.as_ref(), next_depth).await?;
        }
        Ok(())
    }

    /// Polls `exhausted()` every `interval` until it returns `false`.
    pub async fn wait_for_populated_q(&mut self, interval: Duration) -> Result<()> {
        while self.exhausted().await? {
            sleep(interval).await;
        }
        Ok(())
    }

    /// The configured maximum crawl depth.
    pub fn crawl_depth(&self) -> u32 {
        self.crawl_depth
    }

    /// The depth of the most recently returned `next_url` entry.
    pub fn current_depth(&self) -> u32 {
        self.current_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_conn::fake::FakeRedis;

    fn keys() -> RedisKeys {
        RedisKeys::new("auto1")
    }

    #[tokio::test]
    async fn test_init_reads_crawl_depth_default_zero() {
        let frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        assert_eq!(frontier.crawl_depth(), 0);
    }

    #[tokio::test]
    async fn test_init_reads_crawl_depth_from_hash() {
        let mut fake = FakeRedis::new();
        fake.seed_hash("a:auto1:info", "crawl_depth", "3");
        let frontier = Frontier::init(fake, keys()).await.unwrap();
        assert_eq!(frontier.crawl_depth(), 3);
    }

    #[tokio::test]
    async fn test_add_enqueues_in_scope_unseen_url() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 1);
        assert!(frontier.is_seen("https://example.com/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_is_idempotent_for_seen_url() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_out_of_scope_url() {
        let mut fake = FakeRedis::new();
        fake.seed_set(
            "a:auto1:scope",
            &serde_json::to_string(&crate::scope::ScopeRule::Domain("example.com".to_string()))
                .unwrap(),
        );
        let mut frontier = Frontier::init(fake, keys()).await.unwrap();
        frontier.add("https://other.com/a", 0).await.unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_url_pops_fifo_and_sets_pending() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        frontier.add("https://example.com/b", 0).await.unwrap();
        let first = frontier.next_url().await.unwrap();
        assert_eq!(first.as_deref(), Some("https://example.com/a"));
        assert!(frontier
            .conn
            .sismember("a:auto1:qp", "https://example.com/a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_next_url_removes_previous_pending_one_step_behind() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        frontier.add("https://example.com/b", 0).await.unwrap();

        frontier.next_url().await.unwrap(); // pops "a", pending={a}
        assert!(frontier
            .conn
            .sismember("a:auto1:qp", "https://example.com/a")
            .await
            .unwrap());

        frontier.next_url().await.unwrap(); // removes "a", pops "b", pending={b}
        assert!(!frontier
            .conn
            .sismember("a:auto1:qp", "https://example.com/a")
            .await
            .unwrap());
        assert!(frontier
            .conn
            .sismember("a:auto1:qp", "https://example.com/b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_next_url_returns_none_when_empty() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        assert_eq!(frontier.next_url().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_all_computes_next_depth_and_noops_beyond_crawl_depth() {
        let mut fake = FakeRedis::new();
        fake.seed_hash("a:auto1:info", "crawl_depth", "1");
        let mut frontier = Frontier::init(fake, keys()).await.unwrap();

        // current_depth starts at 0, so next_depth = 1 <= crawl_depth(1): allowed.
        frontier
            .add_all(["https://example.com/a", "https://example.com/b"])
            .await
            .unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 2);

        frontier.next_url().await.unwrap(); // current_depth becomes 1
        // next_depth = 2 > crawl_depth(1): no-op.
        frontier.add_all(["https://example.com/c"]).await.unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_populated_q_returns_once_entry_added() {
        let mut frontier = Frontier::init(FakeRedis::new(), keys()).await.unwrap();
        frontier.add("https://example.com/a", 0).await.unwrap();
        frontier
            .wait_for_populated_q(Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(frontier.q_len().await.unwrap(), 1);
    }
}
