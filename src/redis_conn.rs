//! A minimal Redis command surface, kept narrow on purpose: the Frontier
//! and Scope engines only ever need these few operations. Narrowing the
//! surface behind a trait lets their unit tests run against an in-memory
//! fake instead of requiring a live Redis server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::Result;

/// The handful of Redis commands the coordination layer issues.
#[async_trait]
pub trait RedisConn: Send + Sync {
    /// `SMEMBERS key`.
    async fn smembers(&mut self, key: &str) -> Result<Vec<String>>;
    /// `RPUSH key value`.
    async fn rpush(&mut self, key: &str, value: &str) -> Result<()>;
    /// `LPOP key`.
    async fn lpop(&mut self, key: &str) -> Result<Option<String>>;
    /// `SADD key member`. Returns `true` if the member was newly added.
    async fn sadd(&mut self, key: &str, member: &str) -> Result<bool>;
    /// `SREM key member`.
    async fn srem(&mut self, key: &str, member: &str) -> Result<()>;
    /// `SISMEMBER key member`.
    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool>;
    /// `LLEN key`.
    async fn llen(&mut self, key: &str) -> Result<i64>;
    /// `HGET key field`.
    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>>;
    /// `SET key value`.
    async fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
impl RedisConn for ConnectionManager {
    async fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        Ok(AsyncCommands::smembers(self, key).await?)
    }

    async fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
        let _: i64 = AsyncCommands::rpush(self, key, value).await?;
        Ok(())
    }

    async fn lpop(&mut self, key: &str) -> Result<Option<String>> {
        Ok(AsyncCommands::lpop(self, key, None).await?)
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = AsyncCommands::sadd(self, key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&mut self, key: &str, member: &str) -> Result<()> {
        let _: i64 = AsyncCommands::srem(self, key, member).await?;
        Ok(())
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(AsyncCommands::sismember(self, key, member).await?)
    }

    async fn llen(&mut self, key: &str) -> Result<i64> {
        Ok(AsyncCommands::llen(self, key).await?)
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(AsyncCommands::hget(self, key, field).await?)
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let _: () = AsyncCommands::set(self, key, value).await?;
        Ok(())
    }
}

/// Establishes a connection manager for `redis_url`, used once at driver
/// startup and shared (it is cheaply `Clone`) across every Frontier/Scope.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(client.get_connection_manager().await?)
}

#[cfg(test)]
pub mod fake {
    //! An in-memory [`RedisConn`] double used by Frontier/Scope unit tests.

    use std::collections::{HashMap, HashSet, VecDeque};

    use async_trait::async_trait;

    use super::RedisConn;
    use crate::Result;

    /// In-memory stand-in for a Redis connection, backing lists/sets/hashes
    /// with ordinary collections. Not thread-safe; intended for single
    /// tasked unit tests only.
    #[derive(Default)]
    pub struct FakeRedis {
        lists: HashMap<String, VecDeque<String>>,
        sets: HashMap<String, HashSet<String>>,
        hashes: HashMap<String, HashMap<String, String>>,
        strings: HashMap<String, String>,
    }

    impl FakeRedis {
        /// Creates an empty fake store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a hash field directly, bypassing the trait (for test setup).
        pub fn seed_hash(&mut self, key: &str, field: &str, value: &str) {
            self.hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        }

        /// Seeds a set directly (for loading scope rules in tests).
        pub fn seed_set(&mut self, key: &str, member: &str) {
            self.sets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string());
        }

        /// Reads the full contents of a list, for test assertions.
        pub fn list_contents(&self, key: &str) -> Vec<String> {
            self.lists
                .get(key)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RedisConn for FakeRedis {
        async fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
            Ok(self
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
            self.lists
                .entry(key.to_string())
                .or_default()
                .push_back(value.to_string());
            Ok(())
        }

        async fn lpop(&mut self, key: &str) -> Result<Option<String>> {
            Ok(self.lists.get_mut(key).and_then(|d| d.pop_front()))
        }

        async fn sadd(&mut self, key: &str, member: &str) -> Result<bool> {
            Ok(self
                .sets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string()))
        }

        async fn srem(&mut self, key: &str, member: &str) -> Result<()> {
            if let Some(set) = self.sets.get_mut(key) {
                set.remove(member);
            }
            Ok(())
        }

        async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
            Ok(self
                .sets
                .get(key)
                .map(|s| s.contains(member))
                .unwrap_or(false))
        }

        async fn llen(&mut self, key: &str) -> Result<i64> {
            Ok(self.lists.get(key).map(|d| d.len() as i64).unwrap_or(0))
        }

        async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
            Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
        }

        async fn set(&mut self, key: &str, value: &str) -> Result<()> {
            self.strings.insert(key.to_string(), value.to_string());
            Ok(())
        }
    }
}
