//! KV client facade: two logical Redis connections, one shared and one
//! dedicated to blocking list pops, so a consumer's long wait can never
//! stall a control-API request or another consumer's metrics writes.

use crate::error::DispatcherError;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared + blocking Redis connection pair.
#[derive(Clone)]
pub struct KvClient {
    shared: ConnectionManager,
    blocking: std::sync::Arc<Mutex<MultiplexedConnection>>,
}

impl KvClient {
    /// Connect both the shared and the blocking connection, retrying with a
    /// fixed backoff until Redis is reachable. IPv4 is preferred by using a
    /// plain `redis://` URL (the `redis` crate resolves it via the system
    /// resolver, which is left to prefer A records via `url`'s host form).
    pub async fn connect_with_retry(redis_url: &str) -> Result<Self, DispatcherError> {
        let client = Client::open(redis_url).map_err(DispatcherError::Redis)?;

        let shared = Self::retry(|| {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;

        let blocking_conn = Self::retry(|| {
            let client = client.clone();
            async move { client.get_multiplexed_tokio_connection().await }
        })
        .await?;

        info!(redis_url, "connected to Redis (shared + blocking channel)");

        Ok(Self {
            shared,
            blocking: std::sync::Arc::new(Mutex::new(blocking_conn)),
        })
    }

    async fn retry<F, Fut, T>(mut f: F) -> Result<T, DispatcherError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < 1 => {
                    attempt += 1;
                    warn!(error = %e, "Redis connect failed, retrying once");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(DispatcherError::Redis(e)),
            }
        }
    }

    /// Right-pop a job id from a list, non-blocking.
    pub async fn rpop(&self, key: &str) -> Result<Option<String>, DispatcherError> {
        let mut conn = self.shared.clone();
        let v: Option<String> = conn.rpop(key, None).await?;
        Ok(v)
    }

    /// Left-push a value onto a list, returning the new length.
    pub async fn lpush(&self, key: &str, value: &str) -> Result<i64, DispatcherError> {
        let mut conn = self.shared.clone();
        let len: i64 = conn.lpush(key, value).await?;
        Ok(len)
    }

    pub async fn llen(&self, key: &str) -> Result<i64, DispatcherError> {
        let mut conn = self.shared.clone();
        let len: i64 = conn.llen(key).await?;
        Ok(len)
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: () = conn.expire(key, seconds).await?;
        Ok(())
    }

    /// Blocking right-pop on the dedicated connection, with a timeout.
    /// Returns `None` on timeout (normal behavior, not an error).
    pub async fn blocking_rpop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DispatcherError> {
        let mut conn = self.blocking.lock().await;
        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(result.map(|(_, v)| v))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, DispatcherError> {
        let mut conn = self.shared.clone();
        let v: Option<String> = conn.get(key).await?;
        Ok(v)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    pub async fn set_ex(&self, key: &str, value: &str, seconds: i64) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: () = conn.set_ex(key, value, seconds as u64).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, DispatcherError> {
        let mut conn = self.shared.clone();
        let v: i64 = conn.incr(key, 1).await?;
        Ok(v)
    }

    /// Set-if-absent (NX), used for exactly-once accounting guards. Returns
    /// `true` if the key was newly set by this call.
    pub async fn set_nx(&self, key: &str, value: &str) -> Result<bool, DispatcherError> {
        let mut conn = self.shared.clone();
        let v: bool = conn.set_nx(key, value).await?;
        Ok(v)
    }

    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        seconds: i64,
    ) -> Result<bool, DispatcherError> {
        let mut conn = self.shared.clone();
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .arg("NX")
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(set)
    }

    /// Add a member to a scored set, used for the retry queues.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    /// Pop up to `limit` members whose score is ≤ `max_score`, removing them
    /// atomically via a pipeline of ZRANGEBYSCORE + ZREM.
    pub async fn zpop_due(
        &self,
        key: &str,
        max_score: f64,
        limit: isize,
    ) -> Result<Vec<String>, DispatcherError> {
        let mut conn = self.shared.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, 0, max_score, 0, limit)
            .await?;
        if members.is_empty() {
            return Ok(members);
        }
        let mut pipe = redis::pipe();
        for m in &members {
            pipe.zrem(key, m).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(members)
    }

    /// Prepend a json event onto a capped list and refresh its TTL.
    pub async fn push_capped(
        &self,
        key: &str,
        value: &str,
        cap: isize,
        ttl_seconds: i64,
    ) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let mut pipe = redis::pipe();
        pipe.lpush(key, value).ignore();
        pipe.ltrim(key, 0, cap - 1).ignore();
        pipe.expire(key, ttl_seconds).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> Result<i64, DispatcherError> {
        let mut conn = self.shared.clone();
        let n: i64 = conn.zcard(key).await?;
        Ok(n)
    }

    /// Read the first `count` elements of a list (head to tail).
    pub async fn lrange(&self, key: &str, count: isize) -> Result<Vec<String>, DispatcherError> {
        let mut conn = self.shared.clone();
        let items: Vec<String> = conn.lrange(key, 0, count - 1).await?;
        Ok(items)
    }

    pub async fn ping(&self) -> Result<(), DispatcherError> {
        let mut conn = self.shared.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn placeholder_requires_live_redis() {
        // KvClient's methods are exercised against a real Redis instance in
        // integration tests; there is nothing meaningful to unit test here
        // without one.
    }
}
