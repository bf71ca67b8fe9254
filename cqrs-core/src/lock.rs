//! A distributed lock abstraction (C11), used by a [`crate::store::state_store::StateStore`]
//! to guard its optimistic read-modify-write cycle when multiple processes
//! may write the same aggregate concurrently.
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::{new_id, Error, ErrorCode, Result};

/// A held lock. Holding this value is the only proof of ownership; callers
/// must pass it back to [`DistributedLock::unlock`] to release it.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A mutual-exclusion lock keyed by an arbitrary string, with a mandatory
/// expiry so a crashed holder cannot wedge the key forever.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire the lock for `key`, expiring automatically after
    /// `ttl`. Returns `None` if already held by someone else.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>>;

    /// Releases a previously-acquired lock. A no-op if the handle's token no
    /// longer matches the stored one (already expired and re-acquired).
    async fn unlock(&self, handle: LockHandle) -> Result<()>;

    /// Extends a held lock's expiry by `ttl` from now. Returns `false` if the
    /// handle's token no longer matches (lock already expired).
    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool>;
}

/// An in-process, `DashMap`-backed lock. Useful for single-process
/// deployments and tests; provides no cross-process guarantee.
#[derive(Default)]
pub struct InMemoryLock {
    held: DashMap<String, (String, Instant)>,
}

impl InMemoryLock {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let now = Instant::now();
        let token = new_id();

        // `entry` holds the shard lock across the read-and-maybe-write, so a
        // concurrent `try_lock` on the same key cannot observe the gap
        // between "is it expired" and "claim it".
        let mut acquired = false;
        self.held
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.1 <= now {
                    *existing = (token.clone(), now + ttl);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                (token.clone(), now + ttl)
            });

        Ok(acquired.then(|| LockHandle {
            key: key.to_string(),
            token,
        }))
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        self.held.remove_if(&handle.key, |_, (tok, _)| *tok == handle.token);
        Ok(())
    }

    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.held.get_mut(&handle.key) {
            Some(mut entry) if entry.0 == handle.token => {
                entry.1 = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A `redis`-backed lock (behind the `redis-storage` feature), using
/// `SET key token NX PX ttl` to acquire and a Lua script to release/extend
/// only when the caller still holds the token — preventing a slow holder
/// from releasing a lock someone else has since acquired.
#[cfg(feature = "redis-storage")]
pub mod redis_lock {
    use super::{DistributedLock, Duration, LockHandle, Result};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Script};

    use crate::error::{new_id, Error, ErrorCode};

    const RELEASE_SCRIPT: &str = r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
    ";

    const EXTEND_SCRIPT: &str = r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        else
            return 0
        end
    ";

    fn lock_err(e: impl std::fmt::Display) -> Error {
        Error::new(ErrorCode::StateStoreError, e.to_string())
    }

    /// A lock backed by a Redis connection manager.
    pub struct RedisLock {
        conn: ConnectionManager,
    }

    impl RedisLock {
        /// Creates a lock over an established Redis connection manager.
        #[must_use]
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }
    }

    #[async_trait]
    impl DistributedLock for RedisLock {
        async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
            let token = new_id();
            let mut conn = self.conn.clone();
            let set: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(lock_err)?;

            Ok(set.is_some().then(|| LockHandle {
                key: key.to_string(),
                token,
            }))
        }

        async fn unlock(&self, handle: LockHandle) -> Result<()> {
            let mut conn = self.conn.clone();
            Script::new(RELEASE_SCRIPT)
                .key(handle.key())
                .arg(&handle.token)
                .invoke_async::<i64>(&mut conn)
                .await
                .map_err(lock_err)?;
            Ok(())
        }

        async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn.clone();
            let extended: i64 = Script::new(EXTEND_SCRIPT)
                .key(handle.key())
                .arg(&handle.token)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(lock_err)?;
            Ok(extended == 1)
        }
    }

    // Keep `AsyncCommands` in scope for the `SET`/future extensions above.
    #[allow(unused_imports)]
    use AsyncCommands as _;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_rejects_second_holder_until_released() {
        let lock = InMemoryLock::new();
        let handle = lock.try_lock("agg-1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(lock.try_lock("agg-1", Duration::from_secs(30)).await.unwrap().is_none());

        lock.unlock(handle).await.unwrap();
        assert!(lock.try_lock("agg-1", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let lock = InMemoryLock::new();
        let _handle = lock.try_lock("agg-1", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.try_lock("agg-1", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn extend_fails_for_stale_handle() {
        let lock = InMemoryLock::new();
        let handle = lock.try_lock("agg-1", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // someone else re-acquires after expiry
        let _new_holder = lock.try_lock("agg-1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(!lock.extend(&handle, Duration::from_secs(30)).await.unwrap());
    }
}
