use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::{AtomicStore, LockError};

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed [`AtomicStore`]. The connection manager reconnects on its
/// own; a command that fails while disconnected surfaces as an error.
pub struct RedisStore {
    conn: ConnectionManager,
    delete_if_equals: Script,
    expire_if_equals: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis lock store");
        Ok(Self {
            conn,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockBackend, SharedLockBackend};
    use std::sync::Arc;

    /// Live tests run against `REDIS_URL` (default: a local server).
    async fn connect_test_store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::connect(&url).await.unwrap()
    }

    fn unique_key(name: &str) -> String {
        format!("auth-coordinator-test:{name}:{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn test_ttl_rounds_up_to_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        assert!(RedisStore::connect("not a url").await.is_err());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_set_if_absent_honours_existing_key_and_ttl() {
        let store = connect_test_store().await;
        let key = unique_key("nx");

        assert!(store.set_if_absent(&key, "a", Duration::from_millis(200)).await.unwrap());
        assert!(!store.set_if_absent(&key, "b", Duration::from_millis(200)).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.set_if_absent(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(store.delete_if_equals(&key, "b").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_compare_scripts_only_touch_own_value() {
        let store = connect_test_store().await;
        let key = unique_key("cas");
        store.set_if_absent(&key, "a", Duration::from_millis(300)).await.unwrap();

        assert!(!store.delete_if_equals(&key, "b").await.unwrap());
        assert!(!store.expire_if_equals(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(store.expire_if_equals(&key, "a", Duration::from_secs(5)).await.unwrap());

        // Outlives the original 300ms only because of the extension
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("a"));

        assert!(store.delete_if_equals(&key, "a").await.unwrap());
        assert!(!store.delete_if_equals(&key, "a").await.unwrap());
        assert!(!store.expire_if_equals(&key, "a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_shared_backend_over_redis() {
        let backend = SharedLockBackend::new(Arc::new(connect_test_store().await));
        let key = unique_key("refresh-cycle");
        let ttl = Duration::from_secs(5);

        assert!(backend.acquire(&key, ttl, "instance-a").await.unwrap());
        assert!(!backend.acquire(&key, ttl, "instance-b").await.unwrap());
        assert_eq!(backend.is_locked(&key).await.unwrap().as_deref(), Some("instance-a"));
        assert!(!backend.release(&key, "instance-b").await.unwrap());
        assert!(backend.release(&key, "instance-a").await.unwrap());
        assert!(backend.is_locked(&key).await.unwrap().is_none());
    }
}
