use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use gateway_sdk::coordination::{
    AbortBus, AbortNotice, AbortStream, LeaseStore, SessionDirectory, StoreError,
};
use gateway_sdk::UserSession;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::warn;

const DEFAULT_PREFIX: &str = "gateway";

/// Takes the lease if free and bumps the fencing counter in the same step.
/// Returns the token, or nil while someone else holds the lease.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return redis.call("INCR", KEYS[2])
else
    return nil
end
"#;

/// Deletes the lease only if `owner` still holds it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Coordination backend shared by every gateway replica.
///
/// Keys: `<prefix>:lease:<key>` (owner, `PX` expiry), `<prefix>:fence:<key>`
/// (monotonic fencing counter), `<prefix>:session:<user>` (JSON
/// [`UserSession`]). Aborts are published on `<prefix>:abort:<resource>`.
#[derive(Clone)]
pub struct RedisCoordination {
    client: Client,
    conn: ConnectionManager,
    prefix: String,
}

fn store_err(err: redis::RedisError) -> StoreError {
    StoreError::Store(err.to_string())
}

impl RedisCoordination {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;
        Ok(Self {
            client,
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}:lease:{key}", self.prefix)
    }

    fn fence_key(&self, key: &str) -> String {
        format!("{}:fence:{key}", self.prefix)
    }

    fn session_key(&self, user_id: &str) -> String {
        format!("{}:session:{user_id}", self.prefix)
    }

    fn abort_channel(&self, resource_id: &str) -> String {
        format!("{}:abort:{resource_id}", self.prefix)
    }
}

#[async_trait]
impl LeaseStore for RedisCoordination {
    async fn try_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let token: Option<u64> = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.lease_key(key))
            .key(self.fence_key(key))
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(token)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lease_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl SessionDirectory for RedisCoordination {
    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.session_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Payload(e.to_string()))
        })
        .transpose()
    }

    async fn put_session(&self, session: &UserSession) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload =
            serde_json::to_string(session).map_err(|e| StoreError::Payload(e.to_string()))?;
        let _: () = redis::cmd("SET")
            .arg(self.session_key(&session.user_id))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove_session(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.session_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl AbortBus for RedisCoordination {
    async fn publish_abort(&self, notice: &AbortNotice) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload =
            serde_json::to_string(notice).map_err(|e| StoreError::Payload(e.to_string()))?;
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.abort_channel(&notice.resource_id))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn subscribe_aborts(&self) -> Result<AbortStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub
            .psubscribe(self.abort_channel("*"))
            .await
            .map_err(store_err)?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = msg.get_channel_name(), error = %err, "unreadable abort message");
                        return None;
                    }
                };
                match serde_json::from_str::<AbortNotice>(&payload) {
                    Ok(notice) => Some(notice),
                    Err(err) => {
                        warn!(channel = msg.get_channel_name(), error = %err, "malformed abort notice");
                        None
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}
