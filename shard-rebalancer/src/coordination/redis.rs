//! Redis-backed coordination.
//!
//! Layout, for a group at `<group>` and a gate at `<gate>`:
//! - `<group>` sorted set of node identities scored by last heartbeat (ms,
//!   Redis server time)
//! - `<group>:generation` counter bumped in the same atomic step as every
//!   change to the member set (join, leave, expiry, re-join after expiry)
//! - `<group>:changes` Pub/Sub channel carrying [`ChangeMessage`]s
//! - `<gate>` set of party ids currently inside the barrier
//! - `<gate>:ready` latch set once the expected party count was reached
//!
//! Readers that see the same generation see the same member set. Stale
//! members are only ever removed by `SNAPSHOT_SCRIPT`, which bumps the
//! generation when it removes anything and reads the set in the same script.
//!
//! **Requires Redis 6+** (or a compatible managed service).

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Barrier, CoordinationClient, MemberSnapshot, Membership, CHANGE_CHANNEL_CAPACITY};
use crate::{Error, NodeId};

const HEARTBEAT_INTERVAL_SECS: u64 = 5;
const STALE_THRESHOLD_SECS: u64 = 30;
const CLEANUP_PROBABILITY_PERCENT: u32 = 10;
const BARRIER_POLL_INTERVAL_MS: u64 = 25;
const GATE_TTL_SECS: i64 = 300;
const RECONNECT_DELAY_SECS: u64 = 1;

/// Heartbeat or join. KEYS: group, generation, channel. ARGV: identity,
/// change payload, "1" to bump even when the member was already present.
/// Returns the new generation, or 0 when the member set did not change.
const TOUCH_SCRIPT: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local added = redis.call('ZADD', KEYS[1], now, ARGV[1])
if added == 1 or ARGV[3] == '1' then
  local generation = redis.call('INCR', KEYS[2])
  redis.call('PUBLISH', KEYS[3], ARGV[2])
  return generation
end
return 0
";

/// Expire stale members, then read. KEYS: group, generation, channel.
/// ARGV: stale threshold (ms), expiry payload.
/// Returns `{generation, removed, members}`.
const SNAPSHOT_SCRIPT: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local cutoff = now - tonumber(ARGV[1])
local removed = redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. cutoff)
if removed > 0 then
  redis.call('INCR', KEYS[2])
  redis.call('PUBLISH', KEYS[3], ARGV[2])
end
local generation = tonumber(redis.call('GET', KEYS[2]) or '0')
return {generation, removed, redis.call('ZRANGE', KEYS[1], 0, -1)}
";

/// JSON message format for the change channel
#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct ChangeMessage {
    event: String, // "join", "leave" or "expire"
    instance_id: String,
}

struct Shared {
    url: String,
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    shutdown: CancellationToken,
    touch: redis::Script,
    snapshot: redis::Script,
}

impl Shared {
    fn connection(&self) -> Result<MultiplexedConnection, Error> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::connection(format!("not connected to {}", self.url)))
    }
}

/// Connection to Redis and factory for membership and barrier recipes.
pub struct RedisClient {
    shared: Arc<Shared>,
}

impl RedisClient {
    /// Create a client for `redis_url`. No connection is made until
    /// [`CoordinationClient::connect`].
    pub fn new(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            shared: Arc::new(Shared {
                url: redis_url.to_string(),
                client,
                conn: Mutex::new(None),
                shutdown: CancellationToken::new(),
                touch: redis::Script::new(TOUCH_SCRIPT),
                snapshot: redis::Script::new(SNAPSHOT_SCRIPT),
            }),
        })
    }
}

#[async_trait]
impl CoordinationClient for RedisClient {
    async fn connect(&self) -> Result<(), Error> {
        let conn = self.shared.client.get_multiplexed_async_connection().await?;
        *self.shared.conn.lock() = Some(conn);
        tracing::info!(url = %self.shared.url, "Connected to Redis");
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.shared.shutdown.cancel();
        self.shared.conn.lock().take();
        tracing::info!(url = %self.shared.url, "Closed Redis connection");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        let mut conn = self.shared.connection()?;
        let exists: bool = conn.exists(path).await?;
        Ok(exists)
    }

    fn membership(&self, group_path: &str, identity: &str) -> Arc<dyn Membership> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(RedisMembership {
            shared: self.shared.clone(),
            key: group_path.to_string(),
            identity: identity.to_string(),
            changes,
            cancel_token: self.shared.shutdown.child_token(),
            heartbeat: Mutex::new(None),
            listener_started: Mutex::new(false),
        })
    }

    fn barrier(&self, gate_path: &str, parties: usize) -> Box<dyn Barrier> {
        Box::new(RedisBarrier {
            shared: self.shared.clone(),
            key: gate_path.to_string(),
            parties,
            party_id: Uuid::new_v4().to_string(),
            held: false,
        })
    }
}

/// Group membership kept alive by heartbeats.
///
/// Members that stop heartbeating for 30s are considered gone and are
/// eventually removed by a peer's probabilistic cleanup.
pub struct RedisMembership {
    shared: Arc<Shared>,
    key: String,
    identity: NodeId,
    changes: broadcast::Sender<()>,
    cancel_token: CancellationToken,
    heartbeat: Mutex<Option<CancellationToken>>,
    listener_started: Mutex<bool>,
}

impl Drop for RedisMembership {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        tracing::debug!(
            identity = %self.identity,
            "RedisMembership dropped (leave should be called explicitly)"
        );
    }
}

impl RedisMembership {
    fn keys(&self) -> GroupKeys {
        GroupKeys::new(&self.key)
    }

    fn spawn_heartbeat_task(&self, cancel_token: CancellationToken) {
        let shared = self.shared.clone();
        let keys = self.keys();
        let identity = self.identity.clone();

        tokio::spawn(async move {
            let mut heartbeat_interval =
                tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Heartbeat task shutting down");
                        break;
                    }

                    _ = heartbeat_interval.tick() => {
                        let result = async {
                            if let Some(generation) = touch(&shared, &keys, &identity, false).await? {
                                tracing::warn!(
                                    identity = %identity,
                                    generation,
                                    "Heartbeat re-joined group after expiry"
                                );
                            }

                            // Probabilistic cleanup (10% chance)
                            if rand::random::<u32>() % 100 < CLEANUP_PROBABILITY_PERCENT {
                                snapshot(&shared, &keys).await?;
                            }
                            Ok::<_, Error>(())
                        }
                        .await;

                        if let Err(e) = result {
                            consecutive_failures += 1;
                            let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                            tracing::error!(
                                failures = consecutive_failures,
                                backoff_ms,
                                "Heartbeat failed: {}, backing off",
                                e
                            );
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                            }
                            continue;
                        }
                        consecutive_failures = 0;
                    }
                }
            }
        });
    }

    fn spawn_listener_task(&self) {
        let shared = self.shared.clone();
        let channel = self.keys().channel;
        let changes = self.changes.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let conn = match shared.client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("Failed to get Pub/Sub connection: {}", e);
                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => continue,
                        }
                    }
                };

                if let Err(e) = Self::run_listener_loop(conn, &channel, &cancel_token, &changes).await
                {
                    if !cancel_token.is_cancelled() {
                        tracing::warn!("Pub/Sub loop error, reconnecting: {}", e);
                        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    }
                }
            }
            tracing::debug!("Pub/Sub task shutting down");
        });
    }

    async fn run_listener_loop(
        mut pubsub: PubSub,
        channel: &str,
        cancel_token: &CancellationToken,
        changes: &broadcast::Sender<()>,
    ) -> Result<(), Error> {
        pubsub.subscribe(channel).await?;
        tracing::debug!("Subscribed to {}", channel);

        // Anything published while we were not subscribed is lost
        let _ = changes.send(());

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::warn!("Failed to get Pub/Sub payload: {}", e);
                                    continue;
                                }
                            };

                            match serde_json::from_str::<ChangeMessage>(&payload) {
                                Ok(parsed) => tracing::debug!(
                                    event = %parsed.event,
                                    instance_id = %parsed.instance_id,
                                    "Membership changed (via Pub/Sub)"
                                ),
                                Err(e) => tracing::warn!("Failed to parse Pub/Sub message: {}", e),
                            }

                            // Any message is a trigger, even one we could not parse
                            let _ = changes.send(());
                        }
                        None => {
                            return Err(Error::connection("Pub/Sub stream ended"));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Membership for RedisMembership {
    async fn join(&self) -> Result<(), Error> {
        let generation = touch(&self.shared, &self.keys(), &self.identity, true)
            .await?
            .unwrap_or_default();

        let heartbeat_token = self.cancel_token.child_token();
        if let Some(previous) = self.heartbeat.lock().replace(heartbeat_token.clone()) {
            previous.cancel();
        }
        self.spawn_heartbeat_task(heartbeat_token);

        tracing::info!(identity = %self.identity, generation, "Joined group in Redis");
        Ok(())
    }

    async fn leave(&self) -> Result<(), Error> {
        // Stop heartbeating first so we do not re-add ourselves
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.cancel();
        }

        let keys = self.keys();
        let mut conn = self.shared.connection()?;

        // ZREM and INCR in one transaction so no reader sees the smaller set
        // under the old generation
        let (removed, generation): (i64, u64) = redis::pipe()
            .atomic()
            .zrem(&keys.group, &self.identity)
            .incr(&keys.generation, 1)
            .query_async(&mut conn)
            .await?;

        if removed > 0 {
            let payload = change_payload("leave", &self.identity)?;
            conn.publish::<_, _, ()>(&keys.channel, payload).await?;
        }

        tracing::info!(identity = %self.identity, generation, "Left group in Redis");
        Ok(())
    }

    async fn members(&self) -> Result<MemberSnapshot, Error> {
        snapshot(&self.shared, &self.keys()).await
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        let receiver = self.changes.subscribe();
        let mut started = self.listener_started.lock();
        if !*started {
            *started = true;
            self.spawn_listener_task();
        }
        receiver
    }
}

/// Key names derived from a group path.
#[derive(Clone)]
struct GroupKeys {
    group: String,
    generation: String,
    channel: String,
}

impl GroupKeys {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            generation: format!("{}:generation", group),
            channel: format!("{}:changes", group),
        }
    }
}

fn change_payload(event: &str, instance_id: &str) -> Result<String, Error> {
    let msg = ChangeMessage {
        event: event.to_string(),
        instance_id: instance_id.to_string(),
    };
    serde_json::to_string(&msg).map_err(|e| Error::Config(e.to_string()))
}

/// Add or refresh `identity`. Returns the new generation when the member set
/// changed (or `force` is set), `None` for a plain heartbeat.
async fn touch(
    shared: &Shared,
    keys: &GroupKeys,
    identity: &str,
    force: bool,
) -> Result<Option<u64>, Error> {
    let mut conn = shared.connection()?;
    let generation: u64 = shared
        .touch
        .key(&keys.group)
        .key(&keys.generation)
        .key(&keys.channel)
        .arg(identity)
        .arg(change_payload("join", identity)?)
        .arg(if force { "1" } else { "0" })
        .invoke_async(&mut conn)
        .await?;

    Ok((generation > 0).then_some(generation))
}

/// Expire stale members and read the group in one atomic step.
async fn snapshot(shared: &Shared, keys: &GroupKeys) -> Result<MemberSnapshot, Error> {
    let mut conn = shared.connection()?;
    let (generation, removed, members): (u64, u64, Vec<String>) = shared
        .snapshot
        .key(&keys.group)
        .key(&keys.generation)
        .key(&keys.channel)
        .arg(STALE_THRESHOLD_SECS * 1000)
        .arg(change_payload("expire", "")?)
        .invoke_async(&mut conn)
        .await?;

    if removed > 0 {
        tracing::info!(count = removed, generation, "Cleaned up stale members from Redis");
    }

    Ok(MemberSnapshot {
        generation,
        members,
    })
}

/// Counted barrier over a Redis set.
///
/// Parties add themselves to the gate set and poll its cardinality. The
/// first party to see the expected count sets the ready latch, so parties
/// that poll after an early leaver has already left are released too.
pub struct RedisBarrier {
    shared: Arc<Shared>,
    key: String,
    parties: usize,
    party_id: String,
    held: bool,
}

impl RedisBarrier {
    fn ready_key(&self) -> String {
        format!("{}:ready", self.key)
    }

    async fn try_enter(&mut self) -> Result<(), Error> {
        let mut conn = self.shared.connection()?;

        self.held = true;
        redis::pipe()
            .atomic()
            .sadd(&self.key, &self.party_id)
            .ignore()
            .expire(&self.key, GATE_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        loop {
            let (count, ready): (usize, bool) = redis::pipe()
                .scard(&self.key)
                .exists(self.ready_key())
                .query_async(&mut conn)
                .await?;

            if ready || count >= self.parties {
                redis::cmd("SET")
                    .arg(self.ready_key())
                    .arg(1)
                    .arg("EX")
                    .arg(GATE_TTL_SECS)
                    .query_async::<()>(&mut conn)
                    .await?;
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(BARRIER_POLL_INTERVAL_MS)).await;
        }
    }
}

#[async_trait]
impl Barrier for RedisBarrier {
    async fn enter(&mut self) -> Result<(), Error> {
        let gate = self.key.clone();
        self.try_enter()
            .await
            .map_err(|e| Error::barrier(format!("entering {}: {}", gate, e)))
    }

    async fn leave(&mut self) -> Result<(), Error> {
        if !self.held {
            return Ok(());
        }
        let mut conn = self
            .shared
            .connection()
            .map_err(|e| Error::barrier(format!("leaving {}: {}", self.key, e)))?;
        conn.srem::<_, _, ()>(&self.key, &self.party_id)
            .await
            .map_err(|e| Error::barrier(format!("leaving {}: {}", self.key, e)))?;
        self.held = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn get_redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    /// Unique group path to isolate test data
    fn test_root() -> String {
        format!("/test-{}", Uuid::new_v4())
    }

    async fn connected_client() -> RedisClient {
        let client = RedisClient::new(&get_redis_url()).unwrap();
        client.connect().await.unwrap();
        client
    }

    #[test]
    fn test_change_message_format() {
        let msg = ChangeMessage {
            event: "join".to_string(),
            instance_id: "h:1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"event":"join","instance_id":"h:1"}"#);
    }

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let client = RedisClient::new(&get_redis_url()).unwrap();
        assert!(matches!(client.exists("/").await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_membership_join_leave() {
        let client = connected_client().await;
        let path = format!("{}/party", test_root());

        let a = client.membership(&path, "a:1");
        let b = client.membership(&path, "b:2");
        a.join().await.unwrap();
        b.join().await.unwrap();

        let snapshot = a.members().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.generation, 2);

        b.leave().await.unwrap();
        let snapshot = a.members().await.unwrap();
        assert_eq!(snapshot.members, vec!["a:1".to_string()]);
        assert_eq!(snapshot.generation, 3);

        a.leave().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_expiry_and_rejoin_bump_generation() {
        let client = connected_client().await;
        let path = format!("{}/party", test_root());
        let keys = GroupKeys::new(&path);

        let a = client.membership(&path, "a:1");
        a.join().await.unwrap();
        // No heartbeat task for b, so only this test refreshes it
        assert_eq!(touch(&client.shared, &keys, "b:2", true).await.unwrap(), Some(2));

        // Age b's heartbeat past the stale threshold
        let mut conn = client.shared.connection().unwrap();
        conn.zadd::<_, _, _, ()>(&keys.group, "b:2", 0).await.unwrap();

        let expired = a.members().await.unwrap();
        assert_eq!(expired.members, vec!["a:1".to_string()]);
        assert_eq!(expired.generation, 3, "Expiry must bump the generation");

        // Any later reader of generation 3 sees the same set
        assert_eq!(a.members().await.unwrap(), expired);

        // A heartbeat after expiry is a re-join, not a silent re-add
        assert_eq!(touch(&client.shared, &keys, "b:2", false).await.unwrap(), Some(4));
        let rejoined = a.members().await.unwrap();
        assert_eq!(rejoined.generation, 4);
        assert_eq!(rejoined.len(), 2);

        // A plain heartbeat leaves the generation alone
        assert_eq!(touch(&client.shared, &keys, "b:2", false).await.unwrap(), None);
        assert_eq!(a.members().await.unwrap().generation, 4);

        a.leave().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_subscribe_sees_join() {
        let client = connected_client().await;
        let path = format!("{}/party", test_root());

        let watcher = client.membership(&path, "w:1");
        let mut rx = watcher.subscribe();

        // Resync trigger once the subscription is live
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timeout waiting for subscription")
            .unwrap();

        let joiner = client.membership(&path, "j:1");
        joiner.join().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timeout waiting for join event")
            .unwrap();

        joiner.leave().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_barrier_two_parties() {
        let client = connected_client().await;
        let gate = format!("{}/gate/1", test_root());

        let mut first = client.barrier(&gate, 2);
        let mut second = client.barrier(&gate, 2);

        let waiter = tokio::spawn(async move {
            first.enter().await.unwrap();
            first
        });
        second.enter().await.unwrap();

        let mut first = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("first party should be released")
            .unwrap();

        first.leave().await.unwrap();
        second.leave().await.unwrap();
        second.leave().await.unwrap();

        client.close().await.unwrap();
    }
}
