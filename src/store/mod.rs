pub mod keys;

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AppResult;

/// One pub/sub message received from the store, fanned out to every
/// in-process subscriber over a broadcast channel.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub channel: String,
    pub payload: String,
}

const EVENT_BUFFER: usize = 1024;
const RECONNECT_FLOOR: Duration = Duration::from_millis(500);
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// Client for the external in-memory key/value store.
///
/// Holds two disjoint connection paths: an auto-reconnecting command
/// connection (reads, writes, publishes) and a subscribe connection owned by
/// the task spawned in [`Store::spawn_subscriber`]. The
/// store protocol forbids mixing commands onto a subscribed connection, so
/// the two are never swapped.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    commands: ConnectionManager,
    events: broadcast::Sender<StoreEvent>,
}

impl Store {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let commands = client.get_connection_manager().await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        info!("Connected to store at {url}");
        Ok(Self {
            client,
            commands,
            events,
        })
    }

    /// A fresh handle onto the auto-reconnecting command connection.
    pub fn connection(&self) -> ConnectionManager {
        self.commands.clone()
    }

    /// Receiver of every pub/sub message the subscriber task picks up.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Ask the store to publish expired-key events on DB 0.
    ///
    /// On failure the expiry-driven offline path is disabled; the caller logs
    /// and continues (best effort).
    pub async fn enable_keyspace_events(&self) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await?;
        info!("Keyspace expiry notifications enabled");
        Ok(())
    }

    /// Spawn the subscribe-connection task: subscribes to the given channels,
    /// forwards every message as a [`StoreEvent`], and re-subscribes after
    /// connection loss with jittered exponential backoff.
    pub fn spawn_subscriber(&self, channels: Vec<String>) -> JoinHandle<()> {
        let client = self.client.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut backoff = RECONNECT_FLOOR;
            loop {
                match subscribe_loop(&client, &channels, &events).await {
                    Ok(()) => {
                        // Stream ended: the connection dropped cleanly.
                        warn!("Store subscription closed; reconnecting");
                        backoff = RECONNECT_FLOOR;
                    }
                    Err(e) => {
                        warn!(error = ?e, "Store subscription failed; reconnecting");
                    }
                }

                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(RECONNECT_CEILING);
            }
        })
    }

    // ── Command surface ──────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.connection();
        Ok(conn.get(key).await?)
    }

    pub async fn set_with_expiry(&self, key: &str, value: &str, seconds: u64) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    /// `SET key value NX PX millis`: write only if the key does not exist.
    /// Returns `true` when this call took the key.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// `SET key value XX EX seconds`: refresh only if the key still exists.
    /// Returns `false` (a no-op) when the key has already expired.
    pub async fn refresh_if_present(&self, key: &str, value: &str, seconds: u64) -> AppResult<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.connection();
        Ok(conn.exists(key).await?)
    }

    pub async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut conn = self.connection();
        Ok(conn.hgetall(key).await?)
    }

    pub async fn set_add(&self, key: &str, member: &str) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> AppResult<Vec<String>> {
        let mut conn = self.connection();
        Ok(conn.smembers(key).await?)
    }

    pub async fn set_size(&self, key: &str) -> AppResult<u64> {
        let mut conn = self.connection();
        Ok(conn.scard(key).await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let mut conn = self.connection();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Collect keys matching `pattern`, stopping after `limit` results so one
    /// caller cannot hold the scan cursor forever on a large keyspace.
    pub async fn scan_keys(&self, pattern: &str, limit: usize) -> AppResult<Vec<String>> {
        let mut conn = self.connection();
        let mut found = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            found.push(key);
            if found.len() >= limit {
                break;
            }
        }
        Ok(found)
    }
}

async fn subscribe_loop(
    client: &redis::Client,
    channels: &[String],
    events: &broadcast::Sender<StoreEvent>,
) -> AppResult<()> {
    use futures::StreamExt;

    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    info!(?channels, "Store subscription established");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().unwrap_or_default();
        // Send fails only when no receiver is alive, which is fine.
        let _ = events.send(StoreEvent { channel, payload });
    }

    Ok(())
}
