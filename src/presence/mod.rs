use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::mirror::StatusMirror;
use crate::store::{keys, Store, StoreEvent};

/// Transition message published on the presence channels, and the payload of
/// `PRESENCE_UPDATE` frames sent to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: String,
    pub timestamp: i64,
    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl PresenceUpdate {
    fn new(user_id: &str, status: &str, now: i64) -> Self {
        Self {
            kind: "presence_update".to_string(),
            user_id: user_id.to_string(),
            status: status.to_string(),
            timestamp: now,
            last_seen: Some(now),
            device_id: None,
        }
    }
}

/// One row of a bulk status reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStatus {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub users: Vec<UserStatus>,
    #[serde(rename = "totalOnline")]
    pub total_online: usize,
    pub timestamp: i64,
}

/// Cap on one snapshot enumeration; a deployment with more simultaneous
/// online users than this needs paging, not a bigger scan.
const SNAPSHOT_SCAN_LIMIT: usize = 100_000;

/// Online/offline state of record, held in the store.
///
/// A user is online iff `presence:user:{id}` exists; the key's TTL is the
/// liveness contract and its expiry (observed via keyspace events) is the
/// only path that turns a silent client offline. Metadata survives offline
/// transitions so `lastSeen` stays queryable.
///
/// Every mutating operation here degrades to a logged no-op on store failure:
/// presence must never take down PTT routing.
#[derive(Clone)]
pub struct PresenceManager {
    store: Store,
    mirror: StatusMirror,
    ttl_secs: u64,
    enabled: bool,
}

impl PresenceManager {
    pub fn new(store: Store, mirror: StatusMirror, ttl_secs: u64, enabled: bool) -> Self {
        Self {
            store,
            mirror,
            ttl_secs,
            enabled,
        }
    }

    /// Mark `user_id` online: indicator key with TTL plus metadata, written
    /// atomically; the transition is published only after the write acks.
    pub async fn set_user_online(&self, user_id: &str, device_id: &str, role: &str) {
        if !self.enabled {
            return;
        }
        let now = Utc::now().timestamp_millis();

        let mut conn = self.store.connection();
        let written: AppResult<()> = redis::pipe()
            .atomic()
            .set_ex(keys::presence(user_id), "1", self.ttl_secs)
            .ignore()
            .hset_multiple(
                keys::presence_meta(user_id),
                &[
                    ("status", "online".to_string()),
                    ("lastSeen", now.to_string()),
                    ("deviceId", device_id.to_string()),
                    ("role", role.to_string()),
                ],
            )
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(AppError::from);

        if let Err(e) = written {
            warn!(user_id, error = ?e, "Failed to write online presence");
            return;
        }

        let mut update = PresenceUpdate::new(user_id, "online", now);
        update.device_id = Some(device_id.to_string());
        self.publish_transition(keys::CH_PRESENCE_ONLINE, &update).await;

        debug!(user_id, device_id, role, "User online");
    }

    /// Extend the TTL on the online indicator and advance `lastSeen`.
    ///
    /// Publishes nothing (the state did not change) and never resurrects an
    /// already-expired key; a dead session must go through a full
    /// `set_user_online` to come back.
    pub async fn refresh_heartbeat(&self, user_id: &str) {
        if !self.enabled {
            return;
        }

        match self
            .store
            .refresh_if_present(&keys::presence(user_id), "1", self.ttl_secs)
            .await
        {
            Ok(true) => {
                let now = Utc::now().timestamp_millis();
                if let Err(e) = self
                    .store
                    .hash_set(
                        &keys::presence_meta(user_id),
                        &[("lastSeen", now.to_string())],
                    )
                    .await
                {
                    warn!(user_id, error = ?e, "Failed to update lastSeen on heartbeat");
                }
            }
            Ok(false) => {
                // Key already expired; heartbeat degrades to a no-op.
                debug!(user_id, "Heartbeat for expired presence ignored");
            }
            Err(e) => {
                warn!(user_id, error = ?e, "Failed to refresh presence TTL");
            }
        }
    }

    /// Mark `user_id` offline, keeping metadata. Idempotent: repeating the
    /// call reaches the same terminal state and may emit a duplicate event,
    /// which subscribers treat as a no-op.
    pub async fn set_user_offline(&self, user_id: &str) {
        if !self.enabled {
            return;
        }
        let now = Utc::now().timestamp_millis();

        let mut conn = self.store.connection();
        let written: AppResult<()> = redis::pipe()
            .atomic()
            .del(keys::presence(user_id))
            .ignore()
            .hset_multiple(
                keys::presence_meta(user_id),
                &[
                    ("status", "offline".to_string()),
                    ("lastSeen", now.to_string()),
                ],
            )
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(AppError::from);

        if let Err(e) = written {
            warn!(user_id, error = ?e, "Failed to write offline presence");
            return;
        }

        let update = PresenceUpdate::new(user_id, "offline", now);
        self.publish_transition(keys::CH_PRESENCE_OFFLINE, &update).await;

        debug!(user_id, "User offline");
    }

    async fn publish_transition(&self, channel: &str, update: &PresenceUpdate) {
        let Ok(payload) = serde_json::to_string(update) else {
            warn!(user_id = %update.user_id, "Failed to serialize presence update");
            return;
        };

        for ch in [channel, keys::CH_PRESENCE_UPDATES] {
            if let Err(e) = self.store.publish(ch, &payload).await {
                warn!(user_id = %update.user_id, channel = ch, error = ?e, "Failed to publish presence transition");
            }
        }

        self.mirror
            .submit(serde_json::to_value(update).unwrap_or_default());
    }

    /// Status of each requested user, derived in one atomic batch of
    /// existence checks and metadata reads.
    pub async fn bulk_status(&self, user_ids: &[String]) -> AppResult<Vec<UserStatus>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for user_id in user_ids {
            pipe.exists(keys::presence(user_id));
            pipe.hgetall(keys::presence_meta(user_id));
        }

        let mut conn = self.store.connection();
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        if raw.len() != user_ids.len() * 2 {
            return Err(AppError::Internal);
        }

        let mut users = Vec::with_capacity(user_ids.len());
        for (i, user_id) in user_ids.iter().enumerate() {
            let exists: bool = redis::from_redis_value(&raw[i * 2])?;
            let meta: std::collections::HashMap<String, String> =
                redis::from_redis_value(&raw[i * 2 + 1])?;
            users.push(derive_status(user_id, exists, &meta));
        }
        Ok(users)
    }

    /// Enumerate every currently-online user and bulk their metadata.
    pub async fn snapshot(&self) -> AppResult<PresenceSnapshot> {
        let online_keys = self
            .store
            .scan_keys(keys::PRESENCE_PATTERN, SNAPSHOT_SCAN_LIMIT)
            .await?;

        let user_ids: Vec<String> = online_keys
            .iter()
            .filter_map(|k| keys::user_of_presence_key(k))
            .map(str::to_string)
            .collect();

        let users = self.bulk_status(&user_ids).await?;
        let total_online = users.iter().filter(|u| u.status == "online").count();

        Ok(PresenceSnapshot {
            users,
            total_online,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Consume store events and turn expired `presence:user:*` keys into
    /// offline transitions. This is the sole mechanism that takes a silent
    /// client offline.
    pub fn spawn_expiry_listener(
        &self,
        mut events: broadcast::Receiver<StoreEvent>,
    ) -> JoinHandle<()> {
        let presence = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.channel == keys::CH_KEY_EXPIRED => {
                        if let Some(user_id) = keys::user_of_presence_key(&event.payload) {
                            info!(user_id, "Presence TTL expired; marking offline");
                            presence.set_user_offline(user_id).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Expiry listener lagged behind store events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Bulk-status derivation table: the indicator key decides online/offline,
/// the metadata supplies `lastSeen` (0 for a never-seen user).
fn derive_status(
    user_id: &str,
    exists: bool,
    meta: &std::collections::HashMap<String, String>,
) -> UserStatus {
    let last_seen = meta
        .get("lastSeen")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let device_id = meta.get("deviceId").cloned().filter(|d| !d.is_empty());

    UserStatus {
        user_id: user_id.to_string(),
        status: if exists { "online" } else { "offline" }.to_string(),
        last_seen,
        device_id,
    }
}

/// Parse a presence channel payload back into a [`PresenceUpdate`]. Foreign
/// or malformed messages yield `None` and are skipped by subscribers.
pub fn parse_update(payload: &str) -> Option<PresenceUpdate> {
    serde_json::from_str(payload).ok()
}
