use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::store::{keys, Store};

/// A group's current-speaker lock: who holds the audio turn and until when.
///
/// Lives in the store under `group:current:{g}` with a TTL, so an instance
/// crash can never wedge a channel permanently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerLock {
    #[serde(rename = "fromId")]
    pub from_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

/// Group membership and the per-group speaker lock, all state-of-record in
/// the shared store so every router instance sees the same view.
#[derive(Clone)]
pub struct GroupStore {
    store: Store,
}

impl GroupStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Bidirectional membership update: `group:members:{g}` gains `user` and
    /// `user:groups:{u}` gains `group`, atomically.
    pub async fn add_user(&self, user_id: &str, group_id: &str) -> AppResult<()> {
        let mut conn = self.store.connection();
        let _: () = redis::pipe()
            .atomic()
            .sadd(keys::group_members(group_id), user_id)
            .ignore()
            .sadd(keys::user_groups(user_id), group_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn remove_user(&self, user_id: &str, group_id: &str) -> AppResult<()> {
        let mut conn = self.store.connection();
        let _: () = redis::pipe()
            .atomic()
            .srem(keys::group_members(group_id), user_id)
            .ignore()
            .srem(keys::user_groups(user_id), group_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn members(&self, group_id: &str) -> AppResult<Vec<String>> {
        self.store.set_members(&keys::group_members(group_id)).await
    }

    pub async fn groups_of(&self, user_id: &str) -> AppResult<Vec<String>> {
        self.store.set_members(&keys::user_groups(user_id)).await
    }

    /// Take (or keep) the group's audio turn for `from_id`.
    ///
    /// First successful write wins. The same holder refreshes its TTL; a
    /// different holder gets [`AppError::Busy`] and must not retry.
    pub async fn set_current_speaker(
        &self,
        group_id: &str,
        from_id: &str,
        ttl: Duration,
    ) -> AppResult<SpeakerLock> {
        let now = Utc::now().timestamp_millis();
        let lock = SpeakerLock {
            from_id: from_id.to_string(),
            started_at: now,
            expires_at: now + ttl.as_millis() as i64,
        };
        let encoded = serde_json::to_string(&lock).map_err(|_| AppError::Internal)?;
        let key = keys::group_current(group_id);

        if self.store.set_if_absent(&key, &encoded, ttl).await? {
            debug!(group_id, from_id, "Speaker lock acquired");
            return Ok(lock);
        }

        match self.current_speaker(group_id).await? {
            // Same speaker continuing the turn: keep startedAt, push expiry.
            Some(held) if held.from_id == from_id => {
                let refreshed = SpeakerLock {
                    expires_at: now + ttl.as_millis() as i64,
                    ..held
                };
                let encoded =
                    serde_json::to_string(&refreshed).map_err(|_| AppError::Internal)?;
                let mut conn = self.store.connection();
                let _: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(&encoded)
                    .arg("XX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
                Ok(refreshed)
            }
            Some(_) => Err(AppError::Busy),
            // Lock expired between the failed write and the read; retry once.
            None => {
                if self.store.set_if_absent(&key, &encoded, ttl).await? {
                    Ok(lock)
                } else {
                    Err(AppError::Busy)
                }
            }
        }
    }

    pub async fn current_speaker(&self, group_id: &str) -> AppResult<Option<SpeakerLock>> {
        let raw = self.store.get(&keys::group_current(group_id)).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Unconditional clear, used at turn-end.
    pub async fn clear_current_speaker(&self, group_id: &str) -> AppResult<()> {
        self.store.delete(&keys::group_current(group_id)).await
    }

    /// Targeted clear: releases the lock in every group of `user_id`, but only
    /// where that user is the holder. Used on disconnect and idle timeout.
    pub async fn clear_current_speaker_of(&self, user_id: &str) -> AppResult<()> {
        for group_id in self.groups_of(user_id).await? {
            match self.current_speaker(&group_id).await {
                Ok(Some(lock)) if lock.from_id == user_id => {
                    if let Err(e) = self.clear_current_speaker(&group_id).await {
                        warn!(user_id, group_id = %group_id, error = ?e, "Failed to release speaker lock");
                    } else {
                        debug!(user_id, group_id = %group_id, "Speaker lock released");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(user_id, group_id = %group_id, error = ?e, "Failed to inspect speaker lock");
                }
            }
        }
        Ok(())
    }

    /// Periodic janitor: each cycle scans at most `batch` group member keys
    /// and deletes the membership set and speaker lock of empty groups.
    pub fn spawn_janitor(&self, period: Duration, batch: usize) -> JoinHandle<()> {
        let groups = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = groups.clean_cycle(batch).await {
                    warn!(error = ?e, "Group janitor cycle failed");
                }
            }
        })
    }

    /// Periodic speaker-lock inspection: frees locks whose holder has gone
    /// offline, so a crashed speaker's channel unblocks before the lock TTL
    /// runs out. Unreadable lock state counts as orphan state.
    pub fn spawn_lock_inspector(&self, period: Duration, batch: usize) -> JoinHandle<()> {
        let groups = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = groups.inspect_locks(batch).await {
                    warn!(error = ?e, "Speaker lock inspection failed");
                }
            }
        })
    }

    async fn inspect_locks(&self, batch: usize) -> AppResult<()> {
        let now = Utc::now().timestamp_millis();
        let lock_keys = self
            .store
            .scan_keys(keys::GROUP_CURRENT_PATTERN, batch)
            .await?;

        for lock_key in lock_keys {
            let Some(raw) = self.store.get(&lock_key).await? else {
                continue;
            };
            let Ok(lock) = serde_json::from_str::<SpeakerLock>(&raw) else {
                warn!(key = %lock_key, "Clearing undecodable speaker lock");
                self.store.delete(&lock_key).await?;
                continue;
            };

            let holder_online = self.store.exists(&keys::presence(&lock.from_id)).await?;
            if !holder_online || lock.expires_at <= now {
                info!(
                    key = %lock_key,
                    holder = %lock.from_id,
                    holder_online,
                    "Releasing stale speaker lock"
                );
                self.store.delete(&lock_key).await?;
            }
        }
        Ok(())
    }

    async fn clean_cycle(&self, batch: usize) -> AppResult<()> {
        let keys_found = self
            .store
            .scan_keys(keys::GROUP_MEMBERS_PATTERN, batch)
            .await?;

        let mut removed = 0usize;
        for members_key in &keys_found {
            let Some(group_id) = keys::group_of_members_key(members_key) else {
                continue;
            };
            if self.store.set_size(members_key).await? == 0 {
                self.store.delete(members_key).await?;
                self.store.delete(&keys::group_current(group_id)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                scanned = keys_found.len(),
                removed, "Group janitor removed orphan groups"
            );
        }
        Ok(())
    }
}
