//! Central naming of every shared-store key and pub/sub channel.
//!
//! All key construction goes through these functions so the layout is
//! greppable in one place.

/// Existence-tracked online indicator; carries the presence TTL.
pub fn presence(user_id: &str) -> String {
    format!("presence:user:{user_id}")
}

/// Persistent presence metadata (`status`, `lastSeen`, `deviceId`, `role`).
/// No TTL, so `lastSeen` stays queryable after the user goes offline.
pub fn presence_meta(user_id: &str) -> String {
    format!("presence:meta:{user_id}")
}

pub fn group_members(group_id: &str) -> String {
    format!("group:members:{group_id}")
}

/// Current-speaker lock for a group; holds the speaker's user id, TTL-bound.
pub fn group_current(group_id: &str) -> String {
    format!("group:current:{group_id}")
}

pub fn user_groups(user_id: &str) -> String {
    format!("user:groups:{user_id}")
}

pub const PRESENCE_PREFIX: &str = "presence:user:";
pub const GROUP_MEMBERS_PATTERN: &str = "group:members:*";
pub const GROUP_CURRENT_PATTERN: &str = "group:current:*";
pub const PRESENCE_PATTERN: &str = "presence:user:*";

// ── Pub/sub channels ─────────────────────────────────────────────────────────

pub const CH_PRESENCE_ONLINE: &str = "presence:online";
pub const CH_PRESENCE_OFFLINE: &str = "presence:offline";
pub const CH_PRESENCE_UPDATES: &str = "presence:updates";
/// Keyspace-event channel for expired keys in DB 0; requires
/// `notify-keyspace-events Ex` on the store.
pub const CH_KEY_EXPIRED: &str = "__keyevent@0__:expired";

/// Extract the user id from a `presence:user:{id}` key. Returns `None` for
/// unrelated keys.
pub fn user_of_presence_key(key: &str) -> Option<&str> {
    key.strip_prefix(PRESENCE_PREFIX).filter(|id| !id.is_empty())
}

/// Extract the group id from a `group:members:{g}` key.
pub fn group_of_members_key(key: &str) -> Option<&str> {
    key.strip_prefix("group:members:").filter(|g| !g.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(presence("A"), "presence:user:A");
        assert_eq!(presence_meta("A"), "presence:meta:A");
        assert_eq!(group_members("G"), "group:members:G");
        assert_eq!(group_current("G"), "group:current:G");
        assert_eq!(user_groups("A"), "user:groups:A");
    }

    #[test]
    fn keys_embed_ids_verbatim() {
        let id = "TELENET_81*14946*0011";
        assert_eq!(presence(id), format!("presence:user:{id}"));
    }

    #[test]
    fn presence_key_parses_back_to_user() {
        assert_eq!(user_of_presence_key("presence:user:alice"), Some("alice"));
        assert_eq!(user_of_presence_key("presence:meta:alice"), None);
        assert_eq!(user_of_presence_key("presence:user:"), None);
        assert_eq!(user_of_presence_key("group:members:g"), None);
    }

    #[test]
    fn members_key_parses_back_to_group() {
        assert_eq!(group_of_members_key("group:members:dispatch"), Some("dispatch"));
        assert_eq!(group_of_members_key("group:current:dispatch"), None);
    }
}
