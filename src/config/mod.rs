use std::env;
use std::time::Duration;

/// Process configuration, loaded once at startup from the environment.
///
/// Every knob has an inline default; only `SECRET_KEY` is mandatory, and only
/// when `USE_AUTHENTICATION=true`.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Verify token signatures when true; best-effort claims decode otherwise.
    pub use_authentication: bool,
    pub secret_key: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    /// Group janitor period.
    pub clean_interval: Duration,
    /// Upper bound on groups scanned per janitor cycle.
    pub clean_groups_amount: usize,
    /// Master switch for the presence subsystem.
    pub presence_enabled: bool,
    /// Seconds before an unrefreshed presence key expires.
    pub presence_ttl_secs: u64,
    /// Router-to-client transport ping period.
    pub ping_interval: Duration,
    /// TTL on a group's current-speaker lock.
    pub group_busy_timeout: Duration,
    /// Speaker-lock inspection period.
    pub group_inspect_interval: Duration,
    /// Longest silent gap tolerated inside an active audio turn before the
    /// speaker lock is cleared.
    pub max_idle_duration: Duration,
    /// Maximum length of one audio turn.
    pub max_turn_duration: Duration,
    /// This instance runs the group janitor and the keyspace-event setup.
    pub janitor_leader: bool,
    pub mirror_enabled: bool,
    pub mirror_endpoint: Option<String>,
    pub is_dev: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SECRET_KEY must be set when USE_AUTHENTICATION=true")]
    MissingSecret,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let use_authentication = env_bool("USE_AUTHENTICATION", true);
        let secret_key = env::var("SECRET_KEY").unwrap_or_default();
        if use_authentication && secret_key.is_empty() {
            return Err(ConfigError::MissingSecret);
        }

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env_or("PORT", 3000),
            use_authentication,
            secret_key,
            redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            redis_port: env_or("REDIS_PORT", 6379),
            redis_password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            clean_interval: Duration::from_millis(env_or("REDIS_CLEAN_INTERVAL_MS", 60_000)),
            clean_groups_amount: env_or("REDIS_CLEAN_GROUPS_AMOUNT", 10_000),
            presence_enabled: env_bool("PRESENCE_ENABLED", true),
            presence_ttl_secs: env_or("PRESENCE_TTL_SECS", 120),
            ping_interval: Duration::from_millis(env_or("PING_INTERVAL_MS", 120_000)),
            group_busy_timeout: Duration::from_millis(env_or("GROUP_BUSY_TIMEOUT_MS", 95_000)),
            group_inspect_interval: Duration::from_millis(env_or("GROUP_INSPECT_INTERVAL_MS", 60_000)),
            max_idle_duration: Duration::from_millis(env_or("MESSAGE_MAX_IDLE_MS", 3_000)),
            max_turn_duration: Duration::from_millis(env_or("MESSAGE_MAX_DURATION_MS", 90_000)),
            janitor_leader: env_bool("JANITOR_LEADER", true),
            mirror_enabled: env_bool("MIRROR_ENABLED", false),
            mirror_endpoint: env::var("MIRROR_ENDPOINT").ok().filter(|e| !e.is_empty()),
            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Connection URL for the shared store, with optional password.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => {
                format!("redis://:{}@{}:{}", password, self.redis_host, self.redis_port)
            }
            None => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }
}
