use serde_json::Value;
use tracing::{debug, warn};

/// Fire-and-forget propagation of presence transitions to an external user
/// record store.
///
/// Every error is logged and swallowed; the mirror must never block or fail
/// a presence operation. When unconfigured, [`StatusMirror::submit`] is a
/// no-op.
#[derive(Clone)]
pub struct StatusMirror {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl StatusMirror {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Submit one transition asynchronously. Returns immediately; the POST
    /// runs on its own task.
    pub fn submit(&self, update: Value) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            match client.post(&endpoint).json(&update).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(user_id = %update["userId"], "Status mirrored");
                }
                Ok(response) => {
                    warn!(
                        status = %response.status(),
                        user_id = %update["userId"],
                        "Status mirror rejected update"
                    );
                }
                Err(e) => {
                    warn!(error = ?e, user_id = %update["userId"], "Status mirror unreachable");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_mirror_accepts_updates_without_spawning() {
        let mirror = StatusMirror::disabled();
        assert!(!mirror.is_enabled());
        mirror.submit(serde_json::json!({ "userId": "A", "status": "online" }));
    }

    #[test]
    fn configured_mirror_reports_enabled() {
        let mirror = StatusMirror::new(Some("http://localhost:9/users".into()));
        assert!(mirror.is_enabled());
    }
}
