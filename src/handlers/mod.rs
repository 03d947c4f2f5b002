pub mod presence;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// GET / — plain-text landing line with the running version.
pub async fn root() -> (StatusCode, String) {
    (
        StatusCode::OK,
        format!("Welcome to Talkback {}", env!("CARGO_PKG_VERSION")),
    )
}

/// GET /health — liveness probe.
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "talkback-server",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_reports_version() {
        let (status, body) = root().await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("Welcome to Talkback"));
        assert!(body.contains(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, Json(body)) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
