use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Upper bound on one bulk query; larger requests should page.
const MAX_BULK_IDS: usize = 10_000;

/// Pull the `userIds` array out of a request body, rejecting anything that
/// is not an array of non-empty strings.
pub fn parse_user_ids(body: &Value) -> Result<Vec<String>, AppError> {
    let ids = body
        .get("userIds")
        .ok_or_else(|| AppError::Validation("userIds is required".into()))?
        .as_array()
        .ok_or_else(|| AppError::Validation("userIds must be an array".into()))?;

    if ids.len() > MAX_BULK_IDS {
        return Err(AppError::Validation(format!(
            "userIds is limited to {MAX_BULK_IDS} entries"
        )));
    }

    ids.iter()
        .map(|entry| match entry.as_str() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(AppError::Validation(
                "userIds entries must be non-empty strings".into(),
            )),
        })
        .collect()
}

/// POST /api/presence/status — bulk online/offline query.
///
/// Body: `{"userIds": ["A", "B", ...]}`. Malformed JSON is rejected with 400
/// by the extractor; store failures surface as 500.
pub async fn bulk_status(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let user_ids = parse_user_ids(&body)?;

    let users = state.presence.bulk_status(&user_ids).await?;

    Ok(Json(json!({
        "success": true,
        "users": users,
        "timestamp": Utc::now().timestamp_millis(),
    })))
}
