use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde_json::Value;

use crate::AppState;
use crate::store::models::timestamp_millis;

/// Active announcements inside their display window, highest priority first.
/// Store errors degrade to an empty list.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let now = timestamp_millis();
    let mut live: Vec<_> = state
        .store
        .list_announcements()
        .await
        .into_iter()
        .filter(|a| a.is_live(now))
        .collect();
    live.sort_by(|a, b| b.priority.cmp(&a.priority));
    Json(serde_json::to_value(live).unwrap_or_else(|_| Value::Array(Vec::new())))
}
