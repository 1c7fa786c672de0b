//! Admin surface: CRUD over the entities the dispatch engine reads.
//!
//! Deliberately thin: Basic auth, JSON in, JSON out. Every mutation goes
//! through the store client, which owns cache invalidation, so a change is
//! visible to this process immediately and to others within the cache TTLs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::ProxyError;
use crate::store::models::{Announcement, BackupProfile, GlobalSettings, KeyRecord, Profile};

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/settings", get(get_settings).put(put_settings))
        .route("/profiles", get(list_profiles))
        .route(
            "/profiles/{id}",
            put(put_profile).delete(delete_profile),
        )
        .route(
            "/backup-profiles",
            get(list_backup_profiles).put(put_backup_profiles),
        )
        .route("/keys", post(create_key))
        .route(
            "/keys/{token}",
            get(get_key).put(update_key).delete(delete_key),
        )
        .route("/keys/{token}/reset-usage", post(reset_key_usage))
        .route(
            "/announcements",
            get(list_announcements).put(put_announcements),
        )
        .route("/metrics", get(metrics_snapshot))
        .route("/concurrency/{source_id}", get(read_concurrency))
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

/// Basic auth with constant-time comparison to prevent timing attacks.
async fn admin_auth(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let (username, password) = &state.admin_credentials;

    let Some(auth_value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return unauthorized();
    };
    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized();
    };
    let Ok(decoded) = STANDARD.decode(encoded) else {
        return unauthorized();
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized();
    };
    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized();
    };

    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());
    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized()
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ProxyError> {
    let settings = state.store.get_settings().await?;
    Ok(Json(serde_json::to_value(settings.as_ref())?))
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<GlobalSettings>,
) -> Result<Json<Value>, ProxyError> {
    state.store.put_settings(&settings).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ProxyError> {
    let profiles = state.store.list_profiles().await?;
    Ok(Json(serde_json::to_value(profiles.as_ref())?))
}

async fn put_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut profile): Json<Profile>,
) -> Result<Json<Value>, ProxyError> {
    profile.id = id;
    state.store.put_profile(&profile).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let removed = state.store.delete_profile(&id).await?;
    Ok(Json(json!({ "ok": removed })))
}

async fn list_backup_profiles(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ProxyError> {
    let backups = state.store.list_backup_profiles().await?;
    Ok(Json(serde_json::to_value(backups.as_ref())?))
}

/// Replaces the whole list; the submitted order becomes the waterfall order.
async fn put_backup_profiles(
    State(state): State<Arc<AppState>>,
    Json(backups): Json<Vec<BackupProfile>>,
) -> Result<Json<Value>, ProxyError> {
    state.store.put_backup_profiles(&backups).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    expiry: String,
    daily_limit: u64,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ProxyError> {
    let suffix = {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    };
    let token = format!("sk-cascade-{suffix}");
    let record = KeyRecord::new(request.expiry, request.daily_limit);
    state.store.put_key(&token, &record).await?;
    Ok(Json(json!({ "token": token, "record": record })))
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ProxyError> {
    match state.store.get_key(&token).await? {
        Some(record) => Ok(Json(serde_json::to_value(record)?).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "Not found").into_response()),
    }
}

#[derive(Deserialize)]
struct UpdateKeyRequest {
    expiry: Option<String>,
    daily_limit: Option<u64>,
    selected_model: Option<String>,
    selected_api_profile_id: Option<String>,
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(update): Json<UpdateKeyRequest>,
) -> Result<Response, ProxyError> {
    let Some(mut record) = state.store.get_key(&token).await? else {
        return Ok((StatusCode::NOT_FOUND, "Not found").into_response());
    };
    if let Some(expiry) = update.expiry {
        record.expiry = expiry;
    }
    if let Some(limit) = update.daily_limit {
        record.daily_limit = limit;
    }
    if update.selected_model.is_some() {
        record.selected_model = update.selected_model;
    }
    if update.selected_api_profile_id.is_some() {
        record.selected_api_profile_id = update.selected_api_profile_id;
    }
    state.store.put_key(&token, &record).await?;
    Ok(Json(serde_json::to_value(record)?).into_response())
}

async fn reset_key_usage(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ProxyError> {
    let Some(mut record) = state.store.get_key(&token).await? else {
        return Ok((StatusCode::NOT_FOUND, "Not found").into_response());
    };
    record.usage_today.count = 0;
    state.store.put_key(&token, &record).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let removed = state.store.delete_key(&token).await?;
    Ok(Json(json!({ "ok": removed })))
}

async fn list_announcements(State(state): State<Arc<AppState>>) -> Json<Value> {
    let list = state.store.list_announcements().await;
    Json(serde_json::to_value(list).unwrap_or_else(|_| Value::Array(Vec::new())))
}

async fn put_announcements(
    State(state): State<Arc<AppState>>,
    Json(list): Json<Vec<Announcement>>,
) -> Result<Json<Value>, ProxyError> {
    state.store.put_announcements(&list).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn read_concurrency(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let current = state.store.read_concurrency(&source_id).await?;
    Ok(Json(json!({ "source_id": source_id, "current": current })))
}
