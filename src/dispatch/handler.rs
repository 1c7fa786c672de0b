//! Entry point for `POST /v1/*`.
//!
//! Per request: correlation id, auth, classification, quota pre-check,
//! source selection, body transformation, relay. Everything past source
//! selection carries the slot guard, so every exit path gives the slot back.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, OriginalUri, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::constants::{DEFAULT_BRAND_DISPLAY, DEFAULT_BRAND_SOURCE};
use crate::dispatch::relay::{RelayRequest, SlotGuard, UsageCommit, relay};
use crate::dispatch::rewrite::Rewriter;
use crate::dispatch::selector::select_source;
use crate::dispatch::transform::{
    build_upstream_url, inject_system_prompt, resolve_format, resolve_prompt,
    validate_and_swap_model,
};
use crate::dispatch::usage::{client_ip, conversation_fingerprint, should_count_usage};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::store::UsageDenyReason;

const CORRELATION_HEADER: &str = "x-correlation-id";

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Metrics::incr(&state.metrics.requests_total);

    let mut response = match dispatch_inner(&state, &addr, &uri, &headers, body, &correlation_id)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            Metrics::incr(&state.metrics.requests_rejected);
            e.to_response(&correlation_id)
        }
    };

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn dispatch_inner(
    state: &Arc<AppState>,
    addr: &SocketAddr,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: Bytes,
    correlation_id: &str,
) -> Result<Response, ProxyError> {
    // Auth: Bearer token, which is also the store key of the record.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ProxyError::MissingAuth)?;

    let key = state
        .store
        .get_key(token)
        .await?
        .ok_or(ProxyError::InvalidApiKey)?;
    if key.is_expired() {
        return Err(ProxyError::KeyExpired);
    }

    let mut body: Value =
        serde_json::from_slice(&body).map_err(|e| ProxyError::MalformedBody(e.to_string()))?;

    let path = uri.path().to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let should_count = should_count_usage(&path, &body);

    // Quota pre-check. The actual charge is deferred until the upstream
    // succeeds.
    let check = state.store.check_usage(token).await?;
    if !check.allowed {
        return Err(match check.reason {
            Some(UsageDenyReason::InvalidKey) => ProxyError::InvalidApiKey,
            _ => ProxyError::DailyLimitReached {
                current: check.current,
                limit: check.limit,
            },
        });
    }

    let source = select_source(
        &state.store,
        state.fallback_api_url.as_deref(),
        state.fallback_api_key.as_deref(),
        &key,
        &state.metrics,
    )
    .await?
    .ok_or(ProxyError::NoSourceAvailable)?;

    // From here on the slot must come back on every path; the guard's drop
    // hook covers whatever an early return misses.
    let slot = SlotGuard::new(state.store.clone(), source.concurrency_owner.clone());

    let settings = match state.store.get_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            slot.release().await;
            return Err(e);
        }
    };

    let swap = match validate_and_swap_model(&mut body, &settings, &source) {
        Ok(swap) => swap,
        Err(e) => {
            slot.release().await;
            return Err(e);
        }
    };

    if !source.disable_system_prompt_injection {
        let model_configs = state.store.get_model_configs().await;
        if let Some(prompt) = resolve_prompt(&key, &settings, &model_configs) {
            let format = resolve_format(&source, &settings);
            inject_system_prompt(&mut body, &path, &prompt, format);
        }
    }

    let mut pairs = Vec::new();
    if let Some(swap) = &swap {
        pairs.push((swap.actual.clone(), swap.display.clone()));
    }
    pairs.push((
        settings
            .brand_source
            .clone()
            .unwrap_or_else(|| DEFAULT_BRAND_SOURCE.to_string()),
        settings
            .brand_display
            .clone()
            .unwrap_or_else(|| DEFAULT_BRAND_DISPLAY.to_string()),
    ));
    let rewriter = Arc::new(Rewriter::new(&pairs));

    let is_stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let usage = should_count.then(|| {
        let ip = client_ip(headers, addr);
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        UsageCommit::new(
            state.store.clone(),
            token.to_string(),
            conversation_fingerprint(&ip, user_agent),
            state.metrics.clone(),
        )
    });

    let url = build_upstream_url(&source.api_url, &path_and_query);
    info!(
        correlation_id,
        source = %source.id,
        stream = is_stream,
        counted = should_count,
        "dispatching to upstream"
    );

    Ok(relay(
        &state.http_client,
        correlation_id,
        RelayRequest {
            url,
            api_key: source.api_key.clone(),
            body,
            is_stream,
        },
        rewriter,
        slot,
        usage,
        state.metrics.clone(),
    )
    .await)
}
