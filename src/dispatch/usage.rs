//! Request classification for usage counting.
//!
//! Only real conversation turns charge quota: the last message must be a
//! `user` message whose content is not a tool result, and token-count probes
//! never count. Rapid retries from the same caller are collapsed by a
//! fingerprint of client address and user agent. The message content is
//! deliberately left out, since some upstreams mutate it between retries.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde_json::Value;

/// User-agent prefix length folded into the conversation fingerprint.
const USER_AGENT_PREFIX: usize = 50;

/// Stable per-caller fingerprint: `clientIP:userAgent[..50]`.
pub fn conversation_fingerprint(client_ip: &str, user_agent: Option<&str>) -> String {
    let ua: String = user_agent
        .unwrap_or("unknown")
        .chars()
        .take(USER_AGENT_PREFIX)
        .collect();
    format!("{client_ip}:{ua}")
}

/// Client address, honoring the first hop recorded by a fronting proxy.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub fn is_count_tokens(path: &str) -> bool {
    path.contains("/count_tokens")
}

/// Whether this request should charge quota once the upstream succeeds.
pub fn should_count_usage(path: &str, body: &Value) -> bool {
    !is_count_tokens(path) && last_message_is_user_text(body)
}

/// The last message has role `user` and its content is not a tool result.
fn last_message_is_user_text(body: &Value) -> bool {
    let Some(last) = body
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|m| m.last())
    else {
        return false;
    };
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return false;
    }
    match last.get("content") {
        Some(Value::String(_)) => true,
        Some(Value::Array(blocks)) => !blocks.iter().any(is_tool_result),
        Some(obj @ Value::Object(_)) => !is_tool_result(obj),
        _ => false,
    }
}

fn is_tool_result(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("tool_result")
}
