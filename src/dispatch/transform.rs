//! Request body and URL transformations applied before the upstream call.

use serde_json::{Value, json};

use crate::constants::{DEFAULT_ACTUAL_MODEL, SYSTEM_PROMPT_MAX_CHARS};
use crate::dispatch::selector::ActiveSource;
use crate::error::ProxyError;
use crate::store::models::{GlobalSettings, KeyRecord, ModelConfig, SystemPromptFormat};
use std::collections::HashMap;

/// Join the upstream base with the client's path and query. A `/v1` suffix on
/// the base absorbs the client's `/v1` prefix so the segment never doubles.
pub fn build_upstream_url(api_base: &str, path_and_query: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if base.ends_with("/v1") && path_and_query.starts_with("/v1") {
        format!("{base}{}", &path_and_query["/v1".len()..])
    } else {
        format!("{base}{path_and_query}")
    }
}

/// The rewrite the response path must apply: every occurrence of `actual`
/// becomes `display` on the way back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSwap {
    pub actual: String,
    pub display: String,
}

/// Validate the caller's `model` against the advertised display name and swap
/// in the real upstream model. Also strips `metadata`, which is never
/// forwarded. With no display model configured the body passes through as-is.
pub fn validate_and_swap_model(
    body: &mut Value,
    settings: &GlobalSettings,
    source: &ActiveSource,
) -> Result<Option<ModelSwap>, ProxyError> {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("metadata");
    }

    let Some(display) = settings.model_display.clone() else {
        return Ok(None);
    };

    let got = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if got != display {
        return Err(ProxyError::InvalidModel {
            expected: display,
            got,
        });
    }

    let actual = source
        .model_actual
        .clone()
        .or_else(|| settings.model_actual.clone())
        .unwrap_or_else(|| DEFAULT_ACTUAL_MODEL.to_string());

    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(actual.clone()));
    }

    Ok(Some(ModelSwap { actual, display }))
}

/// The prompt to inject: the caller's selected model config when it has one
/// with a non-empty prompt, otherwise the global prompt. Trimmed, capped.
pub fn resolve_prompt(
    key: &KeyRecord,
    settings: &GlobalSettings,
    model_configs: &HashMap<String, ModelConfig>,
) -> Option<String> {
    let from_config = key
        .selected_model
        .as_ref()
        .and_then(|id| model_configs.get(id))
        .map(|config| config.system_prompt.trim())
        .filter(|p| !p.is_empty());

    let prompt = match from_config {
        Some(p) => p,
        None => settings.system_prompt.as_deref().unwrap_or("").trim(),
    };
    if prompt.is_empty() {
        return None;
    }
    Some(prompt.chars().take(SYSTEM_PROMPT_MAX_CHARS).collect())
}

/// Profile format wins over settings; `auto` when neither says.
pub fn resolve_format(source: &ActiveSource, settings: &GlobalSettings) -> SystemPromptFormat {
    source
        .system_prompt_format
        .or(settings.system_prompt_format)
        .unwrap_or_default()
}

fn wrap_prompt(prompt: &str) -> String {
    format!("[System Instructions]\n{prompt}\n[End System Instructions]")
}

/// Write the system prompt into the request body in the resolved format.
pub fn inject_system_prompt(body: &mut Value, path: &str, prompt: &str, format: SystemPromptFormat) {
    let format = match format {
        SystemPromptFormat::Auto => {
            if body.get("system").is_some() || path.contains("/messages") {
                SystemPromptFormat::Anthropic
            } else {
                SystemPromptFormat::Openai
            }
        }
        other => other,
    };

    match format {
        SystemPromptFormat::Anthropic => set_top_level_system(body, prompt),
        SystemPromptFormat::Openai => set_system_message(body, prompt),
        SystemPromptFormat::Both => {
            set_top_level_system(body, prompt);
            set_system_message(body, prompt);
        }
        SystemPromptFormat::UserMessage => {
            remove_system(body);
            prepend_user_message(body, &wrap_prompt(prompt));
        }
        SystemPromptFormat::InjectFirstUser => {
            remove_system(body);
            inject_into_first_user(body, &wrap_prompt(prompt));
        }
        SystemPromptFormat::Auto | SystemPromptFormat::Disabled => {}
    }
}

fn set_top_level_system(body: &mut Value, prompt: &str) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("system".to_string(), Value::String(prompt.to_string()));
    }
}

/// Replace the content of an existing `system`-role message, or prepend one.
fn set_system_message(body: &mut Value, prompt: &str) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    for message in messages.iter_mut() {
        if message.get("role").and_then(Value::as_str) == Some("system") {
            if let Some(obj) = message.as_object_mut() {
                obj.insert("content".to_string(), Value::String(prompt.to_string()));
            }
            return;
        }
    }
    messages.insert(0, json!({"role": "system", "content": prompt}));
}

/// Drop the top-level `system` field and any `system`-role messages.
fn remove_system(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("system");
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.retain(|m| m.get("role").and_then(Value::as_str) != Some("system"));
    }
}

fn prepend_user_message(body: &mut Value, wrapped: &str) {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.insert(0, json!({"role": "user", "content": wrapped}));
    }
}

/// Prepend the wrapped prompt to the first `user` message: an extra text
/// block when its content is an array, a string prefix otherwise. With no
/// user message at all the prompt becomes its own message.
fn inject_into_first_user(body: &mut Value, wrapped: &str) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(idx) = messages
        .iter()
        .position(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        messages.insert(0, json!({"role": "user", "content": wrapped}));
        return;
    };
    let message = &mut messages[idx];

    match message.get_mut("content") {
        Some(Value::Array(blocks)) => {
            blocks.insert(0, json!({"type": "text", "text": wrapped}));
        }
        Some(Value::String(existing)) => {
            *existing = format!("{wrapped}\n\n{existing}");
        }
        _ => {
            if let Some(obj) = message.as_object_mut() {
                obj.insert("content".to_string(), Value::String(wrapped.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::selector::SourceKind;
    use serde_json::json;

    fn source(model_actual: Option<&str>, format: Option<SystemPromptFormat>) -> ActiveSource {
        ActiveSource {
            id: "src".into(),
            kind: SourceKind::Default,
            api_url: "https://up.example".into(),
            api_key: "k".into(),
            model_actual: model_actual.map(str::to_string),
            disable_system_prompt_injection: false,
            system_prompt_format: format,
            concurrency_owner: None,
        }
    }

    #[test]
    fn url_join_deduplicates_v1() {
        assert_eq!(
            build_upstream_url("https://h/v1/", "/v1/x?a=1"),
            "https://h/v1/x?a=1"
        );
        assert_eq!(build_upstream_url("https://h", "/v1/x"), "https://h/v1/x");
        assert_eq!(build_upstream_url("https://h/v1", "/v1/x"), "https://h/v1/x");
    }

    #[test]
    fn url_join_leaves_other_paths_alone() {
        assert_eq!(
            build_upstream_url("https://h/api", "/v1/messages"),
            "https://h/api/v1/messages"
        );
        assert_eq!(
            build_upstream_url("https://h/v1", "/messages?s=1"),
            "https://h/v1/messages?s=1"
        );
    }

    #[test]
    fn model_swap_prefers_source_then_settings() {
        let settings = GlobalSettings {
            model_display: Some("Display".into()),
            model_actual: Some("m-y".into()),
            ..Default::default()
        };
        let mut body = json!({"model": "Display", "metadata": {"user_id": "u"}});
        let swap = validate_and_swap_model(&mut body, &settings, &source(Some("m-x"), None))
            .unwrap()
            .unwrap();
        assert_eq!(swap.actual, "m-x");
        assert_eq!(swap.display, "Display");
        assert_eq!(body["model"], "m-x");
        assert!(body.get("metadata").is_none());

        let mut body = json!({"model": "Display"});
        let swap = validate_and_swap_model(&mut body, &settings, &source(None, None))
            .unwrap()
            .unwrap();
        assert_eq!(swap.actual, "m-y");
    }

    #[test]
    fn model_swap_falls_back_to_builtin_default() {
        let settings = GlobalSettings {
            model_display: Some("Display".into()),
            ..Default::default()
        };
        let mut body = json!({"model": "Display"});
        let swap = validate_and_swap_model(&mut body, &settings, &source(None, None))
            .unwrap()
            .unwrap();
        assert_eq!(swap.actual, DEFAULT_ACTUAL_MODEL);
    }

    #[test]
    fn model_mismatch_is_rejected() {
        let settings = GlobalSettings {
            model_display: Some("Display".into()),
            ..Default::default()
        };
        let mut body = json!({"model": "other"});
        let err = validate_and_swap_model(&mut body, &settings, &source(None, None)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidModel { .. }));
    }

    #[test]
    fn unconfigured_display_model_passes_through() {
        let settings = GlobalSettings::default();
        let mut body = json!({"model": "whatever", "metadata": 1});
        let swap = validate_and_swap_model(&mut body, &settings, &source(None, None)).unwrap();
        assert!(swap.is_none());
        assert_eq!(body["model"], "whatever");
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn prompt_resolution_prefers_selected_model_config() {
        let mut key = KeyRecord::new("2099-01-01".into(), 5);
        key.selected_model = Some("cfg".into());
        let settings = GlobalSettings {
            system_prompt: Some("global".into()),
            ..Default::default()
        };
        let mut configs = HashMap::new();
        configs.insert(
            "cfg".to_string(),
            ModelConfig {
                name: "cfg".into(),
                system_prompt: "  from config  ".into(),
            },
        );
        assert_eq!(
            resolve_prompt(&key, &settings, &configs).as_deref(),
            Some("from config")
        );

        // Empty config prompt falls back to the global one.
        configs.get_mut("cfg").unwrap().system_prompt = "   ".into();
        assert_eq!(
            resolve_prompt(&key, &settings, &configs).as_deref(),
            Some("global")
        );
    }

    #[test]
    fn blank_prompt_resolves_to_none() {
        let key = KeyRecord::new("2099-01-01".into(), 5);
        let settings = GlobalSettings {
            system_prompt: Some("   ".into()),
            ..Default::default()
        };
        assert!(resolve_prompt(&key, &settings, &HashMap::new()).is_none());
    }

    #[test]
    fn prompt_is_capped() {
        let key = KeyRecord::new("2099-01-01".into(), 5);
        let settings = GlobalSettings {
            system_prompt: Some("x".repeat(12_000)),
            ..Default::default()
        };
        let prompt = resolve_prompt(&key, &settings, &HashMap::new()).unwrap();
        assert_eq!(prompt.chars().count(), SYSTEM_PROMPT_MAX_CHARS);
    }

    #[test]
    fn auto_picks_anthropic_for_messages_path_or_system_field() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        inject_system_prompt(&mut body, "/v1/messages", "P", SystemPromptFormat::Auto);
        assert_eq!(body["system"], "P");

        let mut body = json!({"system": "old", "messages": []});
        inject_system_prompt(&mut body, "/v1/chat/completions", "P", SystemPromptFormat::Auto);
        assert_eq!(body["system"], "P");
    }

    #[test]
    fn auto_picks_openai_otherwise() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        inject_system_prompt(
            &mut body,
            "/v1/chat/completions",
            "P",
            SystemPromptFormat::Auto,
        );
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "P");
    }

    #[test]
    fn openai_replaces_existing_system_message() {
        let mut body = json!({"messages": [
            {"role": "system", "content": "old"},
            {"role": "user", "content": "hi"}
        ]});
        inject_system_prompt(&mut body, "/x", "P", SystemPromptFormat::Openai);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "P");
    }

    #[test]
    fn both_sets_field_and_message() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        inject_system_prompt(&mut body, "/x", "P", SystemPromptFormat::Both);
        assert_eq!(body["system"], "P");
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn user_message_format_replaces_system_entirely() {
        let mut body = json!({"system": "old", "messages": [
            {"role": "system", "content": "old-msg"},
            {"role": "user", "content": "hi"}
        ]});
        inject_system_prompt(&mut body, "/x", "P", SystemPromptFormat::UserMessage);
        assert!(body.get("system").is_none());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(
            messages[0]["content"],
            "[System Instructions]\nP\n[End System Instructions]"
        );
        assert_eq!(messages[1]["content"], "hi");
    }

    #[test]
    fn inject_first_user_prepends_text_block_to_array_content() {
        let mut body = json!({"messages": [
            {"role": "assistant", "content": "earlier"},
            {"role": "user", "content": [{"type": "text", "text": "hi"}]}
        ]});
        inject_system_prompt(&mut body, "/x", "P", SystemPromptFormat::InjectFirstUser);
        let blocks = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(
            blocks[0]["text"],
            "[System Instructions]\nP\n[End System Instructions]"
        );
    }

    #[test]
    fn inject_first_user_prefixes_string_content() {
        let mut body = json!({"system": "old", "messages": [
            {"role": "user", "content": "hi"}
        ]});
        inject_system_prompt(&mut body, "/x", "P", SystemPromptFormat::InjectFirstUser);
        assert!(body.get("system").is_none());
        let content = body["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("[System Instructions]\nP"));
        assert!(content.ends_with("hi"));
    }

    #[test]
    fn disabled_format_changes_nothing() {
        let original = json!({"messages": [{"role": "user", "content": "hi"}]});
        let mut body = original.clone();
        inject_system_prompt(&mut body, "/v1/messages", "P", SystemPromptFormat::Disabled);
        assert_eq!(body, original);
    }
}
