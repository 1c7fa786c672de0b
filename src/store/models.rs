//! Entities persisted in the shared state store.
//!
//! All values are JSON strings. The caller-facing API token doubles as the
//! store key of its `KeyRecord`; everything else lives under fixed keys.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{LEGACY_DEFAULT_DAILY_LIMIT, LEGACY_LIMIT_MULTIPLIER};

pub const SETTINGS_KEY: &str = "__proxy_settings__";
pub const PROFILES_KEY: &str = "__api_profiles__";
pub const BACKUP_PROFILES_KEY: &str = "__backup_profiles__";
pub const ANNOUNCEMENTS_KEY: &str = "__announcements__";

pub fn concurrency_key(source_id: &str) -> String {
    format!("concurrency:{source_id}")
}

/// Current UTC day, `YYYY-MM-DD`.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub fn timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageToday {
    pub date: String,
    pub count: u64,
}

impl UsageToday {
    pub fn fresh() -> Self {
        Self {
            date: today_utc(),
            count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Last calendar day the key is valid, `YYYY-MM-DD`, inclusive.
    pub expiry: String,
    pub daily_limit: u64,
    #[serde(default = "UsageToday::fresh")]
    pub usage_today: UsageToday,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_api_profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_conversation_id: Option<String>,
}

impl KeyRecord {
    pub fn new(expiry: String, daily_limit: u64) -> Self {
        Self {
            expiry,
            daily_limit,
            usage_today: UsageToday::fresh(),
            selected_model: None,
            selected_api_profile_id: None,
            last_request_timestamp: None,
            last_conversation_id: None,
        }
    }

    /// Expiry is inclusive: the key still works on its expiry date.
    /// An unparseable date counts as expired.
    pub fn is_expired(&self) -> bool {
        match NaiveDate::parse_from_str(&self.expiry, "%Y-%m-%d") {
            Ok(expiry) => Utc::now().date_naive() > expiry,
            Err(_) => true,
        }
    }

    /// Reset `usage_today` when its date is not the given day.
    /// Returns true when a roll happened and the record needs persisting.
    pub fn roll_usage_day(&mut self, today: &str) -> bool {
        if self.usage_today.date == today {
            return false;
        }
        self.usage_today = UsageToday {
            date: today.to_string(),
            count: 0,
        };
        true
    }
}

/// One-shot migration of a pre-quota key record: anything without a
/// `daily_limit` but carrying the old activation/ip limit fields. A numeric
/// hint scales into the new daily limit; otherwise the default applies.
pub fn migrate_legacy_key(raw: &Value) -> Option<KeyRecord> {
    let obj = raw.as_object()?;
    if obj.contains_key("daily_limit") {
        return None;
    }
    let looks_legacy = ["activation_limit", "ip_limit", "max_ips", "activated_at"]
        .iter()
        .any(|f| obj.contains_key(*f));
    if !looks_legacy {
        return None;
    }

    let hint = ["activation_limit", "ip_limit", "max_ips"]
        .iter()
        .filter_map(|f| obj.get(*f).and_then(Value::as_u64))
        .max();
    let daily_limit = hint
        .map(|h| h.saturating_mul(LEGACY_LIMIT_MULTIPLIER))
        .unwrap_or(LEGACY_DEFAULT_DAILY_LIMIT);

    let expiry = obj
        .get("expiry")
        .or_else(|| obj.get("expires_at"))
        .and_then(Value::as_str)
        .unwrap_or("9999-12-31")
        .to_string();

    Some(KeyRecord::new(expiry, daily_limit))
}

/// How the system prompt is written into the outgoing request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptFormat {
    /// Pick `anthropic` or `openai` from the request shape.
    #[default]
    Auto,
    /// Top-level `system` field.
    Anthropic,
    /// `system`-role entry in `messages`.
    Openai,
    /// Both of the above.
    Both,
    /// Wrapped text prepended as a standalone `user` message.
    UserMessage,
    /// Wrapped text prepended to the first `user` message's content.
    InjectFirstUser,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_display: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub disable_system_prompt_injection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_format: Option<SystemPromptFormat>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A fallback backend. Stored as an ordered sequence; the order is the
/// waterfall priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProfile {
    #[serde(flatten)]
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_format: Option<SystemPromptFormat>,
    /// Brand substitution pair applied to relayed responses alongside the
    /// model pair. Defaults apply when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_display: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementKind {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: AnnouncementKind,
    #[serde(default)]
    pub priority: i64,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Announcement {
    /// Active and inside its display window at `now` (epoch ms).
    pub fn is_live(&self, now: u64) -> bool {
        self.is_active
            && self.start_time.is_none_or(|t| t <= now)
            && self.end_time.is_none_or(|t| now <= t)
    }
}
