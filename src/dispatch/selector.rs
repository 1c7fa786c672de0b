//! Waterfall source selection.
//!
//! A key pinned to an active profile goes straight there and queues on the
//! backend itself, with no slot accounting. Everyone else walks the waterfall:
//! the default source, then each backup in stored order, then the default
//! again without a slot as the overflow escape hatch.

use tracing::debug;

use crate::constants::{BACKUP_SOURCE_CONCURRENCY, DEFAULT_SOURCE_CONCURRENCY};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::store::StoreClient;
use crate::store::models::{GlobalSettings, KeyRecord, Profile, SystemPromptFormat};

pub const DEFAULT_SOURCE_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Default,
    Profile,
    Backup,
}

/// The upstream this request will be relayed to.
#[derive(Debug, Clone)]
pub struct ActiveSource {
    pub id: String,
    pub kind: SourceKind,
    pub api_url: String,
    pub api_key: String,
    pub model_actual: Option<String>,
    pub disable_system_prompt_injection: bool,
    pub system_prompt_format: Option<SystemPromptFormat>,
    /// Source id to release on termination; `None` when no slot was taken
    /// (pinned profiles and the queued-default overflow).
    pub concurrency_owner: Option<String>,
}

impl ActiveSource {
    fn from_profile(profile: &Profile, kind: SourceKind, owner: Option<String>) -> Self {
        Self {
            id: profile.id.clone(),
            kind,
            api_url: profile.api_url.clone(),
            api_key: profile.api_key.clone(),
            model_actual: profile.model_actual.clone(),
            disable_system_prompt_injection: profile.disable_system_prompt_injection,
            system_prompt_format: profile.system_prompt_format,
            concurrency_owner: owner,
        }
    }

    fn default_source(
        settings: &GlobalSettings,
        fallback_api_url: Option<&str>,
        fallback_api_key: Option<&str>,
        owner: Option<String>,
    ) -> Option<Self> {
        let api_url = settings
            .api_url
            .clone()
            .or_else(|| fallback_api_url.map(str::to_string))?;
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| fallback_api_key.map(str::to_string))
            .unwrap_or_default();
        Some(Self {
            id: DEFAULT_SOURCE_ID.to_string(),
            kind: SourceKind::Default,
            api_url,
            api_key,
            model_actual: None,
            disable_system_prompt_injection: false,
            system_prompt_format: None,
            concurrency_owner: owner,
        })
    }
}

/// Resolve the upstream for this request. `Ok(None)` means nothing is
/// configured or usable at all.
pub async fn select_source(
    store: &StoreClient,
    fallback_api_url: Option<&str>,
    fallback_api_key: Option<&str>,
    key: &KeyRecord,
    metrics: &Metrics,
) -> Result<Option<ActiveSource>, ProxyError> {
    // A user-pinned profile bypasses the ledger entirely.
    if let Some(profile_id) = &key.selected_api_profile_id {
        match store.get_profile(profile_id).await? {
            Some(profile) if profile.is_active => {
                debug!(%profile_id, "using pinned profile");
                return Ok(Some(ActiveSource::from_profile(
                    &profile,
                    SourceKind::Profile,
                    None,
                )));
            }
            _ => {
                debug!(%profile_id, "pinned profile missing or inactive, falling through");
            }
        }
    }

    let settings = store.get_settings().await?;

    // Waterfall step 1: the default source.
    let default_exists = ActiveSource::default_source(
        &settings,
        fallback_api_url,
        fallback_api_key,
        None,
    );
    if default_exists.is_some() {
        let limit = settings
            .concurrency_limit
            .unwrap_or(DEFAULT_SOURCE_CONCURRENCY);
        let acquired = store.try_acquire(DEFAULT_SOURCE_ID, limit).await?;
        if acquired.allowed {
            return Ok(ActiveSource::default_source(
                &settings,
                fallback_api_url,
                fallback_api_key,
                Some(DEFAULT_SOURCE_ID.to_string()),
            ));
        }
    }

    // Waterfall step 2: backups, in stored order.
    for backup in store.list_backup_profiles().await?.iter() {
        if !backup.profile.is_active {
            continue;
        }
        let limit = backup.concurrency_limit.unwrap_or(BACKUP_SOURCE_CONCURRENCY);
        let acquired = store.try_acquire(&backup.profile.id, limit).await?;
        if acquired.allowed {
            debug!(backup_id = %backup.profile.id, "selected backup source");
            return Ok(Some(ActiveSource::from_profile(
                &backup.profile,
                SourceKind::Backup,
                Some(backup.profile.id.clone()),
            )));
        }
    }

    // Waterfall step 3: everything is saturated. Queue on the default
    // without a slot and let the upstream serve or refuse.
    if default_exists.is_some() {
        Metrics::incr(&metrics.queued_default_overflow);
        debug!("all sources saturated, queueing on default");
        return Ok(default_exists);
    }

    Ok(None)
}
