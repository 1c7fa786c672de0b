//! Typed operations over the shared Redis store.
//!
//! Read-mostly configuration goes through per-process TTL caches; admin
//! mutations write through and invalidate. Key records are read and written
//! directly; the quota fields on them are the only state the dispatch path
//! mutates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::store::concurrency::{Acquire, ConcurrencyLedger};
use crate::store::models::{
    ANNOUNCEMENTS_KEY, Announcement, BACKUP_PROFILES_KEY, BackupProfile, GlobalSettings, KeyRecord,
    ModelConfig, PROFILES_KEY, Profile, SETTINGS_KEY, migrate_legacy_key, timestamp_millis,
    today_utc,
};

const SETTINGS_TTL: Duration = Duration::from_secs(30);
const PROFILES_TTL: Duration = Duration::from_secs(60);
const BACKUPS_TTL: Duration = Duration::from_secs(60);
const MODEL_CONFIGS_TTL: Duration = Duration::from_secs(120);

/// Why a usage check denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDenyReason {
    InvalidKey,
    DailyLimitReached,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageCheck {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub reason: Option<UsageDenyReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageIncrement {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub should_increment: bool,
    pub reason: Option<UsageDenyReason>,
}

#[derive(Clone)]
pub struct StoreClient {
    client: redis::Client,
    ledger: ConcurrencyLedger,
    metrics: Arc<Metrics>,
    settings_cache: Cache<(), Arc<GlobalSettings>>,
    profiles_cache: Cache<(), Arc<HashMap<String, Profile>>>,
    backups_cache: Cache<(), Arc<Vec<BackupProfile>>>,
    model_configs_cache: Cache<(), Arc<HashMap<String, ModelConfig>>>,
}

impl StoreClient {
    pub fn new(url: &str, metrics: Arc<Metrics>) -> Result<Self, ProxyError> {
        let client = redis::Client::open(url)?;
        let ledger = ConcurrencyLedger::new(client.clone());
        Ok(Self {
            client,
            ledger,
            metrics,
            settings_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(SETTINGS_TTL)
                .build(),
            profiles_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(PROFILES_TTL)
                .build(),
            backups_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(BACKUPS_TTL)
                .build(),
            model_configs_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(MODEL_CONFIGS_TTL)
                .build(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    // ------------------------------------------------------------------
    // Key records
    // ------------------------------------------------------------------

    /// Read a key record by its caller-facing token. Rolls `usage_today`
    /// over to the current UTC day and migrates legacy records in place,
    /// persisting whenever the stored value changed.
    pub async fn get_key(&self, token: &str) -> Result<Option<KeyRecord>, ProxyError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(token).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let (mut key, mut dirty) = match serde_json::from_str::<KeyRecord>(&raw) {
            Ok(key) => (key, false),
            Err(_) => {
                let value: Value = match serde_json::from_str(&raw) {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                };
                match migrate_legacy_key(&value) {
                    Some(migrated) => {
                        info!("migrated legacy key record");
                        (migrated, true)
                    }
                    None => return Ok(None),
                }
            }
        };

        if key.roll_usage_day(&today_utc()) {
            dirty = true;
        }
        if dirty {
            let _: () = conn.set(token, serde_json::to_string(&key)?).await?;
        }
        Ok(Some(key))
    }

    pub async fn put_key(&self, token: &str, key: &KeyRecord) -> Result<(), ProxyError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(token, serde_json::to_string(key)?).await?;
        Ok(())
    }

    pub async fn delete_key(&self, token: &str) -> Result<bool, ProxyError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = conn.del(token).await?;
        Ok(deleted > 0)
    }

    /// Quota pre-check. Never mutates the count (the day-roll inside
    /// `get_key` may still persist).
    pub async fn check_usage(&self, token: &str) -> Result<UsageCheck, ProxyError> {
        let Some(key) = self.get_key(token).await? else {
            return Ok(UsageCheck {
                allowed: false,
                current: 0,
                limit: 0,
                reason: Some(UsageDenyReason::InvalidKey),
            });
        };
        let current = key.usage_today.count;
        let limit = key.daily_limit;
        if current >= limit {
            return Ok(UsageCheck {
                allowed: false,
                current,
                limit,
                reason: Some(UsageDenyReason::DailyLimitReached),
            });
        }
        Ok(UsageCheck {
            allowed: true,
            current,
            limit,
            reason: None,
        })
    }

    /// Deferred usage commit with conversation-turn dedup: a second call for
    /// the same conversation fingerprint inside the window reports success
    /// without touching the count.
    pub async fn increment_usage(
        &self,
        token: &str,
        conversation_id: Option<&str>,
    ) -> Result<UsageIncrement, ProxyError> {
        let Some(mut key) = self.get_key(token).await? else {
            return Ok(UsageIncrement {
                allowed: false,
                current: 0,
                limit: 0,
                should_increment: false,
                reason: Some(UsageDenyReason::InvalidKey),
            });
        };

        let limit = key.daily_limit;
        if key.usage_today.count >= limit {
            return Ok(UsageIncrement {
                allowed: false,
                current: key.usage_today.count,
                limit,
                should_increment: false,
                reason: Some(UsageDenyReason::DailyLimitReached),
            });
        }

        let now = timestamp_millis();
        if let Some(cid) = conversation_id
            && key.last_conversation_id.as_deref() == Some(cid)
            && let Some(last) = key.last_request_timestamp
            && now.saturating_sub(last) < crate::constants::CONVERSATION_DEDUP_WINDOW_MS
        {
            return Ok(UsageIncrement {
                allowed: true,
                current: key.usage_today.count,
                limit,
                should_increment: false,
                reason: None,
            });
        }

        key.usage_today.count += 1;
        key.last_conversation_id = conversation_id.map(str::to_string);
        key.last_request_timestamp = Some(now);
        self.put_key(token, &key).await?;

        Ok(UsageIncrement {
            allowed: true,
            current: key.usage_today.count,
            limit,
            should_increment: true,
            reason: None,
        })
    }

    // ------------------------------------------------------------------
    // Read-mostly configuration
    // ------------------------------------------------------------------

    fn record_cache(&self, hit: bool) {
        if hit {
            Metrics::incr(&self.metrics.cache_hits);
        } else {
            Metrics::incr(&self.metrics.cache_misses);
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        store_key: &str,
    ) -> Result<Option<T>, ProxyError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(store_key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        store_key: &str,
        value: &T,
    ) -> Result<(), ProxyError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(store_key, serde_json::to_string(value)?).await?;
        Ok(())
    }

    pub async fn get_settings(&self) -> Result<Arc<GlobalSettings>, ProxyError> {
        if let Some(settings) = self.settings_cache.get(&()).await {
            self.record_cache(true);
            return Ok(settings);
        }
        self.record_cache(false);
        let settings = Arc::new(
            self.read_json::<GlobalSettings>(SETTINGS_KEY)
                .await?
                .unwrap_or_default(),
        );
        self.settings_cache.insert((), settings.clone()).await;
        Ok(settings)
    }

    pub async fn put_settings(&self, settings: &GlobalSettings) -> Result<(), ProxyError> {
        self.write_json(SETTINGS_KEY, settings).await?;
        self.settings_cache.invalidate(&()).await;
        self.model_configs_cache.invalidate(&()).await;
        Ok(())
    }

    pub async fn list_profiles(&self) -> Result<Arc<HashMap<String, Profile>>, ProxyError> {
        if let Some(profiles) = self.profiles_cache.get(&()).await {
            self.record_cache(true);
            return Ok(profiles);
        }
        self.record_cache(false);
        let profiles = Arc::new(
            self.read_json::<HashMap<String, Profile>>(PROFILES_KEY)
                .await?
                .unwrap_or_default(),
        );
        self.profiles_cache.insert((), profiles.clone()).await;
        Ok(profiles)
    }

    pub async fn get_profile(&self, id: &str) -> Result<Option<Profile>, ProxyError> {
        Ok(self.list_profiles().await?.get(id).cloned())
    }

    pub async fn put_profile(&self, profile: &Profile) -> Result<(), ProxyError> {
        let mut profiles = self
            .read_json::<HashMap<String, Profile>>(PROFILES_KEY)
            .await?
            .unwrap_or_default();
        profiles.insert(profile.id.clone(), profile.clone());
        self.write_json(PROFILES_KEY, &profiles).await?;
        self.profiles_cache.invalidate(&()).await;
        Ok(())
    }

    pub async fn delete_profile(&self, id: &str) -> Result<bool, ProxyError> {
        let mut profiles = self
            .read_json::<HashMap<String, Profile>>(PROFILES_KEY)
            .await?
            .unwrap_or_default();
        let removed = profiles.remove(id).is_some();
        if removed {
            self.write_json(PROFILES_KEY, &profiles).await?;
            self.profiles_cache.invalidate(&()).await;
        }
        Ok(removed)
    }

    pub async fn list_backup_profiles(&self) -> Result<Arc<Vec<BackupProfile>>, ProxyError> {
        if let Some(backups) = self.backups_cache.get(&()).await {
            self.record_cache(true);
            return Ok(backups);
        }
        self.record_cache(false);
        let backups = Arc::new(
            self.read_json::<Vec<BackupProfile>>(BACKUP_PROFILES_KEY)
                .await?
                .unwrap_or_default(),
        );
        self.backups_cache.insert((), backups.clone()).await;
        Ok(backups)
    }

    /// Replace the whole ordered sequence. The stored order is the waterfall
    /// priority, so partial updates are not offered.
    pub async fn put_backup_profiles(&self, backups: &[BackupProfile]) -> Result<(), ProxyError> {
        self.write_json(BACKUP_PROFILES_KEY, &backups).await?;
        self.backups_cache.invalidate(&()).await;
        Ok(())
    }

    /// Model configs ride inside the settings blob but get their own, longer
    /// cache. Errors degrade to an empty map, since prompt selection is optional.
    pub async fn get_model_configs(&self) -> Arc<HashMap<String, ModelConfig>> {
        if let Some(configs) = self.model_configs_cache.get(&()).await {
            self.record_cache(true);
            return configs;
        }
        self.record_cache(false);
        let configs = match self.read_json::<GlobalSettings>(SETTINGS_KEY).await {
            Ok(settings) => Arc::new(settings.unwrap_or_default().models),
            Err(e) => {
                warn!("model config read failed, continuing without: {e}");
                Arc::new(HashMap::new())
            }
        };
        self.model_configs_cache.insert((), configs.clone()).await;
        configs
    }

    /// Announcement reads degrade to empty on any store error.
    pub async fn list_announcements(&self) -> Vec<Announcement> {
        match self.read_json::<Vec<Announcement>>(ANNOUNCEMENTS_KEY).await {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                warn!("announcement read failed, continuing without: {e}");
                Vec::new()
            }
        }
    }

    pub async fn put_announcements(&self, list: &[Announcement]) -> Result<(), ProxyError> {
        self.write_json(ANNOUNCEMENTS_KEY, &list).await
    }

    // ------------------------------------------------------------------
    // Concurrency passthroughs
    // ------------------------------------------------------------------

    pub async fn try_acquire(&self, source_id: &str, limit: u64) -> Result<Acquire, ProxyError> {
        self.ledger.try_acquire(source_id, limit).await
    }

    pub async fn release_concurrency(&self, source_id: &str) {
        self.ledger.release(source_id).await;
    }

    pub async fn read_concurrency(&self, source_id: &str) -> Result<i64, ProxyError> {
        self.ledger.read(source_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::UsageToday;

    fn test_store() -> Option<StoreClient> {
        let url = std::env::var("CASCADE_PROXY_TEST_REDIS_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        Some(StoreClient::new(&url, Arc::new(Metrics::new())).expect("store client"))
    }

    async fn clear(store: &StoreClient, token: &str) {
        let _ = store.delete_key(token).await;
    }

    #[tokio::test]
    async fn stale_usage_date_rolls_and_persists() {
        let Some(store) = test_store() else { return };
        let token = "cascade-test-day-roll";
        clear(&store, token).await;

        let mut key = KeyRecord::new("2099-01-01".into(), 5);
        key.usage_today = UsageToday {
            date: "2020-01-01".into(),
            count: 4,
        };
        store.put_key(token, &key).await.unwrap();

        let read = store.get_key(token).await.unwrap().unwrap();
        assert_eq!(read.usage_today.date, today_utc());
        assert_eq!(read.usage_today.count, 0);

        // The roll was written back, not just surfaced.
        let again = store.get_key(token).await.unwrap().unwrap();
        assert_eq!(again.usage_today.count, 0);
        clear(&store, token).await;
    }

    #[tokio::test]
    async fn conversation_dedup_inside_and_outside_window() {
        let Some(store) = test_store() else { return };
        let token = "cascade-test-dedup";
        clear(&store, token).await;

        store
            .put_key(token, &KeyRecord::new("2099-01-01".into(), 10))
            .await
            .unwrap();

        let first = store
            .increment_usage(token, Some("1.2.3.4:agent"))
            .await
            .unwrap();
        assert!(first.allowed && first.should_increment);
        assert_eq!(first.current, 1);

        // Same fingerprint straight away: deduplicated.
        let second = store
            .increment_usage(token, Some("1.2.3.4:agent"))
            .await
            .unwrap();
        assert!(second.allowed && !second.should_increment);
        assert_eq!(second.current, 1);

        // Age the last timestamp past the window: counts again.
        let mut key = store.get_key(token).await.unwrap().unwrap();
        key.last_request_timestamp = Some(timestamp_millis() - 61_000);
        store.put_key(token, &key).await.unwrap();

        let third = store
            .increment_usage(token, Some("1.2.3.4:agent"))
            .await
            .unwrap();
        assert!(third.allowed && third.should_increment);
        assert_eq!(third.current, 2);
        clear(&store, token).await;
    }

    #[tokio::test]
    async fn different_fingerprint_is_not_deduplicated() {
        let Some(store) = test_store() else { return };
        let token = "cascade-test-dedup-other";
        clear(&store, token).await;

        store
            .put_key(token, &KeyRecord::new("2099-01-01".into(), 10))
            .await
            .unwrap();
        store
            .increment_usage(token, Some("1.2.3.4:agent"))
            .await
            .unwrap();
        let other = store
            .increment_usage(token, Some("5.6.7.8:agent"))
            .await
            .unwrap();
        assert!(other.should_increment);
        assert_eq!(other.current, 2);
        clear(&store, token).await;
    }

    #[tokio::test]
    async fn usage_check_denies_at_limit() {
        let Some(store) = test_store() else { return };
        let token = "cascade-test-limit";
        clear(&store, token).await;

        let mut key = KeyRecord::new("2099-01-01".into(), 2);
        key.usage_today.count = 2;
        store.put_key(token, &key).await.unwrap();

        let check = store.check_usage(token).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(UsageDenyReason::DailyLimitReached));
        assert_eq!(check.current, 2);
        assert_eq!(check.limit, 2);

        // The deferred commit re-checks and refuses to exceed the cap.
        let incr = store.increment_usage(token, None).await.unwrap();
        assert!(!incr.allowed);
        assert_eq!(store.get_key(token).await.unwrap().unwrap().usage_today.count, 2);
        clear(&store, token).await;
    }

    #[tokio::test]
    async fn missing_key_reports_invalid() {
        let Some(store) = test_store() else { return };
        let check = store.check_usage("cascade-test-no-such-key").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(UsageDenyReason::InvalidKey));
    }

    #[tokio::test]
    async fn legacy_record_migrates_on_read() {
        let Some(store) = test_store() else { return };
        let token = "cascade-test-legacy";
        clear(&store, token).await;

        let mut conn = store.connection().await.unwrap();
        let _: () = conn
            .set(token, r#"{"activated_at": 1700000000, "ip_limit": 3}"#)
            .await
            .unwrap();

        let key = store.get_key(token).await.unwrap().unwrap();
        assert_eq!(key.daily_limit, 150);

        // Persisted in the current schema.
        let raw: String = conn.get(token).await.unwrap();
        assert!(raw.contains("daily_limit"));
        clear(&store, token).await;
    }
}
