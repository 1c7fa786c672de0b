use std::time::Duration;

/// Identity the proxy presents to upstreams. Some backends gate their
/// endpoints on a recognized client, so these go on every upstream request.
pub const UPSTREAM_USER_AGENT: &str = "claude-code/1.0.42";
pub const UPSTREAM_CLIENT_VERSION: &str = "1.0.42";

/// Model sent upstream when neither the active source nor the global
/// settings name an actual model.
pub const DEFAULT_ACTUAL_MODEL: &str = "claude-sonnet-4-5";

/// Hard cap on any injected system prompt, in characters.
pub const SYSTEM_PROMPT_MAX_CHARS: usize = 10_000;

/// Deadline for the upstream to start responding.
pub const UPSTREAM_DEADLINE: Duration = Duration::from_secs(300);

/// SSE comment cadence that keeps intermediaries (nginx et al.) from
/// closing the stream during long upstream silences.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Sentinel comment written as soon as a stream opens.
pub const STREAM_CONNECTED_COMMENT: &str = ":connected\n\n";
pub const STREAM_HEARTBEAT_COMMENT: &str = ":heartbeat\n\n";

/// TTL on `concurrency:{source}` counters. Reclaims slots left behind by a
/// process that died mid-relay; well-behaved requests always release explicitly.
pub const STUCK_SLOT_TTL_SECS: i64 = 600;

/// Two increments from the same conversation fingerprint inside this window
/// count as one request.
pub const CONVERSATION_DEDUP_WINDOW_MS: u64 = 60_000;

/// Concurrency limit for the default source when settings leave it unset.
pub const DEFAULT_SOURCE_CONCURRENCY: u64 = 100;

/// Concurrency limit for a backup profile when it leaves its own unset.
pub const BACKUP_SOURCE_CONCURRENCY: u64 = 10;

/// Daily limit assigned when migrating a legacy key record with no numeric hint.
pub const LEGACY_DEFAULT_DAILY_LIMIT: u64 = 100;

/// Multiplier applied to a legacy key's numeric limit hint during migration.
pub const LEGACY_LIMIT_MULTIPLIER: u64 = 50;

/// Brand substitution applied to relayed responses when settings leave the
/// pair unset.
pub const DEFAULT_BRAND_SOURCE: &str = "Claude Code";
pub const DEFAULT_BRAND_DISPLAY: &str = "Claude Opus";
