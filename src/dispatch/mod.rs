//! The request-dispatch engine behind `POST /v1/*`.
//!
//! - `usage`: which requests charge quota, and the retry fingerprint
//! - `selector`: waterfall source selection over the concurrency ledger
//! - `transform`: upstream URL, model swap, system-prompt injection
//! - `rewrite`: model/brand substitution on relayed responses
//! - `relay`: the upstream call, SSE heartbeat, scoped slot and usage commit
//! - `handler`: the axum entry point tying the pipeline together

pub mod handler;
pub mod relay;
pub mod rewrite;
pub mod selector;
pub mod transform;
pub mod usage;

pub use handler::dispatch;
