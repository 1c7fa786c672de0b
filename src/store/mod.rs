pub mod client;
pub mod concurrency;
pub mod models;

pub use client::{StoreClient, UsageCheck, UsageDenyReason, UsageIncrement};
pub use concurrency::{Acquire, ConcurrencyLedger};
