//! Harvester Core Library
//!
//! Fetches, verifies and organizes academic paper full-texts from a work
//! list, recording every task's terminal state in a durable ledger so runs
//! can be interrupted and resumed without repeating completed work.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`task`] - Work-list records, routes and attempt outcomes
//! - [`ledger`] - Durable per-task terminal state (`SQLite`)
//! - [`verify`] - Content type sniffing and viability checks
//! - [`placement`] - File naming and collision-safe placement
//! - [`fetch`] - Paced HTTP retrieval with bounded micro-retry
//! - [`fallback`] - DOI-keyed mirror routes
//! - [`scheduler`] - Bounded-concurrency driver for fetch chains
//! - [`stats`] / [`attempt_log`] - Run counters, summary and JSON-lines logs

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod attempt_log;
pub mod db;
pub mod exit;
pub mod fallback;
pub mod fetch;
pub mod ledger;
pub mod placement;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod user_agent;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use fetch::{FetchError, Fetcher, FetcherOptions, RateLimiter, RetryPolicy};
pub use ledger::{Ledger, LedgerError, LedgerStatus, LedgerStore};
pub use scheduler::{MirrorMode, Scheduler, SchedulerConfig, SchedulerError};
pub use stats::{RunStats, RunSummary};
pub use task::{Task, load_work_list};
