// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Siteforge Shared Primitives
//!
//! Cross-cutting pieces used by the API, billing, and worker crates:
//!
//! - **KvStore**: low-latency key/value access (Redis in production,
//!   in-memory for tests) used for the idempotency ledger and the
//!   entitlement cache
//! - **Plan**: the subscription plan table with per-plan quotas
//! - **db**: Postgres pool construction and migrations

pub mod db;
pub mod kv;
pub mod plan;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use kv::{KvError, KvStore};
pub use plan::Plan;
