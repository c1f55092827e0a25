//! # credlease_core
//!
//! Lease-based mutual exclusion for OAuth credential refresh.
//!
//! - [`store::LockStore`]: atomic conditional updates on credential records
//!   (PostgreSQL or in-memory).
//! - [`lease::LeaseManager`]: acquire / renew / release, with guaranteed
//!   release around a unit of work.
//! - [`refresh::RefreshOrchestrator`]: lease-guarded refresh against a
//!   [`refresh::provider::TokenProvider`].
//! - [`reaper::StaleLeaseReaper`] and [`scheduler::ReaperScheduler`]: recovery
//!   from holders that crashed without releasing.

pub mod clock;
pub mod config;
pub mod lease;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod reaper;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
