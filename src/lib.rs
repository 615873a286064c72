//! MLM Commission Engine Library
//!
//! Multi-level commission distribution over a sponsor tree, backed by
//! SQLite and exposed to the CLI binary, the HTTP API and the tests.

pub mod api;
pub mod commission;
pub mod models;
pub mod money;
pub mod store;

pub use commission::{DistributionError, DistributionOrchestrator, DistributionSummary};
pub use store::CommissionDb;
