//! Storage Collaborators
//!
//! The engine only talks to storage through these traits:
//! 1. `AccountDirectory` - read an account (sponsor, directs, active flag)
//! 2. `PayoutLedger` - atomic credit + uniquely-keyed payout insert
//! 3. `AuditLog` - optional persistence of finished run summaries
//!
//! `sqlite::CommissionDb` implements all of them.

pub mod sqlite;

use crate::commission::orchestrator::DistributionSummary;
use crate::models::{Account, AccountId, PayoutKind};
use crate::money::Amount;
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use sqlite::CommissionDb;

#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync {
    /// `Ok(None)` when the account does not exist.
    async fn account(&self, id: &str) -> Result<Option<Account>>;
}

/// One level's payout, as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub recipient_id: AccountId,
    pub source_user_id: AccountId,
    pub amount: Amount,
    pub level: u32,
    pub kind: PayoutKind,
    pub event_ref: String,
    pub package_ref: Option<String>,
}

/// Result of a single credit attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CreditOutcome {
    /// Balance credited and payout row written (row id)
    Recorded { payout_id: i64 },
    /// Same (recipient, event, level, kind) already paid; nothing changed
    Duplicate,
    /// Nothing changed
    Failed { reason: String },
}

#[async_trait::async_trait]
pub trait PayoutLedger: Send + Sync {
    /// Credit balance + earnings and insert the payout row as one unit.
    async fn credit(&self, request: &CreditRequest) -> CreditOutcome;
}

/// Why a run was written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    ConfigMissing,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::ConfigMissing => "config_missing",
        }
    }
}

/// A finished run, as persisted by an `AuditLog`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRun {
    pub run_id: String,
    pub kind: PayoutKind,
    pub source_user_id: AccountId,
    pub event_ref: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub summary: DistributionSummary,
    pub created_at: i64,
}

#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_run(&self, run: &DistributionRun) -> Result<()>;
}
