//! Distribution Orchestrator
//!
//! Drives one distribution run for a triggering event:
//!
//! ```text
//! Init -> ResolvingConfig -> Walking -> (Evaluating -> Calculating -> Crediting)* -> Done
//! ```
//!
//! Only a missing/invalid schedule fails the call. Every per-level problem
//! (ineligible ancestor, duplicate payout, write failure, directory read
//! failure) lands in the returned `DistributionSummary` and the walk moves
//! on, because each ancestor's payout is independent of the others.

use super::calculator::commission_amount;
use super::chain::SponsorChainWalker;
use super::eligibility::{evaluate, Eligibility, IneligibleReason};
use super::error::DistributionResult;
use super::schedule::{CommissionSchedule, ConfigResolver};
use crate::models::{AccountId, PayoutKind};
use crate::money::{format_amount, serde_decimal, Amount, AMOUNT_SCALE};
use crate::store::{
    AccountDirectory, AuditLog, CommissionDb, CreditOutcome, CreditRequest, DistributionRun,
    PayoutLedger, RunStatus,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// SUMMARY TYPES
// =============================================================================

/// Why a level produced no payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    NoActivePackage,
    LevelLocked { level: u32, required: u32, has: u32 },
    AlreadyPaid,
    WriteFailed { detail: String },
    ZeroAmount,
    BelowMinimum {
        #[serde(with = "serde_decimal")]
        minimum: Amount,
    },
    NonPositiveAmount,
    AmountTooLarge {
        #[serde(with = "serde_decimal")]
        maximum: Amount,
    },
    DirectoryReadFailed { detail: String },
}

impl From<IneligibleReason> for SkipReason {
    fn from(reason: IneligibleReason) -> Self {
        match reason {
            IneligibleReason::NotFound => SkipReason::NotFound,
            IneligibleReason::NoActivePackage => SkipReason::NoActivePackage,
            IneligibleReason::LevelLocked {
                level,
                required,
                has,
            } => SkipReason::LevelLocked {
                level,
                required,
                has,
            },
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotFound => write!(f, "not found"),
            SkipReason::NoActivePackage => write!(f, "no active package"),
            SkipReason::LevelLocked {
                level,
                required,
                has,
            } => write!(f, "level {level} requires {required} directs, has {has}"),
            SkipReason::AlreadyPaid => write!(f, "already paid"),
            SkipReason::WriteFailed { .. } => write!(f, "write failed"),
            SkipReason::ZeroAmount => write!(f, "zero amount"),
            SkipReason::BelowMinimum { .. } => write!(f, "below minimum package amount"),
            SkipReason::NonPositiveAmount => write!(f, "non-positive amount"),
            SkipReason::AmountTooLarge { .. } => write!(f, "amount exceeds payable maximum"),
            SkipReason::DirectoryReadFailed { .. } => write!(f, "directory read failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LevelOutcome {
    Paid {
        #[serde(with = "serde_decimal")]
        amount: Amount,
        payout_id: i64,
    },
    Skipped {
        reason: SkipReason,
    },
}

/// One line of the per-level audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDetail {
    pub level: u32,
    pub recipient_id: AccountId,
    pub outcome: LevelOutcome,
}

impl LevelDetail {
    /// Paid amount as a decimal string, or the skip reason.
    pub fn amount_or_reason(&self) -> String {
        match &self.outcome {
            LevelOutcome::Paid { amount, .. } => format_amount(*amount),
            LevelOutcome::Skipped { reason } => reason.to_string(),
        }
    }

    pub fn paid_amount(&self) -> Option<Amount> {
        match &self.outcome {
            LevelOutcome::Paid { amount, .. } => Some(*amount),
            LevelOutcome::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.outcome {
            LevelOutcome::Paid { .. } => None,
            LevelOutcome::Skipped { reason } => Some(reason),
        }
    }
}

/// Complete accounting of one distribution run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub levels_paid: u32,
    pub levels_skipped: u32,
    #[serde(with = "serde_decimal")]
    pub total_amount: Amount,
    /// Ordered by level
    pub details: Vec<LevelDetail>,
}

impl DistributionSummary {
    fn paid(&mut self, level: u32, recipient_id: &str, amount: Amount, payout_id: i64) {
        self.levels_paid += 1;
        self.total_amount = self.total_amount.saturating_add(amount);
        self.details.push(LevelDetail {
            level,
            recipient_id: recipient_id.to_string(),
            outcome: LevelOutcome::Paid { amount, payout_id },
        });
    }

    fn skipped(&mut self, level: u32, recipient_id: &str, reason: SkipReason) {
        self.levels_skipped += 1;
        self.details.push(LevelDetail {
            level,
            recipient_id: recipient_id.to_string(),
            outcome: LevelOutcome::Skipped { reason },
        });
    }

    /// Level detail for a 1-based level, if that level was reached
    pub fn level(&self, level: u32) -> Option<&LevelDetail> {
        self.details.iter().find(|d| d.level == level)
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionPhase {
    Init,
    ResolvingConfig,
    Walking,
    Evaluating,
    Calculating,
    Crediting,
    Done,
}

struct PhaseTracker {
    phase: DistributionPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: DistributionPhase::Init,
        }
    }

    fn enter(&mut self, next: DistributionPhase) {
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }
}

/// The triggering business event
struct TriggerEvent<'a> {
    kind: PayoutKind,
    source_user_id: &'a str,
    amount: Amount,
    event_ref: &'a str,
    package_ref: Option<&'a str>,
}

impl TriggerEvent<'_> {
    /// Evaluated once before traversal; `Some` means no level may be paid.
    fn gate(&self, schedule: &CommissionSchedule) -> Option<SkipReason> {
        if self.amount <= 0 {
            return Some(SkipReason::NonPositiveAmount);
        }
        let maximum = max_distributable(schedule);
        if self.amount > maximum {
            return Some(SkipReason::AmountTooLarge { maximum });
        }
        if self.kind == PayoutKind::LevelIncome && self.amount < schedule.min_package_amount {
            return Some(SkipReason::BelowMinimum {
                minimum: schedule.min_package_amount,
            });
        }
        None
    }
}

/// Largest event amount whose payouts, summed over every level, still fit
/// an `Amount`.
fn max_distributable(schedule: &CommissionSchedule) -> Amount {
    let total_pct = schedule.total_percentage() as i128;
    if total_pct <= 0 {
        return Amount::MAX;
    }
    let limit = Amount::MAX as i128 * (100 * AMOUNT_SCALE as i128) / total_pct;
    limit.min(Amount::MAX as i128) as Amount
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

#[derive(Clone)]
pub struct DistributionOrchestrator {
    resolver: ConfigResolver,
    directory: Arc<dyn AccountDirectory>,
    ledger: Arc<dyn PayoutLedger>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl DistributionOrchestrator {
    pub fn new(
        resolver: ConfigResolver,
        directory: Arc<dyn AccountDirectory>,
        ledger: Arc<dyn PayoutLedger>,
    ) -> Self {
        Self {
            resolver,
            directory,
            ledger,
            audit: None,
        }
    }

    /// Wire every collaborator to one database, schedule read from its
    /// active `commission_schedules` row.
    pub fn from_db(db: Arc<CommissionDb>) -> Self {
        Self::new(ConfigResolver::new(db.clone()), db.clone(), db.clone()).with_audit_log(db)
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Level income for a package purchase, paid up the buyer's upline.
    pub async fn distribute_on_purchase(
        &self,
        buyer_id: &str,
        purchase_amount: Amount,
        package_ref: &str,
        event_ref: &str,
    ) -> DistributionResult<DistributionSummary> {
        self.run(TriggerEvent {
            kind: PayoutKind::LevelIncome,
            source_user_id: buyer_id,
            amount: purchase_amount,
            event_ref,
            package_ref: Some(package_ref),
        })
        .await
    }

    /// ROI-on-ROI for a return credit, paid up the recipient's upline with
    /// the same schedule as level income.
    pub async fn distribute_on_return(
        &self,
        recipient_id: &str,
        return_amount: Amount,
        event_ref: &str,
    ) -> DistributionResult<DistributionSummary> {
        self.run(TriggerEvent {
            kind: PayoutKind::RoiOnRoi,
            source_user_id: recipient_id,
            amount: return_amount,
            event_ref,
            package_ref: None,
        })
        .await
    }

    async fn run(&self, event: TriggerEvent<'_>) -> DistributionResult<DistributionSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "distribution",
            run_id = %run_id,
            kind = event.kind.as_str(),
            source = event.source_user_id,
            event_ref = event.event_ref,
        );

        async {
            let result = self.execute(&event).await;
            self.audit(&run_id, &event, &result).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, event: &TriggerEvent<'_>) -> DistributionResult<DistributionSummary> {
        let mut phase = PhaseTracker::new();
        let mut summary = DistributionSummary::default();

        phase.enter(DistributionPhase::ResolvingConfig);
        let schedule = self.resolver.resolve().await?;

        let gate = event.gate(&schedule);
        if let Some(reason) = &gate {
            info!(reason = %reason, amount = %format_amount(event.amount), "Event gated, no level will be paid");
        }

        phase.enter(DistributionPhase::Walking);
        let mut walker =
            SponsorChainWalker::new(self.directory.as_ref(), event.source_user_id, schedule.max_levels);

        loop {
            let link = match walker.next().await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) => {
                    warn!(level = e.level, account = %e.account_id, error = %e, "Sponsor chain read failed");
                    summary.skipped(
                        e.level,
                        &e.account_id,
                        SkipReason::DirectoryReadFailed {
                            detail: format!("{:#}", e.cause),
                        },
                    );
                    break;
                }
            };
            let level = link.level;

            if let Some(reason) = &gate {
                summary.skipped(level, &link.account_id, reason.clone());
                continue;
            }

            phase.enter(DistributionPhase::Evaluating);
            if let Eligibility::Ineligible(reason) = evaluate(link.account.as_ref(), level, &schedule) {
                debug!(level, recipient = %link.account_id, reason = %reason, "Level skipped");
                summary.skipped(level, &link.account_id, reason.into());
                continue;
            }

            phase.enter(DistributionPhase::Calculating);
            let percentage = schedule.percentage_for(level).unwrap_or(0);
            let amount = commission_amount(event.amount, percentage);
            if amount <= 0 {
                summary.skipped(level, &link.account_id, SkipReason::ZeroAmount);
                continue;
            }

            phase.enter(DistributionPhase::Crediting);
            let request = CreditRequest {
                recipient_id: link.account_id.clone(),
                source_user_id: event.source_user_id.to_string(),
                amount,
                level,
                kind: event.kind,
                event_ref: event.event_ref.to_string(),
                package_ref: event.package_ref.map(str::to_string),
            };
            match self.ledger.credit(&request).await {
                CreditOutcome::Recorded { payout_id } => {
                    debug!(level, recipient = %link.account_id, amount = %format_amount(amount), "Level paid");
                    summary.paid(level, &link.account_id, amount, payout_id);
                }
                CreditOutcome::Duplicate => {
                    debug!(level, recipient = %link.account_id, "Level already paid");
                    summary.skipped(level, &link.account_id, SkipReason::AlreadyPaid);
                }
                CreditOutcome::Failed { reason } => {
                    warn!(level, recipient = %link.account_id, reason = %reason, "Payout write failed");
                    summary.skipped(
                        level,
                        &link.account_id,
                        SkipReason::WriteFailed { detail: reason },
                    );
                }
            }
        }

        phase.enter(DistributionPhase::Done);
        info!(
            levels_paid = summary.levels_paid,
            levels_skipped = summary.levels_skipped,
            total = %format_amount(summary.total_amount),
            "Distribution complete"
        );
        Ok(summary)
    }

    async fn audit(
        &self,
        run_id: &str,
        event: &TriggerEvent<'_>,
        result: &DistributionResult<DistributionSummary>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };

        let (status, error, summary) = match result {
            Ok(summary) => (RunStatus::Completed, None, summary.clone()),
            Err(e) => (
                RunStatus::ConfigMissing,
                Some(e.to_string()),
                DistributionSummary::default(),
            ),
        };

        let run = DistributionRun {
            run_id: run_id.to_string(),
            kind: event.kind,
            source_user_id: event.source_user_id.to_string(),
            event_ref: event.event_ref.to_string(),
            status,
            error,
            summary,
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Err(e) = audit.record_run(&run).await {
            error!(error = %e, "Failed to persist distribution run");
        }
    }
}
