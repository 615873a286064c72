//! Eligibility Evaluator
//!
//! Decides whether an ancestor may be paid at a given level. Checks run in
//! order and stop at the first failure:
//! 1. the account exists
//! 2. it holds an active package (when the schedule requires it)
//! 3. its direct-recruit count unlocks the level (when the schedule requires it)

use super::schedule::CommissionSchedule;
use crate::models::Account;
use crate::store::AccountDirectory;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IneligibleReason {
    NotFound,
    NoActivePackage,
    LevelLocked { level: u32, required: u32, has: u32 },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::NotFound => write!(f, "not found"),
            IneligibleReason::NoActivePackage => write!(f, "no active package"),
            IneligibleReason::LevelLocked {
                level,
                required,
                has,
            } => write!(f, "level {level} requires {required} directs, has {has}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Decide from an already-loaded directory record.
pub fn evaluate(account: Option<&Account>, level: u32, schedule: &CommissionSchedule) -> Eligibility {
    let Some(account) = account else {
        return Eligibility::Ineligible(IneligibleReason::NotFound);
    };

    if schedule.require_active_status && !account.is_active {
        return Eligibility::Ineligible(IneligibleReason::NoActivePackage);
    }

    // N direct recruits unlock levels 1..=N
    if schedule.require_level_unlock && account.direct_count < level {
        return Eligibility::Ineligible(IneligibleReason::LevelLocked {
            level,
            required: level,
            has: account.direct_count,
        });
    }

    Eligibility::Eligible
}

/// Read-and-decide wrapper over an `AccountDirectory`.
///
/// Entry point for library callers outside a distribution run, e.g. showing
/// a member whether an upline would qualify at a level before an event is
/// submitted. The orchestrator does not go through it: it calls [`evaluate`]
/// on the record the chain walker already loaded, so each ancestor is read
/// once per level.
#[derive(Clone)]
pub struct EligibilityEvaluator {
    directory: Arc<dyn AccountDirectory>,
}

impl EligibilityEvaluator {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    pub async fn is_eligible(
        &self,
        ancestor_id: &str,
        level: u32,
        schedule: &CommissionSchedule,
    ) -> Result<Eligibility> {
        let account = self.directory.account(ancestor_id).await?;
        Ok(evaluate(account.as_ref(), level, schedule))
    }
}
