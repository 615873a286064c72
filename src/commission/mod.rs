//! Commission Distribution Engine
//!
//! On a purchase or a return credit, walk the source account's sponsor
//! chain and pay each eligible ancestor its level percentage, exactly once
//! per (recipient, event, level, kind).
//!
//! Components, leaf first:
//! - `schedule` - active schedule resolution and validation
//! - `chain` - bounded sponsor chain walk
//! - `eligibility` - per-level gates
//! - `calculator` - fixed-point payout arithmetic
//! - `orchestrator` - the two public distribution operations

pub mod calculator;
pub mod chain;
pub mod eligibility;
pub mod error;
pub mod orchestrator;
pub mod schedule;

pub use calculator::commission_amount;
pub use chain::{ChainLink, ChainReadError, SponsorChainWalker};
pub use eligibility::{Eligibility, EligibilityEvaluator, IneligibleReason};
pub use error::{DistributionError, DistributionResult, ScheduleError};
pub use orchestrator::{
    DistributionOrchestrator, DistributionPhase, DistributionSummary, LevelDetail, LevelOutcome,
    SkipReason,
};
pub use schedule::{
    CommissionSchedule, ConfigResolver, DecimalValue, ScheduleDocument, ScheduleSource,
    StaticScheduleSource, TomlScheduleSource, MAX_SUPPORTED_LEVELS,
};
