//! Commission Schedule
//!
//! The schedule is the only configuration the engine consumes: how many
//! upline levels are paid, the percentage for each level and the gates an
//! ancestor must pass. It is resolved once per distribution run and never
//! mutated afterwards.
//!
//! Raw payloads (`ScheduleDocument`) come from TOML files or the
//! `commission_schedules` table and are validated into a
//! `CommissionSchedule` before any level is processed. A payload that fails
//! validation is treated exactly like a missing schedule.

use super::error::{DistributionError, ScheduleError};
use crate::money::{format_amount, parse_amount, to_amount, Amount, AMOUNT_SCALE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Hard cap on traversable levels
pub const MAX_SUPPORTED_LEVELS: u32 = 30;

// =============================================================================
// RAW DOCUMENT
// =============================================================================

/// A decimal as written in a schedule payload: `"2.5"` or `2.5` or `10`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecimalValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl DecimalValue {
    pub fn to_amount(&self) -> Result<Amount, ScheduleError> {
        match self {
            DecimalValue::Text(s) => {
                parse_amount(s).map_err(|e| ScheduleError::Malformed(e.to_string()))
            }
            DecimalValue::Integer(v) => v
                .checked_mul(AMOUNT_SCALE)
                .ok_or_else(|| ScheduleError::Malformed(format!("value {v} out of range"))),
            DecimalValue::Float(v) if v.is_finite() => Ok(to_amount(*v)),
            DecimalValue::Float(v) => Err(ScheduleError::Malformed(format!("value {v} is not finite"))),
        }
    }
}

/// Unvalidated schedule payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub version: Option<i64>,
    pub max_levels: u32,
    pub level_percentages: Vec<DecimalValue>,
    #[serde(default)]
    pub require_level_unlock: bool,
    #[serde(default)]
    pub require_active_status: bool,
    #[serde(default = "default_min_package_amount")]
    pub min_package_amount: DecimalValue,
}

fn default_min_package_amount() -> DecimalValue {
    DecimalValue::Integer(0)
}

impl ScheduleDocument {
    /// Parse a TOML payload
    pub fn from_toml(contents: &str) -> Result<Self, ScheduleError> {
        toml::from_str(contents).map_err(|e| ScheduleError::Malformed(e.to_string()))
    }

    /// Parse a JSON payload
    pub fn from_json(contents: &str) -> Result<Self, ScheduleError> {
        serde_json::from_str(contents).map_err(|e| ScheduleError::Malformed(e.to_string()))
    }

    /// Validate into a usable schedule
    pub fn validate(&self) -> Result<CommissionSchedule, ScheduleError> {
        if self.max_levels == 0 || self.max_levels > MAX_SUPPORTED_LEVELS {
            return Err(ScheduleError::MaxLevelsOutOfRange {
                got: self.max_levels,
                max: MAX_SUPPORTED_LEVELS,
            });
        }
        if self.level_percentages.len() != self.max_levels as usize {
            return Err(ScheduleError::PercentageCountMismatch {
                expected: self.max_levels,
                got: self.level_percentages.len(),
            });
        }

        let mut level_percentages = Vec::with_capacity(self.level_percentages.len());
        for (idx, raw) in self.level_percentages.iter().enumerate() {
            let pct = raw.to_amount()?;
            if !(0..=100 * AMOUNT_SCALE).contains(&pct) {
                return Err(ScheduleError::PercentageOutOfRange {
                    level: idx as u32 + 1,
                    value: format_amount(pct),
                });
            }
            level_percentages.push(pct);
        }

        let min_package_amount = self.min_package_amount.to_amount()?;
        if min_package_amount < 0 {
            return Err(ScheduleError::NegativeMinimum);
        }

        Ok(CommissionSchedule {
            version: self.version,
            max_levels: self.max_levels,
            level_percentages,
            require_level_unlock: self.require_level_unlock,
            require_active_status: self.require_active_status,
            min_package_amount,
        })
    }
}

// =============================================================================
// VALIDATED SCHEDULE
// =============================================================================

/// Validated, immutable commission schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSchedule {
    pub version: Option<i64>,
    pub max_levels: u32,
    /// Fixed-point percentages, index 0 = level 1
    pub level_percentages: Vec<Amount>,
    pub require_level_unlock: bool,
    pub require_active_status: bool,
    pub min_package_amount: Amount,
}

impl CommissionSchedule {
    /// Percentage for a 1-based level
    pub fn percentage_for(&self, level: u32) -> Option<Amount> {
        if level == 0 {
            return None;
        }
        self.level_percentages.get(level as usize - 1).copied()
    }

    /// Sum of all level percentages
    pub fn total_percentage(&self) -> Amount {
        self.level_percentages.iter().sum()
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Where the active schedule comes from.
#[async_trait::async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn active_schedule(&self) -> Result<ScheduleDocument, ScheduleError>;
}

/// Reads the schedule from a TOML file on every resolve.
#[derive(Debug, Clone)]
pub struct TomlScheduleSource {
    path: PathBuf,
}

impl TomlScheduleSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl ScheduleSource for TomlScheduleSource {
    async fn active_schedule(&self) -> Result<ScheduleDocument, ScheduleError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScheduleError::NoActiveSchedule)
            }
            Err(e) => return Err(ScheduleError::Unavailable(e.to_string())),
        };
        ScheduleDocument::from_toml(&contents)
    }
}

/// Fixed in-memory schedule (tests, embedding callers).
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleSource {
    document: Option<ScheduleDocument>,
}

impl StaticScheduleSource {
    pub fn new(document: ScheduleDocument) -> Self {
        Self {
            document: Some(document),
        }
    }

    pub fn empty() -> Self {
        Self { document: None }
    }
}

#[async_trait::async_trait]
impl ScheduleSource for StaticScheduleSource {
    async fn active_schedule(&self) -> Result<ScheduleDocument, ScheduleError> {
        self.document.clone().ok_or(ScheduleError::NoActiveSchedule)
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Loads and validates the active schedule for one run.
#[derive(Clone)]
pub struct ConfigResolver {
    source: Arc<dyn ScheduleSource>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn ScheduleSource>) -> Self {
        Self { source }
    }

    /// Resolve the active schedule. Any failure is `ConfigMissing`.
    pub async fn resolve(&self) -> Result<CommissionSchedule, DistributionError> {
        let schedule = self
            .source
            .active_schedule()
            .await
            .and_then(|doc| doc.validate())
            .map_err(|e| {
                error!(error = %e, "Commission schedule unavailable");
                DistributionError::from(e)
            })?;

        debug!(
            version = ?schedule.version,
            max_levels = schedule.max_levels,
            "Resolved commission schedule"
        );
        Ok(schedule)
    }
}
