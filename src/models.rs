use crate::money::{serde_decimal, Amount};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Account identifiers are opaque strings owned by the user directory.
pub type AccountId = String;

/// A participant in the sponsor tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub sponsor_id: Option<AccountId>,
    pub direct_count: u32,
    /// At least one package is currently active
    pub is_active: bool,
    #[serde(with = "serde_decimal")]
    pub balance: Amount,
    #[serde(with = "serde_decimal")]
    pub total_earnings: Amount,
}

/// Payout kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    LevelIncome,
    RoiOnRoi,
}

impl PayoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutKind::LevelIncome => "level_income",
            PayoutKind::RoiOnRoi => "roi_on_roi",
        }
    }

    /// Reference type recorded alongside payouts of this kind.
    pub fn reference_type(&self) -> ReferenceType {
        match self {
            PayoutKind::LevelIncome => ReferenceType::PackagePurchase,
            PayoutKind::RoiOnRoi => ReferenceType::RoiCredit,
        }
    }
}

impl FromStr for PayoutKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "level_income" => Ok(PayoutKind::LevelIncome),
            "roi_on_roi" => Ok(PayoutKind::RoiOnRoi),
            other => bail!("unknown payout kind {}", other),
        }
    }
}

/// What kind of business event an event reference names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    PackagePurchase,
    RoiCredit,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::PackagePurchase => "package_purchase",
            ReferenceType::RoiCredit => "roi_credit",
        }
    }

}

impl FromStr for ReferenceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "package_purchase" => Ok(ReferenceType::PackagePurchase),
            "roi_credit" => Ok(ReferenceType::RoiCredit),
            other => bail!("unknown reference type {}", other),
        }
    }
}

/// One row of the payout ledger.
///
/// Unique on (recipient_id, reference_id, reference_type, level, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: i64,
    pub recipient_id: AccountId,
    pub source_user_id: AccountId,
    pub kind: PayoutKind,
    pub level: u32,
    #[serde(with = "serde_decimal")]
    pub amount: Amount,
    pub reference_id: String,
    pub reference_type: ReferenceType,
    pub package_ref: Option<String>,
    pub created_at: i64,
}

/// A package held by an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub account_id: AccountId,
    pub package_ref: String,
    #[serde(with = "serde_decimal")]
    pub amount: Amount,
    pub status: String, // "active" or "inactive"
    pub activated_at: i64,
    pub expires_at: Option<i64>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub schedule_path: Option<String>,
    pub bind_addr: String,
    pub busy_timeout_ms: u64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_path = std::env::var("COMMISSION_DB_PATH")
            .unwrap_or_else(|_| "./commission.db".to_string());

        let schedule_path = std::env::var("COMMISSION_SCHEDULE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty());

        let bind_addr =
            std::env::var("COMMISSION_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let busy_timeout_ms = std::env::var("COMMISSION_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        Self {
            database_path,
            schedule_path,
            bind_addr,
            busy_timeout_ms,
        }
    }
}
