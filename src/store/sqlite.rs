//! SQLite Commission Store
//!
//! One database backs every collaborator the engine needs:
//! - `accounts` / `packages` - the user directory (sponsor tree, active flag)
//! - `commission_schedules` - versioned schedules, at most one active
//! - `payouts` - the ledger, unique on (recipient, reference, level, kind)
//! - `distribution_runs` - audit log of finished runs
//!
//! Balance changes are always `balance = balance + ?` inside the same
//! IMMEDIATE transaction as the payout insert, so concurrent credits to a
//! shared ancestor never lose updates and a duplicate payout never moves
//! money.

use super::{
    AccountDirectory, AuditLog, CreditOutcome, CreditRequest, DistributionRun, PayoutLedger,
    RunStatus,
};
use crate::commission::orchestrator::{DistributionSummary, LevelDetail};
use crate::commission::schedule::{ScheduleDocument, ScheduleSource};
use crate::commission::ScheduleError;
use crate::models::{Account, Package, PayoutKind, PayoutRecord};
use crate::money::Amount;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    sponsor_id TEXT REFERENCES accounts(id),
    direct_count INTEGER NOT NULL DEFAULT 0,
    balance INTEGER NOT NULL DEFAULT 0,
    total_earnings INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_sponsor ON accounts(sponsor_id);

CREATE TABLE IF NOT EXISTS packages (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    package_ref TEXT NOT NULL,
    amount INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    activated_at INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (account_id, package_ref)
);

CREATE TABLE IF NOT EXISTS commission_schedules (
    version INTEGER PRIMARY KEY AUTOINCREMENT,
    document_json TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- At most one active schedule
CREATE UNIQUE INDEX IF NOT EXISTS idx_commission_schedules_active
    ON commission_schedules(is_active) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS payouts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id TEXT NOT NULL,
    source_user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    level INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    reference_id TEXT NOT NULL,
    reference_type TEXT NOT NULL,
    package_ref TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (recipient_id, reference_id, reference_type, level, kind)
);

CREATE INDEX IF NOT EXISTS idx_payouts_recipient ON payouts(recipient_id, id DESC);
CREATE INDEX IF NOT EXISTS idx_payouts_reference ON payouts(reference_id, level);

CREATE TABLE IF NOT EXISTS distribution_runs (
    run_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    source_user_id TEXT NOT NULL,
    event_ref TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    levels_paid INTEGER NOT NULL,
    levels_skipped INTEGER NOT NULL,
    total_amount INTEGER NOT NULL,
    details_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_distribution_runs_event
    ON distribution_runs(event_ref, created_at);
"#;

const PAYOUT_COLUMNS: &str = "id, recipient_id, source_user_id, kind, level, amount, \
     reference_id, reference_type, package_ref, created_at";

#[derive(Clone)]
pub struct CommissionDb {
    conn: Arc<Mutex<Connection>>,
}

impl CommissionDb {
    pub fn new(db_path: &str) -> Result<Self> {
        Self::open(db_path, Duration::from_millis(5000))
    }

    pub fn open(db_path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open commission db at {}", db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(busy_timeout)?;
        let db = Self::init(conn)?;
        info!("📒 Commission database ready at: {}", db_path);
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize commission schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Accounts ───────────────────────────────────────────────

    /// Register an account under `sponsor_id` and bump the sponsor's
    /// direct-recruit count.
    pub async fn register_account(&self, id: &str, sponsor_id: Option<&str>) -> Result<Account> {
        let id = id.trim();
        if id.is_empty() {
            bail!("account id must not be empty");
        }
        if sponsor_id == Some(id) {
            bail!("account {} cannot sponsor itself", id);
        }

        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if exists {
            bail!("account {} already exists", id);
        }

        if let Some(sponsor) = sponsor_id {
            let bumped = tx.execute(
                "UPDATE accounts SET direct_count = direct_count + 1, updated_at = ?1 WHERE id = ?2",
                params![now, sponsor],
            )?;
            if bumped == 0 {
                bail!("unknown sponsor {}", sponsor);
            }
        }

        tx.execute(
            "INSERT INTO accounts (id, sponsor_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, sponsor_id, now],
        )
        .context("insert account")?;
        tx.commit()?;

        debug!(account = id, sponsor = ?sponsor_id, "Registered account");
        Ok(Account {
            id: id.to_string(),
            sponsor_id: sponsor_id.map(str::to_string),
            direct_count: 0,
            is_active: false,
            balance: 0,
            total_earnings: 0,
        })
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.sponsor_id, a.direct_count, a.balance, a.total_earnings,
                    EXISTS(SELECT 1 FROM packages p
                           WHERE p.account_id = a.id AND p.status = 'active'
                             AND (p.expires_at IS NULL OR p.expires_at > ?2))
             FROM accounts a WHERE a.id = ?1",
        )?;
        let account = stmt
            .query_row(params![id, now], |row| {
                Ok(Account {
                    id: row.get(0)?,
                    sponsor_id: row.get(1)?,
                    direct_count: row.get(2)?,
                    balance: row.get(3)?,
                    total_earnings: row.get(4)?,
                    is_active: row.get(5)?,
                })
            })
            .optional()?;
        Ok(account)
    }

    // ── Packages ───────────────────────────────────────────────

    pub async fn activate_package(
        &self,
        account_id: &str,
        package_ref: &str,
        amount: Amount,
        expires_at: Option<i64>,
    ) -> Result<Package> {
        if amount < 0 {
            bail!("package amount must not be negative");
        }
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO packages (account_id, package_ref, amount, status, activated_at, expires_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)
             ON CONFLICT(account_id, package_ref) DO UPDATE SET
                amount = excluded.amount,
                status = 'active',
                activated_at = excluded.activated_at,
                expires_at = excluded.expires_at",
            params![account_id, package_ref, amount, now, expires_at],
        )
        .with_context(|| format!("activate package {} for {}", package_ref, account_id))?;

        Ok(Package {
            account_id: account_id.to_string(),
            package_ref: package_ref.to_string(),
            amount,
            status: "active".to_string(),
            activated_at: now,
            expires_at,
        })
    }

    pub async fn deactivate_package(&self, account_id: &str, package_ref: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE packages SET status = 'inactive' WHERE account_id = ?1 AND package_ref = ?2",
            params![account_id, package_ref],
        )?;
        if changed == 0 {
            bail!("package {} not found for {}", package_ref, account_id);
        }
        Ok(())
    }

    pub async fn packages_for(&self, account_id: &str) -> Result<Vec<Package>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, package_ref, amount, status, activated_at, expires_at
             FROM packages WHERE account_id = ?1 ORDER BY activated_at ASC, package_ref ASC",
        )?;
        let packages = stmt
            .query_map([account_id], |row| {
                Ok(Package {
                    account_id: row.get(0)?,
                    package_ref: row.get(1)?,
                    amount: row.get(2)?,
                    status: row.get(3)?,
                    activated_at: row.get(4)?,
                    expires_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    // ── Schedules ──────────────────────────────────────────────

    /// Store a new (inactive) schedule version. Invalid documents are rejected.
    pub async fn insert_schedule(&self, doc: &ScheduleDocument) -> Result<i64> {
        doc.validate().map_err(|e| anyhow!(e))?;
        let mut stored = doc.clone();
        stored.version = None;
        let json = serde_json::to_string(&stored)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO commission_schedules (document_json, is_active, created_at) VALUES (?1, 0, ?2)",
            params![json, Utc::now().timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn activate_schedule(&self, version: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE commission_schedules SET is_active = 0 WHERE is_active = 1",
            [],
        )?;
        let changed = tx.execute(
            "UPDATE commission_schedules SET is_active = 1 WHERE version = ?1",
            [version],
        )?;
        if changed == 0 {
            bail!("schedule version {} not found", version);
        }
        tx.commit()?;
        info!(version, "Activated commission schedule");
        Ok(())
    }

    /// Insert and activate in one step.
    pub async fn load_schedule(&self, doc: &ScheduleDocument) -> Result<i64> {
        let version = self.insert_schedule(doc).await?;
        self.activate_schedule(version).await?;
        Ok(version)
    }

    pub async fn active_schedule_document(&self) -> Result<Option<ScheduleDocument>> {
        let raw: Option<(i64, String)> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT version, document_json FROM commission_schedules WHERE is_active = 1 LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match raw {
            Some((version, json)) => {
                let mut doc = ScheduleDocument::from_json(&json).map_err(|e| anyhow!(e))?;
                doc.version = Some(version);
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    // ── Payouts ────────────────────────────────────────────────

    async fn try_credit(&self, req: &CreditRequest) -> Result<CreditOutcome> {
        if req.amount <= 0 {
            return Ok(CreditOutcome::Failed {
                reason: format!("non-positive amount {}", req.amount),
            });
        }
        // SQLite silently turns an overflowing INTEGER sum into REAL
        let headroom = Amount::MAX - req.amount;
        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO payouts (recipient_id, source_user_id, kind, level, amount,
                                  reference_id, reference_type, package_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &req.recipient_id,
                &req.source_user_id,
                req.kind.as_str(),
                req.level,
                req.amount,
                &req.event_ref,
                req.kind.reference_type().as_str(),
                req.package_ref.as_deref(),
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            // dropping `tx` rolls back
            Err(e) if is_unique_violation(&e) => return Ok(CreditOutcome::Duplicate),
            Err(e) => return Err(e).context("insert payout"),
        }
        let payout_id = tx.last_insert_rowid();

        let updated = tx
            .execute(
                "UPDATE accounts SET balance = balance + ?1,
                                     total_earnings = total_earnings + ?1,
                                     updated_at = ?2
                 WHERE id = ?3 AND balance <= ?4 AND total_earnings <= ?4",
                params![req.amount, now, &req.recipient_id, headroom],
            )
            .context("credit balance")?;
        if updated == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
                [&req.recipient_id],
                |row| row.get(0),
            )?;
            let reason = if exists {
                format!("balance overflow for {}", req.recipient_id)
            } else {
                format!("recipient {} not found", req.recipient_id)
            };
            return Ok(CreditOutcome::Failed { reason });
        }

        tx.commit().context("commit payout")?;
        Ok(CreditOutcome::Recorded { payout_id })
    }

    pub async fn payouts_for_recipient(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<PayoutRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE recipient_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![recipient_id, limit], payout_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every payout recorded for an event reference, ordered by level.
    pub async fn payouts_for_event(&self, event_ref: &str) -> Result<Vec<PayoutRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE reference_id = ?1 ORDER BY level ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([event_ref], payout_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn total_paid_for_event(&self, event_ref: &str) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let total: Amount = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payouts WHERE reference_id = ?1",
            [event_ref],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ── Audit log ──────────────────────────────────────────────

    pub async fn distribution_runs_for_event(&self, event_ref: &str) -> Result<Vec<DistributionRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, kind, source_user_id, event_ref, status, error,
                    levels_paid, levels_skipped, total_amount, details_json, created_at
             FROM distribution_runs WHERE event_ref = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let raw = stmt
            .query_map([event_ref], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, Amount>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (run_id, kind, source, event, status, error, paid, skipped, total, details, created_at) in raw {
            let kind: PayoutKind = kind
                .parse()
                .with_context(|| format!("decode kind of run {}", run_id))?;
            let status = match status.as_str() {
                "completed" => RunStatus::Completed,
                "config_missing" => RunStatus::ConfigMissing,
                other => bail!("unknown run status {} in run {}", other, run_id),
            };
            let details: Vec<LevelDetail> = serde_json::from_str(&details)
                .with_context(|| format!("decode details of run {}", run_id))?;
            out.push(DistributionRun {
                run_id,
                kind,
                source_user_id: source,
                event_ref: event,
                status,
                error,
                summary: DistributionSummary {
                    levels_paid: paid,
                    levels_skipped: skipped,
                    total_amount: total,
                    details,
                },
                created_at,
            });
        }
        Ok(out)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn payout_from_row(row: &Row<'_>) -> rusqlite::Result<PayoutRecord> {
    let kind: String = row.get(3)?;
    let reference_type: String = row.get(7)?;
    Ok(PayoutRecord {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        source_user_id: row.get(2)?,
        kind: kind
            .parse()
            .map_err(|_| rusqlite::Error::InvalidColumnType(3, "kind".into(), Type::Text))?,
        level: row.get(4)?,
        amount: row.get(5)?,
        reference_id: row.get(6)?,
        reference_type: reference_type.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(7, "reference_type".into(), Type::Text)
        })?,
        package_ref: row.get(8)?,
        created_at: row.get(9)?,
    })
}

// ── Collaborator impls ─────────────────────────────────────────

#[async_trait::async_trait]
impl AccountDirectory for CommissionDb {
    async fn account(&self, id: &str) -> Result<Option<Account>> {
        self.get_account(id).await
    }
}

#[async_trait::async_trait]
impl PayoutLedger for CommissionDb {
    async fn credit(&self, request: &CreditRequest) -> CreditOutcome {
        match self.try_credit(request).await {
            Ok(outcome) => outcome,
            Err(e) => CreditOutcome::Failed {
                reason: format!("{:#}", e),
            },
        }
    }
}

#[async_trait::async_trait]
impl ScheduleSource for CommissionDb {
    async fn active_schedule(&self) -> Result<ScheduleDocument, ScheduleError> {
        match self.active_schedule_document().await {
            Ok(Some(doc)) => Ok(doc),
            Ok(None) => Err(ScheduleError::NoActiveSchedule),
            Err(e) => Err(ScheduleError::Unavailable(format!("{:#}", e))),
        }
    }
}

#[async_trait::async_trait]
impl AuditLog for CommissionDb {
    async fn record_run(&self, run: &DistributionRun) -> Result<()> {
        let details_json = serde_json::to_string(&run.summary.details)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO distribution_runs
             (run_id, kind, source_user_id, event_ref, status, error,
              levels_paid, levels_skipped, total_amount, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &run.run_id,
                run.kind.as_str(),
                &run.source_user_id,
                &run.event_ref,
                run.status.as_str(),
                run.error.as_deref(),
                run.summary.levels_paid,
                run.summary.levels_skipped,
                run.summary.total_amount,
                details_json,
                run.created_at,
            ],
        )?;
        Ok(())
    }
}
