//! Integration tests for commission distribution
//!
//! Drive the public library API end to end against real SQLite databases:
//! in-memory for single-connection cases, a temp file when several
//! connections must race on the same ledger.

use anyhow::Result;
use mlm_commission_engine::commission::{
    ConfigResolver, DecimalValue, DistributionError, DistributionOrchestrator, ScheduleDocument,
    SkipReason, StaticScheduleSource, TomlScheduleSource,
};
use mlm_commission_engine::models::{Account, PayoutKind, ReferenceType};
use mlm_commission_engine::money::{parse_amount, Amount};
use mlm_commission_engine::store::{
    AccountDirectory, CommissionDb, CreditOutcome, CreditRequest, PayoutLedger, RunStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn amt(s: &str) -> Amount {
    parse_amount(s).unwrap()
}

fn schedule(pcts: &[&str]) -> ScheduleDocument {
    ScheduleDocument {
        version: None,
        max_levels: pcts.len() as u32,
        level_percentages: pcts.iter().map(|p| DecimalValue::Text(p.to_string())).collect(),
        require_level_unlock: false,
        require_active_status: false,
        min_package_amount: DecimalValue::Integer(0),
    }
}

/// `buyer -> a1 -> a2 -> ... -> a{depth}`, a{depth} at the top.
async fn build_chain(db: &CommissionDb, depth: usize) {
    db.register_account(&format!("a{depth}"), None).await.unwrap();
    for level in (1..depth).rev() {
        let sponsor = format!("a{}", level + 1);
        db.register_account(&format!("a{level}"), Some(&sponsor))
            .await
            .unwrap();
    }
    db.register_account("buyer", Some("a1")).await.unwrap();
}

async fn add_recruits(db: &CommissionDb, sponsor: &str, count: usize) {
    for i in 0..count {
        db.register_account(&format!("{sponsor}-recruit-{i}"), Some(sponsor))
            .await
            .unwrap();
    }
}

async fn balance(db: &CommissionDb, id: &str) -> Amount {
    db.get_account(id).await.unwrap().unwrap().balance
}

async fn three_level_setup() -> Arc<CommissionDb> {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;
    db.load_schedule(&schedule(&["10", "5", "3"])).await.unwrap();
    db
}

#[tokio::test]
async fn test_purchase_pays_each_level_its_percentage() {
    let db = three_level_setup().await;
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-1")
        .await
        .unwrap();

    assert_eq!(summary.levels_paid, 3);
    assert_eq!(summary.levels_skipped, 0);
    assert_eq!(summary.total_amount, amt("180"));

    let lines: Vec<(u32, &str, String)> = summary
        .details
        .iter()
        .map(|d| (d.level, d.recipient_id.as_str(), d.amount_or_reason()))
        .collect();
    assert_eq!(
        lines,
        vec![
            (1, "a1", "100.00".to_string()),
            (2, "a2", "50.00".to_string()),
            (3, "a3", "30.00".to_string()),
        ]
    );

    assert_eq!(balance(&db, "a1").await, amt("100"));
    assert_eq!(balance(&db, "a2").await, amt("50"));
    assert_eq!(balance(&db, "a3").await, amt("30"));
    assert_eq!(balance(&db, "buyer").await, 0);

    let a1 = db.get_account("a1").await.unwrap().unwrap();
    assert_eq!(a1.total_earnings, amt("100"));

    let payouts = db.payouts_for_event("order-1").await.unwrap();
    assert_eq!(payouts.len(), 3);
    for (payout, detail) in payouts.iter().zip(&summary.details) {
        assert_eq!(payout.kind, PayoutKind::LevelIncome);
        assert_eq!(payout.reference_type, ReferenceType::PackagePurchase);
        assert_eq!(payout.source_user_id, "buyer");
        assert_eq!(payout.package_ref.as_deref(), Some("gold"));
        assert_eq!(Some(payout.amount), detail.paid_amount());
        assert_eq!(payout.level, detail.level);
    }
}

#[tokio::test]
async fn test_rerun_of_same_event_pays_nothing() {
    let db = three_level_setup().await;
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-1")
        .await
        .unwrap();
    let again = orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-1")
        .await
        .unwrap();

    assert_eq!(again.levels_paid, 0);
    assert_eq!(again.levels_skipped, 3);
    assert_eq!(again.total_amount, 0);
    assert!(again
        .details
        .iter()
        .all(|d| d.skip_reason() == Some(&SkipReason::AlreadyPaid)));

    assert_eq!(balance(&db, "a1").await, amt("100"));
    assert_eq!(db.payouts_for_event("order-1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_walk_stops_at_max_levels_on_deep_chain() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 50).await;
    db.load_schedule(&schedule(&["1"; 30])).await.unwrap();

    let summary = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("100"), "gold", "order-deep")
        .await
        .unwrap();

    assert_eq!(summary.details.len(), 30);
    assert_eq!(summary.levels_paid, 30);
    assert_eq!(summary.details.last().unwrap().recipient_id, "a30");
    assert_eq!(balance(&db, "a30").await, amt("1"));
    assert_eq!(balance(&db, "a31").await, 0);
    assert_eq!(balance(&db, "a50").await, 0);
}

#[tokio::test]
async fn test_level_unlock_requires_direct_recruits() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 5).await;
    // a{k} already sponsors one account in the chain; top up to k directs,
    // except a5 which stops at 3
    for k in 2..=4usize {
        add_recruits(&db, &format!("a{k}"), k - 1).await;
    }
    add_recruits(&db, "a5", 2).await;

    let mut doc = schedule(&["10", "5", "3", "2", "1"]);
    doc.require_level_unlock = true;
    db.load_schedule(&doc).await.unwrap();

    let summary = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-unlock")
        .await
        .unwrap();

    assert_eq!(summary.levels_paid, 4);
    assert_eq!(summary.levels_skipped, 1);
    assert_eq!(summary.total_amount, amt("200"));

    let level5 = summary.level(5).unwrap();
    assert_eq!(level5.recipient_id, "a5");
    assert_eq!(level5.amount_or_reason(), "level 5 requires 5 directs, has 3");
    assert_eq!(balance(&db, "a5").await, 0);
    assert!(db
        .payouts_for_recipient("a5", 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_inactive_ancestor_is_skipped_when_required() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;
    db.activate_package("a1", "starter", amt("100"), None).await.unwrap();
    db.activate_package("a3", "starter", amt("100"), None).await.unwrap();

    let mut doc = schedule(&["10", "5", "3"]);
    doc.require_active_status = true;
    db.load_schedule(&doc).await.unwrap();

    let summary = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-active")
        .await
        .unwrap();

    assert_eq!(summary.levels_paid, 2);
    assert_eq!(
        summary.level(2).unwrap().skip_reason(),
        Some(&SkipReason::NoActivePackage)
    );
    assert_eq!(summary.level(2).unwrap().amount_or_reason(), "no active package");
    assert_eq!(balance(&db, "a3").await, amt("30"));
}

#[tokio::test]
async fn test_total_paid_never_exceeds_schedule_share() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;
    db.load_schedule(&schedule(&["33.33333333", "33.33333333", "33.33333334"]))
        .await
        .unwrap();
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    for (i, raw) in ["0.00000007", "1", "333.33", "999.99999999", "12345.6789"]
        .iter()
        .enumerate()
    {
        let purchase = amt(raw);
        let event = format!("order-c{i}");
        let summary = orchestrator
            .distribute_on_purchase("buyer", purchase, "gold", &event)
            .await
            .unwrap();

        assert!(summary.total_amount <= purchase, "{raw}: paid more than purchased");
        assert_eq!(
            db.total_paid_for_event(&event).await.unwrap(),
            summary.total_amount
        );
        let summed: Amount = summary.details.iter().filter_map(|d| d.paid_amount()).sum();
        assert_eq!(summed, summary.total_amount);
    }
}

#[tokio::test]
async fn test_chain_top_ends_walk() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    db.register_account("root", None).await.unwrap();
    db.register_account("buyer", Some("root")).await.unwrap();
    db.load_schedule(&schedule(&["10", "5", "3", "2", "1"]))
        .await
        .unwrap();
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-top")
        .await
        .unwrap();
    assert_eq!(summary.details.len(), 1);
    assert_eq!(summary.total_amount, amt("100"));

    // root has no upline at all
    let summary = orchestrator
        .distribute_on_purchase("root", amt("1000"), "gold", "order-root")
        .await
        .unwrap();
    assert!(summary.details.is_empty());
    assert_eq!(summary.levels_paid, 0);
}

#[tokio::test]
async fn test_unknown_buyer_yields_empty_summary() {
    let db = three_level_setup().await;
    let summary = DistributionOrchestrator::from_db(db)
        .distribute_on_purchase("nobody", amt("1000"), "gold", "order-ghost")
        .await
        .unwrap();
    assert!(summary.details.is_empty());
}

#[tokio::test]
async fn test_gated_events_skip_every_level() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;
    let mut doc = schedule(&["10", "5", "3"]);
    doc.min_package_amount = DecimalValue::Text("50".into());
    db.load_schedule(&doc).await.unwrap();
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    let below = orchestrator
        .distribute_on_purchase("buyer", amt("49.99"), "gold", "order-small")
        .await
        .unwrap();
    assert_eq!(below.levels_paid, 0);
    assert_eq!(below.levels_skipped, 3);
    assert!(below.details.iter().all(|d| matches!(
        d.skip_reason(),
        Some(SkipReason::BelowMinimum { minimum }) if *minimum == amt("50")
    )));

    let zero = orchestrator
        .distribute_on_purchase("buyer", 0, "gold", "order-zero")
        .await
        .unwrap();
    assert!(zero
        .details
        .iter()
        .all(|d| d.skip_reason() == Some(&SkipReason::NonPositiveAmount)));

    let negative = orchestrator
        .distribute_on_return("buyer", amt("-5"), "roi-neg")
        .await
        .unwrap();
    assert_eq!(negative.levels_skipped, 3);

    for event in ["order-small", "order-zero", "roi-neg"] {
        assert!(db.payouts_for_event(event).await.unwrap().is_empty());
    }
    assert_eq!(balance(&db, "a1").await, 0);
}

#[tokio::test]
async fn test_oversized_amount_is_gated_before_any_credit() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;
    db.load_schedule(&schedule(&["100", "100", "100"])).await.unwrap();
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("50000000000"), "gold", "order-huge")
        .await
        .unwrap();
    assert_eq!(summary.levels_paid, 0);
    assert_eq!(summary.levels_skipped, 3);
    assert!(summary.details.iter().all(|d| matches!(
        d.skip_reason(),
        Some(SkipReason::AmountTooLarge { maximum }) if *maximum == Amount::MAX / 3
    )));
    assert!(db.payouts_for_event("order-huge").await.unwrap().is_empty());
    assert_eq!(balance(&db, "a1").await, 0);

    let runs = db.distribution_runs_for_event("order-huge").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);

    // just under the cap still pays every level in full
    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("30000000000"), "gold", "order-big")
        .await
        .unwrap();
    assert_eq!(summary.levels_paid, 3);
    assert_eq!(summary.total_amount, amt("90000000000"));
    assert_eq!(balance(&db, "a3").await, amt("30000000000"));
}

#[tokio::test]
async fn test_sub_unit_payout_is_skipped_as_zero() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 2).await;
    db.load_schedule(&schedule(&["50", "0"])).await.unwrap();

    let summary = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", 3, "gold", "order-tiny")
        .await
        .unwrap();

    assert_eq!(summary.level(1).unwrap().paid_amount(), Some(1));
    assert_eq!(
        summary.level(2).unwrap().skip_reason(),
        Some(&SkipReason::ZeroAmount)
    );
    assert_eq!(db.payouts_for_event("order-tiny").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_schedule_fails_without_payouts() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 3).await;

    let err = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-nocfg")
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::ConfigMissing(_)));
    assert!(db.payouts_for_event("order-nocfg").await.unwrap().is_empty());

    let runs = db.distribution_runs_for_event("order-nocfg").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::ConfigMissing);
    assert!(runs[0].error.is_some());
}

#[tokio::test]
async fn test_invalid_schedule_is_config_missing() {
    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 2).await;

    let doc = schedule(&["10", "150"]);
    let orchestrator = DistributionOrchestrator::new(
        ConfigResolver::new(Arc::new(StaticScheduleSource::new(doc))),
        db.clone(),
        db.clone(),
    );

    let err = orchestrator
        .distribute_on_return("buyer", amt("10"), "roi-bad")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("outside 0..=100"));
    assert_eq!(balance(&db, "a1").await, 0);
}

#[tokio::test]
async fn test_schedule_read_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedule.toml");
    std::fs::write(
        &path,
        r#"
max_levels = 2
level_percentages = ["12.5", 2]
require_level_unlock = false
require_active_status = false
min_package_amount = "0"
"#,
    )
    .unwrap();

    let db = Arc::new(CommissionDb::in_memory().unwrap());
    build_chain(&db, 2).await;
    let orchestrator = DistributionOrchestrator::new(
        ConfigResolver::new(Arc::new(TomlScheduleSource::new(&path))),
        db.clone(),
        db.clone(),
    );

    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("80"), "gold", "order-toml")
        .await
        .unwrap();
    assert_eq!(summary.level(1).unwrap().amount_or_reason(), "10.00");
    assert_eq!(summary.level(2).unwrap().amount_or_reason(), "1.60");
}

#[tokio::test]
async fn test_return_pays_roi_on_roi_once() {
    let db = three_level_setup().await;
    let orchestrator = DistributionOrchestrator::from_db(db.clone());

    orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "evt-7")
        .await
        .unwrap();
    // same reference, different kind: counted separately
    let summary = orchestrator
        .distribute_on_return("buyer", amt("200"), "evt-7")
        .await
        .unwrap();

    assert_eq!(summary.levels_paid, 3);
    assert_eq!(summary.total_amount, amt("36"));
    assert_eq!(balance(&db, "a1").await, amt("120"));

    let roi: Vec<_> = db
        .payouts_for_event("evt-7")
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.kind == PayoutKind::RoiOnRoi)
        .collect();
    assert_eq!(roi.len(), 3);
    assert!(roi.iter().all(|p| p.reference_type == ReferenceType::RoiCredit));
    assert!(roi.iter().all(|p| p.package_ref.is_none()));

    // no cascade: a second identical return changes nothing
    let again = orchestrator
        .distribute_on_return("buyer", amt("200"), "evt-7")
        .await
        .unwrap();
    assert_eq!(again.levels_paid, 0);
    assert_eq!(db.payouts_for_event("evt-7").await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_completed_run_lands_in_audit_log() {
    let db = three_level_setup().await;
    let summary = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-audit")
        .await
        .unwrap();

    let runs = db.distribution_runs_for_event("order-audit").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].kind, PayoutKind::LevelIncome);
    assert_eq!(runs[0].source_user_id, "buyer");
    assert_eq!(runs[0].summary, summary);
}

/// Ledger that refuses one level and forwards everything else.
struct FailingLevelLedger {
    inner: Arc<CommissionDb>,
    fail_level: u32,
}

#[async_trait::async_trait]
impl PayoutLedger for FailingLevelLedger {
    async fn credit(&self, request: &CreditRequest) -> CreditOutcome {
        if request.level == self.fail_level {
            return CreditOutcome::Failed {
                reason: "ledger offline".to_string(),
            };
        }
        self.inner.credit(request).await
    }
}

#[tokio::test]
async fn test_write_failure_skips_only_that_level() {
    let db = three_level_setup().await;
    let flaky = DistributionOrchestrator::new(
        ConfigResolver::new(db.clone()),
        db.clone(),
        Arc::new(FailingLevelLedger {
            inner: db.clone(),
            fail_level: 2,
        }),
    );

    let summary = flaky
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-flaky")
        .await
        .unwrap();
    assert_eq!(summary.levels_paid, 2);
    assert_eq!(summary.total_amount, amt("130"));
    assert_eq!(
        summary.level(2).unwrap().skip_reason(),
        Some(&SkipReason::WriteFailed {
            detail: "ledger offline".to_string()
        })
    );
    assert_eq!(balance(&db, "a2").await, 0);

    // retrying with a healthy ledger pays exactly the missing level
    let retry = DistributionOrchestrator::from_db(db.clone())
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-flaky")
        .await
        .unwrap();
    assert_eq!(retry.levels_paid, 1);
    assert_eq!(retry.level(2).unwrap().paid_amount(), Some(amt("50")));
    assert_eq!(
        retry.level(1).unwrap().skip_reason(),
        Some(&SkipReason::AlreadyPaid)
    );
    assert_eq!(balance(&db, "a2").await, amt("50"));
}

/// Directory whose reads fail for one account.
struct UnreadableAccount {
    inner: Arc<CommissionDb>,
    broken_id: &'static str,
}

#[async_trait::async_trait]
impl AccountDirectory for UnreadableAccount {
    async fn account(&self, id: &str) -> Result<Option<Account>> {
        if id == self.broken_id {
            anyhow::bail!("replica lagging");
        }
        self.inner.get_account(id).await
    }
}

#[tokio::test]
async fn test_directory_failure_ends_walk_at_that_level() {
    let db = three_level_setup().await;
    let orchestrator = DistributionOrchestrator::new(
        ConfigResolver::new(db.clone()),
        Arc::new(UnreadableAccount {
            inner: db.clone(),
            broken_id: "a2",
        }),
        db.clone(),
    );

    let summary = orchestrator
        .distribute_on_purchase("buyer", amt("1000"), "gold", "order-dir")
        .await
        .unwrap();
    assert_eq!(summary.details.len(), 2);
    assert_eq!(summary.levels_paid, 1);
    let level2 = summary.level(2).unwrap();
    assert_eq!(level2.recipient_id, "a2");
    assert!(matches!(
        level2.skip_reason(),
        Some(SkipReason::DirectoryReadFailed { detail }) if detail.contains("replica lagging")
    ));
    assert_eq!(balance(&db, "a3").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_credit_shared_ancestor_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commission.db");
    let path = path.to_str().unwrap();

    let setup = CommissionDb::new(path).unwrap();
    setup.register_account("root", None).await.unwrap();
    setup.register_account("mid", Some("root")).await.unwrap();
    for i in 0..16 {
        setup
            .register_account(&format!("buyer-{i}"), Some("mid"))
            .await
            .unwrap();
    }
    setup.load_schedule(&schedule(&["10", "5"])).await.unwrap();

    // two connections racing on the same file
    let handles = [
        Arc::new(CommissionDb::open(path, Duration::from_secs(10)).unwrap()),
        Arc::new(CommissionDb::open(path, Duration::from_secs(10)).unwrap()),
    ];

    let mut tasks = Vec::new();
    for i in 0..16 {
        let orchestrator = DistributionOrchestrator::from_db(handles[i % 2].clone());
        tasks.push(tokio::spawn(async move {
            orchestrator
                .distribute_on_purchase(&format!("buyer-{i}"), amt("100"), "gold", &format!("order-{i}"))
                .await
        }));
    }
    for task in tasks {
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.levels_paid, 2);
    }

    assert_eq!(balance(&setup, "mid").await, amt("160"));
    assert_eq!(balance(&setup, "root").await, amt("80"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_of_one_event_pay_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commission.db");
    let path = path.to_str().unwrap();

    let setup = CommissionDb::new(path).unwrap();
    build_chain(&setup, 3).await;
    setup.load_schedule(&schedule(&["10", "5", "3"])).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let db = Arc::new(CommissionDb::open(path, Duration::from_secs(10)).unwrap());
        tasks.push(tokio::spawn(async move {
            DistributionOrchestrator::from_db(db)
                .distribute_on_purchase("buyer", amt("1000"), "gold", "order-race")
                .await
        }));
    }

    let mut paid = 0;
    for task in tasks {
        paid += task.await.unwrap().unwrap().levels_paid;
    }
    assert_eq!(paid, 3);
    assert_eq!(balance(&setup, "a1").await, amt("100"));
    assert_eq!(setup.total_paid_for_event("order-race").await.unwrap(), amt("180"));
}
