//! Commission Engine
//!
//! CLI and HTTP entrypoint for the multi-level commission distribution
//! engine. Every subcommand works against the SQLite database named by
//! `--db` / `COMMISSION_DB_PATH`.
//!
//! Usage:
//!   commission-engine init --schedule ./schedule.toml
//!   commission-engine add-account root
//!   commission-engine add-account alice --sponsor root
//!   commission-engine activate-package root starter-1 100
//!   commission-engine distribute-purchase alice 1000 gold-1 order-42
//!   commission-engine payouts --event order-42
//!   commission-engine serve --bind 0.0.0.0:8080

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mlm_commission_engine::{
    api::{create_router, AppState},
    commission::{DistributionOrchestrator, ScheduleSource, TomlScheduleSource},
    models::EngineConfig,
    money::{format_amount, parse_amount},
    store::CommissionDb,
};

#[derive(Parser, Debug)]
#[command(name = "commission-engine")]
#[command(about = "Multi-level commission distribution over a sponsor tree")]
struct Args {
    /// Path to SQLite database (overrides COMMISSION_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Listen address (overrides COMMISSION_BIND)
        #[arg(long)]
        bind: Option<String>,

        /// Schedule TOML to load and activate before serving
        #[arg(long)]
        schedule: Option<String>,
    },

    /// Create the database schema, optionally loading a schedule
    Init {
        #[arg(long)]
        schedule: Option<String>,
    },

    /// Register an account under an optional sponsor
    AddAccount {
        id: String,

        #[arg(long)]
        sponsor: Option<String>,
    },

    /// Activate (or re-activate) a package for an account
    ActivatePackage {
        account: String,
        package_ref: String,
        /// Decimal amount, e.g. "100" or "12.5"
        amount: String,

        /// Unix timestamp after which the package no longer counts as active
        #[arg(long)]
        expires_at: Option<i64>,
    },

    /// Deactivate a package
    DeactivatePackage { account: String, package_ref: String },

    /// Insert a schedule TOML as a new version and activate it
    LoadSchedule { path: String },

    /// Distribute level income for a package purchase
    DistributePurchase {
        buyer: String,
        amount: String,
        package_ref: String,
        event_ref: String,
    },

    /// Distribute ROI-on-ROI for a return credit
    DistributeReturn {
        recipient: String,
        amount: String,
        event_ref: String,
    },

    /// List payouts for an account or an event
    Payouts {
        #[arg(long, conflicts_with = "event", required_unless_present = "event")]
        account: Option<String>,

        #[arg(long)]
        event: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show an account's sponsor, directs, active flag and balances
    ShowAccount { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = EngineConfig::from_env();
    init_tracing();

    let args = Args::parse();
    if let Some(db) = args.db {
        config.database_path = db;
    }

    let db = Arc::new(CommissionDb::open(
        &config.database_path,
        Duration::from_millis(config.busy_timeout_ms),
    )?);

    match args.command {
        Commands::Serve { bind, schedule } => {
            if let Some(path) = schedule.or(config.schedule_path.clone()) {
                load_schedule_file(&db, &path).await?;
            }
            let bind = bind.unwrap_or(config.bind_addr);
            serve(db, &bind).await?;
        }
        Commands::Init { schedule } => {
            if let Some(path) = schedule.or(config.schedule_path) {
                load_schedule_file(&db, &path).await?;
            }
            info!("Database initialized at {}", config.database_path);
        }
        Commands::AddAccount { id, sponsor } => {
            let account = db.register_account(&id, sponsor.as_deref()).await?;
            print_json(&account)?;
        }
        Commands::ActivatePackage {
            account,
            package_ref,
            amount,
            expires_at,
        } => {
            let amount = parse_amount(&amount)?;
            let package = db
                .activate_package(&account, &package_ref, amount, expires_at)
                .await?;
            print_json(&package)?;
        }
        Commands::DeactivatePackage {
            account,
            package_ref,
        } => {
            db.deactivate_package(&account, &package_ref).await?;
            println!("Package {} deactivated for {}", package_ref, account);
        }
        Commands::LoadSchedule { path } => {
            let version = load_schedule_file(&db, &path).await?;
            println!("Schedule version {} is now active", version);
        }
        Commands::DistributePurchase {
            buyer,
            amount,
            package_ref,
            event_ref,
        } => {
            let amount = parse_amount(&amount)?;
            let summary = DistributionOrchestrator::from_db(db)
                .distribute_on_purchase(&buyer, amount, &package_ref, &event_ref)
                .await?;
            print_json(&summary)?;
        }
        Commands::DistributeReturn {
            recipient,
            amount,
            event_ref,
        } => {
            let amount = parse_amount(&amount)?;
            let summary = DistributionOrchestrator::from_db(db)
                .distribute_on_return(&recipient, amount, &event_ref)
                .await?;
            print_json(&summary)?;
        }
        Commands::Payouts {
            account,
            event,
            limit,
        } => {
            let payouts = match (account, event) {
                (Some(account), _) => db.payouts_for_recipient(&account, limit).await?,
                (None, Some(event)) => db.payouts_for_event(&event).await?,
                (None, None) => Vec::new(),
            };
            println!("{:<8} {:<16} {:<6} {:<12} {:>16}  {}", "id", "recipient", "level", "kind", "amount", "reference");
            for p in &payouts {
                println!(
                    "{:<8} {:<16} {:<6} {:<12} {:>16}  {}",
                    p.id,
                    p.recipient_id,
                    p.level,
                    p.kind.as_str(),
                    format_amount(p.amount),
                    p.reference_id
                );
            }
        }
        Commands::ShowAccount { id } => {
            let account = db
                .get_account(&id)
                .await?
                .with_context(|| format!("Account {} not found", id))?;
            print_json(&account)?;
        }
    }

    Ok(())
}

async fn load_schedule_file(db: &CommissionDb, path: &str) -> Result<i64> {
    let doc = TomlScheduleSource::new(path)
        .active_schedule()
        .await
        .with_context(|| format!("Failed to load schedule from {}", path))?;
    let version = db.load_schedule(&doc).await?;
    info!(version, path, "📜 Commission schedule loaded");
    Ok(version)
}

async fn serve(db: Arc<CommissionDb>, bind: &str) -> Result<()> {
    let app = create_router(AppState::from_db(db));

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("🚀 Commission engine listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("Server error")?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mlm_commission_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
