//! Operator CLI for the reconciliation run (spec §6's CLI surface note: a
//! superset of flags over [`Config`], not core behaviour).

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info};

use spread_reconciler::broker::{BrokerError, BrokerSession};
use spread_reconciler::config::Config;
use spread_reconciler::error::EngineResult;
use spread_reconciler::orchestrator::{BrokerSessionProvider, Orchestrator, UserAccount, UserLocks};
use spread_reconciler::store::Store;
use spread_reconciler::{logging, EngineError};

#[derive(Parser, Debug)]
#[command(name = "spread-reconciler", about = "Position and order lifecycle reconciliation run")]
struct Cli {
    #[arg(long)]
    database_path: Option<String>,

    #[arg(long)]
    days_back: Option<i64>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    user_id: Option<i64>,

    #[arg(long)]
    position_id: Option<i64>,

    #[arg(long)]
    symbol: Option<String>,

    #[arg(long)]
    cancel_orphaned_orders: bool,

    #[arg(long)]
    no_replace_cancelled_targets: bool,

    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn apply_to(self, config: &mut Config) {
        if let Some(v) = self.database_path {
            config.database_path = v;
        }
        if let Some(v) = self.days_back {
            config.days_back = v;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.user_id.is_some() {
            config.user_id = self.user_id;
        }
        if self.position_id.is_some() {
            config.position_id = self.position_id;
        }
        if self.symbol.is_some() {
            config.symbol = self.symbol;
        }
        if self.cancel_orphaned_orders {
            config.cancel_orphaned_orders = true;
        }
        if self.no_replace_cancelled_targets {
            config.replace_cancelled_targets = false;
        }
        if self.verbose {
            config.verbose = true;
        }
    }
}

/// The accounts/OAuth module that mints authenticated broker sessions is an
/// external collaborator out of scope for this core (spec §1, §4.1). This
/// provider is the integration seam a deployment wires a real session
/// minter into; without one configured, every user's run fails fast with a
/// clear `Authentication` error instead of silently doing nothing.
struct UnconfiguredSessionProvider;

#[async_trait]
impl BrokerSessionProvider for UnconfiguredSessionProvider {
    async fn session_for(&self, account: &UserAccount) -> EngineResult<Arc<dyn BrokerSession>> {
        Err(EngineError::Broker(BrokerError::Authentication(format!(
            "no broker session provider configured for user {}",
            account.user_id
        ))))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    let verbose = cli.verbose || config.verbose;
    cli.apply_to(&mut config);

    logging::init(verbose);

    info!(database_path = %config.database_path, days_back = config.days_back, dry_run = config.dry_run, "starting reconciliation run");

    let store = Store::open(&config.database_path).context("opening store")?;
    let accounts = load_accounts(&store, &config).await.context("loading accounts to reconcile")?;

    if accounts.is_empty() {
        info!("no accounts to reconcile; exiting");
        return Ok(());
    }

    let sessions = UnconfiguredSessionProvider;
    let user_locks = UserLocks::new();

    // The order executor needs a live broker session per account; since none
    // is wired up here, runs will fail at the session step and never reach
    // order placement. A deployment with a real `BrokerSessionProvider`
    // would build its `OrderExecutor` from the same session, e.g. via
    // `BrokerBackedExecutor::new(broker.as_ref())`.
    let executor = NullExecutor;

    let orchestrator = Orchestrator {
        store: &store,
        executor: &executor,
        sessions: &sessions,
        user_locks: &user_locks,
    };

    let report = orchestrator.run(&accounts, &config).await;

    if !report.success {
        error!(?report, "reconciliation run completed with errors");
        std::process::exit(1);
    }

    info!("reconciliation run completed successfully");
    Ok(())
}

/// Distinct trading accounts currently known to the store, optionally
/// scoped to `config.user_id` (spec §4.12's scoped-run mode).
async fn load_accounts(store: &Store, config: &Config) -> EngineResult<Vec<UserAccount>> {
    let mut accounts = store.list_user_accounts().await?;
    if let Some(user_id) = config.user_id {
        accounts.retain(|a| a.user_id == user_id);
    }
    Ok(accounts.into_iter().map(|(user_id, account)| UserAccount { user_id, account }).collect())
}

struct NullExecutor;

#[async_trait]
impl spread_reconciler::execution::OrderExecutor for NullExecutor {
    async fn place_exit_order(
        &self,
        _account: &str,
        _spec: &spread_reconciler::execution::ProfitTargetSpec,
    ) -> Result<spread_reconciler::execution::PlacedExitOrder, spread_reconciler::execution::ExecutionError> {
        Err(spread_reconciler::execution::ExecutionError::Rejected(
            "no order executor configured".to_string(),
        ))
    }

    async fn cancel_order(
        &self,
        _account: &str,
        _order_id: &str,
    ) -> Result<(), spread_reconciler::execution::ExecutionError> {
        Err(spread_reconciler::execution::ExecutionError::Rejected(
            "no order executor configured".to_string(),
        ))
    }
}
