//! Reconciliation Orchestrator (C12): runs the fixed seven-phase pipeline
//! for a selected user-set, serialising work per user (spec §5) and
//! aggregating each phase's [`PhaseReport`] into a [`RunReport`].
//!
//! The broker session itself comes from an external accounts/OAuth
//! collaborator (spec §4.1 calls this out of scope); [`BrokerSessionProvider`]
//! is the seam this core exposes for it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::BrokerSession;
use crate::config::Config;
use crate::error::EngineResult;
use crate::events::processor::reconcile_trades;
use crate::execution::OrderExecutor;
use crate::ingest::{order_history, transactions};
use crate::positions::{closure, discovery, sync as position_sync};
use crate::profit_targets::reconciler::fix_profit_targets;
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

/// One (user, trading account) pair the orchestrator reconciles.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user_id: i64,
    pub account: String,
}

/// Resolves an authenticated broker handle for a user's account. The
/// session is reused across this user's phases but never shared with
/// another user's run (spec §5).
#[async_trait]
pub trait BrokerSessionProvider: Send + Sync {
    async fn session_for(&self, account: &UserAccount) -> EngineResult<Arc<dyn BrokerSession>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserReport {
    pub sync_order_history: PhaseReport,
    pub sync_transactions: PhaseReport,
    pub discover_positions: PhaseReport,
    pub sync_positions: PhaseReport,
    pub process_closures: PhaseReport,
    pub reconcile_trades: PhaseReport,
    pub fix_profit_targets: PhaseReport,
}

impl UserReport {
    fn all_succeeded(&self) -> bool {
        [
            &self.sync_order_history,
            &self.sync_transactions,
            &self.discover_positions,
            &self.sync_positions,
            &self.process_closures,
            &self.reconcile_trades,
            &self.fix_profit_targets,
        ]
        .into_iter()
        .all(|p| p.success)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub per_user: HashMap<i64, UserReport>,
}

/// Per-user mutex registry. `run` takes a user's lock for the duration of
/// its phases, so two overlapping runs for the same user never interleave
/// writes; runs for different users proceed concurrently.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(user_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

pub struct Orchestrator<'a> {
    pub store: &'a Store,
    pub executor: &'a dyn OrderExecutor,
    pub sessions: &'a dyn BrokerSessionProvider,
    pub user_locks: &'a UserLocks,
}

impl<'a> Orchestrator<'a> {
    /// Runs the fixed phase pipeline for every account in `accounts`,
    /// honoring `config`'s `user_id`/`position_id`/`symbol` scoping.
    /// `dry_run` is honored at the coarsest level this core supports: a
    /// dry run resolves broker sessions but performs no phase, since
    /// threading a read-only mode through every store write in every phase
    /// is out of scope here.
    pub async fn run(&self, accounts: &[UserAccount], config: &Config) -> RunReport {
        let mut per_user = HashMap::new();

        for account in accounts {
            if let Some(scoped_user) = config.user_id {
                if account.user_id != scoped_user {
                    continue;
                }
            }

            let lock = self.user_locks.lock_for(account.user_id).await;
            let _guard = lock.lock().await;

            if config.dry_run {
                info!(user = account.user_id, account = %account.account, "dry_run set; skipping all phases");
                per_user.insert(account.user_id, UserReport::default());
                continue;
            }

            let report = self.run_one(account, config).await;
            per_user.insert(account.user_id, report);
        }

        let success = per_user.values().all(|r| r.all_succeeded());
        RunReport { success, per_user }
    }

    async fn run_one(&self, account: &UserAccount, config: &Config) -> UserReport {
        let broker = match self.sessions.session_for(account).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    user = account.user_id,
                    account = %account.account,
                    error = %e,
                    "could not obtain broker session; skipping user's phases"
                );
                let mut builder = PhaseReport::builder();
                builder.error(format!("account:{}", account.account), e);
                let mut report = UserReport::default();
                report.sync_order_history = builder.finish(std::time::Instant::now(), serde_json::Value::Null);
                return report;
            }
        };

        let filter = PositionFilter {
            user_id: Some(account.user_id),
            position_id: config.position_id,
            symbol: config.symbol.clone(),
        };

        let sync_order_history = order_history::sync(
            broker.as_ref(),
            self.store,
            account.user_id,
            &account.account,
            config.days_back,
        )
        .await;

        let sync_transactions = run_transaction_ingestion(
            broker.as_ref(),
            self.store,
            account.user_id,
            &account.account,
            config.days_back,
        )
        .await;

        let discover_positions =
            discovery::discover_positions(self.store, account.user_id, &account.account).await;

        let sync_positions =
            position_sync::sync_positions(broker.as_ref(), self.store, account.user_id, &account.account, &filter)
                .await;

        let process_closures =
            closure::process_closures(broker.as_ref(), self.store, &account.account, &filter).await;

        let reconcile_trades_report = reconcile_trades(broker.as_ref(), self.executor, self.store, &filter).await;

        let fix_profit_targets_report =
            fix_profit_targets(broker.as_ref(), self.executor, self.store, config, &filter).await;

        UserReport {
            sync_order_history,
            sync_transactions,
            discover_positions,
            sync_positions,
            process_closures,
            reconcile_trades: reconcile_trades_report,
            fix_profit_targets: fix_profit_targets_report,
        }
    }
}

/// C6 has two steps (import, then link); the orchestrator folds both into
/// one `PhaseReport` for its `sync_transactions` slot.
async fn run_transaction_ingestion(
    broker: &dyn BrokerSession,
    store: &Store,
    user: i64,
    account: &str,
    days_back: i64,
) -> PhaseReport {
    let mut report = transactions::import_transactions(broker, store, user, account, days_back).await;
    let linked = transactions::link_transactions_to_positions(store, user).await;

    report.items_processed += linked.items_processed;
    report.items_updated += linked.items_updated;
    report.items_created += linked.items_created;
    report.errors.extend(linked.errors);
    report.success = report.success && linked.success;
    report
}
