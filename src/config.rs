//! Engine configuration (spec §6's config table).
//!
//! Grounded on the teacher's `Config::from_env` (`src/models.rs`): read from
//! the environment with sane defaults, `dotenv`-loaded so a `.env` file in
//! the working directory is picked up the same way the operator CLI does.

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Window (days) passed to the order-history and transaction ingestors.
    pub days_back: i64,
    /// Suppresses every write in the orchestrator when true.
    pub dry_run: bool,
    /// Scope the run to one user.
    pub user_id: Option<i64>,
    /// Scope the run to one position.
    pub position_id: Option<i64>,
    /// Scope the run to one underlying symbol.
    pub symbol: Option<String>,
    /// Allow the profit-target reconciler to cancel broker-resident orders
    /// it cannot attribute to any known spread (opt-in, spec §6).
    pub cancel_orphaned_orders: bool,
    /// Enable step 7 (recreate missing exit orders) of the reconciler.
    pub replace_cancelled_targets: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "./reconciler.db".to_string(),
            days_back: 30,
            dry_run: false,
            user_id: None,
            position_id: None,
            symbol: None,
            cancel_orphaned_orders: false,
            replace_cancelled_targets: true,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Config::default();

        if let Ok(v) = std::env::var("DATABASE_PATH") {
            config.database_path = v;
        }
        if let Ok(v) = std::env::var("DAYS_BACK") {
            config.days_back = v.parse().unwrap_or(config.days_back);
        }
        if let Ok(v) = std::env::var("DRY_RUN") {
            config.dry_run = parse_bool(&v, config.dry_run);
        }
        if let Ok(v) = std::env::var("USER_ID") {
            config.user_id = v.parse().ok();
        }
        if let Ok(v) = std::env::var("POSITION_ID") {
            config.position_id = v.parse().ok();
        }
        if let Ok(v) = std::env::var("SYMBOL") {
            config.symbol = Some(v);
        }
        if let Ok(v) = std::env::var("CANCEL_ORPHANED_ORDERS") {
            config.cancel_orphaned_orders = parse_bool(&v, config.cancel_orphaned_orders);
        }
        if let Ok(v) = std::env::var("REPLACE_CANCELLED_TARGETS") {
            config.replace_cancelled_targets = parse_bool(&v, config.replace_cancelled_targets);
        }
        if let Ok(v) = std::env::var("VERBOSE") {
            config.verbose = parse_bool(&v, config.verbose);
        }

        Ok(config)
    }
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
