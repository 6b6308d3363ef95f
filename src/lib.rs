//! Position & order lifecycle engine.
//!
//! Owns the distributed state between "what the broker believes" and "what
//! we believe" for a multi-leg options trading account: ingesting broker
//! order/transaction history, reconstructing and closing positions, keeping
//! profit-target exit orders live, and processing real-time fill events.
//! Strategy scoring, pricing, and the operator-facing surfaces are external
//! collaborators; this crate treats the broker as the opaque port in
//! [`broker`].

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod money;
pub mod occ;
pub mod orchestrator;
pub mod positions;
pub mod profit_targets;
pub mod report;
pub mod store;

pub use error::EngineError;
