//! Typed record families (spec §3), replacing the original's loosely-typed
//! JSON blobs with closed sum types per spec §9's design note.

pub mod order_chain;
pub mod order_history;
pub mod position;
pub mod trade;
pub mod transaction;

pub use order_chain::OrderChain;
pub use order_history::OrderHistory;
pub use position::{
    ClosureReason, DteAutomation, LifecycleState, Position, PositionLeg, PositionMetadata,
    ProfitTargetDetail, ProfitTargetStatus,
};
pub use trade::{Trade, TradeStatus, TradeType};
pub use transaction::Transaction;
