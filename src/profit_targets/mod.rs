//! Profit-Target Reconciler (C10): guarantees every still-open spread of an
//! app-managed Position has exactly one live exit order at the broker.

pub mod reconciler;
