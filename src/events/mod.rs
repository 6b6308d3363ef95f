//! Order Event Processor (C11): best-effort single-event handling for
//! broker push updates, independent of the scheduled C12 pipeline.

pub mod processor;
