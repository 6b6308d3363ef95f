//! Shared phase-result shape (spec §4.12 / §5): every phase function
//! returns a `PhaseReport` instead of panicking on a per-item error, so a
//! failed phase marks the overall run non-successful without aborting the
//! pipeline (spec §7's "eventually correct" contract).

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct PhaseError {
    pub scope: String,
    pub message: String,
}

impl PhaseError {
    pub fn new(scope: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PhaseError {
            scope: scope.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PhaseReport {
    pub success: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub items_processed: u64,
    pub items_updated: u64,
    pub items_created: u64,
    pub errors: Vec<PhaseError>,
    pub details: serde_json::Value,
}

impl PhaseReport {
    pub fn builder() -> PhaseReportBuilder {
        PhaseReportBuilder::default()
    }
}

#[derive(Default)]
pub struct PhaseReportBuilder {
    pub(crate) processed: u64,
    pub(crate) updated: u64,
    pub(crate) created: u64,
    errors: Vec<PhaseError>,
}

impl PhaseReportBuilder {
    pub fn processed(&mut self, n: u64) -> &mut Self {
        self.processed += n;
        self
    }

    pub fn updated(&mut self, n: u64) -> &mut Self {
        self.updated += n;
        self
    }

    pub fn created(&mut self, n: u64) -> &mut Self {
        self.created += n;
        self
    }

    pub fn error(&mut self, scope: impl Into<String>, message: impl std::fmt::Display) -> &mut Self {
        self.errors.push(PhaseError::new(scope, message));
        self
    }

    pub fn finish(&mut self, started: std::time::Instant, details: serde_json::Value) -> PhaseReport {
        PhaseReport {
            success: self.errors.is_empty(),
            duration: started.elapsed(),
            items_processed: self.processed,
            items_updated: self.updated,
            items_created: self.created,
            errors: std::mem::take(&mut self.errors),
            details,
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}
