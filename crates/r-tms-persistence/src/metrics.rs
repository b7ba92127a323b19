//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry record storage and journaling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use prometheus::{self, IntCounter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the telemetry store.
#[derive(Clone)]
pub struct StoreMetrics {
    appended: IntCounterVec,
    purged: IntCounterVec,
    journal_bytes: IntCounter,
    journal_failures: IntCounter,
}

impl StoreMetrics {
    /// Register all store metrics with the provided registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let appended = IntCounterVec::new(
            Opts::new("r_tms_store_appended_total", "Rows appended per table"),
            &["table"],
        )?;
        registry.register(Box::new(appended.clone()))?;

        let purged = IntCounterVec::new(
            Opts::new("r_tms_store_purged_total", "Rows removed by retention per table"),
            &["table"],
        )?;
        registry.register(Box::new(purged.clone()))?;

        let journal_bytes = IntCounter::with_opts(Opts::new(
            "r_tms_journal_bytes_total",
            "Bytes appended to the journal",
        ))?;
        registry.register(Box::new(journal_bytes.clone()))?;

        let journal_failures = IntCounter::with_opts(Opts::new(
            "r_tms_journal_failures_total",
            "Journal appends that failed",
        ))?;
        registry.register(Box::new(journal_failures.clone()))?;

        Ok(Self {
            appended,
            purged,
            journal_bytes,
            journal_failures,
        })
    }

    pub(crate) fn record_append(&self, table: &str) {
        self.appended.with_label_values(&[table]).inc();
    }

    pub(crate) fn record_purge(&self, table: &str, rows: usize) {
        self.purged.with_label_values(&[table]).inc_by(rows as u64);
    }

    pub(crate) fn record_journal_bytes(&self, bytes: usize) {
        self.journal_bytes.inc_by(bytes as u64);
    }

    pub(crate) fn record_journal_failure(&self) {
        self.journal_failures.inc();
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics").finish_non_exhaustive()
    }
}
