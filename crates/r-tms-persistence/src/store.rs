//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry record storage and journaling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::event_log::{replay, JournalRecord};
use crate::journal::JournalWriter;
use crate::metrics::StoreMetrics;
use crate::records::{
    AggregateStats, AnomalyRecord, MessageRecord, NewSchedule, PurgeReport, RecordFilter,
    ScheduleEntry, ServiceLogRecord, StatusRecord,
};
use crate::{PersistenceError, Result};

const DEFAULT_MESSAGE_LIMIT: usize = 500;

/// Storage seam used by the pipeline, the dispatcher and the admin API.
pub trait TelemetryStore: Send + Sync {
    /// Append a valid reading, returning its identifier.
    fn append_message(&self, record: MessageRecord) -> Result<u64>;
    /// Append an anomaly.
    fn append_anomaly(&self, record: AnomalyRecord) -> Result<()>;
    /// Append a status snapshot.
    fn append_status(&self, record: StatusRecord) -> Result<()>;
    /// Append a service log row.
    fn append_service_log(&self, record: ServiceLogRecord) -> Result<()>;
    /// Create a schedule.
    fn create_schedule(&self, schedule: NewSchedule) -> Result<ScheduleEntry>;
    /// All schedules, by identifier.
    fn schedules(&self) -> Result<Vec<ScheduleEntry>>;
    /// Move the window start of a schedule.
    fn set_schedule_start(&self, id: u64, start_ts: DateTime<Utc>) -> Result<()>;
    /// Readings matching the filter, newest first.
    fn messages(&self, filter: &RecordFilter) -> Result<Vec<MessageRecord>>;
    /// Anomalies matching the filter, newest first.
    fn anomalies(&self, filter: &RecordFilter) -> Result<Vec<AnomalyRecord>>;
    /// Most recent service log rows, newest first.
    fn service_logs(&self, limit: usize) -> Result<Vec<ServiceLogRecord>>;
    /// Count/avg/min/max over readings plus the anomaly count.
    fn aggregate_stats(&self, filter: &RecordFilter) -> Result<AggregateStats>;
    /// Latest status per device, ordered by device id.
    fn latest_statuses(&self) -> Result<Vec<StatusRecord>>;
    /// Remove readings, anomalies, statuses and service logs older than `cutoff`.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport>;

    /// Most recent anomalies, newest first.
    fn recent_anomalies(&self, limit: usize) -> Result<Vec<AnomalyRecord>> {
        self.anomalies(&RecordFilter {
            limit: Some(limit),
            ..RecordFilter::default()
        })
    }
}

#[derive(Debug, Default)]
struct Tables {
    messages: Vec<MessageRecord>,
    anomalies: Vec<AnomalyRecord>,
    statuses: Vec<StatusRecord>,
    service_logs: Vec<ServiceLogRecord>,
    schedules: BTreeMap<u64, ScheduleEntry>,
    next_message_id: u64,
    next_schedule_id: u64,
}

impl Tables {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Message(message) => {
                self.next_message_id = self.next_message_id.max(message.id);
                self.messages.push(message);
            }
            JournalRecord::Anomaly(anomaly) => self.anomalies.push(anomaly),
            JournalRecord::Status(status) => self.statuses.push(status),
            JournalRecord::ServiceLog(row) => self.service_logs.push(row),
            JournalRecord::Schedule(schedule) => {
                self.next_schedule_id = self.next_schedule_id.max(schedule.id);
                self.schedules.insert(schedule.id, schedule);
            }
            JournalRecord::ScheduleStart { id, start_ts } => {
                if let Some(schedule) = self.schedules.get_mut(&id) {
                    schedule.start_ts = start_ts;
                }
            }
            JournalRecord::Counters {
                next_message_id,
                next_schedule_id,
            } => {
                self.next_message_id = self.next_message_id.max(next_message_id);
                self.next_schedule_id = self.next_schedule_id.max(next_schedule_id);
            }
            JournalRecord::Purge { cutoff } => {
                self.purge(cutoff);
            }
        }
    }

    /// The live rows as journal records; replaying them rebuilds these tables.
    fn snapshot(&self) -> Vec<JournalRecord> {
        let mut records = Vec::with_capacity(
            1 + self.messages.len()
                + self.anomalies.len()
                + self.statuses.len()
                + self.service_logs.len()
                + self.schedules.len(),
        );
        records.push(JournalRecord::Counters {
            next_message_id: self.next_message_id,
            next_schedule_id: self.next_schedule_id,
        });
        records.extend(self.schedules.values().cloned().map(JournalRecord::Schedule));
        records.extend(self.messages.iter().cloned().map(JournalRecord::Message));
        records.extend(self.anomalies.iter().cloned().map(JournalRecord::Anomaly));
        records.extend(self.statuses.iter().cloned().map(JournalRecord::Status));
        records.extend(self.service_logs.iter().cloned().map(JournalRecord::ServiceLog));
        records
    }

    fn purge(&mut self, cutoff: DateTime<Utc>) -> PurgeReport {
        let before = (
            self.messages.len(),
            self.anomalies.len(),
            self.statuses.len(),
            self.service_logs.len(),
        );
        self.messages.retain(|row| row.received_at >= cutoff);
        self.anomalies.retain(|row| row.timestamp >= cutoff);
        self.statuses.retain(|row| row.timestamp >= cutoff);
        self.service_logs.retain(|row| row.timestamp >= cutoff);
        PurgeReport {
            messages: before.0 - self.messages.len(),
            anomalies: before.1 - self.anomalies.len(),
            statuses: before.2 - self.statuses.len(),
            service_logs: before.3 - self.service_logs.len(),
        }
    }
}

/// Process-local store, optionally mirrored to a JSON-lines journal.
///
/// Journal entries are handed to a background writer thread in the order they
/// are applied. Write failures are logged and counted; the in-memory tables
/// stay authoritative for the running process. A retention purge rewrites the
/// journal from the surviving rows.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    journal: Option<JournalWriter>,
    metrics: Arc<OnceLock<StoreMetrics>>,
}

impl InMemoryStore {
    /// Empty store without a journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by the journal at `path`; existing entries are replayed first.
    pub fn open_journal(path: &Path) -> Result<Self> {
        let mut tables = Tables::default();
        let mut purges = 0usize;
        if path.exists() {
            let replayed = replay(path, |entry| {
                if matches!(entry.record, JournalRecord::Purge { .. }) {
                    purges += 1;
                }
                tables.apply(entry.record);
                Ok(())
            })?;
            info!(journal = %path.display(), entries = replayed, purges, "journal replayed");
        }
        let metrics = Arc::new(OnceLock::new());
        let journal = JournalWriter::spawn(path, metrics.clone())?;
        if purges > 0 {
            journal.compact(tables.snapshot());
        }
        Ok(Self {
            tables: RwLock::new(tables),
            journal: Some(journal),
            metrics,
        })
    }

    /// Attach store metrics.
    pub fn with_metrics(self, metrics: StoreMetrics) -> Self {
        let _ = self.metrics.set(metrics);
        self
    }

    /// Block until every journal entry queued so far has reached the file.
    pub fn flush_journal(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }

    /// Apply a mutation and queue it for the journal under the same write lock,
    /// so journal order matches table order.
    fn commit(&self, tables: &mut Tables, record: JournalRecord) {
        if let Some(journal) = &self.journal {
            journal.append(record.clone());
        }
        tables.apply(record);
    }

    fn mutate(&self, table: &str, record: JournalRecord) {
        let mut tables = self.tables.write();
        self.commit(&mut tables, record);
        drop(tables);
        if let Some(metrics) = self.metrics.get() {
            metrics.record_append(table);
        }
    }
}

fn newest_first<T: Clone>(rows: &[T], keep: impl Fn(&T) -> bool, limit: Option<usize>) -> Vec<T> {
    rows.iter()
        .rev()
        .filter(|row| keep(row))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

impl TelemetryStore for InMemoryStore {
    fn append_message(&self, mut record: MessageRecord) -> Result<u64> {
        let mut tables = self.tables.write();
        record.id = tables.next_message_id + 1;
        let id = record.id;
        self.commit(&mut tables, JournalRecord::Message(record));
        drop(tables);
        if let Some(metrics) = self.metrics.get() {
            metrics.record_append("messages");
        }
        Ok(id)
    }

    fn append_anomaly(&self, record: AnomalyRecord) -> Result<()> {
        self.mutate("anomalies", JournalRecord::Anomaly(record));
        Ok(())
    }

    fn append_status(&self, record: StatusRecord) -> Result<()> {
        self.mutate("statuses", JournalRecord::Status(record));
        Ok(())
    }

    fn append_service_log(&self, record: ServiceLogRecord) -> Result<()> {
        self.mutate("service_logs", JournalRecord::ServiceLog(record));
        Ok(())
    }

    fn create_schedule(&self, schedule: NewSchedule) -> Result<ScheduleEntry> {
        let mut tables = self.tables.write();
        let entry = ScheduleEntry {
            id: tables.next_schedule_id + 1,
            device_id: schedule.device_id,
            action: schedule.action,
            start_ts: schedule.start_ts,
            end_ts: schedule.end_ts,
        };
        self.commit(&mut tables, JournalRecord::Schedule(entry.clone()));
        drop(tables);
        if let Some(metrics) = self.metrics.get() {
            metrics.record_append("schedules");
        }
        Ok(entry)
    }

    fn schedules(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.tables.read().schedules.values().cloned().collect())
    }

    fn set_schedule_start(&self, id: u64, start_ts: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.schedules.contains_key(&id) {
            return Err(PersistenceError::ScheduleNotFound(id));
        }
        self.commit(&mut tables, JournalRecord::ScheduleStart { id, start_ts });
        Ok(())
    }

    fn messages(&self, filter: &RecordFilter) -> Result<Vec<MessageRecord>> {
        let tables = self.tables.read();
        Ok(newest_first(
            &tables.messages,
            |row| filter.matches(Some(&row.device_id), row.received_at),
            Some(filter.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT)),
        ))
    }

    fn anomalies(&self, filter: &RecordFilter) -> Result<Vec<AnomalyRecord>> {
        let tables = self.tables.read();
        Ok(newest_first(
            &tables.anomalies,
            |row| filter.matches(Some(&row.device_id), row.timestamp),
            filter.limit,
        ))
    }

    fn service_logs(&self, limit: usize) -> Result<Vec<ServiceLogRecord>> {
        let tables = self.tables.read();
        Ok(newest_first(&tables.service_logs, |_| true, Some(limit)))
    }

    fn aggregate_stats(&self, filter: &RecordFilter) -> Result<AggregateStats> {
        let tables = self.tables.read();
        let mut stats = AggregateStats::default();
        let mut sum = 0.0;
        for row in tables
            .messages
            .iter()
            .filter(|row| filter.matches(Some(&row.device_id), row.received_at))
        {
            stats.count += 1;
            sum += row.value;
            stats.min = Some(stats.min.map_or(row.value, |min| min.min(row.value)));
            stats.max = Some(stats.max.map_or(row.value, |max| max.max(row.value)));
        }
        if stats.count > 0 {
            stats.avg = Some(sum / stats.count as f64);
        }
        stats.anomalies = tables
            .anomalies
            .iter()
            .filter(|row| filter.matches(Some(&row.device_id), row.timestamp))
            .count() as u64;
        Ok(stats)
    }

    fn latest_statuses(&self) -> Result<Vec<StatusRecord>> {
        let tables = self.tables.read();
        let mut latest: BTreeMap<&str, &StatusRecord> = BTreeMap::new();
        for row in &tables.statuses {
            let newer = latest
                .get(row.device_id.as_str())
                .map_or(true, |current| row.timestamp >= current.timestamp);
            if newer {
                latest.insert(row.device_id.as_str(), row);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let mut tables = self.tables.write();
        let report = tables.purge(cutoff);
        if let Some(journal) = &self.journal {
            journal.compact(tables.snapshot());
        }
        drop(tables);
        if let Some(metrics) = self.metrics.get() {
            metrics.record_purge("messages", report.messages);
            metrics.record_purge("anomalies", report.anomalies);
            metrics.record_purge("statuses", report.statuses);
            metrics.record_purge("service_logs", report.service_logs);
        }
        Ok(report)
    }
}
