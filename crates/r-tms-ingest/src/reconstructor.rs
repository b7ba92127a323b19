//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Per-device reorder buffer.
//!
//! Frames are held for a short window ordered by source timestamp, then
//! flushed oldest first. Out-of-range and corrupt frames become bridge
//! markers, and skipped sequence numbers get a synthetic flat-hold point so
//! consumers can draw a continuous line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use r_tms_msg::ConnectivityStatus;

use crate::frame::{ClassifiedEvent, EventKind};
use crate::registry::{ActiveAlert, DeviceRegistry};

/// Offset of a flat-hold point before the frame that revealed the gap.
const FLAT_HOLD_OFFSET: f64 = 0.001;
/// Smallest sequence jump reported as a gap; a jump of 2 is one lost packet.
const GAP_JUMP: u64 = 3;
/// A sequence this far below the highest seen means the sender restarted its counter.
const RESTART_DROP: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Value,
    Gap,
    WildBridge,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Value => "VALUE",
            EntryKind::Gap => "GAP",
            EntryKind::WildBridge => "WILD_BRIDGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReorderBufferEntry {
    pub source_timestamp: f64,
    pub kind: EntryKind,
    pub value: Option<f64>,
    pub synthetic: bool,
}

/// A flushed, ordered point on a device timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub device_id: String,
    pub source_timestamp: f64,
    pub kind: EntryKind,
    pub value: Option<f64>,
    pub synthetic: bool,
}

/// Last accepted reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoodPoint {
    pub source_timestamp: f64,
    pub value: f64,
}

/// Span between the last good reading before a bad run and the first after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSegment {
    pub device_id: String,
    /// `None` when the device had no good reading before the bad run.
    pub from: Option<GoodPoint>,
    pub to: GoodPoint,
}

/// Skipped sequence numbers detected on ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub device_id: String,
    pub previous: u64,
    pub current: u64,
}

impl SequenceGap {
    pub fn missing(&self) -> u64 {
        self.current.saturating_sub(self.previous).saturating_sub(1)
    }
}

/// What one call to [`SequenceReconstructor::ingest`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub kind: EventKind,
    pub bridge_opened: bool,
    pub bridge_completed: Option<BridgeSegment>,
    /// Set when the jump warrants an anomaly; suppressed while stopped.
    pub gap: Option<SequenceGap>,
    pub flushed: Vec<TimelinePoint>,
    /// The frame predates output already flushed and was dropped.
    pub late: bool,
    /// The device is stopped; a valid frame was kept as a GAP marker.
    pub stopped: bool,
}

impl IngestOutcome {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            bridge_opened: false,
            bridge_completed: None,
            gap: None,
            flushed: Vec::new(),
            late: false,
            stopped: false,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceBuffer {
    entries: Vec<ReorderBufferEntry>,
    highest_sequence: Option<u64>,
    pending_bridge: Option<Option<GoodPoint>>,
    last_good: Option<GoodPoint>,
    last_flushed: Option<f64>,
}

impl DeviceBuffer {
    fn insert(&mut self, entry: ReorderBufferEntry) {
        let at = self
            .entries
            .partition_point(|existing| existing.source_timestamp <= entry.source_timestamp);
        self.entries.insert(at, entry);
    }

    fn span(&self) -> f64 {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => last.source_timestamp - first.source_timestamp,
            _ => 0.0,
        }
    }

    fn pop_front(&mut self, device_id: &str) -> Option<TimelinePoint> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.entries.remove(0);
        self.last_flushed = Some(entry.source_timestamp);
        Some(TimelinePoint {
            device_id: device_id.to_owned(),
            source_timestamp: entry.source_timestamp,
            kind: entry.kind,
            value: entry.value,
            synthetic: entry.synthetic,
        })
    }
}

/// Reorder buffer for the devices routed to one pipeline worker.
///
/// Each worker owns its reconstructor, so no locking is needed here beyond
/// the per-device state in the shared [`DeviceRegistry`].
#[derive(Debug)]
pub struct SequenceReconstructor {
    window: Duration,
    registry: Arc<DeviceRegistry>,
    buffers: HashMap<String, DeviceBuffer>,
}

impl SequenceReconstructor {
    pub fn new(window: Duration, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            window,
            registry,
            buffers: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Entries currently held for a device.
    pub fn buffered(&self, device_id: &str) -> &[ReorderBufferEntry] {
        self.buffers
            .get(device_id)
            .map(|buffer| buffer.entries.as_slice())
            .unwrap_or(&[])
    }

    /// Forget the highest sequence seen, e.g. after the device announces ONLINE.
    pub fn reset_sequence(&mut self, device_id: &str) {
        if let Some(buffer) = self.buffers.get_mut(device_id) {
            buffer.highest_sequence = None;
        }
    }

    pub fn devices(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    pub fn ingest(&mut self, device_id: &str, event: &ClassifiedEvent) -> IngestOutcome {
        let mut outcome = IngestOutcome::new(event.kind);
        let handle = self.registry.entry(device_id, ConnectivityStatus::Online);
        let mut state = handle.lock();
        state.last_receipt = Some(event.receipt_monotonic_time);
        if event.frame.location.is_some() {
            state.location = event.frame.location.clone();
        }
        let stopped = state.is_stopped();
        outcome.stopped = stopped;

        if !matches!(event.kind, EventKind::Valid | EventKind::Wild | EventKind::Corrupt) {
            return outcome;
        }

        let buffer = self.buffers.entry(device_id.to_owned()).or_default();
        let ts = event.frame.source_timestamp;
        if buffer.last_flushed.is_some_and(|flushed| ts < flushed) {
            debug!(device = device_id, ts, "dropping frame older than flushed output");
            outcome.late = true;
            return outcome;
        }

        if let Some(current) = event.frame.sequence_id {
            match buffer.highest_sequence {
                Some(previous) if current >= previous.saturating_add(GAP_JUMP) => {
                    if !stopped {
                        if let Some(good) = buffer.last_good {
                            let hold_at = (ts - FLAT_HOLD_OFFSET)
                                .max(buffer.last_flushed.unwrap_or(f64::MIN));
                            buffer.insert(ReorderBufferEntry {
                                source_timestamp: hold_at,
                                kind: EntryKind::Value,
                                value: Some(good.value),
                                synthetic: true,
                            });
                        }
                        outcome.gap = Some(SequenceGap {
                            device_id: device_id.to_owned(),
                            previous,
                            current,
                        });
                    }
                    buffer.highest_sequence = Some(current);
                }
                Some(previous) if current.saturating_add(RESTART_DROP) < previous => {
                    debug!(device = device_id, previous, current, "sequence restarted");
                    buffer.highest_sequence = Some(current);
                }
                Some(previous) if current <= previous => {}
                _ => buffer.highest_sequence = Some(current),
            }
        }

        match event.kind {
            EventKind::Valid if stopped => {
                buffer.insert(ReorderBufferEntry {
                    source_timestamp: ts,
                    kind: EntryKind::Gap,
                    value: None,
                    synthetic: false,
                });
            }
            EventKind::Valid => {
                let value = event.frame.sensor_value.unwrap_or_default();
                let point = GoodPoint {
                    source_timestamp: ts,
                    value,
                };
                buffer.insert(ReorderBufferEntry {
                    source_timestamp: ts,
                    kind: EntryKind::Value,
                    value: Some(value),
                    synthetic: false,
                });
                if let Some(from) = buffer.pending_bridge.take() {
                    outcome.bridge_completed = Some(BridgeSegment {
                        device_id: device_id.to_owned(),
                        from,
                        to: point,
                    });
                }
                buffer.last_good = Some(point);
                state.last_value = Some(value);
                state.last_source_timestamp = Some(ts);
                if matches!(state.active_alert, ActiveAlert::Wild | ActiveAlert::Corrupt) {
                    state.active_alert = ActiveAlert::None;
                }
            }
            EventKind::Wild | EventKind::Corrupt => {
                buffer.insert(ReorderBufferEntry {
                    source_timestamp: ts,
                    kind: EntryKind::WildBridge,
                    value: None,
                    synthetic: false,
                });
                if buffer.pending_bridge.is_none() {
                    buffer.pending_bridge = Some(buffer.last_good);
                    outcome.bridge_opened = true;
                }
                if !state.active_alert.is_liveness() {
                    state.active_alert = if event.kind == EventKind::Wild {
                        ActiveAlert::Wild
                    } else {
                        ActiveAlert::Corrupt
                    };
                }
            }
            EventKind::SchemaInvalid => {}
        }
        drop(state);

        let window = self.window.as_secs_f64();
        while buffer.span() >= window {
            match buffer.pop_front(device_id) {
                Some(point) => outcome.flushed.push(point),
                None => break,
            }
        }
        trace!(
            device = device_id,
            held = buffer.entries.len(),
            flushed = outcome.flushed.len(),
            "reconstructed"
        );
        outcome
    }

    /// Flush everything held for one device, in order.
    pub fn drain(&mut self, device_id: &str) -> Vec<TimelinePoint> {
        let Some(buffer) = self.buffers.get_mut(device_id) else {
            return Vec::new();
        };
        let mut points = Vec::with_capacity(buffer.entries.len());
        while let Some(point) = buffer.pop_front(device_id) {
            points.push(point);
        }
        points
    }

    /// Flush every device, grouped by device.
    pub fn drain_all(&mut self) -> Vec<TimelinePoint> {
        let mut devices = self.devices();
        devices.sort();
        devices
            .iter()
            .flat_map(|device| self.drain(device))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RangeFlags, TelemetryFrame};
    use chrono::Utc;
    use std::time::Instant;

    fn event(kind: EventKind, ts: f64, value: Option<f64>, seq: Option<u64>) -> ClassifiedEvent {
        ClassifiedEvent {
            frame: TelemetryFrame {
                device_id: Some("d1".into()),
                location: Some("Library".into()),
                sensor_value: value,
                sequence_id: seq,
                source_timestamp: ts,
                raw_bytes: Vec::new(),
            },
            kind,
            flags: RangeFlags {
                wild: kind == EventKind::Wild,
                extreme_wild: false,
            },
            error: None,
            receipt_wall_time: Utc::now(),
            receipt_monotonic_time: Instant::now(),
        }
    }

    fn valid(ts: f64, value: f64, seq: u64) -> ClassifiedEvent {
        event(EventKind::Valid, ts, Some(value), Some(seq))
    }

    fn reconstructor() -> (SequenceReconstructor, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        (
            SequenceReconstructor::new(Duration::from_secs_f64(1.2), registry.clone()),
            registry,
        )
    }

    #[test]
    fn out_of_order_frames_flush_in_order() {
        let (mut rec, _) = reconstructor();
        let mut flushed = Vec::new();
        for (ts, seq) in [(10.0, 1), (12.0, 3), (11.0, 2), (14.0, 5), (13.0, 4), (16.0, 6)] {
            flushed.extend(rec.ingest("d1", &valid(ts, 20.0, seq)).flushed);
            let held = rec.buffered("d1");
            let span = held.last().unwrap().source_timestamp - held[0].source_timestamp;
            assert!(span < 1.2);
        }
        flushed.extend(rec.drain("d1"));
        let stamps: Vec<f64> = flushed.iter().map(|p| p.source_timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]), "{stamps:?}");
        assert!(rec.buffered("d1").is_empty());
    }

    #[test]
    fn a_jump_of_three_inserts_one_flat_hold() {
        let (mut rec, _) = reconstructor();
        assert!(rec.ingest("d1", &valid(1.0, 21.0, 1)).gap.is_none());
        assert!(rec.ingest("d1", &valid(3.0, 22.0, 2)).gap.is_none());
        let outcome = rec.ingest("d1", &valid(9.0, 23.0, 5));
        let gap = outcome.gap.expect("gap reported");
        assert_eq!((gap.previous, gap.current, gap.missing()), (2, 5, 2));

        let mut points = outcome.flushed;
        points.extend(rec.drain("d1"));
        let holds: Vec<_> = points.iter().filter(|p| p.synthetic).collect();
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].value, Some(22.0));
        assert!((holds[0].source_timestamp - 8.999).abs() < 1e-9);
    }

    #[test]
    fn gaps_are_detected_again_after_the_sender_restarts() {
        let (mut rec, _) = reconstructor();
        for seq in 1..=50u64 {
            assert!(rec.ingest("d1", &valid(seq as f64 * 2.0, 20.0, seq)).gap.is_none());
        }
        let gaps: Vec<SequenceGap> = [1u64, 2, 5, 6, 20]
            .iter()
            .enumerate()
            .filter_map(|(i, seq)| rec.ingest("d1", &valid(200.0 + i as f64 * 2.0, 21.0, *seq)).gap)
            .collect();
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[0].previous, gaps[0].current), (2, 5));
        assert_eq!((gaps[1].previous, gaps[1].current), (6, 20));
    }

    #[test]
    fn reset_sequence_forgets_a_short_counter() {
        let (mut rec, _) = reconstructor();
        for seq in 1..=4u64 {
            rec.ingest("d1", &valid(seq as f64 * 2.0, 20.0, seq));
        }
        rec.reset_sequence("d1");
        assert!(rec.ingest("d1", &valid(20.0, 20.0, 1)).gap.is_none());
        assert!(rec.ingest("d1", &valid(22.0, 20.0, 2)).gap.is_none());
        assert!(rec.ingest("d1", &valid(24.0, 20.0, 5)).gap.is_some());
    }

    #[test]
    fn single_loss_and_reordering_are_not_gaps() {
        let (mut rec, _) = reconstructor();
        rec.ingest("d1", &valid(1.0, 21.0, 1));
        assert!(rec.ingest("d1", &valid(3.0, 21.0, 3)).gap.is_none());
        assert!(rec.ingest("d1", &valid(2.0, 21.0, 2)).gap.is_none());
        assert!(rec.ingest("d1", &valid(3.5, 21.0, 3)).gap.is_none());
        assert!(rec.ingest("d1", &valid(4.0, 21.0, 4)).gap.is_none());
    }

    #[test]
    fn bad_readings_bridge_to_the_next_good_one() {
        let (mut rec, registry) = reconstructor();
        rec.ingest("d1", &valid(1.0, 22.1, 1));
        let wild = rec.ingest("d1", &event(EventKind::Wild, 2.0, Some(999.9), Some(2)));
        assert!(wild.bridge_opened);
        assert_eq!(registry.get("d1").unwrap().lock().active_alert, ActiveAlert::Wild);

        let corrupt = rec.ingest("d1", &event(EventKind::Corrupt, 3.0, None, Some(3)));
        assert!(!corrupt.bridge_opened);

        let done = rec.ingest("d1", &valid(4.0, 23.4, 4));
        let bridge = done.bridge_completed.expect("bridge closed");
        assert_eq!(bridge.from.map(|p| p.value), Some(22.1));
        assert_eq!(bridge.to.value, 23.4);

        let state = registry.get("d1").unwrap();
        let state = state.lock();
        assert_eq!(state.active_alert, ActiveAlert::None);
        assert_eq!(state.last_value, Some(23.4));
        assert_eq!(state.connectivity, ConnectivityStatus::Online);
    }

    #[test]
    fn liveness_alerts_survive_bad_readings() {
        let (mut rec, registry) = reconstructor();
        registry.entry("d1", ConnectivityStatus::Online).lock().active_alert =
            ActiveAlert::NetworkDrop;
        rec.ingest("d1", &event(EventKind::Corrupt, 1.0, None, None));
        assert_eq!(
            registry.get("d1").unwrap().lock().active_alert,
            ActiveAlert::NetworkDrop
        );
    }

    #[test]
    fn stopped_devices_produce_gap_markers() {
        let (mut rec, registry) = reconstructor();
        rec.ingest("d1", &valid(1.0, 20.0, 1));
        registry.get("d1").unwrap().lock().stopped_by_peer = true;

        let outcome = rec.ingest("d1", &valid(2.0, 30.0, 9));
        assert!(outcome.gap.is_none());
        assert!(outcome.stopped);
        assert_eq!(registry.get("d1").unwrap().lock().last_value, Some(20.0));
        let points = rec.drain("d1");
        assert!(points
            .iter()
            .any(|p| p.kind == EntryKind::Gap && p.source_timestamp == 2.0));
    }

    #[test]
    fn frames_older_than_flushed_output_are_dropped() {
        let (mut rec, _) = reconstructor();
        rec.ingest("d1", &valid(10.0, 20.0, 1));
        let flushed = rec.ingest("d1", &valid(12.0, 20.0, 2)).flushed;
        assert_eq!(flushed.len(), 1);
        let late = rec.ingest("d1", &valid(9.0, 20.0, 0));
        assert!(late.late);
        assert!(late.flushed.is_empty());
    }

    #[test]
    fn schema_invalid_frames_only_touch_receipt_time() {
        let (mut rec, registry) = reconstructor();
        let outcome = rec.ingest("d1", &event(EventKind::SchemaInvalid, 1.0, None, None));
        assert!(outcome.flushed.is_empty());
        assert!(rec.buffered("d1").is_empty());
        assert!(registry.get("d1").unwrap().lock().last_receipt.is_some());
    }
}
