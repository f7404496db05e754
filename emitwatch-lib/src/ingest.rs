//! Ingestion buffer, visible log and the flush protocol.
//!
//! Inbound messages accumulate in an [`IngestBuffer`] between flush ticks.
//! [`Ingestor::flush`] drains it in one step and commits the batch:
//!
//! 1. one [`BatchToken`] for the whole batch
//! 2. newest-first order, per-category counts and a [`BatchSummary`]
//! 3. merge into the front of the [`VisibleLog`] (retention filter, then cap)
//! 4. flash markers for the merged entries, kept beside the records
//! 5. the untagged batch handed back for persistence
//!
//! Presentation state (flash markers, the latest summary) never touches the
//! records themselves.

use crate::config::IngestConfig;
use crate::models::{BatchSummary, BatchToken, CategoryCounts, EventRecord, RecordError};
use crate::telemetry::IngestStats;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Records received since the last flush.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    records: Vec<EventRecord>,
}

impl IngestBuffer {
    pub fn push(&mut self, record: EventRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take every buffered record in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.records)
    }
}

/// One entry of the visible log.
#[derive(Debug, Clone)]
pub struct VisibleEntry {
    /// Position marker unique within the pipeline's lifetime.
    pub seq: u64,
    pub record: Arc<EventRecord>,
}

impl AsRef<EventRecord> for VisibleEntry {
    fn as_ref(&self) -> &EventRecord {
        &self.record
    }
}

/// Bounded, newest-first log of records held for display.
///
/// After every merge the log holds at most `max_len` entries, all with
/// `ts_ms >= now - retention`.
#[derive(Debug)]
pub struct VisibleLog {
    entries: VecDeque<VisibleEntry>,
    next_seq: u64,
    max_len: usize,
    retention_ms: i64,
}

impl VisibleLog {
    pub fn new(max_len: usize, retention_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            max_len: max_len.max(1),
            retention_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Entries, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &VisibleEntry> {
        self.entries.iter()
    }

    /// Records, newest first.
    pub fn records(&self) -> impl Iterator<Item = &EventRecord> {
        self.entries.iter().map(|e| &*e.record)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq
    }

    /// Prepend a newest-first batch, then apply retention and the cap.
    ///
    /// Returns the sequence numbers of the batch entries that survived.
    pub fn merge_front(&mut self, batch: Vec<Arc<EventRecord>>, now_ms: i64) -> Vec<u64> {
        let mut fresh: Vec<VisibleEntry> = batch
            .into_iter()
            .map(|record| VisibleEntry {
                seq: self.next_seq(),
                record,
            })
            .collect();
        let fresh_seqs: Vec<u64> = fresh.iter().map(|e| e.seq).collect();

        let mut merged: VecDeque<VisibleEntry> = fresh.drain(..).collect();
        merged.extend(self.entries.drain(..));
        self.entries = merged;
        self.enforce_bounds(now_ms);

        let live: HashSet<u64> = self.entries.iter().map(|e| e.seq).collect();
        fresh_seqs.into_iter().filter(|seq| live.contains(seq)).collect()
    }

    /// Replace the contents with newest-first `records` (hydration).
    pub fn seed(&mut self, records: Vec<EventRecord>, now_ms: i64) {
        self.entries = records
            .into_iter()
            .map(|record| VisibleEntry {
                seq: self.next_seq(),
                record: Arc::new(record),
            })
            .collect();
        self.enforce_bounds(now_ms);
    }

    /// Merge hydrated records behind whatever is already visible.
    pub fn append_back(&mut self, records: Vec<EventRecord>, now_ms: i64) {
        for record in records {
            let seq = self.next_seq();
            self.entries.push_back(VisibleEntry {
                seq,
                record: Arc::new(record),
            });
        }
        self.enforce_bounds(now_ms);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn enforce_bounds(&mut self, now_ms: i64) {
        let min_ts = now_ms.saturating_sub(self.retention_ms);
        self.entries.retain(|e| e.record.ts_ms >= min_ts);
        self.entries.truncate(self.max_len);
    }
}

/// Flash markers for freshly flushed entries, keyed by entry sequence.
#[derive(Debug, Default)]
pub struct FlashMarkers {
    markers: HashMap<u64, BatchToken>,
}

impl FlashMarkers {
    pub fn mark(&mut self, seqs: &[u64], token: BatchToken) {
        for &seq in seqs {
            self.markers.insert(seq, token);
        }
    }

    /// Remove every marker carrying `token`; returns how many were removed.
    pub fn expire(&mut self, token: BatchToken) -> usize {
        let before = self.markers.len();
        self.markers.retain(|_, t| *t != token);
        before.saturating_sub(self.markers.len())
    }

    pub fn token_for(&self, seq: u64) -> Option<BatchToken> {
        self.markers.get(&seq).copied()
    }

    /// Drop markers whose entries left the log.
    pub fn retain_live(&mut self, log: &VisibleLog) {
        let live: HashSet<u64> = log.iter().map(|e| e.seq).collect();
        self.markers.retain(|seq, _| live.contains(seq));
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }
}

/// A visible record together with its flash marker, for consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleRow {
    pub record: EventRecord,
    /// Present while the row is still flashing.
    pub flash: Option<BatchToken>,
}

impl AsRef<EventRecord> for VisibleRow {
    fn as_ref(&self) -> &EventRecord {
        &self.record
    }
}

/// Everything one non-empty flush produced.
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub summary: BatchSummary,
    /// Untagged batch in arrival order, for the durable store.
    pub persist: Vec<EventRecord>,
    /// Durable entries older than this should be pruned.
    pub prune_cutoff_ms: i64,
    /// Entries that received a flash marker.
    pub flashed: usize,
}

/// Buffer, visible log, flash markers and counters behind one owner.
#[derive(Debug)]
pub struct Ingestor {
    buffer: IngestBuffer,
    log: VisibleLog,
    flash: FlashMarkers,
    stats: IngestStats,
    retention_ms: i64,
    flush_serial: u64,
}

impl Ingestor {
    pub fn new(config: &IngestConfig) -> Self {
        let retention_ms = config.retention_ms();
        Self {
            buffer: IngestBuffer::default(),
            log: VisibleLog::new(config.max_visible, retention_ms),
            flash: FlashMarkers::default(),
            stats: IngestStats::default(),
            retention_ms,
            flush_serial: 0,
        }
    }

    pub const fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub const fn log(&self) -> &VisibleLog {
        &self.log
    }

    pub const fn flash(&self) -> &FlashMarkers {
        &self.flash
    }

    pub const fn buffered(&self) -> &IngestBuffer {
        &self.buffer
    }

    /// Oldest timestamp still inside the retention window.
    pub const fn retention_floor(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.retention_ms)
    }

    /// Parse and buffer one inbound message.
    ///
    /// A parse failure is counted and returned; nothing else changes.
    pub fn accept(&mut self, raw: &str, now_ms: i64) -> Result<(), RecordError> {
        match EventRecord::parse_message(raw, now_ms) {
            Ok(record) => {
                self.buffer.push(record);
                self.stats.record_incoming(now_ms);
                Ok(())
            }
            Err(e) => {
                self.stats.record_dropped(now_ms);
                Err(e)
            }
        }
    }

    /// Commit the buffered batch. An empty buffer is a no-op.
    pub fn flush(&mut self, now_ms: i64) -> Option<FlushOutcome> {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return None;
        }

        self.flush_serial = self.flush_serial.saturating_add(1);
        let token = BatchToken {
            issued_ms: now_ms,
            serial: self.flush_serial,
        };

        let newest_first: Vec<Arc<EventRecord>> =
            batch.iter().rev().cloned().map(Arc::new).collect();
        let summary = BatchSummary {
            token,
            count: batch.len(),
            ts_ms: now_ms,
            counts: CategoryCounts::tally(&batch),
        };

        let merged = self.log.merge_front(newest_first, now_ms);
        self.flash.retain_live(&self.log);
        self.flash.mark(&merged, token);

        debug!(
            token = %token,
            count = summary.count,
            visible = self.log.len(),
            "Flushed batch"
        );

        Some(FlushOutcome {
            summary,
            persist: batch,
            prune_cutoff_ms: self.retention_floor(now_ms),
            flashed: merged.len(),
        })
    }

    /// Seed the log from stored history (ascending by timestamp).
    ///
    /// Keeps the newest `max_len` records. Entries already visible stay in
    /// front of the hydrated ones.
    pub fn hydrate(&mut self, history: Vec<EventRecord>, now_ms: i64) -> usize {
        let skip = history.len().saturating_sub(self.log.max_len());
        let newest_first: Vec<EventRecord> = history.into_iter().skip(skip).rev().collect();
        let count = newest_first.len();
        if self.log.is_empty() {
            self.log.seed(newest_first, now_ms);
        } else {
            self.log.append_back(newest_first, now_ms);
        }
        self.flash.retain_live(&self.log);
        count
    }

    /// Remove a batch's flash markers.
    pub fn clear_flash(&mut self, token: BatchToken) -> usize {
        self.flash.expire(token)
    }

    /// Empty the visible log and its flash markers.
    pub fn clear_view(&mut self) {
        self.log.clear();
        self.flash.clear();
    }

    /// Visible rows with flash markers, newest first.
    pub fn rows(&self) -> Vec<VisibleRow> {
        self.log
            .iter()
            .map(|entry| VisibleRow {
                record: (*entry.record).clone(),
                flash: self.flash.token_for(entry.seq),
            })
            .collect()
    }

    /// Rows for the given entries, in the given order.
    pub fn rows_for<'a>(&self, entries: impl IntoIterator<Item = &'a VisibleEntry>) -> Vec<VisibleRow> {
        entries
            .into_iter()
            .map(|entry| VisibleRow {
                record: (*entry.record).clone(),
                flash: self.flash.token_for(entry.seq),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use super::*;
    use crate::models::EmitKind;

    const NOW: i64 = 1_700_000_000_000;

    fn config(max_visible: usize) -> IngestConfig {
        IngestConfig {
            max_visible,
            ..IngestConfig::default()
        }
    }

    fn message(kind: &str, ts_ms: i64, text: &str) -> String {
        serde_json::json!({"type": kind, "ts_ms": ts_ms, "text": text}).to_string()
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut ingestor = Ingestor::new(&config(500));
        assert!(ingestor.flush(NOW).is_none());
        assert!(ingestor.log().is_empty());
    }

    #[test]
    fn test_flush_commits_batch_newest_first() {
        let mut ingestor = Ingestor::new(&config(500));
        for i in 0..5 {
            ingestor
                .accept(&message("OCR_RAW", NOW + i, &format!("P{i}")), NOW)
                .expect("valid message");
        }

        let outcome = ingestor.flush(NOW + 10).expect("non-empty flush");
        assert_eq!(outcome.summary.count, 5);
        assert_eq!(outcome.summary.counts.ocr_raw, 5);
        assert_eq!(outcome.summary.counts.total(), 5);
        assert_eq!(outcome.summary.token.issued_ms, NOW + 10);
        assert_eq!(outcome.persist.len(), 5);
        assert_eq!(outcome.persist[0].text(), "P0");
        assert_eq!(outcome.prune_cutoff_ms, NOW + 10 - 600_000);
        assert_eq!(outcome.flashed, 5);

        let rows = ingestor.rows();
        let texts: Vec<&str> = rows.iter().map(|r| r.record.text()).collect();
        assert_eq!(texts, vec!["P4", "P3", "P2", "P1", "P0"]);
        assert!(rows.iter().all(|r| r.flash == Some(outcome.summary.token)));
        assert!(ingestor.buffered().is_empty());

        // Second tick with nothing buffered changes nothing
        assert!(ingestor.flush(NOW + 20).is_none());
        assert_eq!(ingestor.log().len(), 5);
    }

    #[test]
    fn test_unknown_kinds_are_kept_but_not_counted() {
        let mut ingestor = Ingestor::new(&config(500));
        ingestor
            .accept(&message("PLATE_CANDIDATE", NOW, "X"), NOW)
            .expect("valid");
        ingestor.accept(&message("SPEEDING", NOW, "Y"), NOW).expect("valid");

        let outcome = ingestor.flush(NOW).expect("flush");
        assert_eq!(outcome.summary.count, 2);
        assert_eq!(outcome.summary.counts.total(), 1);
        assert_eq!(ingestor.log().len(), 2);
    }

    #[test]
    fn test_parse_failures_are_counted() {
        let mut ingestor = Ingestor::new(&config(500));
        assert!(ingestor.accept("not json", NOW).is_err());
        assert!(ingestor.accept("42", NOW + 1).is_err());
        ingestor.accept(&message("OCR_RAW", NOW, "A"), NOW + 2).expect("valid");

        let stats = ingestor.stats();
        assert_eq!(stats.dropped_count, 2);
        assert_eq!(stats.incoming_count, 1);
        assert_eq!(stats.last_message_ts_ms, Some(NOW + 2));
        assert_eq!(ingestor.buffered().len(), 1);
    }

    #[test]
    fn test_merge_enforces_cap_and_retention() {
        let mut ingestor = Ingestor::new(&config(3));
        ingestor
            .accept(&message("OCR_RAW", NOW - 700_000, "expired"), NOW)
            .expect("valid");
        for i in 0..4 {
            ingestor
                .accept(&message("OCR_RAW", NOW, &format!("P{i}")), NOW)
                .expect("valid");
        }

        let outcome = ingestor.flush(NOW).expect("flush");
        assert_eq!(outcome.summary.count, 5);
        // Every record still goes to the store
        assert_eq!(outcome.persist.len(), 5);
        assert_eq!(outcome.flashed, 3);

        let texts: Vec<String> = ingestor.rows().iter().map(|r| r.record.text().to_owned()).collect();
        assert_eq!(texts, vec!["P3", "P2", "P1"]);
        assert_eq!(ingestor.flash().len(), 3);
    }

    #[test]
    fn test_flash_markers_expire_by_token() {
        let mut ingestor = Ingestor::new(&config(500));
        ingestor.accept(&message("OCR_RAW", NOW, "A"), NOW).expect("valid");
        let first = ingestor.flush(NOW).expect("flush").summary.token;
        ingestor.accept(&message("OCR_RAW", NOW, "B"), NOW).expect("valid");
        let second = ingestor.flush(NOW + 1).expect("flush").summary.token;
        assert_ne!(first, second);

        assert_eq!(ingestor.clear_flash(first), 1);
        let rows = ingestor.rows();
        assert_eq!(rows[0].flash, Some(second));
        assert_eq!(rows[1].flash, None);
        // Records are untouched by marker removal
        assert_eq!(rows[1].record.text(), "A");
    }

    #[test]
    fn test_hydrate_keeps_newest_and_reverses() {
        let mut ingestor = Ingestor::new(&config(2));
        let history = vec![
            EventRecord::new(EmitKind::OcrRaw, NOW - 3).with_id(1),
            EventRecord::new(EmitKind::OcrRaw, NOW - 2).with_id(2),
            EventRecord::new(EmitKind::OcrRaw, NOW - 1).with_id(3),
        ];

        assert_eq!(ingestor.hydrate(history, NOW), 2);
        let ids: Vec<Option<u64>> = ingestor.rows().iter().map(|r| r.record.id).collect();
        assert_eq!(ids, vec![Some(3), Some(2)]);
        assert!(ingestor.flash().is_empty());
    }

    #[test]
    fn test_hydrate_after_live_flush_keeps_live_rows_in_front() {
        let mut ingestor = Ingestor::new(&config(500));
        ingestor.accept(&message("SPEEDING", NOW, "live"), NOW).expect("valid");
        ingestor.flush(NOW).expect("flush");

        ingestor.hydrate(vec![EventRecord::new(EmitKind::OcrRaw, NOW - 5).with_id(9)], NOW);
        let rows = ingestor.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record.text(), "live");
        assert_eq!(rows[1].record.id, Some(9));
    }

    #[test]
    fn test_clear_view() {
        let mut ingestor = Ingestor::new(&config(500));
        ingestor.accept(&message("OCR_RAW", NOW, "A"), NOW).expect("valid");
        ingestor.flush(NOW).expect("flush");

        ingestor.clear_view();
        assert!(ingestor.log().is_empty());
        assert!(ingestor.flash().is_empty());
    }
}
