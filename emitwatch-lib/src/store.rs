//! Durable log store for recent emit history.
//!
//! The pipeline only consumes four operations ([`LogStore`]): append, query
//! since a timestamp, prune before a cutoff and clear. Two implementations are
//! provided:
//!
//! - [`FileLogStore`]: length-prefixed, postcard-encoded entries in rotating
//!   segment files. Every entry carries a CRC32C of its payload; corrupt or
//!   truncated entries are skipped with a warning. Identifiers continue
//!   monotonically across restarts.
//! - [`MemoryLogStore`]: an ordered map, used by tests and ephemeral runs.
//!
//! All operations are safe to call concurrently. Writes are append-or-prune,
//! never update-in-place. The file store remembers the timestamp range of
//! each segment, so prune and query only read segments that can matter.
//!
//! # Segment format
//!
//! ```text
//! emitlog-00001.log: [u32 LE length][postcard StoredEntry] ...
//! ```

use crate::models::EventRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Store-specific error types.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// File I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable Log Store contract.
#[async_trait]
pub trait LogStore: Send + Sync + std::fmt::Debug {
    /// Persist `records`, assigning an identifier to each record lacking one.
    ///
    /// Returns the identifiers in input order.
    async fn append(&self, records: &[EventRecord]) -> StoreResult<Vec<u64>>;

    /// Every record with `ts_ms >= min_ts_ms`, ordered by timestamp then id.
    async fn query_since(&self, min_ts_ms: i64) -> StoreResult<Vec<EventRecord>>;

    /// Remove every record with `ts_ms < cutoff_ms`; returns how many went.
    async fn prune_older_than(&self, cutoff_ms: i64) -> StoreResult<usize>;

    /// Remove every record. Identifier assignment does not restart.
    async fn clear_all(&self) -> StoreResult<()>;
}

/// Identifier for `record`, either its own or the next free one.
fn assign_id(next_id: &mut u64, record: &EventRecord) -> u64 {
    match record.id {
        Some(id) => {
            *next_id = (*next_id).max(id.saturating_add(1));
            id
        }
        None => {
            let id = *next_id;
            *next_id = next_id.saturating_add(1);
            id
        }
    }
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    next_id: u64,
    records: BTreeMap<u64, EventRecord>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                next_id: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, records: &[EventRecord]) -> StoreResult<Vec<u64>> {
        let mut state = self.inner.lock().await;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = assign_id(&mut state.next_id, record);
            state.records.insert(id, record.clone().with_id(id));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn query_since(&self, min_ts_ms: i64) -> StoreResult<Vec<EventRecord>> {
        let state = self.inner.lock().await;
        let mut found: Vec<EventRecord> = state
            .records
            .values()
            .filter(|r| r.ts_ms >= min_ts_ms)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.ts_ms, r.id));
        Ok(found)
    }

    async fn prune_older_than(&self, cutoff_ms: i64) -> StoreResult<usize> {
        let mut state = self.inner.lock().await;
        let before = state.records.len();
        state.records.retain(|_, r| r.ts_ms >= cutoff_ms);
        Ok(before.saturating_sub(state.records.len()))
    }

    async fn clear_all(&self) -> StoreResult<()> {
        self.inner.lock().await.records.clear();
        Ok(())
    }
}

/// One persisted entry.
///
/// The payload is the record's JSON form without its identifier; `ts_ms` is
/// duplicated outside it so pruning does not need to decode JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: u64,
    ts_ms: i64,
    payload: Vec<u8>,
    checksum: u32,
}

impl StoredEntry {
    fn from_record(id: u64, record: &EventRecord) -> StoreResult<Self> {
        let untagged = EventRecord {
            id: None,
            ..record.clone()
        };
        let payload = serde_json::to_vec(&untagged)?;
        let checksum = crc32c::crc32c(&payload);
        Ok(Self {
            id,
            ts_ms: record.ts_ms,
            payload,
            checksum,
        })
    }

    fn verify(&self) -> bool {
        crc32c::crc32c(&self.payload) == self.checksum
    }

    fn to_record(&self) -> StoreResult<EventRecord> {
        let value: Value = serde_json::from_slice(&self.payload)?;
        let Value::Object(map) = value else {
            return Err(StoreError::Serialization(format!(
                "entry {} payload is not a JSON object",
                self.id
            )));
        };
        Ok(EventRecord::from_object(map, Some(self.id), self.ts_ms))
    }

    /// Length-prefixed frame ready to append to a segment.
    fn encode_frame(&self) -> StoreResult<Vec<u8>> {
        let serialized = postcard::to_allocvec(self)?;
        let length = u32::try_from(serialized.len()).map_err(|_| {
            StoreError::Serialization(format!("entry {} exceeds frame size", self.id))
        })?;
        let mut frame = Vec::with_capacity(serialized.len().saturating_add(4));
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&serialized);
        Ok(frame)
    }
}

/// Entries recovered from one segment.
#[derive(Debug, Default)]
struct SegmentScan {
    entries: Vec<StoredEntry>,
    /// Corrupt or truncated entries encountered.
    skipped: usize,
}

/// Timestamp range of the entries in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentBounds {
    min_ts: i64,
    max_ts: i64,
}

impl SegmentBounds {
    const EMPTY: Self = Self {
        min_ts: i64::MAX,
        max_ts: i64::MIN,
    };

    fn of(entries: &[StoredEntry]) -> Self {
        let mut bounds = Self::EMPTY;
        for entry in entries {
            bounds.widen(entry.ts_ms);
        }
        bounds
    }

    fn widen(&mut self, ts_ms: i64) {
        self.min_ts = self.min_ts.min(ts_ms);
        self.max_ts = self.max_ts.max(ts_ms);
    }

    /// Whether any entry could be older than `cutoff_ms`.
    fn reaches_below(&self, cutoff_ms: i64) -> bool {
        self.min_ts < cutoff_ms
    }

    /// Whether any entry could be at or after `min_ts_ms`.
    fn reaches_from(&self, min_ts_ms: i64) -> bool {
        self.max_ts >= min_ts_ms
    }
}

/// The segment currently receiving appends.
///
/// Also tracks the timestamp range of every segment whose contents are
/// known to be intact. Segments missing from `bounds` are scanned by prune.
#[derive(Debug)]
struct ActiveSegment {
    file: fs::File,
    sequence: u32,
    size: u64,
    next_id: u64,
    bounds: HashMap<u32, SegmentBounds>,
}

/// Segment-file store.
#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
    segment_max_bytes: u64,
    active: Mutex<ActiveSegment>,
}

impl FileLogStore {
    /// Default segment size (8 MiB).
    pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

    /// Open or create a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the directory cannot be created or the active
    /// segment cannot be opened.
    pub async fn open(dir: PathBuf) -> StoreResult<Self> {
        Self::with_segment_max_bytes(dir, Self::DEFAULT_SEGMENT_MAX_BYTES).await
    }

    /// Open with a custom rotation threshold.
    pub async fn with_segment_max_bytes(dir: PathBuf, segment_max_bytes: u64) -> StoreResult<Self> {
        fs::create_dir_all(&dir).await?;

        let segments = list_segments(&dir).await?;
        let mut highest_id = 0_u64;
        let mut bounds = HashMap::new();
        for &(sequence, ref path) in &segments {
            match scan_segment(path).await {
                Ok(scan) => {
                    if let Some(max) = scan.entries.iter().map(|e| e.id).max() {
                        highest_id = highest_id.max(max);
                    }
                    if scan.skipped == 0 {
                        bounds.insert(sequence, SegmentBounds::of(&scan.entries));
                    }
                }
                Err(e) => warn!(path = ?path, error = %e, "Failed to scan segment, skipping"),
            }
        }

        let sequence = segments.last().map_or(1, |&(seq, _)| seq);
        let path = segment_path(&dir, sequence);
        if path.exists() {
            // Drop a torn tail so new appends stay readable
            let scan = scan_segment(&path).await?;
            if scan.skipped > 0 {
                warn!(segment = sequence, skipped = scan.skipped, "Repairing active segment");
                rewrite_segment(&path, &scan.entries).await?;
            }
            bounds.insert(sequence, SegmentBounds::of(&scan.entries));
        } else {
            bounds.insert(sequence, SegmentBounds::EMPTY);
        }
        let file = open_append(&path).await?;
        let size = fs::metadata(&path).await?.len();

        debug!(
            dir = ?dir,
            segment = sequence,
            highest_id = highest_id,
            "Opened log store"
        );

        Ok(Self {
            dir,
            segment_max_bytes,
            active: Mutex::new(ActiveSegment {
                file,
                sequence,
                size,
                next_id: highest_id.saturating_add(1),
                bounds,
            }),
        })
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Switch appends to the next segment.
    async fn rotate(&self, active: &mut ActiveSegment) -> StoreResult<()> {
        let sequence = active.sequence.saturating_add(1);
        let file = open_append(&segment_path(&self.dir, sequence)).await?;
        active.file = file;
        active.sequence = sequence;
        active.size = 0;
        active.bounds.insert(sequence, SegmentBounds::EMPTY);
        info!(segment = sequence, "Log store segment rotated");
        Ok(())
    }

}

#[async_trait]
impl LogStore for FileLogStore {
    #[allow(clippy::significant_drop_tightening)] // Lock is held across rotation
    async fn append(&self, records: &[EventRecord]) -> StoreResult<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut active = self.active.lock().await;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = assign_id(&mut active.next_id, record);
            let frame = StoredEntry::from_record(id, record)?.encode_frame()?;
            active.file.write_all(&frame).await?;
            let sequence = active.sequence;
            active
                .bounds
                .entry(sequence)
                .or_insert(SegmentBounds::EMPTY)
                .widen(record.ts_ms);
            #[allow(clippy::as_conversions)] // usize always fits in u64
            let written = frame.len() as u64;
            active.size = active.size.saturating_add(written);
            ids.push(id);

            if active.size >= self.segment_max_bytes {
                active.file.flush().await?;
                self.rotate(&mut active).await?;
            }
        }
        active.file.flush().await?;

        debug!(count = ids.len(), segment = active.sequence, "Appended records");
        Ok(ids)
    }

    #[allow(clippy::significant_drop_tightening)] // Lock is held while segments are read
    async fn query_since(&self, min_ts_ms: i64) -> StoreResult<Vec<EventRecord>> {
        let active = self.active.lock().await;
        let mut found = Vec::new();
        for (sequence, path) in list_segments(&self.dir).await? {
            if active
                .bounds
                .get(&sequence)
                .is_some_and(|b| !b.reaches_from(min_ts_ms))
            {
                continue;
            }
            let scan = match scan_segment(&path).await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read segment, skipping");
                    continue;
                }
            };
            for entry in scan.entries.iter().filter(|e| e.ts_ms >= min_ts_ms) {
                match entry.to_record() {
                    Ok(record) => found.push(record),
                    Err(e) => warn!(id = entry.id, error = %e, "Skipping undecodable entry"),
                }
            }
        }
        found.sort_by_key(|r| (r.ts_ms, r.id));
        Ok(found)
    }

    #[allow(clippy::significant_drop_tightening)] // Lock is held while segments are rewritten
    async fn prune_older_than(&self, cutoff_ms: i64) -> StoreResult<usize> {
        let mut active = self.active.lock().await;
        let mut removed = 0_usize;
        let mut scanned = 0_usize;

        for (sequence, path) in list_segments(&self.dir).await? {
            if active
                .bounds
                .get(&sequence)
                .is_some_and(|b| !b.reaches_below(cutoff_ms))
            {
                continue;
            }

            let scan = scan_segment(&path).await?;
            scanned = scanned.saturating_add(1);
            let before = scan.entries.len();
            let kept: Vec<StoredEntry> = scan
                .entries
                .into_iter()
                .filter(|e| e.ts_ms >= cutoff_ms)
                .collect();
            let expired = before.saturating_sub(kept.len());
            if expired == 0 && scan.skipped == 0 {
                active.bounds.insert(sequence, SegmentBounds::of(&kept));
                continue;
            }
            removed = removed.saturating_add(expired);

            let is_active = sequence == active.sequence;
            if kept.is_empty() && !is_active {
                fs::remove_file(&path).await?;
                active.bounds.remove(&sequence);
                debug!(segment = sequence, expired = expired, "Deleted expired segment");
                continue;
            }

            let size = rewrite_segment(&path, &kept).await?;
            active.bounds.insert(sequence, SegmentBounds::of(&kept));
            if is_active {
                // The old handle points at the replaced inode
                active.file = open_append(&path).await?;
                active.size = size;
            }
            debug!(
                segment = sequence,
                expired = expired,
                kept = kept.len(),
                "Rewrote partially expired segment"
            );
        }

        debug!(
            cutoff_ms = cutoff_ms,
            scanned = scanned,
            removed = removed,
            "Pruned log store"
        );
        Ok(removed)
    }

    #[allow(clippy::significant_drop_tightening)] // Lock is held while segments are removed
    async fn clear_all(&self) -> StoreResult<()> {
        let mut active = self.active.lock().await;
        for (_, path) in list_segments(&self.dir).await? {
            fs::remove_file(&path).await?;
        }
        let sequence = active.sequence.saturating_add(1);
        active.file = open_append(&segment_path(&self.dir, sequence)).await?;
        active.sequence = sequence;
        active.size = 0;
        active.bounds.clear();
        active.bounds.insert(sequence, SegmentBounds::EMPTY);
        info!(dir = ?self.dir, "Log store cleared");
        Ok(())
    }
}

fn segment_path(dir: &Path, sequence: u32) -> PathBuf {
    dir.join(format!("emitlog-{sequence:05}.log"))
}

fn parse_segment_filename(filename: &str) -> Option<u32> {
    filename
        .strip_prefix("emitlog-")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u32>().ok())
}

/// All segment files sorted by sequence.
async fn list_segments(dir: &Path) -> StoreResult<Vec<(u32, PathBuf)>> {
    let mut segments = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(filename) = path.file_name().and_then(|n| n.to_str())
            && let Some(sequence) = parse_segment_filename(filename)
        {
            segments.push((sequence, path));
        }
    }
    segments.sort_by_key(|s| s.0);
    Ok(segments)
}

/// Replace a segment's contents with `entries` via a temporary file.
async fn rewrite_segment(path: &Path, entries: &[StoredEntry]) -> StoreResult<u64> {
    let tmp = path.with_extension("log.tmp");
    let mut bytes = Vec::new();
    for entry in entries {
        bytes.extend_from_slice(&entry.encode_frame()?);
    }
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    #[allow(clippy::as_conversions)] // usize always fits in u64
    Ok(bytes.len() as u64)
}

async fn open_append(path: &Path) -> StoreResult<fs::File> {
    Ok(fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?)
}

/// Upper bound on a single encoded entry.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read every valid entry from a segment.
async fn scan_segment(path: &Path) -> StoreResult<SegmentScan> {
    let mut file = fs::File::open(path).await?;
    let mut scan = SegmentScan::default();
    let mut prefix = [0_u8; 4];

    loop {
        match file.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        #[allow(clippy::as_conversions)] // u32 length fits in usize
        let length = u32::from_le_bytes(prefix) as usize;
        if length > MAX_FRAME_BYTES {
            warn!(path = ?path, length = length, "Implausible entry length, ignoring rest of segment");
            scan.skipped = scan.skipped.saturating_add(1);
            break;
        }

        let mut data = vec![0_u8; length];
        match file.read_exact(&mut data).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(path = ?path, "Skipping partial entry (truncated data)");
                scan.skipped = scan.skipped.saturating_add(1);
                break;
            }
            Err(e) => return Err(e.into()),
        }

        match postcard::from_bytes::<StoredEntry>(&data) {
            Ok(entry) if entry.verify() => scan.entries.push(entry),
            Ok(entry) => {
                warn!(id = entry.id, "Skipping corrupted entry (checksum mismatch)");
                scan.skipped = scan.skipped.saturating_add(1);
            }
            Err(e) => {
                warn!(error = %e, "Skipping corrupted entry (deserialization failed)");
                scan.skipped = scan.skipped.saturating_add(1);
            }
        }
    }

    Ok(scan)
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use crate::models::EmitKind;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn record(ts_ms: i64, text: &str) -> EventRecord {
        EventRecord::new(EmitKind::OcrRaw, ts_ms)
            .with_attribute("text", text)
            .with_attribute("cam_id", "cam_1")
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryLogStore::new();
        let ids = store
            .append(&[record(300, "c"), record(100, "a"), record(200, "b")])
            .await
            .expect("append");
        assert_eq!(ids, vec![1, 2, 3]);

        let since = store.query_since(200).await.expect("query");
        let texts: Vec<&str> = since.iter().map(EventRecord::text).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(since[0].id, Some(3));

        assert_eq!(store.prune_older_than(300).await.expect("prune"), 2);
        assert_eq!(store.len().await, 1);

        store.clear_all().await.expect("clear");
        assert!(store.is_empty().await);

        // Identifiers keep increasing after a clear
        let ids = store.append(&[record(1, "d")]).await.expect("append");
        assert_eq!(ids, vec![4]);
    }

    #[tokio::test]
    async fn test_memory_store_keeps_existing_ids() {
        let store = MemoryLogStore::new();
        let ids = store
            .append(&[record(1, "a").with_id(10), record(2, "b")])
            .await
            .expect("append");
        assert_eq!(ids, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_file_store_roundtrips_records() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileLogStore::open(temp_dir.path().to_path_buf())
            .await
            .expect("open store");

        let original = record(1_000, "KA01AB1234")
            .with_attribute("data", serde_json::json!({"conf": 0.8, "track_id": 4}));
        let ids = store.append(&[original.clone()]).await.expect("append");
        assert_eq!(ids, vec![1]);

        let found = store.query_since(0).await.expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], original.with_id(1));
    }

    #[tokio::test]
    async fn test_file_store_ids_continue_across_restart() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        {
            let store = FileLogStore::open(dir.clone()).await.expect("open store");
            store
                .append(&[record(1, "a"), record(2, "b")])
                .await
                .expect("append");
        }

        let store = FileLogStore::open(dir).await.expect("reopen store");
        let ids = store.append(&[record(3, "c")]).await.expect("append");
        assert_eq!(ids, vec![3]);
        assert_eq!(store.query_since(0).await.expect("query").len(), 3);
    }

    #[tokio::test]
    async fn test_file_store_rotation_and_prune() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileLogStore::with_segment_max_bytes(temp_dir.path().to_path_buf(), 128)
            .await
            .expect("open store");

        let records: Vec<EventRecord> = (0..20).map(|i| record(i * 100, "rotating")).collect();
        store.append(&records).await.expect("append");

        let segments = list_segments(temp_dir.path()).await.expect("list");
        assert!(segments.len() > 1, "expected rotation, got {segments:?}");

        let removed = store.prune_older_than(1_050).await.expect("prune");
        assert_eq!(removed, 11);

        let remaining = store.query_since(i64::MIN).await.expect("query");
        assert_eq!(remaining.len(), 9);
        assert!(remaining.iter().all(|r| r.ts_ms >= 1_050));

        // Appends keep working after the active segment was rewritten
        store.append(&[record(5_000, "after")]).await.expect("append");
        assert_eq!(store.query_since(5_000).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_prune_rewrites_active_segment() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileLogStore::open(temp_dir.path().to_path_buf())
            .await
            .expect("open store");

        store
            .append(&[record(10, "old"), record(20, "new")])
            .await
            .expect("append");
        assert_eq!(store.prune_older_than(15).await.expect("prune"), 1);
        store.append(&[record(30, "newer")]).await.expect("append");

        let texts: Vec<String> = store
            .query_since(0)
            .await
            .expect("query")
            .iter()
            .map(|r| r.text().to_owned())
            .collect();
        assert_eq!(texts, vec!["new", "newer"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_file_store_prune_skips_unexpired_segments() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // Every append fills a segment, so each record gets its own
        let store = FileLogStore::with_segment_max_bytes(temp_dir.path().to_path_buf(), 1)
            .await
            .expect("open store");
        store
            .append(&[record(100, "a"), record(200, "b"), record(300, "c")])
            .await
            .expect("append");
        assert_eq!(list_segments(temp_dir.path()).await.expect("list").len(), 4);

        assert_eq!(store.prune_older_than(150).await.expect("prune"), 1);
        assert!(logs_contain("cutoff_ms=150 scanned=1 removed=1"));

        assert_eq!(store.prune_older_than(150).await.expect("prune"), 0);
        assert!(logs_contain("cutoff_ms=150 scanned=0 removed=0"));

        assert_eq!(store.prune_older_than(250).await.expect("prune"), 1);
        assert!(logs_contain("cutoff_ms=250 scanned=1 removed=1"));

        let texts: Vec<String> = store
            .query_since(i64::MIN)
            .await
            .expect("query")
            .iter()
            .map(|r| r.text().to_owned())
            .collect();
        assert_eq!(texts, vec!["c"]);
    }

    #[tokio::test]
    async fn test_file_store_prune_after_reopen_uses_scanned_bounds() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        {
            let store = FileLogStore::with_segment_max_bytes(dir.clone(), 1)
                .await
                .expect("open store");
            store
                .append(&[record(100, "a"), record(200, "b")])
                .await
                .expect("append");
        }

        let store = FileLogStore::with_segment_max_bytes(dir, 1)
            .await
            .expect("reopen store");
        assert_eq!(store.prune_older_than(150).await.expect("prune"), 1);
        store.append(&[record(50, "late")]).await.expect("append");
        assert_eq!(store.prune_older_than(150).await.expect("prune"), 1);

        let found = store.query_since(i64::MIN).await.expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text(), "b");
    }

    #[tokio::test]
    async fn test_file_store_clear_all() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileLogStore::open(temp_dir.path().to_path_buf())
            .await
            .expect("open store");

        store.append(&[record(1, "a")]).await.expect("append");
        store.clear_all().await.expect("clear");
        assert!(store.query_since(i64::MIN).await.expect("query").is_empty());

        let ids = store.append(&[record(2, "b")]).await.expect("append");
        assert_eq!(ids, vec![2]);
        assert_eq!(store.query_since(i64::MIN).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupted_entry() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        {
            let store = FileLogStore::open(dir.clone()).await.expect("open store");
            store
                .append(&[record(1, "first"), record(2, "second")])
                .await
                .expect("append");
        }

        // Flip the last payload byte of the second entry
        let path = segment_path(&dir, 1);
        let mut contents = tokio::fs::read(&path).await.expect("read segment");
        let last = contents.len() - 6;
        contents[last] ^= 0xFF;
        tokio::fs::write(&path, &contents).await.expect("write segment");

        let store = FileLogStore::open(dir).await.expect("reopen store");
        let found = store.query_since(i64::MIN).await.expect("query");
        assert!(!found.is_empty());
        assert!(found.len() < 2);
        assert_eq!(found[0].text(), "first");
    }

    #[tokio::test]
    async fn test_file_store_handles_truncated_tail() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        {
            let store = FileLogStore::open(dir.clone()).await.expect("open store");
            store.append(&[record(1, "intact")]).await.expect("append");
        }

        let path = segment_path(&dir, 1);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .expect("open segment");
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).await.expect("write tail");
        file.flush().await.expect("flush");
        drop(file);

        let store = FileLogStore::open(dir).await.expect("reopen store");
        store.append(&[record(2, "appended")]).await.expect("append");
        let found = store.query_since(i64::MIN).await.expect("query");
        let texts: Vec<&str> = found.iter().map(EventRecord::text).collect();
        assert_eq!(texts, vec!["intact", "appended"]);
    }

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(parse_segment_filename("emitlog-00001.log"), Some(1));
        assert_eq!(parse_segment_filename("emitlog-00042.log"), Some(42));
        assert_eq!(parse_segment_filename("emitlog-00001.log.tmp"), None);
        assert_eq!(parse_segment_filename("other-00001.log"), None);
    }
}
