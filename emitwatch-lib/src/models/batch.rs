//! Flush batch identity and per-category summaries.

use crate::models::{EmitKind, EventRecord};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Identifier shared by every record committed in one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchToken {
    /// Wall-clock time of the flush in epoch milliseconds.
    pub issued_ms: i64,
    /// Per-pipeline flush serial, disambiguates flushes within one millisecond.
    pub serial: u64,
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}-{}", self.issued_ms, self.serial)
    }
}

impl Serialize for BatchToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Counts for the four known categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCounts {
    pub wrong_direction: u32,
    pub plate_final: u32,
    pub ocr_raw: u32,
    pub speeding: u32,
}

impl CategoryCounts {
    /// Count one record of `kind`; unknown categories are ignored.
    pub fn record(&mut self, kind: &EmitKind) {
        let slot = match *kind {
            EmitKind::WrongDirection => &mut self.wrong_direction,
            EmitKind::PlateFinal => &mut self.plate_final,
            EmitKind::OcrRaw => &mut self.ocr_raw,
            EmitKind::Speeding => &mut self.speeding,
            EmitKind::Other(_) => return,
        };
        *slot = slot.saturating_add(1);
    }

    /// Tally the known categories across `records`.
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Self {
        let mut counts = Self::default();
        for kind in records.into_iter().filter_map(|r| r.kind.as_ref()) {
            counts.record(kind);
        }
        counts
    }

    /// Count for a single category (zero for unknown ones).
    pub const fn get(&self, kind: &EmitKind) -> u32 {
        match *kind {
            EmitKind::WrongDirection => self.wrong_direction,
            EmitKind::PlateFinal => self.plate_final,
            EmitKind::OcrRaw => self.ocr_raw,
            EmitKind::Speeding => self.speeding,
            EmitKind::Other(_) => 0,
        }
    }

    /// Sum over the four categories.
    pub const fn total(&self) -> u32 {
        self.wrong_direction
            .saturating_add(self.plate_final)
            .saturating_add(self.ocr_raw)
            .saturating_add(self.speeding)
    }
}

/// Summary of one non-empty flush, handed to the metrics series and to any
/// presentation layer. Consumers retract it by token after the banner window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub token: BatchToken,
    /// Records in the batch, including unknown categories.
    pub count: usize,
    #[serde(rename = "batchTimestamp")]
    pub ts_ms: i64,
    #[serde(rename = "countsByCategory")]
    pub counts: CategoryCounts,
}
