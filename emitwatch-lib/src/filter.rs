//! Presentation filter over the visible log.
//!
//! A pure pass over the current entries and an active category selection.
//! It suppresses low-confidence `WRONG_DIRECTION` emits, caps `SPEEDING`
//! rows per pass and caps repeated (category, track, text) triples. The
//! underlying log is never touched.

use crate::config::FilterConfig;
use crate::models::{EmitKind, EventRecord};
use std::collections::HashMap;

/// Filter thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPolicy {
    /// `SPEEDING` rows kept per pass, first ones in log order.
    pub speeding_cap: usize,
    /// Rows kept per (category, track id, text) triple.
    pub track_text_cap: usize,
    /// `WRONG_DIRECTION` rows need a confidence strictly above this.
    pub wrong_direction_min_confidence_pct: f64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::from(&FilterConfig::default())
    }
}

impl From<&FilterConfig> for FilterPolicy {
    fn from(config: &FilterConfig) -> Self {
        Self {
            speeding_cap: config.speeding_cap,
            track_text_cap: config.track_text_cap,
            wrong_direction_min_confidence_pct: config.wrong_direction_min_confidence_pct,
        }
    }
}

impl FilterPolicy {
    /// Entries that survive the filter for `selection`, in input order.
    ///
    /// Records without a category never match. Deterministic for the same
    /// input and selection.
    pub fn apply<'a, T>(
        &self,
        entries: impl IntoIterator<Item = &'a T>,
        selection: &[EmitKind],
    ) -> Vec<&'a T>
    where
        T: AsRef<EventRecord> + 'a,
    {
        if selection.is_empty() {
            return Vec::new();
        }

        let mut speeding_visible = 0_usize;
        let mut seen: HashMap<String, usize> = HashMap::new();

        entries
            .into_iter()
            .filter(|entry| {
                let record: &EventRecord = (*entry).as_ref();
                let Some(ref kind) = record.kind else {
                    return false;
                };
                if !selection.contains(kind) {
                    return false;
                }

                match *kind {
                    EmitKind::WrongDirection => {
                        let confident = record
                            .confidence_pct()
                            .is_some_and(|pct| pct > self.wrong_direction_min_confidence_pct);
                        if !confident {
                            return false;
                        }
                    }
                    EmitKind::Speeding => {
                        if speeding_visible >= self.speeding_cap {
                            return false;
                        }
                        speeding_visible = speeding_visible.saturating_add(1);
                        return true;
                    }
                    _ => {}
                }

                let Some(key) = dedup_key(record) else {
                    return true;
                };
                let count = seen.entry(key).or_insert(0);
                if *count >= self.track_text_cap {
                    return false;
                }
                *count = count.saturating_add(1);
                true
            })
            .collect()
    }
}

/// (category, track id, text) key, or `None` when the record bypasses dedup.
fn dedup_key(record: &EventRecord) -> Option<String> {
    let track_id = record.track_id()?;
    let text = record.text();
    if text.is_empty() || text.eq_ignore_ascii_case("NULL") {
        return None;
    }
    let kind = record.kind_str().unwrap_or("UNKNOWN");
    Some(format!("{kind}::{track_id}::{text}"))
}

/// Selection universe: the known categories followed by every other
/// category seen in `records`, first-seen order, no duplicates.
pub fn available_kinds<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Vec<EmitKind> {
    let mut kinds: Vec<EmitKind> = EmitKind::KNOWN.to_vec();
    for kind in records.into_iter().filter_map(|r| r.kind.as_ref()) {
        if !kinds.contains(kind) {
            kinds.push(kind.clone());
        }
    }
    kinds
}
