//! Emit record model and inbound normalization.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Record decoding errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
}

/// Emit category tag.
///
/// The category set is open: the four known tags get their own variants and
/// anything else is carried verbatim in [`EmitKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmitKind {
    OcrRaw,
    Speeding,
    PlateFinal,
    WrongDirection,
    Other(String),
}

impl EmitKind {
    /// The four categories tracked by batch summaries and the metrics series.
    pub const KNOWN: [Self; 4] = [
        Self::OcrRaw,
        Self::Speeding,
        Self::PlateFinal,
        Self::WrongDirection,
    ];

    /// Wire tag for this category.
    pub fn as_str(&self) -> &str {
        match *self {
            Self::OcrRaw => "OCR_RAW",
            Self::Speeding => "SPEEDING",
            Self::PlateFinal => "PLATE_FINAL",
            Self::WrongDirection => "WRONG_DIRECTION",
            Self::Other(ref tag) => tag,
        }
    }

    /// Whether this is one of the [`KNOWN`](Self::KNOWN) categories.
    pub const fn is_known(&self) -> bool {
        !matches!(*self, Self::Other(_))
    }
}

impl From<&str> for EmitKind {
    fn from(tag: &str) -> Self {
        match tag {
            "OCR_RAW" => Self::OcrRaw,
            "SPEEDING" => Self::Speeding,
            "PLATE_FINAL" => Self::PlateFinal,
            "WRONG_DIRECTION" => Self::WrongDirection,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EmitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EmitKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One emit produced by the upstream recognition system.
///
/// `kind` and `ts_ms` are lifted out of the payload; everything else (text,
/// confidence, vehicle class, direction, track and camera identifiers, nested
/// `data`) stays in `attributes` untouched. Records are never mutated after
/// construction; presentation state lives beside them, not in them.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Ordering identifier assigned by the durable store; `None` before persist.
    pub id: Option<u64>,
    /// Category tag; `None` when the payload carried no string `type`.
    pub kind: Option<EmitKind>,
    /// Epoch milliseconds, always resolved.
    pub ts_ms: i64,
    /// Remaining payload fields.
    pub attributes: Map<String, Value>,
}

impl EventRecord {
    /// Build a record of the given category with no extra attributes.
    pub fn new(kind: EmitKind, ts_ms: i64) -> Self {
        Self {
            id: None,
            kind: Some(kind),
            ts_ms,
            attributes: Map::new(),
        }
    }

    /// Add an attribute (builder style).
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Parse an inbound text message.
    ///
    /// The payload must be a JSON object. A missing or non-numeric `ts_ms` is
    /// replaced by `received_ms`. Any `id` in the payload is left among the
    /// attributes; store identifiers are only assigned on persist.
    pub fn parse_message(text: &str, received_ms: i64) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(RecordError::NotAnObject {
                found: json_type_name(&value),
            });
        };
        Ok(Self::from_object(map, None, received_ms))
    }

    /// Build a record from a decoded JSON object.
    pub fn from_object(mut map: Map<String, Value>, id: Option<u64>, fallback_ts_ms: i64) -> Self {
        let kind = match map.get("type") {
            Some(&Value::String(ref tag)) => Some(EmitKind::from(tag.as_str())),
            _ => None,
        };
        if kind.is_some() {
            map.remove("type");
        }

        let ts_ms = map
            .remove("ts_ms")
            .as_ref()
            .and_then(numeric_millis)
            .unwrap_or(fallback_ts_ms);

        Self {
            id,
            kind,
            ts_ms,
            attributes: map,
        }
    }

    /// Same record with a store identifier attached.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Same record without a store identifier (the form handed to `append`).
    #[must_use]
    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    /// Category tag as a string, or `None` when the record has none.
    pub fn kind_str(&self) -> Option<&str> {
        self.kind.as_ref().map(EmitKind::as_str)
    }

    /// Whether the record belongs to the given category.
    pub fn is_kind(&self, kind: &EmitKind) -> bool {
        self.kind.as_ref() == Some(kind)
    }

    /// Look up an attribute at the top level, then inside the nested `data`
    /// object. JSON `null` counts as absent.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.attributes
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| {
                self.attributes
                    .get("data")
                    .and_then(|data| data.get(key))
                    .filter(|v| !v.is_null())
            })
    }

    /// Confidence as a percentage.
    ///
    /// Values `<= 1` are read as fractions, anything larger as an already
    /// scaled percentage. `conf` takes precedence over `confidence`; the first
    /// non-null candidate decides, and a non-numeric candidate yields `None`.
    pub fn confidence_pct(&self) -> Option<f64> {
        let raw = self
            .lookup("conf")
            .or_else(|| self.lookup("confidence"))?
            .as_f64()?;
        Some(if raw <= 1.0 { raw * 100.0 } else { raw })
    }

    /// Track identifier rendered as a string; falsy values count as absent.
    pub fn track_id(&self) -> Option<String> {
        match *self.lookup("track_id")? {
            Value::Bool(false) => None,
            Value::Bool(true) => Some("true".to_owned()),
            Value::String(ref s) if s.is_empty() => None,
            Value::String(ref s) => Some(s.clone()),
            Value::Number(ref n) if n.as_f64() == Some(0.0) => None,
            Value::Number(ref n) => Some(n.to_string()),
            ref other => Some(other.to_string()),
        }
    }

    /// Recognized plate text, trimmed; empty when absent or not a string.
    pub fn text(&self) -> &str {
        self.lookup("text").and_then(Value::as_str).map_or("", str::trim)
    }

    /// Camera identifier, if present.
    pub fn cam_id(&self) -> Option<&str> {
        self.lookup("cam_id").and_then(Value::as_str)
    }

    /// Full JSON form: attributes plus `type`, `ts_ms` and `id` (when set).
    pub fn to_json_value(&self) -> Value {
        let mut map = self.attributes.clone();
        if let Some(ref kind) = self.kind {
            map.insert("type".to_owned(), Value::String(kind.as_str().to_owned()));
        }
        map.insert("ts_ms".to_owned(), Value::from(self.ts_ms));
        if let Some(id) = self.id {
            map.insert("id".to_owned(), Value::from(id));
        }
        Value::Object(map)
    }
}

impl AsRef<Self> for EventRecord {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

/// Interpret a JSON number as epoch milliseconds.
fn numeric_millis(value: &Value) -> Option<i64> {
    let Value::Number(ref number) = *value else {
        return None;
    };
    if let Some(ms) = number.as_i64() {
        return Some(ms);
    }
    let float = number.as_f64().filter(|f| f.is_finite())?;
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)] // Saturating float-to-int cast
    Some(float.trunc() as i64)
}

const fn json_type_name(value: &Value) -> &'static str {
    match *value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
