use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::ValueKind;

/// Upper bound of the extraction service's confidence scale.
pub const MAX_CONFIDENCE: f32 = 100.0;

/// One query's answer as returned by the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAnswer {
    pub metric: String,
    pub text: String,
    /// Confidence in [0, 100].
    pub confidence: f32,
}

impl RawAnswer {
    pub fn new(metric: impl Into<String>, text: impl Into<String>, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, MAX_CONFIDENCE)
        };
        Self { metric: metric.into(), text: text.into(), confidence }
    }
}

/// A normalized clinical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(#[serde(with = "rust_decimal::serde::float")] Decimal),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Number(_) => ValueKind::Numeric,
            FieldValue::Date(_) => ValueKind::Date,
            FieldValue::Text(_) => ValueKind::Text,
        }
    }

    /// Read a stored value as `kind`. Text that looks like a number or a
    /// date stays text.
    fn from_stored(kind: ValueKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ValueKind::Numeric => FieldValue::Number(rust_decimal::serde::float::deserialize(value)?),
            ValueKind::Date => FieldValue::Date(NaiveDate::deserialize(value)?),
            ValueKind::Text => FieldValue::Text(String::deserialize(value)?),
        })
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Normal,
    Flagged,
    Suppressed,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Normal => write!(f, "normal"),
            Visibility::Flagged => write!(f, "flagged"),
            Visibility::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// Confidence band of a field. Only the visible bands carry a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Band {
    Normal(FieldValue),
    /// Visible, but the reviewer must confirm it.
    Flagged(FieldValue),
    Suppressed,
}

impl Band {
    pub fn visibility(&self) -> Visibility {
        match self {
            Band::Normal(_) => Visibility::Normal,
            Band::Flagged(_) => Visibility::Flagged,
            Band::Suppressed => Visibility::Suppressed,
        }
    }

    pub fn value(&self) -> Option<&FieldValue> {
        match self {
            Band::Normal(v) | Band::Flagged(v) => Some(v),
            Band::Suppressed => None,
        }
    }
}

/// The classified result for one metric. The raw text is kept for audit
/// even when the value was discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "FieldRecord", try_from = "FieldRecord")]
pub struct ExtractedField {
    pub metric: String,
    pub raw_text: String,
    pub confidence: f32,
    pub band: Band,
}

impl ExtractedField {
    pub fn value(&self) -> Option<&FieldValue> {
        self.band.value()
    }

    pub fn visibility(&self) -> Visibility {
        self.band.visibility()
    }
}

/// Stored shape of an [`ExtractedField`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldRecord {
    metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<ValueKind>,
    value: Option<serde_json::Value>,
    raw_text: String,
    confidence: f32,
    visibility: Visibility,
}

impl From<ExtractedField> for FieldRecord {
    fn from(f: ExtractedField) -> Self {
        let visibility = f.band.visibility();
        let value = match f.band {
            Band::Normal(v) | Band::Flagged(v) => Some(v),
            Band::Suppressed => None,
        };
        FieldRecord {
            metric: f.metric,
            kind: value.as_ref().map(FieldValue::kind),
            // Infallible for every FieldValue.
            value: value.and_then(|v| serde_json::to_value(v).ok()),
            raw_text: f.raw_text,
            confidence: f.confidence,
            visibility,
        }
    }
}

impl TryFrom<FieldRecord> for ExtractedField {
    type Error = String;

    fn try_from(r: FieldRecord) -> Result<Self, Self::Error> {
        let value = match (r.kind, r.value) {
            (_, None) | (_, Some(serde_json::Value::Null)) => None,
            (Some(kind), Some(raw)) => Some(
                FieldValue::from_stored(kind, raw)
                    .map_err(|e| format!("field '{}' is not a valid {kind:?} value: {e}", r.metric))?,
            ),
            // Records written before the kind was stored.
            (None, Some(raw)) => Some(
                FieldValue::deserialize(raw).map_err(|e| format!("field '{}': {e}", r.metric))?,
            ),
        };
        let band = match (r.visibility, value) {
            (Visibility::Normal, Some(v)) => Band::Normal(v),
            (Visibility::Flagged, Some(v)) => Band::Flagged(v),
            (Visibility::Suppressed, None) => Band::Suppressed,
            (Visibility::Suppressed, Some(_)) => {
                return Err(format!("suppressed field '{}' carries a value", r.metric))
            }
            (vis, None) => return Err(format!("{vis} field '{}' has no value", r.metric)),
        };
        Ok(ExtractedField {
            metric: r.metric,
            raw_text: r.raw_text,
            confidence: r.confidence,
            band,
        })
    }
}

/// Per-document extraction output keyed by metric. A `None` entry is a
/// catalog query the service did not answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionResult {
    fields: BTreeMap<String, Option<ExtractedField>>,
}

/// Visibility tally of one result, used in batch reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldCounts {
    pub normal: usize,
    pub flagged: usize,
    pub suppressed: usize,
    pub missing: usize,
}

impl ExtractionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: ExtractedField) {
        self.fields.insert(field.metric.clone(), Some(field));
    }

    pub fn insert_missing(&mut self, metric: impl Into<String>) {
        self.fields.insert(metric.into(), None);
    }

    /// `None` when the metric is absent or was not answered.
    pub fn get(&self, metric: &str) -> Option<&ExtractedField> {
        self.fields.get(metric).and_then(Option::as_ref)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.fields.contains_key(metric)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&ExtractedField>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn counts(&self) -> FieldCounts {
        self.fields.values().fold(FieldCounts::default(), |mut c, f| {
            match f.as_ref().map(ExtractedField::visibility) {
                Some(Visibility::Normal) => c.normal += 1,
                Some(Visibility::Flagged) => c.flagged += 1,
                Some(Visibility::Suppressed) => c.suppressed += 1,
                None => c.missing += 1,
            }
            c
        })
    }
}
