//! Verbatim -> canonical transformation
//!
//! The pipeline only needs a [`Normalizer`] per deployment; the field mapping of
//! each source belongs to that normalizer. [`DwcNormalizer`] maps payloads keyed
//! by Darwin Core terms, which is what archive sources and most API pollers emit.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::registry::Source;
use super::types::{CanonicalRecord, ValidationIssue, VerbatimRecord};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("payload is not an object")]
    NotAnObject,

    #[error("field '{field}' has unusable value '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

impl NormalizeError {
    pub fn into_issue(self) -> ValidationIssue {
        match self {
            NormalizeError::NotAnObject => ValidationIssue::new("payload", "payload is not an object"),
            NormalizeError::InvalidValue { field, value } => {
                ValidationIssue::new(field, format!("unusable value '{value}'"))
            },
        }
    }
}

pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        source: &Source,
        record: &VerbatimRecord,
    ) -> std::result::Result<CanonicalRecord, NormalizeError>;
}

/// Normalize and check a record; `Err` carries every reason it is unusable
pub fn classify(
    normalizer: &dyn Normalizer,
    source: &Source,
    record: &VerbatimRecord,
) -> std::result::Result<CanonicalRecord, Vec<ValidationIssue>> {
    let canonical = normalizer
        .normalize(source, record)
        .map_err(|e| vec![e.into_issue()])?;
    let issues = canonical.issues();
    if issues.is_empty() {
        Ok(canonical)
    } else {
        Err(issues)
    }
}

const OCCURRENCE_ID: &str = "occurrenceID";
const SCIENTIFIC_NAME: &str = "scientificName";
const EVENT_DATE: &str = "eventDate";
const LATITUDE: &str = "decimalLatitude";
const LONGITUDE: &str = "decimalLongitude";
const INDIVIDUAL_COUNT: &str = "individualCount";

const MAPPED_TERMS: [&str; 6] = [
    OCCURRENCE_ID,
    SCIENTIFIC_NAME,
    EVENT_DATE,
    LATITUDE,
    LONGITUDE,
    INDIVIDUAL_COUNT,
];

/// Darwin Core term mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct DwcNormalizer;

impl Normalizer for DwcNormalizer {
    fn normalize(
        &self,
        source: &Source,
        record: &VerbatimRecord,
    ) -> std::result::Result<CanonicalRecord, NormalizeError> {
        let payload = record.payload.as_object().ok_or(NormalizeError::NotAnObject)?;

        let occurrence_id = text(payload, OCCURRENCE_ID).unwrap_or_else(|| record.record_id.clone());
        let event_date = match text(payload, EVENT_DATE) {
            Some(raw) => Some(parse_event_date(&raw).ok_or(NormalizeError::InvalidValue {
                field: EVENT_DATE,
                value: raw,
            })?),
            None => None,
        };

        let attributes: BTreeMap<String, Value> = payload
            .iter()
            .filter(|(key, _)| !MAPPED_TERMS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(CanonicalRecord {
            source_id: source.id,
            occurrence_id,
            scientific_name: text(payload, SCIENTIFIC_NAME),
            event_date,
            latitude: number(payload, LATITUDE)?,
            longitude: number(payload, LONGITUDE)?,
            individual_count: count(payload, INDIVIDUAL_COUNT)?,
            attributes,
        })
    }
}

fn text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(
    payload: &Map<String, Value>,
    key: &'static str,
) -> std::result::Result<Option<f64>, NormalizeError> {
    let invalid = |value: &Value| NormalizeError::InvalidValue {
        field: key,
        value: value.to_string(),
    };
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(&Value::String(s.clone()))),
        Some(other) => Err(invalid(other)),
    }
}

fn count(
    payload: &Map<String, Value>,
    key: &'static str,
) -> std::result::Result<Option<u32>, NormalizeError> {
    let invalid = |value: &Value| NormalizeError::InvalidValue {
        field: key,
        value: value.to_string(),
    };
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| invalid(&Value::String(s.clone()))),
        Some(other) => Err(invalid(other)),
    }
}

/// Accepts `YYYY-MM-DD`, an ISO timestamp, or an interval whose start is either
fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let start = raw.split('/').next()?.trim();
    let date = start.get(..10).unwrap_or(start);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
