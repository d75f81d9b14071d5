use std::future::Future;

use chrono::{DateTime, Utc};
use labstage_core::{DocumentLocator, DocumentType, PatientId, StorageLocation};
use serde::Deserialize;
use thiserror::Error;

// ── Trigger envelope ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(rename = "eventTime", default)]
    event_time: Option<DateTime<Utc>>,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed event envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// One object-created notification, key already URL-decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub location: StorageLocation,
    pub event_time: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(location: StorageLocation) -> Self {
        Self { location, event_time: None }
    }
}

/// Parse an object-created event envelope.
///
/// Keys arrive form-encoded (`+` for space). A key that does not decode to
/// UTF-8 is kept as-is; the metadata lookup will then report it.
pub fn parse_notifications(json: &str) -> Result<Vec<Notification>, EventError> {
    let envelope: Envelope = serde_json::from_str(json)?;
    Ok(envelope
        .records
        .into_iter()
        .map(|r| Notification {
            location: StorageLocation::new(r.s3.bucket.name, decode_key(&r.s3.object.key)),
            event_time: r.event_time,
        })
        .collect())
}

fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(key) => key.into_owned(),
        Err(e) => {
            tracing::warn!(key = raw, error = %e, "object key is not valid UTF-8 after decoding");
            raw.to_string()
        }
    }
}

// ── Object metadata ───────────────────────────────────────────────────────────

/// User metadata declared on a stored object, as returned by a head call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMetadata {
    pub patient_id: Option<String>,
    pub document_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("Object {0} not found")]
    NotFound(StorageLocation),
    #[error("Object {0} has no patient-id metadata")]
    MissingPatientId(StorageLocation),
    #[error("Object {location} has unparseable patient-id {value:?}")]
    InvalidPatientId { location: StorageLocation, value: String },
    #[error("Object {0} has no document-type metadata")]
    MissingDocumentType(StorageLocation),
    #[error("Object {location} has unparseable document-type {value:?}")]
    InvalidDocumentType { location: StorageLocation, value: String },
    #[error("Metadata lookup for {location} failed: {detail}")]
    Lookup { location: StorageLocation, detail: String },
}

/// Storage-layer head interface.
pub trait ObjectMetadataSource: Send + Sync {
    fn head(
        &self,
        location: &StorageLocation,
    ) -> impl Future<Output = Result<ObjectMetadata, MetadataError>> + Send;
}

/// Resolve a notification into a locator using the object's declared metadata.
pub async fn decode<M: ObjectMetadataSource>(
    notification: &Notification,
    source: &M,
) -> Result<DocumentLocator, MetadataError> {
    let location = &notification.location;
    let meta = source.head(location).await?;

    let patient_raw = meta
        .patient_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| MetadataError::MissingPatientId(location.clone()))?;
    let patient_id = patient_raw
        .parse::<PatientId>()
        .map_err(|_| MetadataError::InvalidPatientId {
            location: location.clone(),
            value: patient_raw.clone(),
        })?;

    let type_raw = meta
        .document_type
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| MetadataError::MissingDocumentType(location.clone()))?;
    let document_type = type_raw
        .parse::<DocumentType>()
        .map_err(|_| MetadataError::InvalidDocumentType {
            location: location.clone(),
            value: type_raw.clone(),
        })?;

    Ok(DocumentLocator {
        location: location.clone(),
        document_type,
        patient_id,
        uploaded_at: notification
            .event_time
            .or(meta.last_modified)
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::StaticMetadataSource;

    const PATIENT: &str = "6f1c1f3e-2a4b-4c55-9d7e-0a1b2c3d4e5f";

    #[test]
    fn parses_envelope_and_decodes_keys() {
        let json = r#"{
            "Records": [
                {
                    "eventTime": "2026-03-04T10:15:00.000Z",
                    "s3": { "bucket": { "name": "patient-uploads" },
                            "object": { "key": "p1/Lab+Results%20March.pdf" } }
                },
                { "s3": { "bucket": { "name": "patient-uploads" }, "object": { "key": "p2/labs.pdf" } } }
            ]
        }"#;
        let notes = parse_notifications(json).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].location.key, "p1/Lab Results March.pdf");
        assert_eq!(
            notes[0].event_time.unwrap().to_rfc3339(),
            "2026-03-04T10:15:00+00:00"
        );
        assert_eq!(notes[1].event_time, None);
    }

    #[test]
    fn empty_envelope_is_an_empty_batch() {
        assert!(parse_notifications("{}").unwrap().is_empty());
        assert!(parse_notifications("not json").is_err());
    }

    fn meta(patient: Option<&str>, doc_type: Option<&str>) -> ObjectMetadata {
        ObjectMetadata {
            patient_id: patient.map(str::to_string),
            document_type: doc_type.map(str::to_string),
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn decodes_declared_metadata() {
        let loc = StorageLocation::new("b", "p1/labs.pdf");
        let source = StaticMetadataSource::new().with(loc.clone(), meta(Some(PATIENT), Some("Current-Labs")));
        let locator = decode(&Notification::new(loc.clone()), &source).await.unwrap();
        assert_eq!(locator.location, loc);
        assert_eq!(locator.document_type, DocumentType::current_labs());
        assert_eq!(locator.patient_id.to_string(), PATIENT);
    }

    #[tokio::test]
    async fn event_time_wins_over_last_modified() {
        let loc = StorageLocation::new("b", "k");
        let modified: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let event: DateTime<Utc> = "2026-01-02T00:00:00Z".parse().unwrap();
        let mut m = meta(Some(PATIENT), Some("current_labs"));
        m.last_modified = Some(modified);
        let source = StaticMetadataSource::new().with(loc.clone(), m);

        let from_meta = decode(&Notification::new(loc.clone()), &source).await.unwrap();
        assert_eq!(from_meta.uploaded_at, modified);

        let note = Notification { location: loc, event_time: Some(event) };
        assert_eq!(decode(&note, &source).await.unwrap().uploaded_at, event);
    }

    #[tokio::test]
    async fn missing_or_bad_metadata_is_reported() {
        let loc = StorageLocation::new("b", "k");
        let note = Notification::new(loc.clone());

        let src = StaticMetadataSource::new().with(loc.clone(), meta(None, Some("current_labs")));
        assert!(matches!(decode(&note, &src).await, Err(MetadataError::MissingPatientId(_))));

        let src = StaticMetadataSource::new().with(loc.clone(), meta(Some("patient-7"), Some("current_labs")));
        assert!(matches!(decode(&note, &src).await, Err(MetadataError::InvalidPatientId { .. })));

        let src = StaticMetadataSource::new().with(loc.clone(), meta(Some(PATIENT), None));
        assert!(matches!(decode(&note, &src).await, Err(MetadataError::MissingDocumentType(_))));

        let src = StaticMetadataSource::new().with(loc.clone(), meta(Some(PATIENT), Some("lab results!")));
        assert!(matches!(decode(&note, &src).await, Err(MetadataError::InvalidDocumentType { .. })));

        let src = StaticMetadataSource::new();
        assert!(matches!(decode(&note, &src).await, Err(MetadataError::NotFound(_))));
    }
}
