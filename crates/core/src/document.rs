use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Where an uploaded object lives in the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub key: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), key: key.into() }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("empty value")]
    Empty,
    #[error("'{0}' is not a valid patient identifier")]
    InvalidPatientId(String),
    #[error("'{0}' is not a valid document type tag")]
    InvalidDocumentType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub Uuid);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PatientId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }
        Uuid::parse_str(s)
            .map(PatientId)
            .map_err(|_| IdentifierError::InvalidPatientId(s.to_string()))
    }
}

/// Partition of the recognized document vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentGroup {
    /// Clinical documents that may carry extractable values.
    Clinical,
    /// Narrative and operational documents that are never extracted.
    Narrative,
}

/// Known document type tags and the group each belongs to.
pub const KNOWN_DOCUMENT_TYPES: &[(&str, DocumentGroup)] = &[
    ("current_labs", DocumentGroup::Clinical),
    ("medication_list", DocumentGroup::Clinical),
    ("insurance_card", DocumentGroup::Clinical),
    ("photo_id", DocumentGroup::Clinical),
    ("discharge_summary", DocumentGroup::Clinical),
    ("social_work_summary", DocumentGroup::Narrative),
    ("dietitian_summary", DocumentGroup::Narrative),
    ("care_plan_notes", DocumentGroup::Narrative),
    ("dialysis_shift", DocumentGroup::Narrative),
];

/// A declared document type tag, normalized to lowercase.
///
/// Any well-formed tag is accepted, recognized or not; whether the
/// type is extracted is decided by the catalog router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentType(String);

impl DocumentType {
    pub const CURRENT_LABS: &'static str = "current_labs";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn group(&self) -> Option<DocumentGroup> {
        KNOWN_DOCUMENT_TYPES
            .iter()
            .find(|(tag, _)| *tag == self.0)
            .map(|(_, group)| *group)
    }

    pub fn current_labs() -> Self {
        DocumentType(Self::CURRENT_LABS.to_string())
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentType {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();
        if tag.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if tag.len() > 64
            || !tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(IdentifierError::InvalidDocumentType(s.trim().to_string()));
        }
        Ok(DocumentType(tag.replace('-', "_")))
    }
}

impl TryFrom<String> for DocumentType {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentType> for String {
    fn from(value: DocumentType) -> Self {
        value.0
    }
}

/// Immutable reference to an uploaded document and its declared metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLocator {
    pub location: StorageLocation,
    pub document_type: DocumentType,
    pub patient_id: PatientId,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_normalizes_case_and_dashes() {
        let t: DocumentType = "  Current-Labs ".parse().unwrap();
        assert_eq!(t.as_str(), "current_labs");
        assert_eq!(t.group(), Some(DocumentGroup::Clinical));
    }

    #[test]
    fn document_type_rejects_garbage() {
        assert_eq!("".parse::<DocumentType>(), Err(IdentifierError::Empty));
        assert!(matches!(
            "labs; drop table".parse::<DocumentType>(),
            Err(IdentifierError::InvalidDocumentType(_))
        ));
    }

    #[test]
    fn unknown_tag_has_no_group() {
        let t: DocumentType = "vaccination_record".parse().unwrap();
        assert_eq!(t.group(), None);
    }

    #[test]
    fn narrative_group_lookup() {
        let t: DocumentType = "dialysis_shift".parse().unwrap();
        assert_eq!(t.group(), Some(DocumentGroup::Narrative));
    }

    #[test]
    fn patient_id_requires_uuid() {
        let id: PatientId = "6f1c1f3e-2a4b-4c55-9d7e-0a1b2c3d4e5f".parse().unwrap();
        assert_eq!(id.to_string(), "6f1c1f3e-2a4b-4c55-9d7e-0a1b2c3d4e5f");
        assert_eq!("  ".parse::<PatientId>(), Err(IdentifierError::Empty));
        assert!(matches!(
            "patient-42".parse::<PatientId>(),
            Err(IdentifierError::InvalidPatientId(_))
        ));
    }

    #[test]
    fn storage_location_display() {
        let loc = StorageLocation::new("uploads", "p/labs.pdf");
        assert_eq!(loc.to_string(), "uploads/p/labs.pdf");
    }

    #[test]
    fn document_type_serde_validates() {
        let ok: DocumentType = serde_json::from_str("\"care_plan_notes\"").unwrap();
        assert_eq!(ok.as_str(), "care_plan_notes");
        assert!(serde_json::from_str::<DocumentType>("\"bad tag!\"").is_err());
    }
}
