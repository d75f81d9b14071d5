use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::catalog::SkipReason;
use crate::document::DocumentLocator;
use crate::field::ExtractionResult;

/// Review lifecycle of a staging record. This pipeline only ever writes
/// `PendingReview`; later states belong to the review workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    PendingReview,
    Reviewed,
    Finalized,
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::PendingReview => write!(f, "PENDING_REVIEW"),
            ReviewStatus::Reviewed => write!(f, "REVIEWED"),
            ReviewStatus::Finalized => write!(f, "FINALIZED"),
            ReviewStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_REVIEW" => Ok(ReviewStatus::PendingReview),
            "REVIEWED" => Ok(ReviewStatus::Reviewed),
            "FINALIZED" => Ok(ReviewStatus::Finalized),
            "REJECTED" => Ok(ReviewStatus::Rejected),
            other => Err(format!("Unknown review status: '{other}'")),
        }
    }
}

/// Marker left on a record whose document the service refused to process,
/// so reviewers know to enter values by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnnotation {
    pub reason: String,
    pub detail: String,
}

impl FailureAnnotation {
    pub const EXTRACTION_REJECTED: &'static str = "extraction_rejected";

    pub fn extraction_rejected(detail: impl Into<String>) -> Self {
        Self {
            reason: Self::EXTRACTION_REJECTED.to_string(),
            detail: detail.into(),
        }
    }
}

/// What the pipeline produced for a document.
#[derive(Debug, Clone, PartialEq)]
pub enum StagingPayload {
    Extracted(ExtractionResult),
    Skipped(SkipReason),
    Failed(FailureAnnotation),
}

impl StagingPayload {
    pub fn outcome(&self) -> &'static str {
        match self {
            StagingPayload::Extracted(_) => "extracted",
            StagingPayload::Skipped(_) => "skipped",
            StagingPayload::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingRecord {
    pub locator: DocumentLocator,
    pub payload: StagingPayload,
    pub review_status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingRecord {
    /// A fresh record awaiting review. On upsert `created_at` of an existing
    /// row is preserved by the store.
    pub fn pending(locator: DocumentLocator, payload: StagingPayload, now: DateTime<Utc>) -> Self {
        Self {
            locator,
            payload,
            review_status: ReviewStatus::PendingReview,
            created_at: now,
            updated_at: now,
        }
    }

    /// The extraction result, null for skipped and failed documents.
    pub fn extraction(&self) -> Option<&ExtractionResult> {
        match &self.payload {
            StagingPayload::Extracted(r) => Some(r),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureAnnotation> {
        match &self.payload {
            StagingPayload::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match &self.payload {
            StagingPayload::Skipped(r) => Some(*r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentType, StorageLocation};

    fn locator() -> DocumentLocator {
        DocumentLocator {
            location: StorageLocation::new("uploads", "a.pdf"),
            document_type: DocumentType::current_labs(),
            patient_id: "6f1c1f3e-2a4b-4c55-9d7e-0a1b2c3d4e5f".parse().unwrap(),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn review_status_roundtrip() {
        for s in [
            ReviewStatus::PendingReview,
            ReviewStatus::Reviewed,
            ReviewStatus::Finalized,
            ReviewStatus::Rejected,
        ] {
            assert_eq!(ReviewStatus::from_str(&s.to_string()).unwrap(), s);
        }
        assert!(ReviewStatus::from_str("pending").is_err());
    }

    #[test]
    fn pending_record_starts_in_review() {
        let now = Utc::now();
        let r = StagingRecord::pending(locator(), StagingPayload::Skipped(SkipReason::Narrative), now);
        assert_eq!(r.review_status, ReviewStatus::PendingReview);
        assert_eq!(r.created_at, r.updated_at);
        assert!(r.extraction().is_none());
        assert_eq!(r.skip_reason(), Some(SkipReason::Narrative));
    }

    #[test]
    fn failed_record_has_null_extraction_and_annotation() {
        let r = StagingRecord::pending(
            locator(),
            StagingPayload::Failed(FailureAnnotation::extraction_rejected("unsupported format")),
            Utc::now(),
        );
        assert!(r.extraction().is_none());
        assert_eq!(r.failure().unwrap().reason, "extraction_rejected");
        assert_eq!(r.payload.outcome(), "failed");
    }
}
