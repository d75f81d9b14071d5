pub mod catalog;
pub mod document;
pub mod field;
pub mod retry;
pub mod staging;
pub mod thresholds;

pub use catalog::{
    CatalogError, CatalogSet, ExtractionQuery, QueryCatalog, Route, SkipReason, ValueKind,
    CURRENT_LABS_QUERIES,
};
pub use document::{
    DocumentGroup, DocumentLocator, DocumentType, IdentifierError, PatientId, StorageLocation,
    KNOWN_DOCUMENT_TYPES,
};
pub use field::{
    Band, ExtractedField, ExtractionResult, FieldCounts, FieldValue, RawAnswer, Visibility,
    MAX_CONFIDENCE,
};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use staging::{FailureAnnotation, ReviewStatus, StagingPayload, StagingRecord};
pub use thresholds::{ConfidenceThresholds, ThresholdError};
