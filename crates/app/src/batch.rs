use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use labstage_core::{
    CatalogSet, ConfidenceThresholds, FailureAnnotation, FieldCounts, RetryError, Route,
    SkipReason, StagingPayload, StagingRecord, StorageLocation,
};
use labstage_extract::{ExtractionService, QueryExecutor, ServiceError};
use labstage_storage::{StagingStore, StagingWriter, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::{decode, parse_notifications, EventError, MetadataError, Notification, ObjectMetadataSource};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("Extraction service failed: {0}")]
    Extraction(RetryError<ServiceError>),
    #[error("Staging write failed: {0}")]
    Persistence(RetryError<StoreError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Metadata,
    Extraction,
    Persistence,
}

impl DocumentError {
    pub fn stage(&self) -> FailureStage {
        match self {
            DocumentError::Metadata(_) => FailureStage::Metadata,
            DocumentError::Extraction(_) => FailureStage::Extraction,
            DocumentError::Persistence(_) => FailureStage::Persistence,
        }
    }

    /// Whether redelivering the trigger could succeed. Bad metadata will
    /// not fix itself; service and store outages may.
    pub fn is_redeliverable(&self) -> bool {
        !matches!(self, DocumentError::Metadata(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedDocument {
    pub location: StorageLocation,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureAnnotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldCounts>,
}

impl StagedDocument {
    fn from_record(record: &StagingRecord) -> Self {
        Self {
            location: record.locator.location.clone(),
            outcome: record.payload.outcome(),
            skip_reason: record.skip_reason(),
            failure: record.failure().cloned(),
            fields: record.extraction().map(|r| r.counts()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentFailure {
    pub location: StorageLocation,
    pub stage: FailureStage,
    pub error: String,
    pub redeliverable: bool,
}

/// Outcome of one batch, one entry per notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub staged: Vec<StagedDocument>,
    pub failed: Vec<DocumentFailure>,
    /// In flight when the time budget ran out, or lost to a task panic.
    pub abandoned: Vec<StorageLocation>,
}

impl BatchReport {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            staged: Vec::new(),
            failed: Vec::new(),
            abandoned: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.staged.len() + self.failed.len() + self.abandoned.len()
    }

    /// True when the trigger should be redelivered.
    pub fn needs_redelivery(&self) -> bool {
        !self.abandoned.is_empty() || self.failed.iter().any(|f| f.redeliverable)
    }

    pub fn staged(&self, location: &StorageLocation) -> Option<&StagedDocument> {
        self.staged.iter().find(|s| &s.location == location)
    }

    pub fn failure(&self, location: &StorageLocation) -> Option<&DocumentFailure> {
        self.failed.iter().find(|f| &f.location == location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Documents processed concurrently.
    pub worker_limit: usize,
    /// Wall-clock budget for the whole batch.
    pub time_budget: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            time_budget: Duration::from_secs(300),
        }
    }
}

struct Inner<M, S, W> {
    metadata: M,
    executor: QueryExecutor<S>,
    writer: StagingWriter<W>,
    catalogs: CatalogSet,
    thresholds: RwLock<ConfidenceThresholds>,
    limits: BatchLimits,
}

/// Runs notification batches through decode, route, extract, and stage.
pub struct BatchProcessor<M, S, W> {
    inner: Arc<Inner<M, S, W>>,
}

impl<M, S, W> Clone for BatchProcessor<M, S, W> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<M, S, W> BatchProcessor<M, S, W>
where
    M: ObjectMetadataSource + 'static,
    S: ExtractionService + 'static,
    W: StagingStore + 'static,
{
    pub fn new(
        metadata: M,
        executor: QueryExecutor<S>,
        writer: StagingWriter<W>,
        catalogs: CatalogSet,
        thresholds: ConfidenceThresholds,
        limits: BatchLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                metadata,
                executor,
                writer,
                catalogs,
                thresholds: RwLock::new(thresholds),
                limits,
            }),
        }
    }

    pub fn thresholds(&self) -> ConfidenceThresholds {
        *self.inner.thresholds.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes effect from the next batch; running batches keep their snapshot.
    pub fn set_thresholds(&self, thresholds: ConfidenceThresholds) {
        *self.inner.thresholds.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = thresholds;
    }

    pub fn catalogs(&self) -> &CatalogSet {
        &self.inner.catalogs
    }

    pub fn metadata_source(&self) -> &M {
        &self.inner.metadata
    }

    pub fn service(&self) -> &S {
        self.inner.executor.service()
    }

    pub fn store(&self) -> &W {
        self.inner.writer.store()
    }

    /// Parse an event envelope and process its records as one batch.
    pub async fn process_event(&self, json: &str) -> Result<BatchReport, EventError> {
        let notifications = parse_notifications(json)?;
        Ok(self.process_batch(notifications).await)
    }

    pub async fn process_batch(&self, notifications: Vec<Notification>) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", %batch_id, documents = notifications.len());
        self.run_batch(batch_id, notifications).instrument(span).await
    }

    async fn run_batch(&self, batch_id: Uuid, notifications: Vec<Notification>) -> BatchReport {
        let thresholds = self.thresholds();
        let limits = self.inner.limits;
        let deadline = deadline_after(limits.time_budget);
        let semaphore = Arc::new(Semaphore::new(limits.worker_limit.clamp(1, Semaphore::MAX_PERMITS)));

        let locations: Vec<StorageLocation> = notifications.iter().map(|n| n.location.clone()).collect();
        let mut report = BatchReport::new(batch_id);
        let mut settled = BTreeSet::new();

        let mut tasks = JoinSet::new();
        for (index, notification) in notifications.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(
                async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, inner.process_document(&notification, &thresholds).await)
                }
                .in_current_span(),
            );
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => settle(joined, &locations, &mut settled, &mut report),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        in_flight = tasks.len(),
                        budget_secs = limits.time_budget.as_secs_f64(),
                        "batch time budget exceeded, abandoning in-flight documents"
                    );
                    tasks.abort_all();
                    // Drain so nothing keeps running past the budget; a task that
                    // finished before the abort landed still counts.
                    while let Some(joined) = tasks.join_next().await {
                        settle(joined, &locations, &mut settled, &mut report);
                    }
                    break;
                }
            }
        }

        report.abandoned = locations
            .iter()
            .enumerate()
            .filter(|(index, _)| !settled.contains(index))
            .map(|(_, location)| location.clone())
            .collect();

        tracing::info!(
            staged = report.staged.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "batch complete"
        );
        report
    }
}

/// Budgets past the clock's range are treated as thirty years.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 24 * 60 * 60))
}

type Joined = Result<(usize, Result<StagedDocument, DocumentError>), tokio::task::JoinError>;

fn settle(joined: Joined, locations: &[StorageLocation], settled: &mut BTreeSet<usize>, report: &mut BatchReport) {
    match joined {
        Ok((index, Ok(staged))) => {
            settled.insert(index);
            report.staged.push(staged);
        }
        Ok((index, Err(e))) => {
            settled.insert(index);
            let location = locations[index].clone();
            tracing::warn!(
                bucket = %location.bucket,
                key = %location.key,
                stage = ?e.stage(),
                error = %e,
                "document failed"
            );
            report.failed.push(DocumentFailure {
                location,
                stage: e.stage(),
                error: e.to_string(),
                redeliverable: e.is_redeliverable(),
            });
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "document task panicked"),
    }
}

impl<M, S, W> Inner<M, S, W>
where
    M: ObjectMetadataSource,
    S: ExtractionService,
    W: StagingStore,
{
    async fn process_document(
        &self,
        notification: &Notification,
        thresholds: &ConfidenceThresholds,
    ) -> Result<StagedDocument, DocumentError> {
        let locator = decode(notification, &self.metadata).await?;
        let location = &locator.location;

        let payload = match self.catalogs.route(&locator.document_type) {
            Route::Skip(reason) => {
                tracing::info!(
                    bucket = %location.bucket,
                    key = %location.key,
                    document_type = %locator.document_type,
                    reason = %reason,
                    "skipping extraction"
                );
                StagingPayload::Skipped(reason)
            }
            Route::Extract(catalog) => match self.executor.extract(&locator, catalog, thresholds).await {
                Ok(result) => StagingPayload::Extracted(result),
                Err(RetryError::Permanent(e)) => {
                    tracing::warn!(
                        bucket = %location.bucket,
                        key = %location.key,
                        error = %e,
                        "extraction rejected, staging without values"
                    );
                    StagingPayload::Failed(FailureAnnotation::extraction_rejected(e.to_string()))
                }
                Err(e) => return Err(DocumentError::Extraction(e)),
            },
        };

        let record = StagingRecord::pending(locator, payload, Utc::now());
        self.writer.write(&record).await.map_err(DocumentError::Persistence)?;
        Ok(StagedDocument::from_record(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_budget_does_not_overflow() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now());
    }
}
