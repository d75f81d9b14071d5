use labstage_core::{
    ConfidenceThresholds, DocumentLocator, ExtractionResult, QueryCatalog, RawAnswer, RetryError,
    RetryPolicy,
};

use crate::classify::classify_answers;
use crate::service::{ExtractionService, ServiceError};

/// Runs a document's query catalog against the extraction service with
/// bounded retries on transient failures.
pub struct QueryExecutor<S> {
    service: S,
    policy: RetryPolicy,
}

impl<S: ExtractionService> QueryExecutor<S> {
    pub fn new(service: S, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// All catalog queries in one request. A permanent error or exhausted
    /// retries fail the whole document.
    pub async fn execute(
        &self,
        locator: &DocumentLocator,
        catalog: &QueryCatalog,
    ) -> Result<Vec<RawAnswer>, RetryError<ServiceError>> {
        let service = &self.service;
        let location = &locator.location;
        let queries = catalog.queries();
        let answers = self
            .policy
            .run("extraction_service", move |attempt| {
                tracing::debug!(
                    bucket = %location.bucket,
                    key = %location.key,
                    queries = queries.len(),
                    attempt,
                    "querying extraction service"
                );
                service.analyze(location, queries)
            })
            .await?;
        tracing::debug!(
            bucket = %location.bucket,
            key = %location.key,
            answered = answers.len(),
            "extraction service answered"
        );
        Ok(answers)
    }

    /// Execute, normalize, and classify against one threshold snapshot.
    pub async fn extract(
        &self,
        locator: &DocumentLocator,
        catalog: &QueryCatalog,
        thresholds: &ConfidenceThresholds,
    ) -> Result<ExtractionResult, RetryError<ServiceError>> {
        let answers = self.execute(locator, catalog).await?;
        Ok(classify_answers(catalog, &answers, thresholds))
    }
}
