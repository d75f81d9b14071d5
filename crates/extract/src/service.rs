use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use labstage_core::{ExtractionQuery, RawAnswer, Retryable, StorageLocation};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("extraction service throttled the request")]
    Throttled,
    #[error("extraction service timed out")]
    Timeout,
    #[error("extraction service unavailable: {0}")]
    Unavailable(String),
    /// The document itself cannot be processed (malformed, unsupported format).
    #[error("document rejected by extraction service: {0}")]
    Rejected(String),
    #[error("invalid response from extraction service: {0}")]
    InvalidResponse(String),
}

impl Retryable for ServiceError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Throttled | ServiceError::Timeout | ServiceError::Unavailable(_)
        )
    }
}

/// Abstraction over the structured-extraction service.
///
/// One call runs every query against the stored document. Queries the
/// service cannot answer are omitted from the reply, which is not an error.
pub trait ExtractionService: Send + Sync {
    fn analyze(
        &self,
        location: &StorageLocation,
        queries: &[ExtractionQuery],
    ) -> impl Future<Output = Result<Vec<RawAnswer>, ServiceError>> + Send;
}

// ── Mock service (always available, used for tests) ───────────────────────────

/// Replays scripted replies in order, repeating the fallback once the
/// script runs out, and counts every call.
pub struct MockExtractionService {
    script: Mutex<VecDeque<Result<Vec<RawAnswer>, ServiceError>>>,
    fallback: Result<Vec<RawAnswer>, ServiceError>,
    calls: AtomicUsize,
}

impl MockExtractionService {
    /// Always answers with `answers`.
    pub fn new(answers: Vec<RawAnswer>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(answers),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fails with `error`.
    pub fn failing(error: ServiceError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a reply ahead of the fallback.
    pub fn then(self, reply: Result<Vec<RawAnswer>, ServiceError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Result<Vec<RawAnswer>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

impl ExtractionService for MockExtractionService {
    async fn analyze(
        &self,
        _location: &StorageLocation,
        _queries: &[ExtractionQuery],
    ) -> Result<Vec<RawAnswer>, ServiceError> {
        self.next_reply()
    }
}
