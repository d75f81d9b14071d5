use std::future::Future;

use labstage_core::{Retryable, StagingRecord};

use crate::db::{upsert_staging_record, DbPool, StoreError};

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            // Any database-reported failure, constraint violations included,
            // is retried; only row-shape errors are permanent.
            StoreError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            StoreError::Encode(_) | StoreError::Corrupt { .. } => false,
        }
    }
}

/// Persistence boundary for staging records. One call is one atomic upsert.
pub trait StagingStore: Send + Sync {
    fn upsert(&self, record: &StagingRecord) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SqliteStagingStore {
    pool: DbPool,
}

impl SqliteStagingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl StagingStore for SqliteStagingStore {
    async fn upsert(&self, record: &StagingRecord) -> Result<(), StoreError> {
        upsert_staging_record(&self.pool, record).await
    }
}
