use labstage_core::{RetryError, RetryPolicy, StagingRecord};

use crate::db::StoreError;
use crate::store::StagingStore;

/// Writes staging records through a [`StagingStore`], retrying transient
/// failures under its own policy.
pub struct StagingWriter<W> {
    store: W,
    policy: RetryPolicy,
}

impl<W: StagingStore> StagingWriter<W> {
    pub fn new(store: W, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    pub async fn write(&self, record: &StagingRecord) -> Result<(), RetryError<StoreError>> {
        let store = &self.store;
        let location = &record.locator.location;
        self.policy
            .run("staging_store", move |attempt| {
                tracing::debug!(
                    bucket = %location.bucket,
                    key = %location.key,
                    outcome = record.payload.outcome(),
                    attempt,
                    "writing staging record"
                );
                store.upsert(record)
            })
            .await?;
        tracing::info!(
            bucket = %location.bucket,
            key = %location.key,
            outcome = record.payload.outcome(),
            "document staged for review"
        );
        Ok(())
    }
}
