use chrono::{DateTime, SecondsFormat, Utc};
use labstage_core::{
    DocumentLocator, DocumentType, ExtractionResult, FailureAnnotation, PatientId, ReviewStatus,
    SkipReason, StagingPayload, StagingRecord, StorageLocation,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to encode staging payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Corrupt staging row for {location}: {detail}")]
    Corrupt { location: String, detail: String },
}

pub async fn create_db(path: &Path, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("cache_size", "-32000");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_staging (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bucket TEXT NOT NULL,
            object_key TEXT NOT NULL,
            patient_id TEXT NOT NULL,
            document_type TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            extraction_result TEXT,
            skip_reason TEXT,
            failure TEXT,
            review_status TEXT NOT NULL DEFAULT 'PENDING_REVIEW',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (bucket, object_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_staging_review ON document_staging (review_status, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Insert or replace the record for the document's storage location.
///
/// A replaced row keeps its original `created_at`; everything else,
/// including the review status, is overwritten.
pub async fn upsert_staging_record(pool: &DbPool, record: &StagingRecord) -> Result<(), StoreError> {
    let (extraction_result, skip_reason, failure) = match &record.payload {
        StagingPayload::Extracted(r) => {
            (Some(serde_json::to_string(r).map_err(StoreError::Encode)?), None, None)
        }
        StagingPayload::Skipped(reason) => (None, Some(reason.to_string()), None),
        StagingPayload::Failed(f) => {
            (None, None, Some(serde_json::to_string(f).map_err(StoreError::Encode)?))
        }
    };
    let locator = &record.locator;

    sqlx::query(
        r#"
        INSERT INTO document_staging (
            bucket, object_key, patient_id, document_type, uploaded_at, outcome,
            extraction_result, skip_reason, failure, review_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (bucket, object_key) DO UPDATE SET
            patient_id = excluded.patient_id,
            document_type = excluded.document_type,
            uploaded_at = excluded.uploaded_at,
            outcome = excluded.outcome,
            extraction_result = excluded.extraction_result,
            skip_reason = excluded.skip_reason,
            failure = excluded.failure,
            review_status = excluded.review_status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&locator.location.bucket)
    .bind(&locator.location.key)
    .bind(locator.patient_id.to_string())
    .bind(locator.document_type.as_str())
    .bind(ts(&locator.uploaded_at))
    .bind(record.payload.outcome())
    .bind(extraction_result)
    .bind(skip_reason)
    .bind(failure)
    .bind(record.review_status.to_string())
    .bind(ts(&record.created_at))
    .bind(ts(&record.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

type StagingRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
);

const SELECT_STAGING: &str = "SELECT bucket, object_key, patient_id, document_type, uploaded_at, outcome, \
     extraction_result, skip_reason, failure, review_status, created_at, updated_at \
     FROM document_staging";

pub async fn get_staging_record(
    pool: &DbPool,
    location: &StorageLocation,
) -> Result<Option<StagingRecord>, StoreError> {
    let row = sqlx::query_as::<_, StagingRow>(&format!(
        "{SELECT_STAGING} WHERE bucket = ? AND object_key = ?"
    ))
    .bind(&location.bucket)
    .bind(&location.key)
    .fetch_optional(pool)
    .await?;

    row.map(decode_row).transpose()
}

/// Oldest first.
pub async fn get_pending_staging_records(pool: &DbPool, limit: i64) -> Result<Vec<StagingRecord>, StoreError> {
    let rows = sqlx::query_as::<_, StagingRow>(&format!(
        "{SELECT_STAGING} WHERE review_status = ? ORDER BY created_at, id LIMIT ?"
    ))
    .bind(ReviewStatus::PendingReview.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(decode_row).collect()
}

pub async fn count_staging_records(pool: &DbPool) -> Result<i64, StoreError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM document_staging")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Used by the review workflow; the pipeline itself never calls this.
pub async fn update_review_status(
    pool: &DbPool,
    location: &StorageLocation,
    status: ReviewStatus,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE document_staging SET review_status = ?, updated_at = ? WHERE bucket = ? AND object_key = ?",
    )
    .bind(status.to_string())
    .bind(ts(&Utc::now()))
    .bind(&location.bucket)
    .bind(&location.key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn decode_row(r: StagingRow) -> Result<StagingRecord, StoreError> {
    let location = StorageLocation::new(r.0, r.1);
    let corrupt = |detail: String| StoreError::Corrupt {
        location: location.to_string(),
        detail,
    };

    let patient_id = r.2.parse::<PatientId>().map_err(|e| corrupt(format!("patient_id: {e}")))?;
    let document_type = r.3.parse::<DocumentType>().map_err(|e| corrupt(format!("document_type: {e}")))?;
    let uploaded_at = parse_ts(&r.4).map_err(|e| corrupt(format!("uploaded_at: {e}")))?;

    let payload = match (r.5.as_str(), r.6, r.7, r.8) {
        ("extracted", Some(json), _, _) => StagingPayload::Extracted(
            serde_json::from_str::<ExtractionResult>(&json)
                .map_err(|e| corrupt(format!("extraction_result: {e}")))?,
        ),
        ("skipped", _, Some(reason), _) => {
            StagingPayload::Skipped(reason.parse::<SkipReason>().map_err(corrupt)?)
        }
        ("failed", _, _, Some(json)) => StagingPayload::Failed(
            serde_json::from_str::<FailureAnnotation>(&json)
                .map_err(|e| corrupt(format!("failure: {e}")))?,
        ),
        (outcome, ..) => return Err(corrupt(format!("inconsistent outcome '{outcome}'"))),
    };

    let review_status = r.9.parse::<ReviewStatus>().map_err(corrupt)?;
    let created_at = parse_ts(&r.10).map_err(|e| corrupt(format!("created_at: {e}")))?;
    let updated_at = parse_ts(&r.11).map_err(|e| corrupt(format!("updated_at: {e}")))?;

    Ok(StagingRecord {
        locator: DocumentLocator {
            location: location.clone(),
            document_type,
            patient_id,
            uploaded_at,
        },
        payload,
        review_status,
        created_at,
        updated_at,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use labstage_core::{Band, ExtractedField, FieldValue};

    async fn test_pool() -> (DbPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("staging.db"), 2).await.unwrap();
        (pool, dir)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn locator(key: &str) -> DocumentLocator {
        DocumentLocator {
            location: StorageLocation::new("patient-uploads", key),
            document_type: DocumentType::current_labs(),
            patient_id: "6f1c1f3e-2a4b-4c55-9d7e-0a1b2c3d4e5f".parse().unwrap(),
            uploaded_at: at(0),
        }
    }

    fn extracted() -> StagingPayload {
        let mut r = ExtractionResult::new();
        r.insert(ExtractedField {
            metric: "potassium".into(),
            raw_text: "4.5 mEq/L".into(),
            confidence: 92.5,
            band: Band::Normal(FieldValue::Number("4.5".parse().unwrap())),
        });
        r.insert_missing("bun");
        StagingPayload::Extracted(r)
    }

    #[tokio::test]
    async fn upsert_and_read_back() {
        let (pool, _dir) = test_pool().await;
        let record = StagingRecord::pending(locator("a.pdf"), extracted(), at(10));
        upsert_staging_record(&pool, &record).await.unwrap();

        let back = get_staging_record(&pool, &record.locator.location).await.unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let (pool, _dir) = test_pool().await;
        let loc = StorageLocation::new("patient-uploads", "nope.pdf");
        assert!(get_staging_record(&pool, &loc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reprocessing_keeps_one_row_and_resets_review() {
        let (pool, _dir) = test_pool().await;
        let first = StagingRecord::pending(locator("a.pdf"), extracted(), at(10));
        upsert_staging_record(&pool, &first).await.unwrap();

        let loc = first.locator.location.clone();
        assert!(update_review_status(&pool, &loc, ReviewStatus::Reviewed).await.unwrap());

        let second = StagingRecord::pending(
            locator("a.pdf"),
            StagingPayload::Failed(FailureAnnotation::extraction_rejected("unsupported format")),
            at(20),
        );
        upsert_staging_record(&pool, &second).await.unwrap();

        assert_eq!(count_staging_records(&pool).await.unwrap(), 1);
        let back = get_staging_record(&pool, &loc).await.unwrap().unwrap();
        assert_eq!(back.review_status, ReviewStatus::PendingReview);
        assert_eq!(back.created_at, at(10));
        assert_eq!(back.updated_at, at(20));
        assert!(back.extraction().is_none());
        assert_eq!(back.failure().unwrap().detail, "unsupported format");
    }

    #[tokio::test]
    async fn skipped_payload_roundtrip() {
        let (pool, _dir) = test_pool().await;
        let mut loc = locator("notes.pdf");
        loc.document_type = "social_work_summary".parse().unwrap();
        let record = StagingRecord::pending(loc, StagingPayload::Skipped(SkipReason::Narrative), at(5));
        upsert_staging_record(&pool, &record).await.unwrap();

        let back = get_staging_record(&pool, &record.locator.location).await.unwrap().unwrap();
        assert_eq!(back.skip_reason(), Some(SkipReason::Narrative));
        assert!(back.extraction().is_none());
    }

    #[tokio::test]
    async fn pending_list_excludes_reviewed() {
        let (pool, _dir) = test_pool().await;
        for (i, key) in ["a.pdf", "b.pdf", "c.pdf"].iter().enumerate() {
            let r = StagingRecord::pending(locator(key), extracted(), at(i as i64));
            upsert_staging_record(&pool, &r).await.unwrap();
        }
        let b = StorageLocation::new("patient-uploads", "b.pdf");
        update_review_status(&pool, &b, ReviewStatus::Finalized).await.unwrap();

        let pending = get_pending_staging_records(&pool, 10).await.unwrap();
        let keys: Vec<_> = pending.iter().map(|r| r.locator.location.key.as_str()).collect();
        assert_eq!(keys, vec!["a.pdf", "c.pdf"]);
    }

    #[tokio::test]
    async fn stored_extraction_json_has_review_shape() {
        let (pool, _dir) = test_pool().await;
        let record = StagingRecord::pending(locator("a.pdf"), extracted(), at(1));
        upsert_staging_record(&pool, &record).await.unwrap();

        let (json,): (String,) = sqlx::query_as("SELECT extraction_result FROM document_staging")
            .fetch_one(&pool)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["potassium"]["value"], 4.5);
        assert_eq!(v["potassium"]["rawText"], "4.5 mEq/L");
        assert!(v["bun"].is_null());
    }
}
