pub mod db;
pub mod store;
pub mod writer;

pub use db::{
    count_staging_records, create_db, get_pending_staging_records, get_staging_record,
    update_review_status, upsert_staging_record, DbPool, StoreError,
};
pub use store::{SqliteStagingStore, StagingStore};
pub use writer::StagingWriter;
