pub mod batch;
pub mod event;
pub mod object_store;
pub mod settings;
pub mod watch;

pub use batch::{BatchLimits, BatchProcessor, BatchReport, DocumentError, DocumentFailure, FailureStage, StagedDocument};
pub use event::{
    decode, parse_notifications, EventError, MetadataError, Notification, ObjectMetadata,
    ObjectMetadataSource,
};
pub use object_store::{LocalObjectStore, StaticMetadataSource};
pub use settings::{ConfigError, Settings};
pub use watch::{collect_batch, notifications_for, spawn_intake_watcher};
