pub mod classify;
pub mod executor;
pub mod http;
pub mod normalize;
pub mod service;

pub use classify::{band_for, classify, classify_answers};
pub use executor::QueryExecutor;
pub use http::HttpExtractionService;
pub use normalize::{normalize, parse_date, parse_numeric};
pub use service::{ExtractionService, MockExtractionService, ServiceError};
