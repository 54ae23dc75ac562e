use std::time::Duration;

use thiserror::Error;

/// Source page could not be retrieved. Retried on the next scheduled run only.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch returned HTTP {0}")]
    Status(u16),
    #[error("fetch failed: {0}")]
    Network(String),
    #[error("failed to read page body: {0}")]
    Body(String),
}

impl FetchError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Failure of the external extraction capability.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction credentials are missing")]
    MissingCredentials,
    #[error("extraction request failed: {0}")]
    Request(String),
    #[error("extraction service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("extraction service returned no content")]
    EmptyResponse,
    #[error("extraction response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored json invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("restaurant {0} not found")]
    RestaurantNotFound(String),
    #[error("dish {0} not found")]
    DishNotFound(i64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("default category {0:?} is not in the canonical vocabulary")]
    UnknownDefaultCategory(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("restaurant {0} has no menu url")]
    NoMenuUrl(String),
    #[error("item timed out after {0:?}")]
    ItemTimeout(Duration),
}

impl SyncError {
    /// Summary status string for a failed item.
    pub fn status(&self) -> String {
        format!("error: {}", self)
    }
}
