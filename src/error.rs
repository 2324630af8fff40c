use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum SharaqError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("specified url not allowed")]
    NotAllowed,

    #[error("invalid or missing admin token")]
    NotAuthorized,

    /// Internal signal: the derivative does not exist yet. Never surfaced
    /// to the client; the dispatcher answers it with a deferred transform
    /// and a 302 to the origin.
    #[error("transformation required")]
    TransformationRequired,

    #[error("url is being processed")]
    Contention,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SharaqError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SharaqError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SharaqError::NotAllowed => StatusCode::FORBIDDEN,
            SharaqError::NotAuthorized => StatusCode::FORBIDDEN,
            SharaqError::TransformationRequired => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Contention => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SharaqError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SharaqError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

impl From<redis::RedisError> for SharaqError {
    fn from(e: redis::RedisError) -> Self {
        SharaqError::Cache(e.to_string())
    }
}

impl From<memcache::MemcacheError> for SharaqError {
    fn from(e: memcache::MemcacheError) -> Self {
        SharaqError::Cache(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SharaqError>;
