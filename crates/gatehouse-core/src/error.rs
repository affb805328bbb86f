use http::StatusCode;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("circular include detected: {0}")]
    CircularInclude(String),
    #[error("maximum include depth exceeded (circular include?)")]
    MaxIncludeDepth,
    #[error("invalid pattern in location {path}: {source}")]
    InvalidRegex {
        path: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("privilege drop failed: {0}")]
    Privilege(String),
    #[error("template rendering failed: {0}")]
    Template(#[from] tera::Error),
    #[error("cgi execution failed: {0}")]
    CgiFailed(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("too many requests from {0}")]
    TooManyRequests(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_)
            | GatewayError::CircularInclude(_)
            | GatewayError::MaxIncludeDepth
            | GatewayError::InvalidRegex { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Bind { .. } | GatewayError::Privilege(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Template(_) | GatewayError::CgiFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Io(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether this error makes the process exit at startup rather than
    /// producing a per-request response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Config(_)
                | GatewayError::CircularInclude(_)
                | GatewayError::MaxIncludeDepth
                | GatewayError::InvalidRegex { .. }
                | GatewayError::Bind { .. }
                | GatewayError::Privilege(_)
        )
    }
}
