use std::sync::Arc;

use http::Method;
use thiserror::Error;

use crate::request::RequestId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Cancelled,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) for one exchange.
#[derive(Debug, Error)]
#[error("{kind} transport error: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message.into())
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

/// Reasons a [`Request`](crate::Request) cannot become a wire request.
///
/// Cloneable because the same descriptor is re-prepared on every attempt.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to encode request query: {source}")]
    EncodeQuery {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to encode {content_type} request body: {source}")]
    EncodeBody {
        content_type: &'static str,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to build http request: {message}")]
    Http { message: String },
}

impl BuildError {
    pub(crate) fn encode_body(content_type: &'static str, source: impl Into<BoxError>) -> Self {
        Self::EncodeBody {
            content_type,
            source: Arc::from(source.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("request {request} cannot depend on itself")]
    SelfDependency { request: RequestId },
    #[error("dependency link would close a cycle through request {request}")]
    Cycle { request: RequestId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    FailedBuildingRequest,
    Transport,
    Timeout,
    HttpStatus,
    InvalidResponse,
    MaxRetryAttemptsReached,
    Cancelled,
    Deserialize,
}

impl ErrorCode {
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::FailedBuildingRequest,
            Self::Transport,
            Self::Timeout,
            Self::HttpStatus,
            Self::InvalidResponse,
            Self::MaxRetryAttemptsReached,
            Self::Cancelled,
            Self::Deserialize,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailedBuildingRequest => "failed_building_request",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::InvalidResponse => "invalid_response",
            Self::MaxRetryAttemptsReached => "max_retry_attempts_reached",
            Self::Cancelled => "cancelled",
            Self::Deserialize => "deserialize",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed building request {method} {uri}: {source}")]
    FailedBuildingRequest {
        method: Method,
        uri: String,
        #[source]
        source: BuildError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("invalid response for {method} {uri}: {source}")]
    InvalidResponse {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("max retry attempts reached ({attempts}) for {method} {uri}")]
    MaxRetryAttemptsReached {
        attempts: usize,
        method: Method,
        uri: String,
    },
    #[error("request was cancelled before a response was delivered")]
    Cancelled,
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::FailedBuildingRequest { .. } => ErrorCode::FailedBuildingRequest,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::InvalidResponse { .. } => ErrorCode::InvalidResponse,
            Self::MaxRetryAttemptsReached { .. } => ErrorCode::MaxRetryAttemptsReached,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            Self::Timeout { .. } => Some(TransportErrorKind::Timeout),
            _ => None,
        }
    }

    pub(crate) fn from_transport(
        error: TransportError,
        method: &Method,
        uri: &str,
        timeout_ms: u128,
    ) -> Self {
        match error.kind() {
            TransportErrorKind::Timeout => Self::Timeout {
                timeout_ms,
                method: method.clone(),
                uri: uri.to_owned(),
            },
            kind => Self::Transport {
                kind,
                method: method.clone(),
                uri: uri.to_owned(),
                source: error.into_source(),
            },
        }
    }
}
