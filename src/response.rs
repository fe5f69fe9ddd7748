use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::Result;
use crate::error::Error;
use crate::request::{Request, RequestInner};
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct ResponseMetadata {
    status: StatusCode,
    headers: HeaderMap,
    uri: Option<Uri>,
    version: Version,
}

impl ResponseMetadata {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            uri: None,
            version: Version::HTTP_11,
        }
    }

    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// Body accumulated for one exchange: streamed bytes or a finished file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    File(PathBuf),
}

impl Payload {
    /// Bytes of the payload, reading the file for [`Payload::File`].
    pub fn bytes(&self) -> std::io::Result<Bytes> {
        match self {
            Self::Data(data) => Ok(data.clone()),
            Self::File(location) => std::fs::read(location).map(Bytes::from),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::Data(_) => None,
            Self::File(location) => Some(location),
        }
    }
}

/// Result of one completed exchange, delivered once per episode.
///
/// Holds only a weak reference to the originating [`Request`].
#[derive(Clone)]
pub struct Response {
    request: Weak<RequestInner>,
    method: Method,
    uri: String,
    attempt: usize,
    metadata: Option<ResponseMetadata>,
    payload: Option<Payload>,
    error: Option<Arc<Error>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("request", &self.request().map(|request| request.id()))
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("attempt", &self.attempt)
            .field("metadata", &self.metadata)
            .field("payload", &self.payload)
            .field("error", &self.error)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        request: &Request,
        metadata: Option<ResponseMetadata>,
        payload: Option<Payload>,
        error: Option<Error>,
    ) -> Self {
        Self {
            request: request.downgrade(),
            method: request.method().clone(),
            uri: String::new(),
            attempt: request.current_retry(),
            metadata,
            payload,
            error: error.map(Arc::new),
        }
    }

    pub(crate) fn failed(request: &Request, error: Error) -> Self {
        Self::new(request, None, None, Some(error))
    }

    pub(crate) fn with_uri(mut self, uri: String) -> Self {
        self.uri = uri;
        self
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.error = Some(Arc::new(error));
    }

    /// The originating descriptor, or `None` once it has been dropped.
    pub fn request(&self) -> Option<Request> {
        Request::upgrade(&self.request)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target of the exchange with credentials redacted; empty before dispatch.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Retry counter of the descriptor when this exchange completed.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn metadata(&self) -> Option<&ResponseMetadata> {
        self.metadata.as_ref()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.metadata.as_ref().map(ResponseMetadata::status)
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.metadata.as_ref().map(ResponseMetadata::headers)
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Payload bytes; empty when nothing was received or a file payload is unreadable.
    pub fn body(&self) -> Bytes {
        self.payload
            .as_ref()
            .and_then(|payload| payload.bytes().ok())
            .unwrap_or_default()
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.body();
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_deref()
    }

    pub fn shared_error(&self) -> Option<Arc<Error>> {
        self.error.clone()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolves with the next terminal delivery of a request.
///
/// Resolves to [`Error::Cancelled`] when the episode is cancelled instead.
#[derive(Debug)]
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Response>,
}

impl ResponseFuture {
    pub(crate) fn new(receiver: oneshot::Receiver<Response>) -> Self {
        Self { receiver }
    }

    /// Blocks the current thread. Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<Response> {
        self.receiver.blocking_recv().map_err(|_| Error::Cancelled)
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::Cancelled))
    }
}
