use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::error::BuildError;
use crate::response::{Response, ResponseFuture};
use crate::transport::OperationHandle;
use crate::util::{
    append_query_pairs, join_base_path, lock_unpoisoned, merge_headers, parse_header_name,
    parse_header_value, redact_uri_for_logs, resolve_uri,
};

pub(crate) const DEFAULT_MAX_RETRIES: usize = 0;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "req-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    UseProtocolCachePolicy,
    ReloadIgnoringLocalCacheData,
    ReturnCacheDataElseLoad,
    ReturnCacheDataDontLoad,
}

/// Produces a request body at prepare time, once per attempt.
pub trait BodyEncoder: Send + Sync {
    fn content_type(&self) -> Option<&'static str> {
        None
    }

    fn encode(&self) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes {
        content: Bytes,
        content_type: Option<HeaderValue>,
    },
    Encoder(Arc<dyn BodyEncoder>),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes {
                content,
                content_type,
            } => formatter
                .debug_struct("Bytes")
                .field("len", &content.len())
                .field("content_type", content_type)
                .finish(),
            Self::Encoder(_) => formatter.write_str("Encoder(..)"),
        }
    }
}

impl Body {
    fn encode(&self) -> Result<(Bytes, Option<HeaderValue>), BuildError> {
        match self {
            Self::Empty => Ok((Bytes::new(), None)),
            Self::Bytes {
                content,
                content_type,
            } => Ok((content.clone(), content_type.clone())),
            Self::Encoder(encoder) => {
                let content_type = encoder.content_type();
                let content = encoder.encode().map_err(|source| {
                    BuildError::encode_body(content_type.unwrap_or("custom"), source)
                })?;
                Ok((content, content_type.map(HeaderValue::from_static)))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Building,
    Queued,
    Dispatched,
    Completing,
    Retrying,
    Chaining,
    Delivered,
    Cancelled,
}

pub(crate) enum Listener {
    Callback(Box<dyn FnOnce(Response) + Send>),
    Channel(oneshot::Sender<Response>),
}

impl Listener {
    pub(crate) fn channel() -> (Self, ResponseFuture) {
        let (sender, receiver) = oneshot::channel();
        (Self::Channel(sender), ResponseFuture::new(receiver))
    }

    pub(crate) fn fire(self, response: Response) {
        match self {
            Self::Callback(callback) => callback(response),
            Self::Channel(sender) => {
                let _ = sender.send(response);
            }
        }
    }
}

struct RequestState {
    phase: RequestPhase,
    handle: Option<OperationHandle>,
    listeners: Vec<Listener>,
    last_delivery: Option<Response>,
}

pub(crate) struct RequestInner {
    id: RequestId,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    raw_headers: Vec<(String, String)>,
    body: Body,
    deferred_error: Option<BuildError>,
    timeout: Option<Duration>,
    cache_policy: Option<CachePolicy>,
    max_retries: usize,
    current_retry: AtomicUsize,
    state: Mutex<RequestState>,
}

/// Description of one logical HTTP call.
///
/// Cloning shares the descriptor; identity is the shared allocation.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Request")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .field("current_retry", &self.current_retry())
            .field("max_retries", &self.inner.max_retries)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Request {
    pub fn builder(method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path.into())
    }

    pub fn get(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::DELETE, path)
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn body(&self) -> &Body {
        &self.inner.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.inner.cache_policy
    }

    pub fn max_retries(&self) -> usize {
        self.inner.max_retries
    }

    pub fn current_retry(&self) -> usize {
        self.inner.current_retry.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> RequestPhase {
        lock_unpoisoned(&self.inner.state).phase
    }

    pub fn operation_handle(&self) -> Option<OperationHandle> {
        lock_unpoisoned(&self.inner.state).handle
    }

    pub fn is_in_flight(&self) -> bool {
        !matches!(
            self.phase(),
            RequestPhase::Idle | RequestPhase::Delivered | RequestPhase::Cancelled
        )
    }

    pub fn same_as(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a callback for the next terminal delivery.
    ///
    /// Once the episode has been delivered the callback runs immediately with that
    /// response; after a cancel it is dropped.
    pub fn on_response<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.attach_listener(Listener::Callback(Box::new(callback)));
        self
    }

    /// Future resolving with the next terminal delivery, or the last one once delivered.
    ///
    /// Resolves to [`crate::Error::Cancelled`] when the episode was cancelled.
    pub fn response(&self) -> ResponseFuture {
        let (listener, future) = Listener::channel();
        self.attach_listener(listener);
        future
    }

    pub(crate) fn push_listener(&self, listener: Listener) {
        lock_unpoisoned(&self.inner.state).listeners.push(listener);
    }

    fn attach_listener(&self, listener: Listener) {
        let delivered = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match state.phase {
                RequestPhase::Delivered => state.last_delivery.clone(),
                RequestPhase::Cancelled => return,
                _ => {
                    state.listeners.push(listener);
                    return;
                }
            }
        };
        if let Some(response) = delivered {
            listener.fire(response);
        }
    }

    /// Attaches `listener` to the pending delivery; hands it back when no episode is running.
    pub(crate) fn push_listener_if_in_flight(&self, listener: Listener) -> Option<Listener> {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.phase {
            RequestPhase::Idle | RequestPhase::Delivered | RequestPhase::Cancelled => {
                Some(listener)
            }
            _ => {
                state.listeners.push(listener);
                None
            }
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RequestInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RequestInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Target uri as it would appear in logs, without resolving errors.
    pub(crate) fn redacted_target(&self, config: &ClientConfig) -> String {
        let path = append_query_pairs(&self.inner.path, &self.inner.query_pairs);
        redact_uri_for_logs(&join_base_path(config.base_url(), &path))
    }

    pub(crate) fn effective_timeout(&self, config: &ClientConfig) -> Duration {
        self.inner.timeout.unwrap_or(config.request_timeout())
    }

    /// Resolves the descriptor against `config` for one attempt.
    pub fn prepare(&self, config: &ClientConfig) -> Result<PreparedRequest, BuildError> {
        let inner = &self.inner;
        if let Some(error) = &inner.deferred_error {
            return Err(error.clone());
        }

        let path = append_query_pairs(&inner.path, &inner.query_pairs);
        let (uri_text, uri) = resolve_uri(config.base_url(), &path)?;
        let mut headers = merge_headers(config.default_headers(), &inner.headers);
        for (name, value) in &inner.raw_headers {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.insert(header_name, header_value);
        }

        let (content, content_type) = inner.body.encode()?;
        if let Some(content_type) = content_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, content_type);
        }

        let mut builder = http::Request::builder()
            .method(inner.method.clone())
            .uri(uri);
        if let Some(builder_headers) = builder.headers_mut() {
            *builder_headers = headers;
        }
        let request = builder.body(content).map_err(|source| BuildError::Http {
            message: source.to_string(),
        })?;

        Ok(PreparedRequest {
            request,
            timeout: self.effective_timeout(config),
            cache_policy: inner.cache_policy.unwrap_or(config.cache_policy()),
            redacted_uri: redact_uri_for_logs(&uri_text),
        })
    }

    pub(crate) fn increment_retry(&self) -> usize {
        self.inner.current_retry.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Starts a new episode; refused while one is in flight.
    pub(crate) fn begin_episode(&self) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.phase {
            RequestPhase::Idle | RequestPhase::Delivered | RequestPhase::Cancelled => {
                state.phase = RequestPhase::Building;
                state.handle = None;
                state.last_delivery = None;
                self.inner.current_retry.store(0, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Re-enters `Building` after a retry or a finished chain, keeping the counter.
    pub(crate) fn enter_building(&self) -> bool {
        self.transition(
            &[
                RequestPhase::Building,
                RequestPhase::Retrying,
                RequestPhase::Chaining,
            ],
            RequestPhase::Building,
        )
    }

    pub(crate) fn mark_queued(&self, handle: OperationHandle) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.phase != RequestPhase::Building {
            return false;
        }
        state.phase = RequestPhase::Queued;
        state.handle = Some(handle);
        true
    }

    pub(crate) fn mark_dispatched(&self, handle: OperationHandle) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        let allowed = match state.phase {
            RequestPhase::Building => true,
            RequestPhase::Queued => state.handle == Some(handle),
            _ => false,
        };
        if allowed {
            state.phase = RequestPhase::Dispatched;
            state.handle = Some(handle);
        }
        allowed
    }

    /// Claims the completion of `handle`; false for stale or cancelled exchanges.
    pub(crate) fn begin_completing(&self, handle: OperationHandle) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.phase != RequestPhase::Dispatched || state.handle != Some(handle) {
            return false;
        }
        state.phase = RequestPhase::Completing;
        state.handle = None;
        true
    }

    pub(crate) fn mark_retrying(&self) -> bool {
        self.transition(&[RequestPhase::Completing], RequestPhase::Retrying)
    }

    pub(crate) fn mark_chaining(&self) -> bool {
        self.transition(&[RequestPhase::Completing], RequestPhase::Chaining)
    }

    /// Moves to `Delivered`, keeps `response` for late listeners and hands back the
    /// listeners to fire.
    ///
    /// `None` when the episode already ended (delivered or cancelled).
    pub(crate) fn take_for_delivery(&self, response: &Response) -> Option<Vec<Listener>> {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.phase {
            RequestPhase::Idle | RequestPhase::Delivered | RequestPhase::Cancelled => None,
            _ => {
                state.phase = RequestPhase::Delivered;
                state.handle = None;
                state.last_delivery = Some(response.clone());
                Some(std::mem::take(&mut state.listeners))
            }
        }
    }

    /// Ends the episode without delivery. Returns the handle that was bound, if any;
    /// `None` when there was nothing to cancel.
    pub(crate) fn cancel(&self) -> Option<Option<OperationHandle>> {
        let (handle, listeners) = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match state.phase {
                RequestPhase::Idle | RequestPhase::Delivered | RequestPhase::Cancelled => {
                    return None;
                }
                _ => {
                    state.phase = RequestPhase::Cancelled;
                    (state.handle.take(), std::mem::take(&mut state.listeners))
                }
            }
        };
        drop(listeners);
        Some(handle)
    }

    fn transition(&self, from: &[RequestPhase], to: RequestPhase) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        if !from.contains(&state.phase) {
            return false;
        }
        state.phase = to;
        true
    }
}

/// A request resolved against the client configuration, ready for a transport.
#[derive(Debug)]
pub struct PreparedRequest {
    request: http::Request<Bytes>,
    timeout: Duration,
    cache_policy: CachePolicy,
    redacted_uri: String,
}

impl PreparedRequest {
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    pub fn body(&self) -> &Bytes {
        self.request.body()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Uri with credentials and query removed.
    pub fn redacted_uri(&self) -> &str {
        &self.redacted_uri
    }

    pub fn as_http(&self) -> &http::Request<Bytes> {
        &self.request
    }

    pub fn into_http(self) -> http::Request<Bytes> {
        self.request
    }
}

#[must_use]
pub struct RequestBuilder {
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    raw_headers: Vec<(String, String)>,
    body: Body,
    deferred_error: Option<BuildError>,
    timeout: Option<Duration>,
    cache_policy: Option<CachePolicy>,
    max_retries: usize,
}

impl RequestBuilder {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            raw_headers: Vec::new(),
            body: Body::Empty,
            deferred_error: None,
            timeout: None,
            cache_policy: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Header validated when the request is prepared; invalid input fails the build.
    pub fn try_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.raw_headers.push((name.into(), value.into()));
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match serde_urlencoded::to_string(params) {
            Ok(encoded) => self.query_pairs.extend(
                url::form_urlencoded::parse(encoded.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned())),
            ),
            Err(source) => self.defer_error(BuildError::EncodeQuery {
                source: Arc::new(source),
            }),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes {
            content: body.into(),
            content_type: None,
        };
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Bytes {
            content: Bytes::from(text.into()),
            content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
        };
        self
    }

    pub fn json<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_vec(payload) {
            Ok(content) => {
                self.body = Body::Bytes {
                    content: Bytes::from(content),
                    content_type: Some(HeaderValue::from_static("application/json")),
                };
            }
            Err(source) => self.defer_error(BuildError::encode_body("application/json", source)),
        }
        self
    }

    pub fn form<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match serde_urlencoded::to_string(payload) {
            Ok(encoded) => {
                self.body = Body::Bytes {
                    content: Bytes::from(encoded),
                    content_type: Some(HeaderValue::from_static(
                        "application/x-www-form-urlencoded",
                    )),
                };
            }
            Err(source) => self.defer_error(BuildError::encode_body(
                "application/x-www-form-urlencoded",
                source,
            )),
        }
        self
    }

    pub fn encoder(mut self, encoder: impl BodyEncoder + 'static) -> Self {
        self.body = Body::Encoder(Arc::new(encoder));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = Some(cache_policy);
        self
    }

    /// Exchange budget for `RetryIfPossible` outcomes; `0` and `1` both mean a single attempt.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Request {
        Request {
            inner: Arc::new(RequestInner {
                id: RequestId::next(),
                method: self.method,
                path: self.path,
                query_pairs: self.query_pairs,
                headers: self.headers,
                raw_headers: self.raw_headers,
                body: self.body,
                deferred_error: self.deferred_error,
                timeout: self.timeout,
                cache_policy: self.cache_policy,
                max_retries: self.max_retries,
                current_retry: AtomicUsize::new(0),
                state: Mutex::new(RequestState {
                    phase: RequestPhase::Idle,
                    handle: None,
                    listeners: Vec::new(),
                    last_delivery: None,
                }),
            }),
        }
    }

    fn defer_error(&mut self, error: BuildError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(error);
        }
    }
}

impl From<RequestBuilder> for Request {
    fn from(builder: RequestBuilder) -> Self {
        builder.build()
    }
}
