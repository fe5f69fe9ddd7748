//! In-process [`Transport`] that answers from scripted responses.
//!
//! Each exchange runs on its own thread so completions arrive concurrently with
//! the caller, the same way a network transport reports them.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use crate::error::{TransportError, TransportErrorKind};
use crate::request::{CachePolicy, PreparedRequest};
use crate::response::ResponseMetadata;
use crate::transport::{OperationHandle, Transport, TransportEvents};
use crate::util::lock_unpoisoned;

type Predicate = Arc<dyn Fn(&PreparedRequest) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct StubMatcher {
    method: Option<Method>,
    path: Option<String>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<Bytes>,
    predicate: Option<Predicate>,
}

impl std::fmt::Debug for StubMatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StubMatcher")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl StubMatcher {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::any().method(Method::GET).path(path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::any().method(Method::POST).path(path)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Exact match on the uri path, without query.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PreparedRequest) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, request: &PreparedRequest) -> bool {
        self.method
            .as_ref()
            .is_none_or(|method| method == request.method())
            && self
                .path
                .as_deref()
                .is_none_or(|path| path == request.uri().path())
            && self
                .headers
                .iter()
                .all(|(name, value)| request.headers().get(name) == Some(value))
            && self
                .body
                .as_ref()
                .is_none_or(|body| body == request.body())
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(request))
    }
}

#[derive(Clone, Debug)]
pub struct StubResponse {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    file: Option<PathBuf>,
    error: Option<(TransportErrorKind, String)>,
    delay: Duration,
}

impl StubResponse {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            file: None,
            error: None,
            delay: Duration::ZERO,
        }
    }

    pub fn ok() -> Self {
        Self::status(StatusCode::OK)
    }

    /// Fails the exchange before any response head arrives.
    pub fn transport_error(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let mut response = Self::status(StatusCode::INTERNAL_SERVER_ERROR);
        response.error = Some((kind, message.into()));
        response
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.chunks = vec![body.into()];
        self
    }

    /// Body delivered as separate data events, in order.
    pub fn chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(value.to_string())
    }

    /// Reports the payload as a finished file after any data chunks.
    pub fn file(mut self, location: impl Into<PathBuf>) -> Self {
        self.file = Some(location.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StubEvent {
    Started {
        handle: OperationHandle,
        method: Method,
        path: String,
    },
    Completed {
        handle: OperationHandle,
        path: String,
        status: Option<u16>,
    },
    Cancelled {
        handle: OperationHandle,
    },
}

impl StubEvent {
    pub fn handle(&self) -> OperationHandle {
        match self {
            Self::Started { handle, .. }
            | Self::Completed { handle, .. }
            | Self::Cancelled { handle } => *handle,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub handle: OperationHandle,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
    pub cache_policy: CachePolicy,
}

struct Stub {
    matcher: StubMatcher,
    responses: VecDeque<StubResponse>,
    last: Option<StubResponse>,
}

impl Stub {
    /// Next scripted response; the final one repeats once the script runs out.
    fn next_response(&mut self) -> Option<StubResponse> {
        match self.responses.pop_front() {
            Some(response) => {
                self.last = Some(response.clone());
                Some(response)
            }
            None => self.last.clone(),
        }
    }
}

#[derive(Default)]
struct StubState {
    stubs: Vec<Stub>,
    events: Vec<StubEvent>,
    received: Vec<RecordedRequest>,
    active: HashSet<OperationHandle>,
}

#[derive(Clone, Default)]
pub struct StubTransport {
    state: Arc<Mutex<StubState>>,
}

impl std::fmt::Debug for StubTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("StubTransport")
            .field("stubs", &state.stubs.len())
            .field("events", &state.events.len())
            .field("active", &state.active.len())
            .finish()
    }
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, matcher: StubMatcher, response: StubResponse) -> &Self {
        self.on_sequence(matcher, [response])
    }

    /// Answers successive matches from `responses`. Stubs are consulted in
    /// registration order.
    pub fn on_sequence<I>(&self, matcher: StubMatcher, responses: I) -> &Self
    where
        I: IntoIterator<Item = StubResponse>,
    {
        lock_unpoisoned(&self.state).stubs.push(Stub {
            matcher,
            responses: responses.into_iter().collect(),
            last: None,
        });
        self
    }

    pub fn events(&self) -> Vec<StubEvent> {
        lock_unpoisoned(&self.state).events.clone()
    }

    pub fn received(&self) -> Vec<RecordedRequest> {
        lock_unpoisoned(&self.state).received.clone()
    }

    pub fn started_paths(&self) -> Vec<String> {
        lock_unpoisoned(&self.state)
            .events
            .iter()
            .filter_map(|event| match event {
                StubEvent::Started { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn completed_paths(&self) -> Vec<String> {
        lock_unpoisoned(&self.state)
            .events
            .iter()
            .filter_map(|event| match event {
                StubEvent::Completed { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn started_count(&self) -> usize {
        self.started_paths().len()
    }

    /// Exchanges started and neither completed nor cancelled.
    pub fn active(&self) -> usize {
        lock_unpoisoned(&self.state).active.len()
    }

    fn select(&self, handle: OperationHandle, request: &PreparedRequest) -> StubResponse {
        let mut state = lock_unpoisoned(&self.state);
        let path = request.uri().path().to_owned();
        state.events.push(StubEvent::Started {
            handle,
            method: request.method().clone(),
            path,
        });
        state.received.push(RecordedRequest {
            handle,
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body: request.body().clone(),
            timeout: request.timeout(),
            cache_policy: request.cache_policy(),
        });
        state.active.insert(handle);

        let scripted = state
            .stubs
            .iter_mut()
            .find(|stub| stub.matcher.matches(request))
            .and_then(Stub::next_response);
        scripted.unwrap_or_else(|| {
            debug!(%handle, uri = %request.redacted_uri(), "no stub matched");
            StubResponse::status(StatusCode::NOT_FOUND).body("no stub matched")
        })
    }

    fn is_active(&self, handle: OperationHandle) -> bool {
        lock_unpoisoned(&self.state).active.contains(&handle)
    }

    /// Logs completion and retires the handle; false once cancelled.
    fn complete(&self, handle: OperationHandle, path: String, status: Option<u16>) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if !state.active.remove(&handle) {
            return false;
        }
        state.events.push(StubEvent::Completed {
            handle,
            path,
            status,
        });
        true
    }

    fn run_exchange(
        &self,
        handle: OperationHandle,
        path: String,
        response: StubResponse,
        events: Arc<dyn TransportEvents>,
    ) {
        if !response.delay.is_zero() {
            thread::sleep(response.delay);
        }

        if let Some((kind, message)) = response.error {
            if self.complete(handle, path, None) {
                events.on_exchange_complete(handle, None, Some(TransportError::new(kind, message)));
            }
            return;
        }

        for chunk in response.chunks {
            if !self.is_active(handle) {
                return;
            }
            events.on_data_chunk(handle, chunk);
        }
        if let Some(location) = response.file {
            if !self.is_active(handle) {
                return;
            }
            events.on_file_complete(handle, location);
        }

        let status = response.status;
        if self.complete(handle, path, Some(status.as_u16())) {
            let metadata = ResponseMetadata::new(status, response.headers);
            events.on_exchange_complete(handle, Some(metadata), None);
        }
    }
}

impl Transport for StubTransport {
    fn start(
        &self,
        handle: OperationHandle,
        request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    ) {
        let response = self.select(handle, &request);
        let path = request.uri().path().to_owned();
        let transport = self.clone();
        thread::spawn(move || transport.run_exchange(handle, path, response, events));
    }

    fn cancel(&self, handle: OperationHandle) {
        let mut state = lock_unpoisoned(&self.state);
        if state.active.remove(&handle) {
            state.events.push(StubEvent::Cancelled { handle });
        }
    }
}
