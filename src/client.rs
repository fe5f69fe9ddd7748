use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use tracing::{Span, debug, info_span, warn};

use crate::config::{ClientConfig, DEFAULT_CLIENT_NAME, DEFAULT_REQUEST_TIMEOUT};
use crate::correlation::CorrelationTable;
use crate::error::{BoxError, BuildError, DependencyError, Error, TransportError};
use crate::metrics::{HttpClientMetrics, HttpClientMetricsSnapshot};
use crate::observe::{ExchangeContext, Observer};
use crate::queue::{DependencyQueue, QueuedOperation};
use crate::request::{CachePolicy, Listener, PreparedRequest, Request, RequestId};
use crate::response::{Response, ResponseFuture, ResponseMetadata};
use crate::transport::{OperationHandle, Transport, TransportEvents};
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value};
use crate::validate::{DefaultValidator, ResponseValidator, ValidationOutcome, ValidatorChain};

#[must_use]
pub struct HttpClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    cache_policy: CachePolicy,
    validators: ValidatorChain,
    default_validator: Option<DefaultValidator>,
    queue: Option<DependencyQueue>,
    observer: Option<Arc<dyn Observer>>,
    client_name: String,
}

impl HttpClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache_policy: CachePolicy::default(),
            validators: ValidatorChain::new(),
            default_validator: Some(DefaultValidator::standard()),
            queue: None,
            observer: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self, BuildError> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    /// Appends a validator. Custom validators run before the default one.
    pub fn validator(mut self, validator: impl ResponseValidator + 'static) -> Self {
        self.validators = self.validators.push(validator);
        self
    }

    /// Replaces every custom validator registered so far.
    pub fn validators(mut self, validators: ValidatorChain) -> Self {
        self.validators = validators;
        self
    }

    pub fn default_validator(mut self, default_validator: DefaultValidator) -> Self {
        self.default_validator = Some(default_validator);
        self
    }

    pub fn without_default_validator(mut self) -> Self {
        self.default_validator = None;
        self
    }

    pub fn queue(mut self, queue: DependencyQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn build(self, transport: impl Transport + 'static) -> HttpClient {
        let mut validators = self.validators;
        if let Some(default_validator) = self.default_validator {
            validators = validators.push(default_validator);
        }
        let config = ClientConfig {
            client_name: self.client_name,
            base_url: self.base_url,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            cache_policy: self.cache_policy,
        };

        let inner = Arc::new_cyclic(|this| ClientInner {
            config,
            transport: Box::new(transport),
            validators,
            queue: self.queue,
            observer: self.observer,
            table: CorrelationTable::new(),
            metrics: HttpClientMetrics::default(),
            next_handle: AtomicU64::new(1),
            chains: Mutex::new(HashMap::new()),
            this: this.clone(),
        });
        HttpClient { inner }
    }
}

/// Drives requests through prepare, dispatch, validation and delivery.
///
/// Cheap to clone; clones share the transport, correlation table and queue.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .field("validators", &self.inner.validators)
            .field("queue", &self.inner.queue)
            .field("in_flight", &self.inner.table.len())
            .finish()
    }
}

impl HttpClient {
    pub fn builder(base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(base_url)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> Option<&DependencyQueue> {
        self.inner.queue.as_ref()
    }

    /// Starts a new episode for `request` and returns it.
    ///
    /// Ignored with a warning while the request already has an episode in flight.
    pub fn execute(&self, request: impl Into<Request>) -> Request {
        let request = request.into();
        if self.inner.start_episode(&request) {
            self.inner.submit(&request);
            self.inner.pump();
        }
        request
    }

    /// Executes `request` and resolves with its terminal delivery.
    ///
    /// When the request is already in flight the future attaches to that episode.
    pub fn send(&self, request: impl Into<Request>) -> ResponseFuture {
        let request = request.into();
        if !self.inner.start_episode(&request) {
            return request.response();
        }
        let (listener, future) = Listener::channel();
        request.push_listener(listener);
        self.inner.submit(&request);
        self.inner.pump();
        future
    }

    /// Abandons the current episode of `request`. Nothing is delivered for it.
    pub fn cancel(&self, request: &Request) -> bool {
        self.inner.cancel(request)
    }

    /// Exchanges currently bound to a transport handle.
    pub fn in_flight(&self) -> usize {
        self.inner.table.len()
    }

    pub fn metrics_snapshot(&self) -> HttpClientMetricsSnapshot {
        self.inner.metrics.snapshot(self.inner.table.len())
    }
}

struct PendingChain {
    original: Request,
    alt: Request,
}

struct GateRelease {
    engine: Weak<ClientInner>,
    gate: OperationHandle,
}

impl Drop for GateRelease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade()
            && let Some(queue) = &engine.queue
        {
            queue.release(self.gate);
            engine.pump();
        }
    }
}

enum ChainTarget {
    Existing(OperationHandle),
    Fresh(PreparedRequest),
}

struct ClientInner {
    config: ClientConfig,
    transport: Box<dyn Transport>,
    validators: ValidatorChain,
    queue: Option<DependencyQueue>,
    observer: Option<Arc<dyn Observer>>,
    table: CorrelationTable,
    metrics: HttpClientMetrics,
    next_handle: AtomicU64,
    // direct mode only: original request id -> the alt it waits for
    chains: Mutex<HashMap<RequestId, PendingChain>>,
    this: Weak<ClientInner>,
}

impl ClientInner {
    fn allocate_handle(&self) -> OperationHandle {
        OperationHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn context(&self, request: &Request, handle: Option<OperationHandle>) -> ExchangeContext {
        ExchangeContext::new(request, request.redacted_target(&self.config), handle)
    }

    fn exchange_span(&self, request: &Request, uri: &str, handle: OperationHandle) -> Span {
        info_span!(
            "reqflow.exchange",
            client = %self.config.client_name(),
            request = %request.id(),
            method = %request.method(),
            uri = %uri,
            handle = %handle,
            attempt = request.current_retry(),
            max_retries = request.max_retries()
        )
    }

    fn start_episode(&self, request: &Request) -> bool {
        if !request.begin_episode() {
            warn!(
                request = %request.id(),
                phase = ?request.phase(),
                "request already in flight; ignoring execute"
            );
            return false;
        }
        self.metrics.record_submitted();
        true
    }

    /// Prepares a request in `Building` and dispatches or queues it.
    ///
    /// Returns the handle of the queued operation, if one was queued.
    fn submit(&self, request: &Request) -> Option<OperationHandle> {
        let prepared = match request.prepare(&self.config) {
            Ok(prepared) => prepared,
            Err(source) => {
                self.fail_build(request, source);
                return None;
            }
        };
        let handle = self.allocate_handle();

        let Some(queue) = &self.queue else {
            self.dispatch(handle, request, prepared);
            return None;
        };
        if !request.mark_queued(handle) {
            debug!(request = %request.id(), "request left building before it was queued");
            return None;
        }
        debug!(request = %request.id(), %handle, "request queued");
        queue.push(QueuedOperation::new(handle, request.clone(), prepared));
        Some(handle)
    }

    fn dispatch(&self, handle: OperationHandle, request: &Request, prepared: PreparedRequest) {
        let Some(events) = self.this.upgrade() else {
            return;
        };
        self.table.bind(handle, request.clone());
        if !request.mark_dispatched(handle) {
            self.table.unbind(handle);
            debug!(
                request = %request.id(),
                %handle,
                "request no longer dispatchable; skipping exchange"
            );
            if let Some(queue) = &self.queue {
                queue.finish(handle, None);
            }
            return;
        }

        let span = self.exchange_span(request, prepared.redacted_uri(), handle);
        let _enter = span.enter();
        self.metrics.record_dispatched();
        if let Some(observer) = &self.observer {
            observer.on_dispatch(&ExchangeContext::new(
                request,
                prepared.redacted_uri().to_owned(),
                Some(handle),
            ));
        }
        debug!(
            timeout_ms = prepared.timeout().as_millis() as u64,
            "dispatching exchange"
        );
        self.transport.start(handle, prepared, events);
    }

    fn apply_outcome(&self, request: &Request, mut response: Response) -> Option<OperationHandle> {
        match self.validators.validate(&response) {
            ValidationOutcome::Passed => {
                self.deliver(request, response);
                None
            }
            ValidationOutcome::FailWithError(cause) => {
                response.set_error(self.invalid_response(request, cause));
                self.deliver(request, response);
                None
            }
            ValidationOutcome::RetryIfPossible => self.retry(request, response),
            ValidationOutcome::RetryAfter(alt) => self.chain(request, response, alt),
        }
    }

    fn retry(&self, request: &Request, mut response: Response) -> Option<OperationHandle> {
        let attempts = request.increment_retry();
        let max_retries = request.max_retries();
        if attempts >= max_retries {
            self.metrics.record_retries_exhausted();
            warn!(attempts, max_retries, "retry attempts exhausted");
            response.set_error(Error::MaxRetryAttemptsReached {
                attempts,
                method: request.method().clone(),
                uri: request.redacted_target(&self.config),
            });
            self.deliver(request, response);
            return None;
        }
        if !request.mark_retrying() {
            return None;
        }

        self.metrics.record_retry();
        if let Some(observer) = &self.observer {
            observer.on_retry_scheduled(&self.context(request, None));
        }
        match response.error() {
            Some(error) => {
                warn!(attempt = attempts, max_retries, error = %error, "retrying request")
            }
            None => warn!(
                attempt = attempts,
                max_retries,
                status = ?response.status(),
                "retrying request after retryable status"
            ),
        }
        if !request.enter_building() {
            return None;
        }
        self.submit(request)
    }

    fn chain(
        &self,
        request: &Request,
        response: Response,
        alt: Request,
    ) -> Option<OperationHandle> {
        if alt.same_as(request) {
            self.fail_chain(
                request,
                response,
                DependencyError::SelfDependency {
                    request: request.id(),
                },
            );
            return None;
        }
        if !request.mark_chaining() {
            return None;
        }

        self.metrics.record_chain();
        if let Some(observer) = &self.observer {
            observer.on_chain_scheduled(&self.context(request, None), &alt);
        }
        warn!(
            alt = %alt.id(),
            alt_method = %alt.method(),
            alt_uri = %alt.redacted_target(&self.config),
            "running dependent request before retrying"
        );

        match &self.queue {
            Some(queue) => self.chain_queued(queue, request, response, alt),
            None => {
                self.chain_direct(request, response, alt);
                None
            }
        }
    }

    fn chain_direct(&self, request: &Request, response: Response, alt: Request) {
        let closes_cycle = {
            let mut chains = lock_unpoisoned(&self.chains);
            let closes_cycle = chain_closes_cycle(&chains, request, &alt);
            if !closes_cycle {
                chains.insert(
                    request.id(),
                    PendingChain {
                        original: request.clone(),
                        alt: alt.clone(),
                    },
                );
            }
            closes_cycle
        };
        if closes_cycle {
            self.fail_chain(
                request,
                response,
                DependencyError::Cycle {
                    request: request.id(),
                },
            );
            return;
        }

        let continuation = self.chain_continuation(request);
        let Some(continuation) = alt.push_listener_if_in_flight(continuation) else {
            debug!(alt = %alt.id(), "alt already in flight; waiting for its delivery");
            return;
        };

        let prepared = match alt.prepare(&self.config) {
            Ok(prepared) => prepared,
            Err(source) => {
                lock_unpoisoned(&self.chains).remove(&request.id());
                self.metrics.record_build_failure();
                let error = self.build_error(&alt, source);
                self.fail_chain(request, response, error);
                return;
            }
        };
        if !alt.begin_episode() {
            // started elsewhere since the check above
            if alt.push_listener_if_in_flight(continuation).is_some() {
                self.resume_after_chain(request);
            }
            return;
        }

        self.metrics.record_submitted();
        alt.push_listener(continuation);
        self.dispatch(self.allocate_handle(), &alt, prepared);
    }

    fn chain_continuation(&self, request: &Request) -> Listener {
        let engine = self.this.clone();
        let original = request.clone();
        Listener::Callback(Box::new(move |_alt_response| {
            if let Some(engine) = engine.upgrade() {
                engine.resume_after_chain(&original);
            }
        }))
    }

    fn resume_after_chain(&self, original: &Request) {
        if lock_unpoisoned(&self.chains)
            .remove(&original.id())
            .is_none()
        {
            return;
        }
        self.resume_chained(original);
    }

    fn resume_chained(&self, original: &Request) {
        if !original.enter_building() {
            debug!(request = %original.id(), "chained request no longer waiting");
            return;
        }
        debug!(request = %original.id(), "resuming request after chain");
        self.submit(original);
        self.pump();
    }

    fn chain_queued(
        &self,
        queue: &DependencyQueue,
        request: &Request,
        response: Response,
        alt: Request,
    ) -> Option<OperationHandle> {
        let prepared = match request.prepare(&self.config) {
            Ok(prepared) => prepared,
            Err(source) => {
                self.metrics.record_build_failure();
                let error = self.build_error(request, source);
                self.fail_chain(request, response, error);
                return None;
            }
        };
        let target = match queue.operation_for(&alt) {
            Some(existing) => ChainTarget::Existing(existing),
            None => match alt.prepare(&self.config) {
                Ok(alt_prepared) => ChainTarget::Fresh(alt_prepared),
                Err(source) => {
                    self.metrics.record_build_failure();
                    let error = self.build_error(&alt, source);
                    self.fail_chain(request, response, error);
                    return None;
                }
            },
        };

        let handle = self.allocate_handle();
        if !request.enter_building() || !request.mark_queued(handle) {
            return None;
        }
        let operation = QueuedOperation::new(handle, request.clone(), prepared);
        let linked = match target {
            ChainTarget::Existing(on) => {
                debug!(alt = %alt.id(), %on, "alt already queued; linking to its operation");
                queue.add_dependent(operation, on)
            }
            ChainTarget::Fresh(alt_prepared) => {
                if alt.begin_episode() {
                    self.metrics.record_submitted();
                    let alt_handle = self.allocate_handle();
                    alt.mark_queued(alt_handle);
                    let result = queue.add_with_dependency(
                        operation,
                        QueuedOperation::new(alt_handle, alt.clone(), alt_prepared),
                    );
                    if result.is_err() {
                        alt.cancel();
                    }
                    result
                } else {
                    self.gate_on_episode_end(queue, operation, &alt);
                    Ok(())
                }
            }
        };

        match linked {
            Ok(()) => Some(handle),
            Err(error) => {
                self.fail_chain(request, response, error);
                None
            }
        }
    }

    /// Holds `operation` until `alt`, running outside the queue, ends its episode.
    fn gate_on_episode_end(
        &self,
        queue: &DependencyQueue,
        operation: QueuedOperation,
        alt: &Request,
    ) {
        let gate = self.allocate_handle();
        queue.add_gated(operation, gate);
        let release = GateRelease {
            engine: self.this.clone(),
            gate,
        };
        // fires on delivery; dropped unfired on cancel, which releases as well
        let listener = Listener::Callback(Box::new(move |_| drop(release)));
        match alt.push_listener_if_in_flight(listener) {
            None => {
                debug!(alt = %alt.id(), %gate, "alt running outside the queue; waiting for it")
            }
            Some(listener) => drop(listener),
        }
    }

    fn fail_chain(&self, request: &Request, mut response: Response, cause: impl Into<BoxError>) {
        let cause = cause.into();
        warn!(request = %request.id(), error = %cause, "request chain rejected");
        response.set_error(self.invalid_response(request, cause));
        self.deliver(request, response);
    }

    fn fail_build(&self, request: &Request, source: BuildError) {
        self.metrics.record_build_failure();
        let error = self.build_error(request, source);
        warn!(request = %request.id(), error = %error, "failed building request");
        let response =
            Response::failed(request, error).with_uri(request.redacted_target(&self.config));
        self.deliver(request, response);
    }

    fn build_error(&self, request: &Request, source: BuildError) -> Error {
        Error::FailedBuildingRequest {
            method: request.method().clone(),
            uri: request.redacted_target(&self.config),
            source,
        }
    }

    fn invalid_response(&self, request: &Request, cause: impl Into<BoxError>) -> Error {
        Error::InvalidResponse {
            method: request.method().clone(),
            uri: request.redacted_target(&self.config),
            source: cause.into(),
        }
    }

    fn deliver(&self, request: &Request, response: Response) {
        let Some(listeners) = request.take_for_delivery(&response) else {
            debug!(request = %request.id(), "episode already ended; dropping delivery");
            return;
        };

        self.metrics.record_delivered(&response);
        if let Some(observer) = &self.observer {
            observer.on_delivered(&self.context(request, None), &response);
        }
        match response.error() {
            Some(error) => debug!(
                request = %request.id(),
                listeners = listeners.len(),
                error = %error,
                "delivering failed response"
            ),
            None => debug!(
                request = %request.id(),
                listeners = listeners.len(),
                status = ?response.status(),
                "delivering response"
            ),
        }
        for listener in listeners {
            listener.fire(response.clone());
        }
    }

    fn finish_queued(&self, handle: OperationHandle, successor: Option<OperationHandle>) {
        if let Some(queue) = &self.queue {
            queue.finish(handle, successor);
            self.pump();
        }
    }

    fn pump(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let mut batch = queue.begin_pump();
        while !batch.is_empty() {
            for operation in batch {
                let (handle, request, prepared) = operation.into_parts();
                self.dispatch(handle, &request, prepared);
            }
            batch = queue.continue_pump();
        }
    }

    fn cancel(&self, request: &Request) -> bool {
        let Some(handle) = request.cancel() else {
            return false;
        };
        let context = self.context(request, handle);
        if let Some(handle) = handle {
            self.table.unbind(handle);
            self.transport.cancel(handle);
        }
        if let Some(queue) = &self.queue {
            while let Some(queued) = queue.operation_for(request) {
                if !queue.cancel(queued) {
                    break;
                }
            }
        }

        let mut waiting = Vec::new();
        {
            let mut chains = lock_unpoisoned(&self.chains);
            chains.remove(&request.id());
            chains.retain(|_, chain| {
                if chain.alt.same_as(request) {
                    waiting.push(chain.original.clone());
                    false
                } else {
                    true
                }
            });
        }

        self.metrics.record_cancelled();
        if let Some(observer) = &self.observer {
            observer.on_cancelled(&context);
        }
        debug!(request = %request.id(), handle = ?handle, "request cancelled");

        for original in waiting {
            self.resume_chained(&original);
        }
        self.pump();
        true
    }
}

impl TransportEvents for ClientInner {
    fn on_data_chunk(&self, handle: OperationHandle, chunk: Bytes) {
        self.table.append_data(handle, &chunk);
    }

    fn on_file_complete(&self, handle: OperationHandle, location: PathBuf) {
        self.table.set_file(handle, location);
    }

    fn on_exchange_complete(
        &self,
        handle: OperationHandle,
        response: Option<ResponseMetadata>,
        error: Option<TransportError>,
    ) {
        let Some((request, payload)) = self.table.unbind(handle) else {
            debug!(%handle, "ignoring completion for unbound exchange");
            return;
        };
        if !request.begin_completing(handle) {
            debug!(%handle, request = %request.id(), "ignoring completion for stale exchange");
            self.finish_queued(handle, None);
            return;
        }

        let uri = request.redacted_target(&self.config);
        let span = self.exchange_span(&request, &uri, handle);
        let successor = {
            let _enter = span.enter();
            let timeout_ms = request.effective_timeout(&self.config).as_millis();
            let error = error.map(|error| {
                Error::from_transport(error, request.method(), &uri, timeout_ms)
            });
            match (&response, &error) {
                (_, Some(error)) => debug!(error = %error, "exchange failed"),
                (Some(metadata), None) => {
                    debug!(status = metadata.status().as_u16(), "exchange completed")
                }
                (None, None) => debug!("exchange completed without a response head"),
            }
            if let Some(metadata) = &response {
                self.metrics.record_status(metadata.status().as_u16());
            }

            let response = Response::new(&request, response, payload, error).with_uri(uri);
            self.apply_outcome(&request, response)
        };
        self.finish_queued(handle, successor);
    }
}

fn chain_closes_cycle(
    chains: &HashMap<RequestId, PendingChain>,
    original: &Request,
    alt: &Request,
) -> bool {
    let mut current = alt.clone();
    for _ in 0..=chains.len() {
        if current.same_as(original) {
            return true;
        }
        match chains.get(&current.id()) {
            Some(chain) => current = chain.alt.clone(),
            None => return false,
        }
    }
    false
}
