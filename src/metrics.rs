use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpClientMetricsSnapshot {
    pub requests_submitted: u64,
    pub exchanges_dispatched: u64,
    pub delivered_ok: u64,
    pub delivered_with_error: u64,
    pub retries: u64,
    pub chains: u64,
    pub build_failures: u64,
    pub retries_exhausted: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct HttpClientMetrics {
    inner: Arc<HttpClientMetricsInner>,
}

#[derive(Debug, Default)]
struct HttpClientMetricsInner {
    requests_submitted: AtomicU64,
    exchanges_dispatched: AtomicU64,
    delivered_ok: AtomicU64,
    delivered_with_error: AtomicU64,
    retries: AtomicU64,
    chains: AtomicU64,
    build_failures: AtomicU64,
    retries_exhausted: AtomicU64,
    cancelled: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl HttpClientMetrics {
    pub(crate) fn record_submitted(&self) {
        self.inner
            .requests_submitted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.inner
            .exchanges_dispatched
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chain(&self) {
        self.inner.chains.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_build_failure(&self) {
        self.inner.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retries_exhausted(&self) {
        self.inner.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted once per completed exchange, including ones that are retried.
    pub(crate) fn record_status(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    pub(crate) fn record_delivered(&self, response: &Response) {
        match response.error() {
            None => {
                self.inner.delivered_ok.fetch_add(1, Ordering::Relaxed);
            }
            Some(error) => {
                self.inner
                    .delivered_with_error
                    .fetch_add(1, Ordering::Relaxed);
                self.add_error_count(error_key(error));
            }
        }
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> HttpClientMetricsSnapshot {
        let status_counts = lock_unpoisoned(&self.inner.status_counts).clone();
        let error_counts = lock_unpoisoned(&self.inner.error_counts).clone();

        HttpClientMetricsSnapshot {
            requests_submitted: self.inner.requests_submitted.load(Ordering::Relaxed),
            exchanges_dispatched: self.inner.exchanges_dispatched.load(Ordering::Relaxed),
            delivered_ok: self.inner.delivered_ok.load(Ordering::Relaxed),
            delivered_with_error: self.inner.delivered_with_error.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            chains: self.inner.chains.load(Ordering::Relaxed),
            build_failures: self.inner.build_failures.load(Ordering::Relaxed),
            retries_exhausted: self.inner.retries_exhausted.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
            status_counts,
            error_counts,
        }
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

fn error_key(error: &Error) -> String {
    match error.transport_kind() {
        Some(kind) => format!("{}:{kind}", error.code()),
        None => error.code().as_str().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::HttpClientMetrics;
    use crate::error::{Error, TransportErrorKind};
    use crate::request::Request;
    use crate::response::Response;

    #[test]
    fn delivered_errors_are_keyed_by_code_and_transport_kind() {
        let metrics = HttpClientMetrics::default();
        let request = Request::get("/items").build();

        metrics.record_delivered(&Response::new(&request, None, None, None));
        metrics.record_delivered(&Response::failed(
            &request,
            Error::Transport {
                kind: TransportErrorKind::Connect,
                method: Method::GET,
                uri: "http://localhost/items".to_owned(),
                source: "refused".into(),
            },
        ));
        metrics.record_delivered(&Response::failed(
            &request,
            Error::MaxRetryAttemptsReached {
                attempts: 3,
                method: Method::GET,
                uri: "http://localhost/items".to_owned(),
            },
        ));

        let snapshot = metrics.snapshot(2);
        assert_eq!(snapshot.delivered_ok, 1);
        assert_eq!(snapshot.delivered_with_error, 2);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.error_counts.get("transport:connect"), Some(&1));
        assert_eq!(
            snapshot.error_counts.get("max_retry_attempts_reached"),
            Some(&1)
        );
    }

    #[test]
    fn status_counts_accumulate_per_code() {
        let metrics = HttpClientMetrics::default();
        metrics.record_status(503);
        metrics.record_status(503);
        metrics.record_status(200);

        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.status_counts.get(&503), Some(&2));
        assert_eq!(snapshot.status_counts.get(&200), Some(&1));
    }
}
