use http::Method;

use crate::request::Request;
use crate::response::Response;
use crate::transport::OperationHandle;

/// Snapshot of a request at one lifecycle step.
#[derive(Clone, Debug)]
pub struct ExchangeContext {
    method: Method,
    uri: String,
    handle: Option<OperationHandle>,
    attempt: usize,
    max_retries: usize,
}

impl ExchangeContext {
    pub(crate) fn new(request: &Request, uri: String, handle: Option<OperationHandle>) -> Self {
        Self {
            method: request.method().clone(),
            uri,
            handle,
            attempt: request.current_retry(),
            max_retries: request.max_retries(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target uri with credentials and query removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn handle(&self) -> Option<OperationHandle> {
        self.handle
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }
}

pub trait Observer: Send + Sync {
    fn on_dispatch(&self, _context: &ExchangeContext) {}

    fn on_retry_scheduled(&self, _context: &ExchangeContext) {}

    /// `alt` runs to delivery before the request in `context` is retried.
    fn on_chain_scheduled(&self, _context: &ExchangeContext, _alt: &Request) {}

    fn on_delivered(&self, _context: &ExchangeContext, _response: &Response) {}

    fn on_cancelled(&self, _context: &ExchangeContext) {}
}
