//! `reqflow` is an HTTP request lifecycle engine layered over a pluggable transport.
//!
//! It prepares declarative [`Request`]s, correlates transport events with them,
//! runs a [`ValidatorChain`] over every completed exchange and then delivers,
//! retries, or first runs another request and retries afterwards.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{HttpClient, Request, UreqTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder("https://api.example.com")
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(5))
//!         .build(UreqTransport::default());
//!
//!     let response = client
//!         .send(Request::get("/v1/items").max_retries(3))
//!         .wait()?;
//!
//!     println!("status={:?} error={:?}", response.status(), response.error());
//!     Ok(())
//! }
//! ```
//!
//! # Token refresh
//!
//! A validator returning [`ValidationOutcome::RetryAfter`] runs the given request
//! to completion and then re-dispatches the original without spending a retry.
//! With a [`DependencyQueue`] the same ordering is enforced through queue links.

mod client;
mod config;
mod correlation;
mod error;
mod metrics;
mod observe;
mod queue;
mod request;
mod response;
pub mod stub;
mod transport;
#[cfg(feature = "ureq-transport")]
mod ureq_transport;
mod util;
mod validate;

pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::config::ClientConfig;
pub use crate::correlation::CorrelationTable;
pub use crate::error::{
    BoxError, BuildError, DependencyError, Error, ErrorCode, TransportError, TransportErrorKind,
};
pub use crate::metrics::HttpClientMetricsSnapshot;
pub use crate::observe::{ExchangeContext, Observer};
pub use crate::queue::{DependencyQueue, QueuedOperation};
pub use crate::request::{
    Body, BodyEncoder, CachePolicy, PreparedRequest, Request, RequestBuilder, RequestId,
    RequestPhase,
};
pub use crate::response::{Payload, Response, ResponseFuture, ResponseMetadata};
pub use crate::transport::{OperationHandle, Transport, TransportEvents};
#[cfg(feature = "ureq-transport")]
pub use crate::ureq_transport::UreqTransport;
pub use crate::validate::{DefaultValidator, ResponseValidator, ValidationOutcome, ValidatorChain};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::stub::{StubMatcher, StubResponse, StubTransport};
    #[cfg(feature = "ureq-transport")]
    pub use crate::UreqTransport;
    pub use crate::{
        CachePolicy, DefaultValidator, DependencyQueue, Error, ErrorCode, HttpClient,
        HttpClientMetricsSnapshot, Observer, Payload, Request, Response, ResponseValidator,
        TransportErrorKind, ValidationOutcome, ValidatorChain,
    };
}
