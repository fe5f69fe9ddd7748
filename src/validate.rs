use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{BoxError, Error, TransportErrorKind};
use crate::request::Request;
use crate::response::{Payload, Response};
use crate::util::truncate_body;

pub enum ValidationOutcome {
    Passed,
    FailWithError(BoxError),
    RetryIfPossible,
    /// Run the given request to completion, then retry the original for free.
    RetryAfter(Request),
}

impl ValidationOutcome {
    pub fn fail(cause: impl Into<BoxError>) -> Self {
        Self::FailWithError(cause.into())
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl std::fmt::Debug for ValidationOutcome {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => formatter.write_str("Passed"),
            Self::FailWithError(cause) => formatter
                .debug_tuple("FailWithError")
                .field(&cause.to_string())
                .finish(),
            Self::RetryIfPossible => formatter.write_str("RetryIfPossible"),
            Self::RetryAfter(request) => formatter
                .debug_tuple("RetryAfter")
                .field(&request.id())
                .finish(),
        }
    }
}

/// Inspects a completed exchange. Must not block on I/O.
pub trait ResponseValidator: Send + Sync {
    fn validate(&self, response: &Response) -> ValidationOutcome;
}

impl<F> ResponseValidator for F
where
    F: Fn(&Response) -> ValidationOutcome + Send + Sync,
{
    fn validate(&self, response: &Response) -> ValidationOutcome {
        self(response)
    }
}

/// Validators in registration order; the first decisive outcome wins.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn ResponseValidator>>,
}

impl std::fmt::Debug for ValidatorChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ValidatorChain")
            .field("len", &self.validators.len())
            .finish()
    }
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default() -> Self {
        Self::new().push(DefaultValidator::standard())
    }

    pub fn push(mut self, validator: impl ResponseValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push_shared(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validate(&self, response: &Response) -> ValidationOutcome {
        for validator in &self.validators {
            let outcome = validator.validate(response);
            if !outcome.is_passed() {
                return outcome;
            }
        }
        ValidationOutcome::Passed
    }
}

/// Baseline policy: pass healthy responses and retry every failure.
///
/// The retryable sets start unrestricted. Narrowing one turns failures outside it
/// into `FailWithError`.
#[derive(Clone, Debug, Default)]
pub struct DefaultValidator {
    retryable_status_codes: Option<BTreeSet<u16>>,
    retryable_transport_error_kinds: Option<BTreeSet<TransportErrorKind>>,
}

impl DefaultValidator {
    pub fn standard() -> Self {
        Self::default()
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes
            .as_ref()
            .is_none_or(|codes| codes.contains(&status))
    }

    pub fn is_retryable_transport_error(&self, kind: TransportErrorKind) -> bool {
        self.retryable_transport_error_kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&kind))
    }
}

impl ResponseValidator for DefaultValidator {
    fn validate(&self, response: &Response) -> ValidationOutcome {
        if let Some(error) = response.shared_error() {
            return match error.transport_kind() {
                Some(kind) if self.is_retryable_transport_error(kind) => {
                    ValidationOutcome::RetryIfPossible
                }
                _ => ValidationOutcome::fail(error),
            };
        }

        let Some(status) = response.status() else {
            if self.retryable_transport_error_kinds.is_none() {
                return ValidationOutcome::RetryIfPossible;
            }
            return ValidationOutcome::fail("exchange completed without a response");
        };
        if status.is_success() || status.is_redirection() || status.is_informational() {
            return ValidationOutcome::Passed;
        }
        if self.is_retryable_status(status.as_u16()) {
            return ValidationOutcome::RetryIfPossible;
        }

        let body = match response.payload() {
            Some(Payload::Data(data)) => truncate_body(data),
            Some(Payload::File(_)) | None => String::new(),
        };
        ValidationOutcome::fail(Error::HttpStatus {
            status: status.as_u16(),
            method: response.method().clone(),
            uri: response.uri().to_owned(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{DefaultValidator, ResponseValidator, ValidationOutcome, ValidatorChain};
    use crate::error::{Error, TransportErrorKind};
    use crate::request::Request;
    use crate::response::{Payload, Response, ResponseMetadata};

    fn response_with_status(request: &Request, status: u16) -> Response {
        let status = StatusCode::from_u16(status).expect("valid status");
        Response::new(
            request,
            Some(ResponseMetadata::new(status, HeaderMap::new())),
            None,
            None,
        )
    }

    fn transport_failure(request: &Request, kind: TransportErrorKind) -> Response {
        let error = Error::Transport {
            kind,
            method: http::Method::GET,
            uri: "https://api.example.com/items".to_owned(),
            source: "boom".into(),
        };
        Response::new(request, None, None, Some(error))
    }

    #[test]
    fn default_validator_passes_success_and_retries_any_failure_status() {
        let request = Request::get("/items").build();
        let validator = DefaultValidator::standard();

        assert!(matches!(
            validator.validate(&response_with_status(&request, 200)),
            ValidationOutcome::Passed
        ));
        assert!(matches!(
            validator.validate(&response_with_status(&request, 304)),
            ValidationOutcome::Passed
        ));
        for status in [400, 401, 404, 429, 503] {
            assert!(
                matches!(
                    validator.validate(&response_with_status(&request, status)),
                    ValidationOutcome::RetryIfPossible
                ),
                "status {status} should be retried"
            );
        }
    }

    #[test]
    fn default_validator_retries_every_transport_error() {
        let request = Request::get("/items").build();
        let validator = DefaultValidator::standard();

        for kind in [
            TransportErrorKind::Connect,
            TransportErrorKind::Tls,
            TransportErrorKind::Other,
        ] {
            assert!(matches!(
                validator.validate(&transport_failure(&request, kind)),
                ValidationOutcome::RetryIfPossible
            ));
        }
        assert!(matches!(
            validator.validate(&Response::new(&request, None, None, None)),
            ValidationOutcome::RetryIfPossible
        ));
    }

    #[test]
    fn narrowed_status_set_fails_with_status_error() {
        let request = Request::post("/missing").build();
        let response = Response::new(
            &request,
            Some(ResponseMetadata::new(StatusCode::NOT_FOUND, HeaderMap::new())),
            Some(Payload::Data(Bytes::from_static(b"nope"))),
            None,
        )
        .with_uri("https://api.example.com/missing?token=***".to_owned());
        let outcome = DefaultValidator::standard()
            .retryable_status_codes([503])
            .validate(&response);

        let ValidationOutcome::FailWithError(cause) = outcome else {
            panic!("404 should fail, got {outcome:?}");
        };
        let status_error = cause
            .downcast_ref::<Error>()
            .expect("cause should be a status error");
        assert!(matches!(
            status_error,
            Error::HttpStatus { status: 404, method, uri, body }
                if *method == http::Method::POST
                    && uri == "https://api.example.com/missing?token=***"
                    && body == "nope"
        ));
    }

    #[test]
    fn status_error_skips_file_payloads() {
        let request = Request::get("/report").build();
        let response = Response::new(
            &request,
            Some(ResponseMetadata::new(StatusCode::FORBIDDEN, HeaderMap::new())),
            Some(Payload::File("/var/tmp/report.bin".into())),
            None,
        );
        let outcome = DefaultValidator::standard()
            .retryable_status_codes([])
            .validate(&response);

        let ValidationOutcome::FailWithError(cause) = outcome else {
            panic!("403 should fail, got {outcome:?}");
        };
        assert!(matches!(
            cause.downcast_ref::<Error>(),
            Some(Error::HttpStatus { status: 403, body, .. }) if body.is_empty()
        ));
    }

    #[test]
    fn narrowed_transport_kinds_fail_other_errors() {
        let request = Request::get("/items").build();
        let validator = DefaultValidator::standard()
            .retryable_transport_error_kinds([TransportErrorKind::Connect]);

        assert!(matches!(
            validator.validate(&transport_failure(&request, TransportErrorKind::Connect)),
            ValidationOutcome::RetryIfPossible
        ));
        let outcome = validator.validate(&transport_failure(&request, TransportErrorKind::Tls));
        let ValidationOutcome::FailWithError(cause) = outcome else {
            panic!("tls failures are outside the set, got {outcome:?}");
        };
        let shared = cause
            .downcast_ref::<Arc<Error>>()
            .expect("cause should carry the transport error");
        assert_eq!(shared.transport_kind(), Some(TransportErrorKind::Tls));
        assert!(matches!(
            validator.validate(&Response::new(&request, None, None, None)),
            ValidationOutcome::FailWithError(_)
        ));
    }

    #[test]
    fn retryable_sets_are_configurable() {
        let request = Request::get("/items").build();
        let validator = DefaultValidator::standard()
            .retryable_status_codes([404])
            .retryable_transport_error_kinds([]);

        assert!(matches!(
            validator.validate(&response_with_status(&request, 404)),
            ValidationOutcome::RetryIfPossible
        ));
        assert!(matches!(
            validator.validate(&response_with_status(&request, 503)),
            ValidationOutcome::FailWithError(_)
        ));
        assert!(matches!(
            validator.validate(&transport_failure(&request, TransportErrorKind::Connect)),
            ValidationOutcome::FailWithError(_)
        ));
    }

    #[test]
    fn chain_stops_at_first_decisive_outcome() {
        let request = Request::get("/items").build();
        let later_calls = Arc::new(AtomicUsize::new(0));
        let later_calls_in_validator = Arc::clone(&later_calls);

        let chain = ValidatorChain::new()
            .push(|_: &Response| ValidationOutcome::Passed)
            .push(|_: &Response| ValidationOutcome::RetryIfPossible)
            .push(move |_: &Response| {
                later_calls_in_validator.fetch_add(1, Ordering::SeqCst);
                ValidationOutcome::fail("never reached")
            });

        assert!(matches!(
            chain.validate(&response_with_status(&request, 200)),
            ValidationOutcome::RetryIfPossible
        ));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_chain_passes() {
        let request = Request::get("/items").build();
        assert!(
            ValidatorChain::new()
                .validate(&response_with_status(&request, 500))
                .is_passed()
        );
    }
}
