use std::sync::{Mutex, MutexGuard};

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};

use crate::error::BuildError;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for name in request_headers.keys() {
        merged.remove(name);
    }
    for (name, value) in request_headers {
        merged.append(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

fn has_http_scheme(text: &str) -> bool {
    let Some((scheme, _)) = text.split_once("://") else {
        return false;
    };
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), BuildError> {
    let uri_text = if has_http_scheme(path) {
        path.to_owned()
    } else {
        join_base_path(base_url, path)
    };
    let invalid = || BuildError::InvalidUri {
        uri: redact_uri_for_logs(&uri_text),
    };
    let uri: Uri = uri_text.parse().map_err(|_| invalid())?;
    let scheme_ok = uri.scheme_str().is_some_and(|scheme| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    });
    if !scheme_ok || uri.host().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok((uri_text, uri))
}

/// Appends `query_pairs` after any query already in `path`, keeping the fragment last.
pub(crate) fn append_query_pairs(path: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return path.to_owned();
    }

    let (target, fragment) = path
        .split_once('#')
        .map_or((path, None), |(target, fragment)| (target, Some(fragment)));
    let (base, existing) = target.split_once('?').unwrap_or((target, ""));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(url::form_urlencoded::parse(existing.as_bytes()))
        .extend_pairs(query_pairs)
        .finish();
    match fragment {
        Some(fragment) => format!("{base}?{query}#{fragment}"),
        None => format!("{base}?{query}"),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_owned();
    }
    if base.is_empty() {
        return relative.to_owned();
    }
    format!("{base}/{relative}")
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, BuildError> {
    name.parse().map_err(|_| BuildError::InvalidHeaderName {
        name: name.to_owned(),
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, BuildError> {
    value.parse().map_err(|_| BuildError::InvalidHeaderValue {
        name: name.to_owned(),
    })
}

/// Lossy text of `body`, capped for error messages and logs.
pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_ERROR_BODY_LEN) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.into_owned(),
    }
}
