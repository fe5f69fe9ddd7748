use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use tracing::debug;

use crate::config::DEFAULT_CLIENT_NAME;
use crate::error::{TransportError, TransportErrorKind};
use crate::request::PreparedRequest;
use crate::response::ResponseMetadata;
use crate::transport::{OperationHandle, Transport, TransportEvents};
use crate::util::lock_unpoisoned;

const READ_CHUNK_BYTES: usize = 8192;

/// Blocking [`ureq`] agent driven from one worker thread per exchange.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
    download_dir: Option<PathBuf>,
    active: Arc<Mutex<HashSet<OperationHandle>>>,
}

impl std::fmt::Debug for UreqTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("UreqTransport")
            .field("download_dir", &self.download_dir)
            .field("active", &lock_unpoisoned(&self.active).len())
            .finish()
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_NAME)
    }
}

impl UreqTransport {
    pub fn new(user_agent: &str) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .user_agent(user_agent)
            .build()
            .new_agent();
        Self::with_agent(agent)
    }

    pub fn with_agent(agent: ureq::Agent) -> Self {
        Self {
            agent,
            download_dir: None,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Streams response bodies into files under `dir` instead of data events.
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    fn is_active(&self, handle: OperationHandle) -> bool {
        lock_unpoisoned(&self.active).contains(&handle)
    }

    fn retire(&self, handle: OperationHandle) -> bool {
        lock_unpoisoned(&self.active).remove(&handle)
    }

    fn run_exchange(
        &self,
        handle: OperationHandle,
        request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    ) {
        let timeout_value = request.timeout();
        let request = request.into_http().map(|body| body.to_vec());
        let configured_request = self
            .agent
            .configure_request(request)
            .timeout_global(Some(timeout_value))
            .build();

        let mut response = match self.agent.run(configured_request) {
            Ok(response) => response,
            Err(source) => {
                if self.retire(handle) {
                    events.on_exchange_complete(handle, None, Some(transport_error(source)));
                }
                return;
            }
        };

        let metadata = ResponseMetadata::new(response.status(), response.headers().clone())
            .with_version(response.version());
        let mut reader = response.body_mut().as_reader();
        let read_result = match &self.download_dir {
            Some(dir) => self.read_to_file(handle, &mut reader, dir, events.as_ref()),
            None => self.read_chunks(handle, &mut reader, events.as_ref()),
        };

        if self.retire(handle) {
            events.on_exchange_complete(handle, Some(metadata), read_result.err());
        } else {
            debug!(%handle, "exchange cancelled while reading body");
        }
    }

    fn read_chunks(
        &self,
        handle: OperationHandle,
        reader: &mut impl Read,
        events: &dyn TransportEvents,
    ) -> Result<(), TransportError> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if !self.is_active(handle) {
                return Ok(());
            }
            let read = reader.read(&mut chunk).map_err(read_error)?;
            if read == 0 {
                return Ok(());
            }
            events.on_data_chunk(handle, Bytes::copy_from_slice(&chunk[..read]));
        }
    }

    fn read_to_file(
        &self,
        handle: OperationHandle,
        reader: &mut impl Read,
        dir: &std::path::Path,
        events: &dyn TransportEvents,
    ) -> Result<(), TransportError> {
        let location = dir.join(format!("{handle}.body"));
        let mut file = File::create(&location)
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if !self.is_active(handle) {
                return Ok(());
            }
            let read = reader.read(&mut chunk).map_err(read_error)?;
            if read == 0 {
                break;
            }
            file.write_all(&chunk[..read])
                .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        }
        file.flush()
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        events.on_file_complete(handle, location);
        Ok(())
    }
}

impl Transport for UreqTransport {
    fn start(
        &self,
        handle: OperationHandle,
        request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    ) {
        lock_unpoisoned(&self.active).insert(handle);
        let transport = self.clone();
        thread::spawn(move || transport.run_exchange(handle, request, events));
    }

    /// The blocking call cannot be interrupted; its events are suppressed instead.
    fn cancel(&self, handle: OperationHandle) {
        self.retire(handle);
    }
}

fn transport_error(source: ureq::Error) -> TransportError {
    let kind = classify_ureq_transport_error(&source);
    TransportError::new(kind, source)
}

fn read_error(source: std::io::Error) -> TransportError {
    let kind = match wrapped_ureq_error(&source) {
        Some(ureq::Error::Timeout(_)) => TransportErrorKind::Timeout,
        Some(error) => classify_ureq_transport_error(error),
        None => TransportErrorKind::Read,
    };
    TransportError::new(kind, source)
}

fn wrapped_ureq_error(io_error: &std::io::Error) -> Option<&ureq::Error> {
    io_error
        .get_ref()
        .and_then(|source| source.downcast_ref::<ureq::Error>())
}

pub(crate) fn classify_ureq_transport_error(error: &ureq::Error) -> TransportErrorKind {
    match error {
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ureq::Error::Tls(_) => TransportErrorKind::Tls,
        ureq::Error::ConnectProxyFailed(_) | ureq::Error::ConnectionFailed => {
            TransportErrorKind::Connect
        }
        ureq::Error::Io(source) => match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Read
            }
            std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => TransportErrorKind::Read,
            _ => TransportErrorKind::Other,
        },
        _ => TransportErrorKind::Other,
    }
}
