//! The contract between the lifecycle engine and whatever moves bytes.
//!
//! A [`Transport`] performs one network exchange per [`Transport::start`] call and
//! reports progress through the [`TransportEvents`] it was handed. Events may arrive
//! on any thread, for many handles at once.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::request::PreparedRequest;
use crate::response::ResponseMetadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationHandle(u64);

impl OperationHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "op-{}", self.0)
    }
}

pub trait Transport: Send + Sync {
    /// Starts the exchange. The handle is already registered with the engine, so
    /// events may be emitted before this call returns.
    fn start(
        &self,
        handle: OperationHandle,
        request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    );

    /// Best-effort abort. Events emitted after cancellation are ignored by the engine.
    fn cancel(&self, _handle: OperationHandle) {}
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn start(
        &self,
        handle: OperationHandle,
        request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    ) {
        (**self).start(handle, request, events);
    }

    fn cancel(&self, handle: OperationHandle) {
        (**self).cancel(handle);
    }
}

pub trait TransportEvents: Send + Sync {
    fn on_data_chunk(&self, handle: OperationHandle, chunk: Bytes);

    fn on_file_complete(&self, handle: OperationHandle, location: PathBuf);

    /// Exactly one per started exchange; `response` is absent when the exchange
    /// failed before any response head arrived.
    fn on_exchange_complete(
        &self,
        handle: OperationHandle,
        response: Option<ResponseMetadata>,
        error: Option<TransportError>,
    );
}
