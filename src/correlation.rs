//! Handle → request association for in-flight exchanges.
//!
//! Transport callbacks for different handles arrive concurrently; every read and
//! write goes through one mutex so data, file and completion events for a handle
//! are observed in a single order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::request::Request;
use crate::response::Payload;
use crate::transport::OperationHandle;
use crate::util::lock_unpoisoned;

enum Accumulated {
    Buffer(BytesMut),
    File(PathBuf),
}

impl Accumulated {
    fn to_payload(&self) -> Payload {
        match self {
            Self::Buffer(buffer) => Payload::Data(Bytes::copy_from_slice(buffer)),
            Self::File(location) => Payload::File(location.clone()),
        }
    }

    fn into_payload(self) -> Payload {
        match self {
            Self::Buffer(buffer) => Payload::Data(buffer.freeze()),
            Self::File(location) => Payload::File(location),
        }
    }
}

struct Entry {
    request: Request,
    payload: Option<Accumulated>,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<OperationHandle, Entry>>,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CorrelationTable")
            .field("len", &self.len())
            .finish()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous entry for `handle`.
    pub fn bind(&self, handle: OperationHandle, request: Request) {
        lock_unpoisoned(&self.entries).insert(
            handle,
            Entry {
                request,
                payload: None,
            },
        );
    }

    /// Extends the buffered payload. Ignored for unknown handles and file payloads.
    pub fn append_data(&self, handle: OperationHandle, chunk: &[u8]) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let Some(entry) = entries.get_mut(&handle) else {
            debug!(%handle, "ignoring data for unbound exchange");
            return false;
        };
        match &mut entry.payload {
            None => {
                entry.payload = Some(Accumulated::Buffer(BytesMut::from(chunk)));
                true
            }
            Some(Accumulated::Buffer(buffer)) => {
                buffer.extend_from_slice(chunk);
                true
            }
            Some(Accumulated::File(_)) => {
                debug!(%handle, "ignoring data for exchange already completed to a file");
                false
            }
        }
    }

    /// Switches the payload to a file location, discarding any buffered bytes.
    pub fn set_file(&self, handle: OperationHandle, location: PathBuf) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let Some(entry) = entries.get_mut(&handle) else {
            debug!(%handle, "ignoring file for unbound exchange");
            return false;
        };
        entry.payload = Some(Accumulated::File(location));
        true
    }

    /// Snapshot of the request and payload bound to `handle`; both absent once unbound.
    pub fn lookup(&self, handle: OperationHandle) -> (Option<Request>, Option<Payload>) {
        let entries = lock_unpoisoned(&self.entries);
        match entries.get(&handle) {
            Some(entry) => (
                Some(entry.request.clone()),
                entry.payload.as_ref().map(Accumulated::to_payload),
            ),
            None => (None, None),
        }
    }

    /// Removes request and payload together. Idempotent.
    pub fn unbind(&self, handle: OperationHandle) -> Option<(Request, Option<Payload>)> {
        lock_unpoisoned(&self.entries)
            .remove(&handle)
            .map(|entry| (entry.request, entry.payload.map(Accumulated::into_payload)))
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<OperationHandle> {
        let mut handles: Vec<_> = lock_unpoisoned(&self.entries).keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn requests(&self) -> Vec<Request> {
        lock_unpoisoned(&self.entries)
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }
}
