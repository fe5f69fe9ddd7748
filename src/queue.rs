//! Dependency-ordered execution.
//!
//! Operations wait here instead of going straight to the transport. An operation
//! becomes ready once every operation it depends on has finished; ready operations
//! leave in FIFO order while fewer than `max_concurrent` are running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::error::DependencyError;
use crate::request::{PreparedRequest, Request};
use crate::transport::OperationHandle;
use crate::util::lock_unpoisoned;

/// One exchange waiting for, or holding, a concurrency slot.
#[derive(Debug)]
pub struct QueuedOperation {
    handle: OperationHandle,
    request: Request,
    prepared: PreparedRequest,
}

impl QueuedOperation {
    pub(crate) fn new(
        handle: OperationHandle,
        request: Request,
        prepared: PreparedRequest,
    ) -> Self {
        Self {
            handle,
            request,
            prepared,
        }
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn into_parts(self) -> (OperationHandle, Request, PreparedRequest) {
        (self.handle, self.request, self.prepared)
    }
}

enum SlotState {
    Pending(PreparedRequest),
    Running,
}

struct Slot {
    request: Request,
    state: SlotState,
    dependencies: Vec<OperationHandle>,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<OperationHandle>,
    slots: HashMap<OperationHandle, Slot>,
    // exchanges running outside the queue that pending operations wait for
    gates: HashSet<OperationHandle>,
    running: usize,
    pumping: bool,
}

impl QueueState {
    fn insert(&mut self, operation: QueuedOperation, dependencies: Vec<OperationHandle>) {
        let (handle, request, prepared) = operation.into_parts();
        self.order.push_back(handle);
        self.slots.insert(
            handle,
            Slot {
                request,
                state: SlotState::Pending(prepared),
                dependencies,
            },
        );
    }

    fn check_link(
        &self,
        dependent: &Request,
        target: OperationHandle,
    ) -> Result<(), DependencyError> {
        let Some(slot) = self.slots.get(&target) else {
            return Ok(());
        };
        if slot.request.same_as(dependent) {
            return Err(DependencyError::SelfDependency {
                request: dependent.id(),
            });
        }

        let mut visited = HashSet::new();
        let mut pending = slot.dependencies.clone();
        while let Some(handle) = pending.pop() {
            if !visited.insert(handle) {
                continue;
            }
            let Some(slot) = self.slots.get(&handle) else {
                continue;
            };
            if slot.request.same_as(dependent) {
                return Err(DependencyError::Cycle {
                    request: dependent.id(),
                });
            }
            pending.extend(slot.dependencies.iter().copied());
        }
        Ok(())
    }

    fn take_ready(&mut self, max_concurrent: usize) -> Vec<QueuedOperation> {
        let mut ready = Vec::new();
        let mut index = 0;
        while self.running < max_concurrent && index < self.order.len() {
            let handle = self.order[index];
            let is_ready = self.slots.get(&handle).is_some_and(|slot| {
                matches!(slot.state, SlotState::Pending(_))
                    && slot
                        .dependencies
                        .iter()
                        .all(|dependency| {
                            !self.slots.contains_key(dependency) && !self.gates.contains(dependency)
                        })
            });
            if !is_ready {
                index += 1;
                continue;
            }

            self.order.remove(index);
            if let Some(slot) = self.slots.get_mut(&handle)
                && let SlotState::Pending(prepared) =
                    std::mem::replace(&mut slot.state, SlotState::Running)
            {
                self.running += 1;
                ready.push(QueuedOperation::new(handle, slot.request.clone(), prepared));
            }
        }
        ready
    }

    fn remove(&mut self, handle: OperationHandle) -> Option<Slot> {
        let slot = self.slots.remove(&handle)?;
        match slot.state {
            SlotState::Running => self.running = self.running.saturating_sub(1),
            SlotState::Pending(_) => self.order.retain(|queued| *queued != handle),
        }
        Some(slot)
    }
}

pub struct DependencyQueue {
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for DependencyQueue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DependencyQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("len", &self.len())
            .field("running", &self.running())
            .finish()
    }
}

impl Default for DependencyQueue {
    fn default() -> Self {
        Self::serial()
    }
}

impl DependencyQueue {
    /// `max_concurrent` is clamped to at least one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn serial() -> Self {
        Self::new(1)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Pending plus running operations.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running(&self) -> usize {
        lock_unpoisoned(&self.state).running
    }

    pub fn push(&self, operation: QueuedOperation) {
        lock_unpoisoned(&self.state).insert(operation, Vec::new());
    }

    /// Queues `alt` and `dependent`; `dependent` stays pending until `alt` finishes.
    pub fn add_with_dependency(
        &self,
        dependent: QueuedOperation,
        alt: QueuedOperation,
    ) -> Result<(), DependencyError> {
        if alt.request.same_as(&dependent.request) {
            return Err(DependencyError::SelfDependency {
                request: dependent.request.id(),
            });
        }
        let mut state = lock_unpoisoned(&self.state);
        let alt_handle = alt.handle;
        state.insert(alt, Vec::new());
        state.insert(dependent, vec![alt_handle]);
        Ok(())
    }

    /// Queues `dependent` behind the existing operation `on`. The link is dropped
    /// when `on` has already finished.
    pub fn add_dependent(
        &self,
        dependent: QueuedOperation,
        on: OperationHandle,
    ) -> Result<(), DependencyError> {
        let mut state = lock_unpoisoned(&self.state);
        state.check_link(&dependent.request, on)?;
        let dependencies = if state.slots.contains_key(&on) {
            vec![on]
        } else {
            debug!(handle = %on, "dependency already finished; queueing without link");
            Vec::new()
        };
        state.insert(dependent, dependencies);
        Ok(())
    }

    /// Queues `dependent` behind `gate`, an exchange the queue does not run. It
    /// stays pending until [`DependencyQueue::release`] is called for `gate`.
    pub fn add_gated(&self, dependent: QueuedOperation, gate: OperationHandle) {
        let mut state = lock_unpoisoned(&self.state);
        state.gates.insert(gate);
        state.insert(dependent, vec![gate]);
    }

    pub fn release(&self, gate: OperationHandle) {
        let mut state = lock_unpoisoned(&self.state);
        state.gates.remove(&gate);
        for slot in state.slots.values_mut() {
            slot.dependencies.retain(|dependency| *dependency != gate);
        }
    }

    /// Latest pending or running operation for `request`.
    pub fn operation_for(&self, request: &Request) -> Option<OperationHandle> {
        let state = lock_unpoisoned(&self.state);
        state
            .slots
            .iter()
            .filter(|(_, slot)| slot.request.same_as(request))
            .map(|(handle, _)| *handle)
            .max()
    }

    /// Releases a running operation. Operations that depended on it move onto
    /// `successor` when the same request was queued again.
    pub fn finish(&self, handle: OperationHandle, successor: Option<OperationHandle>) {
        let mut state = lock_unpoisoned(&self.state);
        if state.remove(handle).is_none() {
            return;
        }
        let successor = successor.filter(|successor| state.slots.contains_key(successor));
        for (slot_handle, slot) in state.slots.iter_mut() {
            for dependency in slot.dependencies.iter_mut() {
                if *dependency == handle {
                    match successor {
                        Some(successor) if successor != *slot_handle => *dependency = successor,
                        _ => {}
                    }
                }
            }
            slot.dependencies.retain(|dependency| *dependency != handle);
        }
    }

    /// Drops a pending or running operation; its dependents are released.
    pub fn cancel(&self, handle: OperationHandle) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.remove(handle).is_none() {
            return false;
        }
        for slot in state.slots.values_mut() {
            slot.dependencies.retain(|dependency| *dependency != handle);
        }
        true
    }

    /// Claims the pump. Empty when another pump is active or nothing is ready.
    pub(crate) fn begin_pump(&self) -> Vec<QueuedOperation> {
        let mut state = lock_unpoisoned(&self.state);
        if state.pumping {
            return Vec::new();
        }
        let ready = state.take_ready(self.max_concurrent);
        state.pumping = !ready.is_empty();
        ready
    }

    /// Next batch for the active pump; releases the pump when nothing is ready.
    pub(crate) fn continue_pump(&self) -> Vec<QueuedOperation> {
        let mut state = lock_unpoisoned(&self.state);
        let ready = state.take_ready(self.max_concurrent);
        if ready.is_empty() {
            state.pumping = false;
        }
        ready
    }
}
