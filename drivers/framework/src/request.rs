//! # Framework Requests
//!
//! A [`Request`] wraps exactly one [`Irp`] and has exactly one owner at a
//! time. Ownership moves between dispatch, a queue and the driver by moving
//! the value; the [`RequestOwner`] tag records who holds it for diagnostics.
//!
//! Forward-progress queues keep a [`ReservedRequestPool`] of request shells
//! reserved up front. When ordinary allocation fails the message borrows a
//! shell, or parks until one is returned.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::error::Status;
use crate::irp::{Irp, RequestType};
use crate::queue::IoQueue;

/// Progress of a request through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestCompletionState {
    #[default]
    None,
    /// Handed to the in-caller handler
    Pipeline,
    /// Completed
    Consumed,
}

/// Current holder of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestOwner {
    #[default]
    Dispatch,
    Queue,
    Driver,
}

/// Framework request wrapping one message
pub struct Request {
    irp: Option<Irp>,
    reserved_for: Option<Weak<IoQueue>>,
    completion_state: RequestCompletionState,
    owner: RequestOwner,
    context: Option<Weak<IoQueue>>,
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("irp", &self.irp)
            .field("reserved", &self.is_reserved())
            .field("completion_state", &self.completion_state)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Request {
    /// Ordinary (allocated) request
    pub fn new(irp: Irp) -> Self {
        Self {
            irp: Some(irp),
            reserved_for: None,
            completion_state: RequestCompletionState::None,
            owner: RequestOwner::Dispatch,
            context: None,
        }
    }

    /// Request built on a shell reserved by `queue`
    pub(crate) fn reserved(irp: Irp, queue: Weak<IoQueue>) -> Self {
        Self {
            irp: Some(irp),
            reserved_for: Some(queue),
            completion_state: RequestCompletionState::None,
            owner: RequestOwner::Dispatch,
            context: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_for.is_some()
    }

    pub fn irp(&self) -> Option<&Irp> {
        self.irp.as_ref()
    }

    pub fn irp_mut(&mut self) -> Option<&mut Irp> {
        self.irp.as_mut()
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.irp.as_ref().map(Irp::major)
    }

    pub fn completion_state(&self) -> RequestCompletionState {
        self.completion_state
    }

    pub fn set_completion_state(&mut self, state: RequestCompletionState) {
        self.completion_state = state;
    }

    pub fn owner(&self) -> RequestOwner {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: RequestOwner) {
        self.owner = owner;
    }

    /// Queue recorded as the request's destination
    pub fn context(&self) -> Option<Arc<IoQueue>> {
        self.context.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_context(&mut self, queue: Weak<IoQueue>) {
        self.context = Some(queue);
    }

    /// Complete with zero information
    pub fn complete(self, status: Status) {
        self.complete_with_information(status, 0);
    }

    /// Complete and report `information` bytes
    pub fn complete_with_information(mut self, status: Status, information: usize) {
        self.completion_state = RequestCompletionState::Consumed;
        if let Some(irp) = self.irp.take() {
            irp.complete(status, information);
        }
    }

    /// Give up the wrapper and keep the message (forwarding)
    pub fn into_irp(mut self) -> Option<Irp> {
        self.completion_state = RequestCompletionState::Consumed;
        self.irp.take()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(irp) = self.irp.take() {
            log::error!("Request: {} dropped without completion", irp.id());
            irp.complete(Status::Cancelled, 0);
        }

        if let Some(queue) = self.reserved_for.take().and_then(|weak| weak.upgrade()) {
            queue.return_reserved_request();
        }
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// Wraps incoming messages into requests
pub trait RequestAllocator: Send + Sync {
    /// Hands the message back on failure
    fn allocate(&self, irp: Irp) -> Result<Request, Irp>;
}

/// Allocator that always succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl RequestAllocator for DefaultAllocator {
    fn allocate(&self, irp: Irp) -> Result<Request, Irp> {
        Ok(Request::new(irp))
    }
}

/// Allocator that fails after a fixed number of allocations
#[derive(Debug)]
pub struct LimitedAllocator {
    remaining: core::sync::atomic::AtomicUsize,
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: core::sync::atomic::AtomicUsize::new(limit),
        }
    }
}

impl RequestAllocator for LimitedAllocator {
    fn allocate(&self, irp: Irp) -> Result<Request, Irp> {
        use core::sync::atomic::Ordering;

        let taken = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Ok(Request::new(irp)),
            Err(_) => Err(irp),
        }
    }
}

// =============================================================================
// RESERVED REQUEST POOL
// =============================================================================

/// Outcome of asking a forward-progress queue for a reserved request
#[derive(Debug)]
pub enum Reservation {
    /// A reserved shell was available
    Ready(Request),
    /// All shells are in use; the message waits for one to come back
    Parked,
    /// The queue cannot take the message
    Unavailable(Irp),
}

#[derive(Debug, Default)]
struct PoolState {
    available: usize,
    parked: VecDeque<Irp>,
}

/// Shells reserved for a forward-progress queue
#[derive(Debug)]
pub struct ReservedRequestPool {
    capacity: usize,
    state: spin::Mutex<PoolState>,
}

impl ReservedRequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: spin::Mutex::new(PoolState {
                available: capacity,
                parked: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    pub fn parked(&self) -> usize {
        self.state.lock().parked.len()
    }

    /// Take a shell, or park the message when none is free
    pub(crate) fn take_or_park(&self, irp: Irp) -> Option<Irp> {
        let mut state = self.state.lock();
        if state.available > 0 {
            state.available -= 1;
            Some(irp)
        } else {
            state.parked.push_back(irp);
            None
        }
    }

    /// Return a shell; the oldest parked message takes it over directly
    pub(crate) fn give_back(&self) -> Option<Irp> {
        let mut state = self.state.lock();
        match state.parked.pop_front() {
            Some(irp) => Some(irp),
            None => {
                state.available = (state.available + 1).min(self.capacity);
                None
            },
        }
    }

    /// Drop every parked message, handing them back to the caller
    pub(crate) fn drain_parked(&self) -> Vec<Irp> {
        self.state.lock().parked.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn test_limited_allocator() {
        let allocator = LimitedAllocator::new(2);
        assert!(allocator.allocate(Irp::new(RequestType::Read)).is_ok());
        assert!(allocator.allocate(Irp::new(RequestType::Read)).is_ok());
        let irp = allocator.allocate(Irp::new(RequestType::Read)).unwrap_err();
        assert_eq!(irp.major(), RequestType::Read);
    }

    #[test]
    fn test_complete_consumes_once() {
        let sink = RecordingSink::new();
        let request = Request::new(Irp::new(RequestType::Write).with_sink(sink.clone()));
        request.complete_with_information(Status::Success, 8);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].information, 8);
    }

    #[test]
    fn test_dropped_request_is_cancelled() {
        let sink = RecordingSink::new();
        drop(Request::new(Irp::new(RequestType::Read).with_sink(sink.clone())));
        assert_eq!(sink.statuses(), vec![Status::Cancelled]);
    }

    #[test]
    fn test_pool_parks_when_exhausted() {
        let pool = ReservedRequestPool::new(1);
        assert!(pool.take_or_park(Irp::new(RequestType::Read)).is_some());
        assert!(pool.take_or_park(Irp::new(RequestType::Read)).is_none());
        assert_eq!(pool.parked(), 1);

        // The returned shell goes straight to the parked message
        assert!(pool.give_back().is_some());
        assert_eq!(pool.available(), 0);
        assert!(pool.give_back().is_none());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_parked_message_answered_when_pool_goes_away() {
        let sink = RecordingSink::new();
        let pool = ReservedRequestPool::new(1);
        assert!(pool.take_or_park(Irp::new(RequestType::Read)).is_some());
        assert!(pool
            .take_or_park(Irp::new(RequestType::Read).with_sink(sink.clone()))
            .is_none());

        drop(pool);
        assert_eq!(sink.statuses(), vec![Status::Cancelled]);
    }
}
