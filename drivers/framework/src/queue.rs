//! # I/O Queues
//!
//! Admission side of a queue: accept/reject gating, power gating for
//! power-managed queues, and delivery to the per-type handlers. A queue
//! without a handler for a type keeps those requests until the driver
//! retrieves them.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::device::DeviceId;
use crate::error::Status;
use crate::irp::{Irp, OwnerTag, RequestType};
use crate::request::{Request, RequestOwner, Reservation, ReservedRequestPool};

/// Driver callback receiving requests of one type
pub type RequestHandler = Arc<dyn Fn(Request) + Send + Sync>;

/// Per-type request handlers
#[derive(Clone, Default)]
pub struct IoHandlers {
    pub read: Option<RequestHandler>,
    pub write: Option<RequestHandler>,
    pub device_control: Option<RequestHandler>,
    pub internal_device_control: Option<RequestHandler>,
    /// Receives every type without a specific handler
    pub default: Option<RequestHandler>,
}

impl fmt::Debug for IoHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandlers")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("device_control", &self.device_control.is_some())
            .field("internal_device_control", &self.internal_device_control.is_some())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl IoHandlers {
    fn specific(&self, ty: RequestType) -> Option<&RequestHandler> {
        match ty {
            RequestType::Read => self.read.as_ref(),
            RequestType::Write => self.write.as_ref(),
            RequestType::DeviceControl => self.device_control.as_ref(),
            RequestType::InternalDeviceControl => self.internal_device_control.as_ref(),
            _ => None,
        }
    }

    /// No handler of any kind
    pub fn is_empty(&self) -> bool {
        self.read.is_none()
            && self.write.is_none()
            && self.device_control.is_none()
            && self.internal_device_control.is_none()
            && self.default.is_none()
    }

    /// Handler that receives `ty`
    pub fn for_type(&self, ty: RequestType) -> Option<&RequestHandler> {
        self.specific(ty).or(self.default.as_ref())
    }
}

/// Power state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePowerState {
    #[default]
    On,
    Off,
}

/// Object a queue was created under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentObject {
    ancestor: Option<DeviceId>,
}

impl ParentObject {
    /// Parented (directly or indirectly) to `device`
    pub const fn device(device: DeviceId) -> Self {
        Self {
            ancestor: Some(device),
        }
    }

    /// Parent with no device ancestor
    pub const fn detached() -> Self {
        Self { ancestor: None }
    }

    pub fn ancestor(&self) -> Option<DeviceId> {
        self.ancestor
    }
}

/// Queue creation parameters
#[derive(Debug, Clone)]
pub struct IoQueueConfig {
    name: String,
    layer: i8,
    handlers: IoHandlers,
    power_managed: bool,
    default_queue: bool,
    forward_progress: usize,
    parent: Option<ParentObject>,
}

impl IoQueueConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            layer: 0,
            handlers: IoHandlers::default(),
            power_managed: true,
            default_queue: false,
            forward_progress: 0,
            parent: None,
        }
    }

    /// Ownership layer; higher layers sit earlier in the directory
    pub fn with_layer(mut self, layer: i8) -> Self {
        self.layer = layer;
        self
    }

    pub fn on_read<F: Fn(Request) + Send + Sync + 'static>(mut self, handler: F) -> Self {
        self.handlers.read = Some(Arc::new(handler));
        self
    }

    pub fn on_write<F: Fn(Request) + Send + Sync + 'static>(mut self, handler: F) -> Self {
        self.handlers.write = Some(Arc::new(handler));
        self
    }

    pub fn on_device_control<F: Fn(Request) + Send + Sync + 'static>(mut self, handler: F) -> Self {
        self.handlers.device_control = Some(Arc::new(handler));
        self
    }

    pub fn on_internal_device_control<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        self.handlers.internal_device_control = Some(Arc::new(handler));
        self
    }

    pub fn on_default<F: Fn(Request) + Send + Sync + 'static>(mut self, handler: F) -> Self {
        self.handlers.default = Some(Arc::new(handler));
        self
    }

    pub fn with_power_managed(mut self, power_managed: bool) -> Self {
        self.power_managed = power_managed;
        self
    }

    /// Register as the device's default queue
    pub fn as_default(mut self) -> Self {
        self.default_queue = true;
        self
    }

    /// Reserve `count` request shells for forward progress
    pub fn with_forward_progress(mut self, count: usize) -> Self {
        self.forward_progress = count;
        self
    }

    pub fn with_parent(mut self, parent: ParentObject) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn is_default(&self) -> bool {
        self.default_queue
    }
}

/// Queue identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct QueueState {
    power: QueuePowerState,
    accepting: bool,
    shutting_down: bool,
    held: VecDeque<Request>,
}

/// I/O queue
pub struct IoQueue {
    id: QueueId,
    name: String,
    device: DeviceId,
    parent: ParentObject,
    layer: i8,
    handlers: IoHandlers,
    power_managed: bool,
    reserved: Option<ReservedRequestPool>,
    is_default: AtomicBool,
    no_delete: AtomicBool,
    state: spin::Mutex<QueueState>,
    this: Weak<IoQueue>,
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("layer", &self.layer)
            .field("default", &self.is_default())
            .finish()
    }
}

impl IoQueue {
    /// Build a queue owned by `device`
    pub(crate) fn create(config: IoQueueConfig, device: DeviceId) -> Arc<Self> {
        let reserved = (config.forward_progress > 0)
            .then(|| ReservedRequestPool::new(config.forward_progress));

        Arc::new_cyclic(|this| Self {
            id: QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)),
            name: config.name,
            device,
            parent: config.parent.unwrap_or(ParentObject::device(device)),
            layer: config.layer,
            handlers: config.handlers,
            power_managed: config.power_managed,
            reserved,
            is_default: AtomicBool::new(false),
            no_delete: AtomicBool::new(false),
            state: spin::Mutex::new(QueueState {
                accepting: true,
                ..QueueState::default()
            }),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn parent(&self) -> ParentObject {
        self.parent
    }

    pub fn layer(&self) -> i8 {
        self.layer
    }

    pub fn is_power_managed(&self) -> bool {
        self.power_managed
    }

    pub fn is_default(&self) -> bool {
        self.is_default.load(Ordering::Acquire)
    }

    /// Default queues cannot be removed by the driver
    pub fn is_no_delete(&self) -> bool {
        self.no_delete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_default(&self) {
        self.is_default.store(true, Ordering::Release);
        self.no_delete.store(true, Ordering::Release);
    }

    pub fn has_forward_progress(&self) -> bool {
        self.reserved.is_some()
    }

    pub fn reserved_pool(&self) -> Option<&ReservedRequestPool> {
        self.reserved.as_ref()
    }

    pub fn power_state(&self) -> QueuePowerState {
        self.state.lock().power
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Requests waiting in the queue
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Queue has no handlers at all; the driver pulls requests itself
    pub fn is_manual(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The queue can hand `ty` to the driver
    ///
    /// Manual queues always can. Dispatching queues can for read, write and
    /// control types only with a specific or default handler.
    pub fn is_io_event_handler_registered(&self, ty: RequestType) -> bool {
        if self.is_manual() || !ty.is_interceptable() {
            return true;
        }
        self.handlers.for_type(ty).is_some()
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit a request: reject, hold, or deliver to the driver
    pub fn queue_request(&self, mut request: Request) -> Status {
        request.set_context(self.this.clone());
        if let Some(irp) = request.irp_mut() {
            irp.mark_pending();
        }

        let handler = request
            .request_type()
            .and_then(|ty| self.handlers.for_type(ty))
            .cloned();

        {
            let mut state = self.state.lock();
            if !state.accepting {
                drop(state);
                log::error!("IoQueue: {} not accepting, request failed", self.name);
                request.complete(Status::InvalidDeviceState);
                return Status::InvalidDeviceState;
            }

            let gated = self.power_managed && state.power == QueuePowerState::Off;
            if gated || handler.is_none() {
                request.set_owner(RequestOwner::Queue);
                state.held.push_back(request);
                return Status::Pending;
            }
        }

        if let Some(handler) = handler {
            request.set_owner(RequestOwner::Driver);
            handler(request);
        }
        Status::Pending
    }

    /// Next held request for manual processing
    pub fn retrieve_next_request(&self) -> Option<Request> {
        let mut state = self.state.lock();
        if self.power_managed && state.power == QueuePowerState::Off {
            return None;
        }

        let mut request = state.held.pop_front()?;
        request.set_owner(RequestOwner::Driver);
        Some(request)
    }

    /// Set the power state; powering on delivers held requests with a handler
    pub fn set_power_state(&self, power: QueuePowerState) {
        let ready = {
            let mut state = self.state.lock();
            state.power = power;
            if power == QueuePowerState::Off || !self.power_managed {
                return;
            }

            let mut ready = Vec::new();
            for request in core::mem::take(&mut state.held) {
                let handler = request
                    .request_type()
                    .and_then(|ty| self.handlers.for_type(ty))
                    .cloned();
                match handler {
                    Some(handler) => ready.push((handler, request)),
                    None => state.held.push_back(request),
                }
            }
            ready
        };

        for (handler, mut request) in ready {
            request.set_owner(RequestOwner::Driver);
            handler(request);
        }
    }

    /// Apply the directory's state to a newly registered queue
    pub(crate) fn initialize_power(&self, power: QueuePowerState, shutting_down: bool) {
        let mut state = self.state.lock();
        state.power = power;
        if shutting_down {
            state.shutting_down = true;
            state.accepting = false;
        }
    }

    /// Stop accepting for system shutdown
    pub fn set_state_for_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.accepting = false;
    }

    /// Accept again after a restart
    pub fn reset_for_restart(&self) {
        let mut state = self.state.lock();
        state.shutting_down = false;
        state.accepting = true;
    }

    /// Stop accepting and cancel every waiting request
    pub fn purge(&self) -> usize {
        let held: Vec<Request> = {
            let mut state = self.state.lock();
            state.accepting = false;
            state.held.drain(..).collect()
        };
        let parked = self
            .reserved
            .as_ref()
            .map(ReservedRequestPool::drain_parked)
            .unwrap_or_default();

        let count = held.len() + parked.len();
        for request in held {
            request.complete(Status::Cancelled);
        }
        for irp in parked {
            irp.complete(Status::Cancelled, 0);
        }

        if count > 0 {
            log::debug!("IoQueue: {} purged {} requests", self.name, count);
        }
        count
    }

    /// Cancel the held requests issued on `tag`
    pub fn flush_by_owner(&self, tag: OwnerTag) -> usize {
        let flushed: Vec<Request> = {
            let mut state = self.state.lock();
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = core::mem::take(&mut state.held)
                .into_iter()
                .partition(|request| request.irp().and_then(Irp::owner) == Some(tag));
            state.held = rest;
            matching.into_iter().collect()
        };

        let count = flushed.len();
        for request in flushed {
            request.complete(Status::Cancelled);
        }
        count
    }

    // -------------------------------------------------------------------------
    // Forward progress
    // -------------------------------------------------------------------------

    /// Wrap `irp` in a reserved shell after ordinary allocation failed
    pub fn get_reserved_request(&self, mut irp: Irp) -> Reservation {
        let Some(pool) = self.reserved.as_ref() else {
            return Reservation::Unavailable(irp);
        };
        if !self.is_accepting() {
            return Reservation::Unavailable(irp);
        }

        irp.mark_pending();
        match pool.take_or_park(irp) {
            Some(irp) => Reservation::Ready(Request::reserved(irp, self.this.clone())),
            None => {
                log::debug!("IoQueue: {} reserve exhausted, message parked", self.name);
                Reservation::Parked
            },
        }
    }

    /// A reserved shell came back; a parked message takes it over
    pub(crate) fn return_reserved_request(&self) {
        let Some(pool) = self.reserved.as_ref() else {
            return;
        };

        if let Some(irp) = pool.give_back() {
            self.queue_request(Request::reserved(irp, self.this.clone()));
        }
    }
}
