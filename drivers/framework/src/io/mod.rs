//! # Request Dispatch and Queue Directory
//!
//! [`IoPackage`] owns a device's queues and decides where every incoming
//! message goes:
//!
//! ```text
//!  Irp ──▶ interceptors ──▶ dispatch table ──┬─▶ in-caller handler
//!            (R/W/IOCTL)       (by type)      ├─▶ queue admission
//!                                            ├─▶ forward (filter)
//!                                            └─▶ complete (failure)
//! ```
//!
//! The directory lock guards the queue list and the dispatch table only.
//! Queue and request logic always runs after it is released.

pub mod interceptor;
pub mod queue_list;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::DeviceId;
use crate::error::{DfxResult, ErrorKind, Status};
use crate::irp::{Irp, LowerDevice, OwnerTag, RequestType};
use crate::irql::NormalContext;
use crate::queue::{IoQueue, IoQueueConfig, QueuePowerState, RequestHandler};
use crate::request::{
    DefaultAllocator, Request, RequestAllocator, RequestCompletionState, RequestOwner, Reservation,
};
use crate::verifier::{verifier_break, FaultInjector, FrameworkConfig};
use crate::{dfx_bail, dfx_error};

pub use interceptor::{InterceptResult, Interceptor, INTERCEPTABLE_TYPES};
pub use queue_list::{Bookmark, QueueList};

use interceptor::{ChainOutcome, InterceptorChains};

/// How queues are stopped when the device leaves D0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Keep waiting requests until power returns
    Hold,
    /// Stop accepting and cancel waiting requests
    Purge,
}

#[derive(Debug)]
struct Directory {
    queues: QueueList,
    table: [Option<Arc<IoQueue>>; RequestType::COUNT],
    default_queue: Option<Arc<IoQueue>>,
    power: QueuePowerState,
    shutting_down: bool,
}

/// Per-device request dispatcher and queue directory
pub struct IoPackage {
    device: DeviceId,
    config: FrameworkConfig,
    filter: AtomicBool,
    directory: spin::Mutex<Directory>,
    interceptors: InterceptorChains,
    in_caller: spin::RwLock<Option<RequestHandler>>,
    allocator: Arc<dyn RequestAllocator>,
    lower: Option<Arc<dyn LowerDevice>>,
    fault_injector: spin::Mutex<FaultInjector>,
}

impl core::fmt::Debug for IoPackage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoPackage")
            .field("device", &self.device)
            .field("filter", &self.is_filter())
            .field("queues", &self.directory.lock().queues.len())
            .finish()
    }
}

impl IoPackage {
    /// Empty directory; queues start powered off until the device reaches D0
    pub fn new(
        device: DeviceId,
        config: FrameworkConfig,
        allocator: Option<Arc<dyn RequestAllocator>>,
        lower: Option<Arc<dyn LowerDevice>>,
    ) -> Self {
        let injector = FaultInjector::new(config.forward_progress_test);
        Self {
            device,
            config,
            filter: AtomicBool::new(false),
            directory: spin::Mutex::new(Directory {
                queues: QueueList::new(),
                table: Default::default(),
                default_queue: None,
                power: QueuePowerState::Off,
                shutting_down: false,
            }),
            interceptors: InterceptorChains::default(),
            in_caller: spin::RwLock::new(None),
            allocator: allocator.unwrap_or_else(|| Arc::new(DefaultAllocator)),
            lower,
            fault_injector: spin::Mutex::new(injector),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn is_filter(&self) -> bool {
        self.filter.load(Ordering::Acquire)
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    /// Mark the device as a filter; only before a default queue exists
    pub fn set_filter(&self, filter: bool) -> DfxResult<()> {
        if self.directory.lock().default_queue.is_some() {
            log::error!("IoPackage: SetFilter must be called before creating a default queue");
            verifier_break(&self.config, "filter flag set after default queue creation");
            dfx_bail!(ErrorKind::InvalidState, "default queue already exists");
        }

        self.filter.store(filter, Ordering::Release);
        Ok(())
    }

    /// Create a queue and register it in the directory
    pub fn create_queue(&self, config: IoQueueConfig) -> DfxResult<Arc<IoQueue>> {
        let is_default = config.is_default();
        let queue = IoQueue::create(config, self.device);
        self.register_queue(&queue, is_default)?;
        Ok(queue)
    }

    /// Insert a queue into the directory, optionally as the default queue
    pub fn register_queue(&self, queue: &Arc<IoQueue>, is_default: bool) -> DfxResult<()> {
        match queue.parent().ancestor() {
            Some(ancestor) if ancestor == self.device => {},
            Some(ancestor) => dfx_bail!(
                ErrorKind::ForeignParent,
                "queue parent belongs to another device",
                "parent ancestor {:?}, device {:?}",
                ancestor,
                self.device
            ),
            None => dfx_bail!(
                ErrorKind::ForeignParent,
                "queue parent must have a device ancestor",
                "queue {}",
                queue.name()
            ),
        }

        let mut dir = self.directory.lock();
        if dir.queues.contains(queue.id()) {
            dfx_bail!(ErrorKind::InvalidState, "queue already registered", "{}", queue.name());
        }

        if is_default && dir.default_queue.is_some() {
            drop(dir);
            log::error!(
                "IoPackage: default queue already configured for device {:?}",
                self.device
            );
            verifier_break(&self.config, "second default queue");
            return Err(dfx_error!(
                ErrorKind::DefaultQueueAlreadyConfigured,
                "default queue already configured"
            ));
        }

        queue.initialize_power(dir.power, dir.shutting_down);
        dir.queues.insert_ordered(Arc::clone(queue));

        if is_default {
            for ty in RequestType::ALL.iter().filter(|ty| !ty.is_lifecycle()) {
                let slot = &mut dir.table[ty.index()];
                if slot.is_none() {
                    *slot = Some(Arc::clone(queue));
                }
            }
            dir.default_queue = Some(Arc::clone(queue));
            queue.mark_default();
        }

        log::debug!(
            "IoPackage: registered queue {} (layer {}, default {})",
            queue.name(),
            queue.layer(),
            is_default
        );
        Ok(())
    }

    /// Route one request type to `queue`
    pub fn configure_dispatching(&self, queue: &Arc<IoQueue>, ty: RequestType) -> DfxResult<()> {
        if ty.is_lifecycle() {
            dfx_bail!(
                ErrorKind::InvalidArgument,
                "lifecycle requests cannot be routed to a queue",
                "{}",
                ty
            );
        }

        let mut dir = self.directory.lock();
        if !dir.queues.contains(queue.id()) {
            dfx_bail!(ErrorKind::InvalidState, "queue is not registered", "{}", queue.name());
        }

        let occupied = dir.table[ty.index()]
            .as_ref()
            .map_or(false, |current| !current.is_default() && current.id() != queue.id());
        if occupied {
            dfx_bail!(ErrorKind::InvalidState, "request type already routed", "{}", ty);
        }

        dir.table[ty.index()] = Some(Arc::clone(queue));
        Ok(())
    }

    /// Unlink a queue; the default queue cannot be removed
    pub fn remove_queue(&self, queue: &Arc<IoQueue>) -> DfxResult<()> {
        if queue.is_no_delete() {
            dfx_bail!(ErrorKind::Immutable, "default queue cannot be removed", "{}", queue.name());
        }

        let mut dir = self.directory.lock();
        if dir.queues.remove(queue.id()).is_none() {
            dfx_bail!(ErrorKind::InvalidState, "queue is not registered", "{}", queue.name());
        }

        for slot in dir.table.iter_mut() {
            if slot.as_ref().map_or(false, |q| q.id() == queue.id()) {
                *slot = None;
            }
        }
        Ok(())
    }

    /// Add an interceptor for read, write or control requests
    pub fn register_interceptor(&self, ty: RequestType, interceptor: Arc<dyn Interceptor>) -> DfxResult<()> {
        self.interceptors.register(ty, interceptor)
    }

    /// Install the handler that sees requests on the caller's thread
    pub fn set_in_caller_context<F>(&self, handler: F)
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        *self.in_caller.write() = Some(Arc::new(handler));
    }

    pub fn default_queue(&self) -> Option<Arc<IoQueue>> {
        self.directory.lock().default_queue.clone()
    }

    /// Queue routed for `ty`
    pub fn queue_for(&self, ty: RequestType) -> Option<Arc<IoQueue>> {
        self.directory.lock().table[ty.index()].clone()
    }

    /// Queues in directory order
    pub fn queues(&self) -> Vec<Arc<IoQueue>> {
        self.directory.lock().queues.snapshot()
    }

    /// Queue names in directory order
    pub fn queue_order(&self) -> Vec<String> {
        self.queues()
            .iter()
            .map(|queue| String::from(queue.name()))
            .collect()
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Dispatch one message; every path ends in exactly one outcome
    pub fn dispatch(&self, irp: Irp) -> Status {
        let ty = irp.major();

        let irp = match self.interceptors.run(irp) {
            ChainOutcome::Unclaimed(irp) => irp,
            ChainOutcome::Handled(status) => return status,
            ChainOutcome::TypeChanged(irp) => {
                log::error!(
                    "IoPackage: interceptor changed request {} from {} to {}",
                    irp.id(),
                    ty,
                    irp.major()
                );
                irp.complete(Status::InvalidParameter, 0);
                verifier_break(&self.config, "interceptor changed the request type");
                return Status::InvalidParameter;
            },
        };

        let (queue, is_default_queue) = {
            let dir = self.directory.lock();
            let queue = dir.table[ty.index()].clone();
            let is_default = match (&queue, &dir.default_queue) {
                (Some(queue), Some(default)) => queue.id() == default.id(),
                _ => false,
            };
            (queue, is_default)
        };
        let in_caller = self.in_caller.read().clone();

        if queue.is_none() && in_caller.is_none() {
            if self.is_filter() {
                return self.forward(irp);
            }

            log::error!(
                "IoPackage: no queue configured for {} on device {:?}, failing request {}",
                ty,
                self.device,
                irp.id()
            );
            return Self::fail(irp, Status::InvalidDeviceState);
        }

        if let Some(queue) = &queue {
            if self.is_filter()
                && in_caller.is_none()
                && is_default_queue
                && !queue.is_io_event_handler_registered(ty)
            {
                return self.forward(irp);
            }
        }

        self.dispatch_to_queue(irp, in_caller, queue)
    }

    fn dispatch_to_queue(
        &self,
        irp: Irp,
        in_caller: Option<RequestHandler>,
        queue: Option<Arc<IoQueue>>,
    ) -> Status {
        let forward_progress = queue.as_ref().map_or(false, |q| q.has_forward_progress());

        let allocated = match self.allocator.allocate(irp) {
            Ok(request) if forward_progress && self.fault_injector.lock().should_fail() => {
                log::trace!("IoPackage: injected allocation failure");
                match request.into_irp() {
                    Some(irp) => Err(irp),
                    None => return Status::Unsuccessful,
                }
            },
            other => other,
        };

        let mut request = match allocated {
            Ok(request) => request,
            Err(irp) => match (&queue, forward_progress) {
                (Some(queue), true) => match queue.get_reserved_request(irp) {
                    Reservation::Ready(request) => request,
                    Reservation::Parked => return Status::Pending,
                    Reservation::Unavailable(irp) => {
                        log::error!("IoPackage: no reserved request for {}", irp.id());
                        return Self::fail(irp, Status::InsufficientResources);
                    },
                },
                _ => {
                    log::error!("IoPackage: could not create request for {}", irp.id());
                    return Self::fail(irp, Status::InsufficientResources);
                },
            },
        };

        if let Some(handler) = in_caller {
            if !request.is_reserved() {
                if let Some(queue) = &queue {
                    request.set_context(Arc::downgrade(queue));
                }
                if let Some(irp) = request.irp_mut() {
                    irp.mark_pending();
                }
                request.set_completion_state(RequestCompletionState::Pipeline);
                request.set_owner(RequestOwner::Driver);
                handler(request);
                return Status::Pending;
            }
        }

        match queue {
            Some(queue) => queue.queue_request(request),
            None => {
                log::error!("IoPackage: reserved request without a queue");
                request.complete(Status::InvalidDeviceState);
                Status::InvalidDeviceState
            },
        }
    }

    /// Put a request handed to the in-caller handler back into the pipeline
    pub fn enqueue_request(&self, mut request: Request) -> Status {
        let Some(ty) = request.request_type() else {
            return Status::InvalidParameter;
        };

        let queue = request
            .context()
            .or_else(|| self.directory.lock().table[ty.index()].clone());

        request.set_completion_state(RequestCompletionState::None);
        match queue {
            Some(queue) => queue.queue_request(request),
            None => {
                log::error!("IoPackage: no queue configured for {}", ty);
                request.complete(Status::InvalidDeviceState);
                Status::InvalidDeviceState
            },
        }
    }

    fn forward(&self, mut irp: Irp) -> Status {
        match &self.lower {
            Some(lower) => {
                irp.skip_current_stack_location();
                lower.call_driver(irp)
            },
            None => {
                log::error!("IoPackage: filter has no lower device, failing {}", irp.id());
                Self::fail(irp, Status::InvalidDeviceState)
            },
        }
    }

    fn fail(irp: Irp, status: Status) -> Status {
        irp.complete(status, 0);
        status
    }

    /// Failures injected so far on forward-progress queues
    pub fn injected_failures(&self) -> u64 {
        self.fault_injector.lock().injected()
    }

    // =========================================================================
    // FLUSH
    // =========================================================================

    /// Cancel requests issued on `tag` in every queue
    ///
    /// The directory lock is dropped while each queue flushes.
    pub fn flush_by_owner(&self, tag: OwnerTag, _ctx: &NormalContext) -> usize {
        let (bookmark, mut next) = self.directory.lock().queues.first_queue();

        let mut flushed = 0;
        while let Some(queue) = next {
            flushed += queue.flush_by_owner(tag);
            drop(queue);
            next = self.directory.lock().queues.next_queue(bookmark);
        }

        if flushed > 0 {
            log::debug!("IoPackage: flushed {} requests for owner {:?}", flushed, tag);
        }
        flushed
    }

    // =========================================================================
    // POWER GATING
    // =========================================================================

    fn set_power(&self, power: QueuePowerState) -> Vec<Arc<IoQueue>> {
        let mut dir = self.directory.lock();
        dir.power = power;
        dir.queues.snapshot()
    }

    /// Leaving D0: power-managed queues stop delivering
    pub fn stop_processing_for_power(&self, action: StopAction) {
        for queue in self.set_power(QueuePowerState::Off) {
            if !queue.is_power_managed() {
                continue;
            }
            match action {
                StopAction::Hold => queue.set_power_state(QueuePowerState::Off),
                StopAction::Purge => {
                    queue.set_power_state(QueuePowerState::Off);
                    queue.purge();
                },
            }
        }
        log::debug!("IoPackage: queues stopped for power ({:?})", action);
    }

    /// Back in D0: deliver what was held
    pub fn resume_processing_for_power(&self) {
        for queue in self.set_power(QueuePowerState::On) {
            queue.set_power_state(QueuePowerState::On);
        }
        log::debug!("IoPackage: queues resumed for power");
    }

    /// System shutdown: every queue stops accepting
    pub fn stop_all_queues_for_shutdown(&self) {
        let queues = {
            let mut dir = self.directory.lock();
            dir.shutting_down = true;
            dir.queues.snapshot()
        };
        for queue in queues {
            queue.set_state_for_shutdown();
        }
    }

    /// Restart after a stop: queues accept again
    pub fn reset_state_for_restart(&self) {
        let queues = {
            let mut dir = self.directory.lock();
            dir.shutting_down = false;
            dir.queues.snapshot()
        };
        for queue in queues {
            queue.reset_for_restart();
        }
    }

    /// Quiescence: every queue purged, nothing left in flight
    pub fn purge_all(&self) -> usize {
        let queues = self.directory.lock().queues.snapshot();
        queues.iter().map(|queue| queue.purge()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ParentObject;
    use crate::request::LimitedAllocator;
    use crate::testing::{RecordingLowerDevice, RecordingSink};
    use crate::verifier::ForwardProgressTest;
    use std::sync::Mutex;

    fn package(filter: bool) -> (IoPackage, Arc<RecordingLowerDevice>) {
        package_with(FrameworkConfig::new().with_verifier(false), None, filter)
    }

    fn package_with(
        config: FrameworkConfig,
        allocator: Option<Arc<dyn RequestAllocator>>,
        filter: bool,
    ) -> (IoPackage, Arc<RecordingLowerDevice>) {
        let lower = RecordingLowerDevice::new();
        let io = IoPackage::new(DeviceId::next(), config, allocator, Some(lower.clone()));
        io.set_filter(filter).unwrap();
        io.resume_processing_for_power();
        (io, lower)
    }

    fn collector() -> (Arc<Mutex<Vec<Request>>>, impl Fn(Request) + Send + Sync + 'static) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&store);
        (store, move |request: Request| inner.lock().unwrap().push(request))
    }

    #[test]
    fn test_directory_orders_by_layer() {
        let (io, _) = package(false);
        io.create_queue(IoQueueConfig::new("A").with_layer(2)).unwrap();
        io.create_queue(IoQueueConfig::new("B").with_layer(5)).unwrap();
        assert_eq!(io.queue_order(), ["B", "A"]);

        io.create_queue(IoQueueConfig::new("C").with_layer(5)).unwrap();
        assert_eq!(io.queue_order(), ["B", "C", "A"]);
    }

    #[test]
    fn test_unconfigured_type_fails_on_function_device() {
        let (io, lower) = package(false);
        let sink = RecordingSink::new();

        let status = io.dispatch(Irp::new(RequestType::Read).with_sink(sink.clone()));
        assert_eq!(status, Status::InvalidDeviceState);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::InvalidDeviceState);
        assert_eq!(records[0].information, 0);
        assert!(lower.received().is_empty());
    }

    #[test]
    fn test_unconfigured_type_forwarded_on_filter() {
        let (io, lower) = package(true);
        let sink = RecordingSink::new();
        let irp = Irp::new(RequestType::Write).with_ioctl(0x22).with_sink(sink.clone());
        let id = irp.id();

        assert_eq!(io.dispatch(irp), Status::Success);

        let received = lower.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, id);
        assert_eq!(received[0].major, RequestType::Write);
        assert!(received[0].forwarded);
        assert_eq!(sink.statuses(), vec![Status::Success]);
    }

    #[test]
    fn test_default_queue_is_set_once() {
        let (io, _) = package(false);
        let first = io.create_queue(IoQueueConfig::new("default").as_default()).unwrap();
        assert!(first.is_default());
        assert!(first.is_no_delete());

        let err = io
            .create_queue(IoQueueConfig::new("second").as_default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DefaultQueueAlreadyConfigured);
        assert_eq!(err.status(), Status::Unsuccessful);
        assert_eq!(io.default_queue().map(|q| q.id()), Some(first.id()));
        assert!(io.remove_queue(&first).is_err());
    }

    #[test]
    #[should_panic(expected = "verifier break")]
    fn test_second_default_queue_breaks_verifier() {
        let (io, _) = package_with(FrameworkConfig::new().with_verifier(true), None, false);
        io.create_queue(IoQueueConfig::new("default").as_default()).unwrap();
        let _ = io.create_queue(IoQueueConfig::new("second").as_default());
    }

    #[test]
    fn test_set_filter_after_default_queue_fails() {
        let (io, _) = package(false);
        io.create_queue(IoQueueConfig::new("default").as_default()).unwrap();
        let err = io.set_filter(true).unwrap_err();
        assert_eq!(err.status(), Status::InvalidDeviceState);
        assert!(!io.is_filter());
    }

    #[test]
    fn test_default_queue_fills_unconfigured_slots() {
        let (io, _) = package(false);
        let reads = io.create_queue(IoQueueConfig::new("reads")).unwrap();
        io.configure_dispatching(&reads, RequestType::Read).unwrap();
        let default = io.create_queue(IoQueueConfig::new("default").as_default()).unwrap();

        assert_eq!(io.queue_for(RequestType::Read).map(|q| q.id()), Some(reads.id()));
        assert_eq!(io.queue_for(RequestType::Write).map(|q| q.id()), Some(default.id()));
        assert!(io.queue_for(RequestType::Pnp).is_none());

        // A default-routed slot may be taken over, a specific one may not
        let writes = io.create_queue(IoQueueConfig::new("writes")).unwrap();
        io.configure_dispatching(&writes, RequestType::Write).unwrap();
        assert!(io.configure_dispatching(&writes, RequestType::Read).is_err());
        assert_eq!(
            io.configure_dispatching(&writes, RequestType::Power).unwrap_err().status(),
            Status::InvalidParameter
        );
    }

    #[test]
    fn test_foreign_parent_rejected() {
        let (io, _) = package(false);
        let err = io
            .create_queue(IoQueueConfig::new("q").with_parent(ParentObject::device(DeviceId::next())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignParent);

        let err = io
            .create_queue(IoQueueConfig::new("q").with_parent(ParentObject::detached()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignParent);
        assert!(io.queues().is_empty());
    }

    #[test]
    fn test_filter_forwards_types_default_queue_cannot_handle() {
        let (io, lower) = package(true);
        let (seen, handler) = collector();
        io.create_queue(IoQueueConfig::new("default").as_default().on_read(handler))
            .unwrap();

        assert_eq!(io.dispatch(Irp::new(RequestType::Read)), Status::Pending);
        assert_eq!(seen.lock().unwrap().len(), 1);

        io.dispatch(Irp::new(RequestType::Write));
        assert_eq!(lower.received().len(), 1);
        assert_eq!(lower.received()[0].major, RequestType::Write);

        for request in seen.lock().unwrap().drain(..) {
            request.complete(Status::Success);
        }
    }

    #[test]
    fn test_allocation_failure_completes_request() {
        let allocator: Arc<dyn RequestAllocator> = Arc::new(LimitedAllocator::new(0));
        let (io, _) = package_with(FrameworkConfig::new().with_verifier(false), Some(allocator), false);
        io.create_queue(IoQueueConfig::new("default").as_default()).unwrap();

        let sink = RecordingSink::new();
        let status = io.dispatch(Irp::new(RequestType::Read).with_sink(sink.clone()));
        assert_eq!(status, Status::InsufficientResources);
        assert_eq!(sink.statuses(), vec![Status::InsufficientResources]);
    }

    #[test]
    fn test_forward_progress_falls_back_to_reserve() {
        let config = FrameworkConfig::new()
            .with_verifier(false)
            .with_forward_progress_test(ForwardProgressTest::FailAll);
        let (io, _) = package_with(config, None, false);
        let (seen, handler) = collector();
        let queue = io
            .create_queue(
                IoQueueConfig::new("fp")
                    .as_default()
                    .with_forward_progress(1)
                    .on_read(handler),
            )
            .unwrap();

        assert_eq!(io.dispatch(Irp::new(RequestType::Read)), Status::Pending);
        assert_eq!(io.dispatch(Irp::new(RequestType::Read)), Status::Pending);
        assert_eq!(io.injected_failures(), 2);
        assert_eq!(queue.reserved_pool().map(|pool| pool.parked()), Some(1));

        // Completing the reserved request lets the parked message through
        let first = seen.lock().unwrap().pop().unwrap();
        assert!(first.is_reserved());
        first.complete(Status::Success);
        let second = seen.lock().unwrap().pop().unwrap();
        assert!(second.is_reserved());
        second.complete(Status::Success);
        assert_eq!(queue.reserved_pool().map(|pool| pool.available()), Some(1));
    }

    #[test]
    fn test_in_caller_handler_then_enqueue() {
        let (io, _) = package(false);
        let (queued, handler) = collector();
        io.create_queue(IoQueueConfig::new("default").as_default().on_write(handler))
            .unwrap();

        let (pipeline, in_caller) = collector();
        io.set_in_caller_context(in_caller);

        assert_eq!(io.dispatch(Irp::new(RequestType::Write)), Status::Pending);
        let request = pipeline.lock().unwrap().pop().unwrap();
        assert_eq!(request.completion_state(), RequestCompletionState::Pipeline);
        assert_eq!(request.owner(), RequestOwner::Driver);
        assert!(request.irp().map_or(false, Irp::is_pending_returned));
        assert!(queued.lock().unwrap().is_empty());

        assert_eq!(io.enqueue_request(request), Status::Pending);
        let request = queued.lock().unwrap().pop().unwrap();
        request.complete(Status::Success);
    }

    #[test]
    fn test_in_caller_handler_without_queue() {
        let (io, _) = package(false);
        let (pipeline, in_caller) = collector();
        io.set_in_caller_context(in_caller);

        assert_eq!(io.dispatch(Irp::new(RequestType::DeviceControl)), Status::Pending);
        let request = pipeline.lock().unwrap().pop().unwrap();
        assert!(request.context().is_none());
        request.complete(Status::Success);
    }

    #[test]
    fn test_interceptor_type_change_fails_request() {
        let (io, _) = package(false);
        io.register_interceptor(
            RequestType::Read,
            Arc::new(|mut irp: Irp| {
                irp.set_major(RequestType::Write);
                InterceptResult::Continue(irp)
            }),
        )
        .unwrap();

        let sink = RecordingSink::new();
        let status = io.dispatch(Irp::new(RequestType::Read).with_sink(sink.clone()));
        assert_eq!(status, Status::InvalidParameter);
        assert_eq!(sink.statuses(), vec![Status::InvalidParameter]);
        assert!(io
            .register_interceptor(RequestType::Cleanup, Arc::new(InterceptResult::Continue))
            .is_err());
    }

    #[test]
    #[should_panic(expected = "verifier break")]
    fn test_interceptor_type_change_breaks_verifier() {
        let (io, _) = package_with(FrameworkConfig::new().with_verifier(true), None, false);
        io.register_interceptor(
            RequestType::InternalDeviceControl,
            Arc::new(|mut irp: Irp| {
                irp.set_major(RequestType::Create);
                InterceptResult::Continue(irp)
            }),
        )
        .unwrap();
        io.dispatch(Irp::new(RequestType::InternalDeviceControl));
    }

    #[test]
    fn test_interceptor_claims_before_table() {
        let (io, _) = package(false);
        io.register_interceptor(
            RequestType::DeviceControl,
            Arc::new(|irp: Irp| {
                irp.complete(Status::Success, 4);
                InterceptResult::Handled(Status::Success)
            }),
        )
        .unwrap();

        assert_eq!(io.dispatch(Irp::new(RequestType::DeviceControl)), Status::Success);
    }

    #[test]
    fn test_interceptor_that_loses_the_message_still_answers() {
        let (io, _) = package(false);
        let sink = RecordingSink::new();
        io.register_interceptor(
            RequestType::Read,
            Arc::new(|_irp: Irp| InterceptResult::Handled(Status::Success)),
        )
        .unwrap();

        io.dispatch(Irp::new(RequestType::Read).with_sink(sink.clone()));
        assert_eq!(sink.statuses(), vec![Status::Cancelled]);
    }

    #[test]
    fn test_flush_by_owner_walks_every_queue() {
        let ctx = NormalContext::require();
        let (io, _) = package(false);
        let reads = io.create_queue(IoQueueConfig::new("reads").with_layer(1)).unwrap();
        let writes = io.create_queue(IoQueueConfig::new("writes")).unwrap();
        io.configure_dispatching(&reads, RequestType::Read).unwrap();
        io.configure_dispatching(&writes, RequestType::Write).unwrap();

        let sink = RecordingSink::new();
        for (ty, tag) in [
            (RequestType::Read, 7),
            (RequestType::Write, 7),
            (RequestType::Write, 8),
        ] {
            io.dispatch(Irp::new(ty).with_owner(OwnerTag(tag)).with_sink(sink.clone()));
        }

        assert_eq!(io.flush_by_owner(OwnerTag(7), &ctx), 2);
        assert_eq!(sink.statuses(), vec![Status::Cancelled, Status::Cancelled]);
        assert_eq!(reads.held() + writes.held(), 1);
    }

    #[test]
    fn test_flush_while_registering() {
        let ctx = NormalContext::require();
        let (io, _) = package(false);
        let io = Arc::new(io);
        for i in 0..8 {
            io.create_queue(IoQueueConfig::new(&format!("q{}", i)).with_layer(i)).unwrap();
        }

        let registrar = {
            let io = Arc::clone(&io);
            std::thread::spawn(move || {
                for i in 0..32 {
                    io.create_queue(IoQueueConfig::new(&format!("late{}", i)).with_layer(-1))
                        .unwrap();
                }
            })
        };
        for _ in 0..16 {
            io.flush_by_owner(OwnerTag(1), &ctx);
        }
        registrar.join().unwrap();

        assert_eq!(io.queues().len(), 40);
        assert_eq!(io.directory.lock().queues.bookmarks(), 0);
    }

    #[test]
    fn test_power_gating_holds_and_resumes() {
        let (io, _) = package(false);
        let (seen, handler) = collector();
        io.create_queue(IoQueueConfig::new("default").as_default().on_read(handler))
            .unwrap();

        io.stop_processing_for_power(StopAction::Hold);
        io.dispatch(Irp::new(RequestType::Read));
        assert!(seen.lock().unwrap().is_empty());

        io.resume_processing_for_power();
        assert_eq!(seen.lock().unwrap().len(), 1);
        seen.lock().unwrap().clear();
    }

    #[test]
    fn test_queue_registered_during_shutdown_rejects() {
        let (io, _) = package(false);
        io.stop_processing_for_power(StopAction::Purge);
        io.stop_all_queues_for_shutdown();

        let late = io.create_queue(IoQueueConfig::new("late").as_default()).unwrap();
        assert!(!late.is_accepting());
        assert_eq!(late.power_state(), QueuePowerState::Off);

        io.reset_state_for_restart();
        assert!(late.is_accepting());
    }
}
