//! # Device
//!
//! A [`Device`] pairs one request directory ([`IoPackage`]) with one
//! lifecycle orchestrator ([`PnpPackage`]). Every incoming message takes a
//! remove-lock reference first; presence and power messages go to the
//! orchestrator, everything else to the directory.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::dispose::DisposeList;
use crate::error::{DfxResult, Status};
use crate::io::IoPackage;
use crate::irp::{Irp, LowerDevice, RemoveLock};
use crate::irql::NormalContext;
use crate::pnp::power::Watchdog;
use crate::pnp::settings::SettingsStore;
use crate::pnp::{PhysicalDevice, PnpInit, PnpPackage, PnpPowerCallbacks, ReenumerationInterface};
use crate::queue::RequestHandler;
use crate::request::{Request, RequestAllocator};
use crate::sync::Event;
use crate::verifier::FrameworkConfig;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Device identifier, unique for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Driver configuration step run after both packages exist
pub type DeviceAddCallback = Arc<dyn Fn(&Arc<Device>) -> DfxResult<()> + Send + Sync>;

// =============================================================================
// DEVICE INIT
// =============================================================================

/// Everything needed to add a device
#[derive(Clone, Default)]
pub struct DeviceInit {
    config: FrameworkConfig,
    filter: bool,
    pnp: PnpInit,
    allocator: Option<Arc<dyn RequestAllocator>>,
    lower: Option<Arc<dyn LowerDevice>>,
    in_caller: Option<RequestHandler>,
    on_add: Option<DeviceAddCallback>,
}

impl fmt::Debug for DeviceInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInit")
            .field("config", &self.config)
            .field("filter", &self.filter)
            .field("pnp", &self.pnp)
            .field("allocator", &self.allocator.is_some())
            .field("lower", &self.lower.is_some())
            .field("in_caller", &self.in_caller.is_some())
            .field("on_add", &self.on_add.is_some())
            .finish()
    }
}

impl DeviceInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: FrameworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Unhandled request types are passed down instead of failed
    pub fn with_filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_pnp(mut self, pnp: PnpInit) -> Self {
        self.pnp = pnp;
        self
    }

    pub fn with_callbacks(mut self, callbacks: PnpPowerCallbacks) -> Self {
        self.pnp = self.pnp.with_callbacks(callbacks);
        self
    }

    pub fn with_power_policy_owner(mut self, owner: bool) -> Self {
        self.pnp = self.pnp.with_power_policy_owner(owner);
        self
    }

    pub fn with_power_thread(mut self, needed: bool) -> Self {
        self.pnp = self.pnp.with_power_thread(needed);
        self
    }

    pub fn with_physical_device(mut self, physical: Arc<dyn PhysicalDevice>) -> Self {
        self.pnp = self.pnp.with_physical_device(physical);
        self
    }

    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.pnp = self.pnp.with_settings_store(store);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.pnp = self.pnp.with_watchdog(watchdog);
        self
    }

    pub fn with_reenumeration(mut self, interface: Arc<dyn ReenumerationInterface>) -> Self {
        self.pnp = self.pnp.with_reenumeration(interface);
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn RequestAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_lower_device(mut self, lower: Arc<dyn LowerDevice>) -> Self {
        self.lower = Some(lower);
        self
    }

    /// Handler that receives requests on the caller's thread before queuing
    pub fn with_in_caller_context<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        self.in_caller = Some(Arc::new(handler));
        self
    }

    /// Runs once the device exists; an error unwinds the creation
    pub fn with_add_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Device>) -> DfxResult<()> + Send + Sync + 'static,
    {
        self.on_add = Some(Arc::new(callback));
        self
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// A framework device object
pub struct Device {
    id: DeviceId,
    io: Arc<IoPackage>,
    pnp: Arc<PnpPackage>,
    remove_lock: RemoveLock,
    dispose_list: DisposeList,
    destroyed: AtomicBool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("pnp_state", &self.pnp.pnp_state())
            .field("outstanding", &self.remove_lock.outstanding())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Device {
    /// Create the device, its directory and its orchestrator
    pub fn add(init: DeviceInit, ctx: &NormalContext) -> DfxResult<Arc<Self>> {
        let id = DeviceId::next();

        let io = Arc::new(IoPackage::new(
            id,
            init.config.clone(),
            init.allocator,
            init.lower.clone(),
        ));
        io.set_filter(init.filter)?;
        if let Some(handler) = init.in_caller {
            io.set_in_caller_context(move |request| handler(request));
        }

        let remove_lock = RemoveLock::new();
        let pnp = PnpPackage::new(
            id,
            init.config,
            Arc::clone(&io),
            init.lower,
            Some(remove_lock.clone()),
            init.pnp,
        )?;

        let device = Arc::new(Self {
            id,
            io,
            pnp,
            remove_lock,
            dispose_list: DisposeList::new(),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&device);
        device.pnp.set_delete_hook(Box::new(move |ctx| {
            if let Some(device) = weak.upgrade() {
                device.destroy(ctx);
            }
        }));

        if let Some(on_add) = init.on_add {
            if let Err(err) = on_add(&device) {
                log::error!("Device: {} add callback failed: {}", id, err);
                let wait = Arc::new(Event::notification());
                device.pnp.cleanup_device_from_failed_create(&wait, ctx);
                return Err(err);
            }
        }

        device.pnp.finish_initialize();
        log::info!("Device: {} added", id);
        Ok(device)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn io(&self) -> &Arc<IoPackage> {
        &self.io
    }

    pub fn pnp(&self) -> &Arc<PnpPackage> {
        &self.pnp
    }

    pub fn dispose_list(&self) -> &DisposeList {
        &self.dispose_list
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Messages currently holding the device
    pub fn outstanding_requests(&self) -> usize {
        self.remove_lock.outstanding()
    }

    /// Route one message under a remove-lock reference
    pub fn dispatch(&self, mut irp: Irp) -> Status {
        let Some(token) = self.remove_lock.acquire() else {
            log::warn!("Device: {} is being removed, failing irp {}", self.id, irp.id());
            irp.complete(Status::InvalidDeviceState, 0);
            return Status::InvalidDeviceState;
        };
        irp.attach_remove_lock(token);

        if irp.major().is_lifecycle() {
            self.pnp.dispatch(irp)
        } else {
            self.io.dispatch(irp)
        }
    }

    /// Tear the device down once both packages are quiet
    ///
    /// Without a prior removal the orchestrator's delayed deletion runs
    /// first and calls back in here.
    pub fn destroy(&self, ctx: &NormalContext) {
        if !self.pnp.is_deleted() {
            self.pnp.process_delayed_deletion(ctx);
            return;
        }

        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        self.io.stop_all_queues_for_shutdown();
        let purged = self.io.purge_all();
        self.dispose_list.wait_for_empty(ctx);

        self.destroyed.store(true, Ordering::Release);
        log::info!("Device: {} destroyed, {} requests purged", self.id, purged);
    }
}
