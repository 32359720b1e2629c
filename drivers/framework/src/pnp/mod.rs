//! # Device Lifecycle Orchestrator
//!
//! [`PnpPackage`] owns the four lifecycle machines of a device and the
//! resources they share:
//!
//! - presence ([`presence`]), driven by state-changing presence requests;
//! - power policy ([`policy`]), driven by presence;
//! - device power ([`power`]), driven by power policy;
//! - device power requirement ([`requirement`]), power-policy owner only.
//!
//! A presence request that changes state pends in a single slot until the
//! state it leads to completes it. Teardown finishes the machines in
//! dependency order, then releases the power thread and the reenumeration
//! interface before the removal travels down the stack.

pub mod caps;
pub mod interrupts;
pub mod machine;
pub mod policy;
pub mod power;
pub mod power_thread;
pub mod presence;
pub mod requirement;
pub mod settings;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arrayvec::ArrayVec;

use crate::device::DeviceId;
use crate::dfx_error;
use crate::error::{DfxResult, ErrorKind, Status};
use crate::io::IoPackage;
use crate::irp::{Irp, IrpParameters, LowerDevice, PnpMinor, PowerMinor, RemoveLock, RequestType};
use crate::irql::NormalContext;
use crate::sync::Event;
use crate::thread::WorkerThread;
use crate::verifier::{bug_check, BugCheckCode, FrameworkConfig};

use self::caps::{Capabilities, DeviceCapabilities, DevicePowerState};
use self::interrupts::{Interrupt, InterruptCounts, ResourceRequirementsList};
use self::machine::{FinishStatus, Finishable, MachineHost, MachineKind, PostOutcome, StateMachine};
use self::policy::{PolicyEvent, PolicyState, POLICY_TABLE};
use self::power::{DeadlineWatchdog, PowerEvent, PowerRoutine, PowerState, Watchdog, POWER_TABLE};
use self::power_thread::{PowerThreadInterface, PowerThreadSlot};
use self::presence::{PnpEvent, PnpState, PNP_TABLE};
use self::requirement::{RequirementEvent, RequirementState, REQUIREMENT_TABLE};
use self::settings::{PolicySettings, SaveOutcome, SettingsStore};

/// Device-state bit reported once the device failed internally
pub const PNP_DEVICE_FAILED: usize = 0x0000_0008;

// =============================================================================
// CALLBACKS AND COLLABORATORS
// =============================================================================

pub type HardwareCallback = Arc<dyn Fn() -> Status + Send + Sync>;
pub type PowerTransitionCallback = Arc<dyn Fn(DevicePowerState) -> Status + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

/// Driver routines invoked by the lifecycle machines
#[derive(Clone, Default)]
pub struct PnpPowerCallbacks {
    pub prepare_hardware: Option<HardwareCallback>,
    pub release_hardware: Option<HardwareCallback>,
    /// Runs under the power watchdog
    pub d0_entry: Option<PowerTransitionCallback>,
    /// Runs under the power watchdog
    pub d0_exit: Option<PowerTransitionCallback>,
    pub surprise_removal: Option<NotifyCallback>,
    /// Power-policy owner only, after the machines are finished
    pub cleanup_power: Option<NotifyCallback>,
}

impl fmt::Debug for PnpPowerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PnpPowerCallbacks")
            .field("prepare_hardware", &self.prepare_hardware.is_some())
            .field("release_hardware", &self.release_hardware.is_some())
            .field("d0_entry", &self.d0_entry.is_some())
            .field("d0_exit", &self.d0_exit.is_some())
            .field("surprise_removal", &self.surprise_removal.is_some())
            .field("cleanup_power", &self.cleanup_power.is_some())
            .finish()
    }
}

/// The bus-side object that enumerated this device
pub trait PhysicalDevice: Send + Sync {
    /// Ask the system to requery the device's state
    fn invalidate_device_state(&self, device: DeviceId);
}

/// Interface through which a device can request its own reenumeration
pub trait ReenumerationInterface: Send + Sync {
    fn reenumerate_self(&self);
}

/// What the system should do with a device reported as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAction {
    AttemptRestart,
    NoRestart,
}

/// Observable teardown milestones, in the order they happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Finished(MachineKind),
    PowerCleanupCallback,
    PowerThreadReleased,
    ReenumerationReleased,
    RemoveForwarded,
    RemoveCompleted,
    RemoveProcessed,
    DeviceDeleted,
}

// =============================================================================
// INITIALIZATION
// =============================================================================

/// Lifecycle settings collected before the device is created
#[derive(Clone)]
pub struct PnpInit {
    callbacks: PnpPowerCallbacks,
    power_policy_owner: bool,
    needs_power_thread: bool,
    physical: Option<Arc<dyn PhysicalDevice>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    watchdog: Option<Arc<dyn Watchdog>>,
    reenumeration: Option<Arc<dyn ReenumerationInterface>>,
    policy_settings: PolicySettings,
}

impl Default for PnpInit {
    fn default() -> Self {
        Self {
            callbacks: PnpPowerCallbacks::default(),
            power_policy_owner: true,
            needs_power_thread: false,
            physical: None,
            settings_store: None,
            watchdog: None,
            reenumeration: None,
            policy_settings: PolicySettings::default(),
        }
    }
}

impl fmt::Debug for PnpInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PnpInit")
            .field("callbacks", &self.callbacks)
            .field("power_policy_owner", &self.power_policy_owner)
            .field("needs_power_thread", &self.needs_power_thread)
            .field("physical", &self.physical.is_some())
            .field("settings_store", &self.settings_store.is_some())
            .field("watchdog", &self.watchdog.is_some())
            .field("reenumeration", &self.reenumeration.is_some())
            .field("policy_settings", &self.policy_settings)
            .finish()
    }
}

impl PnpInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callbacks(mut self, callbacks: PnpPowerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_power_policy_owner(mut self, owner: bool) -> Self {
        self.power_policy_owner = owner;
        self
    }

    /// The power machines must run on a dedicated power thread
    pub fn with_power_thread(mut self, needed: bool) -> Self {
        self.needs_power_thread = needed;
        self
    }

    pub fn with_physical_device(mut self, physical: Arc<dyn PhysicalDevice>) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_reenumeration(mut self, interface: Arc<dyn ReenumerationInterface>) -> Self {
        self.reenumeration = Some(interface);
        self
    }

    pub fn with_policy_settings(mut self, settings: PolicySettings) -> Self {
        self.policy_settings = settings;
        self
    }
}

// =============================================================================
// PNP PACKAGE
// =============================================================================

type DeleteHook = Box<dyn FnOnce(&NormalContext) + Send>;

/// Per-device lifecycle orchestrator
pub struct PnpPackage {
    device: DeviceId,
    config: FrameworkConfig,
    io: Arc<IoPackage>,
    lower: Option<Arc<dyn LowerDevice>>,
    remove_lock: Option<RemoveLock>,
    callbacks: PnpPowerCallbacks,
    physical: Option<Arc<dyn PhysicalDevice>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    watchdog: Arc<dyn Watchdog>,
    power_policy_owner: bool,
    needs_power_thread: bool,

    pnp_machine: StateMachine<PnpState, PnpEvent, PnpPackage>,
    policy_machine: StateMachine<PolicyState, PolicyEvent, PnpPackage>,
    power_machine: StateMachine<PowerState, PowerEvent, PnpPackage>,
    requirement_machine: Option<StateMachine<RequirementState, RequirementEvent, PnpPackage>>,

    pending_pnp_irp: spin::Mutex<Option<Irp>>,
    remove_processed: spin::Mutex<Option<Arc<Event>>>,
    caps: spin::Mutex<Capabilities>,
    power_thread: PowerThreadSlot,
    interrupts: spin::RwLock<Vec<Interrupt>>,
    policy_settings: spin::Mutex<PolicySettings>,
    reenumeration: spin::Mutex<Option<Arc<dyn ReenumerationInterface>>>,
    event_worker: WorkerThread,

    hardware_prepared: AtomicBool,
    internal_failure: AtomicBool,
    failed_action: spin::Mutex<Option<FailedAction>>,
    deleted: AtomicBool,
    on_delete: spin::Mutex<Option<DeleteHook>>,
    teardown: spin::Mutex<Vec<TeardownStep>>,
    self_ref: Weak<PnpPackage>,
}

impl fmt::Debug for PnpPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PnpPackage")
            .field("device", &self.device)
            .field("pnp", &self.pnp_machine)
            .field("power_policy", &self.policy_machine)
            .field("power", &self.power_machine)
            .field("power_requirement", &self.requirement_machine)
            .field("power_policy_owner", &self.power_policy_owner)
            .field("power_thread", &self.power_thread)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

macro_rules! machine_events {
    ($($prefix:ident: $machine:ident, $event:ty, $state:ty;)*) => {
        paste::paste! {
            impl PnpPackage {
                $(
                    #[doc = "Post an event to the `" $prefix "` machine"]
                    pub fn [<$prefix _process_event>](&self, event: $event) -> PostOutcome {
                        self.$machine.post(self, event)
                    }

                    #[doc = "Current state of the `" $prefix "` machine"]
                    pub fn [<$prefix _state>](&self) -> $state {
                        self.$machine.state()
                    }
                )*
            }
        }
    };
}

machine_events! {
    pnp: pnp_machine, PnpEvent, PnpState;
    power: power_machine, PowerEvent, PowerState;
    power_policy: policy_machine, PolicyEvent, PolicyState;
}

impl PnpPackage {
    /// Create the machines and start the device's event worker
    pub fn new(
        device: DeviceId,
        config: FrameworkConfig,
        io: Arc<IoPackage>,
        lower: Option<Arc<dyn LowerDevice>>,
        remove_lock: Option<RemoveLock>,
        init: PnpInit,
    ) -> DfxResult<Arc<Self>> {
        let watchdog: Arc<dyn Watchdog> = match init.watchdog {
            Some(watchdog) => watchdog,
            None => Arc::new(DeadlineWatchdog::default()),
        };
        let owner = init.power_policy_owner;

        let package = Arc::new_cyclic(|self_ref| Self {
            device,
            config,
            io,
            lower,
            remove_lock,
            callbacks: init.callbacks,
            physical: init.physical,
            settings_store: init.settings_store,
            watchdog,
            power_policy_owner: owner,
            needs_power_thread: init.needs_power_thread,
            pnp_machine: StateMachine::new(MachineKind::Pnp, &PNP_TABLE, PnpState::Init),
            policy_machine: StateMachine::new(
                MachineKind::PowerPolicy,
                &POLICY_TABLE,
                PolicyState::ObjectCreated,
            ),
            power_machine: StateMachine::new(MachineKind::Power, &POWER_TABLE, PowerState::D3Final),
            requirement_machine: owner.then(|| {
                StateMachine::new(
                    MachineKind::PowerRequirement,
                    &REQUIREMENT_TABLE,
                    RequirementState::NotRequired,
                )
            }),
            pending_pnp_irp: spin::Mutex::new(None),
            remove_processed: spin::Mutex::new(None),
            caps: spin::Mutex::new(Capabilities::new()),
            power_thread: PowerThreadSlot::new(),
            interrupts: spin::RwLock::new(Vec::new()),
            policy_settings: spin::Mutex::new(init.policy_settings),
            reenumeration: spin::Mutex::new(init.reenumeration),
            event_worker: WorkerThread::new(&format!("dfx-pnp-{}", device.as_u64())),
            hardware_prepared: AtomicBool::new(false),
            internal_failure: AtomicBool::new(false),
            failed_action: spin::Mutex::new(None),
            deleted: AtomicBool::new(false),
            on_delete: spin::Mutex::new(None),
            teardown: spin::Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        package.event_worker.start()?;
        log::debug!("PnpPackage: {:?} created, power policy owner {}", device, owner);
        Ok(package)
    }

    /// Leave Init once the device is fully constructed
    pub fn finish_initialize(&self) {
        self.pnp_process_event(PnpEvent::AddDevice);
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn io(&self) -> &Arc<IoPackage> {
        &self.io
    }

    pub fn lower(&self) -> Option<&Arc<dyn LowerDevice>> {
        self.lower.as_ref()
    }

    pub fn is_power_policy_owner(&self) -> bool {
        self.power_policy_owner
    }

    pub fn needs_power_thread(&self) -> bool {
        self.needs_power_thread
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn has_internal_failure(&self) -> bool {
        self.internal_failure.load(Ordering::Acquire)
    }

    pub fn failed_action(&self) -> Option<FailedAction> {
        *self.failed_action.lock()
    }

    /// Teardown milestones reached so far
    pub fn teardown_log(&self) -> Vec<TeardownStep> {
        self.teardown.lock().clone()
    }

    pub(crate) fn record(&self, step: TeardownStep) {
        self.teardown.lock().push(step);
    }

    pub(crate) fn set_delete_hook(&self, hook: DeleteHook) {
        *self.on_delete.lock() = Some(hook);
    }

    pub fn power_requirement_process_event(&self, event: RequirementEvent) -> PostOutcome {
        match &self.requirement_machine {
            Some(machine) => machine.post(self, event),
            None => {
                log::trace!("PnpPackage: {:?} has no power requirement machine", self.device);
                PostOutcome::Discarded
            },
        }
    }

    pub fn power_requirement_state(&self) -> Option<RequirementState> {
        self.requirement_machine.as_ref().map(StateMachine::state)
    }

    fn run_deferred(&self, kind: MachineKind) {
        log::trace!("PnpPackage: {:?} running {} on its machine thread", self.device, kind);
        match kind {
            MachineKind::Pnp => self.pnp_machine.process(self),
            MachineKind::PowerPolicy => self.policy_machine.process(self),
            MachineKind::Power => self.power_machine.process(self),
            MachineKind::PowerRequirement => {
                if let Some(machine) = &self.requirement_machine {
                    machine.process(self);
                }
            },
        }
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Entry point for presence and power requests
    pub fn dispatch(&self, irp: Irp) -> Status {
        match irp.major() {
            RequestType::Pnp => self.dispatch_pnp(irp),
            RequestType::Power => self.dispatch_power(irp),
            other => {
                log::error!("PnpPackage: {:?} is not a lifecycle request type", other);
                irp.complete(Status::InvalidParameter, 0);
                Status::InvalidParameter
            },
        }
    }

    pub fn dispatch_pnp(&self, irp: Irp) -> Status {
        let Some(minor) = irp.pnp_minor() else {
            log::trace!("PnpPackage: unknown presence minor {:#x}", irp.minor());
            return self.fire_and_forget(irp);
        };

        log::debug!("PnpPackage: {:?} {:?} irp {}", self.device, minor, irp.id());

        if let Some(event) = PnpEvent::from_minor(minor) {
            return self.dispatch_state_changing(irp, event);
        }

        match minor {
            PnpMinor::QueryCapabilities => self.handle_query_capabilities(irp),
            PnpMinor::FilterResourceRequirements => self.handle_filter_resource_requirements(irp),
            PnpMinor::QueryPnpDeviceState => self.handle_query_pnp_device_state(irp),
            _ => self.fire_and_forget(irp),
        }
    }

    pub fn dispatch_power(&self, irp: Irp) -> Status {
        match irp.power_minor() {
            Some(PowerMinor::WaitWake) => {
                log::warn!("PnpPackage: {:?} does not arm for wake", self.device);
                irp.complete(Status::Unsuccessful, 0);
                Status::Unsuccessful
            },
            minor => {
                log::trace!("PnpPackage: {:?} passing {:?} down", self.device, minor);
                self.fire_and_forget(irp)
            },
        }
    }

    fn dispatch_state_changing(&self, irp: Irp, event: PnpEvent) -> Status {
        let accepted = self.pnp_machine.accepts(event);
        self.set_pending_pnp_irp(irp, accepted);

        if !accepted {
            let status = event.rejected_status();
            log::warn!(
                "PnpPackage: {:?} {:?} not accepted in {:?}, completing with {}",
                self.device,
                event,
                self.pnp_state(),
                status
            );
            if let Some(irp) = self.take_pending_pnp_irp() {
                irp.complete(status, 0);
            }
            return status;
        }

        self.pnp_process_event(event);
        Status::Pending
    }

    fn fire_and_forget(&self, mut irp: Irp) -> Status {
        match &self.lower {
            Some(lower) => {
                irp.skip_current_stack_location();
                lower.call_driver(irp)
            },
            None => {
                let status = irp.status();
                irp.complete(status, 0);
                status
            },
        }
    }

    fn handle_query_capabilities(&self, mut irp: Irp) -> Status {
        let mut report = match &self.lower {
            Some(lower) => lower.query_capabilities().unwrap_or_default(),
            None => DeviceCapabilities::default(),
        };
        self.caps.lock().apply(&mut report);

        *irp.parameters_mut() = IrpParameters::Capabilities(Box::new(report));
        irp.complete(Status::Success, 0);
        Status::Success
    }

    fn handle_filter_resource_requirements(&self, mut irp: Irp) -> Status {
        if let IrpParameters::ResourceRequirements(list) = irp.parameters_mut() {
            self.filter_resource_requirements(Some(list));
        }

        match &self.lower {
            Some(lower) => {
                irp.skip_current_stack_location();
                lower.call_driver(irp)
            },
            None => {
                irp.complete(Status::Success, 0);
                Status::Success
            },
        }
    }

    fn handle_query_pnp_device_state(&self, irp: Irp) -> Status {
        let state = if self.has_internal_failure() {
            PNP_DEVICE_FAILED
        } else {
            0
        };
        irp.complete(Status::Success, state);
        Status::Success
    }

    // =========================================================================
    // PENDING PRESENCE REQUEST
    // =========================================================================

    /// Park a state-changing presence request
    ///
    /// Only one may be pending; a second one is a fatal framework violation.
    pub fn set_pending_pnp_irp(&self, mut irp: Irp, mark_pending: bool) {
        let mut pending = self.pending_pnp_irp.lock();
        if let Some(existing) = pending.as_ref() {
            log::error!(
                "PnpPackage: {:?} {:?} irp {} arrived while {:?} irp {} is pending",
                self.device,
                irp.pnp_minor(),
                irp.id(),
                existing.pnp_minor(),
                existing.id()
            );
            let irp_id = irp.id();
            drop(pending);
            bug_check(BugCheckCode::PnpFatalError, self.device.as_u64(), irp_id);
        }

        if mark_pending {
            irp.mark_pending();
        }
        *pending = Some(irp);
    }

    pub fn has_pending_pnp_irp(&self) -> bool {
        self.pending_pnp_irp.lock().is_some()
    }

    fn take_pending_pnp_irp(&self) -> Option<Irp> {
        self.pending_pnp_irp.lock().take()
    }

    /// Finish the pending presence request
    ///
    /// Success travels down the stack when there is one; anything else is
    /// completed here.
    pub fn complete_pending_pnp_irp(&self, status: Status) -> Status {
        let Some(mut irp) = self.take_pending_pnp_irp() else {
            log::warn!("PnpPackage: {:?} no pending presence request to complete", self.device);
            return status;
        };

        irp.release_remove_lock();

        if status.is_success() {
            if let Some(lower) = &self.lower {
                irp.skip_current_stack_location();
                return lower.call_driver(irp);
            }
        }

        irp.complete(status, 0);
        status
    }

    /// Send the remove request on once no other request holds the device
    pub(crate) fn finish_remove_irp(&self, ctx: &NormalContext) {
        let had_irp = {
            let mut pending = self.pending_pnp_irp.lock();
            if let Some(irp) = pending.as_mut() {
                irp.release_remove_lock();
            }
            pending.is_some()
        };

        if let Some(lock) = &self.remove_lock {
            lock.release_and_wait(ctx);
        }

        if !had_irp {
            return;
        }

        let forwarded = self.lower.is_some();
        self.complete_pending_pnp_irp(Status::Success);
        self.record(if forwarded {
            TeardownStep::RemoveForwarded
        } else {
            TeardownStep::RemoveCompleted
        });
    }

    pub(crate) fn take_remove_processed(&self) -> Option<Arc<Event>> {
        self.remove_processed.lock().take()
    }

    // =========================================================================
    // HARDWARE AND POWER ROUTINES
    // =========================================================================

    pub(crate) fn prepare_hardware(&self) -> Status {
        let status = self
            .callbacks
            .prepare_hardware
            .as_ref()
            .map_or(Status::Success, |callback| callback());
        if status.is_success() {
            self.hardware_prepared.store(true, Ordering::Release);
        }
        status
    }

    pub(crate) fn release_hardware(&self) {
        if !self.hardware_prepared.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(callback) = &self.callbacks.release_hardware {
            let status = callback();
            if !status.is_success() {
                log::warn!("PnpPackage: {:?} release hardware returned {}", self.device, status);
            }
        }
    }

    pub(crate) fn notify_surprise_removal(&self) {
        if let Some(callback) = &self.callbacks.surprise_removal {
            callback();
        }
    }

    /// Run a driver power routine under the watchdog
    pub(crate) fn run_power_routine(&self, routine: PowerRoutine, target: DevicePowerState) -> Status {
        let callback = match routine {
            PowerRoutine::D0Entry => self.callbacks.d0_entry.as_ref(),
            PowerRoutine::D0Exit => self.callbacks.d0_exit.as_ref(),
        };
        let Some(callback) = callback else {
            return Status::Success;
        };

        self.watchdog.arm(routine);
        let status = callback(target);
        self.watchdog.disarm();
        status
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Finish the machines in dependency order and drop shared resources
    ///
    /// One event is reused for every machine and cleared between waits.
    pub fn cleanup_state_machines(&self, cleanup_pnp: bool, ctx: &NormalContext) {
        let event = Arc::new(Event::synchronization());

        let mut machines: ArrayVec<&dyn Finishable, 4> = ArrayVec::new();
        if cleanup_pnp {
            machines.push(&self.pnp_machine);
        }
        machines.push(&self.policy_machine);
        machines.push(&self.power_machine);
        if self.power_policy_owner {
            if let Some(machine) = &self.requirement_machine {
                machines.push(machine);
            }
        }

        for machine in machines {
            if machine.finish(&event) == FinishStatus::Pending {
                log::info!(
                    "PnpPackage: {:?} waiting for {} to finish",
                    self.device,
                    machine.machine_kind()
                );
                event.wait(ctx);
            }
            event.clear();
            self.record(TeardownStep::Finished(machine.machine_kind()));
        }

        if self.power_policy_owner {
            if let Some(callback) = &self.callbacks.cleanup_power {
                callback();
            }
            self.record(TeardownStep::PowerCleanupCallback);
        }

        self.release_power_thread(ctx);
        self.release_reenumeration_interface();
    }

    /// Delete the device once; later calls are ignored
    pub fn delete_device(&self, ctx: &NormalContext) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            log::debug!("PnpPackage: {:?} already deleted", self.device);
            return;
        }

        let purged = self.io.purge_all();
        if purged > 0 {
            log::debug!("PnpPackage: {:?} purged {} requests on delete", self.device, purged);
        }

        let hook = self.on_delete.lock().take();
        if let Some(hook) = hook {
            hook(ctx);
        }

        self.record(TeardownStep::DeviceDeleted);
        log::info!("PnpPackage: {:?} deleted", self.device);
    }

    /// Delete a device whose removal never reached the presence machine
    pub fn process_delayed_deletion(&self, ctx: &NormalContext) {
        log::info!("PnpPackage: {:?} processing delayed deletion", self.device);
        self.cleanup_state_machines(false, ctx);
        self.delete_device(ctx);
    }

    /// Tear down a device whose creation failed after the machines existed
    ///
    /// A synthesized remove runs through the presence machine; `wait_event`
    /// is signaled when it has been processed and the device is then deleted.
    pub fn cleanup_device_from_failed_create(&self, wait_event: &Arc<Event>, ctx: &NormalContext) {
        log::info!("PnpPackage: {:?} cleaning up after a failed create", self.device);

        if !self.pnp_machine.accepts(PnpEvent::Remove) {
            log::warn!(
                "PnpPackage: {:?} cannot take a remove in {:?}",
                self.device,
                self.pnp_state()
            );
            self.process_delayed_deletion(ctx);
            return;
        }

        wait_event.clear();
        *self.remove_processed.lock() = Some(Arc::clone(wait_event));

        if self.pnp_process_event(PnpEvent::Remove) == PostOutcome::Discarded {
            log::warn!("PnpPackage: {:?} presence machine refused the remove", self.device);
            self.remove_processed.lock().take();
            self.process_delayed_deletion(ctx);
            return;
        }

        wait_event.wait(ctx);
        self.remove_processed.lock().take();
        self.delete_device(ctx);
    }

    // =========================================================================
    // FAILURE REPORTING
    // =========================================================================

    /// Mark the device failed and have the system requery its state
    pub fn set_internal_failure(&self) {
        self.internal_failure.store(true, Ordering::Release);

        match &self.physical {
            Some(physical) => physical.invalidate_device_state(self.device),
            None => log::warn!("PnpPackage: {:?} has no physical device to invalidate", self.device),
        }
    }

    /// Report a driver-detected failure
    pub fn set_device_failed(&self, action: FailedAction) {
        log::error!("PnpPackage: {:?} failed, {:?}", self.device, action);
        *self.failed_action.lock() = Some(action);
        self.set_internal_failure();
        self.pnp_process_event(PnpEvent::DeviceFailed);
    }

    // =========================================================================
    // POWER THREAD AND INTERFACES
    // =========================================================================

    fn power_thread_name(&self) -> String {
        format!("dfx-power-{}", self.device.as_u64())
    }

    pub fn create_power_thread(&self, ctx: &NormalContext) -> DfxResult<()> {
        self.power_thread.create_power_thread(&self.power_thread_name(), ctx)
    }

    /// Borrow the stack's power thread, or create one
    pub fn acquire_power_thread(&self, ctx: &NormalContext) -> DfxResult<()> {
        self.power_thread
            .acquire_power_thread(self.lower.as_ref(), &self.power_thread_name(), ctx)
    }

    pub fn has_power_thread(&self) -> bool {
        self.power_thread.has_thread()
    }

    /// Interface handed to the device above; referenced on return
    pub fn query_power_thread_interface(&self) -> Option<PowerThreadInterface> {
        self.power_thread.query_interface()
    }

    pub fn release_power_thread(&self, ctx: &NormalContext) {
        let had_thread = self.power_thread.has_thread();
        self.power_thread.release_power_thread(ctx);
        if had_thread {
            self.record(TeardownStep::PowerThreadReleased);
        }
    }

    pub fn release_reenumeration_interface(&self) {
        if self.reenumeration.lock().take().is_some() {
            self.record(TeardownStep::ReenumerationReleased);
        }
    }

    /// Ask the bus to enumerate this device again
    pub fn reenumerate_self(&self) -> DfxResult<()> {
        let interface = self.reenumeration.lock().clone();
        match interface {
            Some(interface) => {
                interface.reenumerate_self();
                Ok(())
            },
            None => Err(dfx_error!(
                ErrorKind::InterfaceUnavailable,
                "no reenumeration interface"
            )),
        }
    }

    // =========================================================================
    // CAPABILITIES
    // =========================================================================

    /// Capture the stack's capabilities report
    pub fn query_for_capabilities(&self) -> DfxResult<()> {
        let Some(lower) = &self.lower else {
            return Err(dfx_error!(
                ErrorKind::CapabilityQueryDeclined,
                "no lower device to query"
            ));
        };

        match lower.query_capabilities() {
            Ok(reported) => {
                self.caps.lock().capture(&reported);
                Ok(())
            },
            Err(status) => Err(dfx_error!(
                ErrorKind::CapabilityQueryDeclined,
                "stack declined the capability query"
            )
            .with_status(status)),
        }
    }

    /// Capability overrides; setters fail once the device was queried
    pub fn capabilities(&self) -> spin::MutexGuard<'_, Capabilities> {
        self.caps.lock()
    }

    pub fn pnp_caps_internal(&self) -> u32 {
        self.caps.lock().pnp_caps_internal()
    }

    // =========================================================================
    // INTERRUPTS
    // =========================================================================

    pub fn create_interrupt(&self, interrupt: Interrupt) {
        self.interrupts.write().push(interrupt);
    }

    pub fn interrupt_counts(&self) -> InterruptCounts {
        interrupts::interrupt_counts(&self.interrupts.read())
    }

    /// Apply the driver's interrupt policy to a requirements list
    pub fn filter_resource_requirements(&self, list: Option<&mut ResourceRequirementsList>) {
        interrupts::filter_resource_requirements(&self.interrupts.read(), list);
    }

    // =========================================================================
    // POLICY SETTINGS
    // =========================================================================

    pub fn policy_settings(&self) -> PolicySettings {
        *self.policy_settings.lock()
    }

    pub fn set_idle_enabled(&self, enabled: bool) {
        self.policy_settings.lock().idle.set_enabled(enabled);
    }

    pub fn set_wake_enabled(&self, enabled: bool) {
        self.policy_settings.lock().wake.set_enabled(enabled);
    }

    pub fn set_can_save_state(&self, can_save: bool) {
        self.policy_settings.lock().can_save_state = can_save;
    }

    /// Persist dirty idle and wake settings; owner only
    pub fn save_state(&self, use_can_save_state: bool, ctx: &NormalContext) -> SaveOutcome {
        if !self.power_policy_owner {
            return SaveOutcome::default();
        }

        let mut snapshot = *self.policy_settings.lock();
        let outcome = settings::save_state(
            &mut snapshot,
            self.settings_store.as_ref(),
            use_can_save_state,
            ctx,
        );

        let mut current = self.policy_settings.lock();
        if outcome.idle_written && current.idle.enabled == snapshot.idle.enabled {
            current.idle.dirty = false;
        }
        if outcome.wake_written && current.wake.enabled == snapshot.wake.enabled {
            current.wake.dirty = false;
        }
        outcome
    }
}

#[cfg(test)]
impl PnpPackage {
    /// Wait until the event worker has run everything queued so far
    pub(crate) fn settle_event_worker(&self, ctx: &NormalContext) {
        let done = Arc::new(Event::notification());
        let signal = Arc::clone(&done);
        if self.event_worker.queue_work_item(Box::new(move || signal.set())) {
            done.wait(ctx);
        }
    }
}

impl MachineHost for PnpPackage {
    fn is_machine_thread(&self, kind: MachineKind) -> bool {
        match kind {
            MachineKind::Power | MachineKind::PowerPolicy if self.power_thread.has_thread() => {
                self.power_thread.is_current_thread()
            },
            _ => self.event_worker.is_current_thread(),
        }
    }

    fn schedule(&self, kind: MachineKind) -> bool {
        let package = self.self_ref.clone();
        let item = Box::new(move || {
            if let Some(package) = package.upgrade() {
                package.run_deferred(kind);
            }
        });

        match kind {
            MachineKind::Power | MachineKind::PowerPolicy if self.power_thread.has_thread() => {
                self.power_thread.enqueue(item)
            },
            _ => self.event_worker.queue_work_item(item),
        }
    }
}

impl Drop for PnpPackage {
    fn drop(&mut self) {
        // The last reference may go away on the worker itself
        if self.event_worker.is_current_thread() {
            return;
        }

        if let Some(ctx) = NormalContext::acquire() {
            self.event_worker.exit_thread(&ctx);
        }
    }
}
