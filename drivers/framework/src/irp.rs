//! # Request Messages
//!
//! [`Irp`] is the message delivered by the kernel for every device
//! operation. It is owned and moved: completing or forwarding consumes it,
//! so a message can reach exactly one terminal outcome.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Status;
use crate::irql::NormalContext;
use crate::pnp::caps::DeviceCapabilities;
use crate::pnp::interrupts::ResourceRequirementsList;
use crate::pnp::power_thread::PowerThreadInterface;
use crate::sync::Event;

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Major request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestType {
    Create = 0,
    CreateNamedPipe = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    QueryInformation = 5,
    SetInformation = 6,
    FlushBuffers = 7,
    DeviceControl = 8,
    InternalDeviceControl = 9,
    Shutdown = 10,
    Cleanup = 11,
    Power = 12,
    SystemControl = 13,
    Pnp = 14,
}

impl RequestType {
    /// Number of request types
    pub const COUNT: usize = 15;

    /// Every request type, in table order
    pub const ALL: [RequestType; Self::COUNT] = [
        RequestType::Create,
        RequestType::CreateNamedPipe,
        RequestType::Close,
        RequestType::Read,
        RequestType::Write,
        RequestType::QueryInformation,
        RequestType::SetInformation,
        RequestType::FlushBuffers,
        RequestType::DeviceControl,
        RequestType::InternalDeviceControl,
        RequestType::Shutdown,
        RequestType::Cleanup,
        RequestType::Power,
        RequestType::SystemControl,
        RequestType::Pnp,
    ];

    /// Dispatch table index
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Types an interceptor may be registered for
    pub const fn is_interceptable(self) -> bool {
        matches!(
            self,
            RequestType::Read
                | RequestType::Write
                | RequestType::DeviceControl
                | RequestType::InternalDeviceControl
        )
    }

    /// Handled by the lifecycle orchestrator rather than the queues
    pub const fn is_lifecycle(self) -> bool {
        matches!(self, RequestType::Pnp | RequestType::Power)
    }
}

static_assertions::const_assert_eq!(RequestType::Pnp as usize + 1, RequestType::COUNT);

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Presence (plug and play) minor codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PnpMinor {
    StartDevice = 0x00,
    QueryRemoveDevice = 0x01,
    RemoveDevice = 0x02,
    CancelRemoveDevice = 0x03,
    StopDevice = 0x04,
    QueryStopDevice = 0x05,
    CancelStopDevice = 0x06,
    QueryDeviceRelations = 0x07,
    QueryInterface = 0x08,
    QueryCapabilities = 0x09,
    QueryResources = 0x0A,
    QueryResourceRequirements = 0x0B,
    FilterResourceRequirements = 0x0D,
    QueryPnpDeviceState = 0x14,
    DeviceUsageNotification = 0x16,
    SurpriseRemoval = 0x17,
}

impl PnpMinor {
    /// Decode a raw minor code
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => PnpMinor::StartDevice,
            0x01 => PnpMinor::QueryRemoveDevice,
            0x02 => PnpMinor::RemoveDevice,
            0x03 => PnpMinor::CancelRemoveDevice,
            0x04 => PnpMinor::StopDevice,
            0x05 => PnpMinor::QueryStopDevice,
            0x06 => PnpMinor::CancelStopDevice,
            0x07 => PnpMinor::QueryDeviceRelations,
            0x08 => PnpMinor::QueryInterface,
            0x09 => PnpMinor::QueryCapabilities,
            0x0A => PnpMinor::QueryResources,
            0x0B => PnpMinor::QueryResourceRequirements,
            0x0D => PnpMinor::FilterResourceRequirements,
            0x14 => PnpMinor::QueryPnpDeviceState,
            0x16 => PnpMinor::DeviceUsageNotification,
            0x17 => PnpMinor::SurpriseRemoval,
            _ => return None,
        })
    }

    /// Requests that move the presence machine and must pend one at a time
    pub const fn is_state_changing(self) -> bool {
        matches!(
            self,
            PnpMinor::StartDevice
                | PnpMinor::QueryRemoveDevice
                | PnpMinor::RemoveDevice
                | PnpMinor::CancelRemoveDevice
                | PnpMinor::StopDevice
                | PnpMinor::QueryStopDevice
                | PnpMinor::CancelStopDevice
                | PnpMinor::SurpriseRemoval
        )
    }
}

/// Power minor codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PowerMinor {
    WaitWake = 0x00,
    PowerSequence = 0x01,
    SetPower = 0x02,
    QueryPower = 0x03,
}

impl PowerMinor {
    /// Decode a raw minor code
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => PowerMinor::WaitWake,
            0x01 => PowerMinor::PowerSequence,
            0x02 => PowerMinor::SetPower,
            0x03 => PowerMinor::QueryPower,
            _ => return None,
        })
    }
}

// =============================================================================
// IRP
// =============================================================================

bitflags! {
    /// Message state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrpFlags: u32 {
        /// Completion will be reported asynchronously
        const PENDING_RETURNED = 1 << 0;
        /// Current stack location skipped for forwarding
        const FORWARDED        = 1 << 1;
    }
}

/// Identity of the file object a request was issued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerTag(pub u64);

/// Type-specific parameters
#[derive(Debug, Clone, Default)]
pub enum IrpParameters {
    #[default]
    None,
    /// Resource requirements being filtered on the way up the stack
    ResourceRequirements(ResourceRequirementsList),
    /// Capabilities report filled in on the way up the stack
    Capabilities(Box<DeviceCapabilities>),
}

/// Completion report delivered to a [`CompletionSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub irp_id: u64,
    pub major: RequestType,
    pub minor: u8,
    pub status: Status,
    pub information: usize,
    pub pending_returned: bool,
}

/// Receiver of completed messages (the issuer)
pub trait CompletionSink: Send + Sync {
    fn irp_completed(&self, record: CompletionRecord);
}

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// Device request message
pub struct Irp {
    id: u64,
    major: RequestType,
    minor: u8,
    ioctl: u32,
    owner: Option<OwnerTag>,
    status: Status,
    information: usize,
    flags: IrpFlags,
    parameters: IrpParameters,
    remove_lock: Option<RemoveLockToken>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("major", &self.major)
            .field("minor", &self.minor)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Irp {
    /// New message of the given major type
    pub fn new(major: RequestType) -> Self {
        Self {
            id: NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed),
            major,
            minor: 0,
            ioctl: 0,
            owner: None,
            status: Status::Success,
            information: 0,
            flags: IrpFlags::empty(),
            parameters: IrpParameters::None,
            remove_lock: None,
            sink: None,
        }
    }

    /// Presence request
    pub fn pnp(minor: PnpMinor) -> Self {
        Self::new(RequestType::Pnp).with_minor(minor as u8)
    }

    /// Power request
    pub fn power(minor: PowerMinor) -> Self {
        Self::new(RequestType::Power).with_minor(minor as u8)
    }

    pub fn with_minor(mut self, minor: u8) -> Self {
        self.minor = minor;
        self
    }

    pub fn with_ioctl(mut self, code: u32) -> Self {
        self.ioctl = code;
        self
    }

    pub fn with_owner(mut self, owner: OwnerTag) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_parameters(mut self, parameters: IrpParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn major(&self) -> RequestType {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn pnp_minor(&self) -> Option<PnpMinor> {
        match self.major {
            RequestType::Pnp => PnpMinor::from_code(self.minor),
            _ => None,
        }
    }

    pub fn power_minor(&self) -> Option<PowerMinor> {
        match self.major {
            RequestType::Power => PowerMinor::from_code(self.minor),
            _ => None,
        }
    }

    pub fn ioctl(&self) -> u32 {
        self.ioctl
    }

    pub fn owner(&self) -> Option<OwnerTag> {
        self.owner
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Status set by a lower driver before the message travels back up
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn information(&self) -> usize {
        self.information
    }

    pub fn flags(&self) -> IrpFlags {
        self.flags
    }

    pub fn parameters(&self) -> &IrpParameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut IrpParameters {
        &mut self.parameters
    }

    /// Rewrite the major type; only interceptors misuse this
    pub fn set_major(&mut self, major: RequestType) {
        self.major = major;
    }

    /// Completion will be reported later
    pub fn mark_pending(&mut self) {
        self.flags.insert(IrpFlags::PENDING_RETURNED);
    }

    pub fn is_pending_returned(&self) -> bool {
        self.flags.contains(IrpFlags::PENDING_RETURNED)
    }

    /// Prepare for forwarding unchanged to the next lower device
    pub fn skip_current_stack_location(&mut self) {
        self.flags.insert(IrpFlags::FORWARDED);
    }

    pub fn is_forwarded(&self) -> bool {
        self.flags.contains(IrpFlags::FORWARDED)
    }

    /// Attach the remove-lock reference taken when the message was accepted
    pub fn attach_remove_lock(&mut self, token: RemoveLockToken) {
        self.remove_lock = Some(token);
    }

    pub fn holds_remove_lock(&self) -> bool {
        self.remove_lock.is_some()
    }

    /// Release the remove-lock reference early (before forwarding a removal)
    pub fn release_remove_lock(&mut self) {
        self.remove_lock = None;
    }

    /// Complete the message and report it to the issuer
    pub fn complete(mut self, status: Status, information: usize) {
        self.status = status;
        self.information = information;
        self.remove_lock = None;

        log::trace!(
            "Irp: complete {} {}:{:#x} {}",
            self.id,
            self.major,
            self.minor,
            status
        );

        if let Some(sink) = self.sink.take() {
            sink.irp_completed(CompletionRecord {
                irp_id: self.id,
                major: self.major,
                minor: self.minor,
                status,
                information,
                pending_returned: self.is_pending_returned(),
            });
        }
    }
}

impl Drop for Irp {
    fn drop(&mut self) {
        // A message with an issuer is always answered, even when lost
        let Some(sink) = self.sink.take() else {
            return;
        };

        log::error!(
            "Irp: {} {}:{:#x} dropped without completion",
            self.id,
            self.major,
            self.minor
        );
        self.remove_lock = None;
        sink.irp_completed(CompletionRecord {
            irp_id: self.id,
            major: self.major,
            minor: self.minor,
            status: Status::Cancelled,
            information: 0,
            pending_returned: self.is_pending_returned(),
        });
    }
}

// =============================================================================
// LOWER DEVICE
// =============================================================================

/// Next lower device in the stack
pub trait LowerDevice: Send + Sync {
    /// Send a message down; the lower device owns it from here
    fn call_driver(&self, irp: Irp) -> Status;

    /// Shared power thread offered by the stack below
    fn query_power_thread_interface(&self) -> Option<PowerThreadInterface> {
        None
    }

    /// Capabilities reported by the stack below
    fn query_capabilities(&self) -> Result<DeviceCapabilities, Status> {
        Err(Status::Unsuccessful)
    }
}

// =============================================================================
// REMOVE LOCK
// =============================================================================

#[derive(Debug)]
struct RemoveLockInner {
    // Biased by one until removal starts
    count: AtomicUsize,
    removing: AtomicBool,
    drained: Event,
}

impl RemoveLockInner {
    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.set();
        }
    }
}

/// Counts messages in flight so removal can wait for them
#[derive(Debug, Clone)]
pub struct RemoveLock {
    inner: Arc<RemoveLockInner>,
}

impl Default for RemoveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoveLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RemoveLockInner {
                count: AtomicUsize::new(1),
                removing: AtomicBool::new(false),
                drained: Event::notification(),
            }),
        }
    }

    /// Take a reference; `None` once removal has started
    pub fn acquire(&self) -> Option<RemoveLockToken> {
        if self.inner.removing.load(Ordering::Acquire) {
            return None;
        }

        self.inner.count.fetch_add(1, Ordering::AcqRel);
        if self.inner.removing.load(Ordering::Acquire) {
            self.inner.release();
            return None;
        }

        Some(RemoveLockToken {
            inner: Arc::clone(&self.inner),
        })
    }

    /// References held by messages in flight
    pub fn outstanding(&self) -> usize {
        let count = self.inner.count.load(Ordering::Acquire);
        if self.inner.removing.load(Ordering::Acquire) {
            count
        } else {
            count.saturating_sub(1)
        }
    }

    /// Refuse new references and wait for the outstanding ones
    pub fn release_and_wait(&self, ctx: &NormalContext) {
        if !self.inner.removing.swap(true, Ordering::AcqRel) {
            self.inner.release();
        }
        self.inner.drained.wait(ctx);
    }
}

/// One remove-lock reference, released exactly once on drop
#[derive(Debug)]
pub struct RemoveLockToken {
    inner: Arc<RemoveLockInner>,
}

impl Drop for RemoveLockToken {
    fn drop(&mut self) {
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::thread;

    #[test]
    fn test_request_type_table() {
        for (i, ty) in RequestType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        let interceptable = RequestType::ALL
            .iter()
            .filter(|ty| ty.is_interceptable())
            .count();
        assert_eq!(interceptable, 4);
    }

    #[test]
    fn test_complete_reports_once() {
        let sink = RecordingSink::new();
        let mut irp = Irp::new(RequestType::Read).with_sink(sink.clone());
        let id = irp.id();
        irp.mark_pending();
        irp.complete(Status::Success, 512);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].irp_id, id);
        assert_eq!(records[0].information, 512);
        assert!(records[0].pending_returned);
    }

    #[test]
    fn test_dropped_irp_is_reported_cancelled() {
        let sink = RecordingSink::new();
        let lock = RemoveLock::new();
        let mut irp = Irp::new(RequestType::Write).with_sink(sink.clone());
        irp.attach_remove_lock(lock.acquire().unwrap());
        drop(irp);

        assert_eq!(sink.statuses(), vec![Status::Cancelled]);
        assert_eq!(lock.outstanding(), 0);

        // Completed messages are not reported twice
        Irp::new(RequestType::Read)
            .with_sink(sink.clone())
            .complete(Status::Success, 0);
        assert_eq!(sink.statuses(), vec![Status::Cancelled, Status::Success]);
    }

    #[test]
    fn test_pnp_minor_codes() {
        assert_eq!(PnpMinor::from_code(0x17), Some(PnpMinor::SurpriseRemoval));
        assert_eq!(PnpMinor::from_code(0x0C), None);
        assert!(PnpMinor::StartDevice.is_state_changing());
        assert!(!PnpMinor::QueryCapabilities.is_state_changing());
        assert_eq!(Irp::pnp(PnpMinor::StopDevice).pnp_minor(), Some(PnpMinor::StopDevice));
        assert_eq!(Irp::new(RequestType::Read).pnp_minor(), None);
    }

    #[test]
    fn test_remove_lock_waits_for_tokens() {
        let ctx = NormalContext::require();
        let lock = RemoveLock::new();
        let mut irp = Irp::new(RequestType::Write);
        irp.attach_remove_lock(lock.acquire().unwrap());
        assert_eq!(lock.outstanding(), 1);

        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            irp.complete(Status::Success, 0);
        });

        lock.release_and_wait(&ctx);
        assert_eq!(lock.outstanding(), 0);
        assert!(lock.acquire().is_none());
        handle.join().unwrap();
    }
}
