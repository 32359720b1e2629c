//! # Status Codes and Error Handling
//!
//! Two layers of error reporting live here:
//!
//! - [`Status`]: the small closed set of completion codes handed verbatim to
//!   the underlying request primitive. Every dispatched request ends with one.
//! - [`DfxError`]: rich errors returned from configuration and lifecycle
//!   operations, classified by [`ErrorKind`].
//!
//! ## Error Categories
//!
//! | Category | Range | Outcome | Example |
//! |----------|-------|---------|---------|
//! | Contract | 100-199 | Fatal diagnostic | Second pending lifecycle request |
//! | Resource | 200-299 | Reservation fallback or request fails | Request allocation failed |
//! | Policy | 300-399 | Request fails, device healthy | No queue configured |
//! | Feature | 400-499 | Feature treated as absent | Capability query declined |
//! | Internal | 800-899 | Device marked failed | Thread creation failed |

use core::fmt;

// =============================================================================
// STATUS
// =============================================================================

/// Completion status passed to the request primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    /// Operation completed
    Success               = 0x0000_0000,

    /// Operation accepted, completion happens later
    Pending               = 0x0000_0103,

    /// Request was cancelled before completion
    Cancelled             = 0xC000_0120,

    /// Invalid parameter or request type
    InvalidParameter      = 0xC000_000D,

    /// Device cannot take this request in its current state
    InvalidDeviceState    = 0xC000_0184,

    /// Allocation failed
    InsufficientResources = 0xC000_009A,

    /// Generic failure
    Unsuccessful          = 0xC000_0001,
}

impl Status {
    /// Raw status code
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Success or informational codes (pending counts as success)
    pub const fn is_success(self) -> bool {
        (self as u32) < 0x8000_0000
    }

    /// Error codes
    pub const fn is_error(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#010x})", self, self.code())
    }
}

// =============================================================================
// ERROR KIND
// =============================================================================

/// Classification of framework errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    // -------------------------------------------------------------------------
    // Contract Violations (100-199)
    // -------------------------------------------------------------------------
    /// A default queue is already configured
    DefaultQueueAlreadyConfigured = 100,

    /// A state-changing lifecycle request is already pending
    LifecycleRequestPending = 101,

    /// An interceptor changed the declared request type
    InterceptorTypeChanged = 102,

    /// Blocking operation attempted from elevated context
    ExecutionContext = 103,

    /// Object handed to the cleanup engine twice
    AlreadyQueuedForDisposal = 104,

    // -------------------------------------------------------------------------
    // Resource Exhaustion (200-299)
    // -------------------------------------------------------------------------
    /// Request allocation failed
    AllocationFailed = 200,

    /// Reserved request pool is empty
    ReservationExhausted = 201,

    /// Worker thread could not be created
    ThreadCreationFailed = 202,

    // -------------------------------------------------------------------------
    // Policy Rejection (300-399)
    // -------------------------------------------------------------------------
    /// No queue is configured for the request type
    NotConfigured = 300,

    /// Queue or device is not accepting requests
    NotAccepting = 301,

    /// Object is in the wrong state for the operation
    InvalidState = 302,

    /// Invalid argument provided
    InvalidArgument = 303,

    /// Parent object does not belong to this device
    ForeignParent = 304,

    /// Value can no longer be changed
    Immutable = 305,

    // -------------------------------------------------------------------------
    // Feature Absence (400-499)
    // -------------------------------------------------------------------------
    /// Optional interface not provided by the stack
    InterfaceUnavailable = 400,

    /// Capability query declined by the stack
    CapabilityQueryDeclined = 401,

    // -------------------------------------------------------------------------
    // Internal Errors (800-899)
    // -------------------------------------------------------------------------
    /// Internal error (bug)
    InternalError = 800,
}

impl ErrorKind {
    /// Get the error category name
    pub const fn category(&self) -> &'static str {
        match *self as u32 {
            100..=199 => "Contract",
            200..=299 => "Resource",
            300..=399 => "Policy",
            400..=499 => "Feature",
            800..=899 => "Internal",
            _ => "Unknown",
        }
    }

    /// Device stays healthy after this error
    pub const fn is_recoverable(&self) -> bool {
        matches!(*self as u32, 200..=499)
    }

    /// Contract violations are never silently corrected
    pub const fn is_fatal(&self) -> bool {
        matches!(*self as u32, 100..=199)
    }

    /// Status reported when this error surfaces on a request
    pub const fn default_status(&self) -> Status {
        match self {
            ErrorKind::DefaultQueueAlreadyConfigured => Status::Unsuccessful,
            ErrorKind::LifecycleRequestPending => Status::InvalidDeviceState,
            ErrorKind::InterceptorTypeChanged => Status::InvalidParameter,
            ErrorKind::ExecutionContext => Status::InvalidDeviceState,
            ErrorKind::AlreadyQueuedForDisposal => Status::InvalidDeviceState,
            ErrorKind::AllocationFailed => Status::InsufficientResources,
            ErrorKind::ReservationExhausted => Status::InsufficientResources,
            ErrorKind::ThreadCreationFailed => Status::InsufficientResources,
            ErrorKind::NotConfigured => Status::InvalidDeviceState,
            ErrorKind::NotAccepting => Status::InvalidDeviceState,
            ErrorKind::InvalidState => Status::InvalidDeviceState,
            ErrorKind::InvalidArgument => Status::InvalidParameter,
            ErrorKind::ForeignParent => Status::InvalidDeviceState,
            ErrorKind::Immutable => Status::InvalidDeviceState,
            ErrorKind::InterfaceUnavailable => Status::Unsuccessful,
            ErrorKind::CapabilityQueryDeclined => Status::Unsuccessful,
            ErrorKind::InternalError => Status::Unsuccessful,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// FRAMEWORK ERROR
// =============================================================================

/// Framework error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfxError {
    /// Error classification
    kind: ErrorKind,

    /// Status reported to the caller
    status: Status,

    /// Human-readable message
    message: &'static str,

    /// Optional detailed message
    details: Option<String>,
}

impl DfxError {
    /// Create new error with kind and message
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message,
            details: None,
        }
    }

    /// Add details to error
    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the reported status
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get reported status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get message
    pub fn message(&self) -> &str {
        self.message
    }

    /// Get details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Check if recoverable
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    /// Check if fatal
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for DfxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.category(), self.message)?;

        if let Some(ref details) = self.details {
            write!(f, ": {}", details)?;
        }

        write!(f, " ({})", self.status)
    }
}

impl std::error::Error for DfxError {}

impl From<DfxError> for Status {
    fn from(err: DfxError) -> Self {
        err.status
    }
}

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Result type for framework operations
pub type DfxResult<T> = Result<T, DfxError>;

// =============================================================================
// MACROS
// =============================================================================

/// Create a framework error
#[macro_export]
macro_rules! dfx_error {
    ($kind:expr, $msg:literal) => {
        $crate::error::DfxError::new($kind, $msg)
    };
    ($kind:expr, $msg:literal, $($arg:tt)*) => {
        $crate::error::DfxError::new($kind, $msg)
            .with_details(::std::format!($($arg)*))
    };
}

/// Return early with an error
#[macro_export]
macro_rules! dfx_bail {
    ($kind:expr, $msg:literal) => {
        return Err($crate::dfx_error!($kind, $msg))
    };
    ($kind:expr, $msg:literal, $($arg:tt)*) => {
        return Err($crate::dfx_error!($kind, $msg, $($arg)*))
    };
}

/// Ensure a condition is true, otherwise return error
#[macro_export]
macro_rules! dfx_ensure {
    ($cond:expr, $kind:expr, $msg:literal) => {
        if !$cond {
            $crate::dfx_bail!($kind, $msg);
        }
    };
    ($cond:expr, $kind:expr, $msg:literal, $($arg:tt)*) => {
        if !$cond {
            $crate::dfx_bail!($kind, $msg, $($arg)*);
        }
    };
}

// =============================================================================
// TESTS
// =============================================================================
