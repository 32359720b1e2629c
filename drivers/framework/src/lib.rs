//! # Helix Driver Framework Core
//!
//! The per-device machinery a driver framework runs underneath its drivers:
//! request dispatch into queues, the device lifecycle state machines and
//! deferred teardown of framework objects.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Device                                 │
//! │                                                                      │
//! │   Irp ──▶ remove lock ──┬──▶ IoPackage (request directory)           │
//! │                         │      interceptors ▶ dispatch table ▶ queues│
//! │                         │                                            │
//! │                         └──▶ PnpPackage (lifecycle orchestrator)     │
//! │                                presence ▶ power policy ▶ power       │
//! │                                                  └──▶ requirement    │
//! │                                                                      │
//! │   DisposeList ──▶ SystemWorkItem ──▶ deferred_dispose()              │
//! │   WorkerThread: event worker, power thread                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Levels
//!
//! Any thread may be raised with [`irql::ElevatedSection`]. Operations that
//! block take a [`irql::NormalContext`] token, which cannot be obtained while
//! raised, so waiting at elevated level does not type-check.
//!
//! ## Invariants
//!
//! 1. **Single outcome**: every dispatched message is queued, handed to the
//!    in-caller handler, forwarded or completed, exactly once.
//! 2. **Layer order**: the queue directory is kept in descending layer order.
//! 3. **One pending presence request**: a second state-changing presence
//!    request while one is pending is a fatal framework violation.
//! 4. **Teardown order**: the power thread is released before the removal
//!    request travels down the stack.
//! 5. **Dispose once**: an object is on at most one dispose list at a time.

#![forbid(unsafe_code)]

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Status codes, error taxonomy and macros
pub mod error;

/// Fatal diagnostics and framework configuration
pub mod verifier;

/// Execution levels and the normal-context token
pub mod irql;

/// Kernel-style events
pub mod sync;

/// Worker thread and system work item
pub mod thread;

/// Deferred cleanup engine
pub mod dispose;

/// Underlying request message and remove lock
pub mod irp;

/// Framework request and allocation
pub mod request;

/// Queue admission
pub mod queue;

/// Request dispatch and queue directory
pub mod io;

/// Device lifecycle orchestrator
pub mod pnp;

/// Framework device object
pub mod device;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use device::{Device, DeviceId, DeviceInit};
pub use dispose::{Disposable, DisposeLink, DisposeList};
pub use error::{DfxError, DfxResult, ErrorKind, Status};
pub use io::{IoPackage, StopAction};
pub use irp::{Irp, LowerDevice, PnpMinor, PowerMinor, RemoveLock, RequestType};
pub use irql::{ElevatedSection, NormalContext};
pub use pnp::{FailedAction, PnpInit, PnpPackage, PnpPowerCallbacks};
pub use queue::{IoQueue, IoQueueConfig};
pub use request::{Request, RequestAllocator};
pub use sync::Event;
pub use thread::{SystemWorkItem, WorkItem, WorkerThread};
pub use verifier::{BugCheckCode, FrameworkConfig};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Framework version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
