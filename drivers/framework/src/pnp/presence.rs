//! # Presence Machine
//!
//! Tracks the device through add, start, stop and removal. State-changing
//! presence requests pend on entry into the machine and are completed by the
//! state they lead to. This machine only emits power-policy events.
//!
//! ```text
//!  Init ─▶ Added ─▶ Starting ─┬─▶ Started ◀──▶ QueryStopPending ─▶ Stopping ─▶ Stopped
//!                             │      │                                          │
//!                             │      ├─▶ QueryRemovePending ─┐                  │
//!                             │      ├─▶ SurpriseRemoved ────┤                  │
//!                             │      └─▶ Failed ─────────────┤                  │
//!                             └─▶ StartFailed ───────────────┴─▶ Removed ◀──────┘
//! ```

use crate::error::Status;
use crate::irp::PnpMinor;
use crate::irql::NormalContext;
use crate::pnp::machine::StateEntry;
use crate::pnp::policy::{PolicyEvent, PolicyState};
use crate::pnp::{PnpPackage, TeardownStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpState {
    Init,
    Added,
    Starting,
    Started,
    StartFailed,
    QueryStopPending,
    Stopping,
    Stopped,
    QueryRemovePending,
    SurpriseRemoved,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpEvent {
    AddDevice,
    StartDevice,
    QueryStop,
    CancelStop,
    Stop,
    QueryRemove,
    CancelRemove,
    Remove,
    SurpriseRemove,
    DeviceFailed,
}

impl PnpEvent {
    /// Event raised by a state-changing presence request
    pub const fn from_minor(minor: PnpMinor) -> Option<Self> {
        Some(match minor {
            PnpMinor::StartDevice => PnpEvent::StartDevice,
            PnpMinor::QueryStopDevice => PnpEvent::QueryStop,
            PnpMinor::CancelStopDevice => PnpEvent::CancelStop,
            PnpMinor::StopDevice => PnpEvent::Stop,
            PnpMinor::QueryRemoveDevice => PnpEvent::QueryRemove,
            PnpMinor::CancelRemoveDevice => PnpEvent::CancelRemove,
            PnpMinor::RemoveDevice => PnpEvent::Remove,
            PnpMinor::SurpriseRemoval => PnpEvent::SurpriseRemove,
            _ => return None,
        })
    }

    /// Completion status when the current state does not take the event
    pub const fn rejected_status(self) -> Status {
        match self {
            PnpEvent::CancelStop | PnpEvent::CancelRemove => Status::Success,
            _ => Status::InvalidDeviceState,
        }
    }
}

// =============================================================================
// ENTRY FUNCTIONS
// =============================================================================

fn starting(pkg: &PnpPackage) -> Option<PnpState> {
    if let Err(err) = pkg.query_for_capabilities() {
        log::warn!("PnpPackage: {:?} starting without stack capabilities: {}", pkg.device(), err);
    }

    let status = pkg.prepare_hardware();
    if !status.is_success() {
        log::error!("PnpPackage: {:?} prepare hardware failed: {}", pkg.device(), status);
        return Some(PnpState::StartFailed);
    }

    pkg.power_policy_process_event(PolicyEvent::Start);
    if pkg.power_policy_state() == PolicyState::Started {
        Some(PnpState::Started)
    } else {
        log::error!("PnpPackage: {:?} power policy did not start", pkg.device());
        Some(PnpState::StartFailed)
    }
}

fn complete_success(pkg: &PnpPackage) -> Option<PnpState> {
    pkg.complete_pending_pnp_irp(Status::Success);
    None
}

fn start_failed(pkg: &PnpPackage) -> Option<PnpState> {
    pkg.power_policy_process_event(PolicyEvent::Stop);
    pkg.release_hardware();
    pkg.complete_pending_pnp_irp(Status::Unsuccessful);
    None
}

fn stopping(pkg: &PnpPackage) -> Option<PnpState> {
    pkg.power_policy_process_event(PolicyEvent::Stop);
    pkg.release_hardware();
    Some(PnpState::Stopped)
}

fn surprise_removed(pkg: &PnpPackage) -> Option<PnpState> {
    pkg.notify_surprise_removal();
    pkg.power_policy_process_event(PolicyEvent::Stop);
    pkg.io().purge_all();
    pkg.release_hardware();
    pkg.complete_pending_pnp_irp(Status::Success);
    None
}

fn failed(pkg: &PnpPackage) -> Option<PnpState> {
    pkg.power_policy_process_event(PolicyEvent::Stop);
    pkg.io().purge_all();
    pkg.release_hardware();
    None
}

fn removed(pkg: &PnpPackage) -> Option<PnpState> {
    let ctx = NormalContext::require();

    pkg.power_policy_process_event(PolicyEvent::Stop);
    pkg.io().stop_all_queues_for_shutdown();
    pkg.io().purge_all();
    pkg.release_hardware();

    // The power thread goes before the removal travels down the stack
    pkg.cleanup_state_machines(false, &ctx);
    pkg.finish_remove_irp(&ctx);

    match pkg.take_remove_processed() {
        Some(event) => {
            pkg.record(TeardownStep::RemoveProcessed);
            event.set();
        },
        None => pkg.delete_device(&ctx),
    }
    None
}

// =============================================================================
// TABLE
// =============================================================================

pub(crate) static PNP_TABLE: [StateEntry<PnpState, PnpEvent, PnpPackage>; 12] = [
    StateEntry {
        state: PnpState::Init,
        on_entry: None,
        transitions: &[
            (PnpEvent::AddDevice, PnpState::Added),
            (PnpEvent::Remove, PnpState::Removed),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::Added,
        on_entry: None,
        transitions: &[
            (PnpEvent::StartDevice, PnpState::Starting),
            (PnpEvent::Remove, PnpState::Removed),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::Starting,
        on_entry: Some(starting),
        transitions: &[],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::Started,
        on_entry: Some(complete_success),
        transitions: &[
            (PnpEvent::QueryStop, PnpState::QueryStopPending),
            (PnpEvent::QueryRemove, PnpState::QueryRemovePending),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
            (PnpEvent::DeviceFailed, PnpState::Failed),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::StartFailed,
        on_entry: Some(start_failed),
        transitions: &[
            (PnpEvent::Remove, PnpState::Removed),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: true,
    },
    StateEntry {
        state: PnpState::QueryStopPending,
        on_entry: Some(complete_success),
        transitions: &[
            (PnpEvent::Stop, PnpState::Stopping),
            (PnpEvent::CancelStop, PnpState::Started),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::Stopping,
        on_entry: Some(stopping),
        transitions: &[],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::Stopped,
        on_entry: Some(complete_success),
        transitions: &[
            (PnpEvent::StartDevice, PnpState::Starting),
            (PnpEvent::Remove, PnpState::Removed),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PnpState::QueryRemovePending,
        on_entry: Some(complete_success),
        transitions: &[
            (PnpEvent::Remove, PnpState::Removed),
            (PnpEvent::CancelRemove, PnpState::Started),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: true,
    },
    StateEntry {
        state: PnpState::SurpriseRemoved,
        on_entry: Some(surprise_removed),
        transitions: &[(PnpEvent::Remove, PnpState::Removed)],
        serialize_externally: true,
    },
    StateEntry {
        state: PnpState::Failed,
        on_entry: Some(failed),
        transitions: &[
            (PnpEvent::Remove, PnpState::Removed),
            (PnpEvent::SurpriseRemove, PnpState::SurpriseRemoved),
        ],
        serialize_externally: true,
    },
    StateEntry {
        state: PnpState::Removed,
        on_entry: Some(removed),
        transitions: &[],
        serialize_externally: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_state_has_one_row() {
        for (index, entry) in PNP_TABLE.iter().enumerate() {
            let rows = PNP_TABLE.iter().filter(|e| e.state == entry.state).count();
            assert_eq!(rows, 1, "state {:?} at {}", entry.state, index);
        }
    }

    #[test]
    fn test_minor_mapping() {
        assert_eq!(PnpEvent::from_minor(PnpMinor::RemoveDevice), Some(PnpEvent::Remove));
        assert_eq!(PnpEvent::from_minor(PnpMinor::QueryCapabilities), None);
        assert_eq!(PnpEvent::CancelRemove.rejected_status(), Status::Success);
        assert_eq!(PnpEvent::StartDevice.rejected_status(), Status::InvalidDeviceState);
    }

    #[test]
    fn test_flagged_states() {
        let flagged: Vec<PnpState> = PNP_TABLE
            .iter()
            .filter(|entry| entry.serialize_externally)
            .map(|entry| entry.state)
            .collect();
        assert_eq!(
            flagged,
            [
                PnpState::StartFailed,
                PnpState::QueryRemovePending,
                PnpState::SurpriseRemoved,
                PnpState::Failed
            ]
        );
    }
}
