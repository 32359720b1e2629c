//! Power-policy machine.
//!
//! Decides when the device enters and leaves D0. Emits device-power events
//! and, for the power-policy owner, device-power-requirement events.

use crate::irql::NormalContext;
use crate::pnp::machine::StateEntry;
use crate::pnp::power::{PowerEvent, PowerState};
use crate::pnp::requirement::RequirementEvent;
use crate::pnp::PnpPackage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyState {
    ObjectCreated,
    Starting,
    Started,
    StartFailed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyEvent {
    Start,
    Stop,
}

fn starting(pkg: &PnpPackage) -> Option<PolicyState> {
    if pkg.is_power_policy_owner() && pkg.needs_power_thread() {
        match NormalContext::acquire() {
            Some(ctx) => {
                if let Err(err) = pkg.acquire_power_thread(&ctx) {
                    log::warn!("PnpPackage: {:?} has no power thread: {}", pkg.device(), err);
                }
            },
            None => log::warn!("PnpPackage: {:?} power thread not acquired at elevated level", pkg.device()),
        }
    }

    pkg.power_process_event(PowerEvent::D0);
    if pkg.power_state() != PowerState::D0 {
        return Some(PolicyState::StartFailed);
    }

    if pkg.is_power_policy_owner() {
        pkg.power_requirement_process_event(RequirementEvent::Required);
    }
    Some(PolicyState::Started)
}

fn stopping(pkg: &PnpPackage) -> Option<PolicyState> {
    if pkg.is_power_policy_owner() {
        pkg.power_requirement_process_event(RequirementEvent::NotRequired);
    }

    pkg.power_process_event(PowerEvent::Dx);

    if let Some(ctx) = NormalContext::acquire() {
        pkg.save_state(false, &ctx);
    }
    Some(PolicyState::Stopped)
}

pub(crate) static POLICY_TABLE: [StateEntry<PolicyState, PolicyEvent, PnpPackage>; 6] = [
    StateEntry {
        state: PolicyState::ObjectCreated,
        on_entry: None,
        transitions: &[(PolicyEvent::Start, PolicyState::Starting)],
        serialize_externally: false,
    },
    StateEntry {
        state: PolicyState::Starting,
        on_entry: Some(starting),
        transitions: &[],
        serialize_externally: false,
    },
    StateEntry {
        state: PolicyState::Started,
        on_entry: None,
        transitions: &[(PolicyEvent::Stop, PolicyState::Stopping)],
        serialize_externally: false,
    },
    StateEntry {
        state: PolicyState::StartFailed,
        on_entry: None,
        transitions: &[
            (PolicyEvent::Start, PolicyState::Starting),
            (PolicyEvent::Stop, PolicyState::Stopped),
        ],
        serialize_externally: false,
    },
    StateEntry {
        state: PolicyState::Stopping,
        on_entry: Some(stopping),
        transitions: &[],
        serialize_externally: false,
    },
    StateEntry {
        state: PolicyState::Stopped,
        on_entry: None,
        transitions: &[(PolicyEvent::Start, PolicyState::Starting)],
        serialize_externally: false,
    },
];
