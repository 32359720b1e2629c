//! Device-power-requirement machine, present on the power-policy owner only.

use crate::pnp::machine::StateEntry;
use crate::pnp::PnpPackage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementState {
    NotRequired,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementEvent {
    Required,
    NotRequired,
}

fn required(pkg: &PnpPackage) -> Option<RequirementState> {
    log::debug!("PnpPackage: {:?} device power required", pkg.device());
    None
}

fn not_required(pkg: &PnpPackage) -> Option<RequirementState> {
    log::debug!("PnpPackage: {:?} device power no longer required", pkg.device());
    None
}

pub(crate) static REQUIREMENT_TABLE: [StateEntry<RequirementState, RequirementEvent, PnpPackage>; 2] = [
    StateEntry {
        state: RequirementState::NotRequired,
        on_entry: Some(not_required),
        transitions: &[(RequirementEvent::Required, RequirementState::Required)],
        serialize_externally: false,
    },
    StateEntry {
        state: RequirementState::Required,
        on_entry: Some(required),
        transitions: &[(RequirementEvent::NotRequired, RequirementState::NotRequired)],
        serialize_externally: false,
    },
];
