//! # Device Power Machine
//!
//! Moves the device between D0 and a low-power state. The driver's D0 entry
//! and exit routines run under a [`Watchdog`]; queue power state is pushed
//! through the I/O package. This machine emits no events.

use core::fmt;
use std::time::{Duration, Instant};

use crate::io::StopAction;
use crate::pnp::caps::DevicePowerState;
use crate::pnp::machine::StateEntry;
use crate::pnp::PnpPackage;
use crate::verifier::{bug_check, BugCheckCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    D3Final,
    D0,
    Dx,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerEvent {
    D0,
    Dx,
}

// =============================================================================
// WATCHDOG
// =============================================================================

/// Driver power routine being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PowerRoutine {
    D0Entry = 1,
    D0Exit = 2,
}

impl fmt::Display for PowerRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerRoutine::D0Entry => f.write_str("D0Entry"),
            PowerRoutine::D0Exit => f.write_str("D0Exit"),
        }
    }
}

/// Guards driver power routines against running too long
pub trait Watchdog: Send + Sync {
    fn arm(&self, routine: PowerRoutine);

    fn disarm(&self);
}

/// Default time a power routine may take
pub const DEFAULT_POWER_ROUTINE_TIMEOUT: Duration = Duration::from_secs(600);

/// Watchdog that checks the deadline when the routine returns
#[derive(Debug)]
pub struct DeadlineWatchdog {
    timeout: Duration,
    armed: spin::Mutex<Option<(PowerRoutine, Instant)>>,
}

impl Default for DeadlineWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_POWER_ROUTINE_TIMEOUT)
    }
}

impl DeadlineWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: spin::Mutex::new(None),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }
}

impl Watchdog for DeadlineWatchdog {
    fn arm(&self, routine: PowerRoutine) {
        *self.armed.lock() = Some((routine, Instant::now()));
    }

    fn disarm(&self) {
        let Some((routine, started)) = self.armed.lock().take() else {
            return;
        };

        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            log::error!(
                "PnpPackage: {} ran for {:?}, limit {:?}",
                routine,
                elapsed,
                self.timeout
            );
            bug_check(
                BugCheckCode::PowerRoutineTimedOut,
                routine as u64,
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            );
        }
    }
}

// =============================================================================
// ENTRY FUNCTIONS
// =============================================================================

fn d0(pkg: &PnpPackage) -> Option<PowerState> {
    let status = pkg.run_power_routine(PowerRoutine::D0Entry, DevicePowerState::D3);
    if !status.is_success() {
        log::error!("PnpPackage: {:?} D0 entry failed: {}", pkg.device(), status);
        return Some(PowerState::Failed);
    }

    pkg.io().resume_processing_for_power();
    None
}

fn dx(pkg: &PnpPackage) -> Option<PowerState> {
    pkg.io().stop_processing_for_power(StopAction::Hold);

    let status = pkg.run_power_routine(PowerRoutine::D0Exit, DevicePowerState::D3);
    if !status.is_success() {
        log::warn!("PnpPackage: {:?} D0 exit returned {}", pkg.device(), status);
    }
    None
}

fn failed(pkg: &PnpPackage) -> Option<PowerState> {
    pkg.io().stop_processing_for_power(StopAction::Purge);
    None
}

pub(crate) static POWER_TABLE: [StateEntry<PowerState, PowerEvent, PnpPackage>; 4] = [
    StateEntry {
        state: PowerState::D3Final,
        on_entry: None,
        transitions: &[(PowerEvent::D0, PowerState::D0)],
        serialize_externally: false,
    },
    StateEntry {
        state: PowerState::D0,
        on_entry: Some(d0),
        transitions: &[(PowerEvent::Dx, PowerState::Dx)],
        serialize_externally: false,
    },
    StateEntry {
        state: PowerState::Dx,
        on_entry: Some(dx),
        transitions: &[(PowerEvent::D0, PowerState::D0)],
        serialize_externally: false,
    },
    StateEntry {
        state: PowerState::Failed,
        on_entry: Some(failed),
        transitions: &[(PowerEvent::D0, PowerState::D0)],
        serialize_externally: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_within_deadline() {
        let watchdog = DeadlineWatchdog::default();
        watchdog.arm(PowerRoutine::D0Entry);
        assert!(watchdog.is_armed());
        watchdog.disarm();
        assert!(!watchdog.is_armed());

        // Disarming twice is harmless
        watchdog.disarm();
    }

    #[test]
    #[should_panic(expected = "framework violation")]
    fn test_watchdog_overrun_is_fatal() {
        let watchdog = DeadlineWatchdog::new(Duration::from_millis(1));
        watchdog.arm(PowerRoutine::D0Exit);
        std::thread::sleep(Duration::from_millis(20));
        watchdog.disarm();
    }
}
