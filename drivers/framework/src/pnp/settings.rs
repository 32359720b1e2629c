//! Persisted power-policy settings.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::Status;
use crate::irql::NormalContext;

/// Value name for the idle-in-working-state setting
pub const IDLE_ENABLED_VALUE_NAME: &str = "IdleInWorkingState";

/// Value name for the wake-from-sleep setting
pub const WAKE_ENABLED_VALUE_NAME: &str = "WakeFromSleepState";

/// Device settings key
pub trait SettingsStore: Send + Sync {
    fn write_u32(&self, name: &str, value: u32) -> Result<(), Status>;

    fn read_u32(&self, name: &str) -> Option<u32>;
}

/// Settings store kept in memory
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: spin::Mutex<HashMap<String, u32>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SettingsStore for MemorySettingsStore {
    fn write_u32(&self, name: &str, value: u32) -> Result<(), Status> {
        self.values.lock().insert(String::from(name), value);
        Ok(())
    }

    fn read_u32(&self, name: &str) -> Option<u32> {
        self.values.lock().get(name).copied()
    }
}

/// One user-controllable policy setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicySetting {
    pub enabled: bool,
    /// Changed since the last save
    pub dirty: bool,
    /// User may override it
    pub overridable: bool,
}

impl PolicySetting {
    pub const fn new(enabled: bool, overridable: bool) -> Self {
        Self {
            enabled,
            dirty: false,
            overridable,
        }
    }

    /// Change the value and mark it for saving
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.dirty = true;
        }
    }

    fn needs_save(&self) -> bool {
        self.overridable && self.dirty
    }
}

/// Idle and wake settings of the power-policy owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    pub idle: PolicySetting,
    pub wake: PolicySetting,
    /// Cleared while a system power transition forbids touching the store
    pub can_save_state: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            idle: PolicySetting::default(),
            wake: PolicySetting::default(),
            can_save_state: true,
        }
    }
}

/// Values written by one [`save_state`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveOutcome {
    pub idle_written: bool,
    pub wake_written: bool,
}

/// Write dirty, overridable settings through `store`
///
/// Write failures are logged and otherwise ignored; the setting stays dirty
/// so the next save retries it.
pub fn save_state(
    settings: &mut PolicySettings,
    store: Option<&Arc<dyn SettingsStore>>,
    use_can_save_state: bool,
    _ctx: &NormalContext,
) -> SaveOutcome {
    let mut outcome = SaveOutcome::default();

    if use_can_save_state && !settings.can_save_state {
        log::debug!("PnpPackage: not saving wake settings during a system power transition");
        return outcome;
    }

    if !settings.idle.dirty && !settings.wake.dirty {
        return outcome;
    }

    if !settings.idle.overridable && !settings.wake.overridable {
        return outcome;
    }

    let Some(store) = store else {
        log::warn!("PnpPackage: no settings store, policy settings not saved");
        return outcome;
    };

    if settings.idle.needs_save() {
        match store.write_u32(IDLE_ENABLED_VALUE_NAME, u32::from(settings.idle.enabled)) {
            Ok(()) => {
                settings.idle.dirty = false;
                outcome.idle_written = true;
            },
            Err(status) => log::warn!("PnpPackage: saving {} failed: {}", IDLE_ENABLED_VALUE_NAME, status),
        }
    }

    if settings.wake.needs_save() {
        match store.write_u32(WAKE_ENABLED_VALUE_NAME, u32::from(settings.wake.enabled)) {
            Ok(()) => {
                settings.wake.dirty = false;
                outcome.wake_written = true;
            },
            Err(status) => log::warn!("PnpPackage: saving {} failed: {}", WAKE_ENABLED_VALUE_NAME, status),
        }
    }

    outcome
}
