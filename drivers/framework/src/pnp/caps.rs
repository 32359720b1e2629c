//! # Device Capabilities
//!
//! Presence and power capability flags are tri-state: a driver either forces
//! them on or off, or leaves the stack's answer alone. They pack two bits per
//! field into a `u32` so a snapshot is a single copy.
//!
//! The system-to-device power map packs one 4-bit device power state per
//! system power state:
//!
//! ```text
//!  bit 31                                                   bit 0
//!  ┌──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┐
//!  │  S7  │  S6  │  S5  │  S4  │  S3  │  S2  │  S1  │  S0  │
//!  └──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┘
//!   nibble at index * 4, mask 0xF
//! ```
//!
//! Overrides are accepted until the capabilities are first queried.

use core::fmt;

use crate::dfx_ensure;
use crate::error::{DfxResult, ErrorKind};

/// Number of device power state nibbles in the map
pub const POWER_CAP_SLOTS: usize = 8;

/// Width of one map entry
pub const POWER_CAP_BITS: usize = 4;

static_assertions::const_assert!(POWER_CAP_SLOTS * POWER_CAP_BITS == u32::BITS as usize);

/// Sentinel for latencies, address and UI number the driver left unset
pub const CAP_UNSET: u32 = u32::MAX;

// =============================================================================
// POWER STATES
// =============================================================================

/// Device power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum DevicePowerState {
    #[default]
    Unspecified = 0,
    D0 = 1,
    D1 = 2,
    D2 = 3,
    D3 = 4,
    Maximum = 5,
}

impl DevicePowerState {
    /// Decode a raw nibble; unknown values are `None`
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => DevicePowerState::Unspecified,
            1 => DevicePowerState::D0,
            2 => DevicePowerState::D1,
            3 => DevicePowerState::D2,
            4 => DevicePowerState::D3,
            5 => DevicePowerState::Maximum,
            _ => return None,
        })
    }
}

/// System power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum SystemPowerState {
    #[default]
    Unspecified = 0,
    Working = 1,
    Sleeping1 = 2,
    Sleeping2 = 3,
    Sleeping3 = 4,
    Hibernate = 5,
    Shutdown = 6,
    Maximum = 7,
}

/// System states that carry a device state in the stack's report
pub const SYSTEM_STATE_COUNT: usize = SystemPowerState::Maximum as usize;

// =============================================================================
// NIBBLE MAP
// =============================================================================

/// Store `state` in the nibble at `index`, leaving the other nibbles intact
#[inline]
pub fn set_power_cap_state(index: usize, state: u32, result: &mut u32) {
    debug_assert!(index < POWER_CAP_SLOTS);
    let shift = index * POWER_CAP_BITS;
    *result &= !(0xF << shift);
    *result |= (state & 0xF) << shift;
}

/// Read the nibble at `index`
#[inline]
pub fn get_power_cap_state(index: usize, states: u32) -> u32 {
    debug_assert!(index < POWER_CAP_SLOTS);
    let shift = index * POWER_CAP_BITS;
    (states & (0xF << shift)) >> shift
}

/// Map with every reportable system state set to `DevicePowerState::Maximum`
pub fn default_power_cap_map() -> u32 {
    let mut states = 0;
    for index in 0..SYSTEM_STATE_COUNT {
        set_power_cap_state(index, DevicePowerState::Maximum as u32, &mut states);
    }
    states
}

// =============================================================================
// TRI-STATE FLAGS
// =============================================================================

/// Driver override for one capability flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CapSetting {
    False = 0,
    True = 1,
    /// Keep what the stack reports
    #[default]
    UseDefault = 2,
}

impl CapSetting {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => CapSetting::False,
            1 => CapSetting::True,
            _ => CapSetting::UseDefault,
        }
    }

    /// Apply the override to the stack's answer
    pub const fn resolve(self, reported: bool) -> bool {
        match self {
            CapSetting::False => false,
            CapSetting::True => true,
            CapSetting::UseDefault => reported,
        }
    }
}

/// Presence capability fields, by slot in the packed word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PnpCap {
    LockSupported = 0,
    EjectSupported = 1,
    Removable = 2,
    DockDevice = 3,
    UniqueId = 4,
    SilentInstall = 5,
    SurpriseRemovalOk = 6,
    HardwareDisabled = 7,
    NoDisplayInUi = 8,
}

/// Power capability fields, by slot in the packed word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PowerCap {
    DeviceD1 = 0,
    DeviceD2 = 1,
    WakeFromD0 = 2,
    WakeFromD1 = 3,
    WakeFromD2 = 4,
    WakeFromD3 = 5,
}

const fn all_use_default(fields: u32) -> u32 {
    let mut word = 0;
    let mut slot = 0;
    while slot < fields {
        word |= (CapSetting::UseDefault as u32) << (slot * 2);
        slot += 1;
    }
    word
}

const PNP_CAP_FIELDS: u32 = 9;
const POWER_CAP_FIELDS: u32 = 6;

static_assertions::const_assert!(PNP_CAP_FIELDS * 2 <= u32::BITS);

/// Bits of the packed presence word that hold capability fields
pub const PNP_CAP_MASK: u32 = (1 << (PNP_CAP_FIELDS * 2)) - 1;

fn read_slot(word: u32, slot: u32) -> CapSetting {
    CapSetting::from_bits(word >> (slot * 2))
}

fn write_slot(word: &mut u32, slot: u32, setting: CapSetting) {
    *word &= !(0b11 << (slot * 2));
    *word |= (setting as u32) << (slot * 2);
}

// =============================================================================
// STACK REPORT
// =============================================================================

/// Capabilities as reported by the stack (query capabilities response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub lock_supported: bool,
    pub eject_supported: bool,
    pub removable: bool,
    pub dock_device: bool,
    pub unique_id: bool,
    pub silent_install: bool,
    pub surprise_removal_ok: bool,
    pub hardware_disabled: bool,
    pub no_display_in_ui: bool,
    pub device_d1: bool,
    pub device_d2: bool,
    pub wake_from_d0: bool,
    pub wake_from_d1: bool,
    pub wake_from_d2: bool,
    pub wake_from_d3: bool,
    /// Device state per system state, indexed by `SystemPowerState`
    pub device_state: [DevicePowerState; SYSTEM_STATE_COUNT],
    pub system_wake: SystemPowerState,
    pub device_wake: DevicePowerState,
    pub d1_latency: u32,
    pub d2_latency: u32,
    pub d3_latency: u32,
    pub address: u32,
    pub ui_number: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            lock_supported: false,
            eject_supported: false,
            removable: false,
            dock_device: false,
            unique_id: false,
            silent_install: false,
            surprise_removal_ok: false,
            hardware_disabled: false,
            no_display_in_ui: false,
            device_d1: false,
            device_d2: false,
            wake_from_d0: false,
            wake_from_d1: false,
            wake_from_d2: false,
            wake_from_d3: false,
            device_state: [DevicePowerState::Unspecified; SYSTEM_STATE_COUNT],
            system_wake: SystemPowerState::Unspecified,
            device_wake: DevicePowerState::Unspecified,
            d1_latency: 0,
            d2_latency: 0,
            d3_latency: 0,
            address: CAP_UNSET,
            ui_number: CAP_UNSET,
        }
    }
}

// =============================================================================
// DEVICE CAPABILITY STATE
// =============================================================================

/// Driver overrides plus what was captured from the stack
#[derive(Clone, PartialEq, Eq)]
pub struct Capabilities {
    pnp: u32,
    power: u32,
    d1_latency: u32,
    d2_latency: u32,
    d3_latency: u32,
    address: u32,
    ui_number: u32,
    device_wake: DevicePowerState,
    system_wake: SystemPowerState,
    states: u32,
    system_to_device_map: Option<u32>,
    queried: bool,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("pnp", &format_args!("{:#x}", self.pnp))
            .field("power", &format_args!("{:#x}", self.power))
            .field("states", &format_args!("{:#010x}", self.states))
            .field("queried", &self.queried)
            .finish()
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl Capabilities {
    pub fn new() -> Self {
        Self {
            pnp: all_use_default(PNP_CAP_FIELDS),
            power: all_use_default(POWER_CAP_FIELDS),
            d1_latency: CAP_UNSET,
            d2_latency: CAP_UNSET,
            d3_latency: CAP_UNSET,
            address: CAP_UNSET,
            ui_number: CAP_UNSET,
            device_wake: DevicePowerState::Maximum,
            system_wake: SystemPowerState::Maximum,
            states: default_power_cap_map(),
            system_to_device_map: None,
            queried: false,
        }
    }

    fn ensure_mutable(&self) -> DfxResult<()> {
        dfx_ensure!(
            !self.queried,
            ErrorKind::Immutable,
            "capabilities are fixed once queried"
        );
        Ok(())
    }

    pub fn is_queried(&self) -> bool {
        self.queried
    }

    pub fn set_pnp(&mut self, cap: PnpCap, setting: CapSetting) -> DfxResult<()> {
        self.ensure_mutable()?;
        write_slot(&mut self.pnp, cap as u32, setting);
        Ok(())
    }

    pub fn pnp(&self, cap: PnpCap) -> CapSetting {
        read_slot(self.pnp, cap as u32)
    }

    pub fn set_power(&mut self, cap: PowerCap, setting: CapSetting) -> DfxResult<()> {
        self.ensure_mutable()?;
        write_slot(&mut self.power, cap as u32, setting);
        Ok(())
    }

    pub fn power(&self, cap: PowerCap) -> CapSetting {
        read_slot(self.power, cap as u32)
    }

    /// Override the device state used for one system state
    pub fn set_device_state(&mut self, system: SystemPowerState, state: DevicePowerState) -> DfxResult<()> {
        self.ensure_mutable()?;
        dfx_ensure!(
            (system as usize) < SYSTEM_STATE_COUNT,
            ErrorKind::InvalidArgument,
            "system state has no device mapping",
            "{:?}",
            system
        );
        set_power_cap_state(system as usize, state as u32, &mut self.states);
        Ok(())
    }

    pub fn device_state(&self, system: SystemPowerState) -> Option<DevicePowerState> {
        if (system as usize) >= POWER_CAP_SLOTS {
            return None;
        }
        DevicePowerState::from_raw(get_power_cap_state(system as usize, self.states))
    }

    pub fn set_latencies(&mut self, d1: u32, d2: u32, d3: u32) -> DfxResult<()> {
        self.ensure_mutable()?;
        self.d1_latency = d1;
        self.d2_latency = d2;
        self.d3_latency = d3;
        Ok(())
    }

    pub fn set_address(&mut self, address: u32, ui_number: u32) -> DfxResult<()> {
        self.ensure_mutable()?;
        self.address = address;
        self.ui_number = ui_number;
        Ok(())
    }

    pub fn set_wake(&mut self, device_wake: DevicePowerState, system_wake: SystemPowerState) -> DfxResult<()> {
        self.ensure_mutable()?;
        self.device_wake = device_wake;
        self.system_wake = system_wake;
        Ok(())
    }

    /// Packed presence cap bits
    pub fn pnp_caps_internal(&self) -> u32 {
        self.pnp & PNP_CAP_MASK
    }

    /// Packed device state map (driver overrides)
    pub fn power_cap_states(&self) -> u32 {
        self.states
    }

    /// Stack's S→D map captured by the last successful query
    pub fn system_to_device_map(&self) -> Option<u32> {
        self.system_to_device_map
    }

    /// Captured system wake state
    pub fn system_wake(&self) -> SystemPowerState {
        self.system_wake
    }

    /// Record the stack's report and freeze further overrides
    pub fn capture(&mut self, reported: &DeviceCapabilities) {
        let mut states = 0;
        for (index, state) in reported.device_state.iter().enumerate() {
            set_power_cap_state(index, *state as u32, &mut states);
        }

        self.system_wake = reported.system_wake;
        self.system_to_device_map = Some(states);
        self.queried = true;
    }

    /// Merge overrides into an outgoing capabilities report
    pub fn apply(&mut self, caps: &mut DeviceCapabilities) {
        caps.lock_supported = self.pnp(PnpCap::LockSupported).resolve(caps.lock_supported);
        caps.eject_supported = self.pnp(PnpCap::EjectSupported).resolve(caps.eject_supported);
        caps.removable = self.pnp(PnpCap::Removable).resolve(caps.removable);
        caps.dock_device = self.pnp(PnpCap::DockDevice).resolve(caps.dock_device);
        caps.unique_id = self.pnp(PnpCap::UniqueId).resolve(caps.unique_id);
        caps.silent_install = self.pnp(PnpCap::SilentInstall).resolve(caps.silent_install);
        caps.surprise_removal_ok = self
            .pnp(PnpCap::SurpriseRemovalOk)
            .resolve(caps.surprise_removal_ok);
        caps.hardware_disabled = self
            .pnp(PnpCap::HardwareDisabled)
            .resolve(caps.hardware_disabled);
        caps.no_display_in_ui = self.pnp(PnpCap::NoDisplayInUi).resolve(caps.no_display_in_ui);

        caps.device_d1 = self.power(PowerCap::DeviceD1).resolve(caps.device_d1);
        caps.device_d2 = self.power(PowerCap::DeviceD2).resolve(caps.device_d2);
        caps.wake_from_d0 = self.power(PowerCap::WakeFromD0).resolve(caps.wake_from_d0);
        caps.wake_from_d1 = self.power(PowerCap::WakeFromD1).resolve(caps.wake_from_d1);
        caps.wake_from_d2 = self.power(PowerCap::WakeFromD2).resolve(caps.wake_from_d2);
        caps.wake_from_d3 = self.power(PowerCap::WakeFromD3).resolve(caps.wake_from_d3);

        for (index, state) in caps.device_state.iter_mut().enumerate() {
            let overridden = get_power_cap_state(index, self.states);
            if overridden != DevicePowerState::Maximum as u32 {
                if let Some(value) = DevicePowerState::from_raw(overridden) {
                    *state = value;
                }
            }
        }

        if self.d1_latency != CAP_UNSET {
            caps.d1_latency = self.d1_latency;
        }
        if self.d2_latency != CAP_UNSET {
            caps.d2_latency = self.d2_latency;
        }
        if self.d3_latency != CAP_UNSET {
            caps.d3_latency = self.d3_latency;
        }
        if self.address != CAP_UNSET {
            caps.address = self.address;
        }
        if self.ui_number != CAP_UNSET {
            caps.ui_number = self.ui_number;
        }
        if self.device_wake != DevicePowerState::Maximum {
            caps.device_wake = self.device_wake;
        }

        self.capture(caps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn test_nibble_encode_is_exact() {
        let mut states = 0u32;
        set_power_cap_state(3, 9, &mut states);
        assert_eq!(states, 0x9000);
        assert_eq!(get_power_cap_state(3, states), 9);
        assert_eq!(get_power_cap_state(2, states), 0);
    }

    #[test]
    fn test_nibbles_do_not_interfere() {
        let mut states = 0xFFFF_FFFFu32;
        set_power_cap_state(0, 1, &mut states);
        set_power_cap_state(7, 0, &mut states);
        assert_eq!(states, 0x0FFF_FFF1);

        // Only the low four bits of the state are stored
        set_power_cap_state(4, 0x1F, &mut states);
        assert_eq!(get_power_cap_state(4, states), 0xF);
        assert_eq!(get_power_cap_state(5, states), 0xF);
    }

    #[test]
    fn test_default_map() {
        let states = default_power_cap_map();
        for index in 0..SYSTEM_STATE_COUNT {
            assert_eq!(get_power_cap_state(index, states), DevicePowerState::Maximum as u32);
        }
        assert_eq!(get_power_cap_state(7, states), 0);
        assert_eq!(states, 0x0555_5555);
    }

    #[test]
    fn test_tri_state_defaults() {
        let caps = Capabilities::new();
        assert_eq!(caps.pnp(PnpCap::Removable), CapSetting::UseDefault);
        assert_eq!(caps.power(PowerCap::WakeFromD3), CapSetting::UseDefault);
        assert_eq!(caps.pnp_caps_internal(), 0x2_AAAA);
        assert_eq!(caps.system_wake(), SystemPowerState::Maximum);
    }

    #[test]
    fn test_overrides_freeze_after_query() {
        let mut caps = Capabilities::new();
        caps.set_pnp(PnpCap::SurpriseRemovalOk, CapSetting::True).unwrap();
        caps.set_device_state(SystemPowerState::Sleeping3, DevicePowerState::D3)
            .unwrap();

        let mut report = DeviceCapabilities::default();
        caps.apply(&mut report);
        assert!(report.surprise_removal_ok);
        assert_eq!(report.device_state[SystemPowerState::Sleeping3 as usize], DevicePowerState::D3);
        assert!(caps.is_queried());

        let err = caps.set_pnp(PnpCap::Removable, CapSetting::False).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Immutable);
        assert_eq!(err.status(), Status::InvalidDeviceState);
        assert_eq!(caps.pnp(PnpCap::Removable), CapSetting::UseDefault);
    }

    #[test]
    fn test_capture_builds_stack_map() {
        let mut caps = Capabilities::new();
        let mut report = DeviceCapabilities::default();
        report.device_state[SystemPowerState::Working as usize] = DevicePowerState::D0;
        report.device_state[SystemPowerState::Hibernate as usize] = DevicePowerState::D3;
        report.system_wake = SystemPowerState::Sleeping1;

        caps.capture(&report);
        let map = caps.system_to_device_map().unwrap();
        assert_eq!(get_power_cap_state(1, map), DevicePowerState::D0 as u32);
        assert_eq!(get_power_cap_state(5, map), DevicePowerState::D3 as u32);
        assert_eq!(caps.system_wake(), SystemPowerState::Sleeping1);
    }
}
