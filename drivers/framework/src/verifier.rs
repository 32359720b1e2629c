//! # Verifier and Fatal Diagnostics
//!
//! Contract violations are never silently corrected. [`bug_check`] is the
//! non-recoverable path; [`verifier_break`] is fatal only when the runtime
//! verifier is enabled and is logged otherwise.
//!
//! The forward-progress fault injector lives here too: a deterministic,
//! seeded generator that forces request allocation failures on
//! forward-progress queues so the reserved-request fallback gets exercised.

use core::fmt;

// =============================================================================
// BUG CHECK
// =============================================================================

/// Top-level code carried by every fatal framework diagnostic
pub const FRAMEWORK_VIOLATION: u32 = 0x10D;

/// Specific fatal condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BugCheckCode {
    /// A state-changing lifecycle request arrived while another was pending
    PnpFatalError = 0x0D,

    /// Request type changed by an interceptor
    InterceptorTypeChanged = 0x0E,

    /// Object queued for deferred cleanup twice
    DoubleDispose = 0x0F,

    /// Blocking operation from elevated context
    ExecutionContext = 0x10,

    /// A power callback did not return in time
    PowerRoutineTimedOut = 0x11,
}

impl fmt::Display for BugCheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#x})", self, *self as u32)
    }
}

/// Raise a non-recoverable framework diagnostic
///
/// `param2` and `param3` identify the objects involved (for lifecycle
/// violations: the device and the offending request).
#[track_caller]
pub fn bug_check(code: BugCheckCode, param2: u64, param3: u64) -> ! {
    log::error!(
        "Verifier: framework violation {:#x}, {}, params ({:#x}, {:#x})",
        FRAMEWORK_VIOLATION,
        code,
        param2,
        param3
    );
    panic!(
        "framework violation {:#x}: {} ({:#x}, {:#x})",
        FRAMEWORK_VIOLATION, code, param2, param3
    );
}

/// Break into the verifier: fatal when it is on, logged otherwise
#[track_caller]
pub fn verifier_break(config: &FrameworkConfig, message: &str) {
    if config.verifier_on {
        log::error!("Verifier: {}", message);
        panic!("verifier break: {}", message);
    }

    log::warn!("Verifier (off): {}", message);
}

// =============================================================================
// FRAMEWORK CONFIG
// =============================================================================

cfg_if::cfg_if! {
    if #[cfg(feature = "verifier")] {
        const VERIFIER_DEFAULT: bool = true;
    } else {
        const VERIFIER_DEFAULT: bool = false;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fault-injection")] {
        const FORWARD_PROGRESS_TEST_DEFAULT: ForwardProgressTest =
            ForwardProgressTest::FailRandom { seed: DEFAULT_FAULT_SEED };
    } else {
        const FORWARD_PROGRESS_TEST_DEFAULT: ForwardProgressTest = ForwardProgressTest::Off;
    }
}

/// Seed used when fault injection is enabled by feature
pub const DEFAULT_FAULT_SEED: u32 = 0x5EED_0D0F;

/// Forward-progress test mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardProgressTest {
    /// No injected failures
    Off,
    /// Every allocation for a forward-progress queue fails
    FailAll,
    /// Roughly one allocation in seventeen fails
    FailRandom {
        /// Generator seed
        seed: u32,
    },
}

/// Framework-wide configuration applied to a device at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkConfig {
    /// Verifier breaks are fatal
    pub verifier_on: bool,

    /// Forward-progress fault injection mode
    pub forward_progress_test: ForwardProgressTest,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkConfig {
    /// Configuration from the enabled cargo features
    pub const fn new() -> Self {
        Self {
            verifier_on: VERIFIER_DEFAULT,
            forward_progress_test: FORWARD_PROGRESS_TEST_DEFAULT,
        }
    }

    /// Enable or disable the verifier
    pub fn with_verifier(mut self, on: bool) -> Self {
        self.verifier_on = on;
        self
    }

    /// Set the forward-progress test mode
    pub fn with_forward_progress_test(mut self, mode: ForwardProgressTest) -> Self {
        self.forward_progress_test = mode;
        self
    }
}

// =============================================================================
// FAULT INJECTOR
// =============================================================================

/// Deterministic allocation fault injector
#[derive(Debug, Clone)]
pub struct FaultInjector {
    mode: ForwardProgressTest,
    seed: u32,
    injected: u64,
}

impl FaultInjector {
    /// One failure per this many draws on average
    pub const FAILURE_MODULUS: u32 = 17;

    /// Create an injector for the given mode
    pub const fn new(mode: ForwardProgressTest) -> Self {
        let seed = match mode {
            ForwardProgressTest::FailRandom { seed } => seed,
            _ => 0,
        };

        Self {
            mode,
            seed,
            injected: 0,
        }
    }

    /// Injection active
    pub fn is_enabled(&self) -> bool {
        self.mode != ForwardProgressTest::Off
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> u64 {
        self.injected
    }

    /// Next value of the linear congruential generator, in [0, 32768)
    fn next_random(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(1103515245).wrapping_add(12345);
        (self.seed / 65536) % 32768
    }

    /// Draw once: true when this allocation must fail
    pub fn should_fail(&mut self) -> bool {
        let fail = match self.mode {
            ForwardProgressTest::Off => false,
            ForwardProgressTest::FailAll => true,
            ForwardProgressTest::FailRandom { .. } => {
                self.next_random() % Self::FAILURE_MODULUS == 0
            },
        };

        if fail {
            self.injected += 1;
        }
        fail
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injector_off() {
        let mut injector = FaultInjector::new(ForwardProgressTest::Off);
        assert!(!injector.is_enabled());
        assert!((0..1000).all(|_| !injector.should_fail()));
    }

    #[test]
    fn test_fault_injector_fail_all() {
        let mut injector = FaultInjector::new(ForwardProgressTest::FailAll);
        assert!((0..10).all(|_| injector.should_fail()));
        assert_eq!(injector.injected(), 10);
    }

    #[test]
    fn test_fault_injector_is_deterministic() {
        let mode = ForwardProgressTest::FailRandom { seed: 42 };
        let mut a = FaultInjector::new(mode);
        let mut b = FaultInjector::new(mode);

        let run_a: Vec<bool> = (0..500).map(|_| a.should_fail()).collect();
        let run_b: Vec<bool> = (0..500).map(|_| b.should_fail()).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_fault_injector_rate_is_low() {
        let mut injector = FaultInjector::new(ForwardProgressTest::FailRandom { seed: 7 });
        let failures = (0..17_000).filter(|_| injector.should_fail()).count();

        // About 6%, never the majority
        assert!(failures > 0);
        assert!(failures < 3_000);
    }

    #[test]
    fn test_verifier_break_off_is_logged_only() {
        let config = FrameworkConfig::new().with_verifier(false);
        verifier_break(&config, "not fatal");
    }

    #[test]
    #[should_panic(expected = "verifier break")]
    fn test_verifier_break_on_is_fatal() {
        let config = FrameworkConfig::new().with_verifier(true);
        verifier_break(&config, "fatal");
    }

    #[test]
    #[should_panic(expected = "framework violation")]
    fn test_bug_check_panics() {
        bug_check(BugCheckCode::PnpFatalError, 1, 2);
    }
}
