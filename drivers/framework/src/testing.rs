//! Test doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use crate::error::Status;
use crate::irp::{CompletionRecord, CompletionSink, Irp, LowerDevice, RequestType};
use crate::pnp::power::{PowerRoutine, Watchdog};

/// Completion sink that keeps every record
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<CompletionRecord>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn records(&self) -> Vec<CompletionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub(crate) fn statuses(&self) -> Vec<Status> {
        self.records().iter().map(|record| record.status).collect()
    }
}

impl CompletionSink for RecordingSink {
    fn irp_completed(&self, record: CompletionRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// What a [`RecordingLowerDevice`] saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Received {
    pub(crate) id: u64,
    pub(crate) major: RequestType,
    pub(crate) forwarded: bool,
}

/// Lower device that completes everything with success
#[derive(Debug, Default)]
pub(crate) struct RecordingLowerDevice {
    received: Mutex<Vec<Received>>,
}

impl RecordingLowerDevice {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

impl LowerDevice for RecordingLowerDevice {
    fn call_driver(&self, irp: Irp) -> Status {
        self.received.lock().unwrap().push(Received {
            id: irp.id(),
            major: irp.major(),
            forwarded: irp.is_forwarded(),
        });
        irp.complete(Status::Success, 0);
        Status::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogCall {
    Arm(PowerRoutine),
    Disarm,
}

/// Watchdog that only records how it was driven
#[derive(Debug, Default)]
pub(crate) struct RecordingWatchdog {
    calls: Mutex<Vec<WatchdogCall>>,
}

impl RecordingWatchdog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<WatchdogCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Watchdog for RecordingWatchdog {
    fn arm(&self, routine: PowerRoutine) {
        self.calls.lock().unwrap().push(WatchdogCall::Arm(routine));
    }

    fn disarm(&self) {
        self.calls.lock().unwrap().push(WatchdogCall::Disarm);
    }
}
