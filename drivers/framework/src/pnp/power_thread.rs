//! # Power Thread Arbitration
//!
//! The power-policy owner at the top of a stack may create one worker thread
//! and share it with every device below that asks for it. The sharing goes
//! through a [`PowerThreadInterface`]: a cloneable bundle of reference,
//! dereference and enqueue operations over one shared record.
//!
//! The record's count starts at one for the creator. Each device that
//! queries the interface adds one. On release the creator drops its own
//! count and, while others remain, blocks until the last dereference signals
//! it. Only then does the thread exit.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::DfxResult;
use crate::irp::LowerDevice;
use crate::irql::NormalContext;
use crate::sync::Event;
use crate::thread::{WorkItem, WorkerThread};

struct PowerThreadRecord {
    references: AtomicI32,
    release_event: spin::Mutex<Option<Arc<Event>>>,
    thread: WorkerThread,
}

/// Shared power thread handle handed to devices lower in the stack
#[derive(Clone)]
pub struct PowerThreadInterface {
    record: Arc<PowerThreadRecord>,
}

impl core::fmt::Debug for PowerThreadInterface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PowerThreadInterface")
            .field("thread", &self.record.thread.name())
            .field("references", &self.references())
            .finish()
    }
}

impl PowerThreadInterface {
    /// Add a holder
    pub fn reference(&self) {
        let count = self.record.references.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(count >= 2);
    }

    /// Drop a holder; the last one wakes the owner waiting to release
    pub fn dereference(&self) {
        if self.record.references.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(event) = self.record.release_event.lock().as_ref() {
                event.set();
            }
        }
    }

    /// Run `item` on the shared thread
    pub fn enqueue(&self, item: WorkItem) -> bool {
        self.record.thread.queue_work_item(item)
    }

    pub fn references(&self) -> i32 {
        self.record.references.load(Ordering::Acquire)
    }

    /// The calling thread is the shared power thread
    pub fn is_current_thread(&self) -> bool {
        self.record.thread.is_current_thread()
    }
}

/// A device's hold on a power thread, created or borrowed
#[derive(Default)]
pub struct PowerThreadSlot {
    has_thread: AtomicBool,
    owned: spin::Mutex<Option<Arc<PowerThreadRecord>>>,
    acquired: spin::Mutex<Option<PowerThreadInterface>>,
}

impl core::fmt::Debug for PowerThreadSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PowerThreadSlot")
            .field("has_thread", &self.has_thread())
            .field("owner", &self.is_owner())
            .finish()
    }
}

impl PowerThreadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_thread(&self) -> bool {
        self.has_thread.load(Ordering::Acquire)
    }

    /// This device created the thread it holds
    pub fn is_owner(&self) -> bool {
        self.owned.lock().is_some()
    }

    /// Start a thread and install it unless another caller won the race
    pub fn create_power_thread(&self, name: &str, ctx: &NormalContext) -> DfxResult<()> {
        let thread = WorkerThread::new(name);
        thread.start()?;

        let record = Arc::new(PowerThreadRecord {
            references: AtomicI32::new(1),
            release_event: spin::Mutex::new(None),
            thread,
        });

        let loser = {
            let mut owned = self.owned.lock();
            if owned.is_some() {
                Some(record)
            } else {
                *owned = Some(record);
                None
            }
        };

        if let Some(loser) = loser {
            log::debug!("PnpPackage: power thread already installed, discarding {}", name);
            loser.thread.exit_thread(ctx);
        }

        self.has_thread.store(true, Ordering::Release);
        Ok(())
    }

    /// Borrow the thread of a lower device, or create one
    pub fn acquire_power_thread(
        &self,
        lower: Option<&Arc<dyn LowerDevice>>,
        name: &str,
        ctx: &NormalContext,
    ) -> DfxResult<()> {
        if self.has_thread() {
            return Ok(());
        }

        if let Some(interface) = lower.and_then(|lower| lower.query_power_thread_interface()) {
            log::debug!("PnpPackage: using power thread from the lower stack");
            *self.acquired.lock() = Some(interface);
            self.has_thread.store(true, Ordering::Release);
            return Ok(());
        }

        self.create_power_thread(name, ctx)
    }

    /// Referenced interface for a device above this one
    pub fn query_interface(&self) -> Option<PowerThreadInterface> {
        let owned = self.owned.lock();
        let record = owned.as_ref()?;
        let interface = PowerThreadInterface {
            record: Arc::clone(record),
        };
        interface.reference();
        Some(interface)
    }

    /// Run `item` on whichever thread this device holds
    pub fn enqueue(&self, item: WorkItem) -> bool {
        if !self.has_thread() {
            return false;
        }

        if let Some(record) = self.owned.lock().as_ref() {
            return record.thread.queue_work_item(item);
        }

        match self.acquired.lock().as_ref() {
            Some(interface) => interface.enqueue(item),
            None => false,
        }
    }

    /// The calling thread is the held power thread
    pub fn is_current_thread(&self) -> bool {
        if let Some(record) = self.owned.lock().as_ref() {
            return record.thread.is_current_thread();
        }

        self.acquired
            .lock()
            .as_ref()
            .map_or(false, PowerThreadInterface::is_current_thread)
    }

    /// Give the thread up
    ///
    /// The creator waits for every borrower to dereference before the thread
    /// exits; a borrower just drops its reference.
    pub fn release_power_thread(&self, ctx: &NormalContext) {
        let had_thread = self.has_thread.swap(false, Ordering::AcqRel);

        let owned = self.owned.lock().take();
        if let Some(record) = owned {
            let event = Arc::new(Event::synchronization());
            *record.release_event.lock() = Some(Arc::clone(&event));

            if record.references.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                log::info!(
                    "PnpPackage: waiting for power thread {} borrowers to finish",
                    record.thread.name()
                );
                event.wait(ctx);
            }

            *record.release_event.lock() = None;
            record.thread.exit_thread(ctx);
        } else if had_thread {
            if let Some(interface) = self.acquired.lock().take() {
                interface.dereference();
            }
        }
    }
}
