//! # Worker Threads
//!
//! [`WorkerThread`] is a long-lived thread executing queued items one at a
//! time in arrival order. Items may be queued before the thread starts;
//! exiting drains everything already queued.
//!
//! [`SystemWorkItem`] schedules a callback on a normal-context thread at
//! most once at a time, the primitive the deferred cleanup engine uses.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::{DfxResult, ErrorKind};
use crate::irql::NormalContext;
use crate::{dfx_bail, dfx_error};

/// Unit of work executed by a worker
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// WORKER THREAD
// =============================================================================

#[derive(Default)]
struct WorkList {
    items: VecDeque<WorkItem>,
    exit: bool,
}

struct WorkerShared {
    list: Mutex<WorkList>,
    work_available: Condvar,
    thread_id: spin::Once<ThreadId>,
}

/// Serialized work-execution thread
pub struct WorkerThread {
    name: String,
    shared: Arc<WorkerShared>,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("started", &self.is_started())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerThread {
    /// Create a worker; nothing runs until [`start`](Self::start)
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            shared: Arc::new(WorkerShared {
                list: Mutex::new(WorkList::default()),
                work_available: Condvar::new(),
                thread_id: spin::Once::new(),
            }),
            handle: spin::Mutex::new(None),
        }
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread has been started
    pub fn is_started(&self) -> bool {
        self.shared.thread_id.is_completed()
    }

    /// Items queued and not yet run
    pub fn pending(&self) -> usize {
        lock(&self.shared.list).items.len()
    }

    /// Spawn the thread
    pub fn start(&self) -> DfxResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.is_started() {
            dfx_bail!(ErrorKind::InvalidState, "worker already started", "{}", self.name);
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || Self::run(&shared))
            .map_err(|err| {
                dfx_error!(ErrorKind::ThreadCreationFailed, "cannot spawn worker", "{}", err)
            })?;

        self.shared.thread_id.call_once(|| spawned.thread().id());
        *handle = Some(spawned);
        log::debug!("WorkerThread: started {}", self.name);
        Ok(())
    }

    fn run(shared: &WorkerShared) {
        shared.thread_id.call_once(|| thread::current().id());
        loop {
            let item = {
                let mut list = lock(&shared.list);
                loop {
                    if let Some(item) = list.items.pop_front() {
                        break Some(item);
                    }
                    if list.exit {
                        break None;
                    }
                    list = shared
                        .work_available
                        .wait(list)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            match item {
                Some(item) => item(),
                None => return,
            }
        }
    }

    /// Queue an item; legal before start, refused once exit was requested
    pub fn queue_work_item(&self, item: WorkItem) -> bool {
        let mut list = lock(&self.shared.list);
        if list.exit {
            log::warn!("WorkerThread: {} is exiting, item refused", self.name);
            return false;
        }

        list.items.push_back(item);
        self.shared.work_available.notify_one();
        true
    }

    /// The calling thread is this worker
    pub fn is_current_thread(&self) -> bool {
        self.shared
            .thread_id
            .get()
            .map_or(false, |id| *id == thread::current().id())
    }

    /// Run every queued item, then stop and join the thread
    ///
    /// A worker that never started runs its queue on the caller. Returns
    /// `false` only when called from the worker itself.
    pub fn exit_thread(&self, _ctx: &NormalContext) -> bool {
        if self.is_current_thread() {
            log::error!("WorkerThread: {} cannot exit from its own thread", self.name);
            return false;
        }

        {
            let mut list = lock(&self.shared.list);
            list.exit = true;
            self.shared.work_available.notify_all();
        }

        let Some(handle) = self.handle.lock().take() else {
            let drained = self.drain_inline();
            if drained > 0 {
                log::debug!("WorkerThread: {} ran {} items on the caller", self.name, drained);
            }
            return true;
        };

        if handle.join().is_err() {
            log::error!("WorkerThread: {} terminated by a panicking item", self.name);
        }
        log::debug!("WorkerThread: exited {}", self.name);
        true
    }

    fn drain_inline(&self) -> usize {
        let mut drained = 0;
        loop {
            let item = lock(&self.shared.list).items.pop_front();
            let Some(item) = item else {
                return drained;
            };
            item();
            drained += 1;
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        let mut list = lock(&self.shared.list);
        list.exit = true;
        self.shared.work_available.notify_all();
    }
}

// =============================================================================
// SYSTEM WORK ITEM
// =============================================================================

#[derive(Debug, Default)]
struct WorkItemState {
    enqueued: bool,
    running: u32,
}

#[derive(Debug, Default)]
struct WorkItemShared {
    state: Mutex<WorkItemState>,
    idle: Condvar,
}

/// At-most-once normal-context callback scheduling
///
/// The item may be enqueued again as soon as its callback has started.
#[derive(Debug, Default)]
pub struct SystemWorkItem {
    shared: Arc<WorkItemShared>,
}

impl SystemWorkItem {
    /// Create an idle work item
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback`; `false` if already enqueued
    pub fn try_to_enqueue<F>(&self, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.shared.state);
            if state.enqueued {
                return false;
            }
            state.enqueued = true;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(String::from("dfx-work-item"))
            .spawn(move || {
                {
                    let mut state = lock(&shared.state);
                    state.enqueued = false;
                    state.running += 1;
                }

                callback();

                let mut state = lock(&shared.state);
                state.running -= 1;
                shared.idle.notify_all();
            });

        if let Err(err) = spawned {
            log::error!("SystemWorkItem: cannot schedule callback: {}", err);
            let mut state = lock(&self.shared.state);
            state.enqueued = false;
            self.shared.idle.notify_all();
            return false;
        }
        true
    }

    /// Enqueued or running
    pub fn is_busy(&self) -> bool {
        let state = lock(&self.shared.state);
        state.enqueued || state.running > 0
    }

    /// Block until no callback is enqueued or running
    pub fn wait_for_exit(&self, _ctx: &NormalContext) {
        let mut state = lock(&self.shared.state);
        while state.enqueued || state.running > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_items_run_in_order() {
        let ctx = NormalContext::require();
        let worker = WorkerThread::new("dfx-test-order");
        let seen = Arc::new(Mutex::new(Vec::new()));

        worker.start().unwrap();
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            assert!(worker.queue_work_item(Box::new(move || seen.lock().unwrap().push(i))));
        }

        assert!(worker.exit_thread(&ctx));
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_before_start() {
        let ctx = NormalContext::require();
        let worker = WorkerThread::new("dfx-test-prestart");
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let count = Arc::clone(&count);
            worker.queue_work_item(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(worker.pending(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        worker.start().unwrap();
        assert!(worker.exit_thread(&ctx));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_exit_without_start_runs_queued_items() {
        let worker = WorkerThread::new("dfx-test-never");
        let count = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&count);
        assert!(worker.queue_work_item(Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(worker.exit_thread(&NormalContext::require()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(worker.pending(), 0);
        assert!(!worker.is_started());
        assert!(!worker.queue_work_item(Box::new(|| {})));
    }

    #[test]
    fn test_is_current_thread() {
        let ctx = NormalContext::require();
        let worker = Arc::new(WorkerThread::new("dfx-test-identity"));
        let observed = Arc::new(Mutex::new(None));

        worker.start().unwrap();
        assert!(!worker.is_current_thread());

        let inner = Arc::clone(&worker);
        let slot = Arc::clone(&observed);
        worker.queue_work_item(Box::new(move || {
            *slot.lock().unwrap() = Some(inner.is_current_thread());
        }));

        assert!(worker.exit_thread(&ctx));
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_start_twice_fails() {
        let worker = WorkerThread::new("dfx-test-twice");
        worker.start().unwrap();
        let err = worker.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        worker.exit_thread(&NormalContext::require());
    }

    #[test]
    fn test_system_work_item_waits_for_callback() {
        let ctx = NormalContext::require();
        let item = SystemWorkItem::new();
        let count = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&count);
        assert!(item.try_to_enqueue(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            inner.fetch_add(1, Ordering::SeqCst);
        }));

        item.wait_for_exit(&ctx);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!item.is_busy());
    }
}
