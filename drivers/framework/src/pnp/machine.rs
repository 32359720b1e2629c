//! # Table-Driven State Machine
//!
//! Each lifecycle machine is a static table of [`StateEntry`] rows. A row
//! names the state, an optional entry function, the events the state accepts
//! and whether the state must be processed on the device's machine thread.
//!
//! Events are posted into a short single-consumer queue. The poster processes
//! the queue inline unless:
//!
//! - another thread is already processing; the event is left for it;
//! - the current state is flagged `serialize_externally` and the poster is not
//!   on the machine thread; processing is handed to the host.
//!
//! An entry function may return the next state, which is entered immediately
//! without an event. Events a state does not accept are logged and dropped.

use core::fmt;
use std::sync::Arc;

use heapless::{Deque, HistoryBuffer};

use crate::sync::Event;

/// Events a machine can hold before posters start losing them
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// States remembered for diagnostics
pub const HISTORY_DEPTH: usize = 8;

/// The four lifecycle machines of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineKind {
    Pnp,
    PowerPolicy,
    Power,
    PowerRequirement,
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineKind::Pnp => "PnpMachine",
            MachineKind::PowerPolicy => "PowerPolicyMachine",
            MachineKind::Power => "PowerMachine",
            MachineKind::PowerRequirement => "PowerRequirementMachine",
        };
        f.write_str(name)
    }
}

/// Where deferred processing runs
pub trait MachineHost {
    /// The caller already runs on the thread `kind` defers to
    fn is_machine_thread(&self, kind: MachineKind) -> bool;

    /// Arrange for `kind` to process its queue on the machine thread
    fn schedule(&self, kind: MachineKind) -> bool;
}

/// One row of a transition table
pub struct StateEntry<S: 'static, E: 'static, C: ?Sized + 'static> {
    pub state: S,
    /// Runs on entry; a returned state is entered right away
    pub on_entry: Option<fn(&C) -> Option<S>>,
    /// Accepted events and their targets
    pub transitions: &'static [(E, S)],
    pub serialize_externally: bool,
}

impl<S: fmt::Debug, E: fmt::Debug, C: ?Sized> fmt::Debug for StateEntry<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateEntry")
            .field("state", &self.state)
            .field("has_entry", &self.on_entry.is_some())
            .field("transitions", &self.transitions)
            .field("serialize_externally", &self.serialize_externally)
            .finish()
    }
}

/// Result of posting an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Processed on the poster's thread before returning
    Processed,
    /// Left for the thread already processing
    Queued,
    /// Handed to the machine thread
    Deferred,
    /// Machine finished or queue full
    Discarded,
}

/// Result of [`StateMachine::set_finished`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// Finished now; the wait event is already signaled
    AlreadyFinished,
    /// In-flight work must complete first; the wait event is signaled then
    Pending,
}

struct MachineInner<S, E> {
    state: S,
    queue: Deque<E, EVENT_QUEUE_DEPTH>,
    history: HistoryBuffer<S, HISTORY_DEPTH>,
    processing: bool,
    finishing: bool,
    finished: bool,
    finish_waiters: Vec<Arc<Event>>,
}

/// Lifecycle state machine over a static table
pub struct StateMachine<S: 'static, E: 'static, C: ?Sized + 'static> {
    kind: MachineKind,
    table: &'static [StateEntry<S, E, C>],
    inner: spin::Mutex<MachineInner<S, E>>,
}

impl<S, E, C> fmt::Debug for StateMachine<S, E, C>
where
    S: Copy + fmt::Debug,
    E: fmt::Debug,
    C: ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateMachine")
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("finished", &inner.finished)
            .finish()
    }
}

impl<S, E, C> StateMachine<S, E, C>
where
    S: Copy + Eq + fmt::Debug,
    E: Copy + Eq + fmt::Debug,
    C: MachineHost + ?Sized,
{
    pub fn new(kind: MachineKind, table: &'static [StateEntry<S, E, C>], initial: S) -> Self {
        let mut history = HistoryBuffer::new();
        history.write(initial);

        Self {
            kind,
            table,
            inner: spin::Mutex::new(MachineInner {
                state: initial,
                queue: Deque::new(),
                history,
                processing: false,
                finishing: false,
                finished: false,
                finish_waiters: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn state(&self) -> S {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Recent states, oldest first
    pub fn history(&self) -> Vec<S> {
        self.inner.lock().history.oldest_ordered().copied().collect()
    }

    fn entry(&self, state: S) -> Option<&'static StateEntry<S, E, C>> {
        self.table.iter().find(|entry| entry.state == state)
    }

    /// The current state takes `event`
    pub fn accepts(&self, event: E) -> bool {
        let state = self.state();
        self.entry(state).map_or(false, |entry| {
            entry.transitions.iter().any(|(accepted, _)| *accepted == event)
        })
    }

    /// Post an event
    pub fn post(&self, ctx: &C, event: E) -> PostOutcome {
        let inline = {
            let mut inner = self.inner.lock();
            if inner.finished || inner.finishing {
                log::debug!("{}: finished, {:?} discarded", self.kind, event);
                return PostOutcome::Discarded;
            }

            if let Err(event) = inner.queue.push_back(event) {
                log::error!("{}: event queue full, {:?} dropped", self.kind, event);
                return PostOutcome::Discarded;
            }

            if inner.processing {
                return PostOutcome::Queued;
            }
            inner.processing = true;

            let serialize = self
                .entry(inner.state)
                .map_or(false, |entry| entry.serialize_externally);
            !serialize || ctx.is_machine_thread(self.kind)
        };

        if inline {
            self.process(ctx);
            return PostOutcome::Processed;
        }

        if ctx.schedule(self.kind) {
            return PostOutcome::Deferred;
        }

        log::warn!("{}: no machine thread, processing inline", self.kind);
        self.process(ctx);
        PostOutcome::Processed
    }

    /// Drain the event queue; the caller owns the processing flag
    pub fn process(&self, ctx: &C) {
        loop {
            let (from, event, target) = {
                let mut inner = self.inner.lock();
                let Some(event) = inner.queue.pop_front() else {
                    inner.processing = false;
                    let waiters = if inner.finishing {
                        inner.finishing = false;
                        inner.finished = true;
                        core::mem::take(&mut inner.finish_waiters)
                    } else {
                        Vec::new()
                    };
                    drop(inner);

                    for waiter in waiters {
                        waiter.set();
                    }
                    return;
                };

                let from = inner.state;
                let target = self.entry(from).and_then(|entry| {
                    entry
                        .transitions
                        .iter()
                        .find(|(accepted, _)| *accepted == event)
                        .map(|(_, target)| *target)
                });

                let Some(target) = target else {
                    log::debug!("{}: {:?} ignored in {:?}", self.kind, event, from);
                    continue;
                };

                inner.state = target;
                inner.history.write(target);
                (from, event, target)
            };

            log::debug!("{}: {:?} --{:?}--> {:?}", self.kind, from, event, target);
            self.enter(ctx, target);
        }
    }

    fn enter(&self, ctx: &C, mut state: S) {
        while let Some(on_entry) = self.entry(state).and_then(|entry| entry.on_entry) {
            let Some(next) = on_entry(ctx) else {
                break;
            };

            {
                let mut inner = self.inner.lock();
                inner.state = next;
                inner.history.write(next);
            }
            log::debug!("{}: {:?} --> {:?}", self.kind, state, next);
            state = next;
        }
    }

    /// Stop accepting events
    ///
    /// Idempotent. Events posted from now on are discarded; the ones already
    /// queued are still processed. `event` is signaled once the machine is
    /// finished, right away when it is idle.
    pub fn set_finished(&self, event: &Arc<Event>) -> FinishStatus {
        let mut inner = self.inner.lock();
        if inner.finished || !inner.processing {
            inner.finished = true;
            inner.queue.clear();
            drop(inner);
            event.set();
            return FinishStatus::AlreadyFinished;
        }

        inner.finishing = true;
        inner.finish_waiters.push(Arc::clone(event));
        FinishStatus::Pending
    }
}

/// Type-erased view used to shut machines down in order
pub trait Finishable {
    fn machine_kind(&self) -> MachineKind;

    fn finish(&self, event: &Arc<Event>) -> FinishStatus;
}

impl<S, E, C> Finishable for StateMachine<S, E, C>
where
    S: Copy + Eq + fmt::Debug,
    E: Copy + Eq + fmt::Debug,
    C: MachineHost + ?Sized,
{
    fn machine_kind(&self) -> MachineKind {
        self.kind
    }

    fn finish(&self, event: &Arc<Event>) -> FinishStatus {
        self.set_finished(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ToyState {
        Idle,
        Busy,
        Settled,
        Guarded,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ToyEvent {
        Go,
        Guard,
        Stop,
    }

    struct Toy {
        machine: spin::Once<StateMachine<ToyState, ToyEvent, Toy>>,
        scheduled: spin::Mutex<Vec<MachineKind>>,
        entries: AtomicUsize,
        repost: AtomicBool,
    }

    impl MachineHost for Toy {
        fn is_machine_thread(&self, _kind: MachineKind) -> bool {
            false
        }

        fn schedule(&self, kind: MachineKind) -> bool {
            self.scheduled.lock().push(kind);
            true
        }
    }

    impl Toy {
        fn new() -> Self {
            let toy = Toy {
                machine: spin::Once::new(),
                scheduled: spin::Mutex::new(Vec::new()),
                entries: AtomicUsize::new(0),
                repost: AtomicBool::new(false),
            };
            toy.machine
                .call_once(|| StateMachine::new(MachineKind::Pnp, &TOY_TABLE, ToyState::Idle));
            toy
        }

        fn machine(&self) -> &StateMachine<ToyState, ToyEvent, Toy> {
            self.machine.get().unwrap()
        }

        fn post(&self, event: ToyEvent) -> PostOutcome {
            self.machine().post(self, event)
        }
    }

    fn busy_entry(toy: &Toy) -> Option<ToyState> {
        toy.entries.fetch_add(1, Ordering::SeqCst);
        if toy.repost.swap(false, Ordering::SeqCst) {
            assert_eq!(toy.post(ToyEvent::Stop), PostOutcome::Queued);
        }
        Some(ToyState::Settled)
    }

    static TOY_TABLE: [StateEntry<ToyState, ToyEvent, Toy>; 4] = [
        StateEntry {
            state: ToyState::Idle,
            on_entry: None,
            transitions: &[(ToyEvent::Go, ToyState::Busy), (ToyEvent::Guard, ToyState::Guarded)],
            serialize_externally: false,
        },
        StateEntry {
            state: ToyState::Busy,
            on_entry: Some(busy_entry),
            transitions: &[],
            serialize_externally: false,
        },
        StateEntry {
            state: ToyState::Settled,
            on_entry: None,
            transitions: &[(ToyEvent::Guard, ToyState::Guarded), (ToyEvent::Stop, ToyState::Idle)],
            serialize_externally: false,
        },
        StateEntry {
            state: ToyState::Guarded,
            on_entry: None,
            transitions: &[(ToyEvent::Stop, ToyState::Idle)],
            serialize_externally: true,
        },
    ];

    #[test]
    fn test_inline_processing_follows_entry_chain() {
        let toy = Toy::new();
        assert_eq!(toy.post(ToyEvent::Go), PostOutcome::Processed);
        assert_eq!(toy.machine().state(), ToyState::Settled);
        assert_eq!(
            toy.machine().history(),
            [ToyState::Idle, ToyState::Busy, ToyState::Settled]
        );
        assert_eq!(toy.entries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unaccepted_event_is_ignored() {
        let toy = Toy::new();
        assert_eq!(toy.post(ToyEvent::Stop), PostOutcome::Processed);
        assert_eq!(toy.machine().state(), ToyState::Idle);
        assert_eq!(toy.machine().history(), [ToyState::Idle]);
    }

    #[test]
    fn test_event_posted_from_entry_is_queued() {
        let toy = Toy::new();
        toy.repost.store(true, Ordering::SeqCst);
        assert_eq!(toy.post(ToyEvent::Go), PostOutcome::Processed);
        assert_eq!(toy.machine().state(), ToyState::Idle);
    }

    #[test]
    fn test_serialized_state_defers_to_host() {
        let toy = Toy::new();
        assert_eq!(toy.post(ToyEvent::Guard), PostOutcome::Processed);
        assert_eq!(toy.machine().state(), ToyState::Guarded);

        assert_eq!(toy.post(ToyEvent::Stop), PostOutcome::Deferred);
        assert_eq!(*toy.scheduled.lock(), [MachineKind::Pnp]);
        assert_eq!(toy.machine().state(), ToyState::Guarded);

        // Left for the scheduled run
        assert_eq!(toy.post(ToyEvent::Go), PostOutcome::Queued);

        toy.machine().process(&toy);
        assert_eq!(toy.machine().state(), ToyState::Settled);
        assert_eq!(toy.scheduled.lock().len(), 1);
    }

    #[test]
    fn test_set_finished_when_idle() {
        let toy = Toy::new();
        let event = Arc::new(Event::synchronization());

        assert_eq!(toy.machine().set_finished(&event), FinishStatus::AlreadyFinished);
        assert!(event.is_signaled());
        event.clear();

        assert_eq!(toy.machine().set_finished(&event), FinishStatus::AlreadyFinished);
        assert!(event.is_signaled());
        assert!(toy.machine().is_finished());
        assert_eq!(toy.post(ToyEvent::Go), PostOutcome::Discarded);
        assert_eq!(toy.machine().state(), ToyState::Idle);
    }

    #[test]
    fn test_set_finished_waits_for_in_flight_work() {
        let toy = Toy::new();
        let event = Arc::new(Event::synchronization());

        toy.post(ToyEvent::Guard);
        assert_eq!(toy.post(ToyEvent::Stop), PostOutcome::Deferred);

        assert_eq!(toy.machine().set_finished(&event), FinishStatus::Pending);
        assert!(!event.is_signaled());
        assert!(!toy.machine().is_finished());

        toy.machine().process(&toy);
        assert!(event.is_signaled());
        assert!(toy.machine().is_finished());
        assert_eq!(toy.machine().state(), ToyState::Idle);
    }

    #[test]
    fn test_events_after_finish_request_are_discarded() {
        let toy = Toy::new();
        let event = Arc::new(Event::synchronization());

        toy.post(ToyEvent::Guard);
        assert_eq!(toy.post(ToyEvent::Stop), PostOutcome::Deferred);
        assert_eq!(toy.machine().set_finished(&event), FinishStatus::Pending);

        // Would move Idle to Busy and run its entry function
        assert_eq!(toy.post(ToyEvent::Go), PostOutcome::Discarded);

        toy.machine().process(&toy);
        assert!(event.is_signaled());
        assert_eq!(toy.machine().state(), ToyState::Idle);
        assert_eq!(toy.entries.load(Ordering::SeqCst), 0);
        assert_eq!(
            toy.machine().history(),
            [ToyState::Idle, ToyState::Guarded, ToyState::Idle]
        );
    }
}
