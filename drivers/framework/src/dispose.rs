//! # Deferred Cleanup Engine
//!
//! Objects whose teardown must run at normal context are handed to a
//! [`DisposeList`] from any context. The list is singly linked through a
//! [`DisposeLink`] embedded in each object, so linking never allocates. The
//! first add into an empty list schedules a drain on a [`SystemWorkItem`],
//! which runs it on a fresh normal-context thread. Adding never waits for
//! teardown, but scheduling takes a short std lock and spawns that thread.
//!
//! ```text
//!  add(A)            add(B)            drain (normal context)
//!  head ─▶ A         head ─▶ A ─▶ B     A.deferred_dispose()
//!  tail ─▶ A         tail ─────▶ B      B.deferred_dispose()
//!  (schedule)
//! ```

use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::irql::NormalContext;
use crate::thread::SystemWorkItem;
use crate::verifier::{bug_check, BugCheckCode};

/// Object torn down by the deferred cleanup engine
pub trait Disposable: Send + Sync {
    /// Link storage owned by the object
    fn dispose_link(&self) -> &DisposeLink;

    /// Normal-context teardown
    fn deferred_dispose(&self);
}

/// Intrusive link embedded in every [`Disposable`]
#[derive(Default)]
pub struct DisposeLink {
    next: spin::Mutex<Option<Arc<dyn Disposable>>>,
    linked: core::sync::atomic::AtomicBool,
}

impl core::fmt::Debug for DisposeLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DisposeLink")
            .field("linked", &self.is_linked())
            .finish()
    }
}

impl DisposeLink {
    /// Unlinked link
    pub fn new() -> Self {
        Self::default()
    }

    /// The owning object sits on a dispose list
    pub fn is_linked(&self) -> bool {
        self.linked.load(core::sync::atomic::Ordering::Acquire)
    }
}

#[derive(Default)]
struct DisposeQueue {
    head: Option<Arc<dyn Disposable>>,
    tail: Option<Arc<dyn Disposable>>,
    depth: usize,
}

#[derive(Default)]
struct DisposeInner {
    queue: spin::Mutex<DisposeQueue>,
    draining: spin::Mutex<Vec<ThreadId>>,
}

impl DisposeInner {
    fn pop(&self) -> Option<Arc<dyn Disposable>> {
        let mut queue = self.queue.lock();
        let head = queue.head.take()?;
        let next = head.dispose_link().next.lock().take();
        if next.is_none() {
            queue.tail = None;
        }
        queue.head = next;
        queue.depth -= 1;
        Some(head)
    }

    fn drain(&self) {
        let current = thread::current().id();
        self.draining.lock().push(current);

        let mut disposed = 0usize;
        while let Some(object) = self.pop() {
            object
                .dispose_link()
                .linked
                .store(false, core::sync::atomic::Ordering::Release);
            object.deferred_dispose();
            disposed += 1;
        }

        let mut draining = self.draining.lock();
        if let Some(pos) = draining.iter().position(|id| *id == current) {
            draining.swap_remove(pos);
        }
        log::trace!("DisposeList: drained {} objects", disposed);
    }
}

/// Deferred cleanup list
#[derive(Default)]
pub struct DisposeList {
    inner: Arc<DisposeInner>,
    work_item: SystemWorkItem,
}

impl core::fmt::Debug for DisposeList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DisposeList")
            .field("depth", &self.depth())
            .finish()
    }
}

impl DisposeList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects waiting for teardown
    pub fn depth(&self) -> usize {
        self.inner.queue.lock().depth
    }

    /// Nothing waiting
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Queue `object` for normal-context teardown
    ///
    /// Callable from an elevated section: teardown always runs on the drain
    /// thread, never on the caller. The first add into an empty list spawns
    /// that thread.
    pub fn add(&self, object: Arc<dyn Disposable>) {
        let link = object.dispose_link();
        if link
            .linked
            .swap(true, core::sync::atomic::Ordering::AcqRel)
        {
            let addr = Arc::as_ptr(&object) as *const () as u64;
            bug_check(BugCheckCode::DoubleDispose, addr, 0);
        }

        let schedule = {
            let mut queue = self.inner.queue.lock();
            match queue.tail.take() {
                Some(tail) => *tail.dispose_link().next.lock() = Some(Arc::clone(&object)),
                None => queue.head = Some(Arc::clone(&object)),
            }
            queue.tail = Some(object);
            queue.depth += 1;
            queue.depth == 1
        };

        if schedule {
            let inner = Arc::clone(&self.inner);
            if !self.work_item.try_to_enqueue(move || inner.drain()) {
                log::trace!("DisposeList: drain already scheduled");
            }
        }
    }

    /// Block until every added object was disposed
    ///
    /// Called from the draining thread itself, the list is drained inline.
    pub fn wait_for_empty(&self, ctx: &NormalContext) {
        let current = thread::current().id();
        if self.inner.draining.lock().contains(&current) {
            self.inner.drain();
        } else {
            self.work_item.wait_for_exit(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irql::ElevatedSection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        link: DisposeLink,
        disposed: AtomicUsize,
        disposed_elevated: AtomicUsize,
    }

    impl Tracked {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                link: DisposeLink::new(),
                disposed: AtomicUsize::new(0),
                disposed_elevated: AtomicUsize::new(0),
            })
        }
    }

    impl Disposable for Tracked {
        fn dispose_link(&self) -> &DisposeLink {
            &self.link
        }

        fn deferred_dispose(&self) {
            if NormalContext::acquire().is_none() {
                self.disposed_elevated.fetch_add(1, Ordering::SeqCst);
            }
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_from_elevated_section() {
        let list = DisposeList::new();
        let object = Tracked::new();

        {
            let _elevated = ElevatedSection::enter();
            assert!(NormalContext::acquire().is_none());
            list.add(Arc::clone(&object) as Arc<dyn Disposable>);
        }

        let ctx = NormalContext::require();
        list.wait_for_empty(&ctx);

        assert_eq!(object.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(object.disposed_elevated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_add_and_wait() {
        let ctx = NormalContext::require();
        let list = DisposeList::new();
        let objects: Vec<_> = (0..8).map(|_| Tracked::new()).collect();

        for object in &objects {
            list.add(Arc::clone(object) as Arc<dyn Disposable>);
        }
        list.wait_for_empty(&ctx);

        assert!(list.is_empty());
        for object in &objects {
            assert_eq!(object.disposed.load(Ordering::SeqCst), 1);
            assert!(!object.link.is_linked());
        }
    }

    #[test]
    fn test_concurrent_adds_dispose_exactly_once() {
        let ctx = NormalContext::require();
        let list = Arc::new(DisposeList::new());
        let objects: Vec<_> = (0..200).map(|_| Tracked::new()).collect();

        let handles: Vec<_> = objects
            .chunks(25)
            .map(|chunk| {
                let list = Arc::clone(&list);
                let chunk: Vec<_> = chunk.to_vec();
                thread::spawn(move || {
                    for object in chunk {
                        list.add(object as Arc<dyn Disposable>);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        list.wait_for_empty(&ctx);
        assert!(objects
            .iter()
            .all(|object| object.disposed.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_object_can_be_added_again_after_dispose() {
        let ctx = NormalContext::require();
        let list = DisposeList::new();
        let object = Tracked::new();

        list.add(Arc::clone(&object) as Arc<dyn Disposable>);
        list.wait_for_empty(&ctx);
        list.add(Arc::clone(&object) as Arc<dyn Disposable>);
        list.wait_for_empty(&ctx);

        assert_eq!(object.disposed.load(Ordering::SeqCst), 2);
    }

    struct Reentrant {
        link: DisposeLink,
        list: Arc<DisposeList>,
        done: AtomicUsize,
    }

    impl Disposable for Reentrant {
        fn dispose_link(&self) -> &DisposeLink {
            &self.link
        }

        fn deferred_dispose(&self) {
            // Runs on the draining thread: must drain inline, not deadlock
            let ctx = NormalContext::require();
            self.list.wait_for_empty(&ctx);
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wait_for_empty_from_draining_thread() {
        let ctx = NormalContext::require();
        let list = Arc::new(DisposeList::new());
        let first = Arc::new(Reentrant {
            link: DisposeLink::new(),
            list: Arc::clone(&list),
            done: AtomicUsize::new(0),
        });
        let second = Tracked::new();

        list.add(Arc::clone(&first) as Arc<dyn Disposable>);
        list.add(Arc::clone(&second) as Arc<dyn Disposable>);
        list.wait_for_empty(&ctx);

        assert_eq!(first.done.load(Ordering::SeqCst), 1);
        assert_eq!(second.disposed.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    struct Blocker {
        link: DisposeLink,
        gate: Arc<crate::sync::Event>,
    }

    impl Disposable for Blocker {
        fn dispose_link(&self) -> &DisposeLink {
            &self.link
        }

        fn deferred_dispose(&self) {
            self.gate.wait(&NormalContext::require());
        }
    }

    struct OpenOnDrop(Arc<crate::sync::Event>);

    impl Drop for OpenOnDrop {
        fn drop(&mut self) {
            self.0.set();
        }
    }

    #[test]
    #[should_panic(expected = "framework violation")]
    fn test_double_add_is_fatal() {
        let list = DisposeList::new();
        let gate = Arc::new(crate::sync::Event::notification());
        let _open = OpenOnDrop(Arc::clone(&gate));

        // The drain parks on the blocker, so the object stays linked
        list.add(Arc::new(Blocker {
            link: DisposeLink::new(),
            gate,
        }) as Arc<dyn Disposable>);

        let object = Tracked::new();
        list.add(Arc::clone(&object) as Arc<dyn Disposable>);
        list.add(object as Arc<dyn Disposable>);
    }
}
