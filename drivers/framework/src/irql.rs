//! # Execution Context
//!
//! Framework code runs in one of two contexts:
//!
//! - **Elevated**: may not block, touch pageable memory or allocate fallibly.
//!   Dispatch, interceptor consultation and [`DisposeList::add`] are legal
//!   here.
//! - **Normal**: may block, allocate and destroy objects.
//!
//! Blocking operations take a `&NormalContext`. The token can only be
//! obtained on a thread that is not inside an [`ElevatedSection`], and it is
//! `!Send`, so a blocking call from elevated-only code does not compile
//! unless a token was explicitly acquired at normal context.
//!
//! [`DisposeList::add`]: crate::dispose::DisposeList::add

use core::cell::Cell;
use core::marker::PhantomData;

use crate::verifier::{bug_check, BugCheckCode};

thread_local! {
    static RAISED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Current execution level of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLevel {
    /// Blocking permitted
    Normal,
    /// Blocking forbidden
    Elevated,
}

/// Execution level of the calling thread
pub fn current_level() -> ExecutionLevel {
    if RAISED_DEPTH.with(Cell::get) == 0 {
        ExecutionLevel::Normal
    } else {
        ExecutionLevel::Elevated
    }
}

/// Capability token proving the holder runs at normal context
#[derive(Debug)]
pub struct NormalContext {
    _not_send: PhantomData<*const ()>,
}

impl NormalContext {
    /// Obtain the token, `None` when the thread is elevated
    pub fn acquire() -> Option<Self> {
        match current_level() {
            ExecutionLevel::Normal => Some(Self {
                _not_send: PhantomData,
            }),
            ExecutionLevel::Elevated => None,
        }
    }

    /// Obtain the token or raise a fatal diagnostic
    #[track_caller]
    pub fn require() -> Self {
        match Self::acquire() {
            Some(ctx) => ctx,
            None => bug_check(
                BugCheckCode::ExecutionContext,
                RAISED_DEPTH.with(Cell::get) as u64,
                0,
            ),
        }
    }

    /// Raise the thread; the token is unusable while the section lives
    pub fn raise(&mut self) -> ElevatedSection<'_> {
        ElevatedSection::enter_scoped()
    }
}

/// RAII guard raising the current thread to elevated context
#[derive(Debug)]
pub struct ElevatedSection<'a> {
    _not_send: PhantomData<*const ()>,
    _token: PhantomData<&'a mut NormalContext>,
}

impl ElevatedSection<'static> {
    /// Raise without a token (interrupt-style callers)
    pub fn enter() -> Self {
        Self::enter_scoped()
    }
}

impl<'a> ElevatedSection<'a> {
    fn enter_scoped() -> Self {
        RAISED_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
            _token: PhantomData,
        }
    }
}

impl Drop for ElevatedSection<'_> {
    fn drop(&mut self) {
        RAISED_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_by_default() {
        assert_eq!(current_level(), ExecutionLevel::Normal);
        assert!(NormalContext::acquire().is_some());
    }

    #[test]
    fn test_elevated_section_nests() {
        let outer = ElevatedSection::enter();
        assert!(NormalContext::acquire().is_none());
        {
            let _inner = ElevatedSection::enter();
            assert_eq!(current_level(), ExecutionLevel::Elevated);
        }
        assert_eq!(current_level(), ExecutionLevel::Elevated);
        drop(outer);
        assert_eq!(current_level(), ExecutionLevel::Normal);
    }

    #[test]
    fn test_raise_borrows_token() {
        let mut ctx = NormalContext::require();
        {
            let _section = ctx.raise();
            assert_eq!(current_level(), ExecutionLevel::Elevated);
        }
        assert_eq!(current_level(), ExecutionLevel::Normal);
    }

    #[test]
    #[should_panic(expected = "framework violation")]
    fn test_require_from_elevated_is_fatal() {
        let _section = ElevatedSection::enter();
        let _ctx = NormalContext::require();
    }
}
