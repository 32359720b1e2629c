//! Interceptor chains consulted before the dispatch table.

use std::sync::Arc;

use crate::error::{DfxResult, ErrorKind, Status};
use crate::irp::{Irp, RequestType};
use crate::dfx_ensure;

/// Result of consulting one interceptor
#[derive(Debug)]
pub enum InterceptResult {
    /// Not claimed; pass the message on unchanged
    Continue(Irp),
    /// Claimed; the interceptor completed or forwarded the message itself
    Handled(Status),
}

/// Driver hook consulted for read, write and control requests
pub trait Interceptor: Send + Sync {
    fn intercept(&self, irp: Irp) -> InterceptResult;
}

impl<F> Interceptor for F
where
    F: Fn(Irp) -> InterceptResult + Send + Sync,
{
    fn intercept(&self, irp: Irp) -> InterceptResult {
        self(irp)
    }
}

/// Types that accept interceptors, in chain order
pub const INTERCEPTABLE_TYPES: [RequestType; 4] = [
    RequestType::Read,
    RequestType::Write,
    RequestType::DeviceControl,
    RequestType::InternalDeviceControl,
];

static_assertions::const_assert_eq!(INTERCEPTABLE_TYPES.len(), 4);

fn chain_index(ty: RequestType) -> Option<usize> {
    INTERCEPTABLE_TYPES.iter().position(|t| *t == ty)
}

/// Outcome of running a whole chain
#[derive(Debug)]
pub(crate) enum ChainOutcome {
    Unclaimed(Irp),
    Handled(Status),
    /// An interceptor handed back a message of another type
    TypeChanged(Irp),
}

/// One hook chain per interceptable type
#[derive(Default)]
pub(crate) struct InterceptorChains {
    chains: [spin::RwLock<Vec<Arc<dyn Interceptor>>>; INTERCEPTABLE_TYPES.len()],
}

impl core::fmt::Debug for InterceptorChains {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let lens: Vec<usize> = self.chains.iter().map(|chain| chain.read().len()).collect();
        f.debug_struct("InterceptorChains").field("lens", &lens).finish()
    }
}

impl InterceptorChains {
    /// Append a hook to the chain for `ty`
    pub fn register(&self, ty: RequestType, interceptor: Arc<dyn Interceptor>) -> DfxResult<()> {
        let index = chain_index(ty);
        dfx_ensure!(
            index.is_some(),
            ErrorKind::InvalidArgument,
            "interceptors accept read, write and control types only",
            "{}",
            ty
        );

        if let Some(index) = index {
            self.chains[index].write().push(interceptor);
        }
        Ok(())
    }

    pub fn len(&self, ty: RequestType) -> usize {
        chain_index(ty).map_or(0, |index| self.chains[index].read().len())
    }

    /// Run the chain for the message's type
    ///
    /// Hooks run without the chain lock held, so a hook may register more.
    pub fn run(&self, mut irp: Irp) -> ChainOutcome {
        let ty = irp.major();
        let Some(index) = chain_index(ty) else {
            return ChainOutcome::Unclaimed(irp);
        };

        let mut position = 0;
        loop {
            let hook = self.chains[index].read().get(position).cloned();
            let Some(hook) = hook else {
                return ChainOutcome::Unclaimed(irp);
            };

            match hook.intercept(irp) {
                InterceptResult::Handled(status) => return ChainOutcome::Handled(status),
                InterceptResult::Continue(next) if next.major() != ty => {
                    return ChainOutcome::TypeChanged(next)
                },
                InterceptResult::Continue(next) => irp = next,
            }
            position += 1;
        }
    }
}
