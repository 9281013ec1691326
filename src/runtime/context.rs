//! Per-thread runtime state.
//!
//! A [`ThreadContext`] is created the first time a thread touches the runtime
//! and lives until the thread exits. It is never re-initialized: stack slots,
//! compartment-local blocks and loader-gate counters all hang off this one
//! record. Mappings are released when the thread exits.

use std::cell::{Cell, OnceCell};

use crate::compartment::{CompartmentId, ConfigError};
use crate::error::GateResult;
use crate::fault::AltStack;
use crate::hardware::MAX_KEYS;
use crate::loader::LoaderState;
use crate::memory::tls::{TlsBlock, pages_disjoint};

use super::stack::CompartmentStack;
use super::{Runtime, ThreadRecord};

thread_local! {
    static CONTEXT: OnceCell<ThreadContext> = const { OnceCell::new() };
}

/// Kernel thread id of the caller.
pub fn current_tid() -> u64 {
    // Safety: gettid has no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Runtime state of one thread.
#[derive(Debug)]
pub struct ThreadContext {
    tid: u64,
    runtime: &'static Runtime,
    /// Index = compartment id, starting with the shared compartment.
    stacks: Vec<CompartmentStack>,
    /// Next free stack address of each compartment on this thread.
    slots: [Cell<usize>; MAX_KEYS],
    /// OS stack pointer saved by process and thread entry.
    entry_sp: Cell<usize>,
    /// Index = compartment id - 1.
    tls: Vec<TlsBlock>,
    loader: LoaderState,
    _alt_stack: Option<AltStack>,
}

impl ThreadContext {
    fn new(runtime: &'static Runtime) -> GateResult<Self> {
        let hw = runtime.hardware();
        let config = runtime.config();
        let count = runtime.registry().count();

        let stacks = (0..=count)
            .filter_map(CompartmentId::new)
            .map(|id| CompartmentStack::allocate(id, config.stack_size, hw))
            .collect::<Result<Vec<_>, _>>()?;
        let slots = std::array::from_fn(|i| Cell::new(stacks.get(i).map_or(0, |s| s.top())));
        let tls = CompartmentId::range(count)
            .map(|id| TlsBlock::new(id, config.tls_pages, hw))
            .collect::<Result<Vec<_>, _>>()?;
        let alt_stack = if config.install_fault_handler {
            Some(AltStack::install()?)
        } else {
            None
        };

        let ctx = Self {
            tid: current_tid(),
            runtime,
            stacks,
            slots,
            entry_sp: Cell::new(0),
            tls,
            loader: LoaderState::new(),
            _alt_stack: alt_stack,
        };
        if !ctx.verify_tls_isolation() {
            return Err(ConfigError::TlsNotPadded {
                module: "compartment-local storage".into(),
            }
            .into());
        }
        runtime.threads().insert(ctx.tid, ctx.record());
        tracing::debug!(tid = ctx.tid, compartments = count, "thread context ready");
        Ok(ctx)
    }

    fn record(&self) -> ThreadRecord {
        ThreadRecord {
            stacks: self.stacks.iter().map(|s| (s.owner(), s.range())).collect(),
            tls: self
                .tls
                .iter()
                .map(|b| (b.owner(), b.base()..b.base() + b.len()))
                .collect(),
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn stack(&self, id: CompartmentId) -> Option<&CompartmentStack> {
        self.stacks.get(id.index())
    }

    /// Stack-pointer slot of `id` on this thread.
    pub fn slot(&self, id: CompartmentId) -> &Cell<usize> {
        &self.slots[id.index()]
    }

    pub fn entry_slot(&self) -> &Cell<usize> {
        &self.entry_sp
    }

    pub fn tls_block(&self, id: CompartmentId) -> Option<&TlsBlock> {
        id.index().checked_sub(1).and_then(|i| self.tls.get(i))
    }

    pub fn loader(&self) -> &LoaderState {
        &self.loader
    }

    /// No two compartments' local storage blocks share a page.
    pub fn verify_tls_isolation(&self) -> bool {
        let ranges: Vec<(usize, usize)> = self.tls.iter().map(|b| (b.base(), b.len())).collect();
        pages_disjoint(&ranges)
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.runtime.threads().remove(&self.tid);
    }
}

/// Run `f` with the calling thread's context, creating it on first use.
pub fn with_context<R>(
    runtime: &'static Runtime,
    f: impl FnOnce(&ThreadContext) -> R,
) -> GateResult<R> {
    CONTEXT
        .try_with(|cell| -> GateResult<R> {
            let ctx = match cell.get() {
                Some(ctx) => ctx,
                None => {
                    let fresh = ThreadContext::new(runtime)?;
                    cell.get_or_init(|| fresh)
                }
            };
            Ok(f(ctx))
        })
        .map_err(|_| ConfigError::ContextUnavailable)?
}
