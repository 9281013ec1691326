//! Call gates: running a closure in another compartment.
//!
//! A crossing moves the calling thread onto the target compartment's stack,
//! switches PKRU to the target's value, runs the callee and switches back.
//! Arguments and results travel inside a frame written to the top of the
//! target stack, so the callee never needs the caller's stack and the caller
//! never needs the callee's.
//!
//! - [`call_in`] / [`try_call_in`]: closure-level gates
//! - [`opaque::Gated`]: a function pointer bound to its compartment
//! - [`cookie`]: split enter/exit for code that wraps foreign functions
//! - [`entry`]: process entry, exit and finalizers

pub mod conditions;
pub mod cookie;
pub mod entry;
pub mod manifest;
pub mod opaque;
pub mod signature;

use std::alloc::Layout;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::compartment::{CompartmentId, ConfigError};
use crate::error::{GateResult, HardwareError};
use crate::hardware::Transition;
use crate::runtime::context::{ThreadContext, with_context};
use crate::runtime::{Runtime, fatal, record_crossing};

pub use conditions::{ConditionFailure, Conditions};
pub use cookie::{CallgateCookie, callgate_enter, callgate_exit};
pub use entry::{exit_immediately, exit_process, on_exit, run_finalizers, run_main};
pub use manifest::{GateEntry, GateManifest};
pub use opaque::{CodeAddr, Gated, SignatureTag};
pub use signature::Signature;

/// Closure and result of one crossing, laid out on the target stack.
struct Frame<F, R> {
    func: Option<F>,
    out: Option<std::thread::Result<R>>,
}

/// First Rust frame on the target stack. Unwinding never leaves it.
unsafe extern "C" fn trampoline<F, R>(frame: *mut u8)
where
    F: FnOnce() -> R,
{
    // Safety: `frame` is the `Frame<F, R>` written by `switch_into`, which
    // stays untouched by the caller until the transition returns.
    let frame = unsafe { &mut *frame.cast::<Frame<F, R>>() };
    if let Some(func) = frame.func.take() {
        frame.out = Some(panic::catch_unwind(AssertUnwindSafe(func)));
    }
}

fn finish<R>(out: Option<std::thread::Result<R>>) -> R {
    match out {
        Some(Ok(value)) => value,
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => unreachable!("gate trampoline did not run"),
    }
}

/// Run `f` in `target` on this thread's stack for `target`.
///
/// `publish` receives the caller's stack pointer for the duration of the call
/// and is restored afterwards, together with `target`'s own slot.
pub(crate) fn switch_into<F, R>(
    rt: &Runtime,
    ctx: &ThreadContext,
    target: CompartmentId,
    publish: &Cell<usize>,
    f: F,
) -> GateResult<R>
where
    F: FnOnce() -> R,
{
    let hw = rt.hardware();
    let stack = ctx
        .stack(target)
        .ok_or(ConfigError::UnknownCompartment { id: target.get() })?;
    let caller_pkru = hw.read_pkru();
    let target_pkru = target.pkru();
    record_crossing();

    let here = 0u8;
    let on_target_stack = stack.contains(&here as *const u8 as usize);
    if !hw.switches_stacks() || on_target_stack {
        let mut frame = Frame::<F, R> {
            func: Some(f),
            out: None,
        };
        let frame_ptr: *mut u8 = (&mut frame as *mut Frame<F, R>).cast();
        if on_target_stack {
            // Already on the target stack: only the rights change.
            // Safety: the current stack carries `target`'s key.
            unsafe {
                hw.write_pkru(target_pkru);
                trampoline::<F, R>(frame_ptr);
                hw.write_pkru(caller_pkru);
            }
        } else {
            // Safety: the frame outlives the call, which runs in place.
            unsafe {
                hw.transition(&Transition {
                    frame: frame_ptr,
                    trampoline: trampoline::<F, R>,
                    stack_pointer: 0,
                    target_pkru,
                    caller_pkru,
                    caller_slot: publish.as_ptr(),
                })
            };
        }
        return Ok(finish(frame.out));
    }

    let target_slot = ctx.slot(target);
    let target_sp = target_slot.get();
    let published = publish.get();

    let layout = Layout::new::<Frame<F, R>>();
    let frame_addr = target_sp
        .checked_sub(layout.size())
        .map(|addr| addr & !(layout.align() - 1))
        .filter(|&addr| addr & !15 > stack.limit())
        .ok_or(HardwareError::StackExhausted { compartment: target.get() })?;
    let frame_ptr = frame_addr as *mut Frame<F, R>;
    let bridge = caller_pkru.union(target_pkru);

    // Safety: `frame_addr` lies inside the target stack below every live
    // frame of `target` on this thread, and the bridge PKRU grants both the
    // caller's and the target's key while it is written and read back.
    unsafe {
        hw.write_pkru(bridge);
        ptr::write(
            frame_ptr,
            Frame {
                func: Some(f),
                out: None,
            },
        );
        hw.write_pkru(caller_pkru);

        hw.transition(&Transition {
            frame: frame_ptr.cast(),
            trampoline: trampoline::<F, R>,
            stack_pointer: frame_addr & !15,
            target_pkru,
            caller_pkru,
            caller_slot: publish.as_ptr(),
        });
    }

    // Safety: as above; the trampoline has returned and the frame is ours again.
    let frame = unsafe {
        hw.write_pkru(bridge);
        let frame = ptr::read(frame_ptr);
        hw.write_pkru(caller_pkru);
        frame
    };
    publish.set(published);
    target_slot.set(target_sp);
    Ok(finish(frame.out))
}

/// Gate into `target` from whichever compartment the thread is in.
pub(crate) fn cross<F, R>(
    rt: &Runtime,
    ctx: &ThreadContext,
    target: CompartmentId,
    f: F,
) -> GateResult<R>
where
    F: FnOnce() -> R,
{
    let caller = rt.active_compartment();
    if caller == target {
        return Ok(f());
    }
    switch_into(rt, ctx, target, ctx.slot(caller), f)
}

/// Run `f` in compartment `target`.
///
/// Panics in `f` resume in the caller after the crossing is unwound.
pub fn try_call_in<F, R>(target: CompartmentId, f: F) -> GateResult<R>
where
    F: FnOnce() -> R,
{
    let rt = Runtime::global()?;
    if !target.is_shared() && !rt.registry().contains(target) {
        return Err(ConfigError::UnknownCompartment { id: target.get() }.into());
    }
    with_context(rt, |ctx| cross(rt, ctx, target, f))?
}

/// Like [`try_call_in`]; errors are fatal.
pub fn call_in<F, R>(target: CompartmentId, f: F) -> R
where
    F: FnOnce() -> R,
{
    try_call_in(target, f).unwrap_or_else(|e| fatal(e))
}

/// Run `f` in `target` from a stack that belongs to no compartment, such as
/// a fresh OS thread or the process entry point.
pub(crate) fn enter<F, R>(rt: &'static Runtime, target: CompartmentId, f: F) -> GateResult<R>
where
    F: FnOnce() -> R,
{
    with_context(rt, |ctx| switch_into(rt, ctx, target, ctx.entry_slot(), f))?
}
