//! Process entry, exit and finalizers.
//!
//! The program's main body runs in compartment 1 on its own stack. Exiting
//! always passes through the exit compartment (libc's), on that
//! compartment's stack, with rights chosen by the configured
//! [`ExitPolicy`](crate::config::ExitPolicy).

use crate::compartment::CompartmentId;
use crate::error::GateResult;
use crate::hardware::ExitTransition;
use crate::runtime::context::with_context;
use crate::runtime::{Runtime, fatal};

use super::cookie::{callgate_enter, callgate_exit};

const EXIT_RED_ZONE: usize = 512;

/// Run the program body in compartment 1 and return its result.
///
/// PKRU is reset to the shared value afterwards, so destructors and `atexit`
/// handlers run without any compartment's rights.
pub fn run_main<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let rt = Runtime::global().unwrap_or_else(|e| fatal(e));
    let main = CompartmentId::new(1).unwrap_or(CompartmentId::SHARED);
    let out = super::enter(rt, main, f).unwrap_or_else(|e| fatal(e));
    // Safety: back on the OS stack, which carries key 0.
    unsafe { rt.hardware().write_pkru(CompartmentId::SHARED.pkru()) };
    out
}

/// Queue `f` to run in the exit compartment when the process exits through
/// [`exit_process`] or [`run_finalizers`].
pub fn on_exit(f: fn()) -> GateResult<()> {
    Runtime::global()?.on_exit(f);
    Ok(())
}

/// Run queued finalizers in the exit compartment, most recent first.
pub fn run_finalizers() -> GateResult<usize> {
    let rt = Runtime::global()?;
    let exit = rt.config().exit_compartment();
    let finalizers = rt.take_finalizers();
    for finalizer in &finalizers {
        let cookie = callgate_enter(exit, "finalizer");
        cookie.run(*finalizer);
        callgate_exit(cookie);
    }
    Ok(finalizers.len())
}

/// Run finalizers, then `exit(status)` in the exit compartment.
pub fn exit_process(status: i32) -> ! {
    if let Err(e) = run_finalizers() {
        tracing::debug!(error = %e, "no finalizers run");
    }
    exit_through(status, libc::exit)
}

/// `_exit(status)` in the exit compartment, skipping every handler.
pub fn exit_immediately(status: i32) -> ! {
    exit_through(status, libc::_exit)
}

fn exit_through(status: i32, exit: unsafe extern "C" fn(libc::c_int) -> !) -> ! {
    let Some(rt) = Runtime::try_global() else {
        // Safety: plain process exit.
        unsafe { exit(status) }
    };
    let hw = rt.hardware();
    let exit_id = rt.config().exit_compartment();
    let caller = hw.read_pkru();
    let target_pkru = rt.config().exit_policy.exit_pkru(caller, exit_id);

    // Never closed: the process ends on the other side.
    let cookie = callgate_enter(exit_id, "exit");
    let here = 0u8;
    let here = &here as *const u8 as usize;
    let stack_pointer = with_context(rt, |ctx| {
        // Stay below our own frames when already running on the exit stack.
        match ctx.stack(exit_id) {
            Some(stack) if stack.contains(here) => (here - EXIT_RED_ZONE) & !15,
            _ => ctx.slot(exit_id).get() & !15,
        }
    })
    .unwrap_or_else(|e| fatal(e));
    tracing::debug!(status, pkru = %target_pkru, compartment = %cookie.compartment(), "process exit");

    // Safety: the slot points into this thread's stack of the exit
    // compartment, which `target_pkru` grants under every policy.
    unsafe {
        hw.transition_exit(ExitTransition {
            stack_pointer,
            target_pkru,
            exit,
            status,
        })
    }
}
