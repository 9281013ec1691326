//! Protection-fault handling.
//!
//! A SIGSEGV handler runs on a per-thread alternate stack that carries no
//! compartment key. It reports the fault on stderr and exits: status 0 when a
//! fault was announced with [`expect_violation`], 255 otherwise. An announced
//! fault that never happens exits with status 1.
//!
//! With `permissive` set in the configuration, protection-key faults are
//! recorded and execution continues instead; see [`permissive`].
//!
//! The handler only uses async-signal-safe calls (`write`, `_exit`).

pub mod permissive;

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{HardwareError, HardwareResult};
use crate::hardware::Backend;
use crate::runtime::Runtime;

pub const EXIT_EXPECTED: i32 = 0;
pub const EXIT_UNEXPECTED: i32 = 255;
pub const EXIT_MISSED: i32 = 1;

const ALT_STACK_SIZE: usize = 64 * 1024;

static EXPECTING: AtomicBool = AtomicBool::new(false);
static RESET_PKRU: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

fn report(msg: &[u8]) {
    // Safety: fd 2 and a valid buffer; write is async-signal-safe.
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
    }
}

extern "C" fn on_fault(_sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    #[cfg(target_arch = "x86_64")]
    if RESET_PKRU.load(Ordering::Relaxed) {
        // Safety: only set when the MPK backend is active. Open every key so
        // the exit path can run.
        unsafe { crate::hardware::x86_64::wrpkru(0) };
    }
    if EXPECTING.load(Ordering::SeqCst) {
        report(b"VIOLATION: faulted as expected\n");
        // Safety: terminates the process.
        unsafe { libc::_exit(EXIT_EXPECTED) }
    }
    // Safety: the handler's own arguments.
    #[cfg(target_arch = "x86_64")]
    if unsafe { permissive::handler::absorb(info, uctx) } {
        return;
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (info, uctx);
    report(b"VIOLATION: unexpected fault\n");
    unsafe { libc::_exit(EXIT_UNEXPECTED) }
}

/// Install the process-wide SIGSEGV handler.
pub fn install(rt: &Runtime) -> HardwareResult<()> {
    RESET_PKRU.store(rt.hardware().backend() == Backend::Mpk, Ordering::Relaxed);
    // Safety: a zeroed sigaction is a valid starting point; every field the
    // kernel reads is set below.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_fault
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) != 0 {
            return Err(HardwareError::Signal {
                source: std::io::Error::last_os_error(),
            });
        }
    }
    INSTALLED.store(true, Ordering::Release);
    tracing::debug!("fault handler installed");
    if rt.config().permissive {
        if rt.hardware().backend() == Backend::Mpk {
            permissive::install(rt)?;
        } else {
            tracing::debug!(backend = ?rt.hardware().backend(), "permissive mode has nothing to absorb");
        }
    }
    Ok(())
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Run `f`, which must fault. Never returns.
pub fn expect_violation<F: FnOnce()>(f: F) -> ! {
    EXPECTING.store(true, Ordering::SeqCst);
    f();
    EXPECTING.store(false, Ordering::SeqCst);
    report(b"VIOLATION: did not fault as expected\n");
    // Safety: terminates the process.
    unsafe { libc::_exit(EXIT_MISSED) }
}

/// Evaluate an expression that must fault. See [`expect_violation`].
///
/// ```no_run
/// # let secret: *const u32 = std::ptr::null();
/// mpkgate::check_violation!(unsafe { secret.read_volatile() });
/// ```
#[macro_export]
macro_rules! check_violation {
    ($e:expr) => {
        $crate::fault::expect_violation(|| {
            ::std::hint::black_box($e);
        })
    };
}

/// An alternate signal stack for the calling thread.
///
/// Untagged, so the handler can run whatever PKRU the faulting code held.
#[derive(Debug)]
pub struct AltStack {
    _map: MmapMut,
}

impl AltStack {
    pub fn install() -> HardwareResult<Self> {
        let mut map = MmapOptions::new()
            .len(ALT_STACK_SIZE)
            .map_anon()
            .map_err(|e| HardwareError::Map {
                what: "signal stack".into(),
                source: e,
            })?;
        let stack = libc::stack_t {
            ss_sp: map.as_mut_ptr().cast(),
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        // Safety: the mapping outlives the registration; Drop disables it
        // before unmapping.
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(HardwareError::Signal {
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self { _map: map })
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let disable = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        // Safety: disabling the alternate stack has no preconditions.
        unsafe {
            libc::sigaltstack(&disable, ptr::null_mut());
        }
    }
}
