//! Permissive mode: record protection-key faults and keep running.
//!
//! On a PKU fault the SIGSEGV handler opens every key in the interrupted
//! context and sets the trap flag, so the faulting instruction runs exactly
//! once more. The following SIGTRAP puts the saved PKRU back and clears the
//! flag. Each violation goes into a fixed ring in shared memory, which a
//! background thread drains into `tracing` warnings.
//!
//! Only meaningful on the MPK backend; the other backends never raise PKU
//! faults.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::compartment::CompartmentId;
use crate::error::{HardwareError, HardwareResult};
use crate::hardware::Pkru;
use crate::memory::SharedPage;
use crate::runtime::Runtime;

const CAPACITY: usize = 256;
const LOG_INTERVAL: Duration = Duration::from_millis(100);

/// One access the enforcing handler would have turned into an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Faulting data address.
    pub addr: usize,
    /// Faulting instruction.
    pub pc: usize,
    /// PKRU in force when the access faulted.
    pub pkru: u32,
}

impl Violation {
    /// Compartment whose rights the faulting code held.
    pub fn compartment(&self) -> CompartmentId {
        CompartmentId::from_pkru(Pkru::from_bits(self.pkru))
    }
}

struct Slot {
    ready: AtomicBool,
    addr: AtomicUsize,
    pc: AtomicUsize,
    pkru: AtomicU32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            addr: AtomicUsize::new(0),
            pc: AtomicUsize::new(0),
            pkru: AtomicU32::new(0),
        }
    }
}

/// Bounded multi-producer ring. Producers run in signal handlers and never
/// block; a full ring drops the record and counts it.
pub(crate) struct ViolationRing {
    written: AtomicUsize,
    read: AtomicUsize,
    recorded: AtomicU64,
    dropped: AtomicU64,
    slots: [Slot; CAPACITY],
}

impl ViolationRing {
    pub(crate) const fn new() -> Self {
        Self {
            written: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slots: [const { Slot::new() }; CAPACITY],
        }
    }

    /// Async-signal-safe.
    pub(crate) fn push(&self, violation: Violation) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let index = loop {
            let written = self.written.load(Ordering::Acquire);
            if written.wrapping_sub(self.read.load(Ordering::Acquire)) >= CAPACITY {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if self
                .written
                .compare_exchange_weak(written, written + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break written;
            }
        };
        let slot = &self.slots[index % CAPACITY];
        slot.addr.store(violation.addr, Ordering::Relaxed);
        slot.pc.store(violation.pc, Ordering::Relaxed);
        slot.pkru.store(violation.pkru, Ordering::Relaxed);
        slot.ready.store(true, Ordering::Release);
    }

    /// Take every complete record in order. Single consumer.
    pub(crate) fn drain(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        loop {
            let read = self.read.load(Ordering::Acquire);
            if read == self.written.load(Ordering::Acquire) {
                break;
            }
            let slot = &self.slots[read % CAPACITY];
            // A producer claimed the slot but has not filled it yet.
            if !slot.ready.load(Ordering::Acquire) {
                break;
            }
            out.push(Violation {
                addr: slot.addr.load(Ordering::Relaxed),
                pc: slot.pc.load(Ordering::Relaxed),
                pkru: slot.pkru.load(Ordering::Relaxed),
            });
            slot.ready.store(false, Ordering::Release);
            self.read.store(read + 1, Ordering::Release);
        }
        out
    }

    pub(crate) fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

crate::shared_data! {
    static VIOLATIONS: SharedPage<ViolationRing> = SharedPage::new(ViolationRing::new());
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static DRAIN: Mutex<()> = Mutex::new(());

/// Whether faults are being recorded instead of ending the process.
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Violations recorded since start-up, including dropped ones.
pub fn violation_count() -> u64 {
    VIOLATIONS.recorded()
}

/// Violations lost to a full ring.
pub fn dropped_violations() -> u64 {
    VIOLATIONS.dropped()
}

/// Take the violations not yet logged.
pub fn drain_violations() -> Vec<Violation> {
    let _guard = DRAIN.lock().expect("violation drain lock poisoned");
    VIOLATIONS.drain()
}

/// Log pending violations as warnings. Returns how many were logged.
pub fn log_violations() -> usize {
    let pending = drain_violations();
    for v in &pending {
        tracing::warn!(
            addr = format_args!("{:#x}", v.addr),
            pc = format_args!("{:#x}", v.pc),
            pkru = format_args!("{:#010x}", v.pkru),
            compartment = %v.compartment(),
            "protection key violation"
        );
    }
    let dropped = dropped_violations();
    if dropped > 0 && !pending.is_empty() {
        tracing::warn!(dropped, "violations lost to a full log");
    }
    pending.len()
}

fn flush_at_exit() {
    log_violations();
}

/// Switch the SIGSEGV handler to recording mode and start the logger.
pub(super) fn install(rt: &Runtime) -> HardwareResult<()> {
    #[cfg(target_arch = "x86_64")]
    handler::install()?;
    ACTIVE.store(true, Ordering::Release);

    std::thread::Builder::new()
        .name("mpkgate-violations".into())
        .spawn(|| {
            loop {
                std::thread::sleep(LOG_INTERVAL);
                log_violations();
            }
        })
        .map_err(|e| HardwareError::Spawn { source: e })?;
    rt.on_exit(flush_at_exit);
    tracing::info!("permissive mode: protection faults are logged, not fatal");
    Ok(())
}

/// Signal-side half. Edits the interrupted context's XSAVE image, which the
/// kernel loads back into PKRU on return from the handler.
#[cfg(target_arch = "x86_64")]
pub(super) mod handler {
    use std::cell::Cell;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{VIOLATIONS, Violation};
    use crate::error::{HardwareError, HardwareResult};

    const SEGV_PKUERR: libc::c_int = 4;
    const TRAP_FLAG: libc::greg_t = 0x100;
    const XSAVE_HEADER: usize = 512;
    const XFEATURE_PKRU: u64 = 1 << 9;

    static PKRU_OFFSET: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static SAVED_PKRU: Cell<Option<u32>> = const { Cell::new(None) };
    }

    /// Offset of the PKRU component in the XSAVE area.
    fn pkru_xsave_offset() -> usize {
        // Safety: CPUID is available on every x86_64 CPU.
        let leaf = unsafe { std::arch::x86_64::__cpuid_count(0xd, 9) };
        leaf.ebx as usize
    }

    /// Swap the saved PKRU in `uctx` for `value` and return the old one.
    ///
    /// # Safety
    ///
    /// `uctx` is the context a signal handler received.
    unsafe fn swap_pkru(uctx: *mut libc::c_void, value: u32) -> Option<u32> {
        let offset = PKRU_OFFSET.load(Ordering::Relaxed);
        // Safety: per the caller; the XSAVE image follows the legacy region
        // and holds the PKRU component at the CPUID-reported offset.
        unsafe {
            let uctx = uctx.cast::<libc::ucontext_t>().as_mut()?;
            let xsave = uctx.uc_mcontext.fpregs.cast::<u8>();
            if xsave.is_null() || offset == 0 {
                return None;
            }
            let header = xsave.add(XSAVE_HEADER).cast::<u64>();
            header.write_unaligned(header.read_unaligned() | XFEATURE_PKRU);
            let pkru = xsave.add(offset).cast::<u32>();
            let old = pkru.read_unaligned();
            pkru.write_unaligned(value);
            Some(old)
        }
    }

    /// Record a PKU fault and let the instruction retry with every key open.
    /// Returns false when the fault is not ours to absorb.
    ///
    /// # Safety
    ///
    /// Arguments are those of a SIGSEGV handler.
    pub(in crate::fault) unsafe fn absorb(
        info: *mut libc::siginfo_t,
        uctx: *mut libc::c_void,
    ) -> bool {
        if !super::is_active() {
            return false;
        }
        // Safety: per the caller.
        let Some(info) = (unsafe { info.as_ref() }) else {
            return false;
        };
        if info.si_code != SEGV_PKUERR {
            return false;
        }
        // Safety: per the caller.
        let Some(old) = (unsafe { swap_pkru(uctx, 0) }) else {
            return false;
        };
        // Safety: checked non-null by `swap_pkru`.
        let gregs = unsafe { &mut (*uctx.cast::<libc::ucontext_t>()).uc_mcontext.gregs };
        gregs[libc::REG_EFL as usize] |= TRAP_FLAG;
        SAVED_PKRU.with(|saved| saved.set(Some(old)));
        VIOLATIONS.push(Violation {
            // Safety: SIGSEGV always carries a fault address.
            addr: unsafe { info.si_addr() } as usize,
            pc: gregs[libc::REG_RIP as usize] as usize,
            pkru: old,
        });
        true
    }

    extern "C" fn on_trap(_sig: libc::c_int, _info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
        let Some(old) = SAVED_PKRU.with(Cell::take) else {
            // Not a single step we started.
            // Safety: restores the default action and re-raises.
            unsafe {
                libc::signal(libc::SIGTRAP, libc::SIG_DFL);
                libc::raise(libc::SIGTRAP);
            }
            return;
        };
        // Safety: `uctx` is this handler's context argument.
        unsafe {
            swap_pkru(uctx, old);
            let uctx = &mut *uctx.cast::<libc::ucontext_t>();
            uctx.uc_mcontext.gregs[libc::REG_EFL as usize] &= !TRAP_FLAG;
        }
    }

    pub(in crate::fault) fn install() -> HardwareResult<()> {
        PKRU_OFFSET.store(pkru_xsave_offset(), Ordering::Relaxed);
        // Safety: as for the SIGSEGV handler.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_trap
                as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
                as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGTRAP, &action, ptr::null_mut()) != 0 {
                return Err(HardwareError::Signal {
                    source: std::io::Error::last_os_error(),
                });
            }
        }
        Ok(())
    }
}
