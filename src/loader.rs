//! The dynamic loader as a compartment.
//!
//! `dlopen`, `dlsym` and `dlclose` run in the exit compartment (the one that
//! owns libc and the loader) behind a per-thread gate that saves the
//! caller's PKRU on a bounded stack. Loading a compartment's libraries can
//! also tag their writable segments.

use std::cell::Cell;
use std::ffi::{CStr, CString, c_void};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::compartment::CompartmentInfo;
use crate::error::{GateResult, LoaderError};
use crate::gate;
use crate::hardware::{Pkru, ProtectionHardware};
use crate::memory::{MemoryMap, segments};
use crate::runtime::Runtime;
use crate::runtime::context::with_context;

/// Deepest nesting of loader gates on one thread.
pub const MAX_DEPTH: usize = 32;

/// Set once the runtime is installed; before that the loader runs with
/// whatever rights the caller has.
static GATES_ACTIVE: AtomicBool = AtomicBool::new(false);

static ENTERS: AtomicU64 = AtomicU64::new(0);
static PKRU_SWITCHES: AtomicU64 = AtomicU64::new(0);
static OPENS: AtomicU64 = AtomicU64::new(0);
static LOOKUPS: AtomicU64 = AtomicU64::new(0);
static CLOSES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn activate_gates() {
    GATES_ACTIVE.store(true, Ordering::Release);
}

pub fn gates_active() -> bool {
    GATES_ACTIVE.load(Ordering::Acquire)
}

/// Loader gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub enters: u64,
    pub pkru_switches: u64,
    pub opens: u64,
    pub lookups: u64,
    pub closes: u64,
}

pub fn stats() -> LoaderStats {
    LoaderStats {
        enters: ENTERS.load(Ordering::Relaxed),
        pkru_switches: PKRU_SWITCHES.load(Ordering::Relaxed),
        opens: OPENS.load(Ordering::Relaxed),
        lookups: LOOKUPS.load(Ordering::Relaxed),
        closes: CLOSES.load(Ordering::Relaxed),
    }
}

/// Per-thread saved-PKRU stack of the loader gate.
#[derive(Debug)]
pub struct LoaderState {
    depth: Cell<usize>,
    saved: [Cell<u32>; MAX_DEPTH],
}

impl LoaderState {
    pub(crate) fn new() -> Self {
        Self {
            depth: Cell::new(0),
            saved: std::array::from_fn(|_| Cell::new(0)),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    fn push(&self, pkru: Pkru) -> Result<(), LoaderError> {
        let depth = self.depth.get();
        if depth >= MAX_DEPTH {
            return Err(LoaderError::Depth { depth: depth + 1 });
        }
        self.saved[depth].set(pkru.bits());
        self.depth.set(depth + 1);
        Ok(())
    }

    fn pop(&self) -> Option<Pkru> {
        let depth = self.depth.get().checked_sub(1)?;
        self.depth.set(depth);
        Some(Pkru::from_bits(self.saved[depth].get()))
    }
}

/// Run `f` behind the loader gate of the calling thread.
///
/// The loader's rights are added to the caller's for the duration of `f`
/// and the caller's exact PKRU is restored afterwards, nesting included.
pub fn with_loader_gate<R>(f: impl FnOnce() -> R) -> GateResult<R> {
    let rt = Runtime::global()?;
    let hw = rt.hardware();
    with_context(rt, |ctx| -> GateResult<R> {
        let state = ctx.loader();
        let saved = hw.read_pkru();
        state.push(saved)?;
        ENTERS.fetch_add(1, Ordering::Relaxed);

        let loader_pkru = saved.union(rt.config().exit_compartment().pkru());
        let switch = gates_active() && loader_pkru != saved;
        if switch {
            PKRU_SWITCHES.fetch_add(1, Ordering::Relaxed);
            // Safety: a superset of the caller's rights.
            unsafe { hw.write_pkru(loader_pkru) };
        }
        let _restore = GateExit {
            state,
            hardware: hw,
            switched: switch,
        };
        Ok(f())
    })?
}

/// Leaves the loader gate when dropped, unwinding included.
struct GateExit<'a> {
    state: &'a LoaderState,
    hardware: &'static dyn ProtectionHardware,
    switched: bool,
}

impl Drop for GateExit<'_> {
    fn drop(&mut self) {
        if let Some(restore) = self.state.pop() {
            if self.switched {
                // Safety: the value saved at entry on this thread.
                unsafe { self.hardware.write_pkru(restore) };
            }
        }
    }
}

fn loader_call<R>(f: impl FnOnce() -> R) -> GateResult<R> {
    let rt = Runtime::global()?;
    let exit = rt.config().exit_compartment();
    gate::try_call_in(exit, || with_loader_gate(f))?
}

fn last_dl_error() -> String {
    // Safety: dlerror returns a thread-local message or null.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown error".into()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// A shared object opened through the loader gate.
#[derive(Debug)]
pub struct Library {
    handle: NonNull<c_void>,
    path: String,
}

impl Library {
    /// `dlopen(path, RTLD_NOW)` in the loader's compartment.
    pub fn open(path: &str) -> GateResult<Self> {
        let c_path = CString::new(path).map_err(|_| LoaderError::InvalidName {
            name: path.to_string(),
        })?;
        OPENS.fetch_add(1, Ordering::Relaxed);
        let (handle, error) = loader_call(|| {
            // Safety: NUL-terminated path.
            let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
            let error = handle.is_null().then(last_dl_error);
            (handle as usize, error)
        })?;
        let handle = NonNull::new(handle as *mut c_void).ok_or_else(|| LoaderError::Open {
            path: path.to_string(),
            message: error.unwrap_or_default(),
        })?;
        tracing::debug!(path, "library opened");
        Ok(Self {
            handle,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of `name` in this library.
    pub fn symbol(&self, name: &str) -> GateResult<NonNull<c_void>> {
        let c_name = CString::new(name).map_err(|_| LoaderError::InvalidName {
            name: name.to_string(),
        })?;
        LOOKUPS.fetch_add(1, Ordering::Relaxed);
        let handle = self.handle.as_ptr() as usize;
        let (addr, error) = loader_call(|| {
            // Safety: the handle stays open while `self` lives.
            let addr = unsafe { libc::dlsym(handle as *mut c_void, c_name.as_ptr()) };
            let error = addr.is_null().then(last_dl_error);
            (addr as usize, error)
        })?;
        NonNull::new(addr as *mut c_void).ok_or_else(|| {
            LoaderError::Symbol {
                name: name.to_string(),
                message: error.unwrap_or_default(),
            }
            .into()
        })
    }

    /// `dlclose` the library.
    pub fn close(self) -> GateResult<()> {
        CLOSES.fetch_add(1, Ordering::Relaxed);
        let handle = self.handle.as_ptr() as usize;
        let (rc, error) = loader_call(|| {
            // Safety: the handle came from dlopen and is closed once.
            let rc = unsafe { libc::dlclose(handle as *mut c_void) };
            let error = (rc != 0).then(last_dl_error);
            (rc, error)
        })?;
        if rc != 0 {
            return Err(LoaderError::Close {
                message: error.unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }
}

/// Tag the writable segments of every loaded module `info` claims and record
/// the resulting regions. Returns the number of modules protected.
pub fn protect_module(
    info: &CompartmentInfo,
    hardware: &dyn ProtectionHardware,
    shared: &[Range<usize>],
    regions: &mut MemoryMap,
) -> GateResult<usize> {
    let images: Vec<_> = segments::loaded_modules()
        .into_iter()
        .filter(|image| info.loader.claims(&image.name))
        .collect();
    if images.is_empty() {
        return Err(LoaderError::ModuleNotFound {
            prefix: info.loader.libraries.join(";"),
        }
        .into());
    }
    for image in &images {
        let planned = segments::plan(image, info.id, shared)?;
        for region in &planned {
            regions.add(region.clone())?;
        }
        segments::apply(&planned, hardware)?;
        tracing::info!(module = %image.name, compartment = %info.id, regions = planned.len(), "protected module");
    }
    Ok(images.len())
}
