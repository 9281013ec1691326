//! Threads that inherit the spawner's compartment.

use std::thread::JoinHandle;

use crate::error::{GateResult, HardwareError};
use crate::runtime::{Runtime, fatal};

/// Spawn a thread that starts in the calling thread's compartment.
///
/// The new thread gets its own set of compartment stacks; `f` runs on the
/// inherited compartment's stack under that compartment's rights.
pub fn spawn<F, T>(f: F) -> GateResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let rt = Runtime::global()?;
    let compartment = rt.active_compartment();
    let handle = std::thread::Builder::new()
        .spawn(move || {
            tracing::debug!(%compartment, "thread started");
            crate::gate::enter(rt, compartment, f).unwrap_or_else(|e| fatal(e))
        })
        .map_err(|source| HardwareError::Spawn { source })?;
    Ok(handle)
}
