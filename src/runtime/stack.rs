//! Per-(compartment, thread) stacks.

use memmap2::{MmapMut, MmapOptions};

use crate::compartment::CompartmentId;
use crate::error::{HardwareError, HardwareResult};
use crate::hardware::{PAGE_SIZE, ProtectionHardware};

/// One compartment's stack on one thread.
///
/// The lowest page is an inaccessible guard; overflowing into it traps like
/// any other protection violation.
#[derive(Debug)]
pub struct CompartmentStack {
    owner: CompartmentId,
    base: usize,
    size: usize,
    _map: MmapMut,
}

impl CompartmentStack {
    pub fn allocate(
        owner: CompartmentId,
        size: usize,
        hardware: &dyn ProtectionHardware,
    ) -> HardwareResult<Self> {
        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| HardwareError::Map {
                what: format!("stack of {owner}"),
                source: e,
            })?;
        let base = map.as_mut_ptr();
        // Safety: both ranges lie inside the fresh mapping and are page aligned.
        unsafe {
            hardware.tag_pages(base, PAGE_SIZE, libc::PROT_NONE, owner.get())?;
            hardware.tag_pages(
                base.add(PAGE_SIZE),
                size - PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                owner.get(),
            )?;
        }
        tracing::trace!(%owner, base = base as usize, size, "allocated compartment stack");
        Ok(Self {
            owner,
            base: base as usize,
            size,
            _map: map,
        })
    }

    pub fn owner(&self) -> CompartmentId {
        self.owner
    }

    /// One past the highest usable byte; the initial stack pointer.
    pub fn top(&self) -> usize {
        self.base + self.size
    }

    /// Lowest usable byte, just above the guard page.
    pub fn limit(&self) -> usize {
        self.base + PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.top()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.base..self.top()
    }
}
