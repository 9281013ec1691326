//! Private and shared allocation.
//!
//! Private calls (`malloc`, `free`, ...) go to the arena of whichever
//! compartment the calling thread's PKRU currently grants. The `shared_*`
//! family always uses the shared arena.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::arena::{Arena, ArenaStats};
use crate::compartment::CompartmentId;
use crate::error::{AllocError, AllocResult, GateResult, HardwareResult};
use crate::hardware::ProtectionHardware;
use crate::runtime::Runtime;

/// Alignment C callers expect from `malloc`.
pub const MALLOC_ALIGN: usize = 16;

/// All arenas of the process: index 0 is shared, then one per compartment.
#[derive(Debug)]
pub struct Heap {
    arenas: Vec<Arena>,
    leaked_foreign: AtomicUsize,
}

impl Heap {
    /// Map the shared arena plus one arena per compartment.
    pub fn new(
        compartments: u8,
        arena_size: usize,
        hardware: &dyn ProtectionHardware,
    ) -> HardwareResult<Self> {
        let arenas = (0..=compartments)
            .filter_map(CompartmentId::new)
            .map(|id| Arena::new(id, arena_size, hardware))
            .collect::<HardwareResult<Vec<_>>>()?;
        Ok(Self {
            arenas,
            leaked_foreign: AtomicUsize::new(0),
        })
    }

    pub fn arena(&self, owner: CompartmentId) -> Option<&Arena> {
        self.arenas.get(owner.index())
    }

    pub fn shared(&self) -> &Arena {
        &self.arenas[0]
    }

    pub fn arenas(&self) -> impl Iterator<Item = &Arena> {
        self.arenas.iter()
    }

    /// The arena holding `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<&Arena> {
        self.arenas.iter().find(|a| a.contains(addr))
    }

    fn arena_or_shared(&self, owner: CompartmentId) -> &Arena {
        self.arena(owner).unwrap_or_else(|| self.shared())
    }

    /// Allocate in `owner`'s arena.
    pub fn alloc_in(&self, owner: CompartmentId, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        self.arena_or_shared(owner).alloc(size, align)
    }

    /// Free a pointer on behalf of `active`.
    ///
    /// Shared pointers may be freed by anyone; private ones only by their owner.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used afterwards.
    pub unsafe fn free_as(&self, active: CompartmentId, ptr: NonNull<u8>) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let arena = self
            .owner_of(addr)
            .ok_or(AllocError::UnknownPointer { addr })?;
        if !arena.owner().is_shared() && arena.owner() != active {
            return Err(AllocError::ForeignPointer {
                addr,
                owner: arena.owner().get(),
                active: active.get(),
            });
        }
        unsafe { arena.free(ptr) }
    }

    /// Resize on behalf of `active`.
    ///
    /// # Safety
    ///
    /// As for [`Arena::realloc`].
    pub unsafe fn realloc_as(
        &self,
        active: CompartmentId,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        let arena = self
            .owner_of(addr)
            .ok_or(AllocError::UnknownPointer { addr })?;
        if !arena.owner().is_shared() && arena.owner() != active {
            return Err(AllocError::ForeignPointer {
                addr,
                owner: arena.owner().get(),
                active: active.get(),
            });
        }
        unsafe { arena.realloc(ptr, size, align) }
    }

    /// Foreign frees the global allocator had to drop on the floor.
    pub fn leaked_foreign(&self) -> usize {
        self.leaked_foreign.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<(CompartmentId, ArenaStats)> {
        self.arenas.iter().map(|a| (a.owner(), a.stats())).collect()
    }
}

fn runtime() -> GateResult<&'static Runtime> {
    Ok(Runtime::global()?)
}

/// Allocate in the active compartment's arena.
pub fn malloc(size: usize) -> GateResult<NonNull<u8>> {
    let rt = runtime()?;
    Ok(rt.heap().alloc_in(rt.active_compartment(), size, MALLOC_ALIGN)?)
}

/// Allocate zeroed memory for `count` items of `size` bytes in the active arena.
pub fn calloc(count: usize, size: usize) -> GateResult<NonNull<u8>> {
    let rt = runtime()?;
    let total = count
        .checked_mul(size)
        .ok_or(AllocError::Layout { size, align: MALLOC_ALIGN })?;
    let arena = rt.heap().arena_or_shared(rt.active_compartment());
    Ok(arena.alloc_zeroed(total, MALLOC_ALIGN)?)
}

/// Resize a private (or shared) block.
///
/// # Safety
///
/// `ptr` must be live; it is invalidated unless returned unchanged.
pub unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> GateResult<NonNull<u8>> {
    let rt = runtime()?;
    Ok(unsafe { rt.heap().realloc_as(rt.active_compartment(), ptr, size, MALLOC_ALIGN)? })
}

/// Release a block owned by the active compartment or by the shared arena.
///
/// # Safety
///
/// `ptr` must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>) -> GateResult<()> {
    let rt = runtime()?;
    Ok(unsafe { rt.heap().free_as(rt.active_compartment(), ptr)? })
}

/// Allocate in the shared arena.
pub fn shared_malloc(size: usize) -> GateResult<NonNull<u8>> {
    Ok(runtime()?.heap().shared().alloc(size, MALLOC_ALIGN)?)
}

/// Allocate zeroed memory in the shared arena.
pub fn shared_calloc(count: usize, size: usize) -> GateResult<NonNull<u8>> {
    let total = count
        .checked_mul(size)
        .ok_or(AllocError::Layout { size, align: MALLOC_ALIGN })?;
    Ok(runtime()?.heap().shared().alloc_zeroed(total, MALLOC_ALIGN)?)
}

/// Resize a shared block.
///
/// # Safety
///
/// `ptr` must be a live shared allocation.
pub unsafe fn shared_realloc(ptr: NonNull<u8>, size: usize) -> GateResult<NonNull<u8>> {
    Ok(unsafe { runtime()?.heap().shared().realloc(ptr, size, MALLOC_ALIGN)? })
}

/// Release a shared block.
///
/// # Safety
///
/// `ptr` must not be used afterwards.
pub unsafe fn shared_free(ptr: NonNull<u8>) -> GateResult<()> {
    Ok(unsafe { runtime()?.heap().shared().free(ptr)? })
}

/// Global allocator that routes through the compartment arenas.
///
/// Before the runtime is installed every request goes to [`System`]. Memory
/// is returned to whichever allocator handed it out.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOC: mpkgate::memory::CompartmentAlloc = mpkgate::memory::CompartmentAlloc;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CompartmentAlloc;

unsafe impl GlobalAlloc for CompartmentAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match Runtime::try_global() {
            Some(rt) => rt
                .heap()
                .alloc_in(rt.active_compartment(), layout.size(), layout.align())
                .map_or(std::ptr::null_mut(), NonNull::as_ptr),
            None => unsafe { System.alloc(layout) },
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(rt) = Runtime::try_global() else {
            return unsafe { System.dealloc(ptr, layout) };
        };
        let Some(nn) = NonNull::new(ptr) else {
            return;
        };
        if rt.heap().owner_of(ptr as usize).is_none() {
            return unsafe { System.dealloc(ptr, layout) };
        }
        // Freeing another compartment's block would fault on its header.
        if unsafe { rt.heap().free_as(rt.active_compartment(), nn) }.is_err() {
            rt.heap().leaked_foreign.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(rt) = Runtime::try_global() else {
            return unsafe { System.realloc(ptr, layout, new_size) };
        };
        let Some(nn) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        if rt.heap().owner_of(ptr as usize).is_some() {
            return unsafe { rt.heap().realloc_as(rt.active_compartment(), nn, new_size, layout.align()) }
                .map_or(std::ptr::null_mut(), NonNull::as_ptr);
        }
        // Block predates the runtime: move it into the active arena.
        let fresh = rt
            .heap()
            .alloc_in(rt.active_compartment(), new_size, layout.align());
        match fresh {
            Ok(fresh) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), layout.size().min(new_size));
                    System.dealloc(ptr, layout);
                }
                fresh.as_ptr()
            }
            Err(_) => std::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware;

    fn heap() -> Heap {
        Heap::new(2, 1 << 20, hardware::emulated()).unwrap()
    }

    fn id(n: u8) -> CompartmentId {
        CompartmentId::new(n).unwrap()
    }

    #[test]
    fn one_arena_per_compartment_plus_shared() {
        let heap = heap();
        let owners: Vec<u8> = heap.arenas().map(|a| a.owner().get()).collect();
        assert_eq!(owners, vec![0, 1, 2]);
    }

    #[test]
    fn private_blocks_land_in_owner_arena() {
        let heap = heap();
        let p = heap.alloc_in(id(2), 40, MALLOC_ALIGN).unwrap();
        assert_eq!(heap.owner_of(p.as_ptr() as usize).unwrap().owner(), id(2));
    }

    #[test]
    fn foreign_free_is_rejected() {
        let heap = heap();
        let p = heap.alloc_in(id(1), 40, MALLOC_ALIGN).unwrap();
        let err = unsafe { heap.free_as(id(2), p) }.unwrap_err();
        assert!(matches!(err, AllocError::ForeignPointer { owner: 1, active: 2, .. }));
        unsafe { heap.free_as(id(1), p).unwrap() };
    }

    #[test]
    fn shared_blocks_are_freed_by_anyone() {
        let heap = heap();
        let p = heap.shared().alloc(8, MALLOC_ALIGN).unwrap();
        unsafe { heap.free_as(id(2), p).unwrap() };
    }

    #[test]
    fn realloc_stays_in_owner_arena() {
        let heap = heap();
        let p = heap.alloc_in(id(1), 16, MALLOC_ALIGN).unwrap();
        let q = unsafe { heap.realloc_as(id(1), p, 10_000, MALLOC_ALIGN).unwrap() };
        assert_eq!(heap.owner_of(q.as_ptr() as usize).unwrap().owner(), id(1));
    }
}
