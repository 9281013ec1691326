//! Size-class arena over one anonymous mapping.
//!
//! Blocks are powers of two from 32 bytes up. Every allocation carries a
//! 16-byte header right before the returned pointer; free blocks are chained
//! through their second word. Both live inside the arena, so only code with
//! access to the arena's key can allocate or free in it. The free-list heads
//! and bump offset live in the arena struct itself, on the shared heap.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::compartment::CompartmentId;
use crate::error::{AllocError, AllocResult, HardwareError, HardwareResult};
use crate::hardware::ProtectionHardware;

const HEADER: usize = 16;
const MIN_CLASS_SHIFT: u32 = 5;
const CLASSES: usize = 40;

const LIVE: u32 = 0x1a21_face;
const FREED: u32 = 0xdead_f4ee;

#[repr(C)]
struct Header {
    magic: u32,
    class: u32,
    block: usize,
}

#[derive(Debug)]
struct ArenaState {
    bump: usize,
    free: [usize; CLASSES],
}

/// Usage counters of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ArenaStats {
    pub live_blocks: usize,
    pub mapped_bytes: usize,
    pub bump_bytes: usize,
}

/// One compartment's heap, or the shared heap for compartment 0.
#[derive(Debug)]
pub struct Arena {
    owner: CompartmentId,
    base: usize,
    len: usize,
    state: Mutex<ArenaState>,
    live: AtomicUsize,
    _map: MmapMut,
}

fn class_for(needed: usize) -> Option<usize> {
    let size = needed.max(1 << MIN_CLASS_SHIFT).checked_next_power_of_two()?;
    let class = (size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
    (class < CLASSES).then_some(class)
}

const fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

impl Arena {
    /// Map `len` bytes and tag them with `owner`'s key.
    pub fn new(
        owner: CompartmentId,
        len: usize,
        hardware: &dyn ProtectionHardware,
    ) -> HardwareResult<Self> {
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|e| HardwareError::Map {
                what: format!("arena of {owner}"),
                source: e,
            })?;
        let base = map.as_mut_ptr();
        if !owner.is_shared() {
            // Safety: the whole mapping is ours and page aligned.
            unsafe {
                hardware.tag_pages(base, len, libc::PROT_READ | libc::PROT_WRITE, owner.get())?;
            }
        }
        tracing::debug!(%owner, len, base = base as usize, "mapped arena");
        Ok(Self {
            owner,
            base: base as usize,
            len,
            state: Mutex::new(ArenaState {
                bump: 0,
                free: [0; CLASSES],
            }),
            live: AtomicUsize::new(0),
            _map: map,
        })
    }

    pub fn owner(&self) -> CompartmentId {
        self.owner
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies inside this arena.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// The caller must run with access to this arena's key.
    pub fn alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(AllocError::Layout { size, align });
        }
        let needed = HEADER
            .checked_add(size)
            .and_then(|n| n.checked_add(align.saturating_sub(HEADER)))
            .ok_or(AllocError::Layout { size, align })?;
        let class = class_for(needed).ok_or(AllocError::Exhausted {
            compartment: self.owner.get(),
            requested: size,
        })?;

        let block = {
            let mut state = self.state.lock().expect("arena lock poisoned");
            let head = state.free[class];
            if head != 0 {
                // Safety: free blocks hold their successor in their second word.
                state.free[class] = unsafe { *((head + 8) as *const usize) };
                head
            } else {
                let start = state.bump;
                if start + class_size(class) > self.len {
                    return Err(AllocError::Exhausted {
                        compartment: self.owner.get(),
                        requested: size,
                    });
                }
                state.bump += class_size(class);
                self.base + start
            }
        };

        let user = (block + HEADER).next_multiple_of(align.max(HEADER));
        // Safety: `user - HEADER .. user + size` lies inside the block.
        unsafe {
            ((user - HEADER) as *mut Header).write(Header {
                magic: LIVE,
                class: class as u32,
                block,
            });
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        // `user` is never zero: it is at least `base + HEADER`.
        NonNull::new(user as *mut u8).ok_or(AllocError::UnknownPointer { addr: user })
    }

    /// Allocate zeroed memory.
    pub fn alloc_zeroed(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        let ptr = self.alloc(size, align)?;
        // Safety: fresh allocation of at least `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    fn header(&self, ptr: NonNull<u8>) -> AllocResult<&mut Header> {
        let addr = ptr.as_ptr() as usize;
        if !self.contains(addr) || addr < self.base + HEADER {
            return Err(AllocError::UnknownPointer { addr });
        }
        // Safety: inside the arena and past the first header slot.
        let header = unsafe { &mut *((addr - HEADER) as *mut Header) };
        if header.magic != LIVE || header.class as usize >= CLASSES {
            return Err(AllocError::Corrupted { addr });
        }
        Ok(header)
    }

    /// Bytes usable behind `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> AllocResult<usize> {
        let header = self.header(ptr)?;
        Ok(header.block + class_size(header.class as usize) - ptr.as_ptr() as usize)
    }

    /// Return a block to its size class.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        let header = self.header(ptr)?;
        header.magic = FREED;
        let (block, class) = (header.block, header.class as usize);
        let mut state = self.state.lock().expect("arena lock poisoned");
        // Safety: the block is at least 32 bytes and no longer live.
        unsafe { *((block + 8) as *mut usize) = state.free[class] };
        state.free[class] = block;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Grow or shrink a block, copying into a new one when it does not fit.
    ///
    /// # Safety
    ///
    /// `ptr` must be live in this arena; on success it is invalidated unless
    /// returned unchanged.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        let usable = self.usable_size(ptr)?;
        if new_size <= usable && ptr.as_ptr() as usize % align == 0 {
            return Ok(ptr);
        }
        let fresh = self.alloc(new_size, align)?;
        // Safety: both blocks are live and distinct.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), usable.min(new_size));
            self.free(ptr)?;
        }
        Ok(fresh)
    }

    pub fn stats(&self) -> ArenaStats {
        let bump = self.state.lock().map(|s| s.bump).unwrap_or(0);
        ArenaStats {
            live_blocks: self.live.load(Ordering::Relaxed),
            mapped_bytes: self.len,
            bump_bytes: bump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware;

    fn arena(len: usize) -> Arena {
        Arena::new(CompartmentId::SHARED, len, hardware::emulated()).unwrap()
    }

    #[test]
    fn size_classes() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(32), Some(0));
        assert_eq!(class_for(33), Some(1));
        assert_eq!(class_size(3), 256);
        assert_eq!(class_for(usize::MAX), None);
    }

    #[test]
    fn alloc_free_reuses_blocks() {
        let arena = arena(1 << 20);
        let a = arena.alloc(24, 8).unwrap();
        unsafe { arena.free(a).unwrap() };
        let b = arena.alloc(20, 8).unwrap();
        assert_eq!(a, b);
        assert_eq!(arena.stats().live_blocks, 1);
    }

    #[test]
    fn honours_alignment() {
        let arena = arena(1 << 20);
        for align in [1, 8, 16, 64, 4096] {
            let p = arena.alloc(100, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
            assert!(arena.usable_size(p).unwrap() >= 100);
        }
    }

    #[test]
    fn zeroed_after_reuse() {
        let arena = arena(1 << 20);
        let p = arena.alloc(64, 16).unwrap();
        unsafe { p.as_ptr().write_bytes(0xab, 64) };
        unsafe { arena.free(p).unwrap() };
        let q = arena.alloc_zeroed(64, 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn realloc_preserves_contents() {
        let arena = arena(1 << 20);
        let p = arena.alloc(8, 8).unwrap();
        unsafe { p.as_ptr().cast::<u64>().write(0x0123_4567_89ab_cdef) };
        let q = unsafe { arena.realloc(p, 4000, 8).unwrap() };
        assert_ne!(p, q);
        assert_eq!(unsafe { q.as_ptr().cast::<u64>().read() }, 0x0123_4567_89ab_cdef);
        let same = unsafe { arena.realloc(q, 10, 8).unwrap() };
        assert_eq!(same, q);
    }

    #[test]
    fn detects_double_free_and_foreign_pointers() {
        let arena = arena(1 << 20);
        let p = arena.alloc(10, 8).unwrap();
        unsafe { arena.free(p).unwrap() };
        assert!(matches!(
            unsafe { arena.free(p) },
            Err(AllocError::Corrupted { .. })
        ));
        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>();
        assert!(matches!(
            unsafe { arena.free(foreign) },
            Err(AllocError::UnknownPointer { .. })
        ));
    }

    #[test]
    fn exhaustion() {
        let arena = arena(4096);
        assert!(arena.alloc(2000, 8).is_ok());
        assert!(matches!(
            arena.alloc(3000, 8),
            Err(AllocError::Exhausted { .. })
        ));
    }
}
