//! Compartment-local storage.
//!
//! Each (thread, compartment) pair gets its own page-granular block tagged with
//! the compartment's key, so no two compartments' thread-locals ever share a
//! page. [`CompartmentLocal`] values are laid out at the same offset in every
//! thread's block of their owner.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::compartment::{CompartmentId, ConfigError};
use crate::error::{AllocError, GateResult, HardwareError, HardwareResult};
use crate::hardware::{MAX_KEYS, PAGE_SIZE, ProtectionHardware, page_ceil, page_floor};

/// Next free byte in every compartment's block layout.
static NEXT_OFFSET: [AtomicUsize; MAX_KEYS] = [const { AtomicUsize::new(0) }; MAX_KEYS];

const UNASSIGNED: usize = usize::MAX;

/// One compartment's storage block on one thread.
#[derive(Debug)]
pub struct TlsBlock {
    owner: CompartmentId,
    base: usize,
    len: usize,
    _map: MmapMut,
}

impl TlsBlock {
    pub fn new(
        owner: CompartmentId,
        pages: usize,
        hardware: &dyn ProtectionHardware,
    ) -> HardwareResult<Self> {
        let len = pages * PAGE_SIZE;
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|e| HardwareError::Map {
                what: format!("TLS block of {owner}"),
                source: e,
            })?;
        let base = map.as_mut_ptr();
        // Safety: fresh page-aligned mapping.
        unsafe {
            hardware.tag_pages(base, len, libc::PROT_READ | libc::PROT_WRITE, owner.get())?;
        }
        Ok(Self {
            owner,
            base: base as usize,
            len,
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

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

/// True when no two `(start, len)` ranges touch the same page.
pub fn pages_disjoint(ranges: &[(usize, usize)]) -> bool {
    let mut pages: Vec<(usize, usize)> = ranges
        .iter()
        .filter(|(_, len)| *len > 0)
        .map(|&(start, len)| (page_floor(start), page_ceil(start + len)))
        .collect();
    pages.sort_unstable();
    pages.windows(2).all(|w| w[0].1 <= w[1].0)
}

/// A thread-local value owned by one compartment.
///
/// Only code running in the owner compartment may access it; anyone else
/// faults on the page. Values are never dropped.
#[derive(Debug)]
pub struct CompartmentLocal<T: 'static> {
    owner: u8,
    offset: AtomicUsize,
    init: fn() -> T,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> CompartmentLocal<T> {
    #[doc(hidden)]
    pub const fn new(owner: u8, init: fn() -> T) -> Self {
        Self {
            owner,
            offset: AtomicUsize::new(UNASSIGNED),
            init,
            _marker: PhantomData,
        }
    }

    pub fn owner(&self) -> CompartmentId {
        CompartmentId::new(self.owner).unwrap_or(CompartmentId::SHARED)
    }

    const fn align() -> usize {
        if std::mem::align_of::<T>() > 8 {
            std::mem::align_of::<T>()
        } else {
            8
        }
    }

    /// Offset of the init flag; the value follows `align()` bytes later.
    fn offset(&self) -> usize {
        let current = self.offset.load(Ordering::Acquire);
        if current != UNASSIGNED {
            return current;
        }
        let align = Self::align();
        let total = align + std::mem::size_of::<T>();
        let slot = &NEXT_OFFSET[self.owner as usize % MAX_KEYS];
        let prev = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                Some(next.next_multiple_of(align) + total)
            })
            .unwrap_or_else(|prev| prev);
        let start = prev.next_multiple_of(align);
        match self
            .offset
            .compare_exchange(UNASSIGNED, start, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => start,
            Err(winner) => winner,
        }
    }

    fn slot(&'static self) -> GateResult<*mut u8> {
        let rt = crate::runtime::Runtime::global()?;
        let owner = CompartmentId::new(self.owner)
            .filter(|id| !id.is_shared() && rt.registry().contains(*id))
            .ok_or(ConfigError::UnknownCompartment { id: self.owner })?;
        let offset = self.offset();
        let total = Self::align() + std::mem::size_of::<T>();
        let base = crate::runtime::context::with_context(rt, |ctx| {
            ctx.tls_block(owner).map(|b| (b.base(), b.len()))
        })?;
        let (base, len) = base.ok_or(ConfigError::UnknownCompartment { id: self.owner })?;
        if offset + total > len {
            return Err(AllocError::Exhausted {
                compartment: self.owner,
                requested: total,
            }
            .into());
        }
        Ok((base + offset) as *mut u8)
    }

    /// Address of this thread's instance, without touching it.
    pub fn addr(&'static self) -> GateResult<usize> {
        Ok(self.slot()? as usize + Self::align())
    }

    /// Access this thread's instance, initializing it on first use.
    pub fn try_with<R>(&'static self, f: impl FnOnce(&T) -> R) -> GateResult<R> {
        let slot = self.slot()?;
        // Safety: the slot lies inside the owner's block for this thread and is
        // aligned for a `u64` flag followed by a `T`. Blocks start zeroed.
        unsafe {
            let flag = slot.cast::<u64>();
            let value = slot.add(Self::align()).cast::<T>();
            if flag.read() == 0 {
                value.write((self.init)());
                flag.write(1);
            }
            Ok(f(&*value))
        }
    }

    /// Like [`try_with`](Self::try_with); a missing runtime is fatal.
    pub fn with<R>(&'static self, f: impl FnOnce(&T) -> R) -> R {
        self.try_with(f)
            .unwrap_or_else(|e| crate::runtime::fatal(e))
    }
}

/// Declare a [`CompartmentLocal`].
///
/// ```no_run
/// mpkgate::compartment_local!(2 => static SECRET: std::cell::Cell<u32> = std::cell::Cell::new(0));
/// SECRET.with(|s| s.set(7));
/// ```
#[macro_export]
macro_rules! compartment_local {
    ($owner:expr => $(#[$attr:meta])* $vis:vis static $name:ident: $ty:ty = $init:expr $(;)?) => {
        $(#[$attr])*
        $vis static $name: $crate::memory::tls::CompartmentLocal<$ty> =
            $crate::memory::tls::CompartmentLocal::new($owner, || $init);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_pages() {
        assert!(pages_disjoint(&[(0x1000, 0x1000), (0x2000, 0x10)]));
        assert!(!pages_disjoint(&[(0x1000, 0x800), (0x1800, 0x10)]));
        assert!(!pages_disjoint(&[(0x3000, 0x2000), (0x4000, 0x1000)]));
        assert!(pages_disjoint(&[]));
    }

    #[test]
    fn offsets_are_stable_and_aligned() {
        static A: CompartmentLocal<u64> = CompartmentLocal::new(7, || 1);
        static B: CompartmentLocal<[u8; 3]> = CompartmentLocal::new(7, || [0; 3]);
        let a = A.offset();
        let b = B.offset();
        assert_eq!(A.offset(), a);
        assert_ne!(a, b);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
    }

    #[test]
    fn blocks_are_page_sized() {
        let block = TlsBlock::new(
            CompartmentId::new(1).unwrap(),
            2,
            crate::hardware::emulated(),
        )
        .unwrap();
        assert_eq!(block.len(), 2 * PAGE_SIZE);
        assert_eq!(block.base() % PAGE_SIZE, 0);
        assert!(block.contains(block.base() + PAGE_SIZE));
    }
}
