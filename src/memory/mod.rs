//! Memory model: who owns which bytes.
//!
//! - [`map`]: disjoint region map with private / shared-rw / shared-ro classes
//! - [`arena`] and [`heap`]: one arena per compartment plus a shared arena
//! - [`tls`]: page-isolated compartment-local storage
//! - [`segments`]: classification of loaded ELF modules

pub mod arena;
pub mod heap;
pub mod map;
pub mod segments;
pub mod tls;

use std::ops::{Deref, DerefMut};

pub use heap::{CompartmentAlloc, Heap};
pub use map::{Classification, MemoryMap, Region};
pub use tls::CompartmentLocal;

/// A page-aligned wrapper for shared statics.
///
/// Placing one first in the shared section makes the section start on a page
/// boundary, which segment planning requires.
#[repr(C, align(4096))]
#[derive(Debug, Default)]
pub struct SharedPage<T>(pub T);

impl<T> SharedPage<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Byte range the value occupies.
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self as *const Self as usize;
        start..start + std::mem::size_of::<T>()
    }
}

impl<T> Deref for SharedPage<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for SharedPage<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Declare statics that every compartment may read and write.
///
/// The statics go into the `mpkgate_shared` section, which module protection
/// never tags.
///
/// ```no_run
/// use std::sync::atomic::AtomicU16;
/// use mpkgate::memory::SharedPage;
///
/// mpkgate::shared_data! {
///     pub static COUNTER: SharedPage<AtomicU16> = SharedPage::new(AtomicU16::new(0));
/// }
/// ```
#[macro_export]
macro_rules! shared_data {
    ($($(#[$attr:meta])* $vis:vis static $name:ident: $ty:ty = $init:expr;)+) => {
        $(
            $(#[$attr])*
            #[unsafe(link_section = "mpkgate_shared")]
            #[used]
            $vis static $name: $ty = $init;
        )+
    };
}
