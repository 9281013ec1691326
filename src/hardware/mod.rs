//! Protection-key hardware access.
//!
//! Everything that touches the PKRU register or exchanges the stack pointer
//! lives behind the sealed [`ProtectionHardware`] trait. [`detect`] picks the
//! backend for the running CPU:
//!
//! - **Mpk**: x86_64 with PKU enabled by the OS (`rdpkru`/`wrpkru`, `pkey_*` syscalls)
//! - **Emulated**: x86_64 without PKU. Stacks are switched for real, PKRU lives in
//!   a per-thread shadow value and pages are never tagged
//! - **Generic**: every other target. Shadow PKRU, closures run on the caller's stack

pub mod generic;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use std::fmt;

use crate::error::HardwareResult;

/// Number of protection keys the PKRU register describes.
pub const MAX_KEYS: usize = 16;

/// Protection granularity.
pub const PAGE_SIZE: usize = 4096;

/// Round `value` down to a page boundary.
pub const fn page_floor(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Round `value` up to a page boundary.
pub const fn page_ceil(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A PKRU register value.
///
/// Two bits per key: bit `2k` is access-disable, bit `2k + 1` is write-disable.
/// Key 0 is the shared key and every value produced by this type keeps it open.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pkru(u32);

impl Pkru {
    /// No key is restricted.
    pub const ALL_ACCESS: Pkru = Pkru(0);

    /// Value Linux installs in a fresh thread: only key 0 is accessible.
    pub const LINUX_DEFAULT: Pkru = Pkru(0x5555_5554);

    /// Wrap a raw register value.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The value granting exactly `key` and key 0.
    ///
    /// `for_key(0)` is the shared-only value `0xFFFF_FFFC`.
    pub const fn for_key(key: u8) -> Self {
        Self(!((3u32 << (2 * key as u32)) | 3))
    }

    /// The key this value grants, if it is one of the values produced by
    /// [`Pkru::for_key`]. Anything else maps to key 0.
    pub fn key(self) -> u8 {
        (1..MAX_KEYS as u8)
            .find(|&key| Self::for_key(key) == self)
            .unwrap_or(0)
    }

    /// Rights of both values combined.
    pub const fn union(self, other: Pkru) -> Self {
        Self(self.0 & other.0)
    }

    /// Whether loads from pages tagged with `key` are permitted.
    pub const fn allows_read(self, key: u8) -> bool {
        (self.0 >> (2 * key as u32)) & 1 == 0
    }

    /// Whether stores to pages tagged with `key` are permitted.
    pub const fn allows_write(self, key: u8) -> bool {
        (self.0 >> (2 * key as u32)) & 3 == 0
    }

    /// Keys that are fully accessible under this value.
    pub fn granted_keys(self) -> impl Iterator<Item = u8> {
        (0..MAX_KEYS as u8).filter(move |&key| self.allows_write(key))
    }
}

impl fmt::Debug for Pkru {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pkru({:#010x})", self.0)
    }
}

impl fmt::Display for Pkru {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Which implementation backs the hardware interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Mpk,
    Emulated,
    Generic,
}

impl Backend {
    /// Whether protection is enforced by the CPU.
    pub fn enforces_isolation(self) -> bool {
        matches!(self, Backend::Mpk)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Mpk => write!(f, "mpk (hardware-enforced)"),
            Backend::Emulated => write!(f, "emulated (stack switching only)"),
            Backend::Generic => write!(f, "generic (no switching)"),
        }
    }
}

/// One gate crossing, as handed to [`ProtectionHardware::transition`].
///
/// Pre-state: the caller runs under `caller_pkru` on its own stack, `frame`
/// already lives on the target stack above `stack_pointer`.
/// Post-state: the caller's stack pointer is back, PKRU equals `caller_pkru`,
/// and `*caller_slot` holds the stack pointer the caller had at the crossing.
#[derive(Debug)]
pub struct Transition {
    /// Argument handed to `trampoline`.
    pub frame: *mut u8,
    pub trampoline: unsafe extern "C" fn(*mut u8),
    /// New stack pointer, 16-byte aligned.
    pub stack_pointer: usize,
    pub target_pkru: Pkru,
    pub caller_pkru: Pkru,
    /// Receives the caller's stack pointer so the caller's compartment can be
    /// re-entered below its live frames.
    pub caller_slot: *mut usize,
}

/// A one-way crossing into the process exit path.
#[derive(Debug, Clone, Copy)]
pub struct ExitTransition {
    pub stack_pointer: usize,
    pub target_pkru: Pkru,
    pub exit: unsafe extern "C" fn(libc::c_int) -> !,
    pub status: libc::c_int,
}

mod private {
    pub trait Sealed {}
}

/// The minimal hardware surface the runtime is built from.
///
/// Sealed: only the backends in this module implement it.
pub trait ProtectionHardware: private::Sealed + Send + Sync + fmt::Debug {
    /// The backend kind.
    fn backend(&self) -> Backend;

    /// Read the calling thread's PKRU.
    fn read_pkru(&self) -> Pkru;

    /// Replace the calling thread's PKRU.
    ///
    /// # Safety
    ///
    /// Every access made after this call is checked against `value`. The
    /// caller's stack must stay accessible under `value` (its key or key 0).
    unsafe fn write_pkru(&self, value: Pkru);

    /// Allocate keys `1..=count`, in that order.
    ///
    /// Compartment ids double as key numbers, so any other key sequence is an
    /// error.
    fn alloc_keys(&self, count: u8) -> HardwareResult<()>;

    /// Set protection and key on a page range.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be a page-aligned range of mapped memory the
    /// process owns.
    unsafe fn tag_pages(&self, addr: *mut u8, len: usize, prot: libc::c_int, key: u8)
    -> HardwareResult<()>;

    /// Run `t.trampoline(t.frame)` on the target stack under `t.target_pkru`.
    ///
    /// # Safety
    ///
    /// See [`Transition`] for the pre-state. The trampoline must not unwind.
    unsafe fn transition(&self, t: &Transition);

    /// Switch stack and PKRU, then call `t.exit`. Never returns.
    ///
    /// # Safety
    ///
    /// `t.stack_pointer` must point into a mapped stack accessible under
    /// `t.target_pkru`.
    unsafe fn transition_exit(&self, t: ExitTransition) -> !;

    /// Whether [`transition`](Self::transition) really moves to another stack.
    fn switches_stacks(&self) -> bool;
}

/// Pick the best backend for the current CPU.
pub fn detect() -> &'static dyn ProtectionHardware {
    #[cfg(target_arch = "x86_64")]
    {
        if x86_64::cpu_supports_pku() {
            return &x86_64::MPK;
        }
        &x86_64::Emulated
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        &generic::Generic
    }
}

/// The non-enforcing backend for this target, regardless of CPU features.
pub fn emulated() -> &'static dyn ProtectionHardware {
    #[cfg(target_arch = "x86_64")]
    {
        &x86_64::Emulated
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        &generic::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_for_known_keys() {
        assert_eq!(Pkru::for_key(0).bits(), 0xFFFF_FFFC);
        assert_eq!(Pkru::for_key(1).bits(), 0xFFFF_FFF0);
        assert_eq!(Pkru::for_key(2).bits(), 0xFFFF_FFCC);
        assert_eq!(Pkru::for_key(15).bits(), 0x3FFF_FFFC);
    }

    #[test]
    fn key_inverts_for_key() {
        for key in 0..MAX_KEYS as u8 {
            assert_eq!(Pkru::for_key(key).key(), key);
        }
    }

    #[test]
    fn unknown_values_map_to_shared() {
        assert_eq!(Pkru::ALL_ACCESS.key(), 0);
        assert_eq!(Pkru::LINUX_DEFAULT.key(), 0);
        assert_eq!(Pkru::from_bits(0xdead_beef).key(), 0);
    }

    #[test]
    fn union_grants_both_keys() {
        let both = Pkru::for_key(1).union(Pkru::for_key(3));
        assert_eq!(both.granted_keys().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(!both.allows_read(2));
    }

    #[test]
    fn granted_keys_of_single_compartment() {
        let pkru = Pkru::for_key(4);
        assert_eq!(pkru.granted_keys().collect::<Vec<_>>(), vec![0, 4]);
        assert!(pkru.allows_read(4));
        assert!(!pkru.allows_write(5));
    }

    #[test]
    fn linux_default_only_opens_key_zero() {
        let pkru = Pkru::LINUX_DEFAULT;
        assert!(pkru.allows_write(0));
        assert!(!pkru.allows_read(1));
        assert!(!pkru.allows_read(15));
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_floor(0x1fff), 0x1000);
        assert_eq!(page_ceil(0x1001), 0x2000);
        assert_eq!(page_ceil(0x2000), 0x2000);
    }

    #[test]
    fn detected_backend_is_consistent() {
        let hw = detect();
        assert_eq!(hw.backend().enforces_isolation(), hw.backend() == Backend::Mpk);
    }
}
