//! Portable fallback: shadow PKRU, no stack switching, no page tags.
//!
//! The shadow state is shared with the x86_64 emulated backend.

use std::cell::Cell;

use super::{ExitTransition, Pkru, ProtectionHardware, Transition, private};
use crate::error::{HardwareError, HardwareResult};

thread_local! {
    static SHADOW_PKRU: Cell<u32> = const { Cell::new(Pkru::LINUX_DEFAULT.bits()) };
}

pub(super) fn shadow_pkru() -> Pkru {
    Pkru::from_bits(SHADOW_PKRU.with(Cell::get))
}

pub(super) fn set_shadow_pkru(value: Pkru) {
    SHADOW_PKRU.with(|cell| cell.set(value.bits()));
}

pub(super) unsafe fn mprotect_untagged(
    addr: *mut u8,
    len: usize,
    prot: libc::c_int,
    key: u8,
) -> HardwareResult<()> {
    // Safety: the caller guarantees the range is owned and page aligned.
    let rc = unsafe { libc::mprotect(addr.cast(), len, prot) };
    if rc != 0 {
        return Err(HardwareError::Tag {
            addr: addr as usize,
            len,
            key,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Backend for targets without an MPK transition sequence.
#[derive(Debug)]
pub struct Generic;

impl private::Sealed for Generic {}

impl ProtectionHardware for Generic {
    fn backend(&self) -> super::Backend {
        super::Backend::Generic
    }

    fn read_pkru(&self) -> Pkru {
        shadow_pkru()
    }

    unsafe fn write_pkru(&self, value: Pkru) {
        set_shadow_pkru(value);
    }

    fn alloc_keys(&self, _count: u8) -> HardwareResult<()> {
        Ok(())
    }

    unsafe fn tag_pages(
        &self,
        addr: *mut u8,
        len: usize,
        prot: libc::c_int,
        key: u8,
    ) -> HardwareResult<()> {
        unsafe { mprotect_untagged(addr, len, prot, key) }
    }

    unsafe fn transition(&self, t: &Transition) {
        set_shadow_pkru(t.target_pkru);
        // Safety: the trampoline contract is forwarded from the caller.
        unsafe { (t.trampoline)(t.frame) };
        set_shadow_pkru(t.caller_pkru);
    }

    unsafe fn transition_exit(&self, t: ExitTransition) -> ! {
        set_shadow_pkru(t.target_pkru);
        unsafe { (t.exit)(t.status) }
    }

    fn switches_stacks(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_pkru_is_per_thread() {
        set_shadow_pkru(Pkru::for_key(3));
        let other = std::thread::spawn(shadow_pkru).join().unwrap();
        assert_eq!(other, Pkru::LINUX_DEFAULT);
        assert_eq!(shadow_pkru(), Pkru::for_key(3));
    }

    #[test]
    fn generic_transition_runs_trampoline() {
        unsafe extern "C" fn bump(frame: *mut u8) {
            unsafe { *frame.cast::<u32>() += 1 };
        }
        let mut value = 41u32;
        let mut slot = 0usize;
        let t = Transition {
            frame: (&mut value as *mut u32).cast(),
            trampoline: bump,
            stack_pointer: 0,
            target_pkru: Pkru::for_key(2),
            caller_pkru: Pkru::for_key(1),
            caller_slot: &mut slot,
        };
        unsafe { Generic.transition(&t) };
        assert_eq!(value, 42);
        assert_eq!(Generic.read_pkru(), Pkru::for_key(1));
    }
}
