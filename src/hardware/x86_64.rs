//! x86_64 backends: real MPK and stack-switching emulation.

use std::arch::{asm, global_asm};

use super::{ExitTransition, Pkru, ProtectionHardware, Transition, generic, private};
use crate::error::{HardwareError, HardwareResult};

/// Whether the CPU has PKU and the kernel enabled it (CPUID.7.0:ECX.OSPKE).
pub fn cpu_supports_pku() -> bool {
    use std::arch::x86_64::{__cpuid, __cpuid_count};

    // Safety: CPUID is available on every x86_64 CPU.
    #[allow(unused_unsafe)]
    let (max_leaf, ecx) = unsafe { (__cpuid(0).eax, __cpuid_count(7, 0).ecx) };
    max_leaf >= 7 && ecx & (1 << 4) != 0
}

/// Raw `wrpkru`.
///
/// # Safety
///
/// The CPU must support PKU. Accesses after the call are checked against `bits`.
#[inline]
pub(crate) unsafe fn wrpkru(bits: u32) {
    // Not `nomem`: this changes which memory the following code may touch.
    unsafe {
        asm!(
            "wrpkru",
            in("eax") bits,
            in("ecx") 0u32,
            in("edx") 0u32,
            options(nostack, preserves_flags),
        );
    }
}

// Outermost frame of every compartment stack. Calls `r8` with the incoming
// argument registers untouched. The undefined return address ends stack walks
// here, so a backtrace taken in a callee never leaves the callee's stack.
global_asm!(
    ".pushsection .text.mpkgate_stack_entry,\"ax\",@progbits",
    ".globl mpkgate_stack_entry",
    ".hidden mpkgate_stack_entry",
    ".type mpkgate_stack_entry,@function",
    ".p2align 4",
    "mpkgate_stack_entry:",
    ".cfi_startproc",
    ".cfi_undefined rip",
    "sub rsp, 8",
    ".cfi_adjust_cfa_offset 8",
    "call r8",
    "add rsp, 8",
    ".cfi_adjust_cfa_offset -8",
    "ret",
    ".cfi_endproc",
    ".size mpkgate_stack_entry, . - mpkgate_stack_entry",
    ".popsection",
);

unsafe extern "C" {
    fn mpkgate_stack_entry();
}

/// Hardware-enforced protection keys.
///
/// Only reachable through [`super::detect`], which checks OSPKE first.
#[derive(Debug)]
pub struct Mpk {
    _checked: (),
}

pub(super) static MPK: Mpk = Mpk { _checked: () };

impl private::Sealed for Mpk {}

impl ProtectionHardware for Mpk {
    fn backend(&self) -> super::Backend {
        super::Backend::Mpk
    }

    fn read_pkru(&self) -> Pkru {
        let bits: u32;
        // Safety: OSPKE was verified before this backend was handed out.
        unsafe {
            asm!(
                "rdpkru",
                in("ecx") 0u32,
                out("eax") bits,
                out("edx") _,
                options(nomem, nostack, preserves_flags),
            );
        }
        Pkru::from_bits(bits)
    }

    unsafe fn write_pkru(&self, value: Pkru) {
        unsafe { wrpkru(value.bits()) }
    }

    fn alloc_keys(&self, count: u8) -> HardwareResult<()> {
        for expected in 1..=count {
            // Safety: plain syscall, no pointers involved.
            let key = unsafe { libc::syscall(libc::SYS_pkey_alloc, 0, 0) };
            if key < 0 {
                return Err(HardwareError::KeyAllocation {
                    source: std::io::Error::last_os_error(),
                });
            }
            if key != expected as libc::c_long {
                return Err(HardwareError::KeyOrder {
                    expected,
                    actual: key as u8,
                });
            }
            tracing::debug!(key, "allocated protection key");
        }
        Ok(())
    }

    unsafe fn tag_pages(
        &self,
        addr: *mut u8,
        len: usize,
        prot: libc::c_int,
        key: u8,
    ) -> HardwareResult<()> {
        // Safety: the caller guarantees the range is owned and page aligned.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_pkey_mprotect,
                addr as usize,
                len,
                prot as libc::c_long,
                key as libc::c_long,
            )
        };
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

    unsafe fn transition(&self, t: &Transition) {
        // r12 keeps the caller's stack pointer and r13 the caller's PKRU across
        // the call; both are callee-saved. The caller's stack is never touched
        // between the two `wrpkru`s.
        unsafe {
            asm!(
                "mov r12, rsp",
                "mov qword ptr [r14], rsp",
                "mov rsp, r15",
                "xor ecx, ecx",
                "xor edx, edx",
                "mov eax, esi",
                "wrpkru",
                "call {entry}",
                "xor ecx, ecx",
                "xor edx, edx",
                "mov eax, r13d",
                "wrpkru",
                "mov rsp, r12",
                entry = sym mpkgate_stack_entry,
                in("rdi") t.frame,
                in("rsi") t.target_pkru.bits(),
                in("r8") t.trampoline as usize,
                in("r13") t.caller_pkru.bits(),
                in("r14") t.caller_slot,
                in("r15") t.stack_pointer,
                out("r12") _,
                clobber_abi("C"),
            );
        }
    }

    unsafe fn transition_exit(&self, t: ExitTransition) -> ! {
        unsafe {
            asm!(
                "mov rsp, r12",
                "xor ecx, ecx",
                "xor edx, edx",
                "mov eax, esi",
                "wrpkru",
                "call {entry}",
                "ud2",
                entry = sym mpkgate_stack_entry,
                in("r12") t.stack_pointer,
                in("esi") t.target_pkru.bits(),
                in("r8") t.exit as usize,
                in("edi") t.status,
                options(noreturn),
            );
        }
    }

    fn switches_stacks(&self) -> bool {
        true
    }
}

/// Real stack switching with a shadow PKRU, for CPUs without PKU.
#[derive(Debug)]
pub struct Emulated;

impl private::Sealed for Emulated {}

impl ProtectionHardware for Emulated {
    fn backend(&self) -> super::Backend {
        super::Backend::Emulated
    }

    fn read_pkru(&self) -> Pkru {
        generic::shadow_pkru()
    }

    unsafe fn write_pkru(&self, value: Pkru) {
        generic::set_shadow_pkru(value);
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
        // Safety: forwarded caller contract.
        unsafe { generic::mprotect_untagged(addr, len, prot, key) }
    }

    unsafe fn transition(&self, t: &Transition) {
        generic::set_shadow_pkru(t.target_pkru);
        unsafe {
            asm!(
                "mov r12, rsp",
                "mov qword ptr [r14], rsp",
                "mov rsp, r15",
                "call {entry}",
                "mov rsp, r12",
                entry = sym mpkgate_stack_entry,
                in("rdi") t.frame,
                in("r8") t.trampoline as usize,
                in("r14") t.caller_slot,
                in("r15") t.stack_pointer,
                out("r12") _,
                clobber_abi("C"),
            );
        }
        generic::set_shadow_pkru(t.caller_pkru);
    }

    unsafe fn transition_exit(&self, t: ExitTransition) -> ! {
        generic::set_shadow_pkru(t.target_pkru);
        unsafe {
            asm!(
                "mov rsp, r12",
                "call {entry}",
                "ud2",
                entry = sym mpkgate_stack_entry,
                in("r12") t.stack_pointer,
                in("r8") t.exit as usize,
                in("edi") t.status,
                options(noreturn),
            );
        }
    }

    fn switches_stacks(&self) -> bool {
        true
    }
}
