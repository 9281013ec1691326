//! Protection tests. Faulting cases run in a child process and are judged by
//! its exit status: 0 for an expected violation, 255 for an unexpected one,
//! 1 when an expected violation never happened.

use std::cell::Cell;
use std::process::Command;
use std::sync::OnceLock;

use mpkgate::compartment::{CompartmentId, LoaderInfo};
use mpkgate::config::RuntimeConfig;
use mpkgate::fault::{EXIT_EXPECTED, EXIT_MISSED, EXIT_UNEXPECTED};
use mpkgate::gate;
use mpkgate::hardware::{self, Backend};
use mpkgate::runtime::{Location, Runtime};

const CHILD_ENV: &str = "MPKGATE_ISOLATION_CHILD";

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<&'static Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        Runtime::builder()
            .config(RuntimeConfig {
                compartment_count: 2,
                stack_size: 256 * 1024,
                arena_size: 1 << 20,
                ..RuntimeConfig::default()
            })
            .register("main", 1, LoaderInfo::default())
            .register("plugin", 2, LoaderInfo::default())
            .install()
            .unwrap()
    })
}

fn main_id() -> CompartmentId {
    CompartmentId::new(1).unwrap()
}

fn plugin() -> CompartmentId {
    CompartmentId::new(2).unwrap()
}

fn enforced() -> bool {
    hardware::detect().backend() == Backend::Mpk
}

fn child_status(name: &str) -> Option<i32> {
    Command::new(std::env::current_exe().unwrap())
        .args(["--exact", name, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, name)
        .status()
        .unwrap()
        .code()
}

fn is_child(name: &str) -> bool {
    std::env::var(CHILD_ENV).as_deref() == Ok(name)
}

/// A `u32` secret in the plugin's private arena.
fn plugin_secret() -> *mut u32 {
    let addr = gate::call_in(plugin(), || {
        let ptr = mpkgate::memory::heap::malloc(4).unwrap().as_ptr().cast::<u32>();
        unsafe { ptr.write(0x5ec2_e7) };
        ptr as usize
    });
    addr as *mut u32
}

// ---------------------------------------------------------------------------
// Unauthorized access
// ---------------------------------------------------------------------------

#[test]
fn expected_read_child() {
    if !is_child("expected_read_child") {
        return;
    }
    runtime();
    let secret = plugin_secret();
    gate::call_in(main_id(), || {
        mpkgate::check_violation!(unsafe { secret.read_volatile() });
    });
}

#[test]
fn unauthorized_read_inside_window_exits_zero() {
    let expected = if enforced() { EXIT_EXPECTED } else { EXIT_MISSED };
    assert_eq!(child_status("expected_read_child"), Some(expected));
}

#[test]
fn unexpected_read_child() {
    if !is_child("unexpected_read_child") {
        return;
    }
    runtime();
    let secret = plugin_secret();
    let value = gate::call_in(main_id(), || unsafe { secret.read_volatile() });
    assert_eq!(value, 0x5ec2_e7);
}

#[test]
fn unauthorized_read_outside_window_exits_255() {
    let status = child_status("unexpected_read_child");
    if enforced() {
        assert_eq!(status, Some(EXIT_UNEXPECTED));
    } else {
        assert_eq!(status, Some(0));
    }
}

#[test]
fn expected_write_child() {
    if !is_child("expected_write_child") {
        return;
    }
    runtime();
    let secret = plugin_secret();
    gate::call_in(main_id(), || {
        mpkgate::check_violation!(unsafe { secret.write_volatile(0) });
    });
}

#[test]
fn unauthorized_write_is_caught() {
    let expected = if enforced() { EXIT_EXPECTED } else { EXIT_MISSED };
    assert_eq!(child_status("expected_write_child"), Some(expected));
}

#[test]
fn missed_violation_child() {
    if !is_child("missed_violation_child") {
        return;
    }
    runtime();
    let value = 3u32;
    mpkgate::check_violation!(std::hint::black_box(value) + 1);
}

#[test]
fn violation_that_never_happens_exits_one() {
    assert_eq!(child_status("missed_violation_child"), Some(EXIT_MISSED));
}

#[test]
fn owner_can_read_its_secret() {
    runtime();
    let secret = plugin_secret() as usize;
    let value = gate::call_in(plugin(), move || unsafe { (secret as *const u32).read_volatile() });
    assert_eq!(value, 0x5ec2_e7);
}

#[test]
fn foreign_free_is_refused() {
    let rt = runtime();
    let secret = plugin_secret() as usize;
    let err = gate::call_in(main_id(), move || unsafe {
        mpkgate::memory::heap::free(std::ptr::NonNull::new(secret as *mut u8).unwrap())
    })
    .unwrap_err();
    assert!(err.to_string().contains("belongs to compartment 2"));
    assert_eq!(rt.locate(secret).unwrap().owner(), plugin());
}

// ---------------------------------------------------------------------------
// Compartment-local storage
// ---------------------------------------------------------------------------

mpkgate::compartment_local!(1 => static MAIN_COUNTER: Cell<u32> = Cell::new(10));
mpkgate::compartment_local!(2 => static PLUGIN_COUNTER: Cell<u32> = Cell::new(20));

#[test]
fn locals_start_from_their_initializer_per_thread() {
    runtime();
    let bump = || {
        let main = gate::call_in(main_id(), || {
            MAIN_COUNTER.with(|c| {
                c.set(c.get() + 1);
                c.get()
            })
        });
        let plugin = gate::call_in(plugin(), || {
            PLUGIN_COUNTER.with(|c| {
                c.set(c.get() + 2);
                c.get()
            })
        });
        (main, plugin)
    };
    assert_eq!(bump(), (11, 22));
    assert_eq!(bump(), (12, 24));
    let fresh = std::thread::spawn(bump).join().unwrap();
    assert_eq!(fresh, (11, 22));
}

#[test]
fn locals_of_different_compartments_never_share_a_page() {
    let rt = runtime();
    let main = gate::call_in(main_id(), || MAIN_COUNTER.addr().unwrap());
    let plugin_addr = gate::call_in(plugin(), || PLUGIN_COUNTER.addr().unwrap());
    assert_ne!(main & !(hardware::PAGE_SIZE - 1), plugin_addr & !(hardware::PAGE_SIZE - 1));
    match (rt.locate(main), rt.locate(plugin_addr)) {
        (Some(Location::Tls { owner: a, .. }), Some(Location::Tls { owner: b, .. })) => {
            assert_eq!(a, main_id());
            assert_eq!(b, plugin());
        }
        other => panic!("locals not in local-storage blocks: {other:?}"),
    }
}

#[test]
fn foreign_local_read_child() {
    if !is_child("foreign_local_read_child") {
        return;
    }
    runtime();
    gate::call_in(main_id(), || MAIN_COUNTER.with(|c| c.set(99)));
    let addr = MAIN_COUNTER.addr().unwrap();
    gate::call_in(plugin(), move || {
        mpkgate::check_violation!(unsafe { (addr as *const u32).read_volatile() });
    });
}

#[test]
fn another_compartments_local_faults() {
    let expected = if enforced() { EXIT_EXPECTED } else { EXIT_MISSED };
    assert_eq!(child_status("foreign_local_read_child"), Some(expected));
}

#[test]
fn foreign_local_read_on_thread_child() {
    if !is_child("foreign_local_read_on_thread_child") {
        return;
    }
    runtime();
    let handle = mpkgate::runtime::thread::spawn(|| {
        MAIN_COUNTER.with(|c| c.set(7));
        let addr = MAIN_COUNTER.addr().unwrap();
        gate::call_in(plugin(), move || {
            mpkgate::check_violation!(unsafe { (addr as *const u32).read_volatile() });
        });
    })
    .unwrap();
    handle.join().unwrap();
}

#[test]
fn another_compartments_local_faults_on_spawned_threads() {
    let expected = if enforced() { EXIT_EXPECTED } else { EXIT_MISSED };
    assert_eq!(child_status("foreign_local_read_on_thread_child"), Some(expected));
}

#[test]
fn foreign_stack_read_child() {
    if !is_child("foreign_stack_read_child") {
        return;
    }
    runtime();
    gate::run_main(|| {
        let local = 0x51ac_u64;
        let addr = std::hint::black_box(&local) as *const u64 as usize;
        gate::call_in(plugin(), move || {
            mpkgate::check_violation!(unsafe { (addr as *const u64).read_volatile() });
        });
    });
}

#[test]
fn another_compartments_stack_faults() {
    let expected = if enforced() { EXIT_EXPECTED } else { EXIT_MISSED };
    assert_eq!(child_status("foreign_stack_read_child"), Some(expected));
}

#[test]
fn stacks_are_private_to_their_compartment() {
    let rt = runtime();
    if !rt.hardware().switches_stacks() {
        return;
    }
    let addr = gate::call_in(plugin(), || {
        let marker = 1u64;
        std::hint::black_box(&marker) as *const u64 as usize
    });
    match rt.locate(addr) {
        Some(Location::Stack { owner, .. }) => assert_eq!(owner, plugin()),
        other => panic!("{other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Permissive mode
// ---------------------------------------------------------------------------

#[test]
fn permissive_read_child() {
    if !is_child("permissive_read_child") {
        return;
    }
    let rt = Runtime::builder()
        .config(RuntimeConfig {
            compartment_count: 2,
            stack_size: 256 * 1024,
            arena_size: 1 << 20,
            permissive: true,
            ..RuntimeConfig::default()
        })
        .register("main", 1, LoaderInfo::default())
        .register("plugin", 2, LoaderInfo::default())
        .install()
        .unwrap();
    let secret = plugin_secret();

    // Both reads go through; the second proves the key was closed again.
    let first = unsafe { secret.read_volatile() };
    let second = unsafe { secret.read_volatile() };
    assert_eq!((first, second), (0x5ec2_e7, 0x5ec2_e7));
    assert_eq!(rt.hardware().read_pkru(), main_id().pkru());

    let expected = if enforced() { 2 } else { 0 };
    assert_eq!(mpkgate::fault::permissive::violation_count(), expected);
    assert_eq!(mpkgate::fault::permissive::is_active(), enforced());
}

#[test]
fn permissive_mode_logs_and_continues() {
    assert_eq!(child_status("permissive_read_child"), Some(0));
}
