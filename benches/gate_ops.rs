//! Benchmarks for gate crossings and arena allocation.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use mpkgate::compartment::{CompartmentId, LoaderInfo};
use mpkgate::config::RuntimeConfig;
use mpkgate::gate::{self, Gated};
use mpkgate::hardware::Pkru;
use mpkgate::runtime::Runtime;

fn runtime() -> &'static Runtime {
    match Runtime::try_global() {
        Some(rt) => rt,
        None => Runtime::builder()
            .config(RuntimeConfig {
                compartment_count: 2,
                install_fault_handler: false,
                ..RuntimeConfig::default()
            })
            .register("main", 1, LoaderInfo::default())
            .register("plugin", 2, LoaderInfo::default())
            .install()
            .unwrap(),
    }
}

extern "C" fn add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

fn bench_direct_call(c: &mut Criterion) {
    c.bench_function("direct_call", |bench| {
        bench.iter(|| black_box(add(black_box(3), black_box(4))))
    });
}

fn bench_gate_crossing(c: &mut Criterion) {
    runtime();
    let plugin = CompartmentId::new(2).unwrap();
    let gated = Gated::new(plugin, add as extern "C" fn(u64, u64) -> u64);

    c.bench_function("gated_call", |bench| {
        bench.iter(|| black_box(gated.call((black_box(3), black_box(4)))))
    });
    c.bench_function("call_in_closure", |bench| {
        bench.iter(|| black_box(gate::call_in(plugin, || black_box(7u64))))
    });
}

fn bench_pkru_maths(c: &mut Criterion) {
    c.bench_function("pkru_key_lookup", |bench| {
        bench.iter(|| black_box(Pkru::for_key(black_box(9)).key()))
    });
}

fn bench_arena(c: &mut Criterion) {
    let rt = runtime();
    let arena = rt.heap().arena(rt.active_compartment()).unwrap();

    c.bench_function("arena_alloc_free_64", |bench| {
        bench.iter(|| {
            let p = arena.alloc(64, 16).unwrap();
            unsafe { arena.free(black_box(p)).unwrap() };
        })
    });
}

criterion_group!(
    benches,
    bench_direct_call,
    bench_gate_crossing,
    bench_pkru_maths,
    bench_arena
);
criterion_main!(benches);
