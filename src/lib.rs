// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # mpkgate
//!
//! In-process compartmentalization with Intel memory protection keys (MPK).
//!
//! A program is split into up to 15 compartments. Each one owns a protection
//! key; its stacks, heap and writable data are tagged with that key, and the
//! PKRU register decides which keys the running code may touch. Calls between
//! compartments go through gates that switch PKRU and the stack together.
//!
//! ## Architecture
//!
//! - **Hardware** (`hardware`): sealed PKRU/stack-switch interface with MPK,
//!   emulated and generic backends
//! - **Compartments** (`compartment`): ids and the module registry
//! - **Runtime** (`runtime`): process-wide state, per-thread contexts, stacks
//! - **Gates** (`gate`): call gates, gated function pointers, entry and exit
//! - **Memory** (`memory`): arenas, shared data, compartment-local storage,
//!   ELF segment classification
//! - **Loader** (`loader`): `dlopen`/`dlsym` behind the loader gate
//! - **Faults** (`fault`): SIGSEGV reporting, expected-violation tests and permissive mode
//!
//! ## Library usage
//!
//! ```no_run
//! use mpkgate::compartment::{CompartmentId, LoaderInfo};
//!
//! mpkgate::register_compartment("main", 1, LoaderInfo::default());
//! mpkgate::register_compartment("parser", 2, LoaderInfo::default());
//! mpkgate::initialize_runtime(2);
//!
//! let parser = CompartmentId::new(2).unwrap();
//! let len = mpkgate::gate::run_main(|| mpkgate::gate::call_in(parser, || "header".len()));
//! assert_eq!(len, 6);
//! ```

pub mod compartment;
pub mod config;
pub mod error;
pub mod fault;
pub mod gate;
pub mod hardware;
pub mod loader;
pub mod memory;
pub mod runtime;

pub use runtime::{Runtime, RuntimeBuilder, initialize_runtime, register_compartment};
