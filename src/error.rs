//! Rich diagnostic error types for mpkgate.
//!
//! Uses `miette` for user-facing diagnostics and `thiserror` for ergonomic
//! error definitions.

use miette::Diagnostic;
use thiserror::Error;

use crate::compartment::error::ConfigError;

/// Top-level error type for mpkgate operations.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Map(#[from] MapError),
}

// ---------------------------------------------------------------------------
// Hardware errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum HardwareError {
    #[error("protection key allocation failed: {source}")]
    #[diagnostic(
        code(mpkgate::hardware::key_allocation),
        help(
            "pkey_alloc(2) refused another key. Check that the CPU exposes PKU \
             (grep pku /proc/cpuinfo) and that no other code in the process \
             allocated keys before the runtime started."
        )
    )]
    KeyAllocation {
        #[source]
        source: std::io::Error,
    },

    #[error("protection key out of order: expected {expected}, got {actual}")]
    #[diagnostic(
        code(mpkgate::hardware::key_order),
        help(
            "Compartment ids map 1:1 onto protection keys, so keys must be handed \
             out as 1, 2, 3... Something allocated a key before runtime init."
        )
    )]
    KeyOrder { expected: u8, actual: u8 },

    #[error("failed to tag {len:#x} bytes at {addr:#x} with key {key}: {source}")]
    #[diagnostic(
        code(mpkgate::hardware::tag),
        help("pkey_mprotect(2) failed. The range must be page aligned and mapped.")
    )]
    Tag {
        addr: usize,
        len: usize,
        key: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map {what}: {source}")]
    #[diagnostic(
        code(mpkgate::hardware::map),
        help("An anonymous mapping could not be created. Check RLIMIT_AS and free memory.")
    )]
    Map {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stack of compartment {compartment} exhausted")]
    #[diagnostic(
        code(mpkgate::hardware::stack_exhausted),
        help("Raise `stack_size` or reduce gate recursion depth.")
    )]
    StackExhausted { compartment: u8 },

    #[error("failed to spawn thread: {source}")]
    #[diagnostic(code(mpkgate::hardware::spawn))]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("signal setup failed: {source}")]
    #[diagnostic(
        code(mpkgate::hardware::signal),
        help("sigaction(2) or sigaltstack(2) rejected the fault handler configuration.")
    )]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Allocation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AllocError {
    #[error("arena of compartment {compartment} exhausted ({requested} bytes requested)")]
    #[diagnostic(
        code(mpkgate::alloc::exhausted),
        help("Raise `arena_size` in the runtime configuration.")
    )]
    Exhausted { compartment: u8, requested: usize },

    #[error("pointer {addr:#x} belongs to compartment {owner}, not the active compartment {active}")]
    #[diagnostic(
        code(mpkgate::alloc::foreign_pointer),
        help(
            "Private memory can only be released by the compartment that owns it. \
             Use the shared_* family for memory handed across compartments."
        )
    )]
    ForeignPointer { addr: usize, owner: u8, active: u8 },

    #[error("pointer {addr:#x} was not allocated by any arena")]
    #[diagnostic(code(mpkgate::alloc::unknown_pointer))]
    UnknownPointer { addr: usize },

    #[error("allocation header at {addr:#x} is corrupted")]
    #[diagnostic(
        code(mpkgate::alloc::corrupted),
        help("The block was freed twice or its header was overwritten.")
    )]
    Corrupted { addr: usize },

    #[error("invalid layout: size {size}, align {align}")]
    #[diagnostic(code(mpkgate::alloc::layout))]
    Layout { size: usize, align: usize },
}

// ---------------------------------------------------------------------------
// Loader errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LoaderError {
    #[error("dlopen({path}) failed: {message}")]
    #[diagnostic(code(mpkgate::loader::open))]
    Open { path: String, message: String },

    #[error("dlsym({name}) failed: {message}")]
    #[diagnostic(code(mpkgate::loader::symbol))]
    Symbol { name: String, message: String },

    #[error("dlclose failed: {message}")]
    #[diagnostic(code(mpkgate::loader::close))]
    Close { message: String },

    #[error("name contains an interior NUL byte: {name:?}")]
    #[diagnostic(code(mpkgate::loader::invalid_name))]
    InvalidName { name: String },

    #[error("loader gate nested too deeply ({depth} levels)")]
    #[diagnostic(
        code(mpkgate::loader::depth),
        help("Loader gates keep at most 32 saved PKRU values per thread.")
    )]
    Depth { depth: usize },

    #[error("no loaded module matches {prefix:?}")]
    #[diagnostic(code(mpkgate::loader::module_not_found))]
    ModuleNotFound { prefix: String },
}

// ---------------------------------------------------------------------------
// Manifest errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("invalid gate manifest {path}: {message}")]
    #[diagnostic(
        code(mpkgate::manifest::parse),
        help("Each [[gate]] entry needs `symbol`, `signature`, `source` and `target`.")
    )]
    Parse { path: String, message: String },

    #[error("failed to read gate manifest {path}: {source}")]
    #[diagnostic(code(mpkgate::manifest::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("symbol {symbol} has more than one gate")]
    #[diagnostic(
        code(mpkgate::manifest::duplicate),
        help("Every cross-compartment symbol is paired with exactly one wrapper.")
    )]
    DuplicateSymbol { symbol: String },

    #[error("gate {symbol} names compartment {id}, but only 0..={max} exist")]
    #[diagnostic(code(mpkgate::manifest::compartment_range))]
    CompartmentOutOfRange { symbol: String, id: u8, max: u8 },

    #[error("gate {symbol} does not cross a boundary (source and target are {id})")]
    #[diagnostic(
        code(mpkgate::manifest::self_gate),
        help("Calls inside one compartment need no wrapper; drop the entry.")
    )]
    SelfGate { symbol: String, id: u8 },

    #[error("no gate for symbol {symbol}")]
    #[diagnostic(code(mpkgate::manifest::unknown_symbol))]
    UnknownSymbol { symbol: String },

    #[error("signature mismatch for {symbol}: manifest says `{expected}`, caller uses `{actual}`")]
    #[diagnostic(
        code(mpkgate::manifest::signature_mismatch),
        help(
            "The wrapper would be called with a different ABI than the function \
             was built for. Regenerate the manifest."
        )
    )]
    SignatureMismatch {
        symbol: String,
        expected: String,
        actual: String,
    },
}

// ---------------------------------------------------------------------------
// Memory map errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MapError {
    #[error("region at {start:#x} has zero length")]
    #[diagnostic(code(mpkgate::map::empty))]
    Empty { start: usize },

    #[error("region {start:#x}+{len:#x} overlaps {existing_start:#x}+{existing_len:#x}")]
    #[diagnostic(
        code(mpkgate::map::overlap),
        help("Every byte of memory has exactly one owner; remove or split the existing region first.")
    )]
    Overlap {
        start: usize,
        len: usize,
        existing_start: usize,
        existing_len: usize,
    },

    #[error("no region contains {addr:#x}")]
    #[diagnostic(code(mpkgate::map::not_found))]
    NotFound { addr: usize },

    #[error("address {addr:#x} is not page aligned")]
    #[diagnostic(code(mpkgate::map::unaligned))]
    Unaligned { addr: usize },
}

/// Convenience result aliases.
pub type GateResult<T> = std::result::Result<T, GateError>;
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;
pub type AllocResult<T> = std::result::Result<T, AllocError>;
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
pub type ManifestResult<T> = std::result::Result<T, ManifestError>;
pub type MapResult<T> = std::result::Result<T, MapError>;
