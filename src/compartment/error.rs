//! Configuration errors raised while declaring compartments.
//!
//! All of these are fatal when they reach the process-wide entry points
//! ([`crate::initialize_runtime`], [`crate::register_compartment`]).

use miette::Diagnostic;
use thiserror::Error;

use crate::error::{HardwareError, MapError};

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid compartment count {count}")]
    #[diagnostic(
        code(mpkgate::config::count),
        help("Between 1 and 15 compartments are supported; key 0 is reserved for shared memory.")
    )]
    InvalidCount { count: usize },

    #[error("module {name} cannot use compartment 0")]
    #[diagnostic(
        code(mpkgate::config::reserved_id),
        help("Compartment 0 is the shared domain. Number compartments from 1.")
    )]
    ReservedId { name: String },

    #[error("module {name} uses compartment {id}, but only 1..={count} are configured")]
    #[diagnostic(code(mpkgate::config::id_range))]
    IdOutOfRange { name: String, id: u8, count: u8 },

    #[error("compartment {id} registered twice ({existing} and {name})")]
    #[diagnostic(
        code(mpkgate::config::duplicate),
        help("Each compartment id is bound to exactly one module.")
    )]
    DuplicateId { id: u8, existing: String, name: String },

    #[error("compartment {id} has no registered module")]
    #[diagnostic(
        code(mpkgate::config::missing),
        help("Ids must be dense: register a module for every id from 1 to the compartment count.")
    )]
    MissingRegistration { id: u8 },

    #[error("compartment {id} is not configured")]
    #[diagnostic(
        code(mpkgate::config::unknown_compartment),
        help("Gates and compartment-local values can only target ids 1..=count.")
    )]
    UnknownCompartment { id: u8 },

    #[error("the thread's runtime context is already torn down")]
    #[diagnostic(
        code(mpkgate::config::context_unavailable),
        help("Gated calls from thread-local destructors are not supported.")
    )]
    ContextUnavailable,

    #[error("module {name} registered after a cross-compartment call")]
    #[diagnostic(
        code(mpkgate::config::late_registration),
        help("All registrations happen at startup, before the first gated call.")
    )]
    LateRegistration { name: String },

    #[error("the runtime is already initialized")]
    #[diagnostic(code(mpkgate::config::already_initialized))]
    AlreadyInitialized,

    #[error("the runtime is not initialized")]
    #[diagnostic(
        code(mpkgate::config::not_initialized),
        help("Call `initialize_runtime` (or `Runtime::builder().install()`) first.")
    )]
    NotInitialized,

    #[error("invalid {what} size {size:#x}")]
    #[diagnostic(
        code(mpkgate::config::size),
        help("Sizes must be non-zero multiples of the 4 KiB page size.")
    )]
    InvalidSize { what: &'static str, size: usize },

    #[error("exit compartment {id} is not configured")]
    #[diagnostic(code(mpkgate::config::exit_compartment))]
    InvalidExitCompartment { id: u8 },

    #[error("invalid runtime configuration {path}: {message}")]
    #[diagnostic(code(mpkgate::config::parse))]
    Parse { path: String, message: String },

    #[error("failed to read runtime configuration {path}: {source}")]
    #[diagnostic(code(mpkgate::config::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shared section {start:#x}..{end:#x} does not start on a page boundary")]
    #[diagnostic(
        code(mpkgate::config::shared_alignment),
        help("Wrap shared statics in `SharedPage<T>` so the section starts page aligned.")
    )]
    UnalignedSharedSection { start: usize, end: usize },

    #[error("TLS segment of {module} is not padded to page boundaries")]
    #[diagnostic(
        code(mpkgate::config::tls_padding),
        help("Another compartment's TLS could share a page with this one.")
    )]
    TlsNotPadded { module: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Map(#[from] MapError),
}

/// Result type for configuration steps.
pub type ConfigResult<T> = Result<T, ConfigError>;
