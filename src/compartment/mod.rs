//! Compartments: protection-key identities for modules of one process.
//!
//! A compartment owns one protection key. Id 0 is the shared domain and never
//! names a private key; real compartments are numbered densely from 1.

pub mod error;
pub mod id;
pub mod registry;

pub use error::{ConfigError, ConfigResult};
pub use id::CompartmentId;
pub use registry::{CompartmentInfo, CompartmentRegistry, LoaderInfo};
