//! Runtime configuration: compartment count, sizes, exit policy.
//!
//! Loaded from TOML, with `MPKGATE_EXIT_POLICY` overriding the exit policy.
//!
//! ```toml
//! compartment_count = 2
//! exit_policy = "callgate"
//!
//! [[compartment]]
//! id = 1
//! name = "main"
//!
//! [[compartment]]
//! id = 2
//! name = "parser"
//! libraries = ["libparser.so"]
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compartment::{CompartmentId, ConfigError, ConfigResult, LoaderInfo};
use crate::hardware::{PAGE_SIZE, Pkru};

/// Environment variable selecting the exit policy.
pub const EXIT_POLICY_ENV: &str = "MPKGATE_EXIT_POLICY";

/// Default per-thread stack size of every compartment.
pub const DEFAULT_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Default arena size of every compartment and of the shared arena.
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Rights the process exit path runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Caller's rights plus the exit compartment's.
    Union,
    /// Exactly the exit compartment's rights.
    #[default]
    Callgate,
    /// `Union` when the caller is shared or already the exit compartment,
    /// `Callgate` otherwise.
    Auto,
}

impl ExitPolicy {
    /// Parse the environment override. Unknown values warn and fall back to
    /// [`ExitPolicy::Callgate`]; an unset variable keeps `configured`.
    pub fn from_env_value(value: Option<&str>, configured: ExitPolicy) -> ExitPolicy {
        match value {
            None => configured,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = raw, "unknown {EXIT_POLICY_ENV}, using callgate");
                ExitPolicy::Callgate
            }),
        }
    }

    /// Read [`EXIT_POLICY_ENV`].
    pub fn from_env(configured: ExitPolicy) -> ExitPolicy {
        let value = std::env::var(EXIT_POLICY_ENV).ok();
        Self::from_env_value(value.as_deref(), configured)
    }

    /// PKRU the exit path runs under.
    pub fn exit_pkru(self, caller: Pkru, exit: CompartmentId) -> Pkru {
        let caller_id = CompartmentId::from_pkru(caller);
        match self {
            ExitPolicy::Callgate => exit.pkru(),
            ExitPolicy::Union => caller.union(exit.pkru()),
            ExitPolicy::Auto if caller_id.is_shared() || caller_id == exit => {
                caller.union(exit.pkru())
            }
            ExitPolicy::Auto => exit.pkru(),
        }
    }
}

impl std::fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitPolicy::Union => write!(f, "union"),
            ExitPolicy::Callgate => write!(f, "callgate"),
            ExitPolicy::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for ExitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "union" => Ok(ExitPolicy::Union),
            "callgate" => Ok(ExitPolicy::Callgate),
            "auto" => Ok(ExitPolicy::Auto),
            other => Err(format!("unknown exit policy: {other}")),
        }
    }
}

/// A module declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: u8,
    pub name: String,
    #[serde(flatten)]
    pub loader: LoaderInfo,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of compartments, not counting the shared domain.
    pub compartment_count: u8,
    /// Per-thread stack size of each compartment, guard page included.
    pub stack_size: usize,
    /// Size of each private arena and of the shared arena.
    pub arena_size: usize,
    /// Pages of compartment-local storage per (compartment, thread).
    pub tls_pages: usize,
    /// Compartment of libc and the loader; the exit path runs there.
    pub exit_compartment: u8,
    pub exit_policy: ExitPolicy,
    /// Check manifest signatures when wrapping functions.
    pub verify_signatures: bool,
    /// Install the SIGSEGV handler at init.
    pub install_fault_handler: bool,
    /// Use the non-enforcing backend even when PKU is present.
    pub emulate: bool,
    /// Log protection-key faults and continue instead of exiting.
    pub permissive: bool,
    #[serde(rename = "compartment")]
    pub modules: Vec<ModuleSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compartment_count: 2,
            stack_size: DEFAULT_STACK_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
            tls_pages: 1,
            exit_compartment: 1,
            exit_policy: ExitPolicy::Callgate,
            verify_signatures: false,
            install_fault_handler: true,
            emulate: false,
            permissive: false,
            modules: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse TOML text. `origin` names the source in errors.
    pub fn from_toml_str(text: &str, origin: &str) -> ConfigResult<Self> {
        let config: RuntimeConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply the environment override.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::from_toml_str(&text, &path.display().to_string())?;
        config.exit_policy = ExitPolicy::from_env(config.exit_policy);
        Ok(config)
    }

    /// Check sizes and ids.
    pub fn validate(&self) -> ConfigResult<()> {
        let count = self.compartment_count as usize;
        if count == 0 || count > CompartmentId::MAX.index() {
            return Err(ConfigError::InvalidCount { count });
        }
        for (what, size) in [
            ("stack", self.stack_size),
            ("arena", self.arena_size),
        ] {
            if size == 0 || size % PAGE_SIZE != 0 {
                return Err(ConfigError::InvalidSize { what, size });
            }
        }
        // One guard page plus at least one usable page.
        if self.stack_size < 2 * PAGE_SIZE {
            return Err(ConfigError::InvalidSize {
                what: "stack",
                size: self.stack_size,
            });
        }
        if self.tls_pages == 0 {
            return Err(ConfigError::InvalidSize {
                what: "tls",
                size: 0,
            });
        }
        if self.exit_compartment == 0 || self.exit_compartment > self.compartment_count {
            return Err(ConfigError::InvalidExitCompartment {
                id: self.exit_compartment,
            });
        }
        Ok(())
    }

    pub fn exit_compartment(&self) -> CompartmentId {
        CompartmentId::new(self.exit_compartment).unwrap_or(CompartmentId::SHARED)
    }
}
