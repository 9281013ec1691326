//! The process-wide runtime: registry, arenas, memory map and thread directory.
//!
//! A [`Runtime`] is assembled by [`RuntimeBuilder`] and installed once per
//! process. Everything else in the crate reaches it through
//! [`Runtime::global`].

pub mod context;
pub mod stack;
pub mod thread;

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use dashmap::DashMap;
use miette::Diagnostic;
use serde::Serialize;

use crate::compartment::{CompartmentId, CompartmentRegistry, ConfigError, ConfigResult, LoaderInfo};
use crate::config::{ExitPolicy, ModuleSpec, RuntimeConfig};
use crate::error::GateResult;
use crate::gate::manifest::GateManifest;
use crate::hardware::{self, ProtectionHardware};
use crate::memory::{Classification, Heap, MemoryMap, Region, segments};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Modules registered before [`initialize_runtime`].
static PENDING: Mutex<Vec<ModuleSpec>> = Mutex::new(Vec::new());

/// Gate crossings since startup.
static CROSSINGS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_crossing() {
    CROSSINGS.fetch_add(1, Ordering::Relaxed);
}

/// Stacks and local-storage blocks of one live thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecord {
    pub stacks: Vec<(CompartmentId, Range<usize>)>,
    pub tls: Vec<(CompartmentId, Range<usize>)>,
}

/// What an address belongs to.
#[derive(Debug, Clone, Serialize)]
pub enum Location {
    Region(Region),
    Stack { thread: u64, owner: CompartmentId },
    Tls { thread: u64, owner: CompartmentId },
}

impl Location {
    pub fn owner(&self) -> CompartmentId {
        match self {
            Location::Region(region) => region.owner,
            Location::Stack { owner, .. } | Location::Tls { owner, .. } => *owner,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Region(region) => write!(f, "{region}"),
            Location::Stack { thread, owner } => write!(f, "stack of {owner} on thread {thread}"),
            Location::Tls { thread, owner } => {
                write!(f, "local storage of {owner} on thread {thread}")
            }
        }
    }
}

/// Counters for the `detect` command and the benches.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RuntimeStats {
    pub crossings: u64,
    pub threads: usize,
    pub regions: usize,
    pub leaked_foreign_frees: usize,
}

/// The installed runtime.
pub struct Runtime {
    config: RuntimeConfig,
    hardware: &'static dyn ProtectionHardware,
    registry: CompartmentRegistry,
    regions: MemoryMap,
    heap: Heap,
    manifest: Option<GateManifest>,
    threads: DashMap<u64, ThreadRecord>,
    finalizers: Mutex<Vec<fn()>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.hardware.backend())
            .field("compartments", &self.registry.count())
            .field("regions", &self.regions.len())
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// The installed runtime.
    pub fn global() -> ConfigResult<&'static Runtime> {
        RUNTIME.get().ok_or(ConfigError::NotInitialized)
    }

    pub fn try_global() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn hardware(&self) -> &'static dyn ProtectionHardware {
        self.hardware
    }

    pub fn registry(&self) -> &CompartmentRegistry {
        &self.registry
    }

    pub fn regions(&self) -> &MemoryMap {
        &self.regions
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn manifest(&self) -> Option<&GateManifest> {
        self.manifest.as_ref()
    }

    pub(crate) fn threads(&self) -> &DashMap<u64, ThreadRecord> {
        &self.threads
    }

    /// The compartment whose rights the calling thread currently holds.
    pub fn active_compartment(&self) -> CompartmentId {
        CompartmentId::from_pkru(self.hardware.read_pkru())
    }

    /// Find what `addr` belongs to: a tagged region, or a stack or storage
    /// block of a live thread.
    pub fn locate(&self, addr: usize) -> Option<Location> {
        if let Some(region) = self.regions.find_containing(addr) {
            return Some(Location::Region(region.clone()));
        }
        self.threads.iter().find_map(|entry| {
            let thread = *entry.key();
            let record = entry.value();
            if let Some((owner, _)) = record.stacks.iter().find(|(_, r)| r.contains(&addr)) {
                return Some(Location::Stack {
                    thread,
                    owner: *owner,
                });
            }
            record
                .tls
                .iter()
                .find(|(_, r)| r.contains(&addr))
                .map(|(owner, _)| Location::Tls {
                    thread,
                    owner: *owner,
                })
        })
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            crossings: CROSSINGS.load(Ordering::Relaxed),
            threads: self.threads.len(),
            regions: self.regions.len(),
            leaked_foreign_frees: self.heap.leaked_foreign(),
        }
    }

    /// Queue `f` to run in the exit compartment at process exit.
    pub fn on_exit(&self, f: fn()) {
        self.finalizers
            .lock()
            .expect("finalizer lock poisoned")
            .push(f);
    }

    /// Drain the finalizer queue, most recent first.
    pub(crate) fn take_finalizers(&self) -> Vec<fn()> {
        let mut queue = self.finalizers.lock().expect("finalizer lock poisoned");
        let mut taken = std::mem::take(&mut *queue);
        taken.reverse();
        taken
    }
}

/// Assembles a [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    modules: Vec<ModuleSpec>,
    hardware: Option<&'static dyn ProtectionHardware>,
    shared: Vec<Range<usize>>,
    manifest: Option<GateManifest>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the compartment count on top of the current configuration.
    pub fn compartments(mut self, count: u8) -> Self {
        self.config.get_or_insert_with(RuntimeConfig::default).compartment_count = count;
        self
    }

    /// Bind module `name` to compartment `id`.
    pub fn register(mut self, name: impl Into<String>, id: u8, loader: LoaderInfo) -> Self {
        self.modules.push(ModuleSpec {
            id,
            name: name.into(),
            loader,
        });
        self
    }

    pub fn modules(mut self, modules: impl IntoIterator<Item = ModuleSpec>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Override backend detection.
    pub fn hardware(mut self, hardware: &'static dyn ProtectionHardware) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Keep `range` shared even if it falls inside a protected module.
    pub fn share(mut self, range: Range<usize>) -> Self {
        self.shared.push(range);
        self
    }

    pub fn manifest(mut self, manifest: GateManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Validate the configuration, allocate keys and arenas, and tag
    /// protected modules.
    pub fn build(self) -> GateResult<Runtime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let count = config.compartment_count;
        let mut registry = CompartmentRegistry::new(count as usize)?;
        for module in config.modules.iter().chain(&self.modules) {
            registry.register(module.name.clone(), module.id, module.loader.clone())?;
        }
        registry.ensure_complete()?;

        if let Some(manifest) = &self.manifest {
            manifest.validate(count)?;
        }

        let hardware = self.hardware.unwrap_or_else(|| {
            if config.emulate {
                hardware::emulated()
            } else {
                hardware::detect()
            }
        });
        hardware.alloc_keys(count)?;

        let heap = Heap::new(count, config.arena_size, hardware)?;
        let mut regions = MemoryMap::new();
        for arena in heap.arenas() {
            let class = if arena.owner().is_shared() {
                Classification::SharedRw
            } else {
                Classification::Private
            };
            regions.add(Region::new(
                arena.base(),
                arena.len(),
                arena.owner(),
                class,
                libc::PROT_READ | libc::PROT_WRITE,
                "arena",
            ))?;
        }

        let mut shared = self.shared;
        shared.extend(segments::shared_section());
        for info in registry.iter().filter(|info| info.loader.protect_segments) {
            crate::loader::protect_module(info, hardware, &shared, &mut regions)?;
        }

        tracing::info!(
            backend = %hardware.backend(),
            compartments = count,
            exit_policy = %config.exit_policy,
            regions = regions.len(),
            "runtime initialized"
        );
        if !hardware.backend().enforces_isolation() {
            tracing::warn!("protection keys unavailable, isolation is not enforced");
        }

        Ok(Runtime {
            config,
            hardware,
            registry,
            regions,
            heap,
            manifest: self.manifest,
            threads: DashMap::new(),
            finalizers: Mutex::new(Vec::new()),
        })
    }

    /// Build and install as the process-wide runtime.
    ///
    /// The calling thread continues in compartment 1.
    pub fn install(self) -> GateResult<&'static Runtime> {
        if RUNTIME.get().is_some() {
            return Err(ConfigError::AlreadyInitialized.into());
        }
        let runtime = self.build()?;
        RUNTIME
            .set(runtime)
            .map_err(|_| ConfigError::AlreadyInitialized)?;
        let rt = Runtime::global()?;

        if rt.config.install_fault_handler {
            crate::fault::install(rt)?;
        }
        // Creates this thread's stacks and alternate signal stack.
        context::with_context(rt, |_| ())?;
        crate::loader::activate_gates();

        let main = CompartmentId::new(1).ok_or(ConfigError::UnknownCompartment { id: 1 })?;
        // Safety: the calling thread runs on its OS stack, which carries key 0.
        unsafe { rt.hardware.write_pkru(main.pkru()) };
        Ok(rt)
    }
}

/// Declare that module `name` lives in compartment `id`.
///
/// Must run before [`initialize_runtime`]; anything else is fatal.
pub fn register_compartment(name: &str, id: u8, loader: LoaderInfo) {
    if RUNTIME.get().is_some() {
        let err = if CROSSINGS.load(Ordering::Relaxed) > 0 {
            ConfigError::LateRegistration { name: name.into() }
        } else {
            ConfigError::AlreadyInitialized
        };
        fatal(err);
    }
    PENDING
        .lock()
        .expect("registration lock poisoned")
        .push(ModuleSpec {
            id,
            name: name.into(),
            loader,
        });
}

/// Install the runtime for `count` compartments from the registrations made
/// so far. Configuration errors are fatal.
pub fn initialize_runtime(count: u8) -> &'static Runtime {
    let modules = std::mem::take(&mut *PENDING.lock().expect("registration lock poisoned"));
    let config = RuntimeConfig {
        compartment_count: count,
        exit_policy: ExitPolicy::from_env(ExitPolicy::default()),
        ..RuntimeConfig::default()
    };
    Runtime::builder()
        .config(config)
        .modules(modules)
        .install()
        .unwrap_or_else(|e| fatal(e))
}

/// Report `err` and abort the process.
pub fn fatal<E: Diagnostic + Send + Sync + 'static>(err: E) -> ! {
    tracing::error!(error = %err, "fatal runtime error");
    eprintln!("{:?}", miette::Report::new(err));
    std::process::abort()
}
