//! mpkgate CLI: inspect protection-key support, PKRU masks and gate manifests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use clap::{Parser, Subcommand};
use miette::Result;

use mpkgate::compartment::{CompartmentId, LoaderInfo};
use mpkgate::config::RuntimeConfig;
use mpkgate::gate::{self, CodeAddr, GateManifest, Gated};
use mpkgate::hardware::{self, Backend};
use mpkgate::memory::SharedPage;
use mpkgate::runtime::Runtime;

#[derive(Parser)]
#[command(name = "mpkgate", version, about = "Intel MPK compartmentalization runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report protection-key support and the current PKRU.
    Detect,

    /// Show the PKRU value of a compartment.
    Mask {
        /// Compartment id (0 = shared).
        id: u8,
    },

    /// Inspect gate manifests.
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },

    /// Run the gate scenarios in two compartments.
    Demo {
        /// Runtime configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ManifestAction {
    /// Validate a manifest.
    Check {
        file: PathBuf,

        /// Number of compartments the program is built with.
        #[arg(long, default_value = "15")]
        compartments: u8,

        /// Print the manifest as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the linker flags for one compartment.
    LinkArgs {
        file: PathBuf,

        #[arg(long)]
        compartment: u8,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect => {
            let hw = hardware::detect();
            println!("Backend:   {}", hw.backend());
            println!("Enforcing: {}", hw.backend().enforces_isolation());
            println!("PKRU:      {}", hw.read_pkru());
            let granted: Vec<String> = hw.read_pkru().granted_keys().map(|k| k.to_string()).collect();
            println!("Granted:   {}", granted.join(", "));
        }

        Commands::Mask { id } => {
            let id = CompartmentId::new(id)
                .ok_or_else(|| miette::miette!("compartment id {id} is past the last key (15)"))?;
            let pkru = id.pkru();
            let granted: Vec<String> = pkru.granted_keys().map(|k| k.to_string()).collect();
            println!("{id}");
            println!("  PKRU:      {pkru}");
            println!("  maps back: {}", CompartmentId::from_pkru(pkru));
            println!("  granted:   {}", granted.join(", "));
        }

        Commands::Manifest { action } => match action {
            ManifestAction::Check {
                file,
                compartments,
                json,
            } => {
                let manifest = GateManifest::load(&file)?;
                manifest.validate(compartments)?;
                if json {
                    println!("{}", manifest.to_json()?);
                } else {
                    println!("{}: {} gates", file.display(), manifest.gates.len());
                    for (signature, symbols) in manifest.by_signature() {
                        println!("  {signature}: {}", symbols.join(", "));
                    }
                }
            }
            ManifestAction::LinkArgs { file, compartment } => {
                let manifest = GateManifest::load(&file)?;
                let id = CompartmentId::new(compartment).ok_or_else(|| {
                    miette::miette!("compartment id {compartment} is past the last key (15)")
                })?;
                for arg in manifest.link_args(id) {
                    println!("{arg}");
                }
            }
        },

        Commands::Demo { config } => {
            let config = match config {
                Some(path) => RuntimeConfig::load(&path)?,
                None => RuntimeConfig {
                    compartment_count: 2,
                    ..RuntimeConfig::default()
                },
            };
            let rt = Runtime::builder()
                .config(config)
                .register("main", 1, LoaderInfo::default())
                .register("plugin", 2, LoaderInfo::default())
                .install()?;
            if rt.hardware().backend() != Backend::Mpk {
                tracing::warn!("running the demo without hardware enforcement");
            }
            gate::run_main(demo::run)?;
        }
    }

    Ok(())
}

/// Scenarios between the `main` (1) and `plugin` (2) compartments.
mod demo {
    use super::*;

    type BinOp = extern "C" fn(u32, u32) -> u32;

    mpkgate::shared_data! {
        static SHARED_WORD: SharedPage<AtomicU16> = SharedPage::new(AtomicU16::new(0));
    }

    static CALLBACK: Mutex<Option<Gated<BinOp>>> = Mutex::new(None);

    fn plugin() -> CompartmentId {
        CompartmentId::new(2).unwrap_or(CompartmentId::SHARED)
    }

    fn main_compartment() -> CompartmentId {
        CompartmentId::new(1).unwrap_or(CompartmentId::SHARED)
    }

    extern "C" fn pick_rhs(_lhs: u32, rhs: u32) -> u32 {
        rhs
    }

    extern "C" fn add(a: u32, b: u32) -> u32 {
        a.wrapping_add(b)
    }

    extern "C" fn mul(a: u32, b: u32) -> u32 {
        a.wrapping_mul(b)
    }

    fn register_callback(cb: Gated<BinOp>) {
        *CALLBACK.lock().expect("callback lock poisoned") = Some(cb);
    }

    fn apply_callback(a: u32, b: u32) -> u32 {
        let cb = CALLBACK.lock().expect("callback lock poisoned").clone();
        cb.map_or(0, |cb| cb.call((a, b)))
    }

    fn read_shared_low_byte() -> u8 {
        SHARED_WORD.load(Ordering::SeqCst) as u8
    }

    fn call_operation(index: usize, a: u32, b: u32) -> u32 {
        let ops: [BinOp; 2] = [add, mul];
        ops[index](a, b)
    }

    pub fn run() -> std::result::Result<(), mpkgate::error::GateError> {
        let plugin = plugin();

        let cb = Gated::new(main_compartment(), pick_rhs as BinOp);
        println!("callback at {} (pick_rhs at {})", cb.addr(), CodeAddr::of(pick_rhs as BinOp));
        Gated::new(plugin, register_callback as fn(Gated<BinOp>)).try_call((cb,))?;
        let picked = Gated::new(plugin, apply_callback as fn(u32, u32) -> u32).try_call((3, 4))?;
        println!("apply_callback(3, 4) = {picked}");

        SHARED_WORD.store(0xffed, Ordering::SeqCst);
        let low = Gated::new(plugin, read_shared_low_byte as fn() -> u8).try_call(())?;
        println!("shared 0xffed read as u8 = {low:#x}");

        let operation = Gated::new(plugin, call_operation as fn(usize, u32, u32) -> u32);
        println!("call_operation(0) = {}", operation.try_call((0, 18923, 24389))?);
        println!("call_operation(1) = {}", operation.try_call((1, 18923, 24389))?);

        let stats = Runtime::global()?.stats();
        println!("{} crossings, {} threads", stats.crossings, stats.threads);
        Ok(())
    }
}
