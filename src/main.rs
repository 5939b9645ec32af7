use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tracing_subscriber::EnvFilter;

use tierswap::config::{RuntimeConfig, StatsFormat};
use tierswap::jit::body_builder::{BodyTemplate, CallSiteTemplate};
use tierswap::jit::call_site::DispatchData;
use tierswap::jit::codebuf::CodeBuffer;
use tierswap::jit::encoder::{Arch, select_process_arch};
use tierswap::jit::helper_table::{HelperTable, helpers};
use tierswap::jit::inline_cache::CacheEntry;
use tierswap::jit::{CallSiteKind, CodeCacheManager};
use tierswap::recomp::{
    CompileBackend, CompileRequest, CompileResult, Hotness, InstallOutcome, MethodId,
    PersistentMethodInfo, QueueScheduler, RecompilationController, RecompileError, SchedulingError,
    ThreadContext,
};
use tierswap::stats::RuntimeStatistics;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ArchArg {
    Auto,
    #[value(name = "x86_64")]
    X86_64,
    Aarch64,
    Power64,
    S390x,
}

impl ArchArg {
    fn name(self) -> &'static str {
        match self {
            ArchArg::Auto => "auto",
            ArchArg::X86_64 => "x86_64",
            ArchArg::Aarch64 => "aarch64",
            ArchArg::Power64 => "power64",
            ArchArg::S390x => "s390x",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "tierswap")]
#[command(about = "Tiered recompilation and call-site patching", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic recompilation workload
    Simulate {
        /// Encoder family (defaults to the config file, then the host)
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of methods in the synthetic call graph
        #[arg(long, default_value = "32")]
        methods: usize,

        /// Samples taken per sampling thread
        #[arg(long, default_value = "20000")]
        samples: u64,

        /// Number of sampling threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Route every patch through a trampoline
        #[arg(long)]
        stress_trampolines: bool,

        /// Log recompilation events
        #[arg(long)]
        verbose: bool,

        /// Statistics output format (human or json)
        #[arg(long, value_enum)]
        stats: Option<StatsFormatArg>,
    },
    /// Print trampoline encodings for a target address
    Encode {
        #[arg(long, value_enum)]
        arch: ArchArg,

        /// Target address (decimal or 0x-prefixed hex); also used as the
        /// helper table address for the helper trampoline
        #[arg(long, value_parser = parse_address)]
        target: u64,
    },
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn init_logging(verbose: bool) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::new(if verbose { "info" } else { "warn" }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            arch,
            config,
            methods,
            samples,
            threads,
            stress_trampolines,
            verbose,
            stats,
        } => {
            load_config(config, arch, stress_trampolines, verbose, stats).and_then(|config| {
                init_logging(config.verbose);
                simulate(
                    config,
                    Workload {
                        methods: methods.max(1),
                        samples,
                        threads: threads.max(1),
                    },
                )
            })
        }
        Commands::Encode { arch, target } => {
            init_logging(false);
            encode(arch, target)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load_config(
    path: Option<PathBuf>,
    arch: Option<ArchArg>,
    stress_trampolines: bool,
    verbose: bool,
    stats: Option<StatsFormatArg>,
) -> Result<RuntimeConfig, String> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_toml_file(&path).map_err(|e| e.to_string())?,
        None => RuntimeConfig::default(),
    };
    if let Some(arch) = arch {
        config.arch = arch.name().to_string();
    }
    config.stress_trampolines |= stress_trampolines;
    config.verbose |= verbose;
    if let Some(stats) = stats {
        config.stats_format = stats.into();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Fake helper entry points; the workload never executes the code it builds.
fn helper_table(count: usize) -> HelperTable {
    let table = HelperTable::new(count);
    for index in 1..=count {
        table.update(index, 0x7F00_0000_0000 + (index as u64) * 0x100);
    }
    table
}

struct Workload {
    methods: usize,
    samples: u64,
    threads: usize,
}

/// Receiver class used by every interface site in the workload.
fn receiver_class(callee: usize) -> u64 {
    0x1000 + callee as u64
}

/// Method `i` calls `i + 1` directly, `i + 2` through a dispatch table and,
/// for every third method, `i + 3` through an inline cache.
fn workload_template(index: usize, count: usize) -> BodyTemplate {
    let mut sites = Vec::new();
    if index + 1 < count {
        sites.push(CallSiteTemplate::Direct {
            callee: MethodId((index + 1) as u64),
            target: 0,
        });
    }
    if index + 2 < count {
        sites.push(CallSiteTemplate::Virtual {
            callee: MethodId((index + 2) as u64),
        });
    }
    if index % 3 == 0 && index + 3 < count {
        sites.push(CallSiteTemplate::Interface {
            callee: MethodId((index + 3) as u64),
            receivers: vec![CacheEntry {
                class: receiver_class(index + 3),
                target: 0,
            }],
        });
    }
    BodyTemplate {
        reserved_words: 1,
        sites,
        filler: 24 + (index % 5) * 8,
    }
}

/// Stands in for the optimizer: returns the method's template, a little
/// larger at higher levels.
struct SyntheticBackend {
    templates: FxHashMap<MethodId, BodyTemplate>,
}

impl CompileBackend for SyntheticBackend {
    fn compile(&self, request: &CompileRequest) -> Result<CompileResult, SchedulingError> {
        let mut template = self
            .templates
            .get(&request.method.id())
            .cloned()
            .ok_or_else(|| SchedulingError::Error(format!("no code for {}", request.method.id())))?;
        template.filler += request.level as usize * 16;
        Ok(CompileResult {
            level: request.level,
            template,
        })
    }
}

fn simulate(config: RuntimeConfig, workload: Workload) -> Result<(), String> {
    let arch = select_process_arch(config.target_arch().map_err(|e| e.to_string())?);
    let stats_format = config.stats_format;
    let helpers = Arc::new(helper_table(config.helper_count));
    let caches = CodeCacheManager::from_config(&config, arch, helpers).map_err(|e| e.to_string())?;
    let stats = Arc::new(RuntimeStatistics::new());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    let templates = (0..workload.methods)
        .map(|i| (MethodId(i as u64), workload_template(i, workload.methods)))
        .collect::<FxHashMap<_, _>>();
    let backend = Arc::new(SyntheticBackend {
        templates: templates.clone(),
    });
    let scheduler = Arc::new(QueueScheduler::start(
        runtime.handle(),
        backend,
        config.queue_capacity,
        config.compile_threads,
    ));

    let controller = RecompilationController::new(
        config,
        Arc::new(caches),
        scheduler.clone(),
        Arc::clone(&stats),
    );
    tracing::info!(%arch, methods = workload.methods, "building initial bodies");

    // Callees first, so every direct call links to a live entry.
    for i in (0..workload.methods).rev() {
        let id = MethodId(i as u64);
        let mut method = PersistentMethodInfo::new(id, format!("method{i}"));
        if i % 4 == 0 {
            method = method.with_loops();
        }
        let method = controller.register_method(method);
        let template = templates.get(&id).cloned().unwrap_or_default();
        controller
            .compile_initial(&method, Hotness::Cold, template)
            .map_err(|e| e.to_string())?;
    }

    let rounds = 4u64;
    let tick = AtomicU64::new(0);
    for round in 0..rounds {
        run_samplers(&controller, &workload, workload.samples / rounds, &tick);
        let outcomes = runtime.block_on(controller.drain_completions());
        let installed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(InstallOutcome::Installed { .. })))
            .count();
        let reclaimed = controller.reclaim_at_safepoint();
        tracing::info!(round, installed, reclaimed = reclaimed.len(), "round complete");
    }

    let broken = verify_call_sites(&controller)?;
    let snapshot = stats.snapshot();

    drop(controller);
    if let Ok(scheduler) = Arc::try_unwrap(scheduler) {
        runtime.block_on(scheduler.shutdown());
    }

    match stats_format {
        StatsFormat::Human => print!("{}", snapshot),
        StatsFormat::Json => println!("{}", snapshot.to_json().map_err(|e| e.to_string())?),
    }
    if broken > 0 {
        return Err(format!("{broken} call sites do not reach their callee's current body"));
    }
    Ok(())
}

/// Sample the workload from several threads. Low method indices are hit
/// more often so that they climb the ladder first.
fn run_samplers(
    controller: &RecompilationController,
    workload: &Workload,
    samples: u64,
    tick: &AtomicU64,
) {
    let methods = controller.methods();
    std::thread::scope(|s| {
        for thread in 0..workload.threads {
            let methods = &methods;
            s.spawn(move || {
                let ctx = ThreadContext {
                    thread_id: thread as u64,
                };
                let mut seed = 0x9E37_79B9_7F4A_7C15u64 ^ (thread as u64 + 1);
                for _ in 0..samples {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    let pick = (seed % workload.methods as u64) as usize;
                    let skewed = pick * pick / workload.methods;
                    let id = MethodId(skewed as u64);
                    let now = tick.fetch_add(1, Ordering::Relaxed);

                    let Some(method) = methods.iter().find(|m| m.id() == id) else {
                        continue;
                    };
                    let Some(body) = method.current_body() else {
                        let _ = controller.sample_method(&ctx, 0, 0, 0, None, now);
                        continue;
                    };
                    let result = if seed % 4 == 0 {
                        controller.record_invocation(body.start()).map(|_| ())
                    } else {
                        controller
                            .sample_method(
                                &ctx,
                                body.start(),
                                body.descriptor.size(),
                                body.entry(),
                                Some(&**method),
                                now,
                            )
                            .map(|_| ())
                    };
                    match result {
                        Ok(())
                        | Err(RecompileError::Scheduling(_))
                        | Err(RecompileError::PlatformUnsupportedCounting) => {}
                        Err(e) => tracing::warn!(method = %id, error = %e, "sampling failed"),
                    }
                }
            });
        }
    });
}

/// Count known call sites that do not land on their callee's current entry.
fn verify_call_sites(controller: &RecompilationController) -> Result<usize, String> {
    let mut broken = 0;
    let mut checked = 0;
    for method in controller.methods() {
        let Some(current) = method.current_body() else {
            continue;
        };
        for site in controller.registry().call_sites_for(method.id()) {
            let dispatch = match site.kind {
                CallSiteKind::Virtual => continue,
                CallSiteKind::Direct => None,
                CallSiteKind::Interface => site.dispatch.map(|d| DispatchData {
                    receiver_class: Some(receiver_class(method.id().0 as usize)),
                    ..d
                }),
            };
            let landed = controller
                .patcher()
                .resolve_call(site.address, dispatch)
                .map_err(|e| e.to_string())?;
            checked += 1;
            if landed != Some(current.entry()) {
                broken += 1;
                tracing::warn!(
                    site = site.address,
                    callee = %method.id(),
                    landed = ?landed,
                    expected = current.entry(),
                    "call site misses current body"
                );
            }
        }
    }
    tracing::info!(checked, broken, "call sites verified");
    Ok(broken)
}

fn encode(arch: ArchArg, target: u64) -> Result<(), String> {
    let arch: Arch = match arch {
        ArchArg::Auto => Arch::host()
            .ok_or_else(|| format!("no encoder for host {}", std::env::consts::ARCH))?,
        other => other.name().parse()?,
    };
    let encoder = arch.encoder();

    let mut method = CodeBuffer::new(arch.endian());
    encoder.emit_method_trampoline(&mut method, target);
    let mut helper = CodeBuffer::new(arch.endian());
    encoder.emit_helper_trampoline(&mut helper, helpers::RECOMPILE_ON_INVOCATION, target);

    println!("arch: {}", arch);
    println!("direct call: {} bytes", encoder.direct_call_size());
    println!("method trampoline ({} bytes):", method.len());
    print_hex(method.code());
    println!(
        "helper trampoline for helper {}, table at {:#x} ({} bytes):",
        helpers::RECOMPILE_ON_INVOCATION,
        target,
        helper.len()
    );
    print_hex(helper.code());
    Ok(())
}

fn print_hex(bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(8).enumerate() {
        let line: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:04x}: {}", i * 8, line.join(" "));
    }
}
