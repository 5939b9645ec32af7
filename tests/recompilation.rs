//! Recompilation scenarios driven through the controller.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use tierswap::config::RuntimeConfig;
use tierswap::jit::body_builder::{BodyTemplate, CallSiteTemplate};
use tierswap::jit::code_cache::CodeCacheManager;
use tierswap::jit::encoder::Arch;
use tierswap::jit::helper_table::{HelperTable, helpers};
use tierswap::recomp::{
    CompilationScheduler, CompileBackend, CompileFlags, CompileRequest, CompileResult,
    CompileTicket, CompiledMethodBody, CompletionSender, Hotness, InduceOutcome, InstallOutcome,
    Lifecycle, MethodId, PersistentMethodInfo, QueueScheduler, RecompilationController,
    SampleOutcome, SchedulingError, ThreadContext,
};
use tierswap::stats::RuntimeStatistics;

const RECOMPILE_HELPER: u64 = 0x7F00_0000_0100;

fn leaf() -> BodyTemplate {
    BodyTemplate {
        reserved_words: 1,
        sites: vec![],
        filler: 16,
    }
}

fn calls(callee: u64) -> BodyTemplate {
    BodyTemplate {
        reserved_words: 1,
        sites: vec![CallSiteTemplate::Direct {
            callee: MethodId(callee),
            target: 0,
        }],
        filler: 8,
    }
}

/// Holds every ticket open until released.
#[derive(Default)]
struct HeldScheduler {
    submissions: AtomicUsize,
    held: Mutex<Vec<(CompileRequest, CompletionSender)>>,
}

impl HeldScheduler {
    fn release(&self) {
        for (request, done) in self.held.lock().drain(..) {
            done.complete(Ok(CompileResult {
                level: request.level,
                template: leaf(),
            }));
        }
    }
}

impl CompilationScheduler for HeldScheduler {
    fn submit(&self, request: CompileRequest) -> Result<CompileTicket, SchedulingError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let (done, ticket) = CompileTicket::pair();
        self.held.lock().push((request, done));
        Ok(ticket)
    }
}

struct LeafBackend;

impl CompileBackend for LeafBackend {
    fn compile(&self, request: &CompileRequest) -> Result<CompileResult, SchedulingError> {
        Ok(CompileResult {
            level: request.level,
            template: leaf(),
        })
    }
}

fn caches(config: &RuntimeConfig, arch: Arch) -> Arc<CodeCacheManager> {
    let table = HelperTable::new(config.helper_count);
    table.update(helpers::RECOMPILE_ON_INVOCATION, RECOMPILE_HELPER);
    Arc::new(CodeCacheManager::from_config(config, arch, Arc::new(table)).unwrap())
}

fn controller(
    config: RuntimeConfig,
    arch: Arch,
    scheduler: Arc<dyn CompilationScheduler>,
) -> RecompilationController {
    let caches = caches(&config, arch);
    RecompilationController::new(config, caches, scheduler, Arc::new(RuntimeStatistics::new()))
}

fn small_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.code_cache_size = 64 * 1024;
    config.max_code_caches = 2;
    config.strict_call_site_checks = true;
    config
}

/// Leaf `m1` and three callers `m2..m4`.
fn callee_with_callers(ctl: &RecompilationController) -> Arc<CompiledMethodBody> {
    let callee = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "callee"));
    let body = ctl.compile_initial(&callee, Hotness::Cold, leaf()).unwrap();
    for id in 2..=4 {
        let caller =
            ctl.register_method(PersistentMethodInfo::new(MethodId(id), format!("caller{id}")));
        ctl.compile_initial(&caller, Hotness::Cold, calls(1)).unwrap();
    }
    body
}

fn assert_callers_reach(ctl: &RecompilationController, callee: MethodId, entry: u64) {
    let sites = ctl.registry().call_sites_for(callee);
    assert!(!sites.is_empty());
    for site in sites {
        assert_eq!(
            ctl.patcher().resolve_call(site.address, None).unwrap(),
            Some(entry),
            "site {:#x}",
            site.address
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_counter_fires_once_and_installs_warm() {
    let config = small_config();
    assert_eq!(config.counters.cold, 1000);
    let scheduler = Arc::new(QueueScheduler::start(
        &Handle::current(),
        Arc::new(LeafBackend),
        16,
        2,
    ));
    let ctl = controller(config, Arch::X86_64, scheduler.clone());
    let old = callee_with_callers(&ctl);
    let method = ctl.method(MethodId(1)).unwrap();

    let triggered = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for thread in 0..2u64 {
            let (ctl, old, method, triggered) = (&ctl, &old, &method, &triggered);
            s.spawn(move || {
                let ctx = ThreadContext { thread_id: thread };
                for i in 0..500u64 {
                    let outcome = ctl
                        .sample_method(
                            &ctx,
                            old.start(),
                            old.descriptor.size(),
                            old.entry(),
                            Some(&**method),
                            i,
                        )
                        .unwrap();
                    if let SampleOutcome::Triggered(induced) = outcome {
                        assert_eq!(induced, InduceOutcome::Submitted { level: Hotness::Warm });
                        triggered.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });
    assert_eq!(triggered.load(Ordering::SeqCst), 1);
    assert_eq!(ctl.stats().snapshot().submissions, 1);

    let outcomes = ctl.drain_completions().await;
    assert_eq!(outcomes.len(), 1);
    let Some(Ok(InstallOutcome::Installed { start, summary })) = outcomes.first() else {
        panic!("expected an install, got {outcomes:?}");
    };
    assert_eq!(summary.patched, 3);
    let new = ctl.registry().lookup(*start).unwrap();
    assert_eq!(new.level(), Hotness::Warm);

    assert_callers_reach(&ctl, MethodId(1), new.entry());
    assert_eq!(ctl.caches().resolve(old.entry()).unwrap(), new.entry());
    assert!(!old.could_be_compiled_again());
    assert_eq!(old.state.lifecycle(), Lifecycle::Superseded);
}

#[test]
fn test_concurrent_induce_submits_once() {
    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(small_config(), Arch::AArch64, scheduler.clone());
    let body = callee_with_callers(&ctl);

    let outcomes = Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let outcome = ctl.induce_recompilation(body.start()).unwrap();
                outcomes.lock().push(outcome);
            });
        }
    });

    let outcomes = outcomes.into_inner();
    assert_eq!(scheduler.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, InduceOutcome::Submitted { .. }))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == InduceOutcome::AlreadyInFlight)
            .count(),
        7
    );
    assert!(ctl.is_already_being_compiled(&body.method, body.start()));
}

#[tokio::test]
async fn test_levels_only_climb() {
    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(small_config(), Arch::Power64, scheduler.clone());
    let method = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "climber"));
    ctl.compile_initial(&method, Hotness::NoOpt, leaf()).unwrap();

    let mut levels = vec![Hotness::NoOpt];
    loop {
        let current = method.current_body().unwrap();
        match ctl.induce_recompilation(current.start()).unwrap() {
            InduceOutcome::Submitted { level } => assert!(level >= current.level()),
            InduceOutcome::Declined => break,
            InduceOutcome::AlreadyInFlight => panic!("nothing should be in flight"),
        }
        scheduler.release();
        for outcome in ctl.drain_completions().await {
            assert!(matches!(outcome, Ok(InstallOutcome::Installed { .. })));
        }
        levels.push(method.current_body().unwrap().level());
    }

    assert_eq!(
        levels,
        vec![
            Hotness::NoOpt,
            Hotness::Cold,
            Hotness::Warm,
            Hotness::Hot,
            Hotness::VeryHot,
            Hotness::Scorching
        ]
    );
}

#[tokio::test]
async fn test_stress_trampolines_still_reach_new_body() {
    for arch in Arch::ALL {
        let mut config = small_config();
        config.stress_trampolines = true;
        let scheduler = Arc::new(HeldScheduler::default());
        let ctl = controller(config, arch, scheduler.clone());
        let old = callee_with_callers(&ctl);

        ctl.induce_recompilation(old.start()).unwrap();
        scheduler.release();
        ctl.drain_completions().await;

        let new = ctl.method(MethodId(1)).unwrap().current_body().unwrap();
        assert_ne!(new.start(), old.start());
        assert_callers_reach(&ctl, MethodId(1), new.entry());
        for site in ctl.registry().call_sites_for(MethodId(1)) {
            assert!(site.trampoline.is_some(), "{arch}");
        }
        assert!(ctl.stats().snapshot().trampolines_created >= 1, "{arch}");
    }
}

#[tokio::test]
async fn test_exhausted_trampolines_keep_old_body() {
    let mut config = small_config();
    config.stress_trampolines = true;
    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(config, Arch::X86_64, scheduler.clone());
    let callee = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "callee"));
    let old = ctl.compile_initial(&callee, Hotness::Cold, leaf()).unwrap();
    let caller = ctl.register_method(PersistentMethodInfo::new(MethodId(2), "caller"));
    ctl.compile_initial(&caller, Hotness::Cold, calls(1)).unwrap();

    // Caller and callee share a cache with no room left for trampolines.
    let first = ctl.caches().cache(0).unwrap();
    first.reserve(first.free_bytes()).unwrap();
    assert_eq!(first.free_bytes(), 0);

    ctl.induce_recompilation(old.start()).unwrap();
    scheduler.release();
    let outcomes = ctl.drain_completions().await;
    let Some(Ok(InstallOutcome::Installed { start, summary })) = outcomes.first() else {
        panic!("expected install, got {outcomes:?}");
    };
    assert!(!first.contains(*start));
    assert_eq!(summary.patched, 0);
    assert_eq!(summary.unpatched, 1);
    assert!(!summary.entry_redirected);
    assert!(!summary.queued_unreachable);

    let stats = ctl.stats().snapshot();
    assert_eq!(stats.sites_unpatched, 1);
    assert_eq!(stats.trampoline_exhaustions, 2);

    // The caller keeps running the old body, which stays registered.
    let site = ctl.registry().call_sites_for(MethodId(1))[0];
    assert_eq!(site.current_target, old.entry());
    assert_eq!(ctl.patcher().resolve_call(site.address, None).unwrap(), Some(old.entry()));
    assert!(ctl.reclaim_at_safepoint().is_empty());
    assert!(ctl.registry().lookup(old.start()).is_some());
    assert_eq!(callee.current_body().unwrap().start(), *start);
}

#[tokio::test]
async fn test_superseded_request_is_discarded() {
    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(small_config(), Arch::S390x, scheduler.clone());
    let body = callee_with_callers(&ctl);

    ctl.induce_recompilation(body.start()).unwrap();
    ctl.prevent_recompilation(&body.method);
    scheduler.release();

    let outcomes = ctl.drain_completions().await;
    assert!(matches!(outcomes[0], Ok(InstallOutcome::Discarded)));
    assert_eq!(body.method.current_body().unwrap().start(), body.start());
    assert_callers_reach(&ctl, MethodId(1), body.entry());
    assert_eq!(ctl.induce_recompilation(body.start()).unwrap(), InduceOutcome::Declined);
}

#[tokio::test]
async fn test_failed_compile_keeps_current_body() {
    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(small_config(), Arch::X86_64, scheduler.clone());
    let body = callee_with_callers(&ctl);

    ctl.induce_recompilation(body.start()).unwrap();
    for (_, done) in scheduler.held.lock().drain(..) {
        done.complete(Err(SchedulingError::Error("optimizer bailed out".into())));
    }
    let outcomes = ctl.drain_completions().await;
    assert!(matches!(outcomes[0], Ok(InstallOutcome::Failed)));

    assert!(!body.method.is_in_flight());
    assert_eq!(body.method.backoff(), 1);
    assert_eq!(body.state.lifecycle(), Lifecycle::FreshlyCompiled);
    assert_eq!(body.state.counter(), 1000 << 1);
    assert!(matches!(
        ctl.induce_recompilation(body.start()).unwrap(),
        InduceOutcome::Submitted { .. }
    ));
}

#[test]
fn test_flag_change_invalidates_bodies() {
    let ctl = controller(small_config(), Arch::AArch64, Arc::new(HeldScheduler::default()));
    let body = callee_with_callers(&ctl);
    ctl.set_runtime_flags(CompileFlags::EXCEPTION_HOOKS);

    assert_eq!(ctl.invalidate_compiled_methods_if_needed(false), 4);
    assert_eq!(ctl.caches().resolve(body.entry()).unwrap(), RECOMPILE_HELPER);
    // Callers still reach the old entry, which now goes to the helper.
    for site in ctl.registry().call_sites_for(MethodId(1)) {
        assert_eq!(
            ctl.patcher().resolve_call(site.address, None).unwrap(),
            Some(RECOMPILE_HELPER)
        );
    }
    assert_eq!(ctl.invalidate_compiled_methods_if_needed(true), 0);
}

#[test]
fn test_controller_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        arch = "s390x"
        code_cache_size = 65536
        stress_trampolines = true

        [counters]
        cold = 2
        "#
    )
    .unwrap();

    let config = RuntimeConfig::from_toml_file(file.path()).unwrap();
    let arch = config.target_arch().unwrap();
    assert_eq!(arch, Arch::S390x);
    assert!(config.stress_trampolines);

    let scheduler = Arc::new(HeldScheduler::default());
    let ctl = controller(config, arch, scheduler.clone());
    let body = callee_with_callers(&ctl);
    assert_eq!(ctl.record_invocation(body.start()).unwrap(), None);
    assert!(matches!(
        ctl.record_invocation(body.start()).unwrap(),
        Some(InduceOutcome::Submitted { level: Hotness::Warm })
    ));
    assert_eq!(scheduler.submissions.load(Ordering::SeqCst), 1);
}
