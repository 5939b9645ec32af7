//! Recompilation controller.
//!
//! Drives each method through its bodies: samples and invocation counts
//! decide when a body should be replaced, requests go to the
//! [`CompilationScheduler`], and finished bodies are installed by
//! redirecting every known call site and the old body's entry. At most one
//! request per method is in flight; results of superseded requests are
//! discarded by generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::body::{
    CompileFlags, CompiledMethodBody, CompiledMethodDescriptor, Hotness, Lifecycle, MethodId,
    PersistentMethodInfo, ProfilerInfo, ProfilingState, RecompilationState,
};
use super::registry::MethodBodyRegistry;
use super::scheduler::{
    CompilationScheduler, CompileRequest, CompileResult, CompileTicket, SchedulingError,
};
use crate::config::RuntimeConfig;
use crate::jit::body_builder::{BodyBuilder, BodyError, BodyTemplate, CallSiteTemplate};
use crate::jit::call_site::{CallSitePatcher, PatchOptions, PatchOutcome, PatchRequest};
use crate::jit::code_cache::CodeCacheManager;
use crate::jit::helper_table::helpers;
use crate::jit::patch::PatchError;
use crate::stats::{RuntimeStatistics, bump};

#[derive(Debug, thiserror::Error)]
pub enum RecompileError {
    #[error("no compiled body starts at {start:#x}")]
    UnknownBody { start: u64 },

    #[error("a body is already registered at {start:#x}")]
    DuplicateBody { start: u64 },

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("scheduling failed: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("counting triggers are not supported on this platform")]
    PlatformUnsupportedCounting,
}

/// The sampler's view of the thread a sample came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext {
    pub thread_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InduceOutcome {
    Submitted { level: Hotness },
    /// A request for the method is already in flight.
    AlreadyInFlight,
    /// The body is frozen or already at the top level.
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The thread was not running compiled code.
    Interpreted,
    /// The sample did not fall inside a known body of the method.
    Ignored,
    Sampled,
    Triggered(InduceOutcome),
}

/// Result of redirecting callers from an old body to a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecompileSummary {
    pub patched: usize,
    pub untouched: usize,
    pub unpatched: usize,
    pub entry_redirected: bool,
    pub queued_unreachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { start: u64, summary: RecompileSummary },
    /// The request was superseded or the method frozen meanwhile.
    Discarded,
    /// The compilation failed; the method stays on its current body.
    Failed,
}

/// A compilation in progress, between [`RecompilationController::start_of_compilation`]
/// and [`RecompilationController::end_of_compilation`].
#[derive(Debug)]
pub struct CompilationAttempt {
    method: Arc<PersistentMethodInfo>,
    level: Hotness,
    flags: CompileFlags,
    first_compile: bool,
    counter: i32,
    use_sampling: bool,
    counting: bool,
    profiling_allowed: bool,
    default_profiler: ProfilerInfo,
    profiler: Option<ProfilerInfo>,
    prevented: bool,
}

impl CompilationAttempt {
    pub fn method(&self) -> &Arc<PersistentMethodInfo> {
        &self.method
    }

    pub fn level(&self) -> Hotness {
        self.level
    }

    pub fn is_profiling(&self) -> bool {
        self.profiler.is_some()
    }

    fn next_level(&self) -> Option<Hotness> {
        self.level.next_after(self.is_profiling())
    }

    /// Attach a profiler recording one in `frequency` events for `count`
    /// events. Returns false when profiling is not available.
    pub fn switch_to_profiling_with(&mut self, frequency: u32, count: u32) -> bool {
        if !self.profiling_allowed {
            return false;
        }
        self.profiler = Some(ProfilerInfo { frequency, count });
        true
    }

    pub fn switch_to_profiling(&mut self) -> bool {
        let ProfilerInfo { frequency, count } = self.default_profiler;
        self.switch_to_profiling_with(frequency, count)
    }

    pub fn switch_away_from_profiling(&mut self) {
        self.profiler = None;
    }

    pub fn prevent_recompilation(&mut self) {
        self.prevented = true;
    }

    pub fn could_be_compiled_again(&self) -> bool {
        !self.prevented && self.next_level().is_some()
    }

    pub fn should_be_compiled_again(&self) -> bool {
        self.could_be_compiled_again() && (self.use_sampling || self.counting)
    }

    fn into_state(self) -> RecompilationState {
        let next_level = self.next_level();
        let state = RecompilationState::new(
            self.first_compile,
            next_level,
            self.counter,
            self.use_sampling,
            self.counting,
            self.profiler,
        );
        if self.prevented {
            state.mark_do_not_compile_again();
        }
        state
    }
}

struct PendingCompile {
    request: CompileRequest,
    ticket: CompileTicket,
}

pub struct RecompilationController {
    config: RuntimeConfig,
    caches: Arc<CodeCacheManager>,
    patcher: CallSitePatcher,
    registry: MethodBodyRegistry,
    scheduler: Arc<dyn CompilationScheduler>,
    stats: Arc<RuntimeStatistics>,
    runtime_flags: AtomicU32,
    methods: RwLock<FxHashMap<MethodId, Arc<PersistentMethodInfo>>>,
    pending: Mutex<Vec<PendingCompile>>,
}

impl RecompilationController {
    pub fn new(
        config: RuntimeConfig,
        caches: Arc<CodeCacheManager>,
        scheduler: Arc<dyn CompilationScheduler>,
        stats: Arc<RuntimeStatistics>,
    ) -> Self {
        let patcher = CallSitePatcher::new(
            Arc::clone(&caches),
            Arc::clone(&stats),
            PatchOptions::from_config(&config),
        );
        if !config.counting_supported {
            stats.disable_counting();
        }
        Self {
            config,
            caches,
            patcher,
            registry: MethodBodyRegistry::new(),
            scheduler,
            stats,
            runtime_flags: AtomicU32::new(CompileFlags::NONE.bits()),
            methods: RwLock::new(FxHashMap::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CodeCacheManager> {
        &self.caches
    }

    pub fn patcher(&self) -> &CallSitePatcher {
        &self.patcher
    }

    pub fn registry(&self) -> &MethodBodyRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<RuntimeStatistics> {
        &self.stats
    }

    pub fn register_method(&self, method: PersistentMethodInfo) -> Arc<PersistentMethodInfo> {
        let method = Arc::new(method);
        self.methods.write().insert(method.id(), Arc::clone(&method));
        method
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<PersistentMethodInfo>> {
        self.methods.read().get(&id).cloned()
    }

    pub fn methods(&self) -> Vec<Arc<PersistentMethodInfo>> {
        self.methods.read().values().cloned().collect()
    }

    pub fn runtime_flags(&self) -> CompileFlags {
        CompileFlags::from_bits(self.runtime_flags.load(Ordering::Acquire))
    }

    pub fn set_runtime_flags(&self, flags: CompileFlags) {
        self.runtime_flags.store(flags.bits(), Ordering::Release);
    }

    fn counting_available(&self) -> bool {
        self.config.counting_supported && self.stats.counting_supported()
    }

    /// Turn off counting triggers for the rest of the process.
    pub fn disable_counting(&self) {
        if self.stats.disable_counting() {
            tracing::info!("counting triggers disabled, using sampling only");
        }
    }

    fn profiling_allowed(&self, method: &PersistentMethodInfo, level: Hotness) -> bool {
        self.config.profiling.enabled
            && !method.profiling_excluded()
            && !method.is_native()
            && level >= Hotness::Warm
            && level < Hotness::Scorching
    }

    /// Open a compile attempt for `method` at `level`.
    pub fn start_of_compilation(
        &self,
        method: &Arc<PersistentMethodInfo>,
        level: Hotness,
    ) -> CompilationAttempt {
        CompilationAttempt {
            method: Arc::clone(method),
            level,
            flags: self.runtime_flags(),
            first_compile: method.current_body().is_none(),
            counter: self.config.counters.for_level(level),
            use_sampling: self.config.use_sampling,
            counting: self.counting_available(),
            profiling_allowed: self.profiling_allowed(method, level),
            default_profiler: ProfilerInfo {
                frequency: self.config.profiling.frequency,
                count: self.config.profiling.count,
            },
            profiler: None,
            prevented: method.is_do_not_compile(),
        }
    }

    /// Point direct calls, and inline-cache entries left unresolved, at the
    /// callees' current entries.
    fn link_template(&self, template: &mut BodyTemplate) {
        for site in &mut template.sites {
            let callee = match site {
                CallSiteTemplate::Direct { callee, .. }
                | CallSiteTemplate::Interface { callee, .. } => *callee,
                CallSiteTemplate::Virtual { .. } => continue,
            };
            let Some(entry) = self
                .method(callee)
                .and_then(|m| m.current_body())
                .map(|b| b.entry())
            else {
                continue;
            };
            match site {
                CallSiteTemplate::Direct { target, .. } => *target = entry,
                CallSiteTemplate::Interface { receivers, .. } => {
                    for receiver in receivers.iter_mut().filter(|r| r.class != 0 && r.target == 0) {
                        receiver.target = entry;
                    }
                }
                CallSiteTemplate::Virtual { .. } => {}
            }
        }
    }

    /// Place the compiled code, register it with its call sites and make it
    /// the method's current body.
    pub fn end_of_compilation(
        &self,
        attempt: CompilationAttempt,
        mut template: BodyTemplate,
    ) -> Result<Arc<CompiledMethodBody>, RecompileError> {
        self.link_template(&mut template);
        let emitted = BodyBuilder::new(&self.caches, self.patcher.options().decode_options())
            .build(&template)?;

        let descriptor = CompiledMethodDescriptor {
            start: emitted.start(),
            end: emitted.region.end(),
            reserved_offset: emitted.reserved_offset,
            level: attempt.level,
            profiling: attempt.is_profiling(),
            flags: attempt.flags,
            cache: emitted.region.cache,
        };
        let method = Arc::clone(&attempt.method);
        let body = Arc::new(CompiledMethodBody {
            descriptor,
            method: Arc::clone(&method),
            state: attempt.into_state(),
        });
        if !self.registry.register(Arc::clone(&body), emitted.sites) {
            return Err(RecompileError::DuplicateBody { start: body.start() });
        }
        method.set_current_body(Some(Arc::clone(&body)));
        tracing::debug!(
            method = %method.id(),
            level = %descriptor.level,
            profiling = descriptor.profiling,
            start = descriptor.start,
            "body installed"
        );
        Ok(body)
    }

    /// Compile a method's first body.
    pub fn compile_initial(
        &self,
        method: &Arc<PersistentMethodInfo>,
        level: Hotness,
        template: BodyTemplate,
    ) -> Result<Arc<CompiledMethodBody>, RecompileError> {
        let attempt = self.start_of_compilation(method, level);
        self.end_of_compilation(attempt, template)
    }

    /// Level to request for `body`: the next rung, or scorching for a hot
    /// looping body, never below what was already asked for.
    fn target_level(&self, body: &CompiledMethodBody, scorching: bool) -> Option<Hotness> {
        let mut level = body.state.next_level()?;
        if scorching && body.method.has_loops() {
            level = Hotness::Scorching;
        }
        if let Some(desired) = body.method.desired_level() {
            level = level.max(desired);
        }
        Some(level.max(body.level()))
    }

    /// Request recompilation of the body starting at `start_pc`.
    pub fn induce_recompilation(&self, start_pc: u64) -> Result<InduceOutcome, RecompileError> {
        let body = self
            .registry
            .lookup(start_pc)
            .ok_or(RecompileError::UnknownBody { start: start_pc })?;
        self.induce_for_body(&body, false)
    }

    fn induce_for_body(
        &self,
        body: &Arc<CompiledMethodBody>,
        scorching: bool,
    ) -> Result<InduceOutcome, RecompileError> {
        let method = &body.method;
        if body.state.do_not_compile_again() || method.is_do_not_compile() {
            return Ok(InduceOutcome::Declined);
        }
        let Some(level) = self.target_level(body, scorching) else {
            return Ok(InduceOutcome::Declined);
        };
        method.record_desired_level(level);

        let Some(generation) = method.try_begin_request() else {
            return Ok(InduceOutcome::AlreadyInFlight);
        };
        body.state
            .transition(Lifecycle::FreshlyCompiled, Lifecycle::RecompilationRequested);
        bump(&self.stats.recompilations_induced);

        let request = CompileRequest {
            method: Arc::clone(method),
            old_start: body.start(),
            level,
            profiling: level == Hotness::Hot && self.profiling_allowed(method, level),
            generation,
        };
        match self.scheduler.submit(request.clone()) {
            Ok(ticket) => {
                bump(&self.stats.submissions);
                body.state.set_lifecycle(Lifecycle::RecompilationInProgress);
                self.pending.lock().push(PendingCompile { request, ticket });
                tracing::debug!(
                    method = %method.id(),
                    from = %body.level(),
                    to = %level,
                    "recompilation requested"
                );
                Ok(InduceOutcome::Submitted { level })
            }
            Err(e) => {
                bump(&self.stats.scheduling_failures);
                tracing::warn!(method = %method.id(), error = %e, "recompilation request dropped");
                self.back_off(body);
                Err(e.into())
            }
        }
    }

    /// Put a body whose request failed back in the running, with its counter
    /// scaled by the method's back-off.
    fn back_off(&self, body: &CompiledMethodBody) {
        let method = &body.method;
        let shift = method.increase_backoff(self.config.max_backoff_shift);
        let base = self.config.counters.for_level(body.level()).max(1) as i64;
        body.state.set_counter((base << shift).min(i32::MAX as i64) as i32);
        if !body.state.lifecycle().is_terminal() {
            body.state.set_lifecycle(Lifecycle::FreshlyCompiled);
        }
        method.finish_request();
    }

    pub fn is_already_being_compiled(&self, method: &PersistentMethodInfo, start_pc: u64) -> bool {
        method.is_in_flight()
            && self
                .registry
                .lookup(start_pc)
                .is_some_and(|b| b.method.id() == method.id())
    }

    /// Periodic sample of a thread executing at `sample_pc`.
    pub fn sample_method(
        &self,
        ctx: &ThreadContext,
        start_pc: u64,
        code_size: u64,
        sample_pc: u64,
        method: Option<&PersistentMethodInfo>,
        tick: u64,
    ) -> Result<SampleOutcome, RecompileError> {
        bump(&self.stats.global_samples);
        let Some(method) = method else {
            bump(&self.stats.interpreted_samples);
            return Ok(SampleOutcome::Interpreted);
        };
        let Some(body) = self.registry.lookup(start_pc) else {
            return Ok(SampleOutcome::Ignored);
        };
        if body.method.id() != method.id()
            || sample_pc < start_pc
            || sample_pc >= start_pc + code_size
        {
            return Ok(SampleOutcome::Ignored);
        }
        bump(&self.stats.compiled_samples);
        if !body.state.use_sampling() || !body.should_be_compiled_again() {
            return Ok(SampleOutcome::Sampled);
        }

        let in_window = body.state.record_window_sample(tick, self.config.sampling_window);
        let scorching = method.has_loops()
            && in_window >= self.config.scorching_sample_threshold
            && body.level() < Hotness::Scorching;
        let fire = if scorching {
            body.state.take_counter() > 0
        } else {
            body.state.tick() == 1
        };
        if !fire {
            return Ok(SampleOutcome::Sampled);
        }
        tracing::trace!(
            thread = ctx.thread_id,
            method = %method.id(),
            scorching,
            "sampling trigger"
        );
        Ok(SampleOutcome::Triggered(self.induce_for_body(&body, scorching)?))
    }

    /// Counting-mode trigger, called on entry to the body at `start_pc`.
    pub fn record_invocation(
        &self,
        start_pc: u64,
    ) -> Result<Option<InduceOutcome>, RecompileError> {
        if !self.counting_available() {
            self.disable_counting();
            return Err(RecompileError::PlatformUnsupportedCounting);
        }
        let body = self
            .registry
            .lookup(start_pc)
            .ok_or(RecompileError::UnknownBody { start: start_pc })?;
        bump(&self.stats.invocations_counted);
        if !body.state.counting() || !body.should_be_compiled_again() {
            return Ok(None);
        }
        if body.state.tick() != 1 {
            return Ok(None);
        }
        self.induce_for_body(&body, false).map(Some)
    }

    /// Redirect every known caller of the body at `old_start`, and the body's
    /// own entry, to the body at `new_start`.
    pub fn method_has_been_recompiled(
        &self,
        old_start: u64,
        new_start: u64,
    ) -> Result<RecompileSummary, RecompileError> {
        let old = self
            .registry
            .lookup(old_start)
            .ok_or(RecompileError::UnknownBody { start: old_start })?;
        let new = self
            .registry
            .lookup(new_start)
            .ok_or(RecompileError::UnknownBody { start: new_start })?;
        let callee = old.method.id();
        let new_entry = new.entry();

        old.state.mark_do_not_compile_again();
        old.state.set_lifecycle(Lifecycle::Superseded);

        let mut summary = RecompileSummary::default();
        for site in self.registry.call_sites_for(callee) {
            if site.current_target == new_entry {
                continue;
            }
            let request = PatchRequest::for_site(&site, new_start, new.reserved_offset());
            match self.patcher.patch(&request) {
                Ok(outcome) if outcome.reaches_target() => {
                    self.registry
                        .update_call_site(callee, site.address, new_entry, outcome.trampoline());
                    summary.patched += 1;
                }
                Ok(PatchOutcome::Skipped) => {
                    bump(&self.stats.sites_unpatched);
                    summary.unpatched += 1;
                }
                Ok(_) => summary.untouched += 1,
                Err(e) => {
                    bump(&self.stats.sites_unpatched);
                    tracing::warn!(
                        site = site.address,
                        method = %callee,
                        error = %e,
                        "call site left on old body"
                    );
                    summary.unpatched += 1;
                }
            }
        }

        match self
            .patcher
            .redirect_entry(old.start(), old.reserved_offset(), callee, new_entry)
        {
            Ok(_) => summary.entry_redirected = true,
            Err(e) => {
                tracing::warn!(method = %callee, error = %e, "old entry not redirected");
            }
        }

        // Virtual dispatch and callers unknown to the registry only reach the
        // new body through the old entry, so that entry must stay mapped.
        if summary.unpatched == 0 && summary.entry_redirected {
            self.registry.queue_unreachable(Arc::clone(&old));
            summary.queued_unreachable = true;
        }
        tracing::debug!(
            method = %callee,
            patched = summary.patched,
            unpatched = summary.unpatched,
            "callers redirected"
        );
        Ok(summary)
    }

    /// Install the result of a finished request.
    pub fn install_compiled_body(
        &self,
        request: &CompileRequest,
        result: CompileResult,
    ) -> Result<InstallOutcome, RecompileError> {
        let method = &request.method;
        if method.generation() != request.generation || method.is_do_not_compile() {
            bump(&self.stats.discarded_results);
            tracing::debug!(
                method = %method.id(),
                generation = request.generation,
                "discarding superseded result"
            );
            return Ok(InstallOutcome::Discarded);
        }
        let Some(old) = self.registry.lookup(request.old_start) else {
            method.finish_request();
            return Err(RecompileError::UnknownBody {
                start: request.old_start,
            });
        };

        let mut attempt = self.start_of_compilation(method, result.level);
        if request.profiling {
            attempt.switch_to_profiling();
        }
        let new = match self.end_of_compilation(attempt, result.template) {
            Ok(body) => body,
            Err(e) => {
                bump(&self.stats.compile_failures);
                self.back_off(&old);
                return Err(e);
            }
        };
        if old.is_profiling() {
            old.state.set_profiling_state(ProfilingState::Complete);
        }

        let summary = self.method_has_been_recompiled(old.start(), new.start());
        method.finish_request();
        let summary = summary?;
        method.reset_backoff();
        bump(&self.stats.bodies_installed);
        Ok(InstallOutcome::Installed {
            start: new.start(),
            summary,
        })
    }

    /// A request came back without a body.
    pub fn compilation_failed(&self, request: &CompileRequest, error: &SchedulingError) {
        bump(&self.stats.compile_failures);
        let method = &request.method;
        if method.generation() != request.generation {
            return;
        }
        tracing::warn!(method = %method.id(), error = %error, "recompilation failed");
        match self.registry.lookup(request.old_start) {
            Some(old) => self.back_off(&old),
            None => method.finish_request(),
        }
    }

    pub fn pending_compilations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for every submitted request and install or discard its result.
    pub async fn drain_completions(&self) -> Vec<Result<InstallOutcome, RecompileError>> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut outcomes = Vec::with_capacity(pending.len());
        for PendingCompile { request, ticket } in pending {
            let outcome = match ticket.await {
                Ok(result) => self.install_compiled_body(&request, result),
                Err(e) => {
                    self.compilation_failed(&request, &e);
                    Ok(InstallOutcome::Failed)
                }
            };
            if let Err(e) = &outcome {
                tracing::warn!(method = %request.method.id(), error = %e, "install failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Kill the body at `start_pc`: its entry goes to the recompile helper
    /// and it is never recompiled or sampled again.
    pub fn invalidate_method_body(&self, start_pc: u64) -> Result<(), RecompileError> {
        let body = self
            .registry
            .lookup(start_pc)
            .ok_or(RecompileError::UnknownBody { start: start_pc })?;
        if body.state.lifecycle() == Lifecycle::Invalidated {
            return Ok(());
        }
        body.state.mark_do_not_compile_again();
        body.state.set_lifecycle(Lifecycle::Invalidated);

        let method = &body.method;
        method.bump_generation();
        method.finish_request();
        method.clear_current_body_if(start_pc);

        self.patcher.redirect_entry_to_helper(
            start_pc,
            body.reserved_offset(),
            helpers::RECOMPILE_ON_INVOCATION,
        )?;
        bump(&self.stats.invalidations);
        tracing::info!(
            method = %method.id(),
            start = start_pc,
            flags = %body.descriptor.flags,
            "body invalidated"
        );
        Ok(())
    }

    /// Invalidate current bodies compiled under flags the runtime no longer
    /// satisfies, or every current body with `invalidate_all`.
    pub fn invalidate_compiled_methods_if_needed(&self, invalidate_all: bool) -> usize {
        let runtime = self.runtime_flags();
        let mut invalidated = 0;
        for method in self.methods() {
            let Some(body) = method.current_body() else {
                continue;
            };
            if !invalidate_all && body.descriptor.flags.is_compatible_with(runtime) {
                continue;
            }
            match self.invalidate_method_body(body.start()) {
                Ok(()) => invalidated += 1,
                Err(e) => tracing::warn!(method = %method.id(), error = %e, "invalidation failed"),
            }
        }
        invalidated
    }

    /// Freeze `method` on its current body.
    pub fn prevent_recompilation(&self, method: &PersistentMethodInfo) {
        method.mark_do_not_compile();
        method.bump_generation();
        method.finish_request();
        if let Some(body) = method.current_body() {
            body.state.mark_do_not_compile_again();
        }
        tracing::info!(method = %method.id(), "recompilation prevented");
    }

    /// Drop the method's in-flight request, if any, so that its result is
    /// discarded. Returns whether a request was superseded.
    pub fn supersede_in_flight_request(&self, method: &PersistentMethodInfo) -> bool {
        if !method.is_in_flight() {
            return false;
        }
        method.bump_generation();
        method.finish_request();
        if let Some(body) = method.current_body() {
            if !body
                .state
                .transition(Lifecycle::RecompilationInProgress, Lifecycle::FreshlyCompiled)
            {
                body.state
                    .transition(Lifecycle::RecompilationRequested, Lifecycle::FreshlyCompiled);
            }
        }
        tracing::debug!(method = %method.id(), "in-flight request superseded");
        true
    }

    /// Reclamation point: no thread runs superseded code any more. Returns
    /// the bodies whose memory may now be reused.
    pub fn reclaim_at_safepoint(&self) -> Vec<Arc<CompiledMethodBody>> {
        for cache in self.caches.caches() {
            cache.trampolines().reclaim_retired();
        }
        self.registry.drain_unreachable()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::jit::encoder::Arch;
    use crate::jit::helper_table::HelperTable;

    const RECOMPILE_HELPER: u64 = 0x7000_0000_1000;

    /// Compiles every request on the spot.
    #[derive(Default)]
    struct Immediate {
        submitted: AtomicUsize,
        full: bool,
    }

    impl CompilationScheduler for Immediate {
        fn submit(&self, request: CompileRequest) -> Result<CompileTicket, SchedulingError> {
            if self.full {
                return Err(SchedulingError::SchedulingFull);
            }
            self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(CompileTicket::ready(Ok(CompileResult {
                level: request.level,
                template: leaf(),
            })))
        }
    }

    fn leaf() -> BodyTemplate {
        BodyTemplate {
            reserved_words: 1,
            sites: vec![],
            filler: 16,
        }
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.code_cache_size = 64 * 1024;
        config.max_code_caches = 2;
        config.counters.cold = 3;
        config.scorching_sample_threshold = 2;
        config.strict_call_site_checks = true;
        config
    }

    fn controller_with(
        config: RuntimeConfig,
        scheduler: Arc<Immediate>,
    ) -> RecompilationController {
        let table = HelperTable::new(3);
        table.update(helpers::RECOMPILE_ON_INVOCATION, RECOMPILE_HELPER);
        let caches = CodeCacheManager::from_config(&config, Arch::X86_64, Arc::new(table)).unwrap();
        RecompilationController::new(
            config,
            Arc::new(caches),
            scheduler,
            Arc::new(RuntimeStatistics::new()),
        )
    }

    fn controller(scheduler: Arc<Immediate>) -> RecompilationController {
        controller_with(config(), scheduler)
    }

    /// `m1` is a leaf, `m2` calls it directly.
    fn caller_and_callee(
        ctl: &RecompilationController,
    ) -> (Arc<CompiledMethodBody>, Arc<CompiledMethodBody>) {
        let callee = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "leaf"));
        let caller = ctl.register_method(PersistentMethodInfo::new(MethodId(2), "caller"));
        let callee_body = ctl.compile_initial(&callee, Hotness::Cold, leaf()).unwrap();
        let caller_body = ctl
            .compile_initial(
                &caller,
                Hotness::Cold,
                BodyTemplate {
                    reserved_words: 1,
                    sites: vec![CallSiteTemplate::Direct {
                        callee: MethodId(1),
                        target: 0,
                    }],
                    filler: 8,
                },
            )
            .unwrap();
        (callee_body, caller_body)
    }

    #[test]
    fn test_initial_compile_links_callers() {
        let ctl = controller(Arc::default());
        let (callee, _) = caller_and_callee(&ctl);
        let sites = ctl.registry().call_sites_for(MethodId(1));
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].current_target, callee.entry());
        assert_eq!(
            ctl.patcher().resolve_call(sites[0].address, None).unwrap(),
            Some(callee.entry())
        );
        assert_eq!(callee.state.next_level(), Some(Hotness::Warm));
        assert!(callee.state.first_compile());
    }

    #[tokio::test]
    async fn test_recompilation_redirects_callers_and_entry() {
        let scheduler = Arc::new(Immediate::default());
        let ctl = controller(Arc::clone(&scheduler));
        let (old, _) = caller_and_callee(&ctl);

        let outcome = ctl.induce_recompilation(old.start()).unwrap();
        assert_eq!(outcome, InduceOutcome::Submitted { level: Hotness::Warm });
        assert_eq!(old.state.lifecycle(), Lifecycle::RecompilationInProgress);
        assert_eq!(ctl.pending_compilations(), 1);

        let outcomes = ctl.drain_completions().await;
        let Some(Ok(InstallOutcome::Installed { start, summary })) = outcomes.first() else {
            panic!("expected install, got {outcomes:?}");
        };
        let (start, summary) = (*start, *summary);
        assert_eq!(summary.patched, 1);
        assert_eq!(summary.unpatched, 0);
        assert!(summary.entry_redirected);
        assert!(summary.queued_unreachable);

        let new = ctl.registry().lookup(start).unwrap();
        assert_eq!(new.level(), Hotness::Warm);
        assert_eq!(ctl.method(MethodId(1)).unwrap().current_body().unwrap().start(), start);

        let site = ctl.registry().call_sites_for(MethodId(1))[0];
        assert_eq!(site.current_target, new.entry());
        assert_eq!(ctl.patcher().resolve_call(site.address, None).unwrap(), Some(new.entry()));
        assert_eq!(ctl.caches().resolve(old.entry()).unwrap(), new.entry());

        assert_eq!(old.state.lifecycle(), Lifecycle::Superseded);
        assert!(old.state.do_not_compile_again());
        assert!(!old.method.is_in_flight());
        assert_eq!(ctl.stats().snapshot().bodies_installed, 1);

        let reclaimed = ctl.reclaim_at_safepoint();
        assert_eq!(reclaimed.len(), 1);
        assert!(ctl.registry().lookup(old.start()).is_none());
    }

    #[tokio::test]
    async fn test_old_body_kept_when_entry_not_redirected() {
        let mut config = config();
        config.stress_trampolines = true;
        let ctl = controller_with(config, Arc::default());
        let callee = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "leaf"));
        let old = ctl.compile_initial(&callee, Hotness::Cold, leaf()).unwrap();

        // No room left for a trampoline next to the old entry.
        let first = ctl.caches().cache(0).unwrap();
        first.reserve(first.free_bytes()).unwrap();
        assert_eq!(first.free_bytes(), 0);

        let caller = ctl.register_method(PersistentMethodInfo::new(MethodId(2), "caller"));
        let caller_body = ctl
            .compile_initial(
                &caller,
                Hotness::Cold,
                BodyTemplate {
                    reserved_words: 1,
                    sites: vec![CallSiteTemplate::Direct {
                        callee: MethodId(1),
                        target: 0,
                    }],
                    filler: 8,
                },
            )
            .unwrap();
        assert!(!first.contains(caller_body.start()));

        ctl.induce_recompilation(old.start()).unwrap();
        let outcomes = ctl.drain_completions().await;
        let Some(Ok(InstallOutcome::Installed { start, summary })) = outcomes.first() else {
            panic!("expected install, got {outcomes:?}");
        };
        let (start, summary) = (*start, *summary);
        assert_eq!(summary.patched, 1);
        assert_eq!(summary.unpatched, 0);
        assert!(!summary.entry_redirected);
        assert!(!summary.queued_unreachable);
        assert_eq!(ctl.stats().snapshot().trampoline_exhaustions, 1);

        let new = ctl.registry().lookup(start).unwrap();
        let site = ctl.registry().call_sites_for(MethodId(1))[0];
        assert_eq!(ctl.patcher().resolve_call(site.address, None).unwrap(), Some(new.entry()));

        assert!(ctl.reclaim_at_safepoint().is_empty());
        assert!(ctl.registry().lookup(old.start()).is_some());
        assert_eq!(ctl.caches().resolve(old.entry()).unwrap(), old.entry());
    }

    #[test]
    fn test_one_request_in_flight() {
        let scheduler = Arc::new(Immediate::default());
        let ctl = controller(Arc::clone(&scheduler));
        let (body, _) = caller_and_callee(&ctl);

        assert!(matches!(
            ctl.induce_recompilation(body.start()).unwrap(),
            InduceOutcome::Submitted { .. }
        ));
        assert_eq!(ctl.induce_recompilation(body.start()).unwrap(), InduceOutcome::AlreadyInFlight);
        assert_eq!(scheduler.submitted.load(Ordering::SeqCst), 1);
        assert!(ctl.is_already_being_compiled(&body.method, body.start()));
    }

    #[test]
    fn test_counting_fires_once() {
        let ctl = controller(Arc::default());
        let (body, _) = caller_and_callee(&ctl);

        assert_eq!(ctl.record_invocation(body.start()).unwrap(), None);
        assert_eq!(ctl.record_invocation(body.start()).unwrap(), None);
        assert_eq!(
            ctl.record_invocation(body.start()).unwrap(),
            Some(InduceOutcome::Submitted { level: Hotness::Warm })
        );
        assert_eq!(ctl.record_invocation(body.start()).unwrap(), None);
        assert_eq!(ctl.stats().snapshot().invocations_counted, 4);
    }

    #[test]
    fn test_counting_unsupported() {
        let mut config = config();
        config.counting_supported = false;
        let ctl = controller_with(config, Arc::default());
        let (body, _) = caller_and_callee(&ctl);

        assert!(!body.state.counting());
        assert!(matches!(
            ctl.record_invocation(body.start()),
            Err(RecompileError::PlatformUnsupportedCounting)
        ));
        assert!(ctl.stats().snapshot().counting_disabled);
    }

    #[test]
    fn test_scheduling_failure_backs_off() {
        let ctl = controller(Arc::new(Immediate {
            full: true,
            ..Default::default()
        }));
        let (body, _) = caller_and_callee(&ctl);

        assert!(matches!(
            ctl.induce_recompilation(body.start()),
            Err(RecompileError::Scheduling(SchedulingError::SchedulingFull))
        ));
        assert_eq!(body.state.counter(), 3 << 1);
        assert_eq!(body.state.lifecycle(), Lifecycle::FreshlyCompiled);
        assert!(!body.method.is_in_flight());
        assert_eq!(ctl.stats().snapshot().scheduling_failures, 1);
    }

    #[test]
    fn test_sampling_scorching_loop() {
        let ctl = controller(Arc::default());
        let method =
            ctl.register_method(PersistentMethodInfo::new(MethodId(5), "loop").with_loops());
        let body = ctl.compile_initial(&method, Hotness::Cold, leaf()).unwrap();
        let ctx = ThreadContext { thread_id: 1 };
        let size = body.descriptor.size();

        assert_eq!(
            ctl.sample_method(&ctx, body.start(), size, body.entry(), Some(&*method), 1)
                .unwrap(),
            SampleOutcome::Sampled
        );
        assert_eq!(
            ctl.sample_method(&ctx, body.start(), size, body.entry(), Some(&*method), 2)
                .unwrap(),
            SampleOutcome::Triggered(InduceOutcome::Submitted {
                level: Hotness::Scorching
            })
        );
        assert_eq!(body.state.counter(), 0);
    }

    #[test]
    fn test_sample_outside_compiled_code() {
        let ctl = controller(Arc::default());
        let ctx = ThreadContext::default();
        assert_eq!(
            ctl.sample_method(&ctx, 0, 0, 0, None, 1).unwrap(),
            SampleOutcome::Interpreted
        );
        let method = PersistentMethodInfo::new(MethodId(9), "unknown");
        assert_eq!(
            ctl.sample_method(&ctx, 0x10, 8, 0x10, Some(&method), 1).unwrap(),
            SampleOutcome::Ignored
        );
        let stats = ctl.stats().snapshot();
        assert_eq!(stats.global_samples, 2);
        assert_eq!(stats.interpreted_samples, 1);
    }

    #[test]
    fn test_desired_level_never_drops() {
        let ctl = controller(Arc::default());
        let method =
            ctl.register_method(PersistentMethodInfo::new(MethodId(5), "loop").with_loops());
        let body = ctl.compile_initial(&method, Hotness::Cold, leaf()).unwrap();
        let ctx = ThreadContext::default();
        let size = body.descriptor.size();
        for tick in 1..=2 {
            ctl.sample_method(&ctx, body.start(), size, body.entry(), Some(&*method), tick)
                .unwrap();
        }
        assert!(ctl.supersede_in_flight_request(&method));
        assert_eq!(
            ctl.induce_recompilation(body.start()).unwrap(),
            InduceOutcome::Submitted {
                level: Hotness::Scorching
            }
        );
    }

    #[tokio::test]
    async fn test_superseded_result_discarded() {
        let ctl = controller(Arc::default());
        let (body, _) = caller_and_callee(&ctl);
        ctl.induce_recompilation(body.start()).unwrap();
        assert!(ctl.supersede_in_flight_request(&body.method));
        assert!(!ctl.supersede_in_flight_request(&body.method));

        let outcomes = ctl.drain_completions().await;
        assert!(matches!(outcomes[0], Ok(InstallOutcome::Discarded)));
        assert_eq!(body.method.current_body().unwrap().start(), body.start());
        assert_eq!(ctl.stats().snapshot().discarded_results, 1);
    }

    #[test]
    fn test_prevented_method_declines() {
        let ctl = controller(Arc::default());
        let (body, _) = caller_and_callee(&ctl);
        ctl.prevent_recompilation(&body.method);
        assert_eq!(ctl.induce_recompilation(body.start()).unwrap(), InduceOutcome::Declined);

        let method = ctl.method(MethodId(1)).unwrap();
        let attempt = ctl.start_of_compilation(&method, Hotness::Warm);
        assert!(!attempt.could_be_compiled_again());
    }

    #[test]
    fn test_top_level_declines() {
        let ctl = controller(Arc::default());
        let method = ctl.register_method(PersistentMethodInfo::new(MethodId(3), "top"));
        let body = ctl.compile_initial(&method, Hotness::Scorching, leaf()).unwrap();
        assert_eq!(ctl.induce_recompilation(body.start()).unwrap(), InduceOutcome::Declined);
    }

    #[test]
    fn test_profiling_attempts() {
        let ctl = controller(Arc::default());
        let plain = ctl.register_method(PersistentMethodInfo::new(MethodId(1), "a"));
        let excluded = ctl
            .register_method(PersistentMethodInfo::new(MethodId(2), "b").exclude_from_profiling());

        let mut hot = ctl.start_of_compilation(&plain, Hotness::Hot);
        assert!(hot.switch_to_profiling());
        assert!(hot.is_profiling());
        let body = ctl.end_of_compilation(hot, leaf()).unwrap();
        assert_eq!(body.state.next_level(), Some(Hotness::VeryHot));
        assert_eq!(body.state.profiling_state(), ProfilingState::Active);

        let mut cold = ctl.start_of_compilation(&plain, Hotness::Cold);
        assert!(!cold.switch_to_profiling_with(4, 100));
        let mut hot = ctl.start_of_compilation(&excluded, Hotness::Hot);
        assert!(!hot.switch_to_profiling());
        hot.switch_away_from_profiling();
        assert!(!hot.is_profiling());
    }

    #[test]
    fn test_invalidation_on_flag_change() {
        let ctl = controller(Arc::default());
        let (callee, caller) = caller_and_callee(&ctl);

        assert_eq!(ctl.invalidate_compiled_methods_if_needed(false), 0);
        ctl.set_runtime_flags(CompileFlags::TRAP_HANDLING);
        assert_eq!(ctl.invalidate_compiled_methods_if_needed(false), 2);

        for body in [&callee, &caller] {
            assert_eq!(body.state.lifecycle(), Lifecycle::Invalidated);
            assert!(body.method.current_body().is_none());
            assert_eq!(ctl.caches().resolve(body.entry()).unwrap(), RECOMPILE_HELPER);
        }
        assert_eq!(ctl.induce_recompilation(callee.start()).unwrap(), InduceOutcome::Declined);
        assert_eq!(ctl.stats().snapshot().invalidations, 2);

        ctl.invalidate_method_body(callee.start()).unwrap();
        assert_eq!(ctl.stats().snapshot().invalidations, 2);
    }

    #[test]
    fn test_unknown_body() {
        let ctl = controller(Arc::default());
        assert!(matches!(
            ctl.induce_recompilation(0x1234),
            Err(RecompileError::UnknownBody { start: 0x1234 })
        ));
        assert!(ctl.invalidate_method_body(0x1234).is_err());
    }
}
