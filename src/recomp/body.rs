//! Method and body metadata.
//!
//! A [`PersistentMethodInfo`] lives as long as the method and survives
//! across bodies. Each [`CompiledMethodBody`] is immutable apart from its
//! [`RecompilationState`], which the sampler and controller update through
//! atomics and short-held locks.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identity of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Optimization level of a compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Hotness {
    NoOpt = 0,
    Cold = 1,
    Warm = 2,
    Hot = 3,
    VeryHot = 4,
    Scorching = 5,
}

impl Hotness {
    pub const ALL: [Hotness; 6] = [
        Hotness::NoOpt,
        Hotness::Cold,
        Hotness::Warm,
        Hotness::Hot,
        Hotness::VeryHot,
        Hotness::Scorching,
    ];

    /// Next rung of the recompilation ladder. `VeryHot` is only reached
    /// from a profiling `Hot` body, see [`Hotness::next_after`].
    pub fn next(self) -> Option<Hotness> {
        match self {
            Hotness::NoOpt => Some(Hotness::Cold),
            Hotness::Cold => Some(Hotness::Warm),
            Hotness::Warm => Some(Hotness::Hot),
            Hotness::Hot | Hotness::VeryHot => Some(Hotness::Scorching),
            Hotness::Scorching => None,
        }
    }

    pub fn next_after(self, profiling: bool) -> Option<Hotness> {
        match (self, profiling) {
            (Hotness::Hot, true) => Some(Hotness::VeryHot),
            _ => self.next(),
        }
    }

    pub fn from_u8(value: u8) -> Option<Hotness> {
        Hotness::ALL.get(value as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Hotness::NoOpt => "no_opt",
            Hotness::Cold => "cold",
            Hotness::Warm => "warm",
            Hotness::Hot => "hot",
            Hotness::VeryHot => "very_hot",
            Hotness::Scorching => "scorching",
        }
    }
}

impl fmt::Display for Hotness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hotness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hotness::ALL
            .into_iter()
            .find(|h| h.name() == s.to_ascii_lowercase().replace('-', "_"))
            .ok_or_else(|| format!("unknown hotness level '{s}'"))
    }
}

/// Runtime capabilities a body was compiled against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompileFlags(u32);

impl CompileFlags {
    pub const NONE: CompileFlags = CompileFlags(0);
    pub const TRAP_HANDLING: CompileFlags = CompileFlags(1 << 0);
    pub const EXCEPTION_HOOKS: CompileFlags = CompileFlags(1 << 1);
    pub const METHOD_ENTER_EXIT_HOOKS: CompileFlags = CompileFlags(1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        CompileFlags(bits & 0b111)
    }

    pub const fn contains(self, other: CompileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// A body stays valid while it supports everything the runtime now needs.
    pub const fn is_compatible_with(self, runtime: CompileFlags) -> bool {
        self.contains(runtime)
    }
}

impl BitOr for CompileFlags {
    type Output = CompileFlags;

    fn bitor(self, rhs: CompileFlags) -> CompileFlags {
        CompileFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for CompileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (CompileFlags::TRAP_HANDLING, "trap-handling"),
            (CompileFlags::EXCEPTION_HOOKS, "exception-hooks"),
            (CompileFlags::METHOD_ENTER_EXIT_HOOKS, "enter-exit-hooks"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

/// Where a body is in its replacement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    FreshlyCompiled,
    RecompilationRequested,
    RecompilationInProgress,
    Superseded,
    Invalidated,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Superseded | Lifecycle::Invalidated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingState {
    NotProfiling,
    Active,
    Complete,
}

/// An attached value profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerInfo {
    pub frequency: u32,
    pub count: u32,
}

/// Per-body recompilation bookkeeping.
#[derive(Debug)]
pub struct RecompilationState {
    first_compile: bool,
    next_level: Option<Hotness>,
    counter: AtomicI32,
    do_not_compile_again: AtomicBool,
    use_sampling: bool,
    counting: bool,
    profiler: Option<ProfilerInfo>,
    lifecycle: Mutex<Lifecycle>,
    profiling: Mutex<ProfilingState>,
    window_start: AtomicU64,
    window_samples: AtomicU32,
}

impl RecompilationState {
    pub fn new(
        first_compile: bool,
        next_level: Option<Hotness>,
        counter: i32,
        use_sampling: bool,
        counting: bool,
        profiler: Option<ProfilerInfo>,
    ) -> Self {
        Self {
            first_compile,
            next_level,
            counter: AtomicI32::new(counter),
            do_not_compile_again: AtomicBool::new(false),
            use_sampling,
            counting,
            profiler,
            lifecycle: Mutex::new(Lifecycle::FreshlyCompiled),
            profiling: Mutex::new(if profiler.is_some() {
                ProfilingState::Active
            } else {
                ProfilingState::NotProfiling
            }),
            window_start: AtomicU64::new(0),
            window_samples: AtomicU32::new(0),
        }
    }

    pub fn first_compile(&self) -> bool {
        self.first_compile
    }

    pub fn next_level(&self) -> Option<Hotness> {
        self.next_level
    }

    pub fn counter(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn set_counter(&self, value: i32) {
        self.counter.store(value, Ordering::Release);
    }

    /// Decrement the counter, returning the value before the decrement.
    /// Exactly one caller observes 1.
    pub fn tick(&self) -> i32 {
        self.counter.fetch_sub(1, Ordering::AcqRel)
    }

    /// Zero the counter, returning the previous value.
    pub fn take_counter(&self) -> i32 {
        self.counter.swap(0, Ordering::AcqRel)
    }

    pub fn use_sampling(&self) -> bool {
        self.use_sampling
    }

    pub fn counting(&self) -> bool {
        self.counting
    }

    pub fn profiler(&self) -> Option<ProfilerInfo> {
        self.profiler
    }

    pub fn do_not_compile_again(&self) -> bool {
        self.do_not_compile_again.load(Ordering::Acquire)
    }

    pub fn mark_do_not_compile_again(&self) {
        self.do_not_compile_again.store(true, Ordering::Release);
    }

    pub fn could_be_compiled_again(&self) -> bool {
        !self.do_not_compile_again() && self.next_level.is_some()
    }

    pub fn should_be_compiled_again(&self) -> bool {
        self.could_be_compiled_again() && (self.use_sampling || self.counting)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.lock() = state;
    }

    /// Move from `from` to `to`; false if the body was elsewhere.
    pub fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let mut state = self.lifecycle.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    pub fn profiling_state(&self) -> ProfilingState {
        *self.profiling.lock()
    }

    pub fn set_profiling_state(&self, state: ProfilingState) {
        *self.profiling.lock() = state;
    }

    /// Record a sample at `tick` and return the number of samples seen in
    /// the current window of `window` ticks.
    pub fn record_window_sample(&self, tick: u64, window: u64) -> u32 {
        let start = self.window_start.load(Ordering::Acquire);
        if tick.saturating_sub(start) >= window
            && self
                .window_start
                .compare_exchange(start, tick, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.window_samples.store(1, Ordering::Release);
            return 1;
        }
        self.window_samples.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Code layout of a compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledMethodDescriptor {
    pub start: u64,
    pub end: u64,
    pub reserved_offset: u64,
    pub level: Hotness,
    pub profiling: bool,
    pub flags: CompileFlags,
    pub cache: usize,
}

impl CompiledMethodDescriptor {
    pub fn entry(&self) -> u64 {
        self.start + self.reserved_offset
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

const NO_LEVEL: u8 = 0;

/// Per-method state that outlives individual bodies.
#[derive(Debug)]
pub struct PersistentMethodInfo {
    id: MethodId,
    name: String,
    has_loops: bool,
    is_native: bool,
    profiling_excluded: bool,
    current_body: Mutex<Option<Arc<CompiledMethodBody>>>,
    in_flight: AtomicBool,
    generation: AtomicU64,
    /// Highest level ever requested, plus one; 0 for none.
    desired_level: AtomicU8,
    backoff: AtomicU32,
    do_not_compile: AtomicBool,
}

impl PersistentMethodInfo {
    pub fn new(id: MethodId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            has_loops: false,
            is_native: false,
            profiling_excluded: false,
            current_body: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            desired_level: AtomicU8::new(NO_LEVEL),
            backoff: AtomicU32::new(0),
            do_not_compile: AtomicBool::new(false),
        }
    }

    pub fn with_loops(mut self) -> Self {
        self.has_loops = true;
        self
    }

    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }

    pub fn exclude_from_profiling(mut self) -> Self {
        self.profiling_excluded = true;
        self
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_loops(&self) -> bool {
        self.has_loops
    }

    pub fn is_native(&self) -> bool {
        self.is_native
    }

    pub fn profiling_excluded(&self) -> bool {
        self.profiling_excluded
    }

    pub fn current_body(&self) -> Option<Arc<CompiledMethodBody>> {
        self.current_body.lock().clone()
    }

    pub fn set_current_body(&self, body: Option<Arc<CompiledMethodBody>>) {
        *self.current_body.lock() = body;
    }

    /// Clear the current body if it is the one starting at `start`.
    pub fn clear_current_body_if(&self, start: u64) -> bool {
        let mut current = self.current_body.lock();
        if current.as_ref().is_some_and(|b| b.start() == start) {
            *current = None;
            return true;
        }
        false
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the in-flight slot. Returns the request's generation, or
    /// `None` when a request is already in flight.
    pub fn try_begin_request(&self) -> Option<u64> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.generation())
    }

    pub fn finish_request(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every outstanding request. Returns the new generation.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn desired_level(&self) -> Option<Hotness> {
        match self.desired_level.load(Ordering::Acquire) {
            NO_LEVEL => None,
            encoded => Hotness::from_u8(encoded - 1),
        }
    }

    /// Remember `level` if it is the highest requested so far.
    pub fn record_desired_level(&self, level: Hotness) {
        self.desired_level.fetch_max(level as u8 + 1, Ordering::AcqRel);
    }

    pub fn backoff(&self) -> u32 {
        self.backoff.load(Ordering::Acquire)
    }

    /// Raise the back-off exponent, capped at `max`. Returns the new value.
    pub fn increase_backoff(&self, max: u32) -> u32 {
        let previous = self
            .backoff
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some((b + 1).min(max)))
            .unwrap_or(max);
        (previous + 1).min(max)
    }

    pub fn reset_backoff(&self) {
        self.backoff.store(0, Ordering::Release);
    }

    pub fn is_do_not_compile(&self) -> bool {
        self.do_not_compile.load(Ordering::Acquire)
    }

    pub fn mark_do_not_compile(&self) {
        self.do_not_compile.store(true, Ordering::Release);
    }
}

/// A compiled body and its replacement state.
#[derive(Debug)]
pub struct CompiledMethodBody {
    pub descriptor: CompiledMethodDescriptor,
    pub method: Arc<PersistentMethodInfo>,
    pub state: RecompilationState,
}

impl CompiledMethodBody {
    pub fn start(&self) -> u64 {
        self.descriptor.start
    }

    pub fn entry(&self) -> u64 {
        self.descriptor.entry()
    }

    pub fn reserved_offset(&self) -> u64 {
        self.descriptor.reserved_offset
    }

    pub fn level(&self) -> Hotness {
        self.descriptor.level
    }

    pub fn is_profiling(&self) -> bool {
        self.descriptor.profiling
    }

    pub fn could_be_compiled_again(&self) -> bool {
        self.state.could_be_compiled_again()
    }

    pub fn should_be_compiled_again(&self) -> bool {
        self.state.should_be_compiled_again()
    }
}
