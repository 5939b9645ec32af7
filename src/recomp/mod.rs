//! Tiered recompilation.
//!
//! Method and body metadata, the body registry, the compilation scheduler
//! interface and the controller that decides when a body is replaced.

pub mod body;
pub mod controller;
pub mod registry;
pub mod scheduler;

pub use body::{
    CompileFlags, CompiledMethodBody, CompiledMethodDescriptor, Hotness, Lifecycle, MethodId,
    PersistentMethodInfo, ProfilerInfo, ProfilingState, RecompilationState,
};
pub use controller::{
    CompilationAttempt, InduceOutcome, InstallOutcome, RecompilationController, RecompileError,
    RecompileSummary, SampleOutcome, ThreadContext,
};
pub use registry::MethodBodyRegistry;
pub use scheduler::{
    CompilationScheduler, CompileBackend, CompileRequest, CompileResult, CompileTicket,
    CompletionSender, QueueScheduler, SchedulingError,
};
