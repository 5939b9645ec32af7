//! Machine-code side of recompilation.
//!
//! - Executable code caches with helper and method trampolines
//! - Per-architecture instruction encoders (x86_64, AArch64, Power, s390x)
//! - Call-site decoding and patching without torn writes
//! - Inline caches for interface dispatch
//!
//! Every write to code memory goes through [`patch`].

pub mod aarch64;
pub mod body_builder;
pub mod call_site;
pub mod code_cache;
pub mod codebuf;
pub mod encoder;
pub mod helper_table;
pub mod inline_cache;
pub mod memory;
pub mod patch;
pub mod power;
pub mod s390x;
pub mod trampoline;
pub mod x86_64;

pub use call_site::{
    CallSite, CallSiteKind, CallSitePatcher, PatchOptions, PatchOutcome, PatchRequest,
};
pub use code_cache::{CacheError, CodeCache, CodeCacheManager, CodeRegion};
pub use encoder::{Arch, InstructionEncoder};
pub use patch::{CodeSpace, PatchError};
pub use trampoline::{TrampolineError, TrampolinePool};
