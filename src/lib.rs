//! tierswap - tiered recompilation and call-site patching.
//!
//! The [`recomp`] controller decides when a compiled method body should be
//! replaced by a more optimized one; the [`jit`] layer installs the new body
//! by rewriting call sites, trampolines and entry slots while other threads
//! keep running the old code.

pub mod config;
pub mod jit;
pub mod recomp;
pub mod stats;

pub use config::{ConfigError, RuntimeConfig};
pub use jit::{Arch, CallSitePatcher, CodeCacheManager};
pub use recomp::{Hotness, MethodId, RecompilationController};
pub use stats::{RuntimeStatistics, StatsSnapshot};
