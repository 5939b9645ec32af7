//! Runtime configuration types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::jit::encoder::Arch;
use crate::recomp::Hotness;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseStr(#[from] toml::de::Error),

    #[error("unknown architecture '{0}'")]
    UnknownArch(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Output format for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

/// Invocation or sample counts a body must accumulate at each level before
/// it is recompiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelCounters {
    pub no_opt: i32,
    pub cold: i32,
    pub warm: i32,
    pub hot: i32,
    pub very_hot: i32,
}

impl Default for LevelCounters {
    fn default() -> Self {
        Self {
            no_opt: 250,
            cold: 1000,
            warm: 5000,
            hot: 20000,
            very_hot: 40000,
        }
    }
}

impl LevelCounters {
    /// Count for a body at `level`; 0 for a level with no successor.
    pub fn for_level(&self, level: Hotness) -> i32 {
        match level {
            Hotness::NoOpt => self.no_opt,
            Hotness::Cold => self.cold,
            Hotness::Warm => self.warm,
            Hotness::Hot => self.hot,
            Hotness::VeryHot => self.very_hot,
            Hotness::Scorching => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub enabled: bool,
    /// Record one in every `frequency` events.
    pub frequency: u32,
    /// Events to record before profiling completes.
    pub count: u32,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: 8,
            count: 1000,
        }
    }
}

/// Largest helper table the helper trampolines can index on every
/// architecture.
pub const MAX_HELPERS: usize = 512;

/// Runtime configuration for the recompilation core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Encoder family, or `auto` for the host.
    pub arch: String,
    pub code_cache_size: usize,
    pub max_code_caches: usize,
    pub helper_count: usize,
    pub counters: LevelCounters,
    /// Sampler ticks per density window.
    pub sampling_window: u64,
    /// Samples inside one window that mark a looping body as scorching.
    pub scorching_sample_threshold: u32,
    /// Upper bound on the scheduling back-off exponent.
    pub max_backoff_shift: u32,
    pub queue_capacity: usize,
    pub compile_threads: usize,
    pub profiling: ProfilingConfig,
    pub use_sampling: bool,
    /// Whether the platform supports counting-mode triggers.
    pub counting_supported: bool,
    pub stress_trampolines: bool,
    pub strict_call_site_checks: bool,
    pub power_inline_last_itable: bool,
    pub verbose: bool,
    pub stats_format: StatsFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            arch: "auto".to_string(),
            code_cache_size: 2 * 1024 * 1024,
            max_code_caches: 8,
            helper_count: 8,
            counters: LevelCounters::default(),
            sampling_window: 1000,
            scorching_sample_threshold: 200,
            max_backoff_shift: 6,
            queue_capacity: 256,
            compile_threads: 2,
            profiling: ProfilingConfig::default(),
            use_sampling: true,
            counting_supported: true,
            stress_trampolines: false,
            strict_call_site_checks: cfg!(debug_assertions),
            power_inline_last_itable: false,
            verbose: false,
            stats_format: StatsFormat::Human,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The encoder family to use.
    pub fn target_arch(&self) -> Result<Arch, ConfigError> {
        if self.arch.eq_ignore_ascii_case("auto") {
            return Arch::host()
                .ok_or_else(|| ConfigError::UnknownArch(std::env::consts::ARCH.to_string()));
        }
        self.arch
            .parse()
            .map_err(|_| ConfigError::UnknownArch(self.arch.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_cache_size < 4096 {
            return Err(ConfigError::Invalid(format!(
                "code_cache_size must be at least 4096, got {}",
                self.code_cache_size
            )));
        }
        if self.max_code_caches == 0 {
            return Err(ConfigError::Invalid("max_code_caches must be positive".into()));
        }
        if !(2..=MAX_HELPERS).contains(&self.helper_count) {
            return Err(ConfigError::Invalid(format!(
                "helper_count must be between 2 and {MAX_HELPERS}, got {}",
                self.helper_count
            )));
        }
        if self.sampling_window == 0 {
            return Err(ConfigError::Invalid("sampling_window must be positive".into()));
        }
        if self.queue_capacity == 0 || self.compile_threads == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity and compile_threads must be positive".into(),
            ));
        }
        if self.max_backoff_shift > 16 {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_shift must be at most 16, got {}",
                self.max_backoff_shift
            )));
        }
        if self.arch != "auto" {
            self.target_arch()?;
        }
        Ok(())
    }
}
