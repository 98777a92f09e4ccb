//! Service configuration
//!
//! Every flag can also come from an `EVALRUNNER_*` environment variable, which
//! in turn may be set from a `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

/// Which programs share one admission ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConcurrencyScope {
    /// One ceiling across every batch served by the process
    #[default]
    Global,
    /// A fresh ceiling for each batch request
    PerRequest,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "evalrunner", version, about = "Batch code execution service")]
pub struct Config {
    /// Host to listen on
    #[arg(long, env = "EVALRUNNER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "EVALRUNNER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Maximum number of programs running at once
    #[arg(long, env = "EVALRUNNER_MAX_CONCURRENT_EVALUATIONS", default_value_t = 16)]
    pub max_concurrent_evaluations: usize,

    /// Ceiling applied to per-program timeouts
    #[arg(long, env = "EVALRUNNER_MAX_TIMEOUT_SECS", default_value_t = 60.0)]
    pub max_timeout_secs: f64,

    /// Address-space limit per program in MiB (0 disables)
    #[arg(long, env = "EVALRUNNER_MAX_MEMORY_MB", default_value_t = 0)]
    pub max_memory_mb: u64,

    #[arg(
        long,
        env = "EVALRUNNER_CONCURRENCY_SCOPE",
        value_enum,
        default_value_t = ConcurrencyScope::Global
    )]
    pub concurrency_scope: ConcurrencyScope,

    /// Time between SIGTERM and SIGKILL when stopping a program
    #[arg(long, env = "EVALRUNNER_KILL_GRACE_MS", default_value_t = 1000)]
    pub kill_grace_ms: u64,

    /// Bytes kept per output stream
    #[arg(long, env = "EVALRUNNER_MAX_OUTPUT_BYTES", default_value_t = 1024 * 1024)]
    pub max_output_bytes: usize,

    /// Largest accepted batch
    #[arg(long, env = "EVALRUNNER_MAX_BATCH_SIZE", default_value_t = 1024)]
    pub max_batch_size: usize,

    /// How long in-flight batches may run after a shutdown signal
    #[arg(long, env = "EVALRUNNER_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Runtime table (TOML); the built-in table is used when unset
    #[arg(long, env = "EVALRUNNER_RUNTIMES_CONFIG")]
    pub runtimes_config: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_evaluations == 0 {
            bail!("max-concurrent-evaluations must be at least 1");
        }
        if !self.max_timeout_secs.is_finite() || self.max_timeout_secs <= 0.0 {
            bail!(
                "max-timeout-secs must be a positive number, got {}",
                self.max_timeout_secs
            );
        }
        if Duration::try_from_secs_f64(self.max_timeout_secs).is_err() {
            bail!("max-timeout-secs is too large: {}", self.max_timeout_secs);
        }
        if self.max_batch_size == 0 {
            bail!("max-batch-size must be at least 1");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
