use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime switches for planning and search.
///
/// Defaults enable every strategy family. `from_env` lets a deployment turn
/// single families off without a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub enable_direct: bool,
    pub enable_precompiled_binaries: bool,
    pub enable_gemm: bool,
    pub perf_db_path: PathBuf,
    pub sync_timeout: Duration,
}

pub const ENV_DEBUG_CONV_DIRECT: &str = "CONVPLAN_DEBUG_CONV_DIRECT";
pub const ENV_DEBUG_PRECOMPILED_BINARIES: &str = "CONVPLAN_DEBUG_PRECOMPILED_BINARIES";
pub const ENV_DEBUG_CONV_GEMM: &str = "CONVPLAN_DEBUG_CONV_GEMM";
pub const ENV_PERF_DB: &str = "CONVPLAN_PERF_DB";
pub const ENV_SYNC_TIMEOUT_MS: &str = "CONVPLAN_SYNC_TIMEOUT_MS";

impl PlannerConfig {
    pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 60_000;

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let flag = |key: &str, default: bool| match lookup(key) {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                log::warn!("ignoring {}={:?}, expected a boolean", key, raw);
                default
            }),
            None => default,
        };
        cfg.enable_direct = flag(ENV_DEBUG_CONV_DIRECT, cfg.enable_direct);
        cfg.enable_precompiled_binaries = flag(ENV_DEBUG_PRECOMPILED_BINARIES, cfg.enable_precompiled_binaries);
        cfg.enable_gemm = flag(ENV_DEBUG_CONV_GEMM, cfg.enable_gemm);
        if let Some(path) = lookup(ENV_PERF_DB).filter(|p| !p.trim().is_empty()) {
            cfg.perf_db_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup(ENV_SYNC_TIMEOUT_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            if ms > 0 {
                cfg.sync_timeout = Duration::from_millis(ms);
            }
        }
        cfg
    }

    /// GEMM planning needs both the runtime switch and the `gemm` feature.
    pub fn gemm_enabled(&self) -> bool {
        cfg!(feature = "gemm") && self.enable_gemm
    }

    pub fn with_perf_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_db_path = path.into();
        self
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_direct: true,
            enable_precompiled_binaries: true,
            enable_gemm: true,
            perf_db_path: default_perf_db_path(),
            sync_timeout: Duration::from_millis(Self::DEFAULT_SYNC_TIMEOUT_MS),
        }
    }
}

fn default_perf_db_path() -> PathBuf {
    let mut path = if let Ok(home) = std::env::var("USERPROFILE") {
        PathBuf::from(home)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
    } else {
        PathBuf::from(".")
    };
    path.push(".convplan");
    path.push("perf_db.jsonl");
    path
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
