use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resources::gpu::GpuInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    Range,
    Ephemeral,
}

#[derive(Debug, Clone)]
pub struct ShimConfig {
    pub listen: String,
    pub port_policy: PortPolicy,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Grace period handed to container stop during terminate, seconds.
    pub stop_grace_secs: i64,
    /// Host GPU inventory, supplied by the external probe. Read from the
    /// `DOCKHAND_GPUS` JSON env payload.
    pub gpus: Vec<GpuInfo>,
}

impl ShimConfig {
    pub fn from_env() -> Result<Self> {
        let port_policy = match std::env::var("DOCKHAND_PORT_POLICY").as_deref() {
            Err(_) | Ok("range") => PortPolicy::Range,
            Ok("ephemeral") => PortPolicy::Ephemeral,
            Ok(other) => {
                return Err(Error::Internal(format!(
                    "invalid DOCKHAND_PORT_POLICY {other:?}, expected \"range\" or \"ephemeral\""
                )));
            }
        };
        let gpus = match std::env::var("DOCKHAND_GPUS") {
            Err(_) => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Internal(format!("invalid DOCKHAND_GPUS: {e}")))?,
        };
        Ok(ShimConfig {
            listen: env_or("DOCKHAND_SHIM_ADDR", "0.0.0.0:10000".to_string())?,
            port_policy,
            port_range_start: env_or("DOCKHAND_PORT_RANGE_START", 30000)?,
            port_range_end: env_or("DOCKHAND_PORT_RANGE_END", 30128)?,
            stop_grace_secs: env_or("DOCKHAND_STOP_GRACE_SECS", 10)?,
            gpus,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub listen: String,
    /// Where `upload_code` lands the job payload.
    pub code_path: PathBuf,
    /// Upper bound on the `upload_code` body, bytes.
    pub max_code_size: usize,
    /// How long to wait for a job submission before giving up.
    pub submit_timeout: Duration,
    /// Upper bound on the whole job run; longer jobs are stopped.
    pub logs_timeout: Duration,
    /// Bound on each post-completion wait: job stop, pull drain, WS drain.
    pub drain_timeout: Duration,
    /// Backoff used by pollers when they are caught up.
    pub ws_poll_interval: Duration,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(RunnerConfig {
            listen: env_or("DOCKHAND_RUNNER_ADDR", "0.0.0.0:10999".to_string())?,
            code_path: PathBuf::from(env_or(
                "DOCKHAND_CODE_PATH",
                "/tmp/dockhand/code".to_string(),
            )?),
            max_code_size: env_or("DOCKHAND_MAX_CODE_SIZE", 32 * 1024 * 1024)?,
            submit_timeout: Duration::from_secs(env_or("DOCKHAND_SUBMIT_TIMEOUT_SECS", 120)?),
            logs_timeout: Duration::from_secs(env_or("DOCKHAND_LOGS_TIMEOUT_SECS", 3600)?),
            drain_timeout: Duration::from_secs(env_or("DOCKHAND_DRAIN_TIMEOUT_SECS", 30)?),
            ws_poll_interval: Duration::from_millis(env_or("DOCKHAND_WS_POLL_MS", 200)?),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Internal(format!("invalid {key}: {e}"))),
    }
}
