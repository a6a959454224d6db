use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{Error, Result};
use crate::resources::ports::PortMapping;
use crate::tasks::types::{Mount, NetworkMode, Task, TaskConfig, TaskStatus, TerminationReason};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitTaskRequest {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub container_user: String,
    #[serde(default)]
    pub network_mode: Option<NetworkMode>,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
    #[serde(default)]
    pub port_count: usize,
    #[serde(default)]
    pub container_ports: Vec<u16>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
}

impl SubmitTaskRequest {
    /// Validates required fields and applies defaults: an unspecified
    /// container user runs as root, an unspecified network mode is host.
    pub fn into_config(self) -> Result<TaskConfig> {
        if self.id.is_empty() {
            return Err(Error::BadRequest("id must not be empty".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::BadRequest("name must not be empty".to_string()));
        }
        if self.image.is_empty() {
            return Err(Error::BadRequest("image must not be empty".to_string()));
        }
        if self.gpu_count < -1 {
            return Err(Error::BadRequest(format!(
                "gpu_count must be >= -1, got {}",
                self.gpu_count
            )));
        }
        Ok(TaskConfig {
            id: self.id,
            name: self.name,
            image: self.image,
            container_user: if self.container_user.is_empty() {
                "root".to_string()
            } else {
                self.container_user
            },
            network_mode: self.network_mode.unwrap_or(NetworkMode::Host),
            gpu_count: self.gpu_count,
            gpu_ids: self.gpu_ids,
            port_count: self.port_count,
            container_ports: self.container_ports,
            mounts: self.mounts,
            memory: self.memory,
            cpus: self.cpus,
            env: self.env,
            cmd: self.cmd,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminateTaskRequest {
    /// Container stop grace period, seconds. Zero forces an immediate kill.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
    #[serde(default)]
    pub termination_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: TaskStatus,
    pub termination_reason: Option<TerminationReason>,
    pub termination_message: String,
    pub container_name: String,
    pub container_id: String,
    pub gpu_ids: Vec<String>,
    pub ports: Vec<PortMapping>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        TaskSummary {
            id: task.id.clone(),
            name: task.config.name.clone(),
            status: task.status,
        }
    }
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        TaskInfo {
            id: task.id.clone(),
            name: task.config.name.clone(),
            image: task.config.image.clone(),
            status: task.status,
            termination_reason: task.termination_reason,
            termination_message: task.termination_message.clone(),
            container_name: task.container_name.clone(),
            container_id: task.container_id.clone(),
            gpu_ids: task.gpu_ids.clone(),
            ports: task.ports.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub cpu_usage: f32,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub total_cpus: usize,
    pub hostname: String,
    pub task_count: usize,
}

pub fn get_stats(system: &System, task_count: usize) -> SystemStats {
    SystemStats {
        cpu_usage: (system.global_cpu_usage() * 100.0).round() / 100.0,
        total_memory_mb: system.total_memory() / 1024 / 1024,
        used_memory_mb: system.used_memory() / 1024 / 1024,
        total_cpus: system.cpus().len(),
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        task_count,
    }
}

#[derive(Debug, Serialize)]
pub struct HealthcheckResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// Whether the container runtime answered a ping.
    pub docker: bool,
    pub stats: SystemStats,
}
