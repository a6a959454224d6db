use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::resources::ports::PortMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Preparing,
    Pulling,
    Creating,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Container exited with code 0.
    Done,
    /// Container exited with a non-zero code: the job itself failed.
    ContainerExited,
    /// The platform failed to pull, create or run the container.
    ExecutorError,
    TerminatedByUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Host,
    Bridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Immutable description of what to run, fixed at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub image: String,
    pub container_user: String,
    pub network_mode: NetworkMode,
    /// Number of GPUs to reserve; -1 reserves every free GPU on the host.
    pub gpu_count: i64,
    /// Explicit device assignment dictated by the control plane. Takes
    /// precedence over `gpu_count` when non-empty.
    pub gpu_ids: Vec<String>,
    /// Number of app ports to lease from the pool.
    pub port_count: usize,
    /// Container ports that need a host binding each.
    pub container_ports: Vec<u16>,
    pub mounts: Vec<Mount>,
    /// Memory limit in bytes, 0 for unlimited.
    pub memory: i64,
    /// CPU limit in cores, 0.0 for unlimited.
    pub cpus: f64,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
}

/// Host-side record of one container-backed job. Owned exclusively by
/// `TaskStorage` once added; callers work on copies and persist them through
/// `TaskStorage::update`.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub termination_reason: Option<TerminationReason>,
    pub termination_message: String,
    pub config: TaskConfig,
    pub container_name: String,
    pub container_id: String,
    pub gpu_ids: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub port_registration: String,
    #[serde(skip)]
    pub pull_cancel: Option<CancellationToken>,
}

impl Task {
    pub fn new(config: TaskConfig) -> Self {
        let container_name = format!(
            "dockhand-{}-{}",
            sanitize_name(&config.name),
            Uuid::new_v4().as_simple()
        );
        Task {
            id: config.id.clone(),
            status: TaskStatus::Pending,
            termination_reason: None,
            termination_message: String::new(),
            config,
            container_name,
            container_id: String::new(),
            gpu_ids: Vec::new(),
            ports: Vec::new(),
            port_registration: String::new(),
            pull_cancel: None,
        }
    }

    pub fn set_preparing(&mut self) {
        self.status = TaskStatus::Preparing;
    }

    /// Entering `pulling` attaches the cancellation handle for the in-flight
    /// image pull so terminate can abort it.
    pub fn set_pulling(&mut self, cancel: CancellationToken) {
        self.status = TaskStatus::Pulling;
        self.pull_cancel = Some(cancel);
    }

    pub fn set_creating(&mut self, container_id: String) {
        self.status = TaskStatus::Creating;
        self.pull_cancel = None;
        self.container_id = container_id;
    }

    pub fn set_running(&mut self) {
        self.status = TaskStatus::Running;
    }

    pub fn set_terminated(&mut self, reason: TerminationReason, message: impl Into<String>) {
        self.status = TaskStatus::Terminated;
        self.termination_reason = Some(reason);
        self.termination_message = message.into();
        self.pull_cancel = None;
    }
}

// Docker restricts container names to [a-zA-Z0-9][a-zA-Z0-9_.-]*.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

#[cfg(test)]
pub(crate) fn test_config(id: &str) -> TaskConfig {
    TaskConfig {
        id: id.to_string(),
        name: "job".to_string(),
        image: "ubuntu".to_string(),
        container_user: "root".to_string(),
        network_mode: NetworkMode::Host,
        gpu_count: 0,
        gpu_ids: Vec::new(),
        port_count: 0,
        container_ports: Vec::new(),
        mounts: Vec::new(),
        memory: 0,
        cpus: 0.0,
        env: Vec::new(),
        cmd: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_pending() {
        let task = Task::new(test_config("t1"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.container_name.starts_with("dockhand-job-"));
        assert!(task.pull_cancel.is_none());
    }

    #[test]
    fn pulling_attaches_cancel_and_terminated_clears_it() {
        let mut task = Task::new(test_config("t1"));
        task.set_preparing();
        task.set_pulling(CancellationToken::new());
        assert!(task.pull_cancel.is_some());

        task.set_terminated(TerminationReason::TerminatedByUser, "requested");
        assert!(task.pull_cancel.is_none());
        assert_eq!(task.status, TaskStatus::Terminated);
        assert_eq!(
            task.termination_reason,
            Some(TerminationReason::TerminatedByUser)
        );
        assert_eq!(task.termination_message, "requested");
    }

    #[test]
    fn container_names_are_sanitized() {
        let mut config = test_config("t1");
        config.name = "Test Container #3".to_string();
        let task = Task::new(config);
        assert!(task.container_name.starts_with("dockhand-Test-Container--3-"));
    }
}
