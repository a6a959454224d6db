use std::collections::HashMap;
use std::sync::Arc;

use sysinfo::System;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{HealthcheckResponse, get_stats};
use crate::engine::{ContainerSpec, DockerEngine, GpuAttachment};
use crate::error::{Error, Result};
use crate::resources::gpu::{GpuLock, GpuVendor};
use crate::resources::ports::PortAllocator;
use crate::tasks::storage::TaskStorage;
use crate::tasks::types::{Task, TaskConfig, TaskStatus, TerminationReason};

/// Host-side supervisor: composes TaskStorage, GpuLock, PortAllocator and
/// the container engine to submit, run, terminate and remove tasks. GpuLock
/// and PortAllocator are process-wide singletons owned here; all access goes
/// through their public operations.
pub struct Shim {
    pub storage: TaskStorage,
    gpus: GpuLock,
    ports: PortAllocator,
    engine: DockerEngine,
    stop_grace_secs: i64,
    /// Handles of detached per-task runs, so nothing outlives the shim.
    runs: Mutex<HashMap<String, JoinHandle<()>>>,
    system: Mutex<System>,
}

impl Shim {
    pub fn new(
        gpus: GpuLock,
        ports: PortAllocator,
        engine: DockerEngine,
        stop_grace_secs: i64,
    ) -> Self {
        Shim {
            storage: TaskStorage::new(),
            gpus,
            ports,
            engine,
            stop_grace_secs,
            runs: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new_all()),
        }
    }

    /// Reserves GPUs and ports, then registers the task. A duplicate ID or
    /// any reservation failure rolls back whatever was already reserved
    /// before returning.
    pub async fn submit(&self, config: TaskConfig) -> Result<Task> {
        let gpu_ids = if !config.gpu_ids.is_empty() {
            let locked = self.gpus.lock(&config.gpu_ids).await;
            if locked.len() != config.gpu_ids.len() {
                self.gpus.release(&locked).await;
                return Err(Error::Request(format!(
                    "requested gpus {:?} are not all available",
                    config.gpu_ids
                )));
            }
            locked
        } else if config.gpu_count != 0 {
            self.gpus.acquire(config.gpu_count).await?
        } else {
            Vec::new()
        };

        let registration = match self
            .ports
            .register(config.port_count, &config.container_ports)
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                self.gpus.release(&gpu_ids).await;
                return Err(e);
            }
        };

        let mut task = Task::new(config);
        task.gpu_ids = gpu_ids.clone();
        task.ports = self.ports.ports(&registration).await;
        task.port_registration = registration.clone();

        if !self.storage.add(task.clone()).await {
            self.gpus.release(&gpu_ids).await;
            self.ports.unregister(&registration).await;
            return Err(Error::Request(format!("task {} already exists", task.id)));
        }

        info!(task = %task.id, image = %task.config.image, "task submitted");
        Ok(task)
    }

    /// Launches the task lifecycle as a detached unit of work and keeps its
    /// handle. The submit handler returns long before this completes.
    pub async fn spawn_run(self: &Arc<Self>, id: &str) {
        let shim = Arc::clone(self);
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = shim.drive_run(&task_id).await {
                shim.record_failure(&task_id, &e).await;
            }
        });
        self.runs.lock().await.insert(id.to_string(), handle);
    }

    async fn drive_run(&self, id: &str) -> Result<()> {
        let mut task = self.storage.get(id).await.ok_or(Error::NotFound)?;

        task.set_preparing();
        self.storage.update(task.clone()).await?;

        let cancel = CancellationToken::new();
        task.set_pulling(cancel.clone());
        self.storage.update(task.clone()).await?;
        self.engine
            .pull_if_absent(&task.config.image, &cancel)
            .await?;

        let spec = self.container_spec(&task).await;
        let container_id = self.engine.create(&spec).await?;
        task.set_creating(container_id.clone());
        self.storage.update(task.clone()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let log_id = id.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let text = String::from_utf8_lossy(&chunk);
                debug!(task = %log_id, output = %text.trim_end(), "container output");
            }
        });
        self.engine.run(&container_id, Some(tx)).await?;
        task.set_running();
        self.storage.update(task.clone()).await?;
        info!(task = %id, container = %container_id, "task running");

        match self.engine.wait(&container_id).await {
            Ok(()) => {
                self.finish(id, TerminationReason::Done, "exit code 0".to_string())
                    .await
            }
            Err(Error::ContainerExited { code }) => {
                self.engine.force_stop(&container_id).await;
                self.finish(
                    id,
                    TerminationReason::ContainerExited,
                    format!("exit code {code}"),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Records the terminal status after a successful wait, unless an
    /// externally requested terminate already recorded one.
    async fn finish(&self, id: &str, reason: TerminationReason, message: String) -> Result<()> {
        let Some(mut task) = self.storage.get(id).await else {
            return Ok(());
        };
        if task.status == TaskStatus::Terminated {
            return Ok(());
        }
        info!(task = %id, ?reason, %message, "task finished");
        task.set_terminated(reason, message);
        self.storage.update(task).await?;
        Ok(())
    }

    /// A failure during the detached run moves the task straight to
    /// terminated rather than leaving it stuck mid-lifecycle.
    async fn record_failure(&self, id: &str, err: &Error) {
        warn!(task = %id, error = %err, "task run failed");
        let Some(mut task) = self.storage.get(id).await else {
            return;
        };
        if task.status == TaskStatus::Terminated {
            return;
        }
        if !task.container_id.is_empty() {
            self.engine.force_stop(&task.container_id).await;
        }
        task.set_terminated(TerminationReason::ExecutorError, err.to_string());
        if let Err(e) = self.storage.update(task).await {
            debug!(task = %id, error = %e, "terminal status lost a transition race");
        }
    }

    async fn container_spec(&self, task: &Task) -> ContainerSpec {
        let gpu = match (self.gpus.vendor(), task.gpu_ids.is_empty()) {
            (_, true) | (None, _) => GpuAttachment::None,
            (Some(GpuVendor::Nvidia), false) => GpuAttachment::Nvidia(task.gpu_ids.clone()),
            (Some(GpuVendor::Amd), false) => GpuAttachment::Amd(task.gpu_ids.clone()),
        };
        let binds = task
            .config
            .mounts
            .iter()
            .map(|m| {
                let suffix = if m.read_only { ":ro" } else { "" };
                format!("{}:{}{}", m.host_path, m.container_path, suffix)
            })
            .collect();
        ContainerSpec {
            name: task.container_name.clone(),
            image: task.config.image.clone(),
            user: task.config.container_user.clone(),
            network_mode: task.config.network_mode,
            env: task.config.env.clone(),
            cmd: task.config.cmd.clone(),
            binds,
            exposed_ports: self.ports.exposed_ports(&task.port_registration).await,
            port_bindings: self.ports.port_bindings(&task.port_registration).await,
            gpu,
            memory: task.config.memory,
            cpus: task.config.cpus,
        }
    }

    /// Requests graceful shutdown of the task: aborts an in-flight pull,
    /// stops the container within the grace period, records the terminal
    /// status with the caller's reason.
    pub async fn terminate(
        &self,
        id: &str,
        timeout: Option<u64>,
        reason: Option<TerminationReason>,
        message: String,
    ) -> Result<()> {
        let task = self.storage.get(id).await.ok_or(Error::NotFound)?;
        if task.status == TaskStatus::Terminated {
            return Err(Error::Request(format!("task {id} already terminated")));
        }

        if let Some(cancel) = &task.pull_cancel {
            cancel.cancel();
        }
        if !task.container_id.is_empty() {
            match timeout {
                Some(0) => self.engine.force_stop(&task.container_id).await,
                Some(secs) => self.engine.stop(&task.container_id, secs as i64).await,
                None => self.engine.stop(&task.container_id, self.stop_grace_secs).await,
            }
        }

        let mut task = self.storage.get(id).await.ok_or(Error::NotFound)?;
        task.set_terminated(
            reason.unwrap_or(TerminationReason::TerminatedByUser),
            message,
        );
        self.storage.update(task).await?;
        info!(task = %id, "task terminated");
        Ok(())
    }

    /// Releases the task's GPUs and ports and deletes the record. Only valid
    /// once the task is terminal; resources are never released while the
    /// container could still be running.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let task = self.storage.get(id).await.ok_or(Error::NotFound)?;
        if task.status != TaskStatus::Terminated {
            return Err(Error::Request(format!(
                "task {id} is {:?}, remove requires terminated",
                task.status
            )));
        }

        if let Some(handle) = self.runs.lock().await.remove(id) {
            handle.abort();
        }
        self.gpus.release(&task.gpu_ids).await;
        if !task.port_registration.is_empty() {
            self.ports.unregister(&task.port_registration).await;
        }
        self.storage.delete(id).await;
        info!(task = %id, "task removed");
        Ok(())
    }

    pub async fn healthcheck(&self) -> HealthcheckResponse {
        let task_count = self.storage.count().await;
        let docker = self.engine.ping().await.is_ok();
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();
        HealthcheckResponse {
            status: "ok",
            service: "dockhand-shim",
            version: env!("CARGO_PKG_VERSION"),
            docker,
            stats: get_stats(&system, task_count),
        }
    }

    /// Aborts and reaps every detached run so no worker outlives the shim.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.runs.lock().await.drain().collect();
        for (id, handle) in handles {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(task = %id, error = %e, "run handle failed during shutdown");
                }
            }
        }
    }
}
