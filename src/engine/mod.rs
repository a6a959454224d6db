use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{DeviceMapping, DeviceRequest, HostConfig, PortBinding};
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::tasks::types::NetworkMode;

/// GPU attachment derived from the GpuLock's returned resource ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuAttachment {
    None,
    /// Stable device IDs, attached through the nvidia runtime.
    Nvidia(Vec<String>),
    /// Render-node device paths, mapped into the container directly.
    Amd(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub user: String,
    pub network_mode: NetworkMode,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub binds: Vec<String>,
    pub exposed_ports: HashMap<String, HashMap<(), ()>>,
    pub port_bindings: HashMap<String, Option<Vec<PortBinding>>>,
    pub gpu: GpuAttachment,
    /// Memory limit in bytes, 0 for unlimited.
    pub memory: i64,
    /// CPU limit in cores, 0.0 for unlimited.
    pub cpus: f64,
}

/// The only component touching the container runtime.
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_unix_defaults()?;
        Ok(DockerEngine { client })
    }

    /// Pulls the image only if not already present locally, streaming the
    /// registry download otherwise. Cancelling aborts the pull mid-stream.
    pub async fn pull_if_absent(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        let reference = normalize_reference(image);
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;
        if images
            .iter()
            .any(|img| img.repo_tags.iter().any(|tag| *tag == reference))
        {
            debug!(image = %reference, "image already present, skipping pull");
            return Ok(());
        }

        info!(image = %reference, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Request(format!("pull of {reference} cancelled")));
                }
                msg = stream.next() => match msg {
                    None => break,
                    Some(Ok(progress)) => {
                        if let Some(status) = progress.status {
                            trace!(image = %reference, %status, "pull progress");
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
        info!(image = %reference, "image pulled");
        Ok(())
    }

    /// Creates the container without starting it. Returns the container id.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let config = build_config(spec);
        let response = self.client.create_container(Some(options), config).await?;
        debug!(container = %response.id, name = %spec.name, "container created");
        Ok(response.id)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(Error::from)
    }

    /// Starts the container, first attaching when an output sink is given so
    /// no boot output is missed; combined stdout/stderr is multiplexed into
    /// the single sink.
    pub async fn run(&self, id: &str, output: Option<mpsc::UnboundedSender<Vec<u8>>>) -> Result<()> {
        if let Some(tx) = output {
            let results = self
                .client
                .attach_container(
                    id,
                    Some(AttachContainerOptions::<String> {
                        stdout: Some(true),
                        stderr: Some(true),
                        stream: Some(true),
                        logs: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            let mut stream = results.output;
            let container = id.to_string();
            tokio::spawn(async move {
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(chunk) => {
                            if tx.send(chunk.into_bytes().to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(container = %container, error = %e, "attach stream closed");
                            break;
                        }
                    }
                }
            });
        }
        self.start(id).await
    }

    /// Blocks until the container exits. A non-zero exit code is surfaced as
    /// `ContainerExited` so callers can distinguish a failed job from a
    /// platform failure. On clean exit the container is removed.
    pub async fn wait(&self, id: &str) -> Result<()> {
        let mut stream = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(_)) => {
                self.remove(id).await;
                Ok(())
            }
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Err(Error::ContainerExited { code })
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Internal(format!(
                "wait stream for container {id} ended without a response"
            ))),
        }
    }

    /// Graceful stop with a bounded wait, then removal. Idempotent against
    /// an already-removed container: failures are logged, not raised.
    pub async fn stop(&self, id: &str, grace_secs: i64) {
        if let Err(e) = self
            .client
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
        {
            warn!(container = %id, error = %e, "stop failed, container may already be gone");
        }
        self.remove(id).await;
    }

    /// Immediate kill, then removal. Same best-effort semantics as `stop`.
    pub async fn force_stop(&self, id: &str) {
        if let Err(e) = self
            .client
            .kill_container::<String>(id, None)
            .await
        {
            warn!(container = %id, error = %e, "kill failed, container may already be gone");
        }
        self.remove(id).await;
    }

    async fn remove(&self, id: &str) {
        if let Err(e) = self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %id, error = %e, "remove failed, container may already be gone");
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }
}

fn normalize_reference(image: &str) -> String {
    // "ubuntu" and "ubuntu:latest" are the same image to the local store.
    let name_part = image.rsplit('/').next().unwrap_or(image);
    if name_part.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    // Host networking only exists on Linux; everywhere else the runtime
    // falls back to bridge and port bindings.
    let host_networking = cfg!(target_os = "linux") && spec.network_mode == NetworkMode::Host;

    let mut host_config = HostConfig {
        network_mode: Some(if host_networking { "host" } else { "bridge" }.to_string()),
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        memory: (spec.memory > 0).then_some(spec.memory),
        nano_cpus: (spec.cpus > 0.0).then_some((spec.cpus * 1_000_000_000.0) as i64),
        ..Default::default()
    };
    if !host_networking && !spec.port_bindings.is_empty() {
        host_config.port_bindings = Some(spec.port_bindings.clone());
    }

    match &spec.gpu {
        GpuAttachment::None => {}
        GpuAttachment::Nvidia(ids) => {
            host_config.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(ids.clone()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        }
        GpuAttachment::Amd(render_nodes) => {
            let mut devices: Vec<DeviceMapping> = render_nodes
                .iter()
                .map(|path| DeviceMapping {
                    path_on_host: Some(path.clone()),
                    path_in_container: Some(path.clone()),
                    cgroup_permissions: Some("rwm".to_string()),
                })
                .collect();
            // ROCm userspace needs the compute interface alongside the
            // render nodes.
            devices.push(DeviceMapping {
                path_on_host: Some("/dev/kfd".to_string()),
                path_in_container: Some("/dev/kfd".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            });
            host_config.devices = Some(devices);
        }
    }

    Config {
        image: Some(spec.image.clone()),
        user: (!spec.user.is_empty()).then(|| spec.user.clone()),
        env: Some(spec.env.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        exposed_ports: (!host_networking && !spec.exposed_ports.is_empty())
            .then(|| spec.exposed_ports.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> ContainerSpec {
        ContainerSpec {
            name: "dockhand-test".to_string(),
            image: "ubuntu:24.04".to_string(),
            user: "root".to_string(),
            network_mode: NetworkMode::Bridge,
            env: vec!["A=1".to_string()],
            cmd: Vec::new(),
            binds: Vec::new(),
            exposed_ports: HashMap::new(),
            port_bindings: HashMap::new(),
            gpu: GpuAttachment::None,
            memory: 0,
            cpus: 0.0,
        }
    }

    #[test]
    fn normalize_adds_latest_tag() {
        assert_eq!(normalize_reference("ubuntu"), "ubuntu:latest");
        assert_eq!(normalize_reference("ubuntu:24.04"), "ubuntu:24.04");
        assert_eq!(
            normalize_reference("registry:5000/team/app"),
            "registry:5000/team/app:latest"
        );
    }

    #[test]
    fn bridge_config_carries_port_bindings() {
        let mut spec = base_spec();
        spec.exposed_ports.insert("80/tcp".to_string(), HashMap::new());
        spec.port_bindings.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("30000".to_string()),
            }]),
        );
        let config = build_config(&spec);
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.network_mode.as_deref(), Some("bridge"));
        assert!(host_config.port_bindings.is_some());
        assert!(config.exposed_ports.is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_networking_skips_port_bindings() {
        let mut spec = base_spec();
        spec.network_mode = NetworkMode::Host;
        spec.port_bindings.insert("80/tcp".to_string(), None);
        let config = build_config(&spec);
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.network_mode.as_deref(), Some("host"));
        assert!(host_config.port_bindings.is_none());
        assert!(config.exposed_ports.is_none());
    }

    #[test]
    fn nvidia_attachment_uses_device_requests() {
        let mut spec = base_spec();
        spec.gpu = GpuAttachment::Nvidia(vec!["GPU-f00d".to_string()]);
        let host_config = build_config(&spec).host_config.unwrap();
        let requests = host_config.device_requests.unwrap();
        assert_eq!(requests[0].driver.as_deref(), Some("nvidia"));
        assert_eq!(
            requests[0].device_ids.as_ref().unwrap(),
            &vec!["GPU-f00d".to_string()]
        );
        assert!(host_config.devices.is_none());
    }

    #[test]
    fn amd_attachment_maps_render_nodes_and_kfd() {
        let mut spec = base_spec();
        spec.gpu = GpuAttachment::Amd(vec!["/dev/dri/renderD128".to_string()]);
        let host_config = build_config(&spec).host_config.unwrap();
        let devices = host_config.devices.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[0].path_on_host.as_deref(),
            Some("/dev/dri/renderD128")
        );
        assert_eq!(devices[1].path_on_host.as_deref(), Some("/dev/kfd"));
        assert!(host_config.device_requests.is_none());
    }

    #[test]
    fn resource_limits_only_set_when_positive() {
        let mut spec = base_spec();
        let host_config = build_config(&spec).host_config.unwrap();
        assert!(host_config.memory.is_none());
        assert!(host_config.nano_cpus.is_none());

        spec.memory = 512 * 1024 * 1024;
        spec.cpus = 1.5;
        let host_config = build_config(&spec).host_config.unwrap();
        assert_eq!(host_config.memory, Some(512 * 1024 * 1024));
        assert_eq!(host_config.nano_cpus, Some(1_500_000_000));
    }
}
