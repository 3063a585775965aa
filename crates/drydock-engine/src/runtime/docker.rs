// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker implementation of [`ContainerRuntime`] over the bollard client.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{BuildInfo, EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};

use super::{
    BuildLogChunk, ContainerRuntime, ContainerSpec, ContainerState, ImageInfo, RuntimeError,
    StatsSample,
};

/// Fixed CFS scheduler period; quotas are expressed against this base.
const CPU_PERIOD_USECS: i64 = 100_000;

/// The daemon rejects quotas below 1000 microseconds.
const MIN_CPU_QUOTA_USECS: i64 = 1_000;

/// CFS quota for a CPU allowance given as a fraction of one vCPU.
fn cpu_quota_usecs(max_cpu: f64) -> i64 {
    let quota = (max_cpu * CPU_PERIOD_USECS as f64).round() as i64;
    quota.max(MIN_CPU_QUOTA_USECS)
}

fn memory_limit_bytes(memory_mb: i64) -> i64 {
    memory_mb * 1024 * 1024
}

/// Map one build event to a log chunk. Error frames win over everything
/// else; frames carrying none of the known fields are dropped.
fn build_chunk(info: BuildInfo) -> Option<BuildLogChunk> {
    if let Some(error) = info.error {
        let detail = info
            .error_detail
            .and_then(|d| d.message)
            .unwrap_or_default();
        let message = if detail.is_empty() || detail == error {
            error
        } else {
            format!("{error}: {detail}")
        };
        return Some(BuildLogChunk::Error(message));
    }
    if let Some(stream) = info.stream {
        return Some(BuildLogChunk::Output(stream));
    }
    if let Some(status) = info.status {
        let text = match info.progress {
            Some(progress) => format!("{status} {progress}"),
            None => status,
        };
        return Some(BuildLogChunk::Status(text));
    }
    None
}

fn stats_sample(stats: &Stats) -> StatsSample {
    StatsSample {
        cpu_total: stats.cpu_stats.cpu_usage.total_usage,
        cpu_system: stats.cpu_stats.system_cpu_usage,
        precpu_total: stats.precpu_stats.cpu_usage.total_usage,
        precpu_system: stats.precpu_stats.system_cpu_usage,
        online_cpus: stats.cpu_stats.online_cpus,
        memory_usage: stats.memory_stats.usage,
        memory_limit: stats.memory_stats.limit,
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api(format!("{status_code}: {message}")),
            Error::DockerStreamError { error } => RuntimeError::Api(error),
            Error::IOError { err } => RuntimeError::Unavailable(err.to_string()),
            other => {
                let message = other.to_string();
                let lower = message.to_lowercase();
                if lower.contains("connection refused")
                    || lower.contains("no such file or directory")
                    || lower.contains("error trying to connect")
                    || lower.contains("timeout")
                    || lower.contains("timed out")
                {
                    RuntimeError::Unavailable(message)
                } else {
                    RuntimeError::Api(message)
                }
            }
        }
    }
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (unix socket or named pipe).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    fn build_image(
        &self,
        image_ref: &str,
        context: Vec<u8>,
    ) -> BoxStream<'static, Result<BuildLogChunk, RuntimeError>> {
        let options = BuildImageOptions {
            dockerfile: String::from("Dockerfile"),
            t: image_ref.to_string(),
            rm: true,
            ..Default::default()
        };
        let docker = self.docker.clone();
        let (mut tx, rx) = mpsc::channel(64);

        // The bollard stream borrows the client, so a task owns a clone and
        // forwards events; dropping the receiver cancels the forwarder.
        tokio::spawn(async move {
            let mut stream = docker.build_image(options, None, Some(context.into()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(info) => {
                        if let Some(chunk) = build_chunk(info) {
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RuntimeError::from(e))).await;
                        break;
                    }
                }
            }
        });

        rx.boxed()
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image_ref).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() { Ok(false) } else { Err(err) }
            }
        }
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<ImageInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![format!("{repository}:*")]);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(images
            .into_iter()
            .map(|image| ImageInfo {
                id: image.id,
                repo_tags: image.repo_tags,
                created: image.created,
            })
            .collect())
    }

    async fn remove_image(&self, image_ref: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(
                image_ref,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<u64, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let report = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;
        Ok(report.space_reclaimed.unwrap_or(0).max(0) as u64)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let exposed_ports = HashMap::from([(format!("{}/tcp", spec.target_port), HashMap::new())]);

        let host_config = HostConfig {
            cpu_period: Some(CPU_PERIOD_USECS),
            cpu_quota: Some(cpu_quota_usecs(spec.max_cpu)),
            memory: Some(memory_limit_bytes(spec.memory_mb)),
            readonly_rootfs: Some(spec.read_only_rootfs),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(network.clone(), EndpointSettings::default())]),
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304 means the container is already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                Ok(Some(ContainerState {
                    running: state.running.unwrap_or(false),
                    exit_code: state.exit_code,
                }))
            }
            Err(e) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() { Ok(None) } else { Err(err) }
            }
        }
    }

    async fn container_stats(&self, name: &str) -> Result<Option<StatsSample>, RuntimeError> {
        // one_shot would skip the precpu sample the delta math needs.
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(name, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(stats_sample(&stats))),
            Some(Err(e)) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() { Ok(None) } else { Err(err) }
            }
            None => Ok(None),
        }
    }

    async fn create_network(
        &self,
        name: &str,
        driver: &str,
        internal: bool,
    ) -> Result<(), RuntimeError> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: driver.to_string(),
                internal,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() { Ok(false) } else { Err(err) }
            }
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn network_containers(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        let network = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await?;
        let containers = network.containers.unwrap_or_default();
        Ok(containers.into_values().filter_map(|c| c.name).collect())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container,
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        self.docker
            .disconnect_network(network, DisconnectNetworkOptions { container, force })
            .await?;
        Ok(())
    }
}
