// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime abstraction.
//!
//! Every image, container and network operation the engine performs goes
//! through [`ContainerRuntime`]. One [`docker::DockerRuntime`] is created at
//! startup and injected as `Arc<dyn ContainerRuntime>` into the managers;
//! [`mock::MockRuntime`] backs the unit and integration tests.

pub mod docker;
pub mod mock;

pub use self::docker::DockerRuntime;
pub use self::mock::MockRuntime;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Container runtime API failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The addressed object does not exist on the runtime.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The runtime daemon cannot be reached.
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    /// Any other runtime API failure.
    #[error("Container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// Whether this is an absence signal rather than a real failure.
    ///
    /// Mutating operations treat absence as already-satisfied: removing a
    /// container that is gone already achieved its goal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether retrying later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the failure is a state conflict (name taken, tag shared,
    /// object already present) rather than a hard API error.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Api(message) => {
                let lower = message.to_lowercase();
                lower.starts_with("409")
                    || lower.contains("conflict")
                    || lower.contains("already exists")
                    || lower.contains("already in use")
            }
            _ => false,
        }
    }
}

/// One event from the image build log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLogChunk {
    /// A line of build output.
    Output(String),
    /// A status/progress message.
    Status(String),
    /// An error reported inside the stream; the build has failed.
    Error(String),
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, unique per service.
    pub name: String,
    /// Image reference (`repository:tag`) to run.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels, including the routing labels for the ingress proxy.
    pub labels: BTreeMap<String, String>,
    /// Volume binds in `name:path:mode` form.
    pub binds: Vec<String>,
    /// Private network to join at creation time, if any.
    pub network: Option<String>,
    /// Port the application listens on inside the container.
    pub target_port: u16,
    /// CPU allowance as a fraction of one vCPU.
    pub max_cpu: f64,
    /// Memory ceiling in megabytes.
    pub memory_mb: i64,
    /// Whether the root filesystem is mounted read-only.
    pub read_only_rootfs: bool,
}

/// Runtime-reported state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    /// Whether the container is currently running.
    pub running: bool,
    /// Exit code of the last run, if the container has exited.
    pub exit_code: Option<i64>,
}

/// One resource-usage sample as reported by the runtime.
///
/// Fields mirror the runtime's stats payload, where almost everything is
/// optional; consumers must treat missing values as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSample {
    /// Cumulative container CPU time at this sample.
    pub cpu_total: u64,
    /// Cumulative system CPU time at this sample.
    pub cpu_system: Option<u64>,
    /// Cumulative container CPU time at the previous sample.
    pub precpu_total: u64,
    /// Cumulative system CPU time at the previous sample.
    pub precpu_system: Option<u64>,
    /// Number of online CPUs.
    pub online_cpus: Option<u64>,
    /// Current memory usage in bytes.
    pub memory_usage: Option<u64>,
    /// Memory limit in bytes.
    pub memory_limit: Option<u64>,
}

/// Summary of one image known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Content-addressed image ID.
    pub id: String,
    /// All `repository:tag` references pointing at this image.
    pub repo_tags: Vec<String>,
    /// Creation time as a unix timestamp.
    pub created: i64,
}

/// The engine's view of the container runtime.
///
/// All mutating calls surface absence as [`RuntimeError::NotFound`] so the
/// managers can decide idempotency; query calls return `Ok(None)`/empty
/// collections instead.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    // ===== Images =====

    /// Start building `image_ref` from an in-memory tar context, returning
    /// the build log stream. The build has succeeded only if the stream ends
    /// without an [`BuildLogChunk::Error`] chunk.
    fn build_image(
        &self,
        image_ref: &str,
        context: Vec<u8>,
    ) -> BoxStream<'static, Result<BuildLogChunk, RuntimeError>>;

    /// Whether `image_ref` exists locally.
    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError>;

    /// All local images whose repository component equals `repository`.
    async fn list_images(&self, repository: &str) -> Result<Vec<ImageInfo>, RuntimeError>;

    /// Remove one image reference.
    async fn remove_image(&self, image_ref: &str, force: bool) -> Result<(), RuntimeError>;

    /// Remove dangling build layers, returning reclaimed bytes.
    async fn prune_dangling_images(&self) -> Result<u64, RuntimeError>;

    // ===== Containers =====

    /// Create a container without starting it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Start a created container.
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Ask the runtime to stop a container, waiting up to `timeout_secs`
    /// before the runtime escalates to SIGKILL.
    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), RuntimeError>;

    /// Remove a container.
    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    /// Inspect a container; `Ok(None)` when it does not exist.
    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// One resource-usage sample; `Ok(None)` when the container does not
    /// exist.
    async fn container_stats(&self, name: &str) -> Result<Option<StatsSample>, RuntimeError>;

    // ===== Networks =====

    /// Create a network. `internal` networks are not internet-routable.
    async fn create_network(
        &self,
        name: &str,
        driver: &str,
        internal: bool,
    ) -> Result<(), RuntimeError>;

    /// Whether a network with this name exists.
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Remove a network.
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of containers currently attached to a network.
    async fn network_containers(&self, name: &str) -> Result<Vec<String>, RuntimeError>;

    /// Attach a container to a network.
    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError>;

    /// Detach a container from a network.
    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError>;
}
