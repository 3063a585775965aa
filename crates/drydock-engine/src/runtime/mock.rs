// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory [`ContainerRuntime`] double for tests.
//!
//! Tracks images, containers and networks like a tiny daemon would, records
//! every call, and lets tests script failures per operation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{
    BuildLogChunk, ContainerRuntime, ContainerSpec, ContainerState, ImageInfo, RuntimeError,
    StatsSample,
};

/// One container held by the mock.
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// The spec the container was created from.
    pub spec: ContainerSpec,
    /// Whether the container is currently running.
    pub running: bool,
    /// Exit code of the last run.
    pub exit_code: Option<i64>,
}

/// One network held by the mock.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    /// Driver the network was created with.
    pub driver: String,
    /// Whether the network was created as internal.
    pub internal: bool,
    /// Containers currently attached.
    pub attached: BTreeSet<String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    fail_once: HashMap<&'static str, VecDeque<RuntimeError>>,
    fail_always: HashMap<&'static str, RuntimeError>,
    images: Vec<ImageInfo>,
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, MockNetwork>,
    stats: HashMap<String, StatsSample>,
    build_chunks: Vec<BuildLogChunk>,
    build_counter: i64,
    dangling_bytes: u64,
    auto_run: bool,
    ignore_stop: bool,
}

/// Scriptable in-memory container runtime.
#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<Mutex<MockState>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// A fresh mock with no images, containers or networks.
    pub fn new() -> Self {
        let state = MockState {
            build_chunks: vec![BuildLogChunk::Output("build ok\n".to_string())],
            auto_run: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self, op: &'static str, detail: String) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("{op} {detail}"));
        if let Some(err) = state.fail_always.get(op) {
            return Err(err.clone());
        }
        if let Some(queue) = state.fail_once.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    // ===== Scripting =====

    /// Fail the next call to `op` with `error`, then behave normally.
    pub fn fail_next(&self, op: &'static str, error: RuntimeError) {
        self.state().fail_once.entry(op).or_default().push_back(error);
    }

    /// Fail every call to `op` with `error` until cleared.
    pub fn fail_always(&self, op: &'static str, error: RuntimeError) {
        self.state().fail_always.insert(op, error);
    }

    /// Remove a sticky failure installed by [`fail_always`](Self::fail_always).
    pub fn clear_failure(&self, op: &'static str) {
        self.state().fail_always.remove(op);
    }

    /// Replace the chunks every build streams. An `Error` chunk makes the
    /// build fail without registering the image.
    pub fn set_build_chunks(&self, chunks: Vec<BuildLogChunk>) {
        self.state().build_chunks = chunks;
    }

    /// When disabled, started containers stay in the not-running state.
    pub fn set_auto_run(&self, auto_run: bool) {
        self.state().auto_run = auto_run;
    }

    /// When enabled, stop requests succeed but leave the container running,
    /// like a process that ignores its termination signal.
    pub fn set_ignore_stop(&self, ignore_stop: bool) {
        self.state().ignore_stop = ignore_stop;
    }

    /// Force the running flag of an existing container.
    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.running = running;
        }
    }

    /// Set the exit code an existing container reports.
    pub fn set_exit_code(&self, name: &str, exit_code: i64) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.exit_code = Some(exit_code);
        }
    }

    /// Script the stats sample reported for a container.
    pub fn set_stats(&self, name: &str, sample: StatsSample) {
        self.state().stats.insert(name.to_string(), sample);
    }

    /// Seed an image without going through a build.
    pub fn add_image(&self, repo_tag: &str, created: i64) {
        self.state().images.push(ImageInfo {
            id: format!("sha256:{repo_tag}"),
            repo_tags: vec![repo_tag.to_string()],
            created,
        });
    }

    /// Bytes the next dangling-image prune reports as reclaimed.
    pub fn set_dangling_bytes(&self, bytes: u64) {
        self.state().dangling_bytes = bytes;
    }

    // ===== Inspection =====

    /// Every call made so far, in order, as `"op detail"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Snapshot of a container, if it exists.
    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state().containers.get(name).cloned()
    }

    /// Snapshot of a network, if it exists.
    pub fn network(&self, name: &str) -> Option<MockNetwork> {
        self.state().networks.get(name).cloned()
    }

    /// All images currently registered.
    pub fn images(&self) -> Vec<ImageInfo> {
        self.state().images.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check("ping", String::new())
    }

    fn build_image(
        &self,
        image_ref: &str,
        _context: Vec<u8>,
    ) -> BoxStream<'static, Result<BuildLogChunk, RuntimeError>> {
        if let Err(err) = self.check("build_image", image_ref.to_string()) {
            return futures::stream::iter(vec![Err(err)]).boxed();
        }
        let mut state = self.state();
        let chunks = state.build_chunks.clone();
        let failed = chunks
            .iter()
            .any(|chunk| matches!(chunk, BuildLogChunk::Error(_)));
        if !failed {
            state.build_counter += 1;
            let created = state.build_counter;
            state.images.push(ImageInfo {
                id: format!("sha256:{image_ref}"),
                repo_tags: vec![image_ref.to_string()],
                created,
            });
        }
        futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        self.check("image_exists", image_ref.to_string())?;
        Ok(self
            .state()
            .images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == image_ref)))
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<ImageInfo>, RuntimeError> {
        self.check("list_images", repository.to_string())?;
        let prefix = format!("{repository}:");
        Ok(self
            .state()
            .images
            .iter()
            .filter(|image| image.repo_tags.iter().any(|tag| tag.starts_with(&prefix)))
            .cloned()
            .collect())
    }

    async fn remove_image(&self, image_ref: &str, force: bool) -> Result<(), RuntimeError> {
        self.check("remove_image", format!("{image_ref} force={force}"))?;
        let mut state = self.state();
        let before = state.images.len();
        state
            .images
            .retain(|image| !image.repo_tags.iter().any(|tag| tag == image_ref));
        if state.images.len() == before {
            return Err(RuntimeError::NotFound(format!("no such image: {image_ref}")));
        }
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<u64, RuntimeError> {
        self.check("prune_dangling_images", String::new())?;
        let mut state = self.state();
        let bytes = state.dangling_bytes;
        state.dangling_bytes = 0;
        Ok(bytes)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.check("create_container", spec.name.clone())?;
        let mut state = self.state();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Api(format!(
                "409: container name {} already in use",
                spec.name
            )));
        }
        if let Some(network) = &spec.network {
            match state.networks.get_mut(network) {
                Some(net) => {
                    net.attached.insert(spec.name.clone());
                }
                None => {
                    return Err(RuntimeError::NotFound(format!(
                        "network {network} not found"
                    )));
                }
            }
        }
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                exit_code: None,
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.check("start_container", name.to_string())?;
        let mut state = self.state();
        let auto_run = state.auto_run;
        match state.containers.get_mut(name) {
            Some(container) => {
                if auto_run {
                    container.running = true;
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such container: {name}"))),
        }
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        self.check("stop_container", format!("{name} t={timeout_secs}"))?;
        let mut state = self.state();
        let ignore_stop = state.ignore_stop;
        match state.containers.get_mut(name) {
            Some(container) => {
                if !ignore_stop {
                    container.running = false;
                    if container.exit_code.is_none() {
                        container.exit_code = Some(0);
                    }
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such container: {name}"))),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        self.check("remove_container", format!("{name} force={force}"))?;
        let mut state = self.state();
        match state.containers.get(name) {
            Some(container) if container.running && !force => Err(RuntimeError::Api(format!(
                "409: cannot remove running container {name}"
            ))),
            Some(_) => {
                state.containers.remove(name);
                for network in state.networks.values_mut() {
                    network.attached.remove(name);
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such container: {name}"))),
        }
    }

    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        self.check("container_state", name.to_string())?;
        Ok(self.state().containers.get(name).map(|c| ContainerState {
            running: c.running,
            exit_code: c.exit_code,
        }))
    }

    async fn container_stats(&self, name: &str) -> Result<Option<StatsSample>, RuntimeError> {
        self.check("container_stats", name.to_string())?;
        let state = self.state();
        if !state.containers.contains_key(name) {
            return Ok(None);
        }
        Ok(Some(
            state.stats.get(name).copied().unwrap_or_default(),
        ))
    }

    async fn create_network(
        &self,
        name: &str,
        driver: &str,
        internal: bool,
    ) -> Result<(), RuntimeError> {
        self.check("create_network", format!("{name} internal={internal}"))?;
        self.state().networks.insert(
            name.to_string(),
            MockNetwork {
                driver: driver.to_string(),
                internal,
                attached: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        self.check("network_exists", name.to_string())?;
        Ok(self.state().networks.contains_key(name))
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.check("remove_network", name.to_string())?;
        if self.state().networks.remove(name).is_none() {
            return Err(RuntimeError::NotFound(format!("no such network: {name}")));
        }
        Ok(())
    }

    async fn network_containers(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        self.check("network_containers", name.to_string())?;
        match self.state().networks.get(name) {
            Some(network) => Ok(network.attached.iter().cloned().collect()),
            None => Err(RuntimeError::NotFound(format!("no such network: {name}"))),
        }
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.check("connect_network", format!("{network} {container}"))?;
        let mut state = self.state();
        if !state.containers.contains_key(container) {
            return Err(RuntimeError::NotFound(format!(
                "no such container: {container}"
            )));
        }
        match state.networks.get_mut(network) {
            Some(net) => {
                net.attached.insert(container.to_string());
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such network: {network}"))),
        }
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        self.check(
            "disconnect_network",
            format!("{network} {container} force={force}"),
        )?;
        let mut state = self.state();
        match state.networks.get_mut(network) {
            Some(net) => {
                if !net.attached.remove(container) {
                    return Err(RuntimeError::Api(format!(
                        "container {container} is not connected to network {network}"
                    )));
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such network: {network}"))),
        }
    }
}
