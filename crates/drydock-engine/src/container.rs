// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container lifecycle with bounded waits.
//!
//! Every query goes straight to the runtime; nothing here caches container
//! state. Stop and liveness confirmation poll the runtime on a fixed
//! interval and give up at a deadline instead of hanging a worker forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, StatsSample};

/// How often bounded waits re-check container state.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default deadline for stop confirmation and liveness checks.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resource usage snapshot for one container.
///
/// All-zero with `running = false` when the container is absent or stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    /// CPU usage as a percentage of one core (can exceed 100 on multi-core).
    pub cpu_percent: f64,
    /// Memory usage as a percentage of the container limit.
    pub memory_percent: f64,
    /// Whether the container was running when sampled.
    pub running: bool,
}

/// Creates, starts, stops and removes service containers.
#[derive(Clone)]
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

impl ContainerManager {
    /// Create a manager over `runtime` with the default poll interval.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override how often bounded waits re-check state.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create a container from `spec` without starting it. Returns the
    /// container name as its handle.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.runtime.create_container(spec).await?;
        Ok(spec.name.clone())
    }

    /// Start a previously created container.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.runtime.start_container(name).await?;
        Ok(())
    }

    /// Stop a container and wait for it to actually exit.
    ///
    /// Stopping an absent container is a no-op success. The runtime gets
    /// `timeout` as its kill grace period, then the exit is confirmed by
    /// polling; a container still running at the deadline is
    /// [`Error::Timeout`].
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        match self.runtime.stop_container(name, timeout.as_secs() as i64).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: "stop",
                    container: name.to_string(),
                    waited: timeout,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Wait until a started container reports running.
    ///
    /// Not running by the deadline is [`Error::Timeout`].
    pub async fn wait_running(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running(name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: "liveness",
                    container: name.to_string(),
                    waited: timeout,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Force-remove a container. Removing an absent container is a no-op
    /// success.
    pub async fn remove(&self, name: &str) -> Result<()> {
        match self.runtime.remove_container(name, true).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(container = %name, "Container already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a container with this name exists, running or not.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.runtime.container_state(name).await?.is_some())
    }

    /// Whether the container is currently running. Absent counts as not
    /// running.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .runtime
            .container_state(name)
            .await?
            .map(|state| state.running)
            .unwrap_or(false))
    }

    /// Exit code of the last run. `None` while running or when the container
    /// cannot be found.
    pub async fn exit_code(&self, name: &str) -> Result<Option<i64>> {
        Ok(match self.runtime.container_state(name).await? {
            Some(state) if !state.running => state.exit_code,
            _ => None,
        })
    }

    /// Resource usage for a running container.
    ///
    /// Absent or stopped containers report all-zero stats; missing fields in
    /// the runtime payload count as zero.
    pub async fn stats(&self, name: &str) -> Result<ContainerStats> {
        if !self.is_running(name).await? {
            return Ok(ContainerStats::default());
        }
        let Some(sample) = self.runtime.container_stats(name).await? else {
            return Ok(ContainerStats::default());
        };
        Ok(ContainerStats {
            cpu_percent: cpu_percent(&sample),
            memory_percent: memory_percent(&sample),
            running: true,
        })
    }
}

/// CPU percentage from the delta of two cumulative samples, scaled by the
/// online core count.
fn cpu_percent(sample: &StatsSample) -> f64 {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total);
    let system_delta = sample
        .cpu_system
        .unwrap_or(0)
        .saturating_sub(sample.precpu_system.unwrap_or(0));
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    let cores = sample.online_cpus.unwrap_or(0);
    cpu_delta as f64 / system_delta as f64 * cores as f64 * 100.0
}

fn memory_percent(sample: &StatsSample) -> f64 {
    let usage = sample.memory_usage.unwrap_or(0);
    let limit = sample.memory_limit.unwrap_or(0);
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}
