// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for drydock-engine.

use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the drydock schema
    pub database_url: String,
    /// Number of task workers consuming the deploy/stop queue
    pub workers: usize,
    /// Prefix for container and image names derived from service names
    pub container_prefix: String,
    /// Name of the shared ingress network the reverse proxy lives on
    pub ingress_network: String,
    /// Root domain under which deployed services are routed
    pub root_domain: String,
    /// Reverse-proxy entrypoint the published routes attach to
    pub proxy_entrypoint: String,
    /// Whether containers get a read-only root filesystem
    pub read_only_rootfs: bool,
    /// Upload size ceiling for deploy archives, in bytes
    pub max_archive_bytes: u64,
    /// Uncompressed build-context ceiling, in bytes
    pub max_context_bytes: u64,
    /// How long to wait for a started container to stay running
    pub liveness_timeout: Duration,
    /// How long to wait for a container to stop before giving up
    pub stop_timeout: Duration,
    /// Interval between liveness/stop polls
    pub poll_interval: Duration,
    /// Interval between reconciliation sweeps
    pub reconcile_interval: Duration,
    /// How long a claimed task stays invisible before re-delivery
    pub task_visibility: Duration,
    /// Delivery ceiling after which a task is parked as failed
    pub max_task_attempts: i32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DRYDOCK_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("DRYDOCK_DATABASE_URL or DATABASE_URL"))?;

        let workers: usize = std::env::var("DRYDOCK_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_WORKERS"))?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue("DRYDOCK_WORKERS"));
        }

        let container_prefix =
            std::env::var("DRYDOCK_CONTAINER_PREFIX").unwrap_or_else(|_| "dd".to_string());

        let ingress_network = std::env::var("DRYDOCK_INGRESS_NETWORK")
            .unwrap_or_else(|_| "drydock-ingress".to_string());

        let root_domain =
            std::env::var("DRYDOCK_ROOT_DOMAIN").unwrap_or_else(|_| "local".to_string());

        let proxy_entrypoint =
            std::env::var("DRYDOCK_PROXY_ENTRYPOINT").unwrap_or_else(|_| "web".to_string());

        let read_only_rootfs = std::env::var("DRYDOCK_READ_ONLY_ROOTFS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let max_archive_mb: u64 = std::env::var("DRYDOCK_MAX_ARCHIVE_MB")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_MAX_ARCHIVE_MB"))?;

        let max_context_mb: u64 = std::env::var("DRYDOCK_MAX_CONTEXT_MB")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_MAX_CONTEXT_MB"))?;

        let liveness_timeout_secs: u64 = std::env::var("DRYDOCK_LIVENESS_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_LIVENESS_TIMEOUT_SECS"))?;

        let stop_timeout_secs: u64 = std::env::var("DRYDOCK_STOP_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_STOP_TIMEOUT_SECS"))?;

        let poll_interval_ms: u64 = std::env::var("DRYDOCK_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_POLL_INTERVAL_MS"))?;

        let reconcile_interval_secs: u64 = std::env::var("DRYDOCK_RECONCILE_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_RECONCILE_INTERVAL_SECS"))?;

        let task_visibility_secs: u64 = std::env::var("DRYDOCK_TASK_VISIBILITY_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_TASK_VISIBILITY_SECS"))?;

        let max_task_attempts: i32 = std::env::var("DRYDOCK_MAX_TASK_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DRYDOCK_MAX_TASK_ATTEMPTS"))?;

        Ok(Self {
            database_url,
            workers,
            container_prefix,
            ingress_network,
            root_domain,
            proxy_entrypoint,
            read_only_rootfs,
            max_archive_bytes: max_archive_mb * 1024 * 1024,
            max_context_bytes: max_context_mb * 1024 * 1024,
            liveness_timeout: Duration::from_secs(liveness_timeout_secs),
            stop_timeout: Duration::from_secs(stop_timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
            reconcile_interval: Duration::from_secs(reconcile_interval_secs),
            task_visibility: Duration::from_secs(task_visibility_secs),
            max_task_attempts,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/drydock_test".to_string(),
        workers: 2,
        container_prefix: "dd".to_string(),
        ingress_network: "drydock-ingress".to_string(),
        root_domain: "local".to_string(),
        proxy_entrypoint: "web".to_string(),
        read_only_rootfs: true,
        max_archive_bytes: 10 * 1024 * 1024,
        max_context_bytes: 500 * 1024 * 1024,
        liveness_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        reconcile_interval: Duration::from_secs(30),
        task_visibility: Duration::from_secs(900),
        max_task_attempts: 3,
    }
}
