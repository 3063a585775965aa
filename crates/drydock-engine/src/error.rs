// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drydock-engine.

use std::time::Duration;

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Archive conversion failed.
    #[error("Archive error: {0}")]
    Archive(#[from] crate::archive::ArchiveError),

    /// Entrypoint detection failed.
    #[error("Detection error: {0}")]
    Detect(#[from] crate::detect::DetectError),

    /// Image build or removal failed.
    #[error("Build error: {0}")]
    Build(#[from] crate::image::BuildError),

    /// Container runtime API call failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] drydock_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bounded wait ran out before the runtime reached the expected state.
    #[error("Timed out waiting for {operation} on {container} after {waited:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// Container the wait was polling.
        container: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;
