// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service lifecycle status state machine.
//!
//! ```text
//! created → queued → deploying → {succeeded | failed}
//! succeeded/failed → stopping → stopped
//! stopped/failed/succeeded → queued   (redeploy)
//! ```
//!
//! `queued`, `deploying` and `stopping` are exclusive gates: while a service
//! sits in one of them, every competing lifecycle request is rejected with a
//! status conflict. The status column plus a row-level lock is the only
//! concurrency control across workers.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Service exists but has never been deployed.
    #[default]
    Created,
    /// A deployment has been accepted and is waiting for a worker.
    Queued,
    /// A worker is building and starting the container.
    Deploying,
    /// The container is (believed to be) running.
    Succeeded,
    /// The last deployment or the container itself failed.
    Failed,
    /// A stop request is being executed.
    Stopping,
    /// The container is stopped.
    Stopped,
}

impl ServiceStatus {
    /// True for transient states during which competing lifecycle requests
    /// must be rejected rather than queued or dropped.
    pub fn is_gate(self) -> bool {
        matches!(self, Self::Queued | Self::Deploying | Self::Stopping)
    }

    /// True when a deploy request may move this service to `queued`.
    pub fn can_queue(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Succeeded | Self::Failed | Self::Stopped
        )
    }

    /// True when a stop request may move this service to `stopping`.
    ///
    /// `stopped` is excluded here because stopping an already stopped service
    /// is a no-op success, not a transition.
    pub fn can_stop(self) -> bool {
        matches!(self, Self::Created | Self::Succeeded | Self::Failed)
    }

    /// True for states the reconciliation sweep inspects.
    pub fn is_reconcilable(self) -> bool {
        matches!(self, Self::Succeeded | Self::Stopped)
    }

    /// Stable lowercase name, matching the database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Deploying => "deploying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "deploying" => Ok(Self::Deploying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("Unknown service status: {}", other)),
        }
    }
}
