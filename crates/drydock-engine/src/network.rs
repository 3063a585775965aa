// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant network lifecycle.
//!
//! Each tenant gets one private network its containers attach to. Networks
//! are created `internal`, so tenant workloads cannot reach the internet
//! directly; inbound traffic arrives through the ingress proxy instead.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::runtime::ContainerRuntime;

/// Creates and removes tenant networks.
#[derive(Clone)]
pub struct NetworkManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl NetworkManager {
    /// Create a manager over `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Create the network if it does not exist yet.
    ///
    /// A concurrent deploy may create it between the check and the create;
    /// that conflict counts as success.
    pub async fn ensure_exists(&self, name: &str, driver: &str) -> Result<()> {
        if self.runtime.network_exists(name).await? {
            debug!(network = %name, "Network already present");
            return Ok(());
        }
        match self.runtime.create_network(name, driver, true).await {
            Ok(()) => {
                info!(network = %name, driver = %driver, "Created tenant network");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!(network = %name, "Network created concurrently");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether the network exists.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.runtime.network_exists(name).await?)
    }

    /// Remove the network. Removing an absent network is a no-op success.
    pub async fn remove(&self, name: &str) -> Result<()> {
        match self.runtime.remove_network(name).await {
            Ok(()) => {
                info!(network = %name, "Removed tenant network");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
