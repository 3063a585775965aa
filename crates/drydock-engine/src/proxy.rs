// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingress wiring for deployed containers.
//!
//! Routing is expressed entirely as container labels read by the shared
//! reverse proxy, plus membership in the ingress network the proxy lives
//! on. There is no proxy config file to write and nothing to reload; labels
//! die with the container, so retraction only has to detach the network.
//!
//! The ingress network itself belongs to the proxy deployment. When it is
//! missing the engine logs and keeps going; a deploy must not fail because
//! the edge is not up yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::runtime::ContainerRuntime;

/// Publishes and retracts routes for service containers.
#[derive(Clone)]
pub struct ProxyIntegrator {
    runtime: Arc<dyn ContainerRuntime>,
    ingress_network: String,
    root_domain: String,
    entrypoint: String,
}

impl ProxyIntegrator {
    /// Create an integrator over `runtime` using the ingress settings from
    /// `config`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &Config) -> Self {
        Self {
            runtime,
            ingress_network: config.ingress_network.clone(),
            root_domain: config.root_domain.clone(),
            entrypoint: config.proxy_entrypoint.clone(),
        }
    }

    /// The hostname a container is routed under.
    pub fn route_host(&self, container: &str) -> String {
        format!("{container}.{}", self.root_domain)
    }

    /// Labels that make the proxy route `{container}.{root_domain}` to
    /// `port` on the container.
    pub fn route_labels(&self, container: &str, port: u16) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            "traefik.docker.network".to_string(),
            self.ingress_network.clone(),
        );
        labels.insert(
            format!("traefik.http.routers.{container}.rule"),
            format!("Host(`{}`)", self.route_host(container)),
        );
        labels.insert(
            format!("traefik.http.routers.{container}.entrypoints"),
            self.entrypoint.clone(),
        );
        labels.insert(
            format!("traefik.http.services.{container}.loadbalancer.server.port"),
            port.to_string(),
        );
        labels
    }

    /// Attach a container to the ingress network.
    ///
    /// Already-attached is a no-op. A missing ingress network is logged and
    /// tolerated; the proxy deployment owns that network and may not be up.
    pub async fn connect_to_ingress(&self, container: &str) -> Result<()> {
        match self.runtime.network_containers(&self.ingress_network).await {
            Ok(members) if members.iter().any(|member| member == container) => {
                debug!(container = %container, "Already attached to ingress");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                warn!(
                    network = %self.ingress_network,
                    container = %container,
                    "Ingress network missing, container stays unrouted"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        match self
            .runtime
            .connect_network(&self.ingress_network, container)
            .await
        {
            Ok(()) => {
                info!(
                    container = %container,
                    host = %self.route_host(container),
                    "Attached to ingress"
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                warn!(
                    network = %self.ingress_network,
                    container = %container,
                    "Ingress network vanished during attach"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Detach a container from the ingress network, best-effort.
    ///
    /// Absence of the network, the container or the attachment is not an
    /// error.
    pub async fn disconnect_from_ingress(&self, container: &str, force: bool) -> Result<()> {
        match self
            .runtime
            .disconnect_network(&self.ingress_network, container, force)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) if is_not_attached(&err.to_string()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Withdraw a container's route. Labels disappear with the container, so
    /// this only detaches it from the ingress network.
    pub async fn retract_route(&self, container: &str) -> Result<()> {
        debug!(container = %container, "Retracting route");
        self.disconnect_from_ingress(container, true).await
    }
}

fn is_not_attached(message: &str) -> bool {
    message.to_lowercase().contains("not connected")
}
