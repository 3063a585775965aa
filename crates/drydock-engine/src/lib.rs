// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drydock Engine - Deployment Orchestration
//!
//! This crate turns deploy and stop requests into container runtime state:
//! it converts uploaded zip archives into build contexts, renders platform
//! Dockerfiles (detecting Django entrypoints where needed), builds images,
//! runs containers under plan resource limits on per-tenant networks, and
//! publishes routes to the shared reverse proxy through container labels.
//! A worker pool drains the task queue and a reconciliation monitor folds
//! runtime drift back into the service records.
//!
//! # Deployment Pipeline
//!
//! ```text
//!  request_deploy            worker claim
//! ┌──────────────┐ enqueue ┌──────────────────────────────────────────┐
//! │ status gate  │────────►│ run_deploy                               │
//! │ (row lock)   │         │                                          │
//! └──────────────┘         │  zip ──► tar context ──► entrypoint      │
//!                          │   │                      detection       │
//!                          │   ▼                                      │
//!                          │  image build ──► tenant network          │
//!                          │   │              ──► container (limits,  │
//!                          │   ▼                  env, labels)        │
//!                          │  liveness wait ──► commit success        │
//!                          │   │                                      │
//!                          │   └─ on failure: rollback (container,    │
//!                          │      images, route) ──► status failed    │
//!                          └──────────────────────────────────────────┘
//! ```
//!
//! Deployments are all-or-nothing: the previous container is displaced
//! before the new one starts, and a failed attempt tears down everything it
//! created rather than leaving a half-deployed service behind.
//!
//! # Components
//!
//! - [`archive`]: Zip upload to tar build context conversion
//! - [`config`]: Environment-driven engine configuration
//! - [`container`]: Container lifecycle with bounded start/stop waits
//! - [`detect`]: Django entrypoint detection inside build contexts
//! - [`engine`]: Assembly of the worker pool and monitor, with shutdown
//! - [`error`]: The engine error umbrella
//! - [`image`]: Image builds over validated contexts, removal and pruning
//! - [`monitor`]: Reconciliation sweep between records and runtime
//! - [`network`]: Per-tenant internal network management
//! - [`orchestrator`]: Request gates and the deploy/stop task bodies
//! - [`proxy`]: Reverse-proxy route labels and ingress attachment
//! - [`runtime`]: The container runtime abstraction (Docker and mock)
//! - [`worker`]: Queue consumers dispatching tasks to the orchestrator

#![deny(missing_docs)]

/// Zip upload to tar build context conversion, with size caps.
pub mod archive;

/// Environment-driven engine configuration.
pub mod config;

/// Container lifecycle management with bounded start/stop waits.
pub mod container;

/// Django entrypoint detection inside build contexts.
pub mod detect;

/// Engine assembly: worker pool, reconciliation monitor, shutdown.
pub mod engine;

/// Error types for engine operations.
pub mod error;

/// Image builds over validated contexts, tag removal and pruning.
pub mod image;

/// Background reconciliation between recorded status and runtime truth.
pub mod monitor;

/// Per-tenant internal network management.
pub mod network;

/// Request gates and the deploy/stop task bodies.
pub mod orchestrator;

/// Reverse-proxy route labels and ingress network attachment.
pub mod proxy;

/// Container runtime abstraction with Docker and in-memory backends.
pub mod runtime;

/// Queue consumers dispatching claimed tasks to the orchestrator.
pub mod worker;

pub use archive::{ArchiveError, BuildContext};
pub use config::{Config, ConfigError};
pub use container::{ContainerManager, ContainerStats};
pub use detect::{detect_entrypoint, DetectError};
pub use engine::{Engine, EngineBuilder, RunningEngine};
pub use error::{Error, Result};
pub use image::{BuildError, ImageManager, RemoveStats};
pub use monitor::ReconciliationMonitor;
pub use network::NetworkManager;
pub use orchestrator::{container_name, Orchestrator};
pub use proxy::ProxyIntegrator;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime, MockRuntime, RuntimeError};
pub use worker::TaskWorker;
