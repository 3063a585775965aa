// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drydock Core - Deployment Data Model and Persistence
//!
//! This crate provides the shared foundation of the drydock deployment engine:
//! the service/deploy/plan data model, the service lifecycle state machine,
//! the platform catalog with Dockerfile templates, and the PostgreSQL
//! persistence and task-queue layers the orchestration engine runs on.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Control Plane                          │
//! │              (API server, CLI, admin tooling)               │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ request deploy / stop / remove
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     drydock-engine                          │
//! │        (Orchestrator, Workers, Reconciliation Monitor)      │
//! └───────┬──────────────────┬──────────────────────┬───────────┘
//!         │ Store            │ TaskQueue            │ images,
//!         ▼                  ▼                      │ containers,
//! ┌───────────────┐  ┌───────────────┐              │ networks
//! │  PostgreSQL   │  │  tasks table  │              ▼
//! │ services,     │  │  (at-least-   │      ┌───────────────┐
//! │ deploys,      │  │   once queue) │      │   Container   │
//! │ plans,        │  │               │      │    Runtime    │
//! │ networks      │  │               │      │   (Docker)    │
//! └───────────────┘  └───────────────┘      └───────────────┘
//! ```
//!
//! # Service Status State Machine
//!
//! ```text
//! ┌─────────┐ request_deploy ┌────────┐ worker claim ┌───────────┐
//! │ created │───────────────►│ queued │─────────────►│ deploying │
//! └─────────┘                └────────┘              └─────┬─────┘
//!                                 ▲                success │ failure
//!                        redeploy │                  ┌─────┴─────┐
//!                                 │                  ▼           ▼
//!                            ┌─────────┐      ┌───────────┐ ┌────────┐
//!                            │ stopped │      │ succeeded │ │ failed │
//!                            └────┬────┘      └─────┬─────┘ └────────┘
//!                                 ▲                 │ request_stop
//!                                 │ stop done ┌─────▼────┐
//!                                 └───────────│ stopping │
//!                                             └──────────┘
//! ```
//!
//! `succeeded` and `failed` also accept `request_deploy` (restart and retry
//! re-enter through `queued`). `queued`, `deploying` and `stopping` are
//! exclusive gates: lifecycle requests arriving while a service sits in one
//! of them are rejected with a status conflict rather than queued behind the
//! running operation.
//!
//! # Concurrency Model
//!
//! The row-level lock on the service row plus the status value are the only
//! concurrency control. Every transition re-reads the status under the lock
//! before writing, so duplicate task delivery and competing workers degrade
//! to silent no-ops instead of racing on the same container name.
//!
//! # Modules
//!
//! - [`error`]: Error types with stable error code mapping
//! - [`migrations`]: Embedded PostgreSQL migrations
//! - [`platform`]: Platform catalog and Dockerfile templates
//! - [`queue`]: At-least-once task queue (PostgreSQL and in-memory)
//! - [`status`]: Service lifecycle status and transition predicates
//! - [`store`]: Persistence traits plus PostgreSQL and in-memory backends

#![deny(missing_docs)]

/// Error types for core operations with stable error code mapping.
pub mod error;

/// Embedded PostgreSQL migrations.
pub mod migrations;

/// Platform catalog: supported runtimes, default ports, Dockerfile templates.
pub mod platform;

/// At-least-once task queue backed by PostgreSQL, with an in-memory
/// implementation for tests.
pub mod queue;

/// Service lifecycle status and its transition predicates.
pub mod status;

/// Persistence traits and the PostgreSQL and in-memory backends.
pub mod store;

pub use error::{CoreError, Result};
pub use platform::{Entrypoint, EntrypointKind, Platform};
pub use queue::{MemoryQueue, PgTaskQueue, Task, TaskKind, TaskQueue};
pub use status::ServiceStatus;
pub use store::{
    DeployConfig, DeployRecord, MemoryStore, PlanLimits, PostgresStore, ServiceRecord,
    ServiceRowLock, Store, VolumeSpec,
};
