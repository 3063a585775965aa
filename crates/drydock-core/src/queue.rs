// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-least-once task queue for deployment and stop work.
//!
//! Callers enqueue a task only after the status transition that gates it has
//! committed. Workers claim with [`TaskQueue::claim`], which atomically marks
//! the row running; a claim that is neither completed nor failed becomes
//! claimable again once its visibility timeout lapses. Handlers therefore run
//! at least once and must tolerate duplicate delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;

/// Work item kinds dispatched to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Roll out one deploy for its service.
    Deploy {
        /// Deploy to roll out.
        deploy_id: Uuid,
    },
    /// Stop a service's running container.
    Stop {
        /// Service to stop.
        service_id: Uuid,
    },
}

/// A claimed work item.
#[derive(Debug, Clone)]
pub struct Task {
    /// Queue row identifier.
    pub task_id: Uuid,
    /// What to do.
    pub kind: TaskKind,
    /// Delivery count including this claim.
    pub attempts: i32,
}

/// Queue abstraction consumed by the engine's workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task, returning its ID.
    async fn enqueue(&self, kind: TaskKind) -> Result<Uuid, CoreError>;

    /// Claim the oldest available task, or `Ok(None)` when the queue is
    /// empty. A task claimed longer than `visibility` ago without being
    /// completed or failed counts as available again.
    async fn claim(&self, visibility: Duration) -> Result<Option<Task>, CoreError>;

    /// Mark a claimed task as done.
    async fn complete(&self, task_id: Uuid) -> Result<(), CoreError>;

    /// Record a failed delivery. The task goes back to pending until its
    /// delivery count reaches `max_attempts`, after which it is parked as
    /// failed.
    async fn fail(&self, task_id: Uuid, error: &str, max_attempts: i32) -> Result<(), CoreError>;
}

// ============================================================================
// Postgres Queue
// ============================================================================

/// Enqueue a task row.
pub async fn enqueue_task(pool: &PgPool, kind: TaskKind) -> Result<Uuid, CoreError> {
    let task_id = Uuid::new_v4();
    let payload = serde_json::to_value(kind)?;
    sqlx::query(
        r#"
        INSERT INTO tasks (task_id, payload, status)
        VALUES ($1, $2, 'pending')
        "#,
    )
    .bind(task_id)
    .bind(payload)
    .execute(pool)
    .await?;

    Ok(task_id)
}

/// Atomically claim the oldest claimable task.
///
/// `SKIP LOCKED` keeps concurrent workers from serializing on the same head
/// row; the stale-claim arm re-delivers tasks whose worker died mid-run.
pub async fn claim_task(pool: &PgPool, visibility: Duration) -> Result<Option<Task>, CoreError> {
    let row: Option<(Uuid, serde_json::Value, i32)> = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = 'running', claimed_at = NOW(), attempts = attempts + 1
        WHERE task_id = (
            SELECT task_id
            FROM tasks
            WHERE status = 'pending'
               OR (status = 'running' AND claimed_at < NOW() - make_interval(secs => $1))
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING task_id, payload, attempts
        "#,
    )
    .bind(visibility.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    let (task_id, payload, attempts) = match row {
        Some(row) => row,
        None => return Ok(None),
    };
    let kind: TaskKind = serde_json::from_value(payload)?;
    Ok(Some(Task {
        task_id,
        kind,
        attempts,
    }))
}

/// Mark a task as succeeded.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'succeeded', updated_at = NOW()
        WHERE task_id = $1
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed delivery, re-queueing below the attempt ceiling.
pub async fn fail_task(
    pool: &PgPool,
    task_id: Uuid,
    error: &str,
    max_attempts: i32,
) -> Result<(), CoreError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
            claimed_at = NULL,
            last_error = $2,
            updated_at = NOW()
        WHERE task_id = $1
        RETURNING status
        "#,
    )
    .bind(task_id)
    .bind(error)
    .bind(max_attempts)
    .fetch_optional(pool)
    .await?;

    if let Some((status,)) = row {
        if status == "failed" {
            warn!(task_id = %task_id, error = %error, "Task parked after exhausting deliveries");
        }
    }

    Ok(())
}

/// PostgreSQL-backed [`TaskQueue`].
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    /// Create a queue over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, kind: TaskKind) -> Result<Uuid, CoreError> {
        enqueue_task(&self.pool, kind).await
    }

    async fn claim(&self, visibility: Duration) -> Result<Option<Task>, CoreError> {
        claim_task(&self.pool, visibility).await
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), CoreError> {
        complete_task(&self.pool, task_id).await
    }

    async fn fail(&self, task_id: Uuid, error: &str, max_attempts: i32) -> Result<(), CoreError> {
        fail_task(&self.pool, task_id, error, max_attempts).await
    }
}

// ============================================================================
// In-Memory Queue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<Task>,
    running: HashMap<Uuid, Task>,
    succeeded: Vec<Uuid>,
    failed: Vec<(Uuid, String)>,
}

/// In-memory [`TaskQueue`] used by tests.
///
/// Claims never expire on their own; a test drives re-delivery explicitly
/// through [`TaskQueue::fail`].
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<StdMutex<QueueInner>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of tasks waiting to be claimed.
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// IDs of tasks completed so far.
    pub fn succeeded(&self) -> Vec<Uuid> {
        self.state().succeeded.clone()
    }

    /// IDs and final errors of tasks parked as failed.
    pub fn parked(&self) -> Vec<(Uuid, String)> {
        self.state().failed.clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, kind: TaskKind) -> Result<Uuid, CoreError> {
        let task_id = Uuid::new_v4();
        self.state().pending.push_back(Task {
            task_id,
            kind,
            attempts: 0,
        });
        Ok(task_id)
    }

    async fn claim(&self, _visibility: Duration) -> Result<Option<Task>, CoreError> {
        let mut inner = self.state();
        let mut task = match inner.pending.pop_front() {
            Some(task) => task,
            None => return Ok(None),
        };
        task.attempts += 1;
        inner.running.insert(task.task_id, task.clone());
        Ok(Some(task))
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), CoreError> {
        let mut inner = self.state();
        inner.running.remove(&task_id);
        inner.succeeded.push(task_id);
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str, max_attempts: i32) -> Result<(), CoreError> {
        let mut inner = self.state();
        let task = match inner.running.remove(&task_id) {
            Some(task) => task,
            None => return Ok(()),
        };
        if task.attempts >= max_attempts {
            inner.failed.push((task_id, error.to_string()));
        } else {
            inner.pending.push_back(task);
        }
        Ok(())
    }
}
