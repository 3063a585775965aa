// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumption: claim one task, run it to completion, settle the claim.

use std::sync::Arc;
use std::time::Duration;

use drydock_core::{Task, TaskKind, TaskQueue};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// How long an idle worker sleeps before polling the queue again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One queue consumer.
///
/// Workers claim one task at a time and dispatch on its kind. A handler
/// that returns cleanly completes the claim; one that errors hands the task
/// back for re-delivery until the attempt ceiling parks it. Shutdown is
/// checked between tasks only; a task already running is never cancelled.
pub struct TaskWorker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    visibility: Duration,
    max_attempts: i32,
    idle_interval: Duration,
    shutdown: Arc<Notify>,
}

impl TaskWorker {
    /// Create worker `id` over the shared queue and orchestrator.
    pub fn new(
        id: usize,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<Orchestrator>,
        config: &Config,
    ) -> Self {
        Self {
            id,
            queue,
            orchestrator,
            visibility: config.task_visibility,
            max_attempts: config.max_task_attempts,
            idle_interval: IDLE_POLL_INTERVAL,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop.
    ///
    /// The loop exits when the shutdown signal is received.
    pub async fn run(&self) {
        info!(worker = self.id, "Task worker started");

        loop {
            let task = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(worker = self.id, "Task worker received shutdown signal");
                    break;
                }

                task = self.next_task() => task,
            };
            if let Some(task) = task {
                self.process(task).await;
            }
        }

        info!(worker = self.id, "Task worker stopped");
    }

    /// Claim the next task, sleeping through one idle interval when the
    /// queue has nothing to hand out. Claim errors are logged and treated
    /// as an empty queue.
    async fn next_task(&self) -> Option<Task> {
        match self.queue.claim(self.visibility).await {
            Ok(Some(task)) => return Some(task),
            Ok(None) => {}
            Err(e) => warn!(worker = self.id, error = %e, "Task claim failed"),
        }
        tokio::time::sleep(self.idle_interval).await;
        None
    }

    /// Run one task to completion and settle its claim.
    async fn process(&self, task: Task) {
        debug!(
            worker = self.id,
            task_id = %task.task_id,
            attempts = task.attempts,
            "Task claimed"
        );
        let outcome = match task.kind {
            TaskKind::Deploy { deploy_id } => self.orchestrator.run_deploy(deploy_id).await,
            TaskKind::Stop { service_id } => self.orchestrator.run_stop(service_id).await,
        };
        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.complete(task.task_id).await {
                    warn!(
                        worker = self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "Failed to complete task"
                    );
                }
            }
            Err(err) => {
                error!(
                    worker = self.id,
                    task_id = %task.task_id,
                    error = %err,
                    "Task failed"
                );
                if let Err(e) = self
                    .queue
                    .fail(task.task_id, &err.to_string(), self.max_attempts)
                    .await
                {
                    warn!(
                        worker = self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "Failed to record task failure"
                    );
                }
            }
        }
    }
}
