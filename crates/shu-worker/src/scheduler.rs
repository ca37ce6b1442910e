// Feed scheduler: creates execution rows for due feeds and drains them
//
// Each tick: (1) every due feed without an in-flight execution gets one
// PENDING row, (2) a batch of PENDING rows is claimed - the claim is the
// atomic PENDING -> RUNNING transition, so concurrent workers never run the
// same record - and driven through the ExecutionRunner. The scheduler owns
// the "transaction": it applies the RunOutcome to the stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use shu_core::error::Result;
use shu_core::traits::{
    ExecutionOutcome, ExecutionStatus, ExecutionStore, FeedStore, PluginExecution,
};

use crate::runner::{ExecutionRunner, RunOutcome};
use crate::schedule;

const DEFAULT_BATCH_SIZE: usize = 8;

pub struct FeedScheduler {
    runner: Arc<ExecutionRunner>,
    feeds: Arc<dyn FeedStore>,
    executions: Arc<dyn ExecutionStore>,
    poll_interval: Duration,
    batch_size: usize,
}

impl FeedScheduler {
    pub fn new(
        runner: Arc<ExecutionRunner>,
        feeds: Arc<dyn FeedStore>,
        executions: Arc<dyn ExecutionStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            feeds,
            executions,
            poll_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run until the task is aborted.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
        }
    }

    /// One scheduler pass: enqueue due feeds, then drain pending records.
    pub async fn tick(&self) -> Result<()> {
        self.enqueue_due_feeds().await?;
        self.drain_pending().await
    }

    async fn enqueue_due_feeds(&self) -> Result<()> {
        let now = Utc::now();
        for feed in self.feeds.list_due_feeds(now).await? {
            if !schedule::is_due(&feed, now) {
                continue;
            }
            // At most one execution per feed in flight
            if self.executions.has_active_execution(feed.id).await? {
                continue;
            }
            let execution = PluginExecution {
                id: Uuid::now_v7(),
                user_id: feed.user_id.clone(),
                schedule_id: Some(feed.id),
                plugin_name: feed.plugin_name.clone(),
                agent_key: None,
                params: feed.params.clone(),
                status: ExecutionStatus::Pending,
                result: None,
                error: None,
                created_at: now,
                completed_at: None,
            };
            let created = self.executions.create_execution(execution).await?;
            info!(
                feed_id = %feed.id,
                exec_id = %created.id,
                plugin = %feed.plugin_name,
                "Enqueued feed execution"
            );
        }
        Ok(())
    }

    async fn drain_pending(&self) -> Result<()> {
        let pending = self.executions.list_pending(self.batch_size).await?;
        for record in pending {
            // Atomic claim; a losing racer just skips
            let Some(claimed) = self.executions.claim_pending(record.id).await? else {
                continue;
            };
            self.process_claimed(claimed).await;
        }
        Ok(())
    }

    /// Drive one claimed record and persist its outcome. Runner errors
    /// (policy denials, store failures) mark the record FAILED with the
    /// error message; the feed stays enabled so the next tick retries.
    pub async fn process_claimed(&self, record: PluginExecution) {
        match self.runner.run_record(&record).await {
            Ok(outcome) => {
                if let Err(e) = self.apply_outcome(&record, outcome).await {
                    error!(exec_id = %record.id, error = %e, "Failed to persist execution outcome");
                }
            }
            Err(e) => {
                warn!(
                    exec_id = %record.id,
                    plugin = %record.plugin_name,
                    error = %e,
                    "Execution failed before completion"
                );
                let failed = ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    result: Some(json!({
                        "status": "error",
                        "error": {"code": e.error_code(), "message": e.to_string()},
                    })),
                    error: Some(e.to_string()),
                    completed_at: Utc::now(),
                };
                if let Err(e) = self.executions.apply_outcome(record.id, &failed).await {
                    error!(exec_id = %record.id, error = %e, "Failed to persist failure outcome");
                }
            }
        }
    }

    async fn apply_outcome(&self, record: &PluginExecution, run: RunOutcome) -> Result<()> {
        self.executions
            .apply_outcome(record.id, &run.outcome)
            .await?;

        if let Some(feed_id) = run.disable_feed {
            warn!(feed_id = %feed_id, "Auto-disabling feed after unresolvable plugin");
            self.feeds.set_feed_enabled(feed_id, false).await?;
        }

        if let Some(updates) = run.feed_updates {
            self.feeds
                .apply_feed_run(updates.feed_id, updates.last_run_at, updates.params)
                .await?;
        }

        Ok(())
    }
}
