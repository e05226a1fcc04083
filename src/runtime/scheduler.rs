/// Background tick service
///
/// One tokio-cron-scheduler job drives the periodic tick: due drip messages, due
/// delayed task executions, and housekeeping of the approval-gate guards. The same
/// tick can be run on demand through `tick_now` (used by `POST /internal/tick`).
/// Ticks never overlap: a cron firing while a tick is running is skipped.

use crate::drip::{DripScheduler, TickReport};
use crate::error::AppResult;
use crate::guard::{IdempotencyCache, SlidingWindowLimiter};
use crate::runtime::engine::WorkflowEngine;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub drip: TickReport,
    pub executions_processed: usize,
    pub idempotency_purged: usize,
    pub rate_keys_purged: usize,
}

/// Everything a tick touches
struct TickTargets {
    engine: Arc<WorkflowEngine>,
    drip: DripScheduler,
    idempotency: Arc<IdempotencyCache>,
    limiter: Arc<SlidingWindowLimiter>,
    running: Mutex<()>,
}

impl TickTargets {
    async fn run(&self, now: DateTime<Utc>) -> AppResult<TickSummary> {
        let _guard = self.running.lock().await;
        self.run_locked(now).await
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> AppResult<TickSummary> {
        let drip = self.drip.tick(now).await?;
        let executions_processed = self.engine.process_due(now).await?;
        let idempotency_purged = self.idempotency.purge_expired();
        let rate_keys_purged = self.limiter.purge_idle();

        Ok(TickSummary {
            drip,
            executions_processed,
            idempotency_purged,
            rate_keys_purged,
        })
    }
}

pub struct TickService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid: RwLock<Option<Uuid>>,
    schedule: String,
    targets: Arc<TickTargets>,
}

impl std::fmt::Debug for TickService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickService")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl TickService {
    pub async fn new(
        engine: Arc<WorkflowEngine>,
        drip: DripScheduler,
        idempotency: Arc<IdempotencyCache>,
        limiter: Arc<SlidingWindowLimiter>,
        schedule: impl Into<String>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid: RwLock::new(None),
            schedule: schedule.into(),
            targets: Arc::new(TickTargets {
                engine,
                drip,
                idempotency,
                limiter,
                running: Mutex::new(()),
            }),
        })
    }

    /// Register the tick job and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting tick scheduler ({})", self.schedule);

        let targets = Arc::clone(&self.targets);
        let job = Job::new_async(self.schedule.as_str(), move |_uuid, _l| {
            let targets = Arc::clone(&targets);

            Box::pin(async move {
                let Ok(_guard) = targets.running.try_lock() else {
                    tracing::debug!("⏭️ Previous tick still running, skipping");
                    return;
                };
                match targets.run_locked(Utc::now()).await {
                    Ok(summary) => {
                        tracing::debug!(
                            "🔔 Tick done: {} drip processed, {} executions processed",
                            summary.drip.processed,
                            summary.executions_processed
                        );
                    }
                    Err(e) => tracing::error!("❌ Scheduled tick failed: {}", e),
                }
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        *self.job_uuid.write().await = Some(job_uuid);

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Tick scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping tick scheduler");

        if let Some(job_uuid) = self.job_uuid.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("⚠️ Failed to remove tick job: {}", e);
            }
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Tick scheduler stopped");
        Ok(())
    }

    /// Run one tick right away, waiting for a running one to finish first
    pub async fn tick_now(&self, now: DateTime<Utc>) -> AppResult<TickSummary> {
        let summary = self.targets.run(now).await?;
        tracing::info!(
            "🔔 Manual tick: drip sent {}, executions processed {}",
            summary.drip.sent,
            summary.executions_processed
        );
        Ok(summary)
    }
}
