/// Fire-and-forget trigger dispatch
///
/// Callers hand a trigger to a bounded queue and return immediately; a fixed pool
/// of worker tasks runs the dispatch. A full queue drops the trigger with a
/// warning instead of blocking the caller. Failures never travel back to the
/// caller: they go to the log and to the engine event log. Each job runs in its
/// own task, so a panicking dispatch costs that trigger and not the worker.

use crate::events::{EngineEvent, EventKind, EventLog};
use crate::runtime::engine::WorkflowEngine;
use crate::workflow::types::{TriggerContext, TriggerType};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct TriggerJob {
    trigger: TriggerType,
    ctx: TriggerContext,
}

#[derive(Debug)]
pub struct TriggerDispatcher {
    sender: Mutex<Option<mpsc::Sender<TriggerJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventLog>,
}

impl TriggerDispatcher {
    /// Spawn `workers` consumers over a queue holding at most `capacity` triggers
    pub fn start(engine: Arc<WorkflowEngine>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<TriggerJob>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let events = engine.events().clone();

        let handles = (0..workers)
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let (trigger, user_id) = (job.trigger, job.ctx.user_id.clone());
                        let run = run_job(Arc::clone(&engine), worker_id, job);
                        supervise(run, trigger, &user_id, engine.events()).await;
                    }
                    tracing::debug!("🛑 Dispatch worker {} stopped", worker_id);
                })
            })
            .collect();

        tracing::info!("🧵 Trigger dispatcher started: {} workers, queue {}", workers, capacity);

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            events,
        }
    }

    /// Queue a trigger without waiting. Returns whether it was accepted.
    pub fn fire(&self, trigger: TriggerType, ctx: TriggerContext) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(sender) = sender else {
            tracing::warn!("⚠️ Dispatcher is shut down, dropping {} for user {}", trigger, ctx.user_id);
            self.record_drop(trigger, &ctx.user_id, "dispatcher shut down");
            return false;
        };

        let user_id = ctx.user_id.clone();
        match sender.try_send(TriggerJob { trigger, ctx }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("⚠️ Dispatch queue full, dropping {} for user {}", trigger, user_id);
                self.record_drop(trigger, &user_id, "queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("⚠️ Dispatch queue closed, dropping {} for user {}", trigger, user_id);
                self.record_drop(trigger, &user_id, "queue closed");
                false
            }
        }
    }

    fn record_drop(&self, trigger: TriggerType, user_id: &str, reason: &str) {
        self.events.record(
            EngineEvent::new(EventKind::TriggerDropped, format!("{} dropped: {}", trigger, reason))
                .for_user(user_id),
        );
    }

    /// Stop accepting triggers, let workers drain the queue, and wait for them
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("❌ Dispatch worker ended abnormally: {}", e);
            }
        }
        tracing::info!("✅ Trigger dispatcher stopped");
    }
}

/// Run one job on its own task and turn a panic into a TriggerFailed event
async fn supervise<F>(job: F, trigger: TriggerType, user_id: &str, events: &EventLog)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::spawn(job).await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            tracing::error!("💥 Dispatch of {} for user {} panicked", trigger, user_id);
            events.record(
                EngineEvent::new(EventKind::TriggerFailed, format!("{}: dispatch panicked", trigger)).for_user(user_id),
            );
        }
        Err(e) => tracing::warn!("⚠️ Dispatch of {} for user {} was cancelled: {}", trigger, user_id, e),
    }
}

async fn run_job(engine: Arc<WorkflowEngine>, worker_id: usize, job: TriggerJob) {
    let TriggerJob { trigger, ctx } = job;
    let user_id = ctx.user_id.clone();
    tracing::debug!("📥 Worker {} dispatching {} for user {}", worker_id, trigger, user_id);

    match engine.dispatch(trigger, ctx).await {
        Ok(report) => {
            if !report.started.is_empty() {
                tracing::info!("✅ {} started {} instances for user {}", trigger, report.started.len(), user_id);
            }
        }
        Err(e) => {
            tracing::error!("❌ Dispatch of {} for user {} failed: {}", trigger, user_id, e);
            engine.events().record(
                EngineEvent::new(EventKind::TriggerFailed, format!("{}: {}", trigger, e)).for_user(&user_id),
            );
        }
    }
}
