//! Background job queue (§5): a bounded channel carrying fan-out,
//! bot-dispatch, and inspection jobs, drained by a `Semaphore`-gated worker
//! pool handling the three job kinds the market's worker pool processes
//! (C4/C5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use infonomy_agent::{AgentBridge, InspectionAgent};
use infonomy_core::config::Config;
use infonomy_core::model::{ContextId, DecisionContext, OfferId, Subscription};
use infonomy_engine::InspectionEngine;
use infonomy_matcher::{BotSellerDispatcher, MatcherIndex};
use infonomy_store::Store;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub result: Option<serde_json::Value>,
    pub traceback: Option<String>,
}

/// Tracks the status of inspection jobs for `GET /jobs/{id}`. Fan-out and
/// bot-dispatch jobs are fire-and-forget (§5) and are not tracked here.
#[derive(Clone, Default)]
pub struct JobRegistry {
    next_id: Arc<AtomicI64>,
    records: Arc<Mutex<HashMap<JobId, JobStatus>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.lock().unwrap().insert(
            id,
            JobStatus { state: JobState::Queued, result: None, traceback: None },
        );
        id
    }

    fn set_running(&self, id: JobId) {
        if let Some(r) = self.records.lock().unwrap().get_mut(&id) {
            r.state = JobState::Running;
        }
    }

    fn set_done(&self, id: JobId, result: serde_json::Value) {
        if let Some(r) = self.records.lock().unwrap().get_mut(&id) {
            r.state = JobState::Done;
            r.result = Some(result);
        }
    }

    fn set_failed(&self, id: JobId, traceback: String) {
        if let Some(r) = self.records.lock().unwrap().get_mut(&id) {
            r.state = JobState::Failed;
            r.traceback = Some(traceback);
        }
    }

    pub fn get(&self, id: JobId) -> Option<JobStatus> {
        self.records.lock().unwrap().get(&id).cloned()
    }
}

/// A unit of background work (§5: "fan out context X" / "dispatch bots for
/// context X" / "inspect inspection-id I"). Idempotent by target id — running
/// the same job twice is a no-op the second time around.
pub enum Job {
    FanOutContext { context_id: ContextId },
    DispatchBots { context_id: ContextId, matched: Vec<Subscription> },
    Inspect { job_id: JobId, context_id: ContextId, info_offer_ids: Vec<OfferId> },
}

/// Spawns the dispatcher task and returns the channel handle handlers enqueue
/// onto. `concurrency` bounds how many jobs run at once across the pool.
pub fn spawn_worker_pool(
    store: Arc<dyn Store>,
    agent: Arc<AgentBridge>,
    config: Arc<Config>,
    jobs: JobRegistry,
    concurrency: usize,
) -> mpsc::Sender<Job> {
    let (tx, mut rx) = mpsc::channel::<Job>(256);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let store = store.clone();
            let agent = agent.clone();
            let config = config.clone();
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_job(job, store, agent, config, jobs).await;
            });
        }
    });

    tx
}

async fn run_job(job: Job, store: Arc<dyn Store>, agent: Arc<AgentBridge>, config: Arc<Config>, jobs: JobRegistry) {
    match job {
        Job::FanOutContext { context_id } => match store.get_context(context_id).await {
            Ok(ctx) => match MatcherIndex::new(store.as_ref()).refresh_by_context(&ctx).await {
                Ok(matched) if !matched.is_empty() => {
                    dispatch_bots(&ctx, matched, store.as_ref(), agent.as_ref()).await;
                }
                Ok(_) => {}
                Err(e) => error!("fan-out for context {context_id} failed: {e}"),
            },
            Err(e) => error!("fan-out: context {context_id} not found: {e}"),
        },
        Job::DispatchBots { context_id, matched } => {
            if let Ok(ctx) = store.get_context(context_id).await {
                dispatch_bots(&ctx, matched, store.as_ref(), agent.as_ref()).await;
            }
        }
        Job::Inspect { job_id, context_id, info_offer_ids } => {
            jobs.set_running(job_id);
            let cancel = CancellationToken::new();
            let engine = InspectionEngine::new(store.as_ref(), agent.as_ref(), config.as_ref(), cancel);
            match engine.run_root_inspection(context_id, info_offer_ids).await {
                Ok(outcome) => jobs.set_done(
                    job_id,
                    serde_json::json!({
                        "context_id": outcome.context_id,
                        "purchased": outcome.purchased,
                        "spent": outcome.spent,
                    }),
                ),
                Err(e) => {
                    error!("inspection job {job_id} for context {context_id} failed: {e}");
                    jobs.set_failed(job_id, e.to_string());
                }
            }
        }
    }
}

async fn dispatch_bots(ctx: &DecisionContext, matched: Vec<Subscription>, store: &dyn Store, agent: &dyn InspectionAgent) {
    BotSellerDispatcher::new(store, agent).dispatch(ctx, &matched).await;
}
