//! Bounded background execution of pipeline runs.
//!
//! Ingress hands each alert to [`RunQueue::submit`] and returns at once. A
//! fixed pool of workers drains a bounded channel; every job carries a
//! [`RunId`] so its progress stays observable after the caller is gone.

use crate::context::{RunContext, RunId};
use crate::orchestrator::{Pipeline, RunReport, RunState};
use crate::records::Decision;
use alert_registry::Alert;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CAPACITY: usize = 256;
/// Finished runs kept for status queries; older ones are evicted first.
const FINISHED_RETENTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("run queue is full")]
    Full,
    #[error("run queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Queued,
    Running,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub alert_id: String,
    pub user_id: String,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub workers: usize,
    pub capacity: usize,
}

struct Job {
    run_id: RunId,
    alert: Alert,
    ctx: RunContext,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<RunId, RunStatus>,
    finished: VecDeque<RunId>,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    submitted: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    finished: Notify,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, run_id: RunId) {
        self.running.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.registry().runs.get_mut(&run_id) {
            status.phase = RunPhase::Running;
        }
    }

    fn finish(&self, run_id: RunId, outcome: Result<&RunReport, String>) {
        let phase = match &outcome {
            Ok(report) if report.state == RunState::Done => RunPhase::Done,
            _ => RunPhase::Failed,
        };
        let counter = if phase == RunPhase::Done {
            &self.completed
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);

        {
            let mut registry = self.registry();
            if let Some(status) = registry.runs.get_mut(&run_id) {
                status.phase = phase;
                status.finished_at = Some(Utc::now());
                match &outcome {
                    Ok(report) => {
                        status.decision = report.context.decision().map(|d| d.decision);
                        status.ticket_id = report
                            .ticket()
                            .and_then(|t| t.ticket_id())
                            .map(ToString::to_string);
                        status.error = report.failure.as_ref().map(ToString::to_string);
                    }
                    Err(message) => status.error = Some(message.clone()),
                }
            }
            registry.finished.push_back(run_id);
            while registry.finished.len() > FINISHED_RETENTION {
                if let Some(evicted) = registry.finished.pop_front() {
                    registry.runs.remove(&evicted);
                }
            }
        }
        self.finished.notify_waiters();
    }
}

pub struct RunQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
    worker_count: usize,
    capacity: usize,
}

impl RunQueue {
    /// Spawns `workers` tasks on the current runtime.
    pub fn start(pipeline: Arc<Pipeline>, workers: usize, capacity: usize) -> Self {
        let worker_count = workers.max(1);
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared::default());

        let handles = (0..worker_count)
            .map(|worker| {
                tokio::spawn(work(worker, Arc::clone(&pipeline), Arc::clone(&rx), Arc::clone(&shared)))
            })
            .collect();

        info!(workers = worker_count, capacity, "run queue started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            shared,
            worker_count,
            capacity,
        }
    }

    /// Enqueue a run without waiting for it. Fails fast when the queue is full.
    pub fn submit(&self, alert: Alert, ctx: RunContext) -> Result<RunId, SubmitError> {
        let tx = lock(&self.tx).clone().ok_or(SubmitError::Closed)?;
        let run_id = RunId::new();

        self.shared.registry().runs.insert(
            run_id,
            RunStatus {
                run_id,
                alert_id: ctx.key().alert_id.clone(),
                user_id: ctx.key().user_id.clone(),
                phase: RunPhase::Queued,
                decision: None,
                ticket_id: None,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        match tx.try_send(Job { run_id, alert, ctx }) {
            Ok(()) => {
                self.shared.submitted.fetch_add(1, Ordering::SeqCst);
                Ok(run_id)
            }
            Err(err) => {
                self.shared.registry().runs.remove(&run_id);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(SubmitError::Full),
                    mpsc::error::TrySendError::Closed(_) => Err(SubmitError::Closed),
                }
            }
        }
    }

    pub fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.shared.registry().runs.get(&run_id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let submitted = self.shared.submitted.load(Ordering::SeqCst);
        let running = self.shared.running.load(Ordering::SeqCst);
        let completed = self.shared.completed.load(Ordering::SeqCst);
        let failed = self.shared.failed.load(Ordering::SeqCst);
        QueueStats {
            submitted,
            queued: submitted.saturating_sub(running + completed + failed),
            running,
            completed,
            failed,
            workers: self.worker_count,
            capacity: self.capacity,
        }
    }

    /// Resolves once the run reached a terminal phase. `None` for unknown ids.
    pub async fn wait_for(&self, run_id: RunId) -> Option<RunStatus> {
        loop {
            let mut notified = std::pin::pin!(self.shared.finished.notified());
            notified.as_mut().enable();
            match self.status(run_id) {
                None => return None,
                Some(status) if status.phase.is_terminal() => return Some(status),
                Some(_) => notified.await,
            }
        }
    }

    /// Stop accepting runs, then wait for queued and running ones to finish.
    pub async fn shutdown(&self) {
        drop(lock(&self.tx).take());
        let handles = std::mem::take(&mut *lock(&self.workers));
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "run queue worker ended abnormally");
            }
        }
        let stats = self.stats();
        info!(completed = stats.completed, failed = stats.failed, "run queue drained");
    }
}

async fn work(
    worker: usize,
    pipeline: Arc<Pipeline>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    shared: Arc<Shared>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(Job { run_id, alert, ctx }) = job else {
            break;
        };
        shared.start(run_id);

        // Runs go on their own task so a panic fails the run, not the worker.
        let pipeline = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move { pipeline.run(run_id, &alert, ctx).await });
        match handle.await {
            Ok(report) => shared.finish(run_id, Ok(&report)),
            Err(err) => {
                error!(%run_id, worker, error = %err, "pipeline run panicked");
                shared.finish(run_id, Err(format!("run task aborted: {err}")));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
