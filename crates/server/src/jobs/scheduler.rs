//! Job scheduler: bounded dispatch queues consumed by long-lived worker
//! pools, a cancellation registry, and the shutdown drain.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ingest::{run_parse_job, IngestContext};
use super::rca::{run_rca_job, RcaContext};
use crate::db::jobs::JobRecord;
use crate::db::{StoreError, StoreResult};

/// Options accepted when an analysis job is created.
#[derive(Debug, Clone, Copy)]
pub struct RcaJobOptions {
    pub timeout_secs: u64,
    pub chunking: bool,
}

pub struct JobScheduler {
    parse_tx: mpsc::Sender<String>,
    rca_tx: mpsc::Sender<String>,
    cancels: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    rca: RcaContext,
}

impl JobScheduler {
    /// Spawn both worker pools and return the scheduler handle.
    pub fn start(
        ingest: IngestContext,
        rca: RcaContext,
        parse_pool: usize,
        rca_pool: usize,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (parse_tx, parse_rx) = mpsc::channel::<String>(queue_depth.max(1));
        let (rca_tx, rca_rx) = mpsc::channel::<String>(queue_depth.max(1));
        let shutdown = CancellationToken::new();
        let cancels: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());

        let mut workers = Vec::new();

        let parse_rx = Arc::new(tokio::sync::Mutex::new(parse_rx));
        for worker in 0..parse_pool.max(1) {
            let rx = parse_rx.clone();
            let ctx = ingest.clone();
            let stop = shutdown.clone();
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker, "parse worker started");
                loop {
                    let file_id = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = stop.cancelled() => None,
                            msg = rx.recv() => msg,
                        }
                    };
                    let Some(file_id) = file_id else { break };
                    run_parse_job(&ctx, &file_id).await;
                }
                tracing::debug!(worker, "parse worker stopped");
            }));
        }

        let rca_rx = Arc::new(tokio::sync::Mutex::new(rca_rx));
        for worker in 0..rca_pool.max(1) {
            let rx = rca_rx.clone();
            let ctx = rca.clone();
            let stop = shutdown.clone();
            let cancels = cancels.clone();
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker, "analysis worker started");
                loop {
                    let job_id = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = stop.cancelled() => None,
                            msg = rx.recv() => msg,
                        }
                    };
                    let Some(job_id) = job_id else { break };

                    let token = cancels
                        .entry(job_id.clone())
                        .or_insert_with(CancellationToken::new)
                        .clone();
                    run_rca_job(&ctx, &job_id, token).await;
                    cancels.remove(&job_id);
                }
                tracing::debug!(worker, "analysis worker stopped");
            }));
        }

        Arc::new(Self {
            parse_tx,
            rca_tx,
            cancels,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
            rca,
        })
    }

    /// Queue a freshly uploaded file for parsing.
    pub fn submit_parse(&self, file_id: &str) -> StoreResult<()> {
        self.parse_tx
            .try_send(file_id.to_string())
            .map_err(|_| StoreError::Conflict("parsing queue is full; retry shortly".to_string()))
    }

    /// Create and dispatch an analysis job. Conflict checks (file state,
    /// duplicate jobs) happen transactionally in the store.
    pub fn create_rca_job(&self, file_id: &str, opts: RcaJobOptions) -> StoreResult<JobRecord> {
        let job = self
            .rca
            .db
            .create_rca_job(file_id, opts.timeout_secs as i64, opts.chunking)?;

        self.cancels.insert(job.id.clone(), CancellationToken::new());
        if self.rca_tx.try_send(job.id.clone()).is_err() {
            self.cancels.remove(&job.id);
            let _ = self
                .rca
                .db
                .mark_job_failed(&job.id, "analysis queue is full; retry shortly", None);
            return Err(StoreError::Conflict(
                "analysis queue is full; retry shortly".to_string(),
            ));
        }
        Ok(job)
    }

    /// Re-dispatch a failed job; the orchestrator resumes at the recorded
    /// failed chunk using its persisted partials.
    pub fn retry_rca_job(&self, job_id: &str) -> StoreResult<JobRecord> {
        let job = self.rca.db.mark_job_retrying(job_id)?;
        self.cancels.insert(job.id.clone(), CancellationToken::new());
        if self.rca_tx.try_send(job.id.clone()).is_err() {
            self.cancels.remove(&job.id);
            let _ = self
                .rca
                .db
                .mark_job_failed(&job.id, "analysis queue is full; retry shortly", None);
            return Err(StoreError::Conflict(
                "analysis queue is full; retry shortly".to_string(),
            ));
        }
        Ok(job)
    }

    /// Cooperative cancellation: queued jobs flip to `cancelled`
    /// immediately; running jobs observe the token at the next chunk
    /// boundary.
    pub fn cancel(&self, job_id: &str) -> StoreResult<bool> {
        if let Some(token) = self.cancels.get(job_id) {
            token.cancel();
        }
        // A queued job has not started; flip it directly so the worker
        // skips it on pickup
        let job = self.rca.db.job_by_id(job_id)?;
        if job.status == crate::db::JobStatus::Pending {
            return self.rca.db.mark_job_cancelled(job_id);
        }
        Ok(!job.status.is_terminal())
    }

    pub fn status(&self, job_id: &str) -> StoreResult<JobRecord> {
        self.rca.db.job_by_id(job_id)
    }

    /// Stop accepting work, wait up to `drain` for in-flight jobs, then
    /// fail whatever is still live.
    pub async fn shutdown_and_drain(&self, drain: Duration) {
        tracing::info!(drain_secs = drain.as_secs(), "scheduler shutting down");
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(drain, join_all).await.is_err() {
            tracing::warn!("drain window elapsed with jobs still in flight");
            for entry in self.cancels.iter() {
                entry.value().cancel();
            }
        }

        match self.rca.db.fail_inflight_jobs("service shutting down") {
            Ok(0) => {}
            Ok(failed) => tracing::warn!(failed, "in-flight jobs failed at shutdown"),
            Err(e) => tracing::error!(error = %e, "could not fail in-flight jobs"),
        }
    }
}
