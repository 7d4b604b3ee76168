//! Dependency-gated parallel job execution.
//!
//! A batch of jobs runs on a bounded pool of workers. A job becomes ready
//! only when every job it requires has completed successfully; ready jobs
//! are handed to whichever worker frees up first. The first failure cancels
//! the batch: in-flight jobs observe the cancellation token at their next
//! suspension point, queued jobs never start, and the originating job id is
//! preserved on the aggregated error.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UbError};

/// Per-run context handed to a job: an opaque worker identifier (1..=W,
/// diagnostics only) and the batch cancellation token.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub worker_id: usize,
    pub cancel: CancellationToken,
}

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

pub trait Job: Send + Sync {
    fn id(&self) -> String;
    /// Sibling job ids that must complete successfully first.
    fn requires(&self) -> Vec<String>;
    fn run(&self, ctx: JobContext) -> JobFuture<'_>;
}

/// A job built from a closure; handy for batches without per-job state.
pub struct FnJob<F> {
    id: String,
    run: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(id: impl Into<String>, run: F) -> Self {
        Self { id: id.into(), run }
    }
}

impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn id(&self) -> String {
        self.id.clone()
    }

    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    fn run(&self, ctx: JobContext) -> JobFuture<'_> {
        Box::pin((self.run)(ctx))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Executor {
    pub workers: usize,
}

impl Executor {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Run a batch to completion, failure, or cancellation.
    ///
    /// Admission errors (duplicate ids, requirements naming unknown jobs)
    /// are detected before any worker starts. When a job fails and the
    /// caller cancels at the same time, the job error wins.
    pub async fn run(&self, cancel: &CancellationToken, jobs: Vec<Arc<dyn Job>>) -> Result<()> {
        let workers = self.workers.max(1);
        let total = jobs.len();
        if total == 0 {
            return Ok(());
        }

        let mut job_by_id: HashMap<String, Arc<dyn Job>> = HashMap::with_capacity(total);
        let mut in_degree: HashMap<String, usize> = HashMap::with_capacity(total);
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for job in &jobs {
            let id = job.id();
            if job_by_id.contains_key(&id) {
                return Err(UbError::DuplicateJob(id));
            }
            in_degree.insert(id.clone(), job.requires().len());
            job_by_id.insert(id, Arc::clone(job));
        }
        for job in &jobs {
            for requirement in job.requires() {
                if !job_by_id.contains_key(&requirement) {
                    return Err(UbError::UnknownJobRequirement {
                        id: job.id(),
                        requirement,
                    });
                }
                dependents.entry(requirement).or_default().push(job.id());
            }
        }

        let batch = cancel.child_token();
        let (ready_tx, ready_rx) = mpsc::channel::<(String, Arc<dyn Job>)>(total);
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<String>(total);
        let (err_tx, mut err_rx) = mpsc::channel::<UbError>(1);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 1..=workers {
            let ready_rx = Arc::clone(&ready_rx);
            let done_tx = done_tx.clone();
            let err_tx = err_tx.clone();
            let token = batch.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => return,
                        next = async { ready_rx.lock().await.recv().await } => next,
                    };
                    let Some((id, job)) = next else { return };

                    tracing::debug!(worker_id, job = %id, "job start");
                    let ctx = JobContext {
                        worker_id,
                        cancel: token.clone(),
                    };
                    if let Err(err) = job.run(ctx).await {
                        // A job torn down by an in-flight cancellation is not
                        // the originating failure.
                        if token.is_cancelled() && matches!(err, UbError::Canceled) {
                            return;
                        }
                        tracing::debug!(worker_id, job = %id, error = %err, "job failed");
                        let _ = err_tx.try_send(UbError::JobFailed {
                            id,
                            source: Box::new(err),
                        });
                        token.cancel();
                        return;
                    }

                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = done_tx.send(id) => {}
                    }
                }
            }));
        }
        drop(done_tx);
        drop(err_tx);

        let mut queued: HashSet<String> = HashSet::with_capacity(total);
        for (id, degree) in &in_degree {
            if *degree == 0 {
                queued.insert(id.clone());
                let job = Arc::clone(&job_by_id[id]);
                let _ = ready_tx.try_send((id.clone(), job));
            }
        }

        if queued.is_empty() {
            batch.cancel();
            drop(ready_tx);
            for handle in handles {
                let _ = handle.await;
            }
            return Err(UbError::NoRunnableJobs);
        }

        let mut finished = 0;
        let mut result = Ok(());
        while finished < total {
            tokio::select! {
                err = err_rx.recv() => {
                    result = Err(err.unwrap_or(UbError::Canceled));
                    break;
                }
                _ = cancel.cancelled() => {
                    result = Err(err_rx.try_recv().unwrap_or(UbError::Canceled));
                    break;
                }
                done = done_rx.recv() => {
                    let Some(id) = done else {
                        result = Err(err_rx.try_recv().unwrap_or(UbError::Canceled));
                        break;
                    };
                    finished += 1;
                    for dependent in dependents.get(&id).into_iter().flatten() {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree -= 1;
                            if *degree == 0 && !queued.contains(dependent) {
                                queued.insert(dependent.clone());
                                let job = Arc::clone(&job_by_id[dependent]);
                                let _ = ready_tx.try_send((dependent.clone(), job));
                            }
                        }
                    }
                }
            }
        }

        batch.cancel();
        drop(ready_tx);
        for handle in handles {
            let _ = handle.await;
        }

        result
    }
}
