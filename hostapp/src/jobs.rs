//! Job Queue: accepts long-running work (cluster bootstrap, bulk import),
//! persists it, and lets callers poll by id. The queue itself is a plain
//! FIFO `VecDeque` behind a `parking_lot::Mutex` woken by a `tokio::sync::
//! Notify`, the same wait/wake shape as `frusta::priority_queue`'s binary
//! heap — jobs carry no priority, so a heap would be the wrong structure,
//! but the blocking-pop-via-Notify idiom is identical.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use guildnet_types::{Job, JobKind, JobStatus};

use crate::error::Result;
use crate::store::Collection;

struct Inner {
    queue: VecDeque<Uuid>,
    closed: bool,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    jobs: Collection<Job>,
}

impl JobQueue {
    pub fn new(jobs: Collection<Job>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            jobs,
        }
    }

    pub fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> Result<Job> {
        let job = Job::queued(kind, payload);
        self.jobs.put(&job.id.to_string(), job.clone())?;
        let mut inner = self.inner.lock();
        inner.queue.push_back(job.id);
        drop(inner);
        self.notify.notify_one();
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.jobs.get(&id.to_string())
    }

    async fn pop(&self) -> Option<Uuid> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(id) = inner.queue.pop_front() {
                    return Some(id);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    fn set_progress(&self, id: Uuid, progress: f32) -> Result<()> {
        self.jobs.patch(&id.to_string(), |j| {
            j.progress = progress.clamp(0.0, 1.0);
            j.updated_at = chrono::Utc::now();
            Ok(())
        })?;
        Ok(())
    }

    fn finish(&self, id: Uuid, result: std::result::Result<(), String>) -> Result<()> {
        self.jobs.patch(&id.to_string(), |j| {
            match &result {
                Ok(()) => {
                    j.status = JobStatus::Succeeded;
                    j.progress = 1.0;
                }
                Err(msg) => {
                    j.status = JobStatus::Failed;
                    j.error = Some(msg.clone());
                }
            }
            j.updated_at = chrono::Utc::now();
            Ok(())
        })?;
        Ok(())
    }

    /// Drains the queue, running `run_job` for each job until `cancel` fires.
    /// One task at a time; bootstrap and bulk-import jobs are not
    /// parallelized against each other per process.
    pub async fn run_worker<F, Fut>(&self, cancel: CancellationToken, run_job: F)
    where
        F: Fn(Job, JobQueue) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        loop {
            let id = tokio::select! {
                id = self.pop() => id,
                _ = cancel.cancelled() => None,
            };
            let Some(id) = id else { break };
            let Ok(Some(job)) = self.get(id) else { continue };
            if self
                .jobs
                .patch(&id.to_string(), |j| {
                    j.status = JobStatus::Running;
                    j.updated_at = chrono::Utc::now();
                    Ok(())
                })
                .is_err()
            {
                continue;
            }
            info!(job_id = %id, kind = ?job.kind, "job started");
            let result = run_job(job, self.clone()).await;
            if let Err(e) = &result {
                error!(job_id = %id, error = %e, "job failed");
            }
            let _ = self.finish(id, result);
        }
    }

    pub fn report_progress(&self, id: Uuid, progress: f32) {
        let _ = self.set_progress(id, progress);
    }

    /// Records a job's structured outcome (e.g. bulk-import per-row results).
    pub fn set_result(&self, id: Uuid, result: serde_json::Value) {
        let _ = self.jobs.patch(&id.to_string(), |j| {
            j.result = result.clone();
            j.updated_at = chrono::Utc::now();
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::Store::open(dir.path()).unwrap();
        let coll = store.collection("jobs").unwrap();
        (dir, JobQueue::new(coll))
    }

    #[test]
    fn enqueue_persists_queued_job() {
        let (_dir, q) = queue();
        let job = q
            .enqueue(JobKind::BulkImport, serde_json::json!({"table": "t"}))
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(q.get(job.id).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn worker_drains_fifo_and_marks_succeeded() {
        let (_dir, q) = queue();
        let a = q.enqueue(JobKind::ClusterBootstrap, serde_json::json!({})).unwrap();
        let b = q.enqueue(JobKind::ClusterBootstrap, serde_json::json!({})).unwrap();
        q.close();
        q.run_worker(CancellationToken::new(), |_job, _q| async { Ok(()) })
            .await;
        assert_eq!(q.get(a.id).unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(q.get(b.id).unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn worker_marks_failed_job_with_error_message() {
        let (_dir, q) = queue();
        let job = q.enqueue(JobKind::BulkImport, serde_json::json!({})).unwrap();
        q.close();
        q.run_worker(CancellationToken::new(), |_job, _q| async {
            Err("upstream unavailable".to_string())
        })
        .await;
        let stored = q.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("upstream unavailable"));
    }
}
