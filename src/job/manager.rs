//! Job lifecycle orchestration.
//!
//! The [`JobManager`] is the single point of coordination between the
//! HTTP-facing allocation path, the durable [`JobStore`], and concurrent
//! execution of the transcription pipeline. It owns:
//!
//! - an unbounded in-memory FIFO queue (producers: the upload path and
//!   startup recovery; consumer: the dispatch loop),
//! - the dispatch loop, which serializes dequeue but launches each job's
//!   processing as an independent task so execution runs in parallel,
//! - startup recovery, which re-enqueues jobs orphaned by a prior crash,
//! - expiry-driven reclamation of records and workdirs.
//!
//! Store mutations from one manager instance are serialized through a
//! single async mutex so a cleanup-triggered delete can never interleave
//! destructively with a dispatch-triggered save for the same record. All
//! store I/O is offloaded via `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::Config;
use crate::error::StoreError;
use crate::job::store::JobStore;
use crate::job::{Job, JobOptions, JobStatus};
use crate::pipeline::Processor;

/// Progress value a job is stamped with the moment it leaves the queue.
const DISPATCH_PROGRESS: u8 = 5;

struct Inner {
    store: Arc<JobStore>,
    processor: Arc<dyn Processor>,
    /// Serializes save/delete for this manager instance.
    write_lock: Mutex<()>,
    /// Jobs enqueued but not yet finished; drives [`JobManager::wait_idle`].
    pending: AtomicUsize,
    idle_notify: Notify,
}

impl Inner {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let store = self.store.clone();
        let job = job.clone();
        run_blocking(move || store.save(&job)).await
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let store = self.store.clone();
        let job_id = job_id.to_string();
        run_blocking(move || store.delete(&job_id)).await
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let store = self.store.clone();
        let job_id = job_id.to_string();
        run_blocking(move || store.get(&job_id)).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let store = self.store.clone();
        run_blocking(move || store.list()).await
    }

    /// Delete a job's record and its entire workdir.
    async fn remove(&self, job_id: &str) {
        let job = match self.load(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id, "could not load job during removal: {e}");
                None
            }
        };
        if let Err(e) = self.delete(job_id).await {
            tracing::error!(job_id, "failed to delete job record: {e}");
        }
        if let Some(job) = job {
            let workdir = job.workdir.clone();
            let result = run_blocking(move || {
                match std::fs::remove_dir_all(&workdir) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StoreError::Io(e)),
                }
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(job_id, "failed to remove workdir: {e}");
            }
        }
    }

    /// Run one job to its terminal state. Failures are contained here:
    /// they mark this job `error` and never reach the dispatch loop.
    async fn run_job(self: Arc<Self>, mut job: Job) {
        let _done = PendingGuard(&self);
        match self.processor.process(&mut job).await {
            Ok(()) => {
                job.status = JobStatus::Done;
                job.progress = 100;
                tracing::info!(job_id = %job.id, "job completed");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, "job failed: {e}");
                job.status = JobStatus::Error;
                job.error = Some(e.to_string());
                job.progress = 100;
            }
        }
        if let Err(e) = self.save(&job).await {
            tracing::error!(job_id = %job.id, "failed to persist final job state: {e}");
        }
    }
}

/// Decrements the pending count when the owning task finishes, even if the
/// processor panicked.
struct PendingGuard<'a>(&'a Inner);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle_notify.notify_waiters();
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
    }
}

/// Coordinates allocation, durable persistence, and concurrent processing
/// of transcription jobs.
pub struct JobManager {
    inner: Arc<Inner>,
    storage_dir: PathBuf,
    retention: Duration,
    queue_tx: mpsc::UnboundedSender<Job>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl JobManager {
    /// Create a manager over an existing store. The dispatch loop starts
    /// lazily on the first `enqueue`.
    pub fn new(config: &Config, store: JobStore, processor: Arc<dyn Processor>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(store),
                processor,
                write_lock: Mutex::new(()),
                pending: AtomicUsize::new(0),
                idle_notify: Notify::new(),
            }),
            storage_dir: config.storage_dir.clone(),
            retention: config.job_retention,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            dispatch: Mutex::new(None),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Spawn the dispatch loop if it is not already running.
    pub async fn start(&self) {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_some() {
            return;
        }
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            return;
        };
        let inner = self.inner.clone();
        let tasks = self.tasks.clone();
        *dispatch = Some(tokio::spawn(async move {
            // Sole consumer: dequeue is serialized, execution is not.
            while let Some(mut job) = queue_rx.recv().await {
                job.status = JobStatus::Running;
                job.progress = DISPATCH_PROGRESS;
                if let Err(e) = inner.save(&job).await {
                    tracing::error!(job_id = %job.id, "failed to persist running state: {e}");
                }
                tracing::info!(job_id = %job.id, "dispatching job");
                let inner = inner.clone();
                let mut tasks = tasks.lock().await;
                // Reap finished tasks so the set doesn't grow unbounded.
                while tasks.try_join_next().is_some() {}
                tasks.spawn(inner.run_job(job));
            }
        }));
    }

    /// Generate a fresh `queued` job with a private workdir, persist it,
    /// and return it. Succeeds before any upload bytes are accepted so the
    /// caller has a handle to attach the upload to.
    pub async fn allocate(&self, options: JobOptions) -> Result<Job, StoreError> {
        let job = Job::create(options, self.retention, &self.storage_dir);
        let workdir = job.workdir.clone();
        run_blocking(move || std::fs::create_dir_all(&workdir).map_err(StoreError::Io)).await?;
        self.inner.save(&job).await?;
        tracing::debug!(job_id = %job.id, "allocated job");
        Ok(job)
    }

    /// Push a job onto the work queue and ensure the dispatch loop runs.
    /// The queue is unbounded: this never blocks the caller on capacity.
    pub async fn enqueue(&self, job: Job) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(job).is_err() {
            // Receiver only drops on shutdown; late submissions are dropped.
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("enqueue after shutdown, job dropped");
            return;
        }
        self.start().await;
    }

    /// Allocate and immediately enqueue, for callers that have the full
    /// input available up front.
    pub async fn submit(&self, options: JobOptions) -> Result<Job, StoreError> {
        let job = self.allocate(options).await?;
        self.enqueue(job.clone()).await;
        Ok(job)
    }

    /// Load a job by id. Expired jobs are reclaimed on sight and reported
    /// as absent; unreadable records are treated as absent.
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let job = match self.inner.load(job_id).await {
            Ok(job) => job?,
            Err(e) => {
                tracing::warn!(job_id, "treating unreadable job record as absent: {e}");
                return None;
            }
        };
        if job.is_expired_at(Utc::now()) {
            self.inner.remove(job_id).await;
            return None;
        }
        Some(job)
    }

    /// Forcibly remove a job's record and workdir, regardless of state.
    /// Used to cancel an in-progress upload that failed validation.
    pub async fn discard(&self, job_id: &str) {
        self.inner.remove(job_id).await;
    }

    /// Reclaim every persisted job whose retention window has elapsed.
    pub async fn cleanup_expired(&self) {
        let jobs = match self.inner.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("failed to list jobs for cleanup: {e}");
                return;
            }
        };
        let now = Utc::now();
        for job in jobs {
            if job.is_expired_at(now) {
                tracing::info!(job_id = %job.id, "reclaiming expired job");
                self.inner.remove(&job.id).await;
            }
        }
    }

    /// Startup recovery: reclaim expired jobs, and reset + re-enqueue any
    /// job found `queued` or `running` so a process restart never silently
    /// loses in-flight work. The rerun starts from the persisted upload;
    /// partial intermediate state is overwritten.
    pub async fn load_existing_jobs(&self) -> Result<(), StoreError> {
        let jobs = self.inner.list().await?;
        let now = Utc::now();
        for mut job in jobs {
            if job.is_expired_at(now) {
                self.inner.remove(&job.id).await;
                continue;
            }
            if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                tracing::info!(job_id = %job.id, status = ?job.status, "recovering interrupted job");
                job.status = JobStatus::Queued;
                self.inner.save(&job).await?;
                self.enqueue(job).await;
            }
        }
        Ok(())
    }

    /// Stop the dispatch loop, cancel all in-flight processing tasks, and
    /// wait for their cancellation to be acknowledged. After this returns
    /// no task writes to the store; jobs caught mid-flight keep their last
    /// persisted status and are requeued by the next startup's recovery.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        tracing::info!("job manager shut down");
    }

    /// Wait until every enqueued job has reached a terminal state (or was
    /// cancelled). Completion signal for tests and graceful drains.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::error::PipelineError;
    use crate::job::JobMeta;
    use crate::pipeline::NullProcessor;

    fn test_config(root: &Path) -> Config {
        Config {
            storage_dir: root.to_path_buf(),
            ..Config::default()
        }
    }

    fn manager_with(root: &Path, processor: Arc<dyn Processor>) -> JobManager {
        let config = test_config(root);
        let store = JobStore::new(root).unwrap();
        JobManager::new(&config, store, processor)
    }

    /// Stamps each job's meta with its own id, optionally after a delay
    /// taken from the tempo option (interpreted as milliseconds).
    struct StampingProcessor;

    #[async_trait]
    impl Processor for StampingProcessor {
        async fn process(&self, job: &mut Job) -> Result<(), PipelineError> {
            if let Some(delay_ms) = job.options.tempo {
                tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            }
            job.meta = Some(JobMeta {
                title: Some(job.id.clone()),
                ..JobMeta::default()
            });
            Ok(())
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl Processor for FailingProcessor {
        async fn process(&self, _job: &mut Job) -> Result<(), PipelineError> {
            Err(PipelineError::Decode {
                reason: "unsupported codec".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn allocate_then_get_returns_queued_job() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(NullProcessor));

        let options = JobOptions {
            tempo: Some(90),
            force_key: Some("D major".to_string()),
            ..JobOptions::default()
        };
        let job = manager.allocate(options.clone()).await.unwrap();

        let fetched = manager.get(&job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.options, options);
        assert!(fetched.artifacts.is_empty());
        assert!(job.workdir.is_dir());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn submit_runs_job_to_done() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(NullProcessor));

        let job = manager.submit(JobOptions::default()).await.unwrap();
        manager.wait_idle().await;

        let fetched = manager.get(&job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Done);
        assert_eq!(fetched.progress, 100);
        assert!(fetched.error.is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn processor_failure_is_contained_and_recorded() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(FailingProcessor));

        let failed = manager.submit(JobOptions::default()).await.unwrap();
        manager.wait_idle().await;

        let fetched = manager.get(&failed.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Error);
        assert_eq!(fetched.progress, 100);
        assert!(
            fetched.error.as_deref().unwrap().contains("unsupported codec"),
            "error message should carry the failure reason"
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn expired_job_is_reclaimed_on_get() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.job_retention = Duration::ZERO;
        let store = JobStore::new(dir.path()).unwrap();
        let manager = JobManager::new(&config, store, Arc::new(NullProcessor));

        let job = manager.allocate(JobOptions::default()).await.unwrap();
        assert!(job.workdir.is_dir());

        assert!(manager.get(&job.id).await.is_none());
        assert!(!job.workdir.exists(), "workdir should be reclaimed");

        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.get(&job.id).unwrap().is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_expired_removes_record_and_workdir() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.job_retention = Duration::ZERO;
        let store = JobStore::new(dir.path()).unwrap();
        let manager = JobManager::new(&config, store, Arc::new(NullProcessor));

        let job = manager.allocate(JobOptions::default()).await.unwrap();
        manager.cleanup_expired().await;

        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.get(&job.id).unwrap().is_none());
        assert!(!job.workdir.exists());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn discard_removes_job_unconditionally() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(NullProcessor));

        let job = manager.allocate(JobOptions::default()).await.unwrap();
        manager.discard(&job.id).await;

        assert!(manager.get(&job.id).await.is_none());
        assert!(!job.workdir.exists());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_requeues_interrupted_job() {
        let dir = tempdir().unwrap();

        // Persist a job that a previous process left mid-flight.
        let store = JobStore::new(dir.path()).unwrap();
        let mut orphan = Job::create(
            JobOptions::default(),
            Duration::from_secs(600),
            dir.path(),
        );
        std::fs::create_dir_all(&orphan.workdir).unwrap();
        orphan.status = JobStatus::Running;
        orphan.progress = 42;
        store.save(&orphan).unwrap();

        let manager = manager_with(dir.path(), Arc::new(NullProcessor));
        manager.load_existing_jobs().await.unwrap();
        manager.wait_idle().await;

        let fetched = manager.get(&orphan.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Done);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_does_not_reprocess_completed_jobs() {
        let dir = tempdir().unwrap();

        // Manager A runs a job to completion over the shared root.
        let manager_a = manager_with(dir.path(), Arc::new(StampingProcessor));
        let job = manager_a.submit(JobOptions::default()).await.unwrap();
        manager_a.wait_idle().await;
        manager_a.shutdown().await;

        let done = {
            let store = JobStore::new(dir.path()).unwrap();
            store.get(&job.id).unwrap().unwrap()
        };
        assert_eq!(done.status, JobStatus::Done);

        // Manager B over the same root must see the record unchanged and
        // must not spuriously reprocess it.
        let manager_b = manager_with(dir.path(), Arc::new(FailingProcessor));
        manager_b.load_existing_jobs().await.unwrap();
        manager_b.wait_idle().await;

        let fetched = manager_b.get(&job.id).await.unwrap();
        assert_eq!(fetched, done);

        manager_b.shutdown().await;
    }

    #[tokio::test]
    async fn staggered_jobs_complete_independently() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(StampingProcessor));

        // Third job finishes fastest; completion order differs from
        // submission order, but every record reflects only its own run.
        let mut submitted = Vec::new();
        for delay_ms in [120u32, 60, 5] {
            let job = manager
                .submit(JobOptions {
                    tempo: Some(delay_ms),
                    ..JobOptions::default()
                })
                .await
                .unwrap();
            submitted.push(job);
        }
        manager.wait_idle().await;

        for job in &submitted {
            let fetched = manager.get(&job.id).await.unwrap();
            assert_eq!(fetched.status, JobStatus::Done);
            assert!(fetched.error.is_none());
            assert_eq!(
                fetched.meta.as_ref().and_then(|m| m.title.as_deref()),
                Some(job.id.as_str()),
                "record must carry its own outcome"
            );
            assert_eq!(fetched.options.tempo, job.options.tempo);
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_dispatch() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(NullProcessor));
        let job = manager.submit(JobOptions::default()).await.unwrap();
        manager.wait_idle().await;
        manager.shutdown().await;

        // Queue is closed; a late enqueue is dropped rather than panicking.
        manager.enqueue(job).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_record_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(NullProcessor));
        std::fs::write(dir.path().join("jobs").join("mangled.json"), b"{{{").unwrap();

        assert!(manager.get("mangled").await.is_none());

        manager.shutdown().await;
    }

    #[test]
    fn artifact_map_serializes_in_stable_order() {
        // BTreeMap keys serialize in a stable order, keeping on-disk
        // records diffable across saves.
        let mut artifacts: BTreeMap<crate::job::ArtifactKind, std::path::PathBuf> =
            BTreeMap::new();
        artifacts.insert(crate::job::ArtifactKind::Midi, "b".into());
        artifacts.insert(crate::job::ArtifactKind::Pdf, "a".into());
        let json = serde_json::to_string(&artifacts).unwrap();
        assert!(json.find("pdf").unwrap() < json.find("midi").unwrap());
    }
}
