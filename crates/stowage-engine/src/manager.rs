//! Registry of active jobs and the manager that runs them.

use crate::backend::BackendRegistry;
use crate::config::EngineConfig;
use crate::definition::{JobDefinition, JobKind};
use crate::error::{EngineError, Result};
use crate::job::{Job, JobId, JobStatus, ManagedJob};
use crate::notify::Notifier;
use crate::transform::TransformRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const DONE_CHANNEL_CAPACITY: usize = 16;

/// Active jobs by id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Arc<dyn ManagedJob>>>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<dyn ManagedJob>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job. Fails if the id is already active.
    pub fn add(&self, job: Arc<dyn ManagedJob>) -> Result<()> {
        let mut jobs = self.jobs();
        let id = job.id().clone();
        if jobs.contains_key(&id) {
            return Err(EngineError::JobExists(id.to_string()));
        }
        jobs.insert(id, job);
        Ok(())
    }

    /// Remove and return a job.
    pub fn remove(&self, id: &JobId) -> Option<Arc<dyn ManagedJob>> {
        self.jobs().remove(id)
    }

    /// Look up an active job.
    pub fn lookup(&self, id: &JobId) -> Option<Arc<dyn ManagedJob>> {
        self.jobs().get(id).cloned()
    }

    /// Ids of every active job, sorted.
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of active jobs.
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    /// True if no job is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a spawned job.
pub struct JobHandle {
    id: JobId,
    task: JoinHandle<Result<JobStatus>>,
}

impl JobHandle {
    /// Id of the job.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(self) -> Result<JobStatus> {
        self.task
            .await
            .map_err(|e| EngineError::Join(format!("job {}: {e}", self.id)))?
    }
}

/// Builds jobs from definitions, runs them and reclaims their registry slots on completion.
pub struct Manager {
    registry: Arc<JobRegistry>,
    backends: BackendRegistry,
    transforms: TransformRegistry,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    done: mpsc::Sender<JobId>,
    reaper: JoinHandle<()>,
}

impl Manager {
    /// Create a manager and start its completion reaper. Must be called inside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        backends: BackendRegistry,
        transforms: TransformRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(JobRegistry::new());
        let (done, done_rx) = mpsc::channel(DONE_CHANNEL_CAPACITY);
        let reaper = tokio::spawn(reap(registry.clone(), done_rx));
        Ok(Self {
            registry,
            backends,
            transforms,
            config,
            notifier,
            done,
            reaper,
        })
    }

    /// Manager with the built-in backends and transforms.
    pub fn with_builtins(config: EngineConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        Self::new(
            config,
            BackendRegistry::with_builtins(),
            TransformRegistry::with_builtins(),
            notifier,
        )
    }

    /// Build a job from `definition` and start it.
    ///
    /// Configuration errors and duplicate ids are rejected before anything runs.
    pub fn submit(
        &self,
        kind: JobKind,
        definition: JobDefinition,
        id: Option<JobId>,
    ) -> Result<JobHandle> {
        let id = id.unwrap_or_else(JobId::generate);
        if self.registry.lookup(&id).is_some() {
            return Err(EngineError::JobExists(id.to_string()));
        }
        let job = Job::new(
            id,
            kind,
            definition,
            self.config.clone(),
            &self.backends,
            &self.transforms,
            self.notifier.clone(),
        )?;
        self.spawn(Arc::new(job))
    }

    /// Register and start an already built job. The job is `Running` when this returns.
    pub fn spawn(&self, job: Arc<dyn ManagedJob>) -> Result<JobHandle> {
        let id = job.id().clone();
        if self.registry.lookup(&id).is_some() {
            return Err(EngineError::JobExists(id.to_string()));
        }
        job.start()?;
        self.registry.add(job.clone())?;
        let done = self.done.clone();
        let task = tokio::spawn(async move { job.run(done).await });
        info!(job_id = %id, "job submitted");
        Ok(JobHandle { id, task })
    }

    /// Request cancellation of an active job.
    pub fn cancel(&self, id: &JobId) -> Result<()> {
        self.registry
            .lookup(id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?
            .cancel()
    }

    /// Status of an active job.
    pub fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.registry
            .lookup(id)
            .map(|job| job.status())
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    /// Ids of active jobs.
    pub fn active(&self) -> Vec<JobId> {
        self.registry.ids()
    }

    /// The registry backing this manager.
    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap(registry: Arc<JobRegistry>, mut done: mpsc::Receiver<JobId>) {
    while let Some(id) = done.recv().await {
        if registry.remove(&id).is_some() {
            debug!(job_id = %id, "job removed from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ComponentSpec, PathSpec};
    use crate::job::JobState;
    use crate::notify::NullNotifier;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Job that stays running until released.
    struct Parked {
        id: JobId,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ManagedJob for Parked {
        fn id(&self) -> &JobId {
            &self.id
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn run(&self, done: mpsc::Sender<JobId>) -> Result<JobStatus> {
            self.release.notified().await;
            let _ = done.send(self.id.clone()).await;
            Ok(self.status())
        }
        fn cancel(&self) -> Result<()> {
            self.release.notify_one();
            Ok(())
        }
        fn status(&self) -> JobStatus {
            crate::job::JobMeta::new(self.id.clone(), JobKind::Backup).snapshot()
        }
    }

    async fn wait_until_empty(manager: &Manager) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.active().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry should drain");
    }

    #[test]
    fn test_registry_add_remove_lookup() {
        let registry = JobRegistry::new();
        let job: Arc<dyn ManagedJob> = Arc::new(Parked {
            id: JobId::from("a"),
            release: Arc::new(Notify::new()),
        });
        registry.add(job.clone()).unwrap();
        assert!(matches!(registry.add(job), Err(EngineError::JobExists(_))));
        assert!(registry.lookup(&JobId::from("a")).is_some());
        assert_eq!(registry.ids(), vec![JobId::from("a")]);
        assert!(registry.remove(&JobId::from("a")).is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_active_id_rejected() {
        let manager =
            Manager::with_builtins(EngineConfig::default(), Arc::new(NullNotifier)).unwrap();
        let release = Arc::new(Notify::new());
        let handle = manager
            .spawn(Arc::new(Parked {
                id: JobId::from("dup"),
                release: release.clone(),
            }))
            .unwrap();

        let def = JobDefinition {
            to: vec![ComponentSpec::named("log")],
            paths: vec![PathSpec::new("/nonexistent")],
            ..Default::default()
        };
        assert!(matches!(
            manager.submit(JobKind::Backup, def, Some(JobId::from("dup"))),
            Err(EngineError::JobExists(_))
        ));

        manager.cancel(&JobId::from("dup")).unwrap();
        handle.wait().await.unwrap();
        wait_until_empty(&manager).await;
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let manager =
            Manager::with_builtins(EngineConfig::default(), Arc::new(NullNotifier)).unwrap();
        let id = JobId::from("ghost");
        assert!(matches!(manager.cancel(&id), Err(EngineError::JobNotFound(_))));
        assert!(matches!(manager.status(&id), Err(EngineError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_finished_job_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("{i}")), vec![i as u8; 100]).unwrap();
        }
        let manager =
            Manager::with_builtins(EngineConfig::default(), Arc::new(NullNotifier)).unwrap();
        let def = JobDefinition {
            to: vec![ComponentSpec::named("log")],
            paths: vec![PathSpec::new(dir.path())],
            ..Default::default()
        };
        let handle = manager.submit(JobKind::Backup, def, None).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.state, JobState::Finished);
        assert_eq!(status.complete, 5);
        wait_until_empty(&manager).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_right_after_submit() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..50 {
            std::fs::write(dir.path().join(format!("{i}")), vec![i as u8; 64]).unwrap();
        }
        let manager =
            Manager::with_builtins(EngineConfig::default(), Arc::new(NullNotifier)).unwrap();
        let def = JobDefinition {
            to: vec![ComponentSpec::named("log")],
            paths: vec![PathSpec::new(dir.path())],
            ..Default::default()
        };
        let handle = manager.submit(JobKind::Backup, def, None).unwrap();
        let id = handle.id().clone();
        assert_eq!(manager.status(&id).unwrap().state, JobState::Running);

        manager.cancel(&id).unwrap();
        manager.cancel(&id).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.state, JobState::Canceled);
        assert!(status.is_balanced());
        wait_until_empty(&manager).await;
    }

    #[test]
    fn test_invalid_engine_config_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(Manager::with_builtins(config, Arc::new(NullNotifier)).is_err());
    }
}
