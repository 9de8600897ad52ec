//! Scheduled maintenance runner.
//!
//! Every instance schedules every job. Two guards keep a job from running
//! twice: the in-process [`RunningJobs`] registry and the cron lock keyed by
//! the job name, which coordinates across instances.

pub mod jobs;

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    lock::{DEFAULT_MAX_RETRIES, DistributedLock, LockResult},
    store::PurgeCounts,
};

/// What a job did, for the outcome log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub counts: PurgeCounts,
    pub cutoff: Option<DateTime<Utc>>,
}

impl JobReport {
    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, n)| n).sum()
    }
}

#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<JobReport>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyRunning,
    LockHeld { holder: String },
    LockUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Skipped(SkipReason),
    Success(JobReport),
    Failed(String),
}

/// Jobs currently executing in this process.
pub struct RunningJobs {
    started: Mutex<HashMap<&'static str, Instant>>,
    max_duration: Duration,
}

impl RunningJobs {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            started: Mutex::new(HashMap::new()),
            max_duration,
        }
    }

    /// Marks `name` as running. An entry older than the max duration is
    /// treated as leaked and replaced.
    pub fn try_start(&self, name: &'static str) -> bool {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(since) = started.get(name) {
            let elapsed = since.elapsed();
            if elapsed < self.max_duration {
                return false;
            }
            warn!(job = name, elapsed_secs = elapsed.as_secs(), "Force-resetting stuck job");
        }
        started.insert(name, Instant::now());
        true
    }

    pub fn finish(&self, name: &'static str) {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }
}

pub struct MaintenanceRunner {
    jobs: Vec<Arc<dyn MaintenanceJob>>,
    lock: DistributedLock,
    instance_id: String,
    running: Arc<RunningJobs>,
    max_duration: Duration,
    lock_ttl_minutes: i64,
}

impl MaintenanceRunner {
    pub fn new(
        lock: DistributedLock,
        instance_id: impl Into<String>,
        running: Arc<RunningJobs>,
        max_duration: Duration,
        lock_ttl_minutes: i64,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            lock,
            instance_id: instance_id.into(),
            running,
            max_duration,
            lock_ttl_minutes,
        }
    }

    pub fn register(&mut self, job: Arc<dyn MaintenanceJob>) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    pub async fn run_by_name(&self, name: &str) -> Option<JobOutcome> {
        let job = self.jobs.iter().find(|j| j.name() == name)?.clone();
        Some(self.run_job(job.as_ref()).await)
    }

    pub async fn run_job(&self, job: &dyn MaintenanceJob) -> JobOutcome {
        let name = job.name();
        if !self.running.try_start(name) {
            info!(job = name, "Job still running, skipping");
            return JobOutcome::Skipped(SkipReason::AlreadyRunning);
        }

        let outcome = self.run_locked(job).await;
        self.running.finish(name);

        match &outcome {
            JobOutcome::Success(report) => info!(
                job = name,
                rows = report.total(),
                counts = ?report.counts,
                cutoff = ?report.cutoff,
                "Job SUCCESS"
            ),
            JobOutcome::Failed(reason) => error!(job = name, reason = %reason, "Job FAILED"),
            JobOutcome::Skipped(reason) => info!(job = name, reason = ?reason, "Job SKIPPED"),
        }
        outcome
    }

    async fn run_locked(&self, job: &dyn MaintenanceJob) -> JobOutcome {
        let name = job.name();
        let acquired = self
            .lock
            .acquire(name, &self.instance_id, self.lock_ttl_minutes, DEFAULT_MAX_RETRIES)
            .await;
        match acquired {
            Ok(result) if result.is_acquired() => {}
            Ok(LockResult::HeldByOther { holder }) => {
                return JobOutcome::Skipped(SkipReason::LockHeld { holder });
            }
            Ok(_) => return JobOutcome::Skipped(SkipReason::LockUnavailable),
            Err(e) => {
                warn!(job = name, error = %e, "Could not take job lock");
                return JobOutcome::Skipped(SkipReason::LockUnavailable);
            }
        }

        let body = AssertUnwindSafe(job.run(Utc::now())).catch_unwind();
        let outcome = match tokio::time::timeout(self.max_duration, body).await {
            Ok(Ok(Ok(report))) => JobOutcome::Success(report),
            Ok(Ok(Err(e))) => JobOutcome::Failed(format!("{e:#}")),
            Ok(Err(_)) => JobOutcome::Failed("job panicked".into()),
            Err(_) => JobOutcome::Failed(format!(
                "exceeded max duration of {}s",
                self.max_duration.as_secs()
            )),
        };

        if let Err(e) = self.lock.release(name).await {
            error!(job = name, error = %e, "Failed to release job lock");
        }
        outcome
    }

    /// Spawns one ticking loop per registered job.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        self.jobs
            .iter()
            .cloned()
            .map(|job| {
                let runner = Arc::clone(&self);
                tokio::spawn(async move {
                    let period = job.interval();
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    info!(job = job.name(), every_secs = period.as_secs(), "Scheduled job");
                    loop {
                        ticker.tick().await;
                        runner.run_job(job.as_ref()).await;
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::{MemoryStore, Store};

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    struct TestJob {
        behaviour: Behaviour,
        runs: AtomicU32,
    }

    impl TestJob {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MaintenanceJob for TestJob {
        fn name(&self) -> &'static str {
            "test-job"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(JobReport {
                    counts: vec![("orders", 3)],
                    cutoff: Some(now),
                }),
                Behaviour::Fail => anyhow::bail!("boom"),
                Behaviour::Panic => panic!("job blew up"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(JobReport::default())
                }
            }
        }
    }

    fn runner(store: Arc<MemoryStore>, instance: &str) -> MaintenanceRunner {
        let max = Duration::from_secs(300);
        MaintenanceRunner::new(
            DistributedLock::new(store).with_backoff_base(Duration::from_millis(1)),
            instance,
            Arc::new(RunningJobs::new(max)),
            max,
            60,
        )
    }

    #[tokio::test]
    async fn successful_run_reports_counts_and_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(store.clone(), "a");
        let job = TestJob::new(Behaviour::Succeed);

        let outcome = runner.run_job(job.as_ref()).await;

        match outcome {
            JobOutcome::Success(report) => assert_eq!(report.total(), 3),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.find_lock("test-job").await.unwrap().is_none());
        assert!(!runner.running.is_running("test-job"));
    }

    #[tokio::test]
    async fn held_lock_skips_the_job() {
        let store = Arc::new(MemoryStore::new());
        DistributedLock::new(store.clone())
            .acquire("test-job", "b", 60, 0)
            .await
            .unwrap();
        let runner = runner(store.clone(), "a");
        let job = TestJob::new(Behaviour::Succeed);

        let outcome = runner.run_job(job.as_ref()).await;

        assert_eq!(
            outcome,
            JobOutcome::Skipped(SkipReason::LockHeld { holder: "b".into() })
        );
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        assert_eq!(store.find_lock("test-job").await.unwrap().unwrap().instance_id, "b");
    }

    #[tokio::test]
    async fn transient_lock_failure_skips_the_job() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_lock_inserts(10);
        let runner = runner(store.clone(), "a");
        let job = TestJob::new(Behaviour::Succeed);

        let outcome = runner.run_job(job.as_ref()).await;

        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::LockUnavailable));
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_jobs_release_the_lock() {
        for behaviour in [Behaviour::Fail, Behaviour::Panic] {
            let store = Arc::new(MemoryStore::new());
            let runner = runner(store.clone(), "a");
            let job = TestJob::new(behaviour);

            let outcome = runner.run_job(job.as_ref()).await;

            assert!(matches!(outcome, JobOutcome::Failed(_)), "{outcome:?}");
            assert!(store.find_lock("test-job").await.unwrap().is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_past_max_duration_are_failed() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(store.clone(), "a");
        let job = TestJob::new(Behaviour::Hang);

        let outcome = runner.run_job(job.as_ref()).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed("exceeded max duration of 300s".into())
        );
        assert!(store.find_lock("test-job").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn running_registry_blocks_until_force_reset() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(store, "a");
        let job = TestJob::new(Behaviour::Succeed);
        assert!(runner.running.try_start("test-job"));

        let outcome = runner.run_job(job.as_ref()).await;
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::AlreadyRunning));

        tokio::time::advance(Duration::from_secs(301)).await;
        let outcome = runner.run_job(job.as_ref()).await;
        assert!(matches!(outcome, JobOutcome::Success(_)));
    }

    #[tokio::test]
    async fn run_by_name_finds_registered_jobs() {
        let store = Arc::new(MemoryStore::new());
        let mut runner = runner(store, "a");
        runner.register(TestJob::new(Behaviour::Succeed));

        assert_eq!(runner.job_names(), vec!["test-job"]);
        assert!(runner.run_by_name("test-job").await.is_some());
        assert!(runner.run_by_name("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_keeps_ticking_after_failures() {
        let store = Arc::new(MemoryStore::new());
        let mut runner = runner(store, "a");
        let job = TestJob::new(Behaviour::Fail);
        runner.register(job.clone());

        let handles = Arc::new(runner).start();
        tokio::time::sleep(Duration::from_secs(185)).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        for handle in handles {
            handle.abort();
        }
    }
}
