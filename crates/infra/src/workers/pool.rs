use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use clinflow_core::JobState;

use crate::jobs::{JobStore, JobStoreError};
use crate::workflow::{StateMachine, StepOutcome, StepReport};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Thread and worker-id prefix
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(200),
            name: "clinflow-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub stages_executed: u64,
    pub retries_scheduled: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
    pub commit_conflicts: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

impl PoolStats {
    pub fn record(&mut self, report: &StepReport) {
        match &report.outcome {
            StepOutcome::LeaseLost => {
                self.commit_conflicts += 1;
                return;
            }
            StepOutcome::Cancelled => self.jobs_cancelled += 1,
            StepOutcome::RetryScheduled { .. } => {
                self.stages_executed += 1;
                self.retries_scheduled += 1;
            }
            _ => self.stages_executed += 1,
        }
        match report.state {
            JobState::Succeeded => self.jobs_succeeded += 1,
            JobState::Failed => self.jobs_failed += 1,
            JobState::DeadLettered => self.jobs_dead_lettered += 1,
            _ => {}
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every worker to finish its
    /// current step.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// N threads stepping one shared state machine.
pub struct WorkerPool<S> {
    machine: Arc<StateMachine<S>>,
}

impl<S> WorkerPool<S>
where
    S: JobStore + 'static,
{
    pub fn new(machine: StateMachine<S>) -> Self {
        Self {
            machine: Arc::new(machine),
        }
    }

    pub fn machine(&self) -> &StateMachine<S> {
        &self.machine
    }

    /// Process one stage inline on the calling thread.
    pub fn step_once(&self, worker_id: &str) -> Result<Option<StepReport>, JobStoreError> {
        self.machine.step(worker_id)
    }

    /// Process inline until nothing is runnable.
    pub fn drain(&self, worker_id: &str) -> Result<PoolStats, JobStoreError> {
        let mut stats = PoolStats {
            workers: 1,
            ..PoolStats::default()
        };
        while let Some(report) = self.machine.step(worker_id)? {
            stats.record(&report);
        }
        Ok(stats)
    }

    /// Spawn `config.workers` threads.
    pub fn spawn(self, config: WorkerPoolConfig) -> std::io::Result<WorkerPoolHandle> {
        let stats = Arc::new(Mutex::new(PoolStats {
            workers: config.workers,
            ..PoolStats::default()
        }));
        let mut handle = WorkerPoolHandle {
            shutdown: Vec::with_capacity(config.workers),
            joins: Vec::with_capacity(config.workers),
            stats: stats.clone(),
            started: Instant::now(),
        };

        for n in 0..config.workers {
            let worker_id = format!("{}-{}", config.name, n);
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let machine = self.machine.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval;
            let spawned = thread::Builder::new().name(worker_id.clone()).spawn(move || {
                worker_loop(&worker_id, &machine, poll_interval, shutdown_rx, &stats)
            });
            match spawned {
                Ok(join) => {
                    handle.shutdown.push(shutdown_tx);
                    handle.joins.push(join);
                }
                Err(e) => {
                    handle.shutdown();
                    return Err(e);
                }
            }
        }

        info!(pool = %config.name, workers = config.workers, "worker pool started");
        Ok(handle)
    }
}

fn worker_loop<S: JobStore>(
    worker_id: &str,
    machine: &StateMachine<S>,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<PoolStats>,
) {
    debug!(worker = worker_id, "worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let idle = match machine.step(worker_id) {
            Ok(Some(report)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&report);
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(worker = worker_id, error = %e, "worker step failed");
                if let Ok(mut s) = stats.lock() {
                    s.store_errors += 1;
                }
                true
            }
        };

        if idle {
            match shutdown_rx.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    debug!(worker = worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        IdempotencyKey, IdempotencyLedger, InMemoryJobStore, Job, NewSubmission, RetryController,
        StagePolicies,
    };
    use crate::stages::StageSet;
    use clinflow_core::{Artifact, Case, PatientRef};
    use clinflow_providers::{InMemoryKnowledgeBase, MockProvider};

    fn pool(store: Arc<InMemoryJobStore>) -> WorkerPool<Arc<InMemoryJobStore>> {
        let stages = StageSet::new(
            Arc::new(InMemoryKnowledgeBase::new()),
            Arc::new(MockProvider::new()),
            3,
            1.0,
        );
        let retry = RetryController::new(StagePolicies::with_delays(Duration::ZERO, Duration::ZERO));
        WorkerPool::new(StateMachine::new(store, stages, retry))
    }

    fn submit(store: &InMemoryJobStore) {
        let key = IdempotencyKey::generate();
        let case = Case::open(PatientRef::parse("anon-001").unwrap());
        let artifacts = Artifact::notes(case.id, "8mm nodule, stable on prior CT")
            .unwrap()
            .into_iter()
            .collect();
        let job = Job::new(case.id, key.as_str(), "medgemma-4b-it");
        store.resolve(&key, NewSubmission { case, artifacts, job }).unwrap();
    }

    #[test]
    fn drain_runs_every_job_to_completion() {
        let store = InMemoryJobStore::arc();
        submit(&store);
        submit(&store);

        let stats = pool(store.clone()).drain("inline").unwrap();
        assert_eq!(stats.stages_executed, 10);
        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(store.stats().unwrap().succeeded, 2);
    }

    #[test]
    fn spawned_pool_processes_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        for _ in 0..4 {
            submit(&store);
        }

        let handle = pool(store.clone())
            .spawn(
                WorkerPoolConfig::default()
                    .with_workers(3)
                    .with_poll_interval(Duration::from_millis(5))
                    .with_name("test-pool"),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.stats().jobs_succeeded < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(store.stats().unwrap().succeeded, 4);
        assert_eq!(stats.workers, 3);
        assert_eq!(stats.jobs_succeeded, 4);
        assert_eq!(stats.stages_executed, 20);
    }
}
