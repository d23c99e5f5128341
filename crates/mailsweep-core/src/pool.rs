//! Pool controller: seeds the queue, spawns staggered workers, and owns the
//! shared pause/stop controls.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::probe::ProbeConfig;
use crate::queue::{ResultStore, TaskQueue};
use crate::registry::{ProcessTable, Registry, SysinfoProcessTable, kill_tree, reap_orphans};
use crate::session::SessionFactory;
use crate::task::{RotationPolicy, StartupPolicy, Summary, Task};
use crate::util::jitter_ms;
use crate::worker::{PauseGate, PoolEvent, Reporter, Worker};

/// Pool-level knobs. Worker-level policies ride along so one config value
/// reaches everything.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Base delay between consecutive worker launches.
    pub stagger: Duration,
    /// Extra random launch delay, 0..this many milliseconds.
    pub stagger_jitter_ms: u64,
    /// How long `stop` waits after cancelling before force-killing.
    pub stop_grace: Duration,
    pub probe: ProbeConfig,
    pub startup: StartupPolicy,
    pub rotation: RotationPolicy,
}

impl PoolConfig {
    pub fn new(probe: ProbeConfig) -> Self {
        Self {
            concurrency: 2,
            stagger: Duration::from_millis(1200),
            stagger_jitter_ms: 600,
            stop_grace: Duration::from_secs(2),
            probe,
            startup: StartupPolicy::default(),
            rotation: RotationPolicy::default(),
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }
}

/// Remote control for a running pool. Cheap to clone and hand to a signal
/// handler or UI task.
#[derive(Clone)]
pub struct PoolHandle {
    pause: PauseGate,
    cancel: CancellationToken,
    registry: Registry,
    stop_grace: Duration,
}

impl PoolHandle {
    /// Stop taking new tasks. In-flight probes finish normally.
    pub fn pause(&self) {
        tracing::info!("pool paused");
        self.pause.pause();
    }

    pub fn resume(&self) {
        tracing::info!("pool resumed");
        self.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Cancel the run, give workers a grace period to close their sessions,
    /// then force-kill whatever is still registered.
    pub async fn stop(&self) {
        self.stop_with(SysinfoProcessTable::new()).await;
    }

    pub async fn stop_with<T: ProcessTable>(&self, mut table: T) {
        tracing::info!("pool stopping");
        self.cancel.cancel();
        tokio::time::sleep(self.stop_grace).await;
        for pid in self.registry.registered_pids() {
            kill_tree(&mut table, pid).await;
        }
    }
}

/// The session pool. One `run` per instance.
pub struct ProbePool<F, R>
where
    F: SessionFactory,
    R: Reporter,
{
    config: PoolConfig,
    factory: F,
    reporter: Arc<R>,
    queue: TaskQueue,
    results: ResultStore,
    registry: Registry,
    pause: PauseGate,
    cancel: CancellationToken,
}

impl<F, R> ProbePool<F, R>
where
    F: SessionFactory + 'static,
    F::Session: 'static,
    R: Reporter + 'static,
{
    pub fn new(config: PoolConfig, factory: F, reporter: R) -> Self {
        Self {
            config,
            factory,
            reporter: Arc::new(reporter),
            queue: TaskQueue::new(),
            results: ResultStore::new(),
            registry: Registry::new(),
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            pause: self.pause.clone(),
            cancel: self.cancel.clone(),
            registry: self.registry.clone(),
            stop_grace: self.config.stop_grace,
        }
    }

    /// Remaining tasks, populated once `run` seeds the queue. Tasks put
    /// back by cancellation reappear here.
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    pub fn results(&self) -> ResultStore {
        self.results.clone()
    }

    /// Run the pool to completion against the live process table.
    pub async fn run(self, tasks: Vec<Task>) -> Summary {
        self.run_with(tasks, SysinfoProcessTable::new).await
    }

    /// Run with a caller-supplied process table per worker.
    pub async fn run_with<T, M>(self, tasks: Vec<Task>, make_table: M) -> Summary
    where
        T: ProcessTable + 'static,
        M: Fn() -> T,
    {
        let started = tokio::time::Instant::now();

        // Clear out leftovers from a previous crash before spawning
        // anything that could be mistaken for one.
        reap_orphans(&mut make_table(), &self.registry).await;

        self.queue.seed(tasks);
        tracing::info!(
            tasks = self.queue.len(),
            concurrency = self.config.concurrency,
            "pool starting"
        );

        let mut joins = Vec::with_capacity(self.config.concurrency);
        for slot in 0..self.config.concurrency {
            if slot > 0 {
                let delay = self.config.stagger
                    + Duration::from_millis(jitter_ms(self.config.stagger_jitter_ms));
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancel.cancelled() => break,
                }
            }
            let worker = Worker::new(
                slot,
                self.factory.clone(),
                make_table(),
                self.queue.clone(),
                self.results.clone(),
                self.registry.clone(),
                Arc::new(self.config.probe.clone()),
                self.config.startup.clone(),
                self.config.rotation.clone(),
                self.pause.clone(),
                self.cancel.clone(),
                self.reporter.clone(),
            );
            joins.push(tokio::spawn(worker.run()));
        }

        for join in joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }

        let summary = Summary::compute(started.elapsed(), &self.results.snapshot());
        self.reporter.report(PoolEvent::Complete(&summary));
        summary
    }
}
