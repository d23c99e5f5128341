//! Per-slot worker loop: owns one session, drains the shared queue, rotates
//! on detection, and records exactly one result per task.
//!
//! Rotation policy is a pure decision table ([`decide`]) so the
//! retry-vs-record behaviour is testable without a session at all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::probe::{ProbeConfig, run_probe};
use crate::queue::{ResultStore, TaskQueue};
use crate::registry::{ProcessTable, Registry, kill_tree};
use crate::session::{ProbeSession, ProfileMode, SessionFactory, SessionHandle, acquire_ready};
use crate::task::{Outcome, ProbeResult, RotationPolicy, StartupPolicy, Summary, Task};

/// Why a probe attempt failed, from the rotation policy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bot wall, torn-down window, or debounced error banner.
    Detected,
    /// Session transport fault with no detection marker.
    Transport,
    /// An element or deadline timed out on an otherwise healthy page.
    Timeout,
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Replace the session with a fresh disposable one and retry the task.
    RetryAfterRotation,
    /// Rotation budget spent; record an error result and move on.
    RecordError,
    /// Timeouts are final verdicts. The session is kept.
    RecordTimeout,
}

/// The rotation decision table. Detection and transport faults burn a
/// rotation retry; timeouts never rotate.
pub fn decide(kind: FailureKind, attempt: u32, policy: &RotationPolicy) -> Decision {
    match kind {
        FailureKind::Timeout => Decision::RecordTimeout,
        FailureKind::Detected | FailureKind::Transport => {
            if attempt <= policy.max_retries {
                Decision::RetryAfterRotation
            } else {
                Decision::RecordError
            }
        }
    }
}

/// Pool lifecycle events, borrowed to keep reporting allocation-free.
#[derive(Debug)]
pub enum PoolEvent<'a> {
    WorkerStarted { slot: usize },
    SessionReady { slot: usize, pid: Option<u32> },
    TaskStarted { slot: usize, email: &'a str },
    Rotation {
        slot: usize,
        attempt: u32,
        reason: &'a str,
        old_pid: Option<u32>,
    },
    CreateFailed { slot: usize },
    TaskResult(&'a ProbeResult),
    Progress {
        processed: usize,
        valid: usize,
        invalid: usize,
    },
    WorkerStopped { slot: usize },
    Complete(&'a Summary),
}

/// Observer for pool events. All methods default to no-ops so callers only
/// implement what they care about.
pub trait Reporter: Send + Sync {
    fn report(&self, _event: PoolEvent<'_>) {}
}

/// Discards everything.
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// Routes every event through `tracing` at sensible levels.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: PoolEvent<'_>) {
        match event {
            PoolEvent::WorkerStarted { slot } => tracing::debug!(slot, "worker started"),
            PoolEvent::SessionReady { slot, pid } => {
                tracing::info!(slot, pid, "session ready");
            }
            PoolEvent::TaskStarted { slot, email } => {
                tracing::info!(slot, email, "probing");
            }
            PoolEvent::Rotation {
                slot,
                attempt,
                reason,
                old_pid,
            } => {
                tracing::warn!(slot, attempt, reason, old_pid, "rotating session");
            }
            PoolEvent::CreateFailed { slot } => {
                tracing::error!(slot, "session creation failed, backing off");
            }
            PoolEvent::TaskResult(result) => {
                tracing::info!(
                    email = %result.email,
                    outcome = %result.outcome,
                    "task finished"
                );
            }
            PoolEvent::Progress {
                processed,
                valid,
                invalid,
            } => {
                tracing::info!(processed, valid, invalid, "progress");
            }
            PoolEvent::WorkerStopped { slot } => tracing::debug!(slot, "worker stopped"),
            PoolEvent::Complete(summary) => {
                tracing::info!(
                    total_tasks = summary.total_tasks,
                    valid = summary.valid_count,
                    invalid = summary.invalid_count,
                    secs = summary.total_time.as_secs(),
                    "run complete"
                );
            }
        }
    }
}

/// Shared pause flag, checked at task boundaries only. An in-flight probe
/// always runs to completion.
#[derive(Clone, Default)]
pub struct PauseGate {
    paused: Arc<AtomicBool>,
}

impl PauseGate {
    const POLL: Duration = Duration::from_millis(200);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns `false` if cancelled during the wait.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        while self.is_paused() {
            tokio::select! {
                () = tokio::time::sleep(Self::POLL) => {}
                () = cancel.cancelled() => return false,
            }
        }
        true
    }
}

/// One worker slot. Created by the pool, one per concurrency unit.
pub struct Worker<F, T, R>
where
    F: SessionFactory,
    T: ProcessTable,
    R: Reporter,
{
    slot: usize,
    factory: F,
    table: T,
    queue: TaskQueue,
    results: ResultStore,
    registry: Registry,
    config: Arc<ProbeConfig>,
    startup: StartupPolicy,
    rotation: RotationPolicy,
    pause: PauseGate,
    cancel: CancellationToken,
    reporter: Arc<R>,
}

enum Attempt {
    Final(ProbeResult),
    Cancelled(Task),
}

impl<F, T, R> Worker<F, T, R>
where
    F: SessionFactory,
    T: ProcessTable,
    R: Reporter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: usize,
        factory: F,
        table: T,
        queue: TaskQueue,
        results: ResultStore,
        registry: Registry,
        config: Arc<ProbeConfig>,
        startup: StartupPolicy,
        rotation: RotationPolicy,
        pause: PauseGate,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) -> Self {
        Self {
            slot,
            factory,
            table,
            queue,
            results,
            registry,
            config,
            startup,
            rotation,
            pause,
            cancel,
            reporter,
        }
    }

    /// Drain the queue. Returns when the queue is empty or the pool is
    /// cancelled; the session is closed and unregistered on the way out.
    pub async fn run(mut self) {
        self.reporter.report(PoolEvent::WorkerStarted { slot: self.slot });
        let mut handle: Option<SessionHandle<F::Session>> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.pause.wait_while_paused(&self.cancel).await {
                break;
            }
            if self.queue.is_empty() {
                break;
            }

            if handle.is_none() {
                match acquire_ready(
                    &self.factory,
                    &self.startup,
                    ProfileMode::Shared,
                    &self.cancel,
                )
                .await
                {
                    Ok(session) => {
                        let pid = session.process_id();
                        self.registry.register(self.slot, pid);
                        self.reporter
                            .report(PoolEvent::SessionReady { slot: self.slot, pid });
                        handle = Some(SessionHandle::ready(self.slot, session));
                    }
                    Err(_) if self.cancel.is_cancelled() => break,
                    Err(e) => {
                        tracing::error!(slot = self.slot, error = %e, "could not start session");
                        self.reporter.report(PoolEvent::CreateFailed { slot: self.slot });
                        tokio::select! {
                            () = tokio::time::sleep(self.rotation.create_failed_backoff) => {}
                            () = self.cancel.cancelled() => break,
                        }
                        continue;
                    }
                }
            }

            let Some(task) = self.queue.pop() else { break };
            self.reporter.report(PoolEvent::TaskStarted {
                slot: self.slot,
                email: &task.email,
            });

            match self.process_task(&mut handle, task).await {
                Attempt::Final(result) => {
                    self.results.push(result.clone());
                    self.reporter.report(PoolEvent::TaskResult(&result));
                    let (valid, invalid) = self.results.counts();
                    self.reporter.report(PoolEvent::Progress {
                        processed: self.results.len(),
                        valid,
                        invalid,
                    });
                }
                Attempt::Cancelled(task) => {
                    // Never half-record a task; it goes back for a future run.
                    self.queue.requeue_front(task);
                    break;
                }
            }
        }

        if let Some(h) = handle.take() {
            h.close().await;
        }
        self.registry.clear(self.slot);
        self.reporter.report(PoolEvent::WorkerStopped { slot: self.slot });
    }

    /// Run one task to a final result, rotating the session as the decision
    /// table dictates.
    async fn process_task(
        &mut self,
        handle: &mut Option<SessionHandle<F::Session>>,
        task: Task,
    ) -> Attempt {
        let mut attempt: u32 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Attempt::Cancelled(task);
            }
            let Some(h) = handle.as_mut() else {
                return Attempt::Final(ProbeResult::new(
                    &task.email,
                    Outcome::Error {
                        message: "no session available".into(),
                    },
                    None,
                    None,
                ));
            };

            h.begin_task();
            let probe = run_probe(h.session(), &self.config, &task.email).await;

            let (kind, reason) = match probe {
                Ok(output) if output.outcome.is_detected() => {
                    let reason = output.outcome.reason().unwrap_or("detected").to_string();
                    (FailureKind::Detected, reason)
                }
                Ok(output) => {
                    h.finish_task();
                    return Attempt::Final(ProbeResult::new(
                        &task.email,
                        output.outcome,
                        output.phone_hint,
                        Some(output.final_url),
                    ));
                }
                Err(e) => {
                    let kind = match &e {
                        AppError::Detection(_) => FailureKind::Detected,
                        AppError::Timeout(_) => FailureKind::Timeout,
                        _ => FailureKind::Transport,
                    };
                    (kind, e.to_string())
                }
            };

            match decide(kind, attempt, &self.rotation) {
                Decision::RecordTimeout => {
                    h.finish_task();
                    return Attempt::Final(ProbeResult::new(
                        &task.email,
                        Outcome::Timeout,
                        None,
                        None,
                    ));
                }
                Decision::RetryAfterRotation => {
                    let old = handle.take().expect("session present at rotation");
                    match self.rotate(old, attempt, kind, &reason).await {
                        Ok(fresh) => *handle = Some(fresh),
                        Err(_) if self.cancel.is_cancelled() => {
                            return Attempt::Cancelled(task);
                        }
                        Err(e) => {
                            tracing::error!(slot = self.slot, error = %e, "rotation failed");
                            return Attempt::Final(ProbeResult::new(
                                &task.email,
                                Outcome::Error {
                                    message: format!("rotation failed: {e}"),
                                },
                                None,
                                None,
                            ));
                        }
                    }
                    attempt += 1;
                }
                Decision::RecordError => {
                    // The current session is burnt; drop it so the next task
                    // starts clean.
                    let old = handle.take().expect("session present at exhaustion");
                    old.close().await;
                    self.registry.clear(self.slot);
                    return Attempt::Final(ProbeResult::new(
                        &task.email,
                        Outcome::Error {
                            message: format!("detected after {attempt} attempts: {reason}"),
                        },
                        None,
                        None,
                    ));
                }
            }
        }
    }

    /// Tear the old session down completely and bring up a fresh
    /// disposable-profile replacement. Orphan sweeping stays out of this
    /// path: a sibling slot may be mid-startup with its browser not yet
    /// registered, and a sweep here would reap it.
    async fn rotate(
        &mut self,
        mut old: SessionHandle<F::Session>,
        attempt: u32,
        kind: FailureKind,
        reason: &str,
    ) -> Result<SessionHandle<F::Session>, AppError> {
        let old_pid = old.pid();
        self.reporter.report(PoolEvent::Rotation {
            slot: self.slot,
            attempt,
            reason,
            old_pid,
        });

        if kind == FailureKind::Detected {
            old.mark_detected();
        }
        old.close().await;
        self.registry.clear(self.slot);

        // Close is polite; the process may linger. Make sure it is gone
        // before its replacement starts.
        if let Some(pid) = old_pid {
            kill_tree(&mut self.table, pid).await;
        }

        tokio::select! {
            () = tokio::time::sleep(self.rotation.restart_delay) => {}
            () = self.cancel.cancelled() => {
                return Err(AppError::Generic("cancelled during rotation".into()));
            }
        }

        let session = acquire_ready(
            &self.factory,
            &self.startup,
            ProfileMode::Disposable,
            &self.cancel,
        )
        .await?;
        let pid = session.process_id();
        self.registry.record_restart(self.slot, pid);
        self.reporter
            .report(PoolEvent::SessionReady { slot: self.slot, pid });
        Ok(SessionHandle::ready(self.slot, session))
    }
}
