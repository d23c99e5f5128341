//! Session lifecycle: traits for the external browser capability, the
//! per-session state machine, and bounded startup.
//!
//! The core never talks to a concrete automation engine. Workers drive
//! anything implementing [`ProbeSession`], produced by a [`SessionFactory`];
//! the client crate supplies the chromiumoxide implementation and tests use
//! the scripted mock in `testutil`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Profile strategy for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    /// Reuse the engine's default profile. Cheapest; first try only.
    Shared,
    /// Fresh throwaway profile directory, removed on close. Mandatory after
    /// any detection so the replacement session is distinguishable.
    Disposable,
}

/// Lifecycle of one session.
///
/// `Starting` is the only creation state and `Closed` is terminal.
/// `Detected` is reachable only from `Busy` and always moves straight to
/// `Closing`: there is no in-place recovery from detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Detected,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Detected => "detected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Closing)
                | (Ready, Busy)
                | (Ready, Closing)
                | (Busy, Ready)
                | (Busy, Detected)
                | (Busy, Closing)
                | (Detected, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One instance of the external browser-automation capability, bound to at
/// most one OS process.
///
/// `close` consumes the session, must never fail, and is responsible for
/// removing any disposable profile directory; it runs on every exit path.
/// `Sync` is required so borrowed probe futures stay `Send` across worker
/// task spawns.
pub trait ProbeSession: Send + Sync {
    fn navigate(&self, url: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Wait for an element matching `selector`. `Ok(false)` on timeout so
    /// callers can treat absence as data rather than an error.
    fn wait_for_element(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn current_url(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    fn page_text(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    fn click(&self, selector: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn type_text(
        &self,
        selector: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// OS process id of the underlying engine, where known.
    fn process_id(&self) -> Option<u32>;

    /// Cheap liveness probe. Implementations should attempt window
    /// reattachment before reporting death.
    fn is_alive(&self) -> impl Future<Output = bool> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Produces new sessions. Cloned into every worker slot.
pub trait SessionFactory: Send + Sync + Clone {
    type Session: ProbeSession;

    fn create(
        &self,
        profile: ProfileMode,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// A live session owned by exactly one worker slot, with its state machine.
pub struct SessionHandle<S: ProbeSession> {
    slot: usize,
    state: SessionState,
    pid: Option<u32>,
    session: Option<S>,
}

impl<S: ProbeSession> SessionHandle<S> {
    /// Wrap a session that has already passed its readiness probe.
    pub fn ready(slot: usize, session: S) -> Self {
        let pid = session.process_id();
        Self {
            slot,
            state: SessionState::Ready,
            pid,
            session: Some(session),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn session(&self) -> &S {
        self.session
            .as_ref()
            .expect("session accessed after close")
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition(next) {
            tracing::warn!(
                slot = self.slot,
                from = %self.state,
                to = %next,
                "illegal session state transition"
            );
        }
        self.state = next;
    }

    pub fn begin_task(&mut self) {
        self.transition(SessionState::Busy);
    }

    pub fn finish_task(&mut self) {
        self.transition(SessionState::Ready);
    }

    pub fn mark_detected(&mut self) {
        self.transition(SessionState::Detected);
    }

    /// Graceful teardown. Never fails; always reaches `Closed`.
    pub async fn close(mut self) {
        self.transition(SessionState::Closing);
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.transition(SessionState::Closed);
    }
}

/// Poll the session's liveness check until it passes or `timeout` elapses.
///
/// A `false` return is not an error: the caller retries the whole creation
/// sequence instead of failing the pool.
pub async fn wait_until_ready<S: ProbeSession>(session: &S, timeout: Duration) -> bool {
    const READY_POLL: Duration = Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if session.is_alive().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// Produce a `Ready` session or fail cleanly with `StartupFailure`.
///
/// Each attempt independently creates a session and runs the liveness
/// probe; failures back off linearly per the policy. The first attempt uses
/// `first_profile` (shared on a slot's very first session, disposable after
/// any rotation); all later attempts use disposable profiles to minimise
/// fingerprint reuse.
pub async fn acquire_ready<F: SessionFactory>(
    factory: &F,
    policy: &crate::task::StartupPolicy,
    first_profile: ProfileMode,
    cancel: &CancellationToken,
) -> Result<F::Session, AppError> {
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(AppError::Generic("cancelled during session startup".into()));
        }

        let profile = if attempt == 1 {
            first_profile
        } else {
            ProfileMode::Disposable
        };

        match factory.create(profile).await {
            Ok(session) => {
                if wait_until_ready(&session, policy.startup_timeout).await {
                    tracing::debug!(attempt, "session ready");
                    return Ok(session);
                }
                tracing::warn!(attempt, "session did not become ready, closing");
                session.close().await;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "session creation failed");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(policy.backoff(attempt)) => {}
            () = cancel.cancelled() => {
                return Err(AppError::Generic("cancelled during session startup".into()));
            }
        }
    }

    Err(AppError::StartupFailure {
        attempts: policy.max_attempts,
    })
}
