//! Scripted doubles for the session, factory, process-table, and reporter
//! seams. Shared state sits behind `Arc<Mutex<_>>` so a test can keep a
//! clone and inspect what the code under test did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::registry::{ProcessInfo, ProcessTable};
use crate::session::{ProbeSession, ProfileMode, SessionFactory};
use crate::worker::{PoolEvent, Reporter};

#[derive(Debug, Clone, PartialEq, Eq)]
struct PageState {
    url: String,
    text: String,
}

#[derive(Debug, Default)]
struct SessionInner {
    pages: VecDeque<PageState>,
    current: Option<PageState>,
    elements: HashMap<String, bool>,
    typed: Vec<(String, String)>,
    clicked: Vec<String>,
    navigated: Vec<String>,
    alive: bool,
    pid: Option<u32>,
    closed: bool,
    advance_in: Option<usize>,
}

/// Scripted session. Pages form a timeline: `navigate` and `click` each
/// advance to the next scripted page, reads return the current one.
#[derive(Clone, Debug)]
pub struct MockSession {
    inner: Arc<Mutex<SessionInner>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                alive: true,
                ..SessionInner::default()
            })),
        }
    }

    pub fn with_alive(self, alive: bool) -> Self {
        self.inner.lock().unwrap().alive = alive;
        self
    }

    pub fn with_pid(self, pid: u32) -> Self {
        self.inner.lock().unwrap().pid = Some(pid);
        self
    }

    /// Fix the response for `wait_for_element(selector, ..)`. Unscripted
    /// selectors report absent.
    pub fn script_element(&self, selector: &str, present: bool) {
        self.inner
            .lock()
            .unwrap()
            .elements
            .insert(selector.to_string(), present);
    }

    pub fn push_page(&self, url: &str, text: &str) {
        self.inner.lock().unwrap().pages.push_back(PageState {
            url: url.to_string(),
            text: text.to_string(),
        });
    }

    /// Advance the page timeline once after `n` more reads, for flows where
    /// the page changes without a navigation or click in between.
    pub fn advance_after_reads(&self, n: usize) {
        self.inner.lock().unwrap().advance_in = Some(n);
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().typed.clone()
    }

    pub fn clicked(&self) -> Vec<String> {
        self.inner.lock().unwrap().clicked.clone()
    }

    pub fn was_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn advance(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(next) = inner.pages.pop_front() {
            inner.current = Some(next);
        }
    }

    fn current(&self) -> PageState {
        let mut inner = self.inner.lock().unwrap();
        if inner.current.is_none() {
            if let Some(next) = inner.pages.pop_front() {
                inner.current = Some(next);
            }
        }
        let state = inner.current.clone().unwrap_or(PageState {
            url: String::new(),
            text: String::new(),
        });
        match inner.advance_in {
            Some(1) => {
                inner.advance_in = None;
                if let Some(next) = inner.pages.pop_front() {
                    inner.current = Some(next);
                }
            }
            Some(n) => inner.advance_in = Some(n - 1),
            None => {}
        }
        state
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeSession for MockSession {
    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        self.inner.lock().unwrap().navigated.push(url.to_string());
        self.advance();
        Ok(())
    }

    async fn wait_for_element(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .elements
            .get(selector)
            .copied()
            .unwrap_or(false))
    }

    async fn current_url(&self) -> Result<String, AppError> {
        Ok(self.current().url)
    }

    async fn page_text(&self) -> Result<String, AppError> {
        Ok(self.current().text)
    }

    async fn click(&self, selector: &str) -> Result<(), AppError> {
        self.inner.lock().unwrap().clicked.push(selector.to_string());
        self.advance();
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().pid
    }

    async fn is_alive(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.alive && !inner.closed
    }

    async fn close(self) {
        self.inner.lock().unwrap().closed = true;
    }
}

enum FactoryEntry {
    Session(MockSession),
    Error(AppError),
}

#[derive(Default)]
struct FactoryInner {
    script: VecDeque<FactoryEntry>,
    profiles: Vec<ProfileMode>,
    fail_when_empty: bool,
}

/// Scripted factory. `create` pops the next scripted entry; an empty script
/// hands out fresh default sessions unless told to fail.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, session: MockSession) {
        self.inner
            .lock()
            .unwrap()
            .script
            .push_back(FactoryEntry::Session(session));
    }

    pub fn push_create_error(&self, error: AppError) {
        self.inner
            .lock()
            .unwrap()
            .script
            .push_back(FactoryEntry::Error(error));
    }

    pub fn fail_when_empty(&self) {
        self.inner.lock().unwrap().fail_when_empty = true;
    }

    pub fn created_profiles(&self) -> Vec<ProfileMode> {
        self.inner.lock().unwrap().profiles.clone()
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn create(&self, profile: ProfileMode) -> Result<MockSession, AppError> {
        let mut inner = self.inner.lock().unwrap();
        inner.profiles.push(profile);
        match inner.script.pop_front() {
            Some(FactoryEntry::Session(session)) => Ok(session),
            Some(FactoryEntry::Error(error)) => Err(error),
            None if inner.fail_when_empty => {
                Err(AppError::Generic("factory script exhausted".into()))
            }
            None => Ok(MockSession::new()),
        }
    }
}

#[derive(Default)]
struct TableInner {
    procs: HashMap<u32, ProcessInfo>,
    ignore_terminate: Vec<u32>,
    terminated: Vec<u32>,
    killed: Vec<u32>,
}

/// In-memory process table. `terminate` removes the process unless that pid
/// was marked stubborn; `kill` always removes it.
#[derive(Clone, Default)]
pub struct MockProcessTable {
    inner: Arc<Mutex<TableInner>>,
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: u32, parent: Option<u32>, cmdline: &str) {
        self.inner.lock().unwrap().procs.insert(
            pid,
            ProcessInfo {
                pid,
                parent,
                cmdline: cmdline.to_string(),
            },
        );
    }

    pub fn ignore_terminate(&self, pid: u32) {
        self.inner.lock().unwrap().ignore_terminate.push(pid);
    }

    pub fn terminated_order(&self) -> Vec<u32> {
        self.inner.lock().unwrap().terminated.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.inner.lock().unwrap().killed.clone()
    }
}

impl ProcessTable for MockProcessTable {
    fn refresh(&mut self) {}

    fn processes(&self) -> Vec<ProcessInfo> {
        self.inner.lock().unwrap().procs.values().cloned().collect()
    }

    fn exists(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().procs.contains_key(&pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.procs.contains_key(&pid) {
            return false;
        }
        inner.terminated.push(pid);
        if !inner.ignore_terminate.contains(&pid) {
            inner.procs.remove(&pid);
        }
        true
    }

    fn kill(&self, pid: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.killed.push(pid);
        inner.procs.remove(&pid).is_some()
    }
}

/// Records one label per event so tests can assert on counts.
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e == &label)
            .count()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: PoolEvent<'_>) {
        let label = match event {
            PoolEvent::WorkerStarted { .. } => "worker_started",
            PoolEvent::SessionReady { .. } => "session_ready",
            PoolEvent::TaskStarted { .. } => "task_started",
            PoolEvent::Rotation { .. } => "rotation",
            PoolEvent::CreateFailed { .. } => "create_failed",
            PoolEvent::TaskResult(_) => "task_result",
            PoolEvent::Progress { .. } => "progress",
            PoolEvent::WorkerStopped { .. } => "worker_stopped",
            PoolEvent::Complete(_) => "complete",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
