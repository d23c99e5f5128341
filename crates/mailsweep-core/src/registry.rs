//! Process accounting: which OS process each worker slot currently owns,
//! tree-aware termination, and the orphan reaper.
//!
//! Everything here goes through the [`ProcessTable`] seam so the kill and
//! reap logic is testable against a scripted table instead of the live
//! system. Production uses [`SysinfoProcessTable`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cmdline fragment that marks a process as one of ours. Disposable profile
/// directories embed this prefix, so any engine process carrying it in its
/// arguments was spawned by this program.
pub const ORPHAN_SIGNATURE: &str = "mailsweep-profile-";

/// Total wall-clock budget for one reaper sweep.
pub const REAP_BUDGET: Duration = Duration::from_secs(5);

/// Grace period between polite terminate and forced kill.
const KILL_GRACE: Duration = Duration::from_secs(3);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Snapshot of one process as seen by the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub cmdline: String,
}

/// Minimal view of the OS process table.
///
/// `terminate` is the polite signal (SIGTERM), `kill` the forced one.
/// Both return whether the signal was delivered; a missing process is a
/// normal outcome, not an error.
pub trait ProcessTable: Send {
    fn refresh(&mut self);
    fn processes(&self) -> Vec<ProcessInfo>;
    fn exists(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> bool;
    fn kill(&self, pid: u32) -> bool;
}

/// Live process table backed by the `sysinfo` crate.
pub struct SysinfoProcessTable {
    system: sysinfo::System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn refresh(&mut self) {
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.system
            .processes()
            .iter()
            .map(|(pid, proc_)| ProcessInfo {
                pid: pid.as_u32(),
                parent: proc_.parent().map(|p| p.as_u32()),
                cmdline: proc_
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
            })
            .collect()
    }

    fn exists(&self, pid: u32) -> bool {
        self.system.process(sysinfo::Pid::from_u32(pid)).is_some()
    }

    fn terminate(&self, pid: u32) -> bool {
        self.system
            .process(sysinfo::Pid::from_u32(pid))
            .and_then(|p| p.kill_with(sysinfo::Signal::Term))
            .unwrap_or(false)
    }

    fn kill(&self, pid: u32) -> bool {
        self.system
            .process(sysinfo::Pid::from_u32(pid))
            .map(|p| p.kill())
            .unwrap_or(false)
    }
}

/// Per-slot process record.
#[derive(Debug, Clone, Default)]
pub struct WorkerRecord {
    pub current_pid: Option<u32>,
    pub restart_count: u32,
}

/// Shared slot-to-process registry.
///
/// Updated at every session create and rotation so the reaper can tell
/// live engine processes from abandoned ones. Cheap to clone.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<usize, WorkerRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slot: usize, pid: Option<u32>) {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        map.entry(slot).or_default().current_pid = pid;
    }

    /// Swap in the replacement session's pid and count the restart.
    pub fn record_restart(&self, slot: usize, pid: Option<u32>) {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        let record = map.entry(slot).or_default();
        record.current_pid = pid;
        record.restart_count += 1;
    }

    pub fn clear(&self, slot: usize) {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        if let Some(record) = map.get_mut(&slot) {
            record.current_pid = None;
        }
    }

    pub fn record(&self, slot: usize) -> Option<WorkerRecord> {
        let map = self.inner.lock().expect("registry lock poisoned");
        map.get(&slot).cloned()
    }

    /// All pids currently owned by some slot.
    pub fn registered_pids(&self) -> HashSet<u32> {
        let map = self.inner.lock().expect("registry lock poisoned");
        map.values().filter_map(|r| r.current_pid).collect()
    }

    pub fn total_restarts(&self) -> u32 {
        let map = self.inner.lock().expect("registry lock poisoned");
        map.values().map(|r| r.restart_count).sum()
    }
}

fn descendants(processes: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in processes {
        if let Some(parent) = p.parent {
            children.entry(parent).or_default().push(p.pid);
        }
    }
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                out.push(kid);
                stack.push(kid);
            }
        }
    }
    out
}

async fn await_exit<T: ProcessTable>(table: &mut T, pids: &[u32], grace: Duration) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        table.refresh();
        let alive: Vec<u32> = pids.iter().copied().filter(|&p| table.exists(p)).collect();
        if alive.is_empty() || tokio::time::Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(KILL_POLL).await;
    }
}

/// Terminate a process and its whole descendant tree.
///
/// Children go first so the parent cannot respawn them mid-teardown; every
/// survivor of the polite signal is force-killed after the grace period.
pub async fn kill_tree<T: ProcessTable>(table: &mut T, pid: u32) {
    table.refresh();
    let kids = descendants(&table.processes(), pid);

    for &kid in &kids {
        table.terminate(kid);
    }
    for &kid in &await_exit(table, &kids, KILL_GRACE).await {
        table.kill(kid);
    }

    if table.exists(pid) {
        table.terminate(pid);
        if !await_exit(table, &[pid], KILL_GRACE).await.is_empty() {
            table.kill(pid);
        }
    }
    tracing::debug!(pid, children = kids.len(), "process tree terminated");
}

/// One reaper sweep: kill every process carrying our profile signature that
/// no worker slot currently owns.
///
/// Bounded by [`REAP_BUDGET`]; leftover orphans are picked up on the next
/// sweep rather than stalling a rotation. Returns the pids reaped.
pub async fn reap_orphans<T: ProcessTable>(table: &mut T, registry: &Registry) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + REAP_BUDGET;
    table.refresh();
    let owned = registry.registered_pids();

    let orphans: Vec<u32> = table
        .processes()
        .iter()
        .filter(|p| p.cmdline.contains(ORPHAN_SIGNATURE) && !owned.contains(&p.pid))
        .map(|p| p.pid)
        .collect();

    let mut reaped = Vec::new();
    for pid in orphans {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(remaining = ?pid, "reaper budget exhausted, deferring to next sweep");
            break;
        }
        kill_tree(table, pid).await;
        reaped.push(pid);
    }
    if !reaped.is_empty() {
        tracing::info!(count = reaped.len(), pids = ?reaped, "reaped orphaned sessions");
    }
    reaped
}
