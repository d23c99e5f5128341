pub mod classify;
pub mod error;
pub mod pool;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod session;
pub mod task;
pub mod util;
pub mod worker;

#[cfg(test)]
pub mod testutil;

pub use classify::{ClassifyPolicy, UnknownErrorDebounce, classify};
pub use error::AppError;
pub use pool::{PoolConfig, PoolHandle, ProbePool};
pub use probe::{ProbeConfig, ProbeOutput, run_probe};
pub use queue::{ResultStore, TaskQueue};
pub use registry::{ProcessTable, Registry, SysinfoProcessTable};
pub use session::{ProbeSession, ProfileMode, SessionFactory, SessionState};
pub use task::{
    Outcome, ProbeResult, ProbeTiming, RotationPolicy, StartupPolicy, Summary, Task,
};
pub use worker::{NoopReporter, PauseGate, PoolEvent, Reporter, TracingReporter};
