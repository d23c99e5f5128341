use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work: a single email address to probe to exactly one
/// terminal [`ProbeResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub email: String,
}

impl Task {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }
}

/// Terminal outcome of one completed task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Valid { reason: String },
    Invalid { reason: String },
    Detected { reason: String },
    Timeout,
    Error { message: String },
}

impl Outcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Outcome::Valid { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Outcome::Invalid { .. })
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, Outcome::Detected { .. })
    }

    /// Reason/message text, where the variant carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Valid { reason }
            | Outcome::Invalid { reason }
            | Outcome::Detected { reason } => Some(reason),
            Outcome::Error { message } => Some(message),
            Outcome::Timeout => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Valid { reason } => write!(f, "valid ({reason})"),
            Outcome::Invalid { reason } => write!(f, "invalid ({reason})"),
            Outcome::Detected { reason } => write!(f, "detected ({reason})"),
            Outcome::Timeout => write!(f, "timeout"),
            Outcome::Error { message } => write!(f, "error ({message})"),
        }
    }
}

/// Terminal record for one task. Immutable once created; appended to the
/// shared result store exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub email: String,
    pub outcome: Outcome,
    /// Single-line presentation string for logs and partition files.
    pub display: String,
    /// Masked phone digits captured from the verification page, e.g. `***05`.
    pub phone_hint: Option<String>,
    pub final_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(
        email: impl Into<String>,
        outcome: Outcome,
        phone_hint: Option<String>,
        final_url: Option<String>,
    ) -> Self {
        let email = email.into();
        let display = display_line(&email, &outcome, phone_hint.as_deref());
        Self {
            email,
            outcome,
            display,
            phone_hint,
            final_url,
            timestamp: Utc::now(),
        }
    }
}

/// Build the one-line display string for a result.
pub fn display_line(email: &str, outcome: &Outcome, phone_hint: Option<&str>) -> String {
    if outcome.is_valid() {
        match phone_hint {
            Some(hint) => format!("VALID - {email} | {hint}"),
            None => format!("VALID - {email}"),
        }
    } else {
        format!("INVALID - {email}")
    }
}

/// Batch statistics, computed once when the pool completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub total_time: Duration,
    pub total_tasks: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub throughput_per_minute: f64,
}

impl Summary {
    pub fn compute(total_time: Duration, results: &[ProbeResult]) -> Self {
        let valid_count = results.iter().filter(|r| r.outcome.is_valid()).count();
        let total_tasks = results.len();
        let secs = total_time.as_secs_f64();
        let throughput_per_minute = if secs > 0.0 {
            total_tasks as f64 / secs * 60.0
        } else {
            0.0
        };
        Self {
            total_time,
            total_tasks,
            valid_count,
            invalid_count: total_tasks - valid_count,
            throughput_per_minute,
        }
    }
}

/// Bounded-retry policy for session startup.
///
/// Backoff is linear: `min(backoff_step * attempt, max_backoff)`.
#[derive(Debug, Clone)]
pub struct StartupPolicy {
    pub max_attempts: u32,
    /// Liveness budget for each individual creation attempt.
    pub startup_timeout: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            startup_timeout: Duration::from_secs(20),
            backoff_step: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl StartupPolicy {
    /// Delay after a failed attempt (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        std::cmp::min(self.backoff_step * attempt, self.max_backoff)
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_startup_timeout(mut self, t: Duration) -> Self {
        self.startup_timeout = t;
        self
    }
}

/// Rotation policy: how a worker reacts to detection and transport failures.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Retries of the same task on a fresh session before giving up.
    pub max_retries: u32,
    /// Pause between closing a flagged session and creating its replacement.
    pub restart_delay: Duration,
    /// Backoff after session creation fails outright, no task consumed.
    pub create_failed_backoff: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            restart_delay: Duration::from_secs(1),
            create_failed_backoff: Duration::from_secs(5),
        }
    }
}

impl RotationPolicy {
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}

/// Timing constants for the probe flow. The debounce threshold, grace
/// window, and sample interval are load-bearing: tests exercise them
/// directly.
#[derive(Debug, Clone)]
pub struct ProbeTiming {
    /// Budget for the email input to appear after navigation.
    pub element_timeout: Duration,
    /// Budget for the submit button to become available.
    pub submit_timeout: Duration,
    /// Settle delay before typing into a freshly loaded form.
    pub settle: Duration,
    /// Post-submit window during which the unknown-error banner is ignored.
    pub grace: Duration,
    /// Interval between transition-monitor samples.
    pub sample_interval: Duration,
    /// Total budget for the post-submit transition monitor.
    pub transition_budget: Duration,
    /// Budget for the password-field probe after the transition settles.
    pub password_probe_timeout: Duration,
    /// Delay before the single fallback re-check.
    pub recheck_delay: Duration,
    /// Consecutive sightings required to escalate the unknown-error banner.
    pub debounce_threshold: u32,
    /// Hard deadline for one whole probe attempt.
    pub probe_deadline: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            element_timeout: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(2),
            grace: Duration::from_secs(2),
            sample_interval: Duration::from_millis(200),
            transition_budget: Duration::from_secs(60),
            password_probe_timeout: Duration::from_secs(20),
            recheck_delay: Duration::from_millis(1500),
            debounce_threshold: 3,
            probe_deadline: Duration::from_secs(180),
        }
    }
}

impl ProbeTiming {
    /// Number of monitor samples covered by the grace window.
    pub fn grace_samples(&self) -> u32 {
        (self.grace.as_millis() / self.sample_interval.as_millis().max(1)) as u32
    }

    /// Total number of monitor samples in the transition budget.
    pub fn transition_samples(&self) -> u32 {
        (self.transition_budget.as_millis() / self.sample_interval.as_millis().max(1)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_backoff_is_linear_and_capped() {
        let policy = StartupPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(4), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(12), Duration::from_secs(5));
    }

    #[test]
    fn default_timing_constants() {
        let timing = ProbeTiming::default();
        assert_eq!(timing.grace, Duration::from_secs(2));
        assert_eq!(timing.sample_interval, Duration::from_millis(200));
        assert_eq!(timing.debounce_threshold, 3);
        assert_eq!(timing.grace_samples(), 10);
        assert_eq!(timing.transition_samples(), 300);
    }

    #[test]
    fn display_line_variants() {
        let valid = Outcome::Valid {
            reason: "password_page".into(),
        };
        assert_eq!(
            display_line("a@b.com", &valid, Some("***05")),
            "VALID - a@b.com | ***05"
        );
        assert_eq!(display_line("a@b.com", &valid, None), "VALID - a@b.com");
        assert_eq!(
            display_line("a@b.com", &Outcome::Timeout, None),
            "INVALID - a@b.com"
        );
    }

    #[test]
    fn summary_counts_and_throughput() {
        let results = vec![
            ProbeResult::new(
                "a@b.com",
                Outcome::Valid {
                    reason: "password_page".into(),
                },
                None,
                None,
            ),
            ProbeResult::new(
                "c@d.com",
                Outcome::Invalid {
                    reason: "fallback_invalid".into(),
                },
                None,
                None,
            ),
            ProbeResult::new("e@f.com", Outcome::Timeout, None, None),
        ];
        let summary = Summary::compute(Duration::from_secs(60), &results);
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.valid_count, 1);
        assert_eq!(summary.invalid_count, 2);
        assert!((summary.throughput_per_minute - 3.0).abs() < f64::EPSILON);
    }
}
