use std::time::{Duration, Instant};

pub const DEFAULT_PURGE_TOLERANCE_BAR: f64 = 1.5;

/// Operator request for a purge run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurgePlan {
    pub target_bar: f64,
    pub tolerance_bar: f64,
    pub timeout: Duration,
}

impl PurgePlan {
    pub fn new(target_bar: f64, timeout: Duration) -> Self {
        Self {
            target_bar,
            tolerance_bar: DEFAULT_PURGE_TOLERANCE_BAR,
            timeout,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance_bar: f64) -> Self {
        self.tolerance_bar = tolerance_bar;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    TargetReached,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeVerdict {
    Pending,
    Finished(PurgeOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurgeSession {
    pub target_bar: f64,
    pub tolerance_bar: f64,
    pub timeout: Duration,
    pub started_at: Instant,
}

impl PurgeSession {
    pub fn start(plan: PurgePlan, now: Instant) -> Self {
        Self {
            target_bar: plan.target_bar,
            tolerance_bar: plan.tolerance_bar,
            timeout: plan.timeout,
            started_at: now,
        }
    }

    /// Pressure match wins over the timeout when both hold on the same check.
    pub fn check(&self, pressure_bar: f64, now: Instant) -> PurgeVerdict {
        if (pressure_bar - self.target_bar).abs() <= self.tolerance_bar {
            PurgeVerdict::Finished(PurgeOutcome::TargetReached)
        } else {
            self.check_timeout(now)
        }
    }

    /// Deadline-only check for cycles without a measurement.
    pub fn check_timeout(&self, now: Instant) -> PurgeVerdict {
        if now.saturating_duration_since(self.started_at) >= self.timeout {
            PurgeVerdict::Finished(PurgeOutcome::TimedOut)
        } else {
            PurgeVerdict::Pending
        }
    }
}
