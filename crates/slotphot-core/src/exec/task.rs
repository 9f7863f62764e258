use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PhotError, Result};

/// A counter that can be bumped concurrently from many workers.
pub trait Counter: Send + Sync + fmt::Debug {
    /// Add one and return the new value.
    fn increment(&self) -> usize;
    fn get(&self) -> usize;
    fn reset(&self);
}

#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicUsize);

impl Counter for AtomicCounter {
    fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Maximum number of failures tolerated in one batch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum FailureCap {
    #[default]
    Unlimited,
    Count(usize),
    /// Fraction of the batch size, e.g. `0.3` for "30%".
    Fraction(f64),
}

impl FailureCap {
    /// Number of failures allowed for a batch of `size` jobs.
    pub fn resolve(&self, size: usize) -> Option<usize> {
        match *self {
            Self::Unlimited => None,
            Self::Count(n) => Some(n),
            Self::Fraction(f) => Some((f * size as f64).floor() as usize),
        }
    }
}

impl FromStr for FailureCap {
    type Err = PhotError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| PhotError::Config(format!("bad failure cap '{s}'")))?;
            if !(0.0..=100.0).contains(&value) {
                return Err(PhotError::Config(format!("failure cap '{s}' out of range")));
            }
            return Ok(Self::Fraction(value / 100.0));
        }
        s.parse::<usize>()
            .map(Self::Count)
            .map_err(|_| PhotError::Config(format!("bad failure cap '{s}'")))
    }
}

impl fmt::Display for FailureCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "none"),
            Self::Count(n) => write!(f, "{n}"),
            Self::Fraction(x) => write!(f, "{}%", (x * 1e4).round() / 100.0),
        }
    }
}

impl TryFrom<String> for FailureCap {
    type Error = PhotError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<FailureCap> for String {
    fn from(cap: FailureCap) -> Self {
        cap.to_string()
    }
}

/// Success and failure counts of a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub size: usize,
    pub successes: usize,
    pub failures: usize,
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed of {}",
            self.name, self.successes, self.failures, self.size
        )
    }
}

/// Wraps per-index jobs with success/failure accounting and a failure cap.
///
/// A job that returns an error or panics counts as a failure and yields
/// `None`. Once failures exceed the cap, the failing call and every later
/// call return [`PhotError::FailureCapExceeded`].
#[derive(Debug)]
pub struct TaskExecutor {
    name: String,
    size: usize,
    cap: FailureCap,
    successes: Arc<dyn Counter>,
    failures: Arc<dyn Counter>,
    aborted: AtomicBool,
}

impl TaskExecutor {
    pub fn new(name: &str, size: usize, cap: FailureCap) -> Self {
        Self::with_counters(
            name,
            size,
            cap,
            Arc::new(AtomicCounter::default()),
            Arc::new(AtomicCounter::default()),
        )
    }

    pub fn with_counters(
        name: &str,
        size: usize,
        cap: FailureCap,
        successes: Arc<dyn Counter>,
        failures: Arc<dyn Counter>,
    ) -> Self {
        Self {
            name: name.to_string(),
            size,
            cap,
            successes,
            failures,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Batch size the cap is computed against.
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn successes(&self) -> usize {
        self.successes.get()
    }

    pub fn failures(&self) -> usize {
        self.failures.get()
    }

    /// Zero both counters and clear the abort flag.
    pub fn reset(&self) {
        self.successes.reset();
        self.failures.reset();
        self.aborted.store(false, Ordering::SeqCst);
    }

    fn cap_error(&self) -> PhotError {
        PhotError::FailureCapExceeded {
            task: self.name.clone(),
            failures: self.failures(),
            cap: self.cap.resolve(self.size).unwrap_or(usize::MAX),
        }
    }

    /// Run job `index`.
    pub fn execute<T, F>(&self, index: usize, job: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(self.cap_error());
        }

        let outcome = catch_unwind(AssertUnwindSafe(job));
        let failure = match outcome {
            Ok(Ok(value)) => {
                self.successes.increment();
                return Ok(Some(value));
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string()),
        };

        let failures = self.failures.increment();
        warn!(task = %self.name, index, failures, error = %failure, "Task failed");
        if let Some(cap) = self.cap.resolve(self.size) {
            if failures > cap {
                self.aborted.store(true, Ordering::SeqCst);
                return Err(self.cap_error());
            }
        }
        Ok(None)
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            name: self.name.clone(),
            size: self.size,
            successes: self.successes(),
            failures: self.failures(),
        }
    }

    /// Log the current counts.
    pub fn log_report(&self) {
        info!(
            task = %self.name,
            successes = self.successes(),
            failures = self.failures(),
            size = self.size,
            "Task report"
        );
    }
}
