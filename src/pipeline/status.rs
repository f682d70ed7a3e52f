//! Run state and progress accounting

use crate::client::ErrorCounters;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle of a single run.
///
/// ```text
/// Idle ─start─► Starting ─ready─► Running ─stop─► Stopping ─quiesced─► Stopped
///                                    │
///                                    ├── exhausted ──► Completed
///                                    └── fatal ──────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunState {
    /// States in which a new run may be started.
    pub fn accepts_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Completed | Self::Failed)
    }

    /// States describing an active run.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Terminal states of a finished run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

/// Shared per-run progress counters; plain atomics, no critical sections.
#[derive(Debug, Default)]
pub struct Counters {
    pub discovered: AtomicU64,
    pub fetched: AtomicU64,
    pub analyzed: AtomicU64,
    pub persisted: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        *self.started_at.lock().unwrap() = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    pub fn add_discovered(&self, n: u64) {
        self.discovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_analyzed(&self) {
        self.analyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }
}

/// JSON-serializable snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub state: RunState,
    pub discovered: u64,
    pub fetched: u64,
    pub analyzed: u64,
    pub persisted: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub started_at: Option<String>,
    /// Fraction of the run's target already persisted, in [0, 100].
    pub progress_percentage: f32,
    /// Seconds until completion at the current throughput.
    pub eta_seconds: Option<f64>,
}

impl StatusSnapshot {
    /// Assemble a snapshot from the live counters.
    ///
    /// The target is the paper cap when one is set, otherwise the number
    /// discovered so far; persisted progress is measured against it.
    pub fn capture(
        state: RunState,
        counters: &Arc<Counters>,
        errors: &Arc<ErrorCounters>,
        max_papers: Option<usize>,
    ) -> Self {
        let discovered = counters.discovered.load(Ordering::Relaxed);
        let persisted = counters.persisted.load(Ordering::Relaxed);
        let started_at = counters.started_at();

        let target = match max_papers {
            Some(cap) => (cap as u64).min(discovered.max(1)),
            None => discovered,
        };
        let progress_percentage = if state == RunState::Completed {
            100.0
        } else if target == 0 {
            0.0
        } else {
            ((persisted as f32 / target as f32) * 100.0).clamp(0.0, 100.0)
        };

        let eta_seconds = started_at.and_then(|start| {
            let elapsed = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
            if persisted == 0 || elapsed <= 0.0 || !state.is_active() {
                return None;
            }
            let rate = persisted as f64 / elapsed;
            let remaining = target.saturating_sub(persisted) as f64;
            Some(remaining / rate)
        });

        Self {
            running: state.is_active(),
            state,
            discovered,
            fetched: counters.fetched.load(Ordering::Relaxed),
            analyzed: counters.analyzed.load(Ordering::Relaxed),
            persisted,
            errors_by_kind: errors.snapshot(),
            started_at: started_at.map(|t| t.to_rfc3339()),
            progress_percentage,
            eta_seconds,
        }
    }
}
