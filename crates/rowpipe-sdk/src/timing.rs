//! Per-phase wall clock accounting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discover,
    Download,
    Extract,
    Enrich,
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discover => "discover",
            Phase::Download => "download",
            Phase::Extract => "extract",
            Phase::Enrich => "enrich",
            Phase::Write => "write",
        };
        f.write_str(name)
    }
}

/// Timing of one phase.
///
/// `active` sums the duration of every timed section, so concurrent sections
/// can make it exceed `last_end - first_start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub first_start: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms")]
    pub active: Duration,
    pub sections: u64,
}

pub type TimingReport = BTreeMap<Phase, PhaseTiming>;

#[derive(Debug, Clone, Default)]
pub struct Timing {
    phases: Arc<Mutex<TimingReport>>,
}

impl Timing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a section of `phase`; it ends when the timer drops
    pub fn start(&self, phase: Phase) -> PhaseTimer {
        let started_at = Utc::now();
        self.update(phase, |t| {
            if t.first_start.is_none() {
                t.first_start = Some(started_at);
            }
        });
        PhaseTimer {
            timing: self.clone(),
            phase,
            started: Instant::now(),
        }
    }

    /// Record a section measured elsewhere, e.g. a sum of per-row durations
    pub fn add_active(&self, phase: Phase, active: Duration) {
        self.update(phase, |t| {
            t.active += active;
        });
    }

    pub fn report(&self) -> TimingReport {
        self.phases
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn update(&self, phase: Phase, f: impl FnOnce(&mut PhaseTiming)) {
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        f(phases.entry(phase).or_default());
    }
}

/// A running section of one phase
#[must_use = "the section ends as soon as the timer is dropped"]
#[derive(Debug)]
pub struct PhaseTimer {
    timing: Timing,
    phase: Phase,
    started: Instant,
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let ended_at = Utc::now();
        self.timing.update(self.phase, |t| {
            t.active += elapsed;
            t.sections += 1;
            if t.last_end.is_none_or(|end| ended_at > end) {
                t.last_end = Some(ended_at);
            }
        });
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
