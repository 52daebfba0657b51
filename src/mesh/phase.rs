//! Phase cycle
//!
//! Every node independently advances through the same five ordered phases.
//! The phase at time `t` is the first phase whose cumulative duration exceeds
//! `t mod cycle`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Inhale,
    Hold,
    Exhale,
    Caesura,
    Echo,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Inhale,
        Phase::Hold,
        Phase::Exhale,
        Phase::Caesura,
        Phase::Echo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Inhale => "inhale",
            Phase::Hold => "hold",
            Phase::Exhale => "exhale",
            Phase::Caesura => "caesura",
            Phase::Echo => "echo",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

/// Longest single phase, in seconds
pub const MAX_PHASE_SECS: f64 = 3600.0;

/// Validated per-phase durations
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCycle {
    durations: [f64; 5],
    total: f64,
}

impl PhaseCycle {
    /// Durations in seconds, in phase order
    pub fn new(durations: [f64; 5]) -> Result<Self, ConfigError> {
        for (phase, secs) in Phase::ALL.iter().zip(durations) {
            if !secs.is_finite() || secs <= 0.0 || secs > MAX_PHASE_SECS {
                return Err(ConfigError::InvalidPhaseDuration {
                    phase: phase.as_str(),
                    secs,
                });
            }
        }
        Ok(Self {
            durations,
            total: durations.iter().sum(),
        })
    }

    pub fn total(&self) -> Duration {
        Duration::from_secs_f64(self.total)
    }

    /// Phase at `elapsed` since the cycle origin
    pub fn phase_at(&self, elapsed: Duration) -> Phase {
        let t = elapsed.as_secs_f64() % self.total;
        let mut cumulative = 0.0;
        for (phase, secs) in Phase::ALL.iter().zip(self.durations) {
            cumulative += secs;
            if t < cumulative {
                return *phase;
            }
        }
        // Float residue at the very end of the cycle
        Phase::Echo
    }
}

impl Default for PhaseCycle {
    fn default() -> Self {
        let durations = [2.0, 3.0, 4.0, 1.0, 2.0];
        Self {
            durations,
            total: durations.iter().sum(),
        }
    }
}
