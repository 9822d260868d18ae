//! # AMPAR Core
//!
//! Shared types for stochastic simulation of AMPA-receptor trafficking.
//!
//! ## Species Layout
//!
//! The trafficking network indexes species 1-based, in three blocks:
//!
//! | Block | Species | Meaning |
//! |-------|---------|---------|
//! | `X1..XN` | `w_i` | receptors bound to synaptic slots |
//! | `XN+1..X2N` | `e_i` | empty slots at synapse i |
//! | `X2N+1` | `p` | shared extrasynaptic receptor pool |
//!
//! ## Design Philosophy
//!
//! 1. Molecule counts are exact integers, never floats
//! 2. Termination conditions are results, not errors
//! 3. A run is fully reproducible from its seed and step bound

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation time (minutes in the trafficking model)
pub type Time = f64;

/// Stochastic rate constant, one per reaction
pub type Rate = f64;

/// Molecule counts for every species
pub type StateVector = Array1<i64>;

/// Common errors
#[derive(Debug, Error)]
pub enum TraffickingError {
    #[error("Malformed reaction: {0}")]
    MalformedReaction(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Undefined statistic: {0}")]
    UndefinedStatistic(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TraffickingError>;

/// Why a simulation run stopped.
///
/// All three conditions are valid terminations that yield a usable
/// trajectory; none of them is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// `current_time` passed the requested horizon.
    HorizonReached,
    /// The event-count bound was hit before the horizon (soft truncation;
    /// the orchestrator may retry with a larger bound).
    StepBound,
    /// Total propensity dropped to zero: no reaction can fire again.
    Absorbed,
}

impl Termination {
    /// True iff the run covered the full requested time horizon.
    pub fn horizon_reached(&self) -> bool {
        matches!(self, Termination::HorizonReached)
    }
}

/// One stochastic trajectory: the initial snapshot at time 0 plus one
/// `(time, state)` snapshot per fired reaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Event times, strictly increasing, `times[0] == 0`
    pub times: Vec<Time>,
    /// Molecule counts after each event, `states[0]` is the initial state
    pub states: Vec<StateVector>,
    /// Why the run stopped
    pub termination: Termination,
}

impl Trajectory {
    /// Start a trajectory from an initial state.
    pub fn new(initial: StateVector) -> Self {
        Self {
            times: vec![0.0],
            states: vec![initial],
            termination: Termination::HorizonReached,
        }
    }

    /// Record the snapshot after a fired reaction.
    pub fn push(&mut self, t: Time, state: StateVector) {
        self.times.push(t);
        self.states.push(state);
    }

    /// Number of fired reactions (snapshots minus the initial one).
    pub fn n_events(&self) -> usize {
        self.times.len() - 1
    }

    /// Total simulated time.
    pub fn elapsed(&self) -> Time {
        self.times.last().copied().unwrap_or(0.0)
    }

    /// State after the last event.
    pub fn final_state(&self) -> &StateVector {
        self.states.last().expect("trajectory holds the initial snapshot")
    }

    /// Iterate over `(dt, state)` holding intervals: the state vector that
    /// was current during `[t_k, t_k+1)` together with the interval length.
    pub fn intervals(&self) -> impl Iterator<Item = (Time, &StateVector)> + '_ {
        self.times
            .windows(2)
            .zip(self.states.iter())
            .map(|(w, s)| (w[1] - w[0], s))
    }
}
