//! # Gillespie-RS
//!
//! Exact stochastic simulation of chemical reaction networks with the
//! Gillespie direct method.
//!
//! ## Reaction DSL
//!
//! Networks are written as a compact reaction string:
//!
//! ```text
//! 2X1+X2->X3,X1->0,X3+4X2->12X1
//! ```
//!
//! Reactions are separated by `,`, each reaction is `LHS->RHS`, each side
//! is a `+`-joined list of terms `[coefficient]X<index>` with implicit
//! coefficient 1 and 1-based species indices. A side that is the literal
//! `0` consumes or produces nothing. No whitespace is permitted.
//!
//! ## Direct Method
//!
//! Each step draws an exponential waiting time from the total propensity
//! `a0` and selects the firing reaction proportionally to its share of
//! `a0`, using exactly two uniform draws per event:
//!
//! 1. `dt = (1/a0) * ln(1/r1)`
//! 2. `mu` = smallest index with `sum(a[0..=mu]) >= r2*a0`
//!
//! Propensities count distinct ordered combinations of reactant molecules
//! exactly, in integer arithmetic, so counts in the hundreds lose no
//! precision.

use ampar_core::{Rate, Result, StateVector, Termination, Time, TraffickingError, Trajectory};
use ndarray::{Array1, Array2};
use pest::Parser as _;
use pest_derive::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

// =============================================================================
// REACTION DSL
// =============================================================================

/// Reaction-string parser
#[derive(Parser)]
#[grammar_inline = r#"
network = { SOI ~ reaction ~ ("," ~ reaction)* ~ EOI }
reaction = { side ~ "->" ~ side }
side = { empty | (term ~ ("+" ~ term)*) }
empty = { "0" }
term = { coefficient? ~ "X" ~ index }
coefficient = @{ ASCII_DIGIT+ }
index = @{ ASCII_DIGIT+ }
"#]
struct ReactionGrammar;

/// A parsed reaction network: substrate and product stoichiometry as two
/// dense M x N integer matrices (M reactions, N species).
///
/// Substrate entries are stored as positive magnitudes; the signed row
/// applied to the state when a reaction fires is `products - substrates`.
/// A species appearing on both sides of one reaction is kept on both
/// sides, not collapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionNetwork {
    substrates: Array2<i64>,
    products: Array2<i64>,
}

/// One `[coefficient]X<index>` term, 1-based species index.
type Term = (usize, i64);

impl ReactionNetwork {
    /// Compile a reaction string into stoichiometry matrices.
    ///
    /// The species count N is the maximum species index referenced
    /// anywhere in the string.
    pub fn parse(text: &str) -> Result<Self> {
        let mut pairs = ReactionGrammar::parse(Rule::network, text)
            .map_err(|e| TraffickingError::MalformedReaction(e.to_string()))?;
        let network = pairs.next().expect("grammar yields one network node");

        let mut reactions: Vec<(Vec<Term>, Vec<Term>)> = Vec::new();
        for reaction in network.into_inner() {
            if reaction.as_rule() != Rule::reaction {
                continue; // EOI
            }
            let mut sides = reaction.into_inner();
            let lhs = parse_side(sides.next().expect("reaction has a substrate side"))?;
            let rhs = parse_side(sides.next().expect("reaction has a product side"))?;
            reactions.push((lhs, rhs));
        }

        let n_species = reactions
            .iter()
            .flat_map(|(lhs, rhs)| lhs.iter().chain(rhs.iter()))
            .map(|&(index, _)| index)
            .max()
            .ok_or_else(|| {
                TraffickingError::MalformedReaction(
                    "network references no species".to_string(),
                )
            })?;

        let mut substrates = Array2::zeros((reactions.len(), n_species));
        let mut products = Array2::zeros((reactions.len(), n_species));
        for (r, (lhs, rhs)) in reactions.iter().enumerate() {
            for &(index, coeff) in lhs {
                substrates[[r, index - 1]] += coeff;
            }
            for &(index, coeff) in rhs {
                products[[r, index - 1]] += coeff;
            }
        }

        Ok(Self { substrates, products })
    }

    /// Build a network from hand-written stoichiometry matrices.
    pub fn from_matrices(substrates: Array2<i64>, products: Array2<i64>) -> Result<Self> {
        if substrates.dim() != products.dim() {
            return Err(TraffickingError::DimensionMismatch(format!(
                "substrate matrix is {:?} but product matrix is {:?}",
                substrates.dim(),
                products.dim()
            )));
        }
        if substrates.iter().chain(products.iter()).any(|&k| k < 0) {
            return Err(TraffickingError::MalformedReaction(
                "stoichiometric coefficients must be non-negative magnitudes".to_string(),
            ));
        }
        Ok(Self { substrates, products })
    }

    /// Number of reactions M.
    pub fn n_reactions(&self) -> usize {
        self.substrates.nrows()
    }

    /// Number of species N.
    pub fn n_species(&self) -> usize {
        self.substrates.ncols()
    }

    /// Molecules consumed per reaction and species (positive magnitudes).
    pub fn substrates(&self) -> &Array2<i64> {
        &self.substrates
    }

    /// Molecules produced per reaction and species.
    pub fn products(&self) -> &Array2<i64> {
        &self.products
    }

    /// Signed update rows: row `r` added to the state when reaction `r`
    /// fires.
    pub fn net_stoichiometry(&self) -> Array2<i64> {
        &self.products - &self.substrates
    }

    /// Serialize back to the reaction-string form. Coefficient 1 is
    /// omitted and an all-zero side prints as `0`, so parsing the output
    /// reproduces the same matrices.
    pub fn to_reaction_string(&self) -> String {
        (0..self.n_reactions())
            .map(|r| {
                format!(
                    "{}->{}",
                    format_side(self.substrates.row(r)),
                    format_side(self.products.row(r))
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_side(pair: pest::iterators::Pair<Rule>) -> Result<Vec<Term>> {
    let mut terms = Vec::new();
    for node in pair.into_inner() {
        if node.as_rule() != Rule::term {
            continue; // empty side
        }
        let mut coeff: i64 = 1;
        let mut index: usize = 0;
        for part in node.into_inner() {
            match part.as_rule() {
                Rule::coefficient => {
                    coeff = part.as_str().parse().map_err(|_| {
                        TraffickingError::MalformedReaction(format!(
                            "coefficient '{}' out of range",
                            part.as_str()
                        ))
                    })?;
                }
                Rule::index => {
                    index = part.as_str().parse().map_err(|_| {
                        TraffickingError::MalformedReaction(format!(
                            "species index '{}' out of range",
                            part.as_str()
                        ))
                    })?;
                }
                _ => unreachable!("term holds only coefficient and index"),
            }
        }
        if coeff == 0 {
            return Err(TraffickingError::MalformedReaction(
                "stoichiometric coefficient must be a positive integer".to_string(),
            ));
        }
        if index == 0 {
            return Err(TraffickingError::MalformedReaction(
                "species indices are 1-based; X0 is not a species".to_string(),
            ));
        }
        terms.push((index, coeff));
    }
    Ok(terms)
}

fn format_side(row: ndarray::ArrayView1<i64>) -> String {
    let terms: Vec<String> = row
        .iter()
        .enumerate()
        .filter(|&(_, &k)| k != 0)
        .map(|(s, &k)| {
            if k == 1 {
                format!("X{}", s + 1)
            } else {
                format!("{}X{}", k, s + 1)
            }
        })
        .collect();
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join("+")
    }
}

// =============================================================================
// PROPENSITY CALCULATION
// =============================================================================

/// Number of distinct ordered selections of `k` reactant molecules out of
/// `n` available: `C(n,k) * k!`.
///
/// Computed exactly in integer arithmetic via the incremental binomial
/// formula (each intermediate division is exact), so occupancies in the
/// hundreds do not go through large floating factorials. Returns 0 when
/// `k > n` and 1 when `k == 0` (empty selection).
pub fn reactant_combinations(n: i64, k: i64) -> u128 {
    if k < 0 || n < k {
        return 0;
    }
    if k == 0 {
        return 1;
    }
    let (n, k) = (n as u128, k as u128);
    let mut binomial: u128 = 1;
    for i in 1..=k {
        binomial = binomial * (n - k + i) / i;
    }
    let mut k_factorial: u128 = 1;
    for i in 2..=k {
        k_factorial *= i;
    }
    binomial * k_factorial
}

/// Propensity vector `a` for the current state: `a[r] = h_r * c_r` where
/// `h_r` is the number of distinct reactant combinations of reaction `r`.
///
/// A reaction with any depleted reactant gets propensity exactly 0; a
/// reaction with an empty substrate side gets `h_r = 1` (spontaneous
/// synthesis fires at its bare rate constant).
pub fn propensities(
    state: &StateVector,
    network: &ReactionNetwork,
    rates: &Array1<Rate>,
) -> Array1<f64> {
    let mut a = Array1::zeros(network.n_reactions());
    for r in 0..network.n_reactions() {
        let mut h = 1.0_f64;
        for (s, &k) in network.substrates().row(r).iter().enumerate() {
            if k == 0 {
                continue;
            }
            if state[s] <= 0 {
                h = 0.0;
                break;
            }
            h *= reactant_combinations(state[s], k) as f64;
        }
        a[r] = h * rates[r];
    }
    a
}

// =============================================================================
// EVENT SCHEDULER (DIRECT METHOD)
// =============================================================================

/// Waiting time and index of the next reaction, given the propensity
/// vector, its total, and two uniform draws.
///
/// Pure in its inputs: identical `(a, a0, r1, r2)` always yield the same
/// event. The caller must rule out absorption (`a0 <= 0`) first.
pub fn next_event(a: &Array1<f64>, a0: f64, r1: f64, r2: f64) -> (Time, usize) {
    debug_assert!(a0 > 0.0, "caller must check for absorption before scheduling");

    let dt = (1.0 / a0) * (1.0 / r1).ln();

    // Smallest mu with sum(a[0..=mu]) >= r2*a0, scanned over lazily
    // produced partial sums. Float shortfall in the final partial sum
    // falls back to the last reaction.
    let threshold = r2 * a0;
    let mu = a
        .iter()
        .scan(0.0_f64, |acc, &a_i| {
            *acc += a_i;
            Some(*acc)
        })
        .position(|partial| partial >= threshold)
        .unwrap_or(a.len() - 1);

    (dt, mu)
}

// =============================================================================
// RANDOM DRAW SEQUENCE
// =============================================================================

/// Pre-generated, ordered uniform draws: one `(r1, r2)` pair per potential
/// event. A run never reseeds or mixes extra entropy, so a trajectory is
/// reproducible from the seed and the step bound alone.
#[derive(Debug, Clone)]
pub struct DrawSequence {
    pairs: Vec<(f64, f64)>,
    cursor: usize,
}

impl DrawSequence {
    /// Generate `n_max` draw pairs from a seed. `r1` lies in (0, 1] so
    /// `ln(1/r1)` stays finite; `r2` lies in [0, 1).
    pub fn from_seed(seed: u64, n_max: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let pairs = (0..n_max)
            .map(|_| (1.0 - rng.gen::<f64>(), rng.gen::<f64>()))
            .collect();
        Self { pairs, cursor: 0 }
    }

    /// Use caller-supplied draws verbatim.
    pub fn from_pairs(pairs: Vec<(f64, f64)>) -> Self {
        Self { pairs, cursor: 0 }
    }

    /// Consume the next pair, if any are left.
    pub fn next_pair(&mut self) -> Option<(f64, f64)> {
        let pair = self.pairs.get(self.cursor).copied();
        if pair.is_some() {
            self.cursor += 1;
        }
        pair
    }

    /// Pairs not yet consumed.
    pub fn remaining(&self) -> usize {
        self.pairs.len() - self.cursor
    }
}

// =============================================================================
// SIMULATION LOOP
// =============================================================================

/// One stochastic simulation run over a fixed reaction network.
///
/// Owns a private copy of the matrices and the state vector, so
/// independent runs share nothing and may be distributed across threads
/// by an orchestrator.
#[derive(Debug, Clone)]
pub struct StochasticSimulation {
    network: ReactionNetwork,
    rates: Array1<Rate>,
    net_stoich: Array2<i64>,
    state: StateVector,
    t: Time,
}

impl StochasticSimulation {
    /// Validate dimensions and build a simulation at time 0.
    pub fn new(
        network: ReactionNetwork,
        rates: Array1<Rate>,
        initial: StateVector,
    ) -> Result<Self> {
        if rates.len() != network.n_reactions() {
            return Err(TraffickingError::DimensionMismatch(format!(
                "{} rate constants for {} reactions",
                rates.len(),
                network.n_reactions()
            )));
        }
        if initial.len() != network.n_species() {
            return Err(TraffickingError::DimensionMismatch(format!(
                "initial state has {} species but the network references {}",
                initial.len(),
                network.n_species()
            )));
        }
        if rates.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(TraffickingError::SimulationError(
                "rate constants must be finite and non-negative".to_string(),
            ));
        }
        if initial.iter().any(|&x| x < 0) {
            return Err(TraffickingError::SimulationError(
                "initial molecule counts must be non-negative".to_string(),
            ));
        }
        let net_stoich = network.net_stoichiometry();
        Ok(Self {
            network,
            rates,
            net_stoich,
            state: initial,
            t: 0.0,
        })
    }

    /// Current molecule counts.
    pub fn state(&self) -> &StateVector {
        &self.state
    }

    /// Current simulation time.
    pub fn current_time(&self) -> Time {
        self.t
    }

    /// Run until the time horizon, the step bound, or absorption.
    ///
    /// `n_max` bounds stored snapshots (initial plus at most `n_max - 1`
    /// events). Hitting it is a soft condition: the truncated trajectory
    /// is returned with [`Termination::StepBound`] so the caller can warn
    /// or retry with a larger bound. Absorption (`a0 == 0`) is likewise a
    /// valid termination, not an error.
    pub fn run(
        &mut self,
        t_max: Time,
        n_max: usize,
        draws: &mut DrawSequence,
    ) -> Result<Trajectory> {
        if !(t_max > 0.0) {
            return Err(TraffickingError::SimulationError(
                "time horizon must be positive".to_string(),
            ));
        }
        if n_max == 0 {
            return Err(TraffickingError::SimulationError(
                "step bound must leave room for the initial snapshot".to_string(),
            ));
        }

        let mut trajectory = Trajectory::new(self.state.clone());
        let mut n_events = 0usize;

        loop {
            if self.t >= t_max {
                trajectory.termination = Termination::HorizonReached;
                break;
            }
            if n_events >= n_max - 1 {
                trajectory.termination = Termination::StepBound;
                break;
            }

            let a = propensities(&self.state, &self.network, &self.rates);
            let a0 = a.sum();
            if a0 <= 0.0 {
                trajectory.termination = Termination::Absorbed;
                break;
            }

            let Some((r1, r2)) = draws.next_pair() else {
                // Caller supplied fewer pairs than n_max: same soft
                // truncation as the step bound.
                trajectory.termination = Termination::StepBound;
                break;
            };

            let (dt, mu) = next_event(&a, a0, r1, r2);
            self.t += dt;
            self.state += &self.net_stoich.row(mu);
            debug_assert!(
                self.state.iter().all(|&x| x >= 0),
                "reaction {mu} drove a species count negative"
            );

            trajectory.push(self.t, self.state.clone());
            n_events += 1;
        }

        Ok(trajectory)
    }
}

// =============================================================================
// STATISTICS AGGREGATION
// =============================================================================

/// Per-synapse summary statistics of one trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseStatistics {
    /// Time-averaged occupancy divided by slot count, per synapse.
    pub filling_fraction: Array1<f64>,
    /// Time-weighted std dev over mean, in percent, per synapse.
    /// `None` for a synapse whose mean occupancy is zero, where the
    /// relative dispersion has no value.
    pub coefficient_of_variation: Vec<Option<f64>>,
}

/// Streaming aggregator over the synapse-occupancy sub-vector (the first
/// `slot_counts.len()` species). Holds running weighted sums only, never
/// the trajectory itself, so memory use is independent of run length.
///
/// The state recorded for an interval is the one that held over it (left
/// endpoint of the holding interval).
#[derive(Debug, Clone)]
pub struct OccupancyAccumulator {
    slot_counts: Array1<f64>,
    weighted: Array1<f64>,
    weighted_sq: Array1<f64>,
    elapsed: Time,
}

impl OccupancyAccumulator {
    pub fn new(slot_counts: &[u64]) -> Self {
        let n = slot_counts.len();
        Self {
            slot_counts: slot_counts.iter().map(|&s| s as f64).collect(),
            weighted: Array1::zeros(n),
            weighted_sq: Array1::zeros(n),
            elapsed: 0.0,
        }
    }

    /// Fold in one holding interval of length `dt` during which `state`
    /// was current.
    pub fn record(&mut self, dt: Time, state: &StateVector) {
        for i in 0..self.weighted.len() {
            let w = state[i] as f64;
            self.weighted[i] += dt * w;
            self.weighted_sq[i] += dt * w * w;
        }
        self.elapsed += dt;
    }

    /// Finalize into filling fraction and coefficient of variation.
    ///
    /// Fails with `UndefinedStatistic` on a zero-duration trajectory,
    /// instead of silently producing NaN. A synapse whose mean occupancy
    /// is zero still has a filling fraction (zero); only its coefficient
    /// of variation is withheld.
    pub fn finish(self) -> Result<SynapseStatistics> {
        if self.elapsed <= 0.0 {
            return Err(TraffickingError::UndefinedStatistic(
                "trajectory has zero elapsed time".to_string(),
            ));
        }

        let n = self.weighted.len();
        let mut filling_fraction = Array1::zeros(n);
        let mut coefficient_of_variation = Vec::with_capacity(n);
        for i in 0..n {
            filling_fraction[i] = self.weighted[i] / (self.slot_counts[i] * self.elapsed);
            let mean = self.weighted[i] / self.elapsed;
            if mean > 0.0 {
                let variance = (self.weighted_sq[i] / self.elapsed - mean * mean).max(0.0);
                coefficient_of_variation.push(Some(100.0 * variance.sqrt() / mean));
            } else {
                coefficient_of_variation.push(None);
            }
        }

        Ok(SynapseStatistics {
            filling_fraction,
            coefficient_of_variation,
        })
    }
}

/// Aggregate a stored trajectory.
pub fn synapse_statistics(
    trajectory: &Trajectory,
    slot_counts: &[u64],
) -> Result<SynapseStatistics> {
    let n_species = trajectory
        .states
        .first()
        .map(|s| s.len())
        .unwrap_or(0);
    if slot_counts.len() > n_species {
        return Err(TraffickingError::DimensionMismatch(format!(
            "{} slot counts for {} species",
            slot_counts.len(),
            n_species
        )));
    }

    let mut accumulator = OccupancyAccumulator::new(slot_counts);
    for (dt, state) in trajectory.intervals() {
        accumulator.record(dt, state);
    }
    accumulator.finish()
}

// =============================================================================
// TESTS
// =============================================================================
