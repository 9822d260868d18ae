//! # Trafficking-RS
//!
//! AMPA-receptor trafficking between synaptic slots and a shared
//! extrasynaptic receptor pool, as a stochastic reaction network.
//!
//! ## Model
//!
//! Each synapse `i` has `s_i` slots. A receptor from the shared pool `p`
//! binds an empty slot `e_i` at rate `alpha` and unbinds back at rate
//! `beta`; optional turnover exchanges pool receptors with the rest of
//! the cell (`0 -> p` at `gamma`, `p -> 0` at `delta`). For three
//! synapses without turnover the compiled network is
//!
//! ```text
//! X7+X4->X1,X7+X5->X2,X7+X6->X3,X1->X7+X4,X2->X7+X5,X3->X7+X6
//! ```
//!
//! ## Parameter Derivation
//!
//! Rates are derived from physical constants rather than given directly:
//! a target filling fraction `F`, a pool ratio `phi`, and measured
//! `beta`, `delta` determine `alpha`, `gamma`, and the pool size, so
//! that the network starts near its steady state.

use ampar_core::{Result, StateVector, Termination, TraffickingError, Trajectory};
use ampar_gillespie::{
    synapse_statistics, DrawSequence, ReactionNetwork, StochasticSimulation, SynapseStatistics,
};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// PHYSICAL PARAMETERS
// =============================================================================

/// Physical constants the stochastic rates are derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraffickingParameters {
    /// Slots per synapse, `s_i`
    pub slot_counts: Vec<u64>,
    /// Target filling fraction F used to place the initial state
    pub target_filling: f64,
    /// Pool ratio phi relating pool size to total slot count
    pub pool_ratio: f64,
    /// Unbinding rate (1/min)
    pub beta: f64,
    /// Pool degradation rate (1/min)
    pub delta: f64,
    /// Include receptor turnover reactions (`0 -> p`, `p -> 0`)
    pub turnover: bool,
}

impl Default for TraffickingParameters {
    /// Short-term sanity-check constants: three synapses, half filling,
    /// turnover off.
    fn default() -> Self {
        Self {
            slot_counts: vec![40, 60, 80],
            target_filling: 0.5,
            pool_ratio: 2.67,
            beta: 60.0 / 43.0,
            delta: 1.0 / 14.0,
            turnover: false,
        }
    }
}

/// Rates and pool size derived from [`TraffickingParameters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedRates {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
    /// Initial shared-pool occupancy `p = round(gamma/delta)`
    pub shared_pool: u64,
}

impl TraffickingParameters {
    fn validate(&self) -> Result<()> {
        if self.slot_counts.is_empty() {
            return Err(TraffickingError::DimensionMismatch(
                "at least one synapse is required".to_string(),
            ));
        }
        if !(self.target_filling > 0.0 && self.target_filling < 1.0) {
            return Err(TraffickingError::SimulationError(
                "target filling fraction must lie in (0, 1)".to_string(),
            ));
        }
        if self.pool_ratio <= 0.0 || self.beta <= 0.0 || self.delta <= 0.0 {
            return Err(TraffickingError::SimulationError(
                "pool ratio, beta and delta must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the stochastic rate constants:
    /// `alpha = beta / (phi * s * (1 - F))`, `gamma = delta * (s*phi - beta/alpha)`.
    pub fn derive(&self) -> Result<DerivedRates> {
        self.validate()?;
        let s: f64 = self.slot_counts.iter().sum::<u64>() as f64;
        let alpha = self.beta / (self.pool_ratio * s * (1.0 - self.target_filling));
        let gamma = self.delta * (s * self.pool_ratio - self.beta / alpha);
        if gamma < 0.0 {
            return Err(TraffickingError::SimulationError(
                "derived pool size is negative; check phi and F".to_string(),
            ));
        }
        Ok(DerivedRates {
            alpha,
            beta: self.beta,
            gamma,
            delta: self.delta,
            shared_pool: (gamma / self.delta).round() as u64,
        })
    }
}

// =============================================================================
// MODEL CONSTRUCTION
// =============================================================================

/// A compiled trafficking model: network, rate constants, and the initial
/// state `[w_1..w_N, e_1..e_N, p]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraffickingModel {
    pub network: ReactionNetwork,
    pub rates: Array1<f64>,
    pub initial_state: StateVector,
    pub slot_counts: Vec<u64>,
    pub derived: DerivedRates,
}

/// Reaction string for N synapses: binding `p + e_i -> w_i`, unbinding
/// `w_i -> p + e_i`, optional pool turnover.
fn reaction_string(n_synapses: usize, turnover: bool) -> String {
    let pool = 2 * n_synapses + 1;
    let mut reactions = Vec::with_capacity(2 * n_synapses + 2);
    for i in 1..=n_synapses {
        reactions.push(format!("X{}+X{}->X{}", pool, n_synapses + i, i));
    }
    for i in 1..=n_synapses {
        reactions.push(format!("X{}->X{}+X{}", i, pool, n_synapses + i));
    }
    if turnover {
        reactions.push(format!("0->X{}", pool));
        reactions.push(format!("X{}->0", pool));
    }
    reactions.join(",")
}

impl TraffickingModel {
    /// Compile a model from physical parameters.
    ///
    /// The initial state places `w_i = round(s_i * F)` receptors in slots,
    /// leaves `e_i = s_i - w_i` slots empty, and fills the shared pool
    /// with the derived occupancy.
    pub fn build(params: &TraffickingParameters) -> Result<Self> {
        let derived = params.derive()?;
        let n = params.slot_counts.len();

        let network = ReactionNetwork::parse(&reaction_string(n, params.turnover))?;

        let mut rates = Vec::with_capacity(network.n_reactions());
        rates.extend(std::iter::repeat(derived.alpha).take(n));
        rates.extend(std::iter::repeat(derived.beta).take(n));
        if params.turnover {
            rates.push(derived.gamma);
            rates.push(derived.delta);
        }

        let mut initial = Vec::with_capacity(2 * n + 1);
        for &s_i in &params.slot_counts {
            initial.push((s_i as f64 * params.target_filling).round() as i64);
        }
        for (i, &s_i) in params.slot_counts.iter().enumerate() {
            initial.push(s_i as i64 - initial[i]);
        }
        initial.push(derived.shared_pool as i64);

        Ok(Self {
            network,
            rates: Array1::from(rates),
            initial_state: Array1::from(initial),
            slot_counts: params.slot_counts.clone(),
            derived,
        })
    }

    pub fn n_synapses(&self) -> usize {
        self.slot_counts.len()
    }

    /// Total slot count S.
    pub fn total_slots(&self) -> u64 {
        self.slot_counts.iter().sum()
    }

    /// Total receptor count R: bound receptors plus the shared pool.
    pub fn total_receptors(&self) -> i64 {
        let n = self.n_synapses();
        self.initial_state.iter().take(n).sum::<i64>()
            + self.initial_state[self.initial_state.len() - 1]
    }

    /// Closed-form filling fraction this model should relax to.
    pub fn theoretical_filling_fraction(&self) -> f64 {
        theoretical_filling_fraction(
            self.total_slots() as f64,
            self.total_receptors() as f64,
            self.derived.beta,
            self.derived.alpha,
        )
    }

    /// Run one seeded trajectory and aggregate its statistics.
    pub fn simulate(
        &self,
        t_max: f64,
        n_max: usize,
        seed: u64,
    ) -> Result<(Trajectory, SynapseStatistics)> {
        let mut sim = StochasticSimulation::new(
            self.network.clone(),
            self.rates.clone(),
            self.initial_state.clone(),
        )?;
        let mut draws = DrawSequence::from_seed(seed, n_max);
        let trajectory = sim.run(t_max, n_max, &mut draws)?;
        let stats = synapse_statistics(&trajectory, &self.slot_counts)?;
        Ok((trajectory, stats))
    }
}

/// Closed-form short-term filling fraction for `S` total slots, `R` total
/// receptors, and binding/unbinding rates `alpha`, `beta`:
///
/// `W = (S+R+beta/alpha)/2 - sqrt((S+R+beta/alpha)^2/4 - R*S)`, `F = W/S`.
///
/// The argument tuple `(S, R, beta, alpha)` is fixed and named; do not
/// reorder by habit from call sites.
pub fn theoretical_filling_fraction(
    total_slots: f64,
    total_receptors: f64,
    beta: f64,
    alpha: f64,
) -> f64 {
    let q = total_slots + total_receptors + beta / alpha;
    let bound = q / 2.0 - (q * q / 4.0 - total_receptors * total_slots).sqrt();
    bound / total_slots
}

// =============================================================================
// ENSEMBLE ORCHESTRATION
// =============================================================================

/// Explicit accumulator for per-run statistics. Owned and threaded through
/// by the orchestrator; nothing global.
#[derive(Debug, Clone)]
pub struct EnsembleAccumulator {
    runs: usize,
    ff_sum: Array1<f64>,
    cv_sum: Vec<f64>,
    cv_runs: Vec<usize>,
}

impl EnsembleAccumulator {
    pub fn new(n_synapses: usize) -> Self {
        Self {
            runs: 0,
            ff_sum: Array1::zeros(n_synapses),
            cv_sum: vec![0.0; n_synapses],
            cv_runs: vec![0; n_synapses],
        }
    }

    pub fn record(&mut self, stats: &SynapseStatistics) {
        self.ff_sum += &stats.filling_fraction;
        for (i, cv) in stats.coefficient_of_variation.iter().enumerate() {
            if let Some(cv) = cv {
                self.cv_sum[i] += cv;
                self.cv_runs[i] += 1;
            }
        }
        self.runs += 1;
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn mean_filling_fraction(&self) -> Array1<f64> {
        &self.ff_sum / self.runs as f64
    }

    /// Per-synapse mean over the runs where the value was defined;
    /// `None` if no run defined it.
    pub fn mean_coefficient_of_variation(&self) -> Vec<Option<f64>> {
        self.cv_sum
            .iter()
            .zip(&self.cv_runs)
            .map(|(sum, &n)| if n > 0 { Some(sum / n as f64) } else { None })
            .collect()
    }
}

/// Ensemble-averaged statistics plus per-run termination conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleSummary {
    pub runs: usize,
    pub filling_fraction: Array1<f64>,
    pub coefficient_of_variation: Vec<Option<f64>>,
    pub terminations: Vec<Termination>,
}

/// Run `n_runs` independent trajectories (seeds `base_seed + i`) in
/// parallel and average their statistics.
///
/// Runs share no mutable state: each gets private copies of the matrices,
/// the state vector, and its own draw sequence.
pub fn run_ensemble(
    model: &TraffickingModel,
    t_max: f64,
    n_max: usize,
    n_runs: usize,
    base_seed: u64,
) -> Result<EnsembleSummary> {
    if n_runs == 0 {
        return Err(TraffickingError::SimulationError(
            "ensemble needs at least one run".to_string(),
        ));
    }

    let per_run: Vec<(SynapseStatistics, Termination)> = (0..n_runs)
        .into_par_iter()
        .map(|i| {
            let (trajectory, stats) =
                model.simulate(t_max, n_max, base_seed.wrapping_add(i as u64))?;
            Ok((stats, trajectory.termination))
        })
        .collect::<Result<_>>()?;

    let mut accumulator = EnsembleAccumulator::new(model.n_synapses());
    let mut terminations = Vec::with_capacity(n_runs);
    for (stats, termination) in &per_run {
        accumulator.record(stats);
        terminations.push(*termination);
    }

    Ok(EnsembleSummary {
        runs: accumulator.runs(),
        filling_fraction: accumulator.mean_filling_fraction(),
        coefficient_of_variation: accumulator.mean_coefficient_of_variation(),
        terminations,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parameter_derivation_matches_constants() {
        let params = TraffickingParameters::default();
        let derived = params.derive().unwrap();

        // s = 180, beta/alpha = phi*s*(1-F) = 240.3
        assert!((derived.alpha - params.beta / 240.3).abs() < 1e-12);
        assert!((derived.gamma - params.delta * (180.0 * 2.67 - 240.3)).abs() < 1e-9);
        assert_eq!(derived.shared_pool, 240);
    }

    #[test]
    fn test_parameter_validation() {
        let mut params = TraffickingParameters::default();
        params.target_filling = 1.0;
        assert!(params.derive().is_err());

        let mut params = TraffickingParameters::default();
        params.slot_counts.clear();
        assert!(matches!(
            params.derive().unwrap_err(),
            TraffickingError::DimensionMismatch(_)
        ));
    }

    #[test]
    fn test_reaction_string_three_synapses() {
        assert_eq!(
            reaction_string(3, false),
            "X7+X4->X1,X7+X5->X2,X7+X6->X3,X1->X7+X4,X2->X7+X5,X3->X7+X6"
        );
        assert_eq!(
            reaction_string(1, true),
            "X3+X2->X1,X1->X3+X2,0->X3,X3->0"
        );
    }

    #[test]
    fn test_model_build_default() {
        let model = TraffickingModel::build(&TraffickingParameters::default()).unwrap();
        assert_eq!(model.network.n_reactions(), 6);
        assert_eq!(model.network.n_species(), 7);
        assert_eq!(model.rates.len(), 6);
        assert_eq!(model.initial_state, array![20, 30, 40, 20, 30, 40, 240]);
        assert_eq!(model.total_slots(), 180);
        assert_eq!(model.total_receptors(), 330);
    }

    #[test]
    fn test_model_build_with_turnover() {
        let mut params = TraffickingParameters::default();
        params.turnover = true;
        let model = TraffickingModel::build(&params).unwrap();
        assert_eq!(model.network.n_reactions(), 8);
        assert_eq!(model.rates[6], model.derived.gamma);
        assert_eq!(model.rates[7], model.derived.delta);
    }

    #[test]
    fn test_theoretical_filling_fraction_hand_checked() {
        // S=180, R=330, beta/alpha=240.3: q=750.3,
        // W = 375.15 - sqrt(140737.52 - 59400) ~= 89.95
        let f = theoretical_filling_fraction(180.0, 330.0, 240.3, 1.0);
        assert!((f - 0.4997).abs() < 1e-3);

        // more receptors fill more slots
        assert!(
            theoretical_filling_fraction(180.0, 400.0, 240.3, 1.0)
                > theoretical_filling_fraction(180.0, 330.0, 240.3, 1.0)
        );
    }

    #[test]
    fn test_default_model_relaxes_to_target_filling() {
        let model = TraffickingModel::build(&TraffickingParameters::default()).unwrap();
        // parameters were chosen so the closed form lands on F = 0.5
        assert!((model.theoretical_filling_fraction() - 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_simulated_filling_fraction_converges() {
        let model = TraffickingModel::build(&TraffickingParameters::default()).unwrap();
        let (trajectory, stats) = model.simulate(100.0, 100_000, 42).unwrap();

        assert!(trajectory.termination.horizon_reached());
        let f_theory = model.theoretical_filling_fraction();
        for &ff in stats.filling_fraction.iter() {
            assert!(
                (ff - f_theory).abs() < 0.05 * f_theory,
                "filling fraction {ff} deviates from closed form {f_theory}"
            );
        }
    }

    #[test]
    fn test_conserved_quantities_in_simulation() {
        let model = TraffickingModel::build(&TraffickingParameters::default()).unwrap();
        let (trajectory, _) = model.simulate(5.0, 50_000, 7).unwrap();

        let n = model.n_synapses();
        for state in &trajectory.states {
            // slots per synapse are conserved: w_i + e_i = s_i
            for i in 0..n {
                assert_eq!(state[i] + state[n + i], model.slot_counts[i] as i64);
            }
            // receptors are conserved without turnover: sum(w_i) + p = R
            let receptors: i64 = state.iter().take(n).sum::<i64>() + state[2 * n];
            assert_eq!(receptors, model.total_receptors());
        }
    }

    #[test]
    fn test_ensemble_averages_runs() {
        let model = TraffickingModel::build(&TraffickingParameters::default()).unwrap();
        let summary = run_ensemble(&model, 1.0, 10_000, 4, 99).unwrap();

        assert_eq!(summary.runs, 4);
        assert_eq!(summary.filling_fraction.len(), 3);
        assert_eq!(summary.terminations.len(), 4);
        assert!(summary
            .terminations
            .iter()
            .all(|t| *t == Termination::HorizonReached));
    }

    #[test]
    fn test_accumulator_means() {
        let mut acc = EnsembleAccumulator::new(2);
        acc.record(&SynapseStatistics {
            filling_fraction: array![0.4, 0.6],
            coefficient_of_variation: vec![Some(10.0), None],
        });
        acc.record(&SynapseStatistics {
            filling_fraction: array![0.6, 0.8],
            coefficient_of_variation: vec![Some(30.0), Some(40.0)],
        });

        assert_eq!(acc.runs(), 2);
        assert_eq!(acc.mean_filling_fraction(), array![0.5, 0.7]);
        // synapse 2 averages only over the runs where it was defined
        assert_eq!(
            acc.mean_coefficient_of_variation(),
            vec![Some(20.0), Some(40.0)]
        );
    }
}
