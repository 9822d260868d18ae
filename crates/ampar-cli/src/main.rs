//! # AMPAR CLI
//!
//! Command-line interface for AMPA-receptor trafficking simulations.

use ampar_core::{Termination, Trajectory};
use ampar_gillespie::{ReactionNetwork, SynapseStatistics};
use ampar_trafficking::{run_ensemble, TraffickingModel, TraffickingParameters};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ampar")]
#[command(version = "0.1.0")]
#[command(about = "Stochastic AMPA-receptor trafficking simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Physical model parameters shared by the simulation commands.
#[derive(Args)]
struct ModelArgs {
    /// Slots per synapse
    #[arg(long, value_delimiter = ',', default_values_t = vec![40u64, 60, 80])]
    slots: Vec<u64>,

    /// Target filling fraction F
    #[arg(long, default_value_t = 0.5)]
    filling: f64,

    /// Pool ratio phi
    #[arg(long, default_value_t = 2.67)]
    phi: f64,

    /// Unbinding rate beta (1/min)
    #[arg(long, default_value_t = 60.0 / 43.0)]
    beta: f64,

    /// Pool degradation rate delta (1/min)
    #[arg(long, default_value_t = 1.0 / 14.0)]
    delta: f64,

    /// Include receptor turnover reactions
    #[arg(long)]
    turnover: bool,
}

impl ModelArgs {
    fn build(&self) -> anyhow::Result<TraffickingModel> {
        let params = TraffickingParameters {
            slot_counts: self.slots.clone(),
            target_filling: self.filling,
            pool_ratio: self.phi,
            beta: self.beta,
            delta: self.delta,
            turnover: self.turnover,
        };
        Ok(TraffickingModel::build(&params)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single seeded trajectory
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Time horizon (min)
        #[arg(long, default_value_t = 10.0)]
        tmax: f64,

        /// Maximum number of stored snapshots
        #[arg(long, default_value_t = 5000)]
        nmax: usize,

        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write trajectory and statistics as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Average statistics over repeated independent runs
    Ensemble {
        #[command(flatten)]
        model: ModelArgs,

        /// Number of independent runs
        #[arg(long, default_value_t = 10)]
        runs: usize,

        /// Time horizon per run (min)
        #[arg(long, default_value_t = 10.0)]
        tmax: f64,

        /// Maximum number of stored snapshots per run
        #[arg(long, default_value_t = 5000)]
        nmax: usize,

        /// Base RNG seed (run i uses seed + i)
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Parse a reaction string and print its stoichiometry
    Network {
        /// Reaction string, e.g. "2X1+X2->X3,X1->0"
        spec: String,
    },
}

/// JSON payload for the `run --output` sink.
#[derive(Serialize)]
struct RunReport<'a> {
    trajectory: &'a Trajectory,
    statistics: &'a SynapseStatistics,
}

fn termination_label(termination: Termination) -> &'static str {
    match termination {
        Termination::HorizonReached => "time horizon reached",
        Termination::StepBound => "step bound reached (truncated)",
        Termination::Absorbed => "absorbed (no feasible reaction)",
    }
}

fn print_statistics(stats: &SynapseStatistics, theoretical: f64) {
    println!("{}", "Per-synapse statistics:".green().bold());
    for i in 0..stats.filling_fraction.len() {
        let cv = match stats.coefficient_of_variation[i] {
            Some(cv) => format!("{cv:.2}%"),
            None => "undefined (zero mean occupancy)".to_string(),
        };
        println!(
            "  synapse {}: F = {:.4}   CV = {}",
            (i + 1).to_string().cyan(),
            stats.filling_fraction[i],
            cv
        );
    }
    println!("  theoretical F = {:.4}", theoretical);
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            model,
            tmax,
            nmax,
            seed,
            output,
        } => {
            let model = model.build()?;
            println!(
                "{} {} reactions, {} species, seed {}",
                "Simulating:".green().bold(),
                model.network.n_reactions(),
                model.network.n_species(),
                seed
            );

            let (trajectory, stats) = model.simulate(tmax, nmax, seed)?;
            println!(
                "  {} events in {:.3} min ({})",
                trajectory.n_events(),
                trajectory.elapsed(),
                termination_label(trajectory.termination).yellow()
            );
            print_statistics(&stats, model.theoretical_filling_fraction());

            if let Some(path) = output {
                let file = File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                serde_json::to_writer_pretty(
                    file,
                    &RunReport {
                        trajectory: &trajectory,
                        statistics: &stats,
                    },
                )?;
                println!("{} {}", "Wrote:".green().bold(), path.display());
            }
        }

        Commands::Ensemble {
            model,
            runs,
            tmax,
            nmax,
            seed,
        } => {
            let model = model.build()?;
            println!(
                "{} {} runs x {:.1} min, base seed {}",
                "Ensemble:".green().bold(),
                runs,
                tmax,
                seed
            );

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
            spinner.set_message(format!("{runs} trajectories running"));
            spinner.enable_steady_tick(Duration::from_millis(100));

            let summary = run_ensemble(&model, tmax, nmax, runs, seed)?;
            spinner.finish_and_clear();

            let truncated = summary
                .terminations
                .iter()
                .filter(|t| **t == Termination::StepBound)
                .count();
            if truncated > 0 {
                println!(
                    "{} {truncated} of {runs} runs hit the step bound; consider a larger --nmax",
                    "Warning:".yellow().bold()
                );
            }

            print_statistics(
                &SynapseStatistics {
                    filling_fraction: summary.filling_fraction.clone(),
                    coefficient_of_variation: summary.coefficient_of_variation.clone(),
                },
                model.theoretical_filling_fraction(),
            );
        }

        Commands::Network { spec } => {
            let network = ReactionNetwork::parse(&spec)?;
            println!(
                "{} {} reactions over {} species",
                "Parsed:".green().bold(),
                network.n_reactions(),
                network.n_species()
            );
            println!("  canonical form: {}", network.to_reaction_string().cyan());
            println!("  substrates:\n{}", network.substrates());
            println!("  products:\n{}", network.products());
            println!("  net stoichiometry:\n{}", network.net_stoichiometry());
        }
    }

    Ok(())
}
