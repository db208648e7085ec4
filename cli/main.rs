// Command-line driver for sparselme.
//
// Generates a synthetic mixed-effects problem from a TOML run configuration and
// reports what the oracles say about it. There is no optimizer here: every
// number printed is a single oracle evaluation at a fixed parameter value.

use clap::{Parser, Subcommand};
use sparselme::config::RunConfig;
use sparselme::{LinearLmeOracleW, LinearLmeProblem};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "sparselme",
    version,
    about = "Evaluate loss, gradient and drop-penalty oracles for sparse linear mixed-effects models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default run configuration
    InitConfig {
        /// Destination of the TOML file
        path: PathBuf,
    },

    /// Report loss, gradients and drop penalties at the true parameters
    Evaluate {
        /// Path to the TOML run configuration
        config: PathBuf,
    },

    /// Report the sparse targets chosen at the generalized least squares beta
    Select {
        /// Path to the TOML run configuration
        config: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::InitConfig { path } => init_config(&path),
        Commands::Evaluate { config } => evaluate(&config),
        Commands::Select { config } => select(&config),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_config(path: &Path) -> Result<(), Box<dyn Error>> {
    RunConfig::default().save(path)?;
    log::info!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn evaluate(path: &Path) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::load(path)?;
    let (problem, truth) = LinearLmeProblem::generate(&config.problem)?;
    let settings = config.selection.resolve(&problem);
    let mut oracle = LinearLmeOracleW::new(&problem, settings)?;

    let beta = truth.beta.view();
    let gamma = truth.gamma.view();
    let loss = oracle.loss(beta, gamma)?;
    let gradient_gamma = oracle.gradient_gamma(beta, gamma)?;
    let gradient_beta = oracle.oracle().gradient_beta(beta, gamma)?;
    oracle.recalculate_drop_matrices(beta, gamma)?;

    println!("loss\t{loss:.12e}");
    println!("parameter\tindex\tvalue\tgradient\tdrop_penalty\tlinked_gamma");
    for (j, link) in problem.beta_to_gamma_map().iter().enumerate() {
        let linked = link.map_or_else(|| "-".to_string(), |k| k.to_string());
        println!(
            "beta\t{j}\t{:.6}\t{:.6e}\t{:.6e}\t{linked}",
            beta[j],
            gradient_beta[j],
            oracle.drop_penalties_beta()[j]
        );
    }
    for k in 0..problem.num_random_effects() {
        println!(
            "gamma\t{k}\t{:.6}\t{:.6e}\t{:.6e}\t-",
            gamma[k],
            gradient_gamma[k],
            oracle.drop_penalties_gamma()[k]
        );
    }
    Ok(())
}

fn select(path: &Path) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::load(path)?;
    let (problem, truth) = LinearLmeProblem::generate(&config.problem)?;
    let settings = config.selection.resolve(&problem);
    let mut oracle = LinearLmeOracleW::new(&problem, settings)?;

    let gamma = truth.gamma.view();
    let beta = oracle.oracle().optimal_beta(gamma)?;
    log::info!("Generalized least squares beta at the true gamma: {:?}", beta.to_vec());

    let (tbeta, tgamma) = oracle.sparse_targets(beta.view(), gamma)?;
    let relaxed = oracle.relaxed_loss(beta.view(), gamma, tbeta.view(), tgamma.view())?;

    println!("relaxed_loss\t{relaxed:.12e}");
    println!("parameter\tindex\tvalue\ttarget\tdrop_penalty");
    for j in 0..problem.num_fixed_effects() {
        println!(
            "beta\t{j}\t{:.6}\t{:.6}\t{:.6e}",
            beta[j],
            tbeta[j],
            oracle.drop_penalties_beta()[j]
        );
    }
    for k in 0..problem.num_random_effects() {
        println!(
            "gamma\t{k}\t{:.6}\t{:.6}\t{:.6e}",
            gamma[k],
            tgamma[k],
            oracle.drop_penalties_gamma()[k]
        );
    }
    Ok(())
}
