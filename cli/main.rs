#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process;

use varpart::model::formula::Formula;
use varpart::run::ConfigurationError;
use varpart::{
    InputAdapter, LinearMixedSolver, PartitionOptions, TsvInput, WorkerPool, fit_and_decompose,
};

#[derive(Parser)]
#[command(
    name = "varpart",
    version,
    about = "Per-row mixed-model fitting and variance partitioning",
    long_about = "Fits one linear (mixed) model per row of an expression matrix and reports, for \
                 every row, the fraction of variance explained by each term of the formula."
)]
struct Cli {
    /// Expression matrix TSV: header of sample ids, one row per feature, row id first
    #[arg(long, value_name = "PATH")]
    expression: PathBuf,

    /// Sample metadata TSV: first column holds sample ids in the expression column order
    #[arg(long, value_name = "PATH")]
    metadata: PathBuf,

    /// Model formula, for example "~ Age + (1|Individual) + (1|Tissue)"
    #[arg(long)]
    formula: String,

    /// Optional precision weights TSV with the same layout as the expression matrix
    #[arg(long, value_name = "PATH")]
    weights: Option<PathBuf>,

    /// Whether to use the weights matrix when one is given
    #[arg(long, value_name = "BOOL")]
    use_weights: Option<bool>,

    /// Estimate variance components by REML instead of ML
    #[arg(long)]
    reml: bool,

    /// Number of chunks the rows are split into
    #[arg(long, value_name = "N")]
    chunks: Option<usize>,

    /// Worker threads (0 uses every available core)
    #[arg(long, value_name = "N", default_value = "0")]
    threads: usize,

    /// Terms removed from the denominator of the reported fractions
    #[arg(long, value_name = "TERM", num_args = 1..)]
    adjust: Vec<String>,

    /// Report every term against the residual only
    #[arg(long, conflicts_with = "adjust")]
    adjust_all: bool,

    /// Correlation of fixed-effect estimates above which a fit warns
    #[arg(long, value_name = "F")]
    colinearity_cutoff: Option<f64>,

    /// Do not log per-row validation warnings
    #[arg(long)]
    no_warnings: bool,

    /// Hide the progress bar and log warnings only
    #[arg(long)]
    quiet: bool,

    /// TOML options file; flags given on the command line take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save the effective options to this TOML file before running
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,

    /// Output TSV (stdout when omitted)
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let options = resolve_options(&cli)?;
    if let Some(path) = &cli.write_config {
        options.to_toml_file(path)?;
        log::info!("Wrote options to '{}'.", path.display());
    }

    let formula = Formula::parse(&cli.formula).map_err(ConfigurationError::from)?;
    let inputs = TsvInput {
        expression: cli.expression,
        weights: cli.weights,
        metadata: cli.metadata,
    }
    .to_core_inputs()?;

    let mut pool = WorkerPool::new(cli.threads)?;
    let table = fit_and_decompose(&inputs, &formula, &options, &LinearMixedSolver, &pool)?;
    pool.shutdown();

    match &cli.out {
        Some(path) => table.write_tsv(path)?,
        None => table.write_to(io::stdout().lock())?,
    }
    Ok(())
}

fn resolve_options(cli: &Cli) -> Result<PartitionOptions, Box<dyn std::error::Error>> {
    let mut options = match &cli.config {
        Some(path) => PartitionOptions::from_toml_file(path)?,
        None => PartitionOptions::default(),
    };
    if let Some(use_weights) = cli.use_weights {
        options.use_weights = use_weights;
    }
    if cli.reml {
        options.reml = true;
    }
    if let Some(chunks) = cli.chunks {
        options.chunk_count = chunks;
    }
    if !cli.adjust.is_empty() {
        options.adjust_terms = cli.adjust.clone();
    }
    if cli.adjust_all {
        options.adjust_all = true;
    }
    if let Some(cutoff) = cli.colinearity_cutoff {
        options.colinearity_cutoff = cutoff;
    }
    if cli.no_warnings {
        options.show_warnings = false;
    }
    if cli.quiet {
        options.quiet = true;
    }
    Ok(options)
}
