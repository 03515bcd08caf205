//! hisim CLI
//!
//! Fits the close/payment/size claim model to a training file (or synthetic
//! histories), simulates the open claims forward and prints a reserve summary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use hisim::data::{read_dataset, write_dataset, CsvLayout};
use hisim::model::Formulas;
use hisim::synthetic::{generate_claims, SyntheticConfig};
use hisim::{formulas, Anchor, Dataset, Glm, LayerOptions, Model, ReserveSummary, SimulationConfig, Simulator, Transformation, Value};

#[derive(Debug, Parser)]
#[command(name = "hisim")]
#[command(about = "Fit a hierarchical claim model and simulate open claims to closure")]
struct Cli {
    /// Training CSV; synthetic histories are generated when omitted
    #[arg(long)]
    training: Option<PathBuf>,

    #[arg(long, default_value_t = 500)]
    synthetic_rows: usize,

    /// Open claims to project; defaults to the latest row of every open training claim
    #[arg(long)]
    inforce: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    replicates: u32,

    /// Claims continue while their cycle is below this value and they are open
    #[arg(long)]
    horizon: Option<u32>,

    /// JSON simulation config
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_cycles: Option<u32>,

    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Override a layer formula, e.g. --formula "size=size ~ cycle"
    #[arg(long = "formula", value_name = "LAYER=SPEC")]
    formulas: Vec<String>,

    /// Write simulated rows to this CSV
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = "claim_id")]
    id_column: String,

    #[arg(long, default_value = "dev_year")]
    cycle_column: String,

    /// Print the reserve summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn default_formulas() -> Formulas {
    formulas([
        ("close", "close ~ cycle + factor(kind)"),
        ("payment", "payment ~ close + prev_payment + cycle"),
        ("size", "size ~ cycle + factor(kind)"),
    ])
}

fn parse_formula_overrides(raw: &[String], mut base: Formulas) -> Result<Formulas> {
    for entry in raw {
        let Some((layer, spec)) = entry.split_once('=') else {
            bail!("formula override '{}' is not of the form LAYER=SPEC", entry);
        };
        base.insert(layer.trim().to_string(), spec.trim().into());
    }
    Ok(base)
}

/// Adds `from` to the running total in `to`
fn accumulate(from: &'static str, to: &'static str) -> impl Fn(Dataset) -> Dataset + Send + Sync + 'static {
    move |mut data: Dataset| {
        for row in data.rows_mut() {
            let total = row.numeric(to).unwrap_or(0.0) + row.numeric(from).unwrap_or(0.0);
            row.set(to, Value::Number(total));
        }
        data
    }
}

fn lag(from: &'static str, to: &'static str) -> impl Fn(Dataset) -> Dataset + Send + Sync + 'static {
    move |mut data: Dataset| {
        for row in data.rows_mut() {
            let value = row.numeric(from).unwrap_or(0.0);
            row.set(to, Value::Number(value));
        }
        data
    }
}

fn claims_model(training: Dataset) -> hisim::Result<Model> {
    Model::new(training)
        .add_layer("close", Glm::binomial(), LayerOptions::default())?
        .add_layer("payment", Glm::binomial(), LayerOptions::default())?
        .add_layer(
            "size",
            Glm::gaussian(),
            LayerOptions::filtered(|r| r.flag("payment")).with_transformation(Transformation::Log),
        )?
        .register_updater("paid to date", accumulate("size", "paid_to_date"), Anchor::after("size"))?
        .register_updater("lag payment", lag("payment", "prev_payment"), Anchor::EndOfCycle)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let layout = CsvLayout {
        id_column: cli.id_column.clone(),
        cycle_column: cli.cycle_column.clone(),
    };

    let mut config = match &cli.config {
        Some(path) => SimulationConfig::from_json_path(path)
            .with_context(|| format!("failed to load simulation config {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(max_cycles) = cli.max_cycles {
        config.max_cycles = max_cycles;
    }
    if cli.sequential {
        config.parallel = false;
    }

    let training = match &cli.training {
        Some(path) => read_dataset(path, &layout)
            .with_context(|| format!("failed to read training data {}", path.display()))?,
        None => {
            info!("Generating {} synthetic training rows", cli.synthetic_rows);
            generate_claims(&SyntheticConfig {
                rows: cli.synthetic_rows,
                seed: config.seed,
                ..SyntheticConfig::default()
            })
            .context("failed to generate synthetic claims")?
        }
    };

    let inforce = match &cli.inforce {
        Some(path) => read_dataset(path, &layout)
            .with_context(|| format!("failed to read inforce data {}", path.display()))?,
        None => training.latest_per_record().filter(|r| !r.flag("close")),
    };
    if inforce.is_empty() {
        bail!("no open claims to project");
    }

    let horizon = cli
        .horizon
        .or_else(|| training.max_cycle())
        .context("training data is empty")?;

    let specs = parse_formula_overrides(&cli.formulas, default_formulas())?;
    let model = claims_model(training)
        .context("failed to build claims model")?
        .fit(&specs)
        .context("failed to fit claims model")?;

    println!("hisim v{}", env!("CARGO_PKG_VERSION"));
    println!("==========\n");
    println!("Open claims:   {}", inforce.len());
    println!("Replicates:    {}", cli.replicates);
    println!("Horizon:       cycle {}", horizon);
    println!();

    let report = Simulator::new(&model, config)
        .run(cli.replicates, |r| r.cycle < horizon && !r.flag("close"), &inforce)
        .context("simulation failed")?;
    for failure in &report.failures {
        eprintln!("warning: {}", failure);
    }

    if let Some(path) = &cli.output {
        write_dataset(path, &report.dataset, &layout)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {} simulated rows to {}", report.dataset.len(), path.display());
    }

    let summary = ReserveSummary::from_simulation(&report.dataset, &inforce, "size")
        .context("failed to summarise reserves")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Projected payments over {} replicates", summary.replicates());
        println!("  Mean:    {:>14.2}", summary.mean);
        println!("  Std dev: {:>14.2}", summary.std_dev);
        for (level, value) in &summary.quantiles {
            println!("  Q{:<6}: {:>14.2}", level * 100.0, value);
        }
    }

    Ok(())
}
