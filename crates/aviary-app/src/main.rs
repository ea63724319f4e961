use anyhow::Result;
use aviary_app::{DemoPopulation, TracingRenderer, TrainingRun, run_training};
use aviary_core::{AviaryConfig, StopSignal};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "aviary",
    version,
    about = "Train cohorts of controller-driven avatars through a scrolling obstacle course"
)]
struct Cli {
    /// RNG seed for reproducible runs; omit for entropy seeding.
    #[arg(long)]
    seed: Option<u64>,

    /// Agents per generation.
    #[arg(long, default_value_t = 20)]
    population: usize,

    /// Hidden units in each randomly initialized network controller.
    #[arg(long, default_value_t = 6)]
    hidden: usize,

    /// Generations to train.
    #[arg(long, default_value_t = 10)]
    generations: u32,

    /// Tick budget per generation.
    #[arg(long, default_value_t = 3_000)]
    max_ticks: u64,

    /// Pace generations at the configured tick rate instead of free-running.
    #[arg(long)]
    paced: bool,

    /// Log a frame digest every this many ticks (requires debug logging).
    #[arg(long, default_value_t = 150)]
    frame_stride: u64,

    /// Write the training report as JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AviaryConfig {
        rng_seed: cli.seed,
        ..AviaryConfig::default()
    };
    let run = TrainingRun {
        generations: cli.generations,
        max_ticks: cli.max_ticks,
        paced: cli.paced,
    };
    let mut factory = DemoPopulation::new(
        cli.population,
        cli.hidden,
        cli.seed.unwrap_or_else(rand::random),
    );
    let mut renderer = TracingRenderer::new(cli.frame_stride);
    let stop = StopSignal::new();

    info!(
        population = cli.population,
        generations = run.generations,
        max_ticks = run.max_ticks,
        paced = run.paced,
        "starting training",
    );
    let report = run_training(&config, &run, &mut factory, &mut renderer, &stop)?;

    info!(
        generations = report.generations.len(),
        best_score = report.best_score,
        "training complete",
    );
    if let Some(champion) = &report.champion {
        info!(tag = champion.tag, fitness = champion.fitness, "champion");
    }
    if let Some(path) = &cli.report {
        report.write_json(path)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
