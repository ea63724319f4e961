//! Generation loop wiring the simulation core to a population source.

use anyhow::{Context, Result};
use aviary_brain::{Activation, FeedForwardController, FloorMargin};
use aviary_core::{
    AviaryConfig, CohortSeed, Controller, FitnessCell, FrameDriver, FrameSnapshot,
    PopulationFactory, Renderer, SimulationState, StopSignal, TerminationReason,
};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Outcome of one generation's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub generation: u32,
    pub ticks: u64,
    pub score: u32,
    pub termination: TerminationReason,
    /// Fittest agent of the generation, absent only for an empty cohort.
    pub best: Option<Champion>,
}

/// Tag and fitness of a leading agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Champion {
    pub tag: u64,
    pub fitness: f32,
}

/// Aggregate results across a whole training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingReport {
    pub generations: Vec<GenerationOutcome>,
    /// Fittest agent seen across all generations.
    pub champion: Option<Champion>,
    /// Highest obstacle score reached by any generation.
    pub best_score: u32,
}

impl TrainingReport {
    /// Serializes the report as pretty-printed JSON at `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        fs::write(path, body)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }
}

/// Shape of a training run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrainingRun {
    /// Number of generations to simulate.
    pub generations: u32,
    /// Tick budget per generation.
    pub max_ticks: u64,
    /// Pace each generation at the configured tick rate.
    pub paced: bool,
}

impl Default for TrainingRun {
    fn default() -> Self {
        Self {
            generations: 10,
            max_ticks: 3_000,
            paced: false,
        }
    }
}

/// Runs `run.generations` cohorts through one simulation state, reporting
/// per-generation outcomes and the overall champion. The stop signal is
/// honored both between generations and inside each run.
pub fn run_training(
    config: &AviaryConfig,
    run: &TrainingRun,
    factory: &mut dyn PopulationFactory,
    renderer: &mut dyn Renderer,
    stop: &StopSignal,
) -> Result<TrainingReport> {
    let mut state = SimulationState::new(config.clone())?;
    let mut report = TrainingReport::default();

    for generation in 0..run.generations {
        if stop.is_triggered() {
            info!(generation, "stop requested, ending training early");
            break;
        }
        let seeds = factory.spawn_cohort();
        let cohort_size = seeds.len();
        state.populate(seeds);

        let driver = if run.paced {
            FrameDriver::from_config(config)
        } else {
            FrameDriver::headless()
        }
        .with_tick_budget(run.max_ticks);
        let run_report = driver
            .run(&mut state, renderer, stop)
            .with_context(|| format!("generation {generation} aborted"))?;

        let best = run_report
            .results
            .iter()
            .max_by(|a, b| a.fitness.total_cmp(&b.fitness))
            .map(|result| Champion {
                tag: result.tag,
                fitness: result.fitness,
            });
        info!(
            generation,
            cohort = cohort_size,
            ticks = run_report.ticks,
            score = run_report.score,
            best_fitness = best.map(|champion| champion.fitness),
            "generation complete",
        );

        if let Some(best) = best
            && report
                .champion
                .is_none_or(|champion| best.fitness > champion.fitness)
        {
            report.champion = Some(best);
        }
        report.best_score = report.best_score.max(run_report.score);
        report.generations.push(GenerationOutcome {
            generation,
            ticks: run_report.ticks,
            score: run_report.score,
            termination: run_report.termination,
            best,
        });
    }
    Ok(report)
}

/// Self-contained population source mixing scripted hover baselines with
/// randomly initialized feedforward networks. Stands in for an external
/// optimizer in demos and smoke runs.
pub struct DemoPopulation {
    size: usize,
    hidden: usize,
    rng: SmallRng,
    next_tag: u64,
    cells: Vec<(u64, FitnessCell)>,
}

impl DemoPopulation {
    /// Creates a factory producing `size` seeds per generation.
    #[must_use]
    pub fn new(size: usize, hidden: usize, seed: u64) -> Self {
        Self {
            size,
            hidden,
            rng: SmallRng::seed_from_u64(seed),
            next_tag: 0,
            cells: Vec::new(),
        }
    }

    /// Accumulators handed out for the current generation, in seed order.
    #[must_use]
    pub fn cells(&self) -> &[(u64, FitnessCell)] {
        &self.cells
    }
}

impl PopulationFactory for DemoPopulation {
    fn spawn_cohort(&mut self) -> Vec<CohortSeed> {
        self.cells.clear();
        let mut seeds = Vec::with_capacity(self.size);
        for slot in 0..self.size {
            let tag = self.next_tag;
            self.next_tag += 1;
            let controller: Box<dyn Controller> = if slot % 2 == 0 {
                Box::new(FloorMargin::new(80.0 + 20.0 * (slot / 2) as f32))
            } else {
                Box::new(FeedForwardController::random(
                    self.hidden,
                    Activation::default(),
                    &mut self.rng,
                ))
            };
            let fitness = FitnessCell::new();
            self.cells.push((tag, fitness.clone()));
            seeds.push(CohortSeed {
                controller,
                fitness,
                tag,
            });
        }
        seeds
    }
}

/// Renderer that logs a frame digest every `stride` ticks.
#[derive(Debug, Clone)]
pub struct TracingRenderer {
    stride: u64,
}

impl TracingRenderer {
    /// Creates a renderer logging every `stride` ticks (clamped to one).
    #[must_use]
    pub fn new(stride: u64) -> Self {
        Self {
            stride: stride.max(1),
        }
    }
}

impl Renderer for TracingRenderer {
    fn present(&mut self, frame: &FrameSnapshot) {
        if frame.tick.0.is_multiple_of(self.stride) {
            debug!(
                tick = frame.tick.0,
                alive = frame.alive,
                score = frame.score,
                obstacles = frame.obstacles.len(),
                "frame",
            );
        }
    }
}
