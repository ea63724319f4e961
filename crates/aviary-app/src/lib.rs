//! Training harness plumbing for the aviary simulator.

pub mod harness;

pub use harness::{
    Champion, DemoPopulation, GenerationOutcome, TracingRenderer, TrainingReport, TrainingRun,
    run_training,
};
