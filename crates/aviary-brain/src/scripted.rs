//! Deterministic baseline controllers for tests, demos, and smoke runs.

use aviary_core::{Controller, DECISION_SIZE, OBSERVATION_SIZE};
use serde::{Deserialize, Serialize};

/// Glides forever; the shortest-lived baseline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NeverJump;

impl Controller for NeverJump {
    fn kind(&self) -> &'static str {
        "never-jump"
    }

    fn decide(&mut self, _observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
        [0.0]
    }
}

/// Jumps on a fixed cadence regardless of the playfield.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Metronome {
    period: u32,
    clock: u32,
}

impl Metronome {
    /// Creates a metronome jumping every `period` ticks (clamped to one).
    #[must_use]
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            clock: 0,
        }
    }
}

impl Controller for Metronome {
    fn kind(&self) -> &'static str {
        "metronome"
    }

    fn decide(&mut self, _observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
        let jump = self.clock.is_multiple_of(self.period);
        self.clock = self.clock.wrapping_add(1);
        [if jump { 1.0 } else { 0.0 }]
    }
}

/// Jumps whenever the bottom barrier's top edge comes within `margin`
/// pixels, hugging each gap from above its lower lip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloorMargin {
    margin: f32,
}

impl FloorMargin {
    /// Creates a controller holding the given clearance.
    #[must_use]
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }
}

impl Controller for FloorMargin {
    fn kind(&self) -> &'static str {
        "floor-margin"
    }

    fn decide(&mut self, observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
        [if observation[2] < self.margin { 1.0 } else { 0.0 }]
    }
}
