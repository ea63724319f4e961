//! Single-hidden-layer feedforward controller with a flat weight genome.

use aviary_core::{Controller, DECISION_SIZE, OBSERVATION_SIZE};
use rand::Rng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Activation applied to each hidden unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Tanh,
    Sigmoid,
    Relu,
}

impl Activation {
    fn apply(self, value: f32) -> f32 {
        match self {
            Self::Tanh => value.tanh(),
            Self::Sigmoid => logistic(value),
            Self::Relu => value.max(0.0),
        }
    }
}

fn logistic(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Errors raised when adopting an externally supplied weight genome.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WeightError {
    /// The network needs at least one hidden unit.
    #[error("network needs at least one hidden unit")]
    NoHiddenUnits,
    /// The genome length did not match the network shape.
    #[error("expected {expected} weights for {hidden} hidden units, got {actual}")]
    LengthMismatch {
        hidden: usize,
        expected: usize,
        actual: usize,
    },
}

/// Fixed-topology network mapping one observation to one jump decision.
///
/// The genome is a flat vector laid out as hidden input weights, hidden
/// biases, output weights, output bias. The output unit is squashed through
/// a logistic, so the decision always lands in `(0, 1)` and an all-zero
/// genome sits exactly on the jump threshold without crossing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardController {
    hidden: usize,
    activation: Activation,
    weights: Vec<f32>,
}

impl FeedForwardController {
    /// Number of weights a genome must carry for `hidden` hidden units.
    #[must_use]
    pub const fn weight_count(hidden: usize) -> usize {
        hidden * OBSERVATION_SIZE + hidden + hidden + 1
    }

    /// Adopts an externally evolved genome.
    pub fn from_weights(
        hidden: usize,
        activation: Activation,
        weights: Vec<f32>,
    ) -> Result<Self, WeightError> {
        if hidden == 0 {
            return Err(WeightError::NoHiddenUnits);
        }
        let expected = Self::weight_count(hidden);
        if weights.len() != expected {
            return Err(WeightError::LengthMismatch {
                hidden,
                expected,
                actual: weights.len(),
            });
        }
        Ok(Self {
            hidden,
            activation,
            weights,
        })
    }

    /// Builds a network with weights sampled uniformly from `[-1, 1)`.
    /// `hidden` is clamped to at least one unit.
    #[must_use]
    pub fn random(hidden: usize, activation: Activation, rng: &mut dyn RngCore) -> Self {
        let hidden = hidden.max(1);
        let weights = (0..Self::weight_count(hidden))
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        Self {
            hidden,
            activation,
            weights,
        }
    }

    /// Hidden layer width.
    #[must_use]
    pub const fn hidden(&self) -> usize {
        self.hidden
    }

    /// Flat genome in layout order.
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn forward(&self, observation: &[f32; OBSERVATION_SIZE]) -> f32 {
        let (input_weights, rest) = self.weights.split_at(self.hidden * OBSERVATION_SIZE);
        let (hidden_biases, rest) = rest.split_at(self.hidden);
        let (output_weights, output_bias) = rest.split_at(self.hidden);

        let mut sum = output_bias[0];
        for unit in 0..self.hidden {
            let mut acc = hidden_biases[unit];
            let row = &input_weights[unit * OBSERVATION_SIZE..(unit + 1) * OBSERVATION_SIZE];
            for (weight, input) in row.iter().zip(observation) {
                acc += weight * input;
            }
            sum += output_weights[unit] * self.activation.apply(acc);
        }
        logistic(sum)
    }
}

impl Controller for FeedForwardController {
    fn kind(&self) -> &'static str {
        "feedforward"
    }

    fn decide(&mut self, observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
        [self.forward(observation)]
    }
}
