//! Controller implementations for the aviary simulation core.
//!
//! [`feedforward`] holds the evolvable network controller; [`scripted`]
//! holds deterministic baselines used for testing and demos.

pub mod feedforward;
pub mod scripted;

pub use feedforward::{Activation, FeedForwardController, WeightError};
pub use scripted::{FloorMargin, Metronome, NeverJump};
