//! Deterministic side-scroller simulation core for neuroevolution harnesses.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

new_key_type! {
    /// Stable handle for cohort entries backed by a generational slot map.
    pub struct AvatarId;
}

/// Number of scalar observations fed to each controller per tick.
pub const OBSERVATION_SIZE: usize = 3;
/// Number of decision outputs produced by a controller; only index 0 is read.
pub const DECISION_SIZE: usize = 1;
/// A decision output strictly above this value triggers a jump.
pub const JUMP_THRESHOLD: f32 = 0.5;
/// Tilt angle at or below which the flap cycle locks to the level frame.
pub const DIVE_LOCK_TILT: f32 = -80.0;
/// Number of distinct wing positions in the flap cycle.
pub const FLAP_FRAME_COUNT: usize = 3;

/// Avatar sprite width in pixels.
pub const AVATAR_WIDTH: u32 = 68;
/// Avatar sprite height in pixels.
pub const AVATAR_HEIGHT: u32 = 48;
/// Barrier sprite width in pixels.
pub const BARRIER_WIDTH: u32 = 104;
/// Barrier sprite height in pixels.
pub const BARRIER_HEIGHT: u32 = 640;
/// Width of one ground tile; the scroll offset wraps modulo this.
pub const GROUND_TILE_WIDTH: f32 = 672.0;

/// High level simulation clock (ticks processed since the cohort was seeded).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors that can occur when constructing simulation state.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors raised while building sprite masks from text patterns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MaskError {
    /// The pattern had no rows or an empty first row.
    #[error("mask pattern must contain at least one non-empty row")]
    EmptyPattern,
    /// A row's width differed from the first row's width.
    #[error("mask row {row} has width {actual}, expected {expected}")]
    RaggedRow {
        row: usize,
        actual: usize,
        expected: usize,
    },
    /// A row contained a glyph other than `'#'` or `'.'`.
    #[error("mask row {row} contains unsupported glyph {glyph:?}")]
    UnknownGlyph { row: usize, glyph: char },
}

/// Fatal faults raised while advancing a tick.
#[derive(Debug, Error)]
pub enum TickError {
    /// A controller produced a non-finite decision value.
    #[error("controller for agent {tag} produced non-finite decision {value}")]
    ControllerFault { tag: u64, value: f32 },
    /// The obstacle list was empty while avatars were still alive.
    #[error("no obstacle available for live cohort at tick {tick}")]
    MissingObstacle { tick: u64 },
}

/// Tier entry switching the obstacle spawn abscissa once a score is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DifficultyTier {
    /// Score at which this tier takes effect.
    pub min_score: u32,
    /// Horizontal spawn position used from this tier on.
    pub spawn_offset: f32,
}

/// Static configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviaryConfig {
    /// Playfield width in pixels.
    pub playfield_width: u32,
    /// Playfield height in pixels.
    pub playfield_height: u32,
    /// Vertical coordinate of the ground collision line.
    pub ground_line: f32,
    /// Horizontal start position shared by every avatar.
    pub avatar_start_x: f32,
    /// Vertical start position shared by every avatar.
    pub avatar_start_y: f32,
    /// Vertical size of the gap between a barrier pair.
    pub gap_height: f32,
    /// Inclusive lower bound for sampled gap placements.
    pub gap_center_min: u32,
    /// Exclusive upper bound for sampled gap placements.
    pub gap_center_max: u32,
    /// Leftward obstacle travel per tick.
    pub pipe_velocity: f32,
    /// Leftward ground scroll per tick (cosmetic).
    pub base_velocity: f32,
    /// Vertical velocity applied by a jump; negative is upward.
    pub jump_velocity: f32,
    /// Quadratic coefficient of the fall parabola.
    pub gravity_coefficient: f32,
    /// Largest downward displacement permitted in one tick.
    pub max_fall_speed: f32,
    /// Extra upward displacement granted while ascending.
    pub ascent_boost: f32,
    /// Height band above the jump origin in which the nose stays up.
    pub jump_margin: f32,
    /// Nose-up tilt snapped to while ascending, in degrees.
    pub max_tilt_up: f32,
    /// Nose-down tilt floor, in degrees.
    pub max_tilt_down: f32,
    /// Tilt lost per falling tick, in degrees.
    pub tilt_step: f32,
    /// Ticks spent on each wing position of the flap cycle.
    pub flap_period: u32,
    /// Fitness credited to each live avatar every tick.
    pub survival_reward: f32,
    /// Fitness debited when an avatar strikes a barrier.
    pub collision_penalty: f32,
    /// Fitness credited to every surviving avatar when an obstacle is passed.
    pub pass_reward: f32,
    /// Base horizontal spawn position for new obstacles.
    pub spawn_offset: f32,
    /// Score-ordered overrides of the spawn position.
    pub difficulty_tiers: Vec<DifficultyTier>,
    /// Nominal simulation rate in ticks per second.
    pub tick_rate: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for AviaryConfig {
    fn default() -> Self {
        Self {
            playfield_width: 500,
            playfield_height: 800,
            ground_line: 730.0,
            avatar_start_x: 230.0,
            avatar_start_y: 350.0,
            gap_height: 200.0,
            gap_center_min: 50,
            gap_center_max: 450,
            pipe_velocity: 5.0,
            base_velocity: 5.0,
            jump_velocity: -10.5,
            gravity_coefficient: 1.5,
            max_fall_speed: 16.0,
            ascent_boost: 2.0,
            jump_margin: 50.0,
            max_tilt_up: 25.0,
            max_tilt_down: -90.0,
            tilt_step: 20.0,
            flap_period: 5,
            survival_reward: 0.1,
            collision_penalty: 1.0,
            pass_reward: 5.0,
            spawn_offset: 600.0,
            difficulty_tiers: vec![
                DifficultyTier {
                    min_score: 6,
                    spawn_offset: 500.0,
                },
                DifficultyTier {
                    min_score: 11,
                    spawn_offset: 400.0,
                },
            ],
            tick_rate: 30.0,
            rng_seed: None,
            history_capacity: 512,
        }
    }
}

impl AviaryConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.playfield_width == 0 || self.playfield_height == 0 {
            return Err(SimulationError::InvalidConfig(
                "playfield dimensions must be non-zero",
            ));
        }
        if self.ground_line <= 0.0 || self.ground_line > self.playfield_height as f32 {
            return Err(SimulationError::InvalidConfig(
                "ground_line must lie inside the playfield",
            ));
        }
        if self.gap_height <= 0.0 {
            return Err(SimulationError::InvalidConfig("gap_height must be positive"));
        }
        if self.gap_center_min >= self.gap_center_max {
            return Err(SimulationError::InvalidConfig(
                "gap_center_min must be below gap_center_max",
            ));
        }
        if self.gap_center_max as f32 + self.gap_height > self.ground_line {
            return Err(SimulationError::InvalidConfig(
                "gap range must leave the bottom barrier above the ground line",
            ));
        }
        if self.pipe_velocity <= 0.0 || self.base_velocity < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "scroll velocities must be positive",
            ));
        }
        if self.gravity_coefficient <= 0.0 || self.max_fall_speed <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "fall parameters must be positive",
            ));
        }
        if self.ascent_boost < 0.0 || self.jump_margin < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "ascent parameters must be non-negative",
            ));
        }
        if self.max_tilt_down > self.max_tilt_up {
            return Err(SimulationError::InvalidConfig(
                "max_tilt_down must not exceed max_tilt_up",
            ));
        }
        if self.tilt_step <= 0.0 {
            return Err(SimulationError::InvalidConfig("tilt_step must be positive"));
        }
        if self.flap_period == 0 {
            return Err(SimulationError::InvalidConfig(
                "flap_period must be non-zero",
            ));
        }
        if self.survival_reward < 0.0 || self.pass_reward < 0.0 || self.collision_penalty < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "rewards and penalties must be non-negative",
            ));
        }
        if self.spawn_offset <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "spawn_offset must be positive",
            ));
        }
        if !self
            .difficulty_tiers
            .windows(2)
            .all(|pair| pair[0].min_score < pair[1].min_score)
        {
            return Err(SimulationError::InvalidConfig(
                "difficulty_tiers must be sorted by min_score",
            ));
        }
        if self.difficulty_tiers.iter().any(|tier| tier.spawn_offset <= 0.0) {
            return Err(SimulationError::InvalidConfig(
                "tier spawn offsets must be positive",
            ));
        }
        if self.tick_rate <= 0.0 {
            return Err(SimulationError::InvalidConfig("tick_rate must be positive"));
        }
        Ok(())
    }

    /// Returns the spawn abscissa for the given (already incremented) score.
    #[must_use]
    pub fn spawn_offset_for(&self, score: u32) -> f32 {
        let mut offset = self.spawn_offset;
        for tier in &self.difficulty_tiers {
            if score >= tier.min_score {
                offset = tier.spawn_offset;
            } else {
                break;
            }
        }
        offset
    }

    /// Duration of one tick at the nominal rate.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.tick_rate.max(1e-3)).recip())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Row-major bitmap of opaque pixels used for pixel-accurate collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpriteMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl SpriteMask {
    /// Builds a fully opaque mask.
    #[must_use]
    pub fn solid(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![true; (width as usize) * (height as usize)],
        }
    }

    /// Builds a mask from rows of `'#'` (opaque) and `'.'` (transparent).
    pub fn from_pattern(rows: &[&str]) -> Result<Self, MaskError> {
        let expected = rows
            .first()
            .map(|row| row.chars().count())
            .ok_or(MaskError::EmptyPattern)?;
        if expected == 0 {
            return Err(MaskError::EmptyPattern);
        }
        let mut bits = Vec::with_capacity(expected * rows.len());
        for (row_idx, row) in rows.iter().enumerate() {
            let mut width = 0usize;
            for glyph in row.chars() {
                match glyph {
                    '#' => bits.push(true),
                    '.' => bits.push(false),
                    other => {
                        return Err(MaskError::UnknownGlyph {
                            row: row_idx,
                            glyph: other,
                        });
                    }
                }
                width += 1;
            }
            if width != expected {
                return Err(MaskError::RaggedRow {
                    row: row_idx,
                    actual: width,
                    expected,
                });
            }
        }
        Ok(Self {
            width: expected as u32,
            height: rows.len() as u32,
            bits,
        })
    }

    /// Builds a mask by sampling `opaque(x, y)` over the given dimensions.
    fn from_fn(width: u32, height: u32, opaque: impl Fn(u32, u32) -> bool) -> Self {
        let mut bits = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                bits.push(opaque(x, y));
            }
        }
        Self {
            width,
            height,
            bits,
        }
    }

    /// Mask width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Mask height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Returns the flat index for `(x, y)` without bounds checks.
    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Whether the pixel at `(x, y)` is opaque; out-of-range pixels are not.
    #[must_use]
    pub fn is_opaque(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[self.offset(x, y)]
    }

    /// Number of opaque pixels in the mask.
    #[must_use]
    pub fn opaque_count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    /// Returns a copy mirrored top-to-bottom.
    #[must_use]
    pub fn flipped_vertical(&self) -> Self {
        let mut bits = Vec::with_capacity(self.bits.len());
        for y in (0..self.height).rev() {
            let start = self.offset(0, y);
            bits.extend_from_slice(&self.bits[start..start + self.width as usize]);
        }
        Self {
            width: self.width,
            height: self.height,
            bits,
        }
    }

    /// True when any opaque pixel of `self` coincides with an opaque pixel of
    /// `other` placed at `offset` relative to `self`'s origin.
    #[must_use]
    pub fn overlaps(&self, other: &Self, offset: (i32, i32)) -> bool {
        let (dx, dy) = offset;
        let x_start = dx.max(0);
        let y_start = dy.max(0);
        let x_end = (self.width as i32).min(other.width as i32 + dx);
        let y_end = (self.height as i32).min(other.height as i32 + dy);
        for y in y_start..y_end {
            for x in x_start..x_end {
                if self.bits[self.offset(x as u32, y as u32)]
                    && other.bits[other.offset((x - dx) as u32, (y - dy) as u32)]
                {
                    return true;
                }
            }
        }
        false
    }
}

/// Procedurally built silhouette masks for the flap cycle and barriers.
#[derive(Debug, Clone)]
pub struct SpriteAtlas {
    flap_frames: [SpriteMask; FLAP_FRAME_COUNT],
    barrier_top: SpriteMask,
    barrier_bottom: SpriteMask,
}

impl Default for SpriteAtlas {
    fn default() -> Self {
        Self::standard()
    }
}

impl SpriteAtlas {
    /// Builds the standard atlas at the original sprite scale.
    #[must_use]
    pub fn standard() -> Self {
        let flap_frames = [
            avatar_silhouette(0),
            avatar_silhouette(1),
            avatar_silhouette(2),
        ];
        let barrier_bottom = barrier_silhouette();
        let barrier_top = barrier_bottom.flipped_vertical();
        Self {
            flap_frames,
            barrier_top,
            barrier_bottom,
        }
    }

    /// Mask for the given wing frame.
    #[must_use]
    pub fn flap_frame(&self, frame: usize) -> &SpriteMask {
        &self.flap_frames[frame % FLAP_FRAME_COUNT]
    }

    /// Mask of the downward-facing top barrier.
    #[must_use]
    pub fn barrier_top(&self) -> &SpriteMask {
        &self.barrier_top
    }

    /// Mask of the upward-facing bottom barrier.
    #[must_use]
    pub fn barrier_bottom(&self) -> &SpriteMask {
        &self.barrier_bottom
    }
}

/// Elliptical body with a wing lobe whose height varies per frame. Corners
/// stay transparent so bounding-box contact alone never collides.
fn avatar_silhouette(frame: usize) -> SpriteMask {
    let w = AVATAR_WIDTH as f32;
    let h = AVATAR_HEIGHT as f32;
    let (cx, cy) = (w * 0.5, h * 0.5);
    let (rx, ry) = (w * 0.48, h * 0.44);
    let band_center = match frame % FLAP_FRAME_COUNT {
        0 => h * 0.28,
        1 => h * 0.50,
        _ => h * 0.72,
    };
    SpriteMask::from_fn(AVATAR_WIDTH, AVATAR_HEIGHT, |x, y| {
        let px = x as f32 + 0.5;
        let py = y as f32 + 0.5;
        let fx = (px - cx) / rx;
        let fy = (py - cy) / ry;
        if fx * fx + fy * fy <= 1.0 {
            return true;
        }
        // Wing lobe trailing off the left half of the body.
        (py - band_center).abs() <= h * 0.10 && px >= w * 0.02 && px <= w * 0.40
    })
}

/// Capped column: full-width cap with rounded gap-facing corners, inset body.
fn barrier_silhouette() -> SpriteMask {
    const CAP_HEIGHT: u32 = 42;
    const CAP_RADIUS: f32 = 10.0;
    const BODY_INSET: u32 = 6;
    SpriteMask::from_fn(BARRIER_WIDTH, BARRIER_HEIGHT, |x, y| {
        if y >= CAP_HEIGHT {
            return x >= BODY_INSET && x < BARRIER_WIDTH - BODY_INSET;
        }
        let px = x as f32 + 0.5;
        let py = y as f32 + 0.5;
        if py >= CAP_RADIUS {
            return true;
        }
        let w = BARRIER_WIDTH as f32;
        if px < CAP_RADIUS {
            let (dx, dy) = (px - CAP_RADIUS, py - CAP_RADIUS);
            return dx * dx + dy * dy <= CAP_RADIUS * CAP_RADIUS;
        }
        if px > w - CAP_RADIUS {
            let (dx, dy) = (px - (w - CAP_RADIUS), py - CAP_RADIUS);
            return dx * dx + dy * dy <= CAP_RADIUS * CAP_RADIUS;
        }
        true
    })
}

/// Per-avatar kinematic state. The horizontal position is fixed for life.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Avatar {
    /// Fixed horizontal position of the sprite's left edge.
    pub x: f32,
    /// Vertical position of the sprite's top edge.
    pub y: f32,
    /// Velocity set by the last jump; never integrated between jumps.
    pub velocity: f32,
    /// Current tilt in degrees; positive is nose-up.
    pub tilt: f32,
    /// Ticks elapsed since the last jump (the physics clock).
    pub ticks_since_jump: u32,
    /// Free-running counter driving the wing-flap cycle.
    pub animation_clock: u32,
    /// Vertical position captured at the last jump.
    pub jump_origin: f32,
}

impl Avatar {
    /// Creates an avatar at rest at the given position.
    #[must_use]
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            velocity: 0.0,
            tilt: 0.0,
            ticks_since_jump: 0,
            animation_clock: 0,
            jump_origin: y,
        }
    }

    /// Begins an upward jump, resetting the physics clock.
    pub fn jump(&mut self, config: &AviaryConfig) {
        self.velocity = config.jump_velocity;
        self.ticks_since_jump = 0;
        self.jump_origin = self.y;
    }

    /// Advances one tick of vertical physics, returning the applied
    /// displacement. Displacement is the jump parabola sampled at the
    /// physics clock, clamped downward at `max_fall_speed` and boosted by
    /// `ascent_boost` while negative.
    pub fn integrate(&mut self, config: &AviaryConfig) -> f32 {
        self.ticks_since_jump += 1;
        let t = self.ticks_since_jump as f32;
        let mut displacement = self.velocity * t + config.gravity_coefficient * t * t;
        if displacement >= config.max_fall_speed {
            displacement = config.max_fall_speed;
        }
        if displacement < 0.0 {
            displacement -= config.ascent_boost;
        }
        self.y += displacement;

        if displacement < 0.0 || self.y < self.jump_origin + config.jump_margin {
            if self.tilt < config.max_tilt_up {
                self.tilt = config.max_tilt_up;
            }
        } else if self.tilt > config.max_tilt_down {
            self.tilt = (self.tilt - config.tilt_step).max(config.max_tilt_down);
        }
        displacement
    }

    /// Advances the flap cycle by one tick.
    pub fn advance_animation(&mut self) {
        self.animation_clock = self.animation_clock.wrapping_add(1);
    }

    /// Index of the wing frame presented (and collided with) this tick. The
    /// cycle runs 0, 1, 2, 1; a steep dive locks the wings level.
    #[must_use]
    pub fn sprite_frame(&self, config: &AviaryConfig) -> usize {
        if self.tilt <= DIVE_LOCK_TILT {
            return 1;
        }
        let period = config.flap_period.max(1);
        match (self.animation_clock / period) % 4 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 1,
        }
    }

    /// Vertical coordinate of the sprite's bottom edge.
    #[must_use]
    pub fn bottom_edge(&self) -> f32 {
        self.y + AVATAR_HEIGHT as f32
    }
}

/// One barrier pair sharing a horizontal position and a vertical gap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    /// Left edge shared by both barriers.
    pub x: f32,
    /// Bottom edge of the top barrier (the sampled gap placement).
    pub gap_center: f32,
    /// Blit origin of the flipped top barrier.
    pub top_origin: f32,
    /// Top edge of the bottom barrier.
    pub bottom_origin: f32,
    /// Set once any avatar has moved past this obstacle's left edge.
    pub passed: bool,
}

impl Obstacle {
    /// Creates an obstacle at `x` with an explicitly chosen gap placement.
    #[must_use]
    pub fn with_gap(x: f32, gap_center: f32, config: &AviaryConfig) -> Self {
        Self {
            x,
            gap_center,
            top_origin: gap_center - BARRIER_HEIGHT as f32,
            bottom_origin: gap_center + config.gap_height,
            passed: false,
        }
    }

    /// Samples a gap placement uniformly from the configured integer range.
    pub fn spawn(x: f32, config: &AviaryConfig, rng: &mut SmallRng) -> Self {
        let gap_center = rng.random_range(config.gap_center_min..config.gap_center_max);
        Self::with_gap(x, gap_center as f32, config)
    }

    /// Advances one tick of leftward travel.
    pub fn advance(&mut self, config: &AviaryConfig) {
        self.x -= config.pipe_velocity;
    }

    /// Right edge of both barriers.
    #[must_use]
    pub fn trailing_edge(&self) -> f32 {
        self.x + BARRIER_WIDTH as f32
    }

    /// True once the obstacle has fully scrolled off the left boundary.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.trailing_edge() < 0.0
    }
}

/// Cosmetic ground strip scrolling in lockstep with the obstacles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ground {
    /// Leftward scroll offset in `[0, GROUND_TILE_WIDTH)`.
    pub offset: f32,
}

impl Ground {
    /// Advances the scroll, wrapping over the tile width.
    pub fn advance(&mut self, config: &AviaryConfig) {
        self.offset = (self.offset + config.base_velocity) % GROUND_TILE_WIDTH;
    }
}

/// Observation vector presented to controllers: altitude, vertical distance
/// to the gap placement, vertical distance to the bottom barrier's top edge.
#[must_use]
pub fn observe(avatar: &Avatar, obstacle: &Obstacle) -> [f32; OBSERVATION_SIZE] {
    [
        avatar.y,
        (avatar.y - obstacle.gap_center).abs(),
        (avatar.y - obstacle.bottom_origin).abs(),
    ]
}

/// Pixel-accurate test of one avatar frame against both barriers.
#[must_use]
pub fn avatar_hits_obstacle(
    atlas: &SpriteAtlas,
    avatar: &Avatar,
    frame: usize,
    obstacle: &Obstacle,
) -> bool {
    let mask = atlas.flap_frame(frame);
    let dx = (obstacle.x - avatar.x).round() as i32;
    let avatar_y = avatar.y.round() as i32;
    let top_offset = (dx, obstacle.top_origin.round() as i32 - avatar_y);
    let bottom_offset = (dx, obstacle.bottom_origin.round() as i32 - avatar_y);
    mask.overlaps(atlas.barrier_top(), top_offset)
        || mask.overlaps(atlas.barrier_bottom(), bottom_offset)
}

/// Decision interface implemented by every avatar controller.
pub trait Controller: Send + Sync {
    /// Static identifier of the controller implementation.
    fn kind(&self) -> &'static str;

    /// Evaluate a decision vector for the provided observation.
    fn decide(&mut self, observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE];
}

/// Shared fitness accumulator; the optimizer keeps one clone per genome and
/// reads it back after the run.
#[derive(Debug, Clone, Default)]
pub struct FitnessCell {
    value: Arc<Mutex<f32>>,
}

impl FitnessCell {
    /// Creates a zeroed accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` (possibly negative) to the running total.
    pub fn add(&self, delta: f32) {
        *self.lock() += delta;
    }

    /// Current accumulated value.
    #[must_use]
    pub fn value(&self) -> f32 {
        *self.lock()
    }

    /// Resets the total to zero.
    pub fn reset(&self) {
        *self.lock() = 0.0;
    }

    fn lock(&self) -> MutexGuard<'_, f32> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything needed to admit one agent into a cohort.
pub struct CohortSeed {
    /// Decision source for the avatar.
    pub controller: Box<dyn Controller>,
    /// Accumulator credited and debited over the run.
    pub fitness: FitnessCell,
    /// Opaque genome descriptor echoed back in results.
    pub tag: u64,
}

impl fmt::Debug for CohortSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortSeed")
            .field("controller", &self.controller.kind())
            .field("tag", &self.tag)
            .finish()
    }
}

/// Per-generation source of cohort seeds, implemented by the external
/// optimizer (one seed per genome).
pub trait PopulationFactory {
    /// Produces the seeds for the next generation.
    fn spawn_cohort(&mut self) -> Vec<CohortSeed>;
}

/// Why an entry left the cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalCause {
    /// Pixel overlap with a barrier.
    Collision,
    /// Ground contact or negative altitude.
    OutOfBounds,
}

/// Lifecycle state of a cohort entry; flips exactly once, alive to removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifeStatus {
    #[default]
    Alive,
    Removed(RemovalCause),
}

impl LifeStatus {
    /// True while the entry is still simulated.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// One agent bundled with its controller, accumulator, and lifecycle state.
pub struct CohortEntry {
    /// Kinematic body.
    pub avatar: Avatar,
    /// Decision source queried once per tick.
    pub controller: Box<dyn Controller>,
    /// Shared fitness accumulator.
    pub fitness: FitnessCell,
    /// Lifecycle state.
    pub status: LifeStatus,
    /// Opaque genome descriptor supplied by the factory.
    pub tag: u64,
}

impl fmt::Debug for CohortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortEntry")
            .field("avatar", &self.avatar)
            .field("controller", &self.controller.kind())
            .field("status", &self.status)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Generational-key container holding the population in stable order.
#[derive(Default)]
pub struct Cohort {
    slots: SlotMap<AvatarId, usize>,
    handles: Vec<AvatarId>,
    entries: Vec<CohortEntry>,
}

impl fmt::Debug for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cohort").field("len", &self.len()).finish()
    }
}

impl Cohort {
    /// Creates an empty cohort.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AvatarId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a current entry.
    #[must_use]
    pub fn contains(&self, id: AvatarId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new entry and return its handle.
    pub fn insert(&mut self, entry: CohortEntry) -> AvatarId {
        let index = self.entries.len();
        self.entries.push(entry);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Entry lookup by handle.
    #[must_use]
    pub fn get(&self, id: AvatarId) -> Option<&CohortEntry> {
        self.index_of(id).map(|index| &self.entries[index])
    }

    /// Mutable entry lookup by handle.
    pub fn get_mut(&mut self, id: AvatarId) -> Option<&mut CohortEntry> {
        let index = self.index_of(id)?;
        Some(&mut self.entries[index])
    }

    /// Iterate entries in stable insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (AvatarId, &CohortEntry)> {
        self.handles.iter().copied().zip(self.entries.iter())
    }

    /// Iterate entries mutably in stable insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AvatarId, &mut CohortEntry)> {
        self.handles.iter().copied().zip(self.entries.iter_mut())
    }

    /// Dense entry slice in iteration order.
    #[must_use]
    pub fn entries(&self) -> &[CohortEntry] {
        &self.entries
    }

    /// Dense mutable entry slice in iteration order.
    #[must_use]
    pub fn entries_mut(&mut self) -> &mut [CohortEntry] {
        &mut self.entries
    }

    /// Remove all entries whose ids are in `marked`, preserving the order of
    /// both survivors and removed entries.
    pub fn remove_many(&mut self, marked: &HashSet<AvatarId>) -> Vec<(AvatarId, CohortEntry)> {
        if marked.is_empty() {
            return Vec::new();
        }
        let handles = std::mem::take(&mut self.handles);
        let entries = std::mem::take(&mut self.entries);
        self.handles.reserve(handles.len());
        self.entries.reserve(entries.len());
        let mut removed = Vec::new();
        for (id, entry) in handles.into_iter().zip(entries) {
            if marked.contains(&id) {
                self.slots.remove(id);
                removed.push((id, entry));
            } else {
                let index = self.entries.len();
                if let Some(slot) = self.slots.get_mut(id) {
                    *slot = index;
                }
                self.handles.push(id);
                self.entries.push(entry);
            }
        }
        debug_assert_eq!(self.slots.len(), self.handles.len());
        debug_assert_eq!(self.handles.len(), self.entries.len());
        removed
    }

    /// Drain every entry out in order.
    pub fn drain(&mut self) -> Vec<(AvatarId, CohortEntry)> {
        self.slots.clear();
        self.handles.drain(..).zip(self.entries.drain(..)).collect()
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.entries.clear();
    }
}

/// Events emitted after processing one simulation tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// True when at least one obstacle was newly passed this tick.
    pub obstacle_passed: bool,
    /// Spawn abscissa of the obstacle appended this tick, if any.
    pub obstacle_spawned: Option<f32>,
    /// Number of obstacles retired off the left edge this tick.
    pub obstacles_retired: usize,
    /// Number of entries removed from the cohort this tick.
    pub removed: usize,
    /// True when the cohort is empty after the removal sweep.
    pub extinct: bool,
}

/// Rolling per-tick summary retained in bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub alive: usize,
    pub removed: usize,
    pub score: u32,
    pub obstacle_count: usize,
}

/// Final accounting for one agent after it leaves a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Genome descriptor supplied at seeding time.
    pub tag: u64,
    /// Final accumulated fitness.
    pub fitness: f32,
    /// Why the entry was removed; `None` for survivors at external stop.
    pub cause: Option<RemovalCause>,
    /// Tick count the agent reached before leaving the run.
    pub ticks_survived: u64,
}

/// Immutable avatar view emitted to renderers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvatarView {
    pub tag: u64,
    pub x: f32,
    pub y: f32,
    pub tilt: f32,
    pub frame: usize,
}

/// Immutable obstacle view emitted to renderers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObstacleView {
    pub x: f32,
    pub gap_center: f32,
    pub top_origin: f32,
    pub bottom_origin: f32,
    pub passed: bool,
}

/// Complete per-tick view of the playfield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub tick: Tick,
    pub score: u32,
    pub alive: usize,
    pub ground_offset: f32,
    pub avatars: Vec<AvatarView>,
    pub obstacles: Vec<ObstacleView>,
}

/// Presentation sink invoked once per tick by the frame driver.
pub trait Renderer: Send {
    fn present(&mut self, frame: &FrameSnapshot);
}

/// No-op renderer for headless runs.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn present(&mut self, _frame: &FrameSnapshot) {}
}

/// Aggregate simulation state advanced tick by tick.
pub struct SimulationState {
    config: AviaryConfig,
    atlas: SpriteAtlas,
    tick: Tick,
    rng: SmallRng,
    cohort: Cohort,
    obstacles: Vec<Obstacle>,
    ground: Ground,
    score: u32,
    pending_removals: Vec<AvatarId>,
    ledger: Vec<AgentResult>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationState")
            .field("tick", &self.tick)
            .field("score", &self.score)
            .field("cohort", &self.cohort.len())
            .field("obstacles", &self.obstacles.len())
            .finish()
    }
}

impl SimulationState {
    /// Instantiate simulation state from a validated configuration.
    pub fn new(config: AviaryConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            atlas: SpriteAtlas::standard(),
            tick: Tick::zero(),
            rng,
            cohort: Cohort::new(),
            obstacles: Vec::new(),
            ground: Ground::default(),
            score: 0,
            pending_removals: Vec::new(),
            ledger: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            config,
        })
    }

    /// Admit a fresh cohort and reset all per-run state: tick, score, ground,
    /// ledger, history, and the obstacle list (reseeded with one obstacle at
    /// the base spawn abscissa). The RNG deliberately continues across runs,
    /// so successive generations see fresh gap sequences under one seed.
    pub fn populate(&mut self, seeds: Vec<CohortSeed>) -> Vec<AvatarId> {
        self.cohort.clear();
        self.obstacles.clear();
        self.ground = Ground::default();
        self.score = 0;
        self.tick = Tick::zero();
        self.pending_removals.clear();
        self.ledger.clear();
        self.history.clear();

        let spawn_x = self.config.spawn_offset_for(self.score);
        let first = Obstacle::spawn(spawn_x, &self.config, &mut self.rng);
        self.obstacles.push(first);

        let mut ids = Vec::with_capacity(seeds.len());
        for seed in seeds {
            seed.fitness.reset();
            let entry = CohortEntry {
                avatar: Avatar::at(self.config.avatar_start_x, self.config.avatar_start_y),
                controller: seed.controller,
                fitness: seed.fitness,
                status: LifeStatus::Alive,
                tag: seed.tag,
            };
            ids.push(self.cohort.insert(entry));
        }
        ids
    }

    /// Advances the simulation one tick, returning the emitted events.
    ///
    /// Stage order: controller decisions and kinematics (with survival
    /// credit), batched obstacle advance, collisions, pass detection, bounds
    /// checks, scoring, spawn/retire, removal sweep. A stepped-but-empty
    /// cohort terminates cleanly via the `extinct` event.
    pub fn step(&mut self) -> Result<TickEvents, TickError> {
        let next_tick = self.tick.next();

        self.stage_decisions(next_tick)?;
        self.stage_advance();
        self.stage_collisions();
        let passed = self.stage_pass_detection();
        self.stage_bounds();
        if passed {
            self.stage_scoring();
        }
        let (spawned, retired) = self.stage_spawn_retire(passed);
        let removed = self.stage_removal_sweep(next_tick);

        self.tick = next_tick;
        let events = TickEvents {
            tick: self.tick,
            obstacle_passed: passed,
            obstacle_spawned: spawned,
            obstacles_retired: retired,
            removed,
            extinct: self.cohort.is_empty(),
        };
        self.record_summary(&events);
        Ok(events)
    }

    /// Index of the first obstacle whose trailing edge the (shared) avatar
    /// abscissa has not yet passed.
    fn relevant_obstacle(&self) -> Option<usize> {
        let avatar_x = self.config.avatar_start_x;
        self.obstacles
            .iter()
            .position(|obstacle| obstacle.trailing_edge() >= avatar_x)
    }

    fn stage_decisions(&mut self, next_tick: Tick) -> Result<(), TickError> {
        if self.cohort.is_empty() {
            return Ok(());
        }
        let Some(index) = self.relevant_obstacle() else {
            return Err(TickError::MissingObstacle { tick: next_tick.0 });
        };
        let obstacle = self.obstacles[index];
        let survival_reward = self.config.survival_reward;
        for (_, entry) in self.cohort.iter_mut() {
            let observation = observe(&entry.avatar, &obstacle);
            let decision = entry.controller.decide(&observation);
            let output = decision[0];
            if !output.is_finite() {
                return Err(TickError::ControllerFault {
                    tag: entry.tag,
                    value: output,
                });
            }
            if output > JUMP_THRESHOLD {
                entry.avatar.jump(&self.config);
            }
            entry.avatar.integrate(&self.config);
            entry.avatar.advance_animation();
            entry.fitness.add(survival_reward);
        }
        Ok(())
    }

    fn stage_advance(&mut self) {
        for obstacle in &mut self.obstacles {
            obstacle.advance(&self.config);
        }
        self.ground.advance(&self.config);
    }

    fn stage_collisions(&mut self) {
        let penalty = self.config.collision_penalty;
        for (id, entry) in self.cohort.iter_mut() {
            if !entry.status.is_alive() {
                continue;
            }
            let frame = entry.avatar.sprite_frame(&self.config);
            for obstacle in &self.obstacles {
                if avatar_hits_obstacle(&self.atlas, &entry.avatar, frame, obstacle) {
                    entry.fitness.add(-penalty);
                    entry.status = LifeStatus::Removed(RemovalCause::Collision);
                    self.pending_removals.push(id);
                    break;
                }
            }
        }
    }

    fn stage_pass_detection(&mut self) -> bool {
        let mut any_passed = false;
        for obstacle in &mut self.obstacles {
            if obstacle.passed {
                continue;
            }
            let crossed = self
                .cohort
                .entries()
                .iter()
                .any(|entry| entry.status.is_alive() && entry.avatar.x > obstacle.x);
            if crossed {
                obstacle.passed = true;
                any_passed = true;
            }
        }
        any_passed
    }

    fn stage_bounds(&mut self) {
        let ground_line = self.config.ground_line;
        for (id, entry) in self.cohort.iter_mut() {
            if !entry.status.is_alive() {
                continue;
            }
            if entry.avatar.bottom_edge() >= ground_line || entry.avatar.y < 0.0 {
                entry.status = LifeStatus::Removed(RemovalCause::OutOfBounds);
                self.pending_removals.push(id);
            }
        }
    }

    fn stage_scoring(&mut self) {
        self.score += 1;
        let reward = self.config.pass_reward;
        for entry in self.cohort.entries() {
            if entry.status.is_alive() {
                entry.fitness.add(reward);
            }
        }
    }

    fn stage_spawn_retire(&mut self, passed: bool) -> (Option<f32>, usize) {
        let spawned = if passed {
            let spawn_x = self.config.spawn_offset_for(self.score);
            let obstacle = Obstacle::spawn(spawn_x, &self.config, &mut self.rng);
            self.obstacles.push(obstacle);
            Some(spawn_x)
        } else {
            None
        };
        let before = self.obstacles.len();
        self.obstacles.retain(|obstacle| !obstacle.is_retired());
        (spawned, before - self.obstacles.len())
    }

    fn stage_removal_sweep(&mut self, next_tick: Tick) -> usize {
        if self.pending_removals.is_empty() {
            return 0;
        }
        let marked: HashSet<AvatarId> = self.pending_removals.drain(..).collect();
        let removed = self.cohort.remove_many(&marked);
        let count = removed.len();
        for (_, entry) in removed {
            let cause = match entry.status {
                LifeStatus::Removed(cause) => Some(cause),
                LifeStatus::Alive => None,
            };
            self.ledger.push(AgentResult {
                tag: entry.tag,
                fitness: entry.fitness.value(),
                cause,
                ticks_survived: next_tick.0,
            });
        }
        count
    }

    fn record_summary(&mut self, events: &TickEvents) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        if self.history.len() == capacity {
            self.history.pop_front();
        }
        self.history.push_back(TickSummary {
            tick: events.tick,
            alive: self.cohort.len(),
            removed: events.removed,
            score: self.score,
            obstacle_count: self.obstacles.len(),
        });
    }

    /// Full playfield view for renderers.
    #[must_use]
    pub fn snapshot(&self) -> FrameSnapshot {
        let avatars = self
            .cohort
            .entries()
            .iter()
            .map(|entry| AvatarView {
                tag: entry.tag,
                x: entry.avatar.x,
                y: entry.avatar.y,
                tilt: entry.avatar.tilt,
                frame: entry.avatar.sprite_frame(&self.config),
            })
            .collect();
        let obstacles = self
            .obstacles
            .iter()
            .map(|obstacle| ObstacleView {
                x: obstacle.x,
                gap_center: obstacle.gap_center,
                top_origin: obstacle.top_origin,
                bottom_origin: obstacle.bottom_origin,
                passed: obstacle.passed,
            })
            .collect();
        FrameSnapshot {
            tick: self.tick,
            score: self.score,
            alive: self.cohort.len(),
            ground_offset: self.ground.offset,
            avatars,
            obstacles,
        }
    }

    /// Concludes the run: drains surviving entries into the ledger with no
    /// removal cause and returns the complete per-agent results.
    pub fn take_results(&mut self) -> Vec<AgentResult> {
        let survivors = self.cohort.drain();
        let tick = self.tick.0;
        for (_, entry) in survivors {
            self.ledger.push(AgentResult {
                tag: entry.tag,
                fitness: entry.fitness.value(),
                cause: None,
                ticks_survived: tick,
            });
        }
        std::mem::take(&mut self.ledger)
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &AviaryConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Current score.
    #[must_use]
    pub const fn score(&self) -> u32 {
        self.score
    }

    /// Borrow the simulation RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the cohort.
    #[must_use]
    pub fn cohort(&self) -> &Cohort {
        &self.cohort
    }

    /// Mutable access to the cohort.
    #[must_use]
    pub fn cohort_mut(&mut self) -> &mut Cohort {
        &mut self.cohort
    }

    /// Read-only access to the obstacle list, sorted ascending by `x`.
    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Mutable access to the obstacle list (harness staging).
    #[must_use]
    pub fn obstacles_mut(&mut self) -> &mut Vec<Obstacle> {
        &mut self.obstacles
    }

    /// Current ground scroll state.
    #[must_use]
    pub const fn ground(&self) -> Ground {
        self.ground
    }

    /// Shared sprite atlas used for collision.
    #[must_use]
    pub fn atlas(&self) -> &SpriteAtlas {
        &self.atlas
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }
}

/// Why a driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Every cohort entry was removed.
    Extinction,
    /// The stop signal fired or the tick budget ran out.
    ExternalStop,
}

/// Final accounting for one driver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub termination: TerminationReason,
    pub ticks: u64,
    pub score: u32,
    pub results: Vec<AgentResult>,
}

/// Cloneable flag external owners use to stop a run between ticks.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination before the next tick.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once termination has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Fixed-timestep loop driving a populated simulation to termination.
#[derive(Debug, Clone)]
pub struct FrameDriver {
    tick_interval: Duration,
    pacing: bool,
    max_ticks: Option<u64>,
}

impl FrameDriver {
    /// Paced driver at the configured tick rate.
    #[must_use]
    pub fn from_config(config: &AviaryConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            pacing: true,
            max_ticks: None,
        }
    }

    /// Unpaced driver that steps as fast as the host allows.
    #[must_use]
    pub fn headless() -> Self {
        Self {
            tick_interval: Duration::ZERO,
            pacing: false,
            max_ticks: None,
        }
    }

    /// Limits the run to at most `ticks` ticks.
    #[must_use]
    pub fn with_tick_budget(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    /// Enables or disables wall-clock pacing. Physics is unchanged either
    /// way; integration is per-tick, not wall-clock.
    #[must_use]
    pub fn with_pacing(mut self, pacing: bool) -> Self {
        self.pacing = pacing;
        self
    }

    /// Drives `state` until extinction, external stop, or budget exhaustion.
    /// Every processed tick is presented to `renderer`, including the
    /// extinction tick.
    pub fn run(
        &self,
        state: &mut SimulationState,
        renderer: &mut dyn Renderer,
        stop: &StopSignal,
    ) -> Result<RunReport, TickError> {
        let mut steps = 0u64;
        let termination = loop {
            if stop.is_triggered() {
                break TerminationReason::ExternalStop;
            }
            if let Some(budget) = self.max_ticks
                && steps >= budget
            {
                break TerminationReason::ExternalStop;
            }
            let frame_start = Instant::now();
            let events = state.step()?;
            steps += 1;
            renderer.present(&state.snapshot());
            if events.extinct {
                break TerminationReason::Extinction;
            }
            if self.pacing {
                let elapsed = frame_start.elapsed();
                if elapsed < self.tick_interval {
                    thread::sleep(self.tick_interval - elapsed);
                }
            }
        };
        Ok(RunReport {
            termination,
            ticks: state.tick().0,
            score: state.score(),
            results: state.take_results(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Glide;

    impl Controller for Glide {
        fn kind(&self) -> &'static str {
            "glide"
        }

        fn decide(&mut self, _observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
            [0.0]
        }
    }

    struct Faulty;

    impl Controller for Faulty {
        fn kind(&self) -> &'static str {
            "faulty"
        }

        fn decide(&mut self, _observation: &[f32; OBSERVATION_SIZE]) -> [f32; DECISION_SIZE] {
            [f32::NAN]
        }
    }

    fn test_config() -> AviaryConfig {
        AviaryConfig {
            rng_seed: Some(7),
            ..AviaryConfig::default()
        }
    }

    fn glide_seed(tag: u64) -> CohortSeed {
        CohortSeed {
            controller: Box::new(Glide),
            fitness: FitnessCell::new(),
            tag,
        }
    }

    #[test]
    fn default_config_validates() {
        AviaryConfig::default().validate().expect("default config");
    }

    #[test]
    fn config_rejects_inverted_gap_range() {
        let config = AviaryConfig {
            gap_center_min: 450,
            gap_center_max: 50,
            ..AviaryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SimulationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_rejects_unsorted_tiers() {
        let config = AviaryConfig {
            difficulty_tiers: vec![
                DifficultyTier {
                    min_score: 11,
                    spawn_offset: 400.0,
                },
                DifficultyTier {
                    min_score: 6,
                    spawn_offset: 500.0,
                },
            ],
            ..AviaryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn spawn_offset_follows_difficulty_tiers() {
        let config = AviaryConfig::default();
        assert_eq!(config.spawn_offset_for(0), 600.0);
        assert_eq!(config.spawn_offset_for(5), 600.0);
        assert_eq!(config.spawn_offset_for(6), 500.0);
        assert_eq!(config.spawn_offset_for(10), 500.0);
        assert_eq!(config.spawn_offset_for(11), 400.0);
        assert_eq!(config.spawn_offset_for(40), 400.0);
    }

    #[test]
    fn mask_pattern_rejects_ragged_rows() {
        let err = SpriteMask::from_pattern(&["##", "#"]).unwrap_err();
        assert_eq!(
            err,
            MaskError::RaggedRow {
                row: 1,
                actual: 1,
                expected: 2
            }
        );
        assert_eq!(
            SpriteMask::from_pattern(&[]).unwrap_err(),
            MaskError::EmptyPattern
        );
    }

    #[test]
    fn mask_flip_mirrors_rows() {
        let mask = SpriteMask::from_pattern(&["##.", "...", "..#"]).expect("mask");
        let flipped = mask.flipped_vertical();
        assert!(flipped.is_opaque(2, 0));
        assert!(flipped.is_opaque(0, 2));
        assert!(flipped.is_opaque(1, 2));
        assert!(!flipped.is_opaque(2, 2));
        assert_eq!(mask.opaque_count(), flipped.opaque_count());
    }

    #[test]
    fn overlap_requires_coincident_opaque_pixels() {
        // An L and a notched block whose bounding boxes fully overlap while
        // their opaque pixels interlock without touching.
        let l_shape = SpriteMask::from_pattern(&["#..", "#..", "###"]).expect("l");
        let notch = SpriteMask::from_pattern(&[".##", ".##", "..."]).expect("notch");
        assert!(!l_shape.overlaps(&notch, (0, 0)));
        // One pixel left and the blocks meet.
        assert!(l_shape.overlaps(&notch, (-1, 0)));
    }

    #[test]
    fn overlap_outside_window_is_false() {
        let a = SpriteMask::solid(4, 4);
        let b = SpriteMask::solid(4, 4);
        assert!(a.overlaps(&b, (3, 3)));
        assert!(!a.overlaps(&b, (4, 0)));
        assert!(!a.overlaps(&b, (0, -4)));
        assert!(!a.overlaps(&b, (-200, 100)));
    }

    #[test]
    fn atlas_frames_are_distinct_with_transparent_corners() {
        let atlas = SpriteAtlas::standard();
        for frame in 0..FLAP_FRAME_COUNT {
            let mask = atlas.flap_frame(frame);
            assert!(!mask.is_opaque(0, 0));
            assert!(!mask.is_opaque(AVATAR_WIDTH - 1, 0));
            assert!(!mask.is_opaque(0, AVATAR_HEIGHT - 1));
            assert!(!mask.is_opaque(AVATAR_WIDTH - 1, AVATAR_HEIGHT - 1));
            assert!(mask.opaque_count() > 0);
        }
        assert_ne!(atlas.flap_frame(0), atlas.flap_frame(1));
        assert_ne!(atlas.flap_frame(1), atlas.flap_frame(2));
        assert_eq!(
            atlas.barrier_top().opaque_count(),
            atlas.barrier_bottom().opaque_count()
        );
        // The bottom barrier's cap faces the gap (top of the sprite).
        assert!(atlas.barrier_bottom().is_opaque(2, 20));
        assert!(!atlas.barrier_bottom().is_opaque(2, BARRIER_HEIGHT - 1));
        assert!(atlas.barrier_top().is_opaque(2, BARRIER_HEIGHT - 21));
    }

    #[test]
    fn jump_resets_physics_clock() {
        let config = test_config();
        let mut avatar = Avatar::at(230.0, 350.0);
        avatar.integrate(&config);
        avatar.integrate(&config);
        assert_eq!(avatar.ticks_since_jump, 2);
        avatar.jump(&config);
        assert_eq!(avatar.ticks_since_jump, 0);
        assert_eq!(avatar.velocity, config.jump_velocity);
        assert_eq!(avatar.jump_origin, avatar.y);
    }

    #[test]
    fn free_fall_reaches_terminal_displacement() {
        let config = test_config();
        let mut avatar = Avatar::at(230.0, 0.0);
        let mut previous_y = avatar.y;
        let mut displacements = Vec::new();
        for _ in 0..30 {
            let d = avatar.integrate(&config);
            displacements.push(d);
            assert!(d <= config.max_fall_speed);
            assert!(avatar.y > previous_y);
            previous_y = avatar.y;
        }
        assert_eq!(displacements[0], 1.5);
        assert_eq!(displacements[1], 6.0);
        assert_eq!(displacements[2], 13.5);
        assert!(displacements[3..].iter().all(|d| *d == config.max_fall_speed));
    }

    #[test]
    fn jump_every_tick_climbs_steadily() {
        let config = test_config();
        let mut avatar = Avatar::at(230.0, 400.0);
        for _ in 0..10 {
            let before = avatar.y;
            avatar.jump(&config);
            let d = avatar.integrate(&config);
            assert_eq!(d, config.jump_velocity + config.gravity_coefficient - config.ascent_boost);
            assert_eq!(avatar.y, before + d);
        }
    }

    #[test]
    fn tilt_snaps_up_then_decays_to_floor() {
        let config = test_config();
        let mut avatar = Avatar::at(230.0, 350.0);
        avatar.jump(&config);
        avatar.integrate(&config);
        assert_eq!(avatar.tilt, config.max_tilt_up);
        let mut lowest = avatar.tilt;
        for _ in 0..60 {
            avatar.integrate(&config);
            assert!(avatar.tilt >= config.max_tilt_down);
            lowest = lowest.min(avatar.tilt);
        }
        assert_eq!(lowest, config.max_tilt_down);
    }

    #[test]
    fn sprite_frame_cycles_and_dive_locks() {
        let config = test_config();
        let mut avatar = Avatar::at(230.0, 350.0);
        let mut frames = Vec::new();
        for _ in 0..(config.flap_period * 4) {
            frames.push(avatar.sprite_frame(&config));
            avatar.advance_animation();
        }
        let period = config.flap_period as usize;
        assert!(frames[..period].iter().all(|f| *f == 0));
        assert!(frames[period..2 * period].iter().all(|f| *f == 1));
        assert!(frames[2 * period..3 * period].iter().all(|f| *f == 2));
        assert!(frames[3 * period..].iter().all(|f| *f == 1));
        assert_eq!(avatar.sprite_frame(&config), 0);

        avatar.tilt = DIVE_LOCK_TILT;
        assert_eq!(avatar.sprite_frame(&config), 1);
        avatar.tilt = -89.0;
        assert_eq!(avatar.sprite_frame(&config), 1);
    }

    #[test]
    fn spawned_obstacles_honor_gap_invariant() {
        let config = test_config();
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..200 {
            let obstacle = Obstacle::spawn(600.0, &config, &mut rng);
            assert_eq!(
                obstacle.bottom_origin - obstacle.gap_center,
                config.gap_height
            );
            assert_eq!(
                obstacle.gap_center - obstacle.top_origin,
                BARRIER_HEIGHT as f32
            );
            assert!(obstacle.gap_center >= config.gap_center_min as f32);
            assert!(obstacle.gap_center < config.gap_center_max as f32);
            assert!(!obstacle.passed);
        }
    }

    #[test]
    fn ground_scroll_wraps_modulo_tile_width() {
        let config = test_config();
        let mut ground = Ground::default();
        for _ in 0..140 {
            ground.advance(&config);
        }
        assert_eq!(ground.offset, (140.0 * config.base_velocity) % GROUND_TILE_WIDTH);
        assert!(ground.offset >= 0.0 && ground.offset < GROUND_TILE_WIDTH);
    }

    #[test]
    fn fitness_cell_is_shared_between_clones() {
        let cell = FitnessCell::new();
        let held_by_optimizer = cell.clone();
        cell.add(0.1);
        cell.add(5.0);
        assert!((held_by_optimizer.value() - 5.1).abs() < 1e-6);
        held_by_optimizer.reset();
        assert_eq!(cell.value(), 0.0);
    }

    #[test]
    fn cohort_removal_preserves_survivor_order() {
        let mut cohort = Cohort::new();
        let ids: Vec<AvatarId> = (0..4).map(|tag| {
            cohort.insert(CohortEntry {
                avatar: Avatar::at(230.0, 350.0),
                controller: Box::new(Glide),
                fitness: FitnessCell::new(),
                status: LifeStatus::Alive,
                tag,
            })
        }).collect();

        let marked: HashSet<AvatarId> = [ids[1], ids[3]].into_iter().collect();
        let removed = cohort.remove_many(&marked);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].1.tag, 1);
        assert_eq!(removed[1].1.tag, 3);

        assert_eq!(cohort.len(), 2);
        let tags: Vec<u64> = cohort.iter().map(|(_, entry)| entry.tag).collect();
        assert_eq!(tags, vec![0, 2]);
        assert_eq!(cohort.index_of(ids[0]), Some(0));
        assert_eq!(cohort.index_of(ids[2]), Some(1));
        assert!(!cohort.contains(ids[1]));
        assert!(!cohort.contains(ids[3]));
    }

    #[test]
    fn populate_resets_run_state() {
        let mut state = SimulationState::new(test_config()).expect("state");
        state.populate(vec![glide_seed(0), glide_seed(1), glide_seed(2)]);
        assert_eq!(state.cohort().len(), 3);
        assert_eq!(state.obstacles().len(), 1);
        assert_eq!(state.obstacles()[0].x, 600.0);
        assert_eq!(state.score(), 0);
        assert_eq!(state.tick(), Tick::zero());
        for (_, entry) in state.cohort().iter() {
            assert_eq!(entry.avatar.x, 230.0);
            assert_eq!(entry.avatar.y, 350.0);
            assert_eq!(entry.avatar.velocity, 0.0);
            assert!(entry.status.is_alive());
        }
    }

    #[test]
    fn step_requires_an_obstacle_for_live_cohort() {
        let mut state = SimulationState::new(test_config()).expect("state");
        state.populate(vec![glide_seed(0)]);
        state.obstacles_mut().clear();
        assert!(matches!(
            state.step(),
            Err(TickError::MissingObstacle { tick: 1 })
        ));
        // The failed tick must not advance the clock.
        assert_eq!(state.tick(), Tick::zero());
    }

    #[test]
    fn controller_fault_aborts_the_run() {
        let mut state = SimulationState::new(test_config()).expect("state");
        state.populate(vec![CohortSeed {
            controller: Box::new(Faulty),
            fitness: FitnessCell::new(),
            tag: 9,
        }]);
        assert!(matches!(
            state.step(),
            Err(TickError::ControllerFault { tag: 9, .. })
        ));
    }

    #[test]
    fn empty_cohort_terminates_cleanly() {
        let mut state = SimulationState::new(test_config()).expect("state");
        state.populate(Vec::new());
        let events = state.step().expect("step");
        assert!(events.extinct);
        assert_eq!(events.removed, 0);
        assert_eq!(state.tick(), Tick(1));
    }

    #[test]
    fn simultaneous_passes_score_once() {
        let config = test_config();
        let mut state = SimulationState::new(config.clone()).expect("state");
        state.populate(vec![glide_seed(0)]);
        // Two unpassed obstacles already behind the avatar plus the live one.
        state.obstacles_mut().clear();
        state.obstacles_mut().push(Obstacle::with_gap(100.0, 250.0, &config));
        state.obstacles_mut().push(Obstacle::with_gap(150.0, 250.0, &config));
        state.obstacles_mut().push(Obstacle::with_gap(600.0, 250.0, &config));

        let events = state.step().expect("step");
        assert!(events.obstacle_passed);
        assert_eq!(state.score(), 1);
        assert_eq!(events.obstacle_spawned, Some(600.0));
        assert_eq!(state.obstacles().len(), 4);
        let entry = &state.cohort().entries()[0];
        let expected = config.survival_reward + config.pass_reward;
        assert!((entry.fitness.value() - expected).abs() < 1e-5);
    }

    #[test]
    fn collision_removes_entry_and_debits_penalty() {
        let config = test_config();
        let mut state = SimulationState::new(config.clone()).expect("state");
        state.populate(vec![glide_seed(0), glide_seed(1)]);
        // Park the first avatar inside the bottom barrier of an obstacle
        // sitting on top of the shared abscissa.
        state.obstacles_mut().clear();
        state
            .obstacles_mut()
            .push(Obstacle::with_gap(230.0, 250.0, &config));
        state.cohort_mut().entries_mut()[0].avatar.y = 500.0;

        let events = state.step().expect("step");
        assert_eq!(events.removed, 1);
        assert!(!events.extinct);
        assert_eq!(state.cohort().len(), 1);
        assert_eq!(state.cohort().entries()[0].tag, 1);

        let results = state.take_results();
        let crashed = results.iter().find(|result| result.tag == 0).expect("result");
        assert_eq!(crashed.cause, Some(RemovalCause::Collision));
        let expected = config.survival_reward - config.collision_penalty;
        assert!((crashed.fitness - expected).abs() < 1e-5);
    }

    #[test]
    fn history_retains_bounded_summaries() {
        let config = AviaryConfig {
            history_capacity: 4,
            ..test_config()
        };
        let mut state = SimulationState::new(config).expect("state");
        state.populate(vec![glide_seed(0)]);
        for _ in 0..6 {
            state.step().expect("step");
        }
        let summaries: Vec<&TickSummary> = state.history().collect();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries.first().map(|summary| summary.tick), Some(Tick(3)));
        assert_eq!(summaries.last().map(|summary| summary.tick), Some(Tick(6)));
        assert!(summaries.iter().all(|summary| summary.alive == 1));
    }

    #[test]
    fn observation_tracks_relevant_obstacle() {
        let config = test_config();
        let avatar = Avatar::at(230.0, 300.0);
        let obstacle = Obstacle::with_gap(600.0, 250.0, &config);
        let observation = observe(&avatar, &obstacle);
        assert_eq!(observation[0], 300.0);
        assert_eq!(observation[1], 50.0);
        assert_eq!(observation[2], 150.0);
    }
}
