//! Distributed multi-target tracking for teams of mobile robots
//!
//! This crate implements a particle-filter based tracker for moving objects observed by one or more
//! robots. Each robot maintains a particle belief over the positions of the targets it perceives,
//! groups the particles into target hypotheses by clustering, assigns each hypothesis a stable
//! integer identity, and exchanges identity-tagged estimates with its teammates over UDP so that
//! every robot can compute a fused, team-wide estimate.
//!
//! The crate is built on top of a small set of dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): planar points and vectors for positions and uncertainties.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): particle sampling, process noise and resampling.
//! - [`serde`](https://crates.io/crates/serde) with `serde_json`, `serde_yaml` and `toml`: configuration files.
//! - [`log`](https://crates.io/crates/log): diagnostics. Binaries decide where the log goes.
//!
//! ## Crate overview
//!
//! - [buffer]: bounded priority buffer used for cluster seeds and per-target history.
//! - [clustering]: the clustering strategies (k-seeded and quality-threshold) behind one type.
//! - [particle]: particles, systematic resampling and the particle filter core with target history.
//! - [sensor]: appearance models, observations, sensor readings, the world map and the sensor model.
//! - [object_filter]: the local estimation layer that promotes observations into tracked, identified targets.
//! - [bank]: a bank of independent single-target filters that split and merge.
//! - [fusion]: the cross-robot fusion layer operating on teammates' identity-tagged estimates.
//! - [messages]: the text datagram exchanged between robots.
//! - [config]: configuration loading (JSON, YAML or TOML).
//! - [processor]: filter banks keyed by name and the update gating applied on every iteration.
//! - [network]: the shared observation queue, UDP transport and listener thread.
//! - [estimator]: the per-robot pipeline tying everything together.
//! - [sim]: synthetic scenarios and result records for testing and the simulation binary.
//!
//! ## Frames and units
//!
//! All positions are planar, in meters, expressed in a global world frame unless stated otherwise.
//! Angles are radians. Perceptions arrive in the robot frame as polar points (`theta`, `rho`) and are
//! converted to the world frame with the robot pose before they reach the filters. Time is carried as
//! [`Timestamp`] values in milliseconds and is always passed in explicitly, so a filter never reads
//! the wall clock on its own.
pub mod bank;
pub mod buffer;
pub mod clustering;
pub mod config;
pub mod error;
pub mod estimator;
pub mod fusion;
pub mod messages;
pub mod network;
pub mod object_filter;
pub mod particle;
pub mod processor;
pub mod sensor;
pub mod sim;

pub use error::{Result, TrackingError};

use std::f64::consts::PI;
use std::fmt::{self, Display};
use std::ops::Sub;

use nalgebra::{Point2, Vector2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::particle::Particle;

/// Lower bound applied to each axis of a position standard deviation.
pub const MIN_POSITION_SIGMA: f64 = 0.01;

/// An oriented point on the plane (position in meters, heading in radians).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3} rad)", self.x, self.y, self.theta)
    }
}
impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2 { x, y, theta }
    }
    pub fn from_position(position: Point2<f64>) -> Self {
        Pose2::new(position.x, position.y, 0.0)
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Distance of the position from the frame origin.
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }
    pub fn distance_to(&self, other: &Pose2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A polar point: bearing `theta` (radians) and range `rho` (meters).
///
/// The same type carries velocities, where `theta` is the heading of the motion and `rho` the speed
/// in meters per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    pub theta: f64,
    pub rho: f64,
}
impl PolarPoint {
    pub fn new(theta: f64, rho: f64) -> Self {
        PolarPoint { theta, rho }
    }
    pub fn from_cartesian(point: Point2<f64>) -> Self {
        PolarPoint {
            theta: point.y.atan2(point.x),
            rho: point.x.hypot(point.y),
        }
    }
    pub fn to_cartesian(&self) -> Point2<f64> {
        Point2::new(self.rho * self.theta.cos(), self.rho * self.theta.sin())
    }
    pub fn is_zero(&self) -> bool {
        self.rho == 0.0 && self.theta == 0.0
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);
impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms", self.0)
    }
}
impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }
    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }
    pub const fn millis(&self) -> u64 {
        self.0
    }
    /// Milliseconds elapsed since `earlier`, zero if `earlier` lies in the future.
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.millis_since(earlier) as f64 / 1000.0
    }
    pub fn add_millis(&self, millis: u64) -> Self {
        Timestamp(self.0 + millis)
    }
}
impl Sub for Timestamp {
    type Output = u64;
    fn sub(self, rhs: Timestamp) -> u64 {
        self.millis_since(rhs)
    }
}

/// Normalize an angle to (-π, π].
///
/// # Example
/// ```rust
/// use ptrack::normalize_angle;
/// use std::f64::consts::PI;
/// assert!((normalize_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
/// ```
pub fn normalize_angle(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

/// True when the Euclidean distance between two positions is strictly below `distance`.
pub fn is_target_near(first: &Point2<f64>, second: &Point2<f64>, distance: f64) -> bool {
    nalgebra::distance(first, second) < distance
}

/// Arithmetic mean of the particle positions. An empty set yields the origin.
pub fn mean_position(particles: &[Particle]) -> Point2<f64> {
    if particles.is_empty() {
        return Point2::origin();
    }
    let n = particles.len() as f64;
    let (sum_x, sum_y) = particles
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.pose.x, sy + p.pose.y));
    Point2::new(sum_x / n, sum_y / n)
}

/// Centroid of a particle set as a pose with zero heading.
pub fn centroid(particles: &[Particle]) -> Pose2 {
    Pose2::from_position(mean_position(particles))
}

/// Per-axis population standard deviation of the particle positions around `mean`.
///
/// When either axis falls below [`MIN_POSITION_SIGMA`] both axes are set to it, so a collapsed
/// cloud never reports a zero uncertainty.
pub fn position_sigma(particles: &[Particle], mean: &Point2<f64>) -> Vector2<f64> {
    if particles.is_empty() {
        return Vector2::new(MIN_POSITION_SIGMA, MIN_POSITION_SIGMA);
    }
    let n = particles.len() as f64;
    let (var_x, var_y) = particles.iter().fold((0.0, 0.0), |(vx, vy), p| {
        (vx + (p.pose.x - mean.x).powi(2), vy + (p.pose.y - mean.y).powi(2))
    });
    let sigma = Vector2::new((var_x / n).sqrt(), (var_y / n).sqrt());
    if sigma.x < MIN_POSITION_SIGMA || sigma.y < MIN_POSITION_SIGMA {
        Vector2::new(MIN_POSITION_SIGMA, MIN_POSITION_SIGMA)
    } else {
        sigma
    }
}

/// Express a point given in the frame `frame` in the global frame.
pub fn relative_to_global(point: &Pose2, frame: &Pose2) -> Pose2 {
    let (sin, cos) = frame.theta.sin_cos();
    Pose2::new(
        frame.x + point.x * cos - point.y * sin,
        frame.y + point.x * sin + point.y * cos,
        normalize_angle(point.theta + frame.theta),
    )
}

/// Constant-velocity extrapolation of `position` over `dt` seconds.
pub fn extrapolate_position(position: &Point2<f64>, velocity: &PolarPoint, dt: f64) -> Point2<f64> {
    let heading = normalize_angle(velocity.theta);
    Point2::new(
        position.x + velocity.rho * dt * heading.cos(),
        position.y + velocity.rho * dt * heading.sin(),
    )
}

/// Round to `decimals` decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Draw `count` unit-weight particles from a Gaussian around `mean` with per-axis `sigma`.
///
/// Non-positive or non-finite sigmas collapse the corresponding axis onto the mean.
pub fn sample_particles<R: Rng + ?Sized>(
    mean: &Point2<f64>,
    sigma: &Vector2<f64>,
    count: usize,
    rng: &mut R,
) -> Vec<Particle> {
    let x_dist = Normal::new(mean.x, sigma.x.abs()).ok();
    let y_dist = Normal::new(mean.y, sigma.y.abs()).ok();
    (0..count)
        .map(|_| {
            let x = x_dist.map_or(mean.x, |d| d.sample(rng));
            let y = y_dist.map_or(mean.y, |d| d.sample(rng));
            Particle::new(Pose2::new(x, y, 0.0), 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_normalize_angle() {
        assert_approx_eq!(normalize_angle(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(normalize_angle(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(normalize_angle(5.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_eq!(normalize_angle(0.0), 0.0);
        assert_eq!(normalize_angle(f64::NAN), 0.0);
    }
    #[test]
    fn test_polar_cartesian() {
        let polar = PolarPoint::from_cartesian(Point2::new(0.0, 2.0));
        assert_approx_eq!(polar.theta, PI / 2.0, 1e-12);
        assert_approx_eq!(polar.rho, 2.0, 1e-12);
        let back = polar.to_cartesian();
        assert_approx_eq!(back.x, 0.0, 1e-12);
        assert_approx_eq!(back.y, 2.0, 1e-12);
    }
    #[test]
    fn test_timestamp_arithmetic() {
        let t0 = Timestamp::from_millis(1_000);
        let t1 = t0.add_millis(2_500);
        assert_eq!(t1 - t0, 2_500);
        assert_eq!(t0 - t1, 0, "elapsed time never goes negative");
        assert_approx_eq!(t1.seconds_since(t0), 2.5);
    }
    #[test]
    fn test_relative_to_global() {
        let frame = Pose2::new(1.0, 1.0, PI / 2.0);
        let global = relative_to_global(&Pose2::new(2.0, 0.0, 0.0), &frame);
        assert_approx_eq!(global.x, 1.0, 1e-12);
        assert_approx_eq!(global.y, 3.0, 1e-12);
        assert_approx_eq!(global.theta, PI / 2.0, 1e-12);
    }
    #[test]
    fn test_position_sigma_floor() {
        let particles = vec![Particle::new(Pose2::new(1.0, 1.0, 0.0), 1.0); 5];
        let sigma = position_sigma(&particles, &mean_position(&particles));
        assert_eq!(sigma, Vector2::new(MIN_POSITION_SIGMA, MIN_POSITION_SIGMA));
    }
    #[test]
    fn test_position_sigma_spread() {
        let particles = vec![
            Particle::new(Pose2::new(-1.0, 0.0, 0.0), 1.0),
            Particle::new(Pose2::new(1.0, 0.0, 0.0), 1.0),
        ];
        let mean = mean_position(&particles);
        assert_approx_eq!(mean.x, 0.0);
        let sigma = position_sigma(&particles, &mean);
        // the y axis collapses so both axes take the floor
        assert_approx_eq!(sigma.x, MIN_POSITION_SIGMA);
    }
    #[test]
    fn test_extrapolate_position() {
        let p = extrapolate_position(&Point2::new(0.0, 0.0), &PolarPoint::new(PI / 2.0, 2.0), 0.5);
        assert_approx_eq!(p.x, 0.0, 1e-12);
        assert_approx_eq!(p.y, 1.0, 1e-12);
    }
    #[test]
    fn test_sample_particles() {
        let mut rng = StdRng::seed_from_u64(7);
        let mean = Point2::new(3.0, -2.0);
        let samples = sample_particles(&mean, &Vector2::new(0.1, 0.1), 2000, &mut rng);
        assert_eq!(samples.len(), 2000);
        assert!(samples.iter().all(|p| p.weight == 1.0 && p.pose.theta == 0.0));
        let m = mean_position(&samples);
        assert_approx_eq!(m.x, 3.0, 0.02);
        assert_approx_eq!(m.y, -2.0, 0.02);
    }
    #[test]
    fn test_round_to() {
        assert_approx_eq!(round_to(1.23456, 2), 1.23, 1e-12);
        assert_approx_eq!(round_to(-0.005001, 2), -0.01, 1e-12);
    }
}
