//! Particles, systematic resampling and the particle filter core.
//!
//! [`ParticleFilter`] owns a weighted particle population over planar target positions, the clusters
//! computed from it, and a per-region history of cluster centroids used to estimate target velocity.
//! It is the building block of the local layer ([`crate::object_filter`]), of every member of the
//! filter bank ([`crate::bank`]) and of the fusion layer ([`crate::fusion`]).
use crate::buffer::{PriorityBuffer, Prioritized};
use crate::clustering::Cluster;
use crate::sensor::{BasicSensorModel, ObjectSensorReading, Observation};
use crate::{
    PolarPoint, Pose2, Timestamp, is_target_near, mean_position, normalize_angle, position_sigma,
};

use nalgebra::{Point2, Vector2};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;
use std::fmt::{self, Debug, Display};

/// Number of samples kept per history region.
pub const HISTORY_CAPACITY: usize = 30;
/// Displacement between the two newest history samples below which a target counts as static.
pub const MIN_TRAJECTORY_DISPLACEMENT: f64 = 0.05;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    pub pose: Pose2,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(pose: Pose2, weight: f64) -> Particle {
        Particle { pose, weight }
    }
    pub fn position(&self) -> Point2<f64> {
        self.pose.position()
    }
}
impl Prioritized for Particle {
    fn priority(&self) -> f64 {
        self.weight
    }
}

/// Systematic resampling: `count` equally spaced draws over the cumulative weight with a single
/// random offset.
///
/// Returns the indexes of the selected particles. Negative or non-finite weights count as zero.
/// When the total weight is zero every particle is kept in turn.
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || count == 0 {
        return Vec::new();
    }
    let usable = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let total: f64 = weights.iter().map(|&w| usable(w)).sum();
    if !(total > 0.0 && total.is_finite()) {
        return (0..count).map(|i| i % weights.len()).collect();
    }
    let interval = total / count as f64;
    let mut target = interval * rng.random::<f64>();
    let mut cumulative = 0.0;
    let mut indexes = Vec::with_capacity(count);
    for (i, &w) in weights.iter().enumerate() {
        cumulative += usable(w);
        while cumulative > target && indexes.len() < count {
            indexes.push(i);
            target += interval;
        }
    }
    // Rounding can leave the walk a draw short.
    let last = weights
        .iter()
        .rposition(|&w| usable(w) > 0.0)
        .unwrap_or(weights.len() - 1);
    while indexes.len() < count {
        indexes.push(last);
    }
    indexes
}

/// Resample `particles` into a population of `count`, resetting every weight to 1.
pub fn resample_particles<R: Rng + ?Sized>(
    particles: &[Particle],
    count: usize,
    rng: &mut R,
) -> Vec<Particle> {
    let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
    systematic_resample(&weights, count, rng)
        .into_iter()
        .map(|i| Particle::new(particles[i].pose, 1.0))
        .collect()
}

/// Scale weights to sum to one, or spread them uniformly when their sum is not positive.
pub fn normalize_weights(particles: &mut [Particle]) {
    if particles.is_empty() {
        return;
    }
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    if sum > 0.0 && sum.is_finite() {
        for particle in particles.iter_mut() {
            particle.weight /= sum;
        }
    } else {
        let uniform = 1.0 / particles.len() as f64;
        for particle in particles.iter_mut() {
            particle.weight = uniform;
        }
    }
}

pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let sum_of_squares: f64 = particles.iter().map(|p| p.weight * p.weight).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// Sort by descending weight. Equal weights keep their relative order.
pub fn sort_by_weight_descending(particles: &mut [Particle]) {
    particles.sort_by(|a, b| b.weight.total_cmp(&a.weight));
}

/// Zero-mean Gaussian draw; an invalid standard deviation yields zero.
pub(crate) fn gaussian<R: Rng + ?Sized>(rng: &mut R, std_dev: f64) -> f64 {
    match Normal::new(0.0, std_dev) {
        Ok(dist) if std_dev > 0.0 => dist.sample(rng),
        _ => 0.0,
    }
}

/// A cluster centroid recorded at a point in time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistorySample {
    pub position: Pose2,
    pub timestamp: Timestamp,
}
impl Prioritized for HistorySample {
    fn priority(&self) -> f64 {
        self.timestamp.millis() as f64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterState {
    #[default]
    Uninitialized,
    Initialized,
    Running,
}

/// Per-axis Gaussian process noise: `position_std` on x and y, `heading_std` on theta.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessNoise {
    pub position_std: f64,
    pub heading_std: f64,
}

#[derive(Clone)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    particle_number: usize,
    process_noise: ProcessNoise,
    sensor_model: BasicSensorModel,
    clusters: Vec<Cluster>,
    history: Vec<PriorityBuffer<HistorySample>>,
    best_particle: Option<Particle>,
    state: FilterState,
    rng: StdRng,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.mean();
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("state", &self.state)
            .field("num_particles", &self.particles.len())
            .field("particle_number", &self.particle_number)
            .field("effective_particles", &effective_sample_size(&self.particles))
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("mean_position", &format_args!("({:.3}, {:.3}) m", mean.x, mean.y))
            .field("clusters", &self.clusters.len())
            .field("history_regions", &self.history.len())
            .finish()
    }
}
impl ParticleFilter {
    pub fn new(
        particle_number: usize,
        process_noise: ProcessNoise,
        sensor_model: BasicSensorModel,
        seed: u64,
    ) -> Self {
        ParticleFilter {
            particles: Vec::with_capacity(particle_number),
            particle_number,
            process_noise,
            sensor_model,
            clusters: Vec::new(),
            history: Vec::new(),
            best_particle: None,
            state: FilterState::Uninitialized,
            rng: StdRng::seed_from_u64(seed),
        }
    }
    /// Spread `particle_number` unit-weight particles uniformly over the rectangle, heading in [-π, π).
    pub fn init_uniform(&mut self, min: Point2<f64>, max: Point2<f64>) {
        let (x_lo, x_hi) = (min.x.min(max.x), min.x.max(max.x));
        let (y_lo, y_hi) = (min.y.min(max.y), min.y.max(max.y));
        let rng = &mut self.rng;
        self.particles = (0..self.particle_number)
            .map(|_| {
                let x = x_lo + (x_hi - x_lo) * rng.random::<f64>();
                let y = y_lo + (y_hi - y_lo) * rng.random::<f64>();
                let theta = -PI + 2.0 * PI * rng.random::<f64>();
                Particle::new(Pose2::new(x, y, theta), 1.0)
            })
            .collect();
        self.best_particle = None;
        self.state = FilterState::Initialized;
    }
    /// Uniform initialisation over the world of the sensor map.
    pub fn init_from_map(&mut self) {
        let (min, max) = self.sensor_model.map().world_bounds();
        self.init_uniform(min, max);
    }
    pub fn init_from_uniform(&mut self) {
        self.init_from_map();
    }
    /// Initialise by resampling a provided population into `particle_number` particles.
    pub fn init_from_samples(&mut self, samples: &[Particle]) {
        self.particles = resample_particles(samples, self.particle_number, &mut self.rng);
        self.state = FilterState::Initialized;
    }
    pub fn reset_weight(&mut self) {
        for particle in &mut self.particles {
            particle.weight = 1.0;
        }
    }
    /// Weigh the population against the observations of `reading` and resample.
    ///
    /// Returns false and leaves the population untouched when the reading is empty.
    pub fn observe(&mut self, reading: &ObjectSensorReading) -> bool {
        if reading.observations().is_empty() {
            return false;
        }
        self.reset_weight();
        self.weigh(reading.observations());
        self.update_best_particle();
        self.resample();
        self.state = FilterState::Running;
        true
    }
    /// Multiply the particle weights by the sensor likelihood of `observations`.
    pub fn weigh(&mut self, observations: &[Observation]) {
        self.sensor_model
            .apply_likelihood(&mut self.particles, observations);
    }
    /// Normalize weights inside every cluster independently.
    pub fn normalize_cluster_weights(&mut self) {
        for cluster in &mut self.clusters {
            normalize_weights(&mut cluster.particles);
        }
    }
    /// Resample every cluster into a population of its current size.
    pub fn resample_clusters(&mut self) {
        let rng = &mut self.rng;
        for cluster in &mut self.clusters {
            let total: f64 = cluster.particles.iter().map(|p| p.weight).sum();
            if total > 0.0 && total.is_finite() {
                let count = cluster.particles.len();
                cluster.particles = resample_particles(&cluster.particles, count, rng);
            }
        }
    }
    /// Systematic resampling into `particle_number` particles. Skipped when the weights sum to zero.
    pub fn resample(&mut self) {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if !(total > 0.0 && total.is_finite()) {
            log::debug!("skipping resample: total particle weight is {}", total);
            return;
        }
        self.particles = resample_particles(&self.particles, self.particle_number, &mut self.rng);
    }
    /// Move every particle by the rigid motion between `old` and `new`, then perturb it.
    pub fn predict(&mut self, old: &Pose2, new: &Pose2) {
        self.apply_egomotion(old, new);
        let noise = self.process_noise;
        let rng = &mut self.rng;
        for particle in &mut self.particles {
            perturb(particle, &noise, rng);
        }
    }
    /// Rigid transform: the translation between the two poses is expressed in the new frame and
    /// rotated by the old heading plus half of the heading change.
    pub fn apply_egomotion(&mut self, old: &Pose2, new: &Pose2) {
        let (sin_n, cos_n) = (-new.theta).sin_cos();
        let dx = new.x - old.x;
        let dy = new.y - old.y;
        let delta_x = cos_n * dx - sin_n * dy;
        let delta_y = sin_n * dx + cos_n * dy;
        let delta_theta = normalize_angle(new.theta - old.theta);
        let heading = old.theta + delta_theta / 2.0;
        let a = heading.cos();
        let b = (PI / 2.0 + heading).cos();
        let c = heading.sin();
        let d = (PI / 2.0 + heading).sin();
        for particle in &mut self.particles {
            particle.pose.x += delta_x * a + delta_y * b;
            particle.pose.y += delta_x * c + delta_y * d;
            particle.pose.theta = normalize_angle(particle.pose.theta + delta_theta);
        }
    }
    /// Apply the process noise to a single particle with this filter's generator.
    pub fn perturb(&mut self, particle: &mut Particle) {
        perturb(particle, &self.process_noise, &mut self.rng);
    }
    pub fn update_best_particle(&mut self) {
        self.best_particle = self
            .particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .cloned();
    }
    /// Record every cluster centroid in the history region whose mean lies within `distance`,
    /// opening a new region when none does.
    pub fn update_history(&mut self, now: Timestamp, distance: f64) {
        for cluster in &self.clusters {
            let sample = HistorySample {
                position: cluster.centroid,
                timestamp: now,
            };
            let target = cluster.centroid.position();
            let region = self.history.iter_mut().find(|bucket| {
                let mean = history_mean(bucket.iter());
                mean.is_some_and(|m| is_target_near(&m, &target, distance))
            });
            match region {
                Some(bucket) => {
                    bucket.push(sample);
                }
                None => {
                    let mut bucket = PriorityBuffer::new(HISTORY_CAPACITY);
                    bucket.push(sample);
                    self.history.push(bucket);
                }
            }
        }
    }
    /// Velocity hints for the history regions whose recent mean lies within `distance` of `target`.
    ///
    /// Each hint is the average heading and speed from the older valid samples of a region to its
    /// newest one. A region with a single sample, or whose two newest samples barely moved, yields
    /// a zero hint.
    pub fn find_trajectories(
        &self,
        target: &Point2<f64>,
        now: Timestamp,
        validity_ms: u64,
        distance: f64,
    ) -> Vec<PolarPoint> {
        let mut trajectories = Vec::new();
        for bucket in &self.history {
            let valid: Vec<&HistorySample> = bucket
                .iter()
                .filter(|s| now - s.timestamp <= validity_ms)
                .collect();
            let Some(mean) = history_mean(valid.iter().copied()) else {
                continue;
            };
            if !is_target_near(&mean, target, distance) {
                continue;
            }
            let (newest, older) = match valid.split_last() {
                Some((newest, older)) if !older.is_empty() => (*newest, older),
                _ => {
                    trajectories.push(PolarPoint::default());
                    continue;
                }
            };
            let previous = older[older.len() - 1];
            if newest.position.distance_to(&previous.position) <= MIN_TRAJECTORY_DISPLACEMENT {
                trajectories.push(PolarPoint::default());
                continue;
            }
            let (mut speed_sum, mut sin_sum, mut cos_sum, mut count) = (0.0, 0.0, 0.0, 0usize);
            for sample in older {
                let dt = newest.timestamp.seconds_since(sample.timestamp);
                if dt <= 0.0 {
                    continue;
                }
                let dx = newest.position.x - sample.position.x;
                let dy = newest.position.y - sample.position.y;
                let heading = dy.atan2(dx);
                speed_sum += dx.hypot(dy) / dt;
                sin_sum += heading.sin();
                cos_sum += heading.cos();
                count += 1;
            }
            if count > 0 {
                trajectories.push(PolarPoint::new(
                    normalize_angle(sin_sum.atan2(cos_sum)),
                    speed_sum / count as f64,
                ));
            } else {
                trajectories.push(PolarPoint::default());
            }
        }
        trajectories
    }
    /// Drop history regions whose samples are all older than `validity_ms`.
    pub fn clean_history(&mut self, now: Timestamp, validity_ms: u64) {
        let before = self.history.len();
        self.history
            .retain(|bucket| bucket.iter().any(|s| now - s.timestamp <= validity_ms));
        if self.history.len() != before {
            log::debug!(
                "history cleaned: {} -> {} regions",
                before,
                self.history.len()
            );
        }
    }
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
    pub fn mean(&self) -> Point2<f64> {
        mean_position(&self.particles)
    }
    pub fn sigma(&self) -> Vector2<f64> {
        position_sigma(&self.particles, &self.mean())
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut Vec<Particle> {
        &mut self.particles
    }
    pub fn set_particles(&mut self, particles: Vec<Particle>) {
        self.particles = particles;
    }
    pub fn particle_number(&self) -> usize {
        self.particle_number
    }
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }
    pub fn clusters_mut(&mut self) -> &mut Vec<Cluster> {
        &mut self.clusters
    }
    pub fn set_clusters(&mut self, clusters: Vec<Cluster>) {
        self.clusters = clusters;
    }
    pub fn history(&self) -> &[PriorityBuffer<HistorySample>] {
        &self.history
    }
    pub fn best_particle(&self) -> Option<&Particle> {
        self.best_particle.as_ref()
    }
    pub fn set_best_particle(&mut self, particle: Option<Particle>) {
        self.best_particle = particle;
    }
    pub fn state(&self) -> FilterState {
        self.state
    }
    pub fn set_state(&mut self, state: FilterState) {
        self.state = state;
    }
    pub fn process_noise(&self) -> ProcessNoise {
        self.process_noise
    }
    pub fn sensor_model(&self) -> &BasicSensorModel {
        &self.sensor_model
    }
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

fn perturb<R: Rng + ?Sized>(particle: &mut Particle, noise: &ProcessNoise, rng: &mut R) {
    particle.pose.x += gaussian(rng, noise.position_std);
    particle.pose.y += gaussian(rng, noise.position_std);
    particle.pose.theta = normalize_angle(particle.pose.theta + gaussian(rng, noise.heading_std));
}

fn history_mean<'a, I>(samples: I) -> Option<Point2<f64>>
where
    I: Iterator<Item = &'a HistorySample>,
{
    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0usize);
    for sample in samples {
        sx += sample.position.x;
        sy += sample.position.y;
        n += 1;
    }
    (n > 0).then(|| Point2::new(sx / n as f64, sy / n as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorMap;
    use assert_approx_eq::assert_approx_eq;

    fn test_filter(n: usize, noise: ProcessNoise) -> ParticleFilter {
        let map = SensorMap::new(Point2::new(-5.0, -5.0), Point2::new(5.0, 5.0));
        ParticleFilter::new(n, noise, BasicSensorModel::new(0.5, 0.1, 1.0, map), 3)
    }

    #[test]
    fn systematic_resample_returns_requested_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = vec![0.1, 0.0, 0.7, 0.2];
        for count in [1, 4, 10, 97] {
            assert_eq!(systematic_resample(&weights, count, &mut rng).len(), count);
        }
        let zero = systematic_resample(&[0.0, 0.0, 0.0], 3, &mut rng);
        assert_eq!(zero, vec![0, 1, 2], "zero total keeps the population");
    }
    #[test]
    fn systematic_resample_is_proportional() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = vec![1.0, 3.0];
        let count = 1000;
        let indexes = systematic_resample(&weights, count, &mut rng);
        let heavy = indexes.iter().filter(|&&i| i == 1).count();
        // systematic resampling deviates from the expectation by at most one draw
        assert!((heavy as i64 - 750).abs() <= 1, "heavy particle drawn {} times", heavy);
        assert!(!indexes.is_empty());
    }
    #[test]
    fn normalize_weights_handles_zero_sum() {
        let mut particles = vec![Particle::new(Pose2::default(), 0.0); 4];
        normalize_weights(&mut particles);
        assert!(particles.iter().all(|p| p.weight == 0.25));
        particles[0].weight = 3.0;
        particles[1].weight = 1.0;
        normalize_weights(&mut particles);
        let sum: f64 = particles.iter().map(|p| p.weight).sum();
        assert_approx_eq!(sum, 1.0, 1e-12);
    }
    #[test]
    fn init_uniform_covers_world() {
        let mut filter = test_filter(500, ProcessNoise::default());
        assert_eq!(filter.state(), FilterState::Uninitialized);
        filter.init_from_map();
        assert_eq!(filter.particles().len(), 500);
        assert_eq!(filter.state(), FilterState::Initialized);
        for p in filter.particles() {
            assert!(p.pose.x >= -5.0 && p.pose.x <= 5.0);
            assert!(p.pose.y >= -5.0 && p.pose.y <= 5.0);
            assert!(p.pose.theta >= -PI && p.pose.theta < PI);
            assert_eq!(p.weight, 1.0);
        }
    }
    #[test]
    fn observe_concentrates_particles() {
        let mut filter = test_filter(1000, ProcessNoise::default());
        filter.init_from_map();
        let mut reading = ObjectSensorReading::default();
        reading.set_observations(vec![Observation::at(Point2::new(2.0, 1.0))]);
        assert!(filter.observe(&reading));
        assert_eq!(filter.particles().len(), 1000);
        assert_eq!(filter.state(), FilterState::Running);
        let mean = filter.mean();
        assert!(
            (mean.x - 2.0).abs() < 1.0 && (mean.y - 1.0).abs() < 1.0,
            "mean {:?} should move toward the observation",
            mean
        );
        assert!(!filter.observe(&ObjectSensorReading::default()));
    }
    #[test]
    fn init_from_samples_resamples_to_budget() {
        let mut filter = test_filter(50, ProcessNoise::default());
        let samples = vec![
            Particle::new(Pose2::new(1.0, 0.0, 0.0), 0.0),
            Particle::new(Pose2::new(-2.0, 2.0, 0.0), 1.0),
        ];
        filter.init_from_samples(&samples);
        assert_eq!(filter.particles().len(), 50);
        assert_eq!(filter.state(), FilterState::Initialized);
        assert!(filter.particles().iter().all(|p| p.pose.x == -2.0 && p.weight == 1.0));
    }
    #[test]
    fn egomotion_without_motion_is_identity() {
        let mut filter = test_filter(10, ProcessNoise::default());
        filter.init_from_map();
        let before: Vec<Pose2> = filter.particles().iter().map(|p| p.pose).collect();
        let pose = Pose2::new(1.0, 2.0, 0.3);
        filter.predict(&pose, &pose);
        for (b, a) in before.iter().zip(filter.particles()) {
            assert_approx_eq!(b.x, a.pose.x, 1e-12);
            assert_approx_eq!(b.y, a.pose.y, 1e-12);
        }
    }
    #[test]
    fn egomotion_translates_with_zero_heading() {
        let mut filter = test_filter(1, ProcessNoise::default());
        filter.set_particles(vec![Particle::new(Pose2::new(1.0, 1.0, 0.0), 1.0)]);
        filter.apply_egomotion(&Pose2::new(0.0, 0.0, 0.0), &Pose2::new(0.5, -0.25, 0.0));
        let p = &filter.particles()[0];
        assert_approx_eq!(p.pose.x, 1.5, 1e-12);
        assert_approx_eq!(p.pose.y, 0.75, 1e-12);
    }
    #[test]
    fn history_yields_velocity() {
        let mut filter = test_filter(1, ProcessNoise::default());
        for step in 0..5u64 {
            let x = step as f64 * 0.2;
            filter.set_clusters(vec![Cluster::from_particles(vec![Particle::new(
                Pose2::new(x, 0.0, 0.0),
                1.0,
            )])]);
            filter.update_history(Timestamp::from_millis(step * 200), 3.0);
        }
        assert_eq!(filter.history().len(), 1);
        let now = Timestamp::from_millis(800);
        let trajectories = filter.find_trajectories(&Point2::new(0.5, 0.0), now, 5000, 3.0);
        assert_eq!(trajectories.len(), 1);
        assert_approx_eq!(trajectories[0].rho, 1.0, 1e-9);
        assert_approx_eq!(trajectories[0].theta, 0.0, 1e-9);
    }
    #[test]
    fn single_sample_history_has_zero_velocity() {
        let mut filter = test_filter(1, ProcessNoise::default());
        filter.set_clusters(vec![Cluster::from_particles(vec![Particle::new(
            Pose2::new(1.0, 1.0, 0.0),
            1.0,
        )])]);
        let now = Timestamp::from_millis(10_000);
        filter.update_history(now, 3.0);
        let trajectories = filter.find_trajectories(&Point2::new(1.0, 1.0), now, 5000, 3.0);
        assert_eq!(trajectories, vec![PolarPoint::default()]);
        filter.clean_history(now.add_millis(5001), 5000);
        assert!(filter.history().is_empty());
    }
}
