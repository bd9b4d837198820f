//! Local estimation layer: one particle population tracking every target seen by a robot.
//!
//! An [`ObjectParticleFilter`] does not spend particles on a perception the first time it shows up.
//! A new perception is parked as a [`PendingObservation`] and only promoted into a tracked target
//! once it has been seen again at the same place, after a minimum dwell time and within the promotion
//! window. Promotion injects a fresh sub-population at the target position. Every cycle the population
//! is clustered, each cluster is matched to a stable integer identity, and the identity table is
//! what the robot reports to its teammates.
//!
//! Timestamps are supplied by the caller on every call.
use crate::clustering::{ClusteringAlgorithm, Cluster, Clusterizer};
use crate::config::{TimingParameters, TrackerConfig};
use crate::error::Result;
use crate::particle::{FilterState, Particle, ParticleFilter, sort_by_weight_descending};
use crate::sensor::{AppearanceModel, Estimations, ObjectSensorReading, Observation};
use crate::{PolarPoint, Pose2, Timestamp, extrapolate_position, is_target_near};

use log::{debug, info};
use nalgebra::{Point2, Vector2};
use rand::Rng;
use std::collections::BTreeMap;

/// Predicted speeds (m/s) at or above this are not applied to the particles.
pub const FEASIBLE_LINEAR_VELOCITY: f64 = 5.0;
/// Radius (m) around a cluster centroid in which history regions provide velocity hints.
pub const TRAJECTORY_SEARCH_DISTANCE: f64 = 3.0;
/// Share of the particle budget injected when a new target is promoted.
pub const NEW_TARGET_SHARE: f64 = 0.1;
/// Growth of an identity's sigma on every prediction.
pub const SIGMA_GROWTH_PER_PREDICTION: f64 = 0.01;

/// A perception waiting to be confirmed before it becomes a tracked target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingObservation {
    pub position: Point2<f64>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone)]
pub struct ObjectParticleFilter {
    name: String,
    filter: ParticleFilter,
    clusterizer: Clusterizer,
    algorithm: ClusteringAlgorithm,
    target_number: usize,
    timing: TimingParameters,
    estimations: Estimations,
    estimation_update_time: BTreeMap<i32, Timestamp>,
    target_models: Vec<(AppearanceModel, i32)>,
    pending: Vec<PendingObservation>,
    observations_mapping: Vec<(Point2<f64>, Point2<f64>)>,
    max_identity: i32,
    associated_this_cycle: usize,
    observe_needed: bool,
    last_check: Timestamp,
    last_time_should_be_decreased: Timestamp,
}
impl ObjectParticleFilter {
    pub fn new(config: &TrackerConfig) -> Self {
        let algorithm = config.clustering.algorithm;
        let target_number = config.clustering.target_number;
        ObjectParticleFilter {
            name: config.parameters.filter_name.clone(),
            filter: ParticleFilter::new(
                config.parameters.particle_number,
                config.process_noise(),
                config.sensor_model(),
                config.parameters.seed,
            ),
            clusterizer: Clusterizer::new(algorithm, target_number),
            algorithm,
            target_number,
            timing: config.timing.clone(),
            estimations: Estimations::new(),
            estimation_update_time: BTreeMap::new(),
            target_models: Vec::new(),
            pending: Vec::new(),
            observations_mapping: Vec::new(),
            max_identity: 0,
            associated_this_cycle: 0,
            observe_needed: false,
            last_check: Timestamp::default(),
            last_time_should_be_decreased: Timestamp::default(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn init_from_uniform(&mut self) {
        self.filter.init_from_uniform();
    }
    /// Run one correction cycle.
    ///
    /// Observations that are neither near a tracked target nor promoted this cycle are removed from
    /// `readings`. When nothing is associated the weights are left alone and the filter free-runs on
    /// prediction.
    pub fn observe(&mut self, readings: &mut ObjectSensorReading, now: Timestamp) {
        self.observations_mapping.clear();
        self.check_reinitialization();
        self.add_particles_in_interesting_points(readings, now);
        if !self.observe_needed {
            self.clusterizer.set_max_cluster_number(1);
            self.evict_stale_identities(&[], now);
            return;
        }
        self.filter.reset_weight();
        self.filter.weigh(readings.observations());
        self.filter.update_best_particle();
        let budget = self.filter.particle_number();
        let particles = self.filter.particles_mut();
        sort_by_weight_descending(particles);
        particles.truncate(budget);

        self.adapt_cluster_number(now);
        let threshold = self.timing.closeness_threshold;
        self.clusterizer.clusterize(self.filter.particles(), threshold);
        self.filter.set_clusters(self.clusterizer.clusters().to_vec());
        self.update_target_identity(readings, now);
        self.filter.normalize_cluster_weights();
        self.filter.update_history(now, threshold);
        self.filter.resample_clusters();
        self.filter.set_state(FilterState::Running);
    }
    /// Propagate the population to `current`.
    ///
    /// Each cluster contributes an equal share of its particles, moved along a velocity hint from the
    /// history when `target_seen` is set, and perturbed with the process noise. The population is then
    /// compensated for the robot motion from `old_pose` to `new_pose`.
    pub fn predict(
        &mut self,
        new_pose: &Pose2,
        old_pose: &Pose2,
        target_seen: bool,
        initial: Timestamp,
        current: Timestamp,
    ) {
        let validity = self.timing.history_validity_ms;
        if current - self.last_check > self.timing.history_clean_interval_ms {
            self.filter.clean_history(current, validity);
            self.last_check = current;
        }
        let clusters: Vec<Cluster> = self.filter.clusters().to_vec();
        if !clusters.is_empty() {
            let budget = self.filter.particle_number();
            let share = budget / clusters.len();
            let dt = current.seconds_since(initial);
            let mut particles = Vec::with_capacity(budget);
            for cluster in &clusters {
                let mut trajectory = PolarPoint::default();
                if target_seen {
                    let trajectories = self.filter.find_trajectories(
                        &cluster.centroid.position(),
                        current,
                        validity,
                        TRAJECTORY_SEARCH_DISTANCE,
                    );
                    if !trajectories.is_empty() {
                        let pick = self.filter.rng_mut().random_range(0..trajectories.len());
                        trajectory = trajectories[pick];
                    }
                }
                for particle in cluster.particles.iter().take(share) {
                    let mut moved = particle.clone();
                    if trajectory.rho < FEASIBLE_LINEAR_VELOCITY {
                        let position = extrapolate_position(&moved.position(), &trajectory, dt);
                        moved.pose.x = position.x;
                        moved.pose.y = position.y;
                    }
                    self.filter.perturb(&mut moved);
                    particles.push(moved);
                }
            }
            let produced = particles.len();
            if produced > 0 {
                for j in 0..budget.saturating_sub(produced) {
                    let copy = particles[j % produced].clone();
                    particles.push(copy);
                }
            }
            self.filter.set_particles(particles);
        }
        self.filter.apply_egomotion(old_pose, new_pose);
        let growth = Vector2::new(SIGMA_GROWTH_PER_PREDICTION, SIGMA_GROWTH_PER_PREDICTION);
        for estimate in self.estimations.values_mut() {
            estimate.sigma += growth;
        }
    }

    fn check_reinitialization(&mut self) {
        let threshold = self.timing.reinit_sigma_threshold;
        let clusters = self.filter.clusters();
        if clusters.is_empty() || !clusters.iter().all(|c| c.sigma().norm() >= threshold) {
            return;
        }
        info!(
            "{}: every cluster spread beyond {} m, reinitializing",
            self.name, threshold
        );
        self.pending.clear();
        self.filter.set_clusters(Vec::new());
        self.filter.clear_history();
        self.estimations.clear();
        self.estimation_update_time.clear();
        self.clusterizer = Clusterizer::new(self.algorithm, self.target_number);
    }

    fn add_particles_in_interesting_points(
        &mut self,
        readings: &mut ObjectSensorReading,
        now: Timestamp,
    ) {
        self.associated_this_cycle = 0;
        self.observe_needed = false;
        let closeness = self.timing.closeness_threshold;
        let window = self.timing.promotion_window_ms;
        let min_dwell = self.timing.min_dwell_ms;
        self.pending.retain(|p| now - p.last_seen <= window);

        let observations = std::mem::take(readings.observations_mut());
        let mut grounded = Vec::with_capacity(observations.len());
        for observation in observations {
            let position = observation.position();
            let near_cluster = self
                .filter
                .clusters()
                .iter()
                .map(|c| c.centroid.position())
                .find(|centroid| is_target_near(&position, centroid, closeness));
            let associated = if let Some(centroid) = near_cluster {
                self.observations_mapping.push((position, centroid));
                self.associated_this_cycle += 1;
                true
            } else {
                let near_pending = self
                    .pending
                    .iter()
                    .position(|p| is_target_near(&p.position, &position, closeness));
                match near_pending {
                    Some(i) => {
                        let pending = self.pending[i];
                        let dwelled = now - pending.first_seen > min_dwell;
                        if dwelled && now - pending.last_seen <= window {
                            self.pending.remove(i);
                            self.promote(&position);
                            true
                        } else {
                            self.pending[i].position = position;
                            self.pending[i].last_seen = now;
                            false
                        }
                    }
                    None => {
                        debug!("{}: new pending observation at {:?}", self.name, position);
                        self.pending.push(PendingObservation {
                            position,
                            first_seen: now,
                            last_seen: now,
                        });
                        false
                    }
                }
            };
            if associated {
                self.observe_needed = true;
                grounded.push(observation);
            }
        }
        readings.set_observations(grounded);
    }

    /// Inject a sub-population at `position`. The very first target takes the whole budget.
    fn promote(&mut self, position: &Point2<f64>) {
        let first_target = self.associated_this_cycle == 0 && self.filter.clusters().is_empty();
        let budget = self.filter.particle_number();
        let count = if first_target {
            budget
        } else {
            ((budget as f64 * NEW_TARGET_SHARE) as usize).max(1)
        };
        if first_target {
            self.filter.particles_mut().clear();
        }
        info!(
            "{}: promoting observation at ({:.2}, {:.2}) with {} particles",
            self.name, position.x, position.y, count
        );
        for _ in 0..count {
            let mut particle = Particle::new(Pose2::from_position(*position), 1.0);
            self.filter.perturb(&mut particle);
            self.filter.particles_mut().push(particle);
        }
        self.associated_this_cycle += 1;
    }

    fn adapt_cluster_number(&mut self, now: Timestamp) {
        let Ok(current) = self.clusterizer.current_cluster_number() else {
            return;
        };
        let clusters = self.filter.clusters().len();
        if self.associated_this_cycle > 0 && self.associated_this_cycle >= clusters {
            self.clusterizer
                .set_max_cluster_number(self.associated_this_cycle);
            self.last_time_should_be_decreased = now;
        } else if now - self.last_time_should_be_decreased > self.timing.promotion_window_ms {
            self.clusterizer
                .set_max_cluster_number(current.saturating_sub(1).max(1));
            self.last_time_should_be_decreased = now;
        }
    }

    fn update_target_identity(&mut self, readings: &ObjectSensorReading, now: Timestamp) {
        let closeness = self.timing.closeness_threshold;
        let mut observations: Vec<Observation> = readings.observations().to_vec();
        let mut claimed: Vec<i32> = Vec::new();
        for cluster in self.filter.clusters() {
            let centroid = cluster.centroid.position();
            let nearest_identity = self
                .estimations
                .iter()
                .filter(|(id, _)| !claimed.contains(*id))
                .map(|(id, e)| (*id, nalgebra::distance(&e.position(), &centroid)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((identity, distance)) = nearest_identity {
                if distance < closeness {
                    if let Some(estimate) = self.estimations.get_mut(&identity) {
                        estimate.set_position(centroid);
                        estimate.sigma = cluster.sigma();
                    }
                    self.estimation_update_time.insert(identity, now);
                    claimed.push(identity);
                    continue;
                }
            }
            let nearest_observation = observations
                .iter()
                .enumerate()
                .map(|(i, o)| (i, nalgebra::distance(&o.position(), &centroid)))
                .filter(|(_, d)| *d < closeness)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            let Some((index, _)) = nearest_observation else {
                continue;
            };
            let observation = observations.remove(index);
            let known = self
                .target_models
                .iter()
                .find(|(model, _)| model.is_similar_to(&observation.model))
                .copied();
            let (model, identity) = match known {
                Some(entry) => entry,
                None => {
                    self.max_identity += 1;
                    self.target_models
                        .push((observation.model, self.max_identity));
                    (observation.model, self.max_identity)
                }
            };
            if claimed.contains(&identity) {
                continue;
            }
            debug!(
                "{}: identity {} assigned at ({:.2}, {:.2})",
                self.name, identity, centroid.x, centroid.y
            );
            self.estimations.insert(
                identity,
                Observation::new(
                    PolarPoint::from_cartesian(centroid),
                    cluster.sigma(),
                    model,
                ),
            );
            self.estimation_update_time.insert(identity, now);
            claimed.push(identity);
        }
        self.evict_stale_identities(&claimed, now);
    }

    fn evict_stale_identities(&mut self, claimed: &[i32], now: Timestamp) {
        let timeout = self.timing.deletion_timeout_ms;
        let update_time = &self.estimation_update_time;
        let stale: Vec<i32> = self
            .estimations
            .keys()
            .filter(|id| !claimed.contains(*id))
            .filter(|id| update_time.get(*id).is_none_or(|t| now - *t > timeout))
            .copied()
            .collect();
        for identity in stale {
            debug!("{}: identity {} evicted", self.name, identity);
            self.estimations.remove(&identity);
            self.estimation_update_time.remove(&identity);
        }
    }

    /// Identity-tagged estimates currently tracked.
    pub fn estimations(&self) -> &Estimations {
        &self.estimations
    }
    pub fn particles(&self) -> &[Particle] {
        self.filter.particles()
    }
    pub fn clusters(&self) -> &[Cluster] {
        self.filter.clusters()
    }
    pub fn pending_observations(&self) -> &[PendingObservation] {
        &self.pending
    }
    /// (observation, cluster centroid) pairs associated during the last cycle.
    pub fn observations_mapping(&self) -> &[(Point2<f64>, Point2<f64>)] {
        &self.observations_mapping
    }
    pub fn current_cluster_number(&self) -> Result<usize> {
        self.clusterizer.current_cluster_number()
    }
    pub fn target_models(&self) -> &[(AppearanceModel, i32)] {
        &self.target_models
    }
    pub fn filter(&self) -> &ParticleFilter {
        &self.filter
    }
    pub fn state(&self) -> FilterState {
        self.filter.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn config() -> TrackerConfig {
        let mut cfg = TrackerConfig::default();
        cfg.parameters.particle_number = 200;
        cfg.parameters.sr0 = 0.05;
        cfg.parameters.st0 = 0.05;
        cfg
    }

    fn reading_at(points: &[(f64, f64)]) -> ObjectSensorReading {
        let mut reading = ObjectSensorReading::new("ObjectParticleFilter");
        reading.set_observations(
            points
                .iter()
                .map(|&(x, y)| Observation::at(Point2::new(x, y)))
                .collect(),
        );
        reading
    }

    #[test]
    fn first_sighting_only_creates_pending() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        let mut reading = reading_at(&[(1.0, 1.0)]);
        filter.observe(&mut reading, Timestamp::from_millis(10_000));
        assert_eq!(filter.pending_observations().len(), 1);
        assert!(filter.clusters().is_empty());
        assert!(filter.estimations().is_empty());
        assert!(reading.observations().is_empty(), "ungrounded observation removed");
        assert_eq!(filter.current_cluster_number().ok(), Some(1));
    }
    #[test]
    fn too_early_second_sighting_refreshes_pending() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_000));
        filter.observe(&mut reading_at(&[(1.1, 1.0)]), Timestamp::from_millis(10_200));
        assert!(filter.clusters().is_empty());
        let pending = filter.pending_observations()[0];
        assert_eq!(pending.first_seen, Timestamp::from_millis(10_000));
        assert_eq!(pending.last_seen, Timestamp::from_millis(10_200));
        assert_approx_eq!(pending.position.x, 1.1);
    }
    #[test]
    fn promotion_creates_identity() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_000));
        let mut reading = reading_at(&[(1.0, 1.0)]);
        filter.observe(&mut reading, Timestamp::from_millis(10_600));
        assert!(filter.pending_observations().is_empty());
        assert_eq!(reading.observations().len(), 1);
        assert_eq!(filter.clusters().len(), 1);
        let centroid = filter.clusters()[0].centroid;
        assert_approx_eq!(centroid.x, 1.0, 0.1);
        assert_approx_eq!(centroid.y, 1.0, 0.1);
        assert_eq!(filter.estimations().len(), 1);
        assert!(filter.estimations().contains_key(&1));
        assert_eq!(filter.state(), FilterState::Running);
    }
    #[test]
    fn silent_identity_outlives_deletion_timeout_by_one_millisecond() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_000));
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_600));
        assert!(filter.estimations().contains_key(&1));

        filter.observe(&mut reading_at(&[]), Timestamp::from_millis(10_800));
        assert!(filter.estimations().contains_key(&1), "evicted within the timeout");
        filter.observe(&mut reading_at(&[]), Timestamp::from_millis(10_900));
        assert!(filter.estimations().contains_key(&1), "evicted at the timeout");
        filter.observe(&mut reading_at(&[]), Timestamp::from_millis(10_901));
        assert!(filter.estimations().is_empty());
    }
    #[test]
    fn reused_identity_keeps_stored_appearance() {
        let colored = |color: [i32; 3]| {
            let mut reading = reading_at(&[(1.0, 1.0)]);
            reading.observations_mut()[0].model = AppearanceModel {
                color,
                ..Default::default()
            };
            reading
        };
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut colored([100, 50, 20]), Timestamp::from_millis(10_000));
        filter.observe(&mut colored([100, 50, 20]), Timestamp::from_millis(10_600));
        filter.observe(&mut reading_at(&[]), Timestamp::from_millis(11_000));
        assert!(filter.estimations().is_empty());

        filter.observe(&mut colored([103, 50, 20]), Timestamp::from_millis(11_100));
        assert_eq!(filter.estimations()[&1].model.color, [100, 50, 20]);
        assert_eq!(filter.target_models().len(), 1);
    }
    #[test]
    fn stale_pending_is_dropped() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_000));
        filter.observe(&mut reading_at(&[]), Timestamp::from_millis(11_500));
        assert!(filter.pending_observations().is_empty());
    }
    #[test]
    fn predict_keeps_budget_and_grows_sigma() {
        let mut filter = ObjectParticleFilter::new(&config());
        filter.init_from_uniform();
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_000));
        filter.observe(&mut reading_at(&[(1.0, 1.0)]), Timestamp::from_millis(10_600));
        let sigma_before = filter.estimations()[&1].sigma;
        let pose = Pose2::default();
        filter.predict(
            &pose,
            &pose,
            true,
            Timestamp::from_millis(10_600),
            Timestamp::from_millis(10_700),
        );
        assert_eq!(filter.particles().len(), 200);
        let sigma_after = filter.estimations()[&1].sigma;
        assert_approx_eq!(sigma_after.x - sigma_before.x, SIGMA_GROWTH_PER_PREDICTION, 1e-12);
    }
}
