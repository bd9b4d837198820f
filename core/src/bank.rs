//! Bank-of-filters tracker: one independent particle filter per believed target.
//!
//! [`MultiObjectParticleFilter`] keeps a dynamic set of [`ParticleFilter`]s. A filter whose population
//! splits into well separated clusters hands the extra clusters to new filters; an observation far
//! from every filter spawns a new one; two filters whose clusters keep overlapping are merged; filters
//! that stop receiving observations are dropped. An overlap matrix records, for every pair of filters,
//! how many consecutive times their clusters coincided and when that last happened.
use crate::clustering::{Cluster, Clusterizer};
use crate::config::{TimingParameters, TrackerConfig};
use crate::particle::{Particle, ParticleFilter, ProcessNoise, sort_by_weight_descending};
use crate::sensor::{BasicSensorModel, ObjectSensorReading, Observation};
use crate::{Pose2, Timestamp, extrapolate_position, is_target_near};

use log::{debug, info};
use rand::Rng;
use std::collections::BTreeSet;

/// Observations within this distance (m) of a filter mean are routed to that filter.
pub const NEAR_OBSERVATION_DISTANCE: f64 = 3.0;
/// Clusters farther than this (m) from the primary cluster of a filter become filters of their own.
pub const SPLIT_DISTANCE: f64 = 0.5;
/// Clusters of two filters closer than this (m) overlap.
pub const MERGE_DISTANCE: f64 = 1.5;
/// Radius (m) of a history region.
pub const HISTORY_DISTANCE: f64 = 3.0;
/// Predicted speeds (m/s) at or above this are ignored.
pub const MAX_FEASIBLE_LINEAR_VELOCITY: f64 = 1.0;

/// How many consecutive times the clusters of two filters overlapped, and when they last did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverlapState {
    pub count: u32,
    pub last_overlap: Timestamp,
}

#[derive(Clone, Debug)]
pub struct FilterEntry {
    pub filter: ParticleFilter,
    pub last_active: Timestamp,
}

#[derive(Clone, Debug)]
pub struct MultiObjectParticleFilter {
    name: String,
    entries: Vec<FilterEntry>,
    merge_matrix: Vec<Vec<OverlapState>>,
    clusterizer: Clusterizer,
    pool: ParticleFilter,
    particle_number: usize,
    process_noise: ProcessNoise,
    sensor_model: BasicSensorModel,
    seed: u64,
    spawned: u64,
    timing: TimingParameters,
    min_element_significant_cluster: usize,
    max_time_passed_from_last_overlap: u64,
    overlap_threshold: u32,
    last_check: Timestamp,
}
impl MultiObjectParticleFilter {
    /// A bank holding a single filter spread over the whole world.
    pub fn new(config: &TrackerConfig, now: Timestamp) -> Self {
        let sensor_model = config.sensor_model();
        let mut bank = MultiObjectParticleFilter {
            name: config.parameters.filter_name.clone(),
            entries: Vec::new(),
            merge_matrix: Vec::new(),
            clusterizer: Clusterizer::new(
                config.clustering.algorithm,
                config.clustering.target_number,
            ),
            pool: ParticleFilter::new(
                config.parameters.particle_number,
                config.process_noise(),
                sensor_model.clone(),
                config.parameters.seed,
            ),
            particle_number: config.parameters.particle_number,
            process_noise: config.process_noise(),
            sensor_model,
            seed: config.parameters.seed,
            spawned: 0,
            timing: config.timing.clone(),
            min_element_significant_cluster: config.clustering.min_element_significant_cluster,
            max_time_passed_from_last_overlap: config.clustering.max_time_passed_from_last_overlap,
            overlap_threshold: config.clustering.overlap_threshold,
            last_check: now,
        };
        bank.init(now);
        bank
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Spread every filter of the bank uniformly over the world again.
    pub fn init_from_uniform(&mut self) {
        for entry in &mut self.entries {
            entry.filter.init_from_uniform();
        }
    }

    fn make_filter(&mut self) -> ParticleFilter {
        let seed = self.seed.wrapping_add(self.spawned).wrapping_add(1);
        self.spawned += 1;
        ParticleFilter::new(
            self.particle_number,
            self.process_noise,
            self.sensor_model.clone(),
            seed,
        )
    }
    fn init(&mut self, now: Timestamp) {
        let mut filter = self.make_filter();
        filter.init_from_uniform();
        self.push_entry(filter, now);
    }
    fn spawn(&mut self, particles: Vec<Particle>, clusters: Vec<Cluster>, now: Timestamp) {
        let mut filter = self.make_filter();
        filter.set_particles(particles);
        filter.set_clusters(clusters);
        self.push_entry(filter, now);
        debug!("{}: bank now holds {} filters", self.name, self.entries.len());
    }
    fn push_entry(&mut self, filter: ParticleFilter, now: Timestamp) {
        self.entries.push(FilterEntry {
            filter,
            last_active: now,
        });
        for row in &mut self.merge_matrix {
            row.push(OverlapState::default());
        }
        self.merge_matrix
            .push(vec![OverlapState::default(); self.entries.len()]);
    }
    fn remove_filters(&mut self, to_delete: &BTreeSet<usize>) {
        if to_delete.is_empty() {
            return;
        }
        let keep = |i: &usize| !to_delete.contains(i);
        self.entries = std::mem::take(&mut self.entries)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep(i))
            .map(|(_, e)| e)
            .collect();
        self.merge_matrix = std::mem::take(&mut self.merge_matrix)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep(i))
            .map(|(_, row)| {
                row.into_iter()
                    .enumerate()
                    .filter(|(j, _)| keep(j))
                    .map(|(_, state)| state)
                    .collect()
            })
            .collect();
    }

    /// Drop filters inactive for longer than the filter validity window.
    pub fn clean(&mut self, now: Timestamp) {
        let validity = self.timing.filter_validity_ms;
        let stale: BTreeSet<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| now - e.last_active > validity)
            .map(|(i, _)| i)
            .collect();
        if !stale.is_empty() {
            info!("{}: removing {} inactive filters", self.name, stale.len());
        }
        self.remove_filters(&stale);
        if self.entries.is_empty() {
            self.init(now);
        }
    }

    pub fn observe(&mut self, readings: &ObjectSensorReading, now: Timestamp) {
        let observations = readings.observations();
        if observations.is_empty() {
            return;
        }
        let mut associated = BTreeSet::new();
        let size = self.entries.len();
        for i in 0..size {
            let nearest: Vec<Observation> = if size == 1 {
                observations.to_vec()
            } else {
                let mean = self.entries[i].filter.mean();
                observations
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| {
                        is_target_near(&mean, &o.position(), NEAR_OBSERVATION_DISTANCE)
                    })
                    .map(|(k, o)| {
                        associated.insert(k);
                        *o
                    })
                    .collect()
            };
            if nearest.is_empty() {
                continue;
            }
            let mut reading = ObjectSensorReading::new(readings.sensor_name());
            reading.set_agent_pose(readings.agent_pose());
            reading.set_observations(nearest);
            let entry = &mut self.entries[i];
            entry.last_active = now;
            entry.filter.observe(&reading);
            let quality_threshold = (1.0 + entry.filter.sigma().norm()).sqrt() + 0.02;
            self.clusterizer
                .clusterize(entry.filter.particles(), quality_threshold);
            let clusters = self.clusterizer.clusters().to_vec();
            if clusters.len() > 1 {
                self.split(i, clusters, now);
            } else {
                self.entries[i].filter.set_clusters(clusters);
            }
        }
        for (k, observation) in observations.iter().enumerate() {
            let position = observation.position();
            if associated.contains(&k) || self.is_there_already_near_filter(&position) {
                continue;
            }
            info!(
                "{}: spawning filter at ({:.2}, {:.2})",
                self.name, position.x, position.y
            );
            let particles =
                vec![Particle::new(Pose2::from_position(position), 1.0); self.particle_number];
            let cluster = Cluster::from_particles(particles.clone());
            self.spawn(particles, vec![cluster], now);
        }
        self.merge(now);
        let clusters = self.clusters();
        self.pool.set_clusters(clusters);
        self.pool.update_history(now, HISTORY_DISTANCE);
    }

    /// Hand the clusters far from the primary (first) cluster of filter `index` to new filters.
    fn split(&mut self, index: usize, clusters: Vec<Cluster>, now: Timestamp) {
        let primary = clusters[0].centroid.position();
        let mut kept = Vec::new();
        let mut far = Vec::new();
        for (k, cluster) in clusters.into_iter().enumerate() {
            if k == 0 || is_target_near(&primary, &cluster.centroid.position(), SPLIT_DISTANCE) {
                kept.push(cluster);
            } else {
                far.push(cluster);
            }
        }
        if !far.is_empty() {
            let particles: Vec<Particle> = kept
                .iter()
                .flat_map(|c| c.particles.iter().cloned())
                .collect();
            self.entries[index].filter.set_particles(particles);
        }
        self.entries[index].filter.set_clusters(kept);
        for cluster in far {
            info!(
                "{}: splitting cluster at ({:.2}, {:.2}) into a new filter",
                self.name, cluster.centroid.x, cluster.centroid.y
            );
            self.spawn(cluster.particles.clone(), vec![cluster], now);
        }
    }

    /// Count overlaps between clusters of different filters and merge filters that overlap often
    /// enough; the later filter is absorbed by the earlier one.
    pub fn merge(&mut self, now: Timestamp) {
        let n = self.entries.len();
        let mut explored: Vec<Vec<bool>> = self
            .entries
            .iter()
            .map(|e| vec![false; e.filter.clusters().len()])
            .collect();
        let mut to_delete = BTreeSet::new();
        for f1 in 0..n {
            if to_delete.contains(&f1) {
                continue;
            }
            let own = self.entries[f1].filter.clusters().to_vec();
            let mut new_clusters = Vec::with_capacity(own.len());
            let mut absorbed = false;
            for (k1, c1) in own.iter().enumerate() {
                if explored[f1][k1] {
                    continue;
                }
                explored[f1][k1] = true;
                let mut part = c1.particles.clone();
                for f2 in (f1 + 1)..n {
                    if to_delete.contains(&f2) {
                        continue;
                    }
                    for (k2, c2) in self.entries[f2].filter.clusters().iter().enumerate() {
                        if explored[f2][k2]
                            || !is_target_near(
                                &c1.centroid.position(),
                                &c2.centroid.position(),
                                MERGE_DISTANCE,
                            )
                        {
                            continue;
                        }
                        let mut state = self.merge_matrix[f1][f2];
                        if now - state.last_overlap < self.max_time_passed_from_last_overlap {
                            state.count += 1;
                        } else {
                            state.count = 1;
                        }
                        state.last_overlap = now;
                        self.merge_matrix[f1][f2] = state;
                        self.merge_matrix[f2][f1] = state;
                        if state.count > self.overlap_threshold {
                            explored[f2][k2] = true;
                            to_delete.insert(f2);
                            part.extend(c2.particles.iter().cloned());
                            absorbed = true;
                            info!("{}: merging filter {} into filter {}", self.name, f2, f1);
                        }
                    }
                }
                new_clusters.push(Cluster::from_particles(part));
            }
            if absorbed {
                let mut particles: Vec<Particle> = new_clusters
                    .iter()
                    .flat_map(|c| c.particles.iter().cloned())
                    .collect();
                sort_by_weight_descending(&mut particles);
                particles.truncate(self.particle_number);
                let filter = &mut self.entries[f1].filter;
                filter.set_particles(particles);
                filter.set_clusters(new_clusters);
            }
        }
        self.remove_filters(&to_delete);
        if self.entries.is_empty() {
            self.init(now);
        }
    }

    /// Propagate every filter and collect an equal share of each filter's best particles.
    pub fn predict(&mut self, target_seen: bool, initial: Timestamp, current: Timestamp) {
        let validity = self.timing.history_validity_ms;
        if current - self.last_check > self.timing.history_clean_interval_ms {
            self.clean(current);
            self.pool.clean_history(current, validity);
            self.last_check = current;
        }
        let share = self.particle_number / self.entries.len().max(1);
        let dt = current.seconds_since(initial);
        let mut pool = Vec::with_capacity(self.particle_number);
        for i in 0..self.entries.len() {
            let old = Pose2::from_position(self.entries[i].filter.mean());
            let mut new = old;
            if target_seen {
                let trajectories =
                    self.pool
                        .find_trajectories(&old.position(), current, validity, HISTORY_DISTANCE);
                if !trajectories.is_empty() {
                    let pick = self.pool.rng_mut().random_range(0..trajectories.len());
                    let trajectory = trajectories[pick];
                    if trajectory.rho < MAX_FEASIBLE_LINEAR_VELOCITY {
                        new = Pose2::from_position(extrapolate_position(
                            &old.position(),
                            &trajectory,
                            dt,
                        ));
                    }
                }
            }
            let filter = &mut self.entries[i].filter;
            filter.predict(&old, &new);
            let mut best = filter.particles().to_vec();
            sort_by_weight_descending(&mut best);
            pool.extend(best.into_iter().take(share));
        }
        self.pool.set_particles(pool);
    }

    fn is_there_already_near_filter(&self, position: &nalgebra::Point2<f64>) -> bool {
        self.entries.iter().any(|e| {
            e.filter
                .clusters()
                .iter()
                .any(|c| is_target_near(position, &c.centroid.position(), SPLIT_DISTANCE))
        })
    }

    /// Clusters of every filter in the bank.
    pub fn clusters(&self) -> Vec<Cluster> {
        self.entries
            .iter()
            .flat_map(|e| e.filter.clusters().iter().cloned())
            .collect()
    }
    /// Clusters holding more than the configured minimum number of particles.
    pub fn significant_clusters(&self) -> Vec<Cluster> {
        self.entries
            .iter()
            .flat_map(|e| e.filter.clusters().iter())
            .filter(|c| c.len() > self.min_element_significant_cluster)
            .cloned()
            .collect()
    }
    /// Combined particle pool produced by the last prediction.
    pub fn particles(&self) -> &[Particle] {
        self.pool.particles()
    }
    pub fn filter_count(&self) -> usize {
        self.entries.len()
    }
    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }
    pub fn overlap(&self, i: usize, j: usize) -> Option<OverlapState> {
        self.merge_matrix.get(i).and_then(|row| row.get(j)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusteringAlgorithm;
    use nalgebra::Point2;

    fn config() -> TrackerConfig {
        let mut cfg = TrackerConfig::default();
        cfg.parameters.particle_number = 500;
        cfg.sensor_model.sigma_rho = 0.2;
        cfg.clustering.algorithm = ClusteringAlgorithm::QtClusterizer;
        cfg
    }

    fn square(center: (f64, f64), n: usize) -> Vec<Particle> {
        (0..n)
            .map(|i| {
                let offset = (i % 5) as f64 * 0.02;
                Particle::new(Pose2::new(center.0 + offset, center.1 - offset, 0.0), 1.0)
            })
            .collect()
    }

    #[test]
    fn starts_with_one_uniform_filter() {
        let bank = MultiObjectParticleFilter::new(&config(), Timestamp::from_millis(0));
        assert_eq!(bank.filter_count(), 1);
        assert_eq!(bank.entries()[0].filter.particles().len(), 500);
        assert_eq!(bank.overlap(0, 0), Some(OverlapState::default()));
    }
    #[test]
    fn separated_observations_get_their_own_filters() {
        let mut bank = MultiObjectParticleFilter::new(&config(), Timestamp::from_millis(0));
        let mut reading = ObjectSensorReading::new("bank");
        reading.set_observations(vec![
            Observation::at(Point2::new(-3.0, 0.0)),
            Observation::at(Point2::new(3.0, 0.0)),
        ]);
        bank.observe(&reading, Timestamp::from_millis(100));
        assert!(bank.filter_count() >= 2, "got {} filters", bank.filter_count());
        let clusters = bank.clusters();
        for target in [Point2::new(-3.0, 0.0), Point2::new(3.0, 0.0)] {
            assert!(
                clusters
                    .iter()
                    .any(|c| is_target_near(&c.centroid.position(), &target, 1.0)),
                "no cluster near {:?}",
                target
            );
        }
        let n = bank.filter_count();
        assert_eq!(bank.merge_matrix.len(), n);
        assert!(bank.merge_matrix.iter().all(|row| row.len() == n));
    }
    #[test]
    fn overlapping_filters_merge_after_threshold() {
        let mut cfg = config();
        cfg.clustering.overlap_threshold = 1;
        let mut bank = MultiObjectParticleFilter::new(&cfg, Timestamp::from_millis(0));
        let a = square((0.0, 0.0), 20);
        let b = square((1.0, 0.0), 20);
        bank.spawn(a.clone(), vec![Cluster::from_particles(a)], Timestamp::from_millis(0));
        bank.spawn(b.clone(), vec![Cluster::from_particles(b)], Timestamp::from_millis(0));
        assert_eq!(bank.filter_count(), 3);

        bank.merge(Timestamp::from_millis(5_000));
        assert_eq!(bank.filter_count(), 3, "first overlap only counts");
        assert_eq!(bank.overlap(1, 2).map(|s| s.count), Some(1));
        assert_eq!(bank.overlap(2, 1).map(|s| s.count), Some(1));

        bank.merge(Timestamp::from_millis(5_100));
        assert_eq!(bank.filter_count(), 2);
        let merged = &bank.entries()[1].filter;
        assert_eq!(merged.particles().len(), 40);
        assert_eq!(merged.clusters().len(), 1);
        assert_eq!(bank.merge_matrix.len(), 2);
    }
    #[test]
    fn overlap_count_restarts_after_quiet_period() {
        let mut bank = MultiObjectParticleFilter::new(&config(), Timestamp::from_millis(0));
        let a = square((0.0, 0.0), 5);
        let b = square((0.5, 0.5), 5);
        bank.spawn(a.clone(), vec![Cluster::from_particles(a)], Timestamp::from_millis(0));
        bank.spawn(b.clone(), vec![Cluster::from_particles(b)], Timestamp::from_millis(0));
        bank.merge(Timestamp::from_millis(10_000));
        bank.merge(Timestamp::from_millis(10_500));
        assert_eq!(bank.overlap(1, 2).map(|s| s.count), Some(2));
        bank.merge(Timestamp::from_millis(12_000));
        assert_eq!(bank.overlap(1, 2).map(|s| s.count), Some(1));
    }
    #[test]
    fn inactive_filters_are_cleaned() {
        let mut bank = MultiObjectParticleFilter::new(&config(), Timestamp::from_millis(0));
        bank.predict(false, Timestamp::from_millis(5_900), Timestamp::from_millis(6_000));
        assert_eq!(bank.filter_count(), 1);
        assert_eq!(bank.entries()[0].last_active, Timestamp::from_millis(6_000));
        assert_eq!(bank.particles().len(), 500);
    }
    #[test]
    fn significant_clusters_filter_small_ones() {
        let mut bank = MultiObjectParticleFilter::new(&config(), Timestamp::from_millis(0));
        let small = square((2.0, 2.0), 5);
        let large = square((-2.0, -2.0), 50);
        bank.spawn(small.clone(), vec![Cluster::from_particles(small)], Timestamp::from_millis(0));
        bank.spawn(large.clone(), vec![Cluster::from_particles(large)], Timestamp::from_millis(0));
        assert_eq!(bank.clusters().len(), 2);
        let significant = bank.significant_clusters();
        assert_eq!(significant.len(), 1);
        assert_eq!(significant[0].len(), 50);
    }
}
