//! Clustering of particle populations into target hypotheses.
//!
//! Two strategies are available behind the [`Clusterizer`] type:
//!
//! - [`KClusterizer`] seeds at most `k` clusters with the heaviest well-separated particles and
//!   attaches every other particle to a seed. The number of clusters it may produce is adjusted at
//!   run time by the owning filter.
//! - [`QtClusterizer`] (quality threshold) repeatedly extracts the largest group of particles that
//!   lie close to one member, without any bound on the number of clusters.
//!
//! Every strategy partitions its input: each particle ends up in exactly one cluster.
use crate::buffer::PriorityBuffer;
use crate::error::{Result, TrackingError};
use crate::particle::Particle;
use crate::{Pose2, centroid, mean_position, position_sigma};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// A group of particles believed to describe the same target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    pub particles: Vec<Particle>,
    pub centroid: Pose2,
}
impl Cluster {
    pub fn from_particles(particles: Vec<Particle>) -> Self {
        let centroid = centroid(&particles);
        Cluster {
            particles,
            centroid,
        }
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn sigma(&self) -> Vector2<f64> {
        position_sigma(&self.particles, &mean_position(&self.particles))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusteringAlgorithm {
    #[default]
    #[serde(rename = "KClusterizer", alias = "kclusterizer")]
    KClusterizer,
    #[serde(rename = "QTClusterizer", alias = "qtclusterizer")]
    QtClusterizer,
}

const ALGORITHMS: &[(&str, ClusteringAlgorithm)] = &[
    ("kclusterizer", ClusteringAlgorithm::KClusterizer),
    ("qtclusterizer", ClusteringAlgorithm::QtClusterizer),
];

impl FromStr for ClusteringAlgorithm {
    type Err = TrackingError;
    fn from_str(name: &str) -> Result<Self> {
        let key = name.trim().to_ascii_lowercase();
        ALGORITHMS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, algorithm)| *algorithm)
            .ok_or_else(|| {
                TrackingError::Config(format!("unknown clustering algorithm '{}'", name))
            })
    }
}
impl Display for ClusteringAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusteringAlgorithm::KClusterizer => write!(f, "KClusterizer"),
            ClusteringAlgorithm::QtClusterizer => write!(f, "QTClusterizer"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Clusterizer {
    K(KClusterizer),
    Qt(QtClusterizer),
}
impl Clusterizer {
    pub fn new(algorithm: ClusteringAlgorithm, target_number: usize) -> Self {
        match algorithm {
            ClusteringAlgorithm::KClusterizer => Clusterizer::K(KClusterizer::new(target_number)),
            ClusteringAlgorithm::QtClusterizer => Clusterizer::Qt(QtClusterizer::default()),
        }
    }
    /// Build a strategy from its configuration name (`"KClusterizer"` or `"QTClusterizer"`).
    pub fn from_name(name: &str, target_number: usize) -> Result<Self> {
        Ok(Clusterizer::new(name.parse()?, target_number))
    }
    pub fn algorithm(&self) -> ClusteringAlgorithm {
        match self {
            Clusterizer::K(_) => ClusteringAlgorithm::KClusterizer,
            Clusterizer::Qt(_) => ClusteringAlgorithm::QtClusterizer,
        }
    }
    pub fn clusterize(&mut self, particles: &[Particle], quality_threshold: f64) {
        match self {
            Clusterizer::K(k) => k.clusterize(particles, quality_threshold),
            Clusterizer::Qt(qt) => qt.clusterize(particles, quality_threshold),
        }
    }
    pub fn clusters(&self) -> &[Cluster] {
        match self {
            Clusterizer::K(k) => &k.clusters,
            Clusterizer::Qt(qt) => &qt.clusters,
        }
    }
    /// Upper bound on the number of clusters, for strategies that have one.
    pub fn current_cluster_number(&self) -> Result<usize> {
        match self {
            Clusterizer::K(k) => Ok(k.max_clusters),
            Clusterizer::Qt(_) => Err(TrackingError::UnsupportedOperation(
                "QTClusterizer has no cluster number",
            )),
        }
    }
    /// Set the upper bound on the number of clusters. Ignored by strategies without one.
    pub fn set_max_cluster_number(&mut self, k: usize) {
        if let Clusterizer::K(kc) = self {
            kc.set_max_cluster_number(k);
        }
    }
}

/// Seeded clustering with at most `max_clusters` clusters.
#[derive(Clone, Debug)]
pub struct KClusterizer {
    seeds: PriorityBuffer<Particle>,
    max_clusters: usize,
    clusters: Vec<Cluster>,
}
impl KClusterizer {
    pub fn new(max_clusters: usize) -> Self {
        let max_clusters = max_clusters.max(1);
        KClusterizer {
            seeds: PriorityBuffer::new(max_clusters),
            max_clusters,
            clusters: Vec::new(),
        }
    }
    pub fn set_max_cluster_number(&mut self, k: usize) {
        self.max_clusters = k.max(1);
        self.seeds = PriorityBuffer::new(self.max_clusters);
    }
    pub fn clusterize(&mut self, particles: &[Particle], threshold: f64) {
        self.clusters.clear();
        self.seeds.reset();
        for particle in particles {
            let far_from_all = self
                .seeds
                .iter()
                .all(|seed| seed.pose.distance_to(&particle.pose) > 2.0 * threshold);
            if far_from_all {
                self.seeds.push(particle.clone());
            }
        }
        let seeds: Vec<&Particle> = self.seeds.iter().collect();
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); seeds.len()];
        let mut outliers = Vec::new();
        for (i, particle) in particles.iter().enumerate() {
            let owner = seeds
                .iter()
                .position(|seed| seed.pose.distance_to(&particle.pose) <= threshold);
            match owner {
                Some(k) => members[k].push(i),
                None => outliers.push(i),
            }
        }

        let keys: Vec<f64> = seeds.iter().map(|s| seed_key(&s.pose)).collect();
        let mut order: Vec<usize> = (0..seeds.len()).collect();
        order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
        let mut groups: Vec<(f64, Vec<usize>)> = Vec::new();
        for k in order {
            let same_key = groups.last().is_some_and(|(key, _)| *key == keys[k]);
            if !same_key {
                groups.push((keys[k], Vec::new()));
            }
            if let Some((_, indexes)) = groups.last_mut() {
                indexes.extend(&members[k]);
            }
        }
        let mut assignment: Vec<Vec<usize>> = groups
            .into_iter()
            .map(|(_, mut indexes)| {
                indexes.sort_unstable();
                indexes
            })
            .filter(|indexes| !indexes.is_empty())
            .collect();

        if assignment.is_empty() {
            if !outliers.is_empty() {
                self.clusters
                    .push(Cluster::from_particles(collect(particles, &outliers)));
            }
            return;
        }
        let centroids: Vec<Pose2> = assignment
            .iter()
            .map(|indexes| centroid(&collect(particles, indexes)))
            .collect();
        for i in outliers {
            let p = &particles[i].pose;
            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(k, c)| (k, (c.x - p.x).powi(2) + (c.y - p.y).powi(2)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(k, _)| k);
            assignment[nearest].push(i);
        }
        self.clusters = assignment
            .iter()
            .map(|indexes| Cluster::from_particles(collect(particles, indexes)))
            .collect();
    }
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }
}

/// Quality-threshold clustering.
///
/// Membership compares the *squared* distance against the threshold.
#[derive(Clone, Debug, Default)]
pub struct QtClusterizer {
    clusters: Vec<Cluster>,
}
impl QtClusterizer {
    pub fn clusterize(&mut self, particles: &[Particle], threshold: f64) {
        self.clusters.clear();
        let mut remaining: Vec<Particle> = particles.to_vec();
        while !remaining.is_empty() {
            let mut best: Vec<usize> = Vec::new();
            for anchor in &remaining {
                let candidate: Vec<usize> = remaining
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        (p.pose.x - anchor.pose.x).powi(2) + (p.pose.y - anchor.pose.y).powi(2)
                            < threshold
                    })
                    .map(|(i, _)| i)
                    .collect();
                if candidate.len() > best.len() {
                    best = candidate;
                }
            }
            // A non-positive threshold admits nobody, not even the anchor.
            if best.is_empty() {
                best.push(0);
            }
            let mut selected = vec![false; remaining.len()];
            for &i in &best {
                selected[i] = true;
            }
            let (members, rest): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .zip(selected)
                .partition(|(_, chosen)| *chosen);
            self.clusters.push(Cluster::from_particles(
                members.into_iter().map(|(p, _)| p).collect(),
            ));
            remaining = rest.into_iter().map(|(p, _)| p).collect();
        }
    }
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }
}

fn seed_key(pose: &Pose2) -> f64 {
    pose.x * 100_000.0 + pose.y * 50_000.0 + pose.theta
}

fn collect(particles: &[Particle], indexes: &[usize]) -> Vec<Particle> {
    indexes.iter().map(|&i| particles[i].clone()).collect()
}
