//! Cross-robot fusion of identity-tagged estimates.
//!
//! Every teammate periodically reports its local estimates. The fusion layer rebuilds a particle
//! population from those reports, discounting old ones, and merges the reports that share an
//! identity into a single estimate whose position favours the more certain reporters.
use crate::config::TrackerConfig;
use crate::particle::{Particle, ParticleFilter};
use crate::sensor::{AgentReading, Estimations, Observation};
use crate::{PolarPoint, Timestamp, sample_particles};

use log::debug;
use nalgebra::{Point2, Vector2};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct ObjectParticleFilterMultiAgent {
    name: String,
    filter: ParticleFilter,
    best_particles: usize,
    decay_factor: f64,
    estimations: Estimations,
}
impl ObjectParticleFilterMultiAgent {
    pub fn new(config: &TrackerConfig) -> Self {
        ObjectParticleFilterMultiAgent {
            name: config.parameters.filter_name.clone(),
            filter: ParticleFilter::new(
                config.parameters.particle_number,
                config.process_noise(),
                config.sensor_model(),
                config.parameters.seed,
            ),
            best_particles: config.parameters.best_particles,
            decay_factor: config.timing.fusion_decay_factor,
            estimations: Estimations::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn init_from_uniform(&mut self) {
        self.filter.init_from_uniform();
    }
    /// Weight of a report produced at `reported` when fused at `now`.
    pub fn report_weight(&self, reported: Timestamp, now: Timestamp) -> f64 {
        (1.0 - self.decay_factor * now.seconds_since(reported)).max(0.0)
    }

    /// Fuse the reports of the team.
    ///
    /// Does nothing when `readings` is empty; the previous fused estimate is kept.
    pub fn observe(&mut self, readings: &[AgentReading], now: Timestamp) {
        if readings.is_empty() {
            return;
        }
        let mut particles = Vec::new();
        let mut best: Option<Particle> = None;
        for reading in readings {
            let weight = self.report_weight(reading.timestamp, now);
            for estimation in reading.estimations.values() {
                let mut samples = sample_particles(
                    &estimation.position(),
                    &estimation.sigma,
                    self.best_particles,
                    self.filter.rng_mut(),
                );
                for particle in &mut samples {
                    particle.weight = weight;
                }
                if let Some(first) = samples.first() {
                    if best.as_ref().is_none_or(|b| first.weight > b.weight) {
                        best = Some(first.clone());
                    }
                }
                particles.extend(samples);
            }
        }
        self.filter.set_particles(particles);
        self.filter.set_best_particle(best);
        self.estimations = fuse_estimations(readings);
        debug!(
            "{}: fused {} reports into {} identities",
            self.name,
            readings.len(),
            self.estimations.len()
        );
        self.filter.resample();
    }
    pub fn estimations(&self) -> &Estimations {
        &self.estimations
    }
    pub fn particles(&self) -> &[Particle] {
        self.filter.particles()
    }
    pub fn best_particle(&self) -> Option<&Particle> {
        self.filter.best_particle()
    }
}

/// Merge every report of every identity into one estimate per identity.
pub fn fuse_estimations(readings: &[AgentReading]) -> Estimations {
    let mut grouped: BTreeMap<i32, Vec<Observation>> = BTreeMap::new();
    for reading in readings {
        for (id, estimation) in &reading.estimations {
            grouped.entry(*id).or_default().push(*estimation);
        }
    }
    grouped
        .into_iter()
        .filter_map(|(id, reports)| fuse_reports(&reports).map(|o| (id, o)))
        .collect()
}

/// Inverse-uncertainty average of several reports of the same identity.
///
/// Along each axis report `i` gets `1 - sigma_i / sum(sigma)`, renormalised; equal weights when all
/// sigmas are zero. The fused sigma is the plain mean and the appearance comes from the first report.
pub fn fuse_reports(reports: &[Observation]) -> Option<Observation> {
    let first = reports.first()?;
    if reports.len() == 1 {
        return Some(*first);
    }
    let xs: Vec<(f64, f64)> = reports.iter().map(|r| (r.position().x, r.sigma.x)).collect();
    let ys: Vec<(f64, f64)> = reports.iter().map(|r| (r.position().y, r.sigma.y)).collect();
    let n = reports.len() as f64;
    let sigma = reports.iter().fold(Vector2::zeros(), |acc, r| acc + r.sigma) / n;
    let position = Point2::new(weighted_axis(&xs), weighted_axis(&ys));
    Some(Observation::new(
        PolarPoint::from_cartesian(position),
        sigma,
        first.model,
    ))
}

fn weighted_axis(values: &[(f64, f64)]) -> f64 {
    let n = values.len() as f64;
    let total_sigma: f64 = values.iter().map(|(_, s)| s).sum();
    let weights: Vec<f64> = if total_sigma > 0.0 {
        values.iter().map(|(_, s)| 1.0 - s / total_sigma).collect()
    } else {
        vec![1.0; values.len()]
    };
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return values.iter().map(|(v, _)| v).sum::<f64>() / n;
    }
    values
        .iter()
        .zip(weights.iter())
        .map(|((v, _), w)| v * w / total)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::AppearanceModel;
    use assert_approx_eq::assert_approx_eq;

    fn report(x: f64, y: f64, sigma: f64) -> Observation {
        let mut o = Observation::at(Point2::new(x, y));
        o.sigma = Vector2::new(sigma, sigma);
        o
    }

    #[test]
    fn more_certain_report_dominates() {
        let fused = fuse_reports(&[report(0.0, 0.0, 1.0), report(2.0, 0.0, 0.5)]).unwrap();
        assert_approx_eq!(fused.position().x, 4.0 / 3.0, 1e-9);
        assert_approx_eq!(fused.position().y, 0.0, 1e-9);
        assert_approx_eq!(fused.sigma.x, 0.75, 1e-12);
    }
    #[test]
    fn single_report_passes_through() {
        let only = report(1.5, -2.0, 0.3);
        assert_eq!(fuse_reports(&[only]), Some(only));
        assert_eq!(fuse_reports(&[]), None);
    }
    #[test]
    fn zero_sigmas_average_equally() {
        let fused = fuse_reports(&[report(0.0, 1.0, 0.0), report(2.0, 3.0, 0.0)]).unwrap();
        assert_approx_eq!(fused.position().x, 1.0, 1e-9);
        assert_approx_eq!(fused.position().y, 2.0, 1e-9);
    }
    #[test]
    fn appearance_of_first_report_is_kept() {
        let mut a = report(0.0, 0.0, 1.0);
        a.model = AppearanceModel {
            color: [10, 20, 30],
            ..Default::default()
        };
        let b = report(1.0, 0.0, 1.0);
        assert_eq!(fuse_reports(&[a, b]).unwrap().model, a.model);
    }
    #[test]
    fn observe_groups_by_identity() {
        let mut fusion = ObjectParticleFilterMultiAgent::new(&TrackerConfig::default());
        let mut first = Estimations::new();
        first.insert(1, report(0.0, 0.0, 1.0));
        first.insert(2, report(-3.0, 2.0, 0.4));
        let mut second = Estimations::new();
        second.insert(1, report(2.0, 0.0, 0.5));
        let now = Timestamp::from_millis(10_000);
        fusion.observe(
            &[
                AgentReading::new(first, Timestamp::from_millis(9_800)),
                AgentReading::new(second, Timestamp::from_millis(9_900)),
            ],
            now,
        );
        let estimations = fusion.estimations();
        assert_eq!(estimations.len(), 2);
        assert_approx_eq!(estimations[&1].position().x, 4.0 / 3.0, 1e-9);
        assert_approx_eq!(estimations[&2].position().x, -3.0, 1e-9);
        assert_eq!(fusion.particles().len(), 300);
        let best = fusion.best_particle().unwrap();
        assert_approx_eq!(best.weight, 1.0 - 0.15 * 0.1, 1e-9);
    }
    #[test]
    fn old_reports_lose_weight() {
        let fusion = ObjectParticleFilterMultiAgent::new(&TrackerConfig::default());
        let now = Timestamp::from_millis(20_000);
        assert_approx_eq!(fusion.report_weight(now, now), 1.0);
        assert_approx_eq!(fusion.report_weight(Timestamp::from_millis(18_000), now), 0.7, 1e-12);
        assert_eq!(fusion.report_weight(Timestamp::from_millis(0), now), 0.0);
    }
    #[test]
    fn stale_reports_keep_population() {
        let mut fusion = ObjectParticleFilterMultiAgent::new(&TrackerConfig::default());
        let mut estimations = Estimations::new();
        estimations.insert(4, report(1.0, 1.0, 0.2));
        fusion.observe(
            &[AgentReading::new(estimations, Timestamp::from_millis(0))],
            Timestamp::from_millis(60_000),
        );
        assert_eq!(fusion.particles().len(), 50, "zero total weight skips resampling");
        assert_eq!(fusion.estimations().len(), 1);
    }
}
