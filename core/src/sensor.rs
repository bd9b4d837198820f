//! Sensor-side data: appearance models, observations, readings, the world map and the sensor model.
//!
//! Observations reach the filters in the global frame. A perception is produced by the host in the
//! robot frame; [`ObjectSensorReading::set_observations_from_ring`] converts it using the pose of the
//! observing agent and discards everything beyond the sensor range.
use crate::particle::Particle;
use crate::{PolarPoint, Pose2, Timestamp, relative_to_global};

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest per-channel color difference for two appearance models to be considered the same target.
pub const COLOR_SIMILARITY_THRESHOLD: i32 = 5;

/// Appearance of a perceived object: bounding box size, barycenter and mean color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppearanceModel {
    pub width: i32,
    pub height: i32,
    pub barycenter: i32,
    pub color: [i32; 3],
}
impl AppearanceModel {
    /// Two models match when every color channel differs by less than [`COLOR_SIMILARITY_THRESHOLD`].
    pub fn is_similar_to(&self, other: &AppearanceModel) -> bool {
        self.color
            .iter()
            .zip(other.color.iter())
            .all(|(a, b)| (a - b).abs() < COLOR_SIMILARITY_THRESHOLD)
    }
}

/// A single target perception: position in polar form, per-axis uncertainty and appearance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observation: PolarPoint,
    pub sigma: Vector2<f64>,
    pub model: AppearanceModel,
}
impl Default for Observation {
    fn default() -> Self {
        Observation {
            observation: PolarPoint::default(),
            sigma: Vector2::new(1.0, 1.0),
            model: AppearanceModel::default(),
        }
    }
}
impl Observation {
    pub fn new(observation: PolarPoint, sigma: Vector2<f64>, model: AppearanceModel) -> Self {
        Observation {
            observation,
            sigma,
            model,
        }
    }
    /// An observation at a cartesian position with default sigma and appearance.
    pub fn at(position: Point2<f64>) -> Self {
        Observation {
            observation: PolarPoint::from_cartesian(position),
            ..Default::default()
        }
    }
    pub fn position(&self) -> Point2<f64> {
        self.observation.to_cartesian()
    }
    pub fn set_position(&mut self, position: Point2<f64>) {
        self.observation = PolarPoint::from_cartesian(position);
    }
}

/// Identity-tagged estimates, ordered by identity.
pub type Estimations = BTreeMap<i32, Observation>;

/// Observations of a single sensor at one instant, in the global frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectSensorReading {
    observations: Vec<Observation>,
    agent_pose: Pose2,
    sensor_name: String,
}
impl ObjectSensorReading {
    pub fn new(sensor_name: impl Into<String>) -> Self {
        ObjectSensorReading {
            sensor_name: sensor_name.into(),
            ..Default::default()
        }
    }
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }
    pub fn observations_mut(&mut self) -> &mut Vec<Observation> {
        &mut self.observations
    }
    pub fn set_observations(&mut self, observations: Vec<Observation>) {
        self.observations = observations;
    }
    /// Fill the reading from a circular buffer of robot-frame perceptions.
    ///
    /// Entries from `last_index` up to (excluding) `current_index` are read, wrapping at the end of
    /// `buffer`. Perceptions at or beyond `max_rho` are dropped; the rest are converted to the global
    /// frame with the agent pose.
    pub fn set_observations_from_ring(
        &mut self,
        buffer: &[Observation],
        current_index: usize,
        last_index: usize,
        max_rho: f64,
    ) {
        self.observations.clear();
        let capacity = buffer.len();
        if capacity == 0 || current_index >= capacity || last_index >= capacity {
            return;
        }
        let mut i = last_index;
        while i != current_index {
            let relative = buffer[i].position();
            if relative.x.hypot(relative.y) < max_rho {
                let global = relative_to_global(&Pose2::from_position(relative), &self.agent_pose);
                let mut observation = buffer[i];
                observation.set_position(global.position());
                self.observations.push(observation);
            }
            i = (i + 1) % capacity;
        }
    }
    pub fn agent_pose(&self) -> Pose2 {
        self.agent_pose
    }
    pub fn set_agent_pose(&mut self, pose: Pose2) {
        self.agent_pose = pose;
    }
    pub fn sensor_name(&self) -> &str {
        &self.sensor_name
    }
}

/// Identity-tagged estimates reported by one agent, stamped with the time they were produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentReading {
    pub estimations: Estimations,
    pub timestamp: Timestamp,
}
impl AgentReading {
    pub fn new(estimations: Estimations, timestamp: Timestamp) -> Self {
        AgentReading {
            estimations,
            timestamp,
        }
    }
}

/// Rectangular world extent plus the sensors mounted in it.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorMap {
    world_min: Point2<f64>,
    world_max: Point2<f64>,
    sensors: Vec<Pose2>,
}
impl SensorMap {
    pub fn new(world_min: Point2<f64>, world_max: Point2<f64>) -> Self {
        SensorMap {
            world_min,
            world_max,
            sensors: Vec::new(),
        }
    }
    pub fn insert_sensor(&mut self, pose: Pose2) {
        self.sensors.push(pose);
    }
    pub fn sensors(&self) -> &[Pose2] {
        &self.sensors
    }
    pub fn world_bounds(&self) -> (Point2<f64>, Point2<f64>) {
        (self.world_min, self.world_max)
    }
    pub fn is_inside_world(&self, x: f64, y: f64) -> bool {
        x >= self.world_min.x
            && x <= self.world_max.x
            && y >= self.world_min.y
            && y <= self.world_max.y
    }
}

/// Distance-kernel likelihood of particle positions given a set of observations.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicSensorModel {
    sigma_rho: f64,
    sigma_theta: f64,
    default_linear_velocity: f64,
    linear_velocity: f64,
    map: SensorMap,
}
impl BasicSensorModel {
    pub fn new(
        sigma_rho: f64,
        sigma_theta: f64,
        default_linear_velocity: f64,
        map: SensorMap,
    ) -> Self {
        BasicSensorModel {
            sigma_rho,
            sigma_theta,
            default_linear_velocity,
            linear_velocity: default_linear_velocity,
            map,
        }
    }
    /// Zero outside the world, otherwise the sum over observations of `exp(-distance / sigma_rho)`.
    pub fn likelihood(&self, pose: &Pose2, observations: &[Observation]) -> f64 {
        if !self.map.is_inside_world(pose.x, pose.y) {
            return 0.0;
        }
        let sigma_rho = self.sigma_rho.max(f64::EPSILON);
        observations
            .iter()
            .map(|o| {
                let p = o.position();
                let distance = (pose.x - p.x).hypot(pose.y - p.y);
                (-distance / sigma_rho).exp()
            })
            .sum()
    }
    /// Multiply every particle weight by its likelihood. Weights are expected to be reset beforehand.
    pub fn apply_likelihood(&self, particles: &mut [Particle], observations: &[Observation]) {
        for particle in particles.iter_mut() {
            particle.weight *= self.likelihood(&particle.pose, observations);
        }
    }
    /// Decay the linear velocity prior with the time elapsed between two timestamps.
    pub fn calculate_linear_velocity(&mut self, initial: Timestamp, current: Timestamp) {
        self.linear_velocity =
            self.default_linear_velocity * (-current.seconds_since(initial)).exp();
    }
    pub fn linear_velocity(&self) -> f64 {
        self.linear_velocity
    }
    pub fn sigma_rho(&self) -> f64 {
        self.sigma_rho
    }
    pub fn sigma_theta(&self) -> f64 {
        self.sigma_theta
    }
    pub fn map(&self) -> &SensorMap {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn world() -> SensorMap {
        SensorMap::new(Point2::new(-3.0, -2.0), Point2::new(3.0, 2.0))
    }

    #[test]
    fn appearance_similarity() {
        let a = AppearanceModel {
            color: [100, 50, 20],
            ..Default::default()
        };
        let b = AppearanceModel {
            color: [104, 46, 24],
            width: 12,
            ..Default::default()
        };
        let c = AppearanceModel {
            color: [105, 50, 20],
            ..Default::default()
        };
        assert!(a.is_similar_to(&b), "sizes are ignored, colors within 5");
        assert!(!a.is_similar_to(&c));
    }
    #[test]
    fn likelihood_is_zero_outside_world() {
        let model = BasicSensorModel::new(0.5, 0.1, 1.0, world());
        let obs = vec![Observation::at(Point2::new(0.0, 0.0))];
        assert_eq!(model.likelihood(&Pose2::new(3.5, 0.0, 0.0), &obs), 0.0);
        assert_approx_eq!(model.likelihood(&Pose2::new(0.0, 0.0, 0.0), &obs), 1.0);
        assert_approx_eq!(
            model.likelihood(&Pose2::new(1.0, 0.0, 0.0), &obs),
            (-2.0f64).exp()
        );
    }
    #[test]
    fn likelihood_sums_observations() {
        let model = BasicSensorModel::new(1.0, 0.1, 1.0, world());
        let obs = vec![
            Observation::at(Point2::new(0.0, 0.0)),
            Observation::at(Point2::new(0.0, 0.0)),
        ];
        assert_approx_eq!(model.likelihood(&Pose2::default(), &obs), 2.0);
    }
    #[test]
    fn ring_buffer_reading_wraps_and_filters_range() {
        let buffer: Vec<Observation> = [1.0, 2.0, 9.0, 3.0]
            .iter()
            .map(|&x| Observation::at(Point2::new(x, 0.0)))
            .collect();
        let mut reading = ObjectSensorReading::new("camera");
        reading.set_agent_pose(Pose2::new(1.0, 0.0, PI / 2.0));
        // from index 2 around to index 1: entries 2, 3, 0
        reading.set_observations_from_ring(&buffer, 1, 2, 5.0);
        let positions: Vec<Point2<f64>> =
            reading.observations().iter().map(Observation::position).collect();
        assert_eq!(positions.len(), 2, "the 9 m perception is out of range");
        assert_approx_eq!(positions[0].x, 1.0, 1e-9);
        assert_approx_eq!(positions[0].y, 3.0, 1e-9);
        assert_approx_eq!(positions[1].x, 1.0, 1e-9);
        assert_approx_eq!(positions[1].y, 1.0, 1e-9);
        assert_eq!(reading.sensor_name(), "camera");
    }
    #[test]
    fn linear_velocity_decays() {
        let mut model = BasicSensorModel::new(0.5, 0.1, 2.0, world());
        model.calculate_linear_velocity(Timestamp::from_millis(0), Timestamp::from_millis(1000));
        assert_approx_eq!(model.linear_velocity(), 2.0 * (-1.0f64).exp());
    }
}
