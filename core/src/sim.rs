//! Synthetic tracking scenarios and CSV result records.
//!
//! This module provides:
//! - `ScenarioConfig`, a description of moving targets seen by a single robot, and the frames it
//!   generates (ground truth plus noisy robot-frame perceptions)
//! - `ScenarioRecord` for reading and writing generated frames to/from CSV
//! - `run_object_filter` / `run_bank`, which drive a tracker over the frames
//! - `TrackingResult` for storing, scoring and exporting the estimates

use crate::bank::MultiObjectParticleFilter;
use crate::config::TrackerConfig;
use crate::object_filter::ObjectParticleFilter;
use crate::processor::{MultiTrackerProcessor, Processor};
use crate::sensor::{Estimations, ObjectSensorReading, Observation};
use crate::{Pose2, Timestamp, relative_to_global};

use nalgebra::{Point2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// A target moving at constant velocity, bouncing off the world edges.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetMotion {
    pub start: Point2<f64>,
    /// m/s
    pub velocity: Vector2<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub targets: Vec<TargetMotion>,
    pub robot_pose: Pose2,
    pub duration_ms: u64,
    pub step_ms: u64,
    /// Standard deviation (m) of the perception noise on each axis.
    pub perception_noise: f64,
    /// Probability that a target is not perceived in a frame.
    pub miss_probability: f64,
    pub start_ms: u64,
    pub seed: u64,
}
impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            targets: vec![TargetMotion {
                start: Point2::new(1.0, 0.0),
                velocity: Vector2::zeros(),
            }],
            robot_pose: Pose2::default(),
            duration_ms: 5_000,
            step_ms: 100,
            perception_noise: 0.05,
            miss_probability: 0.0,
            start_ms: 10_000,
            seed: 42,
        }
    }
}

/// One instant of a scenario.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub now: Timestamp,
    pub robot_pose: Pose2,
    /// True target positions, indexed like `ScenarioConfig::targets`.
    pub truth: Vec<Point2<f64>>,
    /// Perceptions in the robot frame.
    pub perceptions: Vec<Observation>,
}

/// Express a global point in the frame `frame`.
pub fn global_to_relative(point: &Point2<f64>, frame: &Pose2) -> Point2<f64> {
    let (sin, cos) = frame.theta.sin_cos();
    let dx = point.x - frame.x;
    let dy = point.y - frame.y;
    Point2::new(dx * cos + dy * sin, -dx * sin + dy * cos)
}

impl ScenarioConfig {
    /// Generate the frames of the scenario, bouncing targets inside `world`.
    pub fn generate(&self, world: (Point2<f64>, Point2<f64>)) -> Vec<Frame> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, self.perception_noise.abs()).ok();
        let step = self.step_ms.max(1);
        let dt = step as f64 / 1000.0;
        let mut positions: Vec<Point2<f64>> = self.targets.iter().map(|t| t.start).collect();
        let mut velocities: Vec<Vector2<f64>> = self.targets.iter().map(|t| t.velocity).collect();
        let mut frames = Vec::new();
        for k in 0..=(self.duration_ms / step) {
            if k > 0 {
                for (p, v) in positions.iter_mut().zip(velocities.iter_mut()) {
                    *p += *v * dt;
                    bounce(p, v, &world);
                }
            }
            let mut perceptions = Vec::with_capacity(positions.len());
            for p in &positions {
                if rng.random::<f64>() < self.miss_probability {
                    continue;
                }
                let mut relative = global_to_relative(p, &self.robot_pose);
                if let Some(n) = noise {
                    relative.x += n.sample(&mut rng);
                    relative.y += n.sample(&mut rng);
                }
                perceptions.push(Observation::at(relative));
            }
            frames.push(Frame {
                now: Timestamp::from_millis(self.start_ms + k * step),
                robot_pose: self.robot_pose,
                truth: positions.clone(),
                perceptions,
            });
        }
        frames
    }
}

fn bounce(p: &mut Point2<f64>, v: &mut Vector2<f64>, world: &(Point2<f64>, Point2<f64>)) {
    let (min, max) = world;
    if p.x < min.x || p.x > max.x {
        v.x = -v.x;
        p.x = p.x.clamp(min.x, max.x);
    }
    if p.y < min.y || p.y > max.y {
        v.y = -v.y;
        p.y = p.y.clamp(min.y, max.y);
    }
}

/// A scenario frame flattened into CSV rows: one row per true target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub time_ms: u64,
    pub target: usize,
    pub true_x: f64,
    pub true_y: f64,
    pub robot_x: f64,
    pub robot_y: f64,
    pub robot_theta: f64,
}
impl ScenarioRecord {
    pub fn from_frames(frames: &[Frame]) -> Vec<Self> {
        frames
            .iter()
            .flat_map(|f| {
                f.truth.iter().enumerate().map(move |(target, p)| ScenarioRecord {
                    time_ms: f.now.millis(),
                    target,
                    true_x: p.x,
                    true_y: p.y,
                    robot_x: f.robot_pose.x,
                    robot_y: f.robot_pose.y,
                    robot_theta: f.robot_pose.theta,
                })
            })
            .collect()
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One estimate at one instant, scored against the nearest true target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub time_ms: u64,
    pub identity: i32,
    pub x: f64,
    pub y: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Distance (m) to the nearest true target.
    pub error: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackingResult {
    pub name: String,
    pub records: Vec<TrackingRecord>,
}
impl TrackingResult {
    pub fn new(name: &str) -> Self {
        TrackingResult {
            name: name.to_string(),
            records: Vec::new(),
        }
    }
    /// Score `estimations` against `truth` and append them.
    pub fn record(&mut self, now: Timestamp, estimations: &Estimations, truth: &[Point2<f64>]) {
        for (identity, estimate) in estimations {
            let position = estimate.position();
            let error = truth
                .iter()
                .map(|t| (t - position).norm())
                .fold(f64::INFINITY, f64::min);
            self.records.push(TrackingRecord {
                time_ms: now.millis(),
                identity: *identity,
                x: position.x,
                y: position.y,
                sigma_x: estimate.sigma.x,
                sigma_y: estimate.sigma.y,
                error,
            });
        }
    }
    /// Mean error of the records at or after `from_ms`; `None` when there are none.
    pub fn mean_error_since(&self, from_ms: u64) -> Option<f64> {
        let errors: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.time_ms >= from_ms && r.error.is_finite())
            .map(|r| r.error)
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.iter().sum::<f64>() / errors.len() as f64)
        }
    }
    /// Distinct identities seen over the run.
    pub fn identity_count(&self) -> usize {
        let mut ids: Vec<i32> = self.records.iter().map(|r| r.identity).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut result = TrackingResult::new(name);
        for record in rdr.deserialize() {
            result.records.push(record?);
        }
        Ok(result)
    }
}

fn global_reading(name: &str, frame: &Frame) -> ObjectSensorReading {
    let mut reading = ObjectSensorReading::new(name);
    reading.set_agent_pose(frame.robot_pose);
    reading.set_observations(
        frame
            .perceptions
            .iter()
            .map(|o| {
                let global =
                    relative_to_global(&Pose2::from_position(o.position()), &frame.robot_pose);
                let mut observation = *o;
                observation.set_position(global.position());
                observation
            })
            .collect(),
    );
    reading
}

/// Track the frames with an [`ObjectParticleFilter`].
pub fn run_object_filter(config: &TrackerConfig, frames: &[Frame]) -> TrackingResult {
    let name = config.parameters.filter_name.clone();
    let mut processor = Processor::new();
    processor.add_filter(ObjectParticleFilter::new(config));
    let mut result = TrackingResult::new(&name);
    let mut initial = frames.first().map(|f| f.now).unwrap_or_default();
    for frame in frames {
        let mut readings = [global_reading(&name, frame)];
        let target_seen = !readings[0].observations().is_empty();
        processor.process_reading(frame.robot_pose, target_seen, initial, frame.now, &mut readings);
        if let Some(filter) = processor.filters().get(&name) {
            result.record(frame.now, filter.estimations(), &frame.truth);
        }
        initial = frame.now;
    }
    result
}

/// Track the frames with a [`MultiObjectParticleFilter`]. Significant clusters are reported with
/// their index as identity.
pub fn run_bank(config: &TrackerConfig, frames: &[Frame]) -> TrackingResult {
    let name = config.parameters.filter_name.clone();
    let start = frames.first().map(|f| f.now).unwrap_or_default();
    let mut processor = MultiTrackerProcessor::new();
    processor.add_filter(MultiObjectParticleFilter::new(config, start));
    let mut result = TrackingResult::new(&name);
    let mut initial = start;
    for frame in frames {
        let readings = [global_reading(&name, frame)];
        let target_seen = !readings[0].observations().is_empty();
        if !processor.process_reading(
            frame.robot_pose,
            target_seen,
            initial,
            frame.now,
            &readings,
        ) {
            continue;
        }
        if let Some(bank) = processor.filters().get(&name) {
            let estimations: Estimations = bank
                .significant_clusters()
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let mut o = Observation::at(c.centroid.position());
                    o.sigma = c.sigma();
                    (i as i32, o)
                })
                .collect();
            result.record(frame.now, &estimations, &frame.truth);
        }
        initial = frame.now;
    }
    result
}
