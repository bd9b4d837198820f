//! Processors drive a bank of filters from the host loop.
//!
//! A processor decides whether an iteration is due (elapsed time or robot motion), bootstraps
//! filters the first time they run, and then feeds every filter the readings of the sensor it is
//! bound to. Filters are bound to sensors by name.
use crate::bank::MultiObjectParticleFilter;
use crate::fusion::ObjectParticleFilterMultiAgent;
use crate::object_filter::ObjectParticleFilter;
use crate::sensor::{AgentReading, ObjectSensorReading};
use crate::{Pose2, Timestamp, normalize_angle};

use log::debug;
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

/// Common surface of the filters a processor can own.
pub trait TrackingFilter {
    /// Name of the sensor whose readings the filter consumes.
    fn name(&self) -> &str;
    /// Spread the population over the whole world.
    fn init_from_uniform(&mut self);
}
impl TrackingFilter for ObjectParticleFilter {
    fn name(&self) -> &str {
        ObjectParticleFilter::name(self)
    }
    fn init_from_uniform(&mut self) {
        ObjectParticleFilter::init_from_uniform(self)
    }
}
impl TrackingFilter for MultiObjectParticleFilter {
    fn name(&self) -> &str {
        MultiObjectParticleFilter::name(self)
    }
    fn init_from_uniform(&mut self) {
        MultiObjectParticleFilter::init_from_uniform(self)
    }
}
impl TrackingFilter for ObjectParticleFilterMultiAgent {
    fn name(&self) -> &str {
        ObjectParticleFilterMultiAgent::name(self)
    }
    fn init_from_uniform(&mut self) {
        ObjectParticleFilterMultiAgent::init_from_uniform(self)
    }
}

/// Filters keyed by name. The bank owns its filters; inserting under a taken name drops the
/// previous filter.
#[derive(Clone, Debug)]
pub struct FilterBank<F> {
    filters: BTreeMap<String, F>,
}
impl<F> Default for FilterBank<F> {
    fn default() -> Self {
        FilterBank {
            filters: BTreeMap::new(),
        }
    }
}
impl<F: TrackingFilter> FilterBank<F> {
    pub fn new() -> Self {
        Self::default()
    }
    /// Insert `filter` under its own name, returning the filter it replaced.
    pub fn insert(&mut self, filter: F) -> Option<F> {
        self.filters.insert(filter.name().to_string(), filter)
    }
    pub fn get(&self, name: &str) -> Option<&F> {
        self.filters.get(name)
    }
    pub fn get_mut(&mut self, name: &str) -> Option<&mut F> {
        self.filters.get_mut(name)
    }
    pub fn remove(&mut self, name: &str) -> Option<F> {
        self.filters.remove(name)
    }
    pub fn iter(&self) -> btree_map::Values<'_, String, F> {
        self.filters.values()
    }
    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, String, F> {
        self.filters.values_mut()
    }
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.filters.keys().map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.filters.len()
    }
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// When a processor iteration is due.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateGate {
    /// Longest pause between iterations; `None` runs every call.
    pub max_time_to_wait_ms: Option<u64>,
    /// Change of the robot's distance from the origin (m) that forces an iteration.
    pub min_translation: f64,
    /// Heading change (degrees) that forces an iteration.
    pub min_rotation_deg: f64,
}
impl UpdateGate {
    pub const fn single_robot() -> Self {
        UpdateGate {
            max_time_to_wait_ms: None,
            min_translation: 0.03,
            min_rotation_deg: 5.0,
        }
    }
    pub const fn multi_tracker() -> Self {
        UpdateGate {
            max_time_to_wait_ms: Some(100),
            min_translation: 0.1,
            min_rotation_deg: 5.0,
        }
    }
    pub fn update_needed(
        &self,
        pose: &Pose2,
        last_pose: &Pose2,
        now: Timestamp,
        last_iteration: Timestamp,
    ) -> bool {
        match self.max_time_to_wait_ms {
            None => return true,
            Some(wait) if now - last_iteration > wait => return true,
            Some(_) => {}
        }
        if (pose.norm() - last_pose.norm()).abs() > self.min_translation {
            return true;
        }
        normalize_angle(pose.theta - last_pose.theta)
            .abs()
            .to_degrees()
            > self.min_rotation_deg
    }
}

/// Bank bookkeeping shared by the processors.
#[derive(Clone, Debug)]
struct ProcessorCore<F> {
    bank: FilterBank<F>,
    needs_bootstrap: BTreeSet<String>,
    last_pose: Pose2,
    last_iteration: Timestamp,
}
impl<F: TrackingFilter> ProcessorCore<F> {
    fn new() -> Self {
        ProcessorCore {
            bank: FilterBank::new(),
            needs_bootstrap: BTreeSet::new(),
            last_pose: Pose2::default(),
            last_iteration: Timestamp::default(),
        }
    }
    fn add_filter(&mut self, filter: F) -> Option<F> {
        self.needs_bootstrap.insert(filter.name().to_string());
        self.bank.insert(filter)
    }
    fn bootstrap(&mut self) {
        for name in std::mem::take(&mut self.needs_bootstrap) {
            if let Some(filter) = self.bank.get_mut(&name) {
                debug!("bootstrapping filter {}", name);
                filter.init_from_uniform();
            }
        }
    }
    fn finish_iteration(&mut self, pose: Pose2, now: Timestamp) {
        self.last_pose = pose;
        self.last_iteration = now;
    }
}

/// Runs a bank of [`ObjectParticleFilter`]s on one robot.
#[derive(Clone, Debug)]
pub struct Processor {
    core: ProcessorCore<ObjectParticleFilter>,
    gate: UpdateGate,
}
impl Default for Processor {
    fn default() -> Self {
        Processor {
            core: ProcessorCore::new(),
            gate: UpdateGate::single_robot(),
        }
    }
}
impl Processor {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_gate(gate: UpdateGate) -> Self {
        Processor {
            core: ProcessorCore::new(),
            gate,
        }
    }
    pub fn add_filter(&mut self, filter: ObjectParticleFilter) -> Option<ObjectParticleFilter> {
        self.core.add_filter(filter)
    }
    pub fn filters(&self) -> &FilterBank<ObjectParticleFilter> {
        &self.core.bank
    }
    /// Run one iteration if one is due. Returns whether it ran.
    ///
    /// Readings of the matching sensor are passed to the filters mutably: each filter drops the
    /// observations it neither associates nor promotes. An empty reading still runs a cycle, which
    /// is how identities of targets that left the field of view expire.
    pub fn process_reading(
        &mut self,
        robot_pose: Pose2,
        target_seen: bool,
        initial: Timestamp,
        current: Timestamp,
        readings: &mut [ObjectSensorReading],
    ) -> bool {
        let core = &mut self.core;
        if !self
            .gate
            .update_needed(&robot_pose, &core.last_pose, current, core.last_iteration)
        {
            return false;
        }
        core.bootstrap();
        let last_pose = core.last_pose;
        for filter in core.bank.iter_mut() {
            filter.predict(&robot_pose, &last_pose, target_seen, initial, current);
            for reading in readings.iter_mut() {
                if reading.sensor_name() == filter.name() {
                    filter.observe(reading, current);
                }
            }
        }
        core.finish_iteration(robot_pose, current);
        true
    }
}

/// Runs a bank of [`MultiObjectParticleFilter`]s on one robot.
#[derive(Clone, Debug)]
pub struct MultiTrackerProcessor {
    core: ProcessorCore<MultiObjectParticleFilter>,
    gate: UpdateGate,
}
impl Default for MultiTrackerProcessor {
    fn default() -> Self {
        MultiTrackerProcessor {
            core: ProcessorCore::new(),
            gate: UpdateGate::multi_tracker(),
        }
    }
}
impl MultiTrackerProcessor {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_filter(
        &mut self,
        filter: MultiObjectParticleFilter,
    ) -> Option<MultiObjectParticleFilter> {
        self.core.add_filter(filter)
    }
    pub fn filters(&self) -> &FilterBank<MultiObjectParticleFilter> {
        &self.core.bank
    }
    pub fn process_reading(
        &mut self,
        robot_pose: Pose2,
        target_seen: bool,
        initial: Timestamp,
        current: Timestamp,
        readings: &[ObjectSensorReading],
    ) -> bool {
        let core = &mut self.core;
        if !self
            .gate
            .update_needed(&robot_pose, &core.last_pose, current, core.last_iteration)
        {
            return false;
        }
        core.bootstrap();
        for filter in core.bank.iter_mut() {
            filter.predict(target_seen, initial, current);
            for reading in readings {
                if reading.sensor_name() == filter.name() && !reading.observations().is_empty() {
                    filter.observe(reading, current);
                }
            }
        }
        core.finish_iteration(robot_pose, current);
        true
    }
}

/// Runs the fusion filters on the reports gathered from the team. Every call is an iteration.
#[derive(Clone, Debug)]
pub struct MultiAgentProcessor {
    core: ProcessorCore<ObjectParticleFilterMultiAgent>,
}
impl Default for MultiAgentProcessor {
    fn default() -> Self {
        MultiAgentProcessor {
            core: ProcessorCore::new(),
        }
    }
}
impl MultiAgentProcessor {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_filter(
        &mut self,
        filter: ObjectParticleFilterMultiAgent,
    ) -> Option<ObjectParticleFilterMultiAgent> {
        self.core.add_filter(filter)
    }
    pub fn filters(&self) -> &FilterBank<ObjectParticleFilterMultiAgent> {
        &self.core.bank
    }
    pub fn process_reading(&mut self, readings: &[AgentReading], now: Timestamp) {
        self.core.bootstrap();
        if readings.is_empty() {
            return;
        }
        for filter in self.core.bank.iter_mut() {
            filter.observe(readings, now);
        }
        self.core.last_iteration = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::particle::FilterState;
    use crate::sensor::{Estimations, Observation};
    use nalgebra::Point2;

    #[test]
    fn bank_insert_replaces_by_name() {
        let config = TrackerConfig::default();
        let mut bank = FilterBank::new();
        assert!(bank.insert(ObjectParticleFilter::new(&config)).is_none());
        let replaced = bank.insert(ObjectParticleFilter::new(&config));
        assert!(replaced.is_some());
        assert_eq!(bank.len(), 1);
        assert_eq!(bank.names().collect::<Vec<_>>(), vec!["ObjectParticleFilter"]);
        assert!(bank.remove("ObjectParticleFilter").is_some());
        assert!(bank.is_empty());
    }
    #[test]
    fn single_robot_gate_always_runs() {
        let gate = UpdateGate::single_robot();
        let pose = Pose2::new(1.0, 0.0, 0.0);
        let now = Timestamp::from_millis(5);
        assert!(gate.update_needed(&pose, &pose, now, now));
    }
    #[test]
    fn multi_tracker_gate() {
        let gate = UpdateGate::multi_tracker();
        let last = Pose2::new(1.0, 0.0, 0.0);
        let t0 = Timestamp::from_millis(1_000);
        assert!(!gate.update_needed(&last, &last, t0.add_millis(50), t0));
        assert!(gate.update_needed(&last, &last, t0.add_millis(150), t0));
        assert!(gate.update_needed(&Pose2::new(1.2, 0.0, 0.0), &last, t0.add_millis(50), t0));
        assert!(!gate.update_needed(&Pose2::new(1.05, 0.0, 0.0), &last, t0.add_millis(50), t0));
        assert!(gate.update_needed(
            &Pose2::new(1.0, 0.0, 10f64.to_radians()),
            &last,
            t0.add_millis(50),
            t0
        ));
    }
    #[test]
    fn processor_bootstraps_then_observes() {
        let config = TrackerConfig::default();
        let mut processor = Processor::new();
        processor.add_filter(ObjectParticleFilter::new(&config));
        let mut reading = ObjectSensorReading::new("ObjectParticleFilter");
        reading.set_observations(vec![Observation::at(Point2::new(1.0, 1.0))]);
        let mut other = ObjectSensorReading::new("someone-else");
        other.set_observations(vec![Observation::at(Point2::new(-2.0, -2.0))]);
        let mut readings = vec![reading, other];
        let ran = processor.process_reading(
            Pose2::default(),
            false,
            Timestamp::from_millis(0),
            Timestamp::from_millis(100),
            &mut readings,
        );
        assert!(ran);
        let filter = processor.filters().get("ObjectParticleFilter").unwrap();
        assert_ne!(filter.state(), FilterState::Uninitialized);
        assert_eq!(filter.particles().len(), config.parameters.particle_number);
        assert_eq!(filter.pending_observations().len(), 1);
        assert_eq!(readings[1].observations().len(), 1, "unmatched sensor is untouched");
    }
    #[test]
    fn multi_agent_processor_fuses_reports() {
        let config = TrackerConfig::default();
        let mut processor = MultiAgentProcessor::new();
        processor.add_filter(ObjectParticleFilterMultiAgent::new(&config));
        processor.process_reading(&[], Timestamp::from_millis(10));
        let mut estimations = Estimations::new();
        estimations.insert(1, Observation::at(Point2::new(0.5, 0.5)));
        processor.process_reading(
            &[AgentReading::new(estimations, Timestamp::from_millis(90))],
            Timestamp::from_millis(100),
        );
        let fusion = processor.filters().iter().next().unwrap();
        assert_eq!(fusion.estimations().len(), 1);
    }
}
