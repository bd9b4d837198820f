//! Per-robot tracking pipeline.
//!
//! [`TeamEstimator`] is what a host robot calls once per control cycle. It turns the robot-frame
//! perceptions of the cycle into a global-frame reading, runs the local tracker, publishes the local
//! estimates to the team, and periodically fuses whatever the team reported into a multi-robot
//! estimate.
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::fusion::ObjectParticleFilterMultiAgent;
use crate::messages::{AgentPacket, ViewerFrame};
use crate::network::{AgentObservationQueue, ListenerHandle, PacketListener, UdpTransport};
use crate::object_filter::ObjectParticleFilter;
use crate::processor::{MultiAgentProcessor, Processor};
use crate::sensor::{AgentReading, Estimations, ObjectSensorReading, Observation, SensorMap};
use crate::{Pose2, Timestamp, is_target_near, relative_to_global, round_to};

use log::{debug, info};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Robot pose validity above which the robot is trusted to place its perceptions in the world.
pub const POSE_VALIDITY_THRESHOLD: f64 = 0.6;
/// Estimates with a sigma norm below this are reported as valid.
pub const VALID_VARIANCE: f64 = 1.5;
/// Variance reported when there is no estimate.
pub const INVALID_VARIANCE: f64 = 100.0;
/// Raw reports within this distance (m) of a fused target support it.
pub const CONSENSUS_DISTANCE: f64 = 1.0;
/// Fusion rate used when the configuration has no network section.
pub const DEFAULT_NETWORK_FREQUENCY: f64 = 5.0;

/// The most credible target position from one source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestEstimate {
    pub x: f64,
    pub y: f64,
    pub variance: f64,
    pub valid: bool,
}
impl Default for BestEstimate {
    fn default() -> Self {
        BestEstimate {
            x: 0.0,
            y: 0.0,
            variance: INVALID_VARIANCE,
            valid: false,
        }
    }
}
impl BestEstimate {
    pub fn from_observation(observation: &Observation) -> Self {
        let position = observation.position();
        let variance = round_to(observation.sigma.norm(), 2);
        BestEstimate {
            x: position.x,
            y: position.y,
            variance,
            valid: variance < VALID_VARIANCE,
        }
    }
    /// Same position, flagged as no longer credible.
    pub fn invalidated(self) -> Self {
        BestEstimate {
            variance: INVALID_VARIANCE,
            valid: false,
            ..self
        }
    }
}

/// Output of a [`TeamEstimator`] cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamEstimate {
    pub single_robot: BestEstimate,
    pub multi_robot: BestEstimate,
}

/// What the host supplies every cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostInput {
    pub robot_pose: Pose2,
    /// Localization confidence in `[0, 1]`.
    pub pose_validity: f64,
    /// Target perceptions in the robot frame.
    pub perceptions: Vec<Observation>,
    pub now: Timestamp,
}

/// Result of voting among fused targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consensus {
    NoTarget,
    /// Several targets share the highest support.
    Tie,
    Target(i32),
}

/// Pick the fused target supported by most raw reports.
///
/// With a single fused target that target wins outright.
pub fn consensus(fused: &Estimations, reports: &[AgentReading]) -> Consensus {
    let mut ids = fused.keys();
    let Some(&first) = ids.next() else {
        return Consensus::NoTarget;
    };
    if fused.len() == 1 {
        return Consensus::Target(first);
    }
    let raw: Vec<Point2<f64>> = reports
        .iter()
        .flat_map(|r| r.estimations.values().map(Observation::position))
        .collect();
    let support: Vec<(i32, usize)> = fused
        .iter()
        .map(|(id, estimate)| {
            let position = estimate.position();
            let count = raw
                .iter()
                .filter(|p| is_target_near(&position, p, CONSENSUS_DISTANCE))
                .count();
            (*id, count)
        })
        .collect();
    let best = support.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let mut winners = support.iter().filter(|(_, c)| *c == best);
    match (winners.next(), winners.next()) {
        (Some((id, _)), None) => Consensus::Target(*id),
        _ => Consensus::Tie,
    }
}

#[derive(Debug)]
pub struct TeamEstimator {
    filter_name: String,
    agent_id: u32,
    prefix: String,
    own_address: String,
    own_port: u16,
    message_frequency: f64,
    network_frequency: f64,
    max_reading: f64,
    map: SensorMap,
    processor: Processor,
    fusion: MultiAgentProcessor,
    queue: AgentObservationQueue,
    transport: Option<UdpTransport>,
    peers: Vec<SocketAddr>,
    viewer: Option<SocketAddr>,
    estimate: TeamEstimate,
    fused: Estimations,
    perceptions: Vec<Point2<f64>>,
    initial: Timestamp,
    last_sent: Option<Timestamp>,
    last_fusion: Timestamp,
}
impl TeamEstimator {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        config.validate()?;
        let mut processor = Processor::new();
        processor.add_filter(ObjectParticleFilter::new(config));
        let mut fusion = MultiAgentProcessor::new();
        fusion.add_filter(ObjectParticleFilterMultiAgent::new(config));

        let mut estimator = TeamEstimator {
            filter_name: config.parameters.filter_name.clone(),
            agent_id: 0,
            prefix: "Agent".to_string(),
            own_address: "127.0.0.1".to_string(),
            own_port: 0,
            message_frequency: 0.0,
            network_frequency: DEFAULT_NETWORK_FREQUENCY,
            max_reading: config.sensor_model.max_reading,
            map: config.sensor_map(),
            processor,
            fusion,
            queue: AgentObservationQueue::for_network_frequency(DEFAULT_NETWORK_FREQUENCY),
            transport: None,
            peers: Vec::new(),
            viewer: None,
            estimate: TeamEstimate::default(),
            fused: Estimations::new(),
            perceptions: Vec::new(),
            initial: Timestamp::default(),
            last_sent: None,
            last_fusion: Timestamp::default(),
        };
        if let Some(network) = &config.network {
            estimator.agent_id = network.agent_id;
            estimator.prefix = network.prefix.clone();
            estimator.message_frequency = network.message_frequency;
            estimator.network_frequency = network.network_frequency;
            estimator.queue =
                AgentObservationQueue::for_network_frequency(network.network_frequency);
            if let Some(own) = network.own_endpoint() {
                estimator.own_address = own.address.clone();
                estimator.own_port = own.port;
            }
            estimator.peers = network
                .peers()
                .map(|peer| peer.endpoint().socket_addr())
                .collect::<Result<Vec<_>>>()?;
            estimator.viewer = network
                .viewer
                .as_ref()
                .map(|viewer| viewer.socket_addr())
                .transpose()?;
        }
        Ok(estimator)
    }
    pub fn with_transport(mut self, transport: UdpTransport) -> Self {
        self.transport = Some(transport);
        self
    }
    /// Start receiving teammate packets on this agent's own endpoint.
    pub fn start_listener(&self) -> Result<ListenerHandle> {
        let listener = PacketListener::bind(
            (self.own_address.as_str(), self.own_port),
            self.queue.clone(),
        )?;
        info!(
            "agent {} listening on {}",
            self.agent_id,
            listener.local_addr()?
        );
        listener.spawn()
    }
    /// Queue shared with the listener; reports pushed here are fused on the next fusion run.
    pub fn queue(&self) -> &AgentObservationQueue {
        &self.queue
    }

    /// Run one host cycle.
    pub fn update(&mut self, input: &HostInput) -> TeamEstimate {
        let now = input.now;
        if input.pose_validity > POSE_VALIDITY_THRESHOLD {
            self.local_update(input);
            self.initial = now;
        }
        let fusion_period = 2000.0 / self.network_frequency;
        if (now - self.last_fusion) as f64 > fusion_period {
            self.last_fusion = now;
            self.fuse(now);
        }
        self.estimate
    }

    fn local_update(&mut self, input: &HostInput) {
        let now = input.now;
        let observations = self.to_global(&input.robot_pose, &input.perceptions);
        self.perceptions = observations.iter().map(Observation::position).collect();
        let target_seen = !observations.is_empty();
        let mut reading = ObjectSensorReading::new(self.filter_name.as_str());
        reading.set_agent_pose(input.robot_pose);
        reading.set_observations(observations);
        self.processor.process_reading(
            input.robot_pose,
            target_seen,
            self.initial,
            now,
            std::slice::from_mut(&mut reading),
        );
        let estimations = self.local_estimations();
        let best = estimations
            .values()
            .min_by(|a, b| a.sigma.norm().total_cmp(&b.sigma.norm()));
        self.estimate.single_robot = match best {
            Some(observation) => BestEstimate::from_observation(observation),
            None => self.estimate.single_robot.invalidated(),
        };
        if estimations.is_empty() {
            return;
        }
        let packet = AgentPacket {
            ip: self.own_address.clone(),
            port: self.own_port,
            agent_pose: input.robot_pose,
            estimations: estimations.clone(),
            timestamp: now,
        };
        self.publish(&packet, now);
        self.queue.push(AgentReading::new(estimations, now));
    }

    /// Perceptions within range and inside the world, in the global frame.
    fn to_global(&self, pose: &Pose2, perceptions: &[Observation]) -> Vec<Observation> {
        perceptions
            .iter()
            .filter(|o| o.observation.rho < self.max_reading)
            .filter_map(|o| {
                let global = relative_to_global(&Pose2::from_position(o.position()), pose);
                if !self.map.is_inside_world(global.x, global.y) {
                    return None;
                }
                let mut observation = *o;
                observation.set_position(global.position());
                Some(observation)
            })
            .collect()
    }

    fn publish(&mut self, packet: &AgentPacket, now: Timestamp) {
        let Some(transport) = &self.transport else {
            return;
        };
        if self.message_frequency <= 0.0 {
            return;
        }
        let period = 1000.0 / self.message_frequency;
        if self
            .last_sent
            .is_some_and(|sent| ((now - sent) as f64) <= period)
        {
            return;
        }
        let sent = transport.broadcast(&packet.to_datagram(&self.prefix), &self.peers);
        debug!("agent {} sent its estimates to {} peers", self.agent_id, sent);
        self.last_sent = Some(now);
    }

    fn fuse(&mut self, now: Timestamp) {
        let reports = self.queue.drain();
        if !reports.is_empty() {
            self.fusion.process_reading(&reports, now);
            if let Some(filter) = self.fusion.filters().iter().next() {
                self.fused = filter.estimations().clone();
            }
            match consensus(&self.fused, &reports) {
                Consensus::Target(id) => {
                    if let Some(observation) = self.fused.get(&id) {
                        self.estimate.multi_robot = BestEstimate::from_observation(observation);
                    }
                }
                Consensus::NoTarget => {
                    self.estimate.multi_robot = self.estimate.multi_robot.invalidated();
                }
                Consensus::Tie => {}
            }
        }
        self.send_viewer_frame();
    }

    fn send_viewer_frame(&self) {
        let (Some(transport), Some(viewer)) = (&self.transport, self.viewer) else {
            return;
        };
        transport.send(&self.viewer_frame().to_string(), viewer);
    }

    pub fn viewer_frame(&self) -> ViewerFrame {
        ViewerFrame {
            agent_id: self.agent_id,
            targets: self.fused.values().map(Observation::position).collect(),
            perceptions: self.perceptions.clone(),
            associations: self
                .local_filter()
                .map(|f| f.observations_mapping().to_vec())
                .unwrap_or_default(),
        }
    }
    fn local_filter(&self) -> Option<&ObjectParticleFilter> {
        self.processor.filters().get(&self.filter_name)
    }
    /// Identity-tagged estimates of the local tracker.
    pub fn local_estimations(&self) -> Estimations {
        self.local_filter()
            .map(|f| f.estimations().clone())
            .unwrap_or_default()
    }
    /// Identity-tagged estimates of the last fusion run.
    pub fn fused_estimations(&self) -> &Estimations {
        &self.fused
    }
    pub fn estimate(&self) -> TeamEstimate {
        self.estimate
    }
}
