//! Team-level tests: reports travel as datagrams, are queued, and are fused.
use nalgebra::{Point2, Vector2};

use ptrack::config::TrackerConfig;
use ptrack::estimator::{HostInput, TeamEstimate, TeamEstimator};
use ptrack::fusion::ObjectParticleFilterMultiAgent;
use ptrack::messages::AgentPacket;
use ptrack::network::{AgentObservationQueue, PacketListener};
use ptrack::processor::MultiAgentProcessor;
use ptrack::sensor::{Estimations, Observation};
use ptrack::{Pose2, Timestamp};

fn estimate(x: f64, y: f64, sigma: f64) -> Observation {
    let mut o = Observation::at(Point2::new(x, y));
    o.sigma = Vector2::new(sigma, sigma);
    o
}

fn packet(port: u16, estimations: Estimations, ms: u64) -> AgentPacket {
    AgentPacket {
        ip: "127.0.0.1".to_string(),
        port,
        agent_pose: Pose2::default(),
        estimations,
        timestamp: Timestamp::from_millis(ms),
    }
}

#[test]
fn reports_from_two_agents_are_fused_per_identity() {
    let queue = AgentObservationQueue::new(10);
    let listener = PacketListener::bind("127.0.0.1:0", queue.clone()).unwrap();

    let mut first = Estimations::new();
    first.insert(1, estimate(0.0, 0.0, 1.0));
    first.insert(4, estimate(-2.0, 3.0, 0.3));
    let mut second = Estimations::new();
    second.insert(1, estimate(2.0, 0.0, 0.5));
    for datagram in [
        packet(17001, first, 9_900).to_datagram("Agent"),
        packet(17002, second, 9_950).to_datagram("Agent"),
    ] {
        listener.handle_datagram(datagram.as_bytes()).unwrap();
    }

    let mut processor = MultiAgentProcessor::new();
    processor.add_filter(ObjectParticleFilterMultiAgent::new(&TrackerConfig::default()));
    processor.process_reading(&queue.drain(), Timestamp::from_millis(10_000));

    let fusion = processor.filters().iter().next().unwrap();
    let fused = fusion.estimations();
    assert_eq!(fused.len(), 2);
    assert!((fused[&1].position().x - 4.0 / 3.0).abs() < 0.02);
    assert!(fused[&1].position().y.abs() < 0.02);
    assert!((fused[&4].position().x + 2.0).abs() < 0.02);
    assert!((fused[&1].sigma.x - 0.75).abs() < 1e-9);
}

#[test]
fn queue_drops_oldest_reports() {
    let queue = AgentObservationQueue::for_network_frequency(1.0);
    assert_eq!(queue.capacity(), 5);
    let listener = PacketListener::bind("127.0.0.1:0", queue.clone()).unwrap();
    for ms in 0..8u64 {
        let datagram = packet(17001, Estimations::new(), ms).to_datagram("Agent");
        listener.handle_datagram(datagram.as_bytes()).unwrap();
    }
    let drained = queue.drain();
    assert_eq!(drained.len(), 5);
    assert_eq!(drained[0].timestamp, Timestamp::from_millis(3));
    assert!(queue.drain().is_empty());
}

#[test]
fn teammate_reports_join_local_fusion() {
    let mut estimator = TeamEstimator::new(&TrackerConfig::default()).unwrap();
    let mut teammate = Estimations::new();
    teammate.insert(1, estimate(1.0, 0.0, 0.2));
    let mut output = TeamEstimate::default();
    for step in 0..25u64 {
        let now = Timestamp::from_millis(20_000 + step * 100);
        estimator
            .queue()
            .push(packet(17002, teammate.clone(), now.millis()).into());
        output = estimator.update(&HostInput {
            robot_pose: Pose2::new(0.0, 0.0, 0.0),
            pose_validity: 0.2,
            perceptions: Vec::new(),
            now,
        });
    }
    // The robot itself is not localized; the team estimate comes from the teammate alone.
    assert!(!output.single_robot.valid);
    assert!(output.multi_robot.valid);
    assert!((output.multi_robot.x - 1.0).abs() < 0.02);
}
