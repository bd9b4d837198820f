//! Text datagrams exchanged by the team.
//!
//! An [`AgentPacket`] carries the local estimates of one agent:
//!
//! ```text
//! <ip> <port> <x> <y> <theta> <n> [<id> <rho> <theta> <sigma_x> <sigma_y> <width> <height> <barycenter>]* <timestamp_ms>
//! ```
//!
//! Real values are written with two decimals. On the wire the packet is preceded by a routing prefix
//! that receivers discard (everything up to the first space).
use crate::error::{Result, TrackingError};
use crate::sensor::{AgentReading, AppearanceModel, Estimations, Observation};
use crate::{PolarPoint, Pose2, Timestamp};

use nalgebra::{Point2, Vector2};
use std::fmt::{self, Display};
use std::str::{FromStr, SplitWhitespace};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentPacket {
    pub ip: String,
    pub port: u16,
    pub agent_pose: Pose2,
    pub estimations: Estimations,
    pub timestamp: Timestamp,
}
impl Display for AgentPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.2} {:.2} {:.2} {}",
            self.ip,
            self.port,
            self.agent_pose.x,
            self.agent_pose.y,
            self.agent_pose.theta,
            self.estimations.len()
        )?;
        for (id, estimation) in &self.estimations {
            write!(
                f,
                " {} {:.2} {:.2} {:.2} {:.2} {} {} {}",
                id,
                estimation.observation.rho,
                estimation.observation.theta,
                estimation.sigma.x,
                estimation.sigma.y,
                estimation.model.width,
                estimation.model.height,
                estimation.model.barycenter
            )?;
        }
        write!(f, " {}", self.timestamp.millis())
    }
}
impl FromStr for AgentPacket {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = Tokens::new(s);
        let ip: String = tokens.next("ip")?;
        let port = tokens.next("port")?;
        let agent_pose = Pose2::new(
            tokens.next("agent x")?,
            tokens.next("agent y")?,
            tokens.next("agent theta")?,
        );
        let count: usize = tokens.next("estimation count")?;
        let mut estimations = Estimations::new();
        for _ in 0..count {
            let id = tokens.next("identity")?;
            let rho = tokens.next("rho")?;
            let theta = tokens.next("theta")?;
            let sigma = Vector2::new(tokens.next("sigma x")?, tokens.next("sigma y")?);
            let model = AppearanceModel {
                width: tokens.next("width")?,
                height: tokens.next("height")?,
                barycenter: tokens.next("barycenter")?,
                ..Default::default()
            };
            estimations.insert(
                id,
                Observation::new(PolarPoint::new(theta, rho), sigma, model),
            );
        }
        let timestamp = Timestamp::from_millis(tokens.next("timestamp")?);
        tokens.finish()?;
        Ok(AgentPacket {
            ip,
            port,
            agent_pose,
            estimations,
            timestamp,
        })
    }
}
impl AgentPacket {
    /// The packet as sent on the wire, behind `prefix`.
    pub fn to_datagram(&self, prefix: &str) -> String {
        format!("{} {}", prefix, self)
    }
    /// Parse a received datagram, discarding its routing prefix.
    pub fn from_datagram(datagram: &str) -> Result<Self> {
        strip_prefix(datagram)
            .ok_or_else(|| TrackingError::MalformedPacket("missing routing prefix".to_string()))?
            .parse()
    }
}
impl From<AgentPacket> for AgentReading {
    fn from(packet: AgentPacket) -> Self {
        AgentReading::new(packet.estimations, packet.timestamp)
    }
}

/// Everything after the first space of `datagram`, or `None` when there is no space.
pub fn strip_prefix(datagram: &str) -> Option<&str> {
    datagram.trim_start().split_once(' ').map(|(_, rest)| rest)
}

struct Tokens<'a> {
    inner: SplitWhitespace<'a>,
}
impl<'a> Tokens<'a> {
    fn new(s: &'a str) -> Self {
        Tokens {
            inner: s.split_whitespace(),
        }
    }
    fn next<T: FromStr>(&mut self, field: &str) -> Result<T> {
        let token = self
            .inner
            .next()
            .ok_or_else(|| TrackingError::MalformedPacket(format!("missing {}", field)))?;
        token
            .parse()
            .map_err(|_| TrackingError::MalformedPacket(format!("invalid {}: '{}'", field, token)))
    }
    fn finish(mut self) -> Result<()> {
        match self.inner.next() {
            None => Ok(()),
            Some(extra) => Err(TrackingError::MalformedPacket(format!(
                "unexpected trailing token '{}'",
                extra
            ))),
        }
    }
}

/// Frame of drawing primitives sent to an external viewer.
///
/// The payload starts with the agent id and the number of primitive groups, followed by one group
/// per fused target (`1 point x y`), one group with the raw perceptions of the cycle
/// (`n point x y ...`) when there are any, and one group per observation-to-cluster association
/// (`1 line x1 y1 x2 y2`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewerFrame {
    pub agent_id: u32,
    pub targets: Vec<Point2<f64>>,
    pub perceptions: Vec<Point2<f64>>,
    pub associations: Vec<(Point2<f64>, Point2<f64>)>,
}
impl Display for ViewerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self.targets.len()
            + usize::from(!self.perceptions.is_empty())
            + self.associations.len();
        write!(f, "{} {}", self.agent_id, groups)?;
        for target in &self.targets {
            write!(f, " 1 point {:.2} {:.2}", target.x, target.y)?;
        }
        if !self.perceptions.is_empty() {
            write!(f, " {}", self.perceptions.len())?;
            for p in &self.perceptions {
                write!(f, " point {:.2} {:.2}", p.x, p.y)?;
            }
        }
        for (from, to) in &self.associations {
            write!(
                f,
                " 1 line {:.2} {:.2} {:.2} {:.2}",
                from.x, from.y, to.x, to.y
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn packet() -> AgentPacket {
        let mut estimations = Estimations::new();
        estimations.insert(
            3,
            Observation::new(
                PolarPoint::new(0.786, 2.5),
                Vector2::new(0.2, 0.3),
                AppearanceModel {
                    width: 12,
                    height: 8,
                    barycenter: 4,
                    ..Default::default()
                },
            ),
        );
        estimations.insert(7, Observation::at(Point2::new(-1.0, 0.0)));
        AgentPacket {
            ip: "127.0.0.1".to_string(),
            port: 9001,
            agent_pose: Pose2::new(1.234, -0.5, 3.14159),
            estimations,
            timestamp: Timestamp::from_millis(1_700_000_123_456),
        }
    }

    #[test]
    fn encodes_with_two_decimals() {
        assert_eq!(
            packet().to_string(),
            "127.0.0.1 9001 1.23 -0.50 3.14 2 \
             3 2.50 0.79 0.20 0.30 12 8 4 7 \
             1.00 3.14 1.00 1.00 0 0 0 \
             1700000123456"
        );
    }
    #[test]
    fn decodes_what_it_encodes() {
        let original = packet();
        let decoded: AgentPacket = original.to_string().parse().unwrap();
        assert_eq!(decoded.ip, original.ip);
        assert_eq!(decoded.port, original.port);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_approx_eq!(decoded.agent_pose.x, 1.23);
        assert_eq!(decoded.estimations.len(), 2);
        let three = &decoded.estimations[&3];
        assert_approx_eq!(three.observation.rho, 2.5);
        assert_approx_eq!(three.observation.theta, 0.79);
        assert_approx_eq!(three.sigma.y, 0.3);
        assert_eq!(three.model.width, 12);
        assert_eq!(three.model.barycenter, 4);
    }
    #[test]
    fn datagram_prefix_is_stripped() {
        let datagram = packet().to_datagram("Agent1");
        assert!(datagram.starts_with("Agent1 127.0.0.1 "));
        let decoded = AgentPacket::from_datagram(&datagram).unwrap();
        assert_eq!(decoded.port, 9001);
        assert_eq!(strip_prefix("noprefix"), None);
    }
    #[test]
    fn empty_packet() {
        let p = AgentPacket {
            ip: "10.0.0.2".to_string(),
            port: 5000,
            timestamp: Timestamp::from_millis(42),
            ..Default::default()
        };
        assert_eq!(p.to_string(), "10.0.0.2 5000 0.00 0.00 0.00 0 42");
        let reading: AgentReading = p.to_string().parse::<AgentPacket>().unwrap().into();
        assert!(reading.estimations.is_empty());
        assert_eq!(reading.timestamp, Timestamp::from_millis(42));
    }
    #[test]
    fn malformed_packets_are_rejected() {
        for bad in [
            "",
            "10.0.0.2",
            "10.0.0.2 notaport 0 0 0 0 1",
            "10.0.0.2 5000 0 0 0 2 1 1.0 0.0 0.1 0.1 0 0 0 99",
            "10.0.0.2 5000 0 0 0 0 1 trailing",
        ] {
            let result = bad.parse::<AgentPacket>();
            assert!(
                matches!(result, Err(TrackingError::MalformedPacket(_))),
                "accepted '{}'",
                bad
            );
        }
    }
    #[test]
    fn viewer_frame_layout() {
        let frame = ViewerFrame {
            agent_id: 2,
            targets: vec![Point2::new(1.0, 2.0)],
            perceptions: vec![Point2::new(0.5, 0.5), Point2::new(-1.0, 0.0)],
            associations: vec![(Point2::new(0.5, 0.5), Point2::new(1.0, 2.0))],
        };
        assert_eq!(
            frame.to_string(),
            "2 3 1 point 1.00 2.00 2 point 0.50 0.50 point -1.00 0.00 1 line 0.50 0.50 1.00 2.00"
        );
    }
}
