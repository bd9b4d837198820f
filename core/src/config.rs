//! Tracker configuration.
//!
//! A [`TrackerConfig`] is read from JSON, YAML or TOML, the format being chosen by file extension. The
//! sections mirror the concerns of the tracker:
//!
//! ```toml
//! [parameters]
//! filter_name = "ObjectParticleFilter"
//! particle_number = 300
//! sr0 = 0.1
//! st0 = 0.05
//!
//! [sensor_model]
//! sigma_rho = 0.5
//! sigma_theta = 0.1
//! default_linear_velocity = 1.0
//!
//! [location]
//! world_x_min = -5.0
//! world_x_max = 5.0
//! world_y_min = -4.0
//! world_y_max = 4.0
//!
//! [clustering]
//! algorithm = "KClusterizer"
//! target_number = 1
//! ```
//!
//! Keys of the `parameters`, `sensor_model`, `location` and `clustering` sections without a documented
//! default are required; a missing key makes loading fail. The `timing` section is optional and every
//! key in it has a default. The `network` section is only needed by robots that exchange estimates.
use crate::clustering::ClusteringAlgorithm;
use crate::error::{Result, TrackingError};
use crate::particle::ProcessNoise;
use crate::sensor::{BasicSensorModel, SensorMap};
use crate::Pose2;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

fn default_seed() -> u64 {
    42
}
fn default_filter_name() -> String {
    "ObjectParticleFilter".to_string()
}
fn default_best_particles() -> usize {
    50
}
fn default_max_reading() -> f64 {
    8.0
}
fn default_min_element_significant_cluster() -> usize {
    10
}
fn default_max_time_passed_from_last_overlap() -> u64 {
    1000
}
fn default_overlap_threshold() -> u32 {
    1_000_000
}
fn default_prefix() -> String {
    "Agent".to_string()
}

/// Particle budget and process noise of the filters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterParameters {
    /// Name of the filter; readings are routed to the filter whose name matches their sensor.
    #[serde(default = "default_filter_name")]
    pub filter_name: String,
    pub particle_number: usize,
    /// Standard deviation of the position noise (m).
    pub sr0: f64,
    /// Standard deviation of the heading noise (rad).
    pub st0: f64,
    /// Particles sampled per reported estimate in the fusion layer.
    #[serde(default = "default_best_particles")]
    pub best_particles: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorModelParameters {
    pub sigma_rho: f64,
    pub sigma_theta: f64,
    pub default_linear_velocity: f64,
    /// Perceptions at or beyond this range (m) are discarded.
    #[serde(default = "default_max_reading")]
    pub max_reading: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldLocation {
    pub world_x_min: f64,
    pub world_x_max: f64,
    pub world_y_min: f64,
    pub world_y_max: f64,
    #[serde(default)]
    pub sensors: Vec<Pose2>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteringParameters {
    pub algorithm: ClusteringAlgorithm,
    /// Initial number of clusters for strategies that bound it.
    pub target_number: usize,
    #[serde(default = "default_min_element_significant_cluster")]
    pub min_element_significant_cluster: usize,
    /// Overlaps further apart than this (ms) restart the overlap count of two filters.
    #[serde(default = "default_max_time_passed_from_last_overlap")]
    pub max_time_passed_from_last_overlap: u64,
    /// Consecutive overlaps after which two filters of the bank are merged.
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: u32,
}

/// Distances (m) and time windows (ms) used by the tracking layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParameters {
    /// Association distance between observations, clusters and identities.
    pub closeness_threshold: f64,
    /// A pending observation not seen again within this window is forgotten.
    pub promotion_window_ms: u64,
    /// Minimum time a pending observation must persist before promotion.
    pub min_dwell_ms: u64,
    /// Identities not updated for longer than this are evicted.
    pub deletion_timeout_ms: u64,
    /// Age beyond which history samples stop counting.
    pub history_validity_ms: u64,
    pub history_clean_interval_ms: u64,
    /// Filters of the bank inactive for longer than this are removed.
    pub filter_validity_ms: u64,
    /// All clusters with a position sigma at least this large trigger a reset.
    pub reinit_sigma_threshold: f64,
    /// Weight lost per second of age by a reported estimate in the fusion layer.
    pub fusion_decay_factor: f64,
}
impl Default for TimingParameters {
    fn default() -> Self {
        TimingParameters {
            closeness_threshold: 1.2,
            promotion_window_ms: 1000,
            min_dwell_ms: 500,
            deletion_timeout_ms: 300,
            history_validity_ms: 5000,
            history_clean_interval_ms: 1000,
            filter_validity_ms: 5000,
            reinit_sigma_threshold: 1.5,
            fusion_decay_factor: 0.15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}
impl Endpoint {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| {
                TrackingError::Config(format!(
                    "bad endpoint {}:{}: {}",
                    self.address, self.port, e
                ))
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub id: u32,
    pub address: String,
    pub port: u16,
}
impl AgentEndpoint {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            port: self.port,
        }
    }
}

/// Team layout and message rates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub agent_id: u32,
    /// Routing prefix prepended to every datagram.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Local estimates sent to teammates per second.
    pub message_frequency: f64,
    /// Fusion runs every `2000 / network_frequency` ms.
    pub network_frequency: f64,
    pub agents: Vec<AgentEndpoint>,
    #[serde(default)]
    pub viewer: Option<Endpoint>,
}
impl NetworkConfig {
    pub fn own_endpoint(&self) -> Option<&AgentEndpoint> {
        self.agents.iter().find(|a| a.id == self.agent_id)
    }
    pub fn peers(&self) -> impl Iterator<Item = &AgentEndpoint> + '_ {
        self.agents.iter().filter(|a| a.id != self.agent_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub parameters: FilterParameters,
    pub sensor_model: SensorModelParameters,
    pub location: WorldLocation,
    pub clustering: ClusteringParameters,
    #[serde(default)]
    pub timing: TimingParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}
impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            parameters: FilterParameters {
                filter_name: default_filter_name(),
                particle_number: 300,
                sr0: 0.1,
                st0: 0.05,
                best_particles: default_best_particles(),
                seed: default_seed(),
            },
            sensor_model: SensorModelParameters {
                sigma_rho: 0.5,
                sigma_theta: 0.1,
                default_linear_velocity: 1.0,
                max_reading: default_max_reading(),
            },
            location: WorldLocation {
                world_x_min: -5.0,
                world_x_max: 5.0,
                world_y_min: -4.0,
                world_y_max: 4.0,
                sensors: Vec::new(),
            },
            clustering: ClusteringParameters {
                algorithm: ClusteringAlgorithm::KClusterizer,
                target_number: 1,
                min_element_significant_cluster: default_min_element_significant_cluster(),
                max_time_passed_from_last_overlap: default_max_time_passed_from_last_overlap(),
                overlap_threshold: default_overlap_threshold(),
            },
            timing: TimingParameters::default(),
            network: None,
        }
    }
}

/// Serialization format of a configuration file, chosen by its extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}
impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(TrackingError::Config(format!(
                "'{}' is not a .json, .yaml, .yml or .toml file",
                path.display()
            ))),
        }
    }
}

impl TrackerConfig {
    /// Read and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let format = ConfigFormat::from_path(p)?;
        let bad = |e: &dyn Display| TrackingError::Config(format!("'{}': {}", p.display(), e));
        let text = fs::read_to_string(p).map_err(|e| bad(&e))?;
        let config: TrackerConfig = match format {
            ConfigFormat::Json => serde_json::from_str(&text).map_err(|e| bad(&e))?,
            ConfigFormat::Yaml => serde_yaml::from_str(&text).map_err(|e| bad(&e))?,
            ConfigFormat::Toml => toml::from_str(&text).map_err(|e| bad(&e))?,
        };
        config.validate()?;
        Ok(config)
    }
    /// Write the configuration, JSON pretty-printed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        let bad = |e: &dyn Display| TrackingError::Config(format!("'{}': {}", p.display(), e));
        let text = match ConfigFormat::from_path(p)? {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| bad(&e))?,
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| bad(&e))?,
            ConfigFormat::Toml => toml::to_string(self).map_err(|e| bad(&e))?,
        };
        fs::write(p, text)?;
        Ok(())
    }
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TrackingError::Config(msg));
        if self.parameters.particle_number == 0 {
            return invalid("parameters/particle_number must be positive".into());
        }
        if self.parameters.sr0 < 0.0 || self.parameters.st0 < 0.0 {
            return invalid("parameters/sr0 and parameters/st0 must not be negative".into());
        }
        if self.sensor_model.sigma_rho <= 0.0 {
            return invalid("sensor_model/sigma_rho must be positive".into());
        }
        let l = &self.location;
        if !(l.world_x_min < l.world_x_max && l.world_y_min < l.world_y_max) {
            return invalid(format!(
                "location: world bounds [{}, {}] x [{}, {}] are empty",
                l.world_x_min, l.world_x_max, l.world_y_min, l.world_y_max
            ));
        }
        if self.clustering.target_number == 0 {
            return invalid("clustering/target_number must be positive".into());
        }
        if let Some(network) = &self.network {
            if network.message_frequency <= 0.0 || network.network_frequency <= 0.0 {
                return invalid("network frequencies must be positive".into());
            }
            if network.own_endpoint().is_none() {
                return invalid(format!(
                    "network/agent_id {} is not listed in network/agents",
                    network.agent_id
                ));
            }
        }
        Ok(())
    }
    pub fn sensor_map(&self) -> SensorMap {
        let l = &self.location;
        let mut map = SensorMap::new(
            Point2::new(l.world_x_min, l.world_y_min),
            Point2::new(l.world_x_max, l.world_y_max),
        );
        for sensor in &l.sensors {
            map.insert_sensor(*sensor);
        }
        map
    }
    pub fn sensor_model(&self) -> BasicSensorModel {
        BasicSensorModel::new(
            self.sensor_model.sigma_rho,
            self.sensor_model.sigma_theta,
            self.sensor_model.default_linear_velocity,
            self.sensor_map(),
        )
    }
    pub fn process_noise(&self) -> ProcessNoise {
        ProcessNoise {
            position_std: self.parameters.sr0,
            heading_std: self.parameters.st0,
        }
    }
}
