//! PTRACK SIM: synthetic scenarios for the ptrack-rs multi-target tracker.
//!
//! This program can operate in three modes: track, team, and config.
//!
//! - Track mode: generates a scenario of moving targets seen by one robot and runs either the
//!   single robot tracker or the bank of filters over it, writing the estimates to CSV. Several
//!   trials with different seeds can be run in parallel.
//!
//! - Team mode: runs a team of agents on localhost, each with its own tracker, UDP listener and
//!   fusion loop, and logs the team estimate every agent converges to.
//!
//! - Config mode: writes a template configuration file (TOML/JSON/YAML).

mod common;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use common::{init_logger, trial_output_path, validate_output_path};
use log::{error, info, warn};
use nalgebra::{Point2, Vector2};
use ptrack::config::{AgentEndpoint, NetworkConfig, TrackerConfig};
use ptrack::estimator::{HostInput, TeamEstimate, TeamEstimator};
use ptrack::network::UdpTransport;
use ptrack::sim::{
    ScenarioConfig, ScenarioRecord, TargetMotion, TrackingResult, run_bank, run_object_filter,
};
use ptrack::{Pose2, Timestamp};
use rayon::prelude::*;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const LONG_ABOUT: &str = "PTRACK SIM: synthetic scenarios for the ptrack-rs multi-target tracker.

This program can operate in three modes: track, team, and config.

- Track mode: generates a scenario of moving targets seen by one robot and runs either the
  single robot tracker or the bank of filters over it, writing the estimates to CSV.

- Team mode: runs a team of agents on localhost, each with its own tracker, UDP listener and
  fusion loop, and logs the team estimate every agent converges to.

Tracker parameters are read from a configuration file (TOML/JSON/YAML) given with --config;
built-in defaults are used otherwise.";

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Synthetic scenarios for the ptrack-rs multi-target tracker.",
    long_about = LONG_ABOUT
)]
struct Cli {
    /// Tracker configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

const TRACK_LONG_ABOUT: &str = "Generate a scenario of targets moving at constant velocity inside \
the configured world, seen by a static robot, and track it. By default the identity-preserving \
tracker is used; --bank runs the bank of filters instead and reports its significant clusters.";

const TEAM_LONG_ABOUT: &str = "Run several agents in one process. Every agent tracks the same \
targets from its own pose, sends its estimates to its teammates over UDP and fuses the reports \
it receives.";

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "track",
        about = "Track a synthetic scenario with a single robot",
        long_about = TRACK_LONG_ABOUT
    )]
    Track(TrackArgs),
    #[command(
        name = "team",
        about = "Run a team of agents on localhost",
        long_about = TEAM_LONG_ABOUT
    )]
    Team(TeamArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ScenarioArgs {
    /// Target as x,y,vx,vy (m, m/s). Repeat for several targets.
    #[arg(short, long = "target", value_parser = parse_target)]
    targets: Vec<TargetMotion>,

    /// Scenario length in milliseconds
    #[arg(long, default_value_t = 5_000)]
    duration_ms: u64,

    /// Time between frames in milliseconds
    #[arg(long, default_value_t = 100)]
    step_ms: u64,

    /// Standard deviation (m) of the perception noise
    #[arg(long, default_value_t = 0.05)]
    noise: f64,

    /// Probability that a target is missed in a frame
    #[arg(long, default_value_t = 0.0)]
    miss_probability: f64,

    /// Seed of the scenario generator
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct TrackArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Output CSV file path. With several trials, outputs are named {output_stem}_{trial}.csv
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Also write the generated ground truth and perceptions to this CSV file
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Use the bank of filters instead of the identity-preserving tracker
    #[arg(long)]
    bank: bool,

    /// Number of trials, each with its own scenario seed
    #[arg(long, default_value_t = 1)]
    trials: u64,

    /// Run trials in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Clone, Debug)]
struct TeamArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Number of agents
    #[arg(long, default_value_t = 3)]
    agents: u32,

    /// UDP port of the first agent; the others use the following ports
    #[arg(long, default_value_t = 17001)]
    base_port: u16,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output path; the extension selects the format (toml, json, yaml)
    #[arg(short, long, default_value = "parameters.toml")]
    output: PathBuf,
}

fn parse_target(value: &str) -> Result<TargetMotion, String> {
    let fields = value
        .split(',')
        .map(|f| f.trim().parse::<f64>().map_err(|e| format!("'{}': {}", f, e)))
        .collect::<Result<Vec<_>, _>>()?;
    match fields.as_slice() {
        [x, y] => Ok(TargetMotion {
            start: Point2::new(*x, *y),
            velocity: Vector2::zeros(),
        }),
        [x, y, vx, vy] => Ok(TargetMotion {
            start: Point2::new(*x, *y),
            velocity: Vector2::new(*vx, *vy),
        }),
        _ => Err(format!("expected x,y or x,y,vx,vy, got '{}'", value)),
    }
}

impl ScenarioArgs {
    fn scenario(&self, robot_pose: Pose2, seed: u64) -> ScenarioConfig {
        let mut scenario = ScenarioConfig {
            robot_pose,
            duration_ms: self.duration_ms,
            step_ms: self.step_ms,
            perception_noise: self.noise,
            miss_probability: self.miss_probability,
            seed,
            ..Default::default()
        };
        if !self.targets.is_empty() {
            scenario.targets = self.targets.clone();
        }
        scenario
    }
}

fn world(config: &TrackerConfig) -> (Point2<f64>, Point2<f64>) {
    let location = &config.location;
    (
        Point2::new(location.world_x_min, location.world_y_min),
        Point2::new(location.world_x_max, location.world_y_max),
    )
}

fn load_config(path: Option<&PathBuf>) -> Result<TrackerConfig> {
    match path {
        Some(path) => {
            let config = TrackerConfig::load(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            info!("loaded configuration from {}", path.display());
            Ok(config)
        }
        None => {
            info!("no configuration given, using defaults");
            Ok(TrackerConfig::default())
        }
    }
}

fn run_trial(config: &TrackerConfig, args: &TrackArgs, trial: u64) -> TrackingResult {
    let frames = args
        .scenario
        .scenario(Pose2::default(), args.scenario.seed + trial)
        .generate(world(config));
    if args.bank {
        run_bank(config, &frames)
    } else {
        run_object_filter(config, &frames)
    }
}

fn run_track(config: &TrackerConfig, args: &TrackArgs) -> Result<()> {
    validate_output_path(&args.output)?;
    if args.trials == 0 {
        bail!("at least one trial is required");
    }
    if let Some(path) = &args.frames {
        validate_output_path(path)?;
        let frames = args
            .scenario
            .scenario(Pose2::default(), args.scenario.seed)
            .generate(world(config));
        ScenarioRecord::to_csv(&ScenarioRecord::from_frames(&frames), path)
            .with_context(|| format!("failed to write frames to {}", path.display()))?;
        info!("wrote {} frames to {}", frames.len(), path.display());
    }

    info!(
        "running {} trial(s) with {}",
        args.trials,
        if args.bank { "the bank of filters" } else { "the object particle filter" }
    );
    let results: Vec<(u64, TrackingResult)> = if args.parallel {
        (0..args.trials)
            .into_par_iter()
            .map(|trial| (trial, run_trial(config, args, trial)))
            .collect()
    } else {
        (0..args.trials)
            .map(|trial| (trial, run_trial(config, args, trial)))
            .collect()
    };

    let start_ms = ScenarioConfig::default().start_ms;
    for (trial, result) in &results {
        let output = if args.trials > 1 {
            trial_output_path(&args.output, *trial)
        } else {
            args.output.clone()
        };
        result
            .to_csv(&output)
            .with_context(|| format!("failed to write results to {}", output.display()))?;
        match result.mean_error_since(start_ms) {
            Some(error) => info!(
                "trial {}: {} identities, mean error {:.3} m, written to {}",
                trial,
                result.identity_count(),
                error,
                output.display()
            ),
            None => warn!("trial {}: no estimates, written to {}", trial, output.display()),
        }
    }
    Ok(())
}

/// Configuration of one team member: same tracker, its own id in a shared agent table.
fn agent_config(base: &TrackerConfig, args: &TeamArgs, agent_id: u32) -> TrackerConfig {
    let network = base.network.clone();
    let mut config = base.clone();
    config.network = Some(NetworkConfig {
        agent_id,
        prefix: network.as_ref().map(|n| n.prefix.clone()).unwrap_or_else(|| "Agent".to_string()),
        message_frequency: network.as_ref().map(|n| n.message_frequency).unwrap_or(10.0),
        network_frequency: network.as_ref().map(|n| n.network_frequency).unwrap_or(5.0),
        agents: (0..args.agents)
            .map(|i| AgentEndpoint {
                id: i + 1,
                address: "127.0.0.1".to_string(),
                port: args.base_port + i as u16,
            })
            .collect(),
        viewer: network.and_then(|n| n.viewer),
    });
    config
}

/// Agents stand along the bottom edge of the world, looking up.
fn agent_pose(config: &TrackerConfig, agent: u32, agents: u32) -> Pose2 {
    let (min, max) = world(config);
    let fraction = (agent as f64 + 1.0) / (agents as f64 + 1.0);
    Pose2::new(
        min.x + (max.x - min.x) * fraction,
        min.y,
        std::f64::consts::FRAC_PI_2,
    )
}

fn run_agent(config: TrackerConfig, args: &TeamArgs, agent: u32) -> Result<TeamEstimate> {
    let pose = agent_pose(&config, agent, args.agents);
    let frames = args
        .scenario
        .scenario(pose, args.scenario.seed + agent as u64)
        .generate(world(&config));
    let mut estimator = TeamEstimator::new(&config)?.with_transport(UdpTransport::new()?);
    let listener = estimator.start_listener()?;
    let step = Duration::from_millis(args.scenario.step_ms);
    let mut estimate = TeamEstimate::default();
    for frame in &frames {
        estimate = estimator.update(&HostInput {
            robot_pose: frame.robot_pose,
            pose_validity: 1.0,
            perceptions: frame.perceptions.clone(),
            now: frame.now,
        });
        thread::sleep(step);
    }
    listener.shutdown();
    info!(
        "agent {}: local {:?}, fused {:?}",
        agent + 1,
        estimator.local_estimations().keys().collect::<Vec<_>>(),
        estimator.fused_estimations().keys().collect::<Vec<_>>()
    );
    Ok(estimate)
}

fn run_team(config: &TrackerConfig, args: &TeamArgs) -> Result<()> {
    if args.agents == 0 {
        bail!("at least one agent is required");
    }
    info!(
        "running {} agents on ports {}..{}",
        args.agents,
        args.base_port,
        args.base_port as u32 + args.agents - 1
    );
    let started = Timestamp::now();
    let estimates = thread::scope(|scope| {
        let handles: Vec<_> = (0..args.agents)
            .map(|agent| {
                let config = agent_config(config, args, agent + 1);
                scope.spawn(move || run_agent(config, args, agent))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("agent thread panicked"))
                    .and_then(|result| result)
            })
            .collect::<Result<Vec<_>>>()
    })?;
    for (agent, estimate) in estimates.iter().enumerate() {
        let team = estimate.multi_robot;
        if team.valid {
            info!(
                "agent {} team estimate ({:.2}, {:.2}) variance {:.2}",
                agent + 1,
                team.x,
                team.y,
                team.variance
            );
        } else {
            warn!("agent {} has no valid team estimate", agent + 1);
        }
    }
    info!("team run took {} ms", Timestamp::now() - started);
    Ok(())
}

fn create_config_file(args: &ConfigArgs) -> Result<()> {
    validate_output_path(&args.output)?;
    let mut config = TrackerConfig::default();
    config.network = Some(NetworkConfig {
        agent_id: 1,
        prefix: "Agent".to_string(),
        message_frequency: 10.0,
        network_frequency: 5.0,
        agents: (1..=3)
            .map(|id| AgentEndpoint {
                id,
                address: "127.0.0.1".to_string(),
                port: 17000 + id as u16,
            })
            .collect(),
        viewer: None,
    });
    config
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("configuration template written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let outcome = match &cli.command {
        Command::CreateConfig(args) => create_config_file(args),
        Command::Track(args) => {
            load_config(cli.config.as_ref()).and_then(|config| run_track(&config, args))
        }
        Command::Team(args) => {
            load_config(cli.config.as_ref()).and_then(|config| run_team(&config, args))
        }
    };
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
