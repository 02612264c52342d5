//! Scene loading, parsing, and validation.

use std::fmt;
use std::fs;

use serde::Deserialize;

use crate::protocol::ProtocolConfig;

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneError {}

/// Simple 2D point in meters.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One node in the scene. Node id 0 is the sink.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSpec {
    pub node_id: u32,
    pub position: Point,
}

/// Sensor application traffic parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct TrafficConfig {
    /// Application payload size in bytes.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Spacing between datagrams from one sensor.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// When the applications start sending.
    #[serde(default = "default_start_ms")]
    pub start_ms: u64,
    /// Maximum datagrams per sensor; 0 means unlimited.
    #[serde(default)]
    pub max_packets: u64,
}

fn default_packet_size() -> usize {
    1024
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_start_ms() -> u64 {
    1_000
}

impl Default for TrafficConfig {
    fn default() -> Self {
        TrafficConfig {
            packet_size: default_packet_size(),
            interval_ms: default_interval_ms(),
            start_ms: default_start_ms(),
            max_packets: 0,
        }
    }
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize)]
pub struct Scene {
    /// All nodes present in the scene.
    pub nodes: Vec<NodeSpec>,
    /// Protocol parameters; every field is optional in the file.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Sensor traffic parameters.
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Base seed for every random stream in the run.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulation stop time.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Battery capacity per sensor node in joules.
    #[serde(default = "default_initial_energy")]
    pub initial_energy_j: f64,
}

fn default_seed() -> u64 {
    1
}

fn default_duration_ms() -> u64 {
    100_000
}

fn default_initial_energy() -> f64 {
    25.0
}

impl Scene {
    /// Load and validate a scene from a JSON file.
    pub fn load(path: &str) -> Result<Scene, SceneError> {
        let data =
            fs::read_to_string(path).map_err(|err| SceneError::FileReadError(err.to_string()))?;
        let scene: Scene =
            serde_json::from_str(&data).map_err(|err| SceneError::ParseError(err.to_string()))?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn validate(&self) -> Result<(), SceneError> {
        if self.nodes.is_empty() {
            return Err(SceneError::ValidationError("scene has no nodes".into()));
        }
        if !self.nodes.iter().any(|n| n.node_id == 0) {
            return Err(SceneError::ValidationError(
                "scene has no sink (node id 0)".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id) {
                return Err(SceneError::ValidationError(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
            if node.node_id > 253 {
                return Err(SceneError::ValidationError(format!(
                    "node id {} does not fit the /24 address plan",
                    node.node_id
                )));
            }
            if node.position.x < 0.0 || node.position.y < 0.0 {
                return Err(SceneError::ValidationError(format!(
                    "node {} has a negative coordinate",
                    node.node_id
                )));
            }
        }
        self.protocol
            .validate()
            .map_err(SceneError::ValidationError)?;
        if self.traffic.packet_size < 12 {
            return Err(SceneError::ValidationError(
                "packet_size must fit the 12-octet data framing".into(),
            ));
        }
        Ok(())
    }
}
