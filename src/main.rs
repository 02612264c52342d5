//! # LEACH WSN Simulator - Main Entry Point
//!
//! A discrete-event simulator for a wireless sensor network running the
//! LEACH (Low-Energy Adaptive Clustering Hierarchy) routing protocol.
//!
//! ## Purpose
//!
//! Every sensor node hosts one routing agent. Per round, a random subset of
//! nodes elects itself cluster head, announces itself, collects join
//! replies, and carves the steady-state remainder of the round into TDMA
//! slots for its members. Members sleep outside their slot and push their
//! sensor readings to the head, which forwards straight to the sink (the
//! base station at node id 0). The simulator runs the whole network in one
//! process on a virtual clock, charges a first-order radio energy model for
//! every transmission, and reports what the sink actually saw.
//!
//! ## Architecture Overview
//!
//! - `engine`: virtual clock, ordered event queue, cancellable timers,
//!   deterministic random streams, trace sources.
//! - `net`: the seam between agents and the host stack (headers, routes,
//!   the `RoutingAgent` trait).
//! - `protocol`: the LEACH agent: codec, election, deferred queue, round
//!   state machine, forwarding.
//! - `simulation`: the harness: scenes, ideal medium, energy model,
//!   applications and sink accounting.
//!
//! Scenes are JSON files; an optional `config.toml` next to the scene file
//! overrides protocol parameters.

use anyhow::Context;
use env_logger::Builder;
use log::{LevelFilter, debug, info, warn};

mod engine;
mod net;
mod protocol;
mod simulation;

use crate::protocol::ProtocolConfig;
use crate::simulation::network::Network;
use crate::simulation::scene::Scene;

/// Scene used when no path is given on the command line.
const DEFAULT_SCENE_PATH: &str = "scenes/field.json";

fn main() -> anyhow::Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("leach_wsn_simulator"), LevelFilter::Debug)
        .init();

    info!("Starting up");

    let scene_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SCENE_PATH.to_string());
    let mut scene = Scene::load(&scene_path)
        .with_context(|| format!("failed to load scene {scene_path}"))?;
    info!("Loaded scene {} with {} nodes", scene_path, scene.nodes.len());

    // protocol overrides live next to the scene file
    let config_path = ProtocolConfig::config_path_from_scene(&scene_path);
    if config_path.exists() {
        match ProtocolConfig::load(&config_path) {
            Ok(config) => {
                info!("Applying protocol overrides from {}", config_path.display());
                scene.protocol = config;
            }
            Err(err) => warn!("Ignoring {}: {}", config_path.display(), err),
        }
    }

    let mut network = Network::from_scene(&scene).context("failed to build the network")?;
    let report = network.run();

    info!(
        "sink received {} datagrams, lost {}",
        report.datagrams_received, report.datagrams_lost
    );
    info!("depleted nodes: {}", report.depleted_nodes);
    for (node_id, remaining) in &report.remaining_energy {
        info!("node {}: {:.4} J remaining", node_id, remaining);
    }
    let counters = network.aggregate_counters();
    info!(
        "drops: {} queue overflows, {} expirations, {} undecodable, {} invalid slots",
        counters.queue_overflow_drops,
        counters.queue_expired,
        counters.decode_failures,
        counters.invalid_slots
    );
    if let Some(dump) = network.routing_table_dump(0) {
        debug!("{}", dump.trim_end());
    }

    Ok(())
}
