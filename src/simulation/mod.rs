//! The simulation harness.
//!
//! Wires one routing agent per node to an ideal wireless medium, drives the
//! discrete-event loop, generates sensor traffic and accounts for datagrams
//! arriving at the sink. Scenes are JSON files listing node positions and
//! run parameters; the energy model charges the first-order radio cost for
//! every transmission and reception and stops delivering to depleted nodes.

pub mod energy;
pub mod network;
pub mod scene;
