//! Trivial routing table.
//!
//! Forwarding is role-driven, so this table is never consulted on the data
//! path. It records only the loopback route installed at agent creation and
//! one subnet-broadcast record per up interface, and it backs the
//! human-readable routing-table dump.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::engine::clock::Instant;
use crate::net::{DeviceId, InterfaceAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub destination: Ipv4Addr,
    pub next_hop: Ipv4Addr,
    pub interface: InterfaceAddress,
    pub output_device: DeviceId,
    /// `None` means the route lives for the whole simulation.
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: BTreeMap<Ipv4Addr, RoutingTableEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    /// Install the loopback record.
    pub fn add_loopback_route(&mut self) {
        let loopback = Ipv4Addr::LOCALHOST;
        self.entries.insert(
            loopback,
            RoutingTableEntry {
                destination: loopback,
                next_hop: loopback,
                interface: InterfaceAddress::new(loopback, 8),
                output_device: DeviceId::Loopback,
                expires_at: None,
            },
        );
    }

    /// Install the subnet-broadcast record for an interface that came up.
    pub fn add_broadcast_route(&mut self, iface: InterfaceAddress) {
        let broadcast = iface.broadcast();
        self.entries.insert(
            broadcast,
            RoutingTableEntry {
                destination: broadcast,
                next_hop: broadcast,
                interface: iface,
                output_device: DeviceId::Wireless,
                expires_at: None,
            },
        );
    }

    /// Drop every record that was installed for `iface`.
    pub fn remove_interface_routes(&mut self, iface: InterfaceAddress) {
        self.entries.retain(|_, entry| entry.interface != iface);
    }

    pub fn lookup(&self, destination: Ipv4Addr) -> Option<&RoutingTableEntry> {
        self.entries.get(&destination)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a human-readable dump to `out`.
    pub fn write(&self, now: Instant, out: &mut String) {
        use std::fmt::Write;

        let _ = writeln!(out, "  Destination      Gateway          Iface            Expires");
        for entry in self.entries.values() {
            let expires = match entry.expires_at {
                Some(at) => at.to_string(),
                None => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "  {:<16} {:<16} {:<16} {}",
                entry.destination, entry.next_hop, entry.interface.local, expires
            );
        }
        let _ = writeln!(out, "  ({} entries at {})", self.entries.len(), now);
    }
}
