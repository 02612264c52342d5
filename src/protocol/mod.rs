//! The LEACH routing agent.
//!
//! One agent runs per node. The node hosting address `10.1.1.1` (node id 0)
//! is the sink; every other node starts as a member and may elect itself
//! cluster head for a round. The agent is fully event-driven: timer firings
//! and control-packet receptions run to completion and their side effects
//! (datagram transmissions, timer re-arms, PHY sleep hints, error
//! notifications) are buffered as [`Command`]s on an [`AgentContext`] and
//! applied by the event loop after the handler returns.
//!
//! The seam to the host stack is the [`RoutingAgent`] trait: route
//! resolution for locally originated packets, the receive path for
//! forwarded and looped-back packets, interface notifications and the
//! routing-table dump. The simulator clock and the agent's random stream are
//! injected at construction; nothing here touches global state.

pub mod agent;
pub mod config;
pub mod election;
pub mod packet;
pub mod rqueue;
pub mod rtable;

use std::net::Ipv4Addr;

use crate::engine::clock::{Duration, Instant};
use crate::engine::scheduler::TimerTicket;
use crate::net::{DataPacket, DeviceId, InterfaceAddress, Ipv4Header, Route, RouteDecision};

pub use agent::{AgentCounters, LeachAgent, Phase, Role, SlotAssignment, TimerKind};
pub use config::ProtocolConfig;

/// A side effect requested by an agent handler, applied by the event loop
/// after the handler returns.
#[derive(Debug)]
pub enum Command {
    /// Transmit a UDP control datagram from a local socket binding.
    /// `delay` is the sender-side jitter before the datagram leaves.
    SendDatagram {
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: Vec<u8>,
        delay: Duration,
    },
    /// Hand a data packet to the link layer on a resolved route (the
    /// unicast-forward callback of the host stack).
    ForwardData {
        route: Route,
        packet: DataPacket,
        header: Ipv4Header,
    },
    /// Fire `kind` for this agent after `delay`, carrying the arm ticket.
    ScheduleTimer {
        kind: TimerKind,
        ticket: TimerTicket,
        delay: Duration,
    },
    /// PHY hint: suspend the radio.
    SetSleep,
    /// PHY hint: resume the radio.
    Resume,
    /// A queued packet expired; the upper layer may release its buffer (the
    /// error callback of the host stack).
    NotifyDropped {
        packet: DataPacket,
        header: Ipv4Header,
    },
}

/// Per-invocation handler context: the current virtual time plus the
/// command buffer.
#[derive(Debug)]
pub struct AgentContext {
    now: Instant,
    commands: Vec<Command>,
}

impl AgentContext {
    pub fn new(now: Instant) -> Self {
        AgentContext {
            now,
            commands: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn send_datagram(&mut self, source: Ipv4Addr, destination: Ipv4Addr, payload: Vec<u8>) {
        self.send_datagram_after(Duration::ZERO, source, destination, payload);
    }

    pub fn send_datagram_after(
        &mut self,
        delay: Duration,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: Vec<u8>,
    ) {
        self.commands.push(Command::SendDatagram {
            source,
            destination,
            payload,
            delay,
        });
    }

    pub fn forward_unicast(&mut self, route: Route, packet: DataPacket, header: Ipv4Header) {
        self.commands.push(Command::ForwardData {
            route,
            packet,
            header,
        });
    }

    pub fn schedule_timer(&mut self, kind: TimerKind, ticket: TimerTicket, delay: Duration) {
        self.commands.push(Command::ScheduleTimer {
            kind,
            ticket,
            delay,
        });
    }

    pub fn set_sleep(&mut self) {
        self.commands.push(Command::SetSleep);
    }

    pub fn resume(&mut self) {
        self.commands.push(Command::Resume);
    }

    pub fn notify_dropped(&mut self, packet: DataPacket, header: Ipv4Header) {
        self.commands.push(Command::NotifyDropped { packet, header });
    }

    /// Drain the buffered commands in emission order.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

/// The hooks a routing protocol implements toward the host IPv4 stack.
pub trait RoutingAgent {
    /// Resolve a route for a locally originated packet. Returning
    /// [`RouteDecision::DeferLoopback`] tags the packet and sends it through
    /// the loopback device so the stack re-offers it via
    /// [`RoutingAgent::route_input`].
    fn route_output(
        &mut self,
        packet: &mut DataPacket,
        header: &Ipv4Header,
        ctx: &mut AgentContext,
    ) -> RouteDecision;

    /// Handle a packet offered by the stack's receive path. Returns `true`
    /// if the packet was consumed (queued or forwarded), `false` to drop.
    fn route_input(
        &mut self,
        packet: DataPacket,
        header: Ipv4Header,
        input_device: DeviceId,
        ctx: &mut AgentContext,
    ) -> bool;

    fn notify_interface_up(&mut self, iface: InterfaceAddress, ctx: &mut AgentContext);

    fn notify_interface_down(&mut self, iface: InterfaceAddress, ctx: &mut AgentContext);

    /// Append a human-readable routing-table dump to `out`.
    fn write_routing_table(&self, now: Instant, out: &mut String);
}
