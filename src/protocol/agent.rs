//! Round scheduler, cluster formation, forwarding and sleep control.
//!
//! The agent advances through timer-driven phases each round:
//!
//! ```text
//! round_timer -> election (+AD broadcast if elected)
//! advertise_timer -> members reply to the nearest head, or go steady
//!                    straight away when no head was heard
//! reply_timer -> heads carve the steady-state remainder into TDMA slots,
//!               unicast one time table per member and flush their queue
//! send_timer -> members wake at slot start, flush, and sleep at slot end
//! ```
//!
//! Roles never mix: the sink keeps only its round timer to reset per-round
//! state, heads forward straight to the destination, and members route via
//! their head only while their transmit window is open. Packets without a
//! route take the loopback detour into the deferred queue.

use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::engine::clock::{Duration, Instant};
use crate::engine::rng::UniformStream;
use crate::engine::scheduler::{Timer, TimerTicket};
use crate::net::{DataPacket, DeviceId, InterfaceAddress, Ipv4Header, Route, RouteDecision};

use super::config::ProtocolConfig;
use super::election::{election_threshold, run_election};
use super::packet::{
    AdvertiseHeader, ControlMessage, JoinReplyHeader, TimeTableHeader,
};
use super::rqueue::DeferredQueue;
use super::rtable::RoutingTable;
use super::{AgentContext, RoutingAgent};

/// The agent's timers. Each is one-shot and re-armed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Round boundary; fires every round duration.
    Round,
    /// End of the advertisement phase.
    Advertise,
    /// End of the join-reply phase.
    Reply,
    /// Slot boundary at a member: first firing opens the transmit window,
    /// the second closes it.
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    ClusterHead,
    Sink,
}

/// Per-round phase. Setup covers advertisement and join-reply; steady state
/// is the TDMA remainder of the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Steady,
}

/// A member's assigned transmit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAssignment {
    pub start: Instant,
    pub duration: Duration,
}

/// The nearest advertised head this round.
#[derive(Debug, Clone, Copy)]
struct NearestHead {
    addr: Ipv4Addr,
    distance_sq: f64,
}

/// Drop and failure counters surfaced to the harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCounters {
    /// Oldest entries evicted on deferred-queue overflow.
    pub queue_overflow_drops: u64,
    /// Deferred entries that expired before a route existed.
    pub queue_expired: u64,
    /// Control packets that failed to decode.
    pub decode_failures: u64,
    /// Time tables rejected because the slot start was not in the future.
    pub invalid_slots: u64,
    /// Control packets dropped because the role does not consume them.
    pub role_mismatch_drops: u64,
    /// Link-layer transmit errors reported by the MAC (informational).
    pub tx_errors: u64,
}

pub struct LeachAgent {
    config: ProtocolConfig,
    node_id: u32,
    position: (u32, u32),
    rng: UniformStream,

    role: Role,
    phase: Phase,
    round_index: u64,
    was_head_in_epoch: bool,
    seq_no: u32,

    my_addr: Ipv4Addr,
    sockets: Vec<InterfaceAddress>,
    broadcast_sockets: Vec<InterfaceAddress>,
    rtable: RoutingTable,
    queue: DeferredQueue,

    nearest_head: Option<NearestHead>,
    roster: Vec<Ipv4Addr>,
    assigned_slot: Option<SlotAssignment>,
    window_open: bool,
    slot_history: Vec<(u64, SlotAssignment)>,

    round_timer: Timer,
    advertise_timer: Timer,
    reply_timer: Timer,
    send_timer: Timer,

    counters: AgentCounters,
}

impl LeachAgent {
    /// Create the agent for one node. Node id 0 is the sink for the whole
    /// simulation; the position is read once from the mobility provider.
    pub fn new(config: ProtocolConfig, node_id: u32, position: (u32, u32), rng: UniformStream) -> Self {
        let role = if node_id == 0 { Role::Sink } else { Role::Member };
        let queue = DeferredQueue::new(config.max_queue_len, config.max_queue_time());
        let mut rtable = RoutingTable::new();
        rtable.add_loopback_route();
        LeachAgent {
            config,
            node_id,
            position,
            rng,
            role,
            phase: Phase::Setup,
            round_index: 0,
            was_head_in_epoch: false,
            seq_no: 0,
            my_addr: Ipv4Addr::UNSPECIFIED,
            sockets: Vec::new(),
            broadcast_sockets: Vec::new(),
            rtable,
            queue,
            nearest_head: None,
            roster: Vec::new(),
            assigned_slot: None,
            window_open: false,
            slot_history: Vec::new(),
            round_timer: Timer::new(),
            advertise_timer: Timer::new(),
            reply_timer: Timer::new(),
            send_timer: Timer::new(),
            counters: AgentCounters::default(),
        }
    }

    /// Begin protocol operation: the first round starts immediately.
    pub fn start(&mut self, ctx: &mut AgentContext) {
        self.arm(TimerKind::Round, Duration::ZERO, ctx);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round_index(&self) -> u64 {
        self.round_index
    }

    pub fn counters(&self) -> AgentCounters {
        self.counters
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn nearest_head_addr(&self) -> Option<Ipv4Addr> {
        self.nearest_head.map(|h| h.addr)
    }

    pub fn assigned_slot(&self) -> Option<SlotAssignment> {
        self.assigned_slot
    }

    /// Slot assignments accepted so far, by round.
    pub fn slot_history(&self) -> &[(u64, SlotAssignment)] {
        &self.slot_history
    }

    /// Link-layer transmit error reported by the MAC trace source. Purely
    /// informational; the protocol takes no action.
    pub fn notify_tx_error(&mut self) {
        self.counters.tx_errors += 1;
    }

    fn timer_mut(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::Round => &mut self.round_timer,
            TimerKind::Advertise => &mut self.advertise_timer,
            TimerKind::Reply => &mut self.reply_timer,
            TimerKind::Send => &mut self.send_timer,
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, ctx: &mut AgentContext) {
        let ticket = self.timer_mut(kind).arm();
        ctx.schedule_timer(kind, ticket, delay);
    }

    /// Dispatch a timer firing. Stale tickets (superseded by cancel or
    /// re-arm) are ignored.
    pub fn handle_timer(&mut self, kind: TimerKind, ticket: TimerTicket, ctx: &mut AgentContext) {
        if !self.timer_mut(kind).try_fire(ticket) {
            return;
        }
        match kind {
            TimerKind::Round => self.on_round_timer(ctx),
            TimerKind::Advertise => self.on_advertise_timer(ctx),
            TimerKind::Reply => self.on_reply_timer(ctx),
            TimerKind::Send => self.on_send_timer(ctx),
        }
    }

    /// Start a new round: rotate roles, run the election, and kick off the
    /// advertisement phase.
    fn on_round_timer(&mut self, ctx: &mut AgentContext) {
        self.round_index += 1;
        self.roster.clear();
        self.phase = Phase::Setup;
        self.window_open = false;
        debug!("node {}: round {} begins", self.node_id, self.round_index);

        self.arm(TimerKind::Round, self.config.round_duration(), ctx);

        // The sink only keeps the round cadence; it never campaigns.
        if self.role == Role::Sink {
            return;
        }

        if self.role == Role::ClusterHead {
            self.role = Role::Member;
            self.was_head_in_epoch = true;
        }
        if self.round_index % self.config.epoch_rounds() == 0 {
            self.was_head_in_epoch = false;
        }

        self.nearest_head = None;
        self.assigned_slot = None;
        self.send_timer.cancel();
        // a member that slept through the end of the previous round listens
        // again from the top of the new one
        ctx.resume();

        let threshold = election_threshold(
            self.config.cluster_head_fraction,
            self.round_index,
            self.config.epoch_rounds(),
            self.was_head_in_epoch,
        );
        if run_election(&mut self.rng, threshold) {
            self.role = Role::ClusterHead;
            info!(
                "node {}: elected cluster head for round {}",
                self.node_id, self.round_index
            );
            self.send_advertisement(ctx);
        }

        self.arm(TimerKind::Advertise, self.config.advertise_duration(), ctx);
    }

    /// End of the advertisement phase: members commit to a head or give up
    /// on clustering for this round.
    fn on_advertise_timer(&mut self, ctx: &mut AgentContext) {
        if self.role == Role::Member {
            if self.nearest_head.is_some() {
                self.send_join_reply(ctx);
            } else {
                debug!(
                    "node {}: no head heard in round {}, going steady standalone",
                    self.node_id, self.round_index
                );
                self.phase = Phase::Steady;
                self.flush_queue(ctx);
            }
        }
        self.arm(TimerKind::Reply, self.config.reply_duration(), ctx);
    }

    /// End of the join-reply phase: heads hand out slots and flush.
    fn on_reply_timer(&mut self, ctx: &mut AgentContext) {
        if self.role == Role::ClusterHead {
            self.send_time_tables(ctx);
            self.flush_queue(ctx);
        }
        self.phase = Phase::Steady;
    }

    /// Slot boundary at a member: the first firing opens the window, the
    /// second closes it.
    fn on_send_timer(&mut self, ctx: &mut AgentContext) {
        if !self.window_open && self.phase == Phase::Steady {
            debug!("node {}: transmit window opens", self.node_id);
            ctx.resume();
            self.window_open = true;
            self.flush_queue(ctx);
            if let Some(slot) = self.assigned_slot {
                self.arm(TimerKind::Send, slot.duration, ctx);
            }
        } else {
            debug!("node {}: transmit window closes", self.node_id);
            self.window_open = false;
            ctx.set_sleep();
        }
    }

    /// Broadcast this head's advertisement on every interface.
    fn send_advertisement(&mut self, ctx: &mut AgentContext) {
        self.seq_no += 1;
        for iface in &self.sockets {
            let ad = ControlMessage::Advertise(AdvertiseHeader {
                origin: iface.local,
                origin_seq: self.seq_no,
                x: self.position.0,
                y: self.position.1,
            });
            let destination = iface.broadcast();
            ctx.send_datagram(iface.local, destination, ad.encode());
        }
    }

    /// Unicast a join reply to the chosen head, jittered into the first half
    /// of the reply phase so replies from one cluster do not collide.
    fn send_join_reply(&mut self, ctx: &mut AgentContext) {
        let Some(head) = self.nearest_head else {
            return;
        };
        let jitter_ms = self
            .rng
            .range_inclusive(1, (self.config.reply_duration_ms / 2).max(1));
        for iface in &self.sockets {
            let reply = ControlMessage::JoinReply(JoinReplyHeader {
                origin: self.my_addr,
                head: head.addr,
            });
            ctx.send_datagram_after(
                Duration::from_millis(jitter_ms),
                iface.local,
                head.addr,
                reply.encode(),
            );
        }
    }

    /// Split the steady-state remainder of the round into equal slots, one
    /// per roster entry, and unicast the assignments.
    fn send_time_tables(&mut self, ctx: &mut AgentContext) {
        let steady_ms = self.config.round_duration_ms
            - self.config.advertise_duration_ms
            - self.config.reply_duration_ms;
        let width_ms = steady_ms / (self.roster.len() as u64 + 1);
        let now = ctx.now();
        debug!(
            "node {}: slot width {} ms for {} members",
            self.node_id,
            width_ms,
            self.roster.len()
        );

        for (i, member) in self.roster.iter().enumerate() {
            let start = now + Duration::from_millis((i as u64 + 1) * width_ms);
            info!(
                "node {}: member {} gets slot [{}, {})",
                self.node_id,
                member,
                start,
                start + Duration::from_millis(width_ms)
            );
            for iface in &self.sockets {
                let tt = ControlMessage::TimeTable(TimeTableHeader {
                    origin: self.my_addr,
                    destination: *member,
                    slot_start_ms: start.as_millis() as u32,
                    slot_duration_ms: width_ms as u32,
                });
                ctx.send_datagram(iface.local, *member, tt.encode());
            }
        }
    }

    /// Drain the deferred queue onto the route that exists now. Expired
    /// entries are reported upstream instead of transmitted.
    fn flush_queue(&mut self, ctx: &mut AgentContext) {
        let now = ctx.now();
        let (ready, expired) = self.queue.drain_all(now);
        for entry in expired {
            self.counters.queue_expired += 1;
            debug!(
                "node {}: deferred packet {} expired after {}",
                self.node_id,
                entry.packet.uid,
                now.duration_since(entry.queued_at)
            );
            ctx.notify_dropped(entry.packet, entry.header);
        }
        for entry in ready {
            let mut packet = entry.packet;
            let mut header = entry.header;
            let gateway = match self.nearest_head {
                Some(head) if self.role != Role::ClusterHead => head.addr,
                _ => header.destination,
            };
            let route = Route {
                destination: header.destination,
                gateway,
                source: self.my_addr,
                output_device: DeviceId::Wireless,
            };
            header.source = route.source;
            // compensate the extra TTL decrement of the loopback detour
            header.ttl = header.ttl.saturating_add(1);
            packet.deferred_route = false;
            ctx.forward_unicast(route, packet, header);
        }
    }

    /// Receive one LEACH control datagram from a socket. `receiver` is the
    /// local address the datagram arrived on (the unicast binding or the
    /// subnet broadcast).
    pub fn receive_control(
        &mut self,
        bytes: &[u8],
        sender: Ipv4Addr,
        receiver: Ipv4Addr,
        ctx: &mut AgentContext,
    ) {
        if !self.owns_socket_for(receiver) {
            debug!(
                "node {}: control packet for unknown socket {}, dropping",
                self.node_id, receiver
            );
            return;
        }
        match ControlMessage::decode(bytes) {
            Err(err) => {
                self.counters.decode_failures += 1;
                debug!(
                    "node {}: undecodable control packet from {}: {}",
                    self.node_id, sender, err
                );
            }
            Ok(ControlMessage::Advertise(ad)) => self.recv_advertise(ad, sender),
            Ok(ControlMessage::JoinReply(reply)) => self.recv_join_reply(reply, sender),
            Ok(ControlMessage::TimeTable(tt)) => self.recv_time_table(tt, sender, ctx),
            Ok(ControlMessage::Data(_)) => {
                // data frames ride the data path; nothing to do here
            }
        }
    }

    fn owns_socket_for(&self, receiver: Ipv4Addr) -> bool {
        self.sockets.iter().any(|s| s.local == receiver)
            || self.broadcast_sockets.iter().any(|s| s.broadcast() == receiver)
    }

    /// A head announced itself: members keep whichever advertised head is
    /// closest, measured from the advertised coordinates.
    fn recv_advertise(&mut self, ad: AdvertiseHeader, sender: Ipv4Addr) {
        match self.role {
            Role::Sink => {
                self.counters.role_mismatch_drops += 1;
                debug!("node {}: sink ignores advertisement", self.node_id);
                return;
            }
            Role::ClusterHead => {
                debug!("node {}: head ignores advertisement from {}", self.node_id, sender);
                return;
            }
            Role::Member => {}
        }

        let dx = ad.x as f64 - self.position.0 as f64;
        let dy = ad.y as f64 - self.position.1 as f64;
        let distance_sq = dx * dx + dy * dy;
        let current = self
            .nearest_head
            .map(|h| h.distance_sq)
            .unwrap_or(f64::INFINITY);
        if distance_sq < current {
            debug!(
                "node {}: new nearest head {} at squared distance {:.1}",
                self.node_id, sender, distance_sq
            );
            self.nearest_head = Some(NearestHead {
                addr: sender,
                distance_sq,
            });
        }
    }

    /// A member asked to join this head's cluster.
    fn recv_join_reply(&mut self, reply: JoinReplyHeader, sender: Ipv4Addr) {
        if self.role != Role::ClusterHead {
            self.counters.role_mismatch_drops += 1;
            debug!(
                "node {}: join reply from {} but not a head, dropping",
                self.node_id, sender
            );
            return;
        }
        if self.phase != Phase::Setup {
            debug!(
                "node {}: join reply from {} outside the reply window, dropping",
                self.node_id, sender
            );
            return;
        }
        if self.roster.contains(&sender) {
            return;
        }
        debug!(
            "node {}: new cluster member {} (origin {})",
            self.node_id, sender, reply.origin
        );
        self.roster.push(sender);
    }

    /// This member's slot assignment arrived: record it, schedule the window
    /// and sleep until slot start.
    fn recv_time_table(&mut self, tt: TimeTableHeader, sender: Ipv4Addr, ctx: &mut AgentContext) {
        if self.role != Role::Member {
            self.counters.role_mismatch_drops += 1;
            debug!(
                "node {}: time table from {} but not a member, dropping",
                self.node_id, sender
            );
            return;
        }
        if tt.destination != self.my_addr {
            debug!(
                "node {}: time table addressed to {}, dropping",
                self.node_id, tt.destination
            );
            return;
        }

        let start = Instant::from_millis(tt.slot_start_ms as u64);
        let now = ctx.now();
        if start <= now {
            self.counters.invalid_slots += 1;
            warn!(
                "node {}: slot start {} is not in the future, falling back to direct delivery",
                self.node_id, start
            );
            self.nearest_head = None;
            self.assigned_slot = None;
            self.phase = Phase::Steady;
            self.flush_queue(ctx);
            return;
        }

        let slot = SlotAssignment {
            start,
            duration: Duration::from_millis(tt.slot_duration_ms as u64),
        };
        debug!(
            "node {}: slot [{}, {}) from head {}",
            self.node_id,
            slot.start,
            slot.start + slot.duration,
            sender
        );
        self.assigned_slot = Some(slot);
        self.slot_history.push((self.round_index, slot));

        self.send_timer.cancel();
        self.arm(TimerKind::Send, start.duration_since(now), ctx);
        // nothing to do until the slot opens
        ctx.set_sleep();
        self.phase = Phase::Steady;
    }

    fn direct_route(&self, destination: Ipv4Addr) -> Route {
        Route {
            destination,
            gateway: destination,
            source: self.my_addr,
            output_device: DeviceId::Wireless,
        }
    }

    fn head_route(&self, destination: Ipv4Addr, gateway: Ipv4Addr) -> Route {
        Route {
            destination,
            gateway,
            source: self.my_addr,
            output_device: DeviceId::Wireless,
        }
    }
}

impl RoutingAgent for LeachAgent {
    fn route_output(
        &mut self,
        packet: &mut DataPacket,
        header: &Ipv4Header,
        _ctx: &mut AgentContext,
    ) -> RouteDecision {
        match self.role {
            // heads and the sink always reach their destination directly
            Role::ClusterHead | Role::Sink => {
                RouteDecision::Unicast(self.direct_route(header.destination))
            }
            Role::Member => {
                match (self.phase, self.nearest_head) {
                    // join replies travel to the head while setup lasts
                    (Phase::Setup, Some(head)) if header.destination == head.addr => {
                        return RouteDecision::Unicast(self.direct_route(header.destination));
                    }
                    // standalone member: best effort straight to the sink
                    (Phase::Steady, None) => {
                        return RouteDecision::Unicast(self.direct_route(header.destination));
                    }
                    // clustered member inside its slot: via the head
                    (Phase::Steady, Some(head)) if self.window_open => {
                        return RouteDecision::Unicast(
                            self.head_route(header.destination, head.addr),
                        );
                    }
                    _ => {}
                }
                debug!(
                    "node {}: no route to {} yet, deferring",
                    self.node_id, header.destination
                );
                packet.deferred_route = true;
                RouteDecision::DeferLoopback
            }
        }
    }

    fn route_input(
        &mut self,
        packet: DataPacket,
        header: Ipv4Header,
        input_device: DeviceId,
        ctx: &mut AgentContext,
    ) -> bool {
        if self.sockets.is_empty() {
            debug!("node {}: no interfaces up, dropping", self.node_id);
            return false;
        }

        // a tagged packet looping back is a deferred route request
        if input_device == DeviceId::Loopback && packet.deferred_route {
            if let Some(evicted) = self.queue.push(packet, header, ctx.now()) {
                self.counters.queue_overflow_drops += 1;
                debug!(
                    "node {}: deferred queue full, dropped oldest packet {}",
                    self.node_id, evicted.packet.uid
                );
            }
            return true;
        }

        if self.role == Role::ClusterHead {
            let route = self.direct_route(header.destination);
            debug!(
                "node {}: forwarding packet {} from {} toward {}",
                self.node_id, packet.uid, header.source, header.destination
            );
            ctx.forward_unicast(route, packet, header);
            return true;
        }

        debug!(
            "node {}: not a head, dropping packet {} for {}",
            self.node_id, packet.uid, header.destination
        );
        false
    }

    fn notify_interface_up(&mut self, iface: InterfaceAddress, _ctx: &mut AgentContext) {
        if iface.local.is_loopback() {
            return;
        }
        debug!(
            "node {}: interface {} up, control sockets on udp/{}",
            self.node_id,
            iface.local,
            crate::net::LEACH_PORT
        );
        self.my_addr = iface.local;
        // one unicast and one subnet-broadcast socket per interface
        self.sockets.push(iface);
        self.broadcast_sockets.push(iface);
        self.rtable.add_broadcast_route(iface);
    }

    fn notify_interface_down(&mut self, iface: InterfaceAddress, _ctx: &mut AgentContext) {
        debug!("node {}: interface {} down", self.node_id, iface.local);
        self.sockets.retain(|s| *s != iface);
        self.broadcast_sockets.retain(|s| *s != iface);
        self.rtable.remove_interface_routes(iface);
        if self.sockets.is_empty() {
            self.round_timer.cancel();
            self.advertise_timer.cancel();
            self.reply_timer.cancel();
            self.send_timer.cancel();
            self.rtable.clear();
        }
    }

    fn write_routing_table(&self, now: Instant, out: &mut String) {
        use std::fmt::Write;

        let _ = writeln!(
            out,
            "Node: {}; Time: {}, LEACH routing table",
            self.node_id, now
        );
        self.rtable.write(now, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::net::APP_TTL;

    fn iface(last: u8) -> InterfaceAddress {
        InterfaceAddress::new(Ipv4Addr::new(10, 1, 1, last), 24)
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, last)
    }

    fn agent_with(node_id: u32, p: f64) -> LeachAgent {
        let config = ProtocolConfig {
            cluster_head_fraction: p,
            ..ProtocolConfig::default()
        };
        let mut rng = UniformStream::new(0xFEED);
        rng.assign_stream(node_id as u64);
        let mut agent = LeachAgent::new(config, node_id, (10 * node_id, 0), rng);
        let mut ctx = AgentContext::new(Instant::ZERO);
        agent.notify_interface_up(iface((node_id + 1) as u8), &mut ctx);
        agent
    }

    /// Drive the agent's own timers (ignoring transmissions) until `until`.
    fn run_timers(agent: &mut LeachAgent, start: Instant, until: Instant) -> Vec<Command> {
        use crate::engine::scheduler::EventScheduler;

        let mut sched: EventScheduler<(TimerKind, TimerTicket)> = EventScheduler::new();
        let mut out = Vec::new();
        let mut ctx = AgentContext::new(start);
        agent.start(&mut ctx);
        let mut pending = ctx.take_commands();
        loop {
            for command in pending.drain(..) {
                match command {
                    Command::ScheduleTimer { kind, ticket, delay } => {
                        sched.schedule_after(delay, (kind, ticket));
                    }
                    other => out.push(other),
                }
            }
            match sched.peek_deadline() {
                Some(at) if at <= until => {
                    let (now, (kind, ticket)) = sched.pop_due().unwrap();
                    let mut ctx = AgentContext::new(now);
                    agent.handle_timer(kind, ticket, &mut ctx);
                    pending = ctx.take_commands();
                }
                _ => break,
            }
        }
        out
    }

    #[test]
    fn node_zero_is_the_sink_forever() {
        let mut agent = agent_with(0, 1.0);
        assert_eq!(agent.role(), Role::Sink);
        run_timers(&mut agent, Instant::ZERO, Instant::from_secs(10));
        assert_eq!(agent.role(), Role::Sink);
        assert!(agent.round_index() >= 3);
    }

    #[test]
    fn certain_election_broadcasts_an_advertisement() {
        let mut agent = agent_with(1, 1.0);
        let commands = run_timers(&mut agent, Instant::ZERO, Instant::from_millis(1));
        assert_eq!(agent.role(), Role::ClusterHead);

        let ad = commands.iter().find_map(|c| match c {
            Command::SendDatagram { destination, payload, .. } => {
                match ControlMessage::decode(payload) {
                    Ok(ControlMessage::Advertise(ad)) => Some((*destination, ad)),
                    _ => None,
                }
            }
            _ => None,
        });
        let (destination, ad) = ad.expect("advertisement broadcast");
        assert_eq!(destination, Ipv4Addr::new(10, 1, 1, 255));
        assert_eq!(ad.origin, addr(2));
        assert_eq!(ad.x, 10);
    }

    #[test]
    fn head_rotates_out_after_its_round() {
        // P = 0.25 gives a four-round epoch. Within each epoch window the
        // exclusion flag allows at most one election, and the saturating
        // threshold in the window's last round forces at least one.
        let mut agent = agent_with(3, 0.25);
        let mut ctx = AgentContext::new(Instant::ZERO);
        agent.start(&mut ctx);
        let mut head_rounds = Vec::new();
        let mut pending = ctx.take_commands();
        let mut now = Instant::ZERO;
        for _ in 0..11 {
            let (ticket, delay) = pending
                .iter()
                .find_map(|c| match c {
                    Command::ScheduleTimer { kind: TimerKind::Round, ticket, delay } => {
                        Some((*ticket, *delay))
                    }
                    _ => None,
                })
                .expect("round timer armed");
            now = now + delay;
            let mut ctx = AgentContext::new(now);
            agent.handle_timer(TimerKind::Round, ticket, &mut ctx);
            pending = ctx.take_commands();
            if agent.role() == Role::ClusterHead {
                head_rounds.push(agent.round_index());
            }
        }
        // epoch windows between flag resets: [1,3], [4,7], [8,11]
        for window in [(1u64, 3u64), (4, 7), (8, 11)] {
            let count = head_rounds
                .iter()
                .filter(|r| (window.0..=window.1).contains(*r))
                .count();
            assert_eq!(count, 1, "window {window:?} in {head_rounds:?}");
        }
    }

    #[test]
    fn member_tracks_the_closest_head() {
        let mut agent = agent_with(2, 0.000_001);
        // position of node 2 is (20, 0)
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(5), origin_seq: 1, x: 100, y: 0 },
            addr(5),
        );
        assert_eq!(agent.nearest_head_addr(), Some(addr(5)));

        agent.recv_advertise(
            AdvertiseHeader { origin: addr(6), origin_seq: 1, x: 30, y: 0 },
            addr(6),
        );
        assert_eq!(agent.nearest_head_addr(), Some(addr(6)));

        // equal distance: the earlier record wins
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(7), origin_seq: 1, x: 10, y: 0 },
            addr(7),
        );
        assert_eq!(agent.nearest_head_addr(), Some(addr(6)));
    }

    #[test]
    fn sink_counts_advertisements_as_role_mismatch() {
        let mut agent = agent_with(0, 0.05);
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(5), origin_seq: 1, x: 1, y: 1 },
            addr(5),
        );
        assert_eq!(agent.counters().role_mismatch_drops, 1);
        assert_eq!(agent.nearest_head_addr(), None);
    }

    #[test]
    fn join_replies_build_the_roster_in_arrival_order() {
        let mut agent = agent_with(1, 1.0);
        run_timers(&mut agent, Instant::ZERO, Instant::from_millis(1));
        assert_eq!(agent.role(), Role::ClusterHead);

        for member in [4u8, 2, 9] {
            agent.recv_join_reply(
                JoinReplyHeader { origin: addr(member), head: addr(2) },
                addr(member),
            );
        }
        // duplicates are ignored
        agent.recv_join_reply(JoinReplyHeader { origin: addr(4), head: addr(2) }, addr(4));
        assert_eq!(agent.roster, vec![addr(4), addr(2), addr(9)]);
    }

    #[test]
    fn slot_assignments_are_disjoint_and_fill_the_steady_phase() {
        let mut agent = agent_with(1, 1.0);
        run_timers(&mut agent, Instant::ZERO, Instant::from_millis(1));
        for member in 3..7u8 {
            agent.recv_join_reply(
                JoinReplyHeader { origin: addr(member), head: addr(2) },
                addr(member),
            );
        }

        // reply phase ends 1.25 s into the round
        let now = Instant::from_millis(1_250);
        let mut ctx = AgentContext::new(now);
        agent.send_time_tables(&mut ctx);

        let mut slots = Vec::new();
        for command in ctx.take_commands() {
            if let Command::SendDatagram { payload, .. } = command {
                if let Ok(ControlMessage::TimeTable(tt)) = ControlMessage::decode(&payload) {
                    slots.push(tt);
                }
            }
        }
        assert_eq!(slots.len(), 4);
        // width = (3000 - 250 - 1000) / 5 = 350 ms
        for (i, tt) in slots.iter().enumerate() {
            assert_eq!(tt.slot_duration_ms, 350);
            assert_eq!(tt.slot_start_ms as u64, 1_250 + 350 * (i as u64 + 1));
        }
        // pairwise disjoint and inside [reply_end, round_end)
        for pair in slots.windows(2) {
            assert!(pair[0].slot_start_ms + pair[0].slot_duration_ms <= pair[1].slot_start_ms);
        }
        let last = slots.last().unwrap();
        assert!(last.slot_start_ms as u64 + last.slot_duration_ms as u64 <= 3_000);
    }

    #[test]
    fn join_reply_jitter_stays_in_the_first_half_of_the_reply_phase() {
        for node in 1..11u32 {
            let mut agent = agent_with(node, 0.000_001);
            agent.recv_advertise(
                AdvertiseHeader { origin: addr(99), origin_seq: 1, x: 0, y: 0 },
                addr(99),
            );
            let mut ctx = AgentContext::new(Instant::from_millis(250));
            agent.send_join_reply(&mut ctx);
            let delays: Vec<Duration> = ctx
                .take_commands()
                .into_iter()
                .filter_map(|c| match c {
                    Command::SendDatagram { delay, .. } => Some(delay),
                    _ => None,
                })
                .collect();
            assert!(!delays.is_empty());
            for delay in delays {
                assert!(delay >= Duration::from_millis(1));
                assert!(delay <= Duration::from_millis(500));
            }
        }
    }

    #[test]
    fn past_slot_start_falls_back_to_direct_delivery() {
        let mut agent = agent_with(2, 0.000_001);
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(9), origin_seq: 1, x: 25, y: 0 },
            addr(9),
        );
        let mut ctx = AgentContext::new(Instant::from_millis(2_000));
        agent.recv_time_table(
            TimeTableHeader {
                origin: addr(9),
                destination: addr(3),
                slot_start_ms: 1_500,
                slot_duration_ms: 350,
            },
            addr(9),
            &mut ctx,
        );
        assert_eq!(agent.counters().invalid_slots, 1);
        assert_eq!(agent.assigned_slot(), None);
        assert_eq!(agent.nearest_head_addr(), None);
        assert_eq!(agent.phase(), Phase::Steady);
    }

    #[test]
    fn accepted_slot_schedules_window_and_sleeps() {
        let mut agent = agent_with(2, 0.000_001);
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(9), origin_seq: 1, x: 25, y: 0 },
            addr(9),
        );
        let mut ctx = AgentContext::new(Instant::from_millis(1_250));
        agent.recv_time_table(
            TimeTableHeader {
                origin: addr(9),
                destination: addr(3),
                slot_start_ms: 1_600,
                slot_duration_ms: 350,
            },
            addr(9),
            &mut ctx,
        );
        let slot = agent.assigned_slot().expect("slot accepted");
        assert_eq!(slot.start, Instant::from_millis(1_600));
        assert_eq!(slot.duration, Duration::from_millis(350));
        assert_eq!(agent.phase(), Phase::Steady);

        let commands = ctx.take_commands();
        assert!(commands.iter().any(|c| matches!(c, Command::SetSleep)));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::ScheduleTimer { kind: TimerKind::Send, delay, .. }
                if *delay == Duration::from_millis(350)
        )));
    }

    #[test]
    fn window_opens_flushes_and_closes_after_the_slot() {
        let mut agent = agent_with(2, 0.000_001);
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(9), origin_seq: 1, x: 25, y: 0 },
            addr(9),
        );

        // one packet waits in the queue
        let header = Ipv4Header {
            source: addr(3),
            destination: addr(1),
            ttl: APP_TTL,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::from_millis(500));
        let mut packet = DataPacket::new(11, vec![0; 8]);
        packet.deferred_route = true;
        agent.route_input(packet, header, DeviceId::Loopback, &mut ctx);

        // slot arrives: [1600, 1950)
        let mut ctx = AgentContext::new(Instant::from_millis(1_250));
        agent.recv_time_table(
            TimeTableHeader {
                origin: addr(9),
                destination: addr(3),
                slot_start_ms: 1_600,
                slot_duration_ms: 350,
            },
            addr(9),
            &mut ctx,
        );
        let open_ticket = ctx
            .take_commands()
            .into_iter()
            .find_map(|c| match c {
                Command::ScheduleTimer { kind: TimerKind::Send, ticket, .. } => Some(ticket),
                _ => None,
            })
            .expect("window-open timer armed");

        // slot start: wake, flush via the head, re-arm for slot end
        let mut ctx = AgentContext::new(Instant::from_millis(1_600));
        agent.handle_timer(TimerKind::Send, open_ticket, &mut ctx);
        let commands = ctx.take_commands();
        assert!(commands.iter().any(|c| matches!(c, Command::Resume)));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::ForwardData { route, .. } if route.gateway == addr(9)
        )));
        let close_ticket = commands
            .iter()
            .find_map(|c| match c {
                Command::ScheduleTimer { kind: TimerKind::Send, ticket, delay } => {
                    assert_eq!(*delay, Duration::from_millis(350));
                    Some(*ticket)
                }
                _ => None,
            })
            .expect("window-close timer armed");
        assert!(agent.window_open);

        // slot end: back to sleep
        let mut ctx = AgentContext::new(Instant::from_millis(1_950));
        agent.handle_timer(TimerKind::Send, close_ticket, &mut ctx);
        let commands = ctx.take_commands();
        assert!(commands.iter().any(|c| matches!(c, Command::SetSleep)));
        assert!(!agent.window_open);
    }

    #[test]
    fn route_output_decision_matrix() {
        let sink = addr(1);
        let header = Ipv4Header {
            source: addr(3),
            destination: sink,
            ttl: APP_TTL,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::ZERO);

        // head: always direct
        let mut head = agent_with(1, 1.0);
        run_timers(&mut head, Instant::ZERO, Instant::from_millis(1));
        let mut packet = DataPacket::new(1, vec![0; 8]);
        match head.route_output(&mut packet, &header, &mut ctx) {
            RouteDecision::Unicast(route) => assert_eq!(route.gateway, sink),
            other => panic!("head should route directly, got {other:?}"),
        }

        // member in setup with a head, destination not the head: defer
        let mut member = agent_with(2, 0.000_001);
        member.recv_advertise(
            AdvertiseHeader { origin: addr(9), origin_seq: 1, x: 25, y: 0 },
            addr(9),
        );
        let mut packet = DataPacket::new(2, vec![0; 8]);
        assert_eq!(
            member.route_output(&mut packet, &header, &mut ctx),
            RouteDecision::DeferLoopback
        );
        assert!(packet.deferred_route);

        // same member, destination is the head: direct (join-reply path)
        let to_head = Ipv4Header { destination: addr(9), ..header };
        let mut packet = DataPacket::new(3, vec![0; 8]);
        match member.route_output(&mut packet, &to_head, &mut ctx) {
            RouteDecision::Unicast(route) => assert_eq!(route.gateway, addr(9)),
            other => panic!("setup reply should be direct, got {other:?}"),
        }

        // steady with open window: via the head
        member.phase = Phase::Steady;
        member.window_open = true;
        let mut packet = DataPacket::new(4, vec![0; 8]);
        match member.route_output(&mut packet, &header, &mut ctx) {
            RouteDecision::Unicast(route) => {
                assert_eq!(route.gateway, addr(9));
                assert_eq!(route.destination, sink);
            }
            other => panic!("open window should route via head, got {other:?}"),
        }

        // steady with closed window: defer
        member.window_open = false;
        let mut packet = DataPacket::new(5, vec![0; 8]);
        assert_eq!(
            member.route_output(&mut packet, &header, &mut ctx),
            RouteDecision::DeferLoopback
        );

        // steady standalone: direct
        member.nearest_head = None;
        let mut packet = DataPacket::new(6, vec![0; 8]);
        match member.route_output(&mut packet, &header, &mut ctx) {
            RouteDecision::Unicast(route) => assert_eq!(route.gateway, sink),
            other => panic!("standalone member should be direct, got {other:?}"),
        }
    }

    #[test]
    fn deferred_packets_loop_back_into_the_queue() {
        let mut agent = agent_with(2, 0.000_001);
        let header = Ipv4Header {
            source: addr(3),
            destination: addr(1),
            ttl: APP_TTL,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::ZERO);

        let mut packet = DataPacket::new(1, vec![0; 8]);
        packet.deferred_route = true;
        assert!(agent.route_input(packet, header, DeviceId::Loopback, &mut ctx));
        assert_eq!(agent.queue_len(), 1);

        // untagged wireless packet at a member is dropped
        let packet = DataPacket::new(2, vec![0; 8]);
        assert!(!agent.route_input(packet, header, DeviceId::Wireless, &mut ctx));
    }

    #[test]
    fn head_forwards_wireless_packets_toward_destination() {
        let mut agent = agent_with(1, 1.0);
        run_timers(&mut agent, Instant::ZERO, Instant::from_millis(1));
        let header = Ipv4Header {
            source: addr(5),
            destination: addr(1),
            ttl: 63,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::from_millis(100));
        let packet = DataPacket::new(1, vec![0; 8]);
        assert!(agent.route_input(packet, header, DeviceId::Wireless, &mut ctx));
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ForwardData { route, header, .. }] => {
                assert_eq!(route.gateway, addr(1));
                // forwarding does not touch the TTL; the link layer does
                assert_eq!(header.ttl, 63);
            }
            other => panic!("expected one forward, got {other:?}"),
        }
    }

    #[test]
    fn flush_rewrites_gateway_and_bumps_ttl() {
        let mut agent = agent_with(2, 0.000_001);
        agent.recv_advertise(
            AdvertiseHeader { origin: addr(9), origin_seq: 1, x: 25, y: 0 },
            addr(9),
        );
        let header = Ipv4Header {
            source: addr(3),
            destination: addr(1),
            ttl: APP_TTL,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::ZERO);
        let mut packet = DataPacket::new(7, vec![0; 8]);
        packet.deferred_route = true;
        agent.route_input(packet, header, DeviceId::Loopback, &mut ctx);

        agent.phase = Phase::Steady;
        let mut ctx = AgentContext::new(Instant::from_millis(1_600));
        agent.flush_queue(&mut ctx);
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ForwardData { route, packet, header }] => {
                assert_eq!(route.gateway, addr(9));
                assert_eq!(header.ttl, APP_TTL + 1);
                assert!(!packet.deferred_route);
            }
            other => panic!("expected one forward, got {other:?}"),
        }
    }

    #[test]
    fn expired_entries_are_reported_not_transmitted() {
        let mut agent = agent_with(2, 0.000_001);
        let header = Ipv4Header {
            source: addr(3),
            destination: addr(1),
            ttl: APP_TTL,
            protocol: 17,
        };
        let mut ctx = AgentContext::new(Instant::ZERO);
        let mut packet = DataPacket::new(8, vec![0; 8]);
        packet.deferred_route = true;
        agent.route_input(packet, header, DeviceId::Loopback, &mut ctx);

        agent.phase = Phase::Steady;
        agent.nearest_head = None;
        let mut ctx = AgentContext::new(Instant::from_secs(40));
        agent.flush_queue(&mut ctx);
        let commands = ctx.take_commands();
        assert!(commands.iter().any(|c| matches!(c, Command::NotifyDropped { .. })));
        assert!(!commands.iter().any(|c| matches!(c, Command::ForwardData { .. })));
        assert_eq!(agent.counters().queue_expired, 1);
    }

    #[test]
    fn interface_down_closes_sockets_and_cancels_timers() {
        let mut agent = agent_with(2, 0.05);
        let mut ctx = AgentContext::new(Instant::ZERO);
        agent.start(&mut ctx);
        agent.notify_interface_down(iface(3), &mut ctx);
        assert!(agent.sockets.is_empty());
        assert!(!agent.round_timer.is_armed());

        let mut out = String::new();
        agent.write_routing_table(Instant::ZERO, &mut out);
        assert!(out.contains("(0 entries"));
    }

    #[test]
    fn routing_table_dump_shows_broadcast_record() {
        let agent = agent_with(4, 0.05);
        let mut out = String::new();
        agent.write_routing_table(Instant::from_secs(1), &mut out);
        assert!(out.contains("Node: 4"));
        assert!(out.contains("10.1.1.255"));
        assert!(out.contains("127.0.0.1"));
    }
}
