//! Central event loop driving the simulation.
//!
//! High-level flow each iteration:
//! 1) Pop the earliest event from the scheduler (same-instant events pop in
//!    insertion order, which is the ordering contract the agents rely on).
//! 2) Dispatch it: a timer firing or packet arrival runs the owning agent's
//!    handler to completion.
//! 3) Apply the commands the handler buffered: datagram transmissions fan
//!    out over the ideal medium, timer re-arms go back into the scheduler,
//!    sleep hints toggle the radio, expired-queue notifications are logged.
//!
//! The medium is ideal: zero propagation delay, no collisions, delivery
//! gated only on the receiver being awake and not depleted. Every radio
//! operation draws from the node's battery; a depleted radio goes silent
//! both ways while its agent keeps running, none the wiser.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::cell::Cell;

use log::{debug, info, warn};

use crate::engine::clock::{Duration, Instant};
use crate::engine::rng::UniformStream;
use crate::engine::scheduler::{EventScheduler, TimerTicket};
use crate::net::{
    APP_TTL, DataPacket, DeviceId, InterfaceAddress, Ipv4Header, Route, RouteDecision,
    UDP_PROTOCOL,
};
use crate::protocol::packet::{ControlMessage, DataHeader};
use crate::protocol::{AgentContext, Command, LeachAgent, RoutingAgent, TimerKind};

use super::energy::{self, EnergySource};
use super::scene::{NodeSpec, Scene, SceneError, TrafficConfig};

/// Prefix length of the shared subnet.
const SUBNET_PREFIX_LEN: u8 = 24;

/// One simulated node: the agent plus its radio and application state.
struct SimNode {
    spec: NodeSpec,
    address: Ipv4Addr,
    agent: LeachAgent,
    energy: EnergySource,
    asleep: bool,
    app_next_seq: u32,
    app_sent: u64,
}

/// Events the loop dispatches.
#[derive(Debug)]
enum Event {
    /// An agent timer fires.
    Timer {
        node: usize,
        kind: TimerKind,
        ticket: TimerTicket,
    },
    /// A control datagram leaves a node's socket (after sender-side jitter).
    SocketSend {
        node: usize,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: Vec<u8>,
    },
    /// A control datagram arrives at a node's socket.
    ControlDelivery {
        node: usize,
        sender: Ipv4Addr,
        receiver: Ipv4Addr,
        payload: Vec<u8>,
    },
    /// A data frame arrives at a node's radio.
    DataDelivery {
        node: usize,
        packet: DataPacket,
        header: Ipv4Header,
    },
    /// A deferred packet comes back through the loopback device.
    LoopbackDelivery {
        node: usize,
        packet: DataPacket,
        header: Ipv4Header,
    },
    /// The sensor application emits its next datagram.
    AppSend { node: usize },
}

/// End-of-run summary.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub datagrams_received: u64,
    pub datagrams_lost: u64,
    pub depleted_nodes: u32,
    /// Remaining battery per sensor node, in scene order.
    pub remaining_energy: Vec<(u32, f64)>,
    pub finished_at: Instant,
}

pub struct Network {
    scheduler: EventScheduler<Event>,
    nodes: Vec<SimNode>,
    addr_index: HashMap<Ipv4Addr, usize>,
    traffic: TrafficConfig,
    stop_at: Instant,
    sink: usize,
    sink_address: Ipv4Addr,
    sink_last_seq: HashMap<Ipv4Addr, u32>,
    datagrams_received: u64,
    datagrams_lost: u64,
    depleted_nodes: Rc<Cell<u32>>,
    next_packet_uid: u64,
}

fn address_for(node_id: u32) -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 1, (node_id + 1) as u8)
}

impl Network {
    /// Build the network from a scene: one agent per node, interfaces up,
    /// round timers armed, applications scheduled.
    pub fn from_scene(scene: &Scene) -> Result<Self, SceneError> {
        scene.validate()?;

        let depleted_nodes = Rc::new(Cell::new(0u32));
        let mut nodes = Vec::with_capacity(scene.nodes.len());
        let mut addr_index = HashMap::new();
        let mut sink = 0;

        for (index, spec) in scene.nodes.iter().enumerate() {
            let address = address_for(spec.node_id);
            let mut rng = UniformStream::new(scene.seed);
            rng.assign_stream(spec.node_id as u64 + 1);

            let position = (spec.position.x as u32, spec.position.y as u32);
            let agent = LeachAgent::new(scene.protocol.clone(), spec.node_id, position, rng);

            // the sink runs from mains power; sensors carry the scene battery
            let mut energy = if spec.node_id == 0 {
                sink = index;
                EnergySource::new(f64::INFINITY)
            } else {
                EnergySource::new(scene.initial_energy_j)
            };
            let node_id = spec.node_id;
            let counter = Rc::clone(&depleted_nodes);
            energy.connect_remaining(move |old, new| {
                if old > 0.0 && new <= 0.0 {
                    warn!("node {} battery depleted", node_id);
                    counter.set(counter.get() + 1);
                }
            });

            addr_index.insert(address, index);
            nodes.push(SimNode {
                spec: spec.clone(),
                address,
                agent,
                energy,
                asleep: false,
                app_next_seq: 1,
                app_sent: 0,
            });
        }

        let mut network = Network {
            scheduler: EventScheduler::new(),
            nodes,
            addr_index,
            traffic: scene.traffic.clone(),
            stop_at: Instant::from_millis(scene.duration_ms),
            sink,
            sink_address: address_for(0),
            sink_last_seq: HashMap::new(),
            datagrams_received: 0,
            datagrams_lost: 0,
            depleted_nodes,
            next_packet_uid: 1,
        };

        // bring interface 0 up on every node and start the round machinery
        for index in 0..network.nodes.len() {
            let iface = InterfaceAddress::new(network.nodes[index].address, SUBNET_PREFIX_LEN);
            let mut ctx = AgentContext::new(Instant::ZERO);
            network.nodes[index].agent.notify_interface_up(iface, &mut ctx);
            network.nodes[index].agent.start(&mut ctx);
            let commands = ctx.take_commands();
            network.apply_commands(index, commands);
        }

        // sensor applications
        let start = Duration::from_millis(network.traffic.start_ms);
        for index in 0..network.nodes.len() {
            if index != network.sink {
                network
                    .scheduler
                    .schedule_after(start, Event::AppSend { node: index });
            }
        }

        Ok(network)
    }

    /// Run until the stop time and summarize.
    pub fn run(&mut self) -> SimulationReport {
        info!(
            "simulation starts: {} nodes, stopping at {}",
            self.nodes.len(),
            self.stop_at
        );
        while let Some(deadline) = self.scheduler.peek_deadline() {
            if deadline > self.stop_at {
                break;
            }
            let Some((now, event)) = self.scheduler.pop_due() else {
                break;
            };
            self.dispatch(now, event);
        }
        let report = self.report();
        info!(
            "simulation done at {}: {} received, {} lost, {} depleted",
            report.finished_at,
            report.datagrams_received,
            report.datagrams_lost,
            report.depleted_nodes
        );
        report
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            datagrams_received: self.datagrams_received,
            datagrams_lost: self.datagrams_lost,
            depleted_nodes: self.depleted_nodes.get(),
            remaining_energy: self
                .nodes
                .iter()
                .filter(|n| n.spec.node_id != 0)
                .map(|n| (n.spec.node_id, n.energy.remaining()))
                .collect(),
            finished_at: self.scheduler.now(),
        }
    }

    /// Human-readable routing table of one node, for the end-of-run dump.
    pub fn routing_table_dump(&self, node_id: u32) -> Option<String> {
        let node = self.nodes.iter().find(|n| n.spec.node_id == node_id)?;
        let mut out = String::new();
        node.agent.write_routing_table(self.scheduler.now(), &mut out);
        Some(out)
    }

    /// Aggregate drop/failure counters across every agent.
    pub fn aggregate_counters(&self) -> crate::protocol::AgentCounters {
        let mut total = crate::protocol::AgentCounters::default();
        for node in &self.nodes {
            let c = node.agent.counters();
            total.queue_overflow_drops += c.queue_overflow_drops;
            total.queue_expired += c.queue_expired;
            total.decode_failures += c.decode_failures;
            total.invalid_slots += c.invalid_slots;
            total.role_mismatch_drops += c.role_mismatch_drops;
            total.tx_errors += c.tx_errors;
        }
        total
    }

    fn dispatch(&mut self, now: Instant, event: Event) {
        match event {
            Event::Timer { node, kind, ticket } => {
                let mut ctx = AgentContext::new(now);
                self.nodes[node].agent.handle_timer(kind, ticket, &mut ctx);
                let commands = ctx.take_commands();
                self.apply_commands(node, commands);
            }
            Event::SocketSend {
                node,
                source,
                destination,
                payload,
            } => {
                self.medium_send(node, source, destination, payload);
            }
            Event::ControlDelivery {
                node,
                sender,
                receiver,
                payload,
            } => {
                if self.radio_silent(node) {
                    debug!(
                        "node {}: radio off, control packet from {} lost",
                        self.nodes[node].spec.node_id, sender
                    );
                    return;
                }
                let bits = (payload.len() * 8) as f64;
                self.nodes[node].energy.consume(energy::receive_energy(bits));

                let mut ctx = AgentContext::new(now);
                self.nodes[node]
                    .agent
                    .receive_control(&payload, sender, receiver, &mut ctx);
                let commands = ctx.take_commands();
                self.apply_commands(node, commands);
            }
            Event::DataDelivery {
                node,
                packet,
                header,
            } => {
                if self.radio_silent(node) {
                    debug!(
                        "node {}: radio off, data packet {} lost",
                        self.nodes[node].spec.node_id, packet.uid
                    );
                    return;
                }
                let bits = (packet.payload.len() * 8) as f64;
                self.nodes[node].energy.consume(energy::receive_energy(bits));

                if header.destination == self.nodes[node].address {
                    self.deliver_local(node, packet, header);
                    return;
                }
                let mut ctx = AgentContext::new(now);
                let consumed =
                    self.nodes[node]
                        .agent
                        .route_input(packet, header, DeviceId::Wireless, &mut ctx);
                if !consumed {
                    debug!(
                        "node {}: receive path dropped a data packet for {}",
                        self.nodes[node].spec.node_id, header.destination
                    );
                }
                let commands = ctx.take_commands();
                self.apply_commands(node, commands);
            }
            Event::LoopbackDelivery {
                node,
                packet,
                header,
            } => {
                let mut ctx = AgentContext::new(now);
                let consumed =
                    self.nodes[node]
                        .agent
                        .route_input(packet, header, DeviceId::Loopback, &mut ctx);
                if !consumed {
                    debug!(
                        "node {}: looped-back packet was not consumed, dropped",
                        self.nodes[node].spec.node_id
                    );
                }
                let commands = ctx.take_commands();
                self.apply_commands(node, commands);
            }
            Event::AppSend { node } => self.app_send(node, now),
        }
    }

    fn apply_commands(&mut self, node: usize, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::ScheduleTimer {
                    kind,
                    ticket,
                    delay,
                } => {
                    self.scheduler
                        .schedule_after(delay, Event::Timer { node, kind, ticket });
                }
                Command::SendDatagram {
                    source,
                    destination,
                    payload,
                    delay,
                } => {
                    self.scheduler.schedule_after(
                        delay,
                        Event::SocketSend {
                            node,
                            source,
                            destination,
                            payload,
                        },
                    );
                }
                Command::ForwardData {
                    route,
                    packet,
                    header,
                } => {
                    self.transmit_data(node, route, packet, header);
                }
                Command::SetSleep => {
                    self.nodes[node].asleep = true;
                }
                Command::Resume => {
                    self.nodes[node].asleep = false;
                }
                Command::NotifyDropped { packet, header } => {
                    debug!(
                        "node {}: upper layer told to release packet {} for {}",
                        self.nodes[node].spec.node_id, packet.uid, header.destination
                    );
                }
            }
        }
    }

    fn radio_silent(&self, node: usize) -> bool {
        self.nodes[node].asleep || self.nodes[node].energy.is_depleted()
    }

    fn distance(&self, a: usize, b: usize) -> f64 {
        let pa = self.nodes[a].spec.position;
        let pb = self.nodes[b].spec.position;
        let dx = pa.x - pb.x;
        let dy = pa.y - pb.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Put a control datagram on the air: broadcast fans out to every other
    /// node, unicast reaches exactly the addressee. Zero propagation delay.
    fn medium_send(
        &mut self,
        from: usize,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: Vec<u8>,
    ) {
        if self.nodes[from].energy.is_depleted() {
            debug!(
                "node {}: radio dead, datagram to {} not transmitted",
                self.nodes[from].spec.node_id, destination
            );
            return;
        }

        let bits = (payload.len() * 8) as f64;
        let is_broadcast = destination.is_broadcast() || destination.octets()[3] == 255;

        if is_broadcast {
            let recipients: Vec<usize> =
                (0..self.nodes.len()).filter(|&i| i != from).collect();
            let reach = recipients
                .iter()
                .map(|&i| self.distance(from, i))
                .fold(0.0, f64::max);
            self.nodes[from]
                .energy
                .consume(energy::transmit_energy(bits, reach));
            for index in recipients {
                self.scheduler.schedule_now(Event::ControlDelivery {
                    node: index,
                    sender: source,
                    receiver: destination,
                    payload: payload.clone(),
                });
            }
        } else {
            let Some(&target) = self.addr_index.get(&destination) else {
                debug!("no node owns {}, datagram dropped", destination);
                return;
            };
            let reach = self.distance(from, target);
            self.nodes[from]
                .energy
                .consume(energy::transmit_energy(bits, reach));
            self.scheduler.schedule_now(Event::ControlDelivery {
                node: target,
                sender: source,
                receiver: destination,
                payload,
            });
        }
    }

    /// Transmit a data frame one hop toward the route's gateway.
    fn transmit_data(&mut self, from: usize, route: Route, packet: DataPacket, header: Ipv4Header) {
        if self.nodes[from].energy.is_depleted() {
            debug!(
                "node {}: radio dead, data packet {} not transmitted",
                self.nodes[from].spec.node_id, packet.uid
            );
            return;
        }
        if header.ttl == 0 {
            debug!("packet {} ran out of TTL, dropped", packet.uid);
            return;
        }
        let mut header = header;
        header.ttl -= 1;

        let Some(&target) = self.addr_index.get(&route.gateway) else {
            debug!("no node owns gateway {}, packet dropped", route.gateway);
            return;
        };
        let bits = (packet.payload.len() * 8) as f64;
        let reach = self.distance(from, target);
        self.nodes[from]
            .energy
            .consume(energy::transmit_energy(bits, reach));

        // the MAC reports a transmit error when the next hop cannot hear;
        // the agent only counts it
        if self.radio_silent(target) {
            self.nodes[from].agent.notify_tx_error();
        }

        self.scheduler.schedule_now(Event::DataDelivery {
            node: target,
            packet,
            header,
        });
    }

    /// One sensor application tick: frame a reading, route it, reschedule.
    fn app_send(&mut self, node: usize, now: Instant) {
        let address = self.nodes[node].address;
        let seq = self.nodes[node].app_next_seq;
        self.nodes[node].app_next_seq += 1;
        self.nodes[node].app_sent += 1;

        let framing = ControlMessage::Data(DataHeader {
            origin: address,
            origin_seq: seq,
        });
        let mut payload = framing.encode();
        payload.resize(self.traffic.packet_size.max(payload.len()), 0);

        let mut packet = DataPacket::new(self.next_packet_uid, payload);
        self.next_packet_uid += 1;
        let mut header = Ipv4Header {
            source: address,
            destination: self.sink_address,
            ttl: APP_TTL,
            protocol: UDP_PROTOCOL,
        };

        let mut ctx = AgentContext::new(now);
        let decision = self.nodes[node]
            .agent
            .route_output(&mut packet, &header, &mut ctx);
        let commands = ctx.take_commands();
        self.apply_commands(node, commands);

        match decision {
            RouteDecision::Unicast(route) => {
                header.source = route.source;
                self.transmit_data(node, route, packet, header);
            }
            RouteDecision::DeferLoopback => {
                self.scheduler.schedule_now(Event::LoopbackDelivery {
                    node,
                    packet,
                    header,
                });
            }
        }

        let unlimited = self.traffic.max_packets == 0;
        if unlimited || self.nodes[node].app_sent < self.traffic.max_packets {
            self.scheduler.schedule_after(
                Duration::from_millis(self.traffic.interval_ms),
                Event::AppSend { node },
            );
        }
    }

    /// Local delivery at the addressee. Only the sink hosts a server; it
    /// counts received datagrams and infers losses from sequence gaps.
    fn deliver_local(&mut self, node: usize, packet: DataPacket, _header: Ipv4Header) {
        if node != self.sink {
            debug!(
                "node {}: unexpected local delivery of packet {}",
                self.nodes[node].spec.node_id, packet.uid
            );
            return;
        }
        match ControlMessage::decode(&packet.payload) {
            Ok(ControlMessage::Data(data)) => {
                let last = self.sink_last_seq.get(&data.origin).copied().unwrap_or(0);
                if data.origin_seq > last {
                    self.datagrams_lost += (data.origin_seq - last - 1) as u64;
                    self.sink_last_seq.insert(data.origin, data.origin_seq);
                }
                self.datagrams_received += 1;
                debug!(
                    "sink udp/{}: datagram {} from {} (seq {})",
                    crate::net::APP_PORT,
                    packet.uid,
                    data.origin,
                    data.origin_seq
                );
            }
            other => {
                debug!("sink: undecodable application payload: {:?}", other);
            }
        }
    }
}
