//! Server network layer: UDP transport, connection table and the single
//! event loop that owns the player registry.
//!
//! All registry mutation happens on the main `select!` loop, one event at a
//! time; spawned tasks only move packets. The connection table is the
//! transport-level view (who has a live socket address) and is what feeds
//! the ghost reconciler its active-connection snapshot.

use crate::combat;
use crate::reconciler::{GhostPolicy, GhostReconciler};
use crate::registry::{JoinAttributes, PlayerRegistry, RegistryEvent};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{timestamp_ms, LeaveReason, Packet, UpdateDelta};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// One live transport-level link.
#[derive(Debug)]
pub struct Connection {
    pub id: u32,
    pub addr: SocketAddr,
    /// Last time any packet (heartbeats included) arrived on this link.
    pub last_seen: Instant,
}

/// Transport-level roster: connection identity to socket address. Distinct
/// from the registry, which tracks player state; a connection can exist
/// here before (and briefly after) its registry record.
pub struct ConnectionTable {
    connections: HashMap<u32, Connection>,
    next_id: u32,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            max_connections,
        }
    }

    /// Admits a new link, or `None` at capacity. Ids are never reused.
    pub fn add(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(
            id,
            Connection {
                id,
                addr,
                last_seen: Instant::now(),
            },
        );
        Some(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        if self.connections.remove(&id).is_some() {
            info!("Connection {} closed", id);
            true
        } else {
            false
        }
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.connections
            .values()
            .find(|c| c.addr == addr)
            .map(|c| c.id)
    }

    pub fn touch(&mut self, id: u32) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_seen = Instant::now();
        }
    }

    pub fn addr_of(&self, id: u32) -> Option<SocketAddr> {
        self.connections.get(&id).map(|c| c.addr)
    }

    /// Snapshot of ids the transport currently believes are alive.
    pub fn active_ids(&self) -> HashSet<u32> {
        self.connections.keys().copied().collect()
    }

    pub fn addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.connections.values().map(|c| (c.id, c.addr)).collect()
    }

    /// Removes links silent for longer than `timeout` and returns their ids.
    /// Silence at the transport level is treated as an abrupt disconnect.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.last_seen.elapsed() > timeout)
            .map(|c| c.id)
            .collect();
        for id in &timed_out {
            self.remove(*id);
        }
        timed_out
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Messages sent from network tasks to the main server loop.
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ConnectionTimeout {
        id: u32,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the network sender task.
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<u32>,
    },
}

/// Tunable server timings.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub sweep_period: Duration,
    pub transport_timeout: Duration,
    pub ghost_policy: GhostPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            sweep_period: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(15),
            ghost_policy: GhostPolicy::default(),
        }
    }
}

/// Main server coordinating transport, registry and reconciliation.
pub struct Server {
    socket: Arc<UdpSocket>,
    connections: Arc<RwLock<ConnectionTable>>,
    registry: PlayerRegistry,
    reconciler: GhostReconciler,
    config: ServerConfig,
    next_update_id: u64,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            connections: Arc::new(RwLock::new(ConnectionTable::new(config.max_connections))),
            registry: PlayerRegistry::new(),
            reconciler: GhostReconciler::new(config.ghost_policy),
            config,
            next_update_id: 0,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    /// Spawns the task that continuously listens for incoming packets.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outgoing packet queue.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let connections = Arc::clone(&self.connections);
        let mut outbound_rx = std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastPacket { packet, exclude } => {
                        let addrs = {
                            let table = connections.read().await;
                            table.addrs()
                        };
                        for (id, addr) in addrs {
                            if Some(id) == exclude {
                                continue;
                            }
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to connection {}: {}", id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns the task that watches for silent transport links.
    fn spawn_timeout_checker(&self) {
        let connections = Arc::clone(&self.connections);
        let server_tx = self.server_tx.clone();
        let timeout = self.config.transport_timeout;

        tokio::spawn(async move {
            let mut check_interval = interval(Duration::from_secs(1));
            loop {
                check_interval.tick().await;
                let timed_out = {
                    let mut table = connections.write().await;
                    table.check_timeouts(timeout)
                };
                for id in timed_out {
                    if server_tx.send(ServerMessage::ConnectionTimeout { id }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
            .is_err()
        {
            error!("Outbound channel closed; dropping packet");
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if self
            .outbound_tx
            .send(OutboundMessage::BroadcastPacket { packet, exclude })
            .is_err()
        {
            error!("Outbound channel closed; dropping broadcast");
        }
    }

    /// Turns registry events into broadcasts. `origin` is the connection
    /// whose request produced the events; it already knows its own state,
    /// so joins and deltas skip it.
    fn dispatch_events(&mut self, events: Vec<RegistryEvent>, origin: Option<u32>) {
        for event in events {
            match event {
                RegistryEvent::Joined(player) => {
                    self.broadcast_packet(Packet::PlayerJoined { player }, origin);
                }
                RegistryEvent::Updated { id, delta } => {
                    self.next_update_id += 1;
                    self.broadcast_packet(
                        Packet::PlayerUpdated {
                            id,
                            delta,
                            server_timestamp: timestamp_ms(),
                            update_id: self.next_update_id,
                        },
                        origin,
                    );
                }
                RegistryEvent::Left { id, name, reason } => {
                    self.broadcast_packet(Packet::PlayerLeft { id, name, reason }, None);
                }
                RegistryEvent::HealthChanged { id, health } => {
                    self.broadcast_packet(Packet::HealthChanged { id, health }, None);
                }
                RegistryEvent::Defeated { id } => {
                    self.broadcast_packet(Packet::PlayerDefeated { id }, None);
                }
                RegistryEvent::Respawned { id, position } => {
                    self.broadcast_packet(Packet::PlayerRespawned { id, position }, None);
                }
            }
        }
    }

    /// Resolves the connection id for a source address, admitting the
    /// address as a new connection when unknown. New connections receive a
    /// ConnectAck and a Provisional registry record.
    async fn connection_for(&mut self, addr: SocketAddr) -> Option<u32> {
        let existing = {
            let table = self.connections.read().await;
            table.find_by_addr(addr)
        };
        if let Some(id) = existing {
            let mut table = self.connections.write().await;
            table.touch(id);
            return Some(id);
        }

        let (id, active_ids) = {
            let mut table = self.connections.write().await;
            let id = table.add(addr)?;
            (id, table.active_ids())
        };
        self.registry.create_provisional(id, Instant::now());
        self.send_packet(
            Packet::ConnectAck {
                client_id: id,
                server_time: timestamp_ms(),
                active_ids: active_ids.into_iter().collect(),
            },
            addr,
        );
        Some(id)
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let Some(id) = self.connection_for(addr).await else {
            warn!("Rejecting connection from {}: server full", addr);
            self.send_packet(
                Packet::ServerClose {
                    reason: "Server full".to_string(),
                },
                addr,
            );
            return;
        };

        match packet {
            Packet::Join {
                name,
                character,
                weapon,
                position,
                session_id,
            } => {
                // A rejoin carrying a known session token means a
                // predecessor record may still be lingering. Clean it up
                // before announcing the new identity.
                let reclaimed =
                    self.reconciler
                        .reclaim_session(&mut self.registry, &session_id, id);
                self.dispatch_events(reclaimed, None);

                let events = self.registry.register(
                    id,
                    JoinAttributes {
                        name,
                        character,
                        weapon,
                        position,
                        session_id,
                    },
                    Instant::now(),
                );
                self.dispatch_events(events, Some(id));

                // A rejoin over a still-live link never passes through
                // admission, so the ack is repeated here. Joins are
                // idempotent and so is this.
                let active_ids = {
                    let table = self.connections.read().await;
                    table.active_ids()
                };
                self.send_packet(
                    Packet::ConnectAck {
                        client_id: id,
                        server_time: timestamp_ms(),
                        active_ids: active_ids.into_iter().collect(),
                    },
                    addr,
                );

                let players = self.registry.snapshot(id);
                self.send_packet(Packet::SnapshotResponse { players }, addr);
            }

            Packet::PositionUpdate {
                position,
                rotation,
                flags,
                weapon,
                client_timestamp: _,
            } => {
                let delta = UpdateDelta {
                    position: Some(position),
                    rotation: Some(rotation),
                    flags: Some(flags),
                    weapon: Some(weapon),
                    name: None,
                };
                let events = self.registry.apply_update(id, &delta, Instant::now());
                self.dispatch_events(events, Some(id));
            }

            Packet::Attack { payload } => {
                if let Some((attacker_id, attack)) =
                    combat::on_attack(&mut self.registry, id, &payload, Instant::now())
                {
                    self.broadcast_packet(
                        Packet::AttackBroadcast { attacker_id, attack },
                        Some(id),
                    );
                }
            }

            Packet::DamageReport { target_id, amount } => {
                let events = combat::apply_damage(&mut self.registry, target_id, amount);
                self.dispatch_events(events, None);
            }

            Packet::RespawnRequest { position } => {
                let events = combat::respawn(&mut self.registry, id, position, Instant::now());
                self.dispatch_events(events, None);
            }

            Packet::RequestSnapshot => {
                let players = self.registry.snapshot(id);
                self.send_packet(Packet::SnapshotResponse { players }, addr);
            }

            Packet::HeartbeatPing { client_timestamp } => {
                self.send_packet(
                    Packet::HeartbeatPong {
                        client_timestamp,
                        server_timestamp: timestamp_ms(),
                    },
                    addr,
                );
            }

            Packet::Disconnect => {
                {
                    let mut table = self.connections.write().await;
                    table.remove(id);
                }
                let event = self.registry.remove(id, LeaveReason::Disconnect);
                self.dispatch_events(event.into_iter().collect(), None);
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Abrupt transport loss: the explicit disconnect signal. Registry
    /// cleanup is immediate, not deferred to the sweep.
    fn handle_connection_timeout(&mut self, id: u32) {
        debug!("Transport timeout for connection {}", id);
        let event = self.registry.remove(id, LeaveReason::TransportTimeout);
        self.dispatch_events(event.into_iter().collect(), None);
    }

    async fn run_ghost_sweep(&mut self) {
        let active = {
            let table = self.connections.read().await;
            table.active_ids()
        };
        let events = self
            .reconciler
            .sweep(&mut self.registry, &active, Instant::now());
        if !events.is_empty() {
            info!("Ghost sweep removed {} record(s)", events.len());
        }
        self.dispatch_events(events, None);
    }

    /// Main server loop coordinating all operations.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut sweep_interval = interval(self.config.sweep_period);
        // The first tick fires immediately; skip the pointless empty sweep.
        sweep_interval.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::ConnectionTimeout { id }) => {
                            self.handle_connection_timeout(id);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.broadcast_packet(
                                Packet::ServerClose { reason: "Server shutting down".to_string() },
                                None,
                            );
                            break;
                        }
                    }
                }

                _ = sweep_interval.tick() => {
                    self.run_ghost_sweep().await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:9101".parse().unwrap()
    }

    #[test]
    fn test_connection_table_admission() {
        let mut table = ConnectionTable::new(2);
        let id1 = table.add(test_addr()).unwrap();
        let id2 = table.add(test_addr2()).unwrap();

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_addr(test_addr()), Some(1));
        assert_eq!(table.addr_of(2), Some(test_addr2()));
    }

    #[test]
    fn test_connection_table_capacity() {
        let mut table = ConnectionTable::new(1);
        assert!(table.add(test_addr()).is_some());
        assert!(table.add(test_addr2()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_connection_ids_never_reused() {
        let mut table = ConnectionTable::new(4);
        let id1 = table.add(test_addr()).unwrap();
        table.remove(id1);
        let id2 = table.add(test_addr()).unwrap();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connection_timeout_detection() {
        let mut table = ConnectionTable::new(4);
        let id = table.add(test_addr()).unwrap();
        table.connections.get_mut(&id).unwrap().last_seen =
            Instant::now() - Duration::from_secs(30);

        let timed_out = table.check_timeouts(Duration::from_secs(15));
        assert_eq!(timed_out, vec![id]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_touch_prevents_timeout() {
        let mut table = ConnectionTable::new(4);
        let id = table.add(test_addr()).unwrap();
        table.connections.get_mut(&id).unwrap().last_seen =
            Instant::now() - Duration::from_secs(30);
        table.touch(id);

        let timed_out = table.check_timeouts(Duration::from_secs(15));
        assert!(timed_out.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_active_ids_snapshot() {
        let mut table = ConnectionTable::new(4);
        let id1 = table.add(test_addr()).unwrap();
        let id2 = table.add(test_addr2()).unwrap();
        table.remove(id1);

        let active = table.active_ids();
        assert!(!active.contains(&id1));
        assert!(active.contains(&id2));
    }

    #[test]
    fn test_server_config_defaults_are_ordered() {
        let config = ServerConfig::default();
        assert!(config.ghost_policy.grace < config.ghost_policy.inactivity);
        assert!(config.ghost_policy.inactivity < config.ghost_policy.hard_ceiling);
        assert!(config.transport_timeout < config.ghost_policy.inactivity);
    }
}
