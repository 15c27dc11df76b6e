//! Client network layer: UDP transport and the loop that drives the
//! session machine, the quality monitor and the position synchronizer.
//!
//! The loop is the only place that touches the socket. Heartbeats double
//! as latency probes; their acks feed the quality monitor, their absence
//! feeds the session machine, and the session machine decides when to
//! re-send the join handshake.

use crate::quality::NetworkQualityMonitor;
use crate::session::{ConnectionSession, DisconnectCause, SessionState};
use crate::sync::{PositionSynchronizer, SceneSink};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    timestamp_ms, ActionFlags, CharacterType, Packet, Vec3, WeaponType, MAX_HEALTH,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::interval;

/// Cosmetic identity sent with the join handshake.
#[derive(Debug, Clone)]
pub struct AvatarProfile {
    pub name: String,
    pub character: CharacterType,
    pub weapon: WeaponType,
    pub spawn_position: Vec3,
}

/// Tunable client timings.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Period between heartbeat pings; one unanswered ping is one miss.
    pub heartbeat_period: Duration,
    /// Period between outgoing position updates while connected.
    pub update_period: Duration,
    /// Interpolation tick period.
    pub tick_period: Duration,
    /// Period between quality re-classifications.
    pub assess_period: Duration,
    /// How long a join attempt may go unanswered before it counts as failed.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(2),
            update_period: Duration::from_millis(100),
            tick_period: Duration::from_millis(33),
            assess_period: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<u32>,
    profile: AvatarProfile,
    config: ClientConfig,

    session: ConnectionSession,
    sync: PositionSynchronizer,
    quality: NetworkQualityMonitor,
    sink: Box<dyn SceneSink>,

    /// Local avatar pose, as last set by the embedding game code.
    local_position: Vec3,
    local_rotation: f32,
    local_flags: ActionFlags,
    health: i32,

    /// Generation of the join attempt currently in flight.
    connect_generation: u64,
    /// A ping is outstanding; the next heartbeat tick without a pong
    /// counts as a miss.
    awaiting_pong: bool,
    /// When set, the next join attempt fires at this instant.
    reconnect_at: Option<Instant>,
    /// When set, the in-flight join attempt fails at this instant.
    attempt_deadline: Option<Instant>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        profile: AvatarProfile,
        config: ClientConfig,
        sink: Box<dyn SceneSink>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;
        let local_position = profile.spawn_position;

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            profile,
            config,
            session: ConnectionSession::default(),
            sync: PositionSynchronizer::new(),
            quality: NetworkQualityMonitor::new(),
            sink,
            local_position,
            local_rotation: 0.0,
            local_flags: ActionFlags::default(),
            health: MAX_HEALTH,
            connect_generation: 0,
            awaiting_pong: false,
            reconnect_at: None,
            attempt_deadline: None,
        })
    }

    /// Updates the pose the next outgoing update will carry.
    pub fn set_pose(&mut self, position: Vec3, rotation: f32, flags: ActionFlags) {
        self.local_position = position;
        self.local_rotation = rotation;
        self.local_flags = flags;
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Starts (or retries) the join handshake. The session id is stable
    /// across attempts, so the server can reclaim a predecessor record.
    async fn send_join(&mut self) {
        self.connect_generation = self.session.begin_connect();
        info!(
            "Joining {} as '{}' (session {})",
            self.server_addr,
            self.profile.name,
            self.session.session_id()
        );

        let packet = Packet::Join {
            name: self.profile.name.clone(),
            character: self.profile.character,
            weapon: self.profile.weapon,
            position: self.local_position,
            session_id: self.session.session_id().to_string(),
        };
        if let Err(e) = self.send_packet(&packet).await {
            error!("Failed to send join: {}", e);
        }
        self.attempt_deadline = Some(Instant::now() + self.config.connect_timeout);
    }

    async fn send_position_update(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        let packet = Packet::PositionUpdate {
            position: self.local_position,
            rotation: self.local_rotation,
            flags: self.local_flags,
            weapon: self.profile.weapon,
            client_timestamp: timestamp_ms(),
        };
        if let Err(e) = self.send_packet(&packet).await {
            error!("Failed to send position update: {}", e);
        }
    }

    fn is_self(&self, id: u32) -> bool {
        self.client_id == Some(id)
    }

    /// Arms the next reconnect attempt, or lets the session go terminal
    /// once the retry budget is spent.
    fn schedule_reconnect(&mut self) {
        self.attempt_deadline = None;
        if let Some(backoff) = self.session.next_backoff() {
            info!("Next reconnect attempt in {:?}", backoff);
            self.reconnect_at = Some(Instant::now() + backoff);
        }
    }

    async fn heartbeat_tick(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        if self.awaiting_pong {
            self.awaiting_pong = false;
            if self.session.on_heartbeat_miss() {
                self.schedule_reconnect();
                return;
            }
        }
        let packet = Packet::HeartbeatPing {
            client_timestamp: timestamp_ms(),
        };
        if let Err(e) = self.send_packet(&packet).await {
            error!("Failed to send heartbeat: {}", e);
        } else {
            self.awaiting_pong = true;
        }
    }

    /// Drives pending reconnect attempts: fires a due join, or fails an
    /// attempt whose deadline passed.
    async fn connection_maintenance(&mut self) {
        match self.session.state() {
            SessionState::Connecting | SessionState::Reconnecting => {}
            _ => return,
        }
        let now = Instant::now();

        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                self.send_join().await;
            }
            return;
        }
        if let Some(deadline) = self.attempt_deadline {
            if now >= deadline {
                warn!("Join attempt unanswered after {:?}", self.config.connect_timeout);
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        let now = Instant::now();
        match packet {
            Packet::ConnectAck {
                client_id,
                server_time: _,
                active_ids,
            } => {
                if !self.session.on_connected(self.connect_generation) {
                    return;
                }
                let rejoin = self.client_id.is_some();
                info!(
                    "Connected as {} ({} connection(s) online)",
                    client_id,
                    active_ids.len()
                );
                self.client_id = Some(client_id);
                self.awaiting_pong = false;
                self.attempt_deadline = None;
                self.reconnect_at = None;
                // Samples from the previous link are meaningless now.
                self.quality.reset();
                if rejoin {
                    // The world may have changed during the outage; the
                    // snapshot reconciles stale shadows.
                    if let Err(e) = self.send_packet(&Packet::RequestSnapshot).await {
                        error!("Failed to request snapshot: {}", e);
                    }
                }
            }

            Packet::SnapshotResponse { players } => {
                debug!("Snapshot with {} remote player(s)", players.len());
                self.sync.apply_snapshot(&players, now, self.sink.as_mut());
            }

            Packet::PlayerJoined { player } => {
                if !self.is_self(player.id) {
                    self.sync.on_player_joined(&player, now, self.sink.as_mut());
                }
            }

            Packet::PlayerUpdated {
                id,
                delta,
                server_timestamp,
                update_id,
            } => {
                if !self.is_self(id) {
                    self.sync.on_authoritative_update(
                        id,
                        &delta,
                        server_timestamp,
                        update_id,
                        now,
                        self.sink.as_mut(),
                    );
                }
            }

            Packet::PlayerLeft { id, name, reason } => {
                if self.is_self(id) {
                    // Our registry record is gone; updates on this link are
                    // dropped until a fresh join lands.
                    warn!("Server removed this player ({:?}); rejoining", reason);
                    self.send_join().await;
                } else {
                    debug!("Player '{}' left: {:?}", name, reason);
                    self.sync.on_player_left(id, self.sink.as_mut());
                }
            }

            Packet::AttackBroadcast { attacker_id, attack } => {
                info!(
                    "Player {} attacked with {:?} ({} target(s))",
                    attacker_id,
                    attack.weapon,
                    attack.hit_targets.len()
                );
            }

            Packet::HealthChanged { id, health } => {
                if self.is_self(id) {
                    info!("Own health now {}", health);
                    self.health = health;
                } else {
                    self.sync.on_health_changed(id, health, self.sink.as_mut());
                }
            }

            Packet::PlayerDefeated { id } => {
                if self.is_self(id) {
                    info!("Defeated; requesting respawn");
                    let packet = Packet::RespawnRequest {
                        position: self.profile.spawn_position,
                    };
                    if let Err(e) = self.send_packet(&packet).await {
                        error!("Failed to send respawn request: {}", e);
                    }
                } else {
                    self.sync.on_defeated(id, self.sink.as_mut());
                }
            }

            Packet::PlayerRespawned { id, position } => {
                if self.is_self(id) {
                    self.health = MAX_HEALTH;
                    self.local_position = position;
                } else {
                    self.sync.on_respawned(id, position, now, self.sink.as_mut());
                }
            }

            Packet::HeartbeatPong {
                client_timestamp,
                server_timestamp: _,
            } => {
                let rtt = timestamp_ms().saturating_sub(client_timestamp) as f32;
                self.quality.record_sample(rtt);
                self.session.on_heartbeat_ack();
                self.awaiting_pong = false;
            }

            Packet::ServerClose { reason } => {
                warn!("Server closed the connection: {}", reason);
                self.session.on_disconnected(DisconnectCause::GracefulClose);
                self.sync.clear(self.sink.as_mut());
                self.client_id = None;
                self.awaiting_pong = false;
                self.schedule_reconnect();
            }

            _ => {
                warn!("Unexpected packet type from server");
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.send_join().await;

        let mut heartbeat_interval = interval(self.config.heartbeat_period);
        let mut update_interval = interval(self.config.update_period);
        let mut tick_interval = interval(self.config.tick_period);
        let mut assess_interval = interval(self.config.assess_period);
        let mut maintenance_interval = interval(Duration::from_millis(100));

        let mut buffer = [0u8; 2048];

        loop {
            if self.session.is_failed() {
                error!("Retry budget exhausted; giving up");
                return Err("connection failed after retries".into());
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => {
                            if addr != self.server_addr {
                                continue;
                            }
                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet).await,
                                Err(_) => warn!("Failed to deserialize packet from server"),
                            }
                        }
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    self.heartbeat_tick().await;
                },

                _ = update_interval.tick() => {
                    self.send_position_update().await;
                },

                _ = tick_interval.tick() => {
                    let window = self.quality.interpolation_window();
                    self.sync.tick(Instant::now(), window, self.sink.as_mut());
                },

                _ = assess_interval.tick() => {
                    let level = self.quality.assess();
                    debug!(
                        "Link quality {:?} (avg {:?} ms, jitter {:?} ms)",
                        level,
                        self.quality.average_latency(),
                        self.quality.jitter()
                    );
                },

                _ = maintenance_interval.tick() => {
                    self.connection_maintenance().await;
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    if self.session.is_connected() {
                        let _ = self.send_packet(&Packet::Disconnect).await;
                    }
                    return Ok(());
                },
            }
        }
    }
}
