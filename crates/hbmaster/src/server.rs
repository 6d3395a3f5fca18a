// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! The HBP master server: UDP run loop, session dispatch, stream routing,
//! and the periodic scheduler.
//!
//! One task owns every piece of mutable state (registry, outbound table,
//! user cache, counters). The `select!` loop multiplexes the UDP socket,
//! the internal message channel (outbound datagrams, observer sync
//! requests), four interval timers, and the shutdown signal. Nothing on
//! the hot path suspends mid-packet; sends are non-blocking and a full
//! buffer drops the packet.

pub mod outbound;
pub mod peer;
pub mod stream;

use crate::access::{AccessDecision, AccessPolicy};
use crate::config::Config;
use crate::counters::DailyCounters;
use crate::events::{self, EventBody, EventTx};
use crate::protocol::{self, CallType, Command, Dmrd, RptcData, Slot};
use crate::user_cache::UserCache;
use outbound::OutboundSession;
use peer::{
    detect_connection_type, MatchInfo, PeerRegistry, PeerSession, SessionState, TalkgroupSet,
};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::{Admission, RouteCandidate, StreamState, TargetId};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Emit a `stream_update` every this many forwarded packets (~1 s of voice).
const STREAM_UPDATE_INTERVAL: u64 = 60;
/// Internal message channel depth.
const MSG_CHANNEL_CAP: usize = 256;
/// Bounded deadline for the shutdown event flush.
const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(2);

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Messages into the main loop from auxiliary tasks.
#[derive(Debug)]
pub enum ServerMsg {
    /// Datagram received by an outbound session's reader task.
    OutboundDatagram { index: usize, data: Vec<u8> },
    /// The observer (re)connected or asked for a state resync.
    ObserverSync,
}

/// The HBP master server.
pub struct Server {
    config: Config,
    access: AccessPolicy,
    socket: Arc<UdpSocket>,
    peers: PeerRegistry,
    outbounds: Vec<OutboundSession>,
    user_cache: UserCache,
    counters: DailyCounters,
    events: EventTx,
    msg_tx: mpsc::Sender<ServerMsg>,
    msg_rx: Option<mpsc::Receiver<ServerMsg>>,
    shutdown: Arc<Notify>,
    emitter_handle: Option<JoinHandle<()>>,
}

/// Bind the HBP UDP socket with SO_REUSEADDR, non-blocking for tokio.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let bind = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    bind().map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))
}

impl Server {
    /// Build the server: compile access rules, bind the socket, start the
    /// event emitter, load counters, and set up outbound sessions.
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let access = config
            .access_policy()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let bind_addr = SocketAddr::new(config.global.bind_ipv4, config.global.bind_port);
        let socket = Arc::new(bind_udp(bind_addr)?);

        let (msg_tx, msg_rx) = mpsc::channel(MSG_CHANNEL_CAP);
        let (events, emitter_handle) = events::spawn(&config.event_emitter, msg_tx.clone()).await?;

        let today = chrono::Local::now().date_naive();
        let counters = DailyCounters::load(&config.global.counters_file, today);
        let user_cache = UserCache::new(config.global.user_cache_timeout());

        let now = Instant::now();
        let outbounds = config
            .outbound_connections
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .enumerate()
            .map(|(index, c)| OutboundSession::new(index, c, now))
            .collect();

        Ok(Self {
            config,
            access,
            socket,
            peers: PeerRegistry::new(),
            outbounds,
            user_cache,
            counters,
            events,
            msg_tx,
            msg_rx: Some(msg_rx),
            shutdown: Arc::new(Notify::new()),
            emitter_handle,
        })
    }

    /// The bound HBP socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for signalling shutdown from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run until shutdown is signalled.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let mut msg_rx = self
            .msg_rx
            .take()
            .ok_or_else(|| ServerError::Config("server already running".into()))?;
        let socket = Arc::clone(&self.socket);
        let shutdown = Arc::clone(&self.shutdown);

        info!(
            addr = %self.local_addr()?,
            peers = self.peers.len(),
            outbounds = self.outbounds.len(),
            "hbmaster running"
        );

        let mut buf = vec![0u8; 4096];
        let mut reap_tick = interval(Duration::from_secs(1));
        let mut stream_tick = interval(Duration::from_millis(100));
        let mut outbound_tick = interval(Duration::from_secs(1));
        let mut sweep_tick = interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                        Err(e) => warn!("UDP receive error: {}", e),
                    }
                }
                Some(msg) = msg_rx.recv() => self.handle_message(msg),
                _ = reap_tick.tick() => self.reap_dead_peers(Instant::now()),
                _ = stream_tick.tick() => self.scan_streams(Instant::now()),
                _ = outbound_tick.tick() => self.tick_outbounds(Instant::now()).await,
                _ = sweep_tick.tick() => {
                    let removed = self.user_cache.sweep(Instant::now());
                    if removed > 0 {
                        info!(removed, "user cache sweep");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        self.finalize().await;
        Ok(())
    }

    // ===== Dispatch =====

    fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        match protocol::identify(data) {
            Some(Command::Dmrd) => self.handle_dmrd(data, addr),
            Some(Command::Login) => self.handle_login(data, addr),
            Some(Command::AuthKey) => self.handle_auth(data, addr),
            Some(Command::Config) => self.handle_config(data, addr),
            Some(Command::Disconnect) => self.handle_disconnect(data, addr),
            Some(Command::Ping) => self.handle_ping(data, addr),
            Some(Command::Options) => self.handle_options(data, addr),
            Some(cmd) => {
                // Master-side tags have no business arriving here.
                debug!(%addr, ?cmd, "ignoring master-side frame on server socket");
            }
            None => {
                debug!(%addr, len = data.len(), "malformed frame");
            }
        }
    }

    fn handle_message(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::OutboundDatagram { index, data } => {
                self.handle_outbound_datagram(index, &data);
            }
            ServerMsg::ObserverSync => self.emit_snapshot(),
        }
    }

    fn handle_outbound_datagram(&mut self, index: usize, data: &[u8]) {
        let Some(cmd) = protocol::identify(data) else {
            debug!(index, "malformed frame from upstream");
            return;
        };
        if cmd == Command::Dmrd {
            let connected = self
                .outbounds
                .get(index)
                .map(|o| o.is_connected())
                .unwrap_or(false);
            if connected {
                self.handle_stream_packet(TargetId::Outbound(index), data);
            }
            return;
        }
        let now = Instant::now();
        let torn = match self.outbounds.get_mut(index) {
            Some(session) => session.handle_control(cmd, data, now, &self.events),
            None => return,
        };
        for stream in torn {
            self.clear_assumed_copies(&stream);
        }
    }

    // ===== Session handlers (inbound) =====

    fn handle_login(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 4) else {
            debug!(%addr, "short RPTL");
            return;
        };

        let passphrase = match self.access.select(radio_id, None) {
            AccessDecision::Blacklisted { rule, reason } => {
                info!(radio_id, rule, reason, "login refused: blacklisted");
                self.send_to(&protocol::nak(radio_id), addr);
                return;
            }
            AccessDecision::Matched { config, .. } => config.passphrase.clone(),
        };

        if let Some(existing) = self.peers.get(radio_id) {
            if existing.addr != addr {
                warn!(
                    radio_id,
                    %addr,
                    recorded = %existing.addr,
                    "login for already-connected peer from a different address"
                );
                self.send_to(&protocol::nak(radio_id), addr);
                return;
            }
            // Same address: the repeater restarted. Start the session over.
            if let Some(old) = self.peers.remove(radio_id) {
                for old_stream in old.slots.iter().flatten() {
                    if !old_stream.is_assumed {
                        self.clear_assumed_copies(old_stream);
                    }
                }
            }
        }

        let session = PeerSession::new(radio_id, addr, passphrase, Instant::now());
        let salt = session.salt;
        self.peers.insert(session);
        self.send_to(&protocol::ack_with_salt(salt), addr);
        info!(radio_id, %addr, "login challenge sent");
    }

    fn handle_auth(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 4) else {
            debug!(%addr, "short RPTK");
            return;
        };
        let Some(session) = self.peers.validate_source(radio_id, addr) else {
            self.send_to(&protocol::nak(radio_id), addr);
            return;
        };
        if session.state != SessionState::Login {
            self.send_to(&protocol::nak(radio_id), addr);
            return;
        }

        let salt = session.salt;
        let passphrase = session.passphrase.clone();
        if protocol::verify_auth(&data[8..], salt, &passphrase) {
            if let Some(session) = self.peers.get_mut(radio_id) {
                session.state = SessionState::Config;
            }
            self.send_to(&protocol::ack(radio_id), addr);
            info!(radio_id, "peer authenticated");
        } else {
            warn!(radio_id, "authentication failed");
            self.send_to(&protocol::nak(radio_id), addr);
            self.peers.remove(radio_id);
        }
    }

    fn handle_config(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 4) else {
            return;
        };
        let Some(session) = self.peers.validate_source(radio_id, addr) else {
            self.send_to(&protocol::nak(radio_id), addr);
            return;
        };
        if !matches!(session.state, SessionState::Config | SessionState::Connected) {
            warn!(radio_id, "RPTC before authentication");
            self.send_to(&protocol::nak(radio_id), addr);
            return;
        }

        let metadata = match RptcData::decode(data) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(radio_id, "invalid RPTC: {}", e);
                self.send_to(&protocol::nak(radio_id), addr);
                self.peers.remove(radio_id);
                return;
            }
        };

        // Re-run the matcher now that the callsign is known.
        let (peer_config, match_info) =
            match self.access.select(radio_id, Some(&metadata.callsign)) {
                AccessDecision::Blacklisted { rule, reason } => {
                    info!(
                        radio_id,
                        callsign = %metadata.callsign,
                        rule,
                        reason,
                        "blacklisted at config time"
                    );
                    self.send_to(&protocol::nak(radio_id), addr);
                    self.peers.remove(radio_id);
                    return;
                }
                AccessDecision::Matched {
                    config,
                    pattern,
                    reason,
                } => (
                    config.clone(),
                    MatchInfo {
                        pattern_name: pattern.map(|p| p.name.clone()),
                        pattern_description: pattern.map(|p| p.description.clone()),
                        match_reason: reason,
                    },
                ),
            };

        let connection_type = detect_connection_type(
            &metadata.software_id,
            &metadata.package_id,
            &self.config.connection_type_detection,
        );

        let Some(session) = self.peers.get_mut(radio_id) else {
            return;
        };
        session.metadata = Some(metadata);
        session.raw_config = Some(data.to_vec());
        session.connection_type = connection_type;
        session.config_tgs = [
            TalkgroupSet::from_config(&peer_config.slot1_talkgroups),
            TalkgroupSet::from_config(&peer_config.slot2_talkgroups),
        ];
        session.slot_tgs = session.config_tgs.clone();
        session.rpto_received = false;
        session.match_info = match_info;
        session.state = SessionState::Connected;

        self.send_to(&protocol::ack(radio_id), addr);
        if let Some(session) = self.peers.get(radio_id) {
            info!(
                radio_id,
                callsign = session.callsign(),
                connection_type = session.connection_type.as_str(),
                "peer connected"
            );
            self.emit_peer_connected(session);
            self.emit_peer_details(session);
        }
    }

    fn handle_ping(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 7) else {
            debug!(%addr, "short RPTPING");
            return;
        };
        match self.peers.validate_source(radio_id, addr) {
            Some(session) if session.state == SessionState::Connected => {}
            _ => {
                self.send_to(&protocol::nak(radio_id), addr);
                return;
            }
        }
        let Some(session) = self.peers.get_mut(radio_id) else {
            return;
        };
        session.touch_ping(Instant::now());
        let (missed_pings, ping_count) = (session.missed_pings, session.ping_count);
        self.send_to(&protocol::pong(radio_id), addr);
        self.events.emit(EventBody::RepeaterKeepalive {
            repeater_id: radio_id,
            missed_pings,
            ping_count,
        });
    }

    fn handle_options(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 4) else {
            return;
        };
        match self.peers.validate_source(radio_id, addr) {
            Some(session) if session.state == SessionState::Connected => {}
            _ => {
                self.send_to(&protocol::nak(radio_id), addr);
                return;
            }
        }

        let body = String::from_utf8_lossy(&data[8..]).into_owned();
        let request = protocol::parse_options(&body);
        let Some(session) = self.peers.get_mut(radio_id) else {
            return;
        };
        // The configured sets stay master; RPTO can only narrow them.
        session.slot_tgs = [
            session.config_tgs[0].intersect_request(&request.ts1),
            session.config_tgs[1].intersect_request(&request.ts2),
        ];
        session.rpto_received = true;

        let slot1 = session.slot_tgs[0].to_sorted();
        let slot2 = session.slot_tgs[1].to_sorted();
        info!(radio_id, options = %body, "peer options applied");
        self.send_to(&protocol::ack(radio_id), addr);
        self.events.emit(EventBody::RepeaterOptionsUpdated {
            repeater_id: radio_id,
            slot1_talkgroups: slot1,
            slot2_talkgroups: slot2,
            rpto_received: true,
        });
    }

    fn handle_disconnect(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(radio_id) = protocol::peer_id_at(data, 5) else {
            return;
        };
        if self.peers.validate_source(radio_id, addr).is_none() {
            self.send_to(&protocol::nak(radio_id), addr);
            return;
        }
        self.remove_peer(radio_id, "disconnect");
    }

    fn handle_dmrd(&mut self, data: &[u8], addr: SocketAddr) {
        let Ok(dmrd) = Dmrd::parse(data) else {
            debug!(%addr, len = data.len(), "short DMRD");
            return;
        };
        let radio_id = dmrd.peer_id();
        match self.peers.validate_source(radio_id, addr) {
            Some(session) if session.state == SessionState::Connected => {}
            _ => {
                // Lossy by design: no NAK for voice frames.
                debug!(radio_id, %addr, "DMRD from unknown or unconnected peer");
                return;
            }
        }
        self.handle_stream_packet(TargetId::Peer(radio_id), data);
    }

    // ===== Stream engine =====

    fn handle_stream_packet(&mut self, source: TargetId, data: &[u8]) {
        let Ok(dmrd) = Dmrd::parse(data) else {
            return;
        };
        let now = Instant::now();
        let slot = dmrd.slot();
        let hang_time = self.config.global.hang_time();

        let admission = stream::admit(
            self.slot_stream(source, slot),
            dmrd.stream_id(),
            dmrd.rf_src(),
            dmrd.dst_id(),
            hang_time,
            now,
        );
        match admission {
            Admission::Reject => {
                // Slot busy or hang-time hijack; policy, not an error.
                debug!(
                    ?source,
                    %slot,
                    rf_src = dmrd.rf_src(),
                    dst_id = dmrd.dst_id(),
                    "packet rejected, slot reserved"
                );
            }
            Admission::Continue => {
                let Some((targets, packets, start_time)) =
                    self.slot_stream_mut(source, slot).map(|s| {
                        s.touch(now);
                        (s.targets.clone(), s.packets, s.start_time)
                    })
                else {
                    return;
                };
                self.forward(slot, dmrd.stream_id(), targets.as_ref(), data, now);
                if packets % STREAM_UPDATE_INTERVAL == 0 {
                    let (repeater_id, connection_type, connection_name) = self.descriptor(source);
                    self.events.emit(EventBody::StreamUpdate {
                        repeater_id,
                        connection_type,
                        connection_name,
                        slot: slot.number(),
                        rf_src: dmrd.rf_src(),
                        dst_id: dmrd.dst_id(),
                        stream_id: dmrd.stream_id(),
                        packets,
                        duration: now.duration_since(start_time).as_secs_f64(),
                    });
                }
                if dmrd.is_terminator() {
                    self.end_stream(source, slot, "terminator", now);
                }
            }
            Admission::Start => self.start_stream(source, &dmrd, data, now),
        }
    }

    fn start_stream(&mut self, source: TargetId, dmrd: &Dmrd<'_>, data: &[u8], now: Instant) {
        let slot = dmrd.slot();
        let rf_src = dmrd.rf_src();
        let dst_id = dmrd.dst_id();
        let call_type = dmrd.call_type();
        let stream_id = dmrd.stream_id();
        let hang_time = self.config.global.hang_time();

        let private_target = match call_type {
            CallType::Private => self.user_cache.peer_for(dst_id, now),
            CallType::Group => None,
        };

        // The one-shot routing computation; cached for the stream's life.
        let targets = {
            let peer_candidates = self.peers.iter().map(|p| RouteCandidate {
                id: TargetId::Peer(p.radio_id),
                connected: p.state == SessionState::Connected,
                slot_stream: p.slot_stream(slot),
                slot_tgs: &p.slot_tgs[slot.index()],
            });
            let outbound_candidates = self.outbounds.iter().map(|o| RouteCandidate {
                id: TargetId::Outbound(o.index),
                connected: o.is_connected(),
                slot_stream: o.slot_stream(slot),
                slot_tgs: &o.slot_tgs[slot.index()],
            });
            stream::compute_targets(
                source,
                rf_src,
                dst_id,
                call_type,
                private_target,
                hang_time,
                now,
                peer_candidates.chain(outbound_candidates),
            )
        };
        let targets = Arc::new(targets);

        let mut new_stream = StreamState::new(stream_id, rf_src, dst_id, slot, call_type, now);
        new_stream.targets = Some(Arc::clone(&targets));
        new_stream.touch(now);
        let assumed = new_stream.assumed_copy();

        self.counters.roll_if_needed(chrono::Local::now().date_naive());
        self.counters.record_call();
        self.counters.record_retransmissions(targets.len());

        if call_type == CallType::Group {
            self.user_cache.update(rf_src, source, slot, dst_id, now);
        }

        self.set_slot_stream(source, slot, Some(new_stream));

        let (repeater_id, connection_type, connection_name) = self.descriptor(source);
        info!(
            repeater_id,
            %slot,
            rf_src,
            dst_id,
            stream_id,
            call_type = call_type.as_str(),
            targets = targets.len(),
            "stream start"
        );
        self.events.emit(EventBody::StreamStart {
            repeater_id,
            connection_type,
            connection_name,
            slot: slot.number(),
            rf_src,
            dst_id,
            stream_id,
            call_type: call_type.as_str(),
            is_assumed: false,
        });

        // Reserve each target's slot with an assumed stream record; this
        // blocks back-propagation and keeps slot-busy reporting accurate.
        for &target in targets.iter() {
            self.set_slot_stream(target, slot, Some(assumed.clone()));
            let (rid, ct, cn) = self.descriptor(target);
            self.events.emit(EventBody::StreamStart {
                repeater_id: rid,
                connection_type: ct,
                connection_name: cn,
                slot: slot.number(),
                rf_src,
                dst_id,
                stream_id,
                call_type: call_type.as_str(),
                is_assumed: true,
            });
        }

        self.forward(slot, stream_id, Some(&targets), data, now);

        if dmrd.is_terminator() {
            self.end_stream(source, slot, "terminator", now);
        }
    }

    /// Send a packet verbatim to every cached target. Transient failures
    /// are swallowed; leavers are tolerated as lookup misses.
    fn forward(
        &mut self,
        slot: Slot,
        stream_id: u32,
        targets: Option<&Arc<std::collections::HashSet<TargetId>>>,
        data: &[u8],
        now: Instant,
    ) {
        let Some(targets) = targets else {
            return;
        };
        for &target in targets.iter() {
            match target {
                TargetId::Peer(radio_id) => {
                    if let Some(session) = self.peers.get_mut(radio_id) {
                        if let Some(s) = session.slot_stream_mut(slot) {
                            if s.is_assumed && s.stream_id == stream_id {
                                s.last_seen = now;
                            }
                        }
                        let addr = session.addr;
                        if let Err(e) = self.socket.try_send_to(data, addr) {
                            debug!(radio_id, "forward failed: {}", e);
                        }
                    }
                }
                TargetId::Outbound(index) => {
                    if let Some(session) = self.outbounds.get_mut(index) {
                        if let Some(s) = session.slot_stream_mut(slot) {
                            if s.is_assumed && s.stream_id == stream_id {
                                s.last_seen = now;
                            }
                        }
                        session.try_send(data);
                    }
                }
            }
        }
    }

    fn end_stream(&mut self, source: TargetId, slot: Slot, reason: &'static str, now: Instant) {
        let hang_secs = self.config.global.hang_time;
        let Some((targets, stream_id, rf_src, dst_id, packets, duration)) = self
            .slot_stream_mut(source, slot)
            .and_then(|s| {
                if s.ended {
                    return None;
                }
                s.end(now);
                Some((
                    s.targets.clone(),
                    s.stream_id,
                    s.rf_src,
                    s.dst_id,
                    s.packets,
                    s.duration(now),
                ))
            })
        else {
            return;
        };

        // Assumed copies end with their source.
        if let Some(targets) = &targets {
            for &target in targets.iter() {
                let matched = self.slot_stream_mut(target, slot).is_some_and(|s| {
                    if s.is_assumed && s.stream_id == stream_id {
                        s.end(now);
                        true
                    } else {
                        false
                    }
                });
                if matched {
                    let (rid, ct, cn) = self.descriptor(target);
                    self.events.emit(EventBody::StreamEnd {
                        repeater_id: rid,
                        connection_type: ct,
                        connection_name: cn,
                        slot: slot.number(),
                        rf_src,
                        dst_id,
                        stream_id,
                        packets,
                        duration,
                        end_reason: reason,
                        hang_time: hang_secs,
                        is_assumed: true,
                    });
                }
            }
        }

        let (repeater_id, connection_type, connection_name) = self.descriptor(source);
        info!(
            repeater_id,
            %slot,
            stream_id,
            packets,
            duration = format!("{:.1}s", duration),
            reason,
            "stream end"
        );
        self.events.emit(EventBody::StreamEnd {
            repeater_id,
            connection_type,
            connection_name,
            slot: slot.number(),
            rf_src,
            dst_id,
            stream_id,
            packets,
            duration,
            end_reason: reason,
            hang_time: hang_secs,
            is_assumed: false,
        });
        self.counters.record_duration(duration);
    }

    /// Drop an ended stream whose hang-time reservation has lapsed, along
    /// with its assumed copies.
    fn expire_stream(&mut self, source: TargetId, slot: Slot, now: Instant) {
        let hang_time = self.config.global.hang_time();
        let expired = self
            .slot_stream(source, slot)
            .is_some_and(|s| !s.is_assumed && s.ended && !s.in_hang_time(hang_time, now));
        if !expired {
            return;
        }
        let Some(stream) = self.take_slot_stream(source, slot) else {
            return;
        };

        if let Some(targets) = &stream.targets {
            for &target in targets.iter() {
                let matched = self
                    .slot_stream(target, slot)
                    .is_some_and(|s| s.is_assumed && s.stream_id == stream.stream_id);
                if matched {
                    self.take_slot_stream(target, slot);
                    let (rid, ct, cn) = self.descriptor(target);
                    self.events.emit(EventBody::HangTimeExpired {
                        repeater_id: rid,
                        connection_type: ct,
                        connection_name: cn,
                        slot: slot.number(),
                        stream_id: stream.stream_id,
                    });
                }
            }
        }

        let (repeater_id, connection_type, connection_name) = self.descriptor(source);
        debug!(repeater_id, %slot, stream_id = stream.stream_id, "hang time expired");
        self.events.emit(EventBody::HangTimeExpired {
            repeater_id,
            connection_type,
            connection_name,
            slot: slot.number(),
            stream_id: stream.stream_id,
        });
    }

    // ===== Scheduler =====

    /// 100 ms scan: timeout-based stream end and hang-time expiry.
    fn scan_streams(&mut self, now: Instant) {
        let timeout = self.config.global.stream_timeout();
        let hang_time = self.config.global.hang_time();

        enum StreamAction {
            Timeout(TargetId, Slot),
            Expire(TargetId, Slot),
            AssumedEnd(TargetId, Slot),
            AssumedDrop(TargetId, Slot),
        }

        let classify = |id: TargetId, slot: Slot, s: &StreamState, out: &mut Vec<StreamAction>| {
            let stale = !s.ended && now.duration_since(s.last_seen) > timeout;
            let lapsed = s.ended && !s.in_hang_time(hang_time, now);
            match (s.is_assumed, stale, lapsed) {
                (false, true, _) => out.push(StreamAction::Timeout(id, slot)),
                (false, _, true) => out.push(StreamAction::Expire(id, slot)),
                (true, true, _) => out.push(StreamAction::AssumedEnd(id, slot)),
                (true, _, true) => out.push(StreamAction::AssumedDrop(id, slot)),
                _ => {}
            }
        };

        let mut actions = Vec::new();
        for session in self.peers.iter() {
            for slot in Slot::BOTH {
                if let Some(s) = session.slot_stream(slot) {
                    classify(TargetId::Peer(session.radio_id), slot, s, &mut actions);
                }
            }
        }
        for session in &self.outbounds {
            for slot in Slot::BOTH {
                if let Some(s) = session.slot_stream(slot) {
                    classify(TargetId::Outbound(session.index), slot, s, &mut actions);
                }
            }
        }

        for action in actions {
            match action {
                StreamAction::Timeout(id, slot) => self.end_stream(id, slot, "timeout", now),
                StreamAction::Expire(id, slot) => self.expire_stream(id, slot, now),
                StreamAction::AssumedEnd(id, slot) => {
                    // Source died mid-stream; quietly close the reservation.
                    if let Some(s) = self.slot_stream_mut(id, slot) {
                        if s.is_assumed && !s.ended {
                            s.end(now);
                        }
                    }
                }
                StreamAction::AssumedDrop(id, slot) => {
                    // Orphaned copy (normally removed with its source).
                    let drop = self
                        .slot_stream(id, slot)
                        .is_some_and(|s| s.is_assumed && s.ended && !s.in_hang_time(hang_time, now));
                    if drop {
                        self.take_slot_stream(id, slot);
                    }
                }
            }
        }
    }

    /// 1 s scan: mark and remove peers whose keepalives stopped.
    fn reap_dead_peers(&mut self, now: Instant) {
        let keepalive = self.config.global.ping_time();
        let max_missed = self.config.global.max_missed_pings;
        let dead = self.peers.reap_expired(keepalive, max_missed, now);
        for radio_id in dead {
            warn!(radio_id, "peer keepalive timeout");
            self.remove_peer(radio_id, "timeout");
        }
    }

    /// 1 s tick: outbound reconnects, handshake timeouts, keepalives.
    async fn tick_outbounds(&mut self, now: Instant) {
        let ping_interval = self.config.global.ping_time();
        for index in 0..self.outbounds.len() {
            let torn = {
                let (msg_tx, events) = (&self.msg_tx, &self.events);
                self.outbounds[index]
                    .tick(now, ping_interval, msg_tx, events)
                    .await
            };
            for stream in torn {
                self.clear_assumed_copies(&stream);
            }
        }
    }

    // ===== Peer removal =====

    fn remove_peer(&mut self, radio_id: u32, reason: &str) {
        let Some(session) = self.peers.remove(radio_id) else {
            return;
        };
        // Removing a peer releases both slots; its streams' assumed copies
        // on other endpoints go with it.
        for old_stream in session.slots.iter().flatten() {
            if !old_stream.is_assumed {
                self.clear_assumed_copies(old_stream);
            }
        }
        info!(
            radio_id,
            callsign = session.callsign(),
            reason,
            "peer disconnected"
        );
        self.events.emit(EventBody::RepeaterDisconnected {
            repeater_id: radio_id,
            callsign: session.callsign().to_string(),
            reason: reason.to_string(),
        });
    }

    fn clear_assumed_copies(&mut self, source_stream: &StreamState) {
        let Some(targets) = &source_stream.targets else {
            return;
        };
        for &target in targets.iter() {
            let matched = self
                .slot_stream(target, source_stream.slot)
                .is_some_and(|s| s.is_assumed && s.stream_id == source_stream.stream_id);
            if matched {
                self.take_slot_stream(target, source_stream.slot);
            }
        }
    }

    // ===== Slot accessors over both endpoint kinds =====

    fn slot_stream(&self, target: TargetId, slot: Slot) -> Option<&StreamState> {
        match target {
            TargetId::Peer(id) => self.peers.get(id).and_then(|p| p.slot_stream(slot)),
            TargetId::Outbound(i) => self.outbounds.get(i).and_then(|o| o.slot_stream(slot)),
        }
    }

    fn slot_stream_mut(&mut self, target: TargetId, slot: Slot) -> Option<&mut StreamState> {
        match target {
            TargetId::Peer(id) => self.peers.get_mut(id).and_then(|p| p.slot_stream_mut(slot)),
            TargetId::Outbound(i) => self
                .outbounds
                .get_mut(i)
                .and_then(|o| o.slot_stream_mut(slot)),
        }
    }

    fn set_slot_stream(&mut self, target: TargetId, slot: Slot, s: Option<StreamState>) {
        match target {
            TargetId::Peer(id) => {
                if let Some(session) = self.peers.get_mut(id) {
                    session.set_slot_stream(slot, s);
                }
            }
            TargetId::Outbound(i) => {
                if let Some(session) = self.outbounds.get_mut(i) {
                    session.set_slot_stream(slot, s);
                }
            }
        }
    }

    fn take_slot_stream(&mut self, target: TargetId, slot: Slot) -> Option<StreamState> {
        match target {
            TargetId::Peer(id) => self
                .peers
                .get_mut(id)
                .and_then(|p| p.slots[slot.index()].take()),
            TargetId::Outbound(i) => self
                .outbounds
                .get_mut(i)
                .and_then(|o| o.slots[slot.index()].take()),
        }
    }

    /// Event descriptor for an endpoint.
    fn descriptor(&self, target: TargetId) -> (u32, &'static str, Option<String>) {
        match target {
            TargetId::Peer(radio_id) => {
                let connection_type = self
                    .peers
                    .get(radio_id)
                    .map(|p| p.connection_type.as_str())
                    .unwrap_or("unknown");
                (radio_id, connection_type, None)
            }
            TargetId::Outbound(index) => match self.outbounds.get(index) {
                Some(o) => (o.config.radio_id, "outbound", Some(o.config.name.clone())),
                None => (0, "outbound", None),
            },
        }
    }

    // ===== Events =====

    fn send_to(&self, data: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(data, addr) {
            debug!(%addr, "send failed: {}", e);
        }
    }

    fn emit_peer_connected(&self, session: &PeerSession) {
        self.events.emit(EventBody::RepeaterConnected {
            repeater_id: session.radio_id,
            callsign: session.callsign().to_string(),
            address: session.addr.to_string(),
            connection_type: session.connection_type.as_str(),
            slot1_talkgroups: session.slot_tgs[0].to_sorted(),
            slot2_talkgroups: session.slot_tgs[1].to_sorted(),
        });
    }

    fn emit_peer_details(&self, session: &PeerSession) {
        let m = session.metadata.clone().unwrap_or_default();
        self.events.emit(EventBody::RepeaterDetails {
            repeater_id: session.radio_id,
            callsign: session.callsign().to_string(),
            location: m.location,
            description: m.description,
            latitude: m.latitude,
            longitude: m.longitude,
            height: m.height,
            tx_power: m.tx_power,
            rx_freq: m.rx_freq,
            tx_freq: m.tx_freq,
            colorcode: m.colorcode,
            slots: m.slots,
            url: m.url,
            software_id: m.software_id,
            package_id: m.package_id,
            connection_type: session.connection_type.as_str(),
            matched_pattern: session.match_info.pattern_name.clone(),
            pattern_description: session.match_info.pattern_description.clone(),
            match_reason: session.match_info.match_reason.clone(),
            rpto_received: session.rpto_received,
        });
    }

    /// Full state snapshot for a (re)connected observer.
    fn emit_snapshot(&self) {
        info!("observer sync: emitting state snapshot");
        for session in self.peers.iter() {
            if session.state == SessionState::Connected {
                self.emit_peer_connected(session);
                self.emit_peer_details(session);
            }
        }
        for session in &self.outbounds {
            if session.is_connected() {
                self.events.emit(EventBody::OutboundConnected {
                    connection_name: session.config.name.clone(),
                    radio_id: session.config.radio_id,
                    remote_address: session
                        .remote_addr
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                });
            }
        }
        let emit_stream = |target: TargetId, s: &StreamState| {
            let (repeater_id, connection_type, connection_name) = self.descriptor(target);
            self.events.emit(EventBody::StreamStart {
                repeater_id,
                connection_type,
                connection_name,
                slot: s.slot.number(),
                rf_src: s.rf_src,
                dst_id: s.dst_id,
                stream_id: s.stream_id,
                call_type: s.call_type.as_str(),
                is_assumed: s.is_assumed,
            });
        };
        for session in self.peers.iter() {
            for slot in Slot::BOTH {
                if let Some(s) = session.slot_stream(slot) {
                    if !s.ended {
                        emit_stream(TargetId::Peer(session.radio_id), s);
                    }
                }
            }
        }
        for session in &self.outbounds {
            for slot in Slot::BOTH {
                if let Some(s) = session.slot_stream(slot) {
                    if !s.ended {
                        emit_stream(TargetId::Outbound(session.index), s);
                    }
                }
            }
        }
    }

    // ===== Shutdown =====

    async fn finalize(&mut self) {
        info!("shutting down");
        let now = Instant::now();

        let ids: Vec<u32> = self.peers.iter().map(|p| p.radio_id).collect();
        for radio_id in ids {
            self.remove_peer(radio_id, "shutdown");
        }

        for index in 0..self.outbounds.len() {
            if self.outbounds[index].is_connected() {
                self.outbounds[index].send_disconnect();
                self.events.emit(EventBody::OutboundDisconnected {
                    connection_name: self.outbounds[index].config.name.clone(),
                    radio_id: self.outbounds[index].config.radio_id,
                    reason: "shutdown".to_string(),
                });
            }
            self.outbounds[index].teardown(now);
        }

        if let Err(e) = self.counters.save(&self.config.global.counters_file) {
            warn!("failed to persist counters: {}", e);
        } else {
            info!(
                path = %self.config.global.counters_file.display(),
                calls = self.counters.calls_today,
                "counters persisted"
            );
        }

        // Let the emitter drain with a bounded deadline.
        self.events.close();
        if let Some(handle) = self.emitter_handle.take() {
            if tokio::time::timeout(SHUTDOWN_FLUSH_DEADLINE, handle)
                .await
                .is_err()
            {
                warn!("event emitter did not flush before the deadline");
            }
        }
    }
}
