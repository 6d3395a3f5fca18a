// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Outbound client sessions: we dial an upstream master and authenticate
//! the way a repeater would.
//!
//! The handshake mirrors the inbound state machine with the roles inverted:
//! RPTL, then RPTK with the salted digest, then our RPTC metadata, then an
//! optional RPTO subscription. Once connected the session owns two
//! timeslots and participates in routing exactly like an inbound peer; we
//! send RPTPING and count missed MSTPONGs. A dead or rejected session
//! reconnects with exponential backoff (1 s doubling to a 60 s cap).

use crate::config::OutboundConfig;
use crate::events::{EventBody, EventTx};
use crate::protocol::{self, Command, RptcData, Slot};
use crate::server::peer::TalkgroupSet;
use crate::server::stream::StreamState;
use crate::server::ServerMsg;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MISSED_PONGS: u32 = 3;

/// Handshake progress of an outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPhase {
    /// Not connected; waiting for the next reconnect attempt.
    Idle,
    /// RPTL sent, waiting for the salt challenge.
    LoginSent,
    /// RPTK sent, waiting for the auth ACK.
    AuthSent,
    /// RPTC sent, waiting for the config ACK.
    ConfigSent,
    /// RPTO sent, waiting for the options ACK.
    OptionsSent,
    /// Fully established; participates in routing.
    Connected,
}

/// One session to an upstream master.
#[derive(Debug)]
pub struct OutboundSession {
    /// Index into the server's outbound table; part of the routing identity.
    pub index: usize,
    pub config: OutboundConfig,
    pub phase: OutboundPhase,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
    pub remote_addr: Option<SocketAddr>,
    salt: u32,
    phase_started: Instant,
    last_ping_sent: Option<Instant>,
    last_pong: Instant,
    pub missed_pongs: u32,
    backoff: Duration,
    next_attempt: Instant,
    /// Talkgroups we subscribe to per slot, from the configured RPTO body.
    pub slot_tgs: [TalkgroupSet; 2],
    pub slots: [Option<StreamState>; 2],
}

impl OutboundSession {
    pub fn new(index: usize, config: OutboundConfig, now: Instant) -> Self {
        let request = protocol::parse_options(&config.options);
        let slot_tgs = [
            TalkgroupSet::Unrestricted.intersect_request(&request.ts1),
            TalkgroupSet::Unrestricted.intersect_request(&request.ts2),
        ];
        Self {
            index,
            config,
            phase: OutboundPhase::Idle,
            socket: None,
            reader: None,
            remote_addr: None,
            salt: 0,
            phase_started: now,
            last_ping_sent: None,
            last_pong: now,
            missed_pongs: 0,
            backoff: INITIAL_BACKOFF,
            next_attempt: now,
            slot_tgs,
            slots: [None, None],
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == OutboundPhase::Connected
    }

    pub fn slot_stream(&self, slot: Slot) -> Option<&StreamState> {
        self.slots[slot.index()].as_ref()
    }

    pub fn slot_stream_mut(&mut self, slot: Slot) -> Option<&mut StreamState> {
        self.slots[slot.index()].as_mut()
    }

    pub fn set_slot_stream(&mut self, slot: Slot, stream: Option<StreamState>) {
        self.slots[slot.index()] = stream;
    }

    /// Fire-and-forget send to the upstream. A full send buffer drops the
    /// packet; DMR is lossy by design.
    pub fn try_send(&self, data: &[u8]) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.try_send(data) {
                debug!(name = %self.config.name, "outbound send failed: {}", e);
            }
        }
    }

    /// Drive timers: reconnect attempts, handshake timeout, keepalives.
    ///
    /// Returns streams torn off the slots when the session went down, so
    /// the caller can clear their assumed copies.
    pub async fn tick(
        &mut self,
        now: Instant,
        ping_interval: Duration,
        server_tx: &mpsc::Sender<ServerMsg>,
        events: &EventTx,
    ) -> Vec<StreamState> {
        match self.phase {
            OutboundPhase::Idle => {
                if self.config.enabled && now >= self.next_attempt {
                    self.connect(now, server_tx, events).await;
                }
                Vec::new()
            }
            OutboundPhase::Connected => self.tick_keepalive(now, ping_interval, events),
            _ => {
                if now.duration_since(self.phase_started) > HANDSHAKE_TIMEOUT {
                    warn!(name = %self.config.name, "outbound handshake timed out");
                    events.emit(EventBody::OutboundError {
                        connection_name: self.config.name.clone(),
                        radio_id: self.config.radio_id,
                        error: "handshake timeout".into(),
                    });
                    self.teardown(now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn tick_keepalive(&mut self, now: Instant, ping_interval: Duration, events: &EventTx) -> Vec<StreamState> {
        let due = match self.last_ping_sent {
            Some(sent) => now.duration_since(sent) >= ping_interval,
            None => true,
        };
        if !due {
            return Vec::new();
        }
        if let Some(sent) = self.last_ping_sent {
            // No pong has arrived since the last ping went out.
            if self.last_pong <= sent {
                self.missed_pongs += 1;
                debug!(
                    name = %self.config.name,
                    missed = self.missed_pongs,
                    "missed MSTPONG"
                );
            }
        }
        if self.missed_pongs >= MAX_MISSED_PONGS {
            warn!(name = %self.config.name, "upstream stopped answering keepalives");
            events.emit(EventBody::OutboundDisconnected {
                connection_name: self.config.name.clone(),
                radio_id: self.config.radio_id,
                reason: "keepalive timeout".into(),
            });
            return self.teardown(now);
        }
        self.try_send(&protocol::ping(self.config.radio_id));
        self.last_ping_sent = Some(now);
        Vec::new()
    }

    /// Resolve, bind, connect, spawn the reader task, and send RPTL.
    async fn connect(&mut self, now: Instant, server_tx: &mpsc::Sender<ServerMsg>, events: &EventTx) {
        events.emit(EventBody::OutboundConnecting {
            connection_name: self.config.name.clone(),
            radio_id: self.config.radio_id,
        });

        let target = format!("{}:{}", self.config.address, self.config.port);
        let result = async {
            let addr = tokio::net::lookup_host(target.as_str())
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
                })?;
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(addr).await?;
            Ok::<_, std::io::Error>((addr, Arc::new(socket)))
        }
        .await;

        let (addr, socket) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(name = %self.config.name, %target, "outbound connect failed: {}", e);
                events.emit(EventBody::OutboundError {
                    connection_name: self.config.name.clone(),
                    radio_id: self.config.radio_id,
                    error: e.to_string(),
                });
                self.schedule_retry(now);
                return;
            }
        };

        // The reader task feeds received datagrams into the main loop so
        // all session state stays on one logical owner.
        let reader_socket = Arc::clone(&socket);
        let tx = server_tx.clone();
        let index = self.index;
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(len) => {
                        let msg = ServerMsg::OutboundDatagram {
                            index,
                            data: buf[..len].to_vec(),
                        };
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }));

        self.socket = Some(socket);
        self.remote_addr = Some(addr);
        self.phase = OutboundPhase::LoginSent;
        self.phase_started = now;
        self.try_send(&protocol::login(self.config.radio_id));
        info!(name = %self.config.name, %addr, "outbound login sent");
    }

    /// Handle a non-DMRD frame from the upstream.
    ///
    /// Returns torn streams when the frame brought the session down.
    pub fn handle_control(
        &mut self,
        cmd: Command,
        data: &[u8],
        now: Instant,
        events: &EventTx,
    ) -> Vec<StreamState> {
        match (self.phase, cmd) {
            // The salt challenge arrives as RPTACK+salt on most masters,
            // MSTCL+salt on some older implementations. Accept both.
            (OutboundPhase::LoginSent, Command::Ack | Command::Closing) => {
                let Some(payload) = protocol::strip_tag(data) else {
                    return Vec::new();
                };
                if payload.len() < 4 {
                    debug!(name = %self.config.name, "challenge without salt");
                    return Vec::new();
                }
                self.salt = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                self.try_send(&protocol::auth_key(
                    self.config.radio_id,
                    self.salt,
                    &self.config.passphrase,
                ));
                self.phase = OutboundPhase::AuthSent;
                self.phase_started = now;
                Vec::new()
            }
            (OutboundPhase::AuthSent, Command::Ack) => {
                self.try_send(&self.build_rptc().encode(self.config.radio_id));
                self.phase = OutboundPhase::ConfigSent;
                self.phase_started = now;
                Vec::new()
            }
            (OutboundPhase::ConfigSent, Command::Ack) => {
                if self.config.options.is_empty() {
                    self.established(now, events);
                } else {
                    self.try_send(&protocol::options(self.config.radio_id, &self.config.options));
                    self.phase = OutboundPhase::OptionsSent;
                    self.phase_started = now;
                }
                Vec::new()
            }
            (OutboundPhase::OptionsSent, Command::Ack) => {
                self.established(now, events);
                Vec::new()
            }
            (OutboundPhase::Connected, Command::Pong) => {
                self.last_pong = now;
                self.missed_pongs = 0;
                Vec::new()
            }
            (OutboundPhase::Connected, Command::Closing) => {
                info!(name = %self.config.name, "upstream closed the connection");
                events.emit(EventBody::OutboundDisconnected {
                    connection_name: self.config.name.clone(),
                    radio_id: self.config.radio_id,
                    reason: "master closed".into(),
                });
                self.teardown(now)
            }
            (_, Command::Nak) => {
                warn!(name = %self.config.name, phase = ?self.phase, "upstream rejected us (MSTNAK)");
                events.emit(EventBody::OutboundError {
                    connection_name: self.config.name.clone(),
                    radio_id: self.config.radio_id,
                    error: format!("rejected in {:?} phase", self.phase),
                });
                self.teardown(now)
            }
            (_, cmd) => {
                debug!(name = %self.config.name, ?cmd, phase = ?self.phase, "ignoring frame");
                Vec::new()
            }
        }
    }

    fn established(&mut self, now: Instant, events: &EventTx) {
        self.phase = OutboundPhase::Connected;
        self.phase_started = now;
        self.backoff = INITIAL_BACKOFF;
        self.last_pong = now;
        self.last_ping_sent = None;
        self.missed_pongs = 0;
        let remote = self
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(name = %self.config.name, remote = %remote, "outbound connection established");
        events.emit(EventBody::OutboundConnected {
            connection_name: self.config.name.clone(),
            radio_id: self.config.radio_id,
            remote_address: remote,
        });
    }

    /// Drop the connection and schedule a retry; returns the slot streams
    /// so the caller can clear their assumed copies.
    pub fn teardown(&mut self, now: Instant) -> Vec<StreamState> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
        self.remote_addr = None;
        self.phase = OutboundPhase::Idle;
        self.last_ping_sent = None;
        self.missed_pongs = 0;
        self.schedule_retry(now);
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Send a polite RPTCL before shutdown.
    pub fn send_disconnect(&self) {
        if self.is_connected() {
            self.try_send(&protocol::disconnect(self.config.radio_id));
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.next_attempt = now + self.backoff;
        debug!(
            name = %self.config.name,
            retry_in = ?self.backoff,
            "outbound reconnect scheduled"
        );
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
    }

    /// Our RPTC metadata, from the outbound config entry.
    fn build_rptc(&self) -> RptcData {
        RptcData {
            callsign: self.config.callsign.clone(),
            rx_freq: format!("{:09}", self.config.rx_frequency),
            tx_freq: format!("{:09}", self.config.tx_frequency),
            tx_power: format!("{:02}", self.config.power.min(99)),
            colorcode: format!("{:02}", self.config.colorcode.min(15)),
            latitude: format!("{:.4}", self.config.latitude),
            longitude: format!("{:.4}", self.config.longitude),
            height: format!("{:03}", self.config.height.min(999)),
            location: self.config.location.clone(),
            description: self.config.description.clone(),
            slots: "2".to_string(),
            url: self.config.url.clone(),
            software_id: self.config.software_id.clone(),
            package_id: self.config.package_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallType;

    fn config(options: &str) -> OutboundConfig {
        OutboundConfig {
            enabled: true,
            name: "upstream".into(),
            address: "127.0.0.1".into(),
            port: 62031,
            radio_id: 312000,
            passphrase: "s3cret".into(),
            options: options.into(),
            callsign: "KS0DMR".into(),
            rx_frequency: 449375000,
            tx_frequency: 444375000,
            power: 25,
            colorcode: 1,
            latitude: 38.9822,
            longitude: -94.6708,
            height: 100,
            location: "Overland Park, KS".into(),
            description: "Network link".into(),
            url: String::new(),
            software_id: "HBMaster".into(),
            package_id: "HBMaster v0.9.2".into(),
        }
    }

    fn session(options: &str) -> OutboundSession {
        OutboundSession::new(0, config(options), Instant::now())
    }

    #[test]
    fn test_slot_tgs_from_options() {
        let s = session("TS1=3100,3101;TS2=3120");
        assert!(s.slot_tgs[0].contains(3100));
        assert!(!s.slot_tgs[0].contains(3120));
        assert!(s.slot_tgs[1].contains(3120));

        // No options: both slots unrestricted.
        let s = session("");
        assert!(s.slot_tgs[0].contains(999));
        assert!(s.slot_tgs[1].contains(999));

        // Only TS1 requested: TS2 stays unrestricted.
        let s = session("TS1=3100");
        assert!(!s.slot_tgs[0].contains(999));
        assert!(s.slot_tgs[1].contains(999));
    }

    #[test]
    fn test_handshake_control_flow() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("TS1=3100");
        s.phase = OutboundPhase::LoginSent;

        // Challenge (no socket bound in tests; sends are silently skipped).
        let challenge = protocol::ack_with_salt(0xdeadbeef);
        s.handle_control(Command::Ack, &challenge, now, &events);
        assert_eq!(s.phase, OutboundPhase::AuthSent);
        assert_eq!(s.salt, 0xdeadbeef);

        // Auth acknowledged: RPTC goes out.
        s.handle_control(Command::Ack, &protocol::ack(312000), now, &events);
        assert_eq!(s.phase, OutboundPhase::ConfigSent);

        // Config acknowledged: options were configured, so RPTO goes out.
        s.handle_control(Command::Ack, &protocol::ack(312000), now, &events);
        assert_eq!(s.phase, OutboundPhase::OptionsSent);

        // Options acknowledged: connected.
        s.handle_control(Command::Ack, &protocol::ack(312000), now, &events);
        assert_eq!(s.phase, OutboundPhase::Connected);
        assert!(s.is_connected());
    }

    #[test]
    fn test_handshake_skips_options_when_unconfigured() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("");
        s.phase = OutboundPhase::ConfigSent;
        s.handle_control(Command::Ack, &protocol::ack(312000), now, &events);
        assert_eq!(s.phase, OutboundPhase::Connected);
    }

    #[test]
    fn test_mstcl_challenge_accepted() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("");
        s.phase = OutboundPhase::LoginSent;

        let mut challenge = b"MSTCL".to_vec();
        challenge.extend_from_slice(&0xcafebabeu32.to_be_bytes());
        s.handle_control(Command::Closing, &challenge, now, &events);
        assert_eq!(s.phase, OutboundPhase::AuthSent);
        assert_eq!(s.salt, 0xcafebabe);
    }

    #[test]
    fn test_nak_tears_down_with_backoff() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("");
        s.phase = OutboundPhase::AuthSent;

        s.handle_control(Command::Nak, &protocol::nak(312000), now, &events);
        assert_eq!(s.phase, OutboundPhase::Idle);
        assert_eq!(s.next_attempt, now + INITIAL_BACKOFF);
        // Backoff doubles per failure, capped at 60 s.
        assert_eq!(s.backoff, INITIAL_BACKOFF * 2);
        for _ in 0..10 {
            s.schedule_retry(now);
        }
        assert_eq!(s.backoff, MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_resets_on_establish() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("");
        s.backoff = Duration::from_secs(32);
        s.phase = OutboundPhase::OptionsSent;
        s.handle_control(Command::Ack, &protocol::ack(312000), now, &events);
        assert_eq!(s.backoff, INITIAL_BACKOFF);
    }

    #[test]
    fn test_pong_resets_missed_counter() {
        let now = Instant::now();
        let events = EventTx::disabled();
        let mut s = session("");
        s.phase = OutboundPhase::Connected;
        s.missed_pongs = 2;
        s.handle_control(Command::Pong, &protocol::pong(312000), now, &events);
        assert_eq!(s.missed_pongs, 0);
        assert_eq!(s.last_pong, now);
    }

    #[test]
    fn test_keepalive_miss_counting_and_teardown() {
        let start = Instant::now();
        let events = EventTx::disabled();
        let ping = Duration::from_secs(5);
        let mut s = session("");
        s.phase = OutboundPhase::Connected;
        s.last_pong = start;

        // First due tick sends a ping without counting a miss.
        assert!(s.tick_keepalive(start, ping, &events).is_empty());
        assert_eq!(s.missed_pongs, 0);

        // Two silent intervals accumulate misses but stay connected.
        let mut now = start;
        for expected in 1..=2 {
            now += ping;
            s.tick_keepalive(now, ping, &events);
            assert_eq!(s.missed_pongs, expected);
            assert!(s.is_connected());
        }

        // The third consecutive miss tears the session down.
        now += ping;
        s.tick_keepalive(now, ping, &events);
        assert_eq!(s.missed_pongs, 3);
        assert_eq!(s.phase, OutboundPhase::Idle);
    }

    #[test]
    fn test_teardown_returns_slot_streams() {
        let now = Instant::now();
        let mut s = session("");
        s.phase = OutboundPhase::Connected;
        s.set_slot_stream(
            Slot::Ts1,
            Some(StreamState::new(1, 2, 3, Slot::Ts1, CallType::Group, now)),
        );

        let torn = s.teardown(now);
        assert_eq!(torn.len(), 1);
        assert!(s.slot_stream(Slot::Ts1).is_none());
        assert!(s.slot_stream(Slot::Ts2).is_none());
    }

    #[test]
    fn test_rptc_metadata_formatting() {
        let s = session("");
        let rptc = s.build_rptc();
        assert_eq!(rptc.rx_freq, "449375000");
        assert_eq!(rptc.tx_power, "25");
        assert_eq!(rptc.colorcode, "01");
        assert_eq!(rptc.height, "100");
        assert_eq!(rptc.slots, "2");
        let frame = rptc.encode(312000);
        assert_eq!(frame.len(), crate::protocol::RPTC_LEN);
    }
}
