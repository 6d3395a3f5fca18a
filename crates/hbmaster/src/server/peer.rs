// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Inbound peer sessions and the authoritative registry.
//!
//! "Peer" covers anything speaking HBP at us: a physical repeater, a
//! hotspot, or a network link from another server. `connection_type` is a
//! display heuristic derived from the RPTC software/package identifiers.

use crate::config::ConnectionTypeDetection;
use crate::protocol::{RptcData, Slot};
use crate::server::stream::StreamState;
use rand::Rng;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Allowed talkgroups on one slot.
///
/// `Unrestricted` forwards everything; an empty `Allowed` set denies
/// everything on the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TalkgroupSet {
    Unrestricted,
    Allowed(HashSet<u32>),
}

impl TalkgroupSet {
    /// Build from a config list: absent list means unrestricted.
    pub fn from_config(list: &Option<Vec<u32>>) -> Self {
        match list {
            None => Self::Unrestricted,
            Some(tgs) => Self::Allowed(tgs.iter().copied().collect()),
        }
    }

    pub fn contains(&self, tg: u32) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Allowed(tgs) => tgs.contains(&tg),
        }
    }

    /// Apply an RPTO request against this configured set.
    ///
    /// The configuration is master: the result is the intersection. An
    /// empty request leaves the configured set in force.
    pub fn intersect_request(&self, requested: &HashSet<u32>) -> Self {
        if requested.is_empty() {
            return self.clone();
        }
        match self {
            Self::Unrestricted => Self::Allowed(requested.clone()),
            Self::Allowed(allowed) => {
                Self::Allowed(allowed.intersection(requested).copied().collect())
            }
        }
    }

    /// Sorted list for event payloads; `None` when unrestricted.
    pub fn to_sorted(&self) -> Option<Vec<u32>> {
        match self {
            Self::Unrestricted => None,
            Self::Allowed(tgs) => {
                let mut list: Vec<u32> = tgs.iter().copied().collect();
                list.sort_unstable();
                Some(list)
            }
        }
    }
}

/// Display category of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Repeater,
    Hotspot,
    Network,
    Unknown,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repeater => "repeater",
            Self::Hotspot => "hotspot",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

fn match_category(value: &str, rules: &ConnectionTypeDetection) -> Option<ConnectionType> {
    let value = value.to_ascii_lowercase();
    if rules.hotspot_packages.iter().any(|p| value.contains(p.as_str())) {
        return Some(ConnectionType::Hotspot);
    }
    if rules.network_packages.iter().any(|p| value.contains(p.as_str())) {
        return Some(ConnectionType::Network);
    }
    if rules.repeater_packages.iter().any(|p| value.contains(p.as_str())) {
        return Some(ConnectionType::Repeater);
    }
    None
}

/// Classify a peer from its RPTC identifiers.
///
/// `package_id` is authoritative when it matches anything; `software_id` is
/// the fallback. Matching is case-insensitive substring against the
/// configured lists.
pub fn detect_connection_type(
    software_id: &str,
    package_id: &str,
    rules: &ConnectionTypeDetection,
) -> ConnectionType {
    if !package_id.is_empty() {
        if let Some(kind) = match_category(package_id, rules) {
            return kind;
        }
    }
    if !software_id.is_empty() {
        if let Some(kind) = match_category(software_id, rules) {
            return kind;
        }
    }
    ConnectionType::Unknown
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// RPTL seen, salt issued, waiting for RPTK.
    Login,
    /// Authenticated, waiting for RPTC.
    Config,
    /// Fully established; participates in routing.
    Connected,
    /// Missed too many keepalives; about to be removed.
    Dead,
}

/// Access-control outcome recorded on the session for events.
#[derive(Debug, Clone, Default)]
pub struct MatchInfo {
    pub pattern_name: Option<String>,
    pub pattern_description: Option<String>,
    pub match_reason: String,
}

/// One inbound peer session.
#[derive(Debug)]
pub struct PeerSession {
    pub radio_id: u32,
    pub addr: SocketAddr,
    /// Login challenge salt, minted per RPTL.
    pub salt: u32,
    pub state: SessionState,
    pub last_ping: Instant,
    pub ping_count: u64,
    pub missed_pings: u32,
    /// Passphrase selected by the access matcher at login.
    pub passphrase: String,
    /// Raw RPTC frame, kept verbatim.
    pub raw_config: Option<Vec<u8>>,
    /// Decoded RPTC fields.
    pub metadata: Option<RptcData>,
    pub connection_type: ConnectionType,
    /// Configured allow sets (the master copy RPTO intersects against).
    pub config_tgs: [TalkgroupSet; 2],
    /// Effective allow sets after any RPTO.
    pub slot_tgs: [TalkgroupSet; 2],
    pub rpto_received: bool,
    pub match_info: MatchInfo,
    /// Active or hang-time stream per slot.
    pub slots: [Option<StreamState>; 2],
}

impl PeerSession {
    /// Create a fresh session in LOGIN state with a random salt.
    pub fn new(radio_id: u32, addr: SocketAddr, passphrase: String, now: Instant) -> Self {
        Self {
            radio_id,
            addr,
            salt: rand::thread_rng().gen(),
            state: SessionState::Login,
            last_ping: now,
            ping_count: 0,
            missed_pings: 0,
            passphrase,
            raw_config: None,
            metadata: None,
            connection_type: ConnectionType::Unknown,
            config_tgs: [TalkgroupSet::Unrestricted, TalkgroupSet::Unrestricted],
            slot_tgs: [TalkgroupSet::Unrestricted, TalkgroupSet::Unrestricted],
            rpto_received: false,
            match_info: MatchInfo::default(),
            slots: [None, None],
        }
    }

    pub fn callsign(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.callsign.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or("UNKNOWN")
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

    /// Record a successful keepalive.
    pub fn touch_ping(&mut self, now: Instant) {
        self.last_ping = now;
        self.ping_count += 1;
        self.missed_pings = 0;
    }

    /// Keepalives missed since the last successful ping.
    pub fn compute_missed_pings(&self, keepalive: Duration, now: Instant) -> u32 {
        let elapsed = now.duration_since(self.last_ping);
        (elapsed.as_secs_f64() / keepalive.as_secs_f64()) as u32
    }

    /// A peer is dead after `keepalive * (max_missed + 1)` of silence.
    pub fn is_expired(&self, keepalive: Duration, max_missed: u32, now: Instant) -> bool {
        now.duration_since(self.last_ping) > keepalive * (max_missed + 1)
    }
}

/// Authoritative table of inbound sessions, keyed by radio id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<u32, PeerSession>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, radio_id: u32) -> Option<&PeerSession> {
        self.peers.get(&radio_id)
    }

    pub fn get_mut(&mut self, radio_id: u32) -> Option<&mut PeerSession> {
        self.peers.get_mut(&radio_id)
    }

    pub fn insert(&mut self, session: PeerSession) {
        self.peers.insert(session.radio_id, session);
    }

    pub fn remove(&mut self, radio_id: u32) -> Option<PeerSession> {
        self.peers.remove(&radio_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.peers.values_mut()
    }

    /// Validate that a datagram for `radio_id` comes from the recorded
    /// address. A mismatch is a takeover attempt.
    pub fn validate_source(&self, radio_id: u32, addr: SocketAddr) -> Option<&PeerSession> {
        self.peers.get(&radio_id).filter(|p| p.addr == addr)
    }

    /// Update missed-ping counters and mark expired peers DEAD.
    ///
    /// Returns the ids of peers that just died; the caller removes them and
    /// emits the disconnect events.
    pub fn reap_expired(&mut self, keepalive: Duration, max_missed: u32, now: Instant) -> Vec<u32> {
        let mut dead = Vec::new();
        for peer in self.peers.values_mut() {
            let missed = peer.compute_missed_pings(keepalive, now);
            if missed > peer.missed_pings {
                peer.missed_pings = missed;
            }
            if peer.is_expired(keepalive, max_missed, now) {
                peer.state = SessionState::Dead;
                dead.push(peer.radio_id);
            }
        }
        dead
    }
}
