// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Per-slot stream tracking: admission, hang time, routing-set computation.
//!
//! A slot carries at most one stream at a time (TDMA air-interface
//! constraint). When a stream ends, the slot stays reserved for
//! `hang_time`: the same user may continue (on any talkgroup), and any user
//! may join the same talkgroup, but a different user starting a different
//! conversation is rejected until the reservation expires.
//!
//! Routing is computed exactly once, at stream start, and cached for the
//! stream's whole life; peers that leave mid-stream are tolerated as send
//! failures.

use crate::protocol::{CallType, Slot};
use crate::server::peer::TalkgroupSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of a routing endpoint: an inbound peer or an outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetId {
    /// Inbound peer, by radio id.
    Peer(u32),
    /// Outbound session, by index into the outbound table.
    Outbound(usize),
}

/// State of one transmission on one slot.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Stream identifier chosen by the source.
    pub stream_id: u32,
    /// The user radio keying up (24 bits).
    pub rf_src: u32,
    /// Talkgroup or private destination (24 bits).
    pub dst_id: u32,
    pub slot: Slot,
    pub call_type: CallType,
    pub start_time: Instant,
    pub last_seen: Instant,
    pub ended: bool,
    pub end_time: Option<Instant>,
    pub packets: u64,
    /// Installed on a routing target to reserve its slot; not received from it.
    pub is_assumed: bool,
    /// Routing set, computed once at start. `Some` == routing cached.
    pub targets: Option<Arc<HashSet<TargetId>>>,
}

impl StreamState {
    pub fn new(
        stream_id: u32,
        rf_src: u32,
        dst_id: u32,
        slot: Slot,
        call_type: CallType,
        now: Instant,
    ) -> Self {
        Self {
            stream_id,
            rf_src,
            dst_id,
            slot,
            call_type,
            start_time: now,
            last_seen: now,
            ended: false,
            end_time: None,
            packets: 0,
            is_assumed: false,
            targets: None,
        }
    }

    /// Copy installed on a routing target's slot at stream start.
    pub fn assumed_copy(&self) -> Self {
        Self {
            is_assumed: true,
            targets: None,
            ..self.clone()
        }
    }

    /// Still receiving packets within the timeout window.
    pub fn is_active(&self, timeout: Duration, now: Instant) -> bool {
        !self.ended && now.duration_since(self.last_seen) < timeout
    }

    /// Ended, and the post-end slot reservation has not expired.
    pub fn in_hang_time(&self, hang_time: Duration, now: Instant) -> bool {
        match (self.ended, self.end_time) {
            (true, Some(end)) => now.duration_since(end) < hang_time,
            _ => false,
        }
    }

    /// Hang-time admission: same user on any talkgroup, or any user on the
    /// same talkgroup. Everything else is a hijack attempt.
    pub fn hang_time_admits(&self, rf_src: u32, dst_id: u32) -> bool {
        rf_src == self.rf_src || dst_id == self.dst_id
    }

    /// Whether this slot can be a routing target for a new stream.
    ///
    /// A free slot is one with no stream; an ended stream still admits
    /// hang-time-compatible traffic, and once its reservation lapses it no
    /// longer blocks anything (the sweeper will collect it).
    pub fn admits_as_target(&self, rf_src: u32, dst_id: u32, hang_time: Duration, now: Instant) -> bool {
        if !self.ended {
            return false;
        }
        if self.in_hang_time(hang_time, now) {
            self.hang_time_admits(rf_src, dst_id)
        } else {
            true
        }
    }

    pub fn routing_cached(&self) -> bool {
        self.targets.is_some()
    }

    /// Record a forwarded/received packet.
    pub fn touch(&mut self, now: Instant) {
        self.packets += 1;
        self.last_seen = now;
    }

    /// Mark the stream ended; the slot stays reserved for hang time.
    pub fn end(&mut self, now: Instant) {
        self.ended = true;
        self.end_time = Some(now);
    }

    /// Stream duration in seconds, start to end (or to `now` while active).
    pub fn duration(&self, now: Instant) -> f64 {
        self.end_time
            .unwrap_or(now)
            .duration_since(self.start_time)
            .as_secs_f64()
    }
}

/// Admission verdict for a DMRD packet against the slot's current stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No conflicting stream; start a new one.
    Start,
    /// Continuation of the active stream.
    Continue,
    /// Slot busy or hang-time hijack; drop silently.
    Reject,
}

/// Decide what to do with a packet `(stream_id, rf_src, dst_id)` arriving on
/// a slot currently holding `current`.
pub fn admit(
    current: Option<&StreamState>,
    stream_id: u32,
    rf_src: u32,
    dst_id: u32,
    hang_time: Duration,
    now: Instant,
) -> Admission {
    let Some(cur) = current else {
        return Admission::Start;
    };
    if !cur.ended {
        if stream_id == cur.stream_id {
            return Admission::Continue;
        }
        return Admission::Reject;
    }
    if cur.in_hang_time(hang_time, now) {
        if cur.hang_time_admits(rf_src, dst_id) {
            Admission::Start
        } else {
            Admission::Reject
        }
    } else {
        Admission::Start
    }
}

/// One candidate endpoint offered to the routing computation.
pub struct RouteCandidate<'a> {
    pub id: TargetId,
    /// Session fully established.
    pub connected: bool,
    /// The candidate's stream on the relevant slot, if any.
    pub slot_stream: Option<&'a StreamState>,
    /// The candidate's allowed talkgroups on the relevant slot.
    pub slot_tgs: &'a TalkgroupSet,
}

/// Compute the routing set for a new stream. Called exactly once per stream.
///
/// A candidate is included iff it is not the source, it is connected, its
/// slot is free (or hang-time compatible), and — for group calls — the
/// destination talkgroup is in its allow set, or — for private calls — the
/// user cache places the destination radio behind it.
pub fn compute_targets<'a>(
    source: TargetId,
    rf_src: u32,
    dst_id: u32,
    call_type: CallType,
    private_target: Option<TargetId>,
    hang_time: Duration,
    now: Instant,
    candidates: impl Iterator<Item = RouteCandidate<'a>>,
) -> HashSet<TargetId> {
    let mut targets = HashSet::new();
    for candidate in candidates {
        if candidate.id == source || !candidate.connected {
            continue;
        }
        if let Some(stream) = candidate.slot_stream {
            if !stream.admits_as_target(rf_src, dst_id, hang_time, now) {
                continue;
            }
        }
        match call_type {
            CallType::Group => {
                if !candidate.slot_tgs.contains(dst_id) {
                    continue;
                }
            }
            CallType::Private => {
                if private_target != Some(candidate.id) {
                    continue;
                }
            }
        }
        targets.insert(candidate.id);
    }
    targets
}
