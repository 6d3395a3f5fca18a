// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! HomeBrew protocol (HBP) frame codec.
//!
//! HBP frames are identified by a 4-7 byte ASCII tag. The only fixed-layout
//! binary frame on the hot path is DMRD:
//!
//! ```text
//! 0        4   5      8      11       15  16      20              53+
//! +--------+---+------+------+--------+---+--------+---------------+
//! | "DMRD" |seq|rf_src|dst_id|peer_id |bit|stream  | DMR payload   |
//! |        |   | BE24 | BE24 |  BE32  |   |id BE32 |  (opaque)     |
//! +--------+---+------+------+--------+---+--------+---------------+
//! ```
//!
//! Byte 15 bit layout: bit7 = slot (1 => TS2), bit6 = call type (1 =>
//! private), bits 5:4 = frame type (0 voice, 1 voice sync, 2 data sync),
//! bits 3:0 = data type / voice sequence.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Minimum length of a valid DMRD frame.
pub const DMRD_MIN_LEN: usize = 55;
/// Exact length of an RPTC configuration frame.
pub const RPTC_LEN: usize = 302;
/// Default HomeBrew DMR port.
pub const DMR_PORT: u16 = 62031;

pub const TAG_DMRD: &[u8] = b"DMRD";
pub const TAG_RPTL: &[u8] = b"RPTL";
pub const TAG_RPTK: &[u8] = b"RPTK";
pub const TAG_RPTC: &[u8] = b"RPTC";
pub const TAG_RPTCL: &[u8] = b"RPTCL";
pub const TAG_RPTO: &[u8] = b"RPTO";
pub const TAG_RPTP: &[u8] = b"RPTP";
pub const TAG_RPTPING: &[u8] = b"RPTPING";
pub const TAG_RPTACK: &[u8] = b"RPTACK";
pub const TAG_RPTA: &[u8] = b"RPTA";
pub const TAG_MSTPONG: &[u8] = b"MSTPONG";
pub const TAG_MSTNAK: &[u8] = b"MSTNAK";
pub const TAG_MSTN: &[u8] = b"MSTN";
pub const TAG_MSTCL: &[u8] = b"MSTCL";
pub const TAG_MSTC: &[u8] = b"MSTC";

/// Protocol error types.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("frame too short: {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },

    #[error("unknown frame tag")]
    UnknownTag,

    #[error("configuration frame is not valid ASCII at {field}")]
    BadConfigField { field: &'static str },
}

/// Recognized HBP commands.
///
/// `RPTP` is a 4-byte prefix of the full `RPTPING` keepalive tag; both carry
/// the peer id at the same offset and map to [`Command::Ping`]. `RPTCL`
/// shares its first four bytes with `RPTC` and is disambiguated by the
/// 5-byte literal. The short master tags (`MSTN`, `MSTC`, `RPTA`) are
/// truncated spellings some implementations emit; they alias the long forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// DMRD voice/data frame.
    Dmrd,
    /// RPTL login request.
    Login,
    /// RPTK auth response.
    AuthKey,
    /// RPTC configuration.
    Config,
    /// RPTCL disconnect.
    Disconnect,
    /// RPTPING / RPTP keepalive.
    Ping,
    /// RPTO per-slot talkgroup options.
    Options,
    /// MSTPONG keepalive reply (seen on outbound sessions).
    Pong,
    /// MSTNAK / MSTN rejection (seen on outbound sessions).
    Nak,
    /// MSTCL / MSTC master closing, or login challenge on some masters.
    Closing,
    /// RPTACK / RPTA acknowledgement (seen on outbound sessions).
    Ack,
}

/// Identify the command carried by a datagram.
///
/// Longer tags are checked before their prefixes (RPTCL before RPTC,
/// MSTNAK before MSTN, MSTCL before MSTC, RPTACK before RPTA).
pub fn identify(data: &[u8]) -> Option<Command> {
    if data.starts_with(TAG_DMRD) {
        Some(Command::Dmrd)
    } else if data.starts_with(TAG_RPTL) {
        Some(Command::Login)
    } else if data.starts_with(TAG_RPTK) {
        Some(Command::AuthKey)
    } else if data.starts_with(TAG_RPTCL) {
        Some(Command::Disconnect)
    } else if data.starts_with(TAG_RPTC) {
        Some(Command::Config)
    } else if data.starts_with(TAG_RPTO) {
        Some(Command::Options)
    } else if data.starts_with(TAG_RPTP) {
        // Covers both RPTPING and the bare RPTP prefix; the peer id sits at
        // [7:11] either way (the frame is always 11 bytes).
        Some(Command::Ping)
    } else if data.starts_with(TAG_MSTPONG) {
        Some(Command::Pong)
    } else if data.starts_with(TAG_MSTNAK) || data.starts_with(TAG_MSTN) {
        Some(Command::Nak)
    } else if data.starts_with(TAG_MSTCL) || data.starts_with(TAG_MSTC) {
        Some(Command::Closing)
    } else if data.starts_with(TAG_RPTACK) || data.starts_with(TAG_RPTA) {
        Some(Command::Ack)
    } else {
        None
    }
}

/// Recognized tags, longest first, for payload extraction.
const TAGS_BY_LENGTH: &[&[u8]] = &[
    TAG_RPTPING,
    TAG_MSTPONG,
    TAG_RPTACK,
    TAG_MSTNAK,
    TAG_RPTCL,
    TAG_MSTCL,
    TAG_DMRD,
    TAG_RPTL,
    TAG_RPTK,
    TAG_RPTC,
    TAG_RPTO,
    TAG_RPTP,
    TAG_RPTA,
    TAG_MSTN,
    TAG_MSTC,
];

/// Strip the leading tag off a frame, returning the payload.
///
/// Needed where the same command arrives under tags of different lengths
/// (`RPTACK` vs `RPTA`, `MSTCL` vs `MSTC`).
pub fn strip_tag(data: &[u8]) -> Option<&[u8]> {
    TAGS_BY_LENGTH
        .iter()
        .find(|tag| data.starts_with(tag))
        .map(|tag| &data[tag.len()..])
}

/// Read a big-endian u32 at `offset`. Caller guarantees bounds.
fn be32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Read a big-endian 24-bit value at `offset`. Caller guarantees bounds.
fn be24(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, data[offset], data[offset + 1], data[offset + 2]])
}

/// Extract a 4-byte peer id field, if present.
pub fn peer_id_at(data: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    if data.len() < offset + 4 {
        return Err(ProtocolError::TooShort {
            got: data.len(),
            need: offset + 4,
        });
    }
    Ok(be32(data, offset))
}

/// TDMA timeslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Ts1,
    Ts2,
}

impl Slot {
    /// Slot number as transmitted on the air (1 or 2).
    pub fn number(self) -> u8 {
        match self {
            Slot::Ts1 => 1,
            Slot::Ts2 => 2,
        }
    }

    /// Index into a two-element per-slot array.
    pub fn index(self) -> usize {
        match self {
            Slot::Ts1 => 0,
            Slot::Ts2 => 1,
        }
    }

    pub const BOTH: [Slot; 2] = [Slot::Ts1, Slot::Ts2];
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TS{}", self.number())
    }
}

/// DMR call type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Group,
    Private,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Group => "group",
            CallType::Private => "private",
        }
    }
}

/// Zero-copy view over a DMRD frame. Hot path: one per voice packet.
#[derive(Debug, Clone, Copy)]
pub struct Dmrd<'a> {
    data: &'a [u8],
}

impl<'a> Dmrd<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < DMRD_MIN_LEN {
            return Err(ProtocolError::TooShort {
                got: data.len(),
                need: DMRD_MIN_LEN,
            });
        }
        Ok(Self { data })
    }

    pub fn seq(&self) -> u8 {
        self.data[4]
    }

    /// RF source (the user radio), 24 bits.
    pub fn rf_src(&self) -> u32 {
        be24(self.data, 5)
    }

    /// Destination talkgroup or private target, 24 bits.
    pub fn dst_id(&self) -> u32 {
        be24(self.data, 8)
    }

    /// Peer (repeater) the stream arrives through.
    pub fn peer_id(&self) -> u32 {
        be32(self.data, 11)
    }

    pub fn slot(&self) -> Slot {
        if self.data[15] & 0x80 != 0 {
            Slot::Ts2
        } else {
            Slot::Ts1
        }
    }

    pub fn call_type(&self) -> CallType {
        if self.data[15] & 0x40 != 0 {
            CallType::Private
        } else {
            CallType::Group
        }
    }

    /// 0 = voice, 1 = voice sync, 2 = data sync.
    pub fn frame_type(&self) -> u8 {
        (self.data[15] & 0x30) >> 4
    }

    /// Data type / voice sequence, bits 3:0 of byte 15.
    pub fn dtype_vseq(&self) -> u8 {
        self.data[15] & 0x0F
    }

    pub fn stream_id(&self) -> u32 {
        be32(self.data, 16)
    }

    /// Stream terminator: data-sync frame carrying a voice terminator.
    ///
    /// The HBP flag makes end detection immediate (~60 ms) instead of
    /// waiting out the stream timeout. No ETSI sync-pattern matching needed.
    pub fn is_terminator(&self) -> bool {
        self.frame_type() == 2 && self.dtype_vseq() == 2
    }

    /// The full datagram, for verbatim forwarding.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Decoded RPTC configuration fields.
///
/// Fields are space/NUL-padded ASCII at fixed offsets; decode trims the
/// padding. The raw frame is kept separately on the session for forwarding
/// fidelity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RptcData {
    pub callsign: String,
    pub rx_freq: String,
    pub tx_freq: String,
    pub tx_power: String,
    pub colorcode: String,
    pub latitude: String,
    pub longitude: String,
    pub height: String,
    pub location: String,
    pub description: String,
    pub slots: String,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

/// Field offsets within the 302-byte RPTC frame (tag + peer id + fields).
const RPTC_FIELDS: &[(&str, usize, usize)] = &[
    ("callsign", 8, 16),
    ("rx_freq", 16, 25),
    ("tx_freq", 25, 34),
    ("tx_power", 34, 36),
    ("colorcode", 36, 38),
    ("latitude", 38, 46),
    ("longitude", 46, 55),
    ("height", 55, 58),
    ("location", 58, 78),
    ("description", 78, 97),
    ("slots", 97, 98),
    ("url", 98, 222),
    ("software_id", 222, 262),
    ("package_id", 262, 302),
];

/// Trim padding from a wire field.
pub fn trim_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

impl RptcData {
    /// Decode the fixed-offset fields of an RPTC frame.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RPTC_LEN {
            return Err(ProtocolError::TooShort {
                got: data.len(),
                need: RPTC_LEN,
            });
        }
        let mut cfg = Self::default();
        for (name, start, end) in RPTC_FIELDS {
            let value = trim_field(&data[*start..*end]);
            match *name {
                "callsign" => cfg.callsign = value,
                "rx_freq" => cfg.rx_freq = value,
                "tx_freq" => cfg.tx_freq = value,
                "tx_power" => cfg.tx_power = value,
                "colorcode" => cfg.colorcode = value,
                "latitude" => cfg.latitude = value,
                "longitude" => cfg.longitude = value,
                "height" => cfg.height = value,
                "location" => cfg.location = value,
                "description" => cfg.description = value,
                "slots" => cfg.slots = value,
                "url" => cfg.url = value,
                "software_id" => cfg.software_id = value,
                "package_id" => cfg.package_id = value,
                _ => unreachable!(),
            }
        }
        Ok(cfg)
    }

    /// Encode a 302-byte RPTC frame for an outbound session.
    ///
    /// Values longer than their field are truncated; shorter values are
    /// space-padded, matching what repeater firmware sends.
    pub fn encode(&self, radio_id: u32) -> Vec<u8> {
        let mut buf = vec![b' '; RPTC_LEN];
        buf[0..4].copy_from_slice(TAG_RPTC);
        buf[4..8].copy_from_slice(&radio_id.to_be_bytes());
        for (name, start, end) in RPTC_FIELDS {
            let value = match *name {
                "callsign" => &self.callsign,
                "rx_freq" => &self.rx_freq,
                "tx_freq" => &self.tx_freq,
                "tx_power" => &self.tx_power,
                "colorcode" => &self.colorcode,
                "latitude" => &self.latitude,
                "longitude" => &self.longitude,
                "height" => &self.height,
                "location" => &self.location,
                "description" => &self.description,
                "slots" => &self.slots,
                "url" => &self.url,
                "software_id" => &self.software_id,
                "package_id" => &self.package_id,
                _ => unreachable!(),
            };
            let width = end - start;
            let bytes = value.as_bytes();
            let n = bytes.len().min(width);
            buf[*start..*start + n].copy_from_slice(&bytes[..n]);
        }
        buf
    }
}

/// Parsed RPTO body: requested talkgroups per slot.
///
/// An empty set for a slot means the peer made no request for it and the
/// configured set stays in force.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotRequest {
    pub ts1: std::collections::HashSet<u32>,
    pub ts2: std::collections::HashSet<u32>,
}

/// Parse an RPTO options body: `TS1=<csv>;TS2=<csv>`.
///
/// Keys are case-insensitive, either may be absent or empty, and
/// non-numeric list entries are skipped.
pub fn parse_options(body: &str) -> SlotRequest {
    let mut req = SlotRequest::default();
    for part in body.split(';') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let tgs: std::collections::HashSet<u32> = value
            .split(',')
            .filter_map(|tg| tg.trim().parse::<u32>().ok())
            .collect();
        match key.trim().to_ascii_uppercase().as_str() {
            "TS1" => req.ts1 = tgs,
            "TS2" => req.ts2 = tgs,
            _ => {}
        }
    }
    req
}

// ===== Response / request builders =====

fn tagged(tag: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tag.len() + payload.len());
    buf.extend_from_slice(tag);
    buf.extend_from_slice(payload);
    buf
}

/// `RPTACK` carrying the login salt.
pub fn ack_with_salt(salt: u32) -> Vec<u8> {
    tagged(TAG_RPTACK, &salt.to_be_bytes())
}

/// `RPTACK` carrying a peer id.
pub fn ack(radio_id: u32) -> Vec<u8> {
    tagged(TAG_RPTACK, &radio_id.to_be_bytes())
}

/// `MSTNAK` rejection.
pub fn nak(radio_id: u32) -> Vec<u8> {
    tagged(TAG_MSTNAK, &radio_id.to_be_bytes())
}

/// `MSTPONG` keepalive reply.
pub fn pong(radio_id: u32) -> Vec<u8> {
    tagged(TAG_MSTPONG, &radio_id.to_be_bytes())
}

/// `RPTL` login request (outbound sessions).
pub fn login(radio_id: u32) -> Vec<u8> {
    tagged(TAG_RPTL, &radio_id.to_be_bytes())
}

/// `RPTK` auth response (outbound sessions).
pub fn auth_key(radio_id: u32, salt: u32, passphrase: &str) -> Vec<u8> {
    let mut buf = tagged(TAG_RPTK, &radio_id.to_be_bytes());
    buf.extend_from_slice(&auth_hash(salt, passphrase));
    buf
}

/// `RPTPING` keepalive (outbound sessions).
pub fn ping(radio_id: u32) -> Vec<u8> {
    tagged(TAG_RPTPING, &radio_id.to_be_bytes())
}

/// `RPTCL` disconnect (outbound sessions).
pub fn disconnect(radio_id: u32) -> Vec<u8> {
    tagged(TAG_RPTCL, &radio_id.to_be_bytes())
}

/// `RPTO` options subscription (outbound sessions).
pub fn options(radio_id: u32, body: &str) -> Vec<u8> {
    let mut buf = tagged(TAG_RPTO, &radio_id.to_be_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf
}

// ===== Authentication =====

/// `sha256(salt_be32 || passphrase)` as used by the RPTK exchange.
pub fn auth_hash(salt: u32, passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.to_be_bytes());
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// Verify a received RPTK digest against the expected hash.
///
/// Implementations differ on the wire form: some send the 32-byte binary
/// digest, others its 64-byte hex-ASCII spelling. Both are accepted; hex is
/// compared case-insensitively.
pub fn verify_auth(received: &[u8], salt: u32, passphrase: &str) -> bool {
    let expected = auth_hash(salt, passphrase);
    match received.len() {
        32 => received == expected,
        64 => {
            let hex: String = expected.iter().map(|b| format!("{:02x}", b)).collect();
            received.eq_ignore_ascii_case(hex.as_bytes())
        }
        _ => false,
    }
}

/// Build a minimal DMRD frame. Test helper.
#[cfg(test)]
#[allow(clippy::too_many_arguments)]
pub fn make_dmrd(
    seq: u8,
    rf_src: u32,
    dst_id: u32,
    peer_id: u32,
    slot: Slot,
    call_type: CallType,
    frame_type: u8,
    dtype_vseq: u8,
    stream_id: u32,
) -> Vec<u8> {
    let mut buf = vec![0u8; DMRD_MIN_LEN];
    buf[0..4].copy_from_slice(TAG_DMRD);
    buf[4] = seq;
    buf[5..8].copy_from_slice(&rf_src.to_be_bytes()[1..]);
    buf[8..11].copy_from_slice(&dst_id.to_be_bytes()[1..]);
    buf[11..15].copy_from_slice(&peer_id.to_be_bytes());
    let mut bits = 0u8;
    if slot == Slot::Ts2 {
        bits |= 0x80;
    }
    if call_type == CallType::Private {
        bits |= 0x40;
    }
    bits |= (frame_type & 0x03) << 4;
    bits |= dtype_vseq & 0x0F;
    buf[15] = bits;
    buf[16..20].copy_from_slice(&stream_id.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_commands() {
        assert_eq!(identify(b"DMRD....."), Some(Command::Dmrd));
        assert_eq!(identify(b"RPTL\x00\x04\xc3\x64"), Some(Command::Login));
        assert_eq!(identify(b"RPTKxxxx"), Some(Command::AuthKey));
        assert_eq!(identify(b"RPTO\x00\x04\xc3\x64TS1=9"), Some(Command::Options));
        assert_eq!(identify(b"MSTPONG...."), Some(Command::Pong));
        assert_eq!(identify(b"garbage"), None);
        assert_eq!(identify(b""), None);
    }

    #[test]
    fn test_identify_rptc_vs_rptcl() {
        // 5-byte literal wins over the shared 4-byte prefix.
        assert_eq!(identify(b"RPTC\x00\x04\xc3\x64"), Some(Command::Config));
        assert_eq!(identify(b"RPTCL\x00\x04\xc3\x64"), Some(Command::Disconnect));
    }

    #[test]
    fn test_identify_ping_variants() {
        assert_eq!(identify(b"RPTPING\x00\x04\xc3\x64"), Some(Command::Ping));
        assert_eq!(identify(b"RPTP\x00\x00\x00\x00\x04\xc3\x64"), Some(Command::Ping));
    }

    #[test]
    fn test_identify_master_tag_aliases() {
        assert_eq!(identify(b"MSTNAK\x00\x04\xc3\x64"), Some(Command::Nak));
        assert_eq!(identify(b"MSTN\x00\x04\xc3\x64"), Some(Command::Nak));
        assert_eq!(identify(b"MSTCL\x00\x04\xc3\x64"), Some(Command::Closing));
        assert_eq!(identify(b"MSTC\x00\x04\xc3\x64"), Some(Command::Closing));
        assert_eq!(identify(b"RPTACK\x00\x04\xc3\x64"), Some(Command::Ack));
        assert_eq!(identify(b"RPTA\x00\x04\xc3\x64"), Some(Command::Ack));
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(strip_tag(b"RPTACK\xde\xad\xbe\xef"), Some(&b"\xde\xad\xbe\xef"[..]));
        assert_eq!(strip_tag(b"MSTCL\x01\x02\x03\x04"), Some(&b"\x01\x02\x03\x04"[..]));
        assert_eq!(strip_tag(b"RPTA\x01\x02\x03\x04"), Some(&b"\x01\x02\x03\x04"[..]));
        // RPTPING strips the full 7-byte tag, not the RPTP prefix.
        assert_eq!(strip_tag(b"RPTPING\x00\x04\xc3\x24"), Some(&b"\x00\x04\xc3\x24"[..]));
        assert_eq!(strip_tag(b"bogus"), None);
    }

    #[test]
    fn test_dmrd_field_extraction() {
        let frame = make_dmrd(
            42,
            3121234,
            3120,
            312100,
            Slot::Ts2,
            CallType::Group,
            0,
            5,
            0xa1b2c3d4,
        );
        let dmrd = Dmrd::parse(&frame).unwrap();
        assert_eq!(dmrd.seq(), 42);
        assert_eq!(dmrd.rf_src(), 3121234);
        assert_eq!(dmrd.dst_id(), 3120);
        assert_eq!(dmrd.peer_id(), 312100);
        assert_eq!(dmrd.slot(), Slot::Ts2);
        assert_eq!(dmrd.call_type(), CallType::Group);
        assert_eq!(dmrd.frame_type(), 0);
        assert_eq!(dmrd.stream_id(), 0xa1b2c3d4);
        assert!(!dmrd.is_terminator());
    }

    #[test]
    fn test_dmrd_too_short() {
        assert!(Dmrd::parse(&[0u8; 54]).is_err());
        assert!(Dmrd::parse(&[0u8; 55]).is_ok());
    }

    #[test]
    fn test_terminator_detection() {
        // frame_type == 2 && dtype_vseq == 2 is the one and only terminator.
        let term = make_dmrd(0, 1, 9, 1, Slot::Ts1, CallType::Group, 2, 2, 1);
        assert!(Dmrd::parse(&term).unwrap().is_terminator());

        let voice = make_dmrd(0, 1, 9, 1, Slot::Ts1, CallType::Group, 0, 2, 1);
        assert!(!Dmrd::parse(&voice).unwrap().is_terminator());

        let data_sync = make_dmrd(0, 1, 9, 1, Slot::Ts1, CallType::Group, 2, 1, 1);
        assert!(!Dmrd::parse(&data_sync).unwrap().is_terminator());
    }

    #[test]
    fn test_dmrd_private_call_bit() {
        let frame = make_dmrd(0, 1, 3106000, 1, Slot::Ts1, CallType::Private, 1, 0, 1);
        let dmrd = Dmrd::parse(&frame).unwrap();
        assert_eq!(dmrd.call_type(), CallType::Private);
        assert_eq!(dmrd.slot(), Slot::Ts1);
    }

    #[test]
    fn test_rptc_roundtrip() {
        let cfg = RptcData {
            callsign: "WA0EDA".into(),
            rx_freq: "449375000".into(),
            tx_freq: "444375000".into(),
            tx_power: "50".into(),
            colorcode: "1".into(),
            latitude: "38.9822".into(),
            longitude: "-94.6708".into(),
            height: "100".into(),
            location: "Overland Park, KS".into(),
            description: "Test Repeater".into(),
            slots: "2".into(),
            url: "http://example.com".into(),
            software_id: "20240210_PS4".into(),
            package_id: "MMDVM_MMDVM_HS_Hat".into(),
        };
        let frame = cfg.encode(312100);
        assert_eq!(frame.len(), RPTC_LEN);
        assert_eq!(&frame[0..4], TAG_RPTC);
        assert_eq!(peer_id_at(&frame, 4).unwrap(), 312100);

        let decoded = RptcData::decode(&frame).unwrap();
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn test_rptc_trims_nul_padding() {
        let cfg = RptcData {
            callsign: "N0MJS".into(),
            ..Default::default()
        };
        let mut frame = cfg.encode(312100);
        // Repeater firmware often NUL-pads instead of space-padding.
        for b in frame[8..16].iter_mut() {
            if *b == b' ' {
                *b = 0;
            }
        }
        let decoded = RptcData::decode(&frame).unwrap();
        assert_eq!(decoded.callsign, "N0MJS");
    }

    #[test]
    fn test_rptc_too_short() {
        assert!(RptcData::decode(&[0u8; 301]).is_err());
    }

    #[test]
    fn test_parse_options_table() {
        let cases: &[(&str, &[u32], &[u32])] = &[
            ("TS1=1,2,3;TS2=4,5,6", &[1, 2, 3], &[4, 5, 6]),
            ("TS1=1;TS2=4", &[1], &[4]),
            ("TS1=9", &[9], &[]),
            ("TS2=9", &[], &[9]),
            ("TS1=1,2,3", &[1, 2, 3], &[]),
            ("TS1=1,2,3;TS2=", &[1, 2, 3], &[]),
            ("ts1=7", &[7], &[]),
            ("", &[], &[]),
            ("TS1=1,abc,3", &[1, 3], &[]),
        ];
        for (body, ts1, ts2) in cases {
            let req = parse_options(body);
            assert_eq!(
                req.ts1,
                ts1.iter().copied().collect(),
                "TS1 mismatch for {:?}",
                body
            );
            assert_eq!(
                req.ts2,
                ts2.iter().copied().collect(),
                "TS2 mismatch for {:?}",
                body
            );
        }
    }

    #[test]
    fn test_response_builders() {
        assert_eq!(ack(312100), b"RPTACK\x00\x04\xc3\x24".to_vec());
        assert_eq!(nak(312100), b"MSTNAK\x00\x04\xc3\x24".to_vec());
        assert_eq!(pong(312100), b"MSTPONG\x00\x04\xc3\x24".to_vec());
        assert_eq!(ack_with_salt(0xdeadbeef), b"RPTACK\xde\xad\xbe\xef".to_vec());
        assert_eq!(login(312100).len(), 8);
        assert_eq!(ping(312100).len(), 11);
        assert_eq!(disconnect(312100).len(), 9);
    }

    #[test]
    fn test_auth_hash_binary_and_hex() {
        let salt = 0x01020304u32;
        let digest = auth_hash(salt, "s3cret");

        assert!(verify_auth(&digest, salt, "s3cret"));
        assert!(!verify_auth(&digest, salt, "wrong"));
        assert!(!verify_auth(&digest, salt.wrapping_add(1), "s3cret"));

        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        assert!(verify_auth(hex.as_bytes(), salt, "s3cret"));
        assert!(verify_auth(hex.to_uppercase().as_bytes(), salt, "s3cret"));

        // Anything that is neither 32 nor 64 bytes fails outright.
        assert!(!verify_auth(&digest[..16], salt, "s3cret"));
    }

    #[test]
    fn test_auth_key_builder_matches_verify() {
        let frame = auth_key(312100, 0xcafebabe, "s3cret");
        assert_eq!(frame.len(), 40);
        assert_eq!(&frame[0..4], TAG_RPTK);
        assert_eq!(peer_id_at(&frame, 4).unwrap(), 312100);
        assert!(verify_auth(&frame[8..], 0xcafebabe, "s3cret"));
    }
}
