// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! hbmaster - a master server for the HomeBrew DMR protocol.
//!
//! Accepts authenticated repeater/hotspot/network sessions over UDP,
//! polices access with a priority-ordered pattern matcher, and relays
//! voice streams between peers subject to per-timeslot talkgroup policy,
//! hang-time anti-hijack rules, and one-shot routing-set computation.
//!
//! Modules:
//! - [`protocol`]: HBP frame codec
//! - [`access`]: blacklist and pattern-based access control
//! - [`config`]: JSON configuration
//! - [`server`]: the run loop, peer sessions, stream engine, outbound client
//! - [`user_cache`]: private-call routing cache
//! - [`events`]: length-framed JSON event egress
//! - [`counters`]: restart-safe daily counters

pub mod access;
pub mod config;
pub mod counters;
pub mod events;
pub mod protocol;
pub mod server;
pub mod user_cache;

pub use config::Config;
pub use server::{Server, ServerError};
