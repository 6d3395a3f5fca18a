// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Access control: blacklist checks and pattern-based configuration matching.
//!
//! A rule matches on any combination of explicit radio IDs, inclusive ID
//! ranges, and callsign globs (OR across kinds). Rules are evaluated in
//! specificity order: specific IDs first, then ranges, then callsign
//! patterns, then the default configuration. The blacklist is checked before
//! anything else and wins unconditionally.

use crate::config::{BlacklistRuleConfig, PatternRuleConfig, PeerConfig, RuleMatch};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use thiserror::Error;

/// Pattern validation errors. Surfaced at config load with the rule name.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("rule '{rule}' has no match criteria (need ids, id_ranges, or callsigns)")]
    Empty { rule: String },

    #[error("rule '{rule}' has invalid range: start ({start}) > end ({end})")]
    InvalidRange { rule: String, start: u32, end: u32 },

    #[error("rule '{rule}' has invalid callsign pattern '{pattern}': only [A-Za-z0-9*] allowed")]
    InvalidCallsign { rule: String, pattern: String },
}

/// Relative specificity of a rule, from its most specific present kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
    SpecificId = 0,
    IdRange = 1,
    Callsign = 2,
}

/// A compiled match rule: validated, globs translated to anchored regexes.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub description: String,
    ids: HashSet<u32>,
    ranges: Vec<(u32, u32)>,
    globs: Vec<(String, Regex)>,
}

impl CompiledRule {
    fn compile(name: &str, description: &str, m: &RuleMatch) -> Result<Self, PatternError> {
        if m.ids.is_empty() && m.id_ranges.is_empty() && m.callsigns.is_empty() {
            return Err(PatternError::Empty { rule: name.into() });
        }
        for &(start, end) in &m.id_ranges {
            if start > end {
                return Err(PatternError::InvalidRange {
                    rule: name.into(),
                    start,
                    end,
                });
            }
        }
        let mut globs = Vec::with_capacity(m.callsigns.len());
        for pattern in &m.callsigns {
            if pattern.is_empty() || !pattern.chars().all(|c| c.is_ascii_alphanumeric() || c == '*')
            {
                return Err(PatternError::InvalidCallsign {
                    rule: name.into(),
                    pattern: pattern.clone(),
                });
            }
            // `*` is the only metacharacter; everything else is literal.
            let regex_src = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
            let regex = RegexBuilder::new(&regex_src)
                .case_insensitive(true)
                .build()
                .map_err(|_| PatternError::InvalidCallsign {
                    rule: name.into(),
                    pattern: pattern.clone(),
                })?;
            globs.push((pattern.clone(), regex));
        }
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            ids: m.ids.iter().copied().collect(),
            ranges: m.id_ranges.clone(),
            globs,
        })
    }

    fn specificity(&self) -> Specificity {
        if !self.ids.is_empty() {
            Specificity::SpecificId
        } else if !self.ranges.is_empty() {
            Specificity::IdRange
        } else {
            Specificity::Callsign
        }
    }

    /// Match against a peer, returning a human-readable reason on success.
    ///
    /// Kinds are ORed: the first kind that matches decides the reason.
    /// Callsign kinds can only match when a callsign is known.
    pub fn matches(&self, radio_id: u32, callsign: Option<&str>) -> Option<String> {
        if self.ids.contains(&radio_id) {
            return Some(format!("specific_id: {}", radio_id));
        }
        for &(start, end) in &self.ranges {
            if (start..=end).contains(&radio_id) {
                return Some(format!("id_range: {}-{}", start, end));
            }
        }
        if let Some(callsign) = callsign {
            for (pattern, regex) in &self.globs {
                if regex.is_match(callsign) {
                    return Some(format!("callsign: {}", pattern));
                }
            }
        }
        None
    }
}

/// A blacklist entry: compiled rule plus the rejection reason.
#[derive(Debug, Clone)]
struct BlacklistEntry {
    rule: CompiledRule,
    reason: String,
}

/// A configuration pattern: compiled rule plus the config it selects.
#[derive(Debug, Clone)]
struct PatternEntry {
    rule: CompiledRule,
    config: PeerConfig,
}

/// Result of an access query.
#[derive(Debug)]
pub enum AccessDecision<'a> {
    /// Peer is blocked; reply MSTNAK and never create a session.
    Blacklisted { rule: &'a str, reason: &'a str },
    /// Peer is admitted under this configuration.
    Matched {
        config: &'a PeerConfig,
        /// Matched rule, `None` for the default fallthrough.
        pattern: Option<&'a CompiledRule>,
        /// Human-readable match reason for events and logs.
        reason: String,
    },
}

/// Deterministic, priority-ordered access policy.
#[derive(Debug)]
pub struct AccessPolicy {
    blacklist: Vec<BlacklistEntry>,
    patterns: Vec<PatternEntry>,
    default: PeerConfig,
}

impl AccessPolicy {
    /// Compile and validate the configured rules.
    ///
    /// Patterns are stable-sorted by specificity once, at load time, so
    /// queries are a single first-match scan.
    pub fn compile(
        blacklist: &[BlacklistRuleConfig],
        patterns: &[PatternRuleConfig],
        default: PeerConfig,
    ) -> Result<Self, PatternError> {
        let blacklist = blacklist
            .iter()
            .map(|rule| {
                Ok(BlacklistEntry {
                    rule: CompiledRule::compile(&rule.name, &rule.description, &rule.r#match)?,
                    reason: rule.reason.clone(),
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let mut patterns = patterns
            .iter()
            .map(|rule| {
                Ok(PatternEntry {
                    rule: CompiledRule::compile(&rule.name, &rule.description, &rule.r#match)?,
                    config: rule.config.clone(),
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;
        patterns.sort_by_key(|entry| entry.rule.specificity());

        Ok(Self {
            blacklist,
            patterns,
            default,
        })
    }

    /// Select the configuration for a connecting peer.
    ///
    /// Blacklist first; then patterns in specificity order, first match
    /// wins; then the default configuration.
    pub fn select(&self, radio_id: u32, callsign: Option<&str>) -> AccessDecision<'_> {
        for entry in &self.blacklist {
            if entry.rule.matches(radio_id, callsign).is_some() {
                return AccessDecision::Blacklisted {
                    rule: &entry.rule.name,
                    reason: &entry.reason,
                };
            }
        }
        for entry in &self.patterns {
            if let Some(reason) = entry.rule.matches(radio_id, callsign) {
                return AccessDecision::Matched {
                    config: &entry.config,
                    pattern: Some(&entry.rule),
                    reason,
                };
            }
        }
        AccessDecision::Matched {
            config: &self.default,
            pattern: None,
            reason: "default".into(),
        }
    }

    /// The passphrase a peer must authenticate with.
    ///
    /// Used at login time, before the callsign is known.
    pub fn passphrase_for(&self, radio_id: u32) -> Option<&str> {
        match self.select(radio_id, None) {
            AccessDecision::Blacklisted { .. } => None,
            AccessDecision::Matched { config, .. } => Some(&config.passphrase),
        }
    }
}
