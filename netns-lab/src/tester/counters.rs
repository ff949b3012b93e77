// Tsim: Network Namespace Reachability Simulator written in Rust
// Copyright (C) 2023-2024 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Parsing and diffing of `iptables-save -c` snapshots.
//!
//! A snapshot carries a packet/byte counter for every chain policy and every rule. The tester
//! samples a snapshot before and after each probe; whichever counter advanced attributes the
//! routing decision. Since runs are serialized host-wide and services are probed sequentially,
//! a delta always belongs to exactly one probe.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Decision;
use crate::tester::WaypointResult;

/// One counted entry of a snapshot: either a rule or a chain policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCounter {
    /// Table the entry lives in (`filter`, `nat`, ...).
    pub table: String,
    /// Chain name.
    pub chain: String,
    /// Rule position within the chain; policies use index 0.
    pub index: usize,
    /// Verbatim rule text (without counters), or the policy name for policy entries.
    pub rule: String,
    /// Jump target (`ACCEPT`, `DROP`, user chain, ...), if any.
    pub target: Option<String>,
    /// Whether this entry is a chain policy rather than a rule.
    pub is_policy: bool,
    /// Packet counter.
    pub packets: u64,
    /// Byte counter.
    pub bytes: u64,
}

/// A parsed `iptables-save -c` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// All counted entries, in dump order.
    pub entries: Vec<RuleCounter>,
}

/// The counter advance of a single entry between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDelta {
    /// Table the entry lives in.
    pub table: String,
    /// Chain name.
    pub chain: String,
    /// Rule text or policy name.
    pub rule: String,
    /// Jump target, if any.
    pub target: Option<String>,
    /// Whether the entry is a chain policy.
    pub is_policy: bool,
    /// Packets counted between the snapshots.
    pub packet_delta: u64,
    /// Bytes counted between the snapshots.
    pub byte_delta: u64,
}

/// Parse the output of `iptables-save -c`.
pub fn parse_snapshot(save: &str) -> CounterSnapshot {
    lazy_static! {
        static ref POLICY_RE: Regex =
            Regex::new(r"^:(\S+)\s+(\S+)\s+\[(\d+):(\d+)\]").unwrap();
        static ref RULE_RE: Regex = Regex::new(r"^\[(\d+):(\d+)\]\s+-A\s+(\S+)\s+(.*)$").unwrap();
        static ref TARGET_RE: Regex = Regex::new(r"(?:-j|-g)\s+(\S+)").unwrap();
    }

    let mut entries = Vec::new();
    let mut table = String::new();
    let mut index_in_chain: std::collections::HashMap<String, usize> = Default::default();

    for line in save.lines() {
        let line = line.trim_end();
        if let Some(name) = line.strip_prefix('*') {
            table = name.to_string();
            index_in_chain.clear();
        } else if let Some(cap) = POLICY_RE.captures(line) {
            let policy = cap[2].to_string();
            entries.push(RuleCounter {
                table: table.clone(),
                chain: cap[1].to_string(),
                index: 0,
                rule: policy.clone(),
                target: (policy != "-").then_some(policy),
                is_policy: true,
                packets: cap[3].parse().unwrap_or(0),
                bytes: cap[4].parse().unwrap_or(0),
            });
        } else if let Some(cap) = RULE_RE.captures(line) {
            let chain = cap[3].to_string();
            let rule = format!("{} {}", chain, &cap[4]);
            let index = index_in_chain
                .entry(format!("{table}:{chain}"))
                .and_modify(|i| *i += 1)
                .or_insert(1);
            entries.push(RuleCounter {
                table: table.clone(),
                chain,
                index: *index,
                target: TARGET_RE.captures(&rule).map(|c| c[1].to_string()),
                rule,
                is_policy: false,
                packets: cap[1].parse().unwrap_or(0),
                bytes: cap[2].parse().unwrap_or(0),
            });
        }
    }
    CounterSnapshot { entries }
}

/// Compute all entries whose packet counter advanced between two snapshots. Entries are matched
/// by (table, chain, index, rule text); rules that changed in between are skipped.
pub fn diff(before: &CounterSnapshot, after: &CounterSnapshot) -> Vec<RuleDelta> {
    let mut deltas = Vec::new();
    for entry in &after.entries {
        let Some(prev) = before.entries.iter().find(|e| {
            e.table == entry.table
                && e.chain == entry.chain
                && e.index == entry.index
                && e.rule == entry.rule
        }) else {
            continue;
        };
        let packet_delta = entry.packets.saturating_sub(prev.packets);
        if packet_delta == 0 {
            continue;
        }
        deltas.push(RuleDelta {
            table: entry.table.clone(),
            chain: entry.chain.clone(),
            rule: entry.rule.clone(),
            target: entry.target.clone(),
            is_policy: entry.is_policy,
            packet_delta,
            byte_delta: entry.bytes.saturating_sub(prev.bytes),
        });
    }
    deltas
}

/// Map a jump target to a decision.
pub fn decision_of(target: &str) -> Decision {
    match target {
        "ACCEPT" => Decision::Accept,
        "DROP" => Decision::Drop,
        "REJECT" => Decision::Reject,
        _ => Decision::Unknown,
    }
}

/// Classify the decision a router made for a probe, from the counter advances on the chains the
/// packet traverses at that router.
///
/// A DROP or REJECT counter that advanced wins over everything else; otherwise an advanced
/// ACCEPT rule, then an advanced chain policy, decide. With no advance at all the decision is
/// [`Decision::Unknown`].
pub fn classify_waypoint(router: &str, deltas: &[RuleDelta], chains: &[&str]) -> WaypointResult {
    let relevant = |d: &&RuleDelta| chains.contains(&d.chain.as_str());

    // blocking verdicts take precedence
    if let Some(delta) = deltas.iter().filter(relevant).find(|d| {
        matches!(
            d.target.as_deref(),
            Some("DROP") | Some("REJECT")
        ) && !d.is_policy
    }) {
        return WaypointResult {
            router: router.to_string(),
            chain: delta.chain.clone(),
            rule_id: Some(delta.rule.clone()),
            packet_delta: delta.packet_delta,
            byte_delta: delta.byte_delta,
            decision: decision_of(delta.target.as_deref().unwrap_or_default()),
        };
    }
    if let Some(delta) = deltas
        .iter()
        .filter(relevant)
        .find(|d| d.target.as_deref() == Some("ACCEPT") && !d.is_policy)
    {
        return WaypointResult {
            router: router.to_string(),
            chain: delta.chain.clone(),
            rule_id: Some(delta.rule.clone()),
            packet_delta: delta.packet_delta,
            byte_delta: delta.byte_delta,
            decision: Decision::Accept,
        };
    }
    if let Some(delta) = deltas.iter().filter(relevant).find(|d| d.is_policy) {
        return WaypointResult {
            router: router.to_string(),
            chain: delta.chain.clone(),
            rule_id: None,
            packet_delta: delta.packet_delta,
            byte_delta: delta.byte_delta,
            decision: decision_of(delta.rule.as_str()),
        };
    }
    WaypointResult {
        router: router.to_string(),
        chain: chains.first().copied().unwrap_or("FORWARD").to_string(),
        rule_id: None,
        packet_delta: 0,
        byte_delta: 0,
        decision: Decision::Unknown,
    }
}
