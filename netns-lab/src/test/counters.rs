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

use pretty_assertions::assert_eq;

use crate::tester::{
    counters::{classify_waypoint, diff, parse_snapshot},
    Decision,
};

const BEFORE: &str = "\
# Generated by iptables-save\n\
*filter\n\
:INPUT ACCEPT [100:8000]\n\
:FORWARD ACCEPT [50:4000]\n\
:OUTPUT ACCEPT [70:5600]\n\
[10:800] -A FORWARD -p tcp --dport 80 -j DROP\n\
[40:3200] -A FORWARD -s 10.0.0.0/8 -j ACCEPT\n\
COMMIT\n";

#[test]
fn parse_counters() {
    let snapshot = parse_snapshot(BEFORE);
    assert_eq!(snapshot.entries.len(), 5);

    let policy = &snapshot.entries[0];
    assert!(policy.is_policy);
    assert_eq!(policy.chain, "INPUT");
    assert_eq!(policy.packets, 100);
    assert_eq!(policy.target.as_deref(), Some("ACCEPT"));

    let rule = &snapshot.entries[3];
    assert!(!rule.is_policy);
    assert_eq!(rule.chain, "FORWARD");
    assert_eq!(rule.index, 1);
    assert_eq!(rule.rule, "FORWARD -p tcp --dport 80 -j DROP");
    assert_eq!(rule.target.as_deref(), Some("DROP"));
    assert_eq!(rule.packets, 10);
    assert_eq!(rule.bytes, 800);
}

#[test]
fn diff_finds_advanced_counters() {
    let after = BEFORE.replace("[10:800]", "[11:860]");
    let deltas = diff(&parse_snapshot(BEFORE), &parse_snapshot(&after));
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].packet_delta, 1);
    assert_eq!(deltas[0].byte_delta, 60);
    assert_eq!(deltas[0].target.as_deref(), Some("DROP"));
}

#[test]
fn classify_drop_rule() {
    let after = BEFORE.replace("[10:800]", "[11:860]");
    let deltas = diff(&parse_snapshot(BEFORE), &parse_snapshot(&after));
    let result = classify_waypoint("r2", &deltas, &["PREROUTING", "FORWARD", "POSTROUTING"]);
    assert_eq!(result.decision, Decision::Drop);
    assert_eq!(result.chain, "FORWARD");
    assert_eq!(result.packet_delta, 1);
    assert_eq!(
        result.rule_id.as_deref(),
        Some("FORWARD -p tcp --dport 80 -j DROP")
    );
}

#[test]
fn classify_accept_rule() {
    let after = BEFORE.replace("[40:3200]", "[41:3260]");
    let deltas = diff(&parse_snapshot(BEFORE), &parse_snapshot(&after));
    let result = classify_waypoint("r2", &deltas, &["PREROUTING", "FORWARD", "POSTROUTING"]);
    assert_eq!(result.decision, Decision::Accept);
}

#[test]
fn drop_wins_over_accept() {
    let after = BEFORE
        .replace("[10:800]", "[11:860]")
        .replace("[40:3200]", "[41:3260]");
    let deltas = diff(&parse_snapshot(BEFORE), &parse_snapshot(&after));
    let result = classify_waypoint("r2", &deltas, &["PREROUTING", "FORWARD", "POSTROUTING"]);
    assert_eq!(result.decision, Decision::Drop);
}

#[test]
fn classify_policy_fallback() {
    let before = "*filter\n:INPUT DROP [5:400]\nCOMMIT\n";
    let after = "*filter\n:INPUT DROP [6:460]\nCOMMIT\n";
    let deltas = diff(&parse_snapshot(before), &parse_snapshot(after));
    let result = classify_waypoint("r3", &deltas, &["PREROUTING", "INPUT"]);
    assert_eq!(result.decision, Decision::Drop);
    assert_eq!(result.rule_id, None);
    assert_eq!(result.chain, "INPUT");
}

#[test]
fn classify_no_advance_is_unknown() {
    let deltas = diff(&parse_snapshot(BEFORE), &parse_snapshot(BEFORE));
    assert!(deltas.is_empty());
    let result = classify_waypoint("r2", &deltas, &["PREROUTING", "FORWARD", "POSTROUTING"]);
    assert_eq!(result.decision, Decision::Unknown);
    assert_eq!(result.packet_delta, 0);
}

#[test]
fn deltas_outside_relevant_chains_are_ignored() {
    // the probe also bumps OUTPUT on the sampled router, which a transit waypoint ignores
    let before = "*filter\n:OUTPUT ACCEPT [5:400]\n[1:60] -A OUTPUT -j ACCEPT\nCOMMIT\n";
    let after = "*filter\n:OUTPUT ACCEPT [6:460]\n[2:120] -A OUTPUT -j ACCEPT\nCOMMIT\n";
    let deltas = diff(&parse_snapshot(before), &parse_snapshot(after));
    assert!(!deltas.is_empty());
    let result = classify_waypoint("r2", &deltas, &["PREROUTING", "FORWARD", "POSTROUTING"]);
    assert_eq!(result.decision, Decision::Unknown);
}
