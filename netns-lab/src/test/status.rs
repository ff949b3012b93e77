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
use serde_json::json;

use crate::status::{pattern_match, NamespaceStatus, StatusFunction, StatusReport};

#[test]
fn patterns() {
    assert!(pattern_match("*", "anything"));
    assert!(pattern_match("r1", "r1"));
    assert!(!pattern_match("r1", "r10"));
    assert!(pattern_match("r*", "r10"));
    assert!(pattern_match("*-lab", "hq-lab"));
    assert!(!pattern_match("*-lab", "hq-lab-2"));
    assert!(pattern_match("br-*-24", "br-10.5.0.0-24"));
    assert!(!pattern_match("host*", "r1"));
}

#[test]
fn function_names_roundtrip() {
    for function in [
        StatusFunction::Interfaces,
        StatusFunction::Routes,
        StatusFunction::Rules,
        StatusFunction::Iptables,
        StatusFunction::Ipsets,
        StatusFunction::Summary,
        StatusFunction::All,
    ] {
        assert_eq!(
            function.as_str().parse::<StatusFunction>().unwrap(),
            function
        );
    }
    assert!("bogus".parse::<StatusFunction>().is_err());
}

#[test]
fn summary_lines() {
    let mut report = StatusReport::default();
    report.namespaces.insert(
        "r1".to_string(),
        NamespaceStatus {
            namespace: "r1".to_string(),
            interfaces: Some(json!([{"ifname": "ethA"}, {"ifname": "ethB"}])),
            routes: Some(json!([{"dst": "default"}])),
            rules: Some(json!([])),
            ..Default::default()
        },
    );
    report
        .failures
        .insert("r2".to_string(), "timeout".to_string());

    let summary = report.summary();
    assert_eq!(
        summary,
        "r1: 2 interfaces, 1 routes, 0 rules\nr2: FAILED (timeout)\n"
    );
}

#[test]
fn json_output_is_deterministic() {
    let mut report = StatusReport::default();
    for ns in ["b", "a", "c"] {
        report.namespaces.insert(
            ns.to_string(),
            NamespaceStatus {
                namespace: ns.to_string(),
                ..Default::default()
            },
        );
    }
    let a = report.to_json(2);
    let b = report.to_json(2);
    assert_eq!(a, b);
    // BTreeMap ordering puts `a` first
    assert!(a.find("\"a\"").unwrap() < a.find("\"b\"").unwrap());
}
