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

mod cache;
mod counters;
mod path;
mod plan;
mod status;

use std::net::Ipv4Addr;

use maplit::btreemap;
use tsim_topology::{
    facts::{IfaceAddress, Interface, Route, RouterFacts},
    Topology,
};

pub(crate) fn iface(name: &str, addrs: &[(&str, u8)]) -> Interface {
    Interface {
        name: name.to_string(),
        link_type: Some("ether".to_string()),
        mtu: Some(1500),
        addresses: addrs
            .iter()
            .map(|(a, p)| IfaceAddress::v4(a.parse().unwrap(), *p))
            .collect(),
        ..Default::default()
    }
}

pub(crate) fn route(dst: &str, gateway: Option<&str>, dev: &str, proto: &str) -> Route {
    Route {
        table: "main".to_string(),
        dst: dst.parse().unwrap(),
        gateway: gateway.map(|g| g.parse::<Ipv4Addr>().unwrap()),
        dev: dev.to_string(),
        protocol: Some(proto.to_string()),
        scope: if gateway.is_none() { Some("link".to_string()) } else { None },
        prefsrc: None,
        metric: None,
    }
}

/// The three-router linear topology used throughout the tests:
/// an access net 10.1.1.0/24 on r1, and two transit nets chaining r1 - r2 - r3.
pub(crate) fn linear_topology() -> Topology {
    let r1 = RouterFacts {
        hostname: "r1".to_string(),
        interfaces: vec![
            iface("ethA", &[("10.1.1.1", 24)]),
            iface("ethB", &[("10.1.2.1", 24)]),
        ],
        routes: vec![
            route("10.1.1.0/24", None, "ethA", "kernel"),
            route("10.1.2.0/24", None, "ethB", "kernel"),
            route("10.1.3.0/24", Some("10.1.2.2"), "ethB", "static"),
        ],
        ..Default::default()
    };
    let r2 = RouterFacts {
        hostname: "r2".to_string(),
        interfaces: vec![
            iface("ethA", &[("10.1.2.2", 24)]),
            iface("ethB", &[("10.1.3.1", 24)]),
        ],
        routes: vec![
            route("10.1.2.0/24", None, "ethA", "kernel"),
            route("10.1.3.0/24", None, "ethB", "kernel"),
            route("10.1.1.0/24", Some("10.1.2.1"), "ethA", "static"),
        ],
        ..Default::default()
    };
    let r3 = RouterFacts {
        hostname: "r3".to_string(),
        interfaces: vec![iface("ethA", &[("10.1.3.2", 24)])],
        routes: vec![
            route("10.1.3.0/24", None, "ethA", "kernel"),
            route("default", Some("10.1.3.1"), "ethA", "static"),
        ],
        ..Default::default()
    };

    let routers = btreemap! {
        "r1".to_string() => r1,
        "r2".to_string() => r2,
        "r3".to_string() => r3,
    };
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    topo
}
