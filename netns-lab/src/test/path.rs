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

use std::net::Ipv4Addr;

use maplit::btreemap;
use pretty_assertions::assert_eq;
use tsim_topology::{facts::RouterFacts, Topology};

use super::{iface, linear_topology, route};
use crate::tester::path::{compute_path, waypoint_routers, PathError};

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[test]
fn linear_path() {
    let topo = linear_topology();
    let hops = compute_path(&topo, "r1", ip("10.1.1.1"), ip("10.1.3.2")).unwrap();

    assert_eq!(waypoint_routers(&hops), vec!["r1", "r2", "r3"]);
    assert_eq!(hops[0].out_iface.as_deref(), Some("ethB"));
    assert_eq!(hops[0].via, Some(ip("10.1.2.2")));
    // r2 delivers directly into the connected subnet
    assert_eq!(hops[1].via, None);
    assert_eq!(hops[1].out_iface.as_deref(), Some("ethB"));
    // the destination router terminates the path
    assert_eq!(hops[2].out_iface, None);
}

#[test]
fn path_to_access_host_ends_at_fronting_router() {
    let topo = linear_topology();
    // 10.1.1.100 is a host address in the access subnet behind r1
    let hops = compute_path(&topo, "r3", ip("10.1.3.2"), ip("10.1.1.100")).unwrap();
    assert_eq!(waypoint_routers(&hops), vec!["r3", "r2", "r1"]);
    let last = hops.last().unwrap();
    assert_eq!(last.router, "r1");
    assert_eq!(last.out_iface.as_deref(), Some("ethA"));
    assert_eq!(last.via, None);
}

#[test]
fn blackhole() {
    let topo = linear_topology();
    // r1 has no default route
    match compute_path(&topo, "r1", ip("10.1.1.1"), ip("8.8.8.8")) {
        Err(PathError::Blackhole { router, dst }) => {
            assert_eq!(router, "r1");
            assert_eq!(dst, ip("8.8.8.8"));
        }
        other => panic!("expected blackhole, got {other:?}"),
    }
}

#[test]
fn forwarding_loop_detected() {
    // two routers pointing their default routes at each other
    let a = RouterFacts {
        hostname: "a".to_string(),
        interfaces: vec![iface("eth0", &[("10.0.0.1", 24)])],
        routes: vec![
            route("10.0.0.0/24", None, "eth0", "kernel"),
            route("default", Some("10.0.0.2"), "eth0", "static"),
        ],
        ..Default::default()
    };
    let b = RouterFacts {
        hostname: "b".to_string(),
        interfaces: vec![iface("eth0", &[("10.0.0.2", 24)])],
        routes: vec![
            route("10.0.0.0/24", None, "eth0", "kernel"),
            route("default", Some("10.0.0.1"), "eth0", "static"),
        ],
        ..Default::default()
    };
    let routers = btreemap! { "a".to_string() => a, "b".to_string() => b };
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);

    match compute_path(&topo, "a", ip("10.0.0.1"), ip("8.8.8.8")) {
        Err(PathError::Loop { router, iface }) => {
            assert_eq!(router, "a");
            assert_eq!(iface, "eth0");
        }
        other => panic!("expected loop, got {other:?}"),
    }
}

#[test]
fn kinds() {
    let loop_err = PathError::Loop {
        router: "a".to_string(),
        iface: "eth0".to_string(),
    };
    let bh_err = PathError::Blackhole {
        router: "a".to_string(),
        dst: ip("8.8.8.8"),
    };
    assert_eq!(loop_err.kind(), "PathLoop");
    assert_eq!(bh_err.kind(), "PathBlackhole");
}

#[test]
fn destination_on_start_router() {
    let topo = linear_topology();
    let hops = compute_path(&topo, "r2", ip("10.1.2.2"), ip("10.1.2.2")).unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(hops[0].router, "r2");
    assert_eq!(hops[0].out_iface, None);
}
