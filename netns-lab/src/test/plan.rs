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

use std::collections::BTreeMap;

use maplit::btreemap;
use pretty_assertions::assert_eq;
use tsim_topology::{
    facts::{IptablesDump, PolicyRule, Route, RouterFacts},
    Topology,
};

use super::{iface, linear_topology, route};
use crate::setup::plan_setup;

#[test]
fn linear_plan() {
    let topo = linear_topology();
    let plan = plan_setup(&topo);

    assert_eq!(plan.namespaces, vec!["r1", "r2", "r3"]);
    assert_eq!(plan.links.len(), 2);
    assert!(plan.bridges.is_empty());
    assert!(plan.warnings.is_empty());

    // the access subnet on r1 becomes an in-namespace bridge
    let r1 = &plan.routers["r1"];
    assert_eq!(r1.access_bridges.len(), 1);
    assert_eq!(r1.access_bridges[0].1, "ethA");

    // both addresses of r1 are assigned, each on its generated device
    assert_eq!(r1.addresses.len(), 2);
    let access_device = &r1.access_bridges[0].0;
    assert!(r1
        .addresses
        .iter()
        .any(|(dev, net)| dev == access_device && *net == "10.1.1.1/24".parse().unwrap()));

    // the static route is planned with the translated device of ethB
    assert_eq!(r1.routes.len(), 1);
    let link = plan
        .links
        .iter()
        .find(|l| l.a.router == "r1" || l.b.router == "r1")
        .unwrap();
    let r1_link_device = if link.a.router == "r1" { &link.a.device } else { &link.b.device };
    assert_eq!(&r1.routes[0].device, r1_link_device);
    assert_eq!(r1.routes[0].dst, "10.1.3.0/24");
    assert_eq!(r1.routes[0].via, Some("10.1.2.2".parse().unwrap()));
    assert_eq!(r1.routes[0].table, None);

    // r3 has a default route
    assert_eq!(plan.routers["r3"].routes[0].dst, "default");

    // no firewall content declared, nothing to restore
    assert!(r1.iptables_restore.is_none());
    assert!(r1.ipset_restore.is_none());

    // every generated device translates back to a declared interface
    for link in &plan.links {
        assert_eq!(
            plan.names.translate(&link.a.router, &link.a.device),
            Some(link.a.iface.as_str())
        );
    }
}

#[test]
fn default_rules_are_not_planned() {
    let mut topo_routers = BTreeMap::new();
    topo_routers.insert(
        "r".to_string(),
        RouterFacts {
            hostname: "r".to_string(),
            interfaces: vec![iface("eth0", &[("10.0.0.1", 24)])],
            rules: vec![
                PolicyRule {
                    priority: 0,
                    from: "all".parse().unwrap(),
                    table: "local".to_string(),
                },
                PolicyRule {
                    priority: 100,
                    from: "192.168.0.0/16".parse().unwrap(),
                    table: "vpn".to_string(),
                },
                PolicyRule {
                    priority: 32766,
                    from: "all".parse().unwrap(),
                    table: "main".to_string(),
                },
            ],
            ..Default::default()
        },
    );
    let mut warnings = Vec::new();
    let topo = Topology::new(topo_routers, &mut warnings);
    let plan = plan_setup(&topo);

    let r = &plan.routers["r"];
    assert_eq!(r.rules.len(), 1);
    assert_eq!(r.rules[0].priority, 100);
    // the named table got a numeric id
    assert_eq!(r.table_ids.get("vpn"), Some(&100));
}

#[test]
fn routes_ordered_by_table_and_metric() {
    let mut routers = BTreeMap::new();
    routers.insert(
        "r".to_string(),
        RouterFacts {
            hostname: "r".to_string(),
            interfaces: vec![iface("eth0", &[("10.0.0.1", 24)])],
            routes: vec![
                Route {
                    metric: Some(200),
                    ..route("10.2.0.0/16", Some("10.0.0.2"), "eth0", "static")
                },
                Route {
                    metric: Some(100),
                    ..route("10.2.0.0/16", Some("10.0.0.3"), "eth0", "static")
                },
                route("10.0.0.0/24", None, "eth0", "kernel"),
            ],
            ..Default::default()
        },
    );
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);
    let plan = plan_setup(&topo);

    let r = &plan.routers["r"];
    // kernel routes are not installed; lower metric comes first
    assert_eq!(r.routes.len(), 2);
    assert_eq!(r.routes[0].metric, Some(100));
    assert_eq!(r.routes[1].metric, Some(200));
}

#[test]
fn unknown_route_device_is_a_warning() {
    let mut routers = BTreeMap::new();
    routers.insert(
        "r".to_string(),
        RouterFacts {
            hostname: "r".to_string(),
            interfaces: vec![iface("eth0", &[("10.0.0.1", 24)])],
            routes: vec![route("10.9.0.0/16", Some("10.0.0.9"), "missing0", "static")],
            ..Default::default()
        },
    );
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);
    let plan = plan_setup(&topo);

    assert!(plan.routers["r"].routes.is_empty());
    assert_eq!(plan.warnings.len(), 1);
    assert!(plan.warnings[0].contains("missing0"));
}

#[test]
fn firewall_payloads_are_rendered() {
    let mut routers = BTreeMap::new();
    routers.insert(
        "fw".to_string(),
        RouterFacts {
            hostname: "fw".to_string(),
            interfaces: vec![iface("eth0", &[("10.0.0.1", 24)])],
            iptables: IptablesDump::parse(
                "*filter\n:FORWARD DROP [0:0]\n-A FORWARD -p tcp --dport 80 -j DROP\nCOMMIT\n",
            ),
            ipsets: vec![tsim_topology::facts::IpsetDef {
                name: "mgmt".to_string(),
                set_type: "hash:ip".parse().unwrap(),
                create_options: "family inet".to_string(),
                members: vec!["10.0.0.9".to_string()],
            }],
            ..Default::default()
        },
    );
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);
    let plan = plan_setup(&topo);

    let fw = &plan.routers["fw"];
    let iptables = fw.iptables_restore.as_ref().unwrap();
    assert!(iptables.contains("-A FORWARD -p tcp --dport 80 -j DROP"));
    assert!(iptables.contains(":FORWARD DROP [0:0]"));
    let ipsets = fw.ipset_restore.as_ref().unwrap();
    assert!(ipsets.contains("create mgmt hash:ip family inet"));
    assert!(ipsets.contains("add mgmt 10.0.0.9"));
}

#[test]
fn bridged_subnet_gets_a_namespace() {
    let mk = |name: &str, addr: &str| RouterFacts {
        hostname: name.to_string(),
        interfaces: vec![iface("eth0", &[(addr, 24)])],
        ..Default::default()
    };
    let routers = btreemap! {
        "a".to_string() => mk("a", "10.5.0.1"),
        "b".to_string() => mk("b", "10.5.0.2"),
        "c".to_string() => mk("c", "10.5.0.3"),
    };
    let mut warnings = Vec::new();
    let topo = Topology::new(routers, &mut warnings);
    let plan = plan_setup(&topo);

    assert_eq!(plan.bridges.len(), 1);
    let bridge = &plan.bridges[0];
    assert_eq!(bridge.namespace, "br-10.5.0.0-24");
    assert_eq!(bridge.ports.len(), 3);
    // each router's address lands on its attachment device
    for port in &bridge.ports {
        assert!(plan.routers[&port.router]
            .addresses
            .iter()
            .any(|(dev, _)| dev == &port.router_side));
    }
}
