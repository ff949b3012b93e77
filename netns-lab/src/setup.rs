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

//! Topology realization: planning and executing the namespace graph.
//!
//! Planning is pure: [`plan_setup`] turns a topology into a [`SetupPlan`] that lists every
//! namespace, device, address, rule, route and firewall payload to create, without touching the
//! system. Execution walks the plan with the external `ip` / `ipset` / `iptables-restore`
//! binaries and verifies the result against the declared facts. Any failure triggers a rollback
//! of everything created in the same invocation.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use ipnet::Ipv4Net;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tsim_registry::{unix_now, CreatorTag, LockManager};
use tsim_topology::{
    facts::{PolicyRule, RouterFacts},
    ipset,
    raw::{parse_ip_addr_json, parse_ip_route_json, parse_ip_rule_json},
    SubnetClass, Topology,
};

use crate::{
    ifname::{self, NameMap},
    Lab, LabError, BRIDGES_FILE, IFNAME_MAP_FILE, ROUTERS_FILE, SETUP_LOCK,
};

/// How long setup may wait for the global setup lock and the router locks.
const SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry entry for a created router namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterEntry {
    /// Who created the namespace.
    pub creator_tag: CreatorTag,
    /// When the namespace was created.
    pub created_at: f64,
}

/// Registry entry for a created bridge namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEntry {
    /// The bridged subnet.
    pub subnet: Ipv4Net,
    /// Who created the namespace.
    pub creator_tag: CreatorTag,
    /// When the namespace was created.
    pub created_at: f64,
}

/// A fully planned setup, produced without touching the system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupPlan {
    /// Router namespaces to create (the hostnames).
    pub namespaces: Vec<String>,
    /// Bridge namespaces for multi-access subnets.
    pub bridges: Vec<BridgePlan>,
    /// Point-to-point veth links.
    pub links: Vec<LinkPlan>,
    /// Per-router configuration.
    pub routers: BTreeMap<String, RouterPlan>,
    /// The device-name translation table.
    pub names: NameMap,
    /// Non-fatal observations made while planning.
    pub warnings: Vec<String>,
}

/// A planned veth pair for an inferred link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPlan {
    /// Id of the link in the topology.
    pub link_id: usize,
    /// The shared subnet.
    pub subnet: Ipv4Net,
    /// One end of the pair.
    pub a: EndPlan,
    /// The other end.
    pub b: EndPlan,
}

/// One planned end of a veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndPlan {
    /// Namespace (router) the device ends up in.
    pub router: String,
    /// Declared interface name it realizes.
    pub iface: String,
    /// Generated device name.
    pub device: String,
}

/// A planned bridge namespace with its attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePlan {
    /// Name of the bridge namespace.
    pub namespace: String,
    /// The bridged subnet.
    pub subnet: Ipv4Net,
    /// All router attachments.
    pub ports: Vec<PortPlan>,
}

/// A planned attachment of a router interface to a bridge namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPlan {
    /// The attached router.
    pub router: String,
    /// The declared interface.
    pub iface: String,
    /// Device placed in the router namespace.
    pub router_side: String,
    /// Device placed in the bridge namespace, enslaved to its bridge.
    pub bridge_side: String,
}

/// Everything to configure inside one router namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterPlan {
    /// In-namespace bridge devices fronting access subnets: (device, declared interface).
    pub access_bridges: Vec<(String, String)>,
    /// Dummy devices for interfaces outside any subnet: (device, declared interface).
    pub dummies: Vec<(String, String)>,
    /// Address assignments: (device, network).
    pub addresses: Vec<(String, Ipv4Net)>,
    /// MTU assignments: (device, mtu).
    pub mtus: Vec<(String, u32)>,
    /// Custom policy rules to install.
    pub rules: Vec<PolicyRule>,
    /// Numeric ids assigned to the named routing tables.
    pub table_ids: BTreeMap<String, u32>,
    /// Routes to install, in installation order.
    pub routes: Vec<RoutePlan>,
    /// Payload for `ipset restore`, if the router declares any sets.
    pub ipset_restore: Option<String>,
    /// Payload for `iptables-restore`, if the router declares firewall content.
    pub iptables_restore: Option<String>,
}

/// A single route in installation form, with the device already translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    /// Destination in `ip route` syntax.
    pub dst: String,
    /// Gateway, absent for directly connected routes.
    pub via: Option<Ipv4Addr>,
    /// Generated device name.
    pub device: String,
    /// Metric, if declared.
    pub metric: Option<u32>,
    /// Numeric routing table, `None` for main.
    pub table: Option<u32>,
}

/// Report of a successful setup.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupReport {
    /// All realized routers.
    pub routers: Vec<String>,
    /// Number of created point-to-point links.
    pub links: usize,
    /// Number of created bridge namespaces.
    pub bridges: usize,
    /// Verification and planning warnings.
    pub warnings: Vec<String>,
    /// Wall-clock duration of the whole setup.
    pub duration: Duration,
}

/// Assign numeric ids to the routing tables a router uses. `main` and numeric names map to
/// themselves; all other names get stable ids starting at 100, in alphabetical order.
fn assign_table_ids(facts: &RouterFacts) -> BTreeMap<String, u32> {
    let mut ids = BTreeMap::new();
    let mut next = 100;
    let names = facts
        .custom_routes()
        .map(|r| r.table.clone())
        .chain(facts.rules.iter().map(|r| r.table.clone()))
        .sorted()
        .dedup();
    for name in names {
        if name == "main" || name == "local" || name == "default" {
            continue;
        }
        if let Ok(n) = name.parse::<u32>() {
            ids.insert(name, n);
        } else {
            ids.insert(name, next);
            next += 1;
        }
    }
    ids
}

/// Kernel-default rule priorities that must not be installed explicitly.
fn is_default_rule(rule: &PolicyRule) -> bool {
    matches!(rule.priority, 0 | 32766 | 32767)
}

/// Compute the full setup plan for a topology.
pub fn plan_setup(topology: &Topology) -> SetupPlan {
    let mut plan = SetupPlan {
        namespaces: topology.routers().map(|(n, _)| n.clone()).collect(),
        ..Default::default()
    };

    // device role per (router, iface), first role wins
    let mut devices: BTreeMap<(String, String), String> = BTreeMap::new();

    for (subnet, class) in topology.subnets() {
        match class {
            SubnetClass::PointToPoint { link } => {
                let link = topology.link(*link).expect("link ids are dense");
                let dev_a = ifname::link_end(
                    &link.a.router,
                    &link.a.iface,
                    &link.b.router,
                    &link.b.iface,
                );
                let dev_b = ifname::link_end(
                    &link.b.router,
                    &link.b.iface,
                    &link.a.router,
                    &link.a.iface,
                );
                devices
                    .entry((link.a.router.clone(), link.a.iface.clone()))
                    .or_insert_with(|| dev_a.clone());
                devices
                    .entry((link.b.router.clone(), link.b.iface.clone()))
                    .or_insert_with(|| dev_b.clone());
                plan.names.insert(&dev_a, &link.a.router, &link.a.iface);
                plan.names.insert(&dev_b, &link.b.router, &link.b.iface);
                plan.links.push(LinkPlan {
                    link_id: link.id,
                    subnet: *subnet,
                    a: EndPlan {
                        router: link.a.router.clone(),
                        iface: link.a.iface.clone(),
                        device: dev_a,
                    },
                    b: EndPlan {
                        router: link.b.router.clone(),
                        iface: link.b.iface.clone(),
                        device: dev_b,
                    },
                });
            }
            SubnetClass::Access { endpoint } => {
                let device = ifname::access_bridge(&endpoint.router, &endpoint.iface);
                plan.names.insert(&device, &endpoint.router, &endpoint.iface);
                devices
                    .entry((endpoint.router.clone(), endpoint.iface.clone()))
                    .or_insert_with(|| device.clone());
                plan.routers
                    .entry(endpoint.router.clone())
                    .or_default()
                    .access_bridges
                    .push((device, endpoint.iface.clone()));
            }
            SubnetClass::Bridged { endpoints } => {
                let namespace = ifname::bridge_namespace(*subnet);
                let mut ports = Vec::new();
                for endpoint in endpoints {
                    let (router_side, bridge_side) =
                        ifname::bridge_attachment(&endpoint.router, &endpoint.iface);
                    plan.names
                        .insert(&router_side, &endpoint.router, &endpoint.iface);
                    devices
                        .entry((endpoint.router.clone(), endpoint.iface.clone()))
                        .or_insert_with(|| router_side.clone());
                    ports.push(PortPlan {
                        router: endpoint.router.clone(),
                        iface: endpoint.iface.clone(),
                        router_side,
                        bridge_side,
                    });
                }
                plan.bridges.push(BridgePlan {
                    namespace,
                    subnet: *subnet,
                    ports,
                });
            }
        }
    }

    // per-router configuration
    for (name, facts) in topology.routers() {
        let router_plan = plan.routers.entry(name.clone()).or_default();

        for iface in facts.interfaces.iter().filter(|i| !i.is_loopback()) {
            let key = (name.clone(), iface.name.clone());
            let device = match devices.get(&key) {
                Some(device) => device.clone(),
                None => {
                    // interface outside of any subnet: keep it as a dummy device so its
                    // addresses still exist
                    let device = ifname::dummy_device(name, &iface.name);
                    plan.names.insert(&device, name, &iface.name);
                    devices.insert(key, device.clone());
                    router_plan.dummies.push((device.clone(), iface.name.clone()));
                    device
                }
            };
            for net in iface.addresses.iter().filter_map(|a| a.ipv4_net()) {
                router_plan.addresses.push((device.clone(), net));
            }
            if let Some(mtu) = iface.mtu {
                router_plan.mtus.push((device.clone(), mtu));
            }
        }

        router_plan.table_ids = assign_table_ids(facts);
        router_plan.rules = facts
            .rules
            .iter()
            .filter(|r| !is_default_rule(r))
            .cloned()
            .collect();

        for route in facts
            .custom_routes()
            .sorted_by_key(|r| (r.table.clone(), r.metric.unwrap_or(0)))
        {
            let Some(device) = devices.get(&(name.clone(), route.dev.clone())) else {
                plan.warnings.push(format!(
                    "{name}: route {} references unknown device {}",
                    route.dst, route.dev
                ));
                continue;
            };
            let table = match route.table.as_str() {
                "main" => None,
                other => Some(
                    router_plan
                        .table_ids
                        .get(other)
                        .copied()
                        .unwrap_or_else(|| other.parse().unwrap_or(254)),
                ),
            };
            router_plan.routes.push(RoutePlan {
                dst: route.dst.to_string(),
                via: route.gateway,
                device: device.clone(),
                metric: route.metric,
                table,
            });
        }

        if !facts.ipsets.is_empty() {
            router_plan.ipset_restore = Some(ipset::to_restore(&facts.ipsets));
        }
        if !facts.iptables.is_empty() {
            router_plan.iptables_restore = Some(facts.iptables.to_restore());
        }
    }

    plan
}

/// Resources created during one setup invocation, for rollback.
#[derive(Debug, Default)]
struct Created {
    namespaces: Vec<String>,
    root_devices: Vec<String>,
}

impl<'n> Lab<'n> {
    /// Realize the topology. Idempotency within a single invocation is guaranteed by building
    /// everything fresh; running concurrently with itself is prevented by the global setup
    /// lock. On failure, everything created in this invocation is rolled back.
    pub async fn setup(&self, creator: &CreatorTag) -> Result<SetupReport, LabError> {
        let start = Instant::now();
        let _setup_lock =
            self.locks
                .acquire(SETUP_LOCK, SETUP_LOCK_TIMEOUT, Duration::from_millis(500))?;

        let plan = plan_setup(self.topology);
        log::info!(
            "[setup] realizing {} routers, {} links, {} bridges",
            plan.namespaces.len(),
            plan.links.len(),
            plan.bridges.len()
        );

        // hold every router lock for the duration of the mutation
        let router_locks: Vec<String> = plan
            .namespaces
            .iter()
            .map(|r| LockManager::router_lock_name(r))
            .collect();
        let _router_guards =
            self.locks
                .acquire_many(&router_locks, SETUP_LOCK_TIMEOUT, Duration::from_millis(500))?;

        let mut created = Created::default();
        match self.execute_plan(&plan, &mut created).await {
            Ok(mut warnings) => {
                self.record_registry(&plan, creator)?;
                warnings.extend(plan.warnings.iter().cloned());
                Ok(SetupReport {
                    routers: plan.namespaces.clone(),
                    links: plan.links.len(),
                    bridges: plan.bridges.len(),
                    warnings,
                    duration: start.elapsed(),
                })
            }
            Err(source) => {
                log::error!("[setup] failed: {source}; rolling back");
                let rollback_errors = self.rollback(&created).await;
                Err(LabError::SetupPartial {
                    source: Box::new(source),
                    rollback_errors,
                })
            }
        }
    }

    async fn execute_plan(
        &self,
        plan: &SetupPlan,
        created: &mut Created,
    ) -> Result<Vec<String>, LabError> {
        // 1. namespaces
        for ns in &plan.namespaces {
            self.runner.run(None, "ip", &["netns", "add", ns]).await?;
            created.namespaces.push(ns.clone());
            self.runner.run(Some(ns), "ip", &["link", "set", "lo", "up"]).await?;
            self.runner
                .run(Some(ns), "sysctl", &["-q", "-w", "net.ipv4.ip_forward=1"])
                .await?;
        }
        for bridge in &plan.bridges {
            let ns = &bridge.namespace;
            self.runner.run(None, "ip", &["netns", "add", ns]).await?;
            created.namespaces.push(ns.clone());
            self.runner
                .run(Some(ns), "ip", &["link", "add", "br0", "type", "bridge"])
                .await?;
            self.runner
                .run(Some(ns), "ip", &["link", "set", "br0", "up"])
                .await?;
        }

        // 2. point-to-point links
        for link in &plan.links {
            self.runner
                .run(
                    None,
                    "ip",
                    &[
                        "link", "add", &link.a.device, "type", "veth", "peer", "name",
                        &link.b.device,
                    ],
                )
                .await?;
            created.root_devices.push(link.a.device.clone());
            created.root_devices.push(link.b.device.clone());
            self.runner
                .run(None, "ip", &["link", "set", &link.a.device, "netns", &link.a.router])
                .await?;
            self.runner
                .run(None, "ip", &["link", "set", &link.b.device, "netns", &link.b.router])
                .await?;
        }

        // 3. bridge attachments
        for bridge in &plan.bridges {
            for port in &bridge.ports {
                self.runner
                    .run(
                        None,
                        "ip",
                        &[
                            "link", "add", &port.router_side, "type", "veth", "peer", "name",
                            &port.bridge_side,
                        ],
                    )
                    .await?;
                created.root_devices.push(port.router_side.clone());
                created.root_devices.push(port.bridge_side.clone());
                self.runner
                    .run(
                        None,
                        "ip",
                        &["link", "set", &port.router_side, "netns", &port.router],
                    )
                    .await?;
                self.runner
                    .run(
                        None,
                        "ip",
                        &["link", "set", &port.bridge_side, "netns", &bridge.namespace],
                    )
                    .await?;
                self.runner
                    .run(
                        Some(&bridge.namespace),
                        "ip",
                        &["link", "set", &port.bridge_side, "master", "br0"],
                    )
                    .await?;
                self.runner
                    .run(
                        Some(&bridge.namespace),
                        "ip",
                        &["link", "set", &port.bridge_side, "up"],
                    )
                    .await?;
            }
        }

        // 4. per-router configuration
        for (router, router_plan) in &plan.routers {
            self.configure_router(router, router_plan).await?;
        }

        // 5. verification
        let mut warnings = Vec::new();
        for (router, router_plan) in &plan.routers {
            warnings.extend(self.verify_router(router, router_plan, &plan.names).await?);
        }
        Ok(warnings)
    }

    async fn configure_router(
        &self,
        router: &str,
        plan: &RouterPlan,
    ) -> Result<(), LabError> {
        let ns = Some(router);

        for (device, _) in &plan.access_bridges {
            self.runner
                .run(ns, "ip", &["link", "add", device, "type", "bridge"])
                .await?;
        }
        for (device, _) in &plan.dummies {
            self.runner
                .run(ns, "ip", &["link", "add", device, "type", "dummy"])
                .await?;
        }
        for (device, mtu) in &plan.mtus {
            self.runner
                .run(ns, "ip", &["link", "set", device, "mtu", &mtu.to_string()])
                .await?;
        }
        for (device, net) in &plan.addresses {
            self.runner
                .run(ns, "ip", &["addr", "add", &net.to_string(), "dev", device])
                .await?;
        }
        // bring every configured device up
        for device in plan
            .addresses
            .iter()
            .map(|(d, _)| d)
            .chain(plan.access_bridges.iter().map(|(d, _)| d))
            .chain(plan.dummies.iter().map(|(d, _)| d))
            .unique()
        {
            self.runner.run(ns, "ip", &["link", "set", device, "up"]).await?;
        }

        for rule in &plan.rules {
            let table_id = plan
                .table_ids
                .get(&rule.table)
                .map(|id| id.to_string())
                .unwrap_or_else(|| rule.table.clone());
            self.runner
                .run(
                    ns,
                    "ip",
                    &[
                        "rule",
                        "add",
                        "priority",
                        &rule.priority.to_string(),
                        "from",
                        &rule.from.to_string(),
                        "table",
                        &table_id,
                    ],
                )
                .await?;
        }

        for route in &plan.routes {
            let mut args: Vec<String> = vec!["route".into(), "add".into(), route.dst.clone()];
            if let Some(via) = route.via {
                args.push("via".into());
                args.push(via.to_string());
            }
            args.push("dev".into());
            args.push(route.device.clone());
            if let Some(metric) = route.metric {
                args.push("metric".into());
                args.push(metric.to_string());
            }
            if let Some(table) = route.table {
                args.push("table".into());
                args.push(table.to_string());
            }
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.runner.run(ns, "ip", &args).await?;
        }

        if let Some(payload) = &plan.ipset_restore {
            self.runner
                .run_with_input(ns, "ipset", &["restore"], payload)
                .await?;
        }
        if let Some(payload) = &plan.iptables_restore {
            self.runner
                .run_with_input(ns, "iptables-restore", &[], payload)
                .await?;
        }

        log::debug!(
            "[setup] configured {router}: {} addresses, {} rules, {} routes",
            plan.addresses.len(),
            plan.rules.len(),
            plan.routes.len()
        );
        Ok(())
    }

    /// Verify one realized router against its plan. Missing addresses and missing routes are
    /// errors; missing custom rules are warnings.
    async fn verify_router(
        &self,
        router: &str,
        plan: &RouterPlan,
        names: &NameMap,
    ) -> Result<Vec<String>, LabError> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        let addr_json = self
            .runner
            .run(Some(router), "ip", &["--json", "addr", "show"])
            .await?;
        let observed = parse_ip_addr_json(router, &addr_json)?;

        for (device, net) in &plan.addresses {
            let holders = observed
                .iter()
                .filter(|i| {
                    i.addresses
                        .iter()
                        .any(|a| a.ipv4() == Some(net.addr()) && a.prefixlen == net.prefix_len())
                })
                .collect_vec();
            match holders.len() {
                1 => {
                    let held_on = holders[0].name.split('@').next().unwrap_or_default();
                    if held_on != device {
                        problems.push(format!(
                            "address {net} lives on {held_on} instead of {device} ({})",
                            names.translate(router, device).unwrap_or("?")
                        ));
                    }
                }
                0 => problems.push(format!("address {net} is missing")),
                n => problems.push(format!("address {net} is present on {n} interfaces")),
            }
        }

        // routes, one query per table
        let tables: Vec<Option<u32>> = plan.routes.iter().map(|r| r.table).unique().collect();
        for table in tables {
            let table_str = table.map(|t| t.to_string());
            let args: Vec<&str> = match &table_str {
                Some(t) => vec!["--json", "route", "show", "table", t],
                None => vec!["--json", "route", "show"],
            };
            let route_json = self.runner.run(Some(router), "ip", &args).await?;
            let observed_routes = parse_ip_route_json(router, &route_json)?;
            for planned in plan.routes.iter().filter(|r| r.table == table) {
                let found = observed_routes.iter().any(|r| {
                    r.dst.to_string() == planned.dst
                        && r.gateway == planned.via
                        && (planned.metric.is_none() || r.metric == planned.metric)
                });
                if !found {
                    problems.push(format!(
                        "route {} via {:?} is missing in table {}",
                        planned.dst,
                        planned.via,
                        table_str.as_deref().unwrap_or("main")
                    ));
                }
            }
        }

        if !plan.rules.is_empty() {
            let rule_json = self
                .runner
                .run(Some(router), "ip", &["--json", "rule", "show"])
                .await?;
            let observed_rules = parse_ip_rule_json(router, &rule_json)?;
            for rule in &plan.rules {
                if !observed_rules.iter().any(|r| r.priority == rule.priority) {
                    warnings.push(format!(
                        "{router}: custom rule priority {} from {} is missing",
                        rule.priority, rule.from
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(warnings)
        } else {
            Err(LabError::VerificationFailed {
                router: router.to_string(),
                problems,
            })
        }
    }

    /// Delete everything created in this invocation, in reverse order. Failures are collected,
    /// never raised, so they cannot mask the original error.
    async fn rollback(&self, created: &Created) -> Vec<String> {
        let mut errors = Vec::new();
        for device in created.root_devices.iter().rev() {
            // devices already moved into a namespace are gone from the root namespace
            match self.runner.run_status(None, "ip", &["link", "del", device]).await {
                Ok(_) => {}
                Err(e) => errors.push(format!("link del {device}: {e}")),
            }
        }
        for ns in created.namespaces.iter().rev() {
            match self.runner.run_status(None, "ip", &["netns", "del", ns]).await {
                Ok(true) => {}
                Ok(false) => log::debug!("[setup] rollback: namespace {ns} already gone"),
                Err(e) => errors.push(format!("netns del {ns}: {e}")),
            }
        }
        errors
    }

    fn record_registry(&self, plan: &SetupPlan, creator: &CreatorTag) -> Result<(), LabError> {
        let now = unix_now();
        self.registry.update(
            ROUTERS_FILE,
            |routers: &mut BTreeMap<String, RouterEntry>| {
                for ns in &plan.namespaces {
                    routers.insert(
                        ns.clone(),
                        RouterEntry {
                            creator_tag: creator.clone(),
                            created_at: now,
                        },
                    );
                }
            },
        )?;
        self.registry.update(
            BRIDGES_FILE,
            |bridges: &mut BTreeMap<String, BridgeEntry>| {
                for bridge in &plan.bridges {
                    bridges.insert(
                        bridge.namespace.clone(),
                        BridgeEntry {
                            subnet: bridge.subnet,
                            creator_tag: creator.clone(),
                            created_at: now,
                        },
                    );
                }
            },
        )?;
        self.registry
            .update(IFNAME_MAP_FILE, |map: &mut NameMap| {
                map.devices.extend(
                    plan.names
                        .devices
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            })?;
        Ok(())
    }
}
