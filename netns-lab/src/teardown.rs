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

//! Teardown of realized namespaces, in reverse dependency order: hosts, then routers (their
//! links die with them), then bridges.

use std::{
    collections::BTreeMap,
    str::FromStr,
    time::{Duration, Instant},
};

use tsim_registry::registry::{Host, HOST_LEASES_FILE};

use crate::{
    setup::{BridgeEntry, RouterEntry},
    Lab, LabError, BRIDGES_FILE, IFNAME_MAP_FILE, ROUTERS_FILE, SETUP_LOCK,
};

use crate::ifname::NameMap;

/// What a teardown invocation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownScope {
    /// Everything this system created: hosts, routers, bridges, and all registry state.
    All,
    /// A single router namespace.
    Router(String),
    /// Only the dynamic hosts.
    HostsOnly,
    /// Only resources tagged `wsgi:*`.
    WsgiCreated,
}

impl FromStr for TeardownScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "hosts-only" => Ok(Self::HostsOnly),
            "wsgi-created" => Ok(Self::WsgiCreated),
            other => match other.strip_prefix("router=") {
                Some(name) if !name.is_empty() => Ok(Self::Router(name.to_string())),
                _ => Err(format!("invalid teardown scope `{other}`")),
            },
        }
    }
}

/// Report of a teardown invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// All deleted namespaces, in deletion order.
    pub namespaces_deleted: Vec<String>,
    /// Problems encountered. Teardown is best-effort: a namespace that is already gone is not
    /// an error.
    pub warnings: Vec<String>,
}

impl<'n> Lab<'n> {
    /// Tear down realized state. Runs under the same lock as setup.
    pub async fn teardown(&self, scope: TeardownScope) -> Result<TeardownReport, LabError> {
        let start = Instant::now();
        let _setup_lock =
            self.locks
                .acquire(SETUP_LOCK, Duration::from_secs(120), Duration::from_millis(500))?;

        let mut report = TeardownReport::default();

        let hosts = self.registry.hosts()?;
        let routers: BTreeMap<String, RouterEntry> = self.registry.read(ROUTERS_FILE)?;
        let bridges: BTreeMap<String, BridgeEntry> = self.registry.read(BRIDGES_FILE)?;

        let (host_victims, router_victims, bridge_victims): (Vec<&Host>, Vec<&String>, Vec<&String>) =
            match &scope {
                TeardownScope::All => (
                    hosts.values().collect(),
                    routers.keys().collect(),
                    bridges.keys().collect(),
                ),
                TeardownScope::HostsOnly => (hosts.values().collect(), vec![], vec![]),
                TeardownScope::Router(name) => {
                    if !routers.contains_key(name) {
                        return Err(LabError::UnknownRouter(name.clone()));
                    }
                    // hosts attached to that router go down with it
                    (
                        hosts.values().filter(|h| &h.connected_router == name).collect(),
                        routers.keys().filter(|r| *r == name).collect(),
                        vec![],
                    )
                }
                TeardownScope::WsgiCreated => (
                    hosts.values().filter(|h| h.creator_tag.is_wsgi()).collect(),
                    routers
                        .iter()
                        .filter(|(_, e)| e.creator_tag.is_wsgi())
                        .map(|(n, _)| n)
                        .collect(),
                    bridges
                        .iter()
                        .filter(|(_, e)| e.creator_tag.is_wsgi())
                        .map(|(n, _)| n)
                        .collect(),
                ),
            };

        // 1. hosts
        for host in &host_victims {
            self.delete_namespace(&host.name, &mut report).await;
            self.registry.remove_host(&host.name)?;
        }
        self.registry.update(
            HOST_LEASES_FILE,
            |leases: &mut BTreeMap<String, tsim_registry::HostLease>| {
                for host in &host_victims {
                    leases.remove(&host.name);
                }
            },
        )?;

        // 2. routers (their veth ends disappear with the namespace, taking the peer end along)
        for router in &router_victims {
            self.delete_namespace(router, &mut report).await;
        }
        self.registry.update(
            ROUTERS_FILE,
            |entries: &mut BTreeMap<String, RouterEntry>| {
                for router in &router_victims {
                    entries.remove(*router);
                }
            },
        )?;

        // 3. bridges
        for bridge in &bridge_victims {
            self.delete_namespace(bridge, &mut report).await;
        }
        self.registry.update(
            BRIDGES_FILE,
            |entries: &mut BTreeMap<String, BridgeEntry>| {
                for bridge in &bridge_victims {
                    entries.remove(*bridge);
                }
            },
        )?;

        // 4. translation table
        match &scope {
            TeardownScope::All => {
                self.registry.update(IFNAME_MAP_FILE, |map: &mut NameMap| {
                    map.devices.clear();
                })?;
            }
            TeardownScope::Router(name) => {
                self.registry.update(IFNAME_MAP_FILE, |map: &mut NameMap| {
                    map.devices.retain(|_, d| &d.router != name);
                })?;
            }
            _ => {}
        }

        log::info!(
            "[teardown] removed {} namespaces in {:.2}s",
            report.namespaces_deleted.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn delete_namespace(&self, ns: &str, report: &mut TeardownReport) {
        match self.runner.run_status(None, "ip", &["netns", "del", ns]).await {
            Ok(true) => report.namespaces_deleted.push(ns.to_string()),
            Ok(false) => report
                .warnings
                .push(format!("namespace {ns} was already gone")),
            Err(e) => report.warnings.push(format!("cannot delete {ns}: {e}")),
        }
    }
}
