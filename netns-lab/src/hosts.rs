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

//! Dynamic hosts: namespaces attached to a router's access subnet through a veth pair.

use std::{collections::BTreeMap, time::Duration};

use ipnet::Ipv4Net;
use tsim_registry::{CreatorTag, Host, LockManager};

use crate::{ifname, Lab, LabError};

/// Specification of a host to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Name of the host; also becomes its namespace name.
    pub name: String,
    /// Primary address with prefix. Must lie within an access subnet.
    pub primary: Ipv4Net,
    /// Additional addresses to assign to the same interface.
    pub secondary: Vec<Ipv4Net>,
    /// Optional router constraint: fail instead of attaching to a different router.
    pub connect_to: Option<String>,
}

impl<'n> Lab<'n> {
    /// Attach a new host. The primary address must be part of an access subnet; the host gets a
    /// veth into the owning router's access bridge and a default route via the router's address
    /// in that subnet.
    pub async fn add_host(
        &self,
        spec: &HostSpec,
        creator: &CreatorTag,
    ) -> Result<Host, LabError> {
        if self.registry.hosts()?.contains_key(&spec.name) {
            return Err(LabError::HostExists(spec.name.clone()));
        }

        let (subnet, endpoint) = self
            .topology
            .access_subnet_of(spec.primary.addr())
            .ok_or(LabError::NoAccessSubnet(spec.primary.addr()))?;
        if let Some(required) = &spec.connect_to {
            if required != &endpoint.router {
                return Err(LabError::UnknownRouter(format!(
                    "{} (address {} belongs to {})",
                    required,
                    spec.primary.addr(),
                    endpoint.router
                )));
            }
        }
        let gateway = self
            .topology
            .gateway_in(subnet, endpoint)
            .ok_or(LabError::NoAccessSubnet(spec.primary.addr()))?;

        // mutating the router namespace requires its lock
        let _router_lock = self.locks.acquire(
            &LockManager::router_lock_name(&endpoint.router),
            Duration::from_secs(30),
            Duration::from_millis(200),
        )?;

        let access_bridge = ifname::access_bridge(&endpoint.router, &endpoint.iface);
        let (router_side, host_side) = ifname::host_attachment(&spec.name);

        self.runner
            .run(None, "ip", &["netns", "add", &spec.name])
            .await?;

        let result = self
            .wire_host(spec, &endpoint.router, &access_bridge, &router_side, &host_side, gateway)
            .await;
        if let Err(e) = result {
            // best-effort rollback of the half-created host
            let _ = self
                .runner
                .run_status(None, "ip", &["netns", "del", &spec.name])
                .await;
            let _ = self
                .runner
                .run_status(None, "ip", &["link", "del", &router_side])
                .await;
            return Err(e);
        }

        let host = Host {
            name: spec.name.clone(),
            primary_address: spec.primary.to_string(),
            secondary_addresses: spec.secondary.iter().map(|n| n.to_string()).collect(),
            connected_router: endpoint.router.clone(),
            connected_interface: endpoint.iface.clone(),
            creator_tag: creator.clone(),
        };
        self.registry.put_host(host.clone())?;
        log::info!(
            "[hosts] attached {} ({}) to {}.{}",
            host.name,
            host.primary_address,
            host.connected_router,
            host.connected_interface
        );
        Ok(host)
    }

    async fn wire_host(
        &self,
        spec: &HostSpec,
        router: &str,
        access_bridge: &str,
        router_side: &str,
        host_side: &str,
        gateway: std::net::Ipv4Addr,
    ) -> Result<(), LabError> {
        let ns = Some(spec.name.as_str());

        self.runner
            .run(
                None,
                "ip",
                &["link", "add", router_side, "type", "veth", "peer", "name", host_side],
            )
            .await?;
        self.runner
            .run(None, "ip", &["link", "set", router_side, "netns", router])
            .await?;
        self.runner
            .run(None, "ip", &["link", "set", host_side, "netns", &spec.name])
            .await?;

        // router side joins the access subnet through the bridge
        self.runner
            .run(Some(router), "ip", &["link", "set", router_side, "master", access_bridge])
            .await?;
        self.runner
            .run(Some(router), "ip", &["link", "set", router_side, "up"])
            .await?;

        // host side becomes eth0
        self.runner
            .run(ns, "ip", &["link", "set", host_side, "name", "eth0"])
            .await?;
        self.runner
            .run(ns, "ip", &["addr", "add", &spec.primary.to_string(), "dev", "eth0"])
            .await?;
        for secondary in &spec.secondary {
            self.runner
                .run(ns, "ip", &["addr", "add", &secondary.to_string(), "dev", "eth0"])
                .await?;
        }
        self.runner.run(ns, "ip", &["link", "set", "lo", "up"]).await?;
        self.runner.run(ns, "ip", &["link", "set", "eth0", "up"]).await?;
        self.runner
            .run(
                ns,
                "ip",
                &["route", "add", "default", "via", &gateway.to_string(), "dev", "eth0"],
            )
            .await?;
        Ok(())
    }

    /// Remove a host namespace and its registry record.
    pub async fn remove_host(&self, name: &str) -> Result<Host, LabError> {
        let host = self
            .registry
            .remove_host(name)?
            .ok_or_else(|| LabError::UnknownHost(name.to_string()))?;
        // deleting the namespace removes the veth pair on both sides
        let _ = self
            .runner
            .run_status(None, "ip", &["netns", "del", name])
            .await;
        log::info!("[hosts] removed {name}");
        Ok(host)
    }

    /// List all registered hosts.
    pub fn list_hosts(&self) -> Result<BTreeMap<String, Host>, LabError> {
        Ok(self.registry.hosts()?)
    }
}
