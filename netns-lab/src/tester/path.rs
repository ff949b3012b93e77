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

//! Forwarding-path computation over the declared routing state.
//!
//! The walk simulates what the kernel would do: at every router, look up the destination
//! (honoring policy rules, longest prefix, and metrics) and move to the next-hop router. The
//! walk aborts when the same (router, out-interface) pair appears twice, or when a router has
//! no matching route.

use std::{collections::HashSet, net::Ipv4Addr};

use thiserror::Error;
use tsim_topology::{FibLookup, Topology};

/// The tester cannot compute a forwarding path. This is recorded in the service verdicts, it
/// never fails the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The same (router, out-interface) pair occurred twice.
    #[error("Forwarding loop at {router} out of {iface}")]
    Loop {
        /// Router at which the loop closed.
        router: String,
        /// The repeated output interface.
        iface: String,
    },
    /// A router on the path has no route towards the destination.
    #[error("No route towards {dst} at {router}")]
    Blackhole {
        /// Router at which the walk got stuck.
        router: String,
        /// The destination that cannot be reached.
        dst: Ipv4Addr,
    },
}

impl PathError {
    /// Short kind string recorded in verdicts.
    pub fn kind(&self) -> &'static str {
        match self {
            PathError::Loop { .. } => "PathLoop",
            PathError::Blackhole { .. } => "PathBlackhole",
        }
    }
}

/// One step of the computed forwarding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// The router traversed.
    pub router: String,
    /// Output interface (declared name). `None` on the destination router itself.
    pub out_iface: Option<String>,
    /// Gateway used, `None` for directly connected delivery.
    pub via: Option<Ipv4Addr>,
}

/// Compute the router path a packet from `src` to `dst` takes, starting at `src_router`.
pub fn compute_path(
    topology: &Topology,
    src_router: &str,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<Vec<Hop>, PathError> {
    let mut hops = Vec::new();
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut current = src_router.to_string();

    loop {
        let facts = topology
            .router(&current)
            .ok_or_else(|| PathError::Blackhole {
                router: current.clone(),
                dst,
            })?;
        let fib = FibLookup::new(facts);

        if fib.is_local(dst) {
            hops.push(Hop {
                router: current,
                out_iface: None,
                via: None,
            });
            return Ok(hops);
        }

        let hop = fib.next_hop(src, dst).ok_or_else(|| PathError::Blackhole {
            router: current.clone(),
            dst,
        })?;
        let out_iface = hop.out_iface.to_string();
        if !visited.insert((current.clone(), out_iface.clone())) {
            return Err(PathError::Loop {
                router: current,
                iface: out_iface,
            });
        }

        match hop.via {
            Some(gateway) => {
                let next = topology
                    .find_owner(gateway)
                    .ok_or_else(|| PathError::Blackhole {
                        router: current.clone(),
                        dst,
                    })?;
                hops.push(Hop {
                    router: current,
                    out_iface: Some(out_iface),
                    via: Some(gateway),
                });
                current = next.router;
            }
            None => {
                // directly connected: either the next router owns the destination, or the
                // destination is a host on an access subnet behind this router
                hops.push(Hop {
                    router: current.clone(),
                    out_iface: Some(out_iface),
                    via: None,
                });
                match topology.find_owner(dst) {
                    Some(next) => current = next.router,
                    None => return Ok(hops),
                }
            }
        }
    }
}

/// The routers a path traverses, in order and without duplicates.
pub fn waypoint_routers(hops: &[Hop]) -> Vec<String> {
    let mut routers = Vec::new();
    for hop in hops {
        if routers.last() != Some(&hop.router) {
            routers.push(hop.router.clone());
        }
    }
    routers
}
