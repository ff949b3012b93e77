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

//! This library materializes a declared router topology as a set of Linux network namespaces,
//! collects status from the live namespaces, and drives reachability experiments across them.
//!
//! # Realization
//!
//! [`Lab::setup`] turns a [`tsim_topology::Topology`] into live kernel state:
//!
//! - one namespace per router, one per multi-access bridge subnet;
//! - a veth pair for every inferred point-to-point link, with deterministic, at most 15
//!   character device names (the mapping back to the declared interface names is recorded in
//!   the registry so status output can be translated);
//! - an in-namespace bridge device for every access subnet, carrying the router's address on
//!   that subnet, to which dynamic hosts attach later;
//! - all declared addresses, MTUs, policy rules, non-kernel routes, ipsets and the full
//!   iptables content.
//!
//! A failure after partial creation rolls back every resource created in the same invocation;
//! rollback failures are reported alongside the original error, never instead of it.
//!
//! # The lab structure
//!
//! All operations hang off the [`Lab`] structure, which borrows the loaded topology and the
//! shared registry. There are no globals: whoever constructs the [`Lab`] decides which
//! configuration it runs under. Mutations of a router's namespace take that router's named
//! lock; the whole setup runs under the single `network_setup` lock.
//!
//! # Probing
//!
//! The reachability tester never inspects payloads. It samples the firewall counters at every
//! waypoint before and after emitting a single tagged probe packet per service, and attributes
//! the verdict to whichever rule's counter advanced. Since the scheduler serializes runs and
//! the tester serializes services within a run, counter deltas are never ambiguous.

use thiserror::Error;

pub mod cmd;
pub mod hosts;
pub mod ifname;
pub mod setup;
pub mod status;
pub mod teardown;
pub mod tester;

mod cache;
pub use cache::StatusCache;
pub use cmd::{CmdError, CommandRunner};
pub use hosts::HostSpec;
pub use ifname::NameMap;
pub use setup::{SetupPlan, SetupReport};
pub use status::{StatusFunction, StatusReport};
pub use teardown::{TeardownReport, TeardownScope};
pub use tester::{
    AnalysisMode, CancelToken, Decision, NullSink, ProgressSink, Proto, Service, ServiceVerdict,
    TestReport, TestRequest, WaypointResult,
};

#[cfg(test)]
mod test;

use std::time::Duration;

use tsim_registry::{Config, LockManager, Registry};
use tsim_topology::Topology;

/// Registry file recording the created router namespaces.
pub const ROUTERS_FILE: &str = "routers.json";
/// Registry file recording the created bridge namespaces.
pub const BRIDGES_FILE: &str = "bridges.json";
/// Registry file holding the veth-to-declared-interface translation table.
pub const IFNAME_MAP_FILE: &str = "ifname_map.json";

/// Name of the lock serializing topology setup and teardown.
pub const SETUP_LOCK: &str = "network_setup";

/// A handle on the realized (or to-be-realized) namespace network.
pub struct Lab<'n> {
    pub(crate) config: &'n Config,
    pub(crate) topology: &'n Topology,
    pub(crate) registry: &'n Registry,
    pub(crate) locks: LockManager,
    pub(crate) runner: CommandRunner,
}

impl<'n> Lab<'n> {
    /// Create a new lab handle. This only allocates structures; nothing is changed on the
    /// system until [`Lab::setup`] or one of the mutating operations is called.
    pub fn new(
        config: &'n Config,
        topology: &'n Topology,
        registry: &'n Registry,
    ) -> Result<Self, LabError> {
        let locks = LockManager::new(&config.lock_dir)?;
        let runner = CommandRunner::new(Duration::from_secs(
            config.parallelization.timeout_per_namespace,
        ));
        Ok(Self {
            config,
            topology,
            registry,
            locks,
            runner,
        })
    }

    /// The topology this lab realizes.
    pub fn topology(&self) -> &'n Topology {
        self.topology
    }

    /// The registry backing this lab.
    pub fn registry(&self) -> &'n Registry {
        self.registry
    }
}

/// Error type thrown while realizing or probing the namespace network.
#[derive(Debug, Error)]
pub enum LabError {
    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An external command failed.
    #[error("{0}")]
    Cmd(#[from] CmdError),
    /// Error from the shared registry.
    #[error("{0}")]
    Registry(#[from] tsim_registry::RegistryError),
    /// Error from the fact model.
    #[error("{0}")]
    Fact(#[from] tsim_topology::FactError),
    /// Setup failed after partial creation; a rollback was attempted.
    #[error("Setup failed: {source}{}", fmt_rollback(.rollback_errors))]
    SetupPartial {
        /// The original failure.
        #[source]
        source: Box<LabError>,
        /// Failures encountered while rolling back, if any.
        rollback_errors: Vec<String>,
    },
    /// The verification pass after setup found mismatches between the declared facts and the
    /// realized namespace.
    #[error("Verification of router {router} failed: {}", .problems.join("; "))]
    VerificationFailed {
        /// The router whose namespace does not match its facts.
        router: String,
        /// All detected mismatches.
        problems: Vec<String>,
    },
    /// A router named in a request does not exist in the topology.
    #[error("Router `{0}` is not part of the topology")]
    UnknownRouter(String),
    /// An address is not part of any access subnet.
    #[error("Address {0} is not covered by any access subnet")]
    NoAccessSubnet(std::net::Ipv4Addr),
    /// A host with the same name already exists.
    #[error("Host `{0}` already exists")]
    HostExists(String),
    /// The named host does not exist.
    #[error("Host `{0}` does not exist")]
    UnknownHost(String),
    /// The run was cancelled cooperatively between phases.
    #[error("The run was cancelled")]
    Cancelled,
    /// Cannot join a parallel job
    #[error("Cannot join task: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A probe packet could not be emitted.
    #[error("Probe error: {0}")]
    Probe(#[from] tester::ProbeError),
}

fn fmt_rollback(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!("; rollback failures: {}", errors.join("; "))
    }
}
