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

//! The multi-service reachability tester.
//!
//! A run proceeds in five phases, each reported as a progress event and each a cooperative
//! cancellation point: resolve the endpoints, compute the forwarding path, snapshot the
//! firewall counters at every waypoint, probe each service sequentially, and clean up. The
//! tester never preempts an in-flight command; a cancellation takes effect once the current
//! phase returns, and cleanup runs in every case.

pub mod counters;
pub mod path;
pub mod probe;

pub use probe::{ProbeError, ProbeSpec};

use std::{
    fmt,
    net::Ipv4Addr,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tsim_registry::{CreatorMethod, CreatorTag};

use crate::{hosts::HostSpec, Lab, LabError};
use counters::{classify_waypoint, diff, parse_snapshot, CounterSnapshot};
use path::{compute_path, waypoint_routers};

/// Wait between emitting a probe and resampling the counters. Also the minimum spacing between
/// two services, which keeps the deltas unambiguous.
const COUNTER_GRACE: Duration = Duration::from_millis(500);

/// Transport protocol of a probed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Proto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(format!("unknown protocol `{other}`")),
        }
    }
}

/// A (port, protocol) pair to probe, written `80/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    /// Destination port.
    pub port: u16,
    /// Transport protocol.
    pub proto: Proto,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid service `{s}`, expected `<port>/<proto>`"))?;
        Ok(Self {
            port: port
                .parse()
                .map_err(|_| format!("invalid port in service `{s}`"))?,
            proto: proto.parse()?,
        })
    }
}

/// How deep the tester probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Probe only the endpoints, one verdict per service.
    Quick,
    /// Probe every waypoint on the path and report per-router decisions.
    Detailed,
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("unknown analysis mode `{other}`")),
        }
    }
}

/// The decision a waypoint made for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Accept,
    Drop,
    Reject,
    Unknown,
}

/// The counters observed at one waypoint for one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaypointResult {
    /// The router sampled.
    pub router: String,
    /// The chain carrying the decisive counter.
    pub chain: String,
    /// The decisive rule, if a specific rule (rather than a chain policy) advanced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Packets attributed to the probe.
    pub packet_delta: u64,
    /// Bytes attributed to the probe.
    pub byte_delta: u64,
    /// The decision at this waypoint.
    pub decision: Decision,
}

/// The verdict for a single probed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVerdict {
    /// Destination port of the service.
    pub port: u16,
    /// Transport protocol of the service.
    pub proto: Proto,
    /// Whether the destination accepted the probe.
    pub reachable: bool,
    /// Per-waypoint observations, in path order.
    pub waypoint_results: Vec<WaypointResult>,
    /// The aggregated decision.
    pub final_decision: Decision,
    /// Wall-clock time spent probing this service.
    pub timing_ms: u64,
    /// Failure kind when no path could be computed (`PathLoop`, `PathBlackhole`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A reachability test request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    /// Run id this test executes under.
    pub run_id: String,
    /// Submitting user.
    pub username: String,
    /// Source address of all probes.
    pub source_ip: Ipv4Addr,
    /// Fixed source port; ephemeral if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    /// Destination address of all probes.
    pub dest_ip: Ipv4Addr,
    /// The services to probe, in submission order.
    pub services: Vec<Service>,
    /// Endpoint-only or full-path analysis.
    pub analysis_mode: AnalysisMode,
    /// Opaque caller data, carried through to the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_trace_data: Option<serde_json::Value>,
}

/// The aggregated result of a reachability test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Run id of the test.
    pub run_id: String,
    /// Source address probed from.
    pub source_ip: Ipv4Addr,
    /// Destination address probed.
    pub dest_ip: Ipv4Addr,
    /// One verdict per service, in submission order.
    pub verdicts: Vec<ServiceVerdict>,
    /// Routers on the forwarding path.
    pub path: Vec<String>,
    /// Total test duration.
    pub duration_ms: u64,
    /// Opaque caller data from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_trace_data: Option<serde_json::Value>,
}

/// Receiver of per-phase progress events.
pub trait ProgressSink: Send + Sync {
    /// Record that a phase started, with free-text details.
    fn phase(&self, run_id: &str, phase: &str, details: &str);
}

/// A sink that drops all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn phase(&self, _: &str, _: &str, _: &str) {}
}

/// Cooperative cancellation flag, checked by the tester between phases and between services.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The current phase still finishes.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), LabError> {
        if self.is_cancelled() {
            Err(LabError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A resolved probe endpoint: the namespace the probe runs in (or lands in) and the router
/// anchoring it.
#[derive(Debug, Clone)]
struct ResolvedEndpoint {
    /// Namespace holding the address.
    namespace: String,
    /// The router the path computation anchors at.
    router: String,
    /// Whether the address lives on the router itself rather than a host.
    on_router: bool,
}

/// State to undo in cleanup, regardless of the outcome.
#[derive(Debug, Default)]
struct CleanupState {
    transient_hosts: Vec<String>,
}

impl<'n> Lab<'n> {
    /// Execute a reachability test. The caller must hold the global `network_test` lock; the
    /// scheduler guarantees at most one test runs at a time.
    pub async fn run_reachability_test(
        &self,
        request: &TestRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<TestReport, LabError> {
        let start = Instant::now();
        let mut cleanup = CleanupState::default();
        let result = self
            .test_phases(request, sink, cancel, &mut cleanup)
            .await;

        sink.phase(&request.run_id, "CLEANUP", "releasing leases and allocations");
        self.test_cleanup(request, &cleanup).await;

        let (verdicts, path) = result?;
        Ok(TestReport {
            run_id: request.run_id.clone(),
            source_ip: request.source_ip,
            dest_ip: request.dest_ip,
            verdicts,
            path,
            duration_ms: start.elapsed().as_millis() as u64,
            user_trace_data: request.user_trace_data.clone(),
        })
    }

    async fn test_phases(
        &self,
        request: &TestRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        cleanup: &mut CleanupState,
    ) -> Result<(Vec<ServiceVerdict>, Vec<String>), LabError> {
        // phase 1: resolve endpoints
        cancel.check()?;
        sink.phase(
            &request.run_id,
            "RESOLVE_ENDPOINTS",
            &format!("{} -> {}", request.source_ip, request.dest_ip),
        );
        let src = self
            .resolve_endpoint(request, request.source_ip, "src", cleanup)
            .await?;
        let dst = self
            .resolve_endpoint(request, request.dest_ip, "dst", cleanup)
            .await?;

        // phase 2: compute the forwarding path
        cancel.check()?;
        sink.phase(&request.run_id, "COMPUTE_PATH", &format!("from {}", src.router));
        let hops = match compute_path(
            self.topology,
            &src.router,
            request.source_ip,
            request.dest_ip,
        ) {
            Ok(hops) => hops,
            Err(e) => {
                log::warn!("[tester] {}: {e}", request.run_id);
                sink.phase(&request.run_id, "COMPUTE_PATH", &format!("failed: {e}"));
                let verdicts = request
                    .services
                    .iter()
                    .map(|s| ServiceVerdict {
                        port: s.port,
                        proto: s.proto,
                        reachable: false,
                        waypoint_results: Vec::new(),
                        final_decision: Decision::Unknown,
                        timing_ms: 0,
                        reason: Some(e.kind().to_string()),
                    })
                    .collect();
                return Ok((verdicts, Vec::new()));
            }
        };
        let mut waypoints = waypoint_routers(&hops);
        if request.analysis_mode == AnalysisMode::Quick && waypoints.len() > 2 {
            waypoints = vec![
                waypoints.first().unwrap().clone(),
                waypoints.last().unwrap().clone(),
            ];
        }
        log::debug!(
            "[tester] {}: path {}",
            request.run_id,
            waypoints.join(" -> ")
        );

        // phase 3: snapshot counters at every waypoint
        cancel.check()?;
        sink.phase(
            &request.run_id,
            "PREPARE_WAYPOINTS",
            &format!("{} waypoints", waypoints.len()),
        );
        let mut before = self.snapshot_waypoints(&waypoints).await?;

        // phase 4: probe each service sequentially
        let mut verdicts = Vec::new();
        for (index, service) in request.services.iter().enumerate() {
            cancel.check()?;
            sink.phase(
                &request.run_id,
                "PROBE_SERVICE",
                &format!("{} ({}/{})", service, index + 1, request.services.len()),
            );
            let verdict = self
                .probe_service(request, index, *service, &src, &dst, &waypoints, &mut before)
                .await?;
            verdicts.push(verdict);
        }

        Ok((verdicts, waypoints))
    }

    /// Find or create the namespace carrying an endpoint address. Addresses owned by a router
    /// resolve to the router namespace; everything else must fall into an access subnet, where
    /// a transient host namespace is attached under a lease.
    async fn resolve_endpoint(
        &self,
        request: &TestRequest,
        address: Ipv4Addr,
        role: &str,
        cleanup: &mut CleanupState,
    ) -> Result<ResolvedEndpoint, LabError> {
        if let Some(endpoint) = self.topology.find_owner(address) {
            return Ok(ResolvedEndpoint {
                namespace: endpoint.router.clone(),
                router: endpoint.router,
                on_router: true,
            });
        }

        let (subnet, endpoint) = self
            .topology
            .access_subnet_of(address)
            .ok_or(LabError::NoAccessSubnet(address))?;

        if !self.registry.acquire_neighbor_lease(
            &endpoint.router,
            &endpoint.iface,
            address,
            &request.run_id,
        )? {
            log::warn!(
                "[tester] {}: address {address} already leased by another run",
                request.run_id
            );
        }

        let short_id: String = request.run_id.chars().take(8).collect();
        let name = format!("tsim-{short_id}-{role}");
        let creator = CreatorTag::new(CreatorMethod::Api, request.username.clone());

        // an existing namespace from a previous identical run is reused
        if !self.registry.hosts()?.contains_key(&name) {
            let spec = HostSpec {
                name: name.clone(),
                primary: Ipv4Net::new(address, subnet.prefix_len())
                    .map_err(|_| LabError::NoAccessSubnet(address))?,
                secondary: Vec::new(),
                connect_to: Some(endpoint.router.clone()),
            };
            self.add_host(&spec, &creator).await?;
        }
        self.registry.acquire_host_lease(&name, &request.run_id)?;
        cleanup.transient_hosts.push(name.clone());

        Ok(ResolvedEndpoint {
            namespace: name,
            router: endpoint.router.clone(),
            on_router: false,
        })
    }

    async fn snapshot_waypoints(
        &self,
        waypoints: &[String],
    ) -> Result<Vec<CounterSnapshot>, LabError> {
        let mut snapshots = Vec::with_capacity(waypoints.len());
        for waypoint in waypoints {
            let save = self
                .runner
                .run(Some(waypoint), "iptables-save", &["-c"])
                .await?;
            snapshots.push(parse_snapshot(&save));
        }
        Ok(snapshots)
    }

    /// The chains a probe traverses at a waypoint, depending on its position on the path.
    fn chains_at<'c>(
        waypoint: &str,
        first: bool,
        last: bool,
        src: &ResolvedEndpoint,
        dst: &ResolvedEndpoint,
    ) -> Vec<&'c str> {
        if first && src.on_router && waypoint == src.router {
            return vec!["OUTPUT", "POSTROUTING"];
        }
        if last && dst.on_router && waypoint == dst.router {
            return vec!["PREROUTING", "INPUT"];
        }
        vec!["PREROUTING", "FORWARD", "POSTROUTING"]
    }

    #[allow(clippy::too_many_arguments)]
    async fn probe_service(
        &self,
        request: &TestRequest,
        index: usize,
        service: Service,
        src: &ResolvedEndpoint,
        dst: &ResolvedEndpoint,
        waypoints: &[String],
        before: &mut Vec<CounterSnapshot>,
    ) -> Result<ServiceVerdict, LabError> {
        let service_start = Instant::now();

        let dscp_key = format!("{}:{index}", request.run_id);
        let Some(dscp) = self.registry.allocate_dscp(&dscp_key, &request.username)? else {
            log::warn!("[tester] {}: DSCP pool exhausted", request.run_id);
            return Ok(ServiceVerdict {
                port: service.port,
                proto: service.proto,
                reachable: false,
                waypoint_results: Vec::new(),
                final_decision: Decision::Unknown,
                timing_ms: service_start.elapsed().as_millis() as u64,
                reason: Some("DscpExhausted".to_string()),
            });
        };

        let spec = ProbeSpec {
            src: request.source_ip,
            src_port: request.source_port,
            dst: request.dest_ip,
            dst_port: service.port,
            proto: service.proto,
            dscp,
        };
        let namespace = src.namespace.clone();
        tokio::task::spawn_blocking(move || probe::send_probe(&namespace, &spec)).await??;

        // let the packet settle before resampling
        tokio::time::sleep(COUNTER_GRACE).await;
        let after = self.snapshot_waypoints(waypoints).await?;

        let mut waypoint_results = Vec::new();
        for (i, waypoint) in waypoints.iter().enumerate() {
            let deltas = diff(&before[i], &after[i]);
            let chains = Self::chains_at(waypoint, i == 0, i == waypoints.len() - 1, src, dst);
            waypoint_results.push(classify_waypoint(waypoint, &deltas, &chains));
        }
        // counters only move forward; the fresh sample is the next service's baseline
        *before = after;

        let blocking = waypoint_results
            .iter()
            .find(|w| matches!(w.decision, Decision::Drop | Decision::Reject));
        let (reachable, final_decision) = match blocking {
            Some(w) => (false, w.decision),
            None => {
                let delivered = waypoint_results
                    .last()
                    .map(|w| w.decision == Decision::Accept)
                    .unwrap_or(false);
                if delivered {
                    (true, Decision::Accept)
                } else {
                    (false, Decision::Unknown)
                }
            }
        };

        log::debug!(
            "[tester] {}: {} -> reachable={} ({:?})",
            request.run_id,
            service,
            reachable,
            final_decision
        );
        Ok(ServiceVerdict {
            port: service.port,
            proto: service.proto,
            reachable,
            waypoint_results,
            final_decision,
            timing_ms: service_start.elapsed().as_millis() as u64,
            reason: None,
        })
    }

    /// Undo everything a test run acquired. Best-effort: failures are logged, never raised, so
    /// cleanup cannot mask the test outcome.
    async fn test_cleanup(&self, request: &TestRequest, cleanup: &CleanupState) {
        if let Err(e) = self.registry.release_dscp_run(&request.run_id) {
            log::warn!("[tester] {}: cannot release DSCP values: {e}", request.run_id);
        }
        for host in &cleanup.transient_hosts {
            match self.registry.release_host_lease(host, &request.run_id) {
                Ok(0) => {
                    if let Err(e) = self.remove_host(host).await {
                        log::warn!("[tester] {}: cannot remove {host}: {e}", request.run_id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[tester] {}: cannot release lease on {host}: {e}", request.run_id)
                }
            }
        }
        if let Err(e) = self.registry.release_neighbor_leases(&request.run_id) {
            log::warn!(
                "[tester] {}: cannot release neighbor leases: {e}",
                request.run_id
            );
        }
    }
}
