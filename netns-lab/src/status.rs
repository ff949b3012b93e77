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

//! The status collector: concurrent queries into the live namespaces, with per-function
//! formatters and the shared cache in front.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tsim_registry::{CollectionConfig, FormattingConfig};

use crate::{
    cache::StatusCache,
    cmd::CommandRunner,
    ifname::NameMap,
    setup::{BridgeEntry, RouterEntry},
    Lab, LabError, BRIDGES_FILE, IFNAME_MAP_FILE, ROUTERS_FILE,
};

/// Which piece of state to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFunction {
    Interfaces,
    Routes,
    Rules,
    Iptables,
    Ipsets,
    /// One line per namespace with interface, route, and rule counts.
    Summary,
    /// The full structured document with all sections.
    All,
}

impl StatusFunction {
    /// The function name, used as a cache key component.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusFunction::Interfaces => "interfaces",
            StatusFunction::Routes => "routes",
            StatusFunction::Rules => "rules",
            StatusFunction::Iptables => "iptables",
            StatusFunction::Ipsets => "ipsets",
            StatusFunction::Summary => "summary",
            StatusFunction::All => "all",
        }
    }
}

impl fmt::Display for StatusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interfaces" => Ok(Self::Interfaces),
            "routes" => Ok(Self::Routes),
            "rules" => Ok(Self::Rules),
            "iptables" => Ok(Self::Iptables),
            "ipsets" => Ok(Self::Ipsets),
            "summary" => Ok(Self::Summary),
            "all" => Ok(Self::All),
            other => Err(format!("unknown status function `{other}`")),
        }
    }
}

/// Collected state of a single namespace. Sections appear in this (deterministic) order in all
/// JSON output; absent sections are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceStatus {
    /// Namespace name.
    pub namespace: String,
    /// `ip --json addr show`, with device names translated back to their declared names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<serde_json::Value>,
    /// `ip --json route show`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<serde_json::Value>,
    /// `ip --json rule show`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<serde_json::Value>,
    /// `iptables-save` output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iptables: Option<String>,
    /// `ipset save` output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipsets: Option<String>,
}

impl NamespaceStatus {
    fn count(section: &Option<serde_json::Value>) -> usize {
        section
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    }

    /// The one-line summary of this namespace.
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} interfaces, {} routes, {} rules",
            self.namespace,
            Self::count(&self.interfaces),
            Self::count(&self.routes),
            Self::count(&self.rules),
        )
    }
}

/// The result of a status collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Collected state, per namespace, ordered by name.
    pub namespaces: BTreeMap<String, NamespaceStatus>,
    /// Namespaces that could not be queried, with the failure reason. A failed namespace never
    /// fails the whole report.
    pub failures: BTreeMap<String, String>,
}

impl StatusReport {
    /// Render the summary form: one line per namespace, failures at the end.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for status in self.namespaces.values() {
            out.push_str(&status.summary_line());
            out.push('\n');
        }
        for (ns, reason) in &self.failures {
            out.push_str(&format!("{ns}: FAILED ({reason})\n"));
        }
        out
    }

    /// Render the full report as JSON with the configured indentation.
    pub fn to_json(&self, indent: usize) -> String {
        if indent == 0 {
            serde_json::to_string(self).unwrap_or_default()
        } else {
            // serde_json always indents with two spaces in pretty mode; re-indent if needed
            let pretty = serde_json::to_string_pretty(self).unwrap_or_default();
            if indent == 2 {
                pretty
            } else {
                pretty
                    .lines()
                    .map(|line| {
                        let depth = line.len() - line.trim_start().len();
                        format!("{}{}", " ".repeat(depth / 2 * indent), line.trim_start())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }
}

/// Simple `*` wildcard matching for namespace patterns.
pub(crate) fn pattern_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == name {
        return true;
    }
    let mut remainder = name;
    let mut parts = pattern.split('*').peekable();
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let mut first = true;
    while let Some(part) = parts.next() {
        if part.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(part) {
            Some(pos) => {
                if first && anchored_start && pos != 0 {
                    return false;
                }
                if parts.peek().is_none() && anchored_end {
                    return remainder.ends_with(part);
                }
                remainder = &remainder[pos + part.len()..];
            }
            None => return false,
        }
        first = false;
    }
    true
}

/// Rewrite the `ifname` fields of an `ip --json addr show` document back to declared interface
/// names, keeping the generated name in a `device` field.
fn translate_interfaces(namespace: &str, names: &NameMap, value: &mut serde_json::Value) {
    let Some(entries) = value.as_array_mut() else {
        return;
    };
    for entry in entries {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };
        let Some(device) = obj.get("ifname").and_then(|v| v.as_str()) else {
            continue;
        };
        let device = device.split('@').next().unwrap_or(device).to_string();
        if let Some(declared) = names.translate(namespace, &device) {
            obj.insert("device".to_string(), serde_json::Value::String(device));
            obj.insert(
                "ifname".to_string(),
                serde_json::Value::String(declared.to_string()),
            );
        }
    }
}

/// Collect one namespace. Free function so it can run in a spawned task.
async fn collect_namespace(
    runner: CommandRunner,
    namespace: String,
    function: StatusFunction,
    collection: CollectionConfig,
    formatting: FormattingConfig,
    names: Arc<NameMap>,
) -> Result<NamespaceStatus, String> {
    let mut status = NamespaceStatus {
        namespace: namespace.clone(),
        ..Default::default()
    };
    let ns = Some(namespace.as_str());
    // the summary only needs the countable sections
    let want = |f: StatusFunction| match function {
        StatusFunction::All => true,
        StatusFunction::Summary => matches!(
            f,
            StatusFunction::Interfaces | StatusFunction::Routes | StatusFunction::Rules
        ),
        _ => function == f,
    };

    if want(StatusFunction::Interfaces) && collection.interfaces {
        let out = runner
            .run(ns, "ip", &["--json", "addr", "show"])
            .await
            .map_err(|e| e.to_string())?;
        let mut value: serde_json::Value =
            serde_json::from_str(&out).map_err(|e| e.to_string())?;
        if formatting.translate_interface_names {
            translate_interfaces(&namespace, &names, &mut value);
        }
        status.interfaces = Some(value);
    }
    if want(StatusFunction::Routes) && collection.routes {
        let out = runner
            .run(ns, "ip", &["--json", "route", "show"])
            .await
            .map_err(|e| e.to_string())?;
        status.routes = Some(serde_json::from_str(&out).map_err(|e| e.to_string())?);
    }
    if want(StatusFunction::Rules) && collection.rules {
        let out = runner
            .run(ns, "ip", &["--json", "rule", "show"])
            .await
            .map_err(|e| e.to_string())?;
        status.rules = Some(serde_json::from_str(&out).map_err(|e| e.to_string())?);
    }
    if want(StatusFunction::Iptables) && collection.iptables {
        let out = runner
            .run(ns, "iptables-save", &[])
            .await
            .map_err(|e| e.to_string())?;
        status.iptables = Some(out);
    }
    if want(StatusFunction::Ipsets) && collection.ipsets {
        let out = runner
            .run(ns, "ipset", &["save"])
            .await
            .map_err(|e| e.to_string())?;
        status.ipsets = Some(out);
    }
    Ok(status)
}

impl<'n> Lab<'n> {
    /// All namespaces this system currently manages: routers, bridges, and hosts.
    pub fn managed_namespaces(&self) -> Result<Vec<String>, LabError> {
        let routers: BTreeMap<String, RouterEntry> = self.registry.read(ROUTERS_FILE)?;
        let bridges: BTreeMap<String, BridgeEntry> = self.registry.read(BRIDGES_FILE)?;
        let hosts = self.registry.hosts()?;
        Ok(routers
            .into_keys()
            .chain(bridges.into_keys())
            .chain(hosts.into_keys())
            .collect())
    }

    /// Query live namespaces. Namespaces are queried concurrently with a bounded worker pool;
    /// per-namespace failures are recorded in the report instead of failing the collection.
    /// Fresh results are memoized in the shared cache.
    pub async fn status(
        &self,
        function: StatusFunction,
        pattern: Option<&str>,
    ) -> Result<StatusReport, LabError> {
        let cache = StatusCache::new(self.config);
        let names: Arc<NameMap> = Arc::new(self.registry.read(IFNAME_MAP_FILE)?);
        let mut namespaces = self.managed_namespaces()?;
        if let Some(pattern) = pattern {
            namespaces.retain(|ns| pattern_match(pattern, ns));
        }
        namespaces.sort();

        let workers = if self.config.parallelization.enabled {
            self.config.parallelization.max_workers.max(1)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut report = StatusReport::default();
        let mut tasks = Vec::new();
        for namespace in namespaces {
            if let Some(payload) = cache.get(&namespace, function.as_str()) {
                match serde_json::from_value::<NamespaceStatus>(payload) {
                    Ok(status) => {
                        report.namespaces.insert(namespace, status);
                        continue;
                    }
                    Err(e) => log::debug!("[status] discarding bad cache entry: {e}"),
                }
            }
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let names = names.clone();
            let collection = self.config.collection;
            let formatting = self.config.formatting;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                let result = collect_namespace(
                    runner,
                    namespace.clone(),
                    function,
                    collection,
                    formatting,
                    names,
                )
                .await;
                (namespace, result)
            }));
        }

        for task in tasks {
            let (namespace, result) = task.await?;
            match result {
                Ok(status) => {
                    if let Ok(payload) = serde_json::to_value(&status) {
                        cache.put(&namespace, function.as_str(), payload);
                    }
                    report.namespaces.insert(namespace, status);
                }
                Err(reason) => {
                    log::warn!("[status] {namespace}: {reason}");
                    report.failures.insert(namespace, reason);
                }
            }
        }
        Ok(report)
    }

    /// Drop cached status entries, optionally only those matching a namespace pattern.
    pub fn invalidate_status_cache(&self, pattern: Option<&str>) -> usize {
        StatusCache::new(self.config).invalidate(pattern)
    }
}
