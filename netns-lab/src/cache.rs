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

//! The status cache: a directory of JSON files in shared memory, keyed by
//! `(namespace, function)`, with TTL expiry and a size cap that evicts the oldest entries.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tsim_registry::{unix_now, Config};

use crate::status::pattern_match;

/// A single cache entry on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    timestamp: f64,
    namespace: String,
    function: String,
    payload: serde_json::Value,
}

/// TTL- and size-bounded cache for collected namespace status.
#[derive(Debug, Clone)]
pub struct StatusCache {
    enabled: bool,
    base: PathBuf,
    ttl: Duration,
    max_size: u64,
}

impl StatusCache {
    /// Create the cache as configured. The backing directory is created lazily on the first
    /// write.
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.cache.enabled,
            base: config.cache_path(),
            ttl: Duration::from_secs(config.cache.expiration_seconds),
            max_size: config.cache.max_size_mb * 1024 * 1024,
        }
    }

    fn entry_path(&self, namespace: &str, function: &str) -> PathBuf {
        self.base.join(format!("{namespace}__{function}.json"))
    }

    /// Look up an entry. Misses on: cache disabled, absent entry, or an entry older than the
    /// TTL.
    pub fn get(&self, namespace: &str, function: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        let content = std::fs::read_to_string(self.entry_path(namespace, function)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&content).ok()?;
        if unix_now() - entry.timestamp > self.ttl.as_secs_f64() {
            log::trace!("[cache] stale entry for {namespace}/{function}");
            return None;
        }
        log::trace!("[cache] hit for {namespace}/{function}");
        Some(entry.payload)
    }

    /// Store an entry, then enforce the size cap by evicting the oldest entries.
    pub fn put(&self, namespace: &str, function: &str, payload: serde_json::Value) {
        if !self.enabled {
            return;
        }
        let entry = CacheEntry {
            timestamp: unix_now(),
            namespace: namespace.to_string(),
            function: function.to_string(),
            payload,
        };
        if let Err(e) = std::fs::create_dir_all(&self.base) {
            log::warn!("[cache] cannot create {}: {e}", self.base.display());
            return;
        }
        let path = self.entry_path(namespace, function);
        match serde_json::to_string(&entry) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    log::warn!("[cache] cannot write {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("[cache] cannot serialize entry: {e}"),
        }
        self.evict();
    }

    /// Delete all entries whose namespace matches the pattern; without a pattern, everything.
    /// Returns the number of deleted entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.base) else {
            return 0;
        };
        let mut deleted = 0;
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            let Some((namespace, _)) = name.trim_end_matches(".json").split_once("__") else {
                continue;
            };
            if pattern.map_or(true, |p| pattern_match(p, namespace))
                && std::fs::remove_file(&path).is_ok()
            {
                deleted += 1;
            }
        }
        log::debug!("[cache] invalidated {deleted} entries");
        deleted
    }

    /// Evict the oldest entries until the total size is below the cap.
    fn evict(&self) {
        let Ok(entries) = std::fs::read_dir(&self.base) else {
            return;
        };
        let mut files: Vec<(PathBuf, u64, std::time::SystemTime)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some((e.path(), meta.len(), meta.modified().ok()?))
            })
            .collect();
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total <= self.max_size {
            return;
        }
        files.sort_by_key(|(_, _, modified)| *modified);
        for (path, size, _) in files {
            if total <= self.max_size {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                log::debug!("[cache] evicted {}", path.display());
                total = total.saturating_sub(size);
            }
        }
    }
}
