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

use pretty_assertions::assert_eq;
use serde_json::json;
use tsim_registry::Config;

use crate::StatusCache;

fn cache_config(dir: &tempfile::TempDir, ttl: u64, max_mb: u64) -> Config {
    let mut config = Config::default();
    config.cache.base_path = Some(dir.path().join("cache"));
    config.cache.expiration_seconds = ttl;
    config.cache.max_size_mb = max_mb;
    config
}

#[test]
fn miss_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StatusCache::new(&cache_config(&dir, 60, 100));

    assert_eq!(cache.get("r1", "interfaces"), None);
    cache.put("r1", "interfaces", json!({"count": 2}));

    // two consecutive reads return the identical payload
    let first = cache.get("r1", "interfaces").unwrap();
    let second = cache.get("r1", "interfaces").unwrap();
    assert_eq!(first, second);
    assert_eq!(first, json!({"count": 2}));

    // a different function is a different key
    assert_eq!(cache.get("r1", "routes"), None);
}

#[test]
fn disabled_cache_never_hits() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cache_config(&dir, 60, 100);
    config.cache.enabled = false;
    let cache = StatusCache::new(&config);

    cache.put("r1", "interfaces", json!(1));
    assert_eq!(cache.get("r1", "interfaces"), None);
}

#[test]
fn stale_entries_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StatusCache::new(&cache_config(&dir, 0, 100));
    cache.put("r1", "interfaces", json!(1));
    // TTL of zero: everything in the past is stale
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(cache.get("r1", "interfaces"), None);
}

#[test]
fn invalidate_by_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StatusCache::new(&cache_config(&dir, 60, 100));
    cache.put("r1", "interfaces", json!(1));
    cache.put("r2", "interfaces", json!(2));
    cache.put("host-a", "routes", json!(3));

    assert_eq!(cache.invalidate(Some("r*")), 2);
    assert_eq!(cache.get("r1", "interfaces"), None);
    assert!(cache.get("host-a", "routes").is_some());

    assert_eq!(cache.invalidate(None), 1);
    assert_eq!(cache.get("host-a", "routes"), None);
}

#[test]
fn size_cap_evicts_oldest() {
    let dir = tempfile::tempdir().unwrap();
    // cap of one megabyte
    let cache = StatusCache::new(&cache_config(&dir, 60, 1));

    let big = json!("x".repeat(700 * 1024));
    cache.put("old", "all", big.clone());
    std::thread::sleep(std::time::Duration::from_millis(50));
    cache.put("new", "all", big);

    // together both entries exceed the cap, so the older one must be gone
    assert_eq!(cache.get("old", "all"), None);
    assert!(cache.get("new", "all").is_some());
}
