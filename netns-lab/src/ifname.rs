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

//! Deterministic device naming.
//!
//! Kernel device names are limited to 15 characters, while declared interface names are only
//! unique per router. Every created device therefore gets a name derived from a stable FNV-1a
//! hash over its identity, with a two-letter prefix encoding its role:
//!
//! | prefix | role |
//! |--------|------|
//! | `ve`   | one end of a router-to-router veth pair |
//! | `va`   | access-subnet bridge device inside a router namespace |
//! | `vd`   | dummy device carrying addresses outside any subnet |
//! | `vp`   | router side of an attachment to a bridge namespace |
//! | `vq`   | bridge-namespace side of such an attachment |
//! | `vh`   | router side of a host attachment |
//!
//! The [`NameMap`] records the mapping back to the declared names and is persisted in the
//! registry at setup time, so that any process can translate status output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 64-bit FNV-1a. Stable across runs and platforms.
pub fn fnv1a64(input: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn hashed(prefix: &str, identity: &str) -> String {
    // 10 hex chars keep the name at 12 characters, comfortably below the kernel limit of 15
    format!("{prefix}{:010x}", fnv1a64(identity.as_bytes()) & 0xff_ffff_ffff)
}

/// Device name for one end of a router-to-router link. The identity includes both endpoints,
/// so the two ends of a pair always get distinct names.
pub fn link_end(router: &str, iface: &str, peer_router: &str, peer_iface: &str) -> String {
    hashed("ve", &format!("{router}|{iface}|{peer_router}|{peer_iface}"))
}

/// Device name for the in-namespace bridge fronting an access subnet.
pub fn access_bridge(router: &str, iface: &str) -> String {
    hashed("va", &format!("{router}|{iface}"))
}

/// Device name for a dummy device carrying addresses that belong to no subnet.
pub fn dummy_device(router: &str, iface: &str) -> String {
    hashed("vd", &format!("{router}|{iface}"))
}

/// Device names for the attachment of a router interface to a bridge namespace: the router
/// side and the bridge side.
pub fn bridge_attachment(router: &str, iface: &str) -> (String, String) {
    let identity = format!("{router}|{iface}");
    (hashed("vp", &identity), hashed("vq", &identity))
}

/// Device names for a host attachment: the router side and the (temporary) host side. Inside
/// the host namespace the device is renamed to `eth0`.
pub fn host_attachment(host: &str) -> (String, String) {
    (hashed("vh", host), hashed("vg", host))
}

/// Namespace name for a bridged subnet, e.g. `br-10.5.0.0-24`.
pub fn bridge_namespace(subnet: ipnet::Ipv4Net) -> String {
    format!("br-{}-{}", subnet.addr(), subnet.prefix_len())
}

/// A declared interface identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredIface {
    /// The router declaring the interface.
    pub router: String,
    /// The declared interface name.
    pub iface: String,
}

/// The translation table from generated device names back to declared interface names. Device
/// names embed the router identity in their hash and are therefore globally unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMap {
    /// Generated device name to declared identity.
    pub devices: BTreeMap<String, DeclaredIface>,
}

impl NameMap {
    /// Record a device name.
    pub fn insert(&mut self, device: impl Into<String>, router: &str, iface: &str) {
        self.devices.insert(
            device.into(),
            DeclaredIface {
                router: router.to_string(),
                iface: iface.to_string(),
            },
        );
    }

    /// Translate a device name back to the declared interface name, if it belongs to the given
    /// router.
    pub fn translate(&self, router: &str, device: &str) -> Option<&str> {
        self.devices
            .get(device)
            .filter(|d| d.router == router)
            .map(|d| d.iface.as_str())
    }

    /// The generated device name of a declared interface, if one was recorded.
    pub fn device_of(&self, router: &str, iface: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|(_, d)| d.router == router && d.iface == iface)
            .map(|(device, _)| device.as_str())
    }
}
