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

//! Probe emission.
//!
//! A probe is a single packet: a TCP SYN (a non-blocking `connect` whose handshake is never
//! completed) or one UDP datagram. The emitting socket carries the allocated DSCP value in its
//! TOS byte. To send from inside a namespace, a dedicated thread is spawned that enters the
//! namespace with `setns(CLONE_NEWNET)`; the namespace switch stays confined to that thread.

use std::{fs::File, net::Ipv4Addr, os::fd::AsRawFd, time::Duration};

use nix::{
    sched::{setns, CloneFlags},
    sys::socket::{
        bind, connect, sendto, setsockopt, socket, sockopt, AddressFamily, MsgFlags, SockFlag,
        SockType, SockaddrIn,
    },
};
use rand::Rng;
use thiserror::Error;

use super::Proto;

/// Payload of UDP probe datagrams.
const UDP_PAYLOAD: &[u8] = b"tsim-probe";

/// How long the probe thread lingers after a TCP connect, so the SYN leaves the namespace
/// before the socket is torn down.
const SYN_LINGER: Duration = Duration::from_millis(50);

/// Everything needed to emit one probe packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Source address, already present in the probing namespace.
    pub src: Ipv4Addr,
    /// Source port; an ephemeral port is picked if absent.
    pub src_port: Option<u16>,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Destination port.
    pub dst_port: u16,
    /// Protocol of the probe packet.
    pub proto: Proto,
    /// DSCP value identifying this probe; written as `dscp << 2` into the TOS byte.
    pub dscp: u8,
}

/// Errors thrown while emitting a probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The namespace file could not be opened or entered.
    #[error("Cannot enter namespace {0}: {1}")]
    Netns(String, String),
    /// A socket operation failed.
    #[error("Socket operation failed: {0}")]
    Socket(nix::errno::Errno),
}

/// Emit a single probe from within the given namespace. Blocking; run it on a blocking task.
///
/// The namespace switch happens on a freshly spawned thread, so the caller's thread (and the
/// async runtime it belongs to) never changes namespaces.
pub fn send_probe(netns: &str, spec: &ProbeSpec) -> Result<(), ProbeError> {
    let ns_path = format!("/var/run/netns/{netns}");
    let ns_file = File::open(&ns_path)
        .map_err(|e| ProbeError::Netns(netns.to_string(), e.to_string()))?;
    let netns = netns.to_string();
    let spec = spec.clone();

    let handle = std::thread::spawn(move || -> Result<(), ProbeError> {
        setns(&ns_file, CloneFlags::CLONE_NEWNET)
            .map_err(|e| ProbeError::Netns(netns.clone(), e.to_string()))?;
        emit(&spec)
    });
    handle
        .join()
        .map_err(|_| ProbeError::Netns("probe thread panicked".to_string(), String::new()))?
}

/// Create the socket, tag it, and emit the packet. Runs on the namespace-entered thread.
fn emit(spec: &ProbeSpec) -> Result<(), ProbeError> {
    let sock_type = match spec.proto {
        Proto::Tcp => SockType::Stream,
        Proto::Udp => SockType::Datagram,
    };
    let sock = socket(
        AddressFamily::Inet,
        sock_type,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(ProbeError::Socket)?;

    let tos = (spec.dscp as i32) << 2;
    setsockopt(&sock, sockopt::IpTos, &tos).map_err(ProbeError::Socket)?;

    let src_port = spec
        .src_port
        .unwrap_or_else(|| rand::thread_rng().gen_range(32768..61000));
    let [a, b, c, d] = spec.src.octets();
    bind(sock.as_raw_fd(), &SockaddrIn::new(a, b, c, d, src_port)).map_err(ProbeError::Socket)?;

    let [a, b, c, d] = spec.dst.octets();
    let dst = SockaddrIn::new(a, b, c, d, spec.dst_port);
    match spec.proto {
        Proto::Tcp => {
            // non-blocking connect: the SYN goes out, EINPROGRESS is the expected outcome
            match connect(sock.as_raw_fd(), &dst) {
                Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {}
                Err(e) => return Err(ProbeError::Socket(e)),
            }
            std::thread::sleep(SYN_LINGER);
        }
        Proto::Udp => {
            sendto(sock.as_raw_fd(), UDP_PAYLOAD, &dst, MsgFlags::empty())
                .map_err(ProbeError::Socket)?;
        }
    }
    log::trace!(
        "[probe] sent {} {}:{} -> {}:{} dscp {}",
        spec.proto,
        spec.src,
        src_port,
        spec.dst,
        spec.dst_port,
        spec.dscp
    );
    Ok(())
}
