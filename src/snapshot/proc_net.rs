#[cfg(target_os = "linux")]
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
#[cfg(target_os = "linux")]
use std::time::SystemTime;

#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

#[cfg(target_os = "linux")]
use crate::flow::Protocol;
use crate::flow::{ConnectionObservation, SocketState};

use super::SnapshotSource;

/// One parsed row of a `/proc/net/{tcp,udp}` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: SocketState,
    pub inode: u64,
}

/// Snapshot source backed by the kernel's `/proc/net` tables.
///
/// Socket rows carry an inode, not an owning pid; ownership comes from a
/// scan of `/proc/<pid>/fd` symlinks rebuilt once per poll. Sockets whose
/// inode maps to no scanned pid are reported with pid 0 and end up
/// unattributed downstream.
pub struct ProcNetSource;

impl ProcNetSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcNetSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for ProcNetSource {
    fn name(&self) -> &str {
        "proc_net"
    }

    #[cfg(target_os = "linux")]
    fn poll(&self) -> Vec<ConnectionObservation> {
        let now = SystemTime::now();
        let inode_owners = scan_socket_inodes();

        let mut observations = Vec::with_capacity(256);

        for (path, protocol, v6) in [
            ("/proc/net/tcp", Protocol::Tcp, false),
            ("/proc/net/tcp6", Protocol::Tcp, true),
            ("/proc/net/udp", Protocol::Udp, false),
            ("/proc/net/udp6", Protocol::Udp, true),
        ] {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    // tcp6/udp6 are absent on v4-only kernels; stay quiet there.
                    if !v6 {
                        warn!(path, error = %e, "flow table read failed");
                    }
                    continue;
                }
            };

            for line in content.lines().skip(1) {
                let entry = match parse_net_line(line, v6) {
                    Some(e) => e,
                    None => {
                        debug!(path, line, "unparseable flow table line");
                        continue;
                    }
                };

                let pid = inode_owners.get(&entry.inode).copied().unwrap_or(0);

                observations.push(ConnectionObservation {
                    local: entry.local,
                    remote: entry.remote,
                    protocol,
                    state: entry.state,
                    pid,
                    counters: None,
                    observed_at: now,
                });
            }
        }

        observations
    }

    #[cfg(not(target_os = "linux"))]
    fn poll(&self) -> Vec<ConnectionObservation> {
        warn!("flow table enumeration is only supported on Linux");
        Vec::new()
    }
}

/// Parses one socket row: `sl local rem st ... uid timeout inode ...`.
pub fn parse_net_line(line: &str, v6: bool) -> Option<SockEntry> {
    let mut fields = line.split_whitespace();

    let _sl = fields.next()?;
    let local = parse_endpoint(fields.next()?, v6)?;
    let remote = parse_endpoint(fields.next()?, v6)?;
    let state_raw = u8::from_str_radix(fields.next()?, 16).ok()?;
    let state = SocketState::from_u8(state_raw).unwrap_or(SocketState::Unknown);

    // Skip tx:rx queues, tr:tm->when, retrnsmt, uid, timeout.
    let inode: u64 = fields.nth(5)?.parse().ok()?;

    Some(SockEntry {
        local,
        remote,
        state,
        inode,
    })
}

/// Parses a hex `ADDR:PORT` endpoint.
pub fn parse_endpoint(s: &str, v6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = if v6 {
        IpAddr::V6(parse_hex_ipv6(addr_hex)?)
    } else {
        IpAddr::V4(parse_hex_ipv4(addr_hex)?)
    };

    Some(SocketAddr::new(ip, port))
}

/// Decodes the kernel's little-endian IPv4 hex form (`0100007F` = 127.0.0.1).
pub fn parse_hex_ipv4(s: &str) -> Option<Ipv4Addr> {
    if s.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(s, 16).ok()?;
    Some(Ipv4Addr::from(raw.swap_bytes().to_be_bytes()))
}

/// Decodes the kernel's IPv6 hex form: four 32-bit groups, each byte-swapped.
pub fn parse_hex_ipv6(s: &str) -> Option<Ipv6Addr> {
    if s.len() != 32 {
        return None;
    }

    let mut bytes = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(8).enumerate() {
        let group = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
        bytes[i * 4..i * 4 + 4].copy_from_slice(&group.swap_bytes().to_be_bytes());
    }

    Some(Ipv6Addr::from(bytes))
}

/// Builds the socket-inode to owning-pid map by scanning `/proc/<pid>/fd`.
///
/// Unreadable processes (exited mid-scan, or lacking permission) are skipped;
/// their sockets simply stay unowned for this poll.
#[cfg(target_os = "linux")]
fn scan_socket_inodes() -> HashMap<u64, u32> {
    let mut owners = HashMap::with_capacity(512);

    let entries = match std::fs::read_dir("/proc") {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "reading /proc failed");
            return owners;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let fd_dir = format!("/proc/{pid}/fd");
        let fds = match std::fs::read_dir(&fd_dir) {
            Ok(f) => f,
            Err(_) => continue,
        };

        for fd in fds.flatten() {
            let target = match std::fs::read_link(fd.path()) {
                Ok(t) => t,
                Err(_) => continue,
            };

            if let Some(inode) = socket_inode(&target.to_string_lossy()) {
                owners.entry(inode).or_insert(pid);
            }
        }
    }

    owners
}

/// Extracts the inode from a `socket:[12345]` fd link target.
fn socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
