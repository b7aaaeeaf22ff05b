pub mod attribution;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Transport protocol of an observed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
    Icmp = 2,
}

impl Protocol {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Tcp),
            1 => Some(Self::Udp),
            2 => Some(Self::Icmp),
            _ => None,
        }
    }

    /// Return all protocols in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::Tcp, Self::Udp, Self::Icmp]
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket state of an observed flow.
///
/// Numeric values match the kernel's TCP state encoding as exposed in
/// `/proc/net/tcp` (hex `st` column). UDP sockets report `Close` when
/// unconnected and `Established` when connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketState {
    Unknown = 0,
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait1 = 4,
    FinWait2 = 5,
    TimeWait = 6,
    Close = 7,
    CloseWait = 8,
    LastAck = 9,
    Listen = 10,
    Closing = 11,
}

impl SocketState {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Established => "established",
            Self::SynSent => "syn_sent",
            Self::SynRecv => "syn_recv",
            Self::FinWait1 => "fin_wait1",
            Self::FinWait2 => "fin_wait2",
            Self::TimeWait => "time_wait",
            Self::Close => "close",
            Self::CloseWait => "close_wait",
            Self::LastAck => "last_ack",
            Self::Listen => "listen",
            Self::Closing => "closing",
        }
    }

    /// Convert from the kernel state value as found in `/proc/net/*`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Established),
            2 => Some(Self::SynSent),
            3 => Some(Self::SynRecv),
            4 => Some(Self::FinWait1),
            5 => Some(Self::FinWait2),
            6 => Some(Self::TimeWait),
            7 => Some(Self::Close),
            8 => Some(Self::CloseWait),
            9 => Some(Self::LastAck),
            10 => Some(Self::Listen),
            11 => Some(Self::Closing),
            _ => None,
        }
    }

    /// Whether the socket can still carry payload traffic.
    pub fn carries_traffic(self) -> bool {
        matches!(
            self,
            Self::Established | Self::CloseWait | Self::FinWait1 | Self::FinWait2
        )
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one tracked flow across polls.
///
/// The owning pid is part of the key so a recycled endpoint pair under a new
/// process is tracked as a distinct flow. Ownership attribution never uses
/// the key alone; see `attribution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub pid: u32,
    pub protocol: Protocol,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}->{}@{}",
            self.protocol, self.local, self.remote, self.pid
        )
    }
}

/// Cumulative byte counters as reported by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub sent: u64,
    pub received: u64,
}

/// A single poll's view of one flow.
///
/// `counters` is `None` when the source cannot report per-flow byte counts
/// (the plain `/proc/net` table does not carry them); byte accounting then
/// relies entirely on the trace source.
#[derive(Debug, Clone)]
pub struct ConnectionObservation {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
    pub state: SocketState,
    pub pid: u32,
    pub counters: Option<FlowCounters>,
    pub observed_at: SystemTime,
}

impl ConnectionObservation {
    /// The tracking key for this observation.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            local: self.local,
            remote: self.remote,
            pid: self.pid,
            protocol: self.protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_protocol_roundtrip() {
        for p in Protocol::all() {
            assert_eq!(Protocol::from_u8(*p as u8), Some(*p));
        }
        assert_eq!(Protocol::from_u8(99), None);
    }

    #[test]
    fn test_socket_state_from_proc_values() {
        assert_eq!(SocketState::from_u8(0x01), Some(SocketState::Established));
        assert_eq!(SocketState::from_u8(0x06), Some(SocketState::TimeWait));
        assert_eq!(SocketState::from_u8(0x0A), Some(SocketState::Listen));
        assert_eq!(SocketState::from_u8(0x0C), None);
    }

    #[test]
    fn test_socket_state_carries_traffic() {
        assert!(SocketState::Established.carries_traffic());
        assert!(SocketState::CloseWait.carries_traffic());
        assert!(!SocketState::Listen.carries_traffic());
        assert!(!SocketState::TimeWait.carries_traffic());
    }

    #[test]
    fn test_connection_key_as_map_key() {
        let mut map: HashMap<ConnectionKey, u32> = HashMap::new();
        let key = ConnectionKey {
            local: addr(50000),
            remote: addr(443),
            pid: 1234,
            protocol: Protocol::Tcp,
        };
        map.insert(key, 42);
        assert_eq!(map.get(&key), Some(&42));

        // Same endpoints under a different pid is a different flow.
        let other = ConnectionKey { pid: 1235, ..key };
        assert!(!map.contains_key(&other));
    }

    #[test]
    fn test_observation_key_fields() {
        let obs = ConnectionObservation {
            local: addr(50000),
            remote: addr(443),
            protocol: Protocol::Tcp,
            state: SocketState::Established,
            pid: 77,
            counters: Some(FlowCounters {
                sent: 10,
                received: 20,
            }),
            observed_at: SystemTime::UNIX_EPOCH,
        };
        let key = obs.key();
        assert_eq!(key.pid, 77);
        assert_eq!(key.local, addr(50000));
        assert_eq!(key.protocol, Protocol::Tcp);
    }
}
