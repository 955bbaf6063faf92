//! Flow identity shared by the TCP and UDP paths.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a data fragment relative to the conversation's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    /// Return a string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Directed flow: the sender and receiver of one half of a conversation.
///
/// Displays as `src->dst`, e.g. `10.0.0.1:51000->10.0.0.2:80`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowIdent {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowIdent {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// The same flow seen from the other side.
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Order-independent lookup key for this flow.
    pub fn key(&self, protocol: TransportProtocol) -> FlowKey {
        FlowKey::new(self.src, self.dst, protocol)
    }

    /// Filesystem-safe rendering used for output file names.
    pub fn file_name(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| match c {
                ':' | '[' | ']' => '_',
                '>' => '-',
                other => other,
            })
            .collect()
    }
}

impl fmt::Display for FlowIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Normalized flow key (lower endpoint first) so both directions of a
/// flow resolve to the same entry.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct FlowKey {
    a: SocketAddr,
    b: SocketAddr,
    protocol: u8,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr, protocol: TransportProtocol) -> Self {
        let protocol = match protocol {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
        };
        if (src.ip(), src.port()) <= (dst.ip(), dst.port()) {
            Self { a: src, b: dst, protocol }
        } else {
            Self { a: dst, b: src, protocol }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, d)), port)
    }

    // Test 1: Both directions share one key
    #[test]
    fn test_key_is_order_independent() {
        let flow = FlowIdent::new(addr(1, 51000), addr(2, 80));
        assert_eq!(
            flow.key(TransportProtocol::Tcp),
            flow.reverse().key(TransportProtocol::Tcp)
        );
    }

    // Test 2: Protocol separates keys
    #[test]
    fn test_key_includes_protocol() {
        let flow = FlowIdent::new(addr(1, 53), addr(2, 53));
        assert_ne!(
            flow.key(TransportProtocol::Tcp),
            flow.key(TransportProtocol::Udp)
        );
    }

    // Test 3: Display and reversal
    #[test]
    fn test_display_and_reverse() {
        let flow = FlowIdent::new(addr(1, 51000), addr(2, 80));
        assert_eq!(flow.to_string(), "10.0.0.1:51000->10.0.0.2:80");
        assert_eq!(flow.reverse().to_string(), "10.0.0.2:80->10.0.0.1:51000");
        assert_eq!(flow.reverse().reverse(), flow);
    }

    #[test]
    fn test_file_name_is_safe() {
        let flow = FlowIdent::new(addr(1, 51000), addr(2, 80));
        let name = flow.file_name();
        assert!(!name.contains(':'));
        assert!(!name.contains('>'));
    }
}
