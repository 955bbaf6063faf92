//! Layer parsing for the dispatcher workers.
//!
//! Slices a [`RawPacket`] with etherparse, names every recognized layer for
//! the protocol histogram and extracts the transport payload handed to the
//! TCP reassembly engine or the UDP aggregator.

mod tcp;
mod udp;

use std::net::{IpAddr, SocketAddr};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::error::ProtocolError;
use crate::flow::FlowIdent;
use crate::pcap::{
    RawPacket, LINKTYPE_ETHERNET, LINKTYPE_IPV4, LINKTYPE_IPV6, LINKTYPE_RAW, LINKTYPE_RAW_BSD,
};

pub use tcp::{TcpFlags, TcpOptions, TcpSegment};
pub use udp::UdpDatagram;

/// Histogram key for packets whose top layer is not recognized.
pub const UNKNOWN_LAYER: &str = "Unknown";

/// Transport payload extracted from a packet.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    None,
}

/// Result of slicing one packet.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    /// Recognized layers, outermost first.
    pub layers: Vec<&'static str>,
    pub transport: Transport,
    /// The top layer could not be identified.
    pub unknown: bool,
}

/// Slice a packet and extract its transport payload.
///
/// With `verify_checksum` set, TCP segments carry a checksum verdict.
pub fn parse_packet(packet: &RawPacket, verify_checksum: bool) -> Result<ParsedPacket, ProtocolError> {
    let data = &packet.data[..];
    let sliced = match packet.link_type {
        LINKTYPE_ETHERNET => SlicedPacket::from_ethernet(data).map_err(|e| ProtocolError::Malformed {
            protocol: "Ethernet",
            reason: e.to_string(),
        })?,
        LINKTYPE_RAW | LINKTYPE_RAW_BSD | LINKTYPE_IPV4 | LINKTYPE_IPV6 => {
            SlicedPacket::from_ip(data).map_err(|e| ProtocolError::Malformed {
                protocol: "IP",
                reason: e.to_string(),
            })?
        }
        other => return Err(ProtocolError::UnsupportedLink(other)),
    };

    let mut layers = Vec::with_capacity(4);
    if packet.link_type == LINKTYPE_ETHERNET {
        layers.push("Ethernet");
    }

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            layers.push("IPv4");
            let header = ipv4.header();
            (
                IpAddr::V4(header.source_addr()),
                IpAddr::V4(header.destination_addr()),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            layers.push("IPv6");
            let header = ipv6.header();
            (
                IpAddr::V6(header.source_addr()),
                IpAddr::V6(header.destination_addr()),
            )
        }
        _ => {
            return Ok(ParsedPacket {
                layers,
                transport: Transport::None,
                unknown: true,
            })
        }
    };

    let mut unknown = false;
    let transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            layers.push("TCP");
            let flow = FlowIdent::new(
                SocketAddr::new(src_ip, tcp.source_port()),
                SocketAddr::new(dst_ip, tcp.destination_port()),
            );
            let checksum_valid = if verify_checksum {
                Some(checksum_matches(&sliced, tcp))
            } else {
                None
            };
            Transport::Tcp(TcpSegment {
                flow,
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                flags: tcp::flags_of(tcp),
                window: tcp.window_size(),
                options: tcp::options_of(tcp),
                checksum_valid,
                payload: packet.data.slice_ref(tcp.payload()),
                timestamp_us: packet.timestamp_us,
            })
        }
        Some(TransportSlice::Udp(udp)) => {
            layers.push("UDP");
            let flow = FlowIdent::new(
                SocketAddr::new(src_ip, udp.source_port()),
                SocketAddr::new(dst_ip, udp.destination_port()),
            );
            Transport::Udp(UdpDatagram {
                flow,
                payload: packet.data.slice_ref(udp.payload()),
                timestamp_us: packet.timestamp_us,
            })
        }
        Some(TransportSlice::Icmpv4(_)) => {
            layers.push("ICMPv4");
            Transport::None
        }
        Some(TransportSlice::Icmpv6(_)) => {
            layers.push("ICMPv6");
            Transport::None
        }
        // GRE, ESP, SCTP and the rest
        _ => {
            unknown = true;
            Transport::None
        }
    };

    Ok(ParsedPacket {
        layers,
        transport,
        unknown,
    })
}

fn checksum_matches(sliced: &SlicedPacket<'_>, tcp: &etherparse::TcpSlice<'_>) -> bool {
    let header = tcp.to_header();
    let computed = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            header.calc_checksum_ipv4(&ipv4.header().to_header(), tcp.payload())
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            header.calc_checksum_ipv6(&ipv6.header().to_header(), tcp.payload())
        }
        _ => return false,
    };
    matches!(computed, Ok(sum) if sum == tcp.checksum())
}
