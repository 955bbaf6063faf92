//! Capture source.
//!
//! Reads pcap and pcapng files into [`RawPacket`]s. The pipeline itself
//! accepts packets from any source; this module is what the binary uses.

mod packet;
mod reader;

pub use packet::{
    RawPacket, LINKTYPE_ETHERNET, LINKTYPE_IPV4, LINKTYPE_IPV6, LINKTYPE_RAW, LINKTYPE_RAW_BSD,
};
pub use reader::{is_gzip_extension, PcapReader};
