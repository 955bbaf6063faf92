//! Capture file reader (pcap and pcapng, optionally gzipped).

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use super::RawPacket;
use crate::error::{Error, PcapError as CapturePcapError};

/// Buffer size for reading capture files (64KB).
const BUFFER_SIZE: usize = 65536;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

type Source = BufReader<Box<dyn Read + Send>>;

enum Format {
    Legacy {
        reader: LegacyPcapReader<Source>,
        link_type: u16,
        nanos: bool,
    },
    Ng {
        reader: PcapNGReader<Source>,
        /// (link type, timestamp resolution exponent) per interface id.
        interfaces: Vec<(u16, u8)>,
    },
}

/// Sequential reader yielding [`RawPacket`]s from a capture file.
pub struct PcapReader {
    format: Format,
    frame_number: u64,
}

impl PcapReader {
    /// Open a capture file, detecting gzip and the pcap flavour from its
    /// leading bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let gzipped = is_gzip_file(path)?;
        let file = File::open(path).map_err(|_| CapturePcapError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let inner: Box<dyn Read + Send> = if gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut source = BufReader::with_capacity(BUFFER_SIZE, inner);

        let magic: [u8; 4] = match source.fill_buf()? {
            [a, b, c, d, ..] => [*a, *b, *c, *d],
            _ => {
                return Err(CapturePcapError::InvalidFormat {
                    reason: "file too short to read magic number".to_string(),
                }
                .into())
            }
        };

        let format = match magic {
            [0xd4, 0xc3, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0xc3, 0xd4]
            | [0x4d, 0x3c, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0x3c, 0x4d] => Format::Legacy {
                reader: LegacyPcapReader::new(BUFFER_SIZE, source).map_err(|e| {
                    CapturePcapError::InvalidFormat {
                        reason: format!("failed to parse pcap header: {e}"),
                    }
                })?,
                link_type: 1,
                nanos: false,
            },
            [0x0a, 0x0d, 0x0d, 0x0a] => Format::Ng {
                reader: PcapNGReader::new(BUFFER_SIZE, source).map_err(|e| {
                    CapturePcapError::InvalidFormat {
                        reason: format!("failed to parse pcapng header: {e}"),
                    }
                })?,
                interfaces: Vec::new(),
            },
            _ => {
                return Err(CapturePcapError::InvalidFormat {
                    reason: format!("unknown magic number: {magic:02x?}"),
                }
                .into())
            }
        };

        Ok(Self {
            format,
            frame_number: 0,
        })
    }

    /// Number of packets returned so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Read the next packet, or `None` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, Error> {
        loop {
            let step = match &mut self.format {
                Format::Legacy {
                    reader,
                    link_type,
                    nanos,
                } => next_legacy(reader, link_type, nanos),
                Format::Ng { reader, interfaces } => next_ng(reader, interfaces),
            };
            match step? {
                Step::Packet {
                    timestamp_us,
                    original_length,
                    link_type,
                    data,
                } => {
                    self.frame_number += 1;
                    return Ok(Some(RawPacket::new(
                        self.frame_number,
                        timestamp_us,
                        original_length,
                        link_type,
                        data,
                    )));
                }
                Step::Skipped => continue,
                Step::Eof => return Ok(None),
            }
        }
    }
}

enum Step {
    Packet {
        timestamp_us: i64,
        original_length: u32,
        link_type: u16,
        data: Vec<u8>,
    },
    Skipped,
    Eof,
}

fn parse_error<E: std::fmt::Display>(what: &str, e: E) -> Error {
    CapturePcapError::InvalidFormat {
        reason: format!("{what}: {e}"),
    }
    .into()
}

fn next_legacy(
    reader: &mut LegacyPcapReader<Source>,
    link_type: &mut u16,
    nanos: &mut bool,
) -> Result<Step, Error> {
    match reader.next() {
        Ok((offset, block)) => {
            let step = match block {
                PcapBlockOwned::LegacyHeader(header) => {
                    *link_type = header.network.0 as u16;
                    *nanos = header.is_nanosecond_precision();
                    Step::Skipped
                }
                PcapBlockOwned::Legacy(packet) => {
                    let fraction = if *nanos {
                        i64::from(packet.ts_usec) / 1000
                    } else {
                        i64::from(packet.ts_usec)
                    };
                    Step::Packet {
                        timestamp_us: i64::from(packet.ts_sec) * 1_000_000 + fraction,
                        original_length: packet.origlen,
                        link_type: *link_type,
                        data: packet.data.to_vec(),
                    }
                }
                _ => Step::Skipped,
            };
            reader.consume(offset);
            Ok(step)
        }
        Err(PcapError::Eof) => Ok(Step::Eof),
        Err(PcapError::Incomplete(_)) => {
            reader.refill().map_err(|e| parse_error("refill error", e))?;
            Ok(Step::Skipped)
        }
        Err(e) => Err(parse_error("parse error", e)),
    }
}

fn next_ng(
    reader: &mut PcapNGReader<Source>,
    interfaces: &mut Vec<(u16, u8)>,
) -> Result<Step, Error> {
    match reader.next() {
        Ok((offset, block)) => {
            let step = match block {
                PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                    interfaces.clear();
                    Step::Skipped
                }
                PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                    interfaces.push((idb.linktype.0 as u16, idb.if_tsresol));
                    Step::Skipped
                }
                PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                    let (link_type, tsresol) = interfaces
                        .get(epb.if_id as usize)
                        .copied()
                        .unwrap_or((1, 6));
                    let raw = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                    Step::Packet {
                        timestamp_us: ticks_to_micros(raw, tsresol),
                        original_length: epb.origlen,
                        link_type,
                        data: epb
                            .data
                            .get(..epb.caplen as usize)
                            .unwrap_or(epb.data)
                            .to_vec(),
                    }
                }
                PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                    let link_type = interfaces.first().map(|i| i.0).unwrap_or(1);
                    Step::Packet {
                        timestamp_us: 0,
                        original_length: spb.origlen,
                        link_type,
                        data: spb.data.to_vec(),
                    }
                }
                _ => Step::Skipped,
            };
            reader.consume(offset);
            Ok(step)
        }
        Err(PcapError::Eof) => Ok(Step::Eof),
        Err(PcapError::Incomplete(_)) => {
            reader.refill().map_err(|e| parse_error("refill error", e))?;
            Ok(Step::Skipped)
        }
        Err(e) => Err(parse_error("parse error", e)),
    }
}

/// Convert interface ticks to microseconds. The high bit of `if_tsresol`
/// selects a power-of-two resolution instead of a power of ten.
fn ticks_to_micros(ticks: u64, tsresol: u8) -> i64 {
    let micros = if tsresol & 0x80 != 0 {
        let shift = u32::from(tsresol & 0x7f);
        ((ticks as u128 * 1_000_000) >> shift) as u64
    } else {
        match tsresol {
            6 => ticks,
            exp if exp < 6 => ticks.saturating_mul(10u64.pow(u32::from(6 - exp))),
            exp => ticks / 10u64.saturating_pow(u32::from(exp - 6)),
        }
    };
    i64::try_from(micros).unwrap_or(i64::MAX)
}

/// Check if a file is gzipped by extension or magic bytes.
fn is_gzip_file(path: &Path) -> Result<bool, Error> {
    if is_gzip_extension(path) {
        return Ok(true);
    }

    let mut file = File::open(path).map_err(|_| CapturePcapError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(_) => Ok(false),
    }
}

/// Check if a path appears to be a gzip file by extension only.
pub fn is_gzip_extension<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .file_name()
        .and_then(|f| f.to_str())
        .map(|name| name.to_lowercase().ends_with(".gz"))
        .unwrap_or(false)
}

impl Iterator for PcapReader {
    type Item = Result<RawPacket, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
