//! Receive-side classification hook.
//!
//! A [`Classifier`] looks at the bytes of a received frame and picks the
//! destination pool plus parsed header fields. Backends that deliver frames
//! from their own buffers (loopback, driver) run each packet through the
//! interface's classifier; a packet that fails classification is dropped and
//! counted in `in_errors`, and one destined for another pool is copied there.

use crate::entry::EntryCore;
use pktio_shm::{Packet, ParsedFields, Pool};
use thiserror::Error;

/// Result of classifying one frame
#[derive(Debug, Clone)]
pub struct Classification {
    /// Pool the packet must live in
    pub pool: Pool,
    /// Header fields found in the frame
    pub parsed: ParsedFields,
}

/// Classification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// Frame ends before a header it announces
    #[error("Frame truncated at {layer} ({len} bytes)")]
    Truncated {
        /// Layer being parsed
        layer: &'static str,
        /// Frame length
        len: usize,
    },

    /// Header contents are invalid
    #[error("Malformed {0} header")]
    Malformed(&'static str),

    /// No rule matched and there is no default destination
    #[error("No matching class")]
    NoMatch,
}

/// Classification engine boundary
pub trait Classifier: Send + Sync {
    /// Classify the frame `data`
    fn classify(&self, data: &[u8]) -> Result<Classification, ClassifyError>;
}

const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Header parser sending every valid frame to one pool
#[derive(Debug, Clone)]
pub struct ParserClassifier {
    pool: Pool,
}

impl ParserClassifier {
    /// Classify into `pool`
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn fnv1a(hash: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(hash, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193))
}

/// Parse Ethernet, IPv4/IPv6 and UDP/TCP headers
pub fn parse_headers(data: &[u8]) -> Result<ParsedFields, ClassifyError> {
    let len = data.len();
    if len < ETH_HLEN {
        return Err(ClassifyError::Truncated { layer: "ethernet", len });
    }

    let mut parsed = ParsedFields {
        flags: ParsedFields::HAS_ETH,
        ..Default::default()
    };
    let mut l3 = ETH_HLEN;
    let mut ethertype = be16(data, 12);
    if ethertype == ETHERTYPE_VLAN {
        if len < ETH_HLEN + 4 {
            return Err(ClassifyError::Truncated { layer: "vlan", len });
        }
        ethertype = be16(data, 16);
        l3 += 4;
    }

    let mut hash = 0x811c_9dc5;
    let (proto, l4) = match ethertype {
        ETHERTYPE_IPV4 => {
            if len < l3 + 20 {
                return Err(ClassifyError::Truncated { layer: "ipv4", len });
            }
            let ihl = (data[l3] & 0x0f) as usize * 4;
            if data[l3] >> 4 != 4 || ihl < 20 {
                return Err(ClassifyError::Malformed("ipv4"));
            }
            if len < l3 + ihl {
                return Err(ClassifyError::Truncated { layer: "ipv4", len });
            }
            parsed.flags |= ParsedFields::HAS_IPV4;
            hash = fnv1a(hash, &data[l3 + 12..l3 + 20]);
            (data[l3 + 9], l3 + ihl)
        }
        ETHERTYPE_IPV6 => {
            if len < l3 + 40 {
                return Err(ClassifyError::Truncated { layer: "ipv6", len });
            }
            if data[l3] >> 4 != 6 {
                return Err(ClassifyError::Malformed("ipv6"));
            }
            parsed.flags |= ParsedFields::HAS_IPV6;
            hash = fnv1a(hash, &data[l3 + 8..l3 + 40]);
            (data[l3 + 6], l3 + 40)
        }
        _ => {
            parsed.l3_offset = l3 as u16;
            return Ok(parsed);
        }
    };
    parsed.l3_offset = l3 as u16;
    parsed.l4_offset = l4 as u16;

    match proto {
        IPPROTO_UDP => {
            if len < l4 + 8 {
                return Err(ClassifyError::Truncated { layer: "udp", len });
            }
            parsed.flags |= ParsedFields::HAS_UDP;
            hash = fnv1a(hash, &data[l4..l4 + 4]);
        }
        IPPROTO_TCP => {
            if len < l4 + 20 {
                return Err(ClassifyError::Truncated { layer: "tcp", len });
            }
            parsed.flags |= ParsedFields::HAS_TCP;
            hash = fnv1a(hash, &data[l4..l4 + 4]);
        }
        _ => {}
    }
    hash = fnv1a(hash, &[proto]);
    parsed.flow_hash = hash;
    Ok(parsed)
}

impl Classifier for ParserClassifier {
    fn classify(&self, data: &[u8]) -> Result<Classification, ClassifyError> {
        Ok(Classification {
            pool: self.pool.clone(),
            parsed: parse_headers(data)?,
        })
    }
}

/// Classify the packets appended to `out` from index `start` on.
///
/// Failed packets are dropped and counted as input errors. Returns the number
/// of packets kept after `start`.
pub(crate) fn classify_received(core: &EntryCore, out: &mut Vec<Packet>, start: usize) -> usize {
    let Some(classifier) = core.classifier() else {
        return out.len() - start;
    };

    let received: Vec<Packet> = out.drain(start..).collect();
    let mut errors = 0u64;
    for mut pkt in received {
        let class = match classifier.classify(pkt.data()) {
            Ok(class) => class,
            Err(e) => {
                tracing::debug!("{}: classification failed: {}", core.name(), e);
                errors += 1;
                continue;
            }
        };
        if !pkt.pool().ptr_eq(&class.pool) {
            match pkt.copy_to(&class.pool) {
                Some(copy) => pkt = copy,
                None => {
                    tracing::warn!(
                        "{}: no room in pool {} for classified packet",
                        core.name(),
                        class.pool.name()
                    );
                    errors += 1;
                    continue;
                }
            }
        }
        pkt.set_parsed(class.parsed);
        out.push(pkt);
    }

    if errors > 0 {
        core.stats().record_in_errors(errors);
    }
    out.len() - start
}
