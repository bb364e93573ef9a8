//! Component A: the TCP segment codec (spec §4.A).
//!
//! Explicit bounds-checked reads/writes over byte slices, not a struct
//! cast over a buffer -- big-endian fields are converted at the boundary
//! and nowhere else. Options are parsed far enough to report their kind
//! and length for observability; nothing in the engine acts on them.

use std::net::Ipv4Addr;

use crate::checksum;
use crate::iplayer::IP_PROTO_TCP;

pub const HEADER_LEN: usize = 20;

/// Bits of the TCP control-flags byte actually meaningful here. Tracked as
/// a bare `u8` mask rather than a `bitflags!` type: the engine only ever
/// tests individual bits or builds a handful of fixed combinations, so a
/// small set of `const` masks plus `Flags::has` reads the same and avoids
/// an extra dependency for six bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub const fn new(bits: u8) -> Self {
        Flags(bits & 0x3f)
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn fin(self) -> bool {
        self.has(Self::FIN)
    }
    pub fn syn(self) -> bool {
        self.has(Self::SYN)
    }
    pub fn rst(self) -> bool {
        self.has(Self::RST)
    }
    pub fn psh(self) -> bool {
        self.has(Self::PSH)
    }
    pub fn ack(self) -> bool {
        self.has(Self::ACK)
    }
    pub fn urg(self) -> bool {
        self.has(Self::URG)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}{}{}",
            if self.urg() { 'U' } else { '-' },
            if self.ack() { 'A' } else { '-' },
            if self.psh() { 'P' } else { '-' },
            if self.rst() { 'R' } else { '-' },
            if self.syn() { 'S' } else { '-' },
            if self.fin() { 'F' } else { '-' },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8, // header length in 4-byte words
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl Header {
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }
}

/// One parsed option: `(kind, option-specific bytes)`. Decoded for
/// observability only -- the engine never consults this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Option_ {
    pub kind: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("segment shorter than the fixed 20-byte header")]
    TooShortForHeader,
    #[error("data offset claims a header longer than the segment")]
    TooShortForOptions,
    #[error("data offset below the fixed header size")]
    OffsetTooSmall,
}

/// Parse the fixed header, trailing options, and payload out of `bytes`.
/// Does not check the checksum -- callers combine this with
/// [`verify_checksum`] as needed (the engine drops on checksum failure
/// without ever constructing a `Header` it would otherwise trust).
pub fn decode(bytes: &[u8]) -> Result<(Header, Vec<Option_>, &[u8]), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShortForHeader);
    }

    let src_port = u16::from_be_bytes([bytes[0], bytes[1]]);
    let dst_port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let seq = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let ack = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let data_offset = bytes[12] >> 4;
    let flags = Flags::new(bytes[13]);
    let window = u16::from_be_bytes([bytes[14], bytes[15]]);
    let checksum = u16::from_be_bytes([bytes[16], bytes[17]]);
    let urgent_ptr = u16::from_be_bytes([bytes[18], bytes[19]]);

    if (data_offset as usize) < HEADER_LEN / 4 {
        return Err(DecodeError::OffsetTooSmall);
    }

    let header = Header {
        src_port,
        dst_port,
        seq,
        ack,
        data_offset,
        flags,
        window,
        checksum,
        urgent_ptr,
    };

    let hlen = header.header_len();
    if bytes.len() < hlen {
        return Err(DecodeError::TooShortForOptions);
    }

    let options = parse_options(&bytes[HEADER_LEN..hlen]);
    let payload = &bytes[hlen..];

    Ok((header, options, payload))
}

fn parse_options(mut opt: &[u8]) -> Vec<Option_> {
    let mut out = Vec::new();

    while !opt.is_empty() {
        match opt[0] {
            0 => break, // end of option list
            1 => {
                out.push(Option_ { kind: 1, data: Vec::new() });
                opt = &opt[1..];
            }
            kind => {
                if opt.len() < 2 {
                    break;
                }
                let len = opt[1] as usize;
                if len < 2 || len > opt.len() {
                    break;
                }
                out.push(Option_ { kind, data: opt[2..len].to_vec() });
                opt = &opt[len..];
            }
        }
    }

    out
}

/// Build a wire-ready segment: fixed 20-byte header (no options emitted)
/// followed by `payload`, with the pseudo-header checksum filled in.
pub fn encode(
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    payload: &[u8],
    local: (Ipv4Addr, u16),
    remote: (Ipv4Addr, u16),
) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];

    buf[0..2].copy_from_slice(&local.1.to_be_bytes());
    buf[2..4].copy_from_slice(&remote.1.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = ((HEADER_LEN / 4) as u8) << 4;
    buf[13] = flags.0;
    buf[14..16].copy_from_slice(&window.to_be_bytes());
    buf[16..18].copy_from_slice(&0u16.to_be_bytes()); // checksum, filled below
    buf[18..20].copy_from_slice(&0u16.to_be_bytes());
    buf[HEADER_LEN..].copy_from_slice(payload);

    let pseudo = pseudo_header(local.0, remote.0, buf.len() as u16);
    let sum = checksum::compute(&[&pseudo, &buf]);
    buf[16..18].copy_from_slice(&sum.to_be_bytes());

    buf
}

/// Validate the pseudo-header checksum of a complete segment as received.
pub fn verify_checksum(bytes: &[u8], src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> bool {
    let pseudo = pseudo_header(src_addr, dst_addr, bytes.len() as u16);
    checksum::verify(&[&pseudo, bytes])
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, total_len: u16) -> [u8; 12] {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[8] = 0;
    pseudo[9] = IP_PROTO_TCP;
    pseudo[10..12].copy_from_slice(&total_len.to_be_bytes());
    pseudo
}
