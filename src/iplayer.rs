//! The boundary the TCP/ICMP engines consume instead of owning link-layer
//! I/O, routing, or fragmentation (spec §1, §6). Anything implementing
//! [`IpLayer`] can drive the engine -- a real TUN device ([`crate::tun::TunIpLayer`])
//! or, in tests, an in-memory stand-in that records emitted datagrams.

use std::net::Ipv4Addr;

use crate::error::IpLayerError;

/// The outgoing-interface facts the engine needs: an address to stamp
/// segments with and an MTU to negotiate MSS from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iface {
    pub unicast: Ipv4Addr,
    pub mtu: u16,
}

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;

/// Minimum IPv4 header length (no options), in bytes -- used by `open`
/// when deriving MSS from `iface.mtu`.
pub const IP_HEADER_MIN: u16 = 20;

pub trait IpLayer: Send + Sync {
    /// Emit `bytes` (a fully-formed transport segment, checksum included)
    /// as the payload of an IPv4 datagram from `src` to `dst`.
    fn output(&self, proto: u8, bytes: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<(), IpLayerError>;

    /// Resolve the interface that would be used to reach `addr`, or `None`
    /// if there is no route.
    fn route_get_iface(&self, addr: Ipv4Addr) -> Option<Iface>;
}
