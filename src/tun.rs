//! Component H: the only concrete [`IpLayer`] this crate ships -- a TUN
//! device plus the IPv4 glue the engine needs (stamping and parsing
//! headers, routing to the device's own address). Everything else about
//! IP (fragmentation, forwarding, multiple interfaces) stays out of scope.

use std::io::{Cursor, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::time::Duration;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::error::IpLayerError;
use crate::iplayer::{Iface, IpLayer, IP_PROTO_ICMP, IP_PROTO_TCP};

const MTU: u16 = 1500;
const POLL_TIMEOUT_MS: i32 = 100;

/// A TUN device plus the single statically-configured interface it
/// represents. `output` builds and writes an IPv4 datagram; `poll_recv`
/// (driven by the delivery thread in `lib.rs`) reads one and dispatches it
/// to the TCP or ICMP receiver by protocol number.
pub struct TunIpLayer {
    tun: Mutex<Tun>,
    unicast: Ipv4Addr,
}

impl TunIpLayer {
    pub fn new(name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, IpLayerError> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(netmask)?;
        tun.bring_up()?;

        Ok(TunIpLayer {
            tun: Mutex::new(tun),
            unicast: addr,
        })
    }

    pub fn unicast(&self) -> Ipv4Addr {
        self.unicast
    }

    /// Block up to `POLL_TIMEOUT_MS` for one inbound datagram and dispatch
    /// it to `on_tcp`/`on_icmp` by protocol number. Returns without calling
    /// either callback on a poll timeout, mirroring the teacher's
    /// `segment_loop`'s non-blocking-poll-then-read structure.
    pub fn poll_recv(&self, on_tcp: impl FnOnce(Ipv4Addr, Ipv4Addr, &[u8]), on_icmp: impl FnOnce(Ipv4Addr, Ipv4Addr, &[u8])) {
        let mut tun = self.tun.lock().unwrap();

        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut pfd[..], POLL_TIMEOUT_MS) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut buf = [0u8; MTU as usize];
        let n = match tun.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!("tun: read failed: {e}");
                return;
            }
        };

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else {
            log::error!("ip: malformed header");
            return;
        };

        let hlen = (ip4h.ihl() * 4) as usize;
        let src = ip4h.source_addr();
        let dst = ip4h.destination_addr();
        let payload = &buf[hlen..n];

        match ip4h.protocol() {
            IP_PROTO_TCP => on_tcp(src, dst, payload),
            IP_PROTO_ICMP => on_icmp(src, dst, payload),
            other => log::trace!("ip: dropping unhandled protocol {other} from {src}"),
        }
    }
}

impl IpLayer for TunIpLayer {
    fn output(&self, proto: u8, bytes: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<(), IpLayerError> {
        let ip4h = Ipv4Header::new(bytes.len() as u16, 64, proto, src.octets(), dst.octets());

        let mut cursor = Cursor::new(vec![0u8; MTU as usize]);
        ip4h.write(&mut cursor).map_err(|_| IpLayerError::MalformedHeader)?;
        cursor.write_all(bytes)?;

        let total = cursor.position() as usize;
        let datagram = cursor.into_inner();

        let mut tun = self.tun.lock().unwrap();
        tun.write(&datagram[..total])?;
        Ok(())
    }

    fn route_get_iface(&self, addr: Ipv4Addr) -> Option<Iface> {
        // A single statically-configured point-to-point interface: anything
        // is reachable through it, matching the teacher's single-TUN setup.
        let _ = addr;
        Some(Iface { unicast: self.unicast, mtu: MTU })
    }
}

/// The 100 ms periodic tick driving the retransmission engine, run on its
/// own thread (spec §4.G).
pub fn spawn_timer(engine: std::sync::Arc<crate::tcp::Engine>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(100));
        engine.on_tick();
    })
}
