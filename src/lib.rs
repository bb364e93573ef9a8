use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

pub mod checksum;
pub mod endpoint;
pub mod error;
pub mod icmp;
pub mod iplayer;
pub mod seqno;
pub mod task;
pub mod tcp;
pub mod tun;

pub use endpoint::Endpoint;
pub use error::{EngineError, IpLayerError};
pub use tcp::Engine;
pub use tun::TunIpLayer;

/// Brings up a TUN device, wires it to a TCP [`Engine`] and the ICMP
/// receiver, and spawns the delivery and retransmission-timer threads
/// (spec §4.G, §5). Dropping this value does not tear the threads down --
/// they run for the lifetime of the process, matching the teacher's
/// `NetStack`.
pub struct Stack {
    pub engine: Arc<Engine>,
    ip: Arc<TunIpLayer>,
    _delivery: thread::JoinHandle<()>,
    _timer: thread::JoinHandle<()>,
}

impl Stack {
    pub fn new(name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, IpLayerError> {
        let ip = Arc::new(TunIpLayer::new(name, addr, netmask)?);
        let engine = Arc::new(Engine::new(ip.clone() as Arc<dyn iplayer::IpLayer>));

        let delivery = {
            let ip = ip.clone();
            let engine = engine.clone();
            thread::spawn(move || loop {
                ip.poll_recv(
                    |src, dst, wire| engine.on_segment(src, dst, wire),
                    |src, dst, msg| icmp::on_message(src, dst, msg),
                )
            })
        };

        let timer = tun::spawn_timer(engine.clone());

        Ok(Stack {
            engine,
            ip,
            _delivery: delivery,
            _timer: timer,
        })
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.ip.unicast()
    }
}
