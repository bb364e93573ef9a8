use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::Parser;
use log::info;

use tcp_engine::endpoint::{Endpoint, ANY_ADDR};
use tcp_engine::Stack;

/// Accept one connection on a TUN-backed interface, echo everything it sends.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "tun0")]
    tun: String,

    #[arg(long, default_value = "10.10.10.10")]
    addr: String,

    #[arg(long, default_value = "255.255.255.0")]
    netmask: String,

    #[arg(long, default_value_t = 9090)]
    port: u16,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let addr = Ipv4Addr::from_str(&args.addr).expect("invalid --addr");
    let netmask = Ipv4Addr::from_str(&args.netmask).expect("invalid --netmask");

    let stack = Stack::new(&args.tun, addr, netmask).expect("failed to bring up tun device");

    info!("waiting for a connection on port {}", args.port);
    let desc = stack
        .engine
        .open(Endpoint::new(ANY_ADDR, args.port), Endpoint::WILDCARD, false)
        .expect("open (passive) failed");
    info!("desc={desc}: connection accepted");

    let mut buf = [0u8; 4096];
    loop {
        let n = match stack.engine.receive(desc, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                info!("desc={desc}: receive ended: {e}");
                break;
            }
        };
        if n == 0 {
            break;
        }

        if let Err(e) = stack.engine.send(desc, &buf[..n]) {
            info!("desc={desc}: send failed: {e}");
            break;
        }
    }

    let _ = stack.engine.close(desc);
}
