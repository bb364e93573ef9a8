use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::Parser;
use log::info;

use tcp_engine::endpoint::{Endpoint, ANY_ADDR, ANY_PORT};
use tcp_engine::Stack;

/// Connect to a remote endpoint over a TUN-backed interface and relay
/// stdin to it, printing whatever comes back.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "tun1")]
    tun: String,

    #[arg(long, default_value = "10.10.10.11")]
    addr: String,

    #[arg(long, default_value = "255.255.255.0")]
    netmask: String,

    #[arg(long)]
    remote_addr: String,

    #[arg(long)]
    remote_port: u16,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let addr = Ipv4Addr::from_str(&args.addr).expect("invalid --addr");
    let netmask = Ipv4Addr::from_str(&args.netmask).expect("invalid --netmask");
    let remote_addr = Ipv4Addr::from_str(&args.remote_addr).expect("invalid --remote-addr");

    let stack = Stack::new(&args.tun, addr, netmask).expect("failed to bring up tun device");

    info!("connecting to {remote_addr}:{}", args.remote_port);
    let desc = stack
        .engine
        .open(Endpoint::new(ANY_ADDR, ANY_PORT), Endpoint::new(remote_addr, args.remote_port), true)
        .expect("open (active) failed");
    info!("desc={desc}: connected");

    let mut line = [0u8; 4096];
    loop {
        let n = match io::stdin().read(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if let Err(e) = stack.engine.send(desc, &line[..n]) {
            info!("desc={desc}: send failed: {e}");
            break;
        }

        let mut reply = [0u8; 4096];
        match stack.engine.receive(desc, &mut reply) {
            Ok(n) => print!("{}", String::from_utf8_lossy(&reply[..n])),
            Err(e) => {
                info!("desc={desc}: receive ended: {e}");
                break;
            }
        }
    }

    let _ = stack.engine.close(desc);
}
