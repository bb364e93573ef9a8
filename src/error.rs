/// Error kinds surfaced across the user-command surface (§7). Checksum and
/// length errors on inbound packets are logged and dropped inside the
/// codec/engine boundary -- they never reach this enum.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no free PCB slot")]
    Exhaustion,

    #[error("no free dynamic port in 49152..=65535")]
    PortExhaustion,

    #[error("endpoint pair already in use")]
    Collision,

    #[error("no route to {0}")]
    NoRoute(std::net::Ipv4Addr),

    #[error("descriptor {0} is out of range or unallocated")]
    BadDescriptor(i32),

    #[error("descriptor {0} is in state {1:?}, not valid for this command")]
    WrongState(i32, crate::tcp::State),

    #[error("peer refused the connection")]
    ProtocolReject,

    #[error("suspended command was interrupted")]
    Cancelled,

    #[error("retransmission deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    IpLayer(#[from] IpLayerError),
}

/// Failures owned by the IP-layer shim (component H), not by the TCP
/// engine itself.
#[derive(Debug, thiserror::Error)]
pub enum IpLayerError {
    #[error("tun device error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed IPv4 header")]
    MalformedHeader,

    #[error("no interface can reach {0}")]
    NoRoute(std::net::Ipv4Addr),
}
