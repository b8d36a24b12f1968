//! Address helpers and reachability collaborators
//!
//! A server whose bind address is already on a private network is reachable
//! by its peers without help; only a public address triggers external port
//! mapping. The mapping service and public-address discovery are provided by
//! the host application through [`PortMapper`] and [`PublicAddressResolver`].

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::OnceLock;
use thiserror::Error;

/// Unspecified bind used for the routing lookup
const UDP_BIND_ADDRESS: &str = "0.0.0.0:0";

/// Remote address for the local routing table lookup (no packets are sent)
const ROUTING_TEST_ADDRESS: &str = "8.8.8.8:80";

/// Ranges that never need external port mapping
const INTERNAL_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Address resolution and port mapping errors
#[derive(Error, Debug)]
pub enum NetAddrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Only a loopback interface is available")]
    LoopbackOnly,

    #[error("Expected an IPv4 route, got IPv6")]
    NotIpv4,

    #[error("Port mapping failed: {0}")]
    Mapping(String),
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingProtocol {
    Tcp,
    Udp,
}

/// External port-mapping service (UPnP/IGD or similar)
pub trait PortMapper: Send {
    /// Forward `port` on the gateway to this host
    fn map_port(&mut self, port: u16, protocol: MappingProtocol) -> Result<(), NetAddrError>;

    /// Remove a mapping created by [`map_port`](Self::map_port)
    fn unmap_port(&mut self, port: u16, protocol: MappingProtocol) -> Result<(), NetAddrError>;
}

/// Discovers the address peers should use to reach this host
pub trait PublicAddressResolver: Send {
    fn public_ip(&self) -> Result<IpAddr, NetAddrError>;
}

/// Resolver that reports the local interface address used for outbound traffic
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAddressResolver;

impl PublicAddressResolver for LocalAddressResolver {
    fn public_ip(&self) -> Result<IpAddr, NetAddrError> {
        local_ipv4().map(IpAddr::V4)
    }
}

fn internal_ranges() -> &'static [IpNet] {
    static RANGES: OnceLock<Vec<IpNet>> = OnceLock::new();
    RANGES.get_or_init(|| {
        INTERNAL_RANGES
            .iter()
            .filter_map(|range| range.parse().ok())
            .collect()
    })
}

/// Unwrap IPv4-mapped IPv6 addresses to plain IPv4
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Check if `ip` belongs to a private, loopback, or link-local network
pub fn is_internal_network(ip: IpAddr) -> bool {
    let ip = canonical_ip(ip);
    if ip.is_unspecified() {
        return true;
    }
    internal_ranges().iter().any(|range| range.contains(&ip))
}

/// Get the local IPv4 address the OS would route outbound traffic through
pub fn local_ipv4() -> Result<Ipv4Addr, NetAddrError> {
    let socket = UdpSocket::bind(UDP_BIND_ADDRESS)?;
    socket.connect(ROUTING_TEST_ADDRESS)?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ipv4) if !ipv4.is_loopback() => Ok(ipv4),
        IpAddr::V4(_) => Err(NetAddrError::LoopbackOnly),
        IpAddr::V6(_) => Err(NetAddrError::NotIpv4),
    }
}
