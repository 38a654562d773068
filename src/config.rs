use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::bail;
use tokio::runtime::Handle;
use crate::bundle_mode::BundleMode;
use crate::framing::FramingMode;

/// the largest payload that fits into a UDP datagram over IPv4
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16*1024*1024;

/// An OSC packet has at least an address pattern and a type tag string, four bytes each
const MIN_PACKET_SIZE: usize = 8;

#[derive(Clone, Debug)]
pub struct UdpServerConfig {
    pub local_addr: SocketAddr,
    pub bundle_mode: BundleMode,

    /// Datagrams longer than this are truncated by the socket and consequently fail to decode
    pub max_datagram_size: usize,

    /// Multicast groups to join when the server is started, on the default interface. Groups must
    ///  have the same IP version as `local_addr`.
    pub multicast_groups: Vec<IpAddr>,

    /// The runtime that the server's dispatch queue and socket tasks are spawned on. If this is
    ///  `None`, the runtime that creates the server is used.
    ///
    /// This selects where the queue runs, not the queue itself: every endpoint has its own dispatch
    ///  queue, and handlers of different endpoints are not serialized with each other even if they
    ///  share a runtime. Applications that need that must serialize in their handlers.
    pub runtime: Option<Handle>,
}

impl UdpServerConfig {
    pub fn new(local_addr: SocketAddr) -> UdpServerConfig {
        UdpServerConfig {
            local_addr,
            bundle_mode: BundleMode::default(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            multicast_groups: Vec::new(),
            runtime: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_max_size("max_datagram_size", self.max_datagram_size)?;

        for group in &self.multicast_groups {
            if !group.is_multicast() {
                bail!("{} is not a multicast address", group);
            }
            if group.is_ipv4() != self.local_addr.is_ipv4() {
                bail!("multicast group {} does not match the IP version of local address {}", group, self.local_addr);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct UdpPeerConfig {
    pub local_addr: SocketAddr,
    /// the default destination for `send`
    pub remote_addr: Option<SocketAddr>,
    pub broadcast: bool,
    pub bundle_mode: BundleMode,
    pub max_datagram_size: usize,
    /// see [UdpServerConfig::runtime]
    pub runtime: Option<Handle>,
}

impl UdpPeerConfig {
    /// binds to an ephemeral port on all IPv4 interfaces
    pub fn new(remote_addr: Option<SocketAddr>) -> UdpPeerConfig {
        UdpPeerConfig {
            local_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            remote_addr,
            broadcast: false,
            bundle_mode: BundleMode::default(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            runtime: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_max_size("max_datagram_size", self.max_datagram_size)?;

        if let Some(remote_addr) = self.remote_addr {
            if remote_addr.port() == 0 {
                bail!("remote address {} has no port", remote_addr);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    pub local_addr: SocketAddr,
    pub framing: FramingMode,
    pub bundle_mode: BundleMode,
    pub max_frame_len: usize,
    /// sets TCP_NODELAY on accepted connections
    pub nodelay: bool,
    /// see [UdpServerConfig::runtime]
    pub runtime: Option<Handle>,
}

impl TcpServerConfig {
    pub fn new(local_addr: SocketAddr) -> TcpServerConfig {
        TcpServerConfig {
            local_addr,
            framing: FramingMode::default(),
            bundle_mode: BundleMode::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
            runtime: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_max_size("max_frame_len", self.max_frame_len)
    }
}

#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    /// host name or IP address, resolved on every `connect`
    pub remote_host: String,
    pub remote_port: u16,
    pub framing: FramingMode,
    pub bundle_mode: BundleMode,
    pub max_frame_len: usize,
    pub nodelay: bool,
    /// see [UdpServerConfig::runtime]
    pub runtime: Option<Handle>,
}

impl TcpClientConfig {
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> TcpClientConfig {
        TcpClientConfig {
            remote_host: remote_host.into(),
            remote_port,
            framing: FramingMode::default(),
            bundle_mode: BundleMode::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
            runtime: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.remote_host.trim().is_empty() {
            bail!("remote host is empty");
        }
        if self.remote_port == 0 {
            bail!("remote port must not be 0");
        }
        validate_max_size("max_frame_len", self.max_frame_len)
    }
}

fn validate_max_size(name: &str, value: usize) -> anyhow::Result<()> {
    if value < MIN_PACKET_SIZE {
        bail!("{} is too small: {} < {}", name, value, MIN_PACKET_SIZE);
    }
    Ok(())
}

/// the configured runtime, or the one we are running on
pub(crate) fn runtime_handle(runtime: &Option<Handle>) -> anyhow::Result<Handle> {
    match runtime {
        Some(handle) => Ok(handle.clone()),
        None => Ok(Handle::try_current()?),
    }
}
