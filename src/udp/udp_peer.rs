use std::net::SocketAddr;
use anyhow::{anyhow, bail, Context};
use rosc::OscPacket;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};
use crate::codec::encode_packet;
use crate::config::{runtime_handle, UdpPeerConfig};
use crate::dispatch_queue::DispatchQueue;
use crate::end_point::EndPoint;
use crate::udp::BoundSocket;

/// A UDP socket that both sends and receives OSC packets, either to a configured default remote
///  address or to explicit destinations.
pub struct UdpPeer {
    config: UdpPeerConfig,
    runtime: Handle,
    queue: DispatchQueue,
    bound_socket: Option<BoundSocket>,
}

impl UdpPeer {
    pub fn new(config: UdpPeerConfig) -> anyhow::Result<UdpPeer> {
        config.validate()?;
        let runtime = runtime_handle(&config.runtime)?;
        let queue = DispatchQueue::spawn(config.bundle_mode, &runtime);

        Ok(UdpPeer {
            config,
            runtime,
            queue,
            bound_socket: None,
        })
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.bound_socket.is_some() {
            debug!("UDP peer is already running");
            return Ok(());
        }

        let socket = UdpSocket::bind(self.config.local_addr).await
            .with_context(|| format!("could not bind UDP peer to {}", self.config.local_addr))?;
        if self.config.broadcast {
            socket.set_broadcast(true)?;
        }

        self.queue.activate().await;
        let bound_socket = BoundSocket::start(socket, self.config.max_datagram_size, self.queue.clone(), &self.runtime)?;
        info!("UDP peer bound to {:?}", bound_socket.local_addr);
        self.bound_socket = Some(bound_socket);
        Ok(())
    }

    pub async fn stop(&mut self) {
        let Some(bound_socket) = self.bound_socket.take() else {
            return;
        };

        let local_addr = bound_socket.local_addr;
        bound_socket.stop().await;
        self.queue.deactivate().await;
        info!("UDP peer on {:?} stopped", local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.bound_socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_socket.as_ref()
            .map(|s| s.local_addr)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.config.remote_addr
    }

    /// takes effect for subsequent calls to `send`
    pub fn set_remote_addr(&mut self, remote_addr: Option<SocketAddr>) {
        self.config.remote_addr = remote_addr;
    }

    /// Enables or disables sending to broadcast addresses. If the peer is running, this is applied
    ///  to the socket immediately, otherwise on `start`.
    pub fn set_broadcast(&mut self, broadcast: bool) -> anyhow::Result<()> {
        if let Some(bound_socket) = &self.bound_socket {
            bound_socket.socket.set_broadcast(broadcast)?;
        }
        self.config.broadcast = broadcast;
        Ok(())
    }

    /// sends a packet to the configured remote address
    pub async fn send(&self, packet: &OscPacket) -> anyhow::Result<()> {
        let Some(remote_addr) = self.config.remote_addr else {
            bail!("UDP peer has no remote address");
        };
        self.send_to(packet, remote_addr).await
    }

    pub async fn send_to(&self, packet: &OscPacket, to: SocketAddr) -> anyhow::Result<()> {
        let bound_socket = self.bound_socket.as_ref()
            .ok_or_else(|| anyhow!("UDP peer is not running"))?;

        let buf = encode_packet(packet)?;
        if buf.len() > self.config.max_datagram_size {
            bail!("encoded packet has {} bytes, exceeding the maximum datagram size of {}", buf.len(), self.config.max_datagram_size);
        }

        trace!("sending {} bytes to {:?}", buf.len(), to);
        bound_socket.socket.send_to(&buf, to).await?;
        Ok(())
    }
}

impl EndPoint for UdpPeer {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for UdpPeer {
    fn drop(&mut self) {
        if let Some(bound_socket) = self.bound_socket.take() {
            bound_socket.receive_task.abort();
        }
        self.queue.shut_down();
    }
}
