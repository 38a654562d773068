use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tracing::{debug, info};
use crate::config::{runtime_handle, UdpServerConfig};
use crate::dispatch_queue::DispatchQueue;
use crate::end_point::EndPoint;
use crate::udp::BoundSocket;

/// Listens for OSC packets on a UDP port.
///
/// A new server is idle; `start()` binds the socket and starts dispatching received packets,
///  `stop()` closes the socket. Both are idempotent.
pub struct UdpServer {
    config: UdpServerConfig,
    runtime: Handle,
    queue: DispatchQueue,
    bound_socket: Option<BoundSocket>,
}

impl UdpServer {
    pub fn new(config: UdpServerConfig) -> anyhow::Result<UdpServer> {
        config.validate()?;
        let runtime = runtime_handle(&config.runtime)?;
        let queue = DispatchQueue::spawn(config.bundle_mode, &runtime);

        Ok(UdpServer {
            config,
            runtime,
            queue,
            bound_socket: None,
        })
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.bound_socket.is_some() {
            debug!("UDP server is already running");
            return Ok(());
        }

        let socket = UdpSocket::bind(self.config.local_addr).await
            .with_context(|| format!("could not bind UDP server to {}", self.config.local_addr))?;

        for group in &self.config.multicast_groups {
            match group {
                IpAddr::V4(group) => socket.join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(group) => socket.join_multicast_v6(group, 0),
            }
                .with_context(|| format!("could not join multicast group {}", group))?;
            debug!("joined multicast group {}", group);
        }

        self.queue.activate().await;
        let bound_socket = BoundSocket::start(socket, self.config.max_datagram_size, self.queue.clone(), &self.runtime)?;
        info!("UDP server listening on {:?}", bound_socket.local_addr);
        self.bound_socket = Some(bound_socket);
        Ok(())
    }

    /// When this returns, the socket is closed and no handlers will be invoked any more, not even
    ///  for deferred bundles that were received before.
    pub async fn stop(&mut self) {
        let Some(bound_socket) = self.bound_socket.take() else {
            debug!("UDP server is not running");
            return;
        };

        let local_addr = bound_socket.local_addr;
        bound_socket.stop().await;
        self.queue.deactivate().await;
        info!("UDP server on {:?} stopped", local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.bound_socket.is_some()
    }

    /// the actual address the server is bound to (relevant for port 0), if it is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_socket.as_ref()
            .map(|s| s.local_addr)
    }

    pub fn config(&self) -> &UdpServerConfig {
        &self.config
    }
}

impl EndPoint for UdpServer {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        if let Some(bound_socket) = self.bound_socket.take() {
            bound_socket.receive_task.abort();
        }
        self.queue.shut_down();
    }
}
