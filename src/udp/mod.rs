//! OSC over UDP: each datagram carries exactly one OSC packet, so there is no framing.

pub mod udp_server;
pub mod udp_peer;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use crate::dispatch_queue::DispatchQueue;

/// A bound socket with its receive loop running
struct BoundSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receive_task: JoinHandle<()>,
}

impl BoundSocket {
    fn start(socket: UdpSocket, max_datagram_size: usize, queue: DispatchQueue, runtime: &Handle) -> anyhow::Result<BoundSocket> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let receive_task = runtime.spawn(receive_loop(socket.clone(), max_datagram_size, queue));

        Ok(BoundSocket {
            socket,
            local_addr,
            receive_task,
        })
    }

    /// returns after the receive loop terminated, i.e. after the socket is closed
    async fn stop(self) {
        self.receive_task.abort();
        let _ = self.receive_task.await;
        debug!("closed UDP socket {:?}", self.local_addr);
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, max_datagram_size: usize, queue: DispatchQueue) {
    debug!("starting receive loop on {:?}", socket.local_addr());

    let mut buf = vec![0u8; max_datagram_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((num_read, from)) => queue.decode_and_dispatch(&buf[..num_read], from),
            Err(e) => error!("socket error: {}", e),
        }
    }
}
