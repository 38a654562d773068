use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use rosc::OscPacket;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use crate::config::{runtime_handle, TcpClientConfig};
use crate::dispatch_queue::DispatchQueue;
use crate::end_point::EndPoint;
use crate::framing::FrameDecoder;
use crate::handlers::{ConnectionEvent, NotificationHandler};
use crate::tcp::{frame_packet, receive_loop};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Connection {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    receive_task: JoinHandle<()>,
}

/// An outgoing OSC connection over TCP.
///
/// Connection state changes are reported to the notification handler: every transition to
///  `Connected` raises `ConnectionEvent::Connected`, every transition to `Disconnected` (including
///  a failed connection attempt) raises exactly one `ConnectionEvent::Disconnected`.
pub struct TcpClient {
    config: TcpClientConfig,
    runtime: Handle,
    queue: DispatchQueue,
    state: Arc<watch::Sender<ConnectionState>>,
    connection: Option<Connection>,
}

impl TcpClient {
    pub fn new(config: TcpClientConfig) -> anyhow::Result<TcpClient> {
        config.validate()?;
        let runtime = runtime_handle(&config.runtime)?;
        let queue = DispatchQueue::spawn(config.bundle_mode, &runtime);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(TcpClient {
            config,
            runtime,
            queue,
            state: Arc::new(state),
            connection: None,
        })
    }

    pub fn set_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        self.queue.set_notification_handler(handler);
    }

    /// Connects to the configured remote address, resolving the host name. Calling this while
    ///  connected does nothing.
    pub async fn connect(&mut self, timeout: Duration) -> anyhow::Result<()> {
        if self.is_connected() {
            debug!("TCP client is already connected");
            return Ok(());
        }
        // left over from a connection the peer closed
        self.discard_connection().await;

        self.state.send_replace(ConnectionState::Connecting);
        let host = self.config.remote_host.as_str();
        let port = self.config.remote_port;
        debug!("connecting to {}:{}", host, port);

        let connected = match time::timeout(timeout, open_stream(host, port, self.config.nodelay)).await {
            Ok(connected) => connected,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("no connection after {:?}", timeout))),
        };
        let (stream, remote_addr, local_addr) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                let msg = format!("could not connect to {}:{}: {}", host, port, e);
                self.state.send_replace(ConnectionState::Disconnected);
                self.queue.notify(ConnectionEvent::Disconnected { remote: None, error: Some(Arc::new(e)) });
                bail!(msg);
            }
        };

        let (reader, writer) = stream.into_split();
        self.queue.activate().await;
        self.state.send_replace(ConnectionState::Connected);
        self.queue.notify(ConnectionEvent::Connected { remote: remote_addr });
        info!("connected to {:?}", remote_addr);

        let decoder = FrameDecoder::new(self.config.framing, self.config.max_frame_len);
        let receive_task = self.runtime.spawn(read_connection(reader, remote_addr, decoder, self.queue.clone(), self.state.clone()));

        self.connection = Some(Connection {
            remote_addr,
            local_addr,
            writer: Mutex::new(writer),
            receive_task,
        });
        Ok(())
    }

    /// Closes the connection gracefully. When this returns, no handlers will be invoked any more.
    pub async fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if to_disconnected(&self.state) {
            let mut writer = connection.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down connection to {:?}: {}", connection.remote_addr, e);
            }
            self.queue.notify(ConnectionEvent::Disconnected { remote: Some(connection.remote_addr), error: None });
            info!("closed connection to {:?}", connection.remote_addr);
        }

        connection.receive_task.abort();
        let _ = connection.receive_task.await;
        self.queue.deactivate().await;
    }

    async fn discard_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.receive_task.abort();
            let _ = connection.receive_task.await;
        }
    }

    /// Write failures are returned and additionally reported as a `Disconnected` event, closing
    ///  the connection.
    pub async fn send(&self, packet: &OscPacket) -> anyhow::Result<()> {
        let connection = match &self.connection {
            Some(connection) if self.is_connected() => connection,
            _ => bail!("TCP client is not connected"),
        };

        let buf = frame_packet(self.config.framing, packet)?;

        let mut writer = connection.writer.lock().await;
        if let Err(e) = writer.write_all(&buf).await {
            let msg = format!("error sending to {:?}: {}", connection.remote_addr, e);
            warn!("{}", msg);
            connection.receive_task.abort();
            if to_disconnected(&self.state) {
                self.queue.notify(ConnectionEvent::Disconnected { remote: Some(connection.remote_addr), error: Some(Arc::new(e)) });
                self.queue.deactivate_later();
            }
            return Err(anyhow!(msg));
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// for waiting on state changes, e.g. for a disconnect by the peer
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// the address of the current connection's peer, if connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.current_connection()
            .map(|c| c.remote_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_connection()
            .map(|c| c.local_addr)
    }

    fn current_connection(&self) -> Option<&Connection> {
        if self.is_connected() {
            self.connection.as_ref()
        }
        else {
            None
        }
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.config
    }
}

impl EndPoint for TcpClient {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.receive_task.abort();
            if to_disconnected(&self.state) {
                self.queue.notify(ConnectionEvent::Disconnected { remote: Some(connection.remote_addr), error: None });
            }
        }
        self.queue.shut_down();
    }
}

async fn open_stream(host: &str, port: u16, nodelay: bool) -> io::Result<(TcpStream, SocketAddr, SocketAddr)> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(nodelay)?;
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    Ok((stream, remote_addr, local_addr))
}

/// returns `true` if this call changed the state from `Connected`, making the caller responsible
///  for reporting the disconnect
fn to_disconnected(state: &watch::Sender<ConnectionState>) -> bool {
    state.send_if_modified(|s| {
        if *s == ConnectionState::Connected {
            *s = ConnectionState::Disconnected;
            true
        }
        else {
            false
        }
    })
}

async fn read_connection(reader: OwnedReadHalf, remote_addr: SocketAddr, decoder: FrameDecoder, queue: DispatchQueue, state: Arc<watch::Sender<ConnectionState>>) {
    let error = match receive_loop(reader, remote_addr, decoder, queue.clone()).await {
        Ok(()) => {
            info!("connection closed by {:?}", remote_addr);
            None
        }
        Err(e) => {
            warn!("connection to {:?} failed: {}", remote_addr, e);
            Some(Arc::new(e))
        }
    };

    if to_disconnected(&state) {
        queue.notify(ConnectionEvent::Disconnected { remote: Some(remote_addr), error });
        queue.deactivate_later();
    }
}
