use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use rosc::OscPacket;
use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::config::{runtime_handle, TcpServerConfig};
use crate::dispatch_queue::DispatchQueue;
use crate::end_point::EndPoint;
use crate::framing::FrameDecoder;
use crate::handlers::{ConnectionEvent, NotificationHandler};
use crate::tcp::{frame_packet, receive_loop};

struct ClientConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    receive_task: JoinHandle<()>,
}

/// Connected clients by their remote address. Whoever removes a client from the map is
///  responsible for reporting its disconnect.
type Clients = Arc<RwLock<FxHashMap<SocketAddr, ClientConnection>>>;

struct RunningServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    clients: Clients,
}

/// Accepts OSC connections over TCP. Packets from all clients go through the server's single
///  dispatch queue, with the client's address as the sender.
///
/// Clients connecting and disconnecting are reported to the notification handler.
pub struct TcpServer {
    config: TcpServerConfig,
    runtime: Handle,
    queue: DispatchQueue,
    running: Option<RunningServer>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig) -> anyhow::Result<TcpServer> {
        config.validate()?;
        let runtime = runtime_handle(&config.runtime)?;
        let queue = DispatchQueue::spawn(config.bundle_mode, &runtime);

        Ok(TcpServer {
            config,
            runtime,
            queue,
            running: None,
        })
    }

    pub fn set_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        self.queue.set_notification_handler(handler);
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.running.is_some() {
            debug!("TCP server is already running");
            return Ok(());
        }

        let listener = TcpListener::bind(self.config.local_addr).await
            .with_context(|| format!("could not bind TCP server to {}", self.config.local_addr))?;
        let local_addr = listener.local_addr()?;

        self.queue.activate().await;

        let clients: Clients = Default::default();
        let accept_task = self.runtime.spawn(accept_loop(listener, self.config.clone(), clients.clone(), self.queue.clone(), self.runtime.clone()));
        info!("TCP server listening on {:?}", local_addr);

        self.running = Some(RunningServer {
            local_addr,
            accept_task,
            clients,
        });
        Ok(())
    }

    /// Stops accepting connections and closes all client connections. When this returns, no
    ///  handlers will be invoked any more.
    pub async fn stop(&mut self) {
        let Some(RunningServer { local_addr, accept_task, clients }) = self.running.take() else {
            debug!("TCP server is not running");
            return;
        };

        accept_task.abort();
        let _ = accept_task.await;

        let closed = clients.write().await
            .drain()
            .collect::<Vec<_>>();
        for (remote, client) in closed {
            close_connection(remote, client).await;
            self.queue.notify(ConnectionEvent::Disconnected { remote: Some(remote), error: None });
        }

        self.queue.deactivate().await;
        info!("TCP server on {:?} stopped", local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref()
            .map(|r| r.local_addr)
    }

    pub async fn connected_clients(&self) -> Vec<SocketAddr> {
        match &self.running {
            Some(running) => running.clients.read().await
                .keys()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Closes a client's connection gracefully. Returns `false` if there was no such client.
    pub async fn close_client(&self, remote: SocketAddr) -> bool {
        let Some(running) = &self.running else {
            return false;
        };

        let removed = running.clients.write().await.remove(&remote);
        match removed {
            Some(client) => {
                close_connection(remote, client).await;
                self.queue.notify(ConnectionEvent::Disconnected { remote: Some(remote), error: None });
                true
            }
            None => false,
        }
    }

    /// A write failure closes the client's connection, reporting the error to the notification
    ///  handler, and is returned.
    pub async fn send_to_client(&self, remote: SocketAddr, packet: &OscPacket) -> anyhow::Result<()> {
        let running = self.running.as_ref()
            .ok_or_else(|| anyhow!("TCP server is not running"))?;
        let buf = frame_packet(self.config.framing, packet)?;

        let writer = running.clients.read().await
            .get(&remote)
            .map(|c| c.writer.clone());
        let Some(writer) = writer else {
            bail!("no client connected from {:?}", remote);
        };

        let result = writer.lock().await.write_all(&buf).await;
        if let Err(e) = result {
            let msg = format!("error sending to {:?}: {}", remote, e);
            warn!("{}", msg);
            self.drop_client(running, remote, e).await;
            return Err(anyhow!(msg));
        }
        Ok(())
    }

    /// Sends a packet to all connected clients, returning the number of clients it was sent to.
    ///  Clients that fail are disconnected.
    pub async fn broadcast(&self, packet: &OscPacket) -> anyhow::Result<usize> {
        let running = self.running.as_ref()
            .ok_or_else(|| anyhow!("TCP server is not running"))?;
        let buf = frame_packet(self.config.framing, packet)?;

        let writers = running.clients.read().await
            .iter()
            .map(|(remote, c)| (*remote, c.writer.clone()))
            .collect::<Vec<_>>();

        let mut num_sent = 0;
        for (remote, writer) in writers {
            let result = writer.lock().await.write_all(&buf).await;
            match result {
                Ok(()) => num_sent += 1,
                Err(e) => {
                    warn!("error broadcasting to {:?}: {}", remote, e);
                    self.drop_client(running, remote, e).await;
                }
            }
        }
        Ok(num_sent)
    }

    async fn drop_client(&self, running: &RunningServer, remote: SocketAddr, e: std::io::Error) {
        let removed = running.clients.write().await.remove(&remote);
        if let Some(client) = removed {
            client.receive_task.abort();
            self.queue.notify(ConnectionEvent::Disconnected { remote: Some(remote), error: Some(Arc::new(e)) });
        }
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.config
    }
}

impl EndPoint for TcpServer {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.accept_task.abort();
            if let Ok(mut clients) = running.clients.try_write() {
                for (_, client) in clients.drain() {
                    client.receive_task.abort();
                }
            }
        }
        // covers readers that are still running if the client map was locked
        self.queue.shut_down();
    }
}

async fn close_connection(remote: SocketAddr, client: ClientConnection) {
    client.receive_task.abort();
    let _ = client.receive_task.await;
    if let Err(e) = client.writer.lock().await.shutdown().await {
        debug!("error shutting down connection to {:?}: {}", remote, e);
    }
}

async fn accept_loop(listener: TcpListener, config: TcpServerConfig, clients: Clients, queue: DispatchQueue, runtime: Handle) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => on_accepted(stream, remote, &config, &clients, &queue, &runtime).await,
            Err(e) => error!("error accepting TCP connection: {}", e),
        }
    }
}

async fn on_accepted(stream: TcpStream, remote: SocketAddr, config: &TcpServerConfig, clients: &Clients, queue: &DispatchQueue, runtime: &Handle) {
    debug!("accepted connection from {:?}", remote);
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        warn!("could not set TCP_NODELAY for {:?}: {}", remote, e);
    }

    let (reader, writer) = stream.into_split();

    // the reader removes itself when the connection ends, so it must not start before it is
    //  registered. Reporting the connection while registering pairs it with exactly one disconnect.
    let mut clients_guard = clients.write().await;
    let decoder = FrameDecoder::new(config.framing, config.max_frame_len);
    let receive_task = runtime.spawn(read_client(reader, remote, decoder, queue.clone(), clients.clone()));
    clients_guard.insert(remote, ClientConnection {
        writer: Arc::new(Mutex::new(writer)),
        receive_task,
    });
    queue.notify(ConnectionEvent::Connected { remote });
    drop(clients_guard);
}

async fn read_client(reader: OwnedReadHalf, remote: SocketAddr, decoder: FrameDecoder, queue: DispatchQueue, clients: Clients) {
    let error = match receive_loop(reader, remote, decoder, queue.clone()).await {
        Ok(()) => {
            debug!("client {:?} closed the connection", remote);
            None
        }
        Err(e) => {
            warn!("connection from {:?} failed: {}", remote, e);
            Some(Arc::new(e))
        }
    };

    if clients.write().await.remove(&remote).is_some() {
        queue.notify(ConnectionEvent::Disconnected { remote: Some(remote), error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_mode::BundleMode;
    use crate::config::TcpClientConfig;
    use crate::framing::FramingMode;
    use crate::tcp::tcp_client::{ConnectionState, TcpClient};
    use crate::test_util::{bundle, message_packet, recv_timeout, Recorded, RecordingHandler};
    use crate::time_tag::TimeTag;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn running_server(framing: FramingMode) -> (TcpServer, UnboundedReceiver<Recorded>) {
        let mut config = TcpServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.framing = framing;
        let mut server = TcpServer::new(config).unwrap();

        let (handler, recorded) = RecordingHandler::new();
        server.set_message_handler(Some(handler.clone()));
        server.set_bundle_handler(Some(handler.clone()));
        server.set_notification_handler(Some(handler));
        server.start().await.unwrap();
        (server, recorded)
    }

    async fn connected_client(server: &TcpServer) -> (TcpClient, UnboundedReceiver<Recorded>) {
        let mut config = TcpClientConfig::new("127.0.0.1", server.local_addr().unwrap().port());
        config.framing = server.config().framing;
        let mut client = TcpClient::new(config).unwrap();

        let (handler, recorded) = RecordingHandler::new();
        client.set_message_handler(Some(handler.clone()));
        client.set_notification_handler(Some(handler));
        client.connect(TIMEOUT).await.unwrap();
        (client, recorded)
    }

    #[rstest]
    #[case::length_prefixed(FramingMode::LengthPrefixed)]
    #[case::slip(FramingMode::Slip)]
    #[tokio::test]
    async fn test_client_to_server(#[case] framing: FramingMode) {
        let (mut server, mut server_recorded) = running_server(framing).await;
        let (mut client, _) = connected_client(&server).await;
        let client_addr = client.local_addr().unwrap();

        let event = recv_timeout(&mut server_recorded).await;
        assert!(event.event().is_connected());
        assert_eq!(event.event().remote(), Some(client_addr));

        client.send(&message_packet("/one")).await.unwrap();
        client.send(&message_packet("/two")).await.unwrap();

        match recv_timeout(&mut server_recorded).await {
            Recorded::Message { from, message, .. } => {
                assert_eq!(from, client_addr);
                assert_eq!(message.addr, "/one");
            }
            other => panic!("unexpected delivery {:?}", other),
        }
        assert_eq!(recv_timeout(&mut server_recorded).await.message().addr, "/two");

        client.close().await;
        let event = recv_timeout(&mut server_recorded).await;
        assert!(!event.event().is_connected());
        assert_eq!(event.event().remote(), Some(client_addr));
        assert!(server.connected_clients().await.is_empty());

        server.stop().await;
    }

    #[rstest]
    #[case::length_prefixed(FramingMode::LengthPrefixed)]
    #[case::slip(FramingMode::Slip)]
    #[tokio::test]
    async fn test_server_to_client(#[case] framing: FramingMode) {
        let (mut server, mut server_recorded) = running_server(framing).await;
        let (mut client, mut client_recorded) = connected_client(&server).await;
        let client_addr = client.local_addr().unwrap();

        assert!(recv_timeout(&mut server_recorded).await.event().is_connected());
        assert!(recv_timeout(&mut client_recorded).await.event().is_connected());
        assert_eq!(server.connected_clients().await, vec![client_addr]);

        server.send_to_client(client_addr, &message_packet("/direct")).await.unwrap();
        assert_eq!(server.broadcast(&message_packet("/everyone")).await.unwrap(), 1);

        assert_eq!(recv_timeout(&mut client_recorded).await.message().addr, "/direct");
        assert_eq!(recv_timeout(&mut client_recorded).await.message().addr, "/everyone");

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_forwarded_bundle_from_client() {
        let (mut server, mut server_recorded) = running_server(FramingMode::LengthPrefixed).await;
        server.set_bundle_mode(BundleMode::Forward);
        let (mut client, _) = connected_client(&server).await;
        assert!(recv_timeout(&mut server_recorded).await.event().is_connected());

        let packet = bundle(TimeTag::after(Duration::from_secs(60)), vec![message_packet("/a")]);
        client.send(&packet).await.unwrap();

        match recv_timeout(&mut server_recorded).await {
            Recorded::Bundle { bundle, .. } => assert_eq!(OscPacket::Bundle(bundle), packet),
            other => panic!("unexpected delivery {:?}", other),
        }

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients() {
        let (mut server, mut server_recorded) = running_server(FramingMode::Slip).await;
        let (client, mut client_recorded) = connected_client(&server).await;
        let mut client_state = client.subscribe_state();
        assert!(recv_timeout(&mut server_recorded).await.event().is_connected());
        assert!(recv_timeout(&mut client_recorded).await.event().is_connected());

        server.stop().await;
        assert!(!server.is_running());
        assert!(!recv_timeout(&mut server_recorded).await.event().is_connected());

        tokio::time::timeout(TIMEOUT, client_state.wait_for(|s| *s == ConnectionState::Disconnected)).await.unwrap().unwrap();
        assert!(!recv_timeout(&mut client_recorded).await.event().is_connected());
    }

    #[tokio::test]
    async fn test_connected_client_is_registered() {
        let (mut server, mut server_recorded) = running_server(FramingMode::LengthPrefixed).await;
        let (mut client, _) = connected_client(&server).await;

        // the event is posted only after the client can be addressed, so stop reports its disconnect
        let event = recv_timeout(&mut server_recorded).await;
        assert!(event.event().is_connected());
        assert_eq!(server.connected_clients().await, vec![event.event().remote().unwrap()]);

        server.stop().await;
        assert!(!recv_timeout(&mut server_recorded).await.event().is_connected());
        client.close().await;
    }

    #[tokio::test]
    async fn test_drop_discards_queued_packets() {
        let (server, mut server_recorded) = running_server(FramingMode::LengthPrefixed).await;
        let (_client, _) = connected_client(&server).await;
        let event = recv_timeout(&mut server_recorded).await;
        assert!(event.event().is_connected());

        let queue = server.dispatch_queue().clone();
        queue.dispatch(message_packet("/queued_before_drop"), event.event().remote().unwrap());
        drop(server);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(server_recorded.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_client() {
        let (mut server, mut server_recorded) = running_server(FramingMode::LengthPrefixed).await;
        let (client, _) = connected_client(&server).await;
        let client_addr = client.local_addr().unwrap();
        let mut client_state = client.subscribe_state();
        assert!(recv_timeout(&mut server_recorded).await.event().is_connected());

        assert!(server.close_client(client_addr).await);
        assert!(!server.close_client(client_addr).await);
        assert!(!recv_timeout(&mut server_recorded).await.event().is_connected());

        tokio::time::timeout(TIMEOUT, client_state.wait_for(|s| *s == ConnectionState::Disconnected)).await.unwrap().unwrap();

        // exactly one event per disconnect
        server.stop().await;
        assert!(server_recorded.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let (mut server, _) = running_server(FramingMode::LengthPrefixed).await;
        assert!(server.send_to_client(SocketAddr::from(([127, 0, 0, 1], 1)), &message_packet("/a")).await.is_err());
        assert_eq!(server.broadcast(&message_packet("/a")).await.unwrap(), 0);
        server.stop().await;

        assert!(server.broadcast(&message_packet("/a")).await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let (mut server, _) = running_server(FramingMode::LengthPrefixed).await;
        let local_addr = server.local_addr();
        server.start().await.unwrap();
        assert_eq!(server.local_addr(), local_addr);

        server.stop().await;
        server.stop().await;
        assert_eq!(server.local_addr(), None);

        // the port is released
        let mut config = TcpServerConfig::new(local_addr.unwrap());
        config.framing = FramingMode::LengthPrefixed;
        let mut restarted = TcpServer::new(config).unwrap();
        restarted.start().await.unwrap();
        restarted.stop().await;
    }
}
