use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rosc::{OscBundle, OscMessage, OscPacket, OscType};
use tokio::sync::mpsc;
use tokio::time::Instant;
use crate::handlers::{BundleHandler, ConnectionEvent, MessageHandler, NotificationHandler};
use crate::time_tag::TimeTag;

pub fn test_addr() -> SocketAddr {
    SocketAddr::from(([1, 2, 3, 4], 9000))
}

pub fn message(addr: &str) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args: vec![OscType::Int(7), OscType::String("x".to_string())],
    }
}

pub fn message_packet(addr: &str) -> OscPacket {
    OscPacket::Message(message(addr))
}

pub fn bundle(time_tag: TimeTag, content: Vec<OscPacket>) -> OscPacket {
    OscPacket::Bundle(OscBundle {
        timetag: time_tag.into(),
        content,
    })
}

#[derive(Debug)]
pub enum Recorded {
    Message { from: SocketAddr, message: OscMessage, at: Instant },
    Bundle { from: SocketAddr, bundle: OscBundle, at: Instant },
    Event { event: ConnectionEvent, at: Instant },
}

impl Recorded {
    pub fn message(&self) -> &OscMessage {
        match self {
            Recorded::Message { message, .. } => message,
            other => panic!("expected a message, was {:?}", other),
        }
    }

    pub fn event(&self) -> &ConnectionEvent {
        match self {
            Recorded::Event { event, .. } => event,
            other => panic!("expected a connection event, was {:?}", other),
        }
    }

    pub fn at(&self) -> Instant {
        match self {
            Recorded::Message { at, .. } => *at,
            Recorded::Bundle { at, .. } => *at,
            Recorded::Event { at, .. } => *at,
        }
    }
}

/// Records everything it receives, with the (tokio) time of receipt
pub struct RecordingHandler {
    sender: mpsc::UnboundedSender<Recorded>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<Recorded>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { sender }), receiver)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, from: SocketAddr, message: OscMessage) {
        let _ = self.sender.send(Recorded::Message { from, message, at: Instant::now() });
    }
}

#[async_trait]
impl BundleHandler for RecordingHandler {
    async fn on_bundle(&self, from: SocketAddr, bundle: OscBundle) {
        let _ = self.sender.send(Recorded::Bundle { from, bundle, at: Instant::now() });
    }
}

#[async_trait]
impl NotificationHandler for RecordingHandler {
    async fn on_connection_event(&self, event: ConnectionEvent) {
        let _ = self.sender.send(Recorded::Event { event, at: Instant::now() });
    }
}

/// for tests with real sockets
pub async fn recv_timeout(receiver: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("recording handler was dropped")
}
