use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rosc::{OscBundle, OscMessage};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives individual messages, either top-level messages or messages unwrapped from bundles.
///
/// Handlers are invoked on their endpoint's dispatch queue, one at a time and never concurrently
///  for the same endpoint. A handler that blocks delays all further deliveries of its endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, message: OscMessage);
}

/// Receives bundles as they arrived on the wire, for endpoints in `BundleMode::Forward`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleHandler: Send + Sync + 'static {
    async fn on_bundle(&self, from: SocketAddr, bundle: OscBundle);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn on_connection_event(&self, event: ConnectionEvent);
}

/// Connection lifecycle events of TCP endpoints
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected {
        remote: SocketAddr,
    },
    /// `remote` is `None` if a connection attempt failed before the peer's address was known.
    ///  `error` is `None` for a regular close by either side.
    Disconnected {
        remote: Option<SocketAddr>,
        error: Option<Arc<io::Error>>,
    },
}

impl ConnectionEvent {
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            ConnectionEvent::Connected { remote } => Some(*remote),
            ConnectionEvent::Disconnected { remote, .. } => *remote,
        }
    }

    pub fn error(&self) -> Option<&io::Error> {
        match self {
            ConnectionEvent::Connected { .. } => None,
            ConnectionEvent::Disconnected { error, .. } => error.as_deref(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected { .. })
    }
}
