//! Receiving and sending [OSC](https://opensoundcontrol.stanford.edu/) packets over UDP and TCP,
//!  with time tag aware dispatch of bundles.
//!
//! There are four endpoints: [UdpServer], [UdpPeer], [TcpServer] and [TcpClient]. Each of them
//!  owns a dispatch queue that delivers received packets to the registered handlers, one at a
//!  time. How bundles are delivered depends on the endpoint's [BundleMode]:
//!
//! * `Forward` passes bundles to the [BundleHandler] as they arrived
//! * `Unwrap(Ignore)` passes each contained message to the [MessageHandler] immediately
//! * `Unwrap(Osc1_0)` passes each contained message to the [MessageHandler] when the bundle's
//!   time tag is due
//!
//! Encoding and decoding of OSC packets is done by `rosc`.

pub mod bundle_mode;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod dispatch_queue;
pub mod end_point;
pub mod framing;
pub mod handlers;
pub mod tcp;
pub mod time_tag;
pub mod udp;

#[cfg(test)] mod test_util;

pub use bundle_mode::{BundleMode, TimeTagMode};
pub use config::{TcpClientConfig, TcpServerConfig, UdpPeerConfig, UdpServerConfig};
pub use end_point::EndPoint;
pub use framing::FramingMode;
pub use handlers::{BundleHandler, ConnectionEvent, MessageHandler, NotificationHandler};
pub use tcp::tcp_client::{ConnectionState, TcpClient};
pub use tcp::tcp_server::TcpServer;
pub use time_tag::TimeTag;
pub use udp::udp_peer::UdpPeer;
pub use udp::udp_server::UdpServer;
