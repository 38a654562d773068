use clap::Parser;
use clap_derive::ValueEnum;
use async_trait::async_trait;
use osc_dispatch::{BundleHandler, BundleMode, ConnectionEvent, EndPoint, FramingMode, MessageHandler, NotificationHandler, TcpClient, TcpClientConfig, TcpServer, TcpServerConfig, TimeTag, UdpServer, UdpServerConfig};
use rosc::{OscBundle, OscMessage};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Udp,
    TcpServer,
    TcpClient,
}

#[derive(Clone, Copy, ValueEnum)]
enum Framing {
    Length,
    Slip,
}

/// Logs all OSC traffic arriving at an endpoint
#[derive(Parser)]
struct Args {
    #[clap(value_enum)]
    transport: Transport,

    /// address to listen on, or to connect to for `tcp-client`
    address: SocketAddr,

    /// forward | unwrap | unwrap-ignore
    #[clap(long, default_value = "unwrap")]
    bundle_mode: BundleMode,

    #[clap(long, value_enum, default_value = "length")]
    framing: Framing,

    /// multicast group to join (UDP only)
    #[clap(long)]
    multicast: Vec<IpAddr>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_message(&self, from: SocketAddr, message: OscMessage) {
        info!("{} {} {:?}", from, message.addr, message.args);
    }
}

#[async_trait]
impl BundleHandler for LoggingHandler {
    async fn on_bundle(&self, from: SocketAddr, bundle: OscBundle) {
        info!("{} bundle @ {} with {} elements", from, TimeTag::from(bundle.timetag), bundle.content.len());
    }
}

#[async_trait]
impl NotificationHandler for LoggingHandler {
    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event.error() {
            Some(e) => warn!("{:?}: {}", event.remote(), e),
            None => info!("{:?} {}", event.remote(), if event.is_connected() { "connected" } else { "disconnected" }),
        }
    }
}

fn register(end_point: &impl EndPoint, handler: &Arc<LoggingHandler>) {
    end_point.set_message_handler(Some(handler.clone()));
    end_point.set_bundle_handler(Some(handler.clone()));
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let framing = match args.framing {
        Framing::Length => FramingMode::LengthPrefixed,
        Framing::Slip => FramingMode::Slip,
    };
    let handler = Arc::new(LoggingHandler);

    match args.transport {
        Transport::Udp => {
            let mut config = UdpServerConfig::new(args.address);
            config.bundle_mode = args.bundle_mode;
            config.multicast_groups = args.multicast;

            let mut server = UdpServer::new(config)?;
            register(&server, &handler);
            server.start().await?;
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }
        Transport::TcpServer => {
            let mut config = TcpServerConfig::new(args.address);
            config.bundle_mode = args.bundle_mode;
            config.framing = framing;

            let mut server = TcpServer::new(config)?;
            register(&server, &handler);
            server.set_notification_handler(Some(handler.clone()));
            server.start().await?;
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }
        Transport::TcpClient => {
            let mut config = TcpClientConfig::new(args.address.ip().to_string(), args.address.port());
            config.bundle_mode = args.bundle_mode;
            config.framing = framing;

            let mut client = TcpClient::new(config)?;
            register(&client, &handler);
            client.set_notification_handler(Some(handler.clone()));
            client.connect(Duration::from_secs(5)).await?;
            tokio::signal::ctrl_c().await?;
            client.close().await;
        }
    }
    Ok(())
}
