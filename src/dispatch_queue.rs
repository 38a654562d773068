//! Every endpoint owns a dispatch queue: a task that exclusively owns the endpoint's bundle mode,
//!  its handler slots and its activation state, and that executes all deliveries to application
//!  code in order, one at a time.
//!
//! All interaction with the queue is by posting [Command]s to it. This covers socket reader tasks
//!  handing over decoded packets, handler and bundle mode changes, and deferred deliveries. Since
//!  the queue is the only place that touches this state, there is no locking and no data race.
//!
//! Deliveries for bundles with a time tag in the future are deferred by a timer task that posts
//!  the message back to the queue when it is due. Timers are never cancelled. Instead, each
//!  deferred delivery carries the activation epoch it was scheduled in, and the queue drops it if
//!  the endpoint was stopped (or stopped and restarted) in the meantime.
//!
//! Dropping an endpoint shuts its queue down. This takes effect immediately, also for packets that
//!  are already waiting in the queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use rosc::{OscBundle, OscMessage, OscPacket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;
use crate::bundle_mode::BundleMode;
use crate::codec;
use crate::dispatch::{resolve, Delivery};
use crate::handlers::{BundleHandler, ConnectionEvent, MessageHandler, NotificationHandler};

pub(crate) enum Command {
    SetBundleMode(BundleMode),
    GetBundleMode(oneshot::Sender<BundleMode>),
    SetMessageHandler(Option<Arc<dyn MessageHandler>>),
    SetBundleHandler(Option<Arc<dyn BundleHandler>>),
    SetNotificationHandler(Option<Arc<dyn NotificationHandler>>),
    Activate(oneshot::Sender<()>),
    Deactivate(Option<oneshot::Sender<()>>),
    Packet { packet: OscPacket, from: SocketAddr },
    Deferred { message: OscMessage, from: SocketAddr, epoch: u64 },
    Notify(ConnectionEvent),
}

/// A handle to an endpoint's dispatch queue. The queue terminates when the last handle is dropped.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<Command>,
    shut_down: Arc<AtomicBool>,
}

impl DispatchQueue {
    pub(crate) fn spawn(bundle_mode: BundleMode, runtime: &Handle) -> DispatchQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shut_down = Arc::new(AtomicBool::new(false));

        let state = QueueState {
            bundle_mode,
            message_handler: None,
            bundle_handler: None,
            notification_handler: None,
            active: false,
            epoch: 0,
            shut_down: shut_down.clone(),
            self_sender: sender.downgrade(),
        };
        runtime.spawn(state.run(receiver));

        DispatchQueue { sender, shut_down }
    }

    fn post(&self, command: Command) {
        if self.sender.send(command).is_err() {
            warn!("dispatch queue terminated - dropping command");
        }
    }

    pub fn set_bundle_mode(&self, bundle_mode: BundleMode) {
        self.post(Command::SetBundleMode(bundle_mode));
    }

    /// The bundle mode as seen by the queue, i.e. including all changes posted before this call
    pub async fn bundle_mode(&self) -> anyhow::Result<BundleMode> {
        let (send, recv) = oneshot::channel();
        self.post(Command::GetBundleMode(send));
        Ok(recv.await?)
    }

    pub fn set_message_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        self.post(Command::SetMessageHandler(handler));
    }

    pub fn set_bundle_handler(&self, handler: Option<Arc<dyn BundleHandler>>) {
        self.post(Command::SetBundleHandler(handler));
    }

    pub fn set_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        self.post(Command::SetNotificationHandler(handler));
    }

    /// starts accepting packets, returning after the queue processed the activation
    pub(crate) async fn activate(&self) {
        let (send, recv) = oneshot::channel();
        self.post(Command::Activate(send));
        let _ = recv.await;
    }

    /// Stops accepting packets and drops all pending deferred deliveries. When this returns, no
    ///  more deliveries to handlers will happen until the queue is activated again.
    pub(crate) async fn deactivate(&self) {
        let (send, recv) = oneshot::channel();
        self.post(Command::Deactivate(Some(send)));
        let _ = recv.await;
    }

    /// for reader tasks that detect a broken connection and can not wait for the acknowledgement
    pub(crate) fn deactivate_later(&self) {
        self.post(Command::Deactivate(None));
    }

    /// Deactivates the queue for good, without waiting. Packets and deferred deliveries that are
    ///  still queued are dropped, connection events are still delivered.
    pub(crate) fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.post(Command::Deactivate(None));
    }

    pub(crate) fn dispatch(&self, packet: OscPacket, from: SocketAddr) {
        self.post(Command::Packet { packet, from });
    }

    /// Decodes a raw packet and posts it for dispatch. Undecodable packets are logged and dropped.
    pub(crate) fn decode_and_dispatch(&self, buf: &[u8], from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received packet from {:?}: {:?}", from, buf);

        match codec::decode_packet(buf) {
            Ok(packet) => self.dispatch(packet, from),
            Err(e) => warn!("dropping packet from {:?}: {}", from, e),
        }
    }

    pub(crate) fn notify(&self, event: ConnectionEvent) {
        self.post(Command::Notify(event));
    }
}

struct QueueState {
    bundle_mode: BundleMode,
    message_handler: Option<Arc<dyn MessageHandler>>,
    bundle_handler: Option<Arc<dyn BundleHandler>>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,

    active: bool,
    /// incremented on every activation, invalidating deferred deliveries from previous activations
    epoch: u64,
    /// set when the owning endpoint is dropped, shared with all handles
    shut_down: Arc<AtomicBool>,

    /// weak to let the queue terminate while timers are pending
    self_sender: mpsc::WeakUnboundedSender<Command>,
}

impl QueueState {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            self.on_command(command).await;
        }
        debug!("dispatch queue terminated");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetBundleMode(bundle_mode) => {
                debug!("bundle mode: {}", bundle_mode);
                self.bundle_mode = bundle_mode;
            }
            Command::GetBundleMode(reply) => {
                let _ = reply.send(self.bundle_mode);
            }
            Command::SetMessageHandler(handler) => self.message_handler = handler,
            Command::SetBundleHandler(handler) => self.bundle_handler = handler,
            Command::SetNotificationHandler(handler) => self.notification_handler = handler,
            Command::Activate(reply) => {
                self.active = true;
                self.epoch += 1;
                let _ = reply.send(());
            }
            Command::Deactivate(reply) => {
                self.active = false;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Packet { packet, from } => self.handle(packet, from).await,
            Command::Deferred { message, from, epoch } => {
                if self.is_active() && epoch == self.epoch {
                    self.deliver_message(from, message).await;
                }
                else {
                    debug!("endpoint was stopped - dropping deferred message {} from {:?}", message.addr, from);
                }
            }
            Command::Notify(event) => {
                if let Some(handler) = &self.notification_handler {
                    handler.on_connection_event(event).await;
                }
            }
        }
    }

    async fn handle(&mut self, packet: OscPacket, from: SocketAddr) {
        if !self.is_active() {
            debug!("endpoint is not active - dropping packet from {:?}", from);
            return;
        }

        for delivery in resolve(packet, self.bundle_mode, SystemTime::now()) {
            match delivery {
                Delivery::Message { message, delay: None } => self.deliver_message(from, message).await,
                Delivery::Message { message, delay: Some(delay) } => {
                    trace!("deferring message {} from {:?} by {:?}", message.addr, from, delay);
                    self.schedule(Instant::now() + delay, message, from);
                }
                Delivery::Bundle(bundle) => self.deliver_bundle(from, bundle).await,
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active && !self.shut_down.load(Ordering::Acquire)
    }

    fn schedule(&self, deadline: Instant, message: OscMessage, from: SocketAddr) {
        let queue = self.self_sender.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(sender) = queue.upgrade() {
                let _ = sender.send(Command::Deferred { message, from, epoch });
            }
        });
    }

    async fn deliver_message(&self, from: SocketAddr, message: OscMessage) {
        match &self.message_handler {
            Some(handler) => handler.on_message(from, message).await,
            None => trace!("no message handler - dropping message {} from {:?}", message.addr, from),
        }
    }

    async fn deliver_bundle(&self, from: SocketAddr, bundle: OscBundle) {
        match &self.bundle_handler {
            Some(handler) => handler.on_bundle(from, bundle).await,
            None => trace!("no bundle handler - dropping bundle from {:?}", from),
        }
    }
}
