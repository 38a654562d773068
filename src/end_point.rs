use std::sync::Arc;
use async_trait::async_trait;
use crate::bundle_mode::BundleMode;
use crate::dispatch_queue::DispatchQueue;
use crate::handlers::{BundleHandler, MessageHandler};

/// The functionality shared by all endpoints: bundle mode and handler registration.
///
/// Changes are posted to the endpoint's dispatch queue and take effect for all packets that are
///  dispatched after them. Packets that are already waiting in the queue may still see the
///  previous setting.
#[async_trait]
pub trait EndPoint: Send + Sync {
    fn dispatch_queue(&self) -> &DispatchQueue;

    fn set_bundle_mode(&self, bundle_mode: BundleMode) {
        self.dispatch_queue().set_bundle_mode(bundle_mode);
    }

    async fn bundle_mode(&self) -> anyhow::Result<BundleMode> {
        self.dispatch_queue().bundle_mode().await
    }

    /// `None` removes the handler, dropping messages until a new handler is registered
    fn set_message_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        self.dispatch_queue().set_message_handler(handler);
    }

    fn set_bundle_handler(&self, handler: Option<Arc<dyn BundleHandler>>) {
        self.dispatch_queue().set_bundle_handler(handler);
    }
}
