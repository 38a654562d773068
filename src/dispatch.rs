//! The dispatch engine: decides in which shape and at what time a decoded packet reaches
//!  application code.
//!
//! A top-level message is always delivered immediately. For a top-level bundle, the endpoint's
//!  [BundleMode] decides:
//! * `Forward` hands the bundle to the bundle handler as a whole, without looking inside
//! * `Unwrap(time_tag_mode)` flattens the bundle recursively, delivering each message
//!   individually. The top-level bundle establishes the time tag mode and time tag for its entire
//!   subtree: nested bundles do not consult the bundle mode again, and their messages are
//!   delivered at the time of the outermost bundle.
//!
//! Resolving is a pure function of the packet, the bundle mode and the current wall clock time;
//!  actually invoking handlers (possibly after a delay) is the dispatch queue's job.

use std::time::{Duration, SystemTime};
use rosc::{OscBundle, OscMessage, OscPacket};
use crate::bundle_mode::{BundleMode, TimeTagMode};
use crate::time_tag::TimeTag;

/// A single delivery to application code, resolved from an incoming packet
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// `delay` is `None` for immediate delivery
    Message { message: OscMessage, delay: Option<Duration> },
    Bundle(OscBundle),
}

/// The policy established by a top-level bundle for its subtree
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct UnwrapContext {
    mode: TimeTagMode,
    time_tag: TimeTag,
}

impl UnwrapContext {
    fn delay(&self, now: SystemTime) -> Option<Duration> {
        match self.mode {
            TimeTagMode::Ignore => None,
            TimeTagMode::Osc1_0 => {
                if self.time_tag.is_immediate() || !self.time_tag.is_future(now) {
                    None
                }
                else {
                    // None if the time tag became due between the two checks
                    self.time_tag.duration_since(now)
                }
            }
        }
    }
}

/// Resolves an incoming packet into deliveries, in the order they were contained in the packet.
pub fn resolve(packet: OscPacket, bundle_mode: BundleMode, now: SystemTime) -> Vec<Delivery> {
    let bundle = match packet {
        OscPacket::Message(message) => return vec![Delivery::Message { message, delay: None }],
        OscPacket::Bundle(bundle) => bundle,
    };

    let mode = match bundle_mode {
        BundleMode::Forward => return vec![Delivery::Bundle(bundle)],
        BundleMode::Unwrap(mode) => mode,
    };

    let context = UnwrapContext {
        mode,
        time_tag: bundle.timetag.into(),
    };
    let delay = context.delay(now);

    let mut deliveries = Vec::new();

    // depth-first, preserving sibling order
    let mut worklist = vec![bundle.content.into_iter()];
    while let Some(children) = worklist.last_mut() {
        match children.next() {
            None => {
                worklist.pop();
            }
            Some(OscPacket::Message(message)) => {
                deliveries.push(Delivery::Message { message, delay });
            }
            Some(OscPacket::Bundle(nested)) => {
                worklist.push(nested.content.into_iter());
            }
        }
    }

    deliveries
}
