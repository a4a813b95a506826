//! Delivery of incoming application messages to registered receivers
//!
//! Filtered receivers get every message whose topic matches their filter.
//! Unfiltered receivers only get messages no filtered receiver took.
//! Channels are unbounded so delivery never waits on a slow consumer; the
//! transport event pump also carries disconnect events.

use crate::transport::{topic_matches, IncomingMessage};
use tokio::sync::mpsc;

pub type MessageReceiver = mpsc::UnboundedReceiver<IncomingMessage>;
type MessageSender = mpsc::UnboundedSender<IncomingMessage>;

#[derive(Debug, Default)]
pub(crate) struct MessageRouter {
    filtered: Vec<(String, MessageSender)>,
    unfiltered: Vec<MessageSender>,
}

impl MessageRouter {
    pub(crate) fn add_filtered(&mut self, filter: &str) -> MessageReceiver {
        self.filtered.retain(|(_, tx)| !tx.is_closed());
        let (tx, rx) = mpsc::unbounded_channel();
        self.filtered.push((filter.to_string(), tx));
        rx
    }

    pub(crate) fn add_unfiltered(&mut self) -> MessageReceiver {
        self.unfiltered.retain(|tx| !tx.is_closed());
        let (tx, rx) = mpsc::unbounded_channel();
        self.unfiltered.push(tx);
        rx
    }

    /// Deliver `message` and return how many receivers got it. Receivers
    /// whose other end was dropped are pruned.
    pub(crate) fn dispatch(&mut self, message: &IncomingMessage) -> usize {
        let mut delivered = 0;
        self.filtered.retain(|(filter, tx)| {
            if !topic_matches(filter, &message.topic) {
                return !tx.is_closed();
            }
            let sent = tx.send(message.clone()).is_ok();
            delivered += usize::from(sent);
            sent
        });
        if delivered > 0 {
            return delivered;
        }

        self.unfiltered.retain(|tx| {
            let sent = tx.send(message.clone()).is_ok();
            delivered += usize::from(sent);
            sent
        });
        delivered
    }

    pub(crate) fn clear(&mut self) {
        self.filtered.clear();
        self.unfiltered.clear();
    }
}
