//! Broadcast fan-out
//!
//! Every text message is tagged with the pathway tag and the sender's id and
//! offered to every registered connection, the sender included.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::ProtocolError;
use super::registry::{ConnectionId, Registry};

/// Full-width colon between the sender id and the text
const SEPARATOR: &str = "：";

/// Outcome of a single broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients the message was queued for
    pub delivered: usize,
    /// Recipients skipped and evicted
    pub failed: usize,
}

/// Longest prefix `compose` can put in front of a message tagged `tag`
pub fn prefix_overhead(tag: &str) -> usize {
    // "[" tag "] " id SEPARATOR, with the widest possible id
    tag.len() + 3 + u64::MAX.to_string().len() + SEPARATOR.len()
}

/// Writes tagged copies of a message to every registered connection
pub struct Dispatcher {
    registry: Arc<Registry>,
    tag: String,
    max_message_size: usize,
}

impl Dispatcher {
    /// `max_text_size` is the largest text a client may send; outgoing
    /// messages are allowed room for the prefix on top of it.
    pub fn new(registry: Arc<Registry>, tag: impl Into<String>, max_text_size: usize) -> Self {
        let tag = tag.into();
        Self {
            max_message_size: max_text_size + prefix_overhead(&tag),
            registry,
            tag,
        }
    }

    /// Largest message this dispatcher will hand to a recipient
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Format the outgoing message for a sender
    pub fn compose(&self, origin: ConnectionId, text: &str) -> String {
        format!("[{}] {}{}{}", self.tag, origin, SEPARATOR, text)
    }

    /// Offer a message to every registered connection.
    ///
    /// A recipient that cannot take the message is skipped and told to tear
    /// itself down; the remaining recipients still get their copy. A message
    /// too large to send is refused here, before any recipient sees it.
    pub async fn broadcast(
        &self,
        origin: ConnectionId,
        text: &str,
    ) -> Result<DispatchReport, ProtocolError> {
        let composed = self.compose(origin, text);
        if composed.len() > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                size: composed.len(),
                max: self.max_message_size,
            });
        }

        let message: Arc<str> = Arc::from(composed);
        let mut report = DispatchReport::default();

        for handle in self.registry.snapshot().await {
            match handle.deliver(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Failed to deliver broadcast from {} to {}: {}",
                        origin,
                        handle.id(),
                        e
                    );
                    handle.evict();
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Broadcast from {} delivered to {} connections ({} failed)",
            origin, report.delivered, report.failed
        );
        Ok(report)
    }
}
