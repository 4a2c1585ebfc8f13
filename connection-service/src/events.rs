//! Outbound notification channels.
//!
//! Connect outcomes go to the configuration bridge, visibility changes go to
//! the tree view. Both are broadcast channels: publishing never blocks and
//! having no subscriber is not an error.

use common::models::event::{ConnectionEvent, TreeNotice};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventHub {
    events: broadcast::Sender<ConnectionEvent>,
    tree: broadcast::Sender<TreeNotice>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (tree, _) = broadcast::channel(capacity.max(1));
        Self { events, tree }
    }

    /// Returns whether any subscriber received the event.
    pub fn publish(&self, event: ConnectionEvent) -> bool {
        match self.events.send(event) {
            Ok(_) => true,
            Err(_) => {
                tracing::debug!("no bridge subscriber for connection event");
                false
            }
        }
    }

    /// Returns whether any subscriber received the notice.
    pub fn notify_tree(&self, notice: TreeNotice) -> bool {
        match self.tree.send(notice) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(notice = ?err.0, "tree view not listening");
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_tree(&self) -> broadcast::Receiver<TreeNotice> {
        self.tree.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let hub = EventHub::new(4);
        assert!(!hub.publish(ConnectionEvent::success("id", "key")));
        assert!(!hub.notify_tree(TreeNotice::Refresh));
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let hub = EventHub::new(4);
        let mut rx = hub.subscribe();
        hub.publish(ConnectionEvent::success("a", "a"));
        hub.publish(ConnectionEvent::success("b", "b"));
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::success("a", "a"));
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::success("b", "b"));
    }
}
