//! In-process realtime fan-out.
//!
//! Subscribers register on a channel name and receive batches of [`OtOp`]s
//! over an unbounded tokio channel. Publishing to `collection.doc` notifies
//! the document channel and then the collection channel. Dropping a
//! [`Subscription`] unregisters it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use super::change::{collection_channel, document_channel, translate, Change, OtOp};
use crate::ports::ChangeSink;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Subscribers = DashMap<String, Vec<(SubscriberId, UnboundedSender<Vec<OtOp>>)>>;

/// Channel registry shared by every clone of the hub.
#[derive(Clone, Default)]
pub struct RealtimeHub {
    channels: Arc<Subscribers>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel (see [`collection_channel`] and [`document_channel`]).
    pub fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(channel.clone())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            channel,
            receiver: rx,
            hub: Arc::downgrade(&self.channels),
        }
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    fn send(&self, channel: &str, ops: &[OtOp]) -> usize {
        let Some(mut subs) = self.channels.get_mut(channel) else {
            return 0;
        };
        // A closed receiver means the subscription is being dropped.
        subs.retain(|(_, tx)| tx.send(ops.to_vec()).is_ok());
        subs.len()
    }
}

impl ChangeSink for RealtimeHub {
    fn publish(&self, collection: &str, document_id: &str, changes: &[Change]) {
        let ops: Vec<OtOp> = changes.iter().flat_map(translate).collect();
        if ops.is_empty() {
            return;
        }

        let doc = self.send(&document_channel(collection, document_id), &ops);
        let coll = self.send(&collection_channel(collection), &ops);
        trace!(collection, document_id, ops = ops.len(), doc, coll, "published");
    }
}

/// A live subscription. Dropping it unregisters from the hub.
pub struct Subscription {
    id: SubscriberId,
    channel: String,
    receiver: UnboundedReceiver<Vec<OtOp>>,
    hub: Weak<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next batch of ops.
    pub async fn recv(&mut self) -> Option<Vec<OtOp>> {
        self.receiver.recv().await
    }

    /// Take the next batch if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<OtOp>> {
        match self.receiver.try_recv() {
            Ok(ops) => Some(ops),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every batch queued so far, flattened.
    pub fn drain(&mut self) -> Vec<OtOp> {
        let mut out = Vec::new();
        while let Some(ops) = self.try_recv() {
            out.extend(ops);
        }
        out
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.hub.upgrade() else {
            return;
        };
        let now_empty = match channels.get_mut(&self.channel) {
            Some(mut subs) => {
                subs.retain(|(id, _)| *id != self.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            channels.remove_if(&self.channel, |_, subs| subs.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::PathSegment;
    use serde_json::json;

    #[test]
    fn subscriber_ids_are_unique() {
        assert_ne!(SubscriberId::new(), SubscriberId::new());
    }

    #[test]
    fn document_and_collection_both_notified() {
        let hub = RealtimeHub::new();
        let mut doc = hub.subscribe(document_channel("rec_tblA", "rec1"));
        let mut coll = hub.subscribe(collection_channel("rec_tblA"));
        let mut other = hub.subscribe(document_channel("rec_tblA", "rec2"));

        hub.publish("rec_tblA", "rec1", &[Change::set(["fldTotal"], json!(30))]);

        assert_eq!(doc.drain().len(), 1);
        assert_eq!(coll.drain().len(), 1);
        assert!(other.drain().is_empty());
    }

    #[test]
    fn delete_ops_arrive_high_to_low() {
        let hub = RealtimeHub::new();
        let mut doc = hub.subscribe(document_channel("rec_tblA", "rec1"));

        hub.publish(
            "rec_tblA",
            "rec1",
            &[Change::Delete {
                path: vec!["tags".into()],
                index: 0,
                count: 2,
            }],
        );

        let ops = doc.drain();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].path()[1], PathSegment::Index(1));
        assert_eq!(ops[1].path()[1], PathSegment::Index(0));
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = RealtimeHub::new();
        let channel = collection_channel("rec_tblA");
        let first = hub.subscribe(channel.clone());
        let second = hub.subscribe(channel.clone());
        assert_eq!(hub.subscriber_count(&channel), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(&channel), 1);
        drop(second);
        assert_eq!(hub.subscriber_count(&channel), 0);
    }

    #[tokio::test]
    async fn recv_awaits_publication() {
        let hub = RealtimeHub::new();
        let mut sub = hub.subscribe("rec_tblA");
        let publisher = hub.clone();

        tokio::spawn(async move {
            publisher.publish("rec_tblA", "rec9", &[Change::set(["fld"], json!(1))]);
        });

        let ops = sub.recv().await.unwrap();
        assert!(matches!(ops[0], OtOp::ObjectReplace { .. }));
    }
}
