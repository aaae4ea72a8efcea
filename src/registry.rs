//! Active subscription bookkeeping
//!
//! The registry knows nothing about sockets. It is the source of truth for
//! which subscriptions the caller still holds, and it is read afresh on every
//! handshake to decide what to replay.

use crate::error::{CredentialError, RealtimeError, Result};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Where payloads for one subscription are delivered
pub(crate) type PayloadSink = mpsc::UnboundedSender<Result<serde_json::Value>>;

#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) query: String,
    sink: PayloadSink,
}

/// Subscriptions keyed by a per-registry counter.
///
/// Ids only ever grow, so key order is registration order.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    entries: BTreeMap<u64, SubscriptionEntry>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Store a subscription under a fresh id
    pub(crate) fn register(&mut self, query: impl Into<String>, sink: PayloadSink) -> String {
        let key = self.next_id;
        self.next_id += 1;
        let id = key.to_string();
        self.entries.insert(
            key,
            SubscriptionEntry {
                id: id.clone(),
                query: query.into(),
                sink,
            },
        );
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub(crate) fn remove(&mut self, id: &str) -> Option<SubscriptionEntry> {
        let key = parse_key(id)?;
        if self.entries.get(&key)?.id != id {
            return None;
        }
        self.entries.remove(&key)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn get(&self, id: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(&parse_key(id)?).filter(|e| e.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registration order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.entries.values()
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<String> {
        self.iter().map(|e| e.id.clone()).collect()
    }

    /// Hand a payload to the subscription with this id.
    ///
    /// Returns whether such a subscription exists. A subscriber that has
    /// already dropped its stream still counts; its unsubscribe is queued.
    pub(crate) fn dispatch(&self, id: &str, payload: serde_json::Value) -> bool {
        match self.get(id) {
            Some(entry) => {
                let _ = entry.sink.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Terminate every subscription with a credential error and forget them
    pub(crate) fn fail_all(&mut self, error: &CredentialError) {
        for entry in std::mem::take(&mut self.entries).into_values() {
            let _ = entry
                .sink
                .send(Err(RealtimeError::Credential(error.clone())));
        }
    }
}

/// Ids are rendered counters; anything else cannot be ours
fn parse_key(id: &str) -> Option<u64> {
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink() -> (PayloadSink, mpsc::UnboundedReceiver<Result<serde_json::Value>>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_ids_are_sequential_strings() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();

        assert_eq!(registry.register("a", tx.clone()), "1");
        assert_eq!(registry.register("b", tx.clone()), "2");
        assert_eq!(registry.register("c", tx), "3");
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();

        let first = registry.register("a", tx.clone());
        registry.remove(&first);
        assert_eq!(registry.register("b", tx), "2");
    }

    #[test]
    fn test_iteration_follows_registration_order() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();

        for query in ["one", "two", "three", "four"] {
            registry.register(query, tx.clone());
        }
        registry.remove("2");

        let queries: Vec<&str> = registry.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["one", "three", "four"]);
        assert_eq!(registry.ids(), vec!["1", "3", "4"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();
        let id = registry.register("a", tx);

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.remove("does-not-exist").is_none());
        assert!(registry.remove("-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_requires_exact_id() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();
        registry.register("a", tx);

        assert!(!registry.contains("01"));
        assert!(!registry.dispatch("+1", json!(1)));
        assert!(registry.remove("01").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dispatch_reaches_matching_sink_only() {
        let mut registry = SubscriptionRegistry::new();
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        let id1 = registry.register("a", tx1);
        registry.register("b", tx2);

        assert!(registry.dispatch(&id1, json!({"baba": 9})));
        assert_eq!(rx1.try_recv().unwrap().unwrap(), json!({"baba": 9}));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_unknown_id_is_reported() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, mut rx) = sink();
        let id = registry.register("a", tx);
        registry.remove(&id);

        assert!(!registry.dispatch(&id, json!(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_to_dropped_receiver_does_not_panic() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, rx) = sink();
        let id = registry.register("a", tx);
        drop(rx);

        assert!(registry.dispatch(&id, json!(1)));
    }

    #[test]
    fn test_fail_all_terminates_every_stream() {
        let mut registry = SubscriptionRegistry::new();
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        registry.register("a", tx1);
        registry.register("b", tx2);

        registry.fail_all(&CredentialError::InvalidApiKey("403".into()));

        assert!(registry.is_empty());
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(RealtimeError::Credential(CredentialError::InvalidApiKey(_)))
            ));
            // Sender dropped with the entry, so the stream ends
            assert!(matches!(
                rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            ));
        }
    }

    #[test]
    fn test_many_subscriptions() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();
        for i in 0..10_000 {
            registry.register(format!("q{}", i), tx.clone());
        }
        assert_eq!(registry.len(), 10_000);
        assert!(registry.contains("10000"));
        assert!(!registry.contains("10001"));
    }
}
