use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{io::AsyncWrite, sync::Mutex, time::timeout};
use tracing::{debug, warn};

use crate::{
    codec::{EventWriter, WireError},
    event::Event,
};

pub type SubscriberId = u64;

/// How long one broadcast delivery may wait on a peer before that peer is
/// closed as unresponsive.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound half of an established session, as seen by the registry.
///
/// The registry only ever writes to a subscriber; the session task that owns
/// the read half decides when the connection ends.
pub struct Subscriber {
    id: SubscriberId,
    writer: EventWriter,
}

impl Subscriber {
    pub fn new<W>(id: SubscriberId, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            writer: EventWriter::new(writer),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn send(&self, event: &Event) -> Result<(), WireError> {
        self.writer.send(event).await
    }

    pub async fn close(&self) -> bool {
        self.writer.close().await
    }

    /// Resolves once the subscriber has been closed by anyone.
    pub async fn closed(&self) {
        self.writer.closed().await
    }
}

/// Directory of live sessions keyed by display name.
///
/// All operations go through one lock, so adds, removals, renames, and
/// broadcast snapshots never observe each other half-applied.
#[derive(Default)]
pub struct Registry {
    subscribers: Mutex<HashMap<String, Arc<Subscriber>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscriber` under `name` unless the name is already taken.
    pub async fn try_add(&self, name: &str, subscriber: Arc<Subscriber>) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.contains_key(name) {
            return false;
        }
        subscribers.insert(name.to_string(), subscriber);
        true
    }

    /// Moves the entry under `old_name` to `new_name`, keeping the same subscriber.
    pub async fn try_rename(&self, old_name: &str, new_name: &str) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.contains_key(new_name) {
            return false;
        }
        let Some(subscriber) = subscribers.remove(old_name) else {
            return false;
        };
        subscribers.insert(new_name.to_string(), subscriber);
        true
    }

    /// Removes `name` only if it still belongs to subscriber `id`.
    pub async fn remove(&self, name: &str, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        match subscribers.get(name) {
            Some(subscriber) if subscriber.id() == id => {
                subscribers.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.subscribers.lock().await.contains_key(name)
    }

    /// Sorted snapshot of the names registered right now.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscribers.lock().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.lock().await.is_empty()
    }

    /// Removes and returns every subscriber, used when the server shuts down.
    pub async fn drain(&self) -> Vec<(String, Arc<Subscriber>)> {
        self.subscribers.lock().await.drain().collect()
    }

    /// Sends `event` to everyone registered when the snapshot is taken.
    ///
    /// Each delivery runs as its own task and failures are only logged, so a
    /// stalled peer cannot hold up the caller or other peers. A peer that stays
    /// stalled for [`DELIVERY_TIMEOUT`] is closed. Returns the number of
    /// deliveries dispatched.
    pub async fn broadcast(&self, event: Event) -> usize {
        let recipients: Vec<(String, Arc<Subscriber>)> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .map(|(name, subscriber)| (name.clone(), Arc::clone(subscriber)))
                .collect()
        };

        let event = Arc::new(event);
        let dispatched = recipients.len();
        for (name, subscriber) in recipients {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                match timeout(DELIVERY_TIMEOUT, subscriber.send(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => debug!(%name, ?error, "failed to deliver broadcast"),
                    Err(_) => {
                        warn!(%name, "peer stopped reading, closing it");
                        subscriber.close().await;
                    }
                }
            });
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{BufReader, DuplexStream},
        time::timeout,
    };

    use super::*;
    use crate::codec::read_event;

    fn subscriber(id: SubscriberId) -> (Arc<Subscriber>, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(4096);
        (Arc::new(Subscriber::new(id, writer)), BufReader::new(reader))
    }

    async fn next(reader: &mut BufReader<DuplexStream>) -> Event {
        timeout(Duration::from_secs(1), read_event(reader))
            .await
            .expect("timed out waiting for event")
            .expect("read event")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = Registry::new();
        let (first, _first_rx) = subscriber(1);
        let (second, _second_rx) = subscriber(2);

        assert!(registry.try_add("alice", first).await);
        assert!(!registry.try_add("alice", second).await);

        let stored = registry.get("alice").await.expect("alice registered");
        assert_eq!(stored.id(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn rename_preserves_identity_and_refuses_taken_names() {
        let registry = Registry::new();
        let (alice, _alice_rx) = subscriber(1);
        let (bob, _bob_rx) = subscriber(2);
        registry.try_add("alice", alice).await;
        registry.try_add("bob", bob).await;

        assert!(!registry.try_rename("alice", "bob").await);
        assert_eq!(registry.names().await, vec!["alice", "bob"]);

        assert!(registry.try_rename("alice", "carol").await);
        assert_eq!(registry.names().await, vec!["bob", "carol"]);
        assert_eq!(registry.get("carol").await.expect("carol").id(), 1);
        assert!(!registry.contains("alice").await);

        assert!(!registry.try_rename("nobody", "dave").await);
        assert!(!registry.contains("dave").await);
    }

    #[tokio::test]
    async fn remove_checks_ownership() {
        let registry = Registry::new();
        let (alice, _alice_rx) = subscriber(1);
        registry.try_add("alice", alice).await;

        assert!(!registry.remove("alice", 99).await);
        assert!(registry.contains("alice").await);
        assert!(registry.remove("alice", 1).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_subscriber() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = subscriber(1);
        let (bob, mut bob_rx) = subscriber(2);
        registry.try_add("alice", alice).await;
        registry.try_add("bob", bob).await;

        let dispatched = registry.broadcast(Event::message("alice", "hi")).await;
        assert_eq!(dispatched, 2);

        assert_eq!(next(&mut alice_rx).await, Event::message("alice", "hi"));
        assert_eq!(next(&mut bob_rx).await, Event::message("alice", "hi"));
    }

    #[tokio::test]
    async fn broken_peer_does_not_affect_others() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = subscriber(1);
        let (bob, bob_rx) = subscriber(2);
        registry.try_add("alice", alice).await;
        registry.try_add("bob", Arc::clone(&bob)).await;
        drop(bob_rx);
        bob.close().await;

        registry.broadcast(Event::user_leave("carol")).await;
        assert_eq!(next(&mut alice_rx).await, Event::user_leave("carol"));
    }

    #[tokio::test]
    async fn concurrent_adds_never_duplicate_a_name() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for id in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (writer, _reader) = tokio::io::duplex(64);
                let subscriber = Arc::new(Subscriber::new(id, writer));
                let name = format!("user{}", id % 4);
                let added = registry.try_add(&name, subscriber).await;
                if added && id % 2 == 0 {
                    registry.try_rename(&name, &format!("renamed{id}")).await;
                }
                added
            }));
        }

        let mut added = 0;
        for task in tasks {
            if task.await.expect("task") {
                added += 1;
            }
        }

        // Renames can free a base name for a later add, so only the lower bound
        // is fixed. Each successful add owns exactly one key, and no subscriber
        // shows up under two names.
        assert!(added >= 4);
        let names = registry.names().await;
        assert_eq!(names.len(), added);

        let mut ids = Vec::new();
        for name in &names {
            ids.push(registry.get(name).await.expect("listed name resolves").id());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), names.len());
    }

    #[tokio::test]
    async fn removal_during_broadcast_is_harmless() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = subscriber(1);
        let (bob, bob_rx) = subscriber(2);
        let (carol, mut carol_rx) = subscriber(3);
        registry.try_add("alice", alice).await;
        registry.try_add("bob", Arc::clone(&bob)).await;
        registry.try_add("carol", carol).await;

        let leaving = async {
            assert!(registry.remove("bob", 2).await);
            drop(bob_rx);
            bob.close().await;
        };
        let (dispatched, ()) = tokio::join!(
            registry.broadcast(Event::message("alice", "hi")),
            leaving
        );
        assert!((2..=3).contains(&dispatched));

        assert_eq!(next(&mut alice_rx).await, Event::message("alice", "hi"));
        assert_eq!(next(&mut carol_rx).await, Event::message("alice", "hi"));
        assert_eq!(registry.names().await, vec!["alice", "carol"]);

        registry.broadcast(Event::user_leave("bob")).await;
        assert_eq!(next(&mut alice_rx).await, Event::user_leave("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_is_closed_after_the_delivery_timeout() {
        let registry = Registry::new();
        let (writer, _reader) = tokio::io::duplex(64);
        let stalled = Arc::new(Subscriber::new(1, writer));
        registry.try_add("stalled", Arc::clone(&stalled)).await;

        registry
            .broadcast(Event::message("alice", "x".repeat(4096)))
            .await;
        timeout(DELIVERY_TIMEOUT * 2, stalled.closed())
            .await
            .expect("stalled peer should be closed");
        assert!(!stalled.close().await);
    }
}
