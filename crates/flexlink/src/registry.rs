//! Discovery registry: the single collection of currently known radios.
//!
//! [`DiscoveryRegistry`] holds the bookkeeping and diffing logic and is a
//! plain value with `&mut self` methods. [`Registry`] is the cloneable
//! handle the listeners and consumers share: it serializes every `ingest`
//! and `evict` behind one mutex and broadcasts the resulting
//! [`ChangeEvent`]s in the order they were produced.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

use flexlink_core::{ChangeAction, ChangeEvent, GuiClient, Origin, Radio, RadioKey};

/// Capacity of the change event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Radios keyed by identity, with session diffing.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    radios: HashMap<RadioKey, Radio>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sighting of a radio.
    ///
    /// - Unknown key: insert, emit `Added` for the radio and for each of its
    ///   client sessions.
    /// - Known key, different facts: replace, emit `Updated` for the radio,
    ///   then the session diff.
    /// - Known key, same facts: only `last_seen` is refreshed; nothing is
    ///   emitted.
    pub fn ingest(&mut self, radio: Radio) -> Vec<ChangeEvent> {
        let key = radio.key();
        let mut events = Vec::new();

        match self.radios.get_mut(&key) {
            None => {
                events.push(ChangeEvent::Radio {
                    action: ChangeAction::Added,
                    radio: radio.clone(),
                });
                for client in radio.gui_clients() {
                    events.push(client_event(ChangeAction::Added, &key, client));
                }
                self.radios.insert(key, radio);
            }
            Some(existing) => {
                if existing.same_facts(&radio) {
                    if radio.last_seen.is_some() {
                        existing.last_seen = radio.last_seen;
                    }
                    return events;
                }

                let old_clients = existing.gui_clients();
                let new_clients = radio.gui_clients();
                *existing = radio.clone();

                events.push(ChangeEvent::Radio {
                    action: ChangeAction::Updated,
                    radio,
                });
                events.extend(diff_clients(&key, old_clients, new_clients));
            }
        }

        events
    }

    /// Remove every radio matching `predicate`, emitting one `Deleted` per
    /// removal.
    pub fn evict(&mut self, mut predicate: impl FnMut(&Radio) -> bool) -> Vec<ChangeEvent> {
        let doomed: Vec<RadioKey> = self
            .radios
            .values()
            .filter(|r| predicate(r))
            .map(Radio::key)
            .collect();

        doomed
            .into_iter()
            .filter_map(|key| self.radios.remove(&key))
            .map(|radio| ChangeEvent::Radio {
                action: ChangeAction::Deleted,
                radio,
            })
            .collect()
    }

    pub fn get(&self, key: &RadioKey) -> Option<&Radio> {
        self.radios.get(key)
    }

    /// All known radios, ordered by origin then serial.
    pub fn snapshot(&self) -> Vec<Radio> {
        let mut radios: Vec<Radio> = self.radios.values().cloned().collect();
        radios.sort_by(|a, b| {
            (a.origin == Origin::Relay, &a.serial).cmp(&(b.origin == Origin::Relay, &b.serial))
        });
        radios
    }

    pub fn len(&self) -> usize {
        self.radios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radios.is_empty()
    }
}

fn client_event(action: ChangeAction, key: &RadioKey, client: GuiClient) -> ChangeEvent {
    ChangeEvent::Client {
        action,
        radio: key.clone(),
        client,
    }
}

/// Diff two session lists by handle. Each list holds a handle at most once.
/// Deletions come first (old order), then additions and updates in new list
/// order.
fn diff_clients(key: &RadioKey, old: Vec<GuiClient>, new: Vec<GuiClient>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let new_by_handle: HashMap<u32, &GuiClient> = new.iter().map(|c| (c.handle, c)).collect();
    let mut old_by_handle: HashMap<u32, GuiClient> = HashMap::with_capacity(old.len());

    for client in old {
        if new_by_handle.contains_key(&client.handle) {
            old_by_handle.insert(client.handle, client);
        } else {
            events.push(client_event(ChangeAction::Deleted, key, client));
        }
    }

    for client in new {
        match old_by_handle.get(&client.handle) {
            None => events.push(client_event(ChangeAction::Added, key, client)),
            Some(previous) if *previous != client => {
                events.push(client_event(ChangeAction::Updated, key, client))
            }
            Some(_) => {}
        }
    }

    events
}

/// Shared handle to a [`DiscoveryRegistry`].
///
/// Construct one at startup and hand clones to the LAN listener, the
/// SmartLink listener and any consumer.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Mutex<DiscoveryRegistry>>,
    event_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(DiscoveryRegistry::new())),
            event_tx,
        }
    }

    /// Receive change events from now on. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.event_tx.subscribe()
    }

    /// Merge one sighting and publish the resulting events.
    pub async fn ingest(&self, radio: Radio) -> Vec<ChangeEvent> {
        let mut inner = self.inner.lock().await;
        let events = inner.ingest(radio);
        self.publish(&events);
        events
    }

    /// Remove matching radios and publish one `Deleted` per removal.
    pub async fn evict(&self, predicate: impl FnMut(&Radio) -> bool) -> Vec<ChangeEvent> {
        let mut inner = self.inner.lock().await;
        let events = inner.evict(predicate);
        self.publish(&events);
        events
    }

    pub async fn get(&self, key: &RadioKey) -> Option<Radio> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Radio> {
        self.inner.lock().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    // Called with the registry lock held so subscribers see events in
    // mutation order.
    fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            tracing::debug!(action = ?event.action(), subject = %summary(event), "Registry change");
            let _ = self.event_tx.send(event.clone());
        }
    }
}

fn summary(event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::Radio { radio, .. } => radio.key().to_string(),
        ChangeEvent::Client { radio, client, .. } => format!("{radio} client 0x{:08X}", client.handle),
    }
}
