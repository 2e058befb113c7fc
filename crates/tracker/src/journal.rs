//! Per-identity event journal: a bounded, most-recent-first log persisted on
//! every change. Pending transactional events are settled once by `resolve`.

use common::store::{KvStore, StoreError};
use common::types::{now_ms, ClassifiedEvent, EventStatus, Identity};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum JournalChange {
    Loaded { count: usize },
    Pushed(ClassifiedEvent),
    Resolved { id: String, status: EventStatus },
    Cleared,
}

/// Notification sent to journal listeners after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalUpdate {
    pub identity: Identity,
    pub change: JournalChange,
}

/// Bounded per-identity event log, most recent first. Every change is
/// persisted and broadcast.
pub struct EventJournal {
    identity: Identity,
    capacity: usize,
    events: Vec<ClassifiedEvent>,
    store: KvStore,
    updates: broadcast::Sender<JournalUpdate>,
}

impl EventJournal {
    pub fn empty(
        identity: Identity,
        capacity: usize,
        store: KvStore,
        updates: broadcast::Sender<JournalUpdate>,
    ) -> Self {
        Self {
            identity,
            capacity: capacity.max(1),
            events: Vec::new(),
            store,
            updates,
        }
    }

    pub async fn load(
        identity: Identity,
        capacity: usize,
        store: KvStore,
        updates: broadcast::Sender<JournalUpdate>,
    ) -> Result<Self, StoreError> {
        let mut journal = Self::empty(identity, capacity, store, updates);
        let mut events = journal.store.load_events(&journal.identity).await?;
        events.truncate(journal.capacity);
        debug!(
            identity = %journal.identity.short(),
            events = events.len(),
            "journal loaded"
        );
        journal.events = events;
        journal.notify(JournalChange::Loaded {
            count: journal.events.len(),
        });
        Ok(journal)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn events(&self) -> &[ClassifiedEvent] {
        &self.events
    }

    pub fn list(&self) -> Vec<ClassifiedEvent> {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ClassifiedEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournalUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, change: JournalChange) {
        // No receivers is fine.
        let _ = self.updates.send(JournalUpdate {
            identity: self.identity.clone(),
            change,
        });
    }

    pub async fn persist(&self) -> Result<(), StoreError> {
        self.store
            .persist_events(&self.identity, &self.events, now_ms())
            .await
    }

    pub async fn push(&mut self, event: ClassifiedEvent) -> Result<(), StoreError> {
        metrics::counter!("tracker_events_emitted_total", "kind" => event.kind.as_str())
            .increment(1);
        debug!(
            identity = %self.identity.short(),
            kind = %event.kind,
            title = %event.title,
            "journal event"
        );
        self.events.insert(0, event.clone());
        self.events.truncate(self.capacity);
        self.notify(JournalChange::Pushed(event));
        self.persist().await
    }

    /// Settle a pending event: `ok` when online, `err` otherwise. Returns the
    /// new status, or `None` when the event is gone or already settled.
    pub async fn resolve(
        &mut self,
        id: &str,
        online: bool,
    ) -> Result<Option<EventStatus>, StoreError> {
        let Some(event) = self.events.iter_mut().find(|e| e.id == id) else {
            return Ok(None);
        };
        if !event.is_pending() {
            return Ok(None);
        }
        let status = if online {
            EventStatus::Ok
        } else {
            EventStatus::Err
        };
        event.status = status;
        self.notify(JournalChange::Resolved {
            id: id.to_string(),
            status,
        });
        self.persist().await?;
        Ok(Some(status))
    }

    pub async fn clear(&mut self) -> Result<(), StoreError> {
        self.events.clear();
        self.notify(JournalChange::Cleared);
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{Direction, EventKind, SCHEMA_VERSION};

    fn id(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    fn tx(ts: i64) -> ClassifiedEvent {
        ClassifiedEvent::new(EventKind::Tx, "Stake increased", "+1.000000 INJ", Direction::Up, ts)
    }

    async fn journal(identity: &str, capacity: usize) -> (EventJournal, KvStore) {
        let store = KvStore::open_memory(SCHEMA_VERSION).await.unwrap();
        let (updates, _) = broadcast::channel(64);
        let j = EventJournal::load(id(identity), capacity, store.clone(), updates)
            .await
            .unwrap();
        (j, store)
    }

    #[tokio::test]
    async fn test_push_prepends_and_truncates() {
        let (mut j, _) = journal("inj1abc", 3).await;
        for ts in 1..=5 {
            j.push(tx(ts)).await.unwrap();
        }
        let stamps: Vec<i64> = j.events().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_resolve_depends_on_connectivity() {
        let (mut j, _) = journal("inj1abc", 10).await;
        let a = tx(1);
        let b = tx(2);
        j.push(a.clone()).await.unwrap();
        j.push(b.clone()).await.unwrap();

        assert_eq!(j.resolve(&a.id, true).await.unwrap(), Some(EventStatus::Ok));
        assert_eq!(j.resolve(&b.id, false).await.unwrap(), Some(EventStatus::Err));
        // Already settled.
        assert_eq!(j.resolve(&a.id, false).await.unwrap(), None);
        assert_eq!(j.get(&a.id).unwrap().status, EventStatus::Ok);
    }

    #[tokio::test]
    async fn test_reloaded_pending_event_keeps_its_own_id() {
        let store = KvStore::open_memory(SCHEMA_VERSION).await.unwrap();
        // Written by an earlier run whose sequence started at zero.
        let mut earlier = tx(1_000);
        earlier.id = "1000_0".into();
        store.persist_events(&id("inj1abc"), &[earlier.clone()], 1).await.unwrap();

        let (updates, _) = broadcast::channel(64);
        let mut j = EventJournal::load(id("inj1abc"), 10, store, updates)
            .await
            .unwrap();
        let fresh = tx(1_000);
        assert_ne!(fresh.id, earlier.id);
        j.push(fresh.clone()).await.unwrap();

        assert_eq!(j.resolve(&fresh.id, false).await.unwrap(), Some(EventStatus::Err));
        assert!(j.get(&earlier.id).unwrap().is_pending());
        assert_eq!(j.resolve(&earlier.id, true).await.unwrap(), Some(EventStatus::Ok));
    }

    #[tokio::test]
    async fn test_resolve_after_eviction_is_noop() {
        let (mut j, _) = journal("inj1abc", 1).await;
        let old = tx(1);
        j.push(old.clone()).await.unwrap();
        j.push(tx(2)).await.unwrap();
        assert_eq!(j.resolve(&old.id, true).await.unwrap(), None);
        assert_eq!(j.len(), 1);
        assert!(j.events()[0].is_pending());
    }

    #[tokio::test]
    async fn test_clear_only_affects_own_identity() {
        let store = KvStore::open_memory(SCHEMA_VERSION).await.unwrap();
        let (updates, _) = broadcast::channel(64);
        let mut a = EventJournal::load(id("inj1aaa"), 10, store.clone(), updates.clone())
            .await
            .unwrap();
        let mut b = EventJournal::load(id("inj1bbb"), 10, store.clone(), updates)
            .await
            .unwrap();
        a.push(tx(1)).await.unwrap();
        b.push(tx(2)).await.unwrap();

        a.clear().await.unwrap();
        assert!(a.is_empty());
        assert!(store.load_events(&id("inj1aaa")).await.unwrap().is_empty());
        assert_eq!(store.load_events(&id("inj1bbb")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_restores_events() {
        let (mut j, store) = journal("inj1abc", 10).await;
        j.push(ClassifiedEvent::info("Session ready", "inj1abc", 1)).await.unwrap();
        j.push(tx(2)).await.unwrap();

        let (updates, _) = broadcast::channel(4);
        let reloaded = EventJournal::load(id("inj1abc"), 10, store, updates)
            .await
            .unwrap();
        assert_eq!(reloaded.list(), j.list());
    }

    #[tokio::test]
    async fn test_listeners_are_notified() {
        let (mut j, _) = journal("inj1abc", 10).await;
        let mut rx = j.subscribe();
        let ev = tx(7);
        j.push(ev.clone()).await.unwrap();
        j.resolve(&ev.id, true).await.unwrap();
        j.clear().await.unwrap();

        assert_eq!(rx.recv().await.unwrap().change, JournalChange::Pushed(ev.clone()));
        assert_eq!(
            rx.recv().await.unwrap().change,
            JournalChange::Resolved {
                id: ev.id,
                status: EventStatus::Ok
            }
        );
        assert_eq!(rx.recv().await.unwrap().change, JournalChange::Cleared);
    }
}
