//! Local view of the room's producers.
//!
//! Creation and closure notices are applied as they arrive but may be lost
//! or reordered. A full snapshot replaces the view outright; the returned
//! plan says which local consumers to drop and which producers are new.

use common::types::{ProducerRef, ProducerState};
use std::collections::HashMap;

/// Work needed to converge on a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Known locally but absent from the snapshot.
    pub teardown: Vec<String>,
    /// In the snapshot but unknown locally.
    pub consume: Vec<ProducerRef>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.teardown.is_empty() && self.consume.is_empty()
    }
}

/// Remote producers this participant knows about. Its own are excluded.
#[derive(Debug, Default)]
pub struct ProducerCache {
    self_id: Option<String>,
    revision: Option<u64>,
    producers: HashMap<String, ProducerRef>,
}

impl ProducerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whose producers to leave out.
    pub fn set_self(&mut self, participant_id: impl Into<String>) {
        let participant_id = participant_id.into();
        self.producers
            .retain(|_, producer| producer.owner_id != participant_id);
        self.self_id = Some(participant_id);
    }

    /// Revision of the last snapshot applied.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Replace the view with a snapshot.
    ///
    /// Returns `None` for a snapshot older than the last one applied.
    pub fn apply_snapshot(
        &mut self,
        revision: u64,
        producers: Vec<ProducerRef>,
    ) -> Option<ReconcilePlan> {
        if self.revision.is_some_and(|last| revision < last) {
            return None;
        }
        self.revision = Some(revision);

        let incoming: HashMap<String, ProducerRef> = producers
            .into_iter()
            .filter(|producer| self.is_remote(producer))
            .map(|producer| (producer.producer_id.clone(), producer))
            .collect();

        let mut teardown: Vec<String> = self
            .producers
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        teardown.sort();

        let mut consume: Vec<ProducerRef> = incoming
            .values()
            .filter(|producer| !self.producers.contains_key(&producer.producer_id))
            .cloned()
            .collect();
        consume.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

        self.producers = incoming;
        Some(ReconcilePlan { teardown, consume })
    }

    /// Record an announced producer. Returns whether it was new.
    pub fn insert(&mut self, producer: ProducerRef) -> bool {
        if !self.is_remote(&producer) {
            return false;
        }
        self.producers
            .insert(producer.producer_id.clone(), producer)
            .is_none()
    }

    pub fn remove(&mut self, producer_id: &str) -> Option<ProducerRef> {
        self.producers.remove(producer_id)
    }

    pub fn contains(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    pub fn get(&self, producer_id: &str) -> Option<&ProducerRef> {
        self.producers.get(producer_id)
    }

    pub fn producer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.producers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerRef> {
        self.producers.values()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    fn is_remote(&self, producer: &ProducerRef) -> bool {
        producer.state != ProducerState::Closed
            && self.self_id.as_deref() != Some(producer.owner_id.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::MediaKind;

    fn producer(id: &str, owner: &str) -> ProducerRef {
        ProducerRef {
            producer_id: id.to_string(),
            owner_id: owner.to_string(),
            kind: MediaKind::Video,
            state: ProducerState::Active,
        }
    }

    #[test]
    fn test_snapshot_yields_diff() {
        let mut cache = ProducerCache::new();
        cache.insert(producer("p1", "a"));
        cache.insert(producer("p2", "b"));

        let plan = cache
            .apply_snapshot(5, vec![producer("p2", "b"), producer("p3", "c")])
            .unwrap();
        assert_eq!(plan.teardown, vec!["p1".to_string()]);
        assert_eq!(plan.consume, vec![producer("p3", "c")]);
        assert_eq!(cache.producer_ids(), vec!["p2".to_string(), "p3".to_string()]);
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let mut cache = ProducerCache::new();
        cache.apply_snapshot(7, vec![producer("p1", "a")]).unwrap();

        assert!(cache.apply_snapshot(6, vec![]).is_none());
        assert_eq!(cache.producer_ids(), vec!["p1".to_string()]);
        assert_eq!(cache.revision(), Some(7));

        // Same revision again is harmless
        let plan = cache.apply_snapshot(7, vec![producer("p1", "a")]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_own_producers_are_excluded() {
        let mut cache = ProducerCache::new();
        cache.set_self("me");
        assert!(!cache.insert(producer("mine", "me")));

        let plan = cache
            .apply_snapshot(1, vec![producer("mine", "me"), producer("p1", "a")])
            .unwrap();
        assert_eq!(plan.consume, vec![producer("p1", "a")]);
        assert!(!cache.contains("mine"));
    }

    #[test]
    fn test_closed_entries_are_not_tracked() {
        let mut cache = ProducerCache::new();
        let mut closed = producer("p1", "a");
        closed.state = ProducerState::Closed;
        assert!(!cache.insert(closed.clone()));
        let plan = cache.apply_snapshot(1, vec![closed]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_snapshot_converges_after_any_event_order() {
        enum Event {
            Created(&'static str),
            Closed(&'static str),
        }
        let histories: Vec<Vec<Event>> = vec![
            vec![],
            vec![Event::Created("p1"), Event::Created("p2")],
            vec![Event::Closed("p1"), Event::Created("p1")],
            vec![Event::Created("p4"), Event::Closed("p4"), Event::Created("p5")],
            vec![Event::Created("p2"), Event::Created("p3"), Event::Closed("p2")],
            vec![Event::Closed("p9"), Event::Closed("p3")],
        ];
        let snapshot = vec![producer("p2", "b"), producer("p3", "c")];

        for history in histories {
            let mut cache = ProducerCache::new();
            cache.apply_snapshot(1, vec![producer("p1", "a")]).unwrap();
            for event in history {
                match event {
                    Event::Created(id) => {
                        cache.insert(producer(id, "x"));
                    }
                    Event::Closed(id) => {
                        cache.remove(id);
                    }
                }
            }
            let before = cache.producer_ids();
            let plan = cache.apply_snapshot(2, snapshot.clone()).unwrap();

            assert_eq!(cache.producer_ids(), vec!["p2".to_string(), "p3".to_string()]);
            for id in &plan.teardown {
                assert!(before.contains(id));
                assert!(!cache.contains(id));
            }
            for p in &plan.consume {
                assert!(!before.contains(&p.producer_id));
            }
        }
    }
}
