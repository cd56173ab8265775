//! Bounded per-session event history used to resume SSE streams

use std::collections::VecDeque;

/// An outbound message with its per-session event id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: u64,
    /// Serialized JSON payload, written verbatim as the SSE `data` field
    pub data: String,
}

/// Ring buffer of the last `capacity` events. Ids start at 1 and never repeat.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<StoredEvent>,
    capacity: usize,
    next_id: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    /// Append an event and return its id; evicts the oldest once full
    pub fn store(&mut self, data: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(StoredEvent { id, data });
        id
    }

    /// Retained events with id greater than `last_seen`, oldest first.
    ///
    /// Events already evicted are silently missing from the result.
    pub fn events_after(&self, last_seen: u64) -> Vec<StoredEvent> {
        // Ids are contiguous inside the buffer, so the start index is computable.
        let Some(first) = self.events.front().map(|e| e.id) else {
            return Vec::new();
        };
        let skip = last_seen.saturating_sub(first - 1);
        if skip >= self.events.len() as u64 {
            return Vec::new();
        }
        self.events.iter().skip(skip as usize).cloned().collect()
    }

    /// Id of the oldest retained event
    pub fn first_id(&self) -> Option<u64> {
        self.events.front().map(|e| e.id)
    }

    /// Id of the newest event ever stored (0 if none)
    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(events: &[StoredEvent]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_ids_start_at_one() {
        let mut log = EventLog::new(10);
        assert_eq!(log.last_id(), 0);
        assert_eq!(log.store("a".into()), 1);
        assert_eq!(log.store("b".into()), 2);
        assert_eq!(log.last_id(), 2);
        assert_eq!(ids(&log.events_after(0)), vec![1, 2]);
    }

    #[test]
    fn test_events_after_filters() {
        let mut log = EventLog::new(10);
        for i in 0..5 {
            log.store(format!("e{}", i));
        }
        let after = log.events_after(3);
        assert_eq!(ids(&after), vec![4, 5]);
        assert_eq!(after[0].data, "e3");
        assert!(log.events_after(5).is_empty());
        assert!(log.events_after(100).is_empty());
    }

    #[test]
    fn test_eviction_is_fifo() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.store(format!("e{}", i));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.first_id(), Some(3));
        assert_eq!(ids(&log.events_after(0)), vec![3, 4, 5]);
        // Marker older than retention returns what is still there
        assert_eq!(ids(&log.events_after(1)), vec![3, 4, 5]);
        assert_eq!(ids(&log.events_after(4)), vec![5]);
    }

    #[test]
    fn test_empty_log() {
        let log = EventLog::new(5);
        assert!(log.is_empty());
        assert!(log.events_after(0).is_empty());
        assert_eq!(log.first_id(), None);
    }

    proptest! {
        #[test]
        fn prop_retains_last_capacity_contiguous(capacity in 1usize..64, extra in 0usize..200) {
            let mut log = EventLog::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                log.store(i.to_string());
            }
            let all = log.events_after(0);
            prop_assert_eq!(all.len(), capacity);
            let expected: Vec<u64> = ((total - capacity + 1) as u64..=total as u64).collect();
            prop_assert_eq!(ids(&all), expected);
            for e in &all {
                prop_assert_eq!(e.data.clone(), (e.id - 1).to_string());
            }
        }

        #[test]
        fn prop_events_after_is_strict_suffix(count in 0usize..150, capacity in 1usize..100, marker in 0u64..200) {
            let mut log = EventLog::new(capacity);
            for i in 0..count {
                log.store(i.to_string());
            }
            let after = log.events_after(marker);
            prop_assert!(after.iter().all(|e| e.id > marker));
            prop_assert!(after.windows(2).all(|w| w[1].id == w[0].id + 1));
            let retained_above = log.events_after(0).into_iter().filter(|e| e.id > marker).count();
            prop_assert_eq!(after.len(), retained_above);
        }
    }
}
