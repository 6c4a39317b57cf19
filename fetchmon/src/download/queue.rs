//! FIFO waiting queue for downloads outside the active set.
//!
//! Every enrolled, non-active, non-removed download sits here. Entries that
//! have an outstanding activation request are ranked by the order in which
//! the request was made; the rank is the download's queue position and is
//! recomputed after every mutation so positions stay contiguous from 0.
//!
//! ```text
//!   entries (enrollment order)     requests (FIFO)     positions
//!   ┌────┬────┬────┬────┐
//!   │ #1 │ #2 │ #3 │ #4 │   ──►    #3 (seq 7)    ──►   #3 → 0
//!   └────┴────┴────┴────┘          #1 (seq 9)    ──►   #1 → 1
//!                                                      #2, #4 → None
//! ```

use std::collections::HashMap;

use super::task::DownloadId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: DownloadId,
    /// Sequence number of the pending activation request.
    requested: Option<u64>,
}

/// Waiting queue with request ranks.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    entries: Vec<Entry>,
    positions: HashMap<DownloadId, usize>,
    next_sequence: u64,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id`. Returns `false` if it is already queued.
    pub fn enqueue(&mut self, id: DownloadId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.entries.push(Entry {
            id,
            requested: None,
        });
        true
    }

    /// Removes `id` and reindexes the remaining ranks.
    pub fn dequeue(&mut self, id: DownloadId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.reindex();
        }
        removed
    }

    /// Records an activation request for `id`.
    ///
    /// A repeated request keeps the original rank. Returns `false` if `id`
    /// is not queued.
    pub fn request(&mut self, id: DownloadId) -> bool {
        let sequence = self.next_sequence;
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if entry.requested.is_none() {
            entry.requested = Some(sequence);
            self.next_sequence += 1;
            self.reindex();
        }
        true
    }

    /// Drops a pending activation request for `id`, keeping it enrolled.
    pub fn cancel_request(&mut self, id: DownloadId) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        let had = entry.requested.take().is_some();
        if had {
            self.reindex();
        }
        had
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Rank of `id` among pending requests, `None` if it has none.
    pub fn position(&self, id: DownloadId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Pending requesters, earliest request first.
    pub fn requesters(&self) -> Vec<DownloadId> {
        let mut pending: Vec<_> = self
            .entries
            .iter()
            .filter_map(|e| e.requested.map(|seq| (seq, e.id)))
            .collect();
        pending.sort_unstable_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest pending requester.
    pub fn front(&self) -> Option<DownloadId> {
        self.entries
            .iter()
            .filter_map(|e| e.requested.map(|seq| (seq, e.id)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, id)| id)
    }

    /// Every queued id in enrollment order.
    pub fn ids(&self) -> Vec<DownloadId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reindex(&mut self) {
        self.positions = self
            .requesters()
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> DownloadId {
        DownloadId::new(n)
    }

    #[test]
    fn test_enqueue_rejects_duplicates() {
        let mut queue = WaitingQueue::new();
        assert!(queue.enqueue(id(1)));
        assert!(!queue.enqueue(id(1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enrolled_without_request_has_no_position() {
        let mut queue = WaitingQueue::new();
        queue.enqueue(id(1));
        assert!(queue.contains(id(1)));
        assert_eq!(queue.position(id(1)), None);
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn test_positions_follow_request_order() {
        let mut queue = WaitingQueue::new();
        for n in 1..=4 {
            queue.enqueue(id(n));
        }
        queue.request(id(3));
        queue.request(id(1));
        queue.request(id(4));

        assert_eq!(queue.position(id(3)), Some(0));
        assert_eq!(queue.position(id(1)), Some(1));
        assert_eq!(queue.position(id(4)), Some(2));
        assert_eq!(queue.position(id(2)), None);
        assert_eq!(queue.front(), Some(id(3)));
        assert_eq!(queue.requesters(), vec![id(3), id(1), id(4)]);
    }

    #[test]
    fn test_repeated_request_keeps_rank() {
        let mut queue = WaitingQueue::new();
        queue.enqueue(id(1));
        queue.enqueue(id(2));
        queue.request(id(1));
        queue.request(id(2));
        queue.request(id(1));

        assert_eq!(queue.position(id(1)), Some(0));
        assert_eq!(queue.position(id(2)), Some(1));
    }

    #[test]
    fn test_dequeue_reindexes_from_front() {
        let mut queue = WaitingQueue::new();
        for n in 1..=3 {
            queue.enqueue(id(n));
            queue.request(id(n));
        }

        assert!(queue.dequeue(id(1)));
        assert!(!queue.dequeue(id(1)));
        assert_eq!(queue.position(id(1)), None);
        assert_eq!(queue.position(id(2)), Some(0));
        assert_eq!(queue.position(id(3)), Some(1));
    }

    #[test]
    fn test_cancel_request_keeps_enrollment() {
        let mut queue = WaitingQueue::new();
        queue.enqueue(id(1));
        queue.enqueue(id(2));
        queue.request(id(1));
        queue.request(id(2));

        assert!(queue.cancel_request(id(1)));
        assert!(!queue.cancel_request(id(1)));
        assert!(queue.contains(id(1)));
        assert_eq!(queue.position(id(1)), None);
        assert_eq!(queue.position(id(2)), Some(0));
    }

    #[test]
    fn test_request_for_unknown_id() {
        let mut queue = WaitingQueue::new();
        assert!(!queue.request(id(9)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ids_in_enrollment_order() {
        let mut queue = WaitingQueue::new();
        queue.enqueue(id(5));
        queue.enqueue(id(2));
        queue.request(id(2));
        assert_eq!(queue.ids(), vec![id(5), id(2)]);
    }
}
