//! Per-side frame identity

use std::sync::{Mutex, PoisonError};

use crate::pipeline::types::StreamSide;

#[derive(Debug, Default)]
struct SideCounter {
    next: u64,
    assigned: Option<u64>,
}

/// Hands out one id per physical frame and side
///
/// An id stays assigned until the frame is marked sent, so every packet of the
/// same frame carries the same id. Ids of one side grow by exactly one.
#[derive(Debug, Default)]
pub struct FrameIdAssigner {
    sides: [Mutex<SideCounter>; 2],
}

impl FrameIdAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the frame entering the pipeline; first id is 0
    pub fn next_id(&self, side: StreamSide) -> u64 {
        let mut counter = self.lock(side);
        if let Some(id) = counter.assigned {
            return id;
        }
        let id = counter.next;
        counter.next += 1;
        counter.assigned = Some(id);
        id
    }

    pub fn mark_sent(&self, side: StreamSide) {
        self.lock(side).assigned = None;
    }

    /// Id of the frame currently in flight, if any
    pub fn current(&self, side: StreamSide) -> Option<u64> {
        self.lock(side).assigned
    }

    fn lock(&self, side: StreamSide) -> std::sync::MutexGuard<'_, SideCounter> {
        self.sides[side.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_id_is_stable_until_sent() {
        let ids = FrameIdAssigner::new();
        assert_eq!(ids.current(StreamSide::Left), None);

        assert_eq!(ids.next_id(StreamSide::Left), 0);
        assert_eq!(ids.next_id(StreamSide::Left), 0);
        assert_eq!(ids.current(StreamSide::Left), Some(0));

        ids.mark_sent(StreamSide::Left);
        assert_eq!(ids.current(StreamSide::Left), None);
        assert_eq!(ids.next_id(StreamSide::Left), 1);
    }

    #[test]
    fn test_sides_are_independent() {
        let ids = FrameIdAssigner::new();
        for _ in 0..3 {
            ids.next_id(StreamSide::Left);
            ids.mark_sent(StreamSide::Left);
        }
        assert_eq!(ids.next_id(StreamSide::Right), 0);
        assert_eq!(ids.next_id(StreamSide::Left), 3);
    }

    #[test]
    fn test_ids_increase_by_one_per_frame() {
        let ids = Arc::new(FrameIdAssigner::new());
        let worker = {
            let ids = ids.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..500 {
                    seen.push(ids.next_id(StreamSide::Right));
                    ids.next_id(StreamSide::Right);
                    ids.mark_sent(StreamSide::Right);
                }
                seen
            })
        };

        // Concurrent traffic on the other side must not disturb the sequence
        for _ in 0..500 {
            ids.next_id(StreamSide::Left);
            ids.mark_sent(StreamSide::Left);
        }

        let seen = worker.join().unwrap();
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(seen[0], 0);
    }
}
