use crate::renderer::sync_policy::{PolicyMutex, SyncPolicy};

/// Recorded work split into a collector that producers append to and, per slot, the list
/// last handed to the GPU.
///
/// An item lives in exactly one of the two places. [`Self::begin_execution`] is the only
/// way to move it from the collector to a slot.
pub struct PendingExecutionBuffers<T, S: SyncPolicy> {
    collector: S::Mutex<Vec<T>>,
    executing: Vec<S::Mutex<Vec<T>>>,
}

impl<T, S: SyncPolicy> PendingExecutionBuffers<T, S> {
    pub fn new(slots: usize) -> Self {
        debug_assert!(slots > 0);
        Self {
            collector: PolicyMutex::new(Vec::new()),
            executing: (0..slots).map(|_| PolicyMutex::new(Vec::new())).collect(),
        }
    }

    pub fn postpone(&self, item: T) {
        self.collector.lock().push(item);
    }

    /// Moves everything collected so far into `slot` and returns what the slot held before.
    ///
    /// The returned items belong to the previous submission of the slot, so the caller must
    /// know that submission has finished before reusing them.
    pub fn begin_execution(&self, slot: usize) -> Vec<T> {
        // Lock order is collector then slot, so no reader sees the items in neither
        let mut collector = self.collector.lock();
        let mut executing = self.executing[slot].lock();
        std::mem::replace(&mut *executing, std::mem::take(&mut *collector))
    }

    pub fn with_executing<R>(&self, slot: usize, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.executing[slot].lock())
    }

    pub fn has_pending(&self) -> bool {
        !self.collector.lock().is_empty()
    }

    /// Items held anywhere, collected or executing.
    pub fn len(&self) -> usize {
        let collector = self.collector.lock();
        collector.len()
            + self
                .executing
                .iter()
                .map(|slot| slot.lock().len())
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every list, for teardown.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = std::mem::take(self.collector.get_mut());
        for slot in &mut self.executing {
            items.append(slot.get_mut());
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::sync_policy::{Synchronized, Unsynchronized};

    #[test]
    fn swap_moves_collector_into_slot() {
        let pending = PendingExecutionBuffers::<u32, Unsynchronized>::new(1);
        pending.postpone(1);
        pending.postpone(2);

        assert!(pending.begin_execution(0).is_empty());
        assert!(!pending.has_pending());
        assert_eq!(pending.with_executing(0, |items| items.to_vec()), vec![1, 2]);

        pending.postpone(3);
        // The new item is not visible to the GPU side until the next swap.
        assert_eq!(pending.with_executing(0, |items| items.len()), 2);

        assert_eq!(pending.begin_execution(0), vec![1, 2]);
        assert_eq!(pending.with_executing(0, |items| items.to_vec()), vec![3]);
    }

    #[test]
    fn slots_keep_their_own_executing_lists() {
        let pending = PendingExecutionBuffers::<&str, Unsynchronized>::new(2);
        pending.postpone("a");
        pending.begin_execution(0);
        pending.postpone("b");
        pending.begin_execution(1);

        assert_eq!(pending.with_executing(0, |items| items.to_vec()), vec!["a"]);
        assert_eq!(pending.with_executing(1, |items| items.to_vec()), vec!["b"]);
        assert_eq!(pending.begin_execution(0), vec!["a"]);
        assert!(pending.with_executing(0, |items| items.is_empty()));
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let pending = PendingExecutionBuffers::<usize, Synchronized>::new(1);
        std::thread::scope(|scope| {
            for thread in 0..4 {
                let pending = &pending;
                scope.spawn(move || {
                    for i in 0..100 {
                        pending.postpone(thread * 100 + i);
                    }
                });
            }
        });

        pending.begin_execution(0);
        let mut executing = pending.with_executing(0, |items| items.to_vec());
        executing.sort();
        assert_eq!(executing, (0..400).collect::<Vec<_>>());
        assert!(!pending.has_pending());
    }

    #[test]
    fn items_are_never_missing_mid_swap() {
        const SLOTS: usize = 64;

        for _ in 0..8 {
            let pending = PendingExecutionBuffers::<usize, Synchronized>::new(SLOTS);
            let done = std::sync::atomic::AtomicBool::new(false);

            std::thread::scope(|scope| {
                let (pending, done) = (&pending, &done);
                scope.spawn(move || {
                    for i in 0..SLOTS * 16 {
                        pending.postpone(i);
                    }
                });
                scope.spawn(move || {
                    // Every slot starts empty, so no swap hands items back
                    let mut handed_back = 0;
                    for slot in 0..SLOTS {
                        handed_back += pending.begin_execution(slot).len();
                        std::thread::yield_now();
                    }
                    done.store(true, std::sync::atomic::Ordering::Release);
                    assert_eq!(handed_back, 0);
                });
                scope.spawn(move || {
                    let mut seen = 0;
                    while !done.load(std::sync::atomic::Ordering::Acquire) {
                        let now = pending.len();
                        assert!(now >= seen, "count dropped from {seen} to {now}");
                        seen = now;
                    }
                });
            });

            assert_eq!(pending.len(), SLOTS * 16);
        }
    }

    #[test]
    fn drain_collects_every_list() {
        let mut pending = PendingExecutionBuffers::<u8, Unsynchronized>::new(2);
        pending.postpone(1);
        pending.begin_execution(1);
        pending.postpone(2);

        let mut drained = pending.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
    }
}
