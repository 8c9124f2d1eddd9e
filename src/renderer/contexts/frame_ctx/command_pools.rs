use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use ash::vk;
use color_eyre::Result;

use crate::renderer::sync_policy::{PolicyMutex, PolicyRwLock, SyncPolicy};

/// A command pool owned by one recording thread.
///
/// Other threads never touch the pool itself. Buffers they are done with are parked in
/// `retired` and freed by the owner on its next [`CommandPools::acquire`].
pub struct PoolEntry<S: SyncPolicy> {
    pool: vk::CommandPool,
    retired: S::Mutex<Vec<vk::CommandBuffer>>,
}

impl<S: SyncPolicy> PoolEntry<S> {
    fn new(pool: vk::CommandPool) -> Self {
        Self {
            pool,
            retired: PolicyMutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn retire(&self, buffer: vk::CommandBuffer) {
        self.retired.lock().push(buffer);
    }

    pub fn take_retired(&self) -> Vec<vk::CommandBuffer> {
        std::mem::take(&mut *self.retired.lock())
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

/// A recorded primary command buffer and the pool it came from.
pub struct RecordedCommands<S: SyncPolicy> {
    entry: Arc<PoolEntry<S>>,
    buffer: vk::CommandBuffer,
}

impl<S: SyncPolicy> RecordedCommands<S> {
    pub fn new(entry: Arc<PoolEntry<S>>, buffer: vk::CommandBuffer) -> Self {
        Self { entry, buffer }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Hands the buffer back to its pool once the GPU is done with it.
    pub fn retire(self) {
        self.entry.retire(self.buffer);
    }
}

/// Command pools of one queue family, one per recording thread.
///
/// With an unsynchronized policy every caller shares a single pool.
pub struct CommandPools<S: SyncPolicy> {
    family: u32,
    pools: S::RwLock<HashMap<Option<ThreadId>, Arc<PoolEntry<S>>>>,
}

impl<S: SyncPolicy> CommandPools<S> {
    pub fn new(family: u32) -> Self {
        Self {
            family,
            pools: PolicyRwLock::new(HashMap::new()),
        }
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    fn key() -> Option<ThreadId> {
        S::ENABLED.then(|| std::thread::current().id())
    }

    /// Returns the calling thread's pool, creating it with `create` on first use.
    pub fn acquire(
        &self,
        create: impl FnOnce() -> Result<vk::CommandPool>,
    ) -> Result<Arc<PoolEntry<S>>> {
        let key = Self::key();
        if let Some(entry) = self.pools.read().get(&key) {
            return Ok(entry.clone());
        }

        // Only this thread inserts under its key, so nobody can race the creation
        let entry = Arc::new(PoolEntry::new(create()?));
        self.pools.write().insert(key, entry.clone());
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers retired by the GPU side and not yet freed by their owning thread.
    pub fn parked(&self) -> usize {
        self.pools.read().values().map(|entry| entry.retired_len()).sum()
    }

    /// Takes every pool, for teardown.
    pub fn drain(&mut self) -> Vec<Arc<PoolEntry<S>>> {
        self.pools.get_mut().drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use ash::vk::Handle;

    use super::*;
    use crate::renderer::sync_policy::{Synchronized, Unsynchronized};

    fn fake_pool(counter: &AtomicU64) -> impl FnOnce() -> Result<vk::CommandPool> + '_ {
        move || Ok(vk::CommandPool::from_raw(counter.fetch_add(1, Ordering::Relaxed) + 1))
    }

    #[test]
    fn same_thread_reuses_its_pool() {
        let created = AtomicU64::new(0);
        let pools = CommandPools::<Synchronized>::new(0);

        let first = pools.acquire(fake_pool(&created)).unwrap();
        let second = pools.acquire(fake_pool(&created)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn each_thread_gets_its_own_pool() {
        let created = AtomicU64::new(0);
        let pools = CommandPools::<Synchronized>::new(0);

        let handles = std::thread::scope(|scope| {
            let spawned = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let entry = pools.acquire(fake_pool(&created)).unwrap();
                        let again = pools.acquire(fake_pool(&created)).unwrap();
                        assert!(Arc::ptr_eq(&entry, &again));
                        entry.pool()
                    })
                })
                .collect::<Vec<_>>();
            spawned
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        let mut unique = handles.iter().map(|pool| pool.as_raw()).collect::<Vec<_>>();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert_eq!(pools.len(), 4);
    }

    #[test]
    fn unsynchronized_policy_shares_one_pool() {
        let created = AtomicU64::new(0);
        let pools = CommandPools::<Unsynchronized>::new(2);

        let first = pools.acquire(fake_pool(&created)).unwrap();
        let second = pools.acquire(fake_pool(&created)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pools.len(), 1);
        assert_eq!(pools.family(), 2);
    }

    #[test]
    fn retired_buffers_return_to_their_pool() {
        let created = AtomicU64::new(0);
        let pools = CommandPools::<Synchronized>::new(0);
        let entry = pools.acquire(fake_pool(&created)).unwrap();

        let recorded = RecordedCommands::new(entry.clone(), vk::CommandBuffer::from_raw(7));
        assert_eq!(recorded.handle().as_raw(), 7);

        // Retiring from another thread only parks the buffer.
        std::thread::scope(|scope| {
            scope.spawn(move || recorded.retire());
        });

        let retired = entry.take_retired();
        assert_eq!(retired, vec![vk::CommandBuffer::from_raw(7)]);
        assert!(entry.take_retired().is_empty());
    }

    #[test]
    fn parked_counts_retired_buffers_until_taken() {
        let created = AtomicU64::new(0);
        let pools = CommandPools::<Synchronized>::new(0);
        let entry = pools.acquire(fake_pool(&created)).unwrap();
        assert_eq!(pools.parked(), 0);

        RecordedCommands::new(entry.clone(), vk::CommandBuffer::from_raw(1)).retire();
        RecordedCommands::new(entry.clone(), vk::CommandBuffer::from_raw(2)).retire();
        assert_eq!(pools.parked(), 2);

        entry.take_retired();
        assert_eq!(pools.parked(), 0);
    }

    #[test]
    fn failed_creation_registers_nothing() {
        let pools = CommandPools::<Unsynchronized>::new(0);
        let result = pools.acquire(|| Err(color_eyre::eyre::eyre!("out of memory")));
        assert!(result.is_err());
        assert!(pools.is_empty());
    }
}
