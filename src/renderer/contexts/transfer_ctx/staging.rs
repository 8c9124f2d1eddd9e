use std::collections::{BTreeMap, HashMap};

use color_eyre::Result;

/// Smallest staging buffer ever created.
pub const MIN_STAGING_SIZE: u64 = 64 * 1024;

/// Capacity of a new staging buffer that has to hold `size` bytes.
pub fn staging_capacity(size: u64) -> u64 {
    size.max(MIN_STAGING_SIZE).next_power_of_two()
}

/// Who is still reading a reserved staging buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Occupant {
    /// The copy reading it is recorded but not submitted yet.
    Unsubmitted,
    /// The copy went out with this frame slot's transfer submission.
    Submitted(usize),
}

/// Reusable staging buffers ordered by capacity.
///
/// A buffer handed out by [`Self::reserve`] stays occupied until the copy reading it has
/// been submitted with [`Self::submit`] and that slot is [`Self::reset`] after its
/// transfer fence signaled. Memory is only given back by [`Self::cleanup`].
pub struct StagingPool<B> {
    // Keyed by (capacity, sequence) so equal capacities coexist
    buffers: BTreeMap<(u64, u64), B>,
    occupied: HashMap<u64, Occupant>,
    next_seq: u64,
}

impl<B: Copy> Default for StagingPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Copy> StagingPool<B> {
    pub fn new() -> Self {
        Self {
            buffers: BTreeMap::new(),
            occupied: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Occupies the smallest free buffer of at least `size` bytes.
    pub fn try_reserve(&mut self, size: u64) -> Option<B> {
        debug_assert!(size > 0, "zero-sized staging reservation");

        let (&(_, seq), &buffer) = self
            .buffers
            .range((size, 0)..)
            .find(|((_, seq), _)| !self.occupied.contains_key(seq))?;
        self.occupied.insert(seq, Occupant::Unsubmitted);
        Some(buffer)
    }

    /// Adds a freshly created buffer, already occupied.
    pub fn insert_reserved(&mut self, capacity: u64, buffer: B) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffers.insert((capacity, seq), buffer);
        self.occupied.insert(seq, Occupant::Unsubmitted);
    }

    /// Reserves a buffer, creating one with `create(capacity)` when none is free.
    pub fn reserve(&mut self, size: u64, create: impl FnOnce(u64) -> Result<B>) -> Result<B> {
        if let Some(buffer) = self.try_reserve(size) {
            return Ok(buffer);
        }
        let capacity = staging_capacity(size);
        let buffer = create(capacity)?;
        self.insert_reserved(capacity, buffer);
        Ok(buffer)
    }

    /// Hands every unsubmitted reservation to the transfer submission of `slot`.
    pub fn submit(&mut self, slot: usize) {
        for occupant in self.occupied.values_mut() {
            if *occupant == Occupant::Unsubmitted {
                *occupant = Occupant::Submitted(slot);
            }
        }
    }

    /// Frees the buffers submitted with `slot`. Its transfer fence must have signaled.
    pub fn reset(&mut self, slot: usize) {
        self.occupied
            .retain(|_, occupant| *occupant != Occupant::Submitted(slot));
    }

    /// Removes and returns every buffer of at least `min_size` bytes.
    pub fn cleanup(&mut self, min_size: u64) -> Vec<B> {
        debug_assert!(self.occupied.is_empty(), "staging cleanup while buffers are in use");

        self.buffers.split_off(&(min_size, 0)).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.occupied.len()
    }

    pub fn unsubmitted(&self) -> usize {
        self.occupied
            .values()
            .filter(|occupant| **occupant == Occupant::Unsubmitted)
            .count()
    }

    /// Takes every buffer regardless of occupancy, for teardown.
    pub fn drain(&mut self) -> Vec<B> {
        self.occupied.clear();
        std::mem::take(&mut self.buffers).into_values().collect()
    }
}
