//! Heuristic choice of the memory type that backs a new allocation.
//!
//! Every memory type is described once per (class, preference) pair. Each of these
//! ordered sets is sorted by `flags_score * best_available` descending. A request scores
//! the types of the preferred set that can still hold it and takes the best one, falling
//! back to the other preference when nothing fits.

use std::cmp::Reverse;

use ash::vk;

use crate::renderer::error::GfxError;

/// Which property of the memory matters most to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPreference {
    FastAccess,
    LargeStorage,
}

impl MemoryPreference {
    fn fallback(self) -> Self {
        match self {
            Self::FastAccess => Self::LargeStorage,
            Self::LargeStorage => Self::FastAccess,
        }
    }
}

/// Whether the host needs to map the memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    Immutable,
    Mappable,
}

struct FlagsWeights {
    device_local: u64,
    host_coherent: u64,
}

impl MemoryClass {
    fn weights(self) -> FlagsWeights {
        match self {
            Self::Immutable => FlagsWeights {
                device_local: 25,
                host_coherent: 1,
            },
            Self::Mappable => FlagsWeights {
                device_local: 25,
                host_coherent: 10,
            },
        }
    }

    fn accepts(self, flags: vk::MemoryPropertyFlags) -> bool {
        match self {
            Self::Immutable => true,
            Self::Mappable => flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        }
    }
}

const BASE_WEIGHT: u64 = 16;
const PREFERRED_MULTIPLIER: u64 = 8;

const FLAGS_FACTOR: f64 = 0.3;
const FIT_FACTOR: f64 = 0.4;
const USAGE_FACTOR: f64 = 0.3;

pub fn flags_weight(
    flags: vk::MemoryPropertyFlags,
    preference: MemoryPreference,
    class: MemoryClass,
) -> u64 {
    let weights = class.weights();
    let mut weight = BASE_WEIGHT;

    if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        && preference == MemoryPreference::LargeStorage
    {
        weight *= weights.host_coherent;
    }

    if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        weight *= match preference {
            MemoryPreference::FastAccess => PREFERRED_MULTIPLIER * weights.device_local,
            MemoryPreference::LargeStorage => weights.device_local,
        };
    } else if preference == MemoryPreference::FastAccess {
        weight /= PREFERRED_MULTIPLIER;
    }

    weight.max(1)
}

fn max_flags_weight(preference: MemoryPreference, class: MemoryClass) -> u64 {
    flags_weight(
        vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_COHERENT,
        preference,
        class,
    )
}

/// A request for backing memory.
#[derive(Clone, Copy, Debug)]
pub struct HeapRequest {
    pub size: u64,
    pub memory_type_bits: u32,
}

impl From<vk::MemoryRequirements> for HeapRequest {
    fn from(requirements: vk::MemoryRequirements) -> Self {
        Self {
            size: requirements.size,
            memory_type_bits: requirements.memory_type_bits,
        }
    }
}

/// Estimated occupancy of one physical heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapUsage {
    pub total: u64,
    pub best_available: u64,
    pub worst_available: u64,
    pub users: u64,
}

impl HeapUsage {
    fn fresh(total: u64) -> Self {
        Self {
            total,
            best_available: total,
            worst_available: total,
            users: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct HeapDescriptor {
    memory_type_index: u32,
    heap_index: u32,
    flags_score: u64,
    max_flags_score: u64,
    usage: HeapUsage,
}

impl HeapDescriptor {
    fn rank(&self) -> (Reverse<u128>, u32) {
        let key = self.flags_score as u128 * self.usage.best_available as u128;
        (Reverse(key), self.memory_type_index)
    }

    fn suitability(&self, request: &HeapRequest) -> f64 {
        let usage = &self.usage;
        if request.size > usage.best_available
            || request.memory_type_bits & (1 << self.memory_type_index) == 0
        {
            return 0.0;
        }

        let flags = self.flags_score as f64 / self.max_flags_score as f64;

        let spread = usage.best_available - usage.worst_available;
        let fit = if spread == 0 {
            1.0
        } else {
            let ratio = (usage.best_available - request.size) as f64 / spread as f64;
            (ratio * ratio).min(1.0)
        };

        let utilization = if usage.total == 0 {
            1.0
        } else {
            (usage.total - usage.best_available) as f64 / usage.total as f64
        };

        FLAGS_FACTOR * flags + FIT_FACTOR * fit + USAGE_FACTOR * (1.0 - utilization * utilization)
    }
}

#[derive(Default)]
struct OrderedHeaps {
    entries: Vec<HeapDescriptor>,
}

impl OrderedHeaps {
    fn insert(&mut self, descriptor: HeapDescriptor) {
        let rank = descriptor.rank();
        let at = self.entries.partition_point(|entry| entry.rank() <= rank);
        self.entries.insert(at, descriptor);
    }

    fn update_heap(&mut self, heap_index: u32, usage: HeapUsage) {
        let mut updated = Vec::new();
        self.entries.retain(|entry| {
            if entry.heap_index == heap_index {
                updated.push(HeapDescriptor { usage, ..*entry });
                false
            } else {
                true
            }
        });
        for descriptor in updated {
            self.insert(descriptor);
        }
    }

    fn find_suitable(&self, request: &HeapRequest) -> Option<HeapDescriptor> {
        // The order is not monotone in best_available alone, so filter instead of searching.
        let mut best: Option<(f64, &HeapDescriptor)> = None;
        for entry in self.entries.iter().filter(|e| e.usage.best_available >= request.size) {
            let score = entry.suitability(request);
            if score > 0.0 && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| *entry)
    }
}

#[derive(Default)]
struct PreferenceSets {
    fast_access: OrderedHeaps,
    large_storage: OrderedHeaps,
}

impl PreferenceSets {
    fn get(&self, preference: MemoryPreference) -> &OrderedHeaps {
        match preference {
            MemoryPreference::FastAccess => &self.fast_access,
            MemoryPreference::LargeStorage => &self.large_storage,
        }
    }

    fn update_heap(&mut self, heap_index: u32, usage: HeapUsage) {
        self.fast_access.update_heap(heap_index, usage);
        self.large_storage.update_heap(heap_index, usage);
    }
}

pub struct HeapSelector {
    heaps: Vec<HeapUsage>,
    type_heaps: Vec<u32>,
    immutable: PreferenceSets,
    mappable: PreferenceSets,
}

impl HeapSelector {
    pub fn new(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let heaps = properties
            .memory_heaps_as_slice()
            .iter()
            .map(|heap| HeapUsage::fresh(heap.size))
            .collect::<Vec<_>>();

        let mut selector = Self {
            type_heaps: Vec::new(),
            heaps,
            immutable: PreferenceSets::default(),
            mappable: PreferenceSets::default(),
        };

        for (index, memory_type) in properties.memory_types_as_slice().iter().enumerate() {
            selector.type_heaps.push(memory_type.heap_index);
            let Some(usage) = selector.heaps.get(memory_type.heap_index as usize).copied() else {
                log::warn!("Memory type {} points at missing heap {}", index, memory_type.heap_index);
                continue;
            };

            for class in [MemoryClass::Immutable, MemoryClass::Mappable] {
                if !class.accepts(memory_type.property_flags) {
                    continue;
                }
                for preference in [MemoryPreference::FastAccess, MemoryPreference::LargeStorage] {
                    let descriptor = HeapDescriptor {
                        memory_type_index: index as u32,
                        heap_index: memory_type.heap_index,
                        flags_score: flags_weight(memory_type.property_flags, preference, class),
                        max_flags_score: max_flags_weight(preference, class),
                        usage,
                    };
                    match preference {
                        MemoryPreference::FastAccess => selector.sets_mut(class).fast_access.insert(descriptor),
                        MemoryPreference::LargeStorage => selector.sets_mut(class).large_storage.insert(descriptor),
                    }
                }
            }
        }

        selector
    }

    fn sets(&self, class: MemoryClass) -> &PreferenceSets {
        match class {
            MemoryClass::Immutable => &self.immutable,
            MemoryClass::Mappable => &self.mappable,
        }
    }

    fn sets_mut(&mut self, class: MemoryClass) -> &mut PreferenceSets {
        match class {
            MemoryClass::Immutable => &mut self.immutable,
            MemoryClass::Mappable => &mut self.mappable,
        }
    }

    /// Picks a memory type for the request and books its size against the type's heap.
    ///
    /// Returns the memory type index.
    pub fn request_heap(
        &mut self,
        request: HeapRequest,
        preference: MemoryPreference,
        class: MemoryClass,
    ) -> Result<u32, GfxError> {
        debug_assert!(request.size > 0, "zero-sized memory request");

        let sets = self.sets(class);
        let chosen = sets
            .get(preference)
            .find_suitable(&request)
            .or_else(|| {
                log::debug!("No {:?} heap for {} bytes, trying {:?}", preference, request.size, preference.fallback());
                sets.get(preference.fallback()).find_suitable(&request)
            })
            .ok_or(GfxError::NoSuitableMemory { size: request.size })?;

        let usage = &mut self.heaps[chosen.heap_index as usize];
        usage.best_available -= request.size;
        usage.worst_available = usage.worst_available.saturating_sub(request.size) / 2;
        usage.users += 1;
        let usage = *usage;

        self.refresh(chosen.heap_index, usage);

        log::debug!(
            "Memory type {} (heap {}) chosen for {} bytes, {} bytes left",
            chosen.memory_type_index,
            chosen.heap_index,
            request.size,
            usage.best_available,
        );
        Ok(chosen.memory_type_index)
    }

    /// Gives `size` bytes back to the heap behind `memory_type_index`.
    pub fn release(&mut self, memory_type_index: u32, size: u64) {
        let Some(&heap_index) = self.type_heaps.get(memory_type_index as usize) else {
            return;
        };
        let Some(usage) = self.heaps.get_mut(heap_index as usize) else {
            return;
        };

        usage.users = usage.users.saturating_sub(1);
        if usage.users == 0 {
            *usage = HeapUsage::fresh(usage.total);
        } else {
            usage.best_available = (usage.best_available + size).min(usage.total);
        }
        let usage = *usage;

        self.refresh(heap_index, usage);
    }

    fn refresh(&mut self, heap_index: u32, usage: HeapUsage) {
        self.immutable.update_heap(heap_index, usage);
        self.mappable.update_heap(heap_index, usage);
    }

    pub fn heap_usage(&self, heap_index: u32) -> Option<HeapUsage> {
        self.heaps.get(heap_index as usize).copied()
    }

    pub fn heap_of(&self, memory_type_index: u32) -> Option<u32> {
        self.type_heaps.get(memory_type_index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn properties(
        heaps: &[u64],
        types: &[(vk::MemoryPropertyFlags, u32)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: heaps.len() as u32,
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, size) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size: *size,
                flags: vk::MemoryHeapFlags::empty(),
            };
        }
        for (i, (flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: *heap,
            };
        }
        props
    }

    fn discrete_like() -> HeapSelector {
        HeapSelector::new(&properties(
            &[256 * MIB, 512 * MIB],
            &[
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT, 1),
            ],
        ))
    }

    fn request(size: u64) -> HeapRequest {
        HeapRequest {
            size,
            memory_type_bits: u32::MAX,
        }
    }

    #[test]
    fn fast_access_picks_device_local_heap() {
        let mut selector = discrete_like();
        let chosen = selector
            .request_heap(request(MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();
        assert_eq!(chosen, 0);
        assert_eq!(selector.heap_of(chosen), Some(0));
    }

    #[test]
    fn second_request_exhausts_single_heap() {
        let mut selector = HeapSelector::new(&properties(
            &[150 * MIB],
            &[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0)],
        ));

        selector
            .request_heap(request(100 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();
        let second = selector.request_heap(request(100 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable);

        assert_eq!(second, Err(GfxError::NoSuitableMemory { size: 100 * MIB }));
    }

    #[test]
    fn successful_request_books_exact_size() {
        let mut selector = discrete_like();
        let before = selector.heap_usage(0).unwrap();

        selector
            .request_heap(request(3 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();

        let after = selector.heap_usage(0).unwrap();
        assert_eq!(after.best_available, before.best_available - 3 * MIB);
        assert_eq!(after.users, before.users + 1);
        assert!(after.best_available <= after.total);
        assert!(after.worst_available <= after.best_available);
    }

    #[test]
    fn larger_heap_wins_when_flags_match() {
        for (first, second) in [(512 * MIB, 128 * MIB), (128 * MIB, 512 * MIB)] {
            let mut selector = HeapSelector::new(&properties(
                &[first, second],
                &[
                    (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                    (vk::MemoryPropertyFlags::DEVICE_LOCAL, 1),
                ],
            ));
            let chosen = selector
                .request_heap(request(MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
                .unwrap();
            let larger = if first > second { 0 } else { 1 };
            assert_eq!(chosen, larger);
        }
    }

    #[test]
    fn type_bits_exclude_incompatible_heaps() {
        let mut selector = discrete_like();
        let chosen = selector
            .request_heap(
                HeapRequest {
                    size: MIB,
                    memory_type_bits: 0b10,
                },
                MemoryPreference::FastAccess,
                MemoryClass::Immutable,
            )
            .unwrap();
        assert_eq!(chosen, 1);
    }

    #[test]
    fn mappable_class_skips_device_only_memory() {
        let mut selector = discrete_like();
        let chosen = selector
            .request_heap(request(MIB), MemoryPreference::FastAccess, MemoryClass::Mappable)
            .unwrap();
        assert_eq!(chosen, 1);

        let refused = selector.request_heap(
            HeapRequest {
                size: MIB,
                memory_type_bits: 0b01,
            },
            MemoryPreference::FastAccess,
            MemoryClass::Mappable,
        );
        assert!(matches!(refused, Err(GfxError::NoSuitableMemory { .. })));
    }

    #[test]
    fn request_larger_than_device_heap_moves_to_host_heap() {
        let mut selector = discrete_like();
        let chosen = selector
            .request_heap(request(300 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();
        assert_eq!(chosen, 1);
    }

    #[test]
    fn booking_is_shared_between_classes() {
        let mut selector = HeapSelector::new(&properties(
            &[150 * MIB],
            &[(
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
                0,
            )],
        ));

        selector
            .request_heap(request(100 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();
        let mapped = selector.request_heap(request(100 * MIB), MemoryPreference::LargeStorage, MemoryClass::Mappable);
        assert!(mapped.is_err());
    }

    #[test]
    fn release_returns_space() {
        let mut selector = discrete_like();
        let first = selector
            .request_heap(request(8 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();
        selector
            .request_heap(request(8 * MIB), MemoryPreference::FastAccess, MemoryClass::Immutable)
            .unwrap();

        selector.release(first, 8 * MIB);
        let usage = selector.heap_usage(0).unwrap();
        assert_eq!(usage.users, 1);
        assert_eq!(usage.best_available, 248 * MIB);

        selector.release(first, 8 * MIB);
        assert_eq!(selector.heap_usage(0), Some(HeapUsage::fresh(256 * MIB)));
    }

    #[test]
    fn flags_weight_favours_device_local_for_fast_access() {
        let device_local = flags_weight(
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPreference::FastAccess,
            MemoryClass::Immutable,
        );
        let host = flags_weight(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            MemoryPreference::FastAccess,
            MemoryClass::Immutable,
        );
        assert_eq!(device_local, 16 * 8 * 25);
        assert_eq!(host, 2);

        let coherent_large = flags_weight(
            vk::MemoryPropertyFlags::HOST_COHERENT,
            MemoryPreference::LargeStorage,
            MemoryClass::Mappable,
        );
        assert_eq!(coherent_large, 160);
        assert_eq!(flags_weight(vk::MemoryPropertyFlags::empty(), MemoryPreference::FastAccess, MemoryClass::Immutable), 2);
    }
}
