use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::contexts::memory_ctx::heap_selector::{
    HeapRequest, HeapSelector, MemoryClass, MemoryPreference,
};
use crate::renderer::internals::registry::Registry;
use crate::renderer::sync_policy::{PolicyMutex, SyncPolicy};

slotmap::new_key_type! {
    pub struct AllocationKey;
}

/// How the host is going to touch the memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryAccess {
    /// Written only by transfer commands.
    Transfer,
    TemporaryMapped,
    ConstantlyMapped,
}

impl MemoryAccess {
    fn class(self) -> MemoryClass {
        match self {
            Self::Transfer => MemoryClass::Immutable,
            Self::TemporaryMapped | Self::ConstantlyMapped => MemoryClass::Mappable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPlacement {
    Device,
    Host,
    NoMatter,
}

impl MemoryPlacement {
    fn preference(self) -> MemoryPreference {
        match self {
            Self::Device => MemoryPreference::FastAccess,
            Self::Host | Self::NoMatter => MemoryPreference::LargeStorage,
        }
    }
}

/// Pointer into persistently mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// Points into memory owned by the allocator, which outlives every handle.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Non-owning view of a live allocation. The allocator keeps the allocation until
/// [`MemoryAllocator::destroy_allocation`] is called with this handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationHandle {
    key: AllocationKey,
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type_index: u32,
    pub mapped: Option<MappedPtr>,
    pub coherent: bool,
}

impl AllocationHandle {
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }
}

struct AllocationRecord {
    allocation: Allocation,
    memory_type_index: u32,
    requested_size: u64,
}

/// Responsibilities:
/// - Pick a memory type for every resource through the [`HeapSelector`]
/// - Sub-allocate device memory with gpu-allocator
/// - Keep each allocation alive until it is explicitly destroyed
pub struct MemoryAllocator<S: SyncPolicy> {
    registry: Registry<AllocationKey, AllocationRecord, S>,
    selector: S::Mutex<HeapSelector>,
    allocator: S::Mutex<Option<Allocator>>,
    non_coherent_atom_size: u64,
    device_ctx: Arc<DeviceContext>,
}

impl<S: SyncPolicy> MemoryAllocator<S> {
    pub fn new(device_ctx: Arc<DeviceContext>) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device_ctx.instance().clone(),
            device: device_ctx.device().clone(),
            physical_device: device_ctx.physical_device(),
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let selector = HeapSelector::new(device_ctx.memory_properties());
        let non_coherent_atom_size = device_ctx.limits().non_coherent_atom_size.max(1);

        Ok(Self {
            registry: Registry::new(),
            selector: PolicyMutex::new(selector),
            allocator: PolicyMutex::new(Some(allocator)),
            non_coherent_atom_size,
            device_ctx,
        })
    }

    pub fn device_ctx(&self) -> &Arc<DeviceContext> {
        &self.device_ctx
    }

    /// Allocates memory for the given requirements.
    ///
    /// `linear` is true for buffers and linearly tiled images.
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        linear: bool,
        access: MemoryAccess,
        placement: MemoryPlacement,
    ) -> Result<AllocationHandle> {
        let memory_type_index = self.selector.lock().request_heap(
            HeapRequest::from(requirements),
            placement.preference(),
            access.class(),
        )?;

        let desc = AllocationCreateDesc {
            name,
            requirements: vk::MemoryRequirements {
                memory_type_bits: 1 << memory_type_index,
                ..requirements
            },
            location: MemoryLocation::Unknown,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        };

        let allocation = {
            let mut allocator = self.allocator.lock();
            let allocator = allocator.as_mut().ok_or_eyre("Memory allocator already shut down")?;
            allocator.allocate(&desc)
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                self.selector.lock().release(memory_type_index, requirements.size);
                return Err(err.into());
            }
        };

        let mapped = allocation.mapped_ptr().map(|ptr| MappedPtr(ptr.cast()));
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let size = allocation.size();

        let key = self.registry.insert(AllocationRecord {
            allocation,
            memory_type_index,
            requested_size: requirements.size,
        });

        Ok(AllocationHandle {
            key,
            memory,
            offset,
            size,
            memory_type_index,
            mapped,
            coherent,
        })
    }

    /// Allocates and binds memory for a buffer.
    pub fn make_buffer_allocation(
        &self,
        name: &str,
        buffer: vk::Buffer,
        access: MemoryAccess,
        placement: MemoryPlacement,
    ) -> Result<AllocationHandle> {
        let device = self.device_ctx.device();
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let handle = self.allocate(name, requirements, true, access, placement)?;

        if let Err(err) = unsafe { device.bind_buffer_memory(buffer, handle.memory, handle.offset) } {
            self.destroy_allocation(handle)?;
            return Err(err.into());
        }
        Ok(handle)
    }

    /// Allocates and binds memory for an image.
    pub fn make_image_allocation(
        &self,
        name: &str,
        image: vk::Image,
        tiling: vk::ImageTiling,
        access: MemoryAccess,
        placement: MemoryPlacement,
    ) -> Result<AllocationHandle> {
        let device = self.device_ctx.device();
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let linear = tiling == vk::ImageTiling::LINEAR;
        let handle = self.allocate(name, requirements, linear, access, placement)?;

        if let Err(err) = unsafe { device.bind_image_memory(image, handle.memory, handle.offset) } {
            self.destroy_allocation(handle)?;
            return Err(err.into());
        }
        Ok(handle)
    }

    pub fn destroy_allocation(&self, handle: AllocationHandle) -> Result<()> {
        let record = self.registry.remove(handle.key);
        debug_assert!(record.is_some(), "allocation destroyed twice");
        let Some(record) = record else {
            return Ok(());
        };

        self.selector
            .lock()
            .release(record.memory_type_index, record.requested_size);

        let mut allocator = self.allocator.lock();
        if let Some(allocator) = allocator.as_mut() {
            allocator.free(record.allocation)?;
        }
        Ok(())
    }

    pub fn is_live(&self, handle: &AllocationHandle) -> bool {
        self.registry.contains(handle.key)
    }

    pub fn live_allocations(&self) -> usize {
        self.registry.len()
    }

    /// Copies `data` into mapped memory at `offset` and makes it visible to the device.
    pub fn write_mapped(&self, handle: &AllocationHandle, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(self.is_live(handle), "write to a destroyed allocation");
        let mapped = handle.mapped.ok_or_eyre("Allocation is not host visible")?;

        let mut raw = unsafe { presser::RawAllocation::from_raw_parts(mapped.0, handle.size as usize) };
        let mut slab = unsafe { raw.borrow_as_slab() };
        presser::copy_from_slice_to_offset(data, &mut slab, offset as usize)?;

        self.flush(handle, offset, data.len() as u64)
    }

    /// Flushes a written range of non-coherent memory. Coherent memory needs nothing.
    pub fn flush(&self, handle: &AllocationHandle, offset: u64, size: u64) -> Result<()> {
        if handle.coherent || size == 0 {
            return Ok(());
        }

        let range = flush_range(handle, offset, size, self.non_coherent_atom_size);
        unsafe {
            self.device_ctx
                .device()
                .flush_mapped_memory_ranges(&[range])?;
        }
        Ok(())
    }
}

fn flush_range(
    handle: &AllocationHandle,
    offset: u64,
    size: u64,
    atom: u64,
) -> vk::MappedMemoryRange<'static> {
    let start = handle.offset + offset;
    let aligned_start = start / atom * atom;
    let end = start + size;
    let aligned_end = end.div_ceil(atom) * atom;

    // Past the end of the allocation the atom may not fit inside the memory object.
    let aligned_size = if aligned_end > handle.offset + handle.size {
        vk::WHOLE_SIZE
    } else {
        aligned_end - aligned_start
    };

    vk::MappedMemoryRange::default()
        .memory(handle.memory)
        .offset(aligned_start)
        .size(aligned_size)
}

impl<S: SyncPolicy> Drop for MemoryAllocator<S> {
    fn drop(&mut self) {
        let leaked = self.registry.drain();
        if !leaked.is_empty() {
            log::warn!("{} allocations were never destroyed", leaked.len());
        }

        let Some(mut allocator) = self.allocator.get_mut().take() else {
            return;
        };
        for record in leaked {
            if let Err(err) = allocator.free(record.allocation) {
                log::error!("Failed to free leaked allocation: {}", err);
            }
        }
        drop(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(offset: u64, size: u64) -> AllocationHandle {
        AllocationHandle {
            key: AllocationKey::default(),
            memory: vk::DeviceMemory::null(),
            offset,
            size,
            memory_type_index: 0,
            mapped: None,
            coherent: false,
        }
    }

    #[test]
    fn flush_range_is_atom_aligned() {
        let range = flush_range(&handle(256, 1024), 10, 100, 64);
        assert_eq!(range.offset, 256);
        assert_eq!(range.size, 128);
    }

    #[test]
    fn flush_range_past_allocation_end_uses_whole_size() {
        let range = flush_range(&handle(0, 100), 90, 10, 64);
        assert_eq!(range.offset, 64);
        assert_eq!(range.size, vk::WHOLE_SIZE);
    }

    #[test]
    fn access_and_placement_map_to_selector_inputs() {
        assert_eq!(MemoryAccess::Transfer.class(), MemoryClass::Immutable);
        assert_eq!(MemoryAccess::ConstantlyMapped.class(), MemoryClass::Mappable);
        assert_eq!(MemoryPlacement::Device.preference(), MemoryPreference::FastAccess);
        assert_eq!(MemoryPlacement::NoMatter.preference(), MemoryPreference::LargeStorage);
    }
}
