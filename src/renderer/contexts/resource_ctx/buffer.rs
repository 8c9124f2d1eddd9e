use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::memory_ctx::allocator::{
    AllocationHandle, MemoryAccess, MemoryAllocator, MemoryPlacement,
};
use crate::renderer::internals::registry::Registry;
use crate::renderer::sync_policy::SyncPolicy;

slotmap::new_key_type! {
    pub struct BufferKey;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Staging,
}

impl BufferUsage {
    fn flags(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// Filled only through transfer commands.
    Immutable,
    Mappable,
    ConstantlyMapped,
}

impl BufferType {
    fn access(self) -> MemoryAccess {
        match self {
            Self::Immutable => MemoryAccess::Transfer,
            Self::Mappable => MemoryAccess::TemporaryMapped,
            Self::ConstantlyMapped => MemoryAccess::ConstantlyMapped,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub ty: BufferType,
    pub placement: MemoryPlacement,
    pub transfer_read: bool,
    pub transfer_write: bool,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage, ty: BufferType) -> Self {
        Self {
            size,
            usage,
            ty,
            placement: match ty {
                BufferType::Immutable => MemoryPlacement::Device,
                BufferType::Mappable | BufferType::ConstantlyMapped => MemoryPlacement::NoMatter,
            },
            transfer_read: false,
            transfer_write: false,
        }
    }

    pub fn staging(size: u64) -> Self {
        Self::new(size, BufferUsage::Staging, BufferType::ConstantlyMapped)
            .placement(MemoryPlacement::Host)
    }

    pub fn placement(mut self, placement: MemoryPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn transfer_read(mut self, enable: bool) -> Self {
        self.transfer_read = enable;
        self
    }

    pub fn transfer_write(mut self, enable: bool) -> Self {
        self.transfer_write = enable;
        self
    }

    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        let mut flags = self.usage.flags();
        if self.transfer_read {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        // Immutable buffers can only be filled by a copy
        if self.transfer_write || self.ty == BufferType::Immutable {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Cheap value handle to a buffer owned by a [`BufferFactory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    key: BufferKey,
    handle: vk::Buffer,
    size: u64,
    ty: BufferType,
    allocation: AllocationHandle,
}

impl Buffer {
    pub fn is_valid(&self) -> bool {
        self.handle != vk::Buffer::null() && self.size > 0
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn ty(&self) -> BufferType {
        self.ty
    }

    pub fn allocation(&self) -> &AllocationHandle {
        &self.allocation
    }

    pub fn is_mapped(&self) -> bool {
        self.allocation.is_mapped()
    }
}

struct BufferRecord {
    buffer: vk::Buffer,
    allocation: AllocationHandle,
}

pub struct BufferFactory<S: SyncPolicy> {
    buffers: Registry<BufferKey, BufferRecord, S>,
    allocator: Arc<MemoryAllocator<S>>,
}

impl<S: SyncPolicy> BufferFactory<S> {
    pub fn new(allocator: Arc<MemoryAllocator<S>>) -> Self {
        Self {
            buffers: Registry::new(),
            allocator,
        }
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator<S>> {
        &self.allocator
    }

    pub fn make_buffer(&self, desc: BufferDesc) -> Result<Buffer> {
        debug_assert!(desc.size > 0, "zero-sized buffer");

        let device_ctx = self.allocator.device_ctx();
        let device = device_ctx.device();
        let families = device_ctx.sharing_families();

        let mut buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage_flags());
        buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let allocation = match self.allocator.make_buffer_allocation(
            "buffer",
            buffer,
            desc.ty.access(),
            desc.placement,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let key = self.buffers.insert(BufferRecord { buffer, allocation });

        Ok(Buffer {
            key,
            handle: buffer,
            size: desc.size,
            ty: desc.ty,
            allocation,
        })
    }

    pub fn destroy_buffer(&self, buffer: Buffer) -> Result<()> {
        debug_assert!(buffer.is_valid());

        let record = self.buffers.remove(buffer.key);
        debug_assert!(record.is_some(), "buffer destroyed twice");
        let Some(record) = record else {
            return Ok(());
        };

        unsafe {
            self.allocator
                .device_ctx()
                .device()
                .destroy_buffer(record.buffer, None);
        }
        self.allocator.destroy_allocation(record.allocation)
    }

    pub fn is_live(&self, buffer: &Buffer) -> bool {
        self.buffers.contains(buffer.key)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl<S: SyncPolicy> Drop for BufferFactory<S> {
    fn drop(&mut self) {
        let leaked = self.buffers.drain();
        if !leaked.is_empty() {
            log::warn!("Destroying {} buffers that were never returned", leaked.len());
        }
        for record in leaked {
            unsafe {
                self.allocator
                    .device_ctx()
                    .device()
                    .destroy_buffer(record.buffer, None);
            }
            if let Err(err) = self.allocator.destroy_allocation(record.allocation) {
                log::error!("Failed to free buffer memory: {}", err);
            }
        }
    }
}
