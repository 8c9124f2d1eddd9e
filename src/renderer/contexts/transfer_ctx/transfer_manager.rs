use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::frame_ctx::scheduler::TransferScheduler;
use crate::renderer::contexts::resource_ctx::buffer::{Buffer, BufferDesc, BufferFactory, BufferType};
use crate::renderer::contexts::resource_ctx::image::Image;
use crate::renderer::contexts::transfer_ctx::staging::{StagingPool, staging_capacity};
use crate::renderer::sync_policy::{PolicyMutex, PolicyRwLock, SyncPolicy};

/// Responsibilities:
/// - Write host data into buffers, directly when mapped and staged otherwise
/// - Upload images through staging buffers
/// - Hand every copy command to the transfer scheduler
/// - Reuse staging buffers across frames
pub struct TransferManager<S: SyncPolicy> {
    staging: S::Mutex<StagingPool<Buffer>>,
    // Shared while a staged copy is recorded, exclusive while flushing
    recording: S::RwLock<()>,
    scheduler: Arc<TransferScheduler<S>>,
    buffers: Arc<BufferFactory<S>>,
}

impl<S: SyncPolicy> TransferManager<S> {
    pub fn new(scheduler: Arc<TransferScheduler<S>>, buffers: Arc<BufferFactory<S>>) -> Self {
        Self {
            staging: PolicyMutex::new(StagingPool::new()),
            recording: PolicyRwLock::new(()),
            scheduler,
            buffers,
        }
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler<S>> {
        &self.scheduler
    }

    /// Waits for the last transfer submitted on `frame` and frees the staging buffers
    /// it read from.
    pub fn begin_frame(&self, frame: usize) -> Result<()> {
        self.scheduler.wait_transfer(frame)?;
        self.staging.lock().reset(frame);
        Ok(())
    }

    /// Makes the next graphics submission wait for the transfer fence first.
    pub fn request_graphics_wait(&self) {
        self.scheduler.ask_for_waiting_for_transfer();
    }

    /// Writes `data` into `dst` at `offset`.
    ///
    /// Mapped buffers are written immediately. Immutable buffers are staged and copied
    /// when the transfer work is flushed.
    pub fn copy_to_buffer(&self, dst: &Buffer, data: &[u8], offset: u64) -> Result<()> {
        debug_assert!(!data.is_empty(), "zero-sized copy");
        debug_assert!(
            offset + data.len() as u64 <= dst.size(),
            "copy of {} bytes at {} overflows a buffer of {}",
            data.len(),
            offset,
            dst.size()
        );

        // Immutable buffers are only ever written by transfer commands, mapped or not
        if dst.ty() != BufferType::Immutable && dst.is_mapped() {
            return self.buffers.allocator().write_mapped(dst.allocation(), offset, data);
        }

        let _recording = self.recording.read();
        let staging = self.stage(data, data.len() as u64)?;
        let dst = dst.handle();
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(offset)
            .size(data.len() as u64);

        self.scheduler.record_transfer(|device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, staging.handle(), dst, &[region]) };
            Ok(())
        })
    }

    pub fn copy_slice_to_buffer<T: bytemuck::Pod>(
        &self,
        dst: &Buffer,
        data: &[T],
        offset: u64,
    ) -> Result<()> {
        self.copy_to_buffer(dst, bytemuck::cast_slice(data), offset)
    }

    /// Queues a device-side copy of `size` bytes between two buffers.
    pub fn copy_buffer_to_buffer(
        &self,
        dst: &Buffer,
        src: &Buffer,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        debug_assert!(size > 0, "zero-sized copy");
        debug_assert!(src_offset + size <= src.size(), "copy reads past the source");
        debug_assert!(dst_offset + size <= dst.size(), "copy writes past the destination");

        let (src, dst) = (src.handle(), dst.handle());
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);

        self.scheduler.record_transfer(|device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }

    /// Uploads the whole first mip and layer of `dst`, leaving it ready for sampling.
    pub fn copy_to_image(&self, dst: &Image, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty(), "zero-sized copy");
        debug_assert_eq!(
            data.len() as u64,
            dst.byte_size(),
            "image upload must cover the whole first mip"
        );

        // The copy reads the full extent whatever the caller handed in
        let _recording = self.recording.read();
        let staging = self.stage(data, image_staging_size(data.len() as u64, dst.byte_size()))?;
        let image = dst.handle();
        let aspect = dst.aspect();
        let extent = dst.extent();

        self.scheduler.record_transfer(|device, cmd| {
            let range = vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1);

            let to_transfer = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range);

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });

            // A transfer-only queue knows no shader stages; the semaphore orders the reads
            let to_readable = to_transfer
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty());

            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_readable],
                );
            }
            Ok(())
        })
    }

    /// Submits the collected copies for `frame`. Returns whether anything was submitted.
    pub fn flush(&self, frame: usize) -> Result<bool> {
        let _flushing = self.recording.write();
        if !self.scheduler.has_pending_transfer() {
            return Ok(false);
        }
        self.scheduler.submit_transfer_commands(frame)?;
        // Every staged copy recorded so far went out with this submission
        self.staging.lock().submit(frame);
        Ok(true)
    }

    /// Destroys pooled staging buffers of at least `min_size` bytes.
    ///
    /// Every reservation must have been reset first.
    pub fn cleanup_staging(&self, min_size: u64) -> Result<usize> {
        let removed = self.staging.lock().cleanup(min_size);
        let count = removed.len();
        for buffer in removed {
            self.buffers.destroy_buffer(buffer)?;
        }
        if count > 0 {
            log::debug!("Released {} staging buffers of at least {} bytes", count, min_size);
        }
        Ok(count)
    }

    pub fn staging_buffers(&self) -> usize {
        self.staging.lock().len()
    }

    /// Copies `data` into a staging buffer of at least `size` bytes that stays reserved
    /// until the slot it is flushed with comes around again.
    fn stage(&self, data: &[u8], size: u64) -> Result<Buffer> {
        let reserved = self.staging.lock().try_reserve(size);
        let staging = match reserved {
            Some(buffer) => buffer,
            None => {
                // Created outside the lock, then registered as already occupied
                let capacity = staging_capacity(size);
                let buffer = self.buffers.make_buffer(BufferDesc::staging(capacity))?;
                log::trace!("New staging buffer of {} bytes", capacity);
                self.staging.lock().insert_reserved(capacity, buffer);
                buffer
            }
        };

        self.buffers.allocator().write_mapped(staging.allocation(), 0, data)?;
        Ok(staging)
    }
}

impl<S: SyncPolicy> Drop for TransferManager<S> {
    fn drop(&mut self) {
        if let Err(err) = self.buffers.allocator().device_ctx().wait_idle() {
            log::error!("Failed to wait for device idle: {}", err);
        }
        for buffer in self.staging.get_mut().drain() {
            if let Err(err) = self.buffers.destroy_buffer(buffer) {
                log::error!("Failed to destroy staging buffer: {}", err);
            }
        }
    }
}

/// Bytes to reserve for an image upload. Never less than the copied extent.
fn image_staging_size(data_len: u64, image_bytes: u64) -> u64 {
    data_len.max(image_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_image_data_still_reserves_the_full_extent() {
        assert_eq!(image_staging_size(4, 64 * 64 * 4), 64 * 64 * 4);
        assert_eq!(image_staging_size(64 * 64 * 4, 64 * 64 * 4), 64 * 64 * 4);
    }

    #[test]
    fn full_extent_staging_fits_the_pooled_capacity() {
        let image_bytes = 300 * 200 * 4;
        let size = image_staging_size(16, image_bytes);
        assert!(staging_capacity(size) >= image_bytes);
    }
}
