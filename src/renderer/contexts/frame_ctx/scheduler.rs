use std::sync::Arc;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use smallvec::SmallVec;

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::contexts::device_ctx::queue::Queue;
use crate::renderer::contexts::frame_ctx::command_pools::{CommandPools, RecordedCommands};
use crate::renderer::contexts::frame_ctx::pending::PendingExecutionBuffers;
use crate::renderer::contexts::frame_ctx::sync_tools::{FRAMES_HINT, SyncTools, graphics_wait_list};
use crate::renderer::error::GfxError;
use crate::renderer::sync_policy::SyncPolicy;

type Pending<S> = PendingExecutionBuffers<RecordedCommands<S>, S>;

/// Allocates and records primary command buffers for one queue family.
struct CommandRecorder<S: SyncPolicy> {
    pools: CommandPools<S>,
    device_ctx: Arc<DeviceContext>,
}

impl<S: SyncPolicy> CommandRecorder<S> {
    fn new(device_ctx: Arc<DeviceContext>, family: u32) -> Self {
        Self {
            pools: CommandPools::new(family),
            device_ctx,
        }
    }

    fn allocate(&self) -> Result<RecordedCommands<S>> {
        let device = self.device_ctx.device();
        let family = self.pools.family();

        let entry = self.pools.acquire(|| {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                .queue_family_index(family);
            Ok(unsafe { device.create_command_pool(&pool_info, None)? })
        })?;

        // This thread owns the pool, so it is the one allowed to free into it
        let retired = entry.take_retired();
        if !retired.is_empty() {
            unsafe { device.free_command_buffers(entry.pool(), &retired) };
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(entry.pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_eyre("Driver returned no command buffer")?;

        Ok(RecordedCommands::new(entry, buffer))
    }

    fn record(
        &self,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<RecordedCommands<S>> {
        let commands = self.allocate()?;
        match self.fill(commands.handle(), f) {
            Ok(()) => Ok(commands),
            Err(err) => {
                commands.retire();
                Err(err)
            }
        }
    }

    fn fill(
        &self,
        buffer: vk::CommandBuffer,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let device = self.device_ctx.device();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { device.begin_command_buffer(buffer, &begin_info)? };
        f(device, buffer)?;
        unsafe { device.end_command_buffer(buffer)? };
        Ok(())
    }

    fn destroy_pools(&mut self) {
        let device = self.device_ctx.device();
        for entry in self.pools.drain() {
            unsafe { device.destroy_command_pool(entry.pool(), None) };
        }
    }
}

fn submit(
    device: &ash::Device,
    queue: &Queue,
    waits: &[(vk::Semaphore, vk::PipelineStageFlags)],
    commands: &[vk::CommandBuffer],
    signals: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let (wait_semaphores, wait_stages): (
        SmallVec<[vk::Semaphore; 2]>,
        SmallVec<[vk::PipelineStageFlags; 2]>,
    ) = waits.iter().copied().unzip();

    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(commands)
        .signal_semaphores(signals);

    let _guard = queue.lock();
    unsafe { device.queue_submit(queue.handle, &[submit_info], fence)? };
    Ok(())
}

/// Per-slot graphics submission.
///
/// Each slot has its own collector, so commands for different frames never mix.
pub struct GraphicsScheduler<S: SyncPolicy> {
    recorder: CommandRecorder<S>,
    frames: SmallVec<[Pending<S>; FRAMES_HINT]>,
    sync: Arc<SyncTools>,
}

impl<S: SyncPolicy> GraphicsScheduler<S> {
    pub fn new(sync: Arc<SyncTools>) -> Self {
        let device_ctx = sync.device_ctx().clone();
        let family = device_ctx.graphics_queue().family.index;
        Self {
            recorder: CommandRecorder::new(device_ctx, family),
            frames: (0..sync.frames()).map(|_| Pending::new(1)).collect(),
            sync,
        }
    }

    /// An unrecorded primary buffer from the calling thread's pool.
    pub fn make_graphics_command_buffer(&self) -> Result<RecordedCommands<S>> {
        self.recorder.allocate()
    }

    pub fn postpone_graphics_commands(&self, commands: RecordedCommands<S>, frame: usize) {
        debug_assert!(frame < self.frames.len(), "frame {frame} out of range");
        self.frames[frame].postpone(commands);
    }

    /// Records a one-time buffer with `f` and queues it for the slot's next submission.
    pub fn record_graphics(
        &self,
        frame: usize,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let commands = self.recorder.record(f)?;
        self.postpone_graphics_commands(commands, frame);
        Ok(())
    }

    /// Graphics buffers the GPU is done with that no recording thread has freed yet.
    pub fn parked_command_buffers(&self) -> usize {
        self.recorder.pools.parked()
    }

    pub fn submit_graphics_commands(&self, frame: usize) -> Result<()> {
        debug_assert!(frame < self.frames.len(), "frame {frame} out of range");
        let sync = &self.sync;

        if sync.take_transfer_pause_flag() {
            log::debug!("Graphics submission of frame {} waits for transfer", frame);
            sync.wait_fence(sync.transfer_fence(frame))?;
        }

        // Without an acquire the fence is still signaled from the previous cycle
        let fence = sync.in_flight_fence(frame);
        if !sync.take_fence_armed(frame) {
            sync.wait_and_reset_fence(fence)?;
        }

        // The slot's fence has signaled, so its previous buffers are done
        let pending = &self.frames[frame];
        for retired in pending.begin_execution(0) {
            retired.retire();
        }

        let image_acquired = sync.take_image_acquired(frame);
        let transfer_pending = sync.take_transfer_pending(frame);
        let waits = graphics_wait_list(sync.slot(frame), image_acquired, transfer_pending);

        let commands = pending.with_executing(0, |items| {
            items
                .iter()
                .map(RecordedCommands::handle)
                .collect::<SmallVec<[vk::CommandBuffer; 8]>>()
        });
        debug_assert!(!commands.is_empty(), "graphics submission without commands");

        let mut signals = SmallVec::<[vk::Semaphore; 1]>::new();
        if image_acquired {
            signals.push(sync.render_completed(frame));
        }

        let device_ctx = sync.device_ctx();
        submit(
            device_ctx.device(),
            device_ctx.graphics_queue(),
            &waits,
            &commands,
            &signals,
            fence,
        )?;

        if image_acquired {
            sync.mark_render_signaled(frame);
        }
        Ok(())
    }
}

impl<S: SyncPolicy> Drop for GraphicsScheduler<S> {
    fn drop(&mut self) {
        if let Err(err) = self.sync.device_ctx().wait_idle() {
            log::error!("Failed to wait for device idle: {}", err);
        }
        for pending in &mut self.frames {
            drop(pending.drain());
        }
        self.recorder.destroy_pools();
    }
}

/// Transfer submission.
///
/// One collector is shared by every slot. Each submission moves it into the slot it
/// belongs to, so recording for the next frame overlaps with the copy in flight.
pub struct TransferScheduler<S: SyncPolicy> {
    recorder: CommandRecorder<S>,
    commands: Pending<S>,
    sync: Arc<SyncTools>,
}

impl<S: SyncPolicy> TransferScheduler<S> {
    pub fn new(sync: Arc<SyncTools>) -> Self {
        let device_ctx = sync.device_ctx().clone();
        let family = device_ctx.transfer_queue().family.index;
        Self {
            recorder: CommandRecorder::new(device_ctx, family),
            commands: Pending::new(sync.frames()),
            sync,
        }
    }

    pub fn make_transfer_command_buffer(&self) -> Result<RecordedCommands<S>> {
        self.recorder.allocate()
    }

    pub fn postpone_transfer_commands(&self, commands: RecordedCommands<S>) {
        self.commands.postpone(commands);
    }

    pub fn record_transfer(
        &self,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let commands = self.recorder.record(f)?;
        self.postpone_transfer_commands(commands);
        Ok(())
    }

    pub fn has_pending_transfer(&self) -> bool {
        self.commands.has_pending()
    }

    /// Makes the next graphics submission block on the transfer fence first.
    pub fn ask_for_waiting_for_transfer(&self) {
        self.sync.ask_for_waiting_for_transfer();
    }

    /// Submits everything collected so far, signaling the slot's transfer semaphore.
    ///
    /// Fails when the slot's previous transfer has not been waited on by a graphics
    /// submission yet, since its semaphore is still signaled.
    pub fn submit_transfer_commands(&self, frame: usize) -> Result<()> {
        debug_assert!(frame < self.sync.frames(), "frame {frame} out of range");
        let sync = &self.sync;

        if sync.is_transfer_pending(frame) {
            return Err(eyre!(
                "transfer for frame {} flushed twice before a graphics submission consumed it",
                frame
            ));
        }

        let fence = sync.transfer_fence(frame);
        sync.wait_and_reset_fence(fence)?;

        for retired in self.commands.begin_execution(frame) {
            retired.retire();
        }

        let commands = self.commands.with_executing(frame, |items| {
            items
                .iter()
                .map(RecordedCommands::handle)
                .collect::<SmallVec<[vk::CommandBuffer; 8]>>()
        });
        debug_assert!(!commands.is_empty(), "transfer submission without commands");

        let device_ctx = sync.device_ctx();
        submit(
            device_ctx.device(),
            device_ctx.transfer_queue(),
            &[],
            &commands,
            &[sync.transfer_completed(frame)],
            fence,
        )?;

        sync.mark_transfer_pending(frame);
        Ok(())
    }

    /// Blocks until the slot's last transfer submission has finished.
    pub fn wait_transfer(&self, frame: usize) -> Result<()> {
        self.sync.wait_fence(self.sync.transfer_fence(frame))
    }
}

impl<S: SyncPolicy> Drop for TransferScheduler<S> {
    fn drop(&mut self) {
        if let Err(err) = self.sync.device_ctx().wait_idle() {
            log::error!("Failed to wait for device idle: {}", err);
        }
        drop(self.commands.drain());
        self.recorder.destroy_pools();
    }
}

pub struct PresentScheduler {
    sync: Arc<SyncTools>,
}

impl PresentScheduler {
    pub fn new(sync: Arc<SyncTools>) -> Self {
        Self { sync }
    }

    /// Presents `image` once the slot's rendering has completed.
    pub fn present_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        image: u32,
        frame: usize,
    ) -> Result<()> {
        let rendered = self.sync.take_render_signaled(frame);
        debug_assert!(rendered, "presenting frame {frame} that rendered no acquired image");

        let wait_semaphores = [self.sync.render_completed(frame)];
        let swapchains = [swapchain];
        let image_indices = [image];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.sync.device_ctx().present_queue()?;
        let result = {
            let _guard = queue.lock();
            unsafe { loader.queue_present(queue.handle, &present_info) }
        };

        match result {
            Ok(false) => Ok(()),
            Ok(true) => Err(GfxError::PresentFailed(vk::Result::SUBOPTIMAL_KHR).into()),
            Err(err) => Err(GfxError::PresentFailed(err).into()),
        }
    }
}

/// Responsibilities:
/// - Collect command buffers for graphics and transfer work
/// - Submit them in dependency order: transfer, graphics, present
/// - Keep each frame slot to at most one submission in flight
pub struct Scheduler<S: SyncPolicy> {
    pub graphics: GraphicsScheduler<S>,
    pub transfer: Arc<TransferScheduler<S>>,
    pub present: PresentScheduler,
    sync: Arc<SyncTools>,
}

impl<S: SyncPolicy> Scheduler<S> {
    pub fn new(sync: Arc<SyncTools>) -> Self {
        Self {
            graphics: GraphicsScheduler::new(sync.clone()),
            transfer: Arc::new(TransferScheduler::new(sync.clone())),
            present: PresentScheduler::new(sync.clone()),
            sync,
        }
    }

    pub fn sync(&self) -> &Arc<SyncTools> {
        &self.sync
    }

    pub fn frames(&self) -> usize {
        self.sync.frames()
    }

    /// Blocks until the graphics and transfer queues have drained.
    pub fn wait_idle(&self) -> Result<()> {
        let device_ctx = self.sync.device_ctx();
        for queue in [device_ctx.graphics_queue(), device_ctx.transfer_queue()] {
            let _guard = queue.lock();
            unsafe { device_ctx.device().queue_wait_idle(queue.handle)? };
        }
        Ok(())
    }
}
