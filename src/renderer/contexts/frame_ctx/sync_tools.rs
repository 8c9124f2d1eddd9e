use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use color_eyre::Result;
use smallvec::SmallVec;

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::error::GfxError;

/// Frame counts up to this stay inline.
pub const FRAMES_HINT: usize = 3;

const WAIT_TIMEOUT: u64 = u64::MAX;

/// Synchronization primitives of one frame slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSync {
    // Signaled by the presentation engine once the acquired image can be written.
    pub image_available: vk::Semaphore,

    // Signaled by the graphics submission, waited on by present.
    pub render_completed: vk::Semaphore,

    // Signaled by the transfer submission, waited on by the graphics submission.
    pub transfer_completed: vk::Semaphore,

    pub in_flight: vk::Fence,
    pub transfer: vk::Fence,
}

/// What happened to a slot since its last graphics submission.
#[derive(Debug, Default)]
struct SlotFlags {
    image_acquired: AtomicBool,
    transfer_pending: AtomicBool,
    render_signaled: AtomicBool,
    // The in-flight fence was waited on and reset by acquire, so submit must not wait again.
    fence_armed: AtomicBool,
}

/// Semaphores the graphics submission of a slot has to wait on.
///
/// Each semaphore is only listed when something will actually signal it.
pub fn graphics_wait_list(
    sync: &FrameSync,
    image_acquired: bool,
    transfer_pending: bool,
) -> SmallVec<[(vk::Semaphore, vk::PipelineStageFlags); 2]> {
    let mut waits = SmallVec::new();
    if image_acquired {
        waits.push((
            sync.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
        ));
    }
    if transfer_pending {
        waits.push((sync.transfer_completed, vk::PipelineStageFlags::ALL_COMMANDS));
    }
    waits
}

/// One-shot request raised by the transfer side and consumed by the graphics side.
#[derive(Debug, Default)]
pub struct PauseFlag(AtomicBool);

impl PauseFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Only one caller observes `true` per request.
    pub fn take(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Responsibilities:
/// - Own the per-slot semaphores and fences, created once for `frames` slots
/// - Track which of them a slot's next submission may wait on
/// - Carry the graphics-waits-for-transfer request between schedulers
pub struct SyncTools {
    slots: SmallVec<[FrameSync; FRAMES_HINT]>,
    flags: SmallVec<[SlotFlags; FRAMES_HINT]>,
    graphics_waits_transfer: PauseFlag,
    device_ctx: Arc<DeviceContext>,
}

impl SyncTools {
    pub fn new(device_ctx: Arc<DeviceContext>, frames: usize) -> Result<Self> {
        debug_assert!(frames > 0);

        let mut tools = Self {
            slots: SmallVec::with_capacity(frames),
            flags: (0..frames).map(|_| SlotFlags::default()).collect(),
            graphics_waits_transfer: PauseFlag::default(),
            device_ctx,
        };

        let device = tools.device_ctx.device().clone();
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        for index in 0..frames {
            // Pushed first so a failure below still destroys what was created
            tools.slots.push(FrameSync::default());
            let slot = &mut tools.slots[index];
            unsafe {
                slot.image_available = device.create_semaphore(&semaphore_info, None)?;
                slot.render_completed = device.create_semaphore(&semaphore_info, None)?;
                slot.transfer_completed = device.create_semaphore(&semaphore_info, None)?;
                slot.in_flight = device.create_fence(&fence_info, None)?;
                slot.transfer = device.create_fence(&fence_info, None)?;
            }
        }

        Ok(tools)
    }

    pub fn frames(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, frame: usize) -> &FrameSync {
        debug_assert!(frame < self.frames(), "frame {frame} out of range");
        &self.slots[frame]
    }

    pub fn image_available(&self, frame: usize) -> vk::Semaphore {
        self.slot(frame).image_available
    }

    pub fn render_completed(&self, frame: usize) -> vk::Semaphore {
        self.slot(frame).render_completed
    }

    pub fn transfer_completed(&self, frame: usize) -> vk::Semaphore {
        self.slot(frame).transfer_completed
    }

    pub fn in_flight_fence(&self, frame: usize) -> vk::Fence {
        self.slot(frame).in_flight
    }

    pub fn transfer_fence(&self, frame: usize) -> vk::Fence {
        self.slot(frame).transfer
    }

    /// Blocks until the fence is signaled.
    pub fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe {
            self.device_ctx
                .device()
                .wait_for_fences(&[fence], true, WAIT_TIMEOUT)
                .map_err(GfxError::FenceWaitFailed)?;
        }
        Ok(())
    }

    pub fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.wait_fence(fence)?;
        unsafe { self.device_ctx.device().reset_fences(&[fence])? };
        Ok(())
    }

    pub(crate) fn mark_image_acquired(&self, frame: usize) {
        self.flags[frame].image_acquired.store(true, Ordering::Release);
    }

    pub(crate) fn take_image_acquired(&self, frame: usize) -> bool {
        self.flags[frame].image_acquired.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_transfer_pending(&self, frame: usize) {
        self.flags[frame].transfer_pending.store(true, Ordering::Release);
    }

    /// Whether the slot's transfer semaphore is signaled and not yet waited on.
    pub(crate) fn is_transfer_pending(&self, frame: usize) -> bool {
        self.flags[frame].transfer_pending.load(Ordering::Acquire)
    }

    pub(crate) fn take_transfer_pending(&self, frame: usize) -> bool {
        self.flags[frame].transfer_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_render_signaled(&self, frame: usize) {
        self.flags[frame].render_signaled.store(true, Ordering::Release);
    }

    pub(crate) fn take_render_signaled(&self, frame: usize) -> bool {
        self.flags[frame].render_signaled.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn arm_fence(&self, frame: usize) {
        self.flags[frame].fence_armed.store(true, Ordering::Release);
    }

    pub(crate) fn take_fence_armed(&self, frame: usize) -> bool {
        self.flags[frame].fence_armed.swap(false, Ordering::AcqRel)
    }

    /// Makes the next graphics submission wait on the host for the transfer fence.
    pub fn ask_for_waiting_for_transfer(&self) {
        self.graphics_waits_transfer.request();
    }

    pub fn take_transfer_pause_flag(&self) -> bool {
        self.graphics_waits_transfer.take()
    }

    pub fn device_ctx(&self) -> &Arc<DeviceContext> {
        &self.device_ctx
    }
}

impl Drop for SyncTools {
    fn drop(&mut self) {
        let device = self.device_ctx.device();
        unsafe {
            // A fence reset by acquire may never be signaled, so fences are not waited here
            if let Err(err) = device.device_wait_idle() {
                log::error!("Failed to wait for device idle: {}", err);
            }
            for slot in self.slots.drain(..) {
                device.destroy_semaphore(slot.image_available, None);
                device.destroy_semaphore(slot.render_completed, None);
                device.destroy_semaphore(slot.transfer_completed, None);
                device.destroy_fence(slot.in_flight, None);
                device.destroy_fence(slot.transfer, None);
            }
        }
    }
}
