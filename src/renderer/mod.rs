pub mod config;
pub mod contexts;
pub mod error;
pub mod internals;
pub mod sync_policy;

use std::sync::Arc;

use ash::vk;
use color_eyre::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::graphics_context::GraphicsContext;
use crate::renderer::contexts::device_ctx::{DeviceContext, NoWindow};
use crate::renderer::contexts::frame_ctx::FrameContext;
use crate::renderer::contexts::resource_ctx::ResourceContext;
use crate::renderer::contexts::transfer_ctx::transfer_manager::TransferManager;
use crate::renderer::sync_policy::{Synchronized, SyncPolicy};

/// The slot being recorded and, with a window, the swapchain image it renders to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    pub image: Option<u32>,
}

/// Owns every context in teardown order: uploads, then frame sync, then resources,
/// and the device last.
pub struct Renderer<S: SyncPolicy = Synchronized> {
    transfer: TransferManager<S>,
    frame_ctx: FrameContext<S>,
    resources: ResourceContext<S>,
    device_ctx: Arc<DeviceContext>,

    // Frame counter when there is no swapchain to keep it
    headless_frame: usize,
}

impl<S: SyncPolicy> Renderer<S> {
    pub fn new<W>(window: Option<&W>, window_extent: vk::Extent2D, config: &RenderConfig) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let context = GraphicsContext::acquire()?;
        let device_ctx = Arc::new(DeviceContext::new(context, window, config)?);

        let resources = ResourceContext::new(device_ctx.clone())?;
        let frame_ctx = FrameContext::new(device_ctx.clone(), config, window_extent)?;
        let transfer = TransferManager::new(
            frame_ctx.scheduler.transfer.clone(),
            resources.buffers.clone(),
        );
        log::info!(
            "Renderer ready with {} frames in flight{}",
            frame_ctx.frames(),
            if frame_ctx.swapchain.is_some() { "" } else { ", headless" }
        );

        Ok(Self {
            transfer,
            frame_ctx,
            resources,
            device_ctx,
            headless_frame: 0,
        })
    }

    pub fn headless(config: &RenderConfig) -> Result<Self> {
        Self::new::<NoWindow>(None, vk::Extent2D::default(), config)
    }

    pub fn device_ctx(&self) -> &Arc<DeviceContext> {
        &self.device_ctx
    }

    pub fn resources(&self) -> &ResourceContext<S> {
        &self.resources
    }

    pub fn frame_ctx(&self) -> &FrameContext<S> {
        &self.frame_ctx
    }

    pub fn transfer(&self) -> &TransferManager<S> {
        &self.transfer
    }

    pub fn current_frame(&self) -> usize {
        match &self.frame_ctx.swapchain {
            Some(swapchain) => swapchain.current_frame(),
            None => self.headless_frame,
        }
    }

    /// Waits for the current slot to come free and acquires its swapchain image.
    pub fn begin_frame(&mut self) -> Result<Frame> {
        let index = self.current_frame();
        self.transfer.begin_frame(index)?;

        let image = match &self.frame_ctx.swapchain {
            Some(swapchain) => Some(swapchain.acquire_next_image(index)?),
            None => None,
        };
        Ok(Frame { index, image })
    }

    /// Records graphics commands for `frame`.
    pub fn record(
        &self,
        frame: &Frame,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        self.frame_ctx.scheduler.graphics.record_graphics(frame.index, f)
    }

    /// Submits uploads and graphics work, presents, and moves to the next slot.
    pub fn end_frame(&mut self, frame: Frame) -> Result<()> {
        let scheduler = &self.frame_ctx.scheduler;
        self.transfer.flush(frame.index)?;
        scheduler.graphics.submit_graphics_commands(frame.index)?;

        match (&self.frame_ctx.swapchain, frame.image) {
            (Some(swapchain), Some(image)) => {
                swapchain.present(&scheduler.present, image, frame.index)?;
                swapchain.advance_frame();
            }
            _ => {
                self.headless_frame = (self.headless_frame + 1) % self.frame_ctx.frames();
            }
        }
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.frame_ctx.scheduler.wait_idle()
    }
}
