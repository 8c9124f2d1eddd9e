pub mod command_pools;
pub mod pending;
pub mod scheduler;
pub mod swapchain;
pub mod sync_tools;

use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::contexts::frame_ctx::scheduler::Scheduler;
use crate::renderer::contexts::frame_ctx::swapchain::SwapchainManager;
use crate::renderer::contexts::frame_ctx::sync_tools::SyncTools;
use crate::renderer::sync_policy::SyncPolicy;

/// Responsibilities:
/// - Manage per-frame command buffers
/// - Manage synchronization between frames and queues
/// - Own the swapchain when the device has a surface
pub struct FrameContext<S: SyncPolicy> {
    // Declared first so it is dropped before the scheduler and the sync objects it uses
    pub swapchain: Option<SwapchainManager>,
    pub scheduler: Scheduler<S>,
    pub sync: Arc<SyncTools>,
}

impl<S: SyncPolicy> FrameContext<S> {
    /// `window_extent` is used when the surface leaves the swapchain size to the caller.
    pub fn new(
        device_ctx: Arc<DeviceContext>,
        config: &RenderConfig,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let sync = Arc::new(SyncTools::new(device_ctx.clone(), config.frames_in_flight)?);
        let swapchain = match device_ctx.surface() {
            Some(_) => Some(SwapchainManager::new(sync.clone(), config, window_extent)?),
            None => None,
        };

        Ok(Self {
            swapchain,
            scheduler: Scheduler::new(sync.clone()),
            sync,
        })
    }

    pub fn frames(&self) -> usize {
        self.sync.frames()
    }
}
