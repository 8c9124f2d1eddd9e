use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use smallvec::SmallVec;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::frame_ctx::scheduler::PresentScheduler;
use crate::renderer::contexts::frame_ctx::sync_tools::{FRAMES_HINT, SyncTools};
use crate::renderer::error::GfxError;

/// Surface properties the swapchain is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageProperties {
    pub color_format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub depth_format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub images: u32,
    pub extent: vk::Extent2D,
}

/// Everything [`pick_properties`] looks at, as reported by the device.
pub struct SurfaceSupport<'a> {
    pub formats: &'a [vk::SurfaceFormatKHR],
    pub present_modes: &'a [vk::PresentModeKHR],
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub supports_depth: &'a dyn Fn(vk::Format) -> bool,
}

pub fn desired_present_modes(frames: usize, vsync: bool) -> &'static [vk::PresentModeKHR] {
    use vk::PresentModeKHR as Mode;

    if frames == 1 {
        &[Mode::IMMEDIATE]
    } else if vsync {
        &[Mode::MAILBOX, Mode::FIFO, Mode::FIFO_RELAXED, Mode::IMMEDIATE]
    } else {
        &[Mode::IMMEDIATE, Mode::FIFO_RELAXED, Mode::FIFO, Mode::MAILBOX]
    }
}

pub fn pick_present_mode(
    available: &[vk::PresentModeKHR],
    frames: usize,
    vsync: bool,
) -> Result<vk::PresentModeKHR, GfxError> {
    desired_present_modes(frames, vsync)
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .ok_or(GfxError::NoSuitablePresentMode)
}

/// First preferred format the surface offers in the sRGB non-linear color space.
pub fn pick_color_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: &[vk::Format],
) -> Result<vk::SurfaceFormatKHR, GfxError> {
    preferred
        .iter()
        .find_map(|&format| {
            available.iter().copied().find(|surface_format| {
                surface_format.format == format
                    && surface_format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .ok_or(GfxError::NoSuitableColorFormat)
}

pub fn pick_depth_format(
    preferred: &[vk::Format],
    supports_depth: impl Fn(vk::Format) -> bool,
) -> Result<vk::Format, GfxError> {
    preferred
        .iter()
        .copied()
        .find(|&format| supports_depth(format))
        .ok_or(GfxError::NoSuitableDepthFormat)
}

/// A `max_image_count` of zero means the surface sets no upper bound.
pub fn validate_frames(
    frames: usize,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> Result<u32, GfxError> {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    let error = GfxError::UnsupportedFramesInFlight {
        requested: frames,
        min,
        max,
    };

    let images = u32::try_from(frames).map_err(|_| error.clone())?;
    if images < min || (max > 0 && images > max) {
        return Err(error);
    }
    Ok(images)
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

pub fn pick_properties(
    support: &SurfaceSupport<'_>,
    config: &RenderConfig,
    window_extent: vk::Extent2D,
) -> Result<ImageProperties, GfxError> {
    let color = pick_color_format(support.formats, &config.preferred_color_formats)?;
    Ok(ImageProperties {
        color_format: color.format,
        color_space: color.color_space,
        depth_format: pick_depth_format(&config.preferred_depth_formats, support.supports_depth)?,
        present_mode: pick_present_mode(support.present_modes, config.frames_in_flight, config.vsync)?,
        images: validate_frames(config.frames_in_flight, &support.capabilities)?,
        extent: choose_extent(&support.capabilities, window_extent),
    })
}

/// Responsibilities:
/// - Create the swapchain and its image views for the device's surface
/// - Acquire images on the creation thread, one frame slot at a time
/// - Track the current frame slot
pub struct SwapchainManager {
    properties: ImageProperties,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: SmallVec<[vk::Image; FRAMES_HINT]>,
    views: SmallVec<[vk::ImageView; FRAMES_HINT]>,
    current_frame: AtomicUsize,
    creation_thread: ThreadId,
    sync: Arc<SyncTools>,
}

impl SwapchainManager {
    pub fn new(sync: Arc<SyncTools>, config: &RenderConfig, window_extent: vk::Extent2D) -> Result<Self> {
        debug_assert_eq!(sync.frames(), config.frames_in_flight);

        let device_ctx = sync.device_ctx().clone();
        let surface = device_ctx
            .surface()
            .ok_or_eyre("Swapchain requires a device created with a window")?;
        let physical = device_ctx.physical_device();

        let (formats, present_modes, capabilities) = unsafe {
            (
                surface.loader.get_physical_device_surface_formats(physical, surface.surface)?,
                surface
                    .loader
                    .get_physical_device_surface_present_modes(physical, surface.surface)?,
                surface
                    .loader
                    .get_physical_device_surface_capabilities(physical, surface.surface)?,
            )
        };

        let supports_depth = |format: vk::Format| {
            device_ctx
                .format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        };
        let support = SurfaceSupport {
            formats: &formats,
            present_modes: &present_modes,
            capabilities,
            supports_depth: &supports_depth,
        };
        let properties = pick_properties(&support, config, window_extent)?;
        log::info!(
            "Swapchain: {:?} {:?}, depth {:?}, {:?}, {} images, {}x{}",
            properties.color_format,
            properties.color_space,
            properties.depth_format,
            properties.present_mode,
            properties.images,
            properties.extent.width,
            properties.extent.height,
        );

        let pre_transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };

        let mut families = vec![device_ctx.families().graphics.index];
        if let Some(present) = &device_ctx.families().present {
            if present.index != families[0] {
                families.push(present.index);
            }
        }

        let mut swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(properties.images)
            .image_format(properties.color_format)
            .image_color_space(properties.color_space)
            .image_extent(properties.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(properties.present_mode)
            .clipped(true);
        swapchain_info = if families.len() > 1 {
            swapchain_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            swapchain_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let loader = ash::khr::swapchain::Device::new(device_ctx.instance(), device_ctx.device());
        let swapchain = unsafe { loader.create_swapchain(&swapchain_info, None)? };

        let mut manager = Self {
            properties,
            loader,
            swapchain,
            images: SmallVec::new(),
            views: SmallVec::new(),
            current_frame: AtomicUsize::new(0),
            creation_thread: std::thread::current().id(),
            sync,
        };
        manager.images = unsafe { manager.loader.get_swapchain_images(swapchain)? }.into();
        manager.views = manager.make_views()?;

        Ok(manager)
    }

    fn make_views(&self) -> Result<SmallVec<[vk::ImageView; FRAMES_HINT]>> {
        let device = self.sync.device_ctx().device();
        let views = self
            .images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.properties.color_format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<VkResult<SmallVec<_>>>()?;
        Ok(views)
    }

    pub fn properties(&self) -> &ImageProperties {
        &self.properties
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn loader(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn frames(&self) -> usize {
        self.sync.frames()
    }

    pub fn next_frame(&self, frame: usize) -> usize {
        (frame + 1) % self.frames()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Moves to the next frame slot and returns it.
    pub fn advance_frame(&self) -> usize {
        let next = self.next_frame(self.current_frame());
        self.current_frame.store(next, Ordering::Release);
        next
    }

    /// Waits until `frame` is free again and acquires the next image for it.
    pub fn acquire_next_image(&self, frame: usize) -> Result<u32> {
        debug_assert_eq!(std::thread::current().id(), self.creation_thread);

        let sync = &self.sync;
        let fence = sync.in_flight_fence(frame);
        sync.wait_fence(fence)?;

        let (image, suboptimal) = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available(frame),
                vk::Fence::null(),
            )
        }
        .map_err(GfxError::AcquireFailed)?;
        if suboptimal {
            return Err(GfxError::AcquireFailed(vk::Result::SUBOPTIMAL_KHR).into());
        }

        // Reset only once an image is in hand, the graphics submission signals it again
        unsafe { sync.device_ctx().device().reset_fences(&[fence])? };
        sync.arm_fence(frame);
        sync.mark_image_acquired(frame);

        Ok(image)
    }

    pub fn present(&self, scheduler: &PresentScheduler, image: u32, frame: usize) -> Result<()> {
        debug_assert_eq!(std::thread::current().id(), self.creation_thread);
        scheduler.present_image(&self.loader, self.swapchain, image, frame)
    }

    /// One framebuffer per swapchain image. The caller destroys them with
    /// [`Self::destroy_framebuffers`].
    pub fn make_framebuffers(
        &self,
        render_pass: vk::RenderPass,
        depth_view: Option<vk::ImageView>,
    ) -> Result<Vec<vk::Framebuffer>> {
        let device = self.sync.device_ctx().device();
        let mut framebuffers = Vec::with_capacity(self.views.len());

        for &view in &self.views {
            let mut attachments: SmallVec<[vk::ImageView; 2]> = SmallVec::new();
            attachments.push(view);
            attachments.extend(depth_view);

            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.properties.extent.width)
                .height(self.properties.extent.height)
                .layers(1);
            match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(err) => {
                    self.destroy_framebuffers(framebuffers);
                    return Err(err.into());
                }
            }
        }
        Ok(framebuffers)
    }

    pub fn destroy_framebuffers(&self, framebuffers: Vec<vk::Framebuffer>) {
        let device = self.sync.device_ctx().device();
        for framebuffer in framebuffers {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        let device = self.sync.device_ctx().device();
        unsafe {
            if let Err(err) = device.device_wait_idle() {
                log::error!("Failed to wait for device idle: {}", err);
            }
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
