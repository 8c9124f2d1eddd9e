pub mod device;
pub mod graphics_context;
pub mod instance;
pub mod queue;

use std::sync::Arc;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::device::{QueueFamilies, RenderDevice};
use crate::renderer::contexts::device_ctx::graphics_context::GraphicsContext;
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::queue::Queue;

/// Presentation surface of a window-bound device.
pub struct RenderSurface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
}

/// Responsibilities:
/// - Own the Vulkan instance, optional surface, and logical device
/// - Hand out read-only device, queue, and capability data to every other component
///
/// Components hold an `Arc<DeviceContext>` and never the other way around.
pub struct DeviceContext {
    device: ash::Device,
    physical: vk::PhysicalDevice,
    families: QueueFamilies,
    graphics_queue: Arc<Queue>,
    transfer_queue: Arc<Queue>,
    present_queue: Option<Arc<Queue>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    surface: Option<RenderSurface>,
    instance: RenderInstance,
    context: Arc<GraphicsContext>,
}

impl DeviceContext {
    pub fn new<W>(
        context: Arc<GraphicsContext>,
        window: Option<&W>,
        config: &RenderConfig,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let handles = match window {
            Some(window) => Some((
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
            )),
            None => None,
        };

        let instance = RenderInstance::new(
            &context,
            handles.map(|(display, _)| display),
            config.enable_validation,
        )?;

        let surface = match handles {
            Some((display, window)) => {
                let (surface, loader) = instance.create_surface(&context, display, window)?;
                Some(RenderSurface { surface, loader })
            }
            None => None,
        };

        let device = match RenderDevice::new(
            &instance.instance,
            surface.as_ref().map(|s| (&s.surface, &s.loader)),
        ) {
            Ok(device) => device,
            Err(err) => {
                if let Some(surface) = &surface {
                    unsafe { surface.loader.destroy_surface(surface.surface, None) };
                }
                return Err(err);
            }
        };

        let (memory_properties, properties) = unsafe {
            (
                instance.instance.get_physical_device_memory_properties(device.physical),
                instance.instance.get_physical_device_properties(device.physical),
            )
        };

        Ok(Self {
            device: device.logical,
            physical: device.physical,
            families: device.families,
            graphics_queue: device.graphics_queue,
            transfer_queue: device.transfer_queue,
            present_queue: device.present_queue,
            memory_properties,
            properties,
            surface,
            instance,
            context,
        })
    }

    /// Device without a presentation surface, for offscreen work and tests.
    pub fn headless(context: Arc<GraphicsContext>, config: &RenderConfig) -> Result<Self> {
        Self::new::<NoWindow>(context, None, config)
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn families(&self) -> &QueueFamilies {
        &self.families
    }

    pub fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    pub fn transfer_queue(&self) -> &Queue {
        &self.transfer_queue
    }

    pub fn present_queue(&self) -> Result<&Queue> {
        self.present_queue
            .as_deref()
            .ok_or_eyre("Device was created without a presentation surface")
    }

    pub fn surface(&self) -> Option<&RenderSurface> {
        self.surface.as_ref()
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical, format)
        }
    }

    /// Family indices a resource shared between graphics and transfer must list.
    pub fn sharing_families(&self) -> Vec<u32> {
        let mut indices = vec![self.families.graphics.index];
        if self.families.transfer.index != self.families.graphics.index {
            indices.push(self.families.transfer.index);
        }
        indices
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle on shutdown: {}", err);
            }
            self.device.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.surface, None);
            }
        }
    }
}

/// Stand-in window type for [`DeviceContext::headless`].
pub enum NoWindow {}

impl HasDisplayHandle for NoWindow {
    fn display_handle(
        &self,
    ) -> std::result::Result<raw_window_handle::DisplayHandle<'_>, raw_window_handle::HandleError> {
        match *self {}
    }
}

impl HasWindowHandle for NoWindow {
    fn window_handle(
        &self,
    ) -> std::result::Result<raw_window_handle::WindowHandle<'_>, raw_window_handle::HandleError> {
        match *self {}
    }
}
