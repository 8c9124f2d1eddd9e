use std::ffi::{CStr, c_char, c_void};

use ash::vk;
use color_eyre::Result;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::renderer::contexts::device_ctx::graphics_context::GraphicsContext;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Keeps the Vulkan instance and the optional validation messenger alive
pub struct RenderInstance {
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl RenderInstance {
    pub fn new(
        context: &GraphicsContext,
        display: Option<RawDisplayHandle>,
        enable_validation: bool,
    ) -> Result<Self> {
        let entry = context.entry();
        let enable_validation = enable_validation && Self::validation_supported(entry)?;

        let application_info = vk::ApplicationInfo::default()
            .application_name(c"kiln")
            .engine_name(c"kiln")
            .api_version(vk::API_VERSION_1_2);

        let enabled_layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let mut extensions = context.required_instance_extensions(display)?;
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME);
        }
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME);
            extensions.push(ash::khr::get_physical_device_properties2::NAME);
        }
        let enabled_extension_names = extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if enable_validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info
            .flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils = if enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(entry, &instance);
            let messenger = unsafe {
                loader.create_debug_utils_messenger(&debug_utils_messenger_create_info(), None)?
            };
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            instance,
            debug_utils,
        })
    }

    pub fn create_surface(
        &self,
        context: &GraphicsContext,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<(vk::SurfaceKHR, ash::khr::surface::Instance)> {
        let surface = unsafe {
            ash_window::create_surface(context.entry(), &self.instance, display, window, None)?
        };
        let surface_loader = ash::khr::surface::Instance::new(context.entry(), &self.instance);
        Ok((surface, surface_loader))
    }

    fn validation_supported(entry: &ash::Entry) -> Result<bool> {
        let supported = unsafe { entry.enumerate_instance_layer_properties()? }
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));

        if !supported {
            log::warn!("Validation layer {:?} not available, continuing without it", VALIDATION_LAYER);
        }
        Ok(supported)
    }
}

impl Drop for RenderInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn debug_utils_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let msg = unsafe {
        if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
            c"<no message>"
        } else {
            CStr::from_ptr((*p_callback_data).p_message)
        }
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            log::trace!("{} {:?}", msg_type, msg);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("{} {:?}", msg_type, msg);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("{} {:?}", msg_type, msg);
        }
        _ => {
            log::info!("{} {:?}", msg_type, msg);
        }
    }

    vk::FALSE
}
