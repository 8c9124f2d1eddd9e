use std::collections::BTreeSet;
use std::ffi::{CStr, c_char};
use std::sync::Arc;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;

use crate::renderer::contexts::device_ctx::queue::{Queue, QueueFamily};
use crate::renderer::error::GfxError;

/// Queue families picked for one physical device.
#[derive(Clone, Debug)]
pub struct QueueFamilies {
    pub graphics: QueueFamily,
    pub transfer: QueueFamily,
    pub present: Option<QueueFamily>,
}

impl QueueFamilies {
    /// Distinct family indices, in ascending order.
    pub fn unique_indices(&self) -> Vec<u32> {
        let mut indices = BTreeSet::new();
        indices.insert(self.graphics.index);
        indices.insert(self.transfer.index);
        if let Some(present) = &self.present {
            indices.insert(present.index);
        }
        indices.into_iter().collect()
    }
}

/// Chooses graphics, transfer and present families from the reported properties.
///
/// `supports_present` is only consulted when a surface exists; pass `None` for headless use.
pub fn pick_queue_families(
    properties: &[vk::QueueFamilyProperties],
    supports_present: Option<&dyn Fn(u32) -> bool>,
) -> Option<QueueFamilies> {
    let families = properties
        .iter()
        .enumerate()
        .filter(|(_, props)| props.queue_count > 0)
        .map(|(i, props)| {
            let present = supports_present.is_some_and(|f| f(i as u32));
            QueueFamily::new(i as u32, *props, present)
        })
        .collect::<Vec<_>>();

    let present = match supports_present {
        Some(_) => Some(
            families
                .iter()
                .find(|f| f.supports_graphics() && f.supports_present())
                .or_else(|| families.iter().find(|f| f.supports_present()))?
                .clone(),
        ),
        None => None,
    };

    // Prefer a graphics family that can also present
    let graphics = present
        .as_ref()
        .filter(|f| f.supports_graphics())
        .or_else(|| families.iter().find(|f| f.supports_graphics()))?
        .clone();

    let transfer = families
        .iter()
        .find(|f| f.is_dedicated_transfer())
        .unwrap_or(&graphics)
        .clone();

    Some(QueueFamilies {
        graphics,
        transfer,
        present,
    })
}

/// Lower is better.
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        vk::PhysicalDeviceType::OTHER => 4,
        _ => 5,
    }
}

/// Physical device choice plus the logical device and its queues
pub struct RenderDevice {
    pub physical: vk::PhysicalDevice,
    pub logical: ash::Device,
    pub families: QueueFamilies,
    pub graphics_queue: Arc<Queue>,
    pub transfer_queue: Arc<Queue>,
    pub present_queue: Option<Arc<Queue>>,
}

impl RenderDevice {
    pub fn new(
        instance: &ash::Instance,
        surface: Option<(&vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    ) -> Result<Self> {
        let (physical, families) = Self::select_physical_device(instance, surface)?;

        let properties = unsafe { instance.get_physical_device_properties(physical) };
        log::info!(
            "Selected physical device {:?} (graphics family {}, transfer family {}, present family {:?})",
            properties.device_name_as_c_str().unwrap_or(c"<unnamed>"),
            families.graphics.index,
            families.transfer.index,
            families.present.as_ref().map(|f| f.index),
        );

        let logical = Self::create_logical_device(instance, physical, &families, surface.is_some())?;

        // Roles that land on the same family share one queue and its submission lock
        let mut queues: Vec<Arc<Queue>> = Vec::new();
        let mut get_queue = |family: &QueueFamily| {
            if let Some(queue) = queues.iter().find(|q| q.family == *family) {
                return queue.clone();
            }
            let handle = unsafe { logical.get_device_queue(family.index, 0) };
            let queue = Arc::new(Queue::new(family.clone(), handle));
            queues.push(queue.clone());
            queue
        };
        let graphics_queue = get_queue(&families.graphics);
        let transfer_queue = get_queue(&families.transfer);
        let present_queue = families.present.as_ref().map(&mut get_queue);

        Ok(Self {
            physical,
            logical,
            families,
            graphics_queue,
            transfer_queue,
            present_queue,
        })
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: Option<(&vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let req_device_exts = Self::get_required_device_extensions(surface.is_some());

        let candidate = unsafe { instance.enumerate_physical_devices()? }
            .into_iter()
            // Filter out devices that do not contain the required device extensions
            .filter(|device| {
                let supported = unsafe {
                    instance
                        .enumerate_device_extension_properties(*device)
                        .unwrap_or_default()
                };
                req_device_exts.iter().all(|req| {
                    supported
                        .iter()
                        .any(|sup| sup.extension_name_as_c_str() == Ok(*req))
                })
            })
            // Filter out devices that do not contain the required queues
            .filter_map(|device| {
                let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
                let families = match surface {
                    Some((surface, loader)) => {
                        let present: &dyn Fn(u32) -> bool = &|index| unsafe {
                            loader
                                .get_physical_device_surface_support(device, index, *surface)
                                .unwrap_or(false)
                        };
                        pick_queue_families(&props, Some(present))
                    }
                    None => pick_queue_families(&props, None),
                };
                families.map(|families| (device, families))
            })
            .min_by_key(|(device, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                device_type_rank(props.device_type)
            });

        candidate.ok_or_else(|| GfxError::NoSuitablePhysicalDevice.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        families: &QueueFamilies,
        with_swapchain: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos = families
            .unique_indices()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let enabled_extension_names = Self::get_required_device_extensions(with_swapchain)
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let supported_features = unsafe { instance.get_physical_device_features(physical) };
        let enabled_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(supported_features.sampler_anisotropy == vk::TRUE);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.create_device(physical, &device_create_info, None)? };
        Ok(device)
    }

    fn get_required_device_extensions(with_swapchain: bool) -> Vec<&'static CStr> {
        let mut exts = Vec::new();
        if with_swapchain {
            exts.push(ash::khr::swapchain::NAME);
        }
        #[cfg(target_os = "macos")]
        exts.push(ash::khr::portability_subset::NAME);
        exts
    }

    pub fn present_queue(&self) -> Result<&Queue> {
        self.present_queue
            .as_deref()
            .ok_or_eyre("Device was created without a presentation surface")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn headless_prefers_dedicated_transfer_family() {
        let families = pick_queue_families(
            &[
                props(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
                props(vk::QueueFlags::TRANSFER),
            ],
            None,
        )
        .unwrap();

        assert_eq!(families.graphics.index, 0);
        assert_eq!(families.transfer.index, 1);
        assert!(families.present.is_none());
        assert_eq!(families.unique_indices(), vec![0, 1]);
    }

    #[test]
    fn transfer_falls_back_to_graphics_family() {
        let families = pick_queue_families(&[props(vk::QueueFlags::GRAPHICS)], None).unwrap();
        assert_eq!(families.transfer.index, families.graphics.index);
        assert_eq!(families.unique_indices(), vec![0]);
    }

    #[test]
    fn present_family_prefers_graphics_capable_one() {
        let present: &dyn Fn(u32) -> bool = &|index| index >= 1;
        let families = pick_queue_families(
            &[
                props(vk::QueueFlags::GRAPHICS),
                props(vk::QueueFlags::TRANSFER),
                props(vk::QueueFlags::GRAPHICS),
            ],
            Some(present),
        )
        .unwrap();

        assert_eq!(families.present.as_ref().map(|f| f.index), Some(2));
        assert_eq!(families.graphics.index, 2);
        assert_eq!(families.transfer.index, 1);
    }

    #[test]
    fn no_graphics_family_is_rejected() {
        assert!(pick_queue_families(&[props(vk::QueueFlags::TRANSFER)], None).is_none());
    }

    #[test]
    fn discrete_gpus_rank_first() {
        assert!(
            device_type_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                < device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
                < device_type_rank(vk::PhysicalDeviceType::CPU)
        );
    }
}
