use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::memory_ctx::allocator::{
    AllocationHandle, MemoryAccess, MemoryAllocator, MemoryPlacement,
};
use crate::renderer::error::GfxError;
use crate::renderer::internals::registry::Registry;
use crate::renderer::sync_policy::SyncPolicy;

slotmap::new_key_type! {
    pub struct ImageKey;
}

/// Sampled texture formats the factory knows how to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8G8B8Srgb,
    R8G8B8A8Srgb,
    R8G8B8A8Unorm,
    R32G32B32A32Float,
    R8Srgb,
    R8Unorm,
    R16Float,
    R32Float,
}

impl ImageFormat {
    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::R8G8B8Srgb => vk::Format::R8G8B8_SRGB,
            Self::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::R8Srgb => vk::Format::R8_SRGB,
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::R16Float => vk::Format::R16_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
        }
    }

    pub fn components(self) -> u32 {
        match self {
            Self::R8G8B8Srgb => 3,
            Self::R8G8B8A8Srgb | Self::R8G8B8A8Unorm | Self::R32G32B32A32Float => 4,
            Self::R8Srgb | Self::R8Unorm | Self::R16Float | Self::R32Float => 1,
        }
    }

    pub fn texel_size(self) -> u64 {
        match self {
            Self::R8Srgb | Self::R8Unorm => 1,
            Self::R16Float => 2,
            Self::R8G8B8Srgb => 3,
            Self::R8G8B8A8Srgb | Self::R8G8B8A8Unorm | Self::R32Float => 4,
            Self::R32G32B32A32Float => 16,
        }
    }
}

/// Missing channels read as zero, missing alpha as one.
pub fn component_mapping(components: u32) -> vk::ComponentMapping {
    let channel = |present: bool, fill: vk::ComponentSwizzle| {
        if present { vk::ComponentSwizzle::IDENTITY } else { fill }
    };
    vk::ComponentMapping {
        r: vk::ComponentSwizzle::IDENTITY,
        g: channel(components >= 2, vk::ComponentSwizzle::ZERO),
        b: channel(components >= 3, vk::ComponentSwizzle::ZERO),
        a: channel(components >= 4, vk::ComponentSwizzle::ONE),
    }
}

/// Optimal tiling when the format can be sampled, filtered and copied to that way,
/// linear as a second choice.
pub fn pick_tiling(properties: vk::FormatProperties) -> Option<vk::ImageTiling> {
    let required = vk::FormatFeatureFlags::SAMPLED_IMAGE
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
        | vk::FormatFeatureFlags::TRANSFER_DST;

    if properties.optimal_tiling_features.contains(required) {
        Some(vk::ImageTiling::OPTIMAL)
    } else if properties.linear_tiling_features.contains(required) {
        Some(vk::ImageTiling::LINEAR)
    } else {
        None
    }
}

pub fn is_resolution_supported(max_dimension: u32, width: u32, height: u32) -> bool {
    width > 0 && height > 0 && width <= max_dimension && height <= max_dimension
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Cheap value handle to an image and its view owned by an [`ImageFactory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Image {
    key: ImageKey,
    handle: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
    texel_size: u64,
    aspect: vk::ImageAspectFlags,
    allocation: AllocationHandle,
}

impl Image {
    pub fn is_valid(&self) -> bool {
        self.handle != vk::Image::null()
            && self.view != vk::ImageView::null()
            && self.extent.width > 0
            && self.extent.height > 0
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    /// Tightly packed size of the first mip level.
    pub fn byte_size(&self) -> u64 {
        self.extent.width as u64 * self.extent.height as u64 * self.texel_size
    }
}

struct ImageRecord {
    image: vk::Image,
    view: vk::ImageView,
    allocation: AllocationHandle,
}

pub struct ImageFactory<S: SyncPolicy> {
    images: Registry<ImageKey, ImageRecord, S>,
    allocator: Arc<MemoryAllocator<S>>,
}

impl<S: SyncPolicy> ImageFactory<S> {
    pub fn new(allocator: Arc<MemoryAllocator<S>>) -> Self {
        Self {
            images: Registry::new(),
            allocator,
        }
    }

    /// Creates a sampled image that transfers can write to.
    pub fn make_image(&self, format: ImageFormat, width: u32, height: u32) -> Result<Image> {
        debug_assert!(width > 0 && height > 0);

        let device_ctx = self.allocator.device_ctx();
        if !is_resolution_supported(device_ctx.limits().max_image_dimension2_d, width, height) {
            return Err(GfxError::UnsupportedImageSize { width, height }.into());
        }

        let vk_format = format.vk_format();
        let tiling = pick_tiling(device_ctx.format_properties(vk_format))
            .ok_or(GfxError::UnsupportedImageFormat(vk_format))?;
        if tiling == vk::ImageTiling::LINEAR {
            log::warn!("Format {:?} falls back to linear tiling", vk_format);
        }

        self.create(
            vk_format,
            vk::Extent2D { width, height },
            tiling,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
            component_mapping(format.components()),
            format.texel_size(),
        )
    }

    /// Creates a depth attachment.
    pub fn make_depth_image(&self, format: vk::Format, extent: vk::Extent2D) -> Result<Image> {
        let device_ctx = self.allocator.device_ctx();
        if !is_resolution_supported(device_ctx.limits().max_image_dimension2_d, extent.width, extent.height) {
            return Err(GfxError::UnsupportedImageSize {
                width: extent.width,
                height: extent.height,
            }
            .into());
        }
        if !device_ctx
            .format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return Err(GfxError::UnsupportedImageFormat(format).into());
        }

        self.create(
            format,
            extent,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(format),
            vk::ComponentMapping::default(),
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        components: vk::ComponentMapping,
        texel_size: u64,
    ) -> Result<Image> {
        let device_ctx = self.allocator.device_ctx();
        let device = device_ctx.device();
        let families = device_ctx.sharing_families();

        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        image_info = if families.len() > 1 {
            image_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            image_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let image = unsafe { device.create_image(&image_info, None)? };

        let allocation = match self.allocator.make_image_allocation(
            "image",
            image,
            tiling,
            MemoryAccess::Transfer,
            MemoryPlacement::Device,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(components)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                self.allocator.destroy_allocation(allocation)?;
                return Err(err.into());
            }
        };

        let key = self.images.insert(ImageRecord {
            image,
            view,
            allocation,
        });

        Ok(Image {
            key,
            handle: image,
            view,
            extent,
            format,
            texel_size,
            aspect,
            allocation,
        })
    }

    pub fn destroy_image(&self, image: Image) -> Result<()> {
        let record = self.images.remove(image.key);
        debug_assert!(record.is_some(), "image destroyed twice");
        match record {
            Some(record) => self.destroy_record(record),
            None => Ok(()),
        }
    }

    pub fn is_live(&self, image: &Image) -> bool {
        self.images.contains(image.key)
    }

    fn destroy_record(&self, record: ImageRecord) -> Result<()> {
        let device = self.allocator.device_ctx().device();
        unsafe {
            device.destroy_image_view(record.view, None);
            device.destroy_image(record.image, None);
        }
        self.allocator.destroy_allocation(record.allocation)
    }
}

impl<S: SyncPolicy> Drop for ImageFactory<S> {
    fn drop(&mut self) {
        let leaked = self.images.drain();
        if !leaked.is_empty() {
            log::warn!("Destroying {} images that were never returned", leaked.len());
        }
        for record in leaked {
            if let Err(err) = self.destroy_record(record) {
                log::error!("Failed to destroy image: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_fills_missing_channels() {
        let single = component_mapping(1);
        assert_eq!(single.r, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(single.g, vk::ComponentSwizzle::ZERO);
        assert_eq!(single.b, vk::ComponentSwizzle::ZERO);
        assert_eq!(single.a, vk::ComponentSwizzle::ONE);

        let rgb = component_mapping(3);
        assert_eq!(rgb.b, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(rgb.a, vk::ComponentSwizzle::ONE);

        assert_eq!(component_mapping(4).a, vk::ComponentSwizzle::IDENTITY);
    }

    #[test]
    fn tiling_prefers_optimal_then_linear() {
        let sampled = vk::FormatFeatureFlags::SAMPLED_IMAGE
            | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
            | vk::FormatFeatureFlags::TRANSFER_DST;

        let both = vk::FormatProperties {
            optimal_tiling_features: sampled,
            linear_tiling_features: sampled,
            ..Default::default()
        };
        assert_eq!(pick_tiling(both), Some(vk::ImageTiling::OPTIMAL));

        let linear_only = vk::FormatProperties {
            linear_tiling_features: sampled,
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
            ..Default::default()
        };
        assert_eq!(pick_tiling(linear_only), Some(vk::ImageTiling::LINEAR));

        assert_eq!(pick_tiling(vk::FormatProperties::default()), None);
    }

    #[test]
    fn resolution_limits() {
        assert!(is_resolution_supported(4096, 4096, 1));
        assert!(!is_resolution_supported(4096, 4097, 1));
        assert!(!is_resolution_supported(4096, 0, 16));
    }

    #[test]
    fn texel_sizes_match_formats() {
        assert_eq!(ImageFormat::R8G8B8A8Srgb.texel_size(), 4);
        assert_eq!(ImageFormat::R32G32B32A32Float.texel_size(), 16);
        assert_eq!(ImageFormat::R16Float.components(), 1);
    }

    #[test]
    fn combined_depth_formats_include_stencil() {
        assert!(depth_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }
}
