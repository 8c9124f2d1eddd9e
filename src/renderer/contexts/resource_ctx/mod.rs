pub mod buffer;
pub mod image;
pub mod render_pass;
pub mod shader;

use std::sync::Arc;

use color_eyre::Result;

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::contexts::memory_ctx::allocator::MemoryAllocator;
use crate::renderer::contexts::resource_ctx::buffer::BufferFactory;
use crate::renderer::contexts::resource_ctx::image::ImageFactory;
use crate::renderer::contexts::resource_ctx::render_pass::RenderPassFactory;
use crate::renderer::contexts::resource_ctx::shader::ShaderFactory;
use crate::renderer::sync_policy::SyncPolicy;

/// Responsibilities:
/// - Create buffers, images, shader modules, and render passes
/// - Keep the native objects alive until they are returned to their factory
pub struct ResourceContext<S: SyncPolicy> {
    pub buffers: Arc<BufferFactory<S>>,
    pub images: ImageFactory<S>,
    pub shaders: ShaderFactory<S>,
    pub render_passes: RenderPassFactory<S>,
    pub allocator: Arc<MemoryAllocator<S>>,
}

impl<S: SyncPolicy> ResourceContext<S> {
    pub fn new(device_ctx: Arc<DeviceContext>) -> Result<Self> {
        let allocator = Arc::new(MemoryAllocator::new(device_ctx.clone())?);

        Ok(Self {
            buffers: Arc::new(BufferFactory::new(allocator.clone())),
            images: ImageFactory::new(allocator.clone()),
            shaders: ShaderFactory::new(device_ctx.clone()),
            render_passes: RenderPassFactory::new(device_ctx),
            allocator,
        })
    }
}
