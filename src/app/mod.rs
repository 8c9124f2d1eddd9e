use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use kiln::{Frame, RenderConfig, Renderer};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

const INITIAL_SIZE: PhysicalSize<u32> = PhysicalSize::new(1280, 720);

pub struct App {
    // Dropped before the window it presents to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    config: RenderConfig,

    start_time: Instant,
    frames_drawn: u64,
    close_requested: bool,
}

impl App {
    pub fn new() -> Result<Self> {
        Ok(Self {
            renderer: None,
            window: None,
            config: RenderConfig::default(),
            start_time: Instant::now(),
            frames_drawn: 0,
            close_requested: false,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.run_app(self)?;
        Ok(())
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        if self.window.is_none() {
            let attributes = Window::default_attributes()
                .with_title("kiln")
                .with_inner_size(INITIAL_SIZE)
                // The swapchain is never recreated
                .with_resizable(false);
            self.window = Some(Arc::new(event_loop.create_window(attributes)?));
        }

        if self.renderer.is_none() {
            let window = self.window.as_ref().ok_or_eyre("Window missing")?;
            let size = window.inner_size();
            let extent = vk::Extent2D {
                width: size.width,
                height: size.height,
            };
            self.renderer = Some(Renderer::new(Some(window.as_ref()), extent, &self.config)?);
        }
        Ok(())
    }

    fn draw(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        let frame = renderer.begin_frame()?;
        let image = acquired_image(renderer, &frame)?;

        let t = self.start_time.elapsed().as_secs_f32();
        let color = vk::ClearColorValue {
            float32: [
                0.5 + 0.5 * t.sin(),
                0.5 + 0.5 * (t * 0.7 + 2.0).sin(),
                0.5 + 0.5 * (t * 1.3 + 4.0).sin(),
                1.0,
            ],
        };

        renderer.record(&frame, |device, cmd| {
            clear_swapchain_image(device, cmd, image, &color);
            Ok(())
        })?;
        renderer.end_frame(frame)?;

        self.frames_drawn += 1;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: color_eyre::Report) {
        log::error!("{:?}", err);
        self.close_requested = true;
        event_loop.exit();
    }
}

fn acquired_image(renderer: &Renderer, frame: &Frame) -> Result<vk::Image> {
    let swapchain = renderer
        .frame_ctx()
        .swapchain
        .as_ref()
        .ok_or_eyre("Renderer has no swapchain")?;
    let index = frame.image.ok_or_eyre("No swapchain image acquired")?;
    swapchain
        .images()
        .get(index as usize)
        .copied()
        .ok_or_eyre("Swapchain image index out of range")
}

fn clear_swapchain_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    color: &vk::ClearColorValue,
) {
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let to_transfer = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let to_present = to_transfer
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty());

    unsafe {
        // Chains with the image-available wait, which happens at the transfer stage
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color,
            &[range],
        );
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(err) = self.init(event_loop) {
            self.fail(event_loop, err);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.window.as_ref().map(|window| window.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = self.draw() {
                    self.fail(event_loop, err);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.close_requested {
            if let Some(renderer) = &self.renderer {
                if let Err(err) = renderer.wait_idle() {
                    log::error!("Failed to drain the queues: {}", err);
                }
            }
            let elapsed = self.start_time.elapsed().as_secs_f32();
            log::info!(
                "Drew {} frames in {:.1}s",
                self.frames_drawn,
                elapsed
            );
            event_loop.exit();
            return;
        }

        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}
