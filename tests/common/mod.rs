use kiln::{RenderConfig, Renderer, Synchronized};

/// A headless renderer, or `None` when this machine has no usable Vulkan device.
pub fn headless_renderer(frames: usize) -> Option<Renderer<Synchronized>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = RenderConfig::default()
        .with_frames_in_flight(frames)
        .with_validation(false);
    match Renderer::headless(&config) {
        Ok(renderer) => Some(renderer),
        Err(err) => {
            eprintln!("skipping: no Vulkan device available ({err})");
            None
        }
    }
}
