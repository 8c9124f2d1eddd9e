use ash::vk;

/// Contains configuration options for the renderer like the frame count, vsync, and preferred formats
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub frames_in_flight: usize,
    pub vsync: bool,
    pub preferred_color_formats: Vec<vk::Format>,
    pub preferred_depth_formats: Vec<vk::Format>,
    pub enable_validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vsync: false,
            preferred_color_formats: vec![
                vk::Format::B8G8R8A8_SRGB,
                vk::Format::R8G8B8A8_SRGB,
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::B8G8R8A8_UNORM,
            ],
            preferred_depth_formats: vec![
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::X8_D24_UNORM_PACK32,
                vk::Format::D16_UNORM,
                vk::Format::D24_UNORM_S8_UINT,
                vk::Format::D16_UNORM_S8_UINT,
            ],
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RenderConfig {
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_srgb_and_two_frames() {
        let config = RenderConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert!(!config.vsync);
        assert_eq!(config.preferred_color_formats[0], vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.preferred_depth_formats[0], vk::Format::D32_SFLOAT);
    }

    #[test]
    fn builder_methods_override_fields() {
        let config = RenderConfig::default()
            .with_frames_in_flight(3)
            .with_vsync(true)
            .with_validation(false);
        assert_eq!(config.frames_in_flight, 3);
        assert!(config.vsync);
        assert!(!config.enable_validation);
    }
}
