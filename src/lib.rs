pub mod renderer;

pub use renderer::config::RenderConfig;
pub use renderer::error::GfxError;
pub use renderer::sync_policy::{Synchronized, SyncPolicy, Unsynchronized};
pub use renderer::{Frame, Renderer};
