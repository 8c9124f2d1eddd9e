pub mod device_ctx;
pub mod frame_ctx;
pub mod memory_ctx;
pub mod resource_ctx;
pub mod transfer_ctx;
