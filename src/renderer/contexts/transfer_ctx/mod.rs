pub mod staging;
pub mod transfer_manager;
