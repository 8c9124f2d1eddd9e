pub mod allocator;
pub mod heap_selector;
