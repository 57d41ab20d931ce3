pub mod allocator;

pub use allocator::{
    align_up,
    create_allocator,
    BestFitAllocator,
    BufferAllocator,
    DeviceAllocator,
    LinearAllocator,
};
