pub mod codegen;
pub mod error;
pub mod memory;
pub mod model;
pub mod schedule;
pub mod target;

// Re-export commonly used types
pub use codegen::{
    CompiledModule, LinkedModule, Linker, MergeDirective, ModuleBuilder, ModuleReader, NodeEmitter,
    SectionSet, SectionWriter,
};
pub use error::{Error, ErrorKind, Result};
pub use memory::{BestFitAllocator, BufferAllocator, DeviceAllocator, LinearAllocator};
pub use model::{DataType, Graph, Module, Node, NodeAttributes, NodeId, OpCode, OutputId};
pub use schedule::{
    schedule_module, AllocationTable, BufferAllocation, Lifetime, LogicalBuffer, MemoryLocation,
    PhysicalBuffer, ScheduleResult, Scheduler,
};
pub use target::{AllocatorConfig, AllocatorKind, GenericTarget, Target, TargetOptions};
