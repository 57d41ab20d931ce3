use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codegen::linker::MergeDirective;
use crate::schedule::buffer::MemoryLocation;

/// Default capacity of device-local memory (2 MiB)
pub const DEFAULT_DEVICE_CAPACITY: usize = 2 * 1024 * 1024;

/// Default row size of device-local memory
pub const DEFAULT_DEVICE_GRANULARITY: usize = 64;

/// Allocation strategy for a memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorKind {
    /// Bump allocation, no reuse across lifetimes
    Linear,
    /// Lifetime-aware placement into the tightest free gap
    BestFit,
    /// Best fit in fixed-size rows of device memory
    Device { granularity: usize },
}

/// Allocator selection and budget for one memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub kind: AllocatorKind,
    /// Capacity in bytes (`None` = unbounded)
    pub capacity: Option<usize>,
}

impl AllocatorConfig {
    pub fn new(kind: AllocatorKind, capacity: Option<usize>) -> Self {
        Self { kind, capacity }
    }

    pub fn linear() -> Self {
        Self::new(AllocatorKind::Linear, None)
    }

    pub fn best_fit() -> Self {
        Self::new(AllocatorKind::BestFit, None)
    }

    pub fn device(granularity: usize, capacity: usize) -> Self {
        Self::new(AllocatorKind::Device { granularity }, Some(capacity))
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Options controlling scheduling and linking for a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Allocator per memory location
    pub allocators: BTreeMap<MemoryLocation, AllocatorConfig>,
    /// Lower bound on every buffer's alignment
    pub min_alignment: usize,
    /// Compute kernels whose outputs live in device-local memory
    pub device_kernels: Vec<String>,
    /// Auxiliary sections folded into another section at link time
    pub merge_directives: Vec<MergeDirective>,
    /// Run the buffer-alias analyzer
    pub enable_alias_analysis: bool,
    /// Alignment of every section body in the linked binary
    pub section_alignment: usize,
}

impl Default for TargetOptions {
    fn default() -> Self {
        let mut allocators = BTreeMap::new();
        allocators.insert(MemoryLocation::Input, AllocatorConfig::linear());
        allocators.insert(MemoryLocation::Output, AllocatorConfig::linear());
        allocators.insert(MemoryLocation::Rdata, AllocatorConfig::linear());
        allocators.insert(MemoryLocation::Data, AllocatorConfig::best_fit());
        allocators.insert(MemoryLocation::SharedData, AllocatorConfig::best_fit());
        allocators.insert(
            MemoryLocation::Device,
            AllocatorConfig::device(DEFAULT_DEVICE_GRANULARITY, DEFAULT_DEVICE_CAPACITY),
        );

        Self {
            allocators,
            min_alignment: 1,
            device_kernels: Vec::new(),
            merge_directives: Vec::new(),
            enable_alias_analysis: true,
            section_alignment: 8,
        }
    }
}

impl TargetOptions {
    /// Create a new options object with default allocators
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific allocator for a memory location
    pub fn with_allocator(mut self, location: MemoryLocation, config: AllocatorConfig) -> Self {
        self.allocators.insert(location, config);
        self
    }

    /// Set the minimum alignment
    pub fn set_min_alignment(mut self, alignment: usize) -> Self {
        self.min_alignment = alignment.max(1);
        self
    }

    /// Route the outputs of a compute kernel to device memory
    pub fn add_device_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.device_kernels.push(kernel.into());
        self
    }

    /// Set the section merge directives
    pub fn set_merge_directives(mut self, directives: Vec<MergeDirective>) -> Self {
        self.merge_directives = directives;
        self
    }

    /// Enable or disable alias analysis
    pub fn enable_alias_analysis(mut self, enable: bool) -> Self {
        self.enable_alias_analysis = enable;
        self
    }

    /// Set the section alignment
    pub fn set_section_alignment(mut self, alignment: usize) -> Self {
        self.section_alignment = alignment.max(1);
        self
    }

    /// Allocator configuration for a location, falling back to best fit
    pub fn allocator_config(&self, location: MemoryLocation) -> AllocatorConfig {
        self.allocators
            .get(&location)
            .copied()
            .unwrap_or_else(AllocatorConfig::best_fit)
    }
}
