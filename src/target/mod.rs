//! Target description consumed by the scheduler and linker.
//!
//! A target decides where every tensor lives, which operators need storage of
//! their own, which alias rules apply and which allocator serves each memory
//! location. Everything is injected per schedule run; nothing is global.

pub mod options;

use crate::error::Result;
use crate::memory::allocator::{create_allocator, BufferAllocator};
use crate::model::{Graph, Node, OpCode, OutputId};
use crate::schedule::alias::{default_alias_rules, AliasRule};
use crate::schedule::buffer::MemoryLocation;

pub use options::{AllocatorConfig, AllocatorKind, TargetOptions};

/// Target hooks used while scheduling and linking
pub trait Target: Send + Sync {
    /// Name of the target
    fn name(&self) -> &str;

    /// Scheduling and linking options
    fn options(&self) -> &TargetOptions;

    /// Whether the node's outputs need storage of their own
    fn needs_allocation(&self, node: &Node) -> bool {
        !node.attributes.contains_skip_allocation() && !matches!(node.op, OpCode::Ignore)
    }

    /// Memory location class of an output
    fn memory_location(&self, graph: &Graph, output: OutputId) -> Result<MemoryLocation> {
        let producer = graph.producer(output)?;
        let location = match &producer.op {
            OpCode::Input => MemoryLocation::Input,
            OpCode::Constant { .. } => MemoryLocation::Rdata,
            op => {
                let feeds_output = graph.consumers(output).iter().any(|input| {
                    graph
                        .node(input.node)
                        .map(|node| node.op == OpCode::Output)
                        .unwrap_or(false)
                });
                if feeds_output {
                    MemoryLocation::Output
                } else if let OpCode::Compute(kind) = op {
                    if self.options().device_kernels.iter().any(|k| k == kind) {
                        MemoryLocation::Device
                    } else {
                        MemoryLocation::Data
                    }
                } else {
                    MemoryLocation::Data
                }
            }
        };
        Ok(location)
    }

    /// Required alignment of an output's storage
    fn alignment_of(&self, graph: &Graph, output: OutputId) -> Result<usize> {
        let connector = graph.output(output)?;
        let natural = connector.data_type.natural_alignment();
        let declared = match &graph.node(connector.node)?.op {
            OpCode::Constant { alignment: Some(alignment), .. } => *alignment,
            _ => 1,
        };
        Ok(natural.max(declared).max(self.options().min_alignment))
    }

    /// Alias rules, in evaluation order
    fn alias_rules(&self) -> Vec<Box<dyn AliasRule>> {
        default_alias_rules()
    }

    /// Fresh allocator instance for one location of one schedule run
    fn create_allocator(&self, location: MemoryLocation) -> Result<Box<dyn BufferAllocator>> {
        create_allocator(location, &self.options().allocator_config(location))
    }
}

/// Target driven entirely by `TargetOptions`
#[derive(Debug, Clone)]
pub struct GenericTarget {
    name: String,
    options: TargetOptions,
}

impl GenericTarget {
    pub fn new(name: impl Into<String>, options: TargetOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

impl Default for GenericTarget {
    fn default() -> Self {
        Self::new("generic", TargetOptions::default())
    }
}

impl Target for GenericTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &TargetOptions {
        &self.options
    }
}
