use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{row_major_strides, DataType, Graph, Module, NodeId, OpCode, OutputId, Shape};
use crate::schedule::alias::{AliasAnalyzer, AliasStats};
use crate::schedule::buffer::{
    BufferId, LogicalBuffer, LogicalBufferStore, MemoryLocation, PhysicalBuffer,
};
use crate::schedule::fixer::{FixStats, LifetimeFixer};
use crate::schedule::lifetime::LifetimeRecorder;
use crate::schedule::physical::PhysicalBufferBuilder;
use crate::target::Target;

/// Final placement of one output connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferAllocation {
    /// Memory location holding the data
    pub memory_location: MemoryLocation,
    /// Byte offset inside the location
    pub start: usize,
    /// Size in bytes of the tensor itself
    pub size: usize,
    /// Element data type
    pub data_type: DataType,
    /// Logical shape
    pub shape: Shape,
    /// Element strides inside the storage
    pub strides: Vec<usize>,
    /// Shape of the storage the tensor is laid out in
    pub parent_shape: Shape,
}

/// Output connector to placement mapping produced by a schedule run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AllocationTable {
    entries: BTreeMap<OutputId, BufferAllocation>,
}

impl AllocationTable {
    pub fn get(&self, output: OutputId) -> Option<&BufferAllocation> {
        self.entries.get(&output)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutputId, &BufferAllocation)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pretty-printed JSON dump, ordered by output id
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Everything a schedule run produces for one function
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    /// Function name
    pub function: String,
    /// Nodes that need code, in execution order
    pub compute_sequence: Vec<NodeId>,
    /// Logical buffers, indexed by `BufferId`
    pub logical_buffers: Vec<LogicalBuffer>,
    /// Physical buffers, indexed by `PhysicalId`
    pub physical_buffers: Vec<PhysicalBuffer>,
    /// Output connector to logical buffer mapping
    pub output_buffers: BTreeMap<OutputId, BufferId>,
    /// Final placements
    pub allocations: AllocationTable,
    /// Peak usage per memory location
    pub max_usages: BTreeMap<MemoryLocation, usize>,
    /// Function inputs, in declaration order
    pub inputs: Vec<OutputId>,
    /// Function outputs, in declaration order
    pub outputs: Vec<OutputId>,
    /// Alias analyzer statistics
    pub alias_stats: AliasStats,
    /// Lifetime fixer statistics
    pub fix_stats: FixStats,
}

impl ScheduleResult {
    /// Logical buffer backing an output connector
    pub fn logical_buffer(&self, output: OutputId) -> Option<&LogicalBuffer> {
        let id = self.output_buffers.get(&output)?;
        self.logical_buffers.get(id.0)
    }

    /// Physical buffer backing an output connector
    pub fn physical_buffer(&self, output: OutputId) -> Option<&PhysicalBuffer> {
        let physical = self.logical_buffer(output)?.physical?;
        self.physical_buffers.get(physical.0)
    }

    /// Peak usage of a location, zero when nothing lives there
    pub fn max_usage(&self, location: MemoryLocation) -> usize {
        self.max_usages.get(&location).copied().unwrap_or(0)
    }
}

/// Runs the scheduling pipeline for one function at a time
///
/// Recorder, alias analyzer, fixer, physical builder and allocator dispatch run
/// strictly in sequence; each stage consumes the full output of the previous.
pub struct Scheduler<'a> {
    target: &'a dyn Target,
}

impl<'a> Scheduler<'a> {
    pub fn new(target: &'a dyn Target) -> Self {
        Self { target }
    }

    /// Schedule a function in its derived execution order
    pub fn schedule(&self, graph: &Graph) -> Result<ScheduleResult> {
        let order = graph.execution_order()?;
        self.schedule_with_order(graph, &order)
    }

    /// Schedule a function in a caller-supplied execution order
    pub fn schedule_with_order(&self, graph: &Graph, order: &[NodeId]) -> Result<ScheduleResult> {
        Self::check_order(graph, order)?;

        let mut store = LifetimeRecorder::new(self.target).record(graph, order)?;

        let alias_stats = if self.target.options().enable_alias_analysis {
            AliasAnalyzer::new(self.target.alias_rules()).run(graph, order, &mut store)?
        } else {
            AliasStats::new()
        };

        let fix_stats = LifetimeFixer::new().run(&mut store)?;
        let mut physical_buffers = PhysicalBufferBuilder::build(&mut store)?;
        let max_usages = self.dispatch(&mut physical_buffers)?;
        let allocations = Self::allocation_table(graph, &store, &physical_buffers)?;

        let compute_sequence = order
            .iter()
            .copied()
            .filter(|&id| {
                graph.node(id).map_or(false, |node| {
                    !matches!(
                        node.op,
                        OpCode::Input | OpCode::Output | OpCode::Constant { .. } | OpCode::Ignore
                    )
                })
            })
            .collect();

        let output_buffers = store.bindings().collect();

        info!(
            "Scheduled `{}`: {} logical / {} physical buffers, {} alias edges",
            graph.name,
            store.len(),
            physical_buffers.len(),
            alias_stats.total_aliases
        );

        Ok(ScheduleResult {
            function: graph.name.clone(),
            compute_sequence,
            logical_buffers: store.into_buffers(),
            physical_buffers,
            output_buffers,
            allocations,
            max_usages,
            inputs: graph.function_inputs(),
            outputs: graph.function_outputs(),
            alias_stats,
            fix_stats,
        })
    }

    /// The order must visit every node exactly once
    fn check_order(graph: &Graph, order: &[NodeId]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for &id in order {
            graph.node(id)?;
            if !seen.insert(id) {
                return Err(Error::InvalidGraph(format!(
                    "Node {} appears twice in the execution order",
                    id
                )));
            }
        }
        if seen.len() != graph.nodes().len() {
            return Err(Error::InvalidGraph(format!(
                "Execution order covers {} of {} nodes",
                seen.len(),
                graph.nodes().len()
            )));
        }
        Ok(())
    }

    /// Place physical buffers location by location, in (birth, id) order
    fn dispatch(&self, physical: &mut [PhysicalBuffer]) -> Result<BTreeMap<MemoryLocation, usize>> {
        let mut by_location: BTreeMap<MemoryLocation, Vec<usize>> = BTreeMap::new();
        for (index, buffer) in physical.iter().enumerate() {
            by_location.entry(buffer.location).or_default().push(index);
        }

        let mut max_usages = BTreeMap::new();
        for (location, mut indices) in by_location {
            indices.sort_by_key(|&index| (physical[index].lifetime.birth, physical[index].id));

            let mut allocator = self.target.create_allocator(location)?;
            for &index in &indices {
                allocator.mark(&physical[index])?;
            }
            allocator.finish()?;

            for &index in &indices {
                let buffer = &mut physical[index];
                let span = allocator.allocation_of(buffer.id).ok_or_else(|| {
                    Error::AllocatorError(format!("{} was not placed in {}", buffer.id, location))
                })?;
                trace!("{} -> {} [{}, {})", buffer.id, location, span.start, span.end());
                buffer.allocation = Some(span);
            }

            let usage = allocator.max_usage();
            debug!("{}: {} buffers, peak usage {} bytes", location, indices.len(), usage);
            max_usages.insert(location, usage);
        }
        Ok(max_usages)
    }

    /// Placement per output connector; geometry comes from the connector itself
    ///
    /// Forwarded outputs share their source's storage but keep their own type
    /// and shape. A dense buffer is described by its connector's shape; a view
    /// into strided storage keeps the storage shape.
    fn allocation_table(
        graph: &Graph,
        store: &LogicalBufferStore,
        physical: &[PhysicalBuffer],
    ) -> Result<AllocationTable> {
        let mut entries = BTreeMap::new();
        for (output, id) in store.bindings() {
            let connector = graph.output(output)?;
            let buffer = store.get(id)?;
            let group = buffer
                .physical
                .and_then(|physical_id| physical.get(physical_id.0))
                .ok_or_else(|| {
                    Error::AllocatorError(format!("{} has no physical buffer", buffer.name))
                })?;
            let span = group
                .allocation
                .ok_or_else(|| Error::AllocatorError(format!("{} was not placed", group.id)))?;

            let parent_shape = if buffer.is_contiguous() {
                connector.shape.clone()
            } else {
                buffer.parent_shape.clone()
            };

            entries.insert(
                output,
                BufferAllocation {
                    memory_location: group.location,
                    start: span.start + buffer.root_offset,
                    size: connector.size_in_bytes()?,
                    data_type: connector.data_type,
                    shape: connector.shape.clone(),
                    strides: row_major_strides(&parent_shape),
                    parent_shape,
                },
            );
        }
        Ok(AllocationTable { entries })
    }
}

/// Schedule every function of a module in parallel
///
/// Functions share no buffers; each run gets its own allocator instances. The
/// results follow the order of `module.functions`.
pub fn schedule_module(target: &dyn Target, module: &Module) -> Result<Vec<ScheduleResult>> {
    module
        .functions
        .par_iter()
        .map(|graph| Scheduler::new(target).schedule(graph))
        .collect()
}
