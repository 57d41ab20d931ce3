use log::{debug, info};

use crate::codegen::binary::ModuleInfo;
use crate::codegen::linker::{LinkedModule, Linker, MergeDirective};
use crate::codegen::section::{SectionSet, RDATA_SECTION, TEXT_SECTION};
use crate::error::{Error, Result};
use crate::model::{Graph, Module, Node, OpCode};
use crate::schedule::buffer::MemoryLocation;
use crate::schedule::scheduler::{schedule_module, AllocationTable, ScheduleResult};
use crate::target::Target;

/// Turns one scheduled node into code and data
///
/// Implementations append to `.text` (and any other section they need) and
/// emit symbol references instead of absolute addresses; the linker resolves
/// them.
pub trait NodeEmitter: Send + Sync {
    fn emit(
        &self,
        graph: &Graph,
        node: &Node,
        allocations: &AllocationTable,
        sections: &mut SectionSet,
    ) -> Result<()>;
}

/// Scheduled and linked module
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub linked: LinkedModule,
    /// Schedules, in function order
    pub schedules: Vec<ScheduleResult>,
}

/// Drives schedule, emission and linking for a whole module
pub struct ModuleBuilder<'a> {
    target: &'a dyn Target,
}

impl<'a> ModuleBuilder<'a> {
    pub fn new(target: &'a dyn Target) -> Self {
        Self { target }
    }

    /// Name of the per-function constant section
    pub fn rdata_section_name(function_index: usize) -> String {
        format!("{}{}", RDATA_SECTION, function_index)
    }

    /// Name of the symbol marking a function's constants
    pub fn rdata_symbol(function: &str) -> String {
        format!("{}.rdata", function)
    }

    /// Build a single-function module
    pub fn build(&self, graph: &Graph, emitter: &dyn NodeEmitter) -> Result<CompiledModule> {
        let mut module = Module::new(graph.name.clone());
        module.add_function(graph.clone());
        self.build_module(&module, emitter)
    }

    /// Schedule every function, emit its nodes and link the result
    pub fn build_module(
        &self,
        module: &Module,
        emitter: &dyn NodeEmitter,
    ) -> Result<CompiledModule> {
        let schedules = schedule_module(self.target, module)?;

        let mut sections = SectionSet::new();
        sections.section(TEXT_SECTION);
        sections.section(RDATA_SECTION);

        let mut directives = Vec::with_capacity(module.functions.len());
        for (index, (graph, schedule)) in module.functions.iter().zip(&schedules).enumerate() {
            let aux = self.emit_function(index, graph, schedule, emitter, &mut sections)?;
            directives.push(MergeDirective::into_rdata(aux));
        }
        directives.extend(self.target.options().merge_directives.iter().cloned());

        let info = ModuleInfo::from_schedules(&schedules)?;
        let linked = Linker::new(sections, self.target.options().section_alignment)
            .with_merge_directives(directives)
            .link(&info)?;

        info!(
            "Built module `{}` for {}: {} functions, {} bytes",
            module.name,
            self.target.name(),
            schedules.len(),
            linked.bytes.len()
        );
        Ok(CompiledModule { linked, schedules })
    }

    /// Emit one function; returns the name of its constant section
    fn emit_function(
        &self,
        index: usize,
        graph: &Graph,
        schedule: &ScheduleResult,
        emitter: &dyn NodeEmitter,
        sections: &mut SectionSet,
    ) -> Result<String> {
        let aux_name = Self::rdata_section_name(index);
        let aux = sections.section(&aux_name);
        aux.define_symbol_at(Self::rdata_symbol(&graph.name), 0)?;
        aux.reserve(schedule.max_usage(MemoryLocation::Rdata));

        for node in graph.nodes() {
            let OpCode::Constant { data, .. } = &node.op else {
                continue;
            };
            for &output in &node.outputs {
                let allocation = schedule.allocations.get(output).ok_or_else(|| {
                    Error::InvalidGraph(format!("Constant `{}` has no storage", node.name))
                })?;
                if allocation.memory_location != MemoryLocation::Rdata {
                    return Err(Error::InvalidGraph(format!(
                        "Constant `{}` was placed in {} instead of {}",
                        node.name,
                        allocation.memory_location,
                        MemoryLocation::Rdata
                    )));
                }
                if data.len() != allocation.size {
                    return Err(Error::InvalidGraph(format!(
                        "Constant `{}` holds {} bytes but its tensor needs {}",
                        node.name,
                        data.len(),
                        allocation.size
                    )));
                }
                aux.write_at(allocation.start, data);
            }
        }

        let text = sections.section(TEXT_SECTION);
        text.align(4);
        text.define_symbol(graph.name.clone())?;
        text.write_reference(Self::rdata_symbol(&graph.name), 32)?;
        let count = u32::try_from(schedule.compute_sequence.len())
            .map_err(|_| {
                Error::UnsupportedFeature(format!("Function `{}` has too many nodes", graph.name))
            })?;
        text.write_u32(count);

        for &node_id in &schedule.compute_sequence {
            let node = graph.node(node_id)?;
            emitter.emit(graph, node, &schedule.allocations, sections)?;
        }

        debug!(
            "Emitted `{}`: {} nodes, {} constant bytes",
            graph.name,
            schedule.compute_sequence.len(),
            schedule.max_usage(MemoryLocation::Rdata)
        );
        Ok(aux_name)
    }
}
