use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::Result;
use crate::model::{row_major_strides, shape_elements, Graph, Node, NodeId, OpCode, OutputId};
use crate::schedule::buffer::{BufferAlias, BufferId, LogicalBufferStore, MemoryLocation};

/// Result of running one alias rule over a graph
#[derive(Debug, Clone)]
pub struct RuleResult {
    /// Name of the rule
    pub name: String,
    /// Number of alias edges added
    pub aliases_added: usize,
    /// Duration of the rule
    pub duration: Duration,
}

/// Statistics from running the alias analyzer
#[derive(Debug, Clone, Default)]
pub struct AliasStats {
    /// Results from each rule
    pub rule_results: Vec<RuleResult>,
    /// Total number of alias edges added
    pub total_aliases: usize,
    /// Total time spent in the analyzer
    pub total_duration: Duration,
}

impl AliasStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule result
    pub fn add_rule_result(&mut self, result: RuleResult) {
        self.total_aliases += result.aliases_added;
        self.total_duration += result.duration;
        self.rule_results.push(result);
    }
}

/// Zero-copy rule that may turn a node's output or operands into views
///
/// Rules only add alias edges; they never remove a buffer or an existing edge.
pub trait AliasRule: Send + Sync {
    /// Name of the rule
    fn name(&self) -> &str;

    /// Inspect one node and return the number of alias edges added
    fn apply(&self, graph: &Graph, node: &Node, store: &mut LogicalBufferStore) -> Result<usize>;
}

/// Runs alias rules over a recorded graph
pub struct AliasAnalyzer {
    rules: Vec<Box<dyn AliasRule>>,
}

impl AliasAnalyzer {
    pub fn new(rules: Vec<Box<dyn AliasRule>>) -> Self {
        Self { rules }
    }

    /// Analyzer with the built-in rules
    pub fn with_default_rules() -> Self {
        Self::new(default_alias_rules())
    }

    /// Register an additional rule, evaluated after the existing ones
    pub fn register_rule(&mut self, rule: Box<dyn AliasRule>) {
        self.rules.push(rule);
    }

    /// Apply every rule, in order, to every node in `order`
    pub fn run(
        &self,
        graph: &Graph,
        order: &[NodeId],
        store: &mut LogicalBufferStore,
    ) -> Result<AliasStats> {
        let mut stats = AliasStats::new();

        for rule in &self.rules {
            let started = Instant::now();
            let mut aliases_added = 0;
            for &node_id in order {
                let node = graph.node(node_id)?;
                aliases_added += rule.apply(graph, node, store)?;
            }
            stats.add_rule_result(RuleResult {
                name: rule.name().to_string(),
                aliases_added,
                duration: started.elapsed(),
            });
        }

        debug!(
            "Alias analysis of `{}` added {} edges",
            graph.name, stats.total_aliases
        );
        Ok(stats)
    }
}

/// Built-in rules in evaluation order
///
/// Layout changes run first so that concat can place their roots, and slices
/// run last since they need their operand's final layout.
pub fn default_alias_rules() -> Vec<Box<dyn AliasRule>> {
    vec![
        Box::new(ReshapeAliasRule),
        Box::new(ConcatAliasRule),
        Box::new(SliceAliasRule),
    ]
}

fn single_input(graph: &Graph, node: &Node) -> Result<Option<OutputId>> {
    match node.inputs.as_slice() {
        [input] => Ok(graph.input(*input)?.connection),
        _ => Ok(None),
    }
}

/// Buffer pair (child, parent) for a one-input one-output view node
fn view_pair(
    graph: &Graph,
    node: &Node,
    store: &LogicalBufferStore,
) -> Result<Option<(BufferId, BufferId)>> {
    let Some(source) = single_input(graph, node)? else {
        return Ok(None);
    };
    let [output] = node.outputs.as_slice() else {
        return Ok(None);
    };
    let (Some(child), Some(parent)) = (store.buffer_of(*output), store.buffer_of(source)) else {
        return Ok(None);
    };
    if child == parent {
        return Ok(None);
    }
    let child_buffer = store.get(child)?;
    if child_buffer.alias.is_some() || store.has_children(child) {
        return Ok(None);
    }
    Ok(Some((child, parent)))
}

fn link(
    store: &mut LogicalBufferStore,
    child: BufferId,
    parent: BufferId,
    offset_bytes: usize,
) -> Result<()> {
    let parent_location = store.get(parent)?.location;
    let buffer = store.get_mut(child)?;
    if buffer.location != parent_location {
        debug!(
            "{} moves from {} to {} as a view of {}",
            buffer.name, buffer.location, parent_location, parent
        );
    }
    buffer.alias = Some(BufferAlias { parent, offset_bytes });
    trace!("alias {} -> {} at offset {}", child, parent, offset_bytes);
    Ok(())
}

/// Reshape and bitcast outputs view their operand at offset 0
pub struct ReshapeAliasRule;

impl AliasRule for ReshapeAliasRule {
    fn name(&self) -> &str {
        "reshape"
    }

    fn apply(&self, graph: &Graph, node: &Node, store: &mut LogicalBufferStore) -> Result<usize> {
        if !matches!(node.op, OpCode::Reshape | OpCode::Bitcast) {
            return Ok(0);
        }
        let Some((child, parent)) = view_pair(graph, node, store)? else {
            return Ok(0);
        };
        let parent_buffer = store.get(parent)?;
        if !parent_buffer.is_contiguous() {
            return Ok(0);
        }
        if parent_buffer.size_bytes != store.get(child)?.size_bytes {
            return Ok(0);
        }

        link(store, child, parent, 0)?;
        Ok(1)
    }
}

/// Unit-stride slices that select one contiguous run of their operand
pub struct SliceAliasRule;

impl SliceAliasRule {
    /// Byte offset of the selected region, or `None` when it is not contiguous
    fn contiguous_offset(
        input_shape: &[usize],
        begins: &[usize],
        ends: &[usize],
        element_size: usize,
    ) -> Option<usize> {
        let rank = input_shape.len();
        // Reversed or out-of-range bounds never form a view
        if (0..rank).any(|axis| begins[axis] > ends[axis] || ends[axis] > input_shape[axis]) {
            return None;
        }
        let partial = (0..rank)
            .rev()
            .find(|&axis| begins[axis] != 0 || ends[axis] != input_shape[axis]);

        // Everything outside the innermost partial axis must select a single index
        if let Some(axis) = partial {
            if !(0..axis).all(|dim| ends[dim] - begins[dim] == 1) {
                return None;
            }
        }

        let strides = row_major_strides(input_shape);
        let offset = begins
            .iter()
            .zip(&strides)
            .map(|(&begin, &stride)| begin * stride)
            .sum::<usize>();
        Some(offset * element_size)
    }
}

impl AliasRule for SliceAliasRule {
    fn name(&self) -> &str {
        "slice"
    }

    fn apply(&self, graph: &Graph, node: &Node, store: &mut LogicalBufferStore) -> Result<usize> {
        let OpCode::Slice { begins, ends } = &node.op else {
            return Ok(0);
        };
        let Some((child, parent)) = view_pair(graph, node, store)? else {
            return Ok(0);
        };
        let parent_buffer = store.get(parent)?;
        let rank = parent_buffer.shape.len();
        if !parent_buffer.is_contiguous() || begins.len() != rank || ends.len() != rank {
            return Ok(0);
        }
        let element_size = parent_buffer.data_type.size_in_bytes();
        let offset = Self::contiguous_offset(&parent_buffer.shape, begins, ends, element_size);
        let Some(offset) = offset else {
            return Ok(0);
        };

        link(store, child, parent, offset)?;
        Ok(1)
    }
}

/// Concat inputs are written straight into their slot of the output
///
/// When every dimension before the concat axis is 1 each slot is one
/// contiguous run, and whole alias groups can be placed by their roots.
/// Otherwise the slots are strided and only plain, childless buffers qualify;
/// they take the output's shape as their storage shape.
pub struct ConcatAliasRule;

impl ConcatAliasRule {
    fn location_compatible(input: MemoryLocation, output: MemoryLocation) -> bool {
        if matches!(output, MemoryLocation::Input | MemoryLocation::Rdata) {
            return false;
        }
        input == output
            || (input == MemoryLocation::Data
                && matches!(
                    output,
                    MemoryLocation::Data | MemoryLocation::Output | MemoryLocation::SharedData
                ))
    }

    fn contiguous(
        &self,
        node: &Node,
        sources: &[OutputId],
        output: BufferId,
        store: &mut LogicalBufferStore,
    ) -> Result<usize> {
        let (output_root, _) = store.resolve(output)?;
        let output_location = store.get(output_root)?.location;

        let mut seen = BTreeSet::new();
        seen.insert(output_root);
        let mut placements = Vec::with_capacity(sources.len());
        let mut offset = 0;

        for &source in sources {
            let Some(buffer) = store.buffer_of(source) else {
                return Ok(0);
            };
            let size = store.get(buffer)?.size_bytes;
            let (root, root_offset) = store.resolve(buffer)?;
            let root_buffer = store.get(root)?;

            if root_offset != 0 || root_buffer.size_bytes != size || !root_buffer.is_contiguous() {
                return Ok(0);
            }
            if !seen.insert(root) {
                return Ok(0);
            }
            if !Self::location_compatible(root_buffer.location, output_location) {
                warn!(
                    "Concat `{}`: operand {} in {} cannot be placed in {}",
                    node.name, root_buffer.name, root_buffer.location, output_location
                );
                return Ok(0);
            }

            placements.push((root, offset));
            offset += size;
        }

        for &(root, offset) in &placements {
            link(store, root, output, offset)?;
        }
        Ok(placements.len())
    }

    fn strided(
        &self,
        node: &Node,
        axis: usize,
        sources: &[OutputId],
        output: BufferId,
        store: &mut LogicalBufferStore,
    ) -> Result<usize> {
        let output_buffer = store.get(output)?;
        if !output_buffer.is_root() || !output_buffer.is_contiguous() {
            return Ok(0);
        }
        let output_location = output_buffer.location;
        let parent_shape = output_buffer.parent_shape.clone();
        let element_size = output_buffer.data_type.size_in_bytes();
        let stride_bytes = row_major_strides(&parent_shape)[axis] * element_size;

        let mut seen = BTreeSet::new();
        let mut placements = Vec::with_capacity(sources.len());
        let mut axis_index = 0;

        for &source in sources {
            let Some(buffer) = store.buffer_of(source) else {
                return Ok(0);
            };
            let input = store.get(buffer)?;
            if buffer == output
                || !input.is_root()
                || !input.is_contiguous()
                || store.has_children(buffer)
            {
                return Ok(0);
            }
            if !seen.insert(buffer) {
                return Ok(0);
            }
            if !Self::location_compatible(input.location, output_location) {
                warn!(
                    "Concat `{}`: operand {} in {} cannot be placed in {}",
                    node.name, input.name, input.location, output_location
                );
                return Ok(0);
            }

            let Some(&extent) = input.shape.get(axis) else {
                return Ok(0);
            };
            placements.push((buffer, axis_index * stride_bytes));
            axis_index += extent;
        }

        for &(buffer, offset) in &placements {
            link(store, buffer, output, offset)?;
            store.get_mut(buffer)?.parent_shape = parent_shape.clone();
        }
        Ok(placements.len())
    }
}

impl AliasRule for ConcatAliasRule {
    fn name(&self) -> &str {
        "concat"
    }

    fn apply(&self, graph: &Graph, node: &Node, store: &mut LogicalBufferStore) -> Result<usize> {
        let OpCode::Concat { axis } = node.op else {
            return Ok(0);
        };
        let [output] = node.outputs.as_slice() else {
            return Ok(0);
        };
        let Some(output_buffer) = store.buffer_of(*output) else {
            return Ok(0);
        };

        let mut sources = Vec::with_capacity(node.inputs.len());
        for &input in &node.inputs {
            match graph.input(input)?.connection {
                Some(source) => sources.push(source),
                None => return Ok(0),
            }
        }

        let shape = &store.get(output_buffer)?.shape;
        if axis >= shape.len() {
            return Ok(0);
        }
        if shape_elements(&shape[..axis]) == 1 {
            self.contiguous(node, &sources, output_buffer, store)
        } else {
            self.strided(node, axis, &sources, output_buffer, store)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_offset_for_contiguous_rows() {
        // Rows 1..3 of a 4x8 float tensor start at row 1
        let offset = SliceAliasRule::contiguous_offset(&[4, 8], &[1, 0], &[3, 8], 4);
        assert_eq!(offset, Some(32));
    }

    #[test]
    fn test_slice_offset_rejects_strided_selection() {
        // Columns 2..4 of every row are not one run
        assert_eq!(SliceAliasRule::contiguous_offset(&[4, 8], &[0, 2], &[4, 4], 4), None);
        // A unit outer selection followed by a partial inner one is fine
        assert_eq!(SliceAliasRule::contiguous_offset(&[4, 8], &[2, 2], &[3, 4], 4), Some(72));
    }

    #[test]
    fn test_slice_offset_rejects_invalid_bounds() {
        assert_eq!(SliceAliasRule::contiguous_offset(&[4, 8], &[2, 1], &[1, 3], 4), None);
        assert_eq!(SliceAliasRule::contiguous_offset(&[4, 8], &[0, 0], &[5, 8], 4), None);
    }

    #[test]
    fn test_concat_location_rules() {
        assert!(ConcatAliasRule::location_compatible(MemoryLocation::Data, MemoryLocation::Output));
        assert!(!ConcatAliasRule::location_compatible(MemoryLocation::Input, MemoryLocation::Data));
        assert!(!ConcatAliasRule::location_compatible(MemoryLocation::Data, MemoryLocation::Rdata));
        assert!(ConcatAliasRule::location_compatible(
            MemoryLocation::Device,
            MemoryLocation::Device
        ));
    }
}
