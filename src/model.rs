use std::collections::HashMap;
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};

/// Unique identifier for a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Handle of an output connector (one tensor produced by a node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId(pub usize);

/// Handle of an input connector (one operand slot of a node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Element data types
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Bool,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 | DataType::Bool => 1,
            DataType::Float16 | DataType::BFloat16 | DataType::Int16 | DataType::Uint16 => 2,
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int64 | DataType::Uint64 => 8,
        }
    }

    /// Natural alignment of the element type
    pub fn natural_alignment(&self) -> usize {
        self.size_in_bytes()
    }

    /// Code used in the binary IO descriptors
    pub fn code(&self) -> u8 {
        match self {
            DataType::Bool => 0,
            DataType::Uint8 => 1,
            DataType::Int8 => 2,
            DataType::Uint16 => 3,
            DataType::Int16 => 4,
            DataType::Uint32 => 5,
            DataType::Int32 => 6,
            DataType::Uint64 => 7,
            DataType::Int64 => 8,
            DataType::Float16 => 9,
            DataType::BFloat16 => 10,
            DataType::Float32 => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let data_type = match code {
            0 => DataType::Bool,
            1 => DataType::Uint8,
            2 => DataType::Int8,
            3 => DataType::Uint16,
            4 => DataType::Int16,
            5 => DataType::Uint32,
            6 => DataType::Int32,
            7 => DataType::Uint64,
            8 => DataType::Int64,
            9 => DataType::Float16,
            10 => DataType::BFloat16,
            11 => DataType::Float32,
            _ => return None,
        };
        Some(data_type)
    }
}

/// Number of elements in a shape (a scalar has one element)
pub fn shape_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major element strides of a shape
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Operator kinds the scheduler distinguishes
#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    /// Function input placeholder
    Input,
    /// Function output sink
    Output,
    /// Constant tensor data with an optional required alignment
    Constant { data: Vec<u8>, alignment: Option<usize> },
    /// Layout-only shape change
    Reshape,
    /// Reinterpretation of the same bytes as another type
    Bitcast,
    /// Concatenation along an axis
    Concat { axis: usize },
    /// Unit-stride slice
    Slice { begins: Vec<usize>, ends: Vec<usize> },
    /// Node eliminated by earlier passes
    Ignore,
    /// Any other kernel, identified by name
    Compute(String),
}

impl OpCode {
    /// Human readable operator name
    pub fn name(&self) -> &str {
        match self {
            OpCode::Input => "input",
            OpCode::Output => "output",
            OpCode::Constant { .. } => "constant",
            OpCode::Reshape => "reshape",
            OpCode::Bitcast => "bitcast",
            OpCode::Concat { .. } => "concat",
            OpCode::Slice { .. } => "slice",
            OpCode::Ignore => "ignore",
            OpCode::Compute(kind) => kind.as_str(),
        }
    }
}

/// Per-node attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeAttributes(u8);

impl NodeAttributes {
    const SKIP_ALLOCATION: u8 = 1;

    pub fn empty() -> Self {
        NodeAttributes(0)
    }

    /// Outputs do not need storage of their own
    pub fn skip_allocation() -> Self {
        NodeAttributes(Self::SKIP_ALLOCATION)
    }

    pub fn contains_skip_allocation(self) -> bool {
        (self.0 & Self::SKIP_ALLOCATION) != 0
    }

    pub fn merge(mut self, other: NodeAttributes) -> Self {
        self.0 |= other.0;
        self
    }
}

/// Node in the computation graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpCode,
    pub inputs: Vec<InputId>,
    pub outputs: Vec<OutputId>,
    pub attributes: NodeAttributes,
}

/// A tensor produced by a node
#[derive(Debug, Clone)]
pub struct OutputConnector {
    pub id: OutputId,
    pub node: NodeId,
    /// Position among the producer's outputs
    pub index: usize,
    pub data_type: DataType,
    pub shape: Shape,
}

impl OutputConnector {
    /// Size of the tensor in bytes
    pub fn size_in_bytes(&self) -> Result<usize> {
        let elements = shape_elements(&self.shape);
        elements
            .checked_mul(self.data_type.size_in_bytes())
            .ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "Integer overflow calculating size for output {} with {} elements",
                    self.id, elements
                ))
            })
    }
}

/// An operand slot of a node
#[derive(Debug, Clone)]
pub struct InputConnector {
    pub id: InputId,
    pub node: NodeId,
    /// Position among the consumer's inputs
    pub index: usize,
    /// Producer this slot reads from; `None` is a dangling edge
    pub connection: Option<OutputId>,
}

/// Arena-backed data-flow graph of one function
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Node>,
    outputs: Vec<OutputConnector>,
    inputs: Vec<InputConnector>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a node reading `inputs` and producing one tensor per `outputs` entry
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpCode,
        inputs: &[OutputId],
        outputs: &[(DataType, Shape)],
    ) -> NodeId {
        let id = NodeId(self.nodes.len());

        let input_ids = inputs
            .iter()
            .enumerate()
            .map(|(index, &source)| {
                let input_id = InputId(self.inputs.len());
                self.inputs.push(InputConnector {
                    id: input_id,
                    node: id,
                    index,
                    connection: Some(source),
                });
                input_id
            })
            .collect();

        let output_ids = outputs
            .iter()
            .enumerate()
            .map(|(index, (data_type, shape))| {
                let output_id = OutputId(self.outputs.len());
                self.outputs.push(OutputConnector {
                    id: output_id,
                    node: id,
                    index,
                    data_type: *data_type,
                    shape: shape.clone(),
                });
                output_id
            })
            .collect();

        self.nodes.push(Node {
            id,
            name: name.into(),
            op,
            inputs: input_ids,
            outputs: output_ids,
            attributes: NodeAttributes::empty(),
        });
        id
    }

    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        shape: Shape,
    ) -> OutputId {
        let node = self.add_node(name, OpCode::Input, &[], &[(data_type, shape)]);
        self.nodes[node.0].outputs[0]
    }

    pub fn add_output(&mut self, name: impl Into<String>, source: OutputId) -> NodeId {
        self.add_node(name, OpCode::Output, &[source], &[])
    }

    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        shape: Shape,
        data: Vec<u8>,
        alignment: Option<usize>,
    ) -> OutputId {
        let node = self.add_node(
            name,
            OpCode::Constant { data, alignment },
            &[],
            &[(data_type, shape)],
        );
        self.nodes[node.0].outputs[0]
    }

    pub fn add_compute(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        inputs: &[OutputId],
        data_type: DataType,
        shape: Shape,
    ) -> OutputId {
        let node = self.add_node(name, OpCode::Compute(kind.into()), inputs, &[(data_type, shape)]);
        self.nodes[node.0].outputs[0]
    }

    pub fn add_reshape(
        &mut self,
        name: impl Into<String>,
        source: OutputId,
        shape: Shape,
    ) -> Result<OutputId> {
        let connector = self.output(source)?;
        if shape_elements(&connector.shape) != shape_elements(&shape) {
            return Err(Error::InvalidGraph(format!(
                "Cannot reshape {:?} into {:?}: element counts differ",
                connector.shape, shape
            )));
        }
        let data_type = connector.data_type;
        let node = self.add_node(name, OpCode::Reshape, &[source], &[(data_type, shape)]);
        Ok(self.nodes[node.0].outputs[0])
    }

    pub fn add_bitcast(
        &mut self,
        name: impl Into<String>,
        source: OutputId,
        data_type: DataType,
        shape: Shape,
    ) -> Result<OutputId> {
        let connector = self.output(source)?;
        let new_size = shape_elements(&shape) * data_type.size_in_bytes();
        if connector.size_in_bytes()? != new_size {
            return Err(Error::InvalidGraph(format!(
                "Cannot bitcast {} bytes into {} bytes",
                connector.size_in_bytes()?,
                new_size
            )));
        }
        let node = self.add_node(name, OpCode::Bitcast, &[source], &[(data_type, shape)]);
        Ok(self.nodes[node.0].outputs[0])
    }

    pub fn add_concat(
        &mut self,
        name: impl Into<String>,
        sources: &[OutputId],
        axis: usize,
    ) -> Result<OutputId> {
        let first = sources
            .first()
            .ok_or_else(|| Error::InvalidGraph("Concat requires at least one input".to_string()))?;
        let first = self.output(*first)?;
        let data_type = first.data_type;
        let mut shape = first.shape.clone();
        if axis >= shape.len() {
            return Err(Error::InvalidGraph(format!(
                "Concat axis {} out of range for rank {}",
                axis,
                shape.len()
            )));
        }
        shape[axis] = 0;

        for &source in sources {
            let connector = self.output(source)?;
            let compatible = connector.data_type == data_type
                && connector.shape.len() == shape.len()
                && connector
                    .shape
                    .iter()
                    .enumerate()
                    .all(|(dim, &extent)| dim == axis || extent == shape[dim]);
            if !compatible {
                return Err(Error::InvalidGraph(format!(
                    "Concat input {} with shape {:?} is incompatible along axis {}",
                    source, connector.shape, axis
                )));
            }
            shape[axis] += connector.shape[axis];
        }

        let node = self.add_node(name, OpCode::Concat { axis }, sources, &[(data_type, shape)]);
        Ok(self.nodes[node.0].outputs[0])
    }

    pub fn add_slice(
        &mut self,
        name: impl Into<String>,
        source: OutputId,
        begins: Vec<usize>,
        ends: Vec<usize>,
    ) -> Result<OutputId> {
        let connector = self.output(source)?;
        let rank = connector.shape.len();
        if begins.len() != rank || ends.len() != rank {
            return Err(Error::InvalidGraph(format!(
                "Slice bounds must have rank {}, got {} and {}",
                rank,
                begins.len(),
                ends.len()
            )));
        }
        let mut shape = Vec::with_capacity(rank);
        for axis in 0..rank {
            if begins[axis] > ends[axis] || ends[axis] > connector.shape[axis] {
                return Err(Error::InvalidGraph(format!(
                    "Slice range {}..{} invalid for extent {} on axis {}",
                    begins[axis], ends[axis], connector.shape[axis], axis
                )));
            }
            shape.push(ends[axis] - begins[axis]);
        }
        let data_type = connector.data_type;
        let op = OpCode::Slice { begins, ends };
        let node = self.add_node(name, op, &[source], &[(data_type, shape)]);
        Ok(self.nodes[node.0].outputs[0])
    }

    /// Mark a node as not needing storage of its own
    pub fn set_attributes(&mut self, node: NodeId, attributes: NodeAttributes) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {} not found", node)))?;
        node.attributes = node.attributes.merge(attributes);
        Ok(())
    }

    /// Cut the edge feeding an input slot
    pub fn disconnect(&mut self, input: InputId) -> Result<()> {
        let connector = self
            .inputs
            .get_mut(input.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Input connector {} not found", input)))?;
        connector.connection = None;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {} not found", id)))
    }

    pub fn output(&self, id: OutputId) -> Result<&OutputConnector> {
        self.outputs
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Output connector {} not found", id)))
    }

    pub fn input(&self, id: InputId) -> Result<&InputConnector> {
        self.inputs
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Input connector {} not found", id)))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[OutputConnector] {
        &self.outputs
    }

    /// Node producing the given output
    pub fn producer(&self, output: OutputId) -> Result<&Node> {
        let connector = self.output(output)?;
        self.node(connector.node)
    }

    /// Input slots reading the given output, in connector order
    pub fn consumers(&self, output: OutputId) -> Vec<&InputConnector> {
        self.inputs
            .iter()
            .filter(|input| input.connection == Some(output))
            .collect()
    }

    /// Outputs of the function's input nodes, in declaration order
    pub fn function_inputs(&self) -> Vec<OutputId> {
        self.nodes
            .iter()
            .filter(|node| node.op == OpCode::Input)
            .flat_map(|node| node.outputs.iter().copied())
            .collect()
    }

    /// Tensors feeding the function's output nodes, in declaration order
    pub fn function_outputs(&self) -> Vec<OutputId> {
        self.nodes
            .iter()
            .filter(|node| node.op == OpCode::Output)
            .flat_map(|node| node.inputs.iter())
            .filter_map(|&input| self.inputs.get(input.0).and_then(|c| c.connection))
            .collect()
    }

    /// Derive a data-dependency respecting visiting order
    pub fn execution_order(&self) -> Result<Vec<NodeId>> {
        let mut dag: DiGraph<NodeId, ()> =
            DiGraph::with_capacity(self.nodes.len(), self.inputs.len());
        let indices: HashMap<NodeId, NodeIndex> = self
            .nodes
            .iter()
            .map(|node| (node.id, dag.add_node(node.id)))
            .collect();

        for input in &self.inputs {
            // Dangling edges are reported by the lifetime recorder, not here
            let Some(source) = input.connection else {
                continue;
            };
            let producer = self.output(source)?.node;
            dag.add_edge(indices[&producer], indices[&input.node], ());
        }

        let sorted = toposort(&dag, None).map_err(|cycle| {
            Error::InvalidGraph(format!(
                "Cycle detected in graph at node {}",
                dag[cycle.node_id()]
            ))
        })?;

        Ok(sorted.into_iter().map(|index| dag[index]).collect())
    }
}

/// A compiled unit grouping independent functions
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Graph>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, graph: Graph) {
        self.functions.push(graph);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
    }

    #[test]
    fn test_concat_shape_inference() {
        let mut graph = Graph::new("concat");
        let a = graph.add_input("a", DataType::Float32, vec![1, 2, 4]);
        let b = graph.add_input("b", DataType::Float32, vec![1, 3, 4]);
        let c = graph.add_concat("c", &[a, b], 1).unwrap();
        assert_eq!(graph.output(c).unwrap().shape, vec![1, 5, 4]);

        let bad = graph.add_input("bad", DataType::Float32, vec![1, 3, 5]);
        assert!(graph.add_concat("d", &[a, bad], 1).is_err());
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let mut graph = Graph::new("chain");
        let x = graph.add_input("x", DataType::Float32, vec![4]);
        let y = graph.add_compute("relu", "relu", &[x], DataType::Float32, vec![4]);
        let z = graph.add_compute("neg", "neg", &[y], DataType::Float32, vec![4]);
        graph.add_output("out", z);

        let order = graph.execution_order().unwrap();
        let position = |output: OutputId| {
            let node = graph.output(output).unwrap().node;
            order.iter().position(|&id| id == node).unwrap()
        };
        assert!(position(x) < position(y));
        assert!(position(y) < position(z));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_data_type_codes_are_stable() {
        use strum::IntoEnumIterator;
        for data_type in DataType::iter() {
            assert_eq!(DataType::from_code(data_type.code()), Some(data_type));
        }
        assert_eq!(DataType::Float32.to_string(), "float32");
    }
}
