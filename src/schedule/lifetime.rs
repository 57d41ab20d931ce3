use std::collections::BTreeSet;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::model::{Graph, Node, NodeId, OutputId};
use crate::schedule::buffer::{BufferId, Lifetime, LogicalBuffer, LogicalBufferStore};
use crate::target::Target;

/// Walks a graph in execution order and records the live range of every output
///
/// Each visited node first allocates its outputs at the current step, then the
/// step counter advances, then every input releases the buffer it reads. A
/// release always overwrites the recorded age, so the last consumer in visiting
/// order decides where a buffer dies.
pub struct LifetimeRecorder<'a> {
    target: &'a dyn Target,
    store: LogicalBufferStore,
    /// Outputs of pass-through nodes that deliberately have no buffer
    unbuffered: BTreeSet<OutputId>,
    /// Current step
    age: usize,
}

impl<'a> LifetimeRecorder<'a> {
    /// Create a new recorder for a target
    pub fn new(target: &'a dyn Target) -> Self {
        Self {
            target,
            store: LogicalBufferStore::new(),
            unbuffered: BTreeSet::new(),
            age: 0,
        }
    }

    /// Record lifetimes over `order` and hand back the populated store
    pub fn record(mut self, graph: &Graph, order: &[NodeId]) -> Result<LogicalBufferStore> {
        for &node_id in order {
            let node = graph.node(node_id)?;
            self.visit(graph, node)?;
        }

        debug!(
            "Recorded {} logical buffers over {} steps for `{}`",
            self.store.len(),
            self.age,
            graph.name
        );
        Ok(self.store)
    }

    /// Number of steps taken so far
    pub fn steps(&self) -> usize {
        self.age
    }

    fn visit(&mut self, graph: &Graph, node: &Node) -> Result<()> {
        if self.target.needs_allocation(node) {
            for &output in &node.outputs {
                self.allocate(graph, output)?;
            }
        } else {
            self.forward(graph, node)?;
        }

        self.age += 1;

        for (index, &input) in node.inputs.iter().enumerate() {
            let connector = graph.input(input)?;
            let dangling = || Error::DanglingConnection {
                node: node.name.clone(),
                input: index,
            };
            let source = connector.connection.ok_or_else(dangling)?;
            if self.unbuffered.contains(&source) {
                continue;
            }
            let buffer = self.store.buffer_of(source).ok_or_else(dangling)?;
            self.release(buffer)?;
        }
        Ok(())
    }

    fn allocate(&mut self, graph: &Graph, output: OutputId) -> Result<BufferId> {
        let connector = graph.output(output)?;
        let producer = graph.node(connector.node)?;
        let name = if producer.outputs.len() > 1 {
            format!("{}:{}", producer.name, connector.index)
        } else {
            producer.name.clone()
        };

        let buffer = LogicalBuffer {
            id: BufferId(0),
            owner: output,
            name,
            data_type: connector.data_type,
            shape: connector.shape.clone(),
            parent_shape: connector.shape.clone(),
            location: self.target.memory_location(graph, output)?,
            size_bytes: connector.size_in_bytes()?,
            alignment: self.target.alignment_of(graph, output)?,
            lifetime: Lifetime::new(self.age, 1),
            alias: None,
            root: None,
            root_offset: 0,
            physical: None,
        };

        let id = self.store.insert(buffer)?;
        trace!("allocate {} for {} at step {}", id, output, self.age);
        Ok(id)
    }

    /// Map the outputs of a pass-through node onto the buffer of its first input
    fn forward(&mut self, graph: &Graph, node: &Node) -> Result<()> {
        let source = match node.inputs.first() {
            Some(&input) => graph.input(input)?.connection,
            None => None,
        };
        let buffer = source.and_then(|output| self.store.buffer_of(output));

        for &output in &node.outputs {
            match buffer {
                Some(buffer) => {
                    trace!("forward {} to {}", output, buffer);
                    self.store.bind(output, buffer)?;
                }
                None => {
                    self.unbuffered.insert(output);
                }
            }
        }
        Ok(())
    }

    fn release(&mut self, id: BufferId) -> Result<()> {
        let step = self.age;
        let buffer = self.store.get_mut(id)?;
        if step <= buffer.lifetime.birth {
            return Err(Error::ReleaseWithoutAllocation(format!(
                "{} released at step {} but born at step {}",
                buffer.name, step, buffer.lifetime.birth
            )));
        }
        buffer.lifetime.age = step - buffer.lifetime.birth;
        trace!("release {} at step {}", id, step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, NodeAttributes};
    use crate::target::GenericTarget;

    #[test]
    fn test_last_consumer_wins() {
        let mut graph = Graph::new("fanout");
        let x = graph.add_input("x", DataType::Float32, vec![4]);
        let a = graph.add_compute("a", "relu", &[x], DataType::Float32, vec![4]);
        let b = graph.add_compute("b", "neg", &[a], DataType::Float32, vec![4]);
        let c = graph.add_compute("c", "add", &[a, b], DataType::Float32, vec![4]);
        graph.add_output("out", c);

        let target = GenericTarget::default();
        let order = graph.execution_order().unwrap();
        let store = LifetimeRecorder::new(&target).record(&graph, &order).unwrap();

        let a_buffer = store.get(store.buffer_of(a).unwrap()).unwrap();
        let c_buffer = store.get(store.buffer_of(c).unwrap()).unwrap();
        // a is read by b and then by c; it must stay live until c has run
        assert!(a_buffer.lifetime.end() > c_buffer.lifetime.birth);
        assert_eq!(a_buffer.lifetime.end(), c_buffer.lifetime.birth + 1);
    }

    #[test]
    fn test_skip_allocation_forwards_buffer() {
        let mut graph = Graph::new("identity");
        let x = graph.add_input("x", DataType::Float32, vec![4]);
        let id = graph.add_compute("identity", "identity", &[x], DataType::Float32, vec![4]);
        let node = graph.output(id).unwrap().node;
        graph.set_attributes(node, NodeAttributes::skip_allocation()).unwrap();
        let y = graph.add_compute("relu", "relu", &[id], DataType::Float32, vec![4]);
        graph.add_output("out", y);

        let target = GenericTarget::default();
        let order = graph.execution_order().unwrap();
        let store = LifetimeRecorder::new(&target).record(&graph, &order).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.buffer_of(id), store.buffer_of(x));
    }

    #[test]
    fn test_dangling_input_is_fatal() {
        let mut graph = Graph::new("dangling");
        let x = graph.add_input("x", DataType::Float32, vec![4]);
        let y = graph.add_compute("relu", "relu", &[x], DataType::Float32, vec![4]);
        let node = graph.output(y).unwrap().node;
        let input = graph.node(node).unwrap().inputs[0];
        graph.disconnect(input).unwrap();

        let target = GenericTarget::default();
        let order = graph.execution_order().unwrap();
        let err = LifetimeRecorder::new(&target).record(&graph, &order).unwrap_err();
        assert!(matches!(err, Error::DanglingConnection { input: 0, .. }));
    }
}
