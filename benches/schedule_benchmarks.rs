use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use model_scheduler::{
    codegen::{ModuleBuilder, NodeEmitter, SectionSet, TEXT_SECTION},
    model::{DataType, Graph, Module, Node},
    schedule::{schedule_module, AllocationTable, Scheduler},
    target::GenericTarget,
    Result,
};

/// Residual chain of `blocks` blocks, each with a reshape, a split and a concat
fn residual_chain(name: &str, blocks: usize) -> Graph {
    let mut graph = Graph::new(name);
    let mut x = graph.add_input("x", DataType::Float32, vec![1, 64]);

    for block in 0..blocks {
        let weights = graph.add_constant(
            format!("w{}", block),
            DataType::Float32,
            vec![64],
            vec![0; 256],
            Some(16),
        );
        let a = graph.add_compute(
            format!("mul{}", block),
            "mul",
            &[x, weights],
            DataType::Float32,
            vec![1, 64],
        );
        let flat = graph
            .add_reshape(format!("flat{}", block), a, vec![64])
            .expect("reshape keeps the element count");
        let left = graph.add_compute(
            format!("left{}", block),
            "relu",
            &[flat],
            DataType::Float32,
            vec![1, 32],
        );
        let right = graph.add_compute(
            format!("right{}", block),
            "tanh",
            &[flat],
            DataType::Float32,
            vec![1, 32],
        );
        let joined = graph
            .add_concat(format!("cat{}", block), &[left, right], 1)
            .expect("concat operands agree off the axis");
        x = graph.add_compute(
            format!("add{}", block),
            "add",
            &[joined, a],
            DataType::Float32,
            vec![1, 64],
        );
    }

    graph.add_output("y", x);
    graph
}

struct OpcodeEmitter;

impl NodeEmitter for OpcodeEmitter {
    fn emit(
        &self,
        _graph: &Graph,
        node: &Node,
        allocations: &AllocationTable,
        sections: &mut SectionSet,
    ) -> Result<()> {
        let text = sections.section(TEXT_SECTION);
        text.write_u8(node.inputs.len() as u8);
        for &output in &node.outputs {
            let start = allocations.get(output).map(|a| a.start).unwrap_or(0);
            text.write_u32(start as u32);
        }
        Ok(())
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let target = GenericTarget::default();
    let mut group = c.benchmark_group("scheduling");

    for blocks in [8usize, 64, 256] {
        let graph = residual_chain("chain", blocks);
        group.bench_function(BenchmarkId::new("schedule", blocks), |b| {
            b.iter(|| Scheduler::new(&target).schedule(black_box(&graph)))
        });
        group.bench_function(BenchmarkId::new("build", blocks), |b| {
            b.iter(|| ModuleBuilder::new(&target).build(black_box(&graph), &OpcodeEmitter))
        });
    }

    let mut module = Module::new("model");
    for index in 0..8 {
        module.add_function(residual_chain(&format!("f{}", index), 64));
    }
    group.bench_function(BenchmarkId::new("schedule_module", 8), |b| {
        b.iter(|| schedule_module(&target, black_box(&module)))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
