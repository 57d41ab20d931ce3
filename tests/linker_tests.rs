use std::io::Read;

use anyhow::Result;
use model_scheduler::{
    codegen::{
        Linker, MergeDirective, ModuleBuilder, ModuleInfo, ModuleReader, NodeEmitter, SectionSet,
        RDATA_SECTION, TEXT_SECTION,
    },
    error::{Error, ErrorKind},
    model::{DataType, Graph, Module, Node, NodeAttributes, OpCode, OutputId},
    schedule::{AllocationTable, MemoryLocation},
    target::{GenericTarget, Target, TargetOptions},
};

// Helper to build the sections used by the merge tests
fn merge_fixture() -> SectionSet {
    let mut sections = SectionSet::new();

    let text = sections.section(TEXT_SECTION);
    text.define_symbol("main").unwrap();
    text.write_u32(0xDEAD_BEEF);
    text.write_reference("table", 32).unwrap();
    text.write_reference("first", 16).unwrap();

    sections.section(RDATA_SECTION).write_bytes(&[0xEE; 10]);

    let ya = sections.section(".ya");
    ya.define_symbol("first").unwrap();
    ya.write_bytes(&[1, 2, 3, 4, 5, 6]);

    let yb = sections.section(".yb");
    yb.align(8);
    yb.write_u32(0x0A0B_0C0D);
    yb.define_symbol("table").unwrap();
    yb.write_u32(0x1122_3344);

    sections
}

fn merge_directives() -> Vec<MergeDirective> {
    vec![MergeDirective::into_rdata(".ya"), MergeDirective::into_rdata(".yb")]
}

#[test]
fn test_reference_into_merged_section() -> Result<()> {
    let linked = Linker::new(merge_fixture(), 8)
        .with_merge_directives(merge_directives())
        .link(&ModuleInfo::default())?;

    // .ya lands right after the 10 bytes of .rdata, .yb at the next multiple of 8
    assert_eq!(linked.merges[0].base, 10);
    assert_eq!(linked.merges[1].base, 16);

    let table = linked.symbols.get("table").unwrap();
    assert_eq!(table.section, RDATA_SECTION);
    assert_eq!(table.defined_in, ".yb");
    assert_eq!(table.address, 16 + 4);

    let reader = linked.reader()?;
    let text = reader.section_data(TEXT_SECTION)?;
    assert_eq!(&text[0..4], &0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(&text[4..8], &20u32.to_le_bytes());
    assert_eq!(&text[8..10], &10u16.to_le_bytes());
    Ok(())
}

#[test]
fn test_merged_section_round_trips_through_file() -> Result<()> {
    let sections = merge_fixture();
    let original_yb = sections.iter().find(|s| s.name() == ".yb").unwrap().data().to_vec();
    let original_ya = sections.iter().find(|s| s.name() == ".ya").unwrap().data().to_vec();

    let linked = Linker::new(sections, 8)
        .with_merge_directives(merge_directives())
        .link(&ModuleInfo::default())?;

    let mut file = tempfile::NamedTempFile::new()?;
    linked.write_to(file.as_file_mut())?;
    let mut bytes = Vec::new();
    file.reopen()?.read_to_end(&mut bytes)?;

    let reader = ModuleReader::parse(bytes)?;
    let names: Vec<&str> = reader.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![".text", ".rdata", ".ya", ".yb"]);
    assert!(reader.section(".yb").unwrap().is_merged());
    assert!(!reader.section(RDATA_SECTION).unwrap().is_merged());
    assert_eq!(reader.section_data(".yb")?, original_yb.as_slice());
    assert_eq!(reader.section_data(".ya")?, original_ya.as_slice());
    assert_eq!(reader.section(RDATA_SECTION).unwrap().file_size, 24);
    Ok(())
}

#[test]
fn test_linking_is_deterministic() -> Result<()> {
    let first = Linker::new(merge_fixture(), 8)
        .with_merge_directives(merge_directives())
        .link(&ModuleInfo::default())?;
    let second = Linker::new(merge_fixture(), 8)
        .with_merge_directives(merge_directives())
        .link(&ModuleInfo::default())?;
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.sections, second.sections);
    Ok(())
}

#[test]
fn test_duplicate_symbol_across_sections() {
    let mut sections = SectionSet::new();
    sections.section(TEXT_SECTION).define_symbol("weights").unwrap();
    sections.section(".aux").define_symbol("weights").unwrap();

    let err = Linker::new(sections, 4)
        .with_merge_directives(vec![MergeDirective::into_rdata(".aux")])
        .link(&ModuleInfo::default())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Link);
    assert!(matches!(err, Error::DuplicateSymbol { ref symbol, .. } if symbol == "weights"));
}

#[test]
fn test_unresolved_symbol_names_the_section() {
    let mut sections = SectionSet::new();
    sections.section(TEXT_SECTION).write_reference("missing", 32).unwrap();

    let err = Linker::new(sections, 4).link(&ModuleInfo::default()).unwrap_err();
    match err {
        Error::UnresolvedSymbol { symbol, section } => {
            assert_eq!(symbol, "missing");
            assert_eq!(section, TEXT_SECTION);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_narrow_reference_overflows() {
    let mut sections = SectionSet::new();
    sections.section(TEXT_SECTION).write_reference("far", 8).unwrap();
    let rdata = sections.section(RDATA_SECTION);
    rdata.write_bytes(&[0; 300]);
    rdata.define_symbol("far").unwrap();

    let err = Linker::new(sections, 4).link(&ModuleInfo::default()).unwrap_err();
    assert!(matches!(err, Error::RelocationOverflow { value: 300, bits: 8, .. }));
}

/// Emits one opcode byte and the output placement of every node
struct RecordingEmitter;

impl NodeEmitter for RecordingEmitter {
    fn emit(
        &self,
        _graph: &Graph,
        node: &Node,
        allocations: &AllocationTable,
        sections: &mut SectionSet,
    ) -> model_scheduler::Result<()> {
        let text = sections.section(TEXT_SECTION);
        text.write_u8(node.op.name().len() as u8);
        for &output in &node.outputs {
            let allocation = allocations.get(output).ok_or_else(|| {
                model_scheduler::Error::InvalidGraph(format!("{} has no allocation", output))
            })?;
            text.write_u32(allocation.start as u32);
        }
        Ok(())
    }
}

fn function_with_constant(name: &str, constant: Vec<u8>) -> Graph {
    let mut graph = Graph::new(name);
    let x = graph.add_input("x", DataType::Uint8, vec![4]);
    let k = graph.add_constant("k", DataType::Uint8, vec![constant.len()], constant, None);
    let y = graph.add_compute("add", "add", &[x, k], DataType::Uint8, vec![4]);
    graph.add_output("y", y);
    graph
}

#[test]
fn test_module_builder_links_constants_per_function() -> Result<()> {
    let mut module = Module::new("model");
    module.add_function(function_with_constant("main", vec![1, 2, 3]));
    module.add_function(function_with_constant("aux", vec![7, 8, 9, 10, 11]));

    let target = GenericTarget::new("generic", TargetOptions::default().set_section_alignment(16));
    let compiled = ModuleBuilder::new(&target).build_module(&module, &RecordingEmitter)?;
    let reader = compiled.linked.reader()?;

    assert_eq!(reader.header.functions, 2);
    assert_eq!(reader.mempool_size(MemoryLocation::Rdata), 5);
    assert_eq!(reader.mempool_size(MemoryLocation::Input), 4);
    assert_eq!(reader.inputs.len(), 1);
    assert_eq!(reader.inputs[0].shape, vec![4]);
    assert_eq!(reader.outputs.len(), 1);

    let main = compiled.linked.symbols.get("main.rdata").unwrap();
    let aux = compiled.linked.symbols.get("aux.rdata").unwrap();
    assert_eq!(main.address, 0);
    assert_eq!(aux.address, 3);

    let rdata = reader.section_data(RDATA_SECTION)?;
    assert_eq!(rdata, &[1, 2, 3, 7, 8, 9, 10, 11]);
    assert_eq!(reader.section_data(".rdata1")?, &[7, 8, 9, 10, 11]);

    // Each function starts with a reference to its constants and its node count
    let text = reader.section_data(TEXT_SECTION)?;
    let main_offset = compiled.linked.symbols.get("main").unwrap().address as usize;
    let aux_offset = compiled.linked.symbols.get("aux").unwrap().address as usize;
    assert_eq!(&text[main_offset..main_offset + 4], &0u32.to_le_bytes());
    assert_eq!(&text[main_offset + 4..main_offset + 8], &1u32.to_le_bytes());
    assert_eq!(&text[aux_offset..aux_offset + 4], &3u32.to_le_bytes());
    assert_eq!(reader.sections[0].file_offset % 16, 0);
    Ok(())
}

#[test]
fn test_module_builder_is_idempotent() -> Result<()> {
    let graph = function_with_constant("main", vec![5, 6]);
    let target = GenericTarget::default();

    let first = ModuleBuilder::new(&target).build(&graph, &RecordingEmitter)?;
    let second = ModuleBuilder::new(&target).build(&graph, &RecordingEmitter)?;
    assert_eq!(first.linked.bytes, second.linked.bytes);
    assert_eq!(
        first.schedules[0].allocations.to_json()?,
        second.schedules[0].allocations.to_json()?
    );
    Ok(())
}

#[test]
fn test_bitfield_reference_is_patched_at_link() -> Result<()> {
    let mut sections = SectionSet::new();
    let text = sections.section(TEXT_SECTION);
    text.write_u32(0xFFFF_FFFF);
    // 12-bit row index packed above a 4-bit opcode
    text.reference_bits("row", 0, 4, 12)?;

    let rdata = sections.section(RDATA_SECTION);
    rdata.write_bytes(&[0; 0x123]);
    rdata.define_symbol("row")?;

    let linked = Linker::new(sections, 4).link(&ModuleInfo::default())?;
    let reader = linked.reader()?;
    assert_eq!(reader.section_data(TEXT_SECTION)?, &[0x3F, 0x12, 0xFF, 0xFF]);
    Ok(())
}

#[test]
fn test_references_inside_merged_section_are_rebased() -> Result<()> {
    let mut sections = SectionSet::new();
    let text = sections.section(TEXT_SECTION);
    text.write_u32(0);
    text.define_symbol("entry")?;
    text.write_u32(0);

    sections.section(RDATA_SECTION).write_bytes(&[0xEE; 10]);

    let aux = sections.section(".aux");
    aux.write_bytes(&[9, 9, 9]);
    aux.write_reference("entry", 16)?;

    let linked = Linker::new(sections, 4)
        .with_merge_directives(vec![MergeDirective::into_rdata(".aux")])
        .link(&ModuleInfo::default())?;
    assert_eq!(linked.merges[0].base, 10);

    let reader = linked.reader()?;
    let rdata = reader.section_data(RDATA_SECTION)?;
    assert_eq!(&rdata[10..13], &[9, 9, 9]);
    assert_eq!(&rdata[13..15], &4u16.to_le_bytes());
    assert_eq!(reader.section_data(".aux")?, &[9, 9, 9, 4, 0]);
    Ok(())
}

/// Places constants in scratch memory instead of the read-only pool
struct ScratchConstants {
    inner: GenericTarget,
}

impl Target for ScratchConstants {
    fn name(&self) -> &str {
        "scratch-constants"
    }

    fn options(&self) -> &TargetOptions {
        self.inner.options()
    }

    fn memory_location(
        &self,
        graph: &Graph,
        output: OutputId,
    ) -> model_scheduler::Result<MemoryLocation> {
        match graph.producer(output)?.op {
            OpCode::Constant { .. } => Ok(MemoryLocation::Data),
            _ => self.inner.memory_location(graph, output),
        }
    }
}

#[test]
fn test_constant_outside_rdata_fails_the_build() {
    let graph = function_with_constant("main", vec![1, 2, 3, 4]);
    let target = ScratchConstants {
        inner: GenericTarget::default(),
    };

    let err = ModuleBuilder::new(&target).build(&graph, &RecordingEmitter).unwrap_err();
    assert!(matches!(err, Error::InvalidGraph(ref message) if message.contains("`k`")));
}

#[test]
fn test_constant_without_storage_fails_the_build() -> Result<()> {
    let mut graph = function_with_constant("main", vec![1, 2, 3]);
    let constant = graph
        .nodes()
        .iter()
        .find(|node| matches!(node.op, OpCode::Constant { .. }))
        .map(|node| node.id)
        .unwrap();
    graph.set_attributes(constant, NodeAttributes::skip_allocation())?;

    let target = GenericTarget::default();
    let err = ModuleBuilder::new(&target).build(&graph, &RecordingEmitter).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphConsistency);
    assert!(matches!(err, Error::InvalidGraph(ref message) if message.contains("`k`")));
    Ok(())
}
