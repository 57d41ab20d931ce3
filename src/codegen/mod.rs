//! Section emission, linking and the binary container.

pub mod binary;
pub mod builder;
pub mod linker;
pub mod section;

pub use binary::{
    IoDesc, MempoolDesc, ModelHeader, ModuleInfo, ModuleReader, ModuleWriter, SectionDescriptor,
    MODEL_IDENTIFIER, MODEL_VERSION, SECTION_MERGED,
};
pub use builder::{CompiledModule, ModuleBuilder, NodeEmitter};
pub use linker::{LinkedModule, Linker, MergeDirective, MergeRecord, ResolvedSymbol, SymbolTable};
pub use section::{
    FinalizedSection, SectionSet, SectionWriter, SymbolDef, SymbolRef, RDATA_SECTION, TEXT_SECTION,
};
