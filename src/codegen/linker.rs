use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use bytes::Bytes;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::codegen::binary::{
    MergedImage, ModuleInfo, ModuleReader, ModuleWriter, SectionDescriptor, SectionImage,
};
use crate::codegen::section::{FinalizedSection, SectionSet, SymbolRef, RDATA_SECTION, TEXT_SECTION};
use crate::error::{Error, Result};
use crate::memory::allocator::align_up;

/// Fold the `source` section into `destination` at link time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDirective {
    pub source: String,
    pub destination: String,
}

impl MergeDirective {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Merge into the constant-data section
    pub fn into_rdata(source: impl Into<String>) -> Self {
        Self::new(source, RDATA_SECTION)
    }
}

/// Where a merged section ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRecord {
    pub source: String,
    pub destination: String,
    /// Byte offset of the source inside the destination
    pub base: usize,
    pub size: usize,
    pub memory_size: usize,
}

/// A symbol with its final address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    /// Section the symbol lives in after merging
    pub section: String,
    /// Section the symbol was defined in
    pub defined_in: String,
    /// Offset from the start of `section`
    pub address: u64,
}

/// Global symbol table of a linked module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<String, ResolvedSymbol>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<&ResolvedSymbol> {
        self.symbols.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedSymbol> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn define(&mut self, symbol: ResolvedSymbol) -> Result<()> {
        if self.symbols.contains_key(&symbol.name) {
            return Err(Error::DuplicateSymbol {
                symbol: symbol.name,
                section: symbol.defined_in,
            });
        }
        self.symbols.insert(symbol.name.clone(), symbol);
        Ok(())
    }
}

/// Output of a successful link
#[derive(Debug, Clone)]
pub struct LinkedModule {
    /// The complete binary
    pub bytes: Bytes,
    /// Section table, in file order
    pub sections: Vec<SectionDescriptor>,
    pub symbols: SymbolTable,
    pub merges: Vec<MergeRecord>,
}

impl LinkedModule {
    /// Write the binary to a file or stream
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Decode the binary again
    pub fn reader(&self) -> Result<ModuleReader> {
        ModuleReader::parse(self.bytes.clone())
    }
}

/// Merges, relocates and serializes the sections of one module
pub struct Linker {
    sections: Vec<FinalizedSection>,
    directives: Vec<MergeDirective>,
    alignment: usize,
    /// Source section index to merge record
    merged: BTreeMap<usize, MergeRecord>,
    /// (destination, symbol) moved by a merge, with the section that defined it
    origins: BTreeMap<(String, String), String>,
}

impl Linker {
    /// Take over the module's sections, finalizing their streams
    pub fn new(sections: SectionSet, alignment: usize) -> Self {
        Self {
            sections: sections.finalize(),
            directives: Vec::new(),
            alignment: alignment.max(1),
            merged: BTreeMap::new(),
            origins: BTreeMap::new(),
        }
    }

    /// Set the merge directives, applied in order
    pub fn with_merge_directives(mut self, directives: Vec<MergeDirective>) -> Self {
        self.directives = directives;
        self
    }

    pub fn add_merge_directive(&mut self, directive: MergeDirective) {
        self.directives.push(directive);
    }

    /// Merge, resolve and patch every reference, then write the binary
    ///
    /// Every link error is raised before any output byte is produced.
    pub fn link(mut self, info: &ModuleInfo) -> Result<LinkedModule> {
        self.merge()?;
        let symbols = self.build_symbol_table()?;
        self.patch(&symbols)?;

        let order = self.section_order();
        let images: Vec<SectionImage<'_>> = order
            .iter()
            .map(|&index| {
                let section = &self.sections[index];
                SectionImage {
                    name: &section.name,
                    data: &section.data,
                    alignment: section.alignment,
                    memory_size: section.memory_size,
                }
            })
            .collect();

        let mut merged_images = Vec::with_capacity(self.merged.len());
        let mut records: Vec<&MergeRecord> = self.merged.values().collect();
        records.sort_by_key(|record| (record.destination.clone(), record.base));
        for record in &records {
            let destination = images
                .iter()
                .position(|image| image.name == record.destination)
                .ok_or_else(|| {
                    Error::InvalidSection(format!(
                        "Merge destination {} vanished",
                        record.destination
                    ))
                })?;
            merged_images.push(MergedImage {
                name: &record.source,
                destination,
                base: record.base,
                size: record.size,
                memory_size: record.memory_size,
            });
        }

        let (bytes, descriptors) =
            ModuleWriter::new(self.alignment).write(info, &images, &merged_images)?;
        debug!(
            "Linked {} sections ({} merged), {} symbols, {} bytes",
            descriptors.len(),
            merged_images.len(),
            symbols.len(),
            bytes.len()
        );

        let merges = records.into_iter().cloned().collect();
        Ok(LinkedModule {
            bytes,
            sections: descriptors,
            symbols,
            merges,
        })
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|section| section.name == name)
    }

    fn merge(&mut self) -> Result<()> {
        let sources: BTreeSet<&str> = self.directives.iter().map(|d| d.source.as_str()).collect();
        for directive in &self.directives {
            if directive.source == directive.destination {
                return Err(Error::InvalidSection(format!(
                    "Section {} cannot be merged into itself",
                    directive.source
                )));
            }
            if sources.contains(directive.destination.as_str()) {
                return Err(Error::InvalidSection(format!(
                    "Section {} is both a merge source and a merge destination",
                    directive.destination
                )));
            }
        }

        let directives = self.directives.clone();
        for directive in &directives {
            let Some(source) = self.index_of(&directive.source) else {
                debug!("Merge source {} is empty, skipping", directive.source);
                continue;
            };
            if self.merged.contains_key(&source) {
                return Err(Error::InvalidSection(format!(
                    "Section {} is merged more than once",
                    directive.source
                )));
            }
            let destination = match self.index_of(&directive.destination) {
                Some(index) => index,
                None => {
                    self.sections.push(FinalizedSection {
                        name: directive.destination.clone(),
                        data: Vec::new(),
                        alignment: 1,
                        memory_size: 0,
                        symbols: Vec::new(),
                        references: Vec::new(),
                    });
                    self.sections.len() - 1
                }
            };

            let symbols = std::mem::take(&mut self.sections[source].symbols);
            let references = std::mem::take(&mut self.sections[source].references);
            let source_section = &self.sections[source];
            let data = source_section.data.clone();
            let source_alignment = source_section.alignment;
            let source_memory_size = source_section.memory_size;

            let dest = &mut self.sections[destination];
            let base = align_up(dest.memory_size.max(dest.data.len()), source_alignment);
            dest.data.resize(base, 0);
            dest.data.extend_from_slice(&data);
            dest.data.resize(base + source_memory_size, 0);
            dest.memory_size = dest.data.len();
            dest.alignment = dest.alignment.max(source_alignment);

            for mut symbol in symbols {
                symbol.offset += base;
                self.origins.insert(
                    (directive.destination.clone(), symbol.name.clone()),
                    directive.source.clone(),
                );
                dest.symbols.push(symbol);
            }
            for mut reference in references {
                reference.position += base;
                dest.references.push(reference);
            }

            trace!(
                "merge {} into {} at {} ({} bytes)",
                directive.source,
                directive.destination,
                base,
                data.len()
            );
            self.merged.insert(
                source,
                MergeRecord {
                    source: directive.source.clone(),
                    destination: directive.destination.clone(),
                    base,
                    size: data.len(),
                    memory_size: source_memory_size,
                },
            );
        }
        Ok(())
    }

    fn build_symbol_table(&self) -> Result<SymbolTable> {
        let mut table = SymbolTable::default();

        for (index, section) in self.sections.iter().enumerate() {
            if self.merged.contains_key(&index) {
                continue;
            }
            for symbol in &section.symbols {
                let defined_in = self
                    .origins
                    .get(&(section.name.clone(), symbol.name.clone()))
                    .unwrap_or(&section.name);
                table.define(ResolvedSymbol {
                    name: symbol.name.clone(),
                    section: section.name.clone(),
                    defined_in: defined_in.clone(),
                    address: symbol.offset as u64,
                })?;
            }
        }

        debug!("Symbol table holds {} symbols", table.len());
        Ok(table)
    }

    fn patch(&mut self, symbols: &SymbolTable) -> Result<()> {
        for (index, section) in self.sections.iter_mut().enumerate() {
            if self.merged.contains_key(&index) {
                continue;
            }
            let references = std::mem::take(&mut section.references);
            for reference in &references {
                let symbol = symbols.get(&reference.symbol).ok_or_else(|| Error::UnresolvedSymbol {
                    symbol: reference.symbol.clone(),
                    section: section.name.clone(),
                })?;
                patch_reference(section, reference, symbol.address)?;
                trace!(
                    "{}+{}: `{}` = {}",
                    section.name,
                    reference.position,
                    reference.symbol,
                    symbol.address
                );
            }
            section.references = references;
        }
        Ok(())
    }

    /// Code first, then constant data, then the rest in creation order
    fn section_order(&self) -> Vec<usize> {
        let live: Vec<usize> = (0..self.sections.len())
            .filter(|index| !self.merged.contains_key(index))
            .collect();

        let mut order = Vec::with_capacity(live.len());
        for name in [TEXT_SECTION, RDATA_SECTION] {
            if let Some(&index) = live.iter().find(|&&index| self.sections[index].name == name) {
                order.push(index);
            }
        }
        for index in live {
            if !order.contains(&index) {
                order.push(index);
            }
        }
        order
    }
}

/// Write `value` into the bitfield described by `reference`
fn patch_reference(
    section: &mut FinalizedSection,
    reference: &SymbolRef,
    value: u64,
) -> Result<()> {
    if reference.bit_width < 64 && value >> reference.bit_width != 0 {
        return Err(Error::RelocationOverflow {
            symbol: reference.symbol.clone(),
            section: section.name.clone(),
            value,
            bits: reference.bit_width,
        });
    }

    let len = reference.byte_len();
    let end = reference.position + len;
    if len > 8 || end > section.data.len() {
        return Err(Error::InvalidSection(format!(
            "Reference to `{}` at byte {} lies outside {}",
            reference.symbol, reference.position, section.name
        )));
    }

    let bytes = &mut section.data[reference.position..end];
    let mut word = [0u8; 8];
    word[..len].copy_from_slice(bytes);
    let mut current = u64::from_le_bytes(word);

    let mask = if reference.bit_width == 64 {
        u64::MAX
    } else {
        ((1u64 << reference.bit_width) - 1) << reference.bit_offset
    };
    current = (current & !mask) | ((value << reference.bit_offset) & mask);

    bytes.copy_from_slice(&current.to_le_bytes()[..len]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_patch_preserves_neighbours() {
        let mut section = FinalizedSection {
            name: ".text".to_string(),
            data: vec![0xFF, 0xFF, 0xFF, 0xFF],
            alignment: 1,
            memory_size: 4,
            symbols: Vec::new(),
            references: Vec::new(),
        };
        let reference = SymbolRef {
            symbol: "row".to_string(),
            position: 0,
            bit_offset: 4,
            bit_width: 12,
        };
        patch_reference(&mut section, &reference, 0x123).unwrap();
        assert_eq!(section.data, vec![0x3F, 0x12, 0xFF, 0xFF]);

        let err = patch_reference(&mut section, &reference, 0x1000).unwrap_err();
        assert!(matches!(err, Error::RelocationOverflow { bits: 12, .. }));
    }

    #[test]
    fn test_merge_into_missing_destination_creates_it() {
        let mut sections = SectionSet::new();
        sections.section(".text").write_u32(0);
        sections.section(".aux").write_bytes(&[1, 2, 3]);

        let linked = Linker::new(sections, 4)
            .with_merge_directives(vec![MergeDirective::into_rdata(".aux")])
            .link(&ModuleInfo::default())
            .unwrap();

        let names: Vec<&str> = linked.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![".text", ".rdata", ".aux"]);
        assert!(linked.sections[2].is_merged());
        assert_eq!(linked.merges[0].base, 0);
    }

    #[test]
    fn test_chained_merges_are_rejected() {
        let mut sections = SectionSet::new();
        sections.section(".a").write_u8(1);
        sections.section(".b").write_u8(2);
        let err = Linker::new(sections, 1)
            .with_merge_directives(vec![
                MergeDirective::new(".a", ".b"),
                MergeDirective::new(".b", ".rdata"),
            ])
            .link(&ModuleInfo::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSection(_)));
    }
}
