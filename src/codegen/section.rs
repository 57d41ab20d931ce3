use bytes::{BufMut, BytesMut};
use log::trace;

use crate::error::{Error, Result};
use crate::memory::allocator::align_up;

/// Name of the code section
pub const TEXT_SECTION: &str = ".text";

/// Name of the constant-data section
pub const RDATA_SECTION: &str = ".rdata";

/// A named offset inside a section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDef {
    pub name: String,
    /// Byte offset from the start of the defining section
    pub offset: usize,
}

/// A patch site that receives a symbol's address at link time
///
/// The value is written into `bit_width` bits starting `bit_offset` bits into
/// the little-endian word at byte `position`. Byte-sized references use a bit
/// offset of 0; device configuration words may pack several fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    /// Referenced symbol
    pub symbol: String,
    /// Byte position of the patched word
    pub position: usize,
    pub bit_offset: u32,
    pub bit_width: u32,
}

impl SymbolRef {
    /// Number of bytes covered by the patch
    pub fn byte_len(&self) -> usize {
        ((self.bit_offset + self.bit_width) as usize + 7) / 8
    }
}

/// Growable byte stream for one section, with its symbols and references
#[derive(Debug, Clone)]
pub struct SectionWriter {
    name: String,
    data: BytesMut,
    alignment: usize,
    /// Declared size in memory; at least the byte length
    memory_size: usize,
    symbols: Vec<SymbolDef>,
    references: Vec<SymbolRef>,
}

impl SectionWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BytesMut::new(),
            alignment: 1,
            memory_size: 0,
            symbols: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current write position
    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn symbols(&self) -> &[SymbolDef] {
        &self.symbols
    }

    pub fn references(&self) -> &[SymbolRef] {
        &self.references
    }

    /// Bytes written so far
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pad with zeros up to a multiple of `alignment`; the section inherits the largest alignment
    pub fn align(&mut self, alignment: usize) {
        let alignment = alignment.max(1);
        self.alignment = self.alignment.max(alignment);
        let target = align_up(self.data.len(), alignment);
        self.data.resize(target, 0);
    }

    /// Declare a memory size larger than the written bytes (zero-filled at load)
    pub fn reserve(&mut self, memory_size: usize) {
        self.memory_size = self.memory_size.max(memory_size);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Write `bytes` at an absolute offset, zero-filling any gap
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    /// Define a symbol at the current position
    pub fn define_symbol(&mut self, name: impl Into<String>) -> Result<()> {
        let offset = self.position();
        self.define_symbol_at(name, offset)
    }

    /// Define a symbol at an explicit offset
    pub fn define_symbol_at(&mut self, name: impl Into<String>, offset: usize) -> Result<()> {
        let name = name.into();
        if self.symbols.iter().any(|symbol| symbol.name == name) {
            return Err(Error::DuplicateSymbol {
                symbol: name,
                section: self.name.clone(),
            });
        }
        trace!("{}: define `{}` at {}", self.name, name, offset);
        self.symbols.push(SymbolDef { name, offset });
        Ok(())
    }

    /// Emit a zero placeholder of `bit_width` bits (8, 16, 32 or 64) referring to `symbol`
    pub fn write_reference(&mut self, symbol: impl Into<String>, bit_width: u32) -> Result<()> {
        if !matches!(bit_width, 8 | 16 | 32 | 64) {
            return Err(Error::InvalidSection(format!(
                "Reference width must be 8, 16, 32 or 64 bits, got {}",
                bit_width
            )));
        }
        let position = self.position();
        self.data.put_bytes(0, bit_width as usize / 8);
        self.references.push(SymbolRef {
            symbol: symbol.into(),
            position,
            bit_offset: 0,
            bit_width,
        });
        Ok(())
    }

    /// Record a bitfield reference inside bytes that were already written
    pub fn reference_bits(
        &mut self,
        symbol: impl Into<String>,
        position: usize,
        bit_offset: u32,
        bit_width: u32,
    ) -> Result<()> {
        let symbol = symbol.into();
        if bit_width == 0 || bit_offset + bit_width > 64 {
            return Err(Error::InvalidSection(format!(
                "Bitfield {}+{} for `{}` does not fit in a 64-bit word",
                bit_offset, bit_width, symbol
            )));
        }
        let reference = SymbolRef {
            symbol,
            position,
            bit_offset,
            bit_width,
        };
        if position + reference.byte_len() > self.data.len() {
            return Err(Error::InvalidSection(format!(
                "Reference to `{}` at byte {} lies past the end of {}",
                reference.symbol, position, self.name
            )));
        }
        self.references.push(reference);
        Ok(())
    }

    /// Freeze the stream
    pub fn finalize(self) -> FinalizedSection {
        let memory_size = self.memory_size.max(self.data.len());
        FinalizedSection {
            name: self.name,
            data: self.data.to_vec(),
            alignment: self.alignment,
            memory_size,
            symbols: self.symbols,
            references: self.references,
        }
    }
}

/// A section whose contents no longer grow, ready for linking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSection {
    pub name: String,
    pub data: Vec<u8>,
    pub alignment: usize,
    pub memory_size: usize,
    pub symbols: Vec<SymbolDef>,
    pub references: Vec<SymbolRef>,
}

/// All sections of a module, in creation order
#[derive(Debug, Clone, Default)]
pub struct SectionSet {
    sections: Vec<SectionWriter>,
}

impl SectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Section by name, created empty on first use
    pub fn section(&mut self, name: &str) -> &mut SectionWriter {
        let index = match self.sections.iter().position(|section| section.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(SectionWriter::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    pub fn get(&self, name: &str) -> Option<&SectionWriter> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectionWriter> {
        self.sections.iter()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Finalize every section, keeping creation order
    pub fn finalize(self) -> Vec<FinalizedSection> {
        self.sections.into_iter().map(SectionWriter::finalize).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_layout() {
        let mut section = SectionWriter::new(".text");
        section.write_u8(0xAA);
        section.align(4);
        section.define_symbol("entry").unwrap();
        section.write_u32(0x0403_0201);
        section.write_reference("table", 16).unwrap();

        assert_eq!(section.data(), &[0xAA, 0, 0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(section.symbols()[0], SymbolDef { name: "entry".to_string(), offset: 4 });
        assert_eq!(section.references()[0].position, 8);
        assert_eq!(section.alignment(), 4);
    }

    #[test]
    fn test_duplicate_symbol_in_section() {
        let mut section = SectionWriter::new(".rdata");
        section.define_symbol("weights").unwrap();
        assert!(matches!(
            section.define_symbol("weights"),
            Err(Error::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn test_bitfield_reference_must_be_in_bounds() {
        let mut section = SectionWriter::new(".text");
        section.write_u32(0);
        section.reference_bits("row", 0, 4, 20).unwrap();
        assert_eq!(section.references()[0].byte_len(), 3);
        assert!(section.reference_bits("row", 2, 8, 24).is_err());
        assert!(section.reference_bits("row", 0, 60, 8).is_err());
    }

    #[test]
    fn test_write_at_fills_gaps() {
        let mut section = SectionWriter::new(".rdata0");
        section.write_at(4, &[7, 8]);
        section.write_at(0, &[1]);
        assert_eq!(section.data(), &[1, 0, 0, 0, 7, 8]);
        section.reserve(16);
        assert_eq!(section.finalize().memory_size, 16);
    }
}
