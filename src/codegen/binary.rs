//! Binary container for a linked module.
//!
//! All integers are little-endian. The file starts with a fixed 44-byte
//! header, followed by the mempool table, the input/output descriptors, the
//! section table and finally the section bodies, each body starting at a
//! multiple of its alignment. Merged sections are listed with the `MERGED`
//! flag and a file range inside their destination's body.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::memory::allocator::align_up;
use crate::model::{DataType, OutputId};
use crate::schedule::buffer::MemoryLocation;
use crate::schedule::scheduler::ScheduleResult;

/// "NNCM" read as a little-endian u32
pub const MODEL_IDENTIFIER: u32 = u32::from_le_bytes(*b"NNCM");
pub const MODEL_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 44;
pub const SECTION_NAME_LEN: usize = 16;
pub const MEMPOOL_DESC_SIZE: usize = 8;
pub const SECTION_DESC_SIZE: usize = SECTION_NAME_LEN + 16;

/// Section was folded into another section at link time
pub const SECTION_MERGED: u32 = 0x1;

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidBinary(format!("{} {} does not fit in 32 bits", what, value)))
}

/// Fixed file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    pub identifier: u32,
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
    /// Alignment every section body honours at least
    pub alignment: u32,
    pub modules: u32,
    pub functions: u32,
    pub mempools: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub sections: u32,
}

/// Memory a runtime must reserve for one location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolDesc {
    pub location: MemoryLocation,
    pub size: u32,
}

/// Placement of one function input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDesc {
    pub location: MemoryLocation,
    pub data_type: DataType,
    pub start: u32,
    pub size: u32,
    pub shape: Vec<u32>,
}

impl IoDesc {
    fn encoded_len(&self) -> usize {
        12 + 4 * self.shape.len()
    }
}

/// Entry of the section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub name: String,
    pub flags: u32,
    pub file_offset: u32,
    pub file_size: u32,
    pub memory_size: u32,
}

impl SectionDescriptor {
    pub fn is_merged(&self) -> bool {
        self.flags & SECTION_MERGED != 0
    }

    /// Byte range of the section inside the file
    pub fn file_range(&self) -> std::ops::Range<usize> {
        let start = self.file_offset as usize;
        start..start + self.file_size as usize
    }
}

/// Module-level facts recorded in the header and descriptor tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub modules: u32,
    pub functions: u32,
    pub mempools: Vec<MempoolDesc>,
    pub inputs: Vec<IoDesc>,
    pub outputs: Vec<IoDesc>,
}

impl ModuleInfo {
    /// Collect memory totals and IO placements from scheduled functions
    ///
    /// Each mempool is sized for the most demanding function. Input and output
    /// descriptors describe the first function, the module's entry point.
    pub fn from_schedules(schedules: &[ScheduleResult]) -> Result<Self> {
        let mut totals = BTreeMap::new();
        for schedule in schedules {
            for (&location, &usage) in &schedule.max_usages {
                let total = totals.entry(location).or_insert(0usize);
                *total = (*total).max(usage);
            }
        }
        let mempools = totals
            .into_iter()
            .map(|(location, size)| {
                Ok(MempoolDesc {
                    location,
                    size: to_u32(size, "Mempool size")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (inputs, outputs) = match schedules.first() {
            Some(entry) => (
                Self::io_descs(entry, &entry.inputs)?,
                Self::io_descs(entry, &entry.outputs)?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            modules: 1,
            functions: to_u32(schedules.len(), "Function count")?,
            mempools,
            inputs,
            outputs,
        })
    }

    fn io_descs(schedule: &ScheduleResult, outputs: &[OutputId]) -> Result<Vec<IoDesc>> {
        outputs
            .iter()
            .map(|&output| {
                let allocation = schedule.allocations.get(output).ok_or_else(|| {
                    Error::InvalidBinary(format!(
                        "{} of `{}` has no allocation",
                        output, schedule.function
                    ))
                })?;
                Ok(IoDesc {
                    location: allocation.memory_location,
                    data_type: allocation.data_type,
                    start: to_u32(allocation.start, "IO start")?,
                    size: to_u32(allocation.size, "IO size")?,
                    shape: allocation
                        .shape
                        .iter()
                        .map(|&dim| to_u32(dim, "Dimension"))
                        .collect::<Result<_>>()?,
                })
            })
            .collect()
    }
}

/// Section body to place in the file
#[derive(Debug, Clone, Copy)]
pub struct SectionImage<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    pub alignment: usize,
    pub memory_size: usize,
}

/// Section whose bytes live inside another section's body
#[derive(Debug, Clone, Copy)]
pub struct MergedImage<'a> {
    pub name: &'a str,
    /// Index of the destination in the section image list
    pub destination: usize,
    /// Offset inside the destination
    pub base: usize,
    pub size: usize,
    pub memory_size: usize,
}

/// Serializes a linked module
pub struct ModuleWriter {
    alignment: usize,
}

impl ModuleWriter {
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }

    /// Write header, tables and bodies; returns the file and its section table
    pub fn write(
        &self,
        info: &ModuleInfo,
        sections: &[SectionImage<'_>],
        merged: &[MergedImage<'_>],
    ) -> Result<(Bytes, Vec<SectionDescriptor>)> {
        let io_len: usize = info
            .inputs
            .iter()
            .chain(&info.outputs)
            .map(IoDesc::encoded_len)
            .sum();
        let table_end = HEADER_SIZE
            + info.mempools.len() * MEMPOOL_DESC_SIZE
            + io_len
            + (sections.len() + merged.len()) * SECTION_DESC_SIZE;

        // Lay out bodies first so the section table can be written in one pass
        let mut descriptors = Vec::with_capacity(sections.len() + merged.len());
        let mut cursor = table_end;
        for section in sections {
            let start = align_up(cursor, self.alignment.max(section.alignment));
            descriptors.push(SectionDescriptor {
                name: section.name.to_string(),
                flags: 0,
                file_offset: to_u32(start, "Section offset")?,
                file_size: to_u32(section.data.len(), "Section size")?,
                memory_size: to_u32(
                    section.memory_size.max(section.data.len()),
                    "Section memory size",
                )?,
            });
            cursor = start + section.data.len();
        }
        for image in merged {
            let destination = descriptors.get(image.destination).ok_or_else(|| {
                Error::InvalidSection(format!("Merged section {} has no destination", image.name))
            })?;
            let start = destination.file_offset as usize + image.base;
            if image.base + image.size > destination.file_size as usize {
                return Err(Error::InvalidSection(format!(
                    "Merged section {} lies outside {}",
                    image.name, destination.name
                )));
            }
            descriptors.push(SectionDescriptor {
                name: image.name.to_string(),
                flags: SECTION_MERGED,
                file_offset: to_u32(start, "Section offset")?,
                file_size: to_u32(image.size, "Section size")?,
                memory_size: to_u32(image.memory_size.max(image.size), "Section memory size")?,
            });
        }

        let mut out = BytesMut::with_capacity(cursor);
        out.put_u32_le(MODEL_IDENTIFIER);
        out.put_u32_le(MODEL_VERSION);
        out.put_u32_le(HEADER_SIZE as u32);
        out.put_u32_le(0);
        out.put_u32_le(to_u32(self.alignment, "Alignment")?);
        out.put_u32_le(info.modules);
        out.put_u32_le(info.functions);
        out.put_u32_le(to_u32(info.mempools.len(), "Mempool count")?);
        out.put_u32_le(to_u32(info.inputs.len(), "Input count")?);
        out.put_u32_le(to_u32(info.outputs.len(), "Output count")?);
        out.put_u32_le(to_u32(descriptors.len(), "Section count")?);

        for mempool in &info.mempools {
            out.put_u8(mempool.location.code());
            out.put_bytes(0, 3);
            out.put_u32_le(mempool.size);
        }

        for io in info.inputs.iter().chain(&info.outputs) {
            out.put_u8(io.location.code());
            out.put_u8(io.data_type.code());
            let rank = u16::try_from(io.shape.len())
                .map_err(|_| {
                    Error::InvalidBinary(format!("Rank {} does not fit in 16 bits", io.shape.len()))
                })?;
            out.put_u16_le(rank);
            out.put_u32_le(io.start);
            out.put_u32_le(io.size);
            for &dim in &io.shape {
                out.put_u32_le(dim);
            }
        }

        for descriptor in &descriptors {
            let name = descriptor.name.as_bytes();
            if name.len() > SECTION_NAME_LEN {
                return Err(Error::InvalidSection(format!(
                    "Section name {} is longer than {} bytes",
                    descriptor.name, SECTION_NAME_LEN
                )));
            }
            out.put_slice(name);
            out.put_bytes(0, SECTION_NAME_LEN - name.len());
            out.put_u32_le(descriptor.flags);
            out.put_u32_le(descriptor.file_offset);
            out.put_u32_le(descriptor.file_size);
            out.put_u32_le(descriptor.memory_size);
        }

        for (section, descriptor) in sections.iter().zip(&descriptors) {
            out.resize(descriptor.file_offset as usize, 0);
            out.put_slice(section.data);
        }

        Ok((out.freeze(), descriptors))
    }
}

/// Decoded view of a linked module
#[derive(Debug, Clone)]
pub struct ModuleReader {
    pub header: ModelHeader,
    pub mempools: Vec<MempoolDesc>,
    pub inputs: Vec<IoDesc>,
    pub outputs: Vec<IoDesc>,
    pub sections: Vec<SectionDescriptor>,
    data: Bytes,
}

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::InvalidBinary(format!(
            "Truncated {}: need {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

impl ModuleReader {
    /// Decode header and tables; section bodies stay in place
    pub fn parse(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let mut buf = data.clone();

        ensure(&buf, HEADER_SIZE, "header")?;
        let header = ModelHeader {
            identifier: buf.get_u32_le(),
            version: buf.get_u32_le(),
            header_size: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            alignment: buf.get_u32_le(),
            modules: buf.get_u32_le(),
            functions: buf.get_u32_le(),
            mempools: buf.get_u32_le(),
            inputs: buf.get_u32_le(),
            outputs: buf.get_u32_le(),
            sections: buf.get_u32_le(),
        };
        if header.identifier != MODEL_IDENTIFIER {
            return Err(Error::InvalidBinary(format!(
                "Bad identifier {:#010x}",
                header.identifier
            )));
        }
        if header.version != MODEL_VERSION {
            return Err(Error::InvalidBinary(format!("Unsupported version {}", header.version)));
        }
        if header.header_size as usize != HEADER_SIZE {
            return Err(Error::InvalidBinary(format!(
                "Unexpected header size {}",
                header.header_size
            )));
        }

        let mempool_capacity = (header.mempools as usize).min(buf.remaining() / MEMPOOL_DESC_SIZE);
        let mut mempools = Vec::with_capacity(mempool_capacity);
        for _ in 0..header.mempools {
            ensure(&buf, MEMPOOL_DESC_SIZE, "mempool table")?;
            let code = buf.get_u8();
            buf.advance(3);
            let location = MemoryLocation::from_code(code)
                .ok_or_else(|| Error::InvalidBinary(format!("Unknown memory location {}", code)))?;
            mempools.push(MempoolDesc {
                location,
                size: buf.get_u32_le(),
            });
        }

        let io_count = header
            .inputs
            .checked_add(header.outputs)
            .ok_or_else(|| Error::InvalidBinary("IO descriptor count overflows".to_string()))?;
        let mut io = Vec::with_capacity((io_count as usize).min(buf.remaining() / 12));
        for _ in 0..io_count {
            ensure(&buf, 12, "IO descriptor")?;
            let location_code = buf.get_u8();
            let type_code = buf.get_u8();
            let rank = buf.get_u16_le() as usize;
            let start = buf.get_u32_le();
            let size = buf.get_u32_le();
            ensure(&buf, rank * 4, "IO shape")?;
            let shape = (0..rank).map(|_| buf.get_u32_le()).collect();
            io.push(IoDesc {
                location: MemoryLocation::from_code(location_code)
                    .ok_or_else(|| {
                        Error::InvalidBinary(format!("Unknown memory location {}", location_code))
                    })?,
                data_type: DataType::from_code(type_code)
                    .ok_or_else(|| {
                        Error::InvalidBinary(format!("Unknown data type {}", type_code))
                    })?,
                start,
                size,
                shape,
            });
        }
        let outputs = io.split_off(header.inputs as usize);
        let inputs = io;

        let section_capacity = (header.sections as usize).min(buf.remaining() / SECTION_DESC_SIZE);
        let mut sections = Vec::with_capacity(section_capacity);
        for _ in 0..header.sections {
            ensure(&buf, SECTION_DESC_SIZE, "section table")?;
            let mut name = [0u8; SECTION_NAME_LEN];
            buf.copy_to_slice(&mut name);
            let len = name.iter().position(|&byte| byte == 0).unwrap_or(SECTION_NAME_LEN);
            let name = std::str::from_utf8(&name[..len])
                .map_err(|_| Error::InvalidBinary("Section name is not UTF-8".to_string()))?
                .to_string();
            let descriptor = SectionDescriptor {
                name,
                flags: buf.get_u32_le(),
                file_offset: buf.get_u32_le(),
                file_size: buf.get_u32_le(),
                memory_size: buf.get_u32_le(),
            };
            if descriptor.file_range().end > data.len() {
                return Err(Error::InvalidBinary(format!(
                    "Section {} extends past the end of the file",
                    descriptor.name
                )));
            }
            sections.push(descriptor);
        }

        Ok(Self {
            header,
            mempools,
            inputs,
            outputs,
            sections,
            data,
        })
    }

    pub fn section(&self, name: &str) -> Option<&SectionDescriptor> {
        self.sections.iter().find(|section| section.name == name)
    }

    /// File bytes of a section
    pub fn section_data(&self, name: &str) -> Result<&[u8]> {
        let descriptor = self
            .section(name)
            .ok_or_else(|| Error::InvalidSection(format!("No section named {}", name)))?;
        Ok(&self.data[descriptor.file_range()])
    }

    /// Reserved size of a location, zero when absent
    pub fn mempool_size(&self, location: MemoryLocation) -> u32 {
        self.mempools
            .iter()
            .find(|mempool| mempool.location == location)
            .map_or(0, |mempool| mempool.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_tables_round_trip() {
        let info = ModuleInfo {
            modules: 1,
            functions: 2,
            mempools: vec![MempoolDesc { location: MemoryLocation::Data, size: 96 }],
            inputs: vec![IoDesc {
                location: MemoryLocation::Input,
                data_type: DataType::Float32,
                start: 0,
                size: 24,
                shape: vec![2, 3],
            }],
            outputs: Vec::new(),
        };
        let text = [1u8, 2, 3];
        let rdata = [9u8; 10];
        let sections = [
            SectionImage { name: ".text", data: &text, alignment: 1, memory_size: 3 },
            SectionImage { name: ".rdata", data: &rdata, alignment: 16, memory_size: 10 },
        ];
        let merged = [MergedImage {
            name: ".rdata0",
            destination: 1,
            base: 4,
            size: 6,
            memory_size: 6,
        }];

        let (bytes, descriptors) = ModuleWriter::new(8).write(&info, &sections, &merged).unwrap();
        assert_eq!(descriptors[1].file_offset % 16, 0);

        let reader = ModuleReader::parse(bytes).unwrap();
        assert_eq!(reader.header.identifier, MODEL_IDENTIFIER);
        assert_eq!(reader.header.sections, 3);
        assert_eq!(reader.mempool_size(MemoryLocation::Data), 96);
        assert_eq!(reader.inputs, info.inputs);
        assert_eq!(reader.section_data(".text").unwrap(), &text);
        assert_eq!(reader.section_data(".rdata0").unwrap(), &[9u8; 6]);
        assert!(reader.section(".rdata0").unwrap().is_merged());
    }

    #[test]
    fn test_reader_rejects_garbage() {
        assert!(matches!(ModuleReader::parse(vec![0u8; 8]), Err(Error::InvalidBinary(_))));
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(b"ELF\0");
        assert!(ModuleReader::parse(bytes).is_err());
    }
}
