use std::collections::HashMap;

use log::trace;

use crate::error::{Error, Result};
use crate::schedule::buffer::{MemoryLocation, MemorySpan, PhysicalBuffer, PhysicalId};
use crate::target::options::{AllocatorConfig, AllocatorKind};

/// Round `offset` up to a multiple of `alignment`
pub fn align_up(offset: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    (offset + alignment - 1) / alignment * alignment
}

/// Places physical buffers of one memory location
///
/// Buffers are marked in ascending birth order. After the last `mark` the
/// scheduler calls `finish` and then reads back placements and peak usage.
pub trait BufferAllocator: Send {
    /// Place a buffer
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()>;

    /// Signal that no more buffers will be marked
    fn finish(&mut self) -> Result<()>;

    /// Peak number of bytes in use
    fn max_usage(&self) -> usize;

    /// Placement of a marked buffer
    fn allocation_of(&self, buffer: PhysicalId) -> Option<MemorySpan>;
}

/// Bump allocator: every buffer gets fresh space
pub struct LinearAllocator {
    location: MemoryLocation,
    capacity: Option<usize>,
    top: usize,
    allocations: HashMap<PhysicalId, MemorySpan>,
    finished: bool,
}

impl LinearAllocator {
    /// Create a new linear allocator
    pub fn new(location: MemoryLocation, capacity: Option<usize>) -> Self {
        Self {
            location,
            capacity,
            top: 0,
            allocations: HashMap::new(),
            finished: false,
        }
    }
}

impl BufferAllocator for LinearAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        if self.finished {
            return Err(Error::AllocatorError(format!(
                "Linear allocator for {} already finished",
                self.location
            )));
        }

        let start = align_up(self.top, buffer.alignment);
        let end = start.checked_add(buffer.size_bytes).ok_or_else(|| {
            Error::AllocatorError("Integer overflow calculating end offset".to_string())
        })?;

        if let Some(capacity) = self.capacity {
            if end > capacity {
                return Err(Error::OutOfMemory {
                    location: self.location,
                    requested: buffer.size_bytes,
                    available: capacity.saturating_sub(start),
                });
            }
        }

        trace!("{}: {} placed at [{}, {})", self.location, buffer.id, start, end);
        self.allocations
            .insert(buffer.id, MemorySpan::new(start, buffer.size_bytes));
        self.top = end;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn max_usage(&self) -> usize {
        self.top
    }

    fn allocation_of(&self, buffer: PhysicalId) -> Option<MemorySpan> {
        self.allocations.get(&buffer).copied()
    }
}

/// A placement that is still live
#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    span: MemorySpan,
    /// First step at which the block may be reused
    end: usize,
}

/// Lifetime-aware allocator that reuses space of expired buffers
///
/// Each buffer goes into the smallest free gap between live blocks that fits
/// it; when no gap fits it is placed after the highest live block.
pub struct BestFitAllocator {
    location: MemoryLocation,
    capacity: Option<usize>,
    granularity: usize,
    /// Live blocks sorted by start offset
    live: Vec<LiveBlock>,
    allocations: HashMap<PhysicalId, MemorySpan>,
    max_usage: usize,
    last_birth: usize,
    finished: bool,
}

impl BestFitAllocator {
    /// Create a new best-fit allocator
    pub fn new(location: MemoryLocation, capacity: Option<usize>) -> Self {
        Self::with_granularity(location, capacity, 1)
    }

    /// Create a best-fit allocator that hands out whole units of `granularity` bytes
    pub fn with_granularity(
        location: MemoryLocation,
        capacity: Option<usize>,
        granularity: usize,
    ) -> Self {
        Self {
            location,
            capacity,
            granularity: granularity.max(1),
            live: Vec::new(),
            allocations: HashMap::new(),
            max_usage: 0,
            last_birth: 0,
            finished: false,
        }
    }

    /// Release blocks whose lifetime ended at or before `step`
    fn expire(&mut self, step: usize) {
        self.live.retain(|block| block.end > step);
    }

    fn live_bytes(&self) -> usize {
        self.live.iter().map(|block| block.span.size).sum()
    }

    /// Pick the start offset for a block of `size` bytes
    fn find_offset(&self, size: usize, alignment: usize) -> usize {
        let mut best: Option<(usize, usize)> = None;
        let mut cursor = 0;

        for block in &self.live {
            let start = align_up(cursor, alignment);
            if start + size <= block.span.start {
                let slack = block.span.start - start - size;
                if best.map_or(true, |(best_slack, _)| slack < best_slack) {
                    best = Some((slack, start));
                }
            }
            cursor = cursor.max(block.span.end());
        }

        match best {
            Some((_, start)) => start,
            None => align_up(cursor, alignment),
        }
    }
}

impl BufferAllocator for BestFitAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        if self.finished {
            return Err(Error::AllocatorError(format!(
                "Best-fit allocator for {} already finished",
                self.location
            )));
        }
        if buffer.lifetime.birth < self.last_birth {
            return Err(Error::AllocatorError(format!(
                "{} marked out of birth order ({} after {})",
                buffer.id, buffer.lifetime.birth, self.last_birth
            )));
        }
        self.last_birth = buffer.lifetime.birth;
        self.expire(buffer.lifetime.birth);

        let size = align_up(buffer.size_bytes, self.granularity);
        let alignment = buffer.alignment.max(self.granularity);
        let start = self.find_offset(size, alignment);
        let end = start.checked_add(size).ok_or_else(|| {
            Error::AllocatorError("Integer overflow calculating end offset".to_string())
        })?;

        if let Some(capacity) = self.capacity {
            if end > capacity {
                return Err(Error::OutOfMemory {
                    location: self.location,
                    requested: size,
                    available: capacity.saturating_sub(self.live_bytes()),
                });
            }
        }

        trace!(
            "{}: {} placed at [{}, {}) live until step {}",
            self.location,
            buffer.id,
            start,
            end,
            buffer.lifetime.end()
        );

        let span = MemorySpan::new(start, size);
        if size > 0 {
            let position = self.live.partition_point(|block| block.span.start <= start);
            self.live.insert(
                position,
                LiveBlock {
                    span,
                    end: buffer.lifetime.end(),
                },
            );
        }
        self.allocations.insert(buffer.id, span);
        self.max_usage = self.max_usage.max(end);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.live.clear();
        self.finished = true;
        Ok(())
    }

    fn max_usage(&self) -> usize {
        self.max_usage
    }

    fn allocation_of(&self, buffer: PhysicalId) -> Option<MemorySpan> {
        self.allocations.get(&buffer).copied()
    }
}

/// Allocator for device-local memory organised in fixed-size rows
pub struct DeviceAllocator {
    inner: BestFitAllocator,
}

impl DeviceAllocator {
    pub fn new(location: MemoryLocation, granularity: usize, capacity: Option<usize>) -> Self {
        Self {
            inner: BestFitAllocator::with_granularity(location, capacity, granularity),
        }
    }

    /// Row size in bytes
    pub fn granularity(&self) -> usize {
        self.inner.granularity
    }
}

impl BufferAllocator for DeviceAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        self.inner.mark(buffer)
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }

    fn max_usage(&self) -> usize {
        self.inner.max_usage()
    }

    fn allocation_of(&self, buffer: PhysicalId) -> Option<MemorySpan> {
        self.inner.allocation_of(buffer)
    }
}

/// Create an allocator for a memory location from its configuration
pub fn create_allocator(
    location: MemoryLocation,
    config: &AllocatorConfig,
) -> Result<Box<dyn BufferAllocator>> {
    let allocator: Box<dyn BufferAllocator> = match config.kind {
        AllocatorKind::Linear => Box::new(LinearAllocator::new(location, config.capacity)),
        AllocatorKind::BestFit => Box::new(BestFitAllocator::new(location, config.capacity)),
        AllocatorKind::Device { granularity } => {
            if granularity == 0 {
                return Err(Error::AllocatorError(format!(
                    "Device allocator for {} needs a non-zero granularity",
                    location
                )));
            }
            Box::new(DeviceAllocator::new(location, granularity, config.capacity))
        }
    };
    Ok(allocator)
}
