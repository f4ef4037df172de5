use super::{MemoryBlock, MemoryHandle};
use crate::{MemoryDevice, RhiError};
use std::ptr::NonNull;
use std::sync::Arc;

/// Host address of a persistently mapped reservation.
struct Mapping(NonNull<u8>);

// SAFETY: the pointer is only written through `MemoryAllocation::write`,
// into the range of one allocated block, while the reservation is alive.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// One native memory reservation of a single memory type, carved into blocks.
///
/// Blocks are kept in insertion order. Freed blocks are merged with free
/// neighbours, so the free list never holds two address-adjacent free blocks.
pub struct MemoryAllocation {
    device: Arc<dyn MemoryDevice>,
    memory: MemoryHandle,
    size: u64,
    type_index: u32,
    link: usize,
    allocated_size: u64,
    blocks: Vec<MemoryBlock>,
    mapping: Option<Mapping>,
}

impl MemoryAllocation {
    /// Reserve `size` bytes of memory type `type_index`. `link` is this
    /// allocation's position in its memory type's chain. Host-visible
    /// reservations are mapped once here and stay mapped until drop.
    pub fn new(
        device: Arc<dyn MemoryDevice>,
        size: u64,
        type_index: u32,
        link: usize,
        host_visible: bool,
    ) -> Result<Self, RhiError> {
        let memory = device.allocate_memory(size, type_index).map_err(|e| {
            log::error!(
                "Unable to allocate {} bytes of memory type {}: {}",
                size,
                type_index,
                e
            );
            e
        })?;
        let initial = MemoryBlock {
            size,
            offset: 0,
            memory,
            type_index,
            allocation: link,
            free: true,
        };
        let mapping = if host_visible {
            match device.map_memory(memory, size) {
                Ok(ptr) => Some(Mapping(ptr)),
                Err(e) => {
                    log::error!("Unable to map memory type {}: {}", type_index, e);
                    device.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Self {
            device,
            memory,
            size,
            type_index,
            link,
            allocated_size: 0,
            blocks: vec![initial],
            mapping,
        })
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Copy `data` to `offset` bytes into `block`, which must be allocated
    /// from this reservation.
    pub fn write(&self, block: &MemoryBlock, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        let Some(mapping) = &self.mapping else {
            return Err(RhiError::Unsupported(format!(
                "memory type {} is not host-visible",
                self.type_index
            )));
        };
        if !self.blocks.iter().any(|b| b == block && !b.free) {
            return Err(RhiError::InvalidBlock);
        }
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > block.size) {
            return Err(RhiError::Unsupported(format!(
                "write of {} bytes at offset {} overruns a {} byte block",
                data.len(),
                offset,
                block.size
            )));
        }
        // SAFETY: the range lies inside `block`, which lies inside the mapping.
        unsafe {
            let dst = mapping.0.as_ptr().add((block.offset + offset) as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn link(&self) -> usize {
        self.link
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn remaining_size(&self) -> u64 {
        self.size - self.allocated_size
    }

    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// First-fit search over the free blocks. Alignment padding is only cut
    /// off a block once it is known to fit, and the padding stays behind as
    /// its own free block.
    pub fn allocate_block(&mut self, size: u64, alignment: u64) -> Option<MemoryBlock> {
        if size == 0 || size > self.size {
            return None;
        }
        let alignment = alignment.max(1);
        let (index, padding) = self.blocks.iter().enumerate().find_map(|(i, block)| {
            if !block.free {
                return None;
            }
            let padding = (alignment - block.offset % alignment) % alignment;
            let needed = size.checked_add(padding)?;
            (needed <= block.size).then_some((i, padding))
        })?;

        let mut index = index;
        if padding > 0 {
            let lead_in = &mut self.blocks[index];
            let rest = MemoryBlock {
                size: lead_in.size - padding,
                offset: lead_in.offset + padding,
                ..*lead_in
            };
            lead_in.size = padding;
            self.blocks.push(rest);
            index = self.blocks.len() - 1;
        }

        let block = &mut self.blocks[index];
        let remainder = (block.size > size).then(|| MemoryBlock {
            size: block.size - size,
            offset: block.offset + size,
            ..*block
        });
        block.size = size;
        block.free = false;
        let allocated = *block;
        if let Some(remainder) = remainder {
            self.blocks.push(remainder);
        }
        self.allocated_size += size;
        Some(allocated)
    }

    /// Mark `block` free and merge it with address-adjacent free blocks.
    /// Returns `false` when no allocated block equal to `block` exists.
    pub fn free_block(&mut self, block: &MemoryBlock) -> bool {
        let Some(index) = self.blocks.iter().position(|b| b == block && !b.free) else {
            return false;
        };
        self.blocks[index].free = true;
        self.allocated_size -= block.size;
        self.coalesce(index);
        true
    }

    fn coalesce(&mut self, mut index: usize) {
        let end = self.blocks[index].end();
        if let Some(next) = self.blocks.iter().position(|b| b.free && b.offset == end) {
            self.blocks[index].size += self.blocks[next].size;
            self.blocks.remove(next);
            if next < index {
                index -= 1;
            }
        }
        let start = self.blocks[index].offset;
        if let Some(prev) = self
            .blocks
            .iter()
            .position(|b| b.free && b.end() == start)
        {
            self.blocks[prev].size += self.blocks[index].size;
            self.blocks.remove(index);
        }
    }
}

impl std::fmt::Debug for MemoryAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocation")
            .field("type_index", &self.type_index)
            .field("link", &self.link)
            .field("size", &self.size)
            .field("allocated_size", &self.allocated_size)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl Drop for MemoryAllocation {
    fn drop(&mut self) {
        if self.mapping.take().is_some() {
            self.device.unmap_memory(self.memory);
        }
        self.device.free_memory(self.memory);
    }
}
