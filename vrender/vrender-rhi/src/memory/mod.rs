//! Device memory sub-allocation.
//!
//! A [`DeviceMemoryAllocator`] keeps, per memory type, a chain of large native
//! reservations ([`MemoryAllocation`]) and hands out [`MemoryBlock`] ranges inside
//! them. Buffers and images bind their native handle to a block and return it
//! on drop.

mod allocation;
mod allocator;

pub use allocation::MemoryAllocation;
pub use allocator::{DeviceMemoryAllocator, SharedAllocator};

/// Opaque native memory handle (a `VkDeviceMemory` on the Vulkan backend).
pub type MemoryHandle = u64;

bitflags::bitflags! {
    /// Memory property flags; bit values match the Vulkan definitions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
        const LAZILY_ALLOCATED = 1 << 4;
        const PROTECTED = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

/// Snapshot of the device's memory types and heaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

/// Returns the first memory type allowed by `type_filter` whose flags contain `required`.
pub fn find_memory_type(
    properties: &MemoryProperties,
    type_filter: u32,
    required: MemoryPropertyFlags,
) -> Option<u32> {
    properties
        .memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, ty)| type_filter & (1 << i) != 0 && ty.property_flags.contains(required))
        .map(|(i, _)| i as u32)
}

/// A sub-range `[offset, offset + size)` of one [`MemoryAllocation`].
///
/// Compared by value. `allocation` is the index of the owning link in its
/// memory type's chain, so the allocator can return the block without searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub size: u64,
    pub offset: u64,
    pub memory: MemoryHandle,
    pub type_index: u32,
    pub allocation: usize,
    pub free: bool,
}

impl MemoryBlock {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Round `value` up to a multiple of `alignment`; `None` if that overflows.
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> MemoryProperties {
        MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 1 << 30,
                    device_local: true,
                },
                MemoryHeap {
                    size: 1 << 28,
                    device_local: false,
                },
            ],
        }
    }

    #[test]
    fn find_memory_type_respects_filter_and_flags() {
        let props = properties();
        assert_eq!(
            find_memory_type(&props, 0b111, MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            find_memory_type(&props, 0b110, MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
        assert_eq!(
            find_memory_type(&props, 0b111, MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b001, MemoryPropertyFlags::HOST_COHERENT),
            None
        );
        assert_eq!(
            find_memory_type(&props, 0, MemoryPropertyFlags::empty()),
            None
        );
    }

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(257, 256), Some(512));
        assert_eq!(align_up(13, 1), Some(13));
        assert_eq!(align_up(u64::MAX, 256), None);
    }
}
