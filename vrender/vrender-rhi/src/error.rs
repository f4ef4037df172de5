//! Error type shared by every fallible RHI operation.

use crate::memory::MemoryPropertyFlags;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RhiError {
    /// A native API call returned a failure code.
    #[error("{operation} failed with native error code {code}")]
    Native { operation: &'static str, code: i32 },

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("no memory type in filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: MemoryPropertyFlags,
    },

    /// The device refused a new native memory reservation.
    #[error("out of device memory allocating {size} bytes from memory type {memory_type_index}")]
    OutOfDeviceMemory { size: u64, memory_type_index: u32 },

    /// A block handed back to the allocator is unknown or already free.
    #[error("memory block is not owned by this allocator or is already free")]
    InvalidBlock,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("window: {0}")]
    Window(String),
}

impl RhiError {
    pub fn native(operation: &'static str, code: i32) -> Self {
        Self::Native { operation, code }
    }
}
