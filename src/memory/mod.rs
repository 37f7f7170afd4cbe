//! Device memory blocks and linear suballocation.
//!
//! Memory is requested from the device in large fixed-size chunks
//! ([MemoryBlock]s) and carved into [Suballocation]s front to back. Blocks are
//! never compacted; a block goes back to the device when its last
//! suballocation is released or when the allocator is torn down.

mod allocator;
mod memory_type;

use {ash::vk, std::ffi::c_void, thiserror::Error};

pub use self::{
    allocator::MemoryAllocator,
    memory_type::{find_memory_type, MemoryClass},
};

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error(
        "No device memory type satisfies {:?} for type bits {:#b}",
        .required,
        .type_bits
    )]
    NoSuitableMemoryType {
        required: vk::MemoryPropertyFlags,
        type_bits: u32,
    },

    #[error("The device is out of memory for a {} byte block", .size)]
    OutOfDeviceMemory {
        size: vk::DeviceSize,
        #[source]
        source: vk::Result,
    },

    #[error(
        "Block {:?} cannot fit {} bytes with alignment {}",
        .block,
        .size,
        .alignment
    )]
    BlockExhausted {
        block: BlockId,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    },

    #[error("Block {:?} is not owned by this allocator", .0)]
    UnknownBlock(BlockId),

    #[error("Suballocation {:?} is not live", .0)]
    UnknownSuballocation(SuballocationId),

    #[error("Unable to map memory block {:?}", .block)]
    UnableToMapMemory {
        block: BlockId,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to flush memory block {:?}", .block)]
    UnableToFlushMemory {
        block: BlockId,
        #[source]
        source: vk::Result,
    },

    #[error("Memory type {} is not host visible", .0)]
    MemoryNotHostVisible(u32),
}

/// Identifies a [MemoryBlock] within its allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

/// Identifies a live suballocation within its block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuballocationId(u64);

/// A contiguous piece of device memory owned by the [MemoryAllocator].
#[derive(Debug)]
pub struct MemoryBlock {
    id: BlockId,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    class: MemoryClass,

    /// The first unused byte. Everything before it has been handed out.
    current_offset: vk::DeviceSize,

    /// Live suballocations and their sizes.
    live: std::collections::HashMap<SuballocationId, vk::DeviceSize>,

    mapped_ptr: Option<*mut c_void>,
}

// Safety: the mapped pointer is only dereferenced through the allocator, which
// requires `&mut self`.
unsafe impl Send for MemoryBlock {}

/// A region of a [MemoryBlock] bound to a single resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Suballocation {
    pub id: SuballocationId,
    pub block: BlockId,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
}

/// A snapshot of allocator usage.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub block_count: usize,
    pub bytes_reserved: vk::DeviceSize,
    pub bytes_in_use: vk::DeviceSize,
    pub live_suballocations: usize,
}

impl MemoryBlock {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// The offset where the next suballocation would start before alignment.
    pub fn current_offset(&self) -> vk::DeviceSize {
        self.current_offset
    }

    pub fn live_suballocations(&self) -> usize {
        self.live.len()
    }

    /// Bytes left at the end of the block.
    pub fn remaining(&self) -> vk::DeviceSize {
        self.size - self.current_offset
    }
}

/// Round `value` up to the next multiple of `alignment`. An alignment of 0 or
/// 1 leaves the value unchanged.
pub(crate) fn align_up(
    value: vk::DeviceSize,
    alignment: vk::DeviceSize,
) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}
