use {
    super::{
        align_up, find_memory_type, AllocatorError, AllocatorStats, BlockId,
        MemoryBlock, MemoryClass, Suballocation, SuballocationId,
    },
    crate::device::GpuDevice,
    ash::vk,
    std::{collections::HashMap, sync::Arc},
};

/// Allocates device memory in fixed-size chunks and suballocates linearly.
pub struct MemoryAllocator {
    blocks: Vec<MemoryBlock>,
    block_size: vk::DeviceSize,
    next_block_id: u32,
    next_suballocation_id: u64,
    device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl MemoryAllocator {
    /// Create an allocator which requests `block_size` bytes at a time from
    /// the device.
    pub fn new(device: Arc<dyn GpuDevice>, block_size: vk::DeviceSize) -> Self {
        Self {
            blocks: vec![],
            block_size,
            next_block_id: 0,
            next_suballocation_id: 0,
            device,
        }
    }

    /// The default size of new blocks.
    pub fn block_size(&self) -> vk::DeviceSize {
        self.block_size
    }

    /// The memory type used for a resource with the given requirements and
    /// required properties.
    pub fn memory_type_for(
        &self,
        requirements: &vk::MemoryRequirements,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, AllocatorError> {
        find_memory_type(
            self.device.memory_properties(),
            requirements.memory_type_bits,
            required,
        )
    }

    /// Request a new block of device memory.
    ///
    /// Fails with [AllocatorError::OutOfDeviceMemory] when the device cannot
    /// provide the memory.
    pub fn allocate_block(
        &mut self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<BlockId, AllocatorError> {
        let memory = unsafe {
            self.device
                .allocate_memory(memory_type_index, size)
                .map_err(|source| AllocatorError::OutOfDeviceMemory {
                    size,
                    source,
                })?
        };
        let flags = self.device.memory_properties().memory_types
            [memory_type_index as usize]
            .property_flags;
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.device.set_debug_name(
            vk::ObjectType::DEVICE_MEMORY,
            vk::Handle::as_raw(memory),
            &format!("Memory Block {}", id.0),
        );

        let class = MemoryClass::from_flags(flags);
        log::debug!(
            "Allocated {:?} block {:?}: {} bytes of memory type {}",
            class,
            id,
            size,
            memory_type_index
        );
        self.blocks.push(MemoryBlock {
            id,
            memory,
            size,
            memory_type_index,
            class,
            current_offset: 0,
            live: HashMap::new(),
            mapped_ptr: None,
        });
        Ok(id)
    }

    /// Carve `size` bytes out of the end of a block.
    ///
    /// Fails with [AllocatorError::BlockExhausted] when the aligned request
    /// does not fit in what is left of the block. The caller should request a
    /// new block.
    pub fn suballocate(
        &mut self,
        block: BlockId,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<Suballocation, AllocatorError> {
        let id = SuballocationId(self.next_suballocation_id);
        let memory_block = self
            .blocks
            .iter_mut()
            .find(|memory_block| memory_block.id == block)
            .ok_or(AllocatorError::UnknownBlock(block))?;

        let offset = align_up(memory_block.current_offset, alignment);
        let fits = offset
            .checked_add(size)
            .is_some_and(|end| end <= memory_block.size);
        if !fits {
            return Err(AllocatorError::BlockExhausted {
                block,
                size,
                alignment,
            });
        }

        memory_block.current_offset = offset + size;
        memory_block.live.insert(id, size);
        self.next_suballocation_id += 1;

        Ok(Suballocation {
            id,
            block,
            memory: memory_block.memory,
            offset,
            size,
            memory_type_index: memory_block.memory_type_index,
        })
    }

    /// Find memory for a resource.
    ///
    /// Every existing block of the selected memory type is tried first. When
    /// they are all exhausted a new block is allocated. Requests larger than
    /// the block size get a dedicated block of exactly the requested size.
    pub fn allocate(
        &mut self,
        requirements: &vk::MemoryRequirements,
        required: vk::MemoryPropertyFlags,
    ) -> Result<Suballocation, AllocatorError> {
        let memory_type_index = self.memory_type_for(requirements, required)?;

        let candidates: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|block| block.memory_type_index == memory_type_index)
            .map(|block| block.id)
            .collect();
        for block in candidates {
            match self.suballocate(
                block,
                requirements.size,
                requirements.alignment,
            ) {
                Ok(suballocation) => return Ok(suballocation),
                Err(AllocatorError::BlockExhausted { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        let block_size = self
            .block_size
            .max(align_up(requirements.size, requirements.alignment));
        let block = self.allocate_block(block_size, memory_type_index)?;
        self.suballocate(block, requirements.size, requirements.alignment)
    }

    /// Release a suballocation. The owning block goes back to the device once
    /// its last suballocation is released.
    ///
    /// # Safety
    ///
    /// No GPU work may still reference the suballocation's memory.
    pub unsafe fn release(
        &mut self,
        suballocation: &Suballocation,
    ) -> Result<(), AllocatorError> {
        let index = self
            .blocks
            .iter()
            .position(|block| block.id == suballocation.block)
            .ok_or(AllocatorError::UnknownBlock(suballocation.block))?;
        if self.blocks[index].live.remove(&suballocation.id).is_none() {
            return Err(AllocatorError::UnknownSuballocation(suballocation.id));
        }
        if self.blocks[index].live.is_empty() {
            let block = self.blocks.swap_remove(index);
            self.free_block(block);
        }
        Ok(())
    }

    /// A host pointer to the start of a suballocation.
    ///
    /// The owning block is mapped once, in full, the first time any of its
    /// suballocations is mapped and stays mapped until it is freed.
    pub fn mapped_ptr(
        &mut self,
        suballocation: &Suballocation,
    ) -> Result<*mut u8, AllocatorError> {
        let block = self
            .blocks
            .iter_mut()
            .find(|block| block.id == suballocation.block)
            .ok_or(AllocatorError::UnknownBlock(suballocation.block))?;
        if !block.class.is_host_visible() {
            return Err(AllocatorError::MemoryNotHostVisible(
                block.memory_type_index,
            ));
        }
        let base = match block.mapped_ptr {
            Some(ptr) => ptr,
            None => {
                let ptr = unsafe {
                    self.device.map_memory(block.memory).map_err(|source| {
                        AllocatorError::UnableToMapMemory {
                            block: block.id,
                            source,
                        }
                    })?
                };
                block.mapped_ptr = Some(ptr);
                ptr
            }
        };
        Ok(unsafe { (base as *mut u8).add(suballocation.offset as usize) })
    }

    /// Make host writes to a suballocation visible to the device. A no-op for
    /// host coherent memory.
    pub fn flush(
        &self,
        suballocation: &Suballocation,
    ) -> Result<(), AllocatorError> {
        let block = self
            .block(suballocation.block)
            .ok_or(AllocatorError::UnknownBlock(suballocation.block))?;
        let flags = self.device.memory_properties().memory_types
            [block.memory_type_index as usize]
            .property_flags;
        if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            || block.mapped_ptr.is_none()
        {
            return Ok(());
        }
        // Ranges must be aligned to nonCoherentAtomSize, flushing the whole
        // mapping sidesteps the query.
        unsafe {
            self.device
                .flush_memory(block.memory, 0, vk::WHOLE_SIZE)
                .map_err(|source| AllocatorError::UnableToFlushMemory {
                    block: block.id,
                    source,
                })
        }
    }

    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn stats(&self) -> AllocatorStats {
        self.blocks
            .iter()
            .fold(AllocatorStats::default(), |mut stats, block| {
                stats.block_count += 1;
                stats.bytes_reserved += block.size;
                stats.bytes_in_use += block.live.values().sum::<u64>();
                stats.live_suballocations += block.live.len();
                stats
            })
    }

    /// Return every block to the device.
    ///
    /// # Safety
    ///
    /// No GPU work may reference any memory owned by this allocator.
    pub unsafe fn destroy_all(&mut self) {
        let blocks: Vec<MemoryBlock> = self.blocks.drain(..).collect();
        for block in blocks {
            if !block.live.is_empty() {
                log::warn!(
                    "Freeing block {:?} with {} live suballocations",
                    block.id,
                    block.live.len()
                );
            }
            self.free_block(block);
        }
    }
}

// Private API
// -----------

impl MemoryAllocator {
    fn free_block(&mut self, block: MemoryBlock) {
        unsafe {
            if block.mapped_ptr.is_some() {
                self.device.unmap_memory(block.memory);
            }
            self.device.free_memory(block.memory);
        }
        log::debug!(
            "Freed {:?} block {:?} ({} bytes)",
            block.class,
            block.id,
            block.size
        );
    }
}

impl Drop for MemoryAllocator {
    /// # DANGER
    ///
    /// There is no internal synchronization for this type. Unexpected behavior
    /// can occur if the GPU still uses any of the memory when it is dropped.
    fn drop(&mut self) {
        unsafe { self.destroy_all() }
    }
}

impl std::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks)
            .finish()
    }
}
