use {
    super::{
        one_time_submit::OneTimeSubmit, CommandBufferHandle,
        CommandBufferState, CommandError, CommandPoolStats, PoolId, PoolKey,
        Transience,
    },
    crate::device::{GpuDevice, QueueCapability},
    ash::vk::{self, Handle},
    std::{collections::HashMap, sync::Arc, time::Duration},
};

struct ManagedBuffer {
    raw: vk::CommandBuffer,
    state: CommandBufferState,

    /// The fence of the submission which last used this buffer.
    fence: vk::Fence,
}

struct ManagedPool {
    key: PoolKey,
    raw: vk::CommandPool,
    generation: u64,
    buffers: Vec<ManagedBuffer>,

    /// `buffers[..issued]` have been handed out since the last reset.
    issued: usize,

    recording: Option<u32>,
}

impl ManagedPool {
    fn handle(&self, id: PoolId, index: u32) -> CommandBufferHandle {
        CommandBufferHandle {
            pool: id,
            index,
            generation: self.generation,
        }
    }

    fn is_current(&self, handle: &CommandBufferHandle) -> bool {
        handle.generation == self.generation
            && (handle.index as usize) < self.issued
    }
}

/// Owns every command pool and tracks the state of every command buffer
/// allocated from them.
pub struct CommandPoolManager {
    pools: Vec<ManagedPool>,
    pools_by_key: HashMap<PoolKey, PoolId>,
    growth: u32,
    pub(super) fence_timeout: Duration,
    pub(super) one_time: HashMap<u32, OneTimeSubmit>,
    destroyed: bool,
    pub(super) device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl CommandPoolManager {
    /// Create a manager which grows pools `growth` buffers at a time.
    ///
    /// `fence_timeout` bounds the wait in
    /// [CommandPoolManager::submit_one_time].
    pub fn new(
        device: Arc<dyn GpuDevice>,
        growth: u32,
        fence_timeout: Duration,
    ) -> Self {
        Self {
            pools: vec![],
            pools_by_key: HashMap::new(),
            growth: growth.max(1),
            fence_timeout,
            one_time: HashMap::new(),
            destroyed: false,
            device,
        }
    }

    /// The queue family which accepts the given kind of work.
    pub fn queue_family(
        &self,
        capability: QueueCapability,
    ) -> Result<u32, CommandError> {
        self.device
            .queue_family_index(capability)
            .ok_or(CommandError::NoQueueFamily(capability))
    }

    /// Get the pool for a queue family and transience, creating it on first
    /// use.
    pub fn get_pool(
        &mut self,
        queue_family: u32,
        transience: Transience,
    ) -> Result<PoolId, CommandError> {
        self.get_or_create_pool(PoolKey {
            queue_family,
            transience,
            frame_slot: None,
        })
    }

    /// Get the transient pool owned by a single frame slot.
    ///
    /// Each slot has its own pool so that resetting one slot's pool never
    /// invalidates command buffers still in flight for another slot.
    pub fn get_frame_pool(
        &mut self,
        queue_family: u32,
        frame_slot: usize,
    ) -> Result<PoolId, CommandError> {
        self.get_or_create_pool(PoolKey {
            queue_family,
            transience: Transience::Transient,
            frame_slot: Some(frame_slot),
        })
    }

    pub fn pool_key(&self, pool: PoolId) -> Result<PoolKey, CommandError> {
        Ok(self.pool(pool)?.key)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn stats(&self) -> CommandPoolStats {
        let mut stats = CommandPoolStats {
            pools: self.pools.len(),
            ..CommandPoolStats::default()
        };
        for pool in &self.pools {
            stats.issued += pool.issued;
            stats.reclaimed += pool.buffers.len() - pool.issued;
            stats.total_buffers += pool.buffers.len();
        }
        stats
    }

    /// Issue a command buffer in the Initial state.
    ///
    /// Buffers reclaimed by the last pool reset are reused first. When none
    /// are left the pool grows by the configured increment. Fails with
    /// [CommandError::PoolExhausted] only when the device allocation fails.
    pub fn allocate(
        &mut self,
        pool: PoolId,
    ) -> Result<CommandBufferHandle, CommandError> {
        let growth = self.growth;
        let device = self.device.clone();
        let managed = self.pool_mut(pool)?;

        if managed.issued == managed.buffers.len() {
            let raw_buffers = unsafe {
                device
                    .allocate_command_buffers(
                        managed.raw,
                        vk::CommandBufferLevel::PRIMARY,
                        growth,
                    )
                    .map_err(|source| CommandError::PoolExhausted {
                        pool,
                        source,
                    })?
            };
            log::debug!(
                "Grew command pool {:?} ({:?}) to {} buffers",
                pool,
                managed.key.transience,
                managed.buffers.len() + raw_buffers.len()
            );
            for raw in raw_buffers {
                device.set_debug_name(
                    vk::ObjectType::COMMAND_BUFFER,
                    raw.as_raw(),
                    &format!(
                        "Pool {} Command Buffer {}",
                        pool.0,
                        managed.buffers.len()
                    ),
                );
                managed.buffers.push(ManagedBuffer {
                    raw,
                    state: CommandBufferState::Initial,
                    fence: vk::Fence::null(),
                });
            }
        }

        let index = managed.issued;
        managed.issued += 1;
        let buffer = &mut managed.buffers[index];
        buffer.state = CommandBufferState::Initial;
        buffer.fence = vk::Fence::null();
        Ok(managed.handle(pool, index as u32))
    }

    /// The current state of a command buffer.
    ///
    /// Handles from before the last pool reset, and handles from destroyed
    /// pools, are [CommandBufferState::Invalid].
    pub fn state(&self, buffer: CommandBufferHandle) -> CommandBufferState {
        match self.pool(buffer.pool) {
            Ok(pool) if pool.is_current(&buffer) => {
                pool.buffers[buffer.index as usize].state
            }
            _ => CommandBufferState::Invalid,
        }
    }

    /// The raw Vulkan handle for a buffer which has not been invalidated.
    pub fn raw(
        &self,
        buffer: CommandBufferHandle,
    ) -> Result<vk::CommandBuffer, CommandError> {
        let pool = self.pool(buffer.pool)?;
        if !pool.is_current(&buffer) {
            return Err(CommandError::InvalidState {
                buffer,
                expected: CommandBufferState::Initial,
                found: CommandBufferState::Invalid,
            });
        }
        Ok(pool.buffers[buffer.index as usize].raw)
    }

    /// The raw Vulkan handle for a buffer which is being recorded. This is
    /// the only way to get a buffer to record commands into.
    pub fn recording_buffer(
        &self,
        buffer: CommandBufferHandle,
    ) -> Result<vk::CommandBuffer, CommandError> {
        let found = self.state(buffer);
        if found != CommandBufferState::Recording {
            return Err(CommandError::InvalidState {
                buffer,
                expected: CommandBufferState::Recording,
                found,
            });
        }
        self.raw(buffer)
    }

    /// Initial -> Recording. Returns the raw buffer to record into.
    ///
    /// A per-frame pool can only record one buffer at a time.
    pub fn begin(
        &mut self,
        buffer: CommandBufferHandle,
    ) -> Result<vk::CommandBuffer, CommandError> {
        let device = self.device.clone();
        let pool = self.pool_mut(buffer.pool)?;
        if pool.key.frame_slot.is_some() {
            if let Some(index) = pool.recording {
                if index != buffer.index && pool.is_current(&buffer) {
                    return Err(CommandError::AlreadyRecording {
                        pool: buffer.pool,
                        recording: pool.handle(buffer.pool, index),
                    });
                }
            }
        }
        let flags = match pool.key.transience {
            Transience::Transient => {
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
            }
            Transience::Reusable => vk::CommandBufferUsageFlags::empty(),
        };

        let managed =
            Self::checked(pool, buffer, CommandBufferState::Initial)?;
        let raw = managed.raw;
        unsafe {
            device.begin_command_buffer(raw, flags).map_err(|source| {
                CommandError::UnableToBeginCommandBuffer { buffer, source }
            })?;
        }
        managed.state = CommandBufferState::Recording;
        pool.recording = Some(buffer.index);
        Ok(raw)
    }

    /// Recording -> Executable.
    pub fn end(
        &mut self,
        buffer: CommandBufferHandle,
    ) -> Result<(), CommandError> {
        let device = self.device.clone();
        let pool = self.pool_mut(buffer.pool)?;
        let managed =
            Self::checked(pool, buffer, CommandBufferState::Recording)?;
        unsafe {
            device.end_command_buffer(managed.raw).map_err(|source| {
                CommandError::UnableToEndCommandBuffer { buffer, source }
            })?;
        }
        managed.state = CommandBufferState::Executable;
        pool.recording = None;
        Ok(())
    }

    /// Executable -> Submitted. `fence` is the fence of the submission which
    /// carries the buffer. Pass a null fence for unfenced submissions.
    pub fn mark_submitted(
        &mut self,
        buffer: CommandBufferHandle,
        fence: vk::Fence,
    ) -> Result<(), CommandError> {
        let pool = self.pool_mut(buffer.pool)?;
        let managed =
            Self::checked(pool, buffer, CommandBufferState::Executable)?;
        managed.state = CommandBufferState::Submitted;
        managed.fence = fence;
        Ok(())
    }

    /// Return a single buffer from a reusable pool to the Initial state.
    ///
    /// Fails with [CommandError::InvalidState] when the buffer is Submitted
    /// and its fence has not signaled.
    pub fn reset_buffer(
        &mut self,
        buffer: CommandBufferHandle,
    ) -> Result<(), CommandError> {
        let device = self.device.clone();
        let pool = self.pool_mut(buffer.pool)?;
        if pool.key.transience == Transience::Transient {
            return Err(CommandError::IndividualResetNotAllowed(buffer));
        }
        if !pool.is_current(&buffer) {
            return Err(CommandError::InvalidState {
                buffer,
                expected: CommandBufferState::Executable,
                found: CommandBufferState::Invalid,
            });
        }

        let managed = &mut pool.buffers[buffer.index as usize];
        if managed.state == CommandBufferState::Submitted {
            let completed = managed.fence != vk::Fence::null()
                && device.fence_status(managed.fence).map_err(|source| {
                    CommandError::UnableToResetBuffer { buffer, source }
                })?;
            if !completed {
                return Err(CommandError::InvalidState {
                    buffer,
                    expected: CommandBufferState::Executable,
                    found: CommandBufferState::Submitted,
                });
            }
        }

        unsafe {
            device.reset_command_buffer(managed.raw).map_err(|source| {
                CommandError::UnableToResetBuffer { buffer, source }
            })?;
        }
        managed.state = CommandBufferState::Initial;
        managed.fence = vk::Fence::null();
        if pool.recording == Some(buffer.index) {
            pool.recording = None;
        }
        Ok(())
    }

    /// Reclaim every buffer allocated from the pool at once.
    ///
    /// Every handle issued before the reset becomes Invalid. Reclaimed buffers
    /// are reused by later calls to [CommandPoolManager::allocate].
    ///
    /// # Safety
    ///
    /// No buffer allocated from the pool may still be pending execution on the
    /// GPU. For per-frame pools this holds once the frame slot's fence has
    /// been waited on.
    pub unsafe fn reset_pool(&mut self, pool: PoolId) -> Result<(), CommandError> {
        let device = self.device.clone();
        let managed = self.pool_mut(pool)?;
        device
            .reset_command_pool(managed.raw)
            .map_err(|source| CommandError::UnableToResetPool { pool, source })?;
        managed.generation += 1;
        managed.issued = 0;
        managed.recording = None;
        Ok(())
    }

    /// Return unused pool memory to the system.
    pub fn trim_pool(&mut self, pool: PoolId) -> Result<(), CommandError> {
        let device = self.device.clone();
        let managed = self.pool_mut(pool)?;
        unsafe { device.trim_command_pool(managed.raw) };
        Ok(())
    }

    /// Destroy every pool and the one-time submission fences.
    ///
    /// # Safety
    ///
    /// No command buffer issued by this manager may be pending execution.
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for (_, one_time) in self.one_time.drain() {
            self.device.destroy_fence(one_time.fence);
        }
        for pool in self.pools.drain(..) {
            self.device.destroy_command_pool(pool.raw);
        }
        self.pools_by_key.clear();
        self.destroyed = true;
        log::debug!("Destroyed all command pools");
    }
}

// Private API
// -----------

impl CommandPoolManager {
    fn get_or_create_pool(
        &mut self,
        key: PoolKey,
    ) -> Result<PoolId, CommandError> {
        if self.destroyed {
            return Err(CommandError::Destroyed);
        }
        if let Some(id) = self.pools_by_key.get(&key) {
            return Ok(*id);
        }

        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(key.queue_family)
            .flags(key.transience.pool_flags());
        let raw = unsafe {
            self.device.create_command_pool(&create_info).map_err(|source| {
                CommandError::UnableToCreatePool {
                    queue_family: key.queue_family,
                    source,
                }
            })?
        };
        let id = PoolId(self.pools.len());
        let name = match key.frame_slot {
            Some(slot) => format!("Frame {} Command Pool", slot),
            None => format!(
                "{:?} Command Pool (queue family {})",
                key.transience, key.queue_family
            ),
        };
        self.device.set_debug_name(
            vk::ObjectType::COMMAND_POOL,
            raw.as_raw(),
            &name,
        );
        log::debug!("Created {} as {:?}", name, id);

        self.pools.push(ManagedPool {
            key,
            raw,
            generation: 0,
            buffers: vec![],
            issued: 0,
            recording: None,
        });
        self.pools_by_key.insert(key, id);
        Ok(id)
    }

    fn pool(&self, id: PoolId) -> Result<&ManagedPool, CommandError> {
        if self.destroyed {
            return Err(CommandError::Destroyed);
        }
        self.pools.get(id.0).ok_or(CommandError::UnknownPool(id))
    }

    fn pool_mut(&mut self, id: PoolId) -> Result<&mut ManagedPool, CommandError> {
        if self.destroyed {
            return Err(CommandError::Destroyed);
        }
        self.pools.get_mut(id.0).ok_or(CommandError::UnknownPool(id))
    }

    /// The buffer behind a handle, provided it is current and in the expected
    /// state.
    fn checked(
        pool: &mut ManagedPool,
        buffer: CommandBufferHandle,
        expected: CommandBufferState,
    ) -> Result<&mut ManagedBuffer, CommandError> {
        if !pool.is_current(&buffer) {
            return Err(CommandError::InvalidState {
                buffer,
                expected,
                found: CommandBufferState::Invalid,
            });
        }
        let managed = &mut pool.buffers[buffer.index as usize];
        if managed.state != expected {
            return Err(CommandError::InvalidState {
                buffer,
                expected,
                found: managed.state,
            });
        }
        Ok(managed)
    }
}

impl Drop for CommandPoolManager {
    /// # DANGER
    ///
    /// There is no internal synchronization for this type. Unexpected behavior
    /// can occur if any command buffer is still pending when it is dropped.
    fn drop(&mut self) {
        unsafe { self.destroy() }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::device::{HeadlessDevice, Submission},
    };

    fn manager(growth: u32) -> (Arc<HeadlessDevice>, CommandPoolManager) {
        let device = Arc::new(HeadlessDevice::builder().build());
        let manager = CommandPoolManager::new(
            device.clone(),
            growth,
            Duration::from_millis(50),
        );
        (device, manager)
    }

    #[test]
    fn pools_are_created_once_per_key() {
        let (device, mut manager) = manager(4);

        let transient = manager.get_pool(0, Transience::Transient).unwrap();
        let again = manager.get_pool(0, Transience::Transient).unwrap();
        let reusable = manager.get_pool(0, Transience::Reusable).unwrap();
        let frame_0 = manager.get_frame_pool(0, 0).unwrap();
        let frame_1 = manager.get_frame_pool(0, 1).unwrap();

        assert_eq!(transient, again);
        assert_ne!(transient, reusable);
        assert_ne!(transient, frame_0);
        assert_ne!(frame_0, frame_1);
        assert_eq!(manager.pool_count(), 4);
        assert_eq!(device.live_command_pools(), 4);
        assert_eq!(manager.pool_key(frame_1).unwrap().frame_slot, Some(1));
    }

    #[test]
    fn buffers_follow_the_state_machine() {
        let (_device, mut manager) = manager(4);
        let pool = manager.get_pool(0, Transience::Reusable).unwrap();
        let buffer = manager.allocate(pool).unwrap();

        assert_eq!(manager.state(buffer), CommandBufferState::Initial);
        assert!(matches!(
            manager.end(buffer),
            Err(CommandError::InvalidState {
                expected: CommandBufferState::Recording,
                found: CommandBufferState::Initial,
                ..
            })
        ));

        let raw = manager.begin(buffer).unwrap();
        assert_eq!(manager.recording_buffer(buffer).unwrap(), raw);
        manager.end(buffer).unwrap();
        assert_eq!(manager.state(buffer), CommandBufferState::Executable);
        assert!(manager.recording_buffer(buffer).is_err());

        manager.mark_submitted(buffer, vk::Fence::null()).unwrap();
        assert_eq!(manager.state(buffer), CommandBufferState::Submitted);
    }

    #[test]
    fn reset_pool_invalidates_every_issued_buffer() {
        let (_device, mut manager) = manager(4);
        let pool = manager.get_pool(0, Transience::Transient).unwrap();
        let first = manager.allocate(pool).unwrap();
        let second = manager.allocate(pool).unwrap();
        let first_raw = manager.begin(first).unwrap();

        unsafe { manager.reset_pool(pool).unwrap() };

        assert_eq!(manager.state(first), CommandBufferState::Invalid);
        assert_eq!(manager.state(second), CommandBufferState::Invalid);
        assert!(matches!(
            manager.recording_buffer(first),
            Err(CommandError::InvalidState {
                found: CommandBufferState::Invalid,
                ..
            })
        ));
        assert!(matches!(
            manager.begin(second),
            Err(CommandError::InvalidState {
                found: CommandBufferState::Invalid,
                ..
            })
        ));

        assert_eq!(
            manager.stats(),
            CommandPoolStats {
                pools: 1,
                issued: 0,
                reclaimed: 4,
                total_buffers: 4,
            }
        );

        // reclaimed buffers are reissued under new handles
        let reissued = manager.allocate(pool).unwrap();
        assert_ne!(reissued, first);
        assert_eq!(manager.raw(reissued).unwrap(), first_raw);
        assert_eq!(manager.state(reissued), CommandBufferState::Initial);
    }

    #[test]
    fn pools_grow_by_the_configured_increment() {
        let (_device, mut manager) = manager(2);
        let pool = manager.get_pool(0, Transience::Transient).unwrap();

        let raw: Vec<vk::CommandBuffer> = (0..5)
            .map(|_| {
                let buffer = manager.allocate(pool).unwrap();
                manager.raw(buffer).unwrap()
            })
            .collect();

        let mut unique = raw.clone();
        unique.sort_by_key(|buffer| buffer.as_raw());
        unique.dedup();
        assert_eq!(unique.len(), 5);
        assert_eq!(
            manager.stats(),
            CommandPoolStats {
                pools: 1,
                issued: 5,
                reclaimed: 1,
                total_buffers: 6,
            }
        );
    }

    #[test]
    fn reset_buffer_refuses_unfinished_submissions() {
        let (device, mut manager) = manager(1);
        let pool = manager.get_pool(0, Transience::Reusable).unwrap();
        let buffer = manager.allocate(pool).unwrap();
        let raw = manager.begin(buffer).unwrap();
        manager.end(buffer).unwrap();

        let fence = unsafe { device.create_fence(false).unwrap() };
        unsafe {
            device
                .queue_submit(
                    0,
                    &Submission {
                        command_buffers: &[raw],
                        fence,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        manager.mark_submitted(buffer, fence).unwrap();

        assert!(matches!(
            manager.reset_buffer(buffer),
            Err(CommandError::InvalidState {
                found: CommandBufferState::Submitted,
                ..
            })
        ));

        device.complete_next_submission();
        manager.reset_buffer(buffer).unwrap();
        assert_eq!(manager.state(buffer), CommandBufferState::Initial);
        unsafe { device.destroy_fence(fence) };
    }

    #[test]
    fn unfenced_submissions_can_never_be_reset_individually() {
        let (_device, mut manager) = manager(1);
        let pool = manager.get_pool(0, Transience::Reusable).unwrap();
        let buffer = manager.allocate(pool).unwrap();
        manager.begin(buffer).unwrap();
        manager.end(buffer).unwrap();
        manager.mark_submitted(buffer, vk::Fence::null()).unwrap();

        assert!(matches!(
            manager.reset_buffer(buffer),
            Err(CommandError::InvalidState { .. })
        ));
    }

    #[test]
    fn transient_buffers_are_only_reset_with_their_pool() {
        let (_device, mut manager) = manager(1);
        let pool = manager.get_pool(0, Transience::Transient).unwrap();
        let buffer = manager.allocate(pool).unwrap();

        assert!(matches!(
            manager.reset_buffer(buffer),
            Err(CommandError::IndividualResetNotAllowed(_))
        ));
    }

    #[test]
    fn frame_pools_record_one_buffer_at_a_time() {
        let (_device, mut manager) = manager(2);
        let pool = manager.get_frame_pool(0, 0).unwrap();
        let first = manager.allocate(pool).unwrap();
        let second = manager.allocate(pool).unwrap();
        manager.begin(first).unwrap();

        assert!(matches!(
            manager.begin(second),
            Err(CommandError::AlreadyRecording { recording, .. })
                if recording == first
        ));

        manager.end(first).unwrap();
        manager.begin(second).unwrap();
    }

    #[test]
    fn failed_device_allocation_is_pool_exhausted() {
        let (device, mut manager) = manager(4);
        let pool = manager.get_pool(0, Transience::Transient).unwrap();
        device.fail_command_buffer_allocations(true);

        assert!(matches!(
            manager.allocate(pool),
            Err(CommandError::PoolExhausted { .. })
        ));

        device.fail_command_buffer_allocations(false);
        manager.allocate(pool).unwrap();
    }

    #[test]
    fn destroy_releases_every_pool() {
        let (device, mut manager) = manager(4);
        let pool = manager.get_pool(0, Transience::Transient).unwrap();
        let buffer = manager.allocate(pool).unwrap();
        manager.trim_pool(pool).unwrap();

        unsafe { manager.destroy() };

        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(manager.state(buffer), CommandBufferState::Invalid);
        assert!(matches!(
            manager.get_pool(0, Transience::Transient),
            Err(CommandError::Destroyed)
        ));
    }
}
