use {
    super::{FrameSlot, SyncError},
    crate::{
        config::MAX_FRAMES_IN_FLIGHT,
        device::{timeout_ns, GpuDevice, Submission},
    },
    ash::vk::{self, Handle},
    std::{sync::Arc, time::Duration},
};

struct SlotState {
    slot: FrameSlot,

    /// The slot's fence has been waited on and reset, but nothing has been
    /// submitted with it yet. Waiting on it again would never return.
    armed: bool,
}

/// Owns the fences and semaphores for every frame in flight.
pub struct SyncManager {
    slots: Vec<SlotState>,
    frame_index: u64,
    timeout: Duration,
    destroyed: bool,
    device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl SyncManager {
    /// Create synchronization objects for `frame_count` frames in flight.
    ///
    /// Every fence starts signaled so the first use of each slot does not
    /// wait. `timeout` bounds every fence wait.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        frame_count: usize,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frame_count) {
            return Err(SyncError::InvalidFrameCount(frame_count));
        }
        let mut manager = Self {
            slots: Vec::with_capacity(frame_count),
            frame_index: 0,
            timeout,
            destroyed: false,
            device,
        };
        for index in 0..frame_count {
            let slot = manager.create_slot(index)?;
            manager.slots.push(SlotState { slot, armed: false });
        }
        log::debug!("Created {} frames in flight", frame_count);
        Ok(manager)
    }

    /// The number of frames which may be in flight at once.
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    /// The number of completed frames. Only advanced by
    /// [SyncManager::advance].
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// The slot used by the current frame. Always 0 once the slots are
    /// destroyed.
    pub fn slot_index(&self) -> usize {
        match self.slots.len() as u64 {
            0 => 0,
            count => (self.frame_index % count) as usize,
        }
    }

    /// True once [SyncManager::destroy] has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Get the current frame's slot, ready for a new submission.
    ///
    /// Blocks until the work submitted the last time this slot was used has
    /// finished on the GPU, then resets the slot's fence. Fails with
    /// [SyncError::DeviceTimeout] when the wait exceeds the timeout.
    ///
    /// A slot acquired without a following submission (a skipped frame) is
    /// returned again immediately.
    pub fn acquire_frame_slot(&mut self) -> Result<FrameSlot, SyncError> {
        if self.destroyed {
            return Err(SyncError::Destroyed);
        }
        let index = self.slot_index();
        if self.slots[index].armed {
            return Ok(self.slots[index].slot);
        }

        self.wait_for_slot(index)?;
        let slot = self.slots[index].slot;
        self.device.reset_fence(slot.fence).map_err(|source| {
            SyncError::UnableToResetFence {
                slot: index,
                source,
            }
        })?;
        self.slots[index].armed = true;
        Ok(slot)
    }

    /// Submit command buffers with the slot's synchronization attached.
    ///
    /// The GPU waits for the slot's image-available semaphore before the
    /// color attachment output stage, signals the render-finished semaphore
    /// when the buffers complete, then signals the slot's fence.
    pub fn signal_on_submit(
        &mut self,
        slot: &FrameSlot,
        command_buffers: &[vk::CommandBuffer],
        queue_family: u32,
    ) -> Result<(), SyncError> {
        if self.destroyed {
            return Err(SyncError::Destroyed);
        }
        let current = self.slot_index();
        if slot.index != current || !self.slots[current].armed {
            return Err(SyncError::SlotOutOfOrder {
                submitted: slot.index,
                current,
            });
        }

        let submission = Submission {
            wait_semaphores: &[(
                slot.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            command_buffers,
            signal_semaphores: &[slot.render_finished],
            fence: slot.fence,
        };
        unsafe {
            self.device
                .queue_submit(queue_family, &submission)
                .map_err(|source| SyncError::UnableToSubmit {
                    slot: slot.index,
                    source,
                })?;
        }
        self.slots[current].armed = false;
        Ok(())
    }

    /// Move on to the next frame and its slot.
    pub fn advance(&mut self) {
        self.frame_index += 1;
    }

    /// Block until every submitted frame has finished on the GPU.
    ///
    /// It is an error to call this between submitting a slot's work and
    /// acquiring it again from another thread. There is no such thread here,
    /// but the wait is only meaningful when no new work is being submitted.
    pub fn wait_for_all_frames(&self) -> Result<(), SyncError> {
        for (index, state) in self.slots.iter().enumerate() {
            if !state.armed {
                self.wait_for_slot(index)?;
            }
        }
        Ok(())
    }

    /// Destroy every fence and semaphore.
    ///
    /// # Safety
    ///
    /// No pending GPU work may reference the slots. Call
    /// [SyncManager::wait_for_all_frames] first, or make sure the device is
    /// lost.
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let slots: Vec<SlotState> = self.slots.drain(..).collect();
        for state in &slots {
            self.destroy_slot(&state.slot);
        }
        self.destroyed = true;
    }
}

// Private API
// -----------

impl SyncManager {
    fn create_slot(&self, index: usize) -> Result<FrameSlot, SyncError> {
        let mut slot = FrameSlot {
            index,
            fence: vk::Fence::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
        };
        let created = unsafe {
            self.device
                .create_fence(true)
                .and_then(|fence| {
                    slot.fence = fence;
                    self.device.create_semaphore()
                })
                .and_then(|semaphore| {
                    slot.image_available = semaphore;
                    self.device.create_semaphore()
                })
                .map(|semaphore| slot.render_finished = semaphore)
        };
        if let Err(source) = created {
            unsafe { self.destroy_slot(&slot) };
            return Err(SyncError::UnableToCreateSyncObjects {
                slot: index,
                source,
            });
        }

        self.device.set_debug_name(
            vk::ObjectType::FENCE,
            slot.fence.as_raw(),
            &format!("Frame {} Fence", index),
        );
        self.device.set_debug_name(
            vk::ObjectType::SEMAPHORE,
            slot.image_available.as_raw(),
            &format!("Frame {} Swapchain Image Acquired", index),
        );
        self.device.set_debug_name(
            vk::ObjectType::SEMAPHORE,
            slot.render_finished.as_raw(),
            &format!("Frame {} Commands Completed", index),
        );
        Ok(slot)
    }

    unsafe fn destroy_slot(&self, slot: &FrameSlot) {
        if slot.fence != vk::Fence::null() {
            self.device.destroy_fence(slot.fence);
        }
        if slot.image_available != vk::Semaphore::null() {
            self.device.destroy_semaphore(slot.image_available);
        }
        if slot.render_finished != vk::Semaphore::null() {
            self.device.destroy_semaphore(slot.render_finished);
        }
    }

    fn wait_for_slot(&self, index: usize) -> Result<(), SyncError> {
        let fence = self.slots[index].slot.fence;
        match self.device.wait_for_fence(fence, timeout_ns(self.timeout)) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(SyncError::DeviceTimeout {
                slot: index,
                timeout: self.timeout,
            }),
            Err(source) => Err(SyncError::DeviceLost {
                slot: index,
                source,
            }),
        }
    }
}

impl Drop for SyncManager {
    /// # DANGER
    ///
    /// There is no internal synchronization for this type. Unexpected behavior
    /// can occur if a frame is still in flight when it is dropped.
    fn drop(&mut self) {
        unsafe { self.destroy() }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::device::HeadlessDevice,
        std::{
            sync::atomic::{AtomicBool, Ordering},
            thread,
        },
    };

    fn sync(
        frame_count: usize,
        timeout: Duration,
    ) -> (Arc<HeadlessDevice>, SyncManager) {
        let device = Arc::new(HeadlessDevice::builder().build());
        let sync =
            SyncManager::new(device.clone(), frame_count, timeout).unwrap();
        (device, sync)
    }

    /// Acquire the current slot, submit nothing with it, and advance.
    fn submit_frame(sync: &mut SyncManager) -> FrameSlot {
        let slot = sync.acquire_frame_slot().unwrap();
        sync.signal_on_submit(&slot, &[], 0).unwrap();
        sync.advance();
        slot
    }

    #[test]
    fn frame_count_is_validated() {
        let device: Arc<dyn GpuDevice> =
            Arc::new(HeadlessDevice::builder().build());

        for count in [0, 9] {
            let result =
                SyncManager::new(device.clone(), count, Duration::from_secs(1));
            assert!(matches!(result, Err(SyncError::InvalidFrameCount(_))));
        }
    }

    #[test]
    fn slots_are_used_round_robin() {
        let (device, mut sync) = sync(3, Duration::from_secs(1));

        let indices: Vec<usize> = (0..6)
            .map(|_| {
                let slot = submit_frame(&mut sync);
                device.complete_next_submission();
                slot.index()
            })
            .collect();

        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(sync.frame_index(), 6);
    }

    #[test]
    fn the_slot_after_n_frames_waits_for_the_oldest_frame() {
        let (device, mut sync) = sync(2, Duration::from_millis(20));
        submit_frame(&mut sync);
        submit_frame(&mut sync);

        let result = sync.acquire_frame_slot();

        assert!(matches!(
            result,
            Err(SyncError::DeviceTimeout { slot: 0, .. })
        ));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(device.pending_submissions(), 2);
    }

    #[test]
    fn acquire_blocks_until_the_oldest_frame_retires() {
        let (device, mut sync) = sync(2, Duration::from_secs(10));
        let slot_0 = submit_frame(&mut sync);
        submit_frame(&mut sync);

        let retired = Arc::new(AtomicBool::new(false));
        let retire_frame_0 = {
            let device = device.clone();
            let retired = retired.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                retired.store(true, Ordering::SeqCst);
                device.complete_next_submission();
            })
        };

        let slot = sync.acquire_frame_slot().unwrap();
        retire_frame_0.join().unwrap();

        assert!(retired.load(Ordering::SeqCst));
        assert_eq!(slot, slot_0);
        assert_eq!(device.pending_submissions(), 1);

        // slot 0 comes back reset and ready for the next submission
        assert!(!device.fence_status(slot.fence()).unwrap());
        sync.signal_on_submit(&slot, &[], 0).unwrap();
    }

    #[test]
    fn skipped_frames_reuse_the_armed_slot_without_waiting() {
        let (_device, mut sync) = sync(2, Duration::from_millis(20));

        let first = sync.acquire_frame_slot().unwrap();
        let second = sync.acquire_frame_slot().unwrap();

        assert_eq!(first, second);
        sync.wait_for_all_frames().unwrap();
    }

    #[test]
    fn submissions_must_use_the_current_slot() {
        let (_device, mut sync) = sync(2, Duration::from_millis(20));
        let slot = sync.acquire_frame_slot().unwrap();
        sync.advance();

        assert!(matches!(
            sync.signal_on_submit(&slot, &[], 0),
            Err(SyncError::SlotOutOfOrder {
                submitted: 0,
                current: 1
            })
        ));
    }

    #[test]
    fn wait_for_all_frames_covers_every_submitted_slot() {
        let (device, mut sync) = sync(3, Duration::from_millis(20));
        submit_frame(&mut sync);
        submit_frame(&mut sync);

        assert!(sync.wait_for_all_frames().is_err());

        device.complete_all_submissions();
        sync.wait_for_all_frames().unwrap();
    }

    #[test]
    fn device_loss_is_fatal() {
        let (device, mut sync) = sync(1, Duration::from_secs(1));
        submit_frame(&mut sync);
        device.lose_device();

        let err = sync.acquire_frame_slot().unwrap_err();

        assert!(matches!(err, SyncError::DeviceLost { slot: 0, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn destroy_releases_every_sync_object() {
        let (device, mut sync) = sync(3, Duration::from_secs(1));
        assert_eq!(device.live_fences(), 3);
        assert_eq!(device.live_semaphores(), 6);

        unsafe { sync.destroy() };

        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn every_sync_object_gets_its_own_debug_name() {
        let (device, mut sync) = sync(1, Duration::from_secs(1));
        let slot = sync.acquire_frame_slot().unwrap();

        let names: Vec<String> = [
            slot.fence().as_raw(),
            slot.image_available().as_raw(),
            slot.render_finished().as_raw(),
        ]
        .into_iter()
        .map(|raw| device.debug_name(raw).unwrap())
        .collect();

        assert_eq!(names[0], "Frame 0 Fence");
        assert_ne!(names[0], names[1]);
        assert_ne!(names[0], names[2]);
        assert_ne!(names[1], names[2]);
    }

    #[test]
    fn destroyed_slots_can_not_be_acquired() {
        let (_device, mut sync) = sync(2, Duration::from_secs(1));
        let slot = sync.acquire_frame_slot().unwrap();

        unsafe { sync.destroy() };

        assert!(sync.is_destroyed());
        assert_eq!(sync.slot_index(), 0);
        let err = sync.acquire_frame_slot().unwrap_err();
        assert!(matches!(err, SyncError::Destroyed));
        assert!(err.is_fatal());
        assert!(matches!(
            sync.signal_on_submit(&slot, &[], 0),
            Err(SyncError::Destroyed)
        ));
        assert!(sync.wait_for_all_frames().is_ok());
    }
}
