use {
    super::{Frame, FrameError, FrameOutcome, FrameStatus},
    crate::{
        commands::{CommandError, CommandPoolManager},
        config::EngineConfig,
        device::{GpuDevice, QueueCapability},
        resources::ResourceCache,
        swapchain::{SwapchainCoordinator, SwapchainError, SwapchainState},
        sync::{SyncError, SyncManager},
    },
    ash::vk,
    std::sync::Arc,
};

/// Drives one frame at a time through acquire, record, submit, present, and
/// advance.
///
/// The orchestrator owns the frames in flight and the swapchain. The command
/// pools and the resource cache are passed in for each frame so that other
/// code can keep using them between frames.
pub struct FrameOrchestrator {
    sync: SyncManager,
    swapchain: SwapchainCoordinator,
    queue_family: u32,

    /// The frame index of the frame between begin_frame and end_frame.
    in_progress: Option<u64>,

    device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl FrameOrchestrator {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: &EngineConfig,
        surface_extent: vk::Extent2D,
    ) -> Result<Self, FrameError> {
        let queue_family = device
            .queue_family_index(QueueCapability::Graphics)
            .ok_or(CommandError::NoQueueFamily(QueueCapability::Graphics))?;
        let sync = SyncManager::new(
            device.clone(),
            config.max_frames_in_flight,
            config.fence_timeout(),
        )?;
        let swapchain = SwapchainCoordinator::new(
            device.clone(),
            surface_extent,
            config.present_mode,
            config.fence_timeout(),
        )?;
        Ok(Self {
            sync,
            swapchain,
            queue_family,
            in_progress: None,
            device,
        })
    }

    /// Start the next frame.
    ///
    /// Blocks until the frame slot's previous work retires, acquires a
    /// swapchain image, and begins the slot's command buffer. Returns
    /// [FrameStatus::Skipped] when the swapchain is stale and cannot be
    /// rebuilt yet. Stale swapchains are expected and are never errors.
    pub fn begin_frame(
        &mut self,
        commands: &mut CommandPoolManager,
        resources: &mut ResourceCache,
    ) -> Result<FrameStatus, FrameError> {
        if let Some(frame_index) = self.in_progress {
            return Err(FrameError::FrameInProgress(frame_index));
        }
        if self.sync.is_destroyed() {
            return Err(SyncError::Destroyed.into());
        }
        if self.swapchain.state() != SwapchainState::Valid {
            self.recreate_swapchain()?;
            if self.swapchain.state() != SwapchainState::Valid {
                return Ok(FrameStatus::Skipped);
            }
        }

        let slot = self.sync.acquire_frame_slot()?;

        // The fence was waited on and reset, so it no longer describes the
        // resources marked with it.
        resources.retire_fence(slot.fence());

        let image_index =
            match self.swapchain.acquire_image(slot.image_available()) {
                Ok(index) => index,
                Err(SwapchainError::SwapchainStale) => {
                    log::debug!(
                        "Skipping frame {}, the swapchain is stale",
                        self.sync.frame_index()
                    );
                    self.recreate_swapchain()?;
                    return Ok(FrameStatus::Skipped);
                }
                Err(err) => return Err(err.into()),
            };

        // The slot's fence has signaled so none of the pool's buffers are
        // pending.
        let pool = commands.get_frame_pool(self.queue_family, slot.index())?;
        unsafe { commands.reset_pool(pool)? };
        let command_buffer_handle = commands.allocate(pool)?;
        let command_buffer = commands.begin(command_buffer_handle)?;

        let frame_index = self.sync.frame_index();
        self.in_progress = Some(frame_index);
        Ok(FrameStatus::Acquired(Frame {
            slot,
            frame_index,
            image_index,
            command_buffer_handle,
            command_buffer,
            tracked: vec![],
        }))
    }

    /// Finish a frame started by [FrameOrchestrator::begin_frame].
    ///
    /// Ends the command buffer, submits it with the slot's semaphores and
    /// fence, marks every tracked resource in flight, queues the image for
    /// presentation, and advances to the next frame. The swapchain is rebuilt
    /// here when presentation reports it stale.
    pub fn end_frame(
        &mut self,
        frame: Frame,
        commands: &mut CommandPoolManager,
        resources: &mut ResourceCache,
    ) -> Result<(), FrameError> {
        if self.in_progress != Some(frame.frame_index) {
            return Err(FrameError::FrameMismatch {
                expected: self.in_progress,
                found: frame.frame_index,
            });
        }
        self.in_progress = None;

        commands.end(frame.command_buffer_handle)?;
        self.sync.signal_on_submit(
            &frame.slot,
            &[frame.command_buffer],
            self.queue_family,
        )?;
        commands
            .mark_submitted(frame.command_buffer_handle, frame.slot.fence())?;
        for &handle in &frame.tracked {
            resources.mark_in_flight(handle, frame.slot.fence())?;
        }

        let presented = self
            .swapchain
            .present(frame.image_index, &[frame.slot.render_finished()]);
        self.sync.advance();
        presented?;

        if self.swapchain.is_stale() {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Run one full frame, calling `record` to fill the command buffer.
    ///
    /// A failed recording is still submitted and presented so the frame slot
    /// and swapchain image are returned in a consistent state, then the error
    /// is returned as [FrameError::RecordingFailed].
    pub fn render_frame<Func>(
        &mut self,
        commands: &mut CommandPoolManager,
        resources: &mut ResourceCache,
        record: Func,
    ) -> Result<FrameOutcome, FrameError>
    where
        Func: FnOnce(
            &dyn GpuDevice,
            &mut Frame,
            &mut ResourceCache,
        ) -> anyhow::Result<()>,
    {
        let mut frame = match self.begin_frame(commands, resources)? {
            FrameStatus::Acquired(frame) => frame,
            FrameStatus::Skipped => return Ok(FrameOutcome::Skipped),
        };
        let frame_index = frame.frame_index;
        let image_index = frame.image_index;

        let device = self.device.clone();
        let recorded = record(device.as_ref(), &mut frame, resources);
        self.end_frame(frame, commands, resources)?;

        recorded.map_err(|source| FrameError::RecordingFailed {
            frame_index,
            source,
        })?;
        Ok(FrameOutcome::Presented {
            frame_index,
            image_index,
        })
    }

    /// Rebuild the swapchain for the surface's current size.
    ///
    /// Leaves the swapchain Stale when the surface has zero area.
    pub fn recreate_swapchain(&mut self) -> Result<(), FrameError> {
        let extent = self.swapchain.current_surface_extent()?;
        self.swapchain.recreate(extent, &self.sync)?;
        Ok(())
    }

    /// Forward a window resize. The swapchain is rebuilt at the start of the
    /// next frame.
    pub fn notify_resized(&mut self, extent: vk::Extent2D) {
        self.swapchain.notify_resized(extent);
    }

    /// Block until every submitted frame has retired.
    pub fn wait_for_all_frames(&self) -> Result<(), FrameError> {
        self.sync.wait_for_all_frames()?;
        Ok(())
    }

    /// The index of the next frame to be started.
    pub fn frame_index(&self) -> u64 {
        self.sync.frame_index()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frame_count()
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn swapchain(&self) -> &SwapchainCoordinator {
        &self.swapchain
    }

    /// Destroy the swapchain and every frame's synchronization objects.
    ///
    /// # Safety
    ///
    /// Every frame must have retired, or the device must be lost.
    pub unsafe fn destroy(&mut self) {
        self.swapchain.destroy();
        self.sync.destroy();
        self.in_progress = None;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::HeadlessDevice, resources::ResourceDescriptor,
        },
        std::time::Duration,
    };

    struct Harness {
        device: Arc<HeadlessDevice>,
        commands: CommandPoolManager,
        resources: ResourceCache,
        frames: FrameOrchestrator,
    }

    impl Harness {
        fn new(auto_complete: bool) -> Self {
            let device = Arc::new(
                HeadlessDevice::builder().auto_complete(auto_complete).build(),
            );
            let config = EngineConfig {
                fence_timeout_ms: 20,
                ..Default::default()
            };
            Self {
                commands: CommandPoolManager::new(
                    device.clone(),
                    config.command_pool_growth,
                    config.fence_timeout(),
                ),
                resources: ResourceCache::new(
                    device.clone(),
                    config.memory_block_size,
                ),
                frames: FrameOrchestrator::new(
                    device.clone(),
                    &config,
                    vk::Extent2D {
                        width: 800,
                        height: 600,
                    },
                )
                .unwrap(),
                device,
            }
        }

        fn render(&mut self) -> Result<FrameOutcome, FrameError> {
            self.frames.render_frame(
                &mut self.commands,
                &mut self.resources,
                |_, _, _| Ok(()),
            )
        }

        fn begin(&mut self) -> FrameStatus {
            self.frames
                .begin_frame(&mut self.commands, &mut self.resources)
                .unwrap()
        }

        fn end(&mut self, frame: Frame) -> Result<(), FrameError> {
            self.frames
                .end_frame(frame, &mut self.commands, &mut self.resources)
        }
    }

    fn acquired(status: FrameStatus) -> Frame {
        match status {
            FrameStatus::Acquired(frame) => frame,
            FrameStatus::Skipped => panic!("expected an acquired frame"),
        }
    }

    #[test]
    fn frames_are_submitted_and_presented_in_order() {
        let mut harness = Harness::new(true);

        let outcomes: Vec<FrameOutcome> =
            (0..5).map(|_| harness.render().unwrap()).collect();

        let frame_indices: Vec<u64> = outcomes
            .iter()
            .map(|outcome| match outcome {
                FrameOutcome::Presented { frame_index, .. } => *frame_index,
                FrameOutcome::Skipped => panic!("no frame should be skipped"),
            })
            .collect();
        assert_eq!(frame_indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(harness.frames.frame_index(), 5);
        assert_eq!(harness.device.submission_count(), 5);
        assert_eq!(harness.device.present_count(), 5);

        // one transient pool per frame slot
        assert_eq!(harness.commands.pool_count(), 2);
    }

    #[test]
    fn a_resized_surface_skips_one_frame_then_recovers() {
        let mut harness = Harness::new(true);
        harness.render().unwrap();
        harness.device.set_surface_extent(1024, 768);

        assert_eq!(harness.render().unwrap(), FrameOutcome::Skipped);
        assert_eq!(harness.frames.frame_index(), 1);
        assert_eq!(
            harness.frames.swapchain().extent(),
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );

        assert!(matches!(
            harness.render().unwrap(),
            FrameOutcome::Presented { frame_index: 1, .. }
        ));
    }

    #[test]
    fn minimized_windows_skip_frames_without_submitting() {
        let mut harness = Harness::new(true);
        harness.device.set_surface_extent(0, 0);
        harness.frames.notify_resized(vk::Extent2D::default());

        for _ in 0..3 {
            assert_eq!(harness.render().unwrap(), FrameOutcome::Skipped);
        }
        assert_eq!(harness.device.submission_count(), 0);
        assert_eq!(harness.frames.frame_index(), 0);

        harness.device.set_surface_extent(640, 480);
        harness.frames.notify_resized(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert!(matches!(
            harness.render().unwrap(),
            FrameOutcome::Presented { frame_index: 0, .. }
        ));
    }

    #[test]
    fn stale_presentation_rebuilds_the_swapchain_after_the_frame() {
        let mut harness = Harness::new(true);
        let frame = acquired(harness.begin());
        harness.device.set_surface_extent(320, 240);

        harness.end(frame).unwrap();

        assert_eq!(harness.frames.frame_index(), 1);
        assert_eq!(harness.device.present_count(), 0);
        assert_eq!(harness.frames.swapchain().state(), SwapchainState::Valid);
        assert_eq!(
            harness.frames.swapchain().extent(),
            vk::Extent2D {
                width: 320,
                height: 240
            }
        );
    }

    #[test]
    fn frames_in_flight_are_bounded() {
        let mut harness = Harness::new(false);
        harness.render().unwrap();
        harness.render().unwrap();

        let err = harness.render().unwrap_err();

        assert!(matches!(
            err,
            FrameError::Sync(SyncError::DeviceTimeout { slot: 0, .. })
        ));
        assert!(err.is_fatal());

        harness.device.complete_next_submission();
        assert!(matches!(
            harness.render().unwrap(),
            FrameOutcome::Presented { frame_index: 2, .. }
        ));
    }

    #[test]
    fn tracked_resources_stay_in_flight_until_the_frame_retires() {
        let mut harness = Harness::new(false);
        let uniforms = harness
            .resources
            .acquire(ResourceDescriptor::uniform_buffer(256))
            .unwrap();
        let mut frame = acquired(harness.begin());
        frame.track_resource(uniforms);
        frame.track_resource(uniforms);
        assert_eq!(frame.tracked_resources(), &[uniforms]);

        harness.end(frame).unwrap();

        assert!(harness.resources.is_in_use_by_gpu(uniforms).unwrap());
        assert!(harness.resources.write(uniforms, 0, &[1, 2, 3, 4]).is_err());

        harness.device.complete_all_submissions();
        assert!(!harness.resources.is_in_use_by_gpu(uniforms).unwrap());
        harness.resources.write(uniforms, 0, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn reused_slots_forget_retired_fences() {
        let mut harness = Harness::new(true);
        let uniforms = harness
            .resources
            .acquire(ResourceDescriptor::uniform_buffer(64))
            .unwrap();
        harness
            .frames
            .render_frame(
                &mut harness.commands,
                &mut harness.resources,
                |_, frame, _| {
                    frame.track_resource(uniforms);
                    Ok(())
                },
            )
            .unwrap();
        harness.render().unwrap();

        // slot 0 comes around again and its fence is reset
        let frame = acquired(harness.begin());

        assert_eq!(frame.slot().index(), 0);
        assert!(!harness.resources.is_in_use_by_gpu(uniforms).unwrap());
        harness.end(frame).unwrap();
    }

    #[test]
    fn failed_recordings_are_still_submitted() {
        let mut harness = Harness::new(true);

        let err = harness
            .frames
            .render_frame(
                &mut harness.commands,
                &mut harness.resources,
                |_, _, _| anyhow::bail!("no pipeline"),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FrameError::RecordingFailed { frame_index: 0, .. }
        ));
        assert!(!err.is_fatal());
        assert_eq!(harness.device.present_count(), 1);
        harness.render().unwrap();
    }

    #[test]
    fn frames_must_be_ended_before_the_next_begins() {
        let mut harness = Harness::new(true);
        let frame = acquired(harness.begin());

        let err = harness
            .frames
            .begin_frame(&mut harness.commands, &mut harness.resources)
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameInProgress(0)));

        harness.end(frame).unwrap();
    }

    #[test]
    fn the_command_buffer_is_recording_between_begin_and_end() {
        let mut harness = Harness::new(true);
        let frame = acquired(harness.begin());

        let handle = frame.command_buffer_handle();
        assert_eq!(
            harness.commands.recording_buffer(handle).unwrap(),
            frame.command_buffer()
        );
        harness.end(frame).unwrap();

        assert_eq!(
            harness.commands.state(handle),
            crate::commands::CommandBufferState::Submitted
        );
    }

    #[test]
    fn losing_the_surface_is_fatal() {
        let mut harness = Harness::new(true);
        harness.device.lose_surface();

        let err = harness.render().unwrap_err();

        assert!(matches!(
            err,
            FrameError::Swapchain(SwapchainError::SurfaceLost(_))
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn recreation_waits_with_the_configured_timeout() {
        let mut harness = Harness::new(false);
        harness.render().unwrap();
        harness.device.set_surface_extent(100, 100);

        let started = std::time::Instant::now();
        let err = harness.render().unwrap_err();

        assert!(matches!(
            err,
            FrameError::Swapchain(SwapchainError::FramesInFlight(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn destroyed_orchestrators_refuse_new_frames() {
        let mut harness = Harness::new(true);
        harness.render().unwrap();
        unsafe { harness.frames.destroy() };
        assert_eq!(harness.device.live_swapchains(), 0);

        let err = harness.render().unwrap_err();

        assert!(matches!(err, FrameError::Sync(SyncError::Destroyed)));
        assert!(err.is_fatal());
        assert_eq!(harness.device.live_swapchains(), 0);
    }
}
