use {
    crate::{
        commands::CommandPoolManager,
        config::EngineConfig,
        device::GpuDevice,
        frame::{
            Frame, FrameError, FrameOrchestrator, FrameOutcome, FrameStatus,
        },
        resources::{
            ResourceCache, ResourceDescriptor, ResourceError, ResourceHandle,
        },
        sync::SyncError,
    },
    anyhow::{Context, Result},
    ash::vk,
    std::sync::Arc,
};

/// Owns every subsystem for one device and tears them down in order.
///
/// Nothing here is global. Code which needs GPU resources or per-frame work
/// borrows the context, or the individual subsystems through its accessors.
pub struct GpuContext {
    frames: FrameOrchestrator,
    commands: CommandPoolManager,
    resources: ResourceCache,
    shut_down: bool,
    device: Arc<dyn GpuDevice>,
}

impl GpuContext {
    /// Build every subsystem for a surface of the given size.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: &EngineConfig,
        surface_extent: vk::Extent2D,
    ) -> Result<Self> {
        config.validate().context("Invalid engine config")?;
        let frames =
            FrameOrchestrator::new(device.clone(), config, surface_extent)
                .context("Unable to create the frame orchestrator")?;
        let commands = CommandPoolManager::new(
            device.clone(),
            config.command_pool_growth,
            config.fence_timeout(),
        );
        let resources =
            ResourceCache::new(device.clone(), config.memory_block_size);
        log::info!(
            "Created GPU context with {} frames in flight",
            config.max_frames_in_flight
        );
        Ok(Self {
            frames,
            commands,
            resources,
            shut_down: false,
            device,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn frames(&self) -> &FrameOrchestrator {
        &self.frames
    }

    pub fn resources(&self) -> &ResourceCache {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceCache {
        &mut self.resources
    }

    pub fn commands(&self) -> &CommandPoolManager {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandPoolManager {
        &mut self.commands
    }

    pub fn acquire_resource(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        self.resources.acquire(descriptor)
    }

    pub fn release_resource(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<(), ResourceError> {
        self.resources.release(handle)
    }

    /// Fill a leased buffer, staging the bytes when the buffer is device
    /// local.
    pub fn upload(
        &mut self,
        handle: ResourceHandle,
        bytes: &[u8],
    ) -> Result<(), ResourceError> {
        if self.shut_down {
            return Err(ResourceError::CacheDestroyed);
        }
        self.resources.upload(handle, bytes, &mut self.commands)
    }

    pub fn begin_frame(&mut self) -> Result<FrameStatus, FrameError> {
        self.ensure_running()?;
        self.frames
            .begin_frame(&mut self.commands, &mut self.resources)
    }

    pub fn end_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.ensure_running()?;
        self.frames
            .end_frame(frame, &mut self.commands, &mut self.resources)
    }

    /// See [FrameOrchestrator::render_frame].
    pub fn render_frame<Func>(
        &mut self,
        record: Func,
    ) -> Result<FrameOutcome, FrameError>
    where
        Func: FnOnce(
            &dyn GpuDevice,
            &mut Frame,
            &mut ResourceCache,
        ) -> anyhow::Result<()>,
    {
        self.ensure_running()?;
        self.frames
            .render_frame(&mut self.commands, &mut self.resources, record)
    }

    pub fn notify_resized(&mut self, extent: vk::Extent2D) {
        self.frames.notify_resized(extent);
    }

    /// Wait for the GPU, then destroy the swapchain, frames, command pools,
    /// and every resource.
    ///
    /// Once every frame retires the device is waited on until idle, which
    /// also covers one-time submissions that timed out. Work which cannot
    /// finish because the device is lost or hung is abandoned with a warning
    /// so shutdown can still finish. Calling this more than once does
    /// nothing.
    pub fn shutdown(&mut self) -> Result<(), FrameError> {
        if self.shut_down {
            return Ok(());
        }

        match self.frames.wait_for_all_frames() {
            Ok(()) => {
                if let Err(err) = self.device.wait_idle() {
                    log::warn!(
                        "Abandoning GPU work at shutdown, the device did not \
                        go idle: {}",
                        err
                    );
                }
            }
            Err(err) if err.is_fatal() => {
                log::warn!("Abandoning frames in flight at shutdown: {}", err);
            }
            Err(err) => return Err(err),
        }
        self.shut_down = true;

        // SAFE because the device is idle, or it is lost or hung and its
        // pending work is abandoned.
        unsafe {
            self.frames.destroy();
            self.commands.destroy();
            self.resources.destroy_all()?;
        }
        log::info!("GPU context shut down");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), FrameError> {
        if self.shut_down {
            Err(SyncError::Destroyed.into())
        } else {
            Ok(())
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Error while shutting down the GPU context: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::device::HeadlessDevice};

    fn context(device: &Arc<HeadlessDevice>) -> GpuContext {
        let config = EngineConfig {
            fence_timeout_ms: 20,
            ..Default::default()
        };
        GpuContext::new(
            device.clone(),
            &config,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
        .unwrap()
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let config = EngineConfig {
            max_frames_in_flight: 0,
            ..Default::default()
        };

        let result = GpuContext::new(device, &config, vk::Extent2D::default());

        assert!(result.is_err());
    }

    #[test]
    fn shutdown_releases_everything() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        let mut gpu = context(&device);
        let vertices = gpu
            .acquire_resource(ResourceDescriptor::vertex_buffer(1024))
            .unwrap();
        gpu.upload(vertices, &[7; 1024]).unwrap();
        gpu.render_frame(|_, frame, _| {
            frame.track_resource(vertices);
            Ok(())
        })
        .unwrap();

        gpu.shutdown().unwrap();

        assert_eq!(device.live_memory_allocations(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_image_views(), 0);

        // a second shutdown is a no-op
        gpu.shutdown().unwrap();
    }

    #[test]
    fn shutdown_abandons_frames_on_a_lost_device() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let mut gpu = context(&device);
        gpu.render_frame(|_, _, _| Ok(())).unwrap();
        device.lose_device();

        gpu.shutdown().unwrap();

        assert_eq!(device.live_memory_allocations(), 0);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn shutdown_abandons_frames_which_never_retire() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let mut gpu = context(&device);
        gpu.render_frame(|_, _, _| Ok(())).unwrap();

        gpu.shutdown().unwrap();

        assert_eq!(device.pending_submissions(), 1);
        assert_eq!(device.live_command_pools(), 0);
    }

    #[test]
    fn dropping_the_context_shuts_it_down() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        {
            let mut gpu = context(&device);
            gpu.acquire_resource(ResourceDescriptor::uniform_buffer(256))
                .unwrap();
            gpu.render_frame(|_, _, _| Ok(())).unwrap();
        }

        assert_eq!(device.live_memory_allocations(), 0);
        assert_eq!(device.live_swapchains(), 0);
    }

    #[test]
    fn shutdown_waits_for_timed_out_uploads() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let mut gpu = context(&device);
        let vertices = gpu
            .acquire_resource(ResourceDescriptor::vertex_buffer(16))
            .unwrap();
        assert!(gpu.upload(vertices, &[3; 16]).is_err());
        assert_eq!(device.pending_submissions(), 1);

        gpu.shutdown().unwrap();

        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn frames_are_refused_after_shutdown() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        let mut gpu = context(&device);
        let vertices = gpu
            .acquire_resource(ResourceDescriptor::vertex_buffer(16))
            .unwrap();
        gpu.render_frame(|_, _, _| Ok(())).unwrap();
        gpu.shutdown().unwrap();

        let err = gpu.render_frame(|_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, FrameError::Sync(SyncError::Destroyed)));
        assert!(err.is_fatal());
        assert!(matches!(
            gpu.begin_frame(),
            Err(FrameError::Sync(SyncError::Destroyed))
        ));
        assert!(matches!(
            gpu.upload(vertices, &[1; 16]),
            Err(ResourceError::CacheDestroyed)
        ));
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.submission_count(), 1);
    }
}
