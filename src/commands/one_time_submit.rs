use {
    super::{
        CommandBufferHandle, CommandBufferState, CommandError,
        CommandPoolManager, Transience,
    },
    crate::device::{timeout_ns, GpuDevice, QueueCapability, Submission},
    ash::vk::{self, Handle},
};

/// The reusable command buffer and fence used for synchronous submissions on
/// a single queue family.
#[derive(Debug, Copy, Clone)]
pub(super) struct OneTimeSubmit {
    pub(super) buffer: CommandBufferHandle,
    pub(super) fence: vk::Fence,
}

impl CommandPoolManager {
    /// Record and submit commands, then block until they complete.
    ///
    /// Meant for setup work like buffer uploads. The buffer is recorded by
    /// `func`, submitted with a private fence, and reset once the fence
    /// signals, so it can be used again by the next call.
    ///
    /// A buffer left behind by a failed call is reset first. If that call
    /// timed out and its commands are still running this fails with
    /// [CommandError::InvalidState].
    pub fn submit_one_time<Func, T>(
        &mut self,
        capability: QueueCapability,
        func: Func,
    ) -> Result<T, CommandError>
    where
        Func: FnOnce(&dyn GpuDevice, vk::CommandBuffer) -> anyhow::Result<T>,
    {
        let queue_family = self.queue_family(capability)?;
        let OneTimeSubmit { buffer, fence } =
            self.one_time_submit_for(queue_family)?;

        if self.state(buffer) != CommandBufferState::Initial {
            self.reset_buffer(buffer)?;
        }
        let raw = self.begin(buffer)?;
        let result = match func(self.device.as_ref(), raw) {
            Ok(result) => result,
            Err(err) => {
                self.reset_buffer(buffer)?;
                return Err(CommandError::RecordingFailed(err));
            }
        };
        self.end(buffer)?;

        self.device
            .reset_fence(fence)
            .map_err(CommandError::UnableToResetFence)?;
        unsafe {
            self.device
                .queue_submit(
                    queue_family,
                    &Submission {
                        command_buffers: &[raw],
                        fence,
                        ..Default::default()
                    },
                )
                .map_err(CommandError::UnableToSubmit)?;
        }
        self.mark_submitted(buffer, fence)?;

        match self
            .device
            .wait_for_fence(fence, timeout_ns(self.fence_timeout))
        {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(CommandError::SubmissionTimeout(self.fence_timeout))
            }
            Err(err) => return Err(CommandError::UnableToWaitForSubmission(err)),
        }
        self.reset_buffer(buffer)?;

        Ok(result)
    }

    /// The fence of the last one-time submission on `capability`'s queue if
    /// its commands may still be running on the GPU.
    ///
    /// Only set after [CommandPoolManager::submit_one_time] gave up waiting.
    pub fn pending_one_time_fence(
        &self,
        capability: QueueCapability,
    ) -> Option<vk::Fence> {
        let queue_family = self.queue_family(capability).ok()?;
        let one_time = self.one_time.get(&queue_family)?;
        match self.state(one_time.buffer) {
            CommandBufferState::Submitted => Some(one_time.fence),
            _ => None,
        }
    }

    fn one_time_submit_for(
        &mut self,
        queue_family: u32,
    ) -> Result<OneTimeSubmit, CommandError> {
        if let Some(existing) = self.one_time.get(&queue_family) {
            return Ok(*existing);
        }

        let pool = self.get_pool(queue_family, Transience::Reusable)?;
        let buffer = self.allocate(pool)?;
        let fence = unsafe {
            self.device
                .create_fence(false)
                .map_err(CommandError::UnableToCreateFence)?
        };
        self.device.set_debug_name(
            vk::ObjectType::FENCE,
            fence.as_raw(),
            &format!("One Time Submit Fence (queue family {})", queue_family),
        );

        let one_time = OneTimeSubmit { buffer, fence };
        self.one_time.insert(queue_family, one_time);
        Ok(one_time)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::device::HeadlessDevice,
        std::{sync::Arc, time::Duration},
    };

    #[test]
    fn commands_complete_before_submit_returns() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        let mut manager =
            CommandPoolManager::new(device.clone(), 1, Duration::from_secs(1));

        let value = manager
            .submit_one_time(QueueCapability::Transfer, |_, _| Ok(42))
            .unwrap();
        let again = manager
            .submit_one_time(QueueCapability::Transfer, |_, _| Ok(7))
            .unwrap();

        assert_eq!((value, again), (42, 7));
        assert_eq!(device.submission_count(), 2);
        assert_eq!(device.pending_submissions(), 0);
        let one_time = manager.one_time[&2];
        assert_eq!(manager.state(one_time.buffer), CommandBufferState::Initial);
    }

    #[test]
    fn recording_errors_leave_the_buffer_reusable() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        let mut manager =
            CommandPoolManager::new(device.clone(), 1, Duration::from_secs(1));

        let result: Result<(), _> = manager
            .submit_one_time(QueueCapability::Graphics, |_, _| {
                anyhow::bail!("no pipeline")
            });

        assert!(matches!(result, Err(CommandError::RecordingFailed(_))));
        assert_eq!(device.submission_count(), 0);
        manager
            .submit_one_time(QueueCapability::Graphics, |_, _| Ok(()))
            .unwrap();
    }

    #[test]
    fn unfinished_commands_time_out() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let mut manager = CommandPoolManager::new(
            device.clone(),
            1,
            Duration::from_millis(10),
        );

        let result = manager
            .submit_one_time(QueueCapability::Transfer, |_, _| Ok(()));

        assert!(matches!(result, Err(CommandError::SubmissionTimeout(_))));
        assert!(manager
            .pending_one_time_fence(QueueCapability::Transfer)
            .is_some());
        device.complete_all_submissions();
    }

    #[test]
    fn submissions_resume_once_timed_out_commands_complete() {
        let device = Arc::new(HeadlessDevice::builder().build());
        let mut manager = CommandPoolManager::new(
            device.clone(),
            1,
            Duration::from_millis(10),
        );
        let first =
            manager.submit_one_time(QueueCapability::Transfer, |_, _| Ok(1));
        assert!(matches!(first, Err(CommandError::SubmissionTimeout(_))));

        // still running, so the buffer can not be reused yet
        let blocked =
            manager.submit_one_time(QueueCapability::Transfer, |_, _| Ok(2));
        assert!(matches!(
            blocked,
            Err(CommandError::InvalidState {
                found: CommandBufferState::Submitted,
                ..
            })
        ));

        device.complete_all_submissions();
        let fence = manager.pending_one_time_fence(QueueCapability::Transfer);
        assert!(fence.is_some());

        manager.fence_timeout = Duration::from_secs(5);
        let worker = {
            let device = device.clone();
            std::thread::spawn(move || {
                while device.pending_submissions() == 0 {
                    std::thread::yield_now();
                }
                device.complete_all_submissions();
            })
        };
        let again = manager
            .submit_one_time(QueueCapability::Transfer, |_, _| Ok(3))
            .unwrap();
        worker.join().unwrap();

        assert_eq!(again, 3);
        assert_eq!(device.submission_count(), 2);
        assert!(manager
            .pending_one_time_fence(QueueCapability::Transfer)
            .is_none());
    }

    #[test]
    fn fence_reset_failures_are_reported_as_such() {
        let device =
            Arc::new(HeadlessDevice::builder().auto_complete(true).build());
        let mut manager =
            CommandPoolManager::new(device.clone(), 1, Duration::from_secs(1));
        manager
            .submit_one_time(QueueCapability::Transfer, |_, _| Ok(()))
            .unwrap();
        unsafe { device.destroy_fence(manager.one_time[&2].fence) };

        let result =
            manager.submit_one_time(QueueCapability::Transfer, |_, _| Ok(()));

        assert!(matches!(
            result,
            Err(CommandError::UnableToResetFence(vk::Result::ERROR_UNKNOWN))
        ));
        assert_eq!(device.submission_count(), 1);
    }
}
