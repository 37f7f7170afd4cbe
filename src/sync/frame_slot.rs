use ash::vk;

/// The synchronization objects for one frame in flight.
///
/// The slot does not own anything. Its handles are destroyed with the
/// [super::SyncManager] and must not be kept past its lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    pub(super) index: usize,
    pub(super) fence: vk::Fence,
    pub(super) image_available: vk::Semaphore,
    pub(super) render_finished: vk::Semaphore,
}

impl FrameSlot {
    /// Always in the range [0-N) where N is the number of frames in flight.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Signaled once the GPU finishes the slot's last submission.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Signaled by the presentation engine when the acquired swapchain image
    /// is ready to be rendered to.
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available
    }

    /// Signaled when the slot's commands finish. Presentation waits on it.
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }
}
