use {
    crate::{
        commands::CommandBufferHandle, resources::ResourceHandle,
        sync::FrameSlot,
    },
    ash::vk,
};

/// A frame between [super::FrameOrchestrator::begin_frame] and
/// [super::FrameOrchestrator::end_frame].
#[derive(Debug)]
pub struct Frame {
    pub(super) slot: FrameSlot,
    pub(super) frame_index: u64,
    pub(super) image_index: u32,
    pub(super) command_buffer_handle: CommandBufferHandle,
    pub(super) command_buffer: vk::CommandBuffer,
    pub(super) tracked: Vec<ResourceHandle>,
}

impl Frame {
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    /// The swapchain image this frame renders to.
    pub fn swapchain_image_index(&self) -> u32 {
        self.image_index
    }

    /// The recording command buffer for this frame.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn command_buffer_handle(&self) -> CommandBufferHandle {
        self.command_buffer_handle
    }

    /// Record that this frame's commands use a resource. Every tracked
    /// resource is marked in flight with the frame's fence when the frame is
    /// submitted, so the CPU cannot write to it until the GPU is done.
    pub fn track_resource(&mut self, handle: ResourceHandle) {
        if !self.tracked.contains(&handle) {
            self.tracked.push(handle);
        }
    }

    pub fn tracked_resources(&self) -> &[ResourceHandle] {
        &self.tracked
    }
}
