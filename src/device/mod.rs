//! The seam between this crate and the explicit GPU API.
//!
//! Every subsystem holds an `Arc<dyn GpuDevice>` and never touches the API
//! directly. [AshDevice] drives a real Vulkan device, [HeadlessDevice]
//! simulates one in-process so the resource and synchronization logic can be
//! exercised without a GPU.

mod ash_device;
mod headless;

use {
    ash::{prelude::VkResult, vk},
    std::ffi::c_void,
};

pub use self::{
    ash_device::{AshDevice, AshDeviceCreateInfo},
    headless::{HeadlessDevice, HeadlessDeviceBuilder},
};

/// The kinds of work a queue family can accept.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueCapability {
    Graphics,
    Compute,
    Transfer,
}

/// A single memory type reported by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// The memory types and heaps reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub heap_sizes: Vec<vk::DeviceSize>,
}

impl From<&vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let type_count = properties.memory_type_count as usize;
        let heap_count = properties.memory_heap_count as usize;
        Self {
            memory_types: properties.memory_types[..type_count]
                .iter()
                .map(|memory_type| MemoryType {
                    property_flags: memory_type.property_flags,
                    heap_index: memory_type.heap_index,
                })
                .collect(),
            heap_sizes: properties.memory_heaps[..heap_count]
                .iter()
                .map(|heap| heap.size)
                .collect(),
        }
    }
}

/// Everything needed for a single queue submission.
///
/// The GPU waits on each `(semaphore, stage)` pair before the listed stages of
/// the command buffers execute, signals every semaphore in
/// `signal_semaphores` once the buffers complete, then signals `fence`.
#[derive(Debug, Clone, Default)]
pub struct Submission<'a> {
    pub wait_semaphores: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// The device operations required by the resource and frame subsystems.
///
/// Fallible calls return the raw [vk::Result] so each subsystem can wrap it in
/// its own error type.
pub trait GpuDevice: Send + Sync {
    /// Memory types and heaps, in the device's index order.
    fn memory_properties(&self) -> &MemoryProperties;

    /// The queue family used for the given kind of work, if any.
    fn queue_family_index(&self, capability: QueueCapability) -> Option<u32>;

    /// Give a debug name to a Vulkan object. The name shows up in validation
    /// layer logs. Devices without debug utils ignore the call.
    fn set_debug_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &str,
    );

    // Memory
    // ------

    /// # Safety
    ///
    /// The caller must free the memory before the device is destroyed.
    unsafe fn allocate_memory(
        &self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
    ) -> VkResult<vk::DeviceMemory>;

    /// # Safety
    ///
    /// No GPU work may reference the memory, and it must be unmapped.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map an entire memory object into host address space.
    ///
    /// # Safety
    ///
    /// The memory must be host visible and not already mapped.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
    ) -> VkResult<*mut c_void>;

    /// # Safety
    ///
    /// The memory must currently be mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    ///
    /// The memory must currently be mapped.
    unsafe fn flush_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    // Buffers and Images
    // ------------------

    /// # Safety
    ///
    /// The caller must destroy the buffer before the device is destroyed.
    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> VkResult<vk::Buffer>;

    /// # Safety
    ///
    /// No GPU work may reference the buffer.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements;

    /// # Safety
    ///
    /// The memory range must be unused by any other resource.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// The caller must destroy the image before the device is destroyed.
    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> VkResult<vk::Image>;

    /// # Safety
    ///
    /// No GPU work may reference the image.
    unsafe fn destroy_image(&self, image: vk::Image);

    fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements;

    /// # Safety
    ///
    /// The memory range must be unused by any other resource.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// The caller must destroy the view before the image.
    unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView>;

    /// # Safety
    ///
    /// No GPU work may reference the view.
    unsafe fn destroy_image_view(&self, image_view: vk::ImageView);

    // Commands
    // --------

    /// # Safety
    ///
    /// The caller must destroy the pool before the device is destroyed.
    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool>;

    /// # Safety
    ///
    /// No buffer allocated from the pool may be pending execution.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    ///
    /// No buffer allocated from the pool may be pending execution.
    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;

    /// # Safety
    ///
    /// The pool must not be in use by another thread.
    unsafe fn trim_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    ///
    /// The buffers are owned by the pool and become invalid when it is
    /// destroyed.
    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    /// # Safety
    ///
    /// The buffer must not be pending execution and its pool must allow
    /// individual resets.
    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// The buffer must be in the initial state.
    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// The buffer must be in the recording state.
    unsafe fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// The buffer must be recording and both buffers must outlive the
    /// submission.
    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    // Synchronization
    // ---------------

    /// # Safety
    ///
    /// The caller must destroy the fence before the device is destroyed.
    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    /// # Safety
    ///
    /// The fence must not be referenced by a pending submission.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Block until the fence is signaled or `timeout_ns` elapses.
    ///
    /// Returns `Err(vk::Result::TIMEOUT)` when the timeout elapses first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// Return the fence to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// True when the fence is signaled. Never blocks.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// # Safety
    ///
    /// The caller must destroy the semaphore before the device is destroyed.
    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    /// # Safety
    ///
    /// The semaphore must not be referenced by pending GPU work.
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// # Safety
    ///
    /// Every command buffer must be executable and every handle must stay
    /// alive until the submission's fence signals.
    unsafe fn queue_submit(
        &self,
        queue_family_index: u32,
        submission: &Submission,
    ) -> VkResult<()>;

    /// Block until all GPU work has finished.
    fn wait_idle(&self) -> VkResult<()>;

    // Presentation
    // ------------

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>>;

    /// The queue families which need concurrent access to swapchain images.
    fn swapchain_queue_family_indices(&self) -> Vec<u32>;

    /// # Safety
    ///
    /// The caller must destroy the swapchain before the device is destroyed.
    /// The `surface` field of `create_info` is filled in by the device.
    unsafe fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR,
    ) -> VkResult<vk::SwapchainKHR>;

    /// # Safety
    ///
    /// No GPU work may reference the swapchain's images.
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    fn swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::Image>>;

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// ready. Returns the image index and whether the swapchain is suboptimal.
    ///
    /// # Safety
    ///
    /// The semaphore must be unsignaled with no pending signal operation.
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Queue an image for presentation once every wait semaphore signals.
    /// Returns true when the swapchain is suboptimal.
    ///
    /// # Safety
    ///
    /// The image must have been acquired and transitioned for presentation.
    unsafe fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;
}

/// Convert a timeout into the nanosecond count used by fence waits and image
/// acquisition, saturating at `u64::MAX` (wait forever).
pub fn timeout_ns(timeout: std::time::Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
