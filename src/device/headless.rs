use {
    super::{GpuDevice, MemoryProperties, MemoryType, QueueCapability, Submission},
    ash::{
        prelude::VkResult,
        vk::{self, Handle},
    },
    std::{
        collections::{HashMap, HashSet, VecDeque},
        ffi::c_void,
        sync::{Condvar, Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

const GIB: vk::DeviceSize = 1024 * 1024 * 1024;
const MIB: vk::DeviceSize = 1024 * 1024;

const BUFFER_ALIGNMENT: vk::DeviceSize = 256;
const IMAGE_ALIGNMENT: vk::DeviceSize = 4096;

const GRAPHICS_FAMILY: u32 = 0;
const COMPUTE_FAMILY: u32 = 1;
const TRANSFER_FAMILY: u32 = 2;

struct MemoryRecord {
    memory_type_index: u32,
    size: vk::DeviceSize,
    bytes: Option<Box<[u8]>>,
    mapped: bool,
}

impl MemoryRecord {
    fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        self.bytes
            .get_or_insert_with(|| vec![0u8; size].into_boxed_slice())
    }
}

struct BufferRecord {
    size: vk::DeviceSize,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

struct CopyCommand {
    src: vk::Buffer,
    dst: vk::Buffer,
    regions: Vec<vk::BufferCopy>,
}

struct PendingSubmission {
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

type ImageViewRecord = (vk::ImageViewType, vk::ImageSubresourceRange);

struct SwapchainRecord {
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    next_image: u32,
    retired: bool,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    heap_usage: Vec<vk::DeviceSize>,
    memory: HashMap<vk::DeviceMemory, MemoryRecord>,
    buffers: HashMap<vk::Buffer, BufferRecord>,
    images: HashMap<vk::Image, vk::DeviceSize>,
    image_views: HashMap<vk::ImageView, ImageViewRecord>,
    command_pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    recorded_copies: HashMap<vk::CommandBuffer, Vec<CopyCommand>>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    debug_names: HashMap<u64, String>,
    pending: VecDeque<PendingSubmission>,
    submission_count: usize,
    present_count: usize,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainRecord>,
    surface_extent: vk::Extent2D,
    surface_lost: bool,
    device_lost: bool,
    fail_command_buffer_allocations: bool,
    auto_complete: bool,
}

impl HeadlessState {
    fn new_handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(self.next_handle)
    }

    fn check_device(&self) -> VkResult<()> {
        if self.device_lost {
            Err(vk::Result::ERROR_DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    /// Execute the recorded work of the oldest pending submission and signal
    /// its fence.
    fn retire_front(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };
        for command_buffer in &submission.command_buffers {
            let copies = self
                .recorded_copies
                .get(command_buffer)
                .map(|copies| {
                    copies
                        .iter()
                        .map(|copy| (copy.src, copy.dst, copy.regions.clone()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for (src, dst, regions) in copies {
                self.execute_copy(src, dst, &regions);
            }
        }
        if submission.fence != vk::Fence::null() {
            self.fences.insert(submission.fence, true);
        }
        true
    }

    fn execute_copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let binding = |buffer: vk::Buffer| {
            self.buffers.get(&buffer).and_then(|record| record.binding)
        };
        let (Some((src_memory, src_base)), Some((dst_memory, dst_base))) =
            (binding(src), binding(dst))
        else {
            return;
        };
        for region in regions {
            let data = {
                let Some(record) = self.memory.get_mut(&src_memory) else {
                    return;
                };
                let start = (src_base + region.src_offset) as usize;
                let end = start + region.size as usize;
                record.bytes_mut()[start..end].to_vec()
            };
            let Some(record) = self.memory.get_mut(&dst_memory) else {
                return;
            };
            let start = (dst_base + region.dst_offset) as usize;
            record.bytes_mut()[start..start + data.len()].copy_from_slice(&data);
        }
    }
}

/// Builder for a [HeadlessDevice].
pub struct HeadlessDeviceBuilder {
    memory_properties: MemoryProperties,
    surface_extent: vk::Extent2D,
    auto_complete: bool,
    unsupported_formats: HashSet<vk::Format>,
}

impl Default for HeadlessDeviceBuilder {
    /// A discrete-GPU style layout: a large device-local heap, a host heap
    /// with coherent and cached types, and a small device-local host-visible
    /// heap.
    fn default() -> Self {
        let memory_types = vec![
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 2,
            },
        ];
        Self {
            memory_properties: MemoryProperties {
                memory_types,
                heap_sizes: vec![8 * GIB, 16 * GIB, 256 * MIB],
            },
            surface_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            auto_complete: false,
            unsupported_formats: HashSet::new(),
        }
    }
}

impl HeadlessDeviceBuilder {
    /// Replace the simulated memory types and heaps.
    pub fn memory_properties(mut self, properties: MemoryProperties) -> Self {
        self.memory_properties = properties;
        self
    }

    /// Change the size of a single simulated memory heap.
    pub fn heap_size(mut self, heap_index: usize, size: vk::DeviceSize) -> Self {
        if heap_index < self.memory_properties.heap_sizes.len() {
            self.memory_properties.heap_sizes[heap_index] = size;
        }
        self
    }

    /// The initial drawable size of the simulated surface.
    pub fn surface_extent(mut self, width: u32, height: u32) -> Self {
        self.surface_extent = vk::Extent2D { width, height };
        self
    }

    /// When set, every submission completes as soon as it is queued.
    /// Otherwise submissions stay pending until they are retired explicitly.
    pub fn auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Image creation with this format fails with
    /// `ERROR_FORMAT_NOT_SUPPORTED`.
    pub fn unsupported_format(mut self, format: vk::Format) -> Self {
        self.unsupported_formats.insert(format);
        self
    }

    pub fn build(self) -> HeadlessDevice {
        let state = HeadlessState {
            heap_usage: vec![0; self.memory_properties.heap_sizes.len()],
            surface_extent: self.surface_extent,
            auto_complete: self.auto_complete,
            ..Default::default()
        };
        HeadlessDevice {
            memory_properties: self.memory_properties,
            unsupported_formats: self.unsupported_formats,
            state: Mutex::new(state),
            fence_signaled: Condvar::new(),
        }
    }
}

/// A [GpuDevice] which simulates a GPU in-process.
///
/// Submissions are queued and only complete when retired with
/// [HeadlessDevice::complete_next_submission] (or immediately in
/// auto-complete mode), so frame pacing and fence waits behave like they do
/// against real hardware. Host-visible memory is backed by real bytes and
/// recorded buffer copies are executed when their submission retires.
pub struct HeadlessDevice {
    memory_properties: MemoryProperties,
    unsupported_formats: HashSet<vk::Format>,
    state: Mutex<HeadlessState>,
    fence_signaled: Condvar,
}

// Simulation controls
// -------------------

impl HeadlessDevice {
    pub fn builder() -> HeadlessDeviceBuilder {
        HeadlessDeviceBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        // The state is plain data, a panic while holding the lock leaves it
        // usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Finish the oldest pending submission. Returns false when nothing was
    /// pending.
    pub fn complete_next_submission(&self) -> bool {
        let retired = self.state().retire_front();
        self.fence_signaled.notify_all();
        retired
    }

    /// Finish every pending submission. Returns how many were retired.
    pub fn complete_all_submissions(&self) -> usize {
        let mut count = 0;
        {
            let mut state = self.state();
            while state.retire_front() {
                count += 1;
            }
        }
        self.fence_signaled.notify_all();
        count
    }

    pub fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    /// Total number of queue submissions so far.
    pub fn submission_count(&self) -> usize {
        self.state().submission_count
    }

    /// Total number of successful presentations so far.
    pub fn present_count(&self) -> usize {
        self.state().present_count
    }

    /// Simulate a window resize or minimize.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state().surface_extent = vk::Extent2D { width, height };
    }

    /// Simulate the platform surface going away (e.g. window destroyed).
    pub fn lose_surface(&self) {
        self.state().surface_lost = true;
    }

    /// Simulate device loss. Every pending and future wait fails.
    pub fn lose_device(&self) {
        self.state().device_lost = true;
        self.fence_signaled.notify_all();
    }

    /// Make command buffer allocation fail with `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_command_buffer_allocations(&self, fail: bool) {
        self.state().fail_command_buffer_allocations = fail;
    }

    pub fn live_memory_allocations(&self) -> usize {
        self.state().memory.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state().images.len()
    }

    pub fn live_image_views(&self) -> usize {
        self.state().image_views.len()
    }

    /// The view type and subresource range an image view was created with.
    pub fn image_view(
        &self,
        view: vk::ImageView,
    ) -> Option<(vk::ImageViewType, vk::ImageSubresourceRange)> {
        self.state().image_views.get(&view).copied()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state().command_pools.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state().semaphores.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state().swapchains.len()
    }

    /// The debug name most recently given to a handle.
    pub fn debug_name(&self, raw_handle: u64) -> Option<String> {
        self.state().debug_names.get(&raw_handle).cloned()
    }

    /// Read back the contents of a buffer bound to memory.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let mut state = self.state();
        let record = state.buffers.get(&buffer)?;
        let size = record.size as usize;
        let (memory, offset) = record.binding?;
        let memory = state.memory.get_mut(&memory)?;
        let offset = offset as usize;
        Some(memory.bytes_mut()[offset..offset + size].to_vec())
    }
}

impl GpuDevice for HeadlessDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn queue_family_index(&self, capability: QueueCapability) -> Option<u32> {
        Some(match capability {
            QueueCapability::Graphics => GRAPHICS_FAMILY,
            QueueCapability::Compute => COMPUTE_FAMILY,
            QueueCapability::Transfer => TRANSFER_FAMILY,
        })
    }

    fn set_debug_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &str,
    ) {
        log::trace!("{:?} {:#x} is named {:?}", object_type, raw_handle, name);
        self.state().debug_names.insert(raw_handle, name.to_owned());
    }

    unsafe fn allocate_memory(
        &self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
    ) -> VkResult<vk::DeviceMemory> {
        let memory_type = self
            .memory_properties
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let heap_index = memory_type.heap_index as usize;
        let heap_size = self.memory_properties.heap_sizes[heap_index];

        let mut state = self.state();
        state.check_device()?;
        if state.heap_usage[heap_index] + size_in_bytes > heap_size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.heap_usage[heap_index] += size_in_bytes;
        let memory = state.new_handle();
        state.memory.insert(
            memory,
            MemoryRecord {
                memory_type_index,
                size: size_in_bytes,
                bytes: None,
                mapped: false,
            },
        );
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        if let Some(record) = state.memory.remove(&memory) {
            let heap_index = self.memory_properties.memory_types
                [record.memory_type_index as usize]
                .heap_index as usize;
            state.heap_usage[heap_index] -= record.size;
        }
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
    ) -> VkResult<*mut c_void> {
        let mut state = self.state();
        let record = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let flags = self.memory_properties.memory_types
            [record.memory_type_index as usize]
            .property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            || record.mapped
        {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        record.mapped = true;
        Ok(record.bytes_mut().as_mut_ptr() as *mut c_void)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(record) = self.state().memory.get_mut(&memory) {
            record.mapped = false;
        }
    }

    unsafe fn flush_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let state = self.state();
        let record = state
            .memory
            .get(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if !record.mapped
            || (size != vk::WHOLE_SIZE && offset + size > record.size)
        {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(())
    }

    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> VkResult<vk::Buffer> {
        if create_info.size == 0 || create_info.usage.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.state();
        state.check_device()?;
        let buffer = state.new_handle();
        state.buffers.insert(
            buffer,
            BufferRecord {
                size: create_info.size,
                binding: None,
            },
        );
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().buffers.remove(&buffer);
    }

    fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        let size = self
            .state()
            .buffers
            .get(&buffer)
            .map(|record| record.size)
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: size.next_multiple_of(BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: (1u32
                << self.memory_properties.memory_types.len())
                - 1,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state();
        let memory_size = state
            .memory
            .get(&memory)
            .map(|record| record.size)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let record = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if offset % BUFFER_ALIGNMENT != 0 || offset + record.size > memory_size
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        record.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> VkResult<vk::Image> {
        if self.unsupported_formats.contains(&create_info.format) {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        let extent = create_info.extent;
        if extent.width == 0 || extent.height == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.state();
        state.check_device()?;
        let image = state.new_handle();
        let layer_size: vk::DeviceSize = (0..create_info.mip_levels.max(1))
            .map(|level| {
                (extent.width >> level).max(1) as vk::DeviceSize
                    * (extent.height >> level).max(1) as vk::DeviceSize
                    * extent.depth.max(1) as vk::DeviceSize
                    * 4
            })
            .sum();
        let size = layer_size * create_info.array_layers.max(1) as vk::DeviceSize;
        state.images.insert(image, size);
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.state().images.remove(&image);
    }

    fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        let size = self.state().images.get(&image).copied().unwrap_or(0);
        let memory_type_bits = self
            .memory_properties
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, memory_type)| {
                memory_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .fold(0u32, |bits, (index, _)| bits | (1 << index));
        vk::MemoryRequirements {
            size: size.next_multiple_of(IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let state = self.state();
        if !state.images.contains_key(&image)
            || !state.memory.contains_key(&memory)
            || offset % IMAGE_ALIGNMENT != 0
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(())
    }

    unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.state();
        let swapchain_image = state
            .swapchains
            .values()
            .any(|swapchain| swapchain.images.contains(&create_info.image));
        if !swapchain_image && !state.images.contains_key(&create_info.image) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let view = state.new_handle();
        state.image_views.insert(
            view,
            (create_info.view_type, create_info.subresource_range),
        );
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, image_view: vk::ImageView) {
        self.state().image_views.remove(&image_view);
    }

    unsafe fn create_command_pool(
        &self,
        _create_info: &vk::CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state();
        state.check_device()?;
        let pool = state.new_handle();
        state.command_pools.insert(pool, vec![]);
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            for buffer in buffers {
                state.recorded_copies.remove(&buffer);
            }
        }
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state();
        let buffers = state
            .command_pools
            .get(&pool)
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for buffer in buffers {
            state.recorded_copies.remove(&buffer);
        }
        Ok(())
    }

    unsafe fn trim_command_pool(&self, _pool: vk::CommandPool) {}

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        state.check_device()?;
        if state.fail_command_buffer_allocations {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        if !state.command_pools.contains_key(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let buffers: Vec<vk::CommandBuffer> =
            (0..count).map(|_| state.new_handle()).collect();
        if let Some(pool_buffers) = state.command_pools.get_mut(&pool) {
            pool_buffers.extend(buffers.iter().copied());
        }
        Ok(buffers)
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> VkResult<()> {
        self.state().recorded_copies.remove(&command_buffer);
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state();
        state.check_device()?;
        state.recorded_copies.insert(command_buffer, vec![]);
        Ok(())
    }

    unsafe fn end_command_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
    ) -> VkResult<()> {
        self.state().check_device()
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.state()
            .recorded_copies
            .entry(command_buffer)
            .or_default()
            .push(CopyCommand {
                src,
                dst,
                regions: regions.to_vec(),
            });
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let fence = state.new_handle();
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.state().fences.remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let deadline =
            Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state();
        loop {
            state.check_device()?;
            match state.fences.get(&fence) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            state = match deadline {
                None => self
                    .fence_signaled
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(vk::Result::TIMEOUT);
                    }
                    self.fence_signaled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        state.check_device()?;
        let pending = state
            .pending
            .iter()
            .any(|submission| submission.fence == fence);
        match state.fences.get_mut(&fence) {
            Some(_) if pending => Err(vk::Result::ERROR_UNKNOWN),
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.state();
        state.check_device()?;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = state.new_handle();
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state().semaphores.remove(&semaphore);
    }

    unsafe fn queue_submit(
        &self,
        queue_family_index: u32,
        submission: &Submission,
    ) -> VkResult<()> {
        if queue_family_index > TRANSFER_FAMILY {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let mut state = self.state();
        state.check_device()?;
        if submission.fence != vk::Fence::null() {
            match state.fences.get(&submission.fence) {
                // submitting with a signaled fence is invalid usage
                Some(false) => {}
                _ => return Err(vk::Result::ERROR_UNKNOWN),
            }
        }
        state.submission_count += 1;
        state.pending.push_back(PendingSubmission {
            fence: submission.fence,
            command_buffers: submission.command_buffers.to_vec(),
        });
        if state.auto_complete {
            state.retire_front();
            drop(state);
            self.fence_signaled.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.state().check_device()?;
        self.complete_all_submissions();
        Ok(())
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let state = self.state();
        if state.surface_lost {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let minimized = state.surface_extent.width == 0
            || state.surface_extent.height == 0;
        let min_extent = if minimized {
            vk::Extent2D::default()
        } else {
            vk::Extent2D {
                width: 1,
                height: 1,
            }
        };
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: state.surface_extent,
            min_image_extent: min_extent,
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        })
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ])
    }

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX])
    }

    fn swapchain_queue_family_indices(&self) -> Vec<u32> {
        vec![GRAPHICS_FAMILY]
    }

    unsafe fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state();
        state.check_device()?;
        if state.surface_lost {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let extent = create_info.image_extent;
        if extent.width == 0 || extent.height == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        if let Some(old) = state.swapchains.get_mut(&create_info.old_swapchain)
        {
            old.retired = true;
        }
        let images = (0..create_info.min_image_count)
            .map(|_| state.new_handle())
            .collect();
        let swapchain = state.new_handle();
        state.swapchains.insert(
            swapchain,
            SwapchainRecord {
                extent,
                images,
                next_image: 0,
                retired: false,
            },
        );
        Ok(swapchain)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state().swapchains.remove(&swapchain);
    }

    fn swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain)
            .map(|record| record.images.clone())
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        state.check_device()?;
        if state.surface_lost {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let surface_extent = state.surface_extent;
        let record = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if record.retired || record.extent != surface_extent {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let index = record.next_image % record.images.len() as u32;
        record.next_image = record.next_image.wrapping_add(1);
        Ok((index, false))
    }

    unsafe fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        _image_index: u32,
        _wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state();
        state.check_device()?;
        if state.surface_lost {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let surface_extent = state.surface_extent;
        let record = state
            .swapchains
            .get(&swapchain)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if record.retired || record.extent != surface_extent {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        state.present_count += 1;
        Ok(false)
    }
}
