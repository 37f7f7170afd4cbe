use {
    super::{GpuDevice, MemoryProperties, QueueCapability, Submission},
    ash::{prelude::VkResult, vk},
    std::{collections::HashMap, ffi::c_void, sync::Mutex},
};

/// The Vulkan objects created by the window/instance collaborator which an
/// [AshDevice] needs.
pub struct AshDeviceCreateInfo {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,

    /// The logical device. Ownership moves to the [AshDevice], which destroys
    /// it when dropped.
    pub logical_device: ash::Device,

    /// The presentation surface. The caller keeps ownership and must destroy
    /// it after the [AshDevice] is dropped.
    pub surface: vk::SurfaceKHR,

    pub graphics_family_index: u32,
    pub present_family_index: u32,
    pub compute_family_index: Option<u32>,
    pub transfer_family_index: Option<u32>,

    /// Set when the instance was created with VK_EXT_debug_utils.
    pub debug_utils_enabled: bool,
}

/// A [GpuDevice] backed by a real Vulkan logical device.
pub struct AshDevice {
    memory_properties: MemoryProperties,
    graphics_family_index: u32,
    present_family_index: u32,
    compute_family_index: u32,
    transfer_family_index: u32,
    queues: HashMap<u32, Mutex<vk::Queue>>,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    logical_device: ash::Device,
}

impl AshDevice {
    /// Wrap the collaborator-provided Vulkan objects.
    pub fn new(create_info: AshDeviceCreateInfo) -> Self {
        let AshDeviceCreateInfo {
            entry,
            instance,
            physical_device,
            logical_device,
            surface,
            graphics_family_index,
            present_family_index,
            compute_family_index,
            transfer_family_index,
            debug_utils_enabled,
        } = create_info;

        let memory_properties = MemoryProperties::from(&unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        });
        log::debug!("Device memory properties: {:#?}", memory_properties);

        let compute_family_index =
            compute_family_index.unwrap_or(graphics_family_index);
        let transfer_family_index =
            transfer_family_index.unwrap_or(graphics_family_index);

        let mut queues = HashMap::new();
        for family_index in [
            graphics_family_index,
            present_family_index,
            compute_family_index,
            transfer_family_index,
        ] {
            queues.entry(family_index).or_insert_with(|| {
                Mutex::new(unsafe {
                    logical_device.get_device_queue(family_index, 0)
                })
            });
        }

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let swapchain_loader =
            ash::khr::swapchain::Device::new(&instance, &logical_device);
        let debug_utils = if debug_utils_enabled {
            Some(ash::ext::debug_utils::Device::new(&instance, &logical_device))
        } else {
            None
        };

        Self {
            memory_properties,
            graphics_family_index,
            present_family_index,
            compute_family_index,
            transfer_family_index,
            queues,
            surface,
            physical_device,
            surface_loader,
            swapchain_loader,
            debug_utils,
            logical_device,
        }
    }

    fn queue(&self, family_index: u32) -> VkResult<&Mutex<vk::Queue>> {
        self.queues
            .get(&family_index)
            .ok_or(vk::Result::ERROR_FEATURE_NOT_PRESENT)
    }
}

impl GpuDevice for AshDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn queue_family_index(&self, capability: QueueCapability) -> Option<u32> {
        Some(match capability {
            QueueCapability::Graphics => self.graphics_family_index,
            QueueCapability::Compute => self.compute_family_index,
            QueueCapability::Transfer => self.transfer_family_index,
        })
    }

    fn set_debug_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &str,
    ) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(cname) = std::ffi::CString::new(name) else {
            log::warn!("Debug name {:?} contains a nul byte", name);
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: raw_handle,
            p_object_name: cname.as_ptr(),
            ..Default::default()
        };
        if let Err(err) =
            unsafe { debug_utils.set_debug_utils_object_name(&name_info) }
        {
            log::warn!("Unable to set debug name {}: {:?}", name, err);
        }
    }

    unsafe fn allocate_memory(
        &self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
    ) -> VkResult<vk::DeviceMemory> {
        let allocate_info = vk::MemoryAllocateInfo {
            memory_type_index,
            allocation_size: size_in_bytes,
            ..Default::default()
        };
        self.logical_device.allocate_memory(&allocate_info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.logical_device.free_memory(memory, None)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
    ) -> VkResult<*mut c_void> {
        self.logical_device.map_memory(
            memory,
            0,
            vk::WHOLE_SIZE,
            vk::MemoryMapFlags::empty(),
        )
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.logical_device.unmap_memory(memory)
    }

    unsafe fn flush_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let range = vk::MappedMemoryRange {
            memory,
            offset,
            size,
            ..Default::default()
        };
        self.logical_device.flush_mapped_memory_ranges(&[range])
    }

    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo,
    ) -> VkResult<vk::Buffer> {
        self.logical_device.create_buffer(create_info, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.logical_device.destroy_buffer(buffer, None)
    }

    fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        unsafe { self.logical_device.get_buffer_memory_requirements(buffer) }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device.bind_buffer_memory(buffer, memory, offset)
    }

    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> VkResult<vk::Image> {
        self.logical_device.create_image(create_info, None)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.logical_device.destroy_image(image, None)
    }

    fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        unsafe { self.logical_device.get_image_memory_requirements(image) }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device.bind_image_memory(image, memory, offset)
    }

    unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView> {
        self.logical_device.create_image_view(create_info, None)
    }

    unsafe fn destroy_image_view(&self, image_view: vk::ImageView) {
        self.logical_device.destroy_image_view(image_view, None)
    }

    unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool> {
        self.logical_device.create_command_pool(create_info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.logical_device.destroy_command_pool(pool, None)
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        self.logical_device
            .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
    }

    unsafe fn trim_command_pool(&self, pool: vk::CommandPool) {
        self.logical_device
            .trim_command_pool(pool, vk::CommandPoolTrimFlags::empty())
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level,
            command_buffer_count: count,
            ..Default::default()
        };
        self.logical_device.allocate_command_buffers(&allocate_info)
    }

    unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> VkResult<()> {
        self.logical_device.reset_command_buffer(
            command_buffer,
            vk::CommandBufferResetFlags::empty(),
        )
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo {
            flags,
            ..Default::default()
        };
        self.logical_device
            .begin_command_buffer(command_buffer, &begin_info)
    }

    unsafe fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> VkResult<()> {
        self.logical_device.end_command_buffer(command_buffer)
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.logical_device
            .cmd_copy_buffer(command_buffer, src, dst, regions)
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        self.logical_device.create_fence(&create_info, None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.logical_device.destroy_fence(fence, None)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe {
            self.logical_device
                .wait_for_fences(&[fence], true, timeout_ns)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.logical_device.reset_fences(&[fence]) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.logical_device.get_fence_status(fence) }
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        self.logical_device.create_semaphore(&create_info, None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.logical_device.destroy_semaphore(semaphore, None)
    }

    unsafe fn queue_submit(
        &self,
        queue_family_index: u32,
        submission: &Submission,
    ) -> VkResult<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            submission.wait_semaphores.iter().copied().unzip();
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        let queue = self
            .queue(queue_family_index)?
            .lock()
            .map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        self.logical_device
            .queue_submit(*queue, &[submit_info], submission.fence)
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.logical_device.device_wait_idle() }
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.physical_device,
                self.surface,
            )
        }
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader.get_physical_device_surface_formats(
                self.physical_device,
                self.surface,
            )
        }
    }

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader.get_physical_device_surface_present_modes(
                self.physical_device,
                self.surface,
            )
        }
    }

    fn swapchain_queue_family_indices(&self) -> Vec<u32> {
        if self.graphics_family_index == self.present_family_index {
            vec![self.graphics_family_index]
        } else {
            vec![self.graphics_family_index, self.present_family_index]
        }
    }

    unsafe fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut create_info = *create_info;
        create_info.surface = self.surface;
        self.swapchain_loader.create_swapchain(&create_info, None)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.swapchain_loader.destroy_swapchain(swapchain, None)
    }

    fn swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        self.swapchain_loader.acquire_next_image(
            swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        )
    }

    unsafe fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let queue = self
            .queue(self.present_family_index)?
            .lock()
            .map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        self.swapchain_loader.queue_present(*queue, &present_info)
    }
}

impl Drop for AshDevice {
    /// # DANGER
    ///
    /// Every object created through this device must already be destroyed.
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.logical_device.device_wait_idle() {
                log::warn!(
                    "Error while idling the device before destruction: {:?}",
                    err
                );
            }
            self.logical_device.destroy_device(None);
        }
    }
}
