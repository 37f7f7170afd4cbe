use {
    super::{
        CacheStats, GpuObject, Lease, ManagedResource, ResourceDescriptor,
        ResourceError, ResourceHandle,
    },
    crate::{
        commands::CommandPoolManager,
        device::{GpuDevice, QueueCapability},
        memory::{MemoryAllocator, Suballocation},
    },
    ash::vk::{self, Handle},
    std::{collections::HashMap, sync::Arc},
};

/// Creates, caches, and destroys every buffer and image.
///
/// The cache never hands a resource to a second caller while the first still
/// holds it, unless both asked for a shared lease with
/// [ResourceCache::acquire_shared]. The cache is not synchronized: callers
/// on multiple threads must wrap it in a lock.
pub struct ResourceCache {
    resources: Vec<ManagedResource>,
    free: HashMap<ResourceDescriptor, Vec<ResourceHandle>>,
    shared: HashMap<ResourceDescriptor, ResourceHandle>,
    allocator: MemoryAllocator,
    destroyed: bool,
    device: Arc<dyn GpuDevice>,
}

// Public API
// ----------

impl ResourceCache {
    /// Create an empty cache. Backing memory is requested from the device in
    /// blocks of `block_size` bytes.
    pub fn new(device: Arc<dyn GpuDevice>, block_size: vk::DeviceSize) -> Self {
        Self {
            resources: vec![],
            free: HashMap::new(),
            shared: HashMap::new(),
            allocator: MemoryAllocator::new(device.clone(), block_size),
            destroyed: false,
            device,
        }
    }

    /// Lease a resource exclusively.
    ///
    /// A free resource with an identical descriptor is reused when the GPU is
    /// done with it. Otherwise a new resource is created and its memory is
    /// suballocated. Device errors surface as
    /// [ResourceError::ResourceCreationFailed] and are never retried.
    pub fn acquire(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        self.ensure_alive()?;
        let handle = match self.take_free(&descriptor)? {
            Some(handle) => handle,
            None => self.create(descriptor)?,
        };
        self.resources[handle.0 as usize].lease = Lease::Exclusive;
        log::trace!("Leased {:?} for {:?}", handle, descriptor);
        Ok(handle)
    }

    /// Lease the shared resource for a descriptor, creating it on first use.
    ///
    /// Every caller gets the same resource until all of them release it.
    /// Shared resources are never handed out by [ResourceCache::acquire].
    pub fn acquire_shared(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        self.ensure_alive()?;
        if let Some(&handle) = self.shared.get(&descriptor) {
            let resource = &mut self.resources[handle.0 as usize];
            if let Lease::Shared(count) = &mut resource.lease {
                *count += 1;
            }
            return Ok(handle);
        }

        let handle = match self.take_free(&descriptor)? {
            Some(handle) => handle,
            None => self.create(descriptor)?,
        };
        self.resources[handle.0 as usize].lease = Lease::Shared(1);
        self.shared.insert(descriptor, handle);
        log::trace!("Shared {:?} for {:?}", handle, descriptor);
        Ok(handle)
    }

    /// Give up a lease. The resource stays alive and becomes available to the
    /// next caller with the same descriptor.
    pub fn release(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<(), ResourceError> {
        let index = self.index_of(handle)?;
        let resource = &mut self.resources[index];
        match resource.lease {
            Lease::Free => return Err(ResourceError::NotLeased(handle)),
            Lease::Shared(count) if count > 1 => {
                resource.lease = Lease::Shared(count - 1);
                return Ok(());
            }
            Lease::Shared(_) => {
                self.shared.remove(&resource.descriptor);
            }
            Lease::Exclusive => {}
        }
        resource.lease = Lease::Free;
        self.free
            .entry(resource.descriptor)
            .or_default()
            .push(handle);
        Ok(())
    }

    pub fn resource(
        &self,
        handle: ResourceHandle,
    ) -> Result<&ManagedResource, ResourceError> {
        let index = self.index_of(handle)?;
        Ok(&self.resources[index])
    }

    /// Record that a submission guarded by `fence` uses the resource.
    pub fn mark_in_flight(
        &mut self,
        handle: ResourceHandle,
        fence: vk::Fence,
    ) -> Result<(), ResourceError> {
        let index = self.index_of(handle)?;
        self.resources[index].in_flight = Some(fence);
        Ok(())
    }

    /// Forget every in-flight marker for a fence which the caller has
    /// observed signaled. Needed before a fence is reset and reused, since a
    /// reset fence no longer says anything about the old submission.
    pub fn retire_fence(&mut self, fence: vk::Fence) {
        for resource in &mut self.resources {
            if resource.in_flight == Some(fence) {
                resource.in_flight = None;
            }
        }
    }

    /// True while the last submission that used the resource is unfinished.
    pub fn is_in_use_by_gpu(
        &self,
        handle: ResourceHandle,
    ) -> Result<bool, ResourceError> {
        let index = self.index_of(handle)?;
        self.gpu_busy(&self.resources[index])
    }

    /// Copy bytes into a leased host-visible buffer.
    ///
    /// Fails with [ResourceError::InUseByGpu] while a submission which uses
    /// the buffer is still executing.
    pub fn write(
        &mut self,
        handle: ResourceHandle,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), ResourceError> {
        let index = self.index_of(handle)?;
        let resource = &self.resources[index];
        let size = Self::checked_buffer_size(resource)?;
        if !resource.descriptor.is_host_visible() {
            return Err(ResourceError::NotHostVisible(handle));
        }
        let fits = offset
            .checked_add(bytes.len() as vk::DeviceSize)
            .is_some_and(|end| end <= size);
        if !fits {
            return Err(ResourceError::OutOfBounds {
                handle,
                offset,
                len: bytes.len(),
                size,
            });
        }
        if self.gpu_busy(resource)? {
            return Err(ResourceError::InUseByGpu(handle));
        }

        let suballocation = resource.suballocation;
        let ptr = self.allocator.mapped_ptr(&suballocation)?;
        unsafe {
            // SAFE because the range was bounds checked and no GPU work uses
            // the buffer.
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr.add(offset as usize),
                bytes.len(),
            );
        }
        self.allocator.flush(&suballocation)?;
        Ok(())
    }

    /// Fill a leased buffer from the start.
    ///
    /// Host-visible buffers are written directly. Device-local buffers are
    /// filled through a staging buffer and a one-time transfer submission,
    /// which blocks until the copy completes.
    ///
    /// If the copy may still be running when the upload fails, both buffers
    /// stay in flight on the submission's fence.
    pub fn upload(
        &mut self,
        handle: ResourceHandle,
        bytes: &[u8],
        commands: &mut CommandPoolManager,
    ) -> Result<(), ResourceError> {
        let index = self.index_of(handle)?;
        let resource = &self.resources[index];
        let size = Self::checked_buffer_size(resource)?;
        if resource.descriptor.is_host_visible() {
            return self.write(handle, 0, bytes);
        }
        if bytes.len() as vk::DeviceSize > size {
            return Err(ResourceError::OutOfBounds {
                handle,
                offset: 0,
                len: bytes.len(),
                size,
            });
        }
        if self.gpu_busy(resource)? {
            return Err(ResourceError::InUseByGpu(handle));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let staging = self.acquire(ResourceDescriptor::staging_buffer(
            bytes.len() as vk::DeviceSize,
        ))?;
        let result = self.copy_through_staging(staging, handle, bytes, commands);
        if result.is_err() {
            if let Some(fence) =
                commands.pending_one_time_fence(QueueCapability::Transfer)
            {
                log::warn!(
                    "Upload to {:?} did not finish, keeping it in flight",
                    handle
                );
                self.mark_in_flight(staging, fence)?;
                self.mark_in_flight(handle, fence)?;
            }
        }
        self.release(staging)?;
        result
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            resources: self.resources.len(),
            memory: self.allocator.stats(),
            ..CacheStats::default()
        };
        for resource in &self.resources {
            match resource.lease {
                Lease::Free => stats.free += 1,
                Lease::Exclusive => stats.leased += 1,
                Lease::Shared(_) => stats.shared += 1,
            }
        }
        stats
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Destroy every resource and return all memory to the device.
    ///
    /// This is the only path which frees memory blocks. A second call fails
    /// with [ResourceError::CacheDestroyed] and does nothing.
    ///
    /// # Safety
    ///
    /// No GPU work may reference any resource from this cache.
    pub unsafe fn destroy_all(&mut self) -> Result<(), ResourceError> {
        self.ensure_alive()?;
        let leased = self
            .resources
            .iter()
            .filter(|resource| resource.lease != Lease::Free)
            .count();
        if leased > 0 {
            log::debug!("Destroying {} resources which are still leased", leased);
        }

        let count = self.resources.len();
        for resource in std::mem::take(&mut self.resources) {
            self.destroy_object(resource.object);
            self.allocator.release(&resource.suballocation)?;
        }
        self.allocator.destroy_all();
        self.free.clear();
        self.shared.clear();
        self.destroyed = true;

        log::info!("Destroyed {} cached resources", count);
        Ok(())
    }
}

// Private API
// -----------

impl ResourceCache {
    fn ensure_alive(&self) -> Result<(), ResourceError> {
        if self.destroyed {
            Err(ResourceError::CacheDestroyed)
        } else {
            Ok(())
        }
    }

    fn index_of(&self, handle: ResourceHandle) -> Result<usize, ResourceError> {
        self.ensure_alive()?;
        let index = handle.0 as usize;
        if index < self.resources.len() {
            Ok(index)
        } else {
            Err(ResourceError::UnknownResource(handle))
        }
    }

    /// The byte size of a leased buffer.
    fn checked_buffer_size(
        resource: &ManagedResource,
    ) -> Result<vk::DeviceSize, ResourceError> {
        if resource.lease == Lease::Free {
            return Err(ResourceError::NotLeased(resource.handle));
        }
        match resource.descriptor {
            ResourceDescriptor::Buffer { size, .. } => Ok(size),
            ResourceDescriptor::Image { .. } => {
                Err(ResourceError::NotABuffer(resource.handle))
            }
        }
    }

    fn gpu_busy(&self, resource: &ManagedResource) -> Result<bool, ResourceError> {
        let Some(fence) = resource.in_flight else {
            return Ok(false);
        };
        let signaled = self.device.fence_status(fence).map_err(|source| {
            ResourceError::UnableToQueryFence {
                handle: resource.handle,
                source,
            }
        })?;
        Ok(!signaled)
    }

    /// Pop a free resource for the descriptor which the GPU is done with.
    fn take_free(
        &mut self,
        descriptor: &ResourceDescriptor,
    ) -> Result<Option<ResourceHandle>, ResourceError> {
        let Some(candidates) = self.free.get(descriptor) else {
            return Ok(None);
        };
        let mut idle = None;
        for (position, handle) in candidates.iter().enumerate() {
            if !self.gpu_busy(&self.resources[handle.0 as usize])? {
                idle = Some(position);
                break;
            }
        }
        Ok(idle.and_then(|position| {
            self.free
                .get_mut(descriptor)
                .map(|candidates| candidates.swap_remove(position))
        }))
    }

    fn create(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        let handle = ResourceHandle(self.resources.len() as u32);
        let name = format!("Resource {}", handle.0);
        let (object, suballocation) = match descriptor {
            ResourceDescriptor::Buffer {
                size,
                usage,
                memory,
            } => {
                let create_info = vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                self.create_buffer(&descriptor, &create_info, memory, &name)?
            }
            ResourceDescriptor::Image {
                width,
                height,
                format,
                mip_levels,
                array_layers,
                flags,
                usage,
                memory,
            } => {
                let create_info = vk::ImageCreateInfo::default()
                    .flags(flags)
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(mip_levels)
                    .array_layers(array_layers)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                self.create_image(&descriptor, &create_info, memory, &name)?
            }
        };

        log::debug!(
            "Created {:?} for {:?} at offset {} of {:?}",
            handle,
            descriptor,
            suballocation.offset,
            suballocation.block
        );
        self.resources.push(ManagedResource {
            handle,
            descriptor,
            object,
            suballocation,
            lease: Lease::Free,
            in_flight: None,
        });
        Ok(handle)
    }

    fn create_buffer(
        &mut self,
        descriptor: &ResourceDescriptor,
        create_info: &vk::BufferCreateInfo,
        memory: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<(GpuObject, Suballocation), ResourceError> {
        let creation_failed = |source| ResourceError::ResourceCreationFailed {
            descriptor: *descriptor,
            source,
        };
        let buffer = unsafe {
            self.device
                .create_buffer(create_info)
                .map_err(creation_failed)?
        };
        let requirements = self.device.buffer_memory_requirements(buffer);
        let suballocation = match self.allocator.allocate(&requirements, memory)
        {
            Ok(suballocation) => suballocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(err.into());
            }
        };
        let bound = unsafe {
            self.device.bind_buffer_memory(
                buffer,
                suballocation.memory,
                suballocation.offset,
            )
        };
        if let Err(source) = bound {
            unsafe {
                self.device.destroy_buffer(buffer);
                self.allocator.release(&suballocation)?;
            }
            return Err(creation_failed(source));
        }

        self.device
            .set_debug_name(vk::ObjectType::BUFFER, buffer.as_raw(), name);
        Ok((GpuObject::Buffer(buffer), suballocation))
    }

    fn create_image(
        &mut self,
        descriptor: &ResourceDescriptor,
        create_info: &vk::ImageCreateInfo,
        memory: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<(GpuObject, Suballocation), ResourceError> {
        let creation_failed = |source| ResourceError::ResourceCreationFailed {
            descriptor: *descriptor,
            source,
        };
        let image = unsafe {
            self.device
                .create_image(create_info)
                .map_err(creation_failed)?
        };
        let requirements = self.device.image_memory_requirements(image);
        let suballocation = match self.allocator.allocate(&requirements, memory)
        {
            Ok(suballocation) => suballocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image) };
                return Err(err.into());
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(descriptor.view_type())
            .format(create_info.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: descriptor.aspect_mask(),
                base_mip_level: 0,
                level_count: create_info.mip_levels,
                base_array_layer: 0,
                layer_count: create_info.array_layers,
            });
        let view = unsafe {
            self.device
                .bind_image_memory(
                    image,
                    suballocation.memory,
                    suballocation.offset,
                )
                .and_then(|()| self.device.create_image_view(&view_info))
        };
        let view = match view {
            Ok(view) => view,
            Err(source) => {
                unsafe {
                    self.device.destroy_image(image);
                    self.allocator.release(&suballocation)?;
                }
                return Err(creation_failed(source));
            }
        };

        self.device
            .set_debug_name(vk::ObjectType::IMAGE, image.as_raw(), name);
        self.device.set_debug_name(
            vk::ObjectType::IMAGE_VIEW,
            view.as_raw(),
            &format!("{} View", name),
        );
        Ok((GpuObject::Image { image, view }, suballocation))
    }

    fn copy_through_staging(
        &mut self,
        staging: ResourceHandle,
        handle: ResourceHandle,
        bytes: &[u8],
        commands: &mut CommandPoolManager,
    ) -> Result<(), ResourceError> {
        self.write(staging, 0, bytes)?;
        let src = self
            .resource(staging)?
            .buffer()
            .ok_or(ResourceError::NotABuffer(staging))?;
        let dst = self
            .resource(handle)?
            .buffer()
            .ok_or(ResourceError::NotABuffer(handle))?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: bytes.len() as vk::DeviceSize,
        };
        commands
            .submit_one_time(QueueCapability::Transfer, |device, cmd| {
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
                Ok(())
            })
            .map_err(|source| ResourceError::UploadFailed { handle, source })
    }

    unsafe fn destroy_object(&self, object: GpuObject) {
        match object {
            GpuObject::Buffer(buffer) => self.device.destroy_buffer(buffer),
            GpuObject::Image { image, view } => {
                self.device.destroy_image_view(view);
                self.device.destroy_image(image);
            }
        }
    }
}

impl Drop for ResourceCache {
    /// # DANGER
    ///
    /// There is no internal synchronization for this type. Unexpected behavior
    /// can occur if the GPU still uses any resource when it is dropped.
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(err) = unsafe { self.destroy_all() } {
            log::error!("Error while destroying the resource cache: {}", err);
        }
    }
}
