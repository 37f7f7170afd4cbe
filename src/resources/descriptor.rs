use ash::vk;

/// Everything needed to create a GPU resource.
///
/// Descriptors are the cache key. Two descriptors with identical fields are
/// interchangeable, so a released resource can be handed to anyone who asks
/// for the same descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceDescriptor {
    Buffer {
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    },
    Image {
        width: u32,
        height: u32,
        format: vk::Format,
        mip_levels: u32,

        /// Six layers, one per face, for cubemaps.
        array_layers: u32,
        flags: vk::ImageCreateFlags,
        usage: vk::ImageUsageFlags,
        memory: vk::MemoryPropertyFlags,
    },
}

impl ResourceDescriptor {
    /// A device-local vertex buffer which can be filled with an upload.
    pub fn vertex_buffer(size: vk::DeviceSize) -> Self {
        Self::Buffer {
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// A device-local index buffer which can be filled with an upload.
    pub fn index_buffer(size: vk::DeviceSize) -> Self {
        Self::Buffer {
            size,
            usage: vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// A host-visible uniform buffer, written directly by the CPU each frame.
    pub fn uniform_buffer(size: vk::DeviceSize) -> Self {
        Self::Buffer {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    pub fn storage_buffer(size: vk::DeviceSize) -> Self {
        Self::Buffer {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// A host-visible transfer source used to upload into device-local
    /// buffers.
    pub fn staging_buffer(size: vk::DeviceSize) -> Self {
        Self::Buffer {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    pub fn color_attachment(width: u32, height: u32, format: vk::Format) -> Self {
        Self::Image {
            width,
            height,
            format,
            mip_levels: 1,
            array_layers: 1,
            flags: vk::ImageCreateFlags::empty(),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    pub fn depth_attachment(width: u32, height: u32, format: vk::Format) -> Self {
        Self::Image {
            width,
            height,
            format,
            mip_levels: 1,
            array_layers: 1,
            flags: vk::ImageCreateFlags::empty(),
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// A device-local 2D texture sampled by shaders. `mip_levels` is clamped
    /// to at least one level.
    pub fn sampled_texture(
        width: u32,
        height: u32,
        format: vk::Format,
        mip_levels: u32,
    ) -> Self {
        Self::Image {
            width,
            height,
            format,
            mip_levels: mip_levels.max(1),
            array_layers: 1,
            flags: vk::ImageCreateFlags::empty(),
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// A device-local cubemap with six square faces of `size` pixels.
    pub fn cubemap(size: u32, format: vk::Format) -> Self {
        Self::Image {
            width: size,
            height: size,
            format,
            mip_levels: 1,
            array_layers: 6,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// The memory properties the backing memory must have.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        match self {
            Self::Buffer { memory, .. } | Self::Image { memory, .. } => *memory,
        }
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer { .. })
    }

    /// The view type used for the default image view.
    pub(super) fn view_type(&self) -> vk::ImageViewType {
        match self {
            Self::Image { flags, .. }
                if flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE) =>
            {
                vk::ImageViewType::CUBE
            }
            Self::Image { array_layers, .. } if *array_layers > 1 => {
                vk::ImageViewType::TYPE_2D_ARRAY
            }
            _ => vk::ImageViewType::TYPE_2D,
        }
    }

    /// The aspect used for the default image view.
    pub(super) fn aspect_mask(&self) -> vk::ImageAspectFlags {
        match self {
            Self::Image { usage, .. }
                if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) =>
            {
                vk::ImageAspectFlags::DEPTH
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn identical_descriptors_are_the_same_key() {
        let mut keys = HashSet::new();
        keys.insert(ResourceDescriptor::vertex_buffer(1024));
        keys.insert(ResourceDescriptor::vertex_buffer(1024));
        keys.insert(ResourceDescriptor::index_buffer(1024));
        keys.insert(ResourceDescriptor::vertex_buffer(2048));

        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn depth_images_use_the_depth_aspect() {
        let depth =
            ResourceDescriptor::depth_attachment(4, 4, vk::Format::D32_SFLOAT);
        let color =
            ResourceDescriptor::color_attachment(4, 4, vk::Format::R8G8B8A8_SRGB);

        assert_eq!(depth.aspect_mask(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(color.aspect_mask(), vk::ImageAspectFlags::COLOR);
        assert!(!color.is_buffer());
        assert!(ResourceDescriptor::uniform_buffer(64).is_host_visible());
    }

    #[test]
    fn cubemaps_get_six_faces_and_a_cube_view() {
        let cube = ResourceDescriptor::cubemap(128, vk::Format::R8G8B8A8_SRGB);
        let texture = ResourceDescriptor::sampled_texture(
            128,
            128,
            vk::Format::R8G8B8A8_SRGB,
            0,
        );

        assert!(matches!(
            cube,
            ResourceDescriptor::Image {
                width: 128,
                height: 128,
                array_layers: 6,
                ..
            }
        ));
        assert_eq!(cube.view_type(), vk::ImageViewType::CUBE);
        assert_eq!(texture.view_type(), vk::ImageViewType::TYPE_2D);
        assert!(matches!(
            texture,
            ResourceDescriptor::Image { mip_levels: 1, .. }
        ));
        assert!(!cube.is_host_visible());
    }
}
