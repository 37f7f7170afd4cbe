use {
    super::AllocatorError,
    crate::device::MemoryProperties,
    ash::vk,
};

/// Coarse classification of a memory type by locality and host visibility.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Only the GPU can access it. The fastest memory for GPU work.
    DeviceLocal,

    /// Host memory the GPU can read over the bus. Used for staging and
    /// per-frame uniforms.
    HostVisible,

    /// Host visible memory with host caching, good for readback.
    HostCached,

    /// Device memory the host can map directly. Usually a small heap.
    DeviceLocalHostVisible,

    Other,
}

impl MemoryClass {
    pub fn from_flags(flags: vk::MemoryPropertyFlags) -> Self {
        let device_local = flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let host_cached = flags.contains(vk::MemoryPropertyFlags::HOST_CACHED);
        match (device_local, host_visible, host_cached) {
            (true, true, _) => Self::DeviceLocalHostVisible,
            (true, false, _) => Self::DeviceLocal,
            (false, true, true) => Self::HostCached,
            (false, true, false) => Self::HostVisible,
            (false, false, _) => Self::Other,
        }
    }

    pub fn is_host_visible(&self) -> bool {
        matches!(
            self,
            Self::HostVisible | Self::HostCached | Self::DeviceLocalHostVisible
        )
    }
}

/// Pick the memory type for a resource.
///
/// Of the types allowed by `type_bits` whose flags contain every `required`
/// flag, the one with the fewest additional flags wins. This keeps requests
/// for plain device-local memory out of the small device-local host-visible
/// heap. Ties go to the lowest index, which is the device's preference order.
pub fn find_memory_type(
    properties: &MemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, AllocatorError> {
    properties
        .memory_types
        .iter()
        .enumerate()
        .filter(|(index, memory_type)| {
            let type_supported = type_bits & (1 << index) != 0;
            let properties_supported =
                memory_type.property_flags.contains(required);
            type_supported && properties_supported
        })
        .min_by_key(|(index, memory_type)| {
            let extra = memory_type.property_flags.as_raw() & !required.as_raw();
            (extra.count_ones(), *index)
        })
        .map(|(index, _)| index as u32)
        .ok_or(AllocatorError::NoSuitableMemoryType {
            required,
            type_bits,
        })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::device::{HeadlessDevice, MemoryType},
    };

    fn class_of(properties: &MemoryProperties, index: u32) -> MemoryClass {
        MemoryClass::from_flags(
            properties.memory_types[index as usize].property_flags,
        )
    }

    #[test]
    fn device_only_requests_avoid_host_visible_device_memory() {
        let device = HeadlessDevice::builder().build();
        let properties = crate::device::GpuDevice::memory_properties(&device);

        let index = find_memory_type(
            properties,
            u32::MAX,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

        assert_eq!(class_of(properties, index), MemoryClass::DeviceLocal);
    }

    #[test]
    fn smallest_superset_wins_regardless_of_order() {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            heap_sizes: vec![1024, 1024],
        };

        let index = find_memory_type(
            &properties,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();

        assert_eq!(index, 1);
    }

    #[test]
    fn type_bits_exclude_otherwise_matching_types() {
        let device = HeadlessDevice::builder().build();
        let properties = crate::device::GpuDevice::memory_properties(&device);

        // only the device-local host-visible type (index 3) is allowed
        let index = find_memory_type(
            properties,
            0b1000,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert_eq!(index, 3);

        let result = find_memory_type(
            properties,
            0b0001,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert!(matches!(
            result,
            Err(AllocatorError::NoSuitableMemoryType { .. })
        ));
    }

    #[test]
    fn memory_classes() {
        assert_eq!(
            MemoryClass::from_flags(
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryClass::HostCached
        );
        assert!(!MemoryClass::DeviceLocal.is_host_visible());
        assert!(MemoryClass::DeviceLocalHostVisible.is_host_visible());
    }
}
