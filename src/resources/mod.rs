//! GPU buffers and images backed by the memory allocator, cached by
//! descriptor.
//!
//! Resources are never destroyed individually. A released resource goes back
//! to the cache and is handed to the next caller with an identical
//! descriptor. Everything is destroyed at once by
//! [ResourceCache::destroy_all].

mod cache;
mod descriptor;

use {
    crate::{
        commands::CommandError,
        memory::{AllocatorError, AllocatorStats, Suballocation},
    },
    ash::vk,
    thiserror::Error,
};

pub use self::{cache::ResourceCache, descriptor::ResourceDescriptor};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Unable to create a resource for {:?}", .descriptor)]
    ResourceCreationFailed {
        descriptor: ResourceDescriptor,
        #[source]
        source: vk::Result,
    },

    #[error(transparent)]
    AllocatorError(#[from] AllocatorError),

    #[error("Resource {:?} is not leased", .0)]
    NotLeased(ResourceHandle),

    #[error("Resource {:?} is not owned by this cache", .0)]
    UnknownResource(ResourceHandle),

    #[error("Resource {:?} is still in use by the GPU", .0)]
    InUseByGpu(ResourceHandle),

    #[error("Resource {:?} is not host visible", .0)]
    NotHostVisible(ResourceHandle),

    #[error("Resource {:?} is not a buffer", .0)]
    NotABuffer(ResourceHandle),

    #[error(
        "Writing {} bytes at offset {} overflows resource {:?} ({} bytes)",
        .len,
        .offset,
        .handle,
        .size
    )]
    OutOfBounds {
        handle: ResourceHandle,
        offset: vk::DeviceSize,
        len: usize,
        size: vk::DeviceSize,
    },

    #[error("Unable to check the fence guarding resource {:?}", .handle)]
    UnableToQueryFence {
        handle: ResourceHandle,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to upload data to resource {:?}", .handle)]
    UploadFailed {
        handle: ResourceHandle,
        #[source]
        source: CommandError,
    },

    #[error("The resource cache has been destroyed")]
    CacheDestroyed,
}

/// Identifies a [ManagedResource] within its [ResourceCache].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u32);

/// The Vulkan objects behind a resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpuObject {
    Buffer(vk::Buffer),
    Image {
        image: vk::Image,
        view: vk::ImageView,
    },
}

/// Who currently holds a resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lease {
    Free,

    /// Held by exactly one caller.
    Exclusive,

    /// Held by this many callers of [ResourceCache::acquire_shared].
    Shared(u32),
}

/// A buffer or image, the memory it is bound to, and the descriptor it was
/// created from.
#[derive(Debug)]
pub struct ManagedResource {
    handle: ResourceHandle,
    descriptor: ResourceDescriptor,
    object: GpuObject,
    suballocation: Suballocation,
    lease: Lease,

    /// The fence of the last submission which used this resource.
    in_flight: Option<vk::Fence>,
}

impl ManagedResource {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn object(&self) -> GpuObject {
        self.object
    }

    /// The raw buffer, if this resource is a buffer.
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.object {
            GpuObject::Buffer(buffer) => Some(buffer),
            GpuObject::Image { .. } => None,
        }
    }

    /// The raw image and its default view, if this resource is an image.
    pub fn image(&self) -> Option<(vk::Image, vk::ImageView)> {
        match self.object {
            GpuObject::Image { image, view } => Some((image, view)),
            GpuObject::Buffer(_) => None,
        }
    }

    pub fn suballocation(&self) -> &Suballocation {
        &self.suballocation
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }
}

/// A snapshot of the cache contents.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resources: usize,
    pub leased: usize,
    pub shared: usize,
    pub free: usize,
    pub memory: AllocatorStats,
}
