//! GPU resource and frame synchronization management over Vulkan.
//!
//! Buffers and images come from the [resources::ResourceCache], backed by the
//! [memory::MemoryAllocator]. Per-frame work runs through the
//! [frame::FrameOrchestrator], which bounds the frames in flight with the
//! [sync::SyncManager] and keeps the swapchain current with the
//! [swapchain::SwapchainCoordinator]. [GpuContext] owns all of them.
//!
//! Every subsystem talks to the GPU through [device::GpuDevice], so the whole
//! crate also runs against the in-process [device::HeadlessDevice].

mod context;

pub mod commands;
pub mod config;
pub mod device;
pub mod frame;
pub mod logging;
pub mod memory;
pub mod resources;
pub mod swapchain;
pub mod sync;

pub use self::{config::EngineConfig, context::GpuContext};
