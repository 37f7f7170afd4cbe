//! The presentable image chain.
//!
//! The [SwapchainCoordinator] is the only owner of swapchain recreation. It
//! moves between the states in [SwapchainState] and refuses to hand out
//! images unless it is Valid.

mod coordinator;
mod selection;

use {crate::sync::SyncError, ash::vk, thiserror::Error};

pub use self::{
    coordinator::SwapchainCoordinator,
    selection::{
        choose_image_count, choose_present_mode, choose_surface_format,
        choose_swap_extent,
    },
};

#[derive(Debug, Error)]
pub enum SwapchainError {
    #[error("The swapchain no longer matches the surface and must be recreated")]
    SwapchainStale,

    #[error("The presentation surface was lost")]
    SurfaceLost(#[source] vk::Result),

    #[error("The device was lost")]
    DeviceLost(#[source] vk::Result),

    #[error("Unable to query the presentation surface")]
    UnableToQuerySurface(#[source] vk::Result),

    #[error("The surface does not support any image formats")]
    NoSurfaceFormats,

    #[error("Unable to create the swapchain")]
    UnableToCreateSwapchain(#[source] vk::Result),

    #[error("Unable to get the swapchain images")]
    UnableToGetSwapchainImages(#[source] vk::Result),

    #[error("Unable to create a view for a swapchain image")]
    UnableToCreateImageView(#[source] vk::Result),

    #[error("Unable to acquire a swapchain image")]
    UnableToAcquireImage(#[source] vk::Result),

    #[error("Unable to present a swapchain image")]
    UnableToPresent(#[source] vk::Result),

    #[error("Unable to wait for in-flight frames before recreating the swapchain")]
    FramesInFlight(#[from] SyncError),
}

impl SwapchainError {
    /// Surface and device loss end rendering for good.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SurfaceLost(_) | Self::DeviceLost(_) => true,
            Self::FramesInFlight(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Surface and device loss get their own variants. Everything else is
    /// wrapped by `otherwise`.
    pub(crate) fn classify(
        source: vk::Result,
        otherwise: fn(vk::Result) -> Self,
    ) -> Self {
        match source {
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost(source),
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(source),
            _ => otherwise(source),
        }
    }
}

/// The swapchain lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SwapchainState {
    /// The swapchain matches the surface and images can be acquired.
    Valid,

    /// The swapchain no longer matches the surface, or could not be created
    /// because the surface has zero area. Frames are skipped until it is
    /// recreated.
    Stale,

    /// In-flight frames are being retired and the images rebuilt.
    Recreating,
}
