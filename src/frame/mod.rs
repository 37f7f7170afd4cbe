//! The per-frame acquire, record, submit, present, advance protocol.

mod frame;
mod orchestrator;

use {
    crate::{
        commands::CommandError, resources::ResourceError,
        swapchain::SwapchainError, sync::SyncError,
    },
    thiserror::Error,
};

pub use self::{frame::Frame, orchestrator::FrameOrchestrator};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Swapchain(#[from] SwapchainError),

    #[error(transparent)]
    Commands(#[from] CommandError),

    #[error(transparent)]
    Resources(#[from] ResourceError),

    #[error("Recording failed for frame {}", .frame_index)]
    RecordingFailed {
        frame_index: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Frame {} was started but never ended", .0)]
    FrameInProgress(u64),

    #[error(
        "Frame {} does not match the frame in progress ({:?})",
        .found,
        .expected
    )]
    FrameMismatch { expected: Option<u64>, found: u64 },
}

impl FrameError {
    /// Fatal errors end rendering. The caller should shut down the
    /// [crate::GpuContext] instead of starting another frame.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Sync(err) => err.is_fatal(),
            Self::Swapchain(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// The result of [FrameOrchestrator::begin_frame].
#[derive(Debug)]
pub enum FrameStatus {
    /// A swapchain image was acquired and the frame's command buffer is
    /// recording. Pass the frame to [FrameOrchestrator::end_frame].
    Acquired(Frame),

    /// The swapchain is stale and could not be rebuilt yet (e.g. the window
    /// is minimized). Nothing was recorded and the frame index did not
    /// advance.
    Skipped,
}

/// The result of [FrameOrchestrator::render_frame].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation.
    Presented { frame_index: u64, image_index: u32 },
    Skipped,
}
