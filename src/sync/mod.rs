//! Frames in flight.
//!
//! The [SyncManager] owns N [FrameSlot]s and cycles through them round-robin.
//! Acquiring a slot waits for the GPU to finish the work submitted the last
//! time the slot was used, which bounds the number of frames in flight to N.

mod frame_slot;
mod sync_manager;

use {ash::vk, std::time::Duration, thiserror::Error};

pub use self::{frame_slot::FrameSlot, sync_manager::SyncManager};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Frames in flight must be between 1 and 8, got {}", .0)]
    InvalidFrameCount(usize),

    #[error("Unable to create synchronization objects for frame slot {}", .slot)]
    UnableToCreateSyncObjects {
        slot: usize,
        #[source]
        source: vk::Result,
    },

    #[error(
        "Frame slot {} did not retire within {:?}. The device is likely lost",
        .slot,
        .timeout
    )]
    DeviceTimeout { slot: usize, timeout: Duration },

    #[error("The device was lost while waiting on frame slot {}", .slot)]
    DeviceLost {
        slot: usize,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to reset the fence for frame slot {}", .slot)]
    UnableToResetFence {
        slot: usize,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to submit commands for frame slot {}", .slot)]
    UnableToSubmit {
        slot: usize,
        #[source]
        source: vk::Result,
    },

    #[error(
        "Frame slot {} was submitted out of order, slot {} is current",
        .submitted,
        .current
    )]
    SlotOutOfOrder { submitted: usize, current: usize },

    #[error("The frame slots have already been destroyed")]
    Destroyed,
}

impl SyncError {
    /// Timeouts, device loss, and destroyed slots leave no way to keep
    /// rendering.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceTimeout { .. } | Self::DeviceLost { .. } | Self::Destroyed
        )
    }
}
