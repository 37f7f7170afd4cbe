//! Command pools and the command buffer state machine.
//!
//! Pools are created lazily, one per (queue family, transience) pair plus one
//! transient pool per frame slot, and live until the manager is destroyed.
//! Command buffers are handed out as [CommandBufferHandle]s. Every operation
//! checks the buffer's state and fails with [CommandError::InvalidState] on an
//! illegal transition.

mod one_time_submit;
mod pool_manager;

use {
    crate::device::QueueCapability, ash::vk, std::time::Duration,
    thiserror::Error,
};

pub use self::pool_manager::CommandPoolManager;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unable to create a command pool for queue family {}", .queue_family)]
    UnableToCreatePool {
        queue_family: u32,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to allocate command buffers from pool {:?}", .pool)]
    PoolExhausted {
        pool: PoolId,
        #[source]
        source: vk::Result,
    },

    #[error(
        "Command buffer {:?} is {:?}, expected {:?}",
        .buffer,
        .found,
        .expected
    )]
    InvalidState {
        buffer: CommandBufferHandle,
        expected: CommandBufferState,
        found: CommandBufferState,
    },

    #[error(
        "Pool {:?} is already recording command buffer {:?}",
        .pool,
        .recording
    )]
    AlreadyRecording {
        pool: PoolId,
        recording: CommandBufferHandle,
    },

    #[error("Command buffer {:?} belongs to a transient pool", .0)]
    IndividualResetNotAllowed(CommandBufferHandle),

    #[error("Pool {:?} is not owned by this manager", .0)]
    UnknownPool(PoolId),

    #[error("The device has no queue family for {:?} work", .0)]
    NoQueueFamily(QueueCapability),

    #[error("Unable to reset command pool {:?}", .pool)]
    UnableToResetPool {
        pool: PoolId,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to reset command buffer {:?}", .buffer)]
    UnableToResetBuffer {
        buffer: CommandBufferHandle,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to begin command buffer {:?}", .buffer)]
    UnableToBeginCommandBuffer {
        buffer: CommandBufferHandle,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to end command buffer {:?}", .buffer)]
    UnableToEndCommandBuffer {
        buffer: CommandBufferHandle,
        #[source]
        source: vk::Result,
    },

    #[error("Unable to create a fence for one-time submissions")]
    UnableToCreateFence(#[source] vk::Result),

    #[error("Unable to reset the fence for one-time submissions")]
    UnableToResetFence(#[source] vk::Result),

    #[error("Unable to submit one-time commands")]
    UnableToSubmit(#[source] vk::Result),

    #[error("One-time commands did not complete within {:?}", .0)]
    SubmissionTimeout(Duration),

    #[error("Error while waiting for one-time commands to complete")]
    UnableToWaitForSubmission(#[source] vk::Result),

    #[error("Error while recording one-time commands")]
    RecordingFailed(#[source] anyhow::Error),

    #[error("The command pool manager has been destroyed")]
    Destroyed,
}

/// Whether a pool's buffers are reclaimed in bulk or one at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transience {
    /// Short-lived buffers, reclaimed all at once with
    /// [CommandPoolManager::reset_pool]. Used for per-frame command buffers.
    Transient,

    /// Long-lived buffers which can be reset individually with
    /// [CommandPoolManager::reset_buffer].
    Reusable,
}

impl Transience {
    pub(crate) fn pool_flags(&self) -> vk::CommandPoolCreateFlags {
        match self {
            Self::Transient => vk::CommandPoolCreateFlags::TRANSIENT,
            Self::Reusable => {
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
            }
        }
    }
}

/// A snapshot of every pool's command buffers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CommandPoolStats {
    pub pools: usize,

    /// Buffers handed out since their pool was last reset.
    pub issued: usize,

    /// Buffers allocated from the device but not issued, ready for reuse.
    pub reclaimed: usize,

    pub total_buffers: usize,
}

/// Identifies a pool within its [CommandPoolManager].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(usize);

/// The key a pool is cached under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub queue_family: u32,
    pub transience: Transience,

    /// Set for the per-frame pools returned by
    /// [CommandPoolManager::get_frame_pool].
    pub frame_slot: Option<usize>,
}

/// The lifecycle of a command buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Submitted,

    /// The owning pool was reset or destroyed after the handle was issued.
    Invalid,
}

/// A command buffer issued by a [CommandPoolManager].
///
/// The handle carries the generation of its pool at the time it was issued.
/// Resetting the pool bumps the generation, so every older handle reads as
/// [CommandBufferState::Invalid] afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    pub pool: PoolId,
    index: u32,
    generation: u64,
}
