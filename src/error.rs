//! Error types shared across capture and replay.

use crate::chunk::ChunkType;
use crate::driver::DriverError;
use crate::id::ResourceId;
use crate::serialize::DeserializeError;

use std::io;

/// Report a broken internal invariant.
///
/// Debug builds panic. Release builds log the problem and carry on, so that a
/// capture layer bug never takes down the application being captured.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        debug_assert!(false, $($arg)*);
    }};
}

/// Errors reported to the application-facing capture API.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("resource {id} is a {found}, expected a {expected}")]
    WrongKind {
        id: ResourceId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("no frame capture is in progress")]
    NotCapturing,

    #[error("a frame capture is already in progress")]
    AlreadyCapturing,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("error writing capture: {0}")]
    Io(#[from] io::Error),

    #[error("invalid capture options: {0}")]
    Options(#[from] toml::de::Error),
}

/// Errors loading or replaying a capture file.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("error reading capture: {0}")]
    Io(#[from] io::Error),

    #[error("not a capture file (magic number {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported capture container version {0}")]
    BadContainer(u32),

    /// The file was written by a build whose chunk formats we can't parse.
    #[error("capture format version {found:#04x} is incompatible with this build (current is {current:#04x})")]
    IncompatibleVersion { found: u32, current: u32 },

    #[error("malformed capture: {0}")]
    Deserialize(#[from] DeserializeError),

    #[error("expected a {expected:?} chunk, found chunk tag {found}")]
    UnexpectedChunk { expected: ChunkType, found: u32 },

    #[error("capture refers to unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("capture creates resource {0} twice")]
    DuplicateResource(ResourceId),

    #[error("event {event} is out of range: the frame has {count} events")]
    EventOutOfRange { event: u32, count: u32 },

    #[error(transparent)]
    Driver(#[from] DriverError),
}
