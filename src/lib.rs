//! Frame capture and replay for a D3D11-style graphics API.
//!
//! A `Device` wraps a native `Driver` and stands between it and the
//! application. It gives every object the application creates a
//! `ResourceId` and a record of the chunks that describe it, and passes
//! every call made on its contexts through to the driver. When asked to, it
//! captures one frame: from the present that starts it to the present that
//! ends it, every call is logged, every resource the frame uses is noted,
//! and the contents of those resources as they were before the frame are
//! saved. The result is written to a capture file.
//!
//! A `Replayer` loads a capture file, recreates the frame's resources on
//! another `Driver`, and replays all or part of the frame's calls.
//!
//! The `soft` module has a simple CPU implementation of `Driver`, which the
//! tests and the command-line tools use.

#[macro_use]
mod error;

pub mod call;
pub mod chunk;
pub mod context;
pub mod device;
pub mod driver;
pub mod file_stream;
pub mod format;
pub mod frame;
pub mod id;
pub mod initial;
pub mod options;
pub mod pixels;
pub mod record;
pub mod registry;
pub mod replay;
pub mod resource;
pub mod rle;
pub mod serialize;
pub mod soft;
pub mod version;

pub use call::Call;
pub use chunk::{Chunk, ChunkType};
pub use device::{Context, Device};
pub use driver::{Driver, DriverError, MapType, SubresourceData};
pub use error::{CaptureError, ReplayError};
pub use file_stream::CaptureFile;
pub use format::Format;
pub use frame::{CaptureFailReason, CapturedFrame, FrameOutcome};
pub use id::ResourceId;
pub use options::CaptureOptions;
pub use replay::Replayer;
pub use resource::{BindFlags, BufferDesc, ResourceKind, SwapChainDesc, TextureDesc, Usage};
pub use soft::SoftDriver;
