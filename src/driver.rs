//! The native graphics API underneath the capture layer.
//!
//! Capture forwards every call to a `Driver`, and replay re-issues the
//! recorded calls against one. The trait covers the device/context/resource
//! model the capture layer understands: creation, pipeline binding, draws,
//! copies, and the blocking readbacks used to snapshot resource contents.
//!
//! Context methods take the handle of the context they're issued on. Calls on
//! a deferred context are recorded by the driver, and take effect when the
//! command list built from them is executed on the immediate context.

use crate::resource::{BufferDesc, SwapChainDesc, TextureDesc};
use crate::serialize::{Deserialize, DeserializeError, Serialize};

use std::fmt;
use std::hash::Hash;

/// The contents of one subresource, as passed to or returned from the
/// driver.
///
/// `row_pitch` and `depth_pitch` are the byte distances between rows and
/// between depth slices of `data`. They may be larger than the packed size.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubresourceData {
    pub data: Vec<u8>,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

impl SubresourceData {
    /// Tightly packed data: rows of `row_pitch` bytes, slices of
    /// `depth_pitch`.
    pub fn packed(data: Vec<u8>, row_pitch: u32, depth_pitch: u32) -> SubresourceData {
        SubresourceData { data, row_pitch, depth_pitch }
    }
}

impl Serialize for SubresourceData {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.row_pitch.serialize(out);
        self.depth_pitch.serialize(out);
        self.data.serialize(out);
    }
}

impl Deserialize for SubresourceData {
    fn deserialize(buf: &mut &[u8]) -> Result<SubresourceData, DeserializeError> {
        let row_pitch = u32::deserialize(buf)?;
        let depth_pitch = u32::deserialize(buf)?;
        Ok(SubresourceData {
            data: Vec::deserialize(buf)?,
            row_pitch,
            depth_pitch,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapType {
    Read,
    Write,
    ReadWrite,
    WriteDiscard,
    WriteNoOverwrite,
}

impl MapType {
    pub fn writes(self) -> bool {
        !matches!(self, MapType::Read)
    }

    pub fn reads(self) -> bool {
        matches!(self, MapType::Read | MapType::ReadWrite)
    }
}

impl Serialize for MapType {
    fn serialize(&self, out: &mut Vec<u8>) {
        let tag: u8 = match self {
            MapType::Read => 1,
            MapType::Write => 2,
            MapType::ReadWrite => 3,
            MapType::WriteDiscard => 4,
            MapType::WriteNoOverwrite => 5,
        };
        tag.serialize(out)
    }
}

impl Deserialize for MapType {
    fn deserialize(buf: &mut &[u8]) -> Result<MapType, DeserializeError> {
        Ok(match u8::deserialize(buf)? {
            1 => MapType::Read,
            2 => MapType::Write,
            3 => MapType::ReadWrite,
            4 => MapType::WriteDiscard,
            5 => MapType::WriteNoOverwrite,
            other => return Err(DeserializeError::BadEnum { what: "map type", value: other as u64 }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("out of memory creating {0}")]
    OutOfMemory(&'static str),

    #[error("mapping subresource {subresource} failed")]
    MapFailed { subresource: u32 },

    #[error("invalid handle {0}")]
    InvalidHandle(String),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("encoding readback data: {0}")]
    Encode(String),
}

/// A native graphics device and its contexts.
pub trait Driver {
    /// A native object: resource, view, context, command list or swap chain.
    type Handle: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn immediate_context(&self) -> Self::Handle;
    fn create_deferred_context(&mut self, debug: bool) -> Result<Self::Handle, DriverError>;

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>) -> Result<Self::Handle, DriverError>;
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial: Option<&[SubresourceData]>,
    ) -> Result<Self::Handle, DriverError>;
    fn create_counter_view(&mut self, buffer: Self::Handle) -> Result<Self::Handle, DriverError>;

    /// Create a swap chain, returning it and its back buffer.
    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> Result<(Self::Handle, Self::Handle), DriverError>;

    fn destroy(&mut self, handle: Self::Handle);

    fn set_render_targets(&mut self, ctx: Self::Handle, targets: &[Self::Handle]);
    fn set_constant_buffer(&mut self, ctx: Self::Handle, buffer: Option<Self::Handle>);

    /// Bind a counter view. `initial_count`, if given, resets its hidden
    /// counter.
    fn set_counter_view(&mut self, ctx: Self::Handle, view: Option<Self::Handle>, initial_count: Option<u32>);
    fn set_stream_out_target(&mut self, ctx: Self::Handle, buffer: Option<Self::Handle>);

    /// Unbind everything.
    fn clear_state(&mut self, ctx: Self::Handle);

    fn clear_render_target(&mut self, ctx: Self::Handle, target: Self::Handle, color: [f32; 4]);
    fn draw(&mut self, ctx: Self::Handle, vertex_count: u32, start_vertex: u32);

    /// Draw as many vertices as the bound stream-out target holds.
    fn draw_auto(&mut self, ctx: Self::Handle);
    fn dispatch(&mut self, ctx: Self::Handle, x: u32, y: u32, z: u32);

    fn update_subresource(
        &mut self,
        ctx: Self::Handle,
        resource: Self::Handle,
        subresource: u32,
        data: &SubresourceData,
    );
    fn copy_resource(&mut self, ctx: Self::Handle, dst: Self::Handle, src: Self::Handle);

    /// Copy a multisampled texture into a single-sample array texture with
    /// `sample_count` slices per source slice.
    fn copy_ms_to_array(&mut self, dst: Self::Handle, src: Self::Handle) -> Result<(), DriverError>;

    /// The inverse of `copy_ms_to_array`.
    fn copy_array_to_ms(&mut self, dst: Self::Handle, src: Self::Handle) -> Result<(), DriverError>;

    /// Write a counter view's hidden counter, as a little-endian `u32`, to
    /// the start of `dst`.
    fn copy_structure_count(&mut self, ctx: Self::Handle, dst: Self::Handle, view: Self::Handle);

    /// The hidden count of vertices written to a stream-out buffer.
    fn stream_out_count(&mut self, buffer: Self::Handle) -> u64;
    fn set_stream_out_count(&mut self, buffer: Self::Handle, count: u64);

    /// Map a subresource, returning a copy of its current contents. This
    /// blocks until the GPU is done with the resource.
    fn map(
        &mut self,
        ctx: Self::Handle,
        resource: Self::Handle,
        subresource: u32,
        map_type: MapType,
    ) -> Result<SubresourceData, DriverError>;

    /// Unmap a subresource. `written`, if present, is its new contents, laid
    /// out as `map` returned them.
    fn unmap(&mut self, ctx: Self::Handle, resource: Self::Handle, subresource: u32, written: Option<&[u8]>);

    fn finish_command_list(&mut self, ctx: Self::Handle, restore_state: bool) -> Result<Self::Handle, DriverError>;
    fn execute_command_list(&mut self, ctx: Self::Handle, list: Self::Handle, restore_state: bool);

    fn present(&mut self, swap_chain: Self::Handle, sync_interval: u32) -> Result<(), DriverError>;

    /// Drain any validation messages the driver has produced.
    fn take_debug_messages(&mut self) -> Vec<String> {
        Vec::new()
    }
}
