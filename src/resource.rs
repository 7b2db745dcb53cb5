//! Descriptions of the resources the capture layer tracks.
//!
//! Every tracked object gets a `ResourceKind` when it's created, and keeps
//! it for life. Code that needs to know what an object is matches on the
//! kind; nothing ever probes a handle to find out.

use crate::format::Format;
use crate::id::ResourceId;
use crate::serialize::{Deserialize, DeserializeError, Serialize};

use bitflags::bitflags;

bitflags! {
    /// The ways a resource may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const STREAM_OUTPUT = 1 << 4;
        const RENDER_TARGET = 1 << 5;
        const DEPTH_STENCIL = 1 << 6;
        const UNORDERED_ACCESS = 1 << 7;
    }
}

impl Serialize for BindFlags {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.bits().serialize(out)
    }
}

impl Deserialize for BindFlags {
    fn deserialize(buf: &mut &[u8]) -> Result<BindFlags, DeserializeError> {
        let bits = u32::deserialize(buf)?;
        BindFlags::from_bits(bits).ok_or(DeserializeError::BadEnum { what: "bind flags", value: bits as u64 })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Usage {
    #[default]
    Default,
    Dynamic,
    /// CPU-readable copies. Never bound to the pipeline.
    Staging,
}

impl Serialize for Usage {
    fn serialize(&self, out: &mut Vec<u8>) {
        let tag: u8 = match self {
            Usage::Default => 0,
            Usage::Dynamic => 1,
            Usage::Staging => 2,
        };
        tag.serialize(out)
    }
}

impl Deserialize for Usage {
    fn deserialize(buf: &mut &[u8]) -> Result<Usage, DeserializeError> {
        match u8::deserialize(buf)? {
            0 => Ok(Usage::Default),
            1 => Ok(Usage::Dynamic),
            2 => Ok(Usage::Staging),
            other => Err(DeserializeError::BadEnum { what: "usage", value: other as u64 }),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub byte_width: u32,
    pub bind: BindFlags,
    pub usage: Usage,
}

impl BufferDesc {
    pub fn staging(&self) -> BufferDesc {
        BufferDesc {
            byte_width: self.byte_width,
            bind: BindFlags::empty(),
            usage: Usage::Staging,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    D1,
    D2,
    D3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub dimension: Dimension,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array size otherwise.
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub sample_count: u32,
    pub bind: BindFlags,
    pub usage: Usage,
}

impl TextureDesc {
    /// A single-mip, single-sample 2D texture.
    pub fn new_2d(width: u32, height: u32, format: Format, bind: BindFlags) -> TextureDesc {
        TextureDesc {
            dimension: Dimension::D2,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            sample_count: 1,
            bind,
            usage: Usage::Default,
        }
    }

    pub fn array_size(&self) -> u32 {
        match self.dimension {
            Dimension::D3 => 1,
            _ => self.depth_or_array_size.max(1),
        }
    }

    pub fn is_multisampled(&self) -> bool {
        self.sample_count > 1
    }

    /// Number of subresources: one per mip per array slice. Multisampled
    /// textures have one subresource per slice; their samples aren't
    /// separately addressable.
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels.max(1) * self.array_size()
    }

    /// Split a subresource index into (mip, array slice).
    pub fn subresource_mip_slice(&self, subresource: u32) -> (u32, u32) {
        let mips = self.mip_levels.max(1);
        (subresource % mips, subresource / mips)
    }

    /// Width, height and depth of `mip`.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        let depth = match self.dimension {
            Dimension::D3 => (self.depth_or_array_size >> mip).max(1),
            _ => 1,
        };
        let height = match self.dimension {
            Dimension::D1 => 1,
            _ => (self.height >> mip).max(1),
        };
        ((self.width >> mip).max(1), height, depth)
    }

    /// Bytes in subresource `subresource` when tightly packed.
    pub fn subresource_bytes(&self, subresource: u32) -> usize {
        let (mip, _) = self.subresource_mip_slice(subresource);
        let (w, h, d) = self.mip_extent(mip);
        self.format.row_bytes(w) as usize * self.format.row_count(h) as usize * d as usize
    }

    /// The description of a CPU-readable copy of this texture.
    ///
    /// Multisampled textures become an array with one slice per sample per
    /// original slice, and depth formats become typeless.
    pub fn staging(&self) -> TextureDesc {
        let mut desc = *self;
        if self.is_multisampled() {
            desc.depth_or_array_size = self.array_size() * self.sample_count;
            desc.sample_count = 1;
        }
        desc.format = self.format.typeless();
        desc.bind = BindFlags::empty();
        desc.usage = Usage::Staging;
        desc
    }
}

/// What kind of context a context resource is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Immediate,
    Deferred,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub fullscreen: bool,
}

impl SwapChainDesc {
    pub fn backbuffer_desc(&self) -> TextureDesc {
        TextureDesc::new_2d(
            self.width,
            self.height,
            self.format,
            BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
        )
    }
}

/// The kind of a tracked object, fixed at creation.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceKind {
    Device,
    Context(ContextKind),
    CommandList,
    SwapChain(SwapChainDesc),
    Buffer(BufferDesc),
    Texture(TextureDesc),
    /// An unordered-access view of `buffer` with a hidden counter.
    CounterView { buffer: ResourceId },
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Device => "device",
            ResourceKind::Context(ContextKind::Immediate) => "immediate context",
            ResourceKind::Context(ContextKind::Deferred) => "deferred context",
            ResourceKind::CommandList => "command list",
            ResourceKind::SwapChain(_) => "swap chain",
            ResourceKind::Buffer(_) => "buffer",
            ResourceKind::Texture(_) => "texture",
            ResourceKind::CounterView { .. } => "counter view",
        }
    }

    /// Byte length, for resources with contents.
    pub fn byte_length(&self) -> u64 {
        match self {
            ResourceKind::Buffer(desc) => desc.byte_width as u64,
            ResourceKind::Texture(desc) => (0..desc.subresource_count())
                .map(|s| desc.subresource_bytes(s) as u64 * desc.sample_count.max(1) as u64)
                .sum(),
            _ => 0,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        match self {
            ResourceKind::Buffer(_) => 1,
            ResourceKind::Texture(desc) => desc.subresource_count(),
            _ => 0,
        }
    }
}

impl Serialize for BufferDesc {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.byte_width.serialize(out);
        self.bind.serialize(out);
        self.usage.serialize(out);
    }
}

impl Deserialize for BufferDesc {
    fn deserialize(buf: &mut &[u8]) -> Result<BufferDesc, DeserializeError> {
        Ok(BufferDesc {
            byte_width: u32::deserialize(buf)?,
            bind: BindFlags::deserialize(buf)?,
            usage: Usage::deserialize(buf)?,
        })
    }
}

impl Serialize for TextureDesc {
    fn serialize(&self, out: &mut Vec<u8>) {
        let dimension: u8 = match self.dimension {
            Dimension::D1 => 1,
            Dimension::D2 => 2,
            Dimension::D3 => 3,
        };
        dimension.serialize(out);
        self.width.serialize(out);
        self.height.serialize(out);
        self.depth_or_array_size.serialize(out);
        self.mip_levels.serialize(out);
        self.format.serialize(out);
        self.sample_count.serialize(out);
        self.bind.serialize(out);
        self.usage.serialize(out);
    }
}

impl Deserialize for TextureDesc {
    fn deserialize(buf: &mut &[u8]) -> Result<TextureDesc, DeserializeError> {
        let dimension = match u8::deserialize(buf)? {
            1 => Dimension::D1,
            2 => Dimension::D2,
            3 => Dimension::D3,
            other => return Err(DeserializeError::BadEnum { what: "dimension", value: other as u64 }),
        };
        Ok(TextureDesc {
            dimension,
            width: u32::deserialize(buf)?,
            height: u32::deserialize(buf)?,
            depth_or_array_size: u32::deserialize(buf)?,
            mip_levels: u32::deserialize(buf)?,
            format: Format::deserialize(buf)?,
            sample_count: u32::deserialize(buf)?,
            bind: BindFlags::deserialize(buf)?,
            usage: Usage::deserialize(buf)?,
        })
    }
}

impl Serialize for SwapChainDesc {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.width.serialize(out);
        self.height.serialize(out);
        self.format.serialize(out);
        self.fullscreen.serialize(out);
    }
}

impl Deserialize for SwapChainDesc {
    fn deserialize(buf: &mut &[u8]) -> Result<SwapChainDesc, DeserializeError> {
        Ok(SwapChainDesc {
            width: u32::deserialize(buf)?,
            height: u32::deserialize(buf)?,
            format: Format::deserialize(buf)?,
            fullscreen: bool::deserialize(buf)?,
        })
    }
}

#[test]
fn test_multisampled_staging_desc() {
    let mut desc = TextureDesc::new_2d(128, 64, Format::D24UnormS8Uint, BindFlags::DEPTH_STENCIL);
    desc.depth_or_array_size = 2;
    desc.sample_count = 4;

    let staging = desc.staging();
    assert_eq!(staging.sample_count, 1);
    assert_eq!(staging.array_size(), 8);
    assert_eq!(staging.format, Format::R24G8Typeless);
    assert_eq!(staging.usage, Usage::Staging);
    assert!(staging.bind.is_empty());
}

#[test]
fn test_subresource_layout() {
    let mut desc = TextureDesc::new_2d(16, 8, Format::Rgba8Unorm, BindFlags::SHADER_RESOURCE);
    desc.mip_levels = 3;
    desc.depth_or_array_size = 2;
    assert_eq!(desc.subresource_count(), 6);
    assert_eq!(desc.subresource_mip_slice(4), (1, 1));
    assert_eq!(desc.mip_extent(2), (4, 2, 1));
    assert_eq!(desc.subresource_bytes(2), 4 * 4 * 2);

    let mut volume = desc;
    volume.dimension = Dimension::D3;
    volume.depth_or_array_size = 4;
    volume.mip_levels = 1;
    assert_eq!(volume.subresource_count(), 1);
    assert_eq!(volume.subresource_bytes(0), 16 * 4 * 8 * 4);
}
