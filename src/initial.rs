//! Initial contents: what a resource held before the captured frame began.
//!
//! The first time a captured frame touches a resource that has been written
//! since it was created, we take a snapshot of it, so that replay can put it
//! back the way it was before re-running the frame. There are four cases:
//!
//! - Buffers and textures are copied into a CPU-readable staging resource.
//!   Multisampled textures are expanded into an array with one slice per
//!   sample; depth formats are copied as their typeless equivalents.
//!
//! - Large render targets that the frame writes before it reads them get a
//!   clear marker instead of a copy. Nothing the frame does can observe
//!   their old contents, and copying them is expensive. See
//!   `BigTargetHeuristic`.
//!
//! - Counter views have a hidden counter, which is all we save.
//!
//! When the capture is written, `serialize` reads each staging copy back and
//! turns it into a chunk. On replay, `create` builds a live copy of the
//! contents from the chunk, and `apply` copies them onto the live resource
//! before the frame's commands run.
//!
//! Failing to create or read a staging resource is not fatal to the capture:
//! the caller logs it and the resource simply has no initial contents.

use crate::chunk::{Chunk, ChunkType};
use crate::driver::{Driver, DriverError, MapType, SubresourceData};
use crate::error::ReplayError;
use crate::id::ResourceId;
use crate::options::BigTargetHeuristic;
use crate::resource::{BindFlags, BufferDesc, ResourceKind, TextureDesc, Usage};
use crate::rle;
use crate::serialize::{ChunkBuilder, DeserializeError, Payload};

/// The saved pre-frame state of one resource.
#[derive(Clone, Debug, PartialEq)]
pub enum InitialContents<H> {
    /// A staging copy, to be read back when the capture is written.
    Snapshot { staging: H, layout: Layout },
    /// A staging buffer holding a counter view's hidden counter.
    CounterSnapshot { staging: H },
    /// Replay should clear the resource rather than restore anything.
    Clear,
    /// A hidden counter value.
    Counter(u32),
    /// Replay's copy of the contents, ready to apply.
    Copy { copy: H, layout: Layout },
}

/// The shape of a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub enum Layout {
    Buffer { length: u32 },
    Texture(TextureDesc),
}

impl<H: Copy> InitialContents<H> {
    /// The driver object holding the contents, if any.
    pub fn handle(&self) -> Option<H> {
        match *self {
            InitialContents::Snapshot { staging, .. } | InitialContents::CounterSnapshot { staging } => Some(staging),
            InitialContents::Copy { copy, .. } => Some(copy),
            InitialContents::Clear | InitialContents::Counter(_) => None,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, InitialContents::Clear)
    }
}

const TAG_CLEAR: u8 = 0;
const TAG_BUFFER: u8 = 1;
const TAG_TEXTURE: u8 = 2;
const TAG_COUNTER: u8 = 3;

const ENCODING_BYTES: u8 = 1;
const ENCODING_WORDS: u8 = 2;

/// Decide whether a texture's initial contents can be a clear marker.
///
/// `read_before_write` says whether the frame has already read the resource
/// before writing it; if so, its old contents matter after all.
pub fn should_omit(
    desc: &TextureDesc,
    heuristic: &BigTargetHeuristic,
    read_before_write: bool,
    save_all_initials: bool,
) -> bool {
    !save_all_initials && !read_before_write && heuristic.matches(desc)
}

/// Snapshot the resource `handle`, of kind `kind`.
pub fn prepare<D: Driver>(
    driver: &mut D,
    kind: &ResourceKind,
    handle: D::Handle,
) -> Result<InitialContents<D::Handle>, DriverError> {
    let ctx = driver.immediate_context();
    match kind {
        ResourceKind::Buffer(desc) => {
            let staging = driver.create_buffer(&desc.staging(), None)?;
            driver.copy_resource(ctx, staging, handle);
            Ok(InitialContents::Snapshot {
                staging,
                layout: Layout::Buffer { length: desc.byte_width },
            })
        }
        ResourceKind::Texture(desc) => {
            let staging = driver.create_texture(&desc.staging(), None)?;
            if desc.is_multisampled() {
                if let Err(err) = driver.copy_ms_to_array(staging, handle) {
                    driver.destroy(staging);
                    return Err(err);
                }
            } else {
                driver.copy_resource(ctx, staging, handle);
            }
            Ok(InitialContents::Snapshot {
                staging,
                layout: Layout::Texture(*desc),
            })
        }
        ResourceKind::CounterView { .. } => {
            let desc = BufferDesc {
                byte_width: 4,
                bind: BindFlags::empty(),
                usage: Usage::Staging,
            };
            let staging = driver.create_buffer(&desc, None)?;
            driver.copy_structure_count(ctx, staging, handle);
            Ok(InitialContents::CounterSnapshot { staging })
        }
        _ => Err(DriverError::Unsupported("resource kind has no initial contents")),
    }
}

/// Build the initial-contents chunk for `id`, reading back any staging copy.
pub fn serialize<D: Driver>(
    driver: &mut D,
    id: ResourceId,
    contents: &InitialContents<D::Handle>,
) -> Result<Chunk, DriverError> {
    let ctx = driver.immediate_context();
    let mut chunk = ChunkBuilder::new(ChunkType::InitialContents);
    chunk.field("id", &id);

    match contents {
        InitialContents::Clear => {
            chunk.field("type", &TAG_CLEAR);
        }
        InitialContents::Counter(count) => {
            chunk.field("type", &TAG_COUNTER).field("count", count);
        }
        InitialContents::CounterSnapshot { staging } => {
            let mapped = driver.map(ctx, *staging, 0, MapType::Read)?;
            driver.unmap(ctx, *staging, 0, None);
            let count = match mapped.data.get(..4) {
                Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                None => return Err(DriverError::MapFailed { subresource: 0 }),
            };
            chunk.field("type", &TAG_COUNTER).field("count", &count);
        }
        InitialContents::Snapshot { staging, layout: Layout::Buffer { length } } => {
            let mapped = driver.map(ctx, *staging, 0, MapType::Read)?;
            driver.unmap(ctx, *staging, 0, None);
            let data = mapped
                .data
                .get(..*length as usize)
                .ok_or(DriverError::MapFailed { subresource: 0 })?;
            chunk.field("type", &TAG_BUFFER).field("length", length);
            write_blob(&mut chunk, data, false)?;
        }
        InitialContents::Snapshot { staging, layout: Layout::Texture(desc) } => {
            let staging_desc = desc.staging();
            let count = staging_desc.subresource_count();
            chunk
                .field("type", &TAG_TEXTURE)
                .field("desc", desc)
                .field("subresources", &count);
            for subresource in 0..count {
                let mapped = driver.map(ctx, *staging, subresource, MapType::Read)?;
                driver.unmap(ctx, *staging, subresource, None);
                let packed = pack_rows(&staging_desc, subresource, &mapped)?;
                write_blob(&mut chunk, &packed, staging_desc.format.has_word_texels())?;
            }
        }
        InitialContents::Copy { .. } => {
            return Err(DriverError::Unsupported("replay copies can't be serialized"));
        }
    }

    Ok(chunk.finish())
}

/// Copy the rows of a mapped subresource out from under its row and depth
/// pitches.
pub(crate) fn pack_rows(desc: &TextureDesc, subresource: u32, mapped: &SubresourceData) -> Result<Vec<u8>, DriverError> {
    let (mip, _) = desc.subresource_mip_slice(subresource);
    let (width, height, depth) = desc.mip_extent(mip);
    let row_bytes = desc.format.row_bytes(width) as usize;
    let rows = desc.format.row_count(height) as usize;
    let row_pitch = mapped.row_pitch as usize;
    let depth_pitch = mapped.depth_pitch as usize;

    let mut packed = Vec::with_capacity(row_bytes * rows * depth as usize);
    for z in 0..depth as usize {
        for y in 0..rows {
            let start = z * depth_pitch + y * row_pitch;
            let row = mapped
                .data
                .get(start..start + row_bytes)
                .ok_or(DriverError::MapFailed { subresource })?;
            packed.extend_from_slice(row);
        }
    }
    Ok(packed)
}

fn write_blob(chunk: &mut ChunkBuilder, data: &[u8], words: bool) -> Result<(), DriverError> {
    let mut compressed = Vec::new();
    let (encoding, written) = if words && data.len() % 4 == 0 {
        (ENCODING_WORDS, rle::write_u32(&mut compressed, data))
    } else {
        (ENCODING_BYTES, rle::write_u8(&mut compressed, data))
    };
    written.map_err(|err| DriverError::Encode(err.to_string()))?;
    chunk
        .field("encoding", &encoding)
        .field("expanded", &data.len())
        .buffer("data", &compressed);
    Ok(())
}

fn read_blob(payload: &mut Payload<'_>, expected: usize) -> Result<Vec<u8>, DeserializeError> {
    let encoding: u8 = payload.field("encoding")?;
    let expanded: usize = payload.field("expanded")?;
    if expanded != expected {
        return Err(DeserializeError::OutOfRange(expanded as u64));
    }
    let mut compressed = payload.buffer("data")?;
    let data = match encoding {
        ENCODING_BYTES => rle::read_u8(&mut compressed, expected)?,
        ENCODING_WORDS => rle::read_u32(&mut compressed, expected)?,
        other => return Err(DeserializeError::BadEnum { what: "blob encoding", value: other as u64 }),
    };
    if data.len() != expected {
        return Err(DeserializeError::UnexpectedEof);
    }
    Ok(data)
}

/// Read an initial-contents chunk, creating a replay-side copy of any
/// contents it carries. Returns the ID of the resource the contents belong
/// to, as recorded in the capture.
pub fn create<D: Driver>(
    driver: &mut D,
    payload: &mut Payload<'_>,
) -> Result<(ResourceId, InitialContents<D::Handle>), ReplayError> {
    let id: ResourceId = payload.field("id")?;
    let tag: u8 = payload.field("type")?;
    let contents = match tag {
        TAG_CLEAR => InitialContents::Clear,
        TAG_COUNTER => InitialContents::Counter(payload.field("count")?),
        TAG_BUFFER => {
            let length: u32 = payload.field("length")?;
            let data = read_blob(payload, length as usize)?;
            let desc = BufferDesc {
                byte_width: length,
                bind: BindFlags::empty(),
                usage: Usage::Default,
            };
            let copy = driver.create_buffer(&desc, Some(&data))?;
            InitialContents::Copy {
                copy,
                layout: Layout::Buffer { length },
            }
        }
        TAG_TEXTURE => {
            let desc: TextureDesc = payload.field("desc")?;
            let mut copy_desc = desc.staging();
            copy_desc.usage = Usage::Default;
            let count: u32 = payload.field("subresources")?;
            if count != copy_desc.subresource_count() {
                return Err(DeserializeError::OutOfRange(count as u64).into());
            }

            let mut subresources = Vec::with_capacity(count as usize);
            for subresource in 0..count {
                let (mip, _) = copy_desc.subresource_mip_slice(subresource);
                let (width, height, _) = copy_desc.mip_extent(mip);
                let row_pitch = copy_desc.format.row_bytes(width);
                let depth_pitch = row_pitch * copy_desc.format.row_count(height);
                let data = read_blob(payload, copy_desc.subresource_bytes(subresource))?;
                subresources.push(SubresourceData::packed(data, row_pitch, depth_pitch));
            }

            let copy = driver.create_texture(&copy_desc, Some(&subresources))?;
            InitialContents::Copy {
                copy,
                layout: Layout::Texture(desc),
            }
        }
        other => {
            return Err(DeserializeError::BadEnum { what: "initial contents type", value: other as u64 }.into());
        }
    };
    Ok((id, contents))
}

/// Restore `live`, a resource of kind `kind`, to its initial contents.
pub fn apply<D: Driver>(
    driver: &mut D,
    kind: &ResourceKind,
    live: D::Handle,
    contents: &InitialContents<D::Handle>,
) -> Result<(), DriverError> {
    let ctx = driver.immediate_context();
    match contents {
        InitialContents::Clear => {
            let color = match kind {
                ResourceKind::Texture(desc) if desc.format.is_depth() => [1.0, 0.0, 0.0, 0.0],
                _ => [0.0; 4],
            };
            driver.clear_render_target(ctx, live, color);
        }
        InitialContents::Counter(count) => {
            driver.set_counter_view(ctx, Some(live), Some(*count));
            driver.set_counter_view(ctx, None, None);
        }
        InitialContents::Copy { copy, layout } => match layout {
            Layout::Texture(desc) if desc.is_multisampled() => driver.copy_array_to_ms(live, *copy)?,
            _ => driver.copy_resource(ctx, live, *copy),
        },
        InitialContents::Snapshot { .. } | InitialContents::CounterSnapshot { .. } => {
            return Err(DriverError::Unsupported("capture snapshots can't be applied"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::soft::SoftDriver;

    fn big_target(width: u32, height: u32) -> TextureDesc {
        TextureDesc::new_2d(width, height, Format::Rgba8Unorm, BindFlags::RENDER_TARGET)
    }

    #[test]
    fn big_target_heuristic() {
        let heuristic = BigTargetHeuristic::default();
        assert!(should_omit(&big_target(256, 128), &heuristic, false, false));
        // Read before written: the old contents matter.
        assert!(!should_omit(&big_target(256, 128), &heuristic, true, false));
        // Exhaustive mode always copies.
        assert!(!should_omit(&big_target(256, 128), &heuristic, false, true));
        // Square, or too small.
        assert!(!should_omit(&big_target(256, 256), &heuristic, false, false));
        assert!(!should_omit(&big_target(64, 32), &heuristic, false, false));
        // Not a target at all.
        let texture = TextureDesc::new_2d(256, 128, Format::Rgba8Unorm, BindFlags::SHADER_RESOURCE);
        assert!(!should_omit(&texture, &heuristic, false, false));
    }

    #[test]
    fn texture_snapshot_respects_row_pitch() {
        let mut driver = SoftDriver::new();
        let desc = TextureDesc::new_2d(5, 3, Format::Rgba8Unorm, BindFlags::SHADER_RESOURCE);
        let texels: Vec<u8> = (0..5 * 3 * 4).map(|i| i as u8).collect();
        let texture = driver
            .create_texture(&desc, Some(&[SubresourceData::packed(texels.clone(), 20, 60)]))
            .unwrap();

        let snapshot = prepare(&mut driver, &ResourceKind::Texture(desc), texture).unwrap();
        let chunk = serialize(&mut driver, ResourceId::from_raw(9), &snapshot).unwrap();

        let mut payload = Payload::new(chunk.payload());
        let (id, copy) = create(&mut driver, &mut payload).unwrap();
        assert_eq!(id, ResourceId::from_raw(9));

        let target = driver.create_texture(&desc, None).unwrap();
        apply(&mut driver, &ResourceKind::Texture(desc), target, &copy).unwrap();
        assert_eq!(driver.texel_bytes(target, 0), texels);
    }

    #[test]
    fn multisampled_snapshot_round_trips() {
        let mut driver = SoftDriver::new();
        let mut desc = TextureDesc::new_2d(4, 4, Format::Rgba8Unorm, BindFlags::RENDER_TARGET);
        desc.sample_count = 4;
        let kind = ResourceKind::Texture(desc);
        let ctx = driver.immediate_context();
        let target = driver.create_texture(&desc, None).unwrap();
        driver.clear_render_target(ctx, target, [1.0, 0.0, 0.0, 1.0]);

        let snapshot = prepare(&mut driver, &kind, target).unwrap();
        let chunk = serialize(&mut driver, ResourceId::from_raw(3), &snapshot).unwrap();
        let (_, copy) = create(&mut driver, &mut Payload::new(chunk.payload())).unwrap();

        let restored = driver.create_texture(&desc, None).unwrap();
        apply(&mut driver, &kind, restored, &copy).unwrap();
        assert_eq!(driver.texel_bytes(restored, 0), driver.texel_bytes(target, 0));
        assert_eq!(&driver.texel_bytes(restored, 0)[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn buffer_and_counter_snapshots() {
        let mut driver = SoftDriver::new();
        let ctx = driver.immediate_context();
        let desc = BufferDesc {
            byte_width: 8,
            bind: BindFlags::UNORDERED_ACCESS,
            usage: Usage::Default,
        };
        let buffer = driver.create_buffer(&desc, Some(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let view = driver.create_counter_view(buffer).unwrap();
        driver.set_counter_view(ctx, Some(view), Some(17));

        let snapshot = prepare(&mut driver, &ResourceKind::Buffer(desc), buffer).unwrap();
        let chunk = serialize(&mut driver, ResourceId::from_raw(1), &snapshot).unwrap();
        let (_, copy) = create(&mut driver, &mut Payload::new(chunk.payload())).unwrap();
        let restored = driver.create_buffer(&desc, None).unwrap();
        apply(&mut driver, &ResourceKind::Buffer(desc), restored, &copy).unwrap();
        assert_eq!(driver.buffer_bytes(restored), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let view_kind = ResourceKind::CounterView { buffer: ResourceId::from_raw(1) };
        let snapshot = prepare(&mut driver, &view_kind, view).unwrap();
        let chunk = serialize(&mut driver, ResourceId::from_raw(2), &snapshot).unwrap();
        let (_, counter) = create(&mut driver, &mut Payload::new(chunk.payload())).unwrap();
        assert_eq!(counter, InitialContents::Counter(17));

        driver.set_counter_view(ctx, Some(view), Some(0));
        apply(&mut driver, &view_kind, view, &counter).unwrap();
        assert_eq!(driver.counter_value(view), 17);
    }

    #[test]
    fn failed_staging_is_reported() {
        let mut driver = SoftDriver::new();
        let desc = big_target(128, 64);
        let texture = driver.create_texture(&desc, None).unwrap();
        driver.fail_staging(true);
        assert_eq!(
            prepare(&mut driver, &ResourceKind::Texture(desc), texture),
            Err(DriverError::OutOfMemory("staging resource"))
        );
    }

    #[test]
    fn blobs_fall_back_to_bytes() {
        let data = [1, 1, 1, 1, 9, 9];
        let mut chunk = ChunkBuilder::new(ChunkType::InitialContents);
        write_blob(&mut chunk, &data, true).unwrap();
        write_blob(&mut chunk, &data[..4], true).unwrap();
        let chunk = chunk.finish();

        let mut payload = Payload::new(chunk.payload());
        assert_eq!(payload.field::<u8>("encoding").unwrap(), ENCODING_BYTES);
        let mut payload = Payload::new(chunk.payload());
        assert_eq!(read_blob(&mut payload, 6).unwrap(), data);
        assert_eq!(read_blob(&mut payload, 4).unwrap(), [1, 1, 1, 1]);
        assert!(payload.is_empty());
    }

    #[test]
    fn clear_marker_serializes_empty() {
        let mut driver = SoftDriver::new();
        let chunk = serialize(&mut driver, ResourceId::from_raw(5), &InitialContents::Clear).unwrap();
        let mut payload = Payload::new(chunk.payload());
        assert_eq!(payload.field::<ResourceId>("id").unwrap(), ResourceId::from_raw(5));
        assert_eq!(payload.field::<u8>("type").unwrap(), TAG_CLEAR);
        assert!(payload.is_empty());
    }
}
