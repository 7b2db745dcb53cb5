//! A representation for recorded context calls.
//!
//! Every call on a context that the capture layer logs is a `Call`. Capture
//! turns it into a chunk with `to_chunk`; replay turns the chunk back into a
//! `Call` with `from_payload` and re-issues it. Every context chunk starts
//! with the ID of the context the call was made on, followed by the call's
//! arguments in the order they appear in the variant.

use crate::chunk::{Chunk, ChunkType};
use crate::driver::{MapType, SubresourceData};
use crate::id::ResourceId;
use crate::registry::FrameRefType;
use crate::serialize::{ChunkBuilder, Deserialize, DeserializeError, Payload, Serialize};

/// The bytes an `Unmap` changed: `bytes` replaced the subresource's contents
/// starting at `offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct WrittenRange {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl WrittenRange {
    /// The smallest range covering every byte where `before` and `after`
    /// differ, or `None` if they're identical. If the lengths differ, the
    /// whole of `after` is the range.
    pub fn diff(before: &[u8], after: &[u8]) -> Option<WrittenRange> {
        if before.len() != after.len() {
            return Some(WrittenRange { offset: 0, bytes: after.to_vec() });
        }
        let first = before.iter().zip(after).position(|(b, a)| b != a)?;
        let last = before.iter().zip(after).rposition(|(b, a)| b != a)?;
        Some(WrittenRange {
            offset: first as u32,
            bytes: after[first..=last].to_vec(),
        })
    }

    /// Write this range over `target`. The range must lie within it.
    pub fn apply_to(&self, target: &mut [u8]) -> Result<(), DeserializeError> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.bytes.len())
            .filter(|&end| end <= target.len())
            .ok_or(DeserializeError::OutOfRange(self.offset as u64 + self.bytes.len() as u64))?;
        target[start..end].copy_from_slice(&self.bytes);
        Ok(())
    }
}

impl Serialize for WrittenRange {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.offset.serialize(out);
        self.bytes.serialize(out);
    }
}

impl Deserialize for WrittenRange {
    fn deserialize(buf: &mut &[u8]) -> Result<WrittenRange, DeserializeError> {
        Ok(WrittenRange {
            offset: u32::deserialize(buf)?,
            bytes: Vec::deserialize(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
#[rustfmt::skip]
pub enum Call {
    SetRenderTargets { targets: Vec<ResourceId> },
    SetConstantBuffer { buffer: Option<ResourceId> },
    SetCounterView { view: Option<ResourceId>, initial_count: Option<u32> },
    SetStreamOutTarget { buffer: Option<ResourceId> },
    ClearRenderTarget { target: ResourceId, color: [f32; 4] },
    Draw { vertex_count: u32, start_vertex: u32 },
    DrawAuto,
    Dispatch { x: u32, y: u32, z: u32 },
    UpdateSubresource { resource: ResourceId, subresource: u32, data: SubresourceData },
    CopyResource { dst: ResourceId, src: ResourceId },
    Map { resource: ResourceId, subresource: u32, map_type: MapType },
    Unmap { resource: ResourceId, subresource: u32, written: Option<WrittenRange> },
    FinishCommandList { list: ResourceId, restore: bool },
    ExecuteCommandList { list: ResourceId, restore: bool },
    SetMarker { name: String },
    PushMarker { name: String },
    PopMarker,
}

/// The resources bound to a context's pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineState {
    pub render_targets: Vec<ResourceId>,
    pub constant_buffer: Option<ResourceId>,
    pub counter_view: Option<ResourceId>,
    pub stream_out: Option<ResourceId>,
}

impl PipelineState {
    /// Update the bindings for `call`, if it changes any.
    pub fn apply(&mut self, call: &Call) {
        match call {
            Call::SetRenderTargets { targets } => self.render_targets = targets.clone(),
            Call::SetConstantBuffer { buffer } => self.constant_buffer = *buffer,
            Call::SetCounterView { view, .. } => self.counter_view = *view,
            Call::SetStreamOutTarget { buffer } => self.stream_out = *buffer,
            _ => {}
        }
    }

    /// Every bound resource.
    pub fn bound(&self) -> Vec<ResourceId> {
        let mut ids = self.render_targets.clone();
        ids.extend(self.constant_buffer);
        ids.extend(self.counter_view);
        ids.extend(self.stream_out);
        ids.retain(|id| !id.is_null());
        ids
    }
}

impl Serialize for PipelineState {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.render_targets.serialize(out);
        self.constant_buffer.serialize(out);
        self.counter_view.serialize(out);
        self.stream_out.serialize(out);
    }
}

impl Deserialize for PipelineState {
    fn deserialize(buf: &mut &[u8]) -> Result<PipelineState, DeserializeError> {
        Ok(PipelineState {
            render_targets: Vec::deserialize(buf)?,
            constant_buffer: Option::deserialize(buf)?,
            counter_view: Option::deserialize(buf)?,
            stream_out: Option::deserialize(buf)?,
        })
    }
}

impl Call {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Call::SetRenderTargets { .. } => ChunkType::SetRenderTargets,
            Call::SetConstantBuffer { .. } => ChunkType::SetConstantBuffer,
            Call::SetCounterView { .. } => ChunkType::SetCounterView,
            Call::SetStreamOutTarget { .. } => ChunkType::SetStreamOutTarget,
            Call::ClearRenderTarget { .. } => ChunkType::ClearRenderTarget,
            Call::Draw { .. } => ChunkType::Draw,
            Call::DrawAuto => ChunkType::DrawAuto,
            Call::Dispatch { .. } => ChunkType::Dispatch,
            Call::UpdateSubresource { .. } => ChunkType::UpdateSubresource,
            Call::CopyResource { .. } => ChunkType::CopyResource,
            Call::Map { .. } => ChunkType::Map,
            Call::Unmap { .. } => ChunkType::Unmap,
            Call::FinishCommandList { .. } => ChunkType::FinishCommandList,
            Call::ExecuteCommandList { .. } => ChunkType::ExecuteCommandList,
            Call::SetMarker { .. } => ChunkType::SetMarker,
            Call::PushMarker { .. } => ChunkType::PushMarker,
            Call::PopMarker => ChunkType::PopMarker,
        }
    }

    /// Serialize this call, made on context `ctx`, as a chunk.
    pub fn to_chunk(&self, ctx: ResourceId) -> Chunk {
        let mut chunk = ChunkBuilder::new(self.chunk_type());
        chunk.field("context", &ctx);
        match self {
            Call::SetRenderTargets { targets } => {
                chunk.field("targets", targets);
            }
            Call::SetConstantBuffer { buffer } => {
                chunk.field("buffer", buffer);
            }
            Call::SetCounterView { view, initial_count } => {
                chunk.field("view", view).field("initial_count", initial_count);
            }
            Call::SetStreamOutTarget { buffer } => {
                chunk.field("buffer", buffer);
            }
            Call::ClearRenderTarget { target, color } => {
                chunk.field("target", target).field("color", color);
            }
            Call::Draw { vertex_count, start_vertex } => {
                chunk.field("vertex_count", vertex_count).field("start_vertex", start_vertex);
            }
            Call::DrawAuto | Call::PopMarker => {}
            Call::Dispatch { x, y, z } => {
                chunk.field("x", x).field("y", y).field("z", z);
            }
            Call::UpdateSubresource { resource, subresource, data } => {
                chunk
                    .field("resource", resource)
                    .field("subresource", subresource)
                    .field("data", data);
            }
            Call::CopyResource { dst, src } => {
                chunk.field("dst", dst).field("src", src);
            }
            Call::Map { resource, subresource, map_type } => {
                chunk
                    .field("resource", resource)
                    .field("subresource", subresource)
                    .field("map_type", map_type);
            }
            Call::Unmap { resource, subresource, written } => {
                chunk
                    .field("resource", resource)
                    .field("subresource", subresource)
                    .field("written", written);
            }
            Call::FinishCommandList { list, restore } | Call::ExecuteCommandList { list, restore } => {
                chunk.field("list", list).field("restore", restore);
            }
            Call::SetMarker { name } | Call::PushMarker { name } => {
                chunk.field("name", name);
            }
        }
        chunk.finish()
    }

    /// Read back a call serialized by `to_chunk`, returning the context it
    /// was made on.
    pub fn from_payload(ty: ChunkType, payload: &mut Payload<'_>) -> Result<(ResourceId, Call), DeserializeError> {
        let ctx = payload.field("context")?;
        let call = match ty {
            ChunkType::SetRenderTargets => Call::SetRenderTargets { targets: payload.field("targets")? },
            ChunkType::SetConstantBuffer => Call::SetConstantBuffer { buffer: payload.field("buffer")? },
            ChunkType::SetCounterView => Call::SetCounterView {
                view: payload.field("view")?,
                initial_count: payload.field("initial_count")?,
            },
            ChunkType::SetStreamOutTarget => Call::SetStreamOutTarget { buffer: payload.field("buffer")? },
            ChunkType::ClearRenderTarget => Call::ClearRenderTarget {
                target: payload.field("target")?,
                color: payload.field("color")?,
            },
            ChunkType::Draw => Call::Draw {
                vertex_count: payload.field("vertex_count")?,
                start_vertex: payload.field("start_vertex")?,
            },
            ChunkType::DrawAuto => Call::DrawAuto,
            ChunkType::Dispatch => Call::Dispatch {
                x: payload.field("x")?,
                y: payload.field("y")?,
                z: payload.field("z")?,
            },
            ChunkType::UpdateSubresource => Call::UpdateSubresource {
                resource: payload.field("resource")?,
                subresource: payload.field("subresource")?,
                data: payload.field("data")?,
            },
            ChunkType::CopyResource => Call::CopyResource {
                dst: payload.field("dst")?,
                src: payload.field("src")?,
            },
            ChunkType::Map => Call::Map {
                resource: payload.field("resource")?,
                subresource: payload.field("subresource")?,
                map_type: payload.field("map_type")?,
            },
            ChunkType::Unmap => Call::Unmap {
                resource: payload.field("resource")?,
                subresource: payload.field("subresource")?,
                written: payload.field("written")?,
            },
            ChunkType::FinishCommandList => Call::FinishCommandList {
                list: payload.field("list")?,
                restore: payload.field("restore")?,
            },
            ChunkType::ExecuteCommandList => Call::ExecuteCommandList {
                list: payload.field("list")?,
                restore: payload.field("restore")?,
            },
            ChunkType::SetMarker => Call::SetMarker { name: payload.field("name")? },
            ChunkType::PushMarker => Call::PushMarker { name: payload.field("name")? },
            ChunkType::PopMarker => Call::PopMarker,
            other => {
                return Err(DeserializeError::BadEnum {
                    what: "context chunk type",
                    value: other.tag() as u64,
                })
            }
        };
        Ok((ctx, call))
    }

    /// Read an `Unmap` chunk from a capture older than format 0x0B, which
    /// recorded the whole subresource rather than the range written.
    pub fn unmap_from_whole_payload(payload: &mut Payload<'_>) -> Result<(ResourceId, Call), DeserializeError> {
        let ctx = payload.field("context")?;
        let resource = payload.field("resource")?;
        let subresource = payload.field("subresource")?;
        let whole: Option<Vec<u8>> = payload.field("data")?;
        let written = whole.map(|bytes| WrittenRange { offset: 0, bytes });
        Ok((ctx, Call::Unmap { resource, subresource, written }))
    }

    /// The resources this call uses, and how, given the bindings in effect
    /// when it's made.
    pub fn references(&self, pipeline: &PipelineState) -> Vec<(ResourceId, FrameRefType)> {
        use FrameRefType::*;

        let mut refs = vec![];
        match self {
            // Binding a resource doesn't use it yet, but the frame needs it
            // to exist.
            Call::SetRenderTargets { targets } => {
                refs.extend(targets.iter().map(|&id| (id, Unknown)));
            }
            Call::SetConstantBuffer { buffer: Some(id) }
            | Call::SetStreamOutTarget { buffer: Some(id) } => refs.push((*id, Unknown)),
            Call::SetCounterView { view: Some(id), initial_count } => {
                // Resetting the hidden counter overwrites it.
                refs.push((*id, if initial_count.is_some() { Write } else { Unknown }));
            }
            Call::ClearRenderTarget { target, .. } => refs.push((*target, Write)),
            Call::Draw { .. } | Call::DrawAuto | Call::Dispatch { .. } => {
                if let Some(buffer) = pipeline.constant_buffer {
                    refs.push((buffer, Read));
                }
                if let Call::DrawAuto = self {
                    if let Some(buffer) = pipeline.stream_out {
                        refs.push((buffer, Read));
                    }
                }
                refs.extend(pipeline.render_targets.iter().map(|&id| (id, Write)));
                if let Some(view) = pipeline.counter_view {
                    refs.push((view, ReadBeforeWrite));
                }
                if let Some(buffer) = pipeline.stream_out {
                    refs.push((buffer, Write));
                }
            }
            Call::UpdateSubresource { resource, .. } => refs.push((*resource, Write)),
            Call::CopyResource { dst, src } => {
                refs.push((*src, Read));
                refs.push((*dst, Write));
            }
            Call::Map { resource, map_type, .. } => {
                let ty = match map_type {
                    MapType::Read => Read,
                    MapType::Write | MapType::WriteDiscard => Write,
                    MapType::ReadWrite | MapType::WriteNoOverwrite => ReadBeforeWrite,
                };
                refs.push((*resource, ty));
            }
            Call::Unmap { resource, written: Some(_), .. } => refs.push((*resource, Write)),
            _ => {}
        }
        refs.retain(|(id, _)| !id.is_null());
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(call: Call) {
        let chunk = call.to_chunk(ResourceId::from_raw(2));
        let mut payload = Payload::new(chunk.payload());
        let (ctx, back) = Call::from_payload(chunk.ty(), &mut payload).unwrap();
        assert_eq!(ctx, ResourceId::from_raw(2));
        assert_eq!(back, call);
        assert!(payload.is_empty());
    }

    #[test]
    fn calls_survive_serialization() {
        round_trip(Call::SetRenderTargets {
            targets: vec![ResourceId::from_raw(10), ResourceId::from_raw(11)],
        });
        round_trip(Call::SetCounterView {
            view: Some(ResourceId::from_raw(4)),
            initial_count: Some(0),
        });
        round_trip(Call::ClearRenderTarget {
            target: ResourceId::from_raw(10),
            color: [0.0, 0.5, 1.0, 1.0],
        });
        round_trip(Call::UpdateSubresource {
            resource: ResourceId::from_raw(5),
            subresource: 1,
            data: SubresourceData::packed(vec![1, 2, 3, 4], 4, 4),
        });
        round_trip(Call::Unmap {
            resource: ResourceId::from_raw(5),
            subresource: 0,
            written: Some(WrittenRange { offset: 12, bytes: vec![7, 7] }),
        });
        round_trip(Call::PopMarker);
    }

    #[test]
    fn old_unmap_carries_whole_subresource() {
        let chunk = ChunkBuilder::new(ChunkType::Unmap)
            .field("context", &ResourceId::from_raw(1))
            .field("resource", &ResourceId::from_raw(3))
            .field("subresource", &0_u32)
            .field("data", &Some(vec![9_u8, 8, 7]))
            .finish();
        let (_, call) = Call::unmap_from_whole_payload(&mut Payload::new(chunk.payload())).unwrap();
        assert_eq!(
            call,
            Call::Unmap {
                resource: ResourceId::from_raw(3),
                subresource: 0,
                written: Some(WrittenRange { offset: 0, bytes: vec![9, 8, 7] }),
            }
        );
    }

    #[test]
    fn written_range_diff() {
        assert_eq!(WrittenRange::diff(&[1, 2, 3, 4], &[1, 2, 3, 4]), None);
        let range = WrittenRange::diff(&[1, 2, 3, 4, 5], &[1, 9, 3, 8, 5]).unwrap();
        assert_eq!(range, WrittenRange { offset: 1, bytes: vec![9, 3, 8] });

        let mut target = vec![1, 2, 3, 4, 5];
        range.apply_to(&mut target).unwrap();
        assert_eq!(target, [1, 9, 3, 8, 5]);
    }

    #[test]
    fn written_range_must_fit() {
        let mut target = vec![0; 4];
        let range = WrittenRange { offset: 2, bytes: vec![1, 2, 3] };
        assert_eq!(range.apply_to(&mut target), Err(DeserializeError::OutOfRange(5)));
        assert_eq!(target, [0; 4]);

        let huge = WrittenRange { offset: u32::MAX, bytes: vec![1] };
        assert!(huge.apply_to(&mut target).is_err());
    }

    #[test]
    fn draws_reference_bound_resources() {
        let pipeline = PipelineState {
            render_targets: vec![ResourceId::from_raw(1)],
            constant_buffer: Some(ResourceId::from_raw(2)),
            counter_view: None,
            stream_out: None,
        };
        let refs = Call::Draw { vertex_count: 3, start_vertex: 0 }.references(&pipeline);
        assert_eq!(
            refs,
            [
                (ResourceId::from_raw(2), FrameRefType::Read),
                (ResourceId::from_raw(1), FrameRefType::Write),
            ]
        );
    }
}
