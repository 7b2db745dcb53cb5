//! Chunk types, and the chunks themselves.
//!
//! A capture is a stream of chunks. Each chunk carries a type tag from
//! `ChunkType` and an opaque payload, built with `serialize::ChunkBuilder`.
//! Tag values are part of the file format: never renumber them, only add.
//!
//! Tags fall into three ranges:
//!
//! - System chunks (below `FIRST_RESOURCE_CHUNK`) describe the capture as a
//!   whole. Readers skip system tags they don't recognize.
//!
//! - Resource chunks create and describe resources. They live in resource
//!   records until the frame is written.
//!
//! - Context chunks (from `FIRST_CONTEXT_CHUNK` up) are calls on a device
//!   context, and make up the frame's command log.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const FIRST_RESOURCE_CHUNK: u32 = 16;
pub const FIRST_CONTEXT_CHUNK: u32 = 32;

macro_rules! chunk_types {
    ( $( $name:ident = $value:expr, )* ) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u32)]
        pub enum ChunkType {
            $( $name = $value, )*
        }

        impl ChunkType {
            pub const ALL: &'static [ChunkType] = &[ $( ChunkType::$name, )* ];

            pub fn from_u32(tag: u32) -> Option<ChunkType> {
                match tag {
                    $( $value => Some(ChunkType::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( ChunkType::$name => stringify!($name), )*
                }
            }
        }
    }
}

#[rustfmt::skip]
chunk_types! {
    InitParams = 1,
    DeviceInit = 2,
    CaptureScope = 3,
    InitialContents = 4,

    CreateSwapChain = 16,
    CreateBuffer = 17,
    CreateTexture = 18,
    CreateCounterView = 19,
    SetResourceName = 20,

    BeginCaptureFrame = 32,
    EndCaptureFrame = 33,
    SetRenderTargets = 34,
    SetConstantBuffer = 35,
    SetCounterView = 36,
    SetStreamOutTarget = 37,
    ClearRenderTarget = 38,
    Draw = 39,
    DrawAuto = 40,
    Dispatch = 41,
    UpdateSubresource = 42,
    CopyResource = 43,
    Map = 44,
    Unmap = 45,
    ExecuteCommandList = 46,
    FinishCommandList = 47,
    SetMarker = 48,
    PushMarker = 49,
    PopMarker = 50,
}

impl ChunkType {
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// True if `tag` falls in the system range, known to us or not.
    pub fn is_system_tag(tag: u32) -> bool {
        tag < FIRST_RESOURCE_CHUNK
    }

    pub fn is_context(self) -> bool {
        self.tag() >= FIRST_CONTEXT_CHUNK
    }

    /// Chunks that issue GPU work.
    pub fn is_draw(self) -> bool {
        matches!(self, ChunkType::Draw | ChunkType::DrawAuto | ChunkType::Dispatch)
    }
}

/// Source of chunk sequence numbers. These only need to be monotonic, so
/// that chunks from different records can be merged back into creation order.
static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

fn next_sequence() -> i64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One serialized unit of the capture.
#[derive(Clone, Debug)]
pub struct Chunk {
    ty: ChunkType,
    sequence: i64,
    payload: Arc<[u8]>,
}

impl Chunk {
    pub fn new(ty: ChunkType, payload: Vec<u8>) -> Chunk {
        Chunk {
            ty,
            sequence: next_sequence(),
            payload: payload.into(),
        }
    }

    /// Return a copy of this chunk with a fresh sequence number, sharing the
    /// payload.
    pub fn duplicate(&self) -> Chunk {
        Chunk {
            ty: self.ty,
            sequence: next_sequence(),
            payload: self.payload.clone(),
        }
    }

    pub fn ty(&self) -> ChunkType {
        self.ty
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[test]
fn test_tags_round_trip() {
    for &ty in ChunkType::ALL {
        assert_eq!(ChunkType::from_u32(ty.tag()), Some(ty));
        assert_eq!(ChunkType::is_system_tag(ty.tag()), ty.tag() < FIRST_RESOURCE_CHUNK);
    }
    assert_eq!(ChunkType::from_u32(0), None);
    assert_eq!(ChunkType::from_u32(1000), None);
    assert!(ChunkType::Draw.is_context());
    assert!(!ChunkType::CreateBuffer.is_context());
}

#[test]
fn test_duplicate_sorts_later() {
    let a = Chunk::new(ChunkType::Draw, vec![1, 2, 3]);
    let b = a.duplicate();
    assert!(b.sequence() > a.sequence());
    assert_eq!(b.payload(), a.payload());
    assert_eq!(b.ty(), ChunkType::Draw);
}
