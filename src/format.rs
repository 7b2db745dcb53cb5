//! Texel formats, and the little bit of size arithmetic capture needs.

use crate::serialize::{Deserialize, DeserializeError, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgb10A2Unorm,
    R32Float,
    R32Uint,
    D24UnormS8Uint,
    D32Float,
    R24G8Typeless,
    R32Typeless,
    Bc1Unorm,
    Bc3Unorm,
}

const ALL_FORMATS: [Format; 12] = [
    Format::Rgba8Unorm,
    Format::Bgra8Unorm,
    Format::Rgba16Float,
    Format::Rgb10A2Unorm,
    Format::R32Float,
    Format::R32Uint,
    Format::D24UnormS8Uint,
    Format::D32Float,
    Format::R24G8Typeless,
    Format::R32Typeless,
    Format::Bc1Unorm,
    Format::Bc3Unorm,
];

impl Format {
    /// Bytes per texel, or per 4x4 block for block-compressed formats.
    pub fn block_bytes(self) -> u32 {
        match self {
            Format::Rgba16Float | Format::Bc1Unorm => 8,
            Format::Bc3Unorm => 16,
            _ => 4,
        }
    }

    pub fn is_block_compressed(self) -> bool {
        matches!(self, Format::Bc1Unorm | Format::Bc3Unorm)
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32Float)
    }

    /// The typeless format a staging copy of this format must use. Depth
    /// formats can't be mapped directly.
    pub fn typeless(self) -> Format {
        match self {
            Format::D24UnormS8Uint => Format::R24G8Typeless,
            Format::D32Float => Format::R32Typeless,
            other => other,
        }
    }

    /// Bytes in one tightly packed row of `width` texels. For block
    /// formats, a row is a row of blocks.
    pub fn row_bytes(self, width: u32) -> u32 {
        if self.is_block_compressed() {
            ((width + 3) / 4).max(1) * self.block_bytes()
        } else {
            width * self.block_bytes()
        }
    }

    /// Rows in an image `height` texels tall. Block formats store whole
    /// 4-row groups.
    pub fn row_count(self, height: u32) -> u32 {
        if self.is_block_compressed() {
            ((height + 3) / 4).max(1)
        } else {
            height
        }
    }

    /// True if the run-length encoder should treat data in this format as
    /// 32-bit words.
    pub fn has_word_texels(self) -> bool {
        !self.is_block_compressed() && self.block_bytes() == 4
    }

    /// The bytes of one texel cleared to `color`, or `None` for formats that
    /// can't be cleared that way.
    pub fn encode_color(self, color: [f32; 4]) -> Option<Vec<u8>> {
        fn unorm(v: f32, max: f32) -> u32 {
            (v.max(0.0).min(1.0) * max + 0.5) as u32
        }

        let [r, g, b, a] = color;
        let bytes = match self {
            Format::Rgba8Unorm => vec![
                unorm(r, 255.0) as u8,
                unorm(g, 255.0) as u8,
                unorm(b, 255.0) as u8,
                unorm(a, 255.0) as u8,
            ],
            Format::Bgra8Unorm => vec![
                unorm(b, 255.0) as u8,
                unorm(g, 255.0) as u8,
                unorm(r, 255.0) as u8,
                unorm(a, 255.0) as u8,
            ],
            Format::Rgba16Float => color
                .iter()
                .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
                .collect(),
            Format::Rgb10A2Unorm => {
                let packed = unorm(r, 1023.0)
                    | unorm(g, 1023.0) << 10
                    | unorm(b, 1023.0) << 20
                    | unorm(a, 3.0) << 30;
                packed.to_le_bytes().to_vec()
            }
            Format::R32Float | Format::D32Float | Format::R32Typeless => r.to_le_bytes().to_vec(),
            Format::R32Uint => (r as u32).to_le_bytes().to_vec(),
            Format::D24UnormS8Uint | Format::R24G8Typeless => {
                let depth = unorm(r, 16_777_215.0);
                let stencil = (g as u32) & 0xff;
                (depth | stencil << 24).to_le_bytes().to_vec()
            }
            Format::Bc1Unorm | Format::Bc3Unorm => return None,
        };
        Some(bytes)
    }

    fn index(self) -> u32 {
        ALL_FORMATS.iter().position(|&f| f == self).unwrap_or(0) as u32
    }
}

impl Serialize for Format {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.index().serialize(out)
    }
}

impl Deserialize for Format {
    fn deserialize(buf: &mut &[u8]) -> Result<Format, DeserializeError> {
        let index = u32::deserialize(buf)?;
        ALL_FORMATS
            .get(index as usize)
            .copied()
            .ok_or(DeserializeError::BadEnum { what: "format", value: index as u64 })
    }
}

#[test]
fn test_block_arithmetic() {
    assert_eq!(Format::Rgba8Unorm.row_bytes(13), 52);
    assert_eq!(Format::Rgba8Unorm.row_count(13), 13);
    assert_eq!(Format::Bc1Unorm.row_bytes(13), 4 * 8);
    assert_eq!(Format::Bc1Unorm.row_count(13), 4);
    assert_eq!(Format::Bc3Unorm.row_bytes(2), 16);
    assert_eq!(Format::Bc3Unorm.row_count(1), 1);
    assert_eq!(Format::D24UnormS8Uint.typeless(), Format::R24G8Typeless);
    assert_eq!(Format::Rgba8Unorm.typeless(), Format::Rgba8Unorm);
}

#[test]
fn test_encode_color() {
    assert_eq!(Format::Rgba8Unorm.encode_color([1.0, 0.0, 0.5, 1.0]), Some(vec![255, 0, 128, 255]));
    assert_eq!(Format::Bgra8Unorm.encode_color([1.0, 0.0, 0.5, 1.0]), Some(vec![128, 0, 255, 255]));
    assert_eq!(Format::Rgba16Float.encode_color([1.0; 4]).unwrap().len(), 8);
    assert_eq!(Format::Bc1Unorm.encode_color([1.0; 4]), None);
}

#[test]
fn test_format_serialization() {
    for &format in &ALL_FORMATS {
        let mut out = vec![];
        format.serialize(&mut out);
        assert_eq!(Format::deserialize(&mut &out[..]).unwrap(), format);
    }
    assert!(Format::deserialize(&mut &[99][..]).is_err());
}
