//! Reading texels back, and turning them into images.
//!
//! Capture embeds a small JPEG thumbnail of the presented back buffer in
//! every file, and the `replay` tool writes render targets out as PNGs. Both
//! start by converting the texture's format to 8-bit RGBA with `to_rgba8`.

use crate::driver::{Driver, DriverError, MapType};
use crate::format::Format;
use crate::initial::pack_rows;
use crate::resource::TextureDesc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageResult};
use std::path::Path;
use std::{fs, io};

/// Thumbnails are never wider than this.
pub const MAX_THUMBNAIL_WIDTH: u32 = 2048;
pub const JPEG_QUALITY: u8 = 80;

/// A JPEG-compressed preview of the captured frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Read subresource `subresource` of `texture` back through a staging copy,
/// returning it tightly packed.
pub fn read_texture<D: Driver>(
    driver: &mut D,
    texture: D::Handle,
    desc: &TextureDesc,
    subresource: u32,
) -> Result<Vec<u8>, DriverError> {
    if desc.is_multisampled() {
        return Err(DriverError::Unsupported("multisampled textures can't be read back directly"));
    }
    let ctx = driver.immediate_context();
    let staging_desc = desc.staging();
    let staging = driver.create_texture(&staging_desc, None)?;
    driver.copy_resource(ctx, staging, texture);
    let mapped = driver.map(ctx, staging, subresource, MapType::Read);
    driver.unmap(ctx, staging, subresource, None);
    driver.destroy(staging);
    pack_rows(&staging_desc, subresource, &mapped?)
}

fn unorm8(v: f32) -> u8 {
    (v.max(0.0).min(1.0) * 255.0 + 0.5) as u8
}

fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Convert `width` x `height` packed texels of `format` to 8-bit RGBA.
///
/// Half-float sources are taken to be linear, and get the sRGB curve.
/// Returns `None` for formats that have no sensible color interpretation.
pub fn to_rgba8(format: Format, width: u32, height: u32, data: &[u8]) -> Option<Vec<u8>> {
    let texels = width as usize * height as usize;
    if data.len() < texels * format.block_bytes() as usize || format.is_block_compressed() {
        return None;
    }

    let mut rgba = Vec::with_capacity(texels * 4);
    match format {
        Format::Rgba8Unorm => rgba.extend_from_slice(&data[..texels * 4]),
        Format::Bgra8Unorm => {
            for t in data[..texels * 4].chunks_exact(4) {
                rgba.extend_from_slice(&[t[2], t[1], t[0], t[3]]);
            }
        }
        Format::Rgba16Float => {
            for t in data[..texels * 8].chunks_exact(8) {
                let channel = |i: usize| half::f16::from_le_bytes([t[2 * i], t[2 * i + 1]]).to_f32();
                rgba.extend_from_slice(&[
                    unorm8(linear_to_srgb(channel(0))),
                    unorm8(linear_to_srgb(channel(1))),
                    unorm8(linear_to_srgb(channel(2))),
                    unorm8(channel(3)),
                ]);
            }
        }
        Format::Rgb10A2Unorm => {
            for t in data[..texels * 4].chunks_exact(4) {
                let packed = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);
                let ten = |shift: u32| ((packed >> shift & 0x3ff) * 255 / 1023) as u8;
                rgba.extend_from_slice(&[ten(0), ten(10), ten(20), ((packed >> 30) * 255 / 3) as u8]);
            }
        }
        Format::R32Float | Format::D32Float => {
            for t in data[..texels * 4].chunks_exact(4) {
                let grey = unorm8(f32::from_le_bytes([t[0], t[1], t[2], t[3]]));
                rgba.extend_from_slice(&[grey, grey, grey, 255]);
            }
        }
        _ => return None,
    }
    Some(rgba)
}

/// The thumbnail size for a `width` x `height` image: at most
/// `MAX_THUMBNAIL_WIDTH` wide, width a multiple of 8, same aspect ratio.
pub fn thumbnail_size(width: u32, height: u32) -> Option<(u32, u32)> {
    let thumb_width = width.min(MAX_THUMBNAIL_WIDTH) & !7;
    if thumb_width == 0 || height == 0 {
        return None;
    }
    let thumb_height = ((height as u64 * thumb_width as u64) / width as u64).max(1) as u32;
    Some((thumb_width, thumb_height))
}

/// Make a thumbnail from the packed texels of a back buffer.
pub fn make_thumbnail(format: Format, width: u32, height: u32, data: &[u8]) -> Option<Thumbnail> {
    let rgba = to_rgba8(format, width, height, data)?;
    let (thumb_width, thumb_height) = thumbnail_size(width, height)?;

    let mut rgb = Vec::with_capacity(thumb_width as usize * thumb_height as usize * 3);
    for y in 0..thumb_height {
        let src_y = (y as u64 * height as u64 / thumb_height as u64) as usize;
        for x in 0..thumb_width {
            let src_x = (x as u64 * width as u64 / thumb_width as u64) as usize;
            let texel = (src_y * width as usize + src_x) * 4;
            rgb.extend_from_slice(&rgba[texel..texel + 3]);
        }
    }

    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    if let Err(err) = encoder.write_image(&rgb, thumb_width, thumb_height, ExtendedColorType::Rgb8) {
        tracing::warn!("couldn't encode thumbnail: {}", err);
        return None;
    }
    Some(Thumbnail {
        width: thumb_width,
        height: thumb_height,
        jpeg,
    })
}

/// Write 8-bit RGBA pixels to `path` as a PNG.
pub fn write_png<P: AsRef<Path>>(path: P, width: u32, height: u32, rgba: &[u8]) -> ImageResult<()> {
    let file = io::BufWriter::new(fs::File::create(path)?);
    PngEncoder::new(file).write_image(rgba, width, height, ExtendedColorType::Rgba8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_sizes() {
        assert_eq!(thumbnail_size(4000, 1000), Some((2048, 512)));
        assert_eq!(thumbnail_size(100, 50), Some((96, 48)));
        assert_eq!(thumbnail_size(7, 7), None);
        assert_eq!(thumbnail_size(64, 1), Some((64, 1)));
    }

    #[test]
    fn format_conversions() {
        assert_eq!(to_rgba8(Format::Bgra8Unorm, 1, 1, &[1, 2, 3, 4]).unwrap(), [3, 2, 1, 4]);

        let white = Format::Rgb10A2Unorm.encode_color([1.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(to_rgba8(Format::Rgb10A2Unorm, 1, 1, &white).unwrap(), [255, 0, 255, 255]);

        // Linear 0.5 is about 188 in sRGB.
        let grey = Format::Rgba16Float.encode_color([0.5, 0.5, 0.5, 0.5]).unwrap();
        let converted = to_rgba8(Format::Rgba16Float, 1, 1, &grey).unwrap();
        assert_eq!(converted[0], 188);
        assert_eq!(converted[3], 128);

        assert_eq!(to_rgba8(Format::R32Uint, 1, 1, &[0; 4]), None);
        assert_eq!(to_rgba8(Format::Rgba8Unorm, 2, 2, &[0; 4]), None);
    }

    #[test]
    fn thumbnail_is_jpeg() {
        let texels: Vec<u8> = (0..64 * 32).flat_map(|i| [(i % 256) as u8, 0, 0, 255]).collect();
        let thumbnail = make_thumbnail(Format::Rgba8Unorm, 64, 32, &texels).unwrap();
        assert_eq!((thumbnail.width, thumbnail.height), (64, 32));

        let decoded = image::load_from_memory_with_format(&thumbnail.jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }
}
