//! Capture files on disk.
//!
//! A capture file is a short fixed header followed by a stream of framed
//! chunks. The header is:
//!
//! - the magic number `GCAP`, as a little-endian `u32`;
//! - the container version, a little-endian `u32`;
//! - the thumbnail's width, height and JPEG length, little-endian `u32`s,
//!   followed by the JPEG bytes. A zero width means there's no thumbnail.
//!
//! Everything after that is chunks, as written by `serialize::write_framed`.
//! The container version covers only this header; the chunk formats have
//! their own version, in the init-params chunk.

use crate::chunk::Chunk;
use crate::error::ReplayError;
use crate::pixels::Thumbnail;
use crate::serialize::{write_framed, ChunkReader, DeserializeError};

use std::io::Write;
use std::path::Path;
use std::{fs, io};

pub const MAGIC: u32 = u32::from_le_bytes(*b"GCAP");
pub const CONTAINER_VERSION: u32 = 1;

/// Writes a capture file.
pub struct CaptureWriter {
    out: io::BufWriter<fs::File>,
    scratch: Vec<u8>,
    bytes_written: usize,
    chunks_written: usize,
    size_limit: usize,
}

impl CaptureWriter {
    /// Create the file at `path`, and its directory if need be, and write
    /// the header.
    pub fn create<P: AsRef<Path>>(path: P, thumbnail: Option<&Thumbnail>) -> io::Result<CaptureWriter> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut out = io::BufWriter::new(fs::File::create(path)?);
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&CONTAINER_VERSION.to_le_bytes())?;
        match thumbnail {
            Some(thumbnail) => {
                out.write_all(&thumbnail.width.to_le_bytes())?;
                out.write_all(&thumbnail.height.to_le_bytes())?;
                out.write_all(&(thumbnail.jpeg.len() as u32).to_le_bytes())?;
                out.write_all(&thumbnail.jpeg)?;
            }
            None => out.write_all(&[0; 12])?,
        }

        Ok(CaptureWriter {
            out,
            scratch: Vec::new(),
            bytes_written: 0,
            chunks_written: 0,
            size_limit: 4 * 1024 * 1024 * 1024,
        })
    }

    pub fn set_size_limit(&mut self, limit: usize) {
        self.size_limit = limit;
    }

    pub fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.scratch.clear();
        write_framed(&mut self.scratch, chunk);
        self.bytes_written += self.scratch.len();

        // The limit only guards against filling the disk; it can be overrun
        // by one chunk.
        if self.bytes_written > self.size_limit {
            return Err(io::Error::new(io::ErrorKind::Other, "capture file size limit reached"));
        }

        self.out.write_all(&self.scratch)?;
        self.chunks_written += 1;
        Ok(())
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    /// Flush the file, returning the number of chunk bytes written.
    pub fn finish(mut self) -> io::Result<usize> {
        self.out.flush()?;
        Ok(self.bytes_written)
    }
}

/// A capture file read into memory.
#[derive(Debug)]
pub struct CaptureFile {
    pub container_version: u32,
    pub thumbnail: Option<Thumbnail>,
    pub chunks: ChunkReader,
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, ReplayError> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or(DeserializeError::UnexpectedEof)?;
    *offset += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl CaptureFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<CaptureFile, ReplayError> {
        CaptureFile::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<CaptureFile, ReplayError> {
        let mut offset = 0;
        let magic = read_u32(&data, &mut offset)?;
        if magic != MAGIC {
            return Err(ReplayError::BadMagic(magic));
        }
        let container_version = read_u32(&data, &mut offset)?;
        if container_version != CONTAINER_VERSION {
            return Err(ReplayError::BadContainer(container_version));
        }

        let width = read_u32(&data, &mut offset)?;
        let height = read_u32(&data, &mut offset)?;
        let jpeg_len = read_u32(&data, &mut offset)? as usize;
        let jpeg = data
            .get(offset..offset + jpeg_len)
            .ok_or(DeserializeError::UnexpectedEof)?
            .to_vec();
        offset += jpeg_len;

        let thumbnail = if width == 0 {
            None
        } else {
            Some(Thumbnail { width, height, jpeg })
        };

        Ok(CaptureFile {
            container_version,
            thumbnail,
            chunks: ChunkReader::new(data[offset..].to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;
    use crate::serialize::ChunkBuilder;

    #[test]
    fn header_and_chunks_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.cap");
        let thumbnail = Thumbnail {
            width: 8,
            height: 4,
            jpeg: vec![0xff, 0xd8, 0xff, 0xd9],
        };

        let mut writer = CaptureWriter::create(&path, Some(&thumbnail)).unwrap();
        writer
            .write_chunk(&ChunkBuilder::new(ChunkType::InitParams).field("version", &11_u32).finish())
            .unwrap();
        writer.write_chunk(&ChunkBuilder::new(ChunkType::PopMarker).finish()).unwrap();
        assert_eq!(writer.chunks_written(), 2);
        writer.finish().unwrap();

        let mut file = CaptureFile::open(&path).unwrap();
        assert_eq!(file.thumbnail, Some(thumbnail));

        let header = file.chunks.push_context().unwrap();
        assert_eq!(header.chunk_type(), Some(ChunkType::InitParams));
        assert_eq!(file.chunks.payload().field::<u32>("version").unwrap(), 11);
        file.chunks.pop_context(ChunkType::InitParams);

        let header = file.chunks.push_context().unwrap();
        assert_eq!(header.chunk_type(), Some(ChunkType::PopMarker));
        file.chunks.skip_current_chunk();
        assert!(file.chunks.at_end());
    }

    #[test]
    fn bad_headers() {
        assert!(matches!(
            CaptureFile::from_bytes(b"RIFF\x01\0\0\0".to_vec()),
            Err(ReplayError::BadMagic(_))
        ));

        let mut data = MAGIC.to_le_bytes().to_vec();
        data.extend_from_slice(&7_u32.to_le_bytes());
        assert!(matches!(CaptureFile::from_bytes(data), Err(ReplayError::BadContainer(7))));

        assert!(matches!(
            CaptureFile::from_bytes(MAGIC.to_le_bytes().to_vec()),
            Err(ReplayError::Deserialize(DeserializeError::UnexpectedEof))
        ));
    }
}
