//! Run-length encoding for resource contents.
//!
//! Initial-contents chunks carry whole subresources and buffers, which are
//! very often a cleared color or zeroes. This module compresses them before
//! they go into the capture.
//!
//! This module provides separate functions for treating the data as bytes or
//! as 32-bit words, because run-length encoding can benefit greatly from even
//! limited knowledge of the structure of the data. For example, a stream of
//! identical 32-bit texels, when viewed as bytes, looks like a repeating
//! four-byte pattern. If we compress that data as bytes, it may not have any
//! runs at all, but if we compress it as 32-bit values, it compresses
//! perfectly.
//!
//! ## Format
//!
//! The data is written as alternating 'runs' and 'literals':
//!
//! - A 'run' is a count C followed by a value, and represents C repetitions
//!   of the value.
//!
//! - A 'literal' is a count C followed by that many values, and represents
//!   the given sequence of values.
//!
//! The overall stream is either empty, or starts with a run. A run is always
//! followed by a literal or the end of the data. A literal is always followed
//! by a run or the end of the data.
//!
//! Note that literal counts may be zero, if the encoding really just wants to
//! switch from one run to another run.
//!
//! Counts are unsigned LEB128. Words are little-endian.

use crate::serialize::{read_unsigned, take_bytes, DeserializeError};
use std::io;

/// An element type the encoder can work in.
pub trait Element: Copy + PartialEq {
    fn write<S: io::Write>(self, stream: &mut S) -> io::Result<()>;
    fn read(buf: &mut &[u8]) -> Result<Self, DeserializeError>;
    fn extend(self, out: &mut Vec<u8>, count: usize);
}

impl Element for u8 {
    fn write<S: io::Write>(self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&[self])
    }

    fn read(buf: &mut &[u8]) -> Result<u8, DeserializeError> {
        Ok(take_bytes(buf, 1)?[0])
    }

    fn extend(self, out: &mut Vec<u8>, count: usize) {
        out.resize(out.len() + count, self);
    }
}

impl Element for u32 {
    fn write<S: io::Write>(self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&self.to_le_bytes())
    }

    fn read(buf: &mut &[u8]) -> Result<u32, DeserializeError> {
        let bytes = take_bytes(buf, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn extend(self, out: &mut Vec<u8>, count: usize) {
        let bytes = self.to_le_bytes();
        out.reserve(count * 4);
        for _ in 0..count {
            out.extend_from_slice(&bytes);
        }
    }
}

/// Write a slice of bytes with run-length encoding.
pub fn write_u8<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: io::Write,
{
    write_general(stream, data)
}

/// Write `data`, a sequence of little-endian 32-bit words, with run-length
/// encoding. `data.len()` must be a multiple of four.
pub fn write_u32<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: io::Write,
{
    if data.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("rle::write_u32: length {} is not a whole number of words", data.len()),
        ));
    }
    let words: Vec<u32> = data
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    write_general(stream, &words)
}

/// Write a generic slice of values with run-length encoding.
pub fn write_general<T, S>(stream: &mut S, mut data: &[T]) -> io::Result<()>
where
    T: Element,
    S: io::Write,
{
    // If `data` is non-empty, start with a run.
    let mut lead = match data.split_first() {
        None => return Ok(()),
        Some((head, tail)) => {
            data = tail;
            *head
        }
    };
    let mut run_length = 1;

    loop {
        // invariant: `data` is the portion of the input immediately following
        // `run_length` consecutive copies of `lead`.

        // Extend the run as far as we can.
        let extension_length = data.iter().take_while(|&&v| v == lead).count();

        write_count(stream, run_length + extension_length)?;
        lead.write(stream)?;
        data = &data[extension_length..];

        // Write a literal. Don't try to find the optimal place to end it;
        // just require at least four repetitions to switch to a run.
        let literal_tail = match data.split_first() {
            None => return Ok(()),
            Some((head, tail)) => {
                lead = *head;
                tail
            }
        };
        run_length = 1;

        let mut literal_length = 1;
        for elt in literal_tail {
            literal_length += 1;
            if *elt == lead {
                run_length += 1;
                if run_length >= 4 {
                    break;
                }
            } else {
                lead = *elt;
                run_length = 1;
            }
        }

        // If we didn't find a long enough run, this literal goes to the end.
        if run_length < 4 {
            debug_assert_eq!(literal_length, data.len());
            write_count(stream, literal_length)?;
            for elt in data {
                elt.write(stream)?;
            }
            return Ok(());
        }

        // Write out this literal, and begin the next run.
        literal_length -= run_length;
        write_count(stream, literal_length)?;
        for elt in &data[..literal_length] {
            elt.write(stream)?;
        }
        data = &data[literal_length + run_length..];
    }
}

fn write_count<S: io::Write>(stream: &mut S, count: usize) -> io::Result<()> {
    leb128::write::unsigned(stream, count as u64)?;
    Ok(())
}

/// Read run-length encoded bytes from `buf`, expanding to at most `limit`
/// bytes.
pub fn read_u8(buf: &mut &[u8], limit: usize) -> Result<Vec<u8>, DeserializeError> {
    read_general::<u8>(buf, limit)
}

/// Read run-length encoded 32-bit words from `buf`, returning their
/// little-endian bytes. The result is at most `limit` bytes long.
pub fn read_u32(buf: &mut &[u8], limit: usize) -> Result<Vec<u8>, DeserializeError> {
    read_general::<u32>(buf, limit)
}

/// Read run-length encoded `T` values from `buf`, consuming all of it, and
/// return their bytes.
///
/// Fail if the expansion would exceed `limit` bytes. The counts come from the
/// file, and a corrupt one shouldn't be able to exhaust memory.
pub fn read_general<T: Element>(buf: &mut &[u8], limit: usize) -> Result<Vec<u8>, DeserializeError> {
    let size = std::mem::size_of::<T>();
    let mut expanded = Vec::new();
    let check = |expanded: &Vec<u8>, count: usize| -> Result<(), DeserializeError> {
        match count.checked_mul(size).and_then(|n| n.checked_add(expanded.len())) {
            Some(total) if total <= limit => Ok(()),
            _ => Err(DeserializeError::RunTooLong { limit }),
        }
    };

    loop {
        if buf.is_empty() {
            break;
        }

        // Expand a run.
        let count = read_count(buf)?;
        let value = T::read(buf)?;
        check(&expanded, count)?;
        value.extend(&mut expanded, count);

        if buf.is_empty() {
            break;
        }

        // Expand a literal.
        let count = read_count(buf)?;
        check(&expanded, count)?;
        for _ in 0..count {
            let value = T::read(buf)?;
            value.extend(&mut expanded, 1);
        }
    }

    Ok(expanded)
}

fn read_count(buf: &mut &[u8]) -> Result<usize, DeserializeError> {
    let count = read_unsigned(buf)?;
    usize::try_from(count).map_err(|_| DeserializeError::OutOfRange(count))
}

#[test]
fn test_write_u8() {
    fn check(data: &[u8], rle: &[u8]) {
        let mut buf = vec![];
        assert!(write_u8(&mut buf, &data).is_ok());
        assert_eq!(buf, rle);
    }

    check(&[], &[]);
    check(&[1], &[1, 1]);
    check(&[1, 1], &[2, 1]);
    check(&[1, 1, 1, 2, 2, 2, 2], &[3, 1, 0, 4, 2]);
    check(&[1, 2, 3, 4, 5, 6], &[1, 1, 5, 2, 3, 4, 5, 6]);
    check(&[1, 2, 3, 3, 3], &[1, 1, 4, 2, 3, 3, 3]);
    check(&[1, 2, 3, 3, 3, 3], &[1, 1, 1, 2, 4, 3]);
    check(&[1, 2, 3, 3, 3, 3, 3], &[1, 1, 1, 2, 5, 3]);

    check(&[1, 2, 3, 3, 3, 3, 3, 4, 5], &[1, 1, 1, 2, 5, 3, 2, 4, 5]);
    check(
        &[1, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5],
        &[1, 1, 1, 2, 4, 3, 0, 4, 4, 0, 4, 5],
    );

    // Counts past 127 take two LEB128 bytes.
    check(&[7; 200], &[0xc8, 0x01, 7]);
}

#[test]
fn test_write_u32() {
    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    // Counts and words interleaved: counts are single LEB128 bytes here.
    fn check(data: &[u32], rle: &[(u8, &[u32])]) {
        let mut expected = vec![];
        for &(count, values) in rle {
            expected.push(count);
            expected.extend(words(values));
        }
        let mut buf = vec![];
        assert!(write_u32(&mut buf, &words(data)).is_ok());
        assert_eq!(buf, expected);
    }

    check(&[], &[]);
    check(&[90], &[(1, &[90])]);
    check(&[0xff00ff00, 0xff00ff00], &[(2, &[0xff00ff00])]);
    check(&[1, 1, 1, 2, 2, 2, 2], &[(3, &[1]), (0, &[]), (4, &[2])]);
    check(&[1, 2, 3, 4, 5, 6], &[(1, &[1]), (5, &[2, 3, 4, 5, 6])]);
    check(&[1, 2, 3, 3, 3, 3], &[(1, &[1]), (1, &[2]), (4, &[3])]);

    assert!(write_u32(&mut vec![], &[1, 2, 3]).is_err());
}

#[test]
fn test_read_u8() {
    fn check(mut rle: &[u8], expected: &[u8]) {
        let result = read_u8(&mut rle, 1024);

        assert_eq!(result.unwrap(), expected);
    }

    check(&[], &[]);
    check(&[1, 1], &[1]);
    check(&[2, 1], &[1, 1]);
    check(&[3, 1, 0, 4, 2], &[1, 1, 1, 2, 2, 2, 2]);
    check(&[1, 1, 5, 2, 3, 4, 5, 6], &[1, 2, 3, 4, 5, 6]);
    check(&[1, 1, 4, 2, 3, 3, 3], &[1, 2, 3, 3, 3]);
    check(&[1, 1, 1, 2, 4, 3], &[1, 2, 3, 3, 3, 3]);
    check(&[1, 1, 1, 2, 5, 3], &[1, 2, 3, 3, 3, 3, 3]);

    check(&[1, 1, 1, 2, 5, 3, 2, 4, 5], &[1, 2, 3, 3, 3, 3, 3, 4, 5]);
    check(
        &[1, 1, 1, 2, 4, 3, 0, 4, 4, 0, 4, 5],
        &[1, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5],
    );
}

#[test]
fn test_read_u32() {
    let texels: Vec<u8> = [0x11223344_u32, 0x11223344, 0x11223344, 0x11223344, 5, 6]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    let mut rle = vec![];
    write_u32(&mut rle, &texels).unwrap();
    assert!(rle.len() < texels.len());
    assert_eq!(read_u32(&mut &rle[..], texels.len()).unwrap(), texels);
}

#[test]
fn test_read_limits() {
    // A run of 200 bytes doesn't fit in 100.
    assert_eq!(
        read_u8(&mut &[0xc8, 0x01, 7][..], 100),
        Err(DeserializeError::RunTooLong { limit: 100 })
    );
    // Literal claims three bytes but only has two.
    assert_eq!(
        read_u8(&mut &[1, 1, 3, 2, 2][..], 100),
        Err(DeserializeError::UnexpectedEof)
    );
    // Truncated word.
    assert_eq!(read_u32(&mut &[1, 1, 2][..], 100), Err(DeserializeError::UnexpectedEof));
}
