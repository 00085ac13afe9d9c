// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Reading and writing of messages in the standard stream framing: a
//! little-endian segment table (`segment_count - 1`, per-segment word counts,
//! padded to a whole word) followed by the segment bytes.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};

use crate::message::{self, Allocator, ReaderOptions, ReaderSegments};
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, ErrorKind, Result};

/// Upper bound on segments per message, matching the reference
/// implementation's sanity limit.
pub const SEGMENTS_COUNT_LIMIT: usize = 512;

/// Segments read out of a stream into one owned buffer.
pub struct OwnedSegments {
    /// (start, end) byte ranges of each segment within `owned_space`.
    segment_slices: Vec<(usize, usize)>,
    owned_space: Vec<u8>,
}

impl ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segment_slices
            .get(id as usize)
            .map(|&(start, end)| &self.owned_space[start..end])
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// Segments borrowed from a caller-supplied flat buffer: the zero-copy read
/// path.
pub struct SliceSegments<'a> {
    segment_slices: Vec<(usize, usize)>,
    data: &'a [u8],
}

impl<'a> ReaderSegments for SliceSegments<'a> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segment_slices
            .get(id as usize)
            .map(|&(start, end)| &self.data[start..end])
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// Reads bytes until `buf` is full. Returns `Ok(false)` if the stream was
/// already at EOF, and an error if EOF interrupts a partially-read buffer.
fn read_exact_or_eof<R: Read>(read: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::from_kind(ErrorKind::TruncatedMessage));
        }
        filled += n;
    }
    Ok(true)
}

fn read_exact<R: Read>(read: &mut R, buf: &mut [u8]) -> Result<()> {
    if read_exact_or_eof(read, buf)? {
        Ok(())
    } else {
        Err(Error::from_kind(ErrorKind::TruncatedMessage))
    }
}

/// Parses the first word of a segment table, returning the segment count.
fn parse_segment_count(bytes: &[u8; 4]) -> Result<usize> {
    let count_minus_one = LittleEndian::read_u32(bytes);
    if count_minus_one == u32::MAX {
        // Adding one would overflow; also the value used by some fuzzers.
        return Err(Error::from_kind(ErrorKind::InvalidFrame));
    }
    let count = count_minus_one as usize + 1;
    if count > SEGMENTS_COUNT_LIMIT {
        return Err(Error {
            kind: ErrorKind::InvalidFrame,
            extra: format!("message has too many segments: {count}"),
        });
    }
    Ok(count)
}

fn check_total_words(total_words: u64, options: ReaderOptions) -> Result<()> {
    if let Some(limit) = options.traversal_limit_in_words {
        if total_words > limit as u64 {
            return Err(Error {
                kind: ErrorKind::FrameTooLarge,
                extra: format!("message of {total_words} words exceeds the read limit"),
            });
        }
    }
    Ok(())
}

/// Reads a segment table, returning `None` on clean EOF.
///
/// On success, yields the total word count and each segment's byte range
/// within the segment data that follows.
fn read_segment_table<R: Read>(
    read: &mut R,
    options: ReaderOptions,
) -> Result<Option<(usize, Vec<(usize, usize)>)>> {
    let mut first = [0u8; 4];
    if !read_exact_or_eof(read, &mut first)? {
        return Ok(None);
    }
    let segment_count = parse_segment_count(&first)?;

    let mut size_bytes = vec![0u8; segment_count * 4];
    read_exact(read, &mut size_bytes)?;
    // Padding word, present when the table would otherwise end mid-word.
    if segment_count % 2 == 0 {
        let mut pad = [0u8; 4];
        read_exact(read, &mut pad)?;
    }

    let mut segment_slices = Vec::with_capacity(segment_count);
    let mut total_words = 0u64;
    for i in 0..segment_count {
        let words = LittleEndian::read_u32(&size_bytes[i * 4..i * 4 + 4]) as u64;
        let start = (total_words * BYTES_PER_WORD as u64) as usize;
        total_words += words;
        let end = (total_words * BYTES_PER_WORD as u64) as usize;
        segment_slices.push((start, end));
    }
    check_total_words(total_words, options)?;
    Ok(Some((total_words as usize, segment_slices)))
}

/// Reads one message, returning `None` on clean EOF.
pub fn try_read_message<R: Read>(
    read: &mut R,
    options: ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>> {
    let Some((total_words, segment_slices)) = read_segment_table(read, options)? else {
        return Ok(None);
    };
    let mut owned_space = vec![0u8; total_words * BYTES_PER_WORD];
    read_exact(read, &mut owned_space)?;
    let segments = OwnedSegments {
        segment_slices,
        owned_space,
    };
    Ok(Some(message::Reader::new(segments, options)))
}

pub fn read_message<R: Read>(
    read: &mut R,
    options: ReaderOptions,
) -> Result<message::Reader<OwnedSegments>> {
    match try_read_message(read, options)? {
        Some(message) => Ok(message),
        None => Err(Error::from_kind(ErrorKind::TruncatedMessage)),
    }
}

/// Parses a message from the front of `slice` without copying segment data,
/// advancing `slice` past the consumed bytes.
pub fn read_message_from_flat_slice<'a>(
    slice: &mut &'a [u8],
    options: ReaderOptions,
) -> Result<message::Reader<SliceSegments<'a>>> {
    let whole: &'a [u8] = *slice;
    let mut cursor: &[u8] = whole;
    let Some((total_words, segment_slices)) = read_segment_table(&mut cursor, options)? else {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    };
    let header_len = whole.len() - cursor.len();
    let body_len = total_words * BYTES_PER_WORD;
    if cursor.len() < body_len {
        return Err(Error::from_kind(ErrorKind::TruncatedMessage));
    }
    let data = &whole[header_len..header_len + body_len];
    *slice = &whole[header_len + body_len..];
    Ok(message::Reader::new(
        SliceSegments {
            segment_slices,
            data,
        },
        options,
    ))
}

/// Writes the segment table for the given segments.
fn write_segment_table<W: Write>(write: &mut W, segments: &[Vec<u8>]) -> Result<()> {
    let segment_count = segments.len();
    let mut table = vec![0u8; ((2 + segment_count) & !1) * 4];
    LittleEndian::write_u32(&mut table[0..4], segment_count as u32 - 1);
    for (i, segment) in segments.iter().enumerate() {
        LittleEndian::write_u32(
            &mut table[(i + 1) * 4..(i + 2) * 4],
            (segment.len() / BYTES_PER_WORD) as u32,
        );
    }
    write.write_all(&table)?;
    Ok(())
}

/// Writes `segments` with the standard framing.
pub fn write_message_segments<W: Write>(write: &mut W, segments: &[Vec<u8>]) -> Result<()> {
    debug_assert!(!segments.is_empty());
    write_segment_table(write, segments)?;
    for segment in segments {
        write.write_all(segment)?;
    }
    Ok(())
}

pub fn write_message<W: Write, A: Allocator>(
    write: &mut W,
    message: &message::Builder<A>,
) -> Result<()> {
    let segments = message.get_segments_for_output().into_vec();
    write_message_segments(write, &segments)
}

/// Serializes the message into a flat byte vector.
pub fn write_message_to_words<A: Allocator>(message: &message::Builder<A>) -> Vec<u8> {
    let mut output = Vec::new();
    write_message(&mut output, message).expect("writing to a Vec cannot fail");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Builder;
    use crate::private::layout::StructSize;

    fn build_test_message() -> Builder<crate::message::HeapAllocator> {
        let mut message = Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 1,
                })
                .unwrap();
            st.set_u32(0, 0xabcd);
            st.get_pointer_field(0).set_text("framed").unwrap();
        }
        message
    }

    #[test]
    fn single_segment_round_trip() {
        let message = build_test_message();
        let bytes = write_message_to_words(&message);

        // Header: count word + one size word (odd table, no padding).
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0);
        let words = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 8 + words * 8);

        let reader = read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u32(0), 0xabcd);
        assert_eq!(st.get_pointer_field(0).get_text().unwrap(), "framed");
    }

    #[test]
    fn flat_slice_round_trip_and_advance() {
        let message = build_test_message();
        let mut bytes = write_message_to_words(&message);
        bytes.extend_from_slice(&[0xaa; 3]); // trailing garbage stays

        let mut slice = &bytes[..];
        let reader = read_message_from_flat_slice(&mut slice, ReaderOptions::new()).unwrap();
        assert_eq!(slice, &[0xaa; 3]);
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        assert_eq!(
            root.get_struct()
                .unwrap()
                .get_pointer_field(0)
                .get_text()
                .unwrap(),
            "framed"
        );
    }

    #[test]
    fn multi_segment_round_trip() {
        let mut message = Builder::new(
            crate::message::HeapAllocator::new()
                .first_segment_words(1)
                .allocation_strategy(crate::message::AllocationStrategy::FixedSize),
        );
        {
            let root: crate::any_pointer::Builder = message.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 1,
                })
                .unwrap();
            st.set_u64(0, 7);
            st.get_pointer_field(0).set_text("spread").unwrap();
        }
        assert!(message.segment_count() > 1);
        let bytes = write_message_to_words(&message);
        let reader = read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 7);
        assert_eq!(st.get_pointer_field(0).get_text().unwrap(), "spread");
    }

    #[test]
    fn clean_eof_yields_none() {
        let empty: &[u8] = &[];
        assert!(try_read_message(&mut &empty[..], ReaderOptions::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let bytes = [0u8, 0, 0];
        let err = read_message(&mut &bytes[..], ReaderOptions::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TruncatedMessage);
    }

    #[test]
    fn overflowing_segment_count_is_invalid() {
        let bytes = [0xff, 0xff, 0xff, 0xff];
        let err = read_message(&mut &bytes[..], ReaderOptions::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFrame);
    }

    #[test]
    fn oversized_message_is_rejected() {
        // One segment of 2^20 words against a tiny read limit.
        let mut bytes = vec![0u8; 8];
        LittleEndian::write_u32(&mut bytes[4..8], 1 << 20);
        let err = read_message(
            &mut &bytes[..],
            *ReaderOptions::new().traversal_limit_in_words(Some(1024)),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FrameTooLarge);
    }
}
