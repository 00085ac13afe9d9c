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

//! Incremental reassembly of length-prefixed message frames from a byte
//! stream. One frame is one Cap'n Proto message in the standard segment-table
//! framing.
//!
//! The framer never panics on hostile input: it either yields complete,
//! well-formed frames or reports a specific error, after which the caller is
//! expected to reset it (or tear down the connection).

use byteorder::{ByteOrder, LittleEndian};

use cornerstone::{Error, ErrorKind, Result};

/// Default cap on a single frame: 8 Mi words = 64 MiB.
pub const DEFAULT_MAX_FRAME_WORDS: u64 = 8 * 1024 * 1024;

const BYTES_PER_WORD: u64 = 8;
const SEGMENTS_COUNT_LIMIT: u64 = 512;

pub struct Framer {
    buffer: Vec<u8>,
    max_frame_words: u64,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_frame_words(DEFAULT_MAX_FRAME_WORDS)
    }

    pub fn with_max_frame_words(max_frame_words: u64) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_words,
        }
    }

    /// Appends raw stream bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards all buffered bytes, e.g. after an error.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// The total frame length implied by the buffered header, or `None` if
    /// the header itself is still incomplete.
    fn frame_len(&self) -> Result<Option<usize>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let segment_count_minus_one = LittleEndian::read_u32(&self.buffer[0..4]);
        if segment_count_minus_one == u32::MAX {
            return Err(Error::from_kind(ErrorKind::InvalidFrame));
        }
        let segment_count = segment_count_minus_one as u64 + 1;
        if segment_count > SEGMENTS_COUNT_LIMIT {
            return Err(Error {
                kind: ErrorKind::InvalidFrame,
                extra: format!("frame has too many segments: {segment_count}"),
            });
        }
        // Header: count word, one u32 per segment, padded to a whole word.
        let header_bytes = ((segment_count + 2) & !1) * 4;
        if (self.buffer.len() as u64) < header_bytes {
            return Ok(None);
        }
        let mut total_words = 0u64;
        for i in 0..segment_count {
            let at = (4 + i * 4) as usize;
            total_words += LittleEndian::read_u32(&self.buffer[at..at + 4]) as u64;
        }
        if total_words > self.max_frame_words {
            return Err(Error {
                kind: ErrorKind::FrameTooLarge,
                extra: format!(
                    "frame of {total_words} words exceeds the {}-word limit",
                    self.max_frame_words
                ),
            });
        }
        Ok(Some((header_bytes + total_words * BYTES_PER_WORD) as usize))
    }

    /// Removes and returns the next complete frame, or `None` if more bytes
    /// are needed.
    pub fn pop_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.frame_len()? else {
            return Ok(None);
        };
        if self.buffer.len() < len {
            return Ok(None);
        }
        let rest = self.buffer.split_off(len);
        let frame = ::core::mem::replace(&mut self.buffer, rest);
        Ok(Some(frame))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(segments: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        serialize_table(segments, &mut out);
        for s in segments {
            out.extend_from_slice(s);
        }
        out
    }

    fn serialize_table(segments: &[&[u8]], out: &mut Vec<u8>) {
        let mut table = vec![0u8; ((2 + segments.len()) & !1) * 4];
        LittleEndian::write_u32(&mut table[0..4], segments.len() as u32 - 1);
        for (i, s) in segments.iter().enumerate() {
            LittleEndian::write_u32(&mut table[(i + 1) * 4..(i + 2) * 4], (s.len() / 8) as u32);
        }
        out.extend_from_slice(&table);
    }

    #[test]
    fn reassembles_split_delivery() {
        let frame = frame_of(&[&[1u8; 16], &[2u8; 8]]);
        let mut framer = Framer::new();
        for chunk in frame.chunks(3) {
            framer.push(chunk);
        }
        let popped = framer.pop_frame().unwrap().unwrap();
        assert_eq!(popped, frame);
        assert!(framer.pop_frame().unwrap().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn yields_concatenated_frames_in_order() {
        let a = frame_of(&[&[1u8; 8]]);
        let b = frame_of(&[&[2u8; 24]]);
        let mut framer = Framer::new();
        framer.push(&a);
        framer.push(&b);
        assert_eq!(framer.pop_frame().unwrap().unwrap(), a);
        assert_eq!(framer.pop_frame().unwrap().unwrap(), b);
        assert!(framer.pop_frame().unwrap().is_none());
    }

    #[test]
    fn incomplete_frame_is_not_popped() {
        let frame = frame_of(&[&[7u8; 32]]);
        let mut framer = Framer::new();
        framer.push(&frame[..frame.len() - 1]);
        assert!(framer.pop_frame().unwrap().is_none());
        framer.push(&frame[frame.len() - 1..]);
        assert_eq!(framer.pop_frame().unwrap().unwrap(), frame);
    }

    #[test]
    fn overflowing_segment_count_is_invalid() {
        let mut framer = Framer::new();
        framer.push(&[0xff, 0xff, 0xff, 0xff]);
        let err = framer.pop_frame().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFrame);
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering_it() {
        let mut framer = Framer::with_max_frame_words(16);
        let mut header = vec![0u8; 8];
        LittleEndian::write_u32(&mut header[4..8], 17);
        framer.push(&header);
        let err = framer.pop_frame().unwrap_err();
        assert_eq!(err.kind, ErrorKind::FrameTooLarge);
    }

    quickcheck::quickcheck! {
        /// Arbitrary byte streams either produce frames or a typed error;
        /// never a panic, and the buffer never exceeds the implied frame
        /// size plus unconsumed input.
        fn prop_fuzz_contract(chunks: Vec<Vec<u8>>) -> bool {
            let mut framer = Framer::with_max_frame_words(1024);
            let mut pushed = 0usize;
            for chunk in &chunks {
                framer.push(chunk);
                pushed += chunk.len();
                loop {
                    match framer.pop_frame() {
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(_) => {
                            framer.reset();
                            break;
                        }
                    }
                }
                if framer.buffered() > pushed {
                    return false;
                }
            }
            true
        }
    }
}
