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

//! The packed encoding: a word-oriented run-length scheme in which each word
//! is preceded by a tag byte whose bit i says whether byte i is nonzero, with
//! special coalescing for runs of all-zero words (tag 0x00 plus a count of
//! additional elided words) and runs of dense words (tag 0xff, the word's
//! eight bytes, then a count of following words stored uncompressed).
//!
//! Packing is applied to a full serialized message, segment table included.

use std::io::Read;

use crate::message::{self, Allocator, ReaderOptions};
use crate::private::units::BYTES_PER_WORD;
use crate::serialize::{self, OwnedSegments};
use crate::{Error, ErrorKind, Result};

fn word_at(bytes: &[u8], index: usize) -> &[u8] {
    &bytes[index * BYTES_PER_WORD..(index + 1) * BYTES_PER_WORD]
}

/// Packs `unpacked`, whose length must be a whole number of words.
pub fn pack(unpacked: &[u8]) -> Vec<u8> {
    assert!(unpacked.len() % BYTES_PER_WORD == 0);
    let word_count = unpacked.len() / BYTES_PER_WORD;
    let mut out = Vec::with_capacity(unpacked.len() / 2);

    let mut i = 0;
    while i < word_count {
        let word = word_at(unpacked, i);
        if word.iter().all(|&b| b == 0) {
            // Coalesce up to 255 additional zero words after this one.
            let mut run = 0usize;
            while run < 255 && i + 1 + run < word_count {
                if word_at(unpacked, i + 1 + run).iter().all(|&b| b == 0) {
                    run += 1;
                } else {
                    break;
                }
            }
            out.push(0x00);
            out.push(run as u8);
            i += 1 + run;
            continue;
        }

        let mut tag = 0u8;
        for (bit, &byte) in word.iter().enumerate() {
            if byte != 0 {
                tag |= 1 << bit;
            }
        }
        out.push(tag);
        for &byte in word {
            if byte != 0 {
                out.push(byte);
            }
        }

        if tag == 0xff {
            // Words with no zero bytes gain nothing from tagging; emit the
            // following such words as one uncompressed run.
            let mut run = 0usize;
            while run < 255 && i + 1 + run < word_count {
                if word_at(unpacked, i + 1 + run).iter().all(|&b| b != 0) {
                    run += 1;
                } else {
                    break;
                }
            }
            out.push(run as u8);
            out.extend_from_slice(
                &unpacked[(i + 1) * BYTES_PER_WORD..(i + 1 + run) * BYTES_PER_WORD],
            );
            i += 1 + run;
        } else {
            i += 1;
        }
    }
    out
}

/// Unpacks `packed`, rejecting output longer than `max_words` and input that
/// ends in the middle of an item.
pub fn unpack(packed: &[u8], max_words: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;

    fn take<'a>(packed: &'a [u8], i: &mut usize, n: usize) -> Result<&'a [u8]> {
        if *i + n > packed.len() {
            return Err(Error::from_kind(ErrorKind::TruncatedMessage));
        }
        let slice = &packed[*i..*i + n];
        *i += n;
        Ok(slice)
    }

    while i < packed.len() {
        let tag = take(packed, &mut i, 1)?[0];
        match tag {
            0x00 => {
                let run = take(packed, &mut i, 1)?[0] as usize;
                out.resize(out.len() + (run + 1) * BYTES_PER_WORD, 0);
            }
            0xff => {
                out.extend_from_slice(take(packed, &mut i, BYTES_PER_WORD)?);
                let run = take(packed, &mut i, 1)?[0] as usize;
                out.extend_from_slice(take(packed, &mut i, run * BYTES_PER_WORD)?);
            }
            _ => {
                for bit in 0..8 {
                    if tag & (1 << bit) != 0 {
                        out.push(take(packed, &mut i, 1)?[0]);
                    } else {
                        out.push(0);
                    }
                }
            }
        }
        if out.len() > max_words * BYTES_PER_WORD {
            return Err(Error::from_kind(ErrorKind::FrameTooLarge));
        }
    }
    Ok(out)
}

/// A reader adapter that unpacks on the fly, so the stream deserializer can
/// consume exactly as much packed input as one message needs.
pub struct PackedRead<R> {
    inner: R,
    buffer: Vec<u8>,
    consumed: usize,
}

impl<R: Read> PackedRead<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            consumed: 0,
        }
    }

    fn read_inner_exact(&mut self, buf: &mut [u8]) -> ::std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(::std::io::Error::from(::std::io::ErrorKind::UnexpectedEof));
            }
            filled += n;
        }
        Ok(())
    }

    /// Decodes one tagged item into the buffer.
    fn refill(&mut self) -> ::std::io::Result<bool> {
        let mut tag = [0u8; 1];
        let n = self.inner.read(&mut tag)?;
        if n == 0 {
            return Ok(false);
        }
        match tag[0] {
            0x00 => {
                let mut run = [0u8; 1];
                self.read_inner_exact(&mut run)?;
                self.buffer
                    .resize(self.buffer.len() + (run[0] as usize + 1) * BYTES_PER_WORD, 0);
            }
            0xff => {
                let mut word = [0u8; BYTES_PER_WORD];
                self.read_inner_exact(&mut word)?;
                self.buffer.extend_from_slice(&word);
                let mut run = [0u8; 1];
                self.read_inner_exact(&mut run)?;
                let mut raw = vec![0u8; run[0] as usize * BYTES_PER_WORD];
                self.read_inner_exact(&mut raw)?;
                self.buffer.extend_from_slice(&raw);
            }
            mask => {
                for bit in 0..8 {
                    if mask & (1 << bit) != 0 {
                        let mut byte = [0u8; 1];
                        self.read_inner_exact(&mut byte)?;
                        self.buffer.push(byte[0]);
                    } else {
                        self.buffer.push(0);
                    }
                }
            }
        }
        Ok(true)
    }
}

impl<R: Read> Read for PackedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> ::std::io::Result<usize> {
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
            if !self.refill()? {
                return Ok(0);
            }
        }
        let available = &self.buffer[self.consumed..];
        let n = ::core::cmp::min(available.len(), buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consumed += n;
        Ok(n)
    }
}

/// Reads a packed message from a stream.
pub fn read_message<R: Read>(
    read: &mut R,
    options: ReaderOptions,
) -> Result<message::Reader<OwnedSegments>> {
    serialize::read_message(&mut PackedRead::new(read), options)
}

/// Writes the message in packed form.
pub fn write_message<W: ::std::io::Write, A: Allocator>(
    write: &mut W,
    message: &message::Builder<A>,
) -> Result<()> {
    let unpacked = serialize::write_message_to_words(message);
    write.write_all(&pack(&unpacked))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::private::layout::StructSize;

    #[track_caller]
    fn check(unpacked: &[u8], packed: &[u8]) {
        assert_eq!(pack(unpacked), packed);
        assert_eq!(unpack(packed, 1 << 20).unwrap(), unpacked);
    }

    #[test]
    fn encoding_examples() {
        check(&[0; 8], &[0x00, 0x00]);
        check(&[0; 24], &[0x00, 0x02]);
        check(
            &[8, 0, 0, 0, 0, 0, 0, 0],
            &[0x01, 8],
        );
        check(
            &[0, 0, 12, 0, 0, 34, 0, 0],
            &[0b0010_0100, 12, 34],
        );
        check(
            &[1, 3, 2, 4, 5, 7, 6, 8],
            &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
        );
        // A dense word followed by another dense word: uncompressed run.
        check(
            &[1, 2, 3, 4, 5, 6, 7, 8, 8, 7, 6, 5, 4, 3, 2, 1],
            &[0xff, 1, 2, 3, 4, 5, 6, 7, 8, 1, 8, 7, 6, 5, 4, 3, 2, 1],
        );
        // Mixed: a sparse word, then zeros, then a sparse word.
        check(
            &[
                0, 0, 0, 0, 0, 0, 0, 1, //
                0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, //
                9, 0, 0, 0, 0, 0, 0, 0,
            ],
            &[0x80, 1, 0x00, 0x01, 0x01, 9],
        );
    }

    #[test]
    fn unpack_rejects_truncated_input() {
        // Tag promises two nonzero bytes, input has one.
        let err = unpack(&[0b0000_0011, 5], 1024).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TruncatedMessage);
        // 0xff run count promises a word that is not there.
        let err = unpack(&[0xff, 1, 2, 3, 4, 5, 6, 7, 8, 2, 0], 1024).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TruncatedMessage);
    }

    #[test]
    fn unpack_rejects_output_overrun() {
        let err = unpack(&[0x00, 0xff], 4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FrameTooLarge);
    }

    #[test]
    fn long_zero_runs_split_at_256_words() {
        let unpacked = vec![0u8; 300 * 8];
        let packed = pack(&unpacked);
        assert_eq!(packed, vec![0x00, 255, 0x00, 43]);
        assert_eq!(unpack(&packed, 1 << 20).unwrap(), unpacked);
    }

    #[test]
    fn message_round_trip() {
        let mut message = crate::message::Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 2,
                    pointers: 1,
                })
                .unwrap();
            st.set_u64(0, 0x0102_0304_0506_0708);
            st.get_pointer_field(0).set_text("packed!").unwrap();
        }
        let mut packed = Vec::new();
        write_message(&mut packed, &message).unwrap();
        let unpacked_len = serialize::write_message_to_words(&message).len();
        assert!(packed.len() < unpacked_len);

        let reader = read_message(&mut &packed[..], ReaderOptions::new()).unwrap();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 0x0102_0304_0506_0708);
        assert_eq!(st.get_pointer_field(0).get_text().unwrap(), "packed!");
    }

    quickcheck::quickcheck! {
        fn prop_unpack_pack_round_trip(words: Vec<u64>) -> bool {
            let unpacked: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            unpack(&pack(&unpacked), words.len() + 1).unwrap() == unpacked
        }

        fn prop_pack_unpack_fixed_point(words: Vec<u64>) -> bool {
            // pack output is canonical: unpacking and repacking reproduces it.
            let unpacked: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            let packed = pack(&unpacked);
            pack(&unpack(&packed, words.len() + 1).unwrap()) == packed
        }
    }
}
