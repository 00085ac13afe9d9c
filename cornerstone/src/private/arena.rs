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

use core::cell::{Cell, RefCell};

use crate::message::{Allocator, ReaderOptions, ReaderSegments};
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, ErrorKind, Result};

/// Tracks the cumulative number of words read through an arena, so that a
/// maliciously overlapping message cannot amplify a small buffer into an
/// unbounded amount of traversal work.
pub struct ReadLimiter {
    limit: Cell<u64>,
}

impl ReadLimiter {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit: Cell::new(match limit {
                Some(value) => value as u64,
                None => u64::MAX,
            }),
        }
    }

    pub fn can_read(&self, amount: u64) -> Result<()> {
        let current = self.limit.get();
        if amount > current {
            Err(Error::from_kind(ErrorKind::TraversalLimitExceeded))
        } else {
            self.limit.set(current - amount);
            Ok(())
        }
    }
}

/// Read-side view of a message's segments, as seen by `layout`.
pub trait ReaderArena {
    fn get_segment(&self, id: u32) -> Result<&[u8]>;
    fn amplified_read(&self, virtual_amount: u64) -> Result<()>;
}

pub struct ReaderArenaImpl<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            segments,
            read_limiter: ReadLimiter::new(options.traversal_limit_in_words),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }

    pub fn into_segments(self) -> S {
        self.segments
    }

    pub fn segments(&self) -> &S {
        &self.segments
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        match self.segments.get_segment(id) {
            Some(seg) => Ok(seg),
            None => Err(Error {
                kind: ErrorKind::PointerOutOfBounds,
                extra: format!("invalid segment id: {id}"),
            }),
        }
    }

    fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        self.read_limiter.can_read(virtual_amount)
    }
}

/// Arena used by default `PointerReader`s, backing absent pointer fields.
/// Every segment is a single zero word, so all reads see null.
pub struct NullArena;

static ZERO_WORD: [u8; BYTES_PER_WORD] = [0; BYTES_PER_WORD];

impl ReaderArena for NullArena {
    fn get_segment(&self, _id: u32) -> Result<&[u8]> {
        Ok(&ZERO_WORD)
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }
}

pub static NULL_ARENA: NullArena = NullArena;

/// Write-side view of a message's segments, as seen by `layout`.
///
/// Builders form a tree sharing one arena, so mutation goes through `&self`
/// with interior mutability rather than `&mut`. All offsets are trusted:
/// they were produced by this arena's own `allocate` calls, so range
/// violations are bugs rather than recoverable errors.
pub trait BuilderArena {
    /// Allocates `amount` words in the given segment, if it has room.
    fn allocate(&self, segment_id: u32, amount: u32) -> Option<u32>;

    /// Allocates `amount` words in any segment with room, creating a new
    /// segment if necessary.
    fn allocate_anywhere(&self, amount: u32) -> Result<(u32, u32)>;

    fn segment_count(&self) -> u32;

    /// Number of words allocated so far in the given segment.
    fn segment_word_count(&self, id: u32) -> u32;

    fn read_word(&self, id: u32, word_offset: u32) -> u64;
    fn write_word(&self, id: u32, word_offset: u32, value: u64);

    fn read_bytes_into(&self, id: u32, start_byte: u64, dst: &mut [u8]);
    fn write_bytes(&self, id: u32, start_byte: u64, src: &[u8]);
}

struct BuilderSegment {
    data: Vec<u8>,
    /// Words handed out so far; the rest of `data` is free space.
    allocated: u32,
}

impl BuilderSegment {
    fn capacity_words(&self) -> u32 {
        (self.data.len() / BYTES_PER_WORD) as u32
    }
}

struct BuilderArenaInner<A> {
    allocator: A,
    segments: Vec<BuilderSegment>,
}

pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    inner: RefCell<BuilderArenaInner<A>>,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            inner: RefCell::new(BuilderArenaInner {
                allocator,
                segments: Vec::new(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().segments.is_empty()
    }

    /// Asks the allocator for a fresh segment of at least `minimum_size`
    /// words. On allocator failure nothing is published.
    pub fn allocate_segment(&self, minimum_size: u32) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        let data = inner.allocator.allocate_segment(minimum_size)?;
        debug_assert!(data.len() % BYTES_PER_WORD == 0);
        debug_assert!(data.len() / BYTES_PER_WORD >= minimum_size as usize);
        let id = inner.segments.len() as u32;
        inner.segments.push(BuilderSegment { data, allocated: 0 });
        Ok(id)
    }

    /// Copies out the allocated prefix of every segment, in order. This is
    /// the serialized form of the message.
    pub fn get_segments_for_output(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.borrow();
        inner
            .segments
            .iter()
            .map(|s| s.data[..s.allocated as usize * BYTES_PER_WORD].to_vec())
            .collect()
    }

    /// Consumes the arena, returning each segment truncated to its allocated
    /// prefix.
    pub fn into_segments(self) -> Vec<Vec<u8>> {
        let inner = self.inner.into_inner();
        inner
            .segments
            .into_iter()
            .map(|mut s| {
                s.data.truncate(s.allocated as usize * BYTES_PER_WORD);
                s.data
            })
            .collect()
    }

    pub fn into_allocator(self) -> A {
        self.inner.into_inner().allocator
    }
}

impl<A> BuilderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn allocate(&self, segment_id: u32, amount: u32) -> Option<u32> {
        let mut inner = self.inner.borrow_mut();
        let seg = &mut inner.segments[segment_id as usize];
        if seg.allocated + amount <= seg.capacity_words() {
            let offset = seg.allocated;
            seg.allocated += amount;
            Some(offset)
        } else {
            None
        }
    }

    fn allocate_anywhere(&self, amount: u32) -> Result<(u32, u32)> {
        {
            let mut inner = self.inner.borrow_mut();
            for (id, seg) in inner.segments.iter_mut().enumerate() {
                if seg.allocated + amount <= seg.capacity_words() {
                    let offset = seg.allocated;
                    seg.allocated += amount;
                    return Ok((id as u32, offset));
                }
            }
        }
        let id = self.allocate_segment(amount)?;
        let offset = self
            .allocate(id, amount)
            .expect("fresh segment must satisfy its minimum size");
        Ok((id, offset))
    }

    fn segment_count(&self) -> u32 {
        self.inner.borrow().segments.len() as u32
    }

    fn segment_word_count(&self, id: u32) -> u32 {
        self.inner.borrow().segments[id as usize].allocated
    }

    fn read_word(&self, id: u32, word_offset: u32) -> u64 {
        let inner = self.inner.borrow();
        let start = word_offset as usize * BYTES_PER_WORD;
        let bytes = &inner.segments[id as usize].data[start..start + BYTES_PER_WORD];
        u64::from_le_bytes(bytes.try_into().expect("word-sized slice"))
    }

    fn write_word(&self, id: u32, word_offset: u32, value: u64) {
        let mut inner = self.inner.borrow_mut();
        let start = word_offset as usize * BYTES_PER_WORD;
        inner.segments[id as usize].data[start..start + BYTES_PER_WORD]
            .copy_from_slice(&value.to_le_bytes());
    }

    fn read_bytes_into(&self, id: u32, start_byte: u64, dst: &mut [u8]) {
        let inner = self.inner.borrow();
        let start = start_byte as usize;
        dst.copy_from_slice(&inner.segments[id as usize].data[start..start + dst.len()]);
    }

    fn write_bytes(&self, id: u32, start_byte: u64, src: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        let start = start_byte as usize;
        inner.segments[id as usize].data[start..start + src.len()].copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeapAllocator;

    #[test]
    fn read_limiter_counts_down() {
        let limiter = ReadLimiter::new(Some(10));
        assert!(limiter.can_read(4).is_ok());
        assert!(limiter.can_read(6).is_ok());
        let err = limiter.can_read(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
    }

    #[test]
    fn allocate_within_and_across_segments() {
        let arena = BuilderArenaImpl::new(HeapAllocator::new().first_segment_words(2));
        let seg = arena.allocate_segment(2).unwrap();
        assert_eq!(seg, 0);
        assert_eq!(arena.allocate(0, 1), Some(0));
        assert_eq!(arena.allocate(0, 1), Some(1));
        assert_eq!(arena.allocate(0, 1), None);

        let (seg, offset) = arena.allocate_anywhere(5).unwrap();
        assert_eq!(seg, 1);
        assert_eq!(offset, 0);
        assert_eq!(arena.segment_count(), 2);
    }

    #[test]
    fn words_round_trip() {
        let arena = BuilderArenaImpl::new(HeapAllocator::new());
        arena.allocate_segment(4).unwrap();
        arena.allocate(0, 4).unwrap();
        arena.write_word(0, 2, 0xdead_beef_cafe_f00d);
        assert_eq!(arena.read_word(0, 2), 0xdead_beef_cafe_f00d);
        assert_eq!(arena.read_word(0, 3), 0);
    }
}
