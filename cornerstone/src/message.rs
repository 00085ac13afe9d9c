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

//! Untyped root container for a Cap'n Proto value.
//!
//! [Reader] is a read-only view over caller-supplied segment bytes; nothing
//! is copied until a blob or struct accessor asks for it. [Builder] owns its
//! segments and allocates them through a fallible [Allocator].
//!
//! [TypedReader] and [TypedBuilder] are strongly-typed variants,
//! parameterized by the `Owned` marker type that generated code provides for
//! each struct.

use crate::any_pointer;
use crate::private::arena::{BuilderArena, BuilderArenaImpl, ReaderArena, ReaderArenaImpl};
use crate::private::layout::{PointerBuilder, PointerReader};
use crate::private::units::BYTES_PER_WORD;
use crate::traits::{FromPointerBuilder, FromPointerReader, Owned, SetPointerBuilder};
use crate::{Error, ErrorKind, Result};

/// Options controlling how data is read.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Limits how many total (8-byte) words of data are allowed to be
    /// traversed. Traversal is counted when a new struct or list reader is
    /// obtained, e.g. from a get() accessor, so reading the same sub-object
    /// twice counts it twice.
    ///
    /// This limit exists for security reasons: multiple pointers in a
    /// message may point at the same location, so a message that is small on
    /// the wire can be made to appear enormous when traversed.
    ///
    /// A limit of `None` means no limit is enforced.
    pub traversal_limit_in_words: Option<usize>,

    /// Limits how deeply nested a message structure can be. Recursive
    /// readers would otherwise overflow the stack on deeply nested or cyclic
    /// messages.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: Some(8 * 1024 * 1024),
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: Option<usize>) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// An object that manages the buffers underlying a Cap'n Proto message
/// reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`, or `None` if `idx` is out of
    /// range. Segments are whole numbers of 8-byte words.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    /// Gets the number of segments.
    fn len(&self) -> usize {
        for i in 0.. {
            if self.get_segment(i as u32).is_none() {
                return i;
            }
        }
        unreachable!()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments + ?Sized,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of borrowed segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl<'b> ReaderSegments for SegmentArray<'b> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl<'b> ReaderSegments for [&'b [u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        <[&[u8]]>::len(self)
    }
}

/// Owned segments, as produced by `Builder::into_reader()`.
pub struct Segments {
    segments: Vec<Vec<u8>>,
}

impl Segments {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }
}

impl ReaderSegments for Segments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).map(|s| &s[..])
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

/// A container used to read a message.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
}

impl<S> std::fmt::Debug for Reader<S>
where
    S: ReaderSegments,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").finish_non_exhaustive()
    }
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            arena: ReaderArenaImpl::new(segments, options),
        }
    }

    fn get_root_internal(&self) -> Result<any_pointer::Reader<'_>> {
        let arena: &dyn ReaderArena = &self.arena;
        match arena.get_segment(0) {
            Ok(segment) if segment.len() >= BYTES_PER_WORD => {
                let pointer_reader =
                    PointerReader::get_root(arena, 0, 0, self.arena.nesting_limit())?;
                Ok(any_pointer::Reader::new(pointer_reader))
            }
            // An empty message reads as a default-valued root.
            _ => Ok(any_pointer::Reader::new(PointerReader::new_default())),
        }
    }

    /// Gets the root of the message, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        self.get_root_internal()?.get_as()
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }

    /// Checks whether the message is in canonical form: a single segment
    /// holding exactly the canonical encoding of the root value.
    pub fn is_canonical(&self) -> Result<bool> {
        let arena: &dyn ReaderArena = &self.arena;
        let segment0 = arena.get_segment(0)?;
        if self.arena.segments().len() != 1 {
            return Ok(false);
        }
        let canonical = self.canonicalize()?;
        Ok(canonical == segment0)
    }

    /// Produces the canonical single-segment form of this message: structs
    /// truncated to the minimum sizes representing their non-default fields,
    /// inline-composite lists tightened, no far pointers.
    pub fn canonicalize(&self) -> Result<Vec<u8>> {
        let root = self.get_root_internal()?;
        let size = root.target_size()?.word_count + 1;
        let mut message = Builder::new(
            HeapAllocator::new()
                .first_segment_words(size as u32)
                .allocation_strategy(AllocationStrategy::FixedSize),
        );
        message.set_root_canonical(root)?;
        let mut segments = message.get_segments_for_output().into_vec();
        if segments.len() != 1 {
            return Err(Error::failed(
                "canonical form unexpectedly spilled into a second segment".into(),
            ));
        }
        Ok(segments.remove(0))
    }

    pub fn into_typed<T: Owned>(self) -> TypedReader<S, T> {
        TypedReader::new(self)
    }
}

/// A message reader whose root is known to be of type `T`.
pub struct TypedReader<S, T>
where
    S: ReaderSegments,
    T: Owned,
{
    marker: ::core::marker::PhantomData<T>,
    message: Reader<S>,
}

impl<S, T> TypedReader<S, T>
where
    S: ReaderSegments,
    T: Owned,
{
    pub fn new(message: Reader<S>) -> Self {
        Self {
            marker: ::core::marker::PhantomData,
            message,
        }
    }

    pub fn get(&self) -> Result<T::Reader<'_>> {
        self.message.get_root()
    }

    pub fn into_inner(self) -> Reader<S> {
        self.message
    }
}

impl<S, T> From<Reader<S>> for TypedReader<S, T>
where
    S: ReaderSegments,
    T: Owned,
{
    fn from(message: Reader<S>) -> Self {
        Self::new(message)
    }
}

/// An object that allocates memory for a Cap'n Proto message as it is being
/// built.
///
/// Returned buffers must be zeroed, 8-byte-word-sized, and at least
/// `minimum_size` words long. Implementations commonly allocate more than
/// the minimum to reduce the total number of segments. Allocation failure is
/// reported as an error rather than aborting, and must leave the allocator
/// reusable.
pub trait Allocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>>;
}

/// A container used to build a message.
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    fn get_root_internal(&mut self) -> Result<any_pointer::Builder<'_>> {
        if self.arena.is_empty() {
            self.arena.allocate_segment(1)?;
            self.arena
                .allocate(0, 1)
                .expect("fresh first segment has room for the root pointer");
        }
        let arena: &dyn BuilderArena = &self.arena;
        Ok(any_pointer::Builder::new(PointerBuilder::get_root(
            arena, 0, 0,
        )))
    }

    /// Initializes the root as a value of the given type.
    pub fn init_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        let root = self.get_root_internal()?;
        root.init_as()
    }

    /// Gets the root, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        let root = self.get_root_internal()?;
        root.get_as()
    }

    /// Sets the root to a deep copy of the given value.
    pub fn set_root<From: SetPointerBuilder>(&mut self, value: From) -> Result<()> {
        let root = self.get_root_internal()?;
        From::set_pointer_builder(root.builder(), value, false)
    }

    /// Sets the root to a canonicalized copy of `value`. If this was the
    /// first action taken on this builder, a subsequent call to
    /// `get_segments_for_output()` returns a single segment containing the
    /// full canonical message.
    pub fn set_root_canonical<From: SetPointerBuilder>(&mut self, value: From) -> Result<()> {
        let root = self.get_root_internal()?;
        From::set_pointer_builder(root.builder(), value, true)
    }

    /// The serialized form of the message: each segment's allocated prefix,
    /// copied out in order.
    pub fn get_segments_for_output(&self) -> OutputSegments {
        OutputSegments {
            segments: self.arena.get_segments_for_output(),
        }
    }

    pub fn into_reader(self) -> Reader<Segments> {
        Reader::new(
            Segments::new(self.arena.into_segments()),
            ReaderOptions {
                traversal_limit_in_words: None,
                nesting_limit: i32::MAX,
            },
        )
    }

    pub fn into_typed<T: Owned>(self) -> TypedBuilder<T, A> {
        TypedBuilder::new(self)
    }

    /// Retrieves the underlying allocator, discarding the built message.
    pub fn into_allocator(self) -> A {
        self.arena.into_allocator()
    }

    pub fn segment_count(&self) -> usize {
        self.arena.get_segments_for_output().len()
    }
}

impl Builder<HeapAllocator> {
    /// Constructs a new builder whose first segment has length
    /// `SUGGESTED_FIRST_SEGMENT_WORDS`.
    pub fn new_default() -> Self {
        Self::new(HeapAllocator::new())
    }
}

/// Helper struct returned by `Builder::get_segments_for_output()`.
pub struct OutputSegments {
    segments: Vec<Vec<u8>>,
}

impl OutputSegments {
    pub fn into_vec(self) -> Vec<Vec<u8>> {
        self.segments
    }
}

impl ::core::ops::Deref for OutputSegments {
    type Target = [Vec<u8>];
    fn deref(&self) -> &[Vec<u8>] {
        &self.segments
    }
}

/// Strongly typed variant of [Builder].
pub struct TypedBuilder<T, A = HeapAllocator>
where
    T: Owned,
    A: Allocator,
{
    marker: ::core::marker::PhantomData<T>,
    message: Builder<A>,
}

impl<T> TypedBuilder<T, HeapAllocator>
where
    T: Owned,
{
    pub fn new_default() -> Self {
        Self::new(Builder::new_default())
    }
}

impl<T, A> TypedBuilder<T, A>
where
    T: Owned,
    A: Allocator,
{
    pub fn new(message: Builder<A>) -> Self {
        Self {
            marker: ::core::marker::PhantomData,
            message,
        }
    }

    pub fn init_root(&mut self) -> Result<T::Builder<'_>> {
        self.message.init_root()
    }

    pub fn get_root(&mut self) -> Result<T::Builder<'_>> {
        self.message.get_root()
    }

    pub fn into_inner(self) -> Builder<A> {
        self.message
    }

    pub fn borrow_inner(&self) -> &Builder<A> {
        &self.message
    }

    pub fn borrow_inner_mut(&mut self) -> &mut Builder<A> {
        &mut self.message
    }
}

/// Standard segment allocator.
#[derive(Debug)]
pub struct HeapAllocator {
    /// Minimum number of words in the next allocation.
    next_size: u32,

    /// How to update next_size after an allocation.
    allocation_strategy: AllocationStrategy,

    /// Maximum number of words to allocate.
    max_segment_words: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum AllocationStrategy {
    /// Allocates the same number of words for each segment, to the extent
    /// possible. Primarily useful for testing cross-segment pointers.
    FixedSize,

    /// Increases segment size by a multiplicative factor for each subsequent
    /// segment.
    GrowHeuristically,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

impl Default for HeapAllocator {
    fn default() -> Self {
        Self {
            next_size: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: 1 << 29,
        }
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> Self {
        assert!(value <= self.max_segment_words);
        self.next_size = value.max(1);
        self
    }

    /// Sets the allocation strategy for segments after the first one.
    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> Self {
        self.allocation_strategy = value;
        self
    }

    /// Sets the maximum number of words allowed in a single allocation.
    pub fn max_segment_words(mut self, value: u32) -> Self {
        assert!(self.next_size <= value);
        self.max_segment_words = value;
        self
    }
}

impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>> {
        let size = ::core::cmp::max(minimum_size, self.next_size);
        let byte_len = size as usize * BYTES_PER_WORD;
        let mut data = Vec::new();
        data.try_reserve_exact(byte_len).map_err(|_| Error {
            kind: ErrorKind::AllocationFailed,
            extra: format!("could not allocate a {size}-word segment"),
        })?;
        data.resize(byte_len, 0);
        match self.allocation_strategy {
            AllocationStrategy::GrowHeuristically => {
                if size < self.max_segment_words - self.next_size {
                    self.next_size += size;
                } else {
                    self.next_size = self.max_segment_words;
                }
            }
            AllocationStrategy::FixedSize => {}
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::private::layout::{ElementSize, StructSize};

    /// Fails after a configurable number of successful allocations.
    struct FailingAllocator {
        inner: HeapAllocator,
        successes_remaining: u32,
    }

    impl Allocator for FailingAllocator {
        fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>> {
            if self.successes_remaining == 0 {
                return Err(Error::from_kind(ErrorKind::AllocationFailed));
            }
            self.successes_remaining -= 1;
            self.inner.allocate_segment(minimum_size)
        }
    }

    #[test]
    fn build_and_read_root_struct() {
        let mut message = Builder::new_default();
        {
            let root = message.get_root_internal().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 2,
                    pointers: 1,
                })
                .unwrap();
            st.set_u32(0, 0x0badcafe);
            st.set_u16(3, 7);
            st.set_bool_field(65, true);
            st.get_pointer_field(0).set_text("hello world").unwrap();
        }
        let reader = message.into_reader();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u32(0), 0x0badcafe);
        assert_eq!(st.get_u16(3), 7);
        assert!(st.get_bool_field(65));
        assert!(!st.get_bool_field(64));
        assert_eq!(st.get_pointer_field(0).get_text().unwrap(), "hello world");
    }

    #[test]
    fn small_first_segment_forces_far_pointers() {
        // A one-word first segment can hold only the root pointer, so all
        // content lands behind far pointers, and reading should be
        // indistinguishable from the single-segment case.
        let mut message = Builder::new(
            HeapAllocator::new()
                .first_segment_words(1)
                .allocation_strategy(AllocationStrategy::FixedSize),
        );
        {
            let root = message.get_root_internal().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 1,
                })
                .unwrap();
            st.set_u64(0, 0x5eed);
            st.get_pointer_field(0).set_text("across segments").unwrap();
        }
        assert!(message.segment_count() > 1);
        let reader = message.into_reader();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 0x5eed);
        assert_eq!(
            st.get_pointer_field(0).get_text().unwrap(),
            "across segments"
        );
    }

    #[test]
    fn canonicalize_multi_segment_to_single() {
        let mut message = Builder::new(
            HeapAllocator::new()
                .first_segment_words(1)
                .allocation_strategy(AllocationStrategy::FixedSize),
        );
        {
            let root = message.get_root_internal().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 2,
                    pointers: 1,
                })
                .unwrap();
            st.set_u8(0, 3);
            st.get_pointer_field(0).set_text("abc").unwrap();
        }
        let reader = message.into_reader();
        let canonical = reader.canonicalize().unwrap();

        // Canonical form: root pointer, one data word (trimmed from two),
        // one pointer word, one word of text.
        assert_eq!(canonical.len(), 4 * 8);

        // Idempotence.
        let segments = [&canonical[..]];
        let reader2 = Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
        assert_eq!(reader2.canonicalize().unwrap(), canonical);
        assert!(reader2.is_canonical().unwrap());
    }

    #[test]
    fn canonical_trims_default_struct_suffix() {
        let mut message = Builder::new_default();
        {
            let root = message.get_root_internal().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 4,
                    pointers: 2,
                })
                .unwrap();
            st.set_u16(0, 10); // only the first data word is nonzero
        }
        let reader = message.into_reader();
        let canonical = reader.canonicalize().unwrap();
        // Root pointer plus a single data word; pointer section trimmed away.
        assert_eq!(canonical.len(), 2 * 8);
    }

    #[test]
    fn allocation_failure_leaves_no_partial_state() {
        let mut message = Builder::new(FailingAllocator {
            inner: HeapAllocator::new()
                .first_segment_words(1)
                .allocation_strategy(AllocationStrategy::FixedSize),
            successes_remaining: 1,
        });
        {
            let root = message.get_root_internal().unwrap();
            // First segment is full after the root pointer; this needs a new
            // segment, and the allocator refuses.
            let err = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 0,
                })
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::AllocationFailed);
        }
        // The failed operation must not have published a partial segment.
        assert_eq!(message.segment_count(), 1);
        let reader = message.into_reader();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        assert!(root.is_null());
    }

    #[test]
    fn typed_round_trip_via_any_pointer() {
        let mut message = Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root().unwrap();
            let list = root.init_list(ElementSize::FourBytes, 3).unwrap();
            list.set_u32_element(0, 1);
            list.set_u32_element(1, 10);
            list.set_u32_element(2, 100);
        }
        let reader = message.into_reader();
        let root: crate::any_pointer::Reader = reader.get_root().unwrap();
        let list = root.get_list(ElementSize::FourBytes).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get_u32_element(2), 100);
    }

    #[test]
    fn set_root_deep_copies_between_messages() {
        let mut first = Builder::new_default();
        {
            let root = first.get_root_internal().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 1,
                })
                .unwrap();
            st.set_u64(0, 42);
            st.get_pointer_field(0).set_data(&[9, 8, 7]).unwrap();
        }
        let first = first.into_reader();
        let root: crate::any_pointer::Reader = first.get_root().unwrap();

        let mut second = Builder::new_default();
        second.set_root(root).unwrap();
        let second = second.into_reader();
        let copied: crate::any_pointer::Reader = second.get_root().unwrap();
        let st = copied.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 42);
        assert_eq!(st.get_pointer_field(0).get_data().unwrap(), &[9, 8, 7]);
    }
}
