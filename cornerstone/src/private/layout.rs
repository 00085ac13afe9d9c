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

//! The pointer codec: encoding and decoding of 64-bit struct, list, far, and
//! capability pointers, and the untyped struct/list readers and builders that
//! the typed API and generated code are built on.
//!
//! Locations are (segment id, word offset) pairs; all segment access is
//! bounds-checked slice arithmetic.

use crate::private::arena::{BuilderArena, ReaderArena, NULL_ARENA};
use crate::private::mask::Mask;
use crate::private::units::*;
use crate::{Error, ErrorKind, MessageSize, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePointerKind {
    Struct = 0,
    List = 1,
    Far = 2,
    Other = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    pub fn from_code(code: u8) -> Self {
        match code & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }

    /// Data bits per element. Zero for `Pointer` and `InlineComposite`.
    pub fn data_bits_per_element(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bit => 1,
            Self::Byte => 8,
            Self::TwoBytes => 16,
            Self::FourBytes => 32,
            Self::EightBytes => 64,
            Self::Pointer | Self::InlineComposite => 0,
        }
    }

    pub fn pointers_per_element(self) -> u32 {
        match self {
            Self::Pointer => 1,
            _ => 0,
        }
    }
}

/// The size of a struct: data words plus pointer words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub fn total(self) -> u32 {
        self.data as u32 + self.pointers as u32
    }
}

/// One encoded pointer word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WirePointer {
    raw: u64,
}

impl WirePointer {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub fn raw(self) -> u64 {
        self.raw
    }

    pub fn is_null(self) -> bool {
        self.raw == 0
    }

    pub fn kind(self) -> WirePointerKind {
        match self.raw & 3 {
            0 => WirePointerKind::Struct,
            1 => WirePointerKind::List,
            2 => WirePointerKind::Far,
            _ => WirePointerKind::Other,
        }
    }

    /// The signed 30-bit word offset, relative to the word after the pointer.
    pub fn offset(self) -> i32 {
        (self.raw as u32 as i32) >> 2
    }

    pub fn struct_data_size(self) -> u16 {
        (self.raw >> 32) as u16
    }

    pub fn struct_pointer_count(self) -> u16 {
        (self.raw >> 48) as u16
    }

    pub fn list_element_size(self) -> ElementSize {
        ElementSize::from_code((self.raw >> 32) as u8)
    }

    /// Element count, or total word count for inline composite lists.
    pub fn list_element_count(self) -> u32 {
        ((self.raw >> 35) as u32) & 0x1fff_ffff
    }

    pub fn is_double_far(self) -> bool {
        self.raw & 4 != 0
    }

    /// Word offset of the landing pad within the target segment.
    pub fn far_offset(self) -> u32 {
        ((self.raw >> 3) as u32) & 0x1fff_ffff
    }

    pub fn far_segment(self) -> u32 {
        (self.raw >> 32) as u32
    }

    pub fn cap_index(self) -> u32 {
        (self.raw >> 32) as u32
    }

    pub fn new_struct(offset: i32, size: StructSize) -> Self {
        let lower = ((offset as u32) << 2) as u64;
        Self {
            raw: lower | ((size.data as u64) << 32) | ((size.pointers as u64) << 48),
        }
    }

    pub fn new_list(offset: i32, element_size: ElementSize, element_count: u32) -> Self {
        let lower = (((offset as u32) << 2) | 1) as u64;
        Self {
            raw: lower | ((element_size as u64) << 32) | ((element_count as u64) << 35),
        }
    }

    pub fn new_far(double: bool, pad_offset: u32, segment_id: u32) -> Self {
        let mut lower = 2u64 | ((pad_offset as u64) << 3);
        if double {
            lower |= 4;
        }
        Self {
            raw: lower | ((segment_id as u64) << 32),
        }
    }

    pub fn new_capability(index: u32) -> Self {
        Self {
            raw: 3 | ((index as u64) << 32),
        }
    }
}

fn out_of_bounds() -> Error {
    Error::from_kind(ErrorKind::PointerOutOfBounds)
}

fn segment_word_len(segment: &[u8]) -> u32 {
    (segment.len() / BYTES_PER_WORD) as u32
}

fn read_raw_word(arena: &dyn ReaderArena, segment_id: u32, offset: u32) -> Result<u64> {
    let segment = arena.get_segment(segment_id)?;
    let start = offset as usize * BYTES_PER_WORD;
    match segment.get(start..start + BYTES_PER_WORD) {
        Some(bytes) => Ok(u64::from_le_bytes(bytes.try_into().expect("word slice"))),
        None => Err(out_of_bounds()),
    }
}

/// A pointer plus the location of the content it describes, after any far
/// indirection has been followed.
struct ResolvedPointer {
    tag: WirePointer,
    segment_id: u32,
    /// Word offset of the first content word.
    content: u32,
}

/// Computes a content location from a near pointer's own location and signed
/// offset, bounds-checking only for negative underflow; the caller checks the
/// upper bound against the content size.
fn near_content(ptr_offset: u32, offset: i32) -> Result<u32> {
    let content = ptr_offset as i64 + 1 + offset as i64;
    if !(0..=u32::MAX as i64).contains(&content) {
        return Err(out_of_bounds());
    }
    Ok(content as u32)
}

fn follow_fars(
    arena: &dyn ReaderArena,
    ptr: WirePointer,
    segment_id: u32,
    ptr_offset: u32,
) -> Result<ResolvedPointer> {
    if ptr.kind() != WirePointerKind::Far {
        return Ok(ResolvedPointer {
            tag: ptr,
            segment_id,
            content: near_content(ptr_offset, ptr.offset())?,
        });
    }

    let far_segment = ptr.far_segment();
    let pad_offset = ptr.far_offset();
    let segment = arena.get_segment(far_segment)?;
    let word_len = segment_word_len(segment);

    if !ptr.is_double_far() {
        // One-word landing pad holding a near pointer to the content.
        if pad_offset >= word_len {
            return Err(out_of_bounds());
        }
        let pad = WirePointer::from_raw(read_raw_word(arena, far_segment, pad_offset)?);
        if pad.kind() == WirePointerKind::Far {
            return Err(out_of_bounds());
        }
        Ok(ResolvedPointer {
            tag: pad,
            segment_id: far_segment,
            content: near_content(pad_offset, pad.offset())?,
        })
    } else {
        // Two-word landing pad: a far pointer naming the content location,
        // then a tag word whose offset field is unused.
        if pad_offset.checked_add(2).is_none() || pad_offset + 2 > word_len {
            return Err(out_of_bounds());
        }
        let pad = WirePointer::from_raw(read_raw_word(arena, far_segment, pad_offset)?);
        let tag = WirePointer::from_raw(read_raw_word(arena, far_segment, pad_offset + 1)?);
        if pad.kind() != WirePointerKind::Far || pad.is_double_far() {
            return Err(out_of_bounds());
        }
        arena.get_segment(pad.far_segment())?;
        Ok(ResolvedPointer {
            tag,
            segment_id: pad.far_segment(),
            content: pad.far_offset(),
        })
    }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    /// Word offset of the pointer word itself.
    offset: u32,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    /// A reader of a permanently-null pointer, used for absent fields.
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            offset: 0,
            nesting_limit: i32::MAX,
        }
    }

    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: u32,
        offset: u32,
        nesting_limit: i32,
    ) -> Result<Self> {
        // Validates that the root word exists.
        read_raw_word(arena, segment_id, offset)?;
        Ok(Self {
            arena,
            segment_id,
            offset,
            nesting_limit,
        })
    }

    fn load(&self) -> Result<WirePointer> {
        Ok(WirePointer::from_raw(read_raw_word(
            self.arena,
            self.segment_id,
            self.offset,
        )?))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.load(), Ok(w) if w.is_null())
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        read_struct_pointer(self.arena, self.segment_id, self.offset, self.nesting_limit)
    }

    pub fn get_list(&self, expected_element_size: ElementSize) -> Result<ListReader<'a>> {
        read_list_pointer(
            self.arena,
            self.segment_id,
            self.offset,
            expected_element_size,
            self.nesting_limit,
        )
    }

    pub fn get_text(&self) -> Result<&'a str> {
        let bytes = read_blob_pointer(self.arena, self.segment_id, self.offset)?;
        if bytes.is_empty() {
            // Null pointer: default empty text.
            return Ok("");
        }
        match bytes.split_last() {
            Some((&0, contents)) => ::core::str::from_utf8(contents)
                .map_err(|_| Error::failed("Text blob is not valid UTF-8.".into())),
            _ => Err(Error::failed(
                "Message contains text that is not NUL-terminated.".into(),
            )),
        }
    }

    pub fn get_data(&self) -> Result<&'a [u8]> {
        read_blob_pointer(self.arena, self.segment_id, self.offset)
    }

    pub fn get_capability(&self) -> Result<u32> {
        let ptr = self.load()?;
        if ptr.is_null() {
            return Err(Error::failed(
                "Message contains null capability pointer.".into(),
            ));
        }
        let resolved = follow_fars(self.arena, ptr, self.segment_id, self.offset)?;
        if resolved.tag.kind() != WirePointerKind::Other {
            return Err(Error::failed(
                "Message contains non-capability pointer where capability pointer was expected."
                    .into(),
            ));
        }
        Ok(resolved.tag.cap_index())
    }

    /// Counts the words and capabilities reachable from this pointer.
    pub fn total_size(&self) -> Result<MessageSize> {
        let mut size = MessageSize {
            word_count: 0,
            cap_count: 0,
        };
        accumulate_size(self, &mut size)?;
        Ok(size)
    }
}

fn read_struct_pointer<'a>(
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    ptr_offset: u32,
    nesting_limit: i32,
) -> Result<StructReader<'a>> {
    if nesting_limit <= 0 {
        return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
    }
    let ptr = WirePointer::from_raw(read_raw_word(arena, segment_id, ptr_offset)?);
    if ptr.is_null() {
        return Ok(StructReader::new_default());
    }
    let resolved = follow_fars(arena, ptr, segment_id, ptr_offset)?;
    if resolved.tag.kind() != WirePointerKind::Struct {
        return Err(Error::failed(
            "Message contains non-struct pointer where struct pointer was expected.".into(),
        ));
    }
    let data_words = resolved.tag.struct_data_size() as u32;
    let pointer_words = resolved.tag.struct_pointer_count() as u32;
    let segment = arena.get_segment(resolved.segment_id)?;
    let end = resolved.content as u64 + data_words as u64 + pointer_words as u64;
    if end > segment_word_len(segment) as u64 {
        return Err(out_of_bounds());
    }
    arena.amplified_read((data_words + pointer_words) as u64)?;
    Ok(StructReader {
        arena,
        segment_id: resolved.segment_id,
        data_start: resolved.content as u64 * BYTES_PER_WORD as u64,
        pointers_start: resolved.content + data_words,
        data_size_bits: data_words * BITS_PER_WORD,
        pointer_count: pointer_words as u16,
        nesting_limit: nesting_limit - 1,
    })
}

fn read_list_pointer<'a>(
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    ptr_offset: u32,
    expected_element_size: ElementSize,
    nesting_limit: i32,
) -> Result<ListReader<'a>> {
    if nesting_limit <= 0 {
        return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
    }
    let ptr = WirePointer::from_raw(read_raw_word(arena, segment_id, ptr_offset)?);
    if ptr.is_null() {
        return Ok(ListReader::new_default());
    }
    let resolved = follow_fars(arena, ptr, segment_id, ptr_offset)?;
    if resolved.tag.kind() != WirePointerKind::List {
        return Err(Error::failed(
            "Message contains non-list pointer where list pointer was expected.".into(),
        ));
    }
    let segment = arena.get_segment(resolved.segment_id)?;
    let word_len = segment_word_len(segment);

    let element_size = resolved.tag.list_element_size();
    let reader = match element_size {
        ElementSize::InlineComposite => {
            let word_count = resolved.tag.list_element_count();
            let end = resolved.content as u64 + 1 + word_count as u64;
            if end > word_len as u64 {
                return Err(out_of_bounds());
            }
            arena.amplified_read(word_count as u64 + 1)?;
            let tag =
                WirePointer::from_raw(read_raw_word(arena, resolved.segment_id, resolved.content)?);
            if tag.kind() != WirePointerKind::Struct {
                return Err(Error::failed(
                    "InlineComposite list's tag word is not a struct pointer.".into(),
                ));
            }
            let element_count = tag.offset() as u32;
            let data_words = tag.struct_data_size() as u32;
            let pointer_words = tag.struct_pointer_count() as u32;
            let words_per_element = data_words + pointer_words;
            if element_count as u64 * words_per_element as u64 > word_count as u64 {
                return Err(Error::failed(
                    "InlineComposite list's elements overrun its word count.".into(),
                ));
            }
            ListReader {
                arena,
                segment_id: resolved.segment_id,
                first_word: resolved.content + 1,
                element_count,
                step_bits: words_per_element as u64 * BITS_PER_WORD as u64,
                struct_data_bits: data_words * BITS_PER_WORD,
                struct_pointer_count: pointer_words as u16,
                element_size,
                nesting_limit: nesting_limit - 1,
            }
        }
        _ => {
            let element_count = resolved.tag.list_element_count();
            let data_bits = element_size.data_bits_per_element();
            let pointer_count = element_size.pointers_per_element();
            let step_bits = (data_bits + pointer_count * BITS_PER_WORD) as u64;
            let word_count = round_bits_up_to_words(element_count as u64 * step_bits);
            let end = resolved.content as u64 + word_count;
            if end > word_len as u64 {
                return Err(out_of_bounds());
            }
            arena.amplified_read(word_count)?;
            if element_size == ElementSize::Void {
                // Zero-sized elements still cost traversal, to prevent
                // amplification through giant void lists.
                arena.amplified_read(element_count as u64)?;
            }
            ListReader {
                arena,
                segment_id: resolved.segment_id,
                first_word: resolved.content,
                element_count,
                step_bits,
                struct_data_bits: data_bits,
                struct_pointer_count: pointer_count as u16,
                element_size,
                nesting_limit: nesting_limit - 1,
            }
        }
    };

    check_expected_element_size(&reader, expected_element_size)?;
    Ok(reader)
}

fn check_expected_element_size(reader: &ListReader, expected: ElementSize) -> Result<()> {
    match expected {
        ElementSize::Void => Ok(()),
        ElementSize::Bit => {
            if reader.element_size == ElementSize::Bit {
                Ok(())
            } else {
                Err(Error::from_kind(ErrorKind::InvalidListElementSize))
            }
        }
        ElementSize::Byte
        | ElementSize::TwoBytes
        | ElementSize::FourBytes
        | ElementSize::EightBytes => {
            if reader.element_size == ElementSize::Bit {
                return Err(Error::from_kind(ErrorKind::InvalidListElementSize));
            }
            if expected.data_bits_per_element() <= reader.struct_data_bits {
                Ok(())
            } else {
                Err(Error::from_kind(ErrorKind::InvalidListElementSize))
            }
        }
        ElementSize::Pointer => {
            if reader.struct_pointer_count >= 1 {
                Ok(())
            } else {
                Err(Error::from_kind(ErrorKind::InvalidListElementSize))
            }
        }
        ElementSize::InlineComposite => {
            if reader.element_size == ElementSize::Bit {
                Err(Error::from_kind(ErrorKind::InvalidListElementSize))
            } else {
                Ok(())
            }
        }
    }
}

fn read_blob_pointer<'a>(
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    ptr_offset: u32,
) -> Result<&'a [u8]> {
    let ptr = WirePointer::from_raw(read_raw_word(arena, segment_id, ptr_offset)?);
    if ptr.is_null() {
        return Ok(&[]);
    }
    let resolved = follow_fars(arena, ptr, segment_id, ptr_offset)?;
    if resolved.tag.kind() != WirePointerKind::List
        || resolved.tag.list_element_size() != ElementSize::Byte
    {
        return Err(Error::failed(
            "Message contains non-blob pointer where text or data was expected.".into(),
        ));
    }
    let count = resolved.tag.list_element_count();
    let segment = arena.get_segment(resolved.segment_id)?;
    let start = resolved.content as u64 * BYTES_PER_WORD as u64;
    let end = start + count as u64;
    if end > segment.len() as u64 {
        return Err(out_of_bounds());
    }
    arena.amplified_read(round_bytes_up_to_words(count as u64))?;
    Ok(&segment[start as usize..end as usize])
}

#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    /// Byte offset of the data section within the segment.
    data_start: u64,
    /// Word offset of the pointer section within the segment.
    pointers_start: u32,
    data_size_bits: u32,
    pointer_count: u16,
    nesting_limit: i32,
}

impl<'a> std::fmt::Debug for StructReader<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructReader")
            .field("segment_id", &self.segment_id)
            .field("data_start", &self.data_start)
            .field("pointers_start", &self.pointers_start)
            .field("data_size_bits", &self.data_size_bits)
            .field("pointer_count", &self.pointer_count)
            .field("nesting_limit", &self.nesting_limit)
            .finish()
    }
}

macro_rules! reader_primitive {
    ($get:ident, $get_mask:ident, $ty:ty, $bits:expr) => {
        /// Reads the field at `offset` (in units of the type's width).
        /// Out-of-bounds reads return zero, which is how fields added by a
        /// newer schema version read against older data.
        pub fn $get(&self, offset: u32) -> $ty {
            if (offset as u64 + 1) * $bits > self.data_size_bits as u64 {
                return Default::default();
            }
            let start = self.data_start + offset as u64 * ($bits / 8);
            let mut bytes = [0u8; ($bits / 8) as usize];
            let len = bytes.len();
            let segment = self
                .arena
                .get_segment(self.segment_id)
                .expect("struct bounds were validated on read");
            bytes.copy_from_slice(&segment[start as usize..start as usize + len]);
            <$ty>::from_le_bytes(bytes)
        }

        pub fn $get_mask(&self, offset: u32, mask: <$ty as Mask>::T) -> $ty {
            Mask::mask(self.$get(offset), mask)
        }
    };
}

impl<'a> StructReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            data_start: 0,
            pointers_start: 0,
            data_size_bits: 0,
            pointer_count: 0,
            nesting_limit: i32::MAX,
        }
    }

    pub fn data_size_bits(&self) -> u32 {
        self.data_size_bits
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }

    reader_primitive!(get_u8, get_u8_mask, u8, 8);
    reader_primitive!(get_u16, get_u16_mask, u16, 16);
    reader_primitive!(get_u32, get_u32_mask, u32, 32);
    reader_primitive!(get_u64, get_u64_mask, u64, 64);
    reader_primitive!(get_i8, get_i8_mask, i8, 8);
    reader_primitive!(get_i16, get_i16_mask, i16, 16);
    reader_primitive!(get_i32, get_i32_mask, i32, 32);
    reader_primitive!(get_i64, get_i64_mask, i64, 64);

    pub fn get_f32(&self, offset: u32) -> f32 {
        f32::from_bits(self.get_u32(offset))
    }

    pub fn get_f32_mask(&self, offset: u32, mask: u32) -> f32 {
        Mask::mask(self.get_f32(offset), mask)
    }

    pub fn get_f64(&self, offset: u32) -> f64 {
        f64::from_bits(self.get_u64(offset))
    }

    pub fn get_f64_mask(&self, offset: u32, mask: u64) -> f64 {
        Mask::mask(self.get_f64(offset), mask)
    }

    pub fn get_bool_field(&self, offset_bits: u32) -> bool {
        if offset_bits >= self.data_size_bits {
            return false;
        }
        let byte_index = self.data_start + offset_bits as u64 / 8;
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("struct bounds were validated on read");
        segment[byte_index as usize] & (1 << (offset_bits % 8)) != 0
    }

    pub fn get_bool_field_mask(&self, offset_bits: u32, mask: bool) -> bool {
        self.get_bool_field(offset_bits) ^ mask
    }

    /// Copies out the data section.
    pub fn data_bytes(&self) -> Vec<u8> {
        let len = round_bits_up_to_bytes(self.data_size_bits as u64) as usize;
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("struct bounds were validated on read");
        segment[self.data_start as usize..self.data_start as usize + len].to_vec()
    }

    pub fn get_pointer_field(&self, index: u16) -> PointerReader<'a> {
        if index < self.pointer_count {
            PointerReader {
                arena: self.arena,
                segment_id: self.segment_id,
                offset: self.pointers_start + index as u32,
                nesting_limit: self.nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }

    pub fn total_size(&self) -> Result<MessageSize> {
        let mut size = MessageSize {
            word_count: round_bits_up_to_words(self.data_size_bits as u64)
                + self.pointer_count as u64,
            cap_count: 0,
        };
        for i in 0..self.pointer_count {
            accumulate_size(&self.get_pointer_field(i), &mut size)?;
        }
        Ok(size)
    }
}

#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: u32,
    /// Word offset of the first element (past the tag word for inline
    /// composites).
    first_word: u32,
    element_count: u32,
    step_bits: u64,
    struct_data_bits: u32,
    struct_pointer_count: u16,
    element_size: ElementSize,
    nesting_limit: i32,
}

impl<'a> std::fmt::Debug for ListReader<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListReader")
            .field("segment_id", &self.segment_id)
            .field("first_word", &self.first_word)
            .field("element_count", &self.element_count)
            .field("step_bits", &self.step_bits)
            .field("struct_data_bits", &self.struct_data_bits)
            .field("struct_pointer_count", &self.struct_pointer_count)
            .field("element_size", &self.element_size)
            .field("nesting_limit", &self.nesting_limit)
            .finish()
    }
}

macro_rules! list_reader_primitive {
    ($get:ident, $ty:ty, $bits:expr) => {
        pub fn $get(&self, index: u32) -> $ty {
            debug_assert!(index < self.element_count);
            let bit = self.first_word as u64 * BITS_PER_WORD as u64
                + index as u64 * self.step_bits;
            if self.struct_data_bits < $bits {
                return Default::default();
            }
            let start = (bit / 8) as usize;
            let mut bytes = [0u8; ($bits / 8) as usize];
            let len = bytes.len();
            let segment = self
                .arena
                .get_segment(self.segment_id)
                .expect("list bounds were validated on read");
            bytes.copy_from_slice(&segment[start..start + len]);
            <$ty>::from_le_bytes(bytes)
        }
    };
}

impl<'a> ListReader<'a> {
    pub fn new_default() -> Self {
        Self {
            arena: &NULL_ARENA,
            segment_id: 0,
            first_word: 0,
            element_count: 0,
            step_bits: 0,
            struct_data_bits: 0,
            struct_pointer_count: 0,
            element_size: ElementSize::Void,
            nesting_limit: i32::MAX,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    list_reader_primitive!(get_u8_element, u8, 8);
    list_reader_primitive!(get_u16_element, u16, 16);
    list_reader_primitive!(get_u32_element, u32, 32);
    list_reader_primitive!(get_u64_element, u64, 64);
    list_reader_primitive!(get_i8_element, i8, 8);
    list_reader_primitive!(get_i16_element, i16, 16);
    list_reader_primitive!(get_i32_element, i32, 32);
    list_reader_primitive!(get_i64_element, i64, 64);

    pub fn get_f32_element(&self, index: u32) -> f32 {
        f32::from_bits(self.get_u32_element(index))
    }

    pub fn get_f64_element(&self, index: u32) -> f64 {
        f64::from_bits(self.get_u64_element(index))
    }

    pub fn get_bool_element(&self, index: u32) -> bool {
        debug_assert!(index < self.element_count);
        if self.element_size != ElementSize::Bit {
            return false;
        }
        let bit = self.first_word as u64 * BITS_PER_WORD as u64 + index as u64;
        let segment = self
            .arena
            .get_segment(self.segment_id)
            .expect("list bounds were validated on read");
        segment[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    pub fn get_struct_element(&self, index: u32) -> StructReader<'a> {
        debug_assert!(index < self.element_count);
        let start_bit =
            self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
        let data_start = start_bit / 8;
        let pointers_start =
            ((start_bit + self.struct_data_bits as u64) / BITS_PER_WORD as u64) as u32;
        StructReader {
            arena: self.arena,
            segment_id: self.segment_id,
            data_start,
            pointers_start,
            data_size_bits: self.struct_data_bits,
            pointer_count: self.struct_pointer_count,
            nesting_limit: self.nesting_limit,
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerReader<'a> {
        debug_assert!(index < self.element_count);
        if self.struct_pointer_count == 0 {
            return PointerReader::new_default();
        }
        let start_bit =
            self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
        let first_pointer =
            ((start_bit + self.struct_data_bits as u64) / BITS_PER_WORD as u64) as u32;
        PointerReader {
            arena: self.arena,
            segment_id: self.segment_id,
            offset: first_pointer,
            nesting_limit: self.nesting_limit,
        }
    }

    fn words(&self) -> u64 {
        round_bits_up_to_words(self.element_count as u64 * self.step_bits)
    }
}

fn accumulate_size(ptr: &PointerReader, size: &mut MessageSize) -> Result<()> {
    let wire = match ptr.load() {
        Ok(w) => w,
        Err(_) => return Ok(()),
    };
    if wire.is_null() {
        return Ok(());
    }
    let resolved = follow_fars(ptr.arena, wire, ptr.segment_id, ptr.offset)?;
    match resolved.tag.kind() {
        WirePointerKind::Struct => {
            let st = ptr.get_struct()?;
            size.plus_eq(st.total_size()?);
        }
        WirePointerKind::List => match resolved.tag.list_element_size() {
            ElementSize::Pointer => {
                let list = ptr.get_list(ElementSize::Pointer)?;
                size.word_count += list.len() as u64;
                for i in 0..list.len() {
                    accumulate_size(&list.get_pointer_element(i), size)?;
                }
            }
            ElementSize::InlineComposite => {
                let list = ptr.get_list(ElementSize::InlineComposite)?;
                size.word_count += 1 + list.words();
                for i in 0..list.len() {
                    let element = list.get_struct_element(i);
                    for p in 0..element.pointer_count {
                        accumulate_size(&element.get_pointer_field(p), size)?;
                    }
                }
            }
            other => {
                let list = ptr.get_list(other)?;
                size.word_count += list.words();
            }
        },
        WirePointerKind::Other => {
            size.cap_count += 1;
        }
        WirePointerKind::Far => {
            return Err(out_of_bounds());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct PointerBuilder<'a> {
    arena: &'a dyn BuilderArena,
    segment_id: u32,
    /// Word offset of the pointer word itself.
    offset: u32,
}

/// Where newly allocated content landed, and where its describing near
/// pointer must be written (either the original pointer word, or a far
/// landing pad immediately preceding the content).
struct Allocation {
    segment_id: u32,
    content: u32,
    tag_segment: u32,
    tag_offset: u32,
}

fn allocate_content(
    arena: &dyn BuilderArena,
    ref_segment: u32,
    ref_offset: u32,
    amount: u32,
) -> Result<Allocation> {
    if let Some(content) = arena.allocate(ref_segment, amount) {
        return Ok(Allocation {
            segment_id: ref_segment,
            content,
            tag_segment: ref_segment,
            tag_offset: ref_offset,
        });
    }
    // No room in the pointer's own segment: place a one-word landing pad
    // directly before the content in whichever segment has space, and make
    // the original pointer a far pointer to the pad.
    let (segment_id, pad) = arena.allocate_anywhere(amount + 1)?;
    arena.write_word(
        ref_segment,
        ref_offset,
        WirePointer::new_far(false, pad, segment_id).raw(),
    );
    Ok(Allocation {
        segment_id,
        content: pad + 1,
        tag_segment: segment_id,
        tag_offset: pad,
    })
}

impl Allocation {
    fn near_offset(&self) -> i32 {
        self.content as i32 - (self.tag_offset as i32 + 1)
    }
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(arena: &'a dyn BuilderArena, segment_id: u32, offset: u32) -> Self {
        Self {
            arena,
            segment_id,
            offset,
        }
    }

    pub fn is_null(&self) -> bool {
        self.arena.read_word(self.segment_id, self.offset) == 0
    }

    pub fn set_null(&self) {
        self.arena.write_word(self.segment_id, self.offset, 0);
    }

    pub fn init_struct(&self, size: StructSize) -> Result<StructBuilder<'a>> {
        let amount = size.total();
        if amount == 0 {
            // Point one word back so the encoded pointer is non-null.
            self.arena.write_word(
                self.segment_id,
                self.offset,
                WirePointer::new_struct(-1, size).raw(),
            );
            return Ok(StructBuilder {
                arena: self.arena,
                segment_id: self.segment_id,
                data_start: self.offset as u64 * BYTES_PER_WORD as u64,
                pointers_start: self.offset,
                data_size_bits: 0,
                pointer_count: 0,
            });
        }
        let alloc = allocate_content(self.arena, self.segment_id, self.offset, amount)?;
        self.arena.write_word(
            alloc.tag_segment,
            alloc.tag_offset,
            WirePointer::new_struct(alloc.near_offset(), size).raw(),
        );
        Ok(StructBuilder {
            arena: self.arena,
            segment_id: alloc.segment_id,
            data_start: alloc.content as u64 * BYTES_PER_WORD as u64,
            pointers_start: alloc.content + size.data as u32,
            data_size_bits: size.data as u32 * BITS_PER_WORD,
            pointer_count: size.pointers,
        })
    }

    /// Returns the existing struct this pointer targets, or initializes one
    /// of the given size if the pointer is null. The existing struct must be
    /// at least as large as `size`.
    pub fn get_struct(&self, size: StructSize) -> Result<StructBuilder<'a>> {
        if self.is_null() {
            return self.init_struct(size);
        }
        let (tag, segment_id, content) = self.resolve_existing()?;
        if tag.kind() != WirePointerKind::Struct {
            return Err(Error::failed(
                "Existing pointer is not a struct pointer.".into(),
            ));
        }
        if tag.struct_data_size() < size.data || tag.struct_pointer_count() < size.pointers {
            return Err(Error::unimplemented(
                "In-place upgrade of an existing struct to a larger size is not supported.".into(),
            ));
        }
        let data_words = tag.struct_data_size() as u32;
        Ok(StructBuilder {
            arena: self.arena,
            segment_id,
            data_start: content as u64 * BYTES_PER_WORD as u64,
            pointers_start: content + data_words,
            data_size_bits: data_words * BITS_PER_WORD,
            pointer_count: tag.struct_pointer_count(),
        })
    }

    /// Initializes a list of primitives or pointers. Inline composite lists
    /// go through `init_struct_list`.
    pub fn init_list(&self, element_size: ElementSize, count: u32) -> Result<ListBuilder<'a>> {
        debug_assert!(element_size != ElementSize::InlineComposite);
        let data_bits = element_size.data_bits_per_element();
        let pointer_count = element_size.pointers_per_element();
        let step_bits = (data_bits + pointer_count * BITS_PER_WORD) as u64;
        let words = round_bits_up_to_words(count as u64 * step_bits) as u32;
        let alloc = allocate_content(self.arena, self.segment_id, self.offset, words)?;
        self.arena.write_word(
            alloc.tag_segment,
            alloc.tag_offset,
            WirePointer::new_list(alloc.near_offset(), element_size, count).raw(),
        );
        Ok(ListBuilder {
            arena: self.arena,
            segment_id: alloc.segment_id,
            first_word: alloc.content,
            element_count: count,
            step_bits,
            struct_data_bits: data_bits,
            struct_pointer_count: pointer_count as u16,
            element_size,
        })
    }

    pub fn init_struct_list(&self, count: u32, size: StructSize) -> Result<ListBuilder<'a>> {
        let words_per_element = size.total();
        let total_words = count
            .checked_mul(words_per_element)
            .ok_or_else(|| Error::failed("struct list size overflows".into()))?;
        let alloc = allocate_content(self.arena, self.segment_id, self.offset, total_words + 1)?;
        self.arena.write_word(
            alloc.tag_segment,
            alloc.tag_offset,
            WirePointer::new_list(
                alloc.near_offset(),
                ElementSize::InlineComposite,
                total_words,
            )
            .raw(),
        );
        // The tag word describes each element; its offset field holds the
        // element count.
        self.arena.write_word(
            alloc.segment_id,
            alloc.content,
            WirePointer::new_struct(count as i32, size).raw(),
        );
        Ok(ListBuilder {
            arena: self.arena,
            segment_id: alloc.segment_id,
            first_word: alloc.content + 1,
            element_count: count,
            step_bits: words_per_element as u64 * BITS_PER_WORD as u64,
            struct_data_bits: size.data as u32 * BITS_PER_WORD,
            struct_pointer_count: size.pointers,
            element_size: ElementSize::InlineComposite,
        })
    }

    pub fn set_text(&self, value: &str) -> Result<()> {
        self.set_blob(value.as_bytes(), true)
    }

    pub fn set_data(&self, value: &[u8]) -> Result<()> {
        self.set_blob(value, false)
    }

    fn set_blob(&self, bytes: &[u8], nul_terminated: bool) -> Result<()> {
        let len = bytes.len() as u64 + if nul_terminated { 1 } else { 0 };
        if len > (1 << 29) - 1 {
            return Err(Error::failed("text or data blob is too large".into()));
        }
        let words = round_bytes_up_to_words(len) as u32;
        let alloc = allocate_content(self.arena, self.segment_id, self.offset, words)?;
        self.arena.write_word(
            alloc.tag_segment,
            alloc.tag_offset,
            WirePointer::new_list(alloc.near_offset(), ElementSize::Byte, len as u32).raw(),
        );
        self.arena.write_bytes(
            alloc.segment_id,
            alloc.content as u64 * BYTES_PER_WORD as u64,
            bytes,
        );
        Ok(())
    }

    pub fn set_capability(&self, index: u32) {
        self.arena.write_word(
            self.segment_id,
            self.offset,
            WirePointer::new_capability(index).raw(),
        );
    }

    /// Deep-copies `src` into this pointer.
    pub fn copy_from(&self, src: PointerReader<'_>, canonicalize: bool) -> Result<()> {
        if canonicalize {
            copy_pointer(*self, src, true, &mut |_| {
                Err(Error::failed(
                    "Cannot canonicalize a message containing capabilities.".into(),
                ))
            })
        } else {
            copy_pointer(*self, src, false, &mut |index| Ok(index))
        }
    }

    /// Deep-copies `src`, rewriting each capability index through `cap_map`.
    pub fn copy_from_mapped(
        &self,
        src: PointerReader<'_>,
        cap_map: &mut dyn FnMut(u32) -> Result<u32>,
    ) -> Result<()> {
        copy_pointer(*self, src, false, cap_map)
    }

    /// Follows the existing pointer (and at most one far hop, which is all
    /// the builder ever writes) to its content.
    fn resolve_existing(&self) -> Result<(WirePointer, u32, u32)> {
        let ptr = WirePointer::from_raw(self.arena.read_word(self.segment_id, self.offset));
        if ptr.kind() != WirePointerKind::Far {
            let content = near_content(self.offset, ptr.offset())?;
            return Ok((ptr, self.segment_id, content));
        }
        if ptr.is_double_far() {
            return Err(Error::failed(
                "Builder-owned messages never contain double-far pointers.".into(),
            ));
        }
        let pad_segment = ptr.far_segment();
        let pad_offset = ptr.far_offset();
        let pad = WirePointer::from_raw(self.arena.read_word(pad_segment, pad_offset));
        let content = near_content(pad_offset, pad.offset())?;
        Ok((pad, pad_segment, content))
    }
}

#[derive(Clone, Copy)]
pub struct StructBuilder<'a> {
    arena: &'a dyn BuilderArena,
    segment_id: u32,
    data_start: u64,
    pointers_start: u32,
    data_size_bits: u32,
    pointer_count: u16,
}

impl<'a> std::fmt::Debug for StructBuilder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructBuilder")
            .field("segment_id", &self.segment_id)
            .field("data_start", &self.data_start)
            .field("pointers_start", &self.pointers_start)
            .field("data_size_bits", &self.data_size_bits)
            .field("pointer_count", &self.pointer_count)
            .finish()
    }
}

macro_rules! builder_primitive {
    ($get:ident, $set:ident, $set_mask:ident, $ty:ty, $bits:expr) => {
        pub fn $get(&self, offset: u32) -> $ty {
            if (offset as u64 + 1) * $bits > self.data_size_bits as u64 {
                return Default::default();
            }
            let start = self.data_start + offset as u64 * ($bits / 8);
            let mut bytes = [0u8; ($bits / 8) as usize];
            self.arena.read_bytes_into(self.segment_id, start, &mut bytes);
            <$ty>::from_le_bytes(bytes)
        }

        pub fn $set(&self, offset: u32, value: $ty) {
            debug_assert!((offset as u64 + 1) * $bits <= self.data_size_bits as u64);
            let start = self.data_start + offset as u64 * ($bits / 8);
            self.arena
                .write_bytes(self.segment_id, start, &value.to_le_bytes());
        }

        pub fn $set_mask(&self, offset: u32, value: $ty, mask: <$ty as Mask>::T) {
            self.$set(offset, Mask::mask(value, mask));
        }
    };
}

impl<'a> StructBuilder<'a> {
    builder_primitive!(get_u8, set_u8, set_u8_mask, u8, 8);
    builder_primitive!(get_u16, set_u16, set_u16_mask, u16, 16);
    builder_primitive!(get_u32, set_u32, set_u32_mask, u32, 32);
    builder_primitive!(get_u64, set_u64, set_u64_mask, u64, 64);
    builder_primitive!(get_i8, set_i8, set_i8_mask, i8, 8);
    builder_primitive!(get_i16, set_i16, set_i16_mask, i16, 16);
    builder_primitive!(get_i32, set_i32, set_i32_mask, i32, 32);
    builder_primitive!(get_i64, set_i64, set_i64_mask, i64, 64);

    pub fn get_f32(&self, offset: u32) -> f32 {
        f32::from_bits(self.get_u32(offset))
    }

    pub fn set_f32(&self, offset: u32, value: f32) {
        self.set_u32(offset, value.to_bits());
    }

    pub fn set_f32_mask(&self, offset: u32, value: f32, mask: u32) {
        self.set_u32(offset, value.to_bits() ^ mask);
    }

    pub fn get_f64(&self, offset: u32) -> f64 {
        f64::from_bits(self.get_u64(offset))
    }

    pub fn set_f64(&self, offset: u32, value: f64) {
        self.set_u64(offset, value.to_bits());
    }

    pub fn set_f64_mask(&self, offset: u32, value: f64, mask: u64) {
        self.set_u64(offset, value.to_bits() ^ mask);
    }

    pub fn get_bool_field(&self, offset_bits: u32) -> bool {
        if offset_bits >= self.data_size_bits {
            return false;
        }
        let mut byte = [0u8; 1];
        self.arena
            .read_bytes_into(self.segment_id, self.data_start + offset_bits as u64 / 8, &mut byte);
        byte[0] & (1 << (offset_bits % 8)) != 0
    }

    pub fn set_bool_field(&self, offset_bits: u32, value: bool) {
        debug_assert!(offset_bits < self.data_size_bits);
        let position = self.data_start + offset_bits as u64 / 8;
        let mut byte = [0u8; 1];
        self.arena
            .read_bytes_into(self.segment_id, position, &mut byte);
        let bit = 1u8 << (offset_bits % 8);
        if value {
            byte[0] |= bit;
        } else {
            byte[0] &= !bit;
        }
        self.arena.write_bytes(self.segment_id, position, &byte);
    }

    pub fn set_bool_field_mask(&self, offset_bits: u32, value: bool, mask: bool) {
        self.set_bool_field(offset_bits, value ^ mask);
    }

    pub fn set_data_bytes(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 * 8 <= self.data_size_bits as u64);
        self.arena
            .write_bytes(self.segment_id, self.data_start, bytes);
    }

    pub fn get_pointer_field(&self, index: u16) -> PointerBuilder<'a> {
        debug_assert!(index < self.pointer_count);
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            offset: self.pointers_start + index as u32,
        }
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }
}

#[derive(Clone, Copy)]
pub struct ListBuilder<'a> {
    arena: &'a dyn BuilderArena,
    segment_id: u32,
    first_word: u32,
    element_count: u32,
    step_bits: u64,
    struct_data_bits: u32,
    struct_pointer_count: u16,
    element_size: ElementSize,
}

macro_rules! list_builder_primitive {
    ($get:ident, $set:ident, $ty:ty, $bits:expr) => {
        pub fn $get(&self, index: u32) -> $ty {
            debug_assert!(index < self.element_count);
            if self.struct_data_bits < $bits {
                return Default::default();
            }
            let bit =
                self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
            let mut bytes = [0u8; ($bits / 8) as usize];
            self.arena
                .read_bytes_into(self.segment_id, bit / 8, &mut bytes);
            <$ty>::from_le_bytes(bytes)
        }

        pub fn $set(&self, index: u32, value: $ty) {
            debug_assert!(index < self.element_count);
            debug_assert!(self.struct_data_bits >= $bits);
            let bit =
                self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
            self.arena
                .write_bytes(self.segment_id, bit / 8, &value.to_le_bytes());
        }
    };
}

impl<'a> ListBuilder<'a> {
    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    list_builder_primitive!(get_u8_element, set_u8_element, u8, 8);
    list_builder_primitive!(get_u16_element, set_u16_element, u16, 16);
    list_builder_primitive!(get_u32_element, set_u32_element, u32, 32);
    list_builder_primitive!(get_u64_element, set_u64_element, u64, 64);
    list_builder_primitive!(get_i8_element, set_i8_element, i8, 8);
    list_builder_primitive!(get_i16_element, set_i16_element, i16, 16);
    list_builder_primitive!(get_i32_element, set_i32_element, i32, 32);
    list_builder_primitive!(get_i64_element, set_i64_element, i64, 64);

    pub fn set_f32_element(&self, index: u32, value: f32) {
        self.set_u32_element(index, value.to_bits());
    }

    pub fn set_f64_element(&self, index: u32, value: f64) {
        self.set_u64_element(index, value.to_bits());
    }

    pub fn get_f32_element(&self, index: u32) -> f32 {
        f32::from_bits(self.get_u32_element(index))
    }

    pub fn get_f64_element(&self, index: u32) -> f64 {
        f64::from_bits(self.get_u64_element(index))
    }

    pub fn set_bool_element(&self, index: u32, value: bool) {
        debug_assert!(index < self.element_count);
        debug_assert!(self.element_size == ElementSize::Bit);
        let bit = self.first_word as u64 * BITS_PER_WORD as u64 + index as u64;
        let mut byte = [0u8; 1];
        self.arena
            .read_bytes_into(self.segment_id, bit / 8, &mut byte);
        let mask = 1u8 << (bit % 8);
        if value {
            byte[0] |= mask;
        } else {
            byte[0] &= !mask;
        }
        self.arena.write_bytes(self.segment_id, bit / 8, &byte);
    }

    pub fn get_bool_element(&self, index: u32) -> bool {
        debug_assert!(index < self.element_count);
        let bit = self.first_word as u64 * BITS_PER_WORD as u64 + index as u64;
        let mut byte = [0u8; 1];
        self.arena
            .read_bytes_into(self.segment_id, bit / 8, &mut byte);
        byte[0] & (1 << (bit % 8)) != 0
    }

    pub fn get_struct_element(&self, index: u32) -> StructBuilder<'a> {
        debug_assert!(index < self.element_count);
        let start_bit =
            self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data_start: start_bit / 8,
            pointers_start: ((start_bit + self.struct_data_bits as u64)
                / BITS_PER_WORD as u64) as u32,
            data_size_bits: self.struct_data_bits,
            pointer_count: self.struct_pointer_count,
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerBuilder<'a> {
        debug_assert!(index < self.element_count);
        debug_assert!(self.struct_pointer_count >= 1);
        let start_bit =
            self.first_word as u64 * BITS_PER_WORD as u64 + index as u64 * self.step_bits;
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            offset: ((start_bit + self.struct_data_bits as u64) / BITS_PER_WORD as u64) as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

/// Copies the object graph under `src` into `dst`.
///
/// When `canonicalize` is set, struct data and pointer sections are truncated
/// to the minimum needed for their non-default suffixes and inline-composite
/// element sizes are tightened, producing the canonical byte form when the
/// destination is a single sufficiently-large segment.
fn copy_pointer(
    dst: PointerBuilder<'_>,
    src: PointerReader<'_>,
    canonicalize: bool,
    cap_map: &mut dyn FnMut(u32) -> Result<u32>,
) -> Result<()> {
    let wire = src.load()?;
    if wire.is_null() {
        dst.set_null();
        return Ok(());
    }
    let resolved = follow_fars(src.arena, wire, src.segment_id, src.offset)?;
    match resolved.tag.kind() {
        WirePointerKind::Struct => {
            let reader = src.get_struct()?;
            copy_struct_into(dst, &reader, canonicalize, cap_map)
        }
        WirePointerKind::List => copy_list(dst, src, resolved.tag, canonicalize, cap_map),
        WirePointerKind::Other => {
            let mapped = cap_map(resolved.tag.cap_index())?;
            dst.set_capability(mapped);
            Ok(())
        }
        WirePointerKind::Far => Err(out_of_bounds()),
    }
}

/// The data words and pointer count a struct needs to represent its
/// non-default (non-zero, non-null) suffix.
fn trimmed_struct_size(reader: &StructReader) -> StructSize {
    let data = reader.data_bytes();
    let last_nonzero = data.iter().rposition(|&b| b != 0);
    let data_words = match last_nonzero {
        Some(i) => round_bytes_up_to_words(i as u64 + 1) as u16,
        None => 0,
    };
    let mut pointers = reader.pointer_count();
    while pointers > 0 && reader.get_pointer_field(pointers - 1).is_null() {
        pointers -= 1;
    }
    StructSize {
        data: data_words,
        pointers,
    }
}

fn copy_struct_into(
    dst: PointerBuilder<'_>,
    reader: &StructReader<'_>,
    canonicalize: bool,
    cap_map: &mut dyn FnMut(u32) -> Result<u32>,
) -> Result<()> {
    let size = if canonicalize {
        trimmed_struct_size(reader)
    } else {
        StructSize {
            data: round_bits_up_to_words(reader.data_size_bits() as u64) as u16,
            pointers: reader.pointer_count(),
        }
    };
    let builder = dst.init_struct(size)?;
    let data = reader.data_bytes();
    let keep = ::core::cmp::min(data.len(), size.data as usize * BYTES_PER_WORD);
    builder.set_data_bytes(&data[..keep]);
    for i in 0..size.pointers {
        copy_pointer(
            builder.get_pointer_field(i),
            reader.get_pointer_field(i),
            canonicalize,
            cap_map,
        )?;
    }
    Ok(())
}

fn copy_list(
    dst: PointerBuilder<'_>,
    src: PointerReader<'_>,
    tag: WirePointer,
    canonicalize: bool,
    cap_map: &mut dyn FnMut(u32) -> Result<u32>,
) -> Result<()> {
    let element_size = tag.list_element_size();
    match element_size {
        ElementSize::InlineComposite => {
            let list = src.get_list(ElementSize::InlineComposite)?;
            let declared = StructSize {
                data: (list.struct_data_bits / BITS_PER_WORD) as u16,
                pointers: list.struct_pointer_count,
            };
            let size = if canonicalize {
                let mut needed = StructSize {
                    data: 0,
                    pointers: 0,
                };
                for i in 0..list.len() {
                    let t = trimmed_struct_size(&list.get_struct_element(i));
                    needed.data = needed.data.max(t.data);
                    needed.pointers = needed.pointers.max(t.pointers);
                }
                needed
            } else {
                declared
            };
            let builder = dst.init_struct_list(list.len(), size)?;
            for i in 0..list.len() {
                let src_element = list.get_struct_element(i);
                let dst_element = builder.get_struct_element(i);
                let data = src_element.data_bytes();
                let keep = ::core::cmp::min(data.len(), size.data as usize * BYTES_PER_WORD);
                dst_element.set_data_bytes(&data[..keep]);
                for p in 0..size.pointers.min(src_element.pointer_count()) {
                    copy_pointer(
                        dst_element.get_pointer_field(p),
                        src_element.get_pointer_field(p),
                        canonicalize,
                        cap_map,
                    )?;
                }
            }
            Ok(())
        }
        ElementSize::Pointer => {
            let list = src.get_list(ElementSize::Pointer)?;
            let builder = dst.init_list(ElementSize::Pointer, list.len())?;
            for i in 0..list.len() {
                copy_pointer(
                    builder.get_pointer_element(i),
                    list.get_pointer_element(i),
                    canonicalize,
                    cap_map,
                )?;
            }
            Ok(())
        }
        _ => {
            let list = src.get_list(element_size)?;
            let builder = dst.init_list(element_size, list.len())?;
            let total_bits = list.len() as u64 * element_size.data_bits_per_element() as u64;
            let byte_len = round_bits_up_to_bytes(total_bits) as usize;
            if byte_len > 0 {
                let segment = src.arena.get_segment(list.segment_id)?;
                let start = list.first_word as usize * BYTES_PER_WORD;
                let mut bytes = segment[start..start + byte_len].to_vec();
                // Bits past the element count are not part of the value.
                let spare_bits = (byte_len as u64 * 8 - total_bits) as u8;
                if spare_bits > 0 {
                    let last = bytes.len() - 1;
                    bytes[last] &= 0xffu8 >> spare_bits;
                }
                builder.arena.write_bytes(
                    builder.segment_id,
                    builder.first_word as u64 * BYTES_PER_WORD as u64,
                    &bytes,
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReaderOptions, SegmentArray};
    use crate::private::arena::ReaderArenaImpl;
    use crate::Word;

    fn words(ws: &[u64]) -> Vec<u8> {
        Word::words_to_bytes(&ws.iter().map(|&w| Word(w)).collect::<Vec<_>>())
    }

    fn struct_ptr(offset: i32, data: u16, pointers: u16) -> u64 {
        WirePointer::new_struct(offset, StructSize { data, pointers }).raw()
    }

    #[test]
    fn wire_pointer_fields() {
        let p = WirePointer::new_struct(-1, StructSize { data: 2, pointers: 3 });
        assert_eq!(p.kind(), WirePointerKind::Struct);
        assert_eq!(p.offset(), -1);
        assert_eq!(p.struct_data_size(), 2);
        assert_eq!(p.struct_pointer_count(), 3);

        let l = WirePointer::new_list(5, ElementSize::FourBytes, 17);
        assert_eq!(l.kind(), WirePointerKind::List);
        assert_eq!(l.offset(), 5);
        assert_eq!(l.list_element_size(), ElementSize::FourBytes);
        assert_eq!(l.list_element_count(), 17);

        let f = WirePointer::new_far(true, 9, 4);
        assert_eq!(f.kind(), WirePointerKind::Far);
        assert!(f.is_double_far());
        assert_eq!(f.far_offset(), 9);
        assert_eq!(f.far_segment(), 4);

        let c = WirePointer::new_capability(42);
        assert_eq!(c.kind(), WirePointerKind::Other);
        assert_eq!(c.cap_index(), 42);
    }

    #[test]
    fn read_simple_struct() {
        // Root struct with one data word and one pointer (a text "hi").
        let segment = words(&[
            struct_ptr(0, 1, 1),
            0x1122_3344_5566_7788,
            WirePointer::new_list(0, ElementSize::Byte, 3).raw(),
            u64::from_le_bytes(*b"hi\0\0\0\0\0\0"),
        ]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 0x1122_3344_5566_7788);
        assert_eq!(st.get_u32(0), 0x5566_7788);
        assert_eq!(st.get_u32(1), 0x1122_3344);
        assert_eq!(st.get_u8(0), 0x88);
        // Fields past the data section read as zero.
        assert_eq!(st.get_u64(1), 0);
        assert!(st.get_bool_field(3)); // 0x88 = 0b1000_1000
        assert!(!st.get_bool_field(0));
        assert_eq!(st.get_pointer_field(0).get_text().unwrap(), "hi");
        // Pointer fields past the section read as default.
        assert_eq!(st.get_pointer_field(5).get_text().unwrap(), "");
    }

    #[test]
    fn read_through_simple_far() {
        // Root is a far pointer into segment 1, which holds the landing pad
        // and the struct content.
        let seg0 = words(&[WirePointer::new_far(false, 0, 1).raw()]);
        let seg1 = words(&[struct_ptr(0, 1, 0), 99]);
        let segments = [&seg0[..], &seg1[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 99);
    }

    #[test]
    fn read_through_double_far() {
        // Root is a double-far into segment 1; the pad names content in
        // segment 2 at offset 0; the tag describes a one-data-word struct.
        let seg0 = words(&[WirePointer::new_far(true, 0, 1).raw()]);
        let seg1 = words(&[
            WirePointer::new_far(false, 0, 2).raw(),
            struct_ptr(0, 1, 0),
        ]);
        let seg2 = words(&[1234]);
        let segments = [&seg0[..], &seg1[..], &seg2[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 1234);
    }

    #[test]
    fn out_of_bounds_struct_pointer() {
        let segment = words(&[struct_ptr(1, 2, 0)]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let err = root.get_struct().unwrap_err();
        assert_eq!(err.kind, ErrorKind::PointerOutOfBounds);
    }

    #[test]
    fn traversal_limit_enforced() {
        let segment = words(&[struct_ptr(0, 2, 0), 1, 2]);
        let segments = [&segment[..]];

        let arena = ReaderArenaImpl::new(
            SegmentArray::new(&segments),
            *ReaderOptions::new().traversal_limit_in_words(Some(1)),
        );
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let err = root.get_struct().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);

        let arena = ReaderArenaImpl::new(
            SegmentArray::new(&segments),
            *ReaderOptions::new().traversal_limit_in_words(Some(2)),
        );
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        assert!(root.get_struct().is_ok());
    }

    #[test]
    fn nesting_limit_enforced() {
        // A struct whose pointer field points back at an identical struct,
        // forming an unbounded chain through self-reference.
        let segment = words(&[struct_ptr(0, 0, 1), struct_ptr(-2, 0, 1)]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(
            SegmentArray::new(&segments),
            *ReaderOptions::new().traversal_limit_in_words(None),
        );
        let root = PointerReader::get_root(&arena, 0, 0, 4).unwrap();
        let mut st = root.get_struct().unwrap();
        let mut depth = 1;
        let err = loop {
            match st.get_pointer_field(0).get_struct() {
                Ok(next) => {
                    st = next;
                    depth += 1;
                    assert!(depth < 100, "nesting limit never tripped");
                }
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind, ErrorKind::NestingLimitExceeded);
    }

    #[test]
    fn inline_composite_list() {
        // List of two structs, each with one data word.
        let segment = words(&[
            WirePointer::new_list(0, ElementSize::InlineComposite, 2).raw(),
            struct_ptr(2, 1, 0), // tag: element count 2 in offset field
            10,
            20,
        ]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let list = root.get_list(ElementSize::InlineComposite).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get_struct_element(0).get_u64(0), 10);
        assert_eq!(list.get_struct_element(1).get_u64(0), 20);
        // Composite lists also read as primitive lists of the leading field.
        let as_u64s = root.get_list(ElementSize::EightBytes).unwrap();
        assert_eq!(as_u64s.get_u64_element(1), 20);
    }

    #[test]
    fn list_element_size_mismatch() {
        let segment = words(&[WirePointer::new_list(0, ElementSize::Byte, 3).raw(), 0]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        let err = root.get_list(ElementSize::FourBytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidListElementSize);
        assert!(root.get_list(ElementSize::Byte).is_ok());
    }

    #[test]
    fn capability_pointer() {
        let segment = words(&[WirePointer::new_capability(7).raw()]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        assert_eq!(root.get_capability().unwrap(), 7);
    }

    #[test]
    fn null_reads_as_defaults() {
        let segment = words(&[0]);
        let segments = [&segment[..]];
        let arena = ReaderArenaImpl::new(SegmentArray::new(&segments), ReaderOptions::new());
        let root = PointerReader::get_root(&arena, 0, 0, 64).unwrap();
        assert!(root.is_null());
        let st = root.get_struct().unwrap();
        assert_eq!(st.get_u64(0), 0);
        assert_eq!(root.get_text().unwrap(), "");
        assert_eq!(root.get_data().unwrap(), &[] as &[u8]);
        let list = root.get_list(ElementSize::FourBytes).unwrap();
        assert_eq!(list.len(), 0);
    }
}
