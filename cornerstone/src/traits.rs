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

//! Conversion traits connecting the typed surface (including generated code)
//! to the untyped pointer layer.

use crate::private::layout::{
    PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
};
use crate::Result;

/// Types that can be read out of a pointer field.
pub trait FromPointerReader<'a>: Sized {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self>;
}

/// Types that can be initialized in, or read back from, a pointer field of a
/// message under construction. `size` is the element count for list types
/// and is ignored for structs.
pub trait FromPointerBuilder<'a>: Sized {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self>;
    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self>;
}

/// Values that can be deep-copied into a pointer field.
pub trait SetPointerBuilder {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self, canonicalize: bool)
        -> Result<()>;
}

/// Associates a family of `Reader`/`Builder` types with a single marker type,
/// so that containers like `TypedReader` and `struct_list::Reader` can be
/// parameterized by the value type they hold.
pub trait Owned {
    type Reader<'a>: FromPointerReader<'a>;
    type Builder<'a>: FromPointerBuilder<'a>;
}

/// Implemented by the `Owned` marker of every generated struct type.
pub trait OwnedStruct {
    const STRUCT_SIZE: StructSize;
    type Reader<'a>: From<StructReader<'a>> + Copy;
    type Builder<'a>: From<StructBuilder<'a>>;
}
