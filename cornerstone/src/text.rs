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

//! UTF-8 encoded, NUL-terminated text.

use crate::private::layout::{PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

pub type Reader<'a> = &'a str;

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        reader.get_text()
    }
}

/// Writes a text value into a pointer field. Text is write-once: reading it
/// back mutably is not supported.
#[derive(Clone, Copy)]
pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn set(&self, value: &str) -> Result<()> {
        self.builder.set_text(value)
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Result<Self> {
        Ok(Self { builder })
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
        Ok(Self { builder })
    }
}

impl SetPointerBuilder for Reader<'_> {
    fn set_pointer_builder(
        builder: PointerBuilder<'_>,
        from: Self,
        _canonicalize: bool,
    ) -> Result<()> {
        builder.set_text(from)
    }
}
