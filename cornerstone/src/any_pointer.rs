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

//! Dynamically typed value, i.e. the `AnyPointer` type.

use crate::private::layout::{
    ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader, StructBuilder,
    StructReader, StructSize,
};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{MessageSize, Result};

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Self {
        Self { reader }
    }

    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    /// The number of words and capabilities reachable from this pointer.
    pub fn target_size(&self) -> Result<MessageSize> {
        self.reader.total_size()
    }

    pub fn get_as<T: FromPointerReader<'a>>(&self) -> Result<T> {
        T::get_from_pointer(self.reader)
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        self.reader.get_struct()
    }

    pub fn get_list(&self, expected_element_size: ElementSize) -> Result<ListReader<'a>> {
        self.reader.get_list(expected_element_size)
    }

    pub fn get_text(&self) -> Result<&'a str> {
        self.reader.get_text()
    }

    pub fn get_data(&self) -> Result<&'a [u8]> {
        self.reader.get_data()
    }

    /// The cap-table index this pointer names.
    pub fn get_capability(&self) -> Result<u32> {
        self.reader.get_capability()
    }

    pub fn reader(&self) -> PointerReader<'a> {
        self.reader
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self { reader })
    }
}

impl<'a> SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(
        builder: PointerBuilder<'_>,
        from: Self,
        canonicalize: bool,
    ) -> Result<()> {
        builder.copy_from(from.reader, canonicalize)
    }
}

#[derive(Clone, Copy)]
pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Self {
        Self { builder }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    pub fn clear(&self) {
        self.builder.set_null();
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(&self) -> Result<T> {
        T::init_pointer(self.builder, 0)
    }

    pub fn initn_as<T: FromPointerBuilder<'a>>(&self, size: u32) -> Result<T> {
        T::init_pointer(self.builder, size)
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(&self) -> Result<T> {
        T::get_from_pointer(self.builder)
    }

    pub fn set_as<T: SetPointerBuilder>(&self, value: T) -> Result<()> {
        T::set_pointer_builder(self.builder, value, false)
    }

    pub fn init_struct(&self, size: StructSize) -> Result<StructBuilder<'a>> {
        self.builder.init_struct(size)
    }

    pub fn init_list(&self, element_size: ElementSize, count: u32) -> Result<ListBuilder<'a>> {
        self.builder.init_list(element_size, count)
    }

    pub fn init_struct_list(&self, count: u32, size: StructSize) -> Result<ListBuilder<'a>> {
        self.builder.init_struct_list(count, size)
    }

    pub fn set_text(&self, value: &str) -> Result<()> {
        self.builder.set_text(value)
    }

    pub fn set_data(&self, value: &[u8]) -> Result<()> {
        self.builder.set_data(value)
    }

    pub fn set_capability(&self, index: u32) {
        self.builder.set_capability(index);
    }

    pub fn builder(&self) -> PointerBuilder<'a> {
        self.builder
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
