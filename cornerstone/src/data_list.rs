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

//! List of data blobs.

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    list: ListReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Result<&'a [u8]> {
        assert!(index < self.len());
        self.list.get_pointer_element(index).get_data()
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            list: reader.get_list(ElementSize::Pointer)?,
        })
    }
}

pub struct Builder<'a> {
    list: ListBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&self, index: u32, value: &[u8]) -> Result<()> {
        assert!(index < self.len());
        self.list.get_pointer_element(index).set_data(value)
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self> {
        Ok(Self {
            list: builder.init_list(ElementSize::Pointer, size)?,
        })
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "Reading back an existing data list from a builder is not supported.".into(),
        ))
    }
}
