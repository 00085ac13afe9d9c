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

//! List of lists.

use core::marker::PhantomData;

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T: crate::traits::Owned> crate::traits::Owned for Owned<T> {
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T> {
    list: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: crate::traits::Owned> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Result<T::Reader<'a>> {
        assert!(index < self.len());
        FromPointerReader::get_from_pointer(self.list.get_pointer_element(index))
    }
}

impl<'a, T: crate::traits::Owned> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            list: reader.get_list(ElementSize::Pointer)?,
            marker: PhantomData,
        })
    }
}

pub struct Builder<'a, T> {
    list: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: crate::traits::Owned> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initializes the list at `index` with `size` elements.
    pub fn init(&self, index: u32, size: u32) -> Result<T::Builder<'a>> {
        assert!(index < self.len());
        FromPointerBuilder::init_pointer(self.list.get_pointer_element(index), size)
    }
}

impl<'a, T: crate::traits::Owned> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self> {
        Ok(Self {
            list: builder.init_list(ElementSize::Pointer, size)?,
            marker: PhantomData,
        })
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "Reading back an existing list of lists from a builder is not supported.".into(),
        ))
    }
}
