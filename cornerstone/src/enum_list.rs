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

//! List of enums. Enums are stored as 16-bit discriminants; values outside
//! the schema surface as `NotInSchema` rather than failing the whole read.

use core::marker::PhantomData;

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader};
use crate::{NotInSchema, Result};

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T> crate::traits::Owned for Owned<T>
where
    T: TryFrom<u16, Error = NotInSchema> + Into<u16> + Copy,
{
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T> {
    list: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T> Reader<'a, T>
where
    T: TryFrom<u16, Error = NotInSchema>,
{
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> ::core::result::Result<T, NotInSchema> {
        assert!(index < self.len());
        T::try_from(self.list.get_u16_element(index))
    }
}

impl<'a, T> FromPointerReader<'a> for Reader<'a, T>
where
    T: TryFrom<u16, Error = NotInSchema>,
{
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            list: reader.get_list(ElementSize::TwoBytes)?,
            marker: PhantomData,
        })
    }
}

pub struct Builder<'a, T> {
    list: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T> Builder<'a, T>
where
    T: Into<u16> + Copy,
{
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&self, index: u32, value: T) {
        assert!(index < self.len());
        self.list.set_u16_element(index, value.into());
    }
}

impl<'a, T> FromPointerBuilder<'a> for Builder<'a, T>
where
    T: Into<u16> + Copy,
{
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self> {
        Ok(Self {
            list: builder.init_list(ElementSize::TwoBytes, size)?,
            marker: PhantomData,
        })
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "Reading back an existing enum list from a builder is not supported.".into(),
        ))
    }
}
