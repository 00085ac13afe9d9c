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

//! List of structs, encoded as an inline composite list with a tag word.

use core::marker::PhantomData;

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, OwnedStruct};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T: OwnedStruct> crate::traits::Owned for Owned<T> {
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T> {
    list: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: OwnedStruct> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T::Reader<'a> {
        assert!(index < self.len());
        self.list.get_struct_element(index).into()
    }

    pub fn iter(&self) -> impl Iterator<Item = T::Reader<'a>> + 'a
    where
        T: 'a,
    {
        let list = self.list;
        (0..list.len()).map(move |i| list.get_struct_element(i).into())
    }
}

impl<'a, T: OwnedStruct> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            list: reader.get_list(ElementSize::InlineComposite)?,
            marker: PhantomData,
        })
    }
}

pub struct Builder<'a, T> {
    list: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: OwnedStruct> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T::Builder<'a> {
        assert!(index < self.len());
        self.list.get_struct_element(index).into()
    }
}

impl<'a, T: OwnedStruct> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self> {
        Ok(Self {
            list: builder.init_struct_list(size, T::STRUCT_SIZE)?,
            marker: PhantomData,
        })
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "Reading back an existing struct list from a builder is not supported.".into(),
        ))
    }
}
