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

//! List of primitives.

use core::marker::PhantomData;

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader};
use crate::Result;

/// A primitive type that knows how to move itself in and out of a list.
pub trait PrimitiveElement: Sized {
    const ELEMENT_SIZE: ElementSize;
    fn get(list: &ListReader<'_>, index: u32) -> Self;
    fn get_from_builder(list: &ListBuilder<'_>, index: u32) -> Self;
    fn set(list: &ListBuilder<'_>, index: u32, value: Self);
}

macro_rules! primitive_element {
    ($ty:ty, $size:ident, $get:ident, $set:ident) => {
        impl PrimitiveElement for $ty {
            const ELEMENT_SIZE: ElementSize = ElementSize::$size;

            fn get(list: &ListReader<'_>, index: u32) -> Self {
                list.$get(index)
            }

            fn get_from_builder(list: &ListBuilder<'_>, index: u32) -> Self {
                list.$get(index)
            }

            fn set(list: &ListBuilder<'_>, index: u32, value: Self) {
                list.$set(index, value);
            }
        }
    };
}

primitive_element!(u8, Byte, get_u8_element, set_u8_element);
primitive_element!(u16, TwoBytes, get_u16_element, set_u16_element);
primitive_element!(u32, FourBytes, get_u32_element, set_u32_element);
primitive_element!(u64, EightBytes, get_u64_element, set_u64_element);
primitive_element!(i8, Byte, get_i8_element, set_i8_element);
primitive_element!(i16, TwoBytes, get_i16_element, set_i16_element);
primitive_element!(i32, FourBytes, get_i32_element, set_i32_element);
primitive_element!(i64, EightBytes, get_i64_element, set_i64_element);
primitive_element!(f32, FourBytes, get_f32_element, set_f32_element);
primitive_element!(f64, EightBytes, get_f64_element, set_f64_element);
primitive_element!(bool, Bit, get_bool_element, set_bool_element);

/// Zero-size elements.
impl PrimitiveElement for () {
    const ELEMENT_SIZE: ElementSize = ElementSize::Void;

    fn get(_list: &ListReader<'_>, _index: u32) -> Self {}
    fn get_from_builder(_list: &ListBuilder<'_>, _index: u32) -> Self {}
    fn set(_list: &ListBuilder<'_>, _index: u32, _value: Self) {}
}

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T: PrimitiveElement> crate::traits::Owned for Owned<T> {
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T> {
    list: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: PrimitiveElement> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T {
        assert!(index < self.len());
        T::get(&self.list, index)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a
    where
        T: 'a,
    {
        let list = self.list;
        (0..list.len()).map(move |i| T::get(&list, i))
    }
}

impl<'a, T: PrimitiveElement> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            list: reader.get_list(T::ELEMENT_SIZE)?,
            marker: PhantomData,
        })
    }
}

pub struct Builder<'a, T> {
    list: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: PrimitiveElement> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T {
        assert!(index < self.len());
        T::get_from_builder(&self.list, index)
    }

    pub fn set(&self, index: u32, value: T) {
        assert!(index < self.len());
        T::set(&self.list, index, value);
    }
}

impl<'a, T: PrimitiveElement> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Result<Self> {
        Ok(Self {
            list: builder.init_list(T::ELEMENT_SIZE, size)?,
            marker: PhantomData,
        })
    }

    fn get_from_pointer(_builder: PointerBuilder<'a>) -> Result<Self> {
        Err(crate::Error::unimplemented(
            "Reading back an existing primitive list from a builder is not supported; \
             initialize it once with init_pointer."
                .into(),
        ))
    }
}
