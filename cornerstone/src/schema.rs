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

//! Typed views of `schema.capnp` messages: the `Node` graph inside a
//! `CodeGeneratorRequest`, as produced by `capnp compile -o-`.
//!
//! These wrappers are written by hand, with the standard field offsets, since
//! the code generator cannot be built from its own output. They look like
//! generated code because they stand in for it.

use crate::Result;

/// The result struct type id of streaming methods (`-> stream`).
pub const STREAM_RESULT_ID: u64 = 0x995f_9a33_77c0_b16e;

macro_rules! schema_struct {
    ($data:expr, $pointers:expr) => {
        #[derive(Clone, Copy)]
        pub struct Owned;

        impl crate::traits::OwnedStruct for Owned {
            const STRUCT_SIZE: crate::private::layout::StructSize =
                crate::private::layout::StructSize {
                    data: $data,
                    pointers: $pointers,
                };
            type Reader<'a> = Reader<'a>;
            type Builder<'a> = Builder<'a>;
        }

        impl crate::traits::Owned for Owned {
            type Reader<'a> = Reader<'a>;
            type Builder<'a> = Builder<'a>;
        }

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            pub(crate) reader: crate::private::layout::StructReader<'a>,
        }

        impl<'a> ::core::convert::From<crate::private::layout::StructReader<'a>> for Reader<'a> {
            fn from(reader: crate::private::layout::StructReader<'a>) -> Self {
                Self { reader }
            }
        }

        impl<'a> crate::traits::FromPointerReader<'a> for Reader<'a> {
            fn get_from_pointer(
                reader: crate::private::layout::PointerReader<'a>,
            ) -> crate::Result<Self> {
                Ok(Self {
                    reader: reader.get_struct()?,
                })
            }
        }

        pub struct Builder<'a> {
            pub(crate) builder: crate::private::layout::StructBuilder<'a>,
        }

        impl<'a> ::core::convert::From<crate::private::layout::StructBuilder<'a>> for Builder<'a> {
            fn from(builder: crate::private::layout::StructBuilder<'a>) -> Self {
                Self { builder }
            }
        }

        impl<'a> crate::traits::FromPointerBuilder<'a> for Builder<'a> {
            fn init_pointer(
                builder: crate::private::layout::PointerBuilder<'a>,
                _size: u32,
            ) -> crate::Result<Self> {
                Ok(Self {
                    builder: builder.init_struct(
                        <Owned as crate::traits::OwnedStruct>::STRUCT_SIZE,
                    )?,
                })
            }

            fn get_from_pointer(
                builder: crate::private::layout::PointerBuilder<'a>,
            ) -> crate::Result<Self> {
                Ok(Self {
                    builder: builder.get_struct(
                        <Owned as crate::traits::OwnedStruct>::STRUCT_SIZE,
                    )?,
                })
            }
        }
    };
}

pub mod code_generator_request {
    schema_struct!(0, 4);

    impl<'a> Reader<'a> {
        pub fn get_nodes(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::node::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(0))
        }

        pub fn get_requested_files(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::requested_file::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(1))
        }

        pub fn get_capnp_version(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(2).get_text()
        }
    }

    impl<'a> Builder<'a> {
        pub fn init_nodes(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::node::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(0),
                count,
            )
        }

        pub fn init_requested_files(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::requested_file::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(1),
                count,
            )
        }
    }
}

pub mod requested_file {
    schema_struct!(1, 2);

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u64 {
            self.reader.get_u64(0)
        }

        pub fn get_filename(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_id(&self, value: u64) {
            self.builder.set_u64(0, value);
        }

        pub fn set_filename(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }
    }
}

pub mod node {
    schema_struct!(5, 6);

    pub enum Which<'a> {
        File(()),
        Struct(StructNode<'a>),
        Enum(EnumNode<'a>),
        Interface(InterfaceNode<'a>),
        Const(ConstNode<'a>),
        Annotation(AnnotationNode<'a>),
    }

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u64 {
            self.reader.get_u64(0)
        }

        pub fn get_display_name(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_display_name_prefix_length(&self) -> u32 {
            self.reader.get_u32(2)
        }

        pub fn get_scope_id(&self) -> u64 {
            self.reader.get_u64(2)
        }

        pub fn get_nested_nodes(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::nested_node::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(1))
        }

        pub fn get_annotations(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::annotation::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(2))
        }

        pub fn which(&self) -> ::core::result::Result<Which<'a>, crate::NotInSchema> {
            match self.reader.get_u16(6) {
                0 => Ok(Which::File(())),
                1 => Ok(Which::Struct(StructNode {
                    reader: self.reader,
                })),
                2 => Ok(Which::Enum(EnumNode {
                    reader: self.reader,
                })),
                3 => Ok(Which::Interface(InterfaceNode {
                    reader: self.reader,
                })),
                4 => Ok(Which::Const(ConstNode {
                    reader: self.reader,
                })),
                5 => Ok(Which::Annotation(AnnotationNode {
                    reader: self.reader,
                })),
                other => Err(crate::NotInSchema(other)),
            }
        }
    }

    #[derive(Clone, Copy)]
    pub struct StructNode<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> StructNode<'a> {
        pub fn get_data_word_count(&self) -> u16 {
            self.reader.get_u16(7)
        }

        pub fn get_pointer_count(&self) -> u16 {
            self.reader.get_u16(12)
        }

        pub fn get_is_group(&self) -> bool {
            self.reader.get_bool_field(224)
        }

        pub fn get_discriminant_count(&self) -> u16 {
            self.reader.get_u16(15)
        }

        pub fn get_discriminant_offset(&self) -> u32 {
            self.reader.get_u32(8)
        }

        pub fn get_fields(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::field::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }
    }

    #[derive(Clone, Copy)]
    pub struct EnumNode<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> EnumNode<'a> {
        pub fn get_enumerants(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::enumerant::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }
    }

    #[derive(Clone, Copy)]
    pub struct InterfaceNode<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> InterfaceNode<'a> {
        pub fn get_methods(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::method::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }
    }

    #[derive(Clone, Copy)]
    pub struct ConstNode<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> ConstNode<'a> {
        pub fn get_type(&self) -> crate::Result<super::type_::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }

        pub fn get_value(&self) -> crate::Result<super::value::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(4))
        }
    }

    #[derive(Clone, Copy)]
    pub struct AnnotationNode<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> AnnotationNode<'a> {
        pub fn get_type(&self) -> crate::Result<super::type_::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_id(&self, value: u64) {
            self.builder.set_u64(0, value);
        }

        pub fn set_display_name(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_display_name_prefix_length(&self, value: u32) {
            self.builder.set_u32(2, value);
        }

        pub fn set_scope_id(&self, value: u64) {
            self.builder.set_u64(2, value);
        }

        pub fn set_file(&self) {
            self.builder.set_u16(6, 0);
        }

        /// Marks this node as a struct and returns a sub-builder for the
        /// struct-specific fields.
        pub fn init_struct(&self) -> StructNodeBuilder<'a> {
            self.builder.set_u16(6, 1);
            StructNodeBuilder {
                builder: self.builder,
            }
        }

        pub fn init_enum(&self) -> EnumNodeBuilder<'a> {
            self.builder.set_u16(6, 2);
            EnumNodeBuilder {
                builder: self.builder,
            }
        }

        pub fn init_interface(&self) -> InterfaceNodeBuilder<'a> {
            self.builder.set_u16(6, 3);
            InterfaceNodeBuilder {
                builder: self.builder,
            }
        }

        pub fn init_nested_nodes(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::nested_node::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(1),
                count,
            )
        }

        pub fn init_annotations(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::annotation::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(2),
                count,
            )
        }
    }

    pub struct StructNodeBuilder<'a> {
        builder: crate::private::layout::StructBuilder<'a>,
    }

    impl<'a> StructNodeBuilder<'a> {
        pub fn set_data_word_count(&self, value: u16) {
            self.builder.set_u16(7, value);
        }

        pub fn set_pointer_count(&self, value: u16) {
            self.builder.set_u16(12, value);
        }

        pub fn set_discriminant_count(&self, value: u16) {
            self.builder.set_u16(15, value);
        }

        pub fn set_discriminant_offset(&self, value: u32) {
            self.builder.set_u32(8, value);
        }

        pub fn init_fields(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::field::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(3),
                count,
            )
        }
    }

    pub struct EnumNodeBuilder<'a> {
        builder: crate::private::layout::StructBuilder<'a>,
    }

    impl<'a> EnumNodeBuilder<'a> {
        pub fn init_enumerants(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::enumerant::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(3),
                count,
            )
        }
    }

    pub struct InterfaceNodeBuilder<'a> {
        builder: crate::private::layout::StructBuilder<'a>,
    }

    impl<'a> InterfaceNodeBuilder<'a> {
        pub fn init_methods(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::method::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(3),
                count,
            )
        }
    }
}

pub mod nested_node {
    schema_struct!(1, 1);

    impl<'a> Reader<'a> {
        pub fn get_name(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_id(&self) -> u64 {
            self.reader.get_u64(0)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_name(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_id(&self, value: u64) {
            self.builder.set_u64(0, value);
        }
    }
}

pub mod field {
    schema_struct!(3, 4);

    /// `discriminantValue` is stored XORed with this, so zero wire data means
    /// "not a union member".
    pub const NO_DISCRIMINANT: u16 = 0xffff;

    pub enum Which<'a> {
        Slot(Slot<'a>),
        Group(Group<'a>),
    }

    impl<'a> Reader<'a> {
        pub fn get_name(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_code_order(&self) -> u16 {
            self.reader.get_u16(0)
        }

        pub fn get_discriminant_value(&self) -> u16 {
            self.reader.get_u16_mask(1, NO_DISCRIMINANT)
        }

        pub fn get_annotations(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::annotation::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(1))
        }

        pub fn which(&self) -> ::core::result::Result<Which<'a>, crate::NotInSchema> {
            match self.reader.get_u16(4) {
                0 => Ok(Which::Slot(Slot {
                    reader: self.reader,
                })),
                1 => Ok(Which::Group(Group {
                    reader: self.reader,
                })),
                other => Err(crate::NotInSchema(other)),
            }
        }
    }

    #[derive(Clone, Copy)]
    pub struct Slot<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> Slot<'a> {
        /// Field offset, in units of the field type's width.
        pub fn get_offset(&self) -> u32 {
            self.reader.get_u32(1)
        }

        pub fn get_type(&self) -> crate::Result<super::type_::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(2))
        }

        pub fn get_default_value(&self) -> crate::Result<super::value::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(3))
        }

        pub fn get_had_explicit_default(&self) -> bool {
            self.reader.get_bool_field(128)
        }
    }

    #[derive(Clone, Copy)]
    pub struct Group<'a> {
        reader: crate::private::layout::StructReader<'a>,
    }

    impl<'a> Group<'a> {
        pub fn get_type_id(&self) -> u64 {
            self.reader.get_u64(2)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_name(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_code_order(&self, value: u16) {
            self.builder.set_u16(0, value);
        }

        pub fn set_discriminant_value(&self, value: u16) {
            self.builder.set_u16_mask(1, value, NO_DISCRIMINANT);
        }

        /// Marks this field as a slot and returns a sub-builder.
        pub fn init_slot(&self) -> SlotBuilder<'a> {
            self.builder.set_u16(4, 0);
            SlotBuilder {
                builder: self.builder,
            }
        }

        pub fn init_group(&self, type_id: u64) {
            self.builder.set_u16(4, 1);
            self.builder.set_u64(2, type_id);
        }
    }

    pub struct SlotBuilder<'a> {
        builder: crate::private::layout::StructBuilder<'a>,
    }

    impl<'a> SlotBuilder<'a> {
        pub fn set_offset(&self, value: u32) {
            self.builder.set_u32(1, value);
        }

        pub fn set_had_explicit_default(&self, value: bool) {
            self.builder.set_bool_field(128, value);
        }

        pub fn init_type(&self) -> crate::Result<super::type_::Builder<'a>> {
            crate::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field(2), 0)
        }

        pub fn init_default_value(&self) -> crate::Result<super::value::Builder<'a>> {
            crate::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field(3), 0)
        }
    }
}

pub mod enumerant {
    schema_struct!(1, 2);

    impl<'a> Reader<'a> {
        pub fn get_name(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_code_order(&self) -> u16 {
            self.reader.get_u16(0)
        }

        pub fn get_annotations(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::annotation::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(1))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_name(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_code_order(&self, value: u16) {
            self.builder.set_u16(0, value);
        }

        pub fn init_annotations(
            &self,
            count: u32,
        ) -> crate::Result<crate::struct_list::Builder<'a, super::annotation::Owned>> {
            crate::traits::FromPointerBuilder::init_pointer(
                self.builder.get_pointer_field(1),
                count,
            )
        }
    }
}

pub mod method {
    schema_struct!(3, 5);

    impl<'a> Reader<'a> {
        pub fn get_name(&self) -> crate::Result<&'a str> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_code_order(&self) -> u16 {
            self.reader.get_u16(0)
        }

        pub fn get_param_struct_type(&self) -> u64 {
            self.reader.get_u64(1)
        }

        pub fn get_result_struct_type(&self) -> u64 {
            self.reader.get_u64(2)
        }

        /// Streaming methods return the well-known stream-result type.
        pub fn is_streaming(&self) -> bool {
            self.get_result_struct_type() == super::STREAM_RESULT_ID
        }

        pub fn get_annotations(
            &self,
        ) -> crate::Result<crate::struct_list::Reader<'a, super::annotation::Owned>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(1))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_name(&self, value: &str) -> crate::Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_code_order(&self, value: u16) {
            self.builder.set_u16(0, value);
        }

        pub fn set_param_struct_type(&self, value: u64) {
            self.builder.set_u64(1, value);
        }

        pub fn set_result_struct_type(&self, value: u64) {
            self.builder.set_u64(2, value);
        }
    }
}

pub mod type_ {
    schema_struct!(3, 1);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TypeVariant {
        Void,
        Bool,
        Int8,
        Int16,
        Int32,
        Int64,
        Uint8,
        Uint16,
        Uint32,
        Uint64,
        Float32,
        Float64,
        Text,
        Data,
        List,
        Enum,
        Struct,
        Interface,
        AnyPointer,
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> ::core::result::Result<TypeVariant, crate::NotInSchema> {
            Ok(match self.reader.get_u16(0) {
                0 => TypeVariant::Void,
                1 => TypeVariant::Bool,
                2 => TypeVariant::Int8,
                3 => TypeVariant::Int16,
                4 => TypeVariant::Int32,
                5 => TypeVariant::Int64,
                6 => TypeVariant::Uint8,
                7 => TypeVariant::Uint16,
                8 => TypeVariant::Uint32,
                9 => TypeVariant::Uint64,
                10 => TypeVariant::Float32,
                11 => TypeVariant::Float64,
                12 => TypeVariant::Text,
                13 => TypeVariant::Data,
                14 => TypeVariant::List,
                15 => TypeVariant::Enum,
                16 => TypeVariant::Struct,
                17 => TypeVariant::Interface,
                18 => TypeVariant::AnyPointer,
                other => return Err(crate::NotInSchema(other)),
            })
        }

        /// For list types, the element type.
        pub fn get_element_type(&self) -> crate::Result<Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(0))
        }

        /// For enum, struct, and interface types, the target node id.
        pub fn get_type_id(&self) -> u64 {
            self.reader.get_u64(1)
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_primitive(&self, variant: TypeVariant) {
            let code = match variant {
                TypeVariant::Void => 0,
                TypeVariant::Bool => 1,
                TypeVariant::Int8 => 2,
                TypeVariant::Int16 => 3,
                TypeVariant::Int32 => 4,
                TypeVariant::Int64 => 5,
                TypeVariant::Uint8 => 6,
                TypeVariant::Uint16 => 7,
                TypeVariant::Uint32 => 8,
                TypeVariant::Uint64 => 9,
                TypeVariant::Float32 => 10,
                TypeVariant::Float64 => 11,
                TypeVariant::Text => 12,
                TypeVariant::Data => 13,
                TypeVariant::List => 14,
                TypeVariant::Enum => 15,
                TypeVariant::Struct => 16,
                TypeVariant::Interface => 17,
                TypeVariant::AnyPointer => 18,
            };
            self.builder.set_u16(0, code);
        }

        pub fn set_struct_type(&self, type_id: u64) {
            self.set_primitive(TypeVariant::Struct);
            self.builder.set_u64(1, type_id);
        }

        pub fn set_enum_type(&self, type_id: u64) {
            self.set_primitive(TypeVariant::Enum);
            self.builder.set_u64(1, type_id);
        }

        pub fn set_interface_type(&self, type_id: u64) {
            self.set_primitive(TypeVariant::Interface);
            self.builder.set_u64(1, type_id);
        }

        pub fn init_list_element_type(&self) -> crate::Result<Builder<'a>> {
            self.set_primitive(TypeVariant::List);
            crate::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }
    }
}

pub mod value {
    schema_struct!(2, 1);

    pub enum Which<'a> {
        Void(()),
        Bool(bool),
        Int8(i8),
        Int16(i16),
        Int32(i32),
        Int64(i64),
        Uint8(u8),
        Uint16(u16),
        Uint32(u32),
        Uint64(u64),
        Float32(f32),
        Float64(f64),
        Text(crate::Result<&'a str>),
        Data(crate::Result<&'a [u8]>),
        List(crate::any_pointer::Reader<'a>),
        Enum(u16),
        Struct(crate::any_pointer::Reader<'a>),
        Interface(()),
        AnyPointer(crate::any_pointer::Reader<'a>),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> ::core::result::Result<Which<'a>, crate::NotInSchema> {
            let pointer = crate::any_pointer::Reader::new(
                crate::private::layout::StructReader::get_pointer_field(&self.reader, 0),
            );
            Ok(match self.reader.get_u16(0) {
                0 => Which::Void(()),
                1 => Which::Bool(self.reader.get_bool_field(16)),
                2 => Which::Int8(self.reader.get_i8(2)),
                3 => Which::Int16(self.reader.get_i16(1)),
                4 => Which::Int32(self.reader.get_i32(1)),
                5 => Which::Int64(self.reader.get_i64(1)),
                6 => Which::Uint8(self.reader.get_u8(2)),
                7 => Which::Uint16(self.reader.get_u16(1)),
                8 => Which::Uint32(self.reader.get_u32(1)),
                9 => Which::Uint64(self.reader.get_u64(1)),
                10 => Which::Float32(self.reader.get_f32(1)),
                11 => Which::Float64(self.reader.get_f64(1)),
                12 => Which::Text(self.reader.get_pointer_field(0).get_text()),
                13 => Which::Data(self.reader.get_pointer_field(0).get_data()),
                14 => Which::List(pointer),
                15 => Which::Enum(self.reader.get_u16(1)),
                16 => Which::Struct(pointer),
                17 => Which::Interface(()),
                18 => Which::AnyPointer(pointer),
                other => return Err(crate::NotInSchema(other)),
            })
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_void(&self) {
            self.builder.set_u16(0, 0);
        }

        pub fn set_bool(&self, value: bool) {
            self.builder.set_u16(0, 1);
            self.builder.set_bool_field(16, value);
        }

        pub fn set_uint16(&self, value: u16) {
            self.builder.set_u16(0, 7);
            self.builder.set_u16(1, value);
        }

        pub fn set_uint32(&self, value: u32) {
            self.builder.set_u16(0, 8);
            self.builder.set_u32(1, value);
        }

        pub fn set_uint64(&self, value: u64) {
            self.builder.set_u16(0, 9);
            self.builder.set_u64(1, value);
        }

        pub fn set_int32(&self, value: i32) {
            self.builder.set_u16(0, 4);
            self.builder.set_i32(1, value);
        }

        pub fn set_text(&self, value: &str) -> crate::Result<()> {
            self.builder.set_u16(0, 12);
            self.builder.get_pointer_field(0).set_text(value)
        }
    }
}

pub mod annotation {
    schema_struct!(1, 2);

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u64 {
            self.reader.get_u64(0)
        }

        pub fn get_value(&self) -> crate::Result<super::value::Reader<'a>> {
            crate::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field(0))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_id(&self, value: u64) {
            self.builder.set_u64(0, value);
        }

        pub fn init_value(&self) -> crate::Result<super::value::Builder<'a>> {
            crate::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }
    }
}

/// Convenience: indexes a request's nodes by id.
pub struct NodeMap<'a> {
    nodes: ::std::collections::HashMap<u64, node::Reader<'a>>,
}

impl<'a> NodeMap<'a> {
    pub fn build(request: code_generator_request::Reader<'a>) -> Result<Self> {
        let mut nodes = ::std::collections::HashMap::new();
        for node in request.get_nodes()?.iter() {
            nodes.insert(node.get_id(), node);
        }
        Ok(Self { nodes })
    }

    pub fn get(&self, id: u64) -> Option<node::Reader<'a>> {
        self.nodes.get(&id).copied()
    }

    /// The node for `id`, or `InvalidSchema` if the graph is missing it.
    pub fn require(&self, id: u64) -> Result<node::Reader<'a>> {
        self.get(id).ok_or_else(|| crate::Error {
            kind: crate::ErrorKind::InvalidSchema,
            extra: format!("schema graph has no node with id {id:#x}"),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &node::Reader<'a>)> {
        self.nodes.iter()
    }
}
