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

//! Schema-driven structural validation: walks a message against a `Node`
//! graph, checking that every pointer resolves, list element sizes are
//! compatible with their declared types, and enum values are in range.
//!
//! Unknown union discriminants and data past a struct's declared bounds are
//! accepted, since both occur whenever peers disagree on schema version.

use crate::private::layout::{ElementSize, PointerReader, StructReader};
use crate::schema::{field, node, type_, NodeMap};
use crate::{Error, ErrorKind, Result};

/// Validates the root of `message` as an instance of node `root_type_id`.
pub fn validate_message<S: crate::message::ReaderSegments>(
    message: &crate::message::Reader<S>,
    nodes: &NodeMap<'_>,
    root_type_id: u64,
) -> Result<()> {
    let root: crate::any_pointer::Reader = message.get_root()?;
    if root.is_null() {
        return Ok(());
    }
    validate_struct(root.get_struct()?, nodes.require(root_type_id)?, nodes)
}

fn struct_node<'a>(node: node::Reader<'a>) -> Result<node::StructNode<'a>> {
    match node.which() {
        Ok(node::Which::Struct(s)) => Ok(s),
        _ => Err(Error {
            kind: ErrorKind::InvalidSchema,
            extra: format!("node {:#x} is not a struct node", node.get_id()),
        }),
    }
}

fn validate_struct(
    reader: StructReader<'_>,
    node: node::Reader<'_>,
    nodes: &NodeMap<'_>,
) -> Result<()> {
    let shape = struct_node(node)?;
    let discriminant = if shape.get_discriminant_count() > 0 {
        Some(reader.get_u16(shape.get_discriminant_offset()))
    } else {
        None
    };

    for field in shape.get_fields()?.iter() {
        let member = field.get_discriminant_value();
        if member != field::NO_DISCRIMINANT && discriminant != Some(member) {
            // Not the active union member. An unknown discriminant skips
            // every member, which is exactly the evolution-tolerant choice.
            continue;
        }
        match field.which() {
            Ok(field::Which::Slot(slot)) => {
                validate_slot(&reader, slot, nodes)?;
            }
            Ok(field::Which::Group(group)) => {
                validate_struct(reader, nodes.require(group.get_type_id())?, nodes)?;
            }
            Err(_) => {
                // A field kind from a newer schema.capnp; nothing to check.
            }
        }
    }
    Ok(())
}

fn validate_slot(
    reader: &StructReader<'_>,
    slot: field::Slot<'_>,
    nodes: &NodeMap<'_>,
) -> Result<()> {
    use type_::TypeVariant::*;

    let ty = slot.get_type()?;
    let offset = slot.get_offset();
    match ty.which().map_err(Error::from)? {
        Void | Bool | Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64
        | Float32 | Float64 => {
            // Fixed-width data; the layout layer zero-extends, so there is
            // nothing that can be structurally wrong.
            Ok(())
        }
        Enum => validate_enum_value(reader.get_u16(offset), ty.get_type_id(), nodes),
        Text => {
            reader.get_pointer_field(offset as u16).get_text()?;
            Ok(())
        }
        Data => {
            reader.get_pointer_field(offset as u16).get_data()?;
            Ok(())
        }
        Struct => {
            let pointer = reader.get_pointer_field(offset as u16);
            if pointer.is_null() {
                return Ok(());
            }
            validate_struct(pointer.get_struct()?, nodes.require(ty.get_type_id())?, nodes)
        }
        Interface => {
            let pointer = reader.get_pointer_field(offset as u16);
            if pointer.is_null() {
                return Ok(());
            }
            pointer.get_capability()?;
            Ok(())
        }
        AnyPointer => {
            // Forces resolution of the whole subtree.
            reader.get_pointer_field(offset as u16).total_size()?;
            Ok(())
        }
        List => validate_list(
            reader.get_pointer_field(offset as u16),
            ty.get_element_type()?,
            nodes,
        ),
    }
}

fn validate_enum_value(value: u16, enum_type_id: u64, nodes: &NodeMap<'_>) -> Result<()> {
    let node = nodes.require(enum_type_id)?;
    let count = match node.which() {
        Ok(node::Which::Enum(e)) => e.get_enumerants()?.len(),
        _ => {
            return Err(Error {
                kind: ErrorKind::InvalidSchema,
                extra: format!("node {:#x} is not an enum node", enum_type_id),
            })
        }
    };
    if (value as u32) < count {
        Ok(())
    } else {
        Err(Error {
            kind: ErrorKind::InvalidEnumValue,
            extra: format!("enum value {value} is out of range (only {count} declared)"),
        })
    }
}

fn expected_element_size(variant: type_::TypeVariant) -> ElementSize {
    use type_::TypeVariant::*;
    match variant {
        Void => ElementSize::Void,
        Bool => ElementSize::Bit,
        Int8 | Uint8 => ElementSize::Byte,
        Int16 | Uint16 | Enum => ElementSize::TwoBytes,
        Int32 | Uint32 | Float32 => ElementSize::FourBytes,
        Int64 | Uint64 | Float64 => ElementSize::EightBytes,
        Text | Data | List | AnyPointer | Interface => ElementSize::Pointer,
        Struct => ElementSize::InlineComposite,
    }
}

fn validate_list(
    pointer: PointerReader<'_>,
    element_type: type_::Reader<'_>,
    nodes: &NodeMap<'_>,
) -> Result<()> {
    use type_::TypeVariant::*;

    if pointer.is_null() {
        return Ok(());
    }
    let variant = element_type.which().map_err(Error::from)?;
    let list = pointer.get_list(expected_element_size(variant))?;
    match variant {
        Enum => {
            for i in 0..list.len() {
                validate_enum_value(list.get_u16_element(i), element_type.get_type_id(), nodes)?;
            }
        }
        Text => {
            for i in 0..list.len() {
                list.get_pointer_element(i).get_text()?;
            }
        }
        Data => {
            for i in 0..list.len() {
                list.get_pointer_element(i).get_data()?;
            }
        }
        Struct => {
            let node = nodes.require(element_type.get_type_id())?;
            for i in 0..list.len() {
                validate_struct(list.get_struct_element(i), node, nodes)?;
            }
        }
        List => {
            let nested = element_type.get_element_type()?;
            for i in 0..list.len() {
                validate_list(list.get_pointer_element(i), nested, nodes)?;
            }
        }
        Interface => {
            for i in 0..list.len() {
                let element = list.get_pointer_element(i);
                if !element.is_null() {
                    element.get_capability()?;
                }
            }
        }
        AnyPointer => {
            for i in 0..list.len() {
                list.get_pointer_element(i).total_size()?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Builder;
    use crate::private::layout::StructSize;
    use crate::schema::{self, type_::TypeVariant};

    const COLOR_ENUM_ID: u64 = 0xc01;
    const POINT_STRUCT_ID: u64 = 0xaa1;

    /// A schema with one struct (u16 color enum at offset 0, text name at
    /// pointer 0, union over data at discriminant offset 1) and one enum
    /// with three enumerants.
    fn build_schema() -> Builder<crate::message::HeapAllocator> {
        let mut message = Builder::new_default();
        {
            let root: schema::code_generator_request::Builder =
                message.init_root().unwrap();
            let nodes = root.init_nodes(2).unwrap();

            let point = nodes.get(0);
            point.set_id(POINT_STRUCT_ID);
            point.set_display_name("test.capnp:Point").unwrap();
            let shape = point.init_struct();
            shape.set_data_word_count(1);
            shape.set_pointer_count(1);
            shape.set_discriminant_count(2);
            shape.set_discriminant_offset(1);
            let fields = shape.init_fields(4).unwrap();

            let color = fields.get(0);
            color.set_name("color").unwrap();
            let slot = color.init_slot();
            slot.set_offset(0);
            slot.init_type().unwrap().set_enum_type(COLOR_ENUM_ID);

            let name = fields.get(1);
            name.set_name("name").unwrap();
            let slot = name.init_slot();
            slot.set_offset(0);
            slot.init_type().unwrap().set_primitive(TypeVariant::Text);

            // Union members occupying data offset 2 (u16 units).
            let small = fields.get(2);
            small.set_name("small").unwrap();
            small.set_discriminant_value(0);
            let slot = small.init_slot();
            slot.set_offset(2);
            slot.init_type().unwrap().set_primitive(TypeVariant::Uint16);

            let wide = fields.get(3);
            wide.set_name("wide").unwrap();
            wide.set_discriminant_value(1);
            let slot = wide.init_slot();
            slot.set_offset(2);
            slot.init_type().unwrap().set_primitive(TypeVariant::Uint16);

            let color_enum = nodes.get(1);
            color_enum.set_id(COLOR_ENUM_ID);
            color_enum.set_display_name("test.capnp:Color").unwrap();
            let shape = color_enum.init_enum();
            let enumerants = shape.init_enumerants(3).unwrap();
            for (i, name) in ["red", "green", "blue"].iter().enumerate() {
                let e = enumerants.get(i as u32);
                e.set_name(name).unwrap();
                e.set_code_order(i as u16);
            }
        }
        message
    }

    fn build_point(color: u16, discriminant: u16) -> Builder<crate::message::HeapAllocator> {
        let mut message = Builder::new_default();
        {
            let root: crate::any_pointer::Builder = message.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 1,
                })
                .unwrap();
            st.set_u16(0, color);
            st.set_u16(1, discriminant);
            st.set_u16(2, 19);
            st.get_pointer_field(0).set_text("origin").unwrap();
        }
        message
    }

    #[test]
    fn valid_message_passes() {
        let schema = build_schema().into_reader();
        let request: schema::code_generator_request::Reader = schema.get_root().unwrap();
        let nodes = NodeMap::build(request).unwrap();

        let message = build_point(2, 1).into_reader();
        validate_message(&message, &nodes, POINT_STRUCT_ID).unwrap();
    }

    #[test]
    fn out_of_range_enum_fails() {
        let schema = build_schema().into_reader();
        let request: schema::code_generator_request::Reader = schema.get_root().unwrap();
        let nodes = NodeMap::build(request).unwrap();

        let message = build_point(3, 0).into_reader();
        let err = validate_message(&message, &nodes, POINT_STRUCT_ID).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidEnumValue);
    }

    #[test]
    fn unknown_discriminant_passes() {
        let schema = build_schema().into_reader();
        let request: schema::code_generator_request::Reader = schema.get_root().unwrap();
        let nodes = NodeMap::build(request).unwrap();

        // Discriminant 9 matches no declared member: a newer schema wrote
        // this; validation must not fail.
        let message = build_point(0, 9).into_reader();
        validate_message(&message, &nodes, POINT_STRUCT_ID).unwrap();
    }

    #[test]
    fn missing_schema_node_is_invalid_schema() {
        let schema = build_schema().into_reader();
        let request: schema::code_generator_request::Reader = schema.get_root().unwrap();
        let nodes = NodeMap::build(request).unwrap();

        let message = build_point(0, 0).into_reader();
        let err = validate_message(&message, &nodes, 0xdead).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSchema);
    }
}
