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

//! Projection of a schema `Node` graph into Rust source.
//!
//! Each requested file becomes one module: a `mod` per struct with `Reader`,
//! `Builder`, and `Owned`; a Rust enum per schema enum; and per-interface RPC
//! artifacts (`Client`, `Server`, method dispatch, pipelined call targets).

use std::collections::HashMap;

use convert_case::{Case, Casing};
use cornerstone::schema::{
    code_generator_request, enumerant, field, node, type_, value, NodeMap,
};
use cornerstone::{Error, ErrorKind, Result};

use crate::manifest::{Manifest, SerdeEntry};

pub struct GeneratedFile {
    pub file_name: String,
    pub module_name: String,
    pub source: String,
    pub manifest_json: String,
}

/// An indented tree of source lines, flattened at the end. Branch nodes
/// concatenate, indent nodes shift their subtree right one level.
enum FormattedText {
    Indent(Box<FormattedText>),
    Branch(Vec<FormattedText>),
    Line(String),
    BlankLine,
}

use FormattedText::{BlankLine, Branch, Indent, Line};

fn line(text: impl Into<String>) -> FormattedText {
    Line(text.into())
}

fn indent(ft: FormattedText) -> FormattedText {
    Indent(Box::new(ft))
}

fn stringify(ft: &FormattedText) -> String {
    let mut result = String::new();
    append(ft, 0, &mut result);
    result
}

fn append(ft: &FormattedText, level: usize, out: &mut String) {
    match ft {
        Indent(inner) => append(inner, level + 1, out),
        Branch(items) => {
            for item in items {
                append(item, level, out);
            }
        }
        Line(text) => {
            for _ in 0..level {
                out.push_str("    ");
            }
            out.push_str(text);
            out.push('\n');
        }
        BlankLine => out.push('\n'),
    }
}

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "box", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while", "yield",
];

/// Strips characters that may appear in schema names (`$`, `.`, `-`, module
/// scoping) but never in a Rust identifier, then case-converts. Keywords get
/// a trailing underscore.
fn sanitize(name: &str, case: Case) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut ident = cleaned.to_case(case);
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if RUST_KEYWORDS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

fn module_name(name: &str) -> String {
    sanitize(name, Case::Snake)
}

fn type_name(name: &str) -> String {
    sanitize(name, Case::Pascal)
}

fn const_name(name: &str) -> String {
    sanitize(name, Case::UpperSnake)
}

struct GeneratorContext<'a> {
    nodes: NodeMap<'a>,
    /// node id -> `crate::<file module>::a::b` path of the node's module.
    paths: HashMap<u64, String>,
    /// node id -> bare module name.
    names: HashMap<u64, String>,
}

impl<'a> GeneratorContext<'a> {
    fn path(&self, id: u64) -> Result<&str> {
        self.paths.get(&id).map(|s| s.as_str()).ok_or_else(|| Error {
            kind: ErrorKind::InvalidSchema,
            extra: format!("no generated path for node {id:#x}"),
        })
    }
}

/// Walks the nested-node tree assigning module paths.
fn assign_paths(
    ctx: &mut GeneratorContext<'_>,
    node_id: u64,
    parent_path: &str,
) -> Result<()> {
    let node = ctx.nodes.require(node_id)?;
    for nested in node.get_nested_nodes()?.iter() {
        let name = module_name(nested.get_name()?);
        let path = format!("{parent_path}::{name}");
        ctx.paths.insert(nested.get_id(), path.clone());
        ctx.names.insert(nested.get_id(), name);
        assign_paths(ctx, nested.get_id(), &path)?;
    }
    // Group nodes hang off fields rather than nestedNodes.
    if let Ok(node::Which::Struct(shape)) = node.which() {
        for field in shape.get_fields()?.iter() {
            if let Ok(field::Which::Group(group)) = field.which() {
                let name = module_name(field.get_name()?);
                let path = format!("{parent_path}::{name}");
                ctx.paths.insert(group.get_type_id(), path.clone());
                ctx.names.insert(group.get_type_id(), name);
                assign_paths(ctx, group.get_type_id(), &path)?;
            }
        }
    }
    Ok(())
}

pub fn generate(request: code_generator_request::Reader<'_>) -> Result<Vec<GeneratedFile>> {
    let mut output = Vec::new();

    for requested in request.get_requested_files()?.iter() {
        let file_id = requested.get_id();
        let file_name = requested.get_filename()?.to_string();
        let stem = file_name
            .rsplit('/')
            .next()
            .unwrap_or(&file_name)
            .trim_end_matches(".capnp");
        let module = format!("{}_capnp", module_name(stem));

        let mut ctx = GeneratorContext {
            nodes: NodeMap::build(request)?,
            paths: HashMap::new(),
            names: HashMap::new(),
        };
        let root_path = format!("crate::{module}");
        ctx.paths.insert(file_id, root_path.clone());
        assign_paths(&mut ctx, file_id, &root_path)?;

        let mut manifest = Manifest {
            schema: file_name.clone(),
            module: module.clone(),
            serde: Vec::new(),
        };

        let mut body = vec![
            line(format!("// Generated from {file_name}. Do not edit.")),
            BlankLine,
        ];
        let file_node = ctx.nodes.require(file_id)?;
        for nested in file_node.get_nested_nodes()?.iter() {
            body.push(generate_node(&ctx, nested.get_id(), &mut manifest)?);
            body.push(BlankLine);
        }

        let manifest_json = manifest.render();
        body.push(line("/// Stable description of this module's schema."));
        body.push(line(format!(
            "pub const SCHEMA_MANIFEST: &str = r#\"{manifest_json}\"#;"
        )));

        output.push(GeneratedFile {
            file_name,
            module_name: module,
            source: stringify(&Branch(body)),
            manifest_json,
        });
    }
    Ok(output)
}

fn manifest_stem(ctx: &GeneratorContext<'_>, id: u64) -> String {
    // crate::file_capnp::a::b -> a_b
    let path = ctx.paths.get(&id).cloned().unwrap_or_default();
    let mut parts: Vec<&str> = path.split("::").collect();
    parts.drain(..parts.len().min(2));
    parts.join("_")
}

fn generate_node(
    ctx: &GeneratorContext<'_>,
    node_id: u64,
    manifest: &mut Manifest,
) -> Result<FormattedText> {
    let node = ctx.nodes.require(node_id)?;
    match node.which() {
        Ok(node::Which::Struct(shape)) => generate_struct(ctx, node, shape, manifest, None),
        Ok(node::Which::Enum(shape)) => generate_enum(ctx, node, shape, manifest),
        Ok(node::Which::Interface(shape)) => generate_interface(ctx, node, shape, manifest),
        Ok(node::Which::Const(shape)) => generate_const(ctx, node, shape),
        Ok(node::Which::Annotation(_)) | Ok(node::Which::File(())) => Ok(Branch(vec![])),
        Err(e) => Err(Error {
            kind: ErrorKind::UnsupportedType,
            extra: format!("unknown node kind: {e}"),
        }),
    }
}

/// The `(id, type, literal)` triples for a node's annotation list.
fn annotation_entries(
    annotations: cornerstone::struct_list::Reader<'_, cornerstone::schema::annotation::Owned>,
) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for annotation in annotations.iter() {
        let id = annotation.get_id();
        let (kind, literal) = match annotation.get_value()?.which() {
            Ok(value::Which::Void(())) => ("void".to_string(), "()".to_string()),
            Ok(value::Which::Bool(b)) => ("bool".to_string(), b.to_string()),
            Ok(value::Which::Int8(v)) => ("int8".to_string(), v.to_string()),
            Ok(value::Which::Int16(v)) => ("int16".to_string(), v.to_string()),
            Ok(value::Which::Int32(v)) => ("int32".to_string(), v.to_string()),
            Ok(value::Which::Int64(v)) => ("int64".to_string(), v.to_string()),
            Ok(value::Which::Uint8(v)) => ("uint8".to_string(), v.to_string()),
            Ok(value::Which::Uint16(v)) => ("uint16".to_string(), v.to_string()),
            Ok(value::Which::Uint32(v)) => ("uint32".to_string(), v.to_string()),
            Ok(value::Which::Uint64(v)) => ("uint64".to_string(), v.to_string()),
            Ok(value::Which::Float32(v)) => ("float32".to_string(), v.to_string()),
            Ok(value::Which::Float64(v)) => ("float64".to_string(), v.to_string()),
            Ok(value::Which::Text(t)) => ("text".to_string(), format!("{:?}", t?)),
            Ok(value::Which::Data(_)) => ("data".to_string(), "<data>".to_string()),
            Ok(value::Which::Enum(v)) => ("enum".to_string(), v.to_string()),
            Ok(value::Which::Struct(_)) => ("struct".to_string(), "<struct>".to_string()),
            Ok(value::Which::List(_)) => ("list".to_string(), "<list>".to_string()),
            Ok(value::Which::Interface(())) => ("interface".to_string(), "<cap>".to_string()),
            Ok(value::Which::AnyPointer(_)) => ("anyPointer".to_string(), "<any>".to_string()),
            Err(e) => ("unknown".to_string(), e.to_string()),
        };
        entries.push(format!("({id:#018x}, \"{kind}\", {literal:?})"));
    }
    Ok(entries)
}

fn annotation_const(name: &str, entries: &[String]) -> FormattedText {
    if entries.is_empty() {
        return Branch(vec![]);
    }
    Branch(vec![line(format!(
        "pub const {name}: &[(u64, &str, &str)] = &[{}];",
        entries.join(", ")
    ))])
}

/// How a field is stored, straight out of the schema's slot description.
struct SlotInfo<'a> {
    offset: u32,
    ty: type_::Reader<'a>,
    default: Option<value::Reader<'a>>,
}

fn slot_info<'a>(slot: field::Slot<'a>) -> Result<SlotInfo<'a>> {
    Ok(SlotInfo {
        offset: slot.get_offset(),
        ty: slot.get_type()?,
        default: if slot.get_had_explicit_default() {
            Some(slot.get_default_value()?)
        } else {
            None
        },
    })
}

/// The XOR mask for a primitive default, as a literal, or None when zero.
fn default_mask(default: &Option<value::Reader<'_>>) -> Option<String> {
    let value = default.as_ref()?;
    let literal = match value.which().ok()? {
        value::Which::Bool(true) => "true".to_string(),
        value::Which::Int8(v) if v != 0 => v.to_string(),
        value::Which::Int16(v) if v != 0 => v.to_string(),
        value::Which::Int32(v) if v != 0 => v.to_string(),
        value::Which::Int64(v) if v != 0 => v.to_string(),
        value::Which::Uint8(v) if v != 0 => v.to_string(),
        value::Which::Uint16(v) if v != 0 => v.to_string(),
        value::Which::Uint32(v) if v != 0 => v.to_string(),
        value::Which::Uint64(v) if v != 0 => v.to_string(),
        value::Which::Float32(v) if v != 0.0 => format!("{:#x}", v.to_bits()),
        value::Which::Float64(v) if v != 0.0 => format!("{:#x}", v.to_bits()),
        _ => return None,
    };
    Some(literal)
}

struct PrimitiveKind {
    rust: &'static str,
    getter: &'static str,
    setter: &'static str,
}

fn primitive_kind(variant: type_::TypeVariant) -> Option<PrimitiveKind> {
    use type_::TypeVariant::*;
    let (rust, getter, setter) = match variant {
        Int8 => ("i8", "get_i8", "set_i8"),
        Int16 => ("i16", "get_i16", "set_i16"),
        Int32 => ("i32", "get_i32", "set_i32"),
        Int64 => ("i64", "get_i64", "set_i64"),
        Uint8 => ("u8", "get_u8", "set_u8"),
        Uint16 => ("u16", "get_u16", "set_u16"),
        Uint32 => ("u32", "get_u32", "set_u32"),
        Uint64 => ("u64", "get_u64", "set_u64"),
        Float32 => ("f32", "get_f32", "set_f32"),
        Float64 => ("f64", "get_f64", "set_f64"),
        _ => return None,
    };
    Some(PrimitiveKind {
        rust,
        getter,
        setter,
    })
}

/// The list reader type for a list-of-`element` field.
fn list_reader_type(ctx: &GeneratorContext<'_>, element: type_::Reader<'_>) -> Result<String> {
    use type_::TypeVariant::*;
    Ok(match element.which().map_err(Error::from)? {
        Void => "::cornerstone::primitive_list::Reader<'a, ()>".to_string(),
        Bool => "::cornerstone::primitive_list::Reader<'a, bool>".to_string(),
        Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64 | Float32 | Float64 => {
            let kind = primitive_kind(element.which().map_err(Error::from)?)
                .expect("primitive variant");
            format!("::cornerstone::primitive_list::Reader<'a, {}>", kind.rust)
        }
        Text => "::cornerstone::text_list::Reader<'a>".to_string(),
        Data => "::cornerstone::data_list::Reader<'a>".to_string(),
        Struct => format!(
            "::cornerstone::struct_list::Reader<'a, {}::Owned>",
            ctx.path(element.get_type_id())?
        ),
        Enum => format!(
            "::cornerstone::enum_list::Reader<'a, {}>",
            enum_type_path(ctx, element.get_type_id())?
        ),
        Interface => "::cornerstone::capability_list::Reader<'a>".to_string(),
        List => format!(
            "::cornerstone::list_list::Reader<'a, ::cornerstone::any_pointer::Owned>",
        ),
        AnyPointer => {
            "::cornerstone::list_list::Reader<'a, ::cornerstone::any_pointer::Owned>".to_string()
        }
    })
}

/// Enums generate a bare Rust enum beside their module path.
fn enum_type_path(ctx: &GeneratorContext<'_>, id: u64) -> Result<String> {
    let path = ctx.path(id)?;
    let (parent, name) = path.rsplit_once("::").ok_or_else(|| Error {
        kind: ErrorKind::InvalidSchema,
        extra: format!("malformed path for enum {id:#x}"),
    })?;
    Ok(format!("{parent}::{}", type_name(name)))
}

fn reader_accessor(
    ctx: &GeneratorContext<'_>,
    field_name: &str,
    slot: &SlotInfo<'_>,
) -> Result<FormattedText> {
    use type_::TypeVariant::*;
    let name = module_name(field_name);
    let offset = slot.offset;
    let variant = slot.ty.which().map_err(Error::from)?;
    let mask = default_mask(&slot.default);

    let lines = match variant {
        Void => vec![
            line(format!("pub fn get_{name}(&self) {{}}")),
        ],
        Bool => {
            let body = match &mask {
                Some(m) => format!("self.reader.get_bool_field_mask({offset}, {m})"),
                None => format!("self.reader.get_bool_field({offset})"),
            };
            vec![
                line(format!("pub fn get_{name}(&self) -> bool {{")),
                indent(line(body)),
                line("}"),
            ]
        }
        Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64 | Float32 | Float64 => {
            let kind = primitive_kind(variant).expect("primitive variant");
            let body = match &mask {
                Some(m) => format!("self.reader.{}_mask({offset}, {m})", kind.getter),
                None => format!("self.reader.{}({offset})", kind.getter),
            };
            vec![
                line(format!("pub fn get_{name}(&self) -> {} {{", kind.rust)),
                indent(line(body)),
                line("}"),
            ]
        }
        Enum => {
            let ty = enum_type_path(ctx, slot.ty.get_type_id())?;
            vec![
                line(format!(
                    "pub fn get_{name}(&self) -> ::core::result::Result<{ty}, ::cornerstone::NotInSchema> {{"
                )),
                indent(line(format!(
                    "<{ty} as ::core::convert::TryFrom<u16>>::try_from(self.reader.get_u16({offset}))"
                ))),
                line("}"),
            ]
        }
        Text => vec![
            line(format!(
                "pub fn get_{name}(&self) -> ::cornerstone::Result<&'a str> {{"
            )),
            indent(line(format!(
                "self.reader.get_pointer_field({offset}).get_text()"
            ))),
            line("}"),
        ],
        Data => vec![
            line(format!(
                "pub fn get_{name}(&self) -> ::cornerstone::Result<&'a [u8]> {{"
            )),
            indent(line(format!(
                "self.reader.get_pointer_field({offset}).get_data()"
            ))),
            line("}"),
        ],
        Struct => {
            let path = ctx.path(slot.ty.get_type_id())?;
            vec![
                line(format!(
                    "pub fn get_{name}(&self) -> ::cornerstone::Result<{path}::Reader<'a>> {{"
                )),
                indent(line(format!(
                    "Ok(self.reader.get_pointer_field({offset}).get_struct()?.into())"
                ))),
                line("}"),
            ]
        }
        List => {
            let ty = list_reader_type(ctx, slot.ty.get_element_type()?)?;
            vec![
                line(format!(
                    "pub fn get_{name}(&self) -> ::cornerstone::Result<{ty}> {{"
                )),
                indent(line(format!(
                    "::cornerstone::traits::FromPointerReader::get_from_pointer(self.reader.get_pointer_field({offset}))"
                ))),
                line("}"),
            ]
        }
        Interface => {
            let path = ctx.path(slot.ty.get_type_id())?;
            vec![
                line(format!(
                    "/// The raw cap-table index of the `{name}` capability."
                )),
                line(format!(
                    "pub fn get_{name}(&self) -> ::cornerstone::Result<u32> {{"
                )),
                indent(line(format!(
                    "self.reader.get_pointer_field({offset}).get_capability()"
                ))),
                line("}"),
                BlankLine,
                line(format!(
                    "/// Resolves `{name}` against the inbound cap table, retaining it."
                )),
                line(format!(
                    "pub fn resolve_{name}(&self, caps: &::cornerstone_rpc::InboundCaps) -> ::cornerstone::Result<{path}::Client> {{"
                )),
                indent(line(format!(
                    "Ok({path}::Client {{ target: caps.retain(self.get_{name}()?)? }})"
                ))),
                line("}"),
            ]
        }
        AnyPointer => vec![
            line(format!(
                "pub fn get_{name}(&self) -> ::cornerstone::any_pointer::Reader<'a> {{"
            )),
            indent(line(format!(
                "::cornerstone::any_pointer::Reader::new(self.reader.get_pointer_field({offset}))"
            ))),
            line("}"),
        ],
    };
    Ok(Branch(lines))
}

fn builder_accessor(
    ctx: &GeneratorContext<'_>,
    field_name: &str,
    slot: &SlotInfo<'_>,
) -> Result<FormattedText> {
    use type_::TypeVariant::*;
    let name = module_name(field_name);
    let offset = slot.offset;
    let variant = slot.ty.which().map_err(Error::from)?;
    let mask = default_mask(&slot.default);

    let lines = match variant {
        Void => vec![line(format!("pub fn set_{name}(&self) {{}}"))],
        Bool => {
            let body = match &mask {
                Some(m) => format!("self.builder.set_bool_field_mask({offset}, value, {m});"),
                None => format!("self.builder.set_bool_field({offset}, value);"),
            };
            vec![
                line(format!("pub fn set_{name}(&self, value: bool) {{")),
                indent(line(body)),
                line("}"),
            ]
        }
        Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64 | Float32 | Float64 => {
            let kind = primitive_kind(variant).expect("primitive variant");
            let body = match &mask {
                Some(m) => format!("self.builder.{}_mask({offset}, value, {m});", kind.setter),
                None => format!("self.builder.{}({offset}, value);", kind.setter),
            };
            vec![
                line(format!(
                    "pub fn set_{name}(&self, value: {}) {{",
                    kind.rust
                )),
                indent(line(body)),
                line("}"),
            ]
        }
        Enum => {
            let ty = enum_type_path(ctx, slot.ty.get_type_id())?;
            vec![
                line(format!("pub fn set_{name}(&self, value: {ty}) {{")),
                indent(line(format!(
                    "self.builder.set_u16({offset}, value.into());"
                ))),
                line("}"),
            ]
        }
        Text => vec![
            line(format!(
                "pub fn set_{name}(&self, value: &str) -> ::cornerstone::Result<()> {{"
            )),
            indent(line(format!(
                "self.builder.get_pointer_field({offset}).set_text(value)"
            ))),
            line("}"),
        ],
        Data => vec![
            line(format!(
                "pub fn set_{name}(&self, value: &[u8]) -> ::cornerstone::Result<()> {{"
            )),
            indent(line(format!(
                "self.builder.get_pointer_field({offset}).set_data(value)"
            ))),
            line("}"),
        ],
        Struct => {
            let path = ctx.path(slot.ty.get_type_id())?;
            vec![
                line(format!(
                    "pub fn init_{name}(&self) -> ::cornerstone::Result<{path}::Builder<'a>> {{"
                )),
                indent(line(format!(
                    "::cornerstone::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field({offset}), 0)"
                ))),
                line("}"),
            ]
        }
        List => {
            let ty = list_reader_type(ctx, slot.ty.get_element_type()?)?
                .replace("Reader", "Builder");
            vec![
                line(format!(
                    "pub fn init_{name}(&self, count: u32) -> ::cornerstone::Result<{ty}> {{"
                )),
                indent(line(format!(
                    "::cornerstone::traits::FromPointerBuilder::init_pointer(self.builder.get_pointer_field({offset}), count)"
                ))),
                line("}"),
            ]
        }
        Interface => vec![
            line(format!(
                "/// Stores a cap-table index; the RPC layer assigns descriptors."
            )),
            line(format!(
                "pub fn set_{name}(&self, cap_table_index: u32) {{"
            )),
            indent(line(format!(
                "self.builder.get_pointer_field({offset}).set_capability(cap_table_index);"
            ))),
            line("}"),
        ],
        AnyPointer => vec![
            line(format!(
                "pub fn init_{name}(&self) -> ::cornerstone::any_pointer::Builder<'a> {{"
            )),
            indent(line(format!(
                "::cornerstone::any_pointer::Builder::new(self.builder.get_pointer_field({offset}))"
            ))),
            line("}"),
        ],
    };
    Ok(Branch(lines))
}

fn generate_struct(
    ctx: &GeneratorContext<'_>,
    node: node::Reader<'_>,
    shape: node::StructNode<'_>,
    manifest: &mut Manifest,
    name_override: Option<&str>,
) -> Result<FormattedText> {
    let id = node.get_id();
    let name = match name_override {
        Some(n) => n.to_string(),
        None => ctx
            .names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| module_name(&format!("node_{id:x}"))),
    };
    let is_group = shape.get_is_group();

    if !is_group {
        let stem = {
            let s = manifest_stem(ctx, id);
            if s.is_empty() {
                name.clone()
            } else {
                s
            }
        };
        manifest
            .serde
            .push(SerdeEntry::new(id, &type_name(&name), &stem));
    }

    let data_words = shape.get_data_word_count();
    let pointer_count = shape.get_pointer_count();

    let mut readers = Vec::new();
    let mut builders = Vec::new();
    let mut nested = Vec::new();
    let mut which_variants: Vec<(String, u16)> = Vec::new();

    for field in shape.get_fields()?.iter() {
        let field_name = field.get_name()?;
        if field.get_discriminant_value() != field::NO_DISCRIMINANT {
            which_variants.push((
                type_name(field_name),
                field.get_discriminant_value(),
            ));
        }
        match field.which() {
            Ok(field::Which::Slot(slot)) => {
                let info = slot_info(slot)?;
                readers.push(reader_accessor(ctx, field_name, &info)?);
                readers.push(BlankLine);
                builders.push(builder_accessor(ctx, field_name, &info)?);
                builders.push(BlankLine);
            }
            Ok(field::Which::Group(group)) => {
                let path = ctx.path(group.get_type_id())?.to_string();
                let accessor = module_name(field_name);
                readers.push(Branch(vec![
                    line(format!(
                        "pub fn get_{accessor}(&self) -> {path}::Reader<'a> {{"
                    )),
                    indent(line("self.reader.into()")),
                    line("}"),
                    BlankLine,
                ]));
                builders.push(Branch(vec![
                    line(format!(
                        "pub fn get_{accessor}(&self) -> {path}::Builder<'a> {{"
                    )),
                    indent(line("self.builder.into()")),
                    line("}"),
                    BlankLine,
                ]));
                let group_node = ctx.nodes.require(group.get_type_id())?;
                if let Ok(node::Which::Struct(group_shape)) = group_node.which() {
                    nested.push(generate_struct(ctx, group_node, group_shape, manifest, None)?);
                }
            }
            Err(_) => {}
        }
    }

    let mut module_body = vec![
        line(format!("pub const TYPE_ID: u64 = {id:#x};")),
        BlankLine,
        line("#[derive(Clone, Copy)]"),
        line("pub struct Owned;"),
        BlankLine,
    ];

    if !is_group {
        module_body.extend([
            line("impl ::cornerstone::traits::OwnedStruct for Owned {"),
            indent(Branch(vec![
                line(format!(
                    "const STRUCT_SIZE: ::cornerstone::private::layout::StructSize = ::cornerstone::private::layout::StructSize {{ data: {data_words}, pointers: {pointer_count} }};"
                )),
                line("type Reader<'a> = Reader<'a>;"),
                line("type Builder<'a> = Builder<'a>;"),
            ])),
            line("}"),
            BlankLine,
            line("impl ::cornerstone::traits::Owned for Owned {"),
            indent(Branch(vec![
                line("type Reader<'a> = Reader<'a>;"),
                line("type Builder<'a> = Builder<'a>;"),
            ])),
            line("}"),
            BlankLine,
        ]);
    }

    module_body.extend([
        line("#[derive(Clone, Copy)]"),
        line("pub struct Reader<'a> {"),
        indent(line(
            "pub(crate) reader: ::cornerstone::private::layout::StructReader<'a>,",
        )),
        line("}"),
        BlankLine,
        line("impl<'a> From<::cornerstone::private::layout::StructReader<'a>> for Reader<'a> {"),
        indent(Branch(vec![
            line("fn from(reader: ::cornerstone::private::layout::StructReader<'a>) -> Self {"),
            indent(line("Self { reader }")),
            line("}"),
        ])),
        line("}"),
        BlankLine,
    ]);

    if !is_group {
        module_body.extend([
            line("impl<'a> ::cornerstone::traits::FromPointerReader<'a> for Reader<'a> {"),
            indent(Branch(vec![
                line("fn get_from_pointer(reader: ::cornerstone::private::layout::PointerReader<'a>) -> ::cornerstone::Result<Self> {"),
                indent(line("Ok(Self { reader: reader.get_struct()? })")),
                line("}"),
            ])),
            line("}"),
            BlankLine,
        ]);
    }

    // Union support: a Which enum over the labeled members.
    if shape.get_discriminant_count() > 0 {
        let discriminant_offset = shape.get_discriminant_offset();
        let mut variants = Vec::new();
        let mut arms = Vec::new();
        for (variant, value) in &which_variants {
            variants.push(line(format!("{variant},")));
            arms.push(line(format!("{value} => Ok(Which::{variant}),")));
        }
        arms.push(line("other => Err(::cornerstone::NotInSchema(other)),"));
        module_body.extend([
            line("#[derive(Clone, Copy, Debug, PartialEq, Eq)]"),
            line("pub enum Which {"),
            indent(Branch(variants)),
            line("}"),
            BlankLine,
        ]);
        readers.push(Branch(vec![
            line(format!(
                "pub fn which(&self) -> ::core::result::Result<Which, ::cornerstone::NotInSchema> {{"
            )),
            indent(Branch(vec![
                line(format!(
                    "match self.reader.get_u16({discriminant_offset}) {{"
                )),
                indent(Branch(arms)),
                line("}"),
            ])),
            line("}"),
            BlankLine,
        ]));
    }

    module_body.extend([
        line("impl<'a> Reader<'a> {"),
        indent(Branch(readers)),
        line("}"),
        BlankLine,
        line("pub struct Builder<'a> {"),
        indent(line(
            "pub(crate) builder: ::cornerstone::private::layout::StructBuilder<'a>,",
        )),
        line("}"),
        BlankLine,
        line("impl<'a> From<::cornerstone::private::layout::StructBuilder<'a>> for Builder<'a> {"),
        indent(Branch(vec![
            line("fn from(builder: ::cornerstone::private::layout::StructBuilder<'a>) -> Self {"),
            indent(line("Self { builder }")),
            line("}"),
        ])),
        line("}"),
        BlankLine,
    ]);

    if !is_group {
        module_body.extend([
            line("impl<'a> ::cornerstone::traits::FromPointerBuilder<'a> for Builder<'a> {"),
            indent(Branch(vec![
                line("fn init_pointer(builder: ::cornerstone::private::layout::PointerBuilder<'a>, _size: u32) -> ::cornerstone::Result<Self> {"),
                indent(line("Ok(Self { builder: builder.init_struct(<Owned as ::cornerstone::traits::OwnedStruct>::STRUCT_SIZE)? })")),
                line("}"),
                BlankLine,
                line("fn get_from_pointer(builder: ::cornerstone::private::layout::PointerBuilder<'a>) -> ::cornerstone::Result<Self> {"),
                indent(line("Ok(Self { builder: builder.get_struct(<Owned as ::cornerstone::traits::OwnedStruct>::STRUCT_SIZE)? })")),
                line("}"),
            ])),
            line("}"),
            BlankLine,
        ]);
    }

    module_body.extend([
        line("impl<'a> Builder<'a> {"),
        indent(Branch(builders)),
        line("}"),
    ]);

    // Types declared inside this struct in the schema.
    for inner in node.get_nested_nodes()?.iter() {
        nested.push(generate_node(ctx, inner.get_id(), manifest)?);
    }

    for n in nested {
        module_body.push(BlankLine);
        module_body.push(n);
    }

    let annotations = annotation_entries(node.get_annotations()?)?;
    Ok(Branch(vec![
        line(format!("pub mod {name} {{")),
        indent(Branch(module_body)),
        line("}"),
        annotation_const(
            &format!("{}_ANNOTATIONS", const_name(&name)),
            &annotations,
        ),
    ]))
}

fn generate_enum(
    ctx: &GeneratorContext<'_>,
    node: node::Reader<'_>,
    shape: node::EnumNode<'_>,
    manifest: &mut Manifest,
) -> Result<FormattedText> {
    let id = node.get_id();
    let name = ctx
        .names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| module_name(&format!("node_{id:x}")));
    let enum_name = type_name(&name);

    manifest
        .serde
        .push(SerdeEntry::new(id, &enum_name, &manifest_stem(ctx, id)));

    let enumerants: Vec<enumerant::Reader> = shape.get_enumerants()?.iter().collect();
    let mut variants = Vec::new();
    let mut try_arms = Vec::new();
    let mut enumerant_annotations = Vec::new();
    for (ordinal, e) in enumerants.iter().enumerate() {
        let variant = type_name(e.get_name()?);
        variants.push(line(format!("{variant} = {ordinal},")));
        try_arms.push(line(format!("{ordinal} => Ok(Self::{variant}),")));
        let entries = annotation_entries(e.get_annotations()?)?;
        enumerant_annotations.push(format!("&[{}]", entries.join(", ")));
    }
    try_arms.push(line("other => Err(::cornerstone::NotInSchema(other)),"));

    Ok(Branch(vec![
        line(format!("pub mod {name} {{")),
        indent(line(format!("pub const TYPE_ID: u64 = {id:#x};"))),
        line("}"),
        BlankLine,
        line("#[repr(u16)]"),
        line("#[derive(Clone, Copy, Debug, PartialEq, Eq)]"),
        line(format!("pub enum {enum_name} {{")),
        indent(Branch(variants)),
        line("}"),
        BlankLine,
        line(format!("impl TryFrom<u16> for {enum_name} {{")),
        indent(Branch(vec![
            line("type Error = ::cornerstone::NotInSchema;"),
            BlankLine,
            line("fn try_from(value: u16) -> ::core::result::Result<Self, Self::Error> {"),
            indent(Branch(vec![
                line("match value {"),
                indent(Branch(try_arms)),
                line("}"),
            ])),
            line("}"),
        ])),
        line("}"),
        BlankLine,
        line(format!("impl From<{enum_name}> for u16 {{")),
        indent(Branch(vec![
            line(format!("fn from(value: {enum_name}) -> u16 {{")),
            indent(line("value as u16")),
            line("}"),
        ])),
        line("}"),
        BlankLine,
        line(format!(
            "pub const {}_ENUMERANT_ANNOTATIONS: &[&[(u64, &str, &str)]] = &[{}];",
            const_name(&name),
            enumerant_annotations.join(", ")
        )),
        annotation_const(
            &format!("{}_ANNOTATIONS", const_name(&name)),
            &annotation_entries(node.get_annotations()?)?,
        ),
    ]))
}

/// Pointer-typed result fields that a pipelined call can traverse into.
fn pipeline_fields<'a>(
    ctx: &GeneratorContext<'a>,
    result_struct_id: u64,
) -> Result<Vec<(String, u32, type_::TypeVariant)>> {
    let node = ctx.nodes.require(result_struct_id)?;
    let mut out = Vec::new();
    if let Ok(node::Which::Struct(shape)) = node.which() {
        for field in shape.get_fields()?.iter() {
            if let Ok(field::Which::Slot(slot)) = field.which() {
                let ty = slot.get_type()?;
                match ty.which() {
                    Ok(v @ type_::TypeVariant::Interface)
                    | Ok(v @ type_::TypeVariant::Struct) => {
                        out.push((
                            module_name(field.get_name()?),
                            slot.get_offset(),
                            v,
                        ));
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(out)
}

fn generate_interface(
    ctx: &GeneratorContext<'_>,
    node: node::Reader<'_>,
    shape: node::InterfaceNode<'_>,
    manifest: &mut Manifest,
) -> Result<FormattedText> {
    let id = node.get_id();
    let name = ctx
        .names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| module_name(&format!("node_{id:x}")));

    let methods: Vec<_> = shape.get_methods()?.iter().collect();

    let mut method_ids = Vec::new();
    let mut client_methods = Vec::new();
    let mut server_methods = Vec::new();
    let mut dispatch_arms = Vec::new();
    let mut promises = Vec::new();
    let mut param_result_modules = Vec::new();

    for (ordinal, method) in methods.iter().enumerate() {
        let method_name = module_name(method.get_name()?);
        let id_const = const_name(method.get_name()?);
        let streaming = method.is_streaming();
        method_ids.push(line(format!(
            "pub const {id_const}: u16 = {ordinal};"
        )));

        // Params/results struct types become `<method>_params` /
        // `<method>_results` modules when they are anonymous nodes scoped to
        // this interface; named types are referenced where they live.
        let params_id = method.get_param_struct_type();
        let params_path = match ctx.paths.get(&params_id) {
            Some(path) => path.clone(),
            None => {
                // Anonymous parameter struct: emitted here as
                // `<method>_params`.
                let module = format!("{method_name}_params");
                if let Some(n) = ctx.nodes.get(params_id) {
                    if let Ok(node::Which::Struct(param_shape)) = n.which() {
                        param_result_modules.push(generate_struct(
                            ctx,
                            n,
                            param_shape,
                            manifest,
                            Some(&module),
                        )?);
                        param_result_modules.push(BlankLine);
                    }
                }
                module
            }
        };

        let results_id = method.get_result_struct_type();
        let results_path = if streaming {
            String::new()
        } else {
            match ctx.paths.get(&results_id) {
                Some(path) => path.clone(),
                None => {
                    let module = format!("{method_name}_results");
                    if let Some(n) = ctx.nodes.get(results_id) {
                        if let Ok(node::Which::Struct(result_shape)) = n.which() {
                            param_result_modules.push(generate_struct(
                                ctx,
                                n,
                                result_shape,
                                manifest,
                                Some(&module),
                            )?);
                            param_result_modules.push(BlankLine);
                        }
                    }
                    module
                }
            }
        };

        client_methods.push(Branch(vec![
            line(format!(
                "pub fn {method_name}_request(&self) -> ::cornerstone_rpc::Request {{"
            )),
            indent(line(format!(
                "::cornerstone_rpc::Request::new(self.target.clone(), INTERFACE_ID, method_id::{id_const})"
            ))),
            line("}"),
            BlankLine,
        ]));

        if streaming {
            // Streaming methods carry no pipelinable results; the issuing
            // call hands back the question id, and the runtime acknowledges
            // each segment with an empty return.
            client_methods.push(Branch(vec![
                line(format!("/// Issues `{method_name}` on `peer`.")),
                line(format!("pub fn {method_name}(")),
                indent(Branch(vec![
                    line("&self,"),
                    line("peer: &::cornerstone_rpc::Peer,"),
                    line(format!(
                        "build_params: impl FnOnce({params_path}::Builder<'_>) -> ::cornerstone::Result<()>,"
                    )),
                    line("on_return: impl FnOnce(::cornerstone::Result<::cornerstone_rpc::Response>) + 'static,"),
                ])),
                line(") -> ::cornerstone::Result<::cornerstone_rpc::QuestionId> {"),
                indent(line(format!(
                    "peer.send_call(&self.{method_name}_request(), |params| build_params(params.init_as()?), on_return)"
                ))),
                line("}"),
                BlankLine,
            ]));
            server_methods.push(line(format!(
                "fn {method_name}(&mut self, params: {params_path}::Reader<'_>) -> ::cornerstone::Result<()>;"
            )));
            dispatch_arms.push(Branch(vec![
                line(format!("method_id::{id_const} => {{")),
                indent(Branch(vec![
                    line(format!(
                        "server.{method_name}(params.get_as()?)?;"
                    )),
                    line("responder.send_empty()"),
                ])),
                line("}"),
            ]));
        } else {
            let traversable = pipeline_fields(ctx, results_id)?;
            let promise_name = type_name(&format!("{method_name}_promise"));
            let (return_type, construct) = if traversable.is_empty() {
                (
                    format!("::cornerstone_rpc::Promise<{results_path}::Owned>"),
                    "::cornerstone_rpc::Promise::new(question_id)".to_string(),
                )
            } else {
                (
                    promise_name.clone(),
                    format!(
                        "{promise_name} {{ promise: ::cornerstone_rpc::Promise::new(question_id) }}"
                    ),
                )
            };

            client_methods.push(Branch(vec![
                line(format!(
                    "/// Issues `{method_name}` on `peer`, delivering the results to"
                )),
                line("/// `on_return`. The returned promise addresses the results before"),
                line("/// they arrive."),
                line(format!("pub fn {method_name}(")),
                indent(Branch(vec![
                    line("&self,"),
                    line("peer: &::cornerstone_rpc::Peer,"),
                    line(format!(
                        "build_params: impl FnOnce({params_path}::Builder<'_>) -> ::cornerstone::Result<()>,"
                    )),
                    line("on_return: impl FnOnce(::cornerstone::Result<::cornerstone_rpc::Response>) + 'static,"),
                ])),
                line(format!(") -> ::cornerstone::Result<{return_type}> {{")),
                indent(Branch(vec![
                    line("let question_id = peer.send_call("),
                    indent(Branch(vec![
                        line(format!("&self.{method_name}_request(),")),
                        line("|params| build_params(params.init_as()?),"),
                        line("on_return,"),
                    ])),
                    line(")?;"),
                    line(format!("Ok({construct})")),
                ])),
                line("}"),
                BlankLine,
            ]));

            server_methods.push(Branch(vec![
                line(format!(
                    "fn {method_name}(&mut self, params: {params_path}::Reader<'_>, results: {results_path}::Builder<'_>) -> ::cornerstone::Result<()>;"
                )),
                BlankLine,
                line("/// Deferred variant: take ownership of `responder` to complete the"),
                line(format!(
                    "/// answer later. The default completes immediately via `{method_name}`."
                )),
                line(format!(
                    "fn {method_name}_deferred(&mut self, params: {params_path}::Reader<'_>, responder: ::cornerstone_rpc::ReturnSender) -> ::cornerstone::Result<()> {{"
                )),
                indent(line(format!(
                    "responder.send_results_with(|results| self.{method_name}(params, results.init_as()?))"
                ))),
                line("}"),
                BlankLine,
            ]));
            dispatch_arms.push(line(format!(
                "method_id::{id_const} => server.{method_name}_deferred(params.get_as()?, responder),"
            )));

            if !traversable.is_empty() {
                let mut accessors = Vec::new();
                for (field, pointer_index, _variant) in &traversable {
                    accessors.push(Branch(vec![
                        line(format!(
                            "pub fn get_{field}(&self) -> ::cornerstone_rpc::CallTarget {{"
                        )),
                        indent(line(format!(
                            "self.promise.pipeline_field({pointer_index})"
                        ))),
                        line("}"),
                        BlankLine,
                    ]));
                }
                promises.push(Branch(vec![
                    line(format!(
                        "/// Promise for `{method_name}` results: capability-typed accessors"
                    )),
                    line("/// resolve through promised-answer transforms before the return"),
                    line("/// arrives."),
                    line(format!("pub struct {promise_name} {{")),
                    indent(line(format!(
                        "pub promise: ::cornerstone_rpc::Promise<{results_path}::Owned>,"
                    ))),
                    line("}"),
                    BlankLine,
                    line(format!("impl {promise_name} {{")),
                    indent(Branch(vec![
                        Branch(vec![
                            line("pub fn question_id(&self) -> ::cornerstone_rpc::QuestionId {"),
                            indent(line("self.promise.question_id()")),
                            line("}"),
                            BlankLine,
                        ]),
                        Branch(accessors),
                    ])),
                    line("}"),
                    BlankLine,
                ]));
            }
        }
    }

    dispatch_arms.push(line(
        "_ => responder.send_exception(::cornerstone::Error::unimplemented(\"no such method\".into())),",
    ));

    let module_body = Branch(vec![
        line(format!("pub const INTERFACE_ID: u64 = {id:#x};")),
        BlankLine,
        line("pub mod method_id {"),
        indent(Branch(method_ids)),
        line("}"),
        BlankLine,
        line("#[derive(Clone)]"),
        line("pub struct Client {"),
        indent(line("pub target: ::cornerstone_rpc::CallTarget,")),
        line("}"),
        BlankLine,
        line("impl Client {"),
        indent(Branch(vec![
            line("/// Wraps a capability received from `Peer::bootstrap`."),
            line("pub fn from_bootstrap(import_id: u32) -> Self {"),
            indent(line(
                "Self { target: ::cornerstone_rpc::CallTarget::Import(import_id) }",
            )),
            line("}"),
            BlankLine,
            Branch(client_methods),
        ])),
        line("}"),
        BlankLine,
        line("pub trait Server {"),
        indent(Branch(server_methods)),
        line("}"),
        BlankLine,
        line("/// Routes an inbound call to the matching `Server` handler."),
        line("pub fn dispatch<S: Server>("),
        indent(Branch(vec![
            line("server: &mut S,"),
            line("method: u16,"),
            line("params: ::cornerstone::any_pointer::Reader<'_>,"),
            line("responder: ::cornerstone_rpc::ReturnSender,"),
        ])),
        line(") -> ::cornerstone::Result<()> {"),
        indent(Branch(vec![
            line("match method {"),
            indent(Branch(dispatch_arms)),
            line("}"),
        ])),
        line("}"),
        BlankLine,
        Branch(promises),
        Branch(param_result_modules),
    ]);

    let annotations = annotation_entries(node.get_annotations()?)?;
    Ok(Branch(vec![
        line(format!("pub mod {name} {{")),
        indent(module_body),
        line("}"),
        annotation_const(
            &format!("{}_ANNOTATIONS", const_name(&name)),
            &annotations,
        ),
    ]))
}

fn generate_const(
    ctx: &GeneratorContext<'_>,
    node: node::Reader<'_>,
    shape: node::ConstNode<'_>,
) -> Result<FormattedText> {
    let id = node.get_id();
    let name = ctx
        .names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| module_name(&format!("node_{id:x}")));
    let const_ident = const_name(&name);

    let rendered = match shape.get_value()?.which() {
        Ok(value::Which::Bool(v)) => Some(("bool".to_string(), v.to_string())),
        Ok(value::Which::Int8(v)) => Some(("i8".to_string(), v.to_string())),
        Ok(value::Which::Int16(v)) => Some(("i16".to_string(), v.to_string())),
        Ok(value::Which::Int32(v)) => Some(("i32".to_string(), v.to_string())),
        Ok(value::Which::Int64(v)) => Some(("i64".to_string(), v.to_string())),
        Ok(value::Which::Uint8(v)) => Some(("u8".to_string(), v.to_string())),
        Ok(value::Which::Uint16(v)) => Some(("u16".to_string(), v.to_string())),
        Ok(value::Which::Uint32(v)) => Some(("u32".to_string(), v.to_string())),
        Ok(value::Which::Uint64(v)) => Some(("u64".to_string(), v.to_string())),
        Ok(value::Which::Float32(v)) => Some(("f32".to_string(), format!("{v:?}"))),
        Ok(value::Which::Float64(v)) => Some(("f64".to_string(), format!("{v:?}"))),
        Ok(value::Which::Text(t)) => Some(("&str".to_string(), format!("{:?}", t?))),
        _ => None,
    };
    Ok(match rendered {
        Some((ty, value)) => line(format!("pub const {const_ident}: {ty} = {value};")),
        None => Branch(vec![]),
    })
}

#[cfg(test)]
mod tests;
