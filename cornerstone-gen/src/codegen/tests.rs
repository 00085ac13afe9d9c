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

use super::*;
use cornerstone::message::Builder;
use cornerstone::schema::{self, type_::TypeVariant};

const FILE_ID: u64 = 0xf17e;
const PERSON_ID: u64 = 0x9e50;
const COLOR_ID: u64 = 0xc010;
const CALCULATOR_ID: u64 = 0xca1c;
const BOX_ID: u64 = 0xb0c5;
const ADD_PARAMS_ID: u64 = 0xadd0;
const ADD_RESULTS_ID: u64 = 0xadd1;
const PUSH_PARAMS_ID: u64 = 0x9054;

/// A small schema exercising structs with defaults, enums with annotations,
/// an interface with a plain and a streaming method, and a keyword-colliding
/// type name.
fn build_request() -> Builder<cornerstone::message::HeapAllocator> {
    let mut message = Builder::new_default();
    {
        let root: schema::code_generator_request::Builder = message.init_root().unwrap();
        let nodes = root.init_nodes(8).unwrap();

        let file = nodes.get(0);
        file.set_id(FILE_ID);
        file.set_display_name("example.capnp").unwrap();
        file.set_file();
        let nested = file.init_nested_nodes(4).unwrap();
        for (i, (name, id)) in [
            ("Person", PERSON_ID),
            ("Color", COLOR_ID),
            ("Calculator", CALCULATOR_ID),
            ("Box", BOX_ID),
        ]
        .iter()
        .enumerate()
        {
            let entry = nested.get(i as u32);
            entry.set_name(name).unwrap();
            entry.set_id(*id);
        }

        let person = nodes.get(1);
        person.set_id(PERSON_ID);
        person.set_display_name("example.capnp:Person").unwrap();
        person.set_scope_id(FILE_ID);
        let annotations = person.init_annotations(1).unwrap();
        annotations.get(0).set_id(0xbeef);
        annotations
            .get(0)
            .init_value()
            .unwrap()
            .set_text("tag")
            .unwrap();
        let shape = person.init_struct();
        shape.set_data_word_count(1);
        shape.set_pointer_count(1);
        let fields = shape.init_fields(3).unwrap();

        let age = fields.get(0);
        age.set_name("age").unwrap();
        let slot = age.init_slot();
        slot.set_offset(0);
        slot.init_type().unwrap().set_primitive(TypeVariant::Uint16);
        slot.set_had_explicit_default(true);
        slot.init_default_value().unwrap().set_uint16(42);

        let name = fields.get(1);
        name.set_name("name").unwrap();
        let slot = name.init_slot();
        slot.set_offset(0);
        slot.init_type().unwrap().set_primitive(TypeVariant::Text);

        let color = fields.get(2);
        color.set_name("color").unwrap();
        let slot = color.init_slot();
        slot.set_offset(1);
        slot.init_type().unwrap().set_enum_type(COLOR_ID);

        let color_node = nodes.get(2);
        color_node.set_id(COLOR_ID);
        color_node.set_display_name("example.capnp:Color").unwrap();
        color_node.set_scope_id(FILE_ID);
        let shape = color_node.init_enum();
        let enumerants = shape.init_enumerants(3).unwrap();
        for (i, name) in ["red", "green", "blue"].iter().enumerate() {
            let e = enumerants.get(i as u32);
            e.set_name(name).unwrap();
            e.set_code_order(i as u16);
        }
        let green_annotations = enumerants.get(1).init_annotations(1).unwrap();
        green_annotations.get(0).set_id(0x77);
        green_annotations.get(0).init_value().unwrap().set_uint16(5);

        let calculator = nodes.get(3);
        calculator.set_id(CALCULATOR_ID);
        calculator
            .set_display_name("example.capnp:Calculator")
            .unwrap();
        calculator.set_scope_id(FILE_ID);
        let shape = calculator.init_interface();
        let methods = shape.init_methods(2).unwrap();

        let add = methods.get(0);
        add.set_name("add").unwrap();
        add.set_code_order(0);
        add.set_param_struct_type(ADD_PARAMS_ID);
        add.set_result_struct_type(ADD_RESULTS_ID);

        let push = methods.get(1);
        push.set_name("push").unwrap();
        push.set_code_order(1);
        push.set_param_struct_type(PUSH_PARAMS_ID);
        push.set_result_struct_type(schema::STREAM_RESULT_ID);

        let box_node = nodes.get(4);
        box_node.set_id(BOX_ID);
        box_node.set_display_name("example.capnp:Box").unwrap();
        box_node.set_scope_id(FILE_ID);
        let shape = box_node.init_struct();
        shape.set_data_word_count(0);
        shape.set_pointer_count(0);

        let add_params = nodes.get(5);
        add_params.set_id(ADD_PARAMS_ID);
        add_params
            .set_display_name("example.capnp:Calculator.add$params")
            .unwrap();
        add_params.set_scope_id(CALCULATOR_ID);
        let shape = add_params.init_struct();
        shape.set_data_word_count(1);
        shape.set_pointer_count(0);
        let fields = shape.init_fields(2).unwrap();
        for (i, field_name) in ["a", "b"].iter().enumerate() {
            let f = fields.get(i as u32);
            f.set_name(field_name).unwrap();
            let slot = f.init_slot();
            slot.set_offset(i as u32);
            slot.init_type().unwrap().set_primitive(TypeVariant::Uint32);
        }

        let add_results = nodes.get(6);
        add_results.set_id(ADD_RESULTS_ID);
        add_results
            .set_display_name("example.capnp:Calculator.add$results")
            .unwrap();
        add_results.set_scope_id(CALCULATOR_ID);
        let shape = add_results.init_struct();
        shape.set_data_word_count(0);
        shape.set_pointer_count(1);
        let fields = shape.init_fields(1).unwrap();
        let value = fields.get(0);
        value.set_name("value").unwrap();
        let slot = value.init_slot();
        slot.set_offset(0);
        slot.init_type()
            .unwrap()
            .set_interface_type(CALCULATOR_ID);

        let push_params = nodes.get(7);
        push_params.set_id(PUSH_PARAMS_ID);
        push_params
            .set_display_name("example.capnp:Calculator.push$params")
            .unwrap();
        push_params.set_scope_id(CALCULATOR_ID);
        let shape = push_params.init_struct();
        shape.set_data_word_count(1);
        shape.set_pointer_count(0);
        let fields = shape.init_fields(1).unwrap();
        let chunk = fields.get(0);
        chunk.set_name("chunk").unwrap();
        let slot = chunk.init_slot();
        slot.set_offset(0);
        slot.init_type().unwrap().set_primitive(TypeVariant::Uint32);

        let requested = root.init_requested_files(1).unwrap();
        requested.get(0).set_id(FILE_ID);
        requested.get(0).set_filename("example.capnp").unwrap();
    }
    message
}

fn generate_example() -> GeneratedFile {
    let message = build_request().into_reader();
    let request: schema::code_generator_request::Reader = message.get_root().unwrap();
    let mut files = generate(request).unwrap();
    assert_eq!(files.len(), 1);
    files.remove(0)
}

#[test]
fn struct_readers_and_defaults() {
    let file = generate_example();
    assert_eq!(file.module_name, "example_capnp");
    assert!(file.source.contains("pub mod person {"));
    assert!(file.source.contains("pub fn get_age(&self) -> u16 {"));
    // Explicit default 42 becomes an XOR mask.
    assert!(file.source.contains("self.reader.get_u16_mask(0, 42)"));
    assert!(file
        .source
        .contains("self.builder.set_u16_mask(0, value, 42);"));
    assert!(file.source.contains("pub fn get_name(&self)"));
    assert!(file
        .source
        .contains("pub fn get_color(&self) -> ::core::result::Result<crate::example_capnp::Color"));
}

#[test]
fn enums_and_annotations() {
    let file = generate_example();
    assert!(file.source.contains("pub enum Color {"));
    assert!(file.source.contains("Green = 1,"));
    assert!(file.source.contains("impl TryFrom<u16> for Color"));
    assert!(file.source.contains("PERSON_ANNOTATIONS"));
    assert!(file.source.contains("0x000000000000beef"));
    assert!(file.source.contains("\"text\""));
    assert!(file.source.contains("COLOR_ENUMERANT_ANNOTATIONS"));
    assert!(file.source.contains("\"uint16\""));
}

#[test]
fn interface_artifacts() {
    let file = generate_example();
    assert!(file.source.contains("pub mod calculator {"));
    assert!(file
        .source
        .contains("pub const INTERFACE_ID: u64 = 0xca1c;"));
    assert!(file.source.contains("pub fn from_bootstrap"));
    assert!(file.source.contains("pub fn add_request"));
    assert!(file.source.contains("pub trait Server {"));
    // Plain method: params and results.
    assert!(file.source.contains(
        "fn add(&mut self, params: add_params::Reader<'_>, results: add_results::Builder<'_>)"
    ));
    // Streaming method: no result builder, runtime acks.
    assert!(file
        .source
        .contains("fn push(&mut self, params: push_params::Reader<'_>) -> ::cornerstone::Result<()>;"));
    assert!(file.source.contains("responder.send_empty()"));
    // Anonymous param/result structs materialize with sanitized names.
    assert!(file.source.contains("pub mod add_params {"));
    assert!(file.source.contains("pub mod add_results {"));
}

#[test]
fn clients_issue_calls_and_return_promises() {
    let file = generate_example();
    // The issuing method goes through the peer and hands back a promise.
    assert!(file.source.contains("pub fn add("));
    assert!(file.source.contains("let question_id = peer.send_call("));
    assert!(file
        .source
        .contains("::cornerstone_rpc::Promise<add_results::Owned>"));
    // `add`'s results carry a capability, so its promise gets field-typed
    // pipelined accessors.
    assert!(file.source.contains("pub struct AddPromise {"));
    assert!(file.source.contains("self.promise.pipeline_field(0)"));
    // Streaming issue path: no promise, just the question id.
    assert!(file.source.contains("pub fn push("));
    assert!(file
        .source
        .contains(") -> ::cornerstone::Result<::cornerstone_rpc::QuestionId> {"));
}

#[test]
fn servers_get_a_deferred_completion_path() {
    let file = generate_example();
    assert!(file.source.contains(
        "fn add_deferred(&mut self, params: add_params::Reader<'_>, responder: ::cornerstone_rpc::ReturnSender)"
    ));
    // The default implementation completes immediately through the sync
    // handler; dispatch always routes through the deferred entry point.
    assert!(file
        .source
        .contains("responder.send_results_with(|results| self.add(params, results.init_as()?))"));
    assert!(file
        .source
        .contains("server.add_deferred(params.get_as()?, responder),"));
}

#[test]
fn keyword_type_names_are_escaped() {
    let file = generate_example();
    assert!(file.source.contains("pub mod box_ {"));
    // No schema punctuation survives into identifiers.
    assert!(!file.source.contains("$"));
}

#[test]
fn manifest_is_embedded_and_stable() {
    let first = generate_example();
    let second = generate_example();
    assert_eq!(first.source, second.source);
    assert_eq!(first.manifest_json, second.manifest_json);
    assert!(first.source.contains("pub const SCHEMA_MANIFEST"));
    assert!(first.manifest_json.contains("\"schema\": \"example.capnp\""));
    assert!(first.manifest_json.contains("\"module\": \"example_capnp\""));
    assert!(first.manifest_json.contains("person_to_json"));
    assert!(first.manifest_json.contains("person_from_json"));
}
