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

//! The per-file schema manifest: a JSON document embedded in each generated
//! module, listing the schema file, the module name, and every serde-capable
//! type with its JSON export entry points.
//!
//! The manifest must be byte-identical across invocations, so entries are
//! emitted in schema declaration order and all formatting goes through one
//! serializer configuration.

use serde::Serialize;

#[derive(Serialize)]
pub struct Manifest {
    pub schema: String,
    pub module: String,
    pub serde: Vec<SerdeEntry>,
}

#[derive(Serialize)]
pub struct SerdeEntry {
    pub id: String,
    pub type_name: String,
    pub to_json_export: String,
    pub from_json_export: String,
}

impl SerdeEntry {
    pub fn new(id: u64, type_name: &str, export_stem: &str) -> Self {
        Self {
            id: format!("{id:#018x}"),
            type_name: type_name.to_string(),
            to_json_export: format!("{export_stem}_to_json"),
            from_json_export: format!("{export_stem}_from_json"),
        }
    }
}

impl Manifest {
    /// Renders the manifest. Serde struct fields serialize in declaration
    /// order and entries are pushed in schema order, so the output is
    /// deterministic.
    pub fn render(&self) -> String {
        let mut out =
            serde_json::to_string_pretty(self).expect("manifest serialization cannot fail");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_stable() {
        let manifest = Manifest {
            schema: "addressbook.capnp".into(),
            module: "addressbook_capnp".into(),
            serde: vec![
                SerdeEntry::new(0xabcd, "Person", "person"),
                SerdeEntry::new(0x1234, "AddressBook", "address_book"),
            ],
        };
        let first = manifest.render();
        let second = manifest.render();
        assert_eq!(first, second);
        assert!(first.contains("\"0x000000000000abcd\""));
        assert!(first.contains("\"person_to_json\""));
        assert!(first.ends_with('\n'));
    }
}
