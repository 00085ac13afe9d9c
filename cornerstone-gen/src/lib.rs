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

//! # The Cornerstone code generator
//!
//! Consumes a `CodeGeneratorRequest` message (the standard protocol spoken
//! over `capnp compile -o-`) and projects each requested schema file into a
//! Rust module plus a stable JSON manifest describing the generated types.
//!
//! The CLI driver and filesystem plumbing live elsewhere; this crate turns
//! schema bytes into source text and nothing else.

pub mod codegen;
pub mod manifest;

pub use codegen::{generate, GeneratedFile};

use cornerstone::message::ReaderOptions;
use cornerstone::Result;

/// Generates code for every requested file in a framed
/// `CodeGeneratorRequest` message.
pub fn generate_from_bytes(bytes: &[u8]) -> Result<Vec<GeneratedFile>> {
    let mut slice = bytes;
    let message = cornerstone::serialize::read_message_from_flat_slice(
        &mut slice,
        *ReaderOptions::new().traversal_limit_in_words(None),
    )?;
    let request = message.get_root()?;
    generate(request)
}
