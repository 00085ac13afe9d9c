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

pub const BITS_PER_BYTE: u32 = 8;
pub const BITS_PER_WORD: u32 = 64;
pub const BYTES_PER_WORD: usize = 8;
pub const POINTER_SIZE_IN_WORDS: u32 = 1;

/// Rounds a bit count up to the number of bytes needed to hold it.
pub fn round_bits_up_to_bytes(bits: u64) -> u64 {
    bits.div_ceil(BITS_PER_BYTE as u64)
}

/// Rounds a bit count up to the number of words needed to hold it.
pub fn round_bits_up_to_words(bits: u64) -> u64 {
    bits.div_ceil(BITS_PER_WORD as u64)
}

/// Rounds a byte count up to the number of words needed to hold it.
pub fn round_bytes_up_to_words(bytes: u64) -> u64 {
    bytes.div_ceil(BYTES_PER_WORD as u64)
}
