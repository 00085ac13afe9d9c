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

//! # Cornerstone Runtime Library
//!
//! [Cap'n Proto](https://capnproto.org) is an extremely efficient protocol for
//! sharing data and capabilities.
//!
//! This crate is the runtime library: the zero-copy wire codec (segmented,
//! optionally packed), message readers and builders, canonicalization, and the
//! in-memory schema model consumed by the `cornerstone-gen` code generator.
//! The distributed object-capability layer lives in `cornerstone-rpc`.

pub mod any_pointer;
pub mod capability_list;
pub mod data;
pub mod data_list;
pub mod enum_list;
pub mod list_list;
pub mod message;
pub mod primitive_list;
pub mod private;
pub mod schema;
pub mod serialize;
pub mod serialize_packed;
pub mod struct_list;
pub mod text;
pub mod text_list;
pub mod traits;
pub mod validate;

/// Eight bytes of memory, the unit of Cap'n Proto layout and pointer
/// arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Word(pub u64);

impl Word {
    /// `::std::iter::repeat(Word(0)).take(length).collect()`, as one call.
    pub fn allocate_zeroed_vec(length: usize) -> Vec<Word> {
        vec![Word(0); length]
    }

    /// Copies `words` into a little-endian byte buffer. Handy for building
    /// test segments word-by-word.
    pub fn words_to_bytes(words: &[Word]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words {
            bytes.extend_from_slice(&w.0.to_le_bytes());
        }
        bytes
    }
}

/// Size of a message, as counted by `total_size()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSize {
    pub word_count: u64,

    /// Size of the capability table.
    pub cap_count: u32,
}

impl MessageSize {
    pub fn plus_eq(&mut self, other: MessageSize) {
        self.word_count += other.word_count;
        self.cap_count += other.cap_count;
    }
}

/// An enum value or union discriminant that was not found among those defined
/// in a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotInSchema(pub u16);

impl ::core::fmt::Display for NotInSchema {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(
            fmt,
            "Enum value or union discriminant {} was not present in the schema.",
            self.0
        )
    }
}

impl ::std::error::Error for NotInSchema {}

/// Because messages are lazily validated, the return type of any method that
/// reads a pointer field must be wrapped in a Result.
pub type Result<T> = ::core::result::Result<T, Error>;

/// Describes an arbitrary error that prevented an operation from completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The type of the error, chosen so that the caller can decide how to
    /// respond without parsing the message text.
    pub kind: ErrorKind,

    /// Human-readable failure description.
    pub extra: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A generic problem occurred, and it is believed that if the operation
    /// were repeated without any change in the state of the world, the problem
    /// would occur again.
    Failed,

    /// The request was rejected due to a temporary lack of resources.
    Overloaded,

    /// The method failed because a connection to some necessary capability
    /// was lost.
    Disconnected,

    /// The peer doesn't implement the requested operation.
    Unimplemented,

    /// The message ended before its segment table said it would.
    TruncatedMessage,

    /// A stream frame's segment table is malformed.
    InvalidFrame,

    /// A stream frame claims more words than the configured maximum.
    FrameTooLarge,

    /// A pointer's target does not lie within the bounds of any segment.
    PointerOutOfBounds,

    /// Cumulative words traversed exceeded the configured limit.
    TraversalLimitExceeded,

    /// Pointer-dereference depth exceeded the configured limit.
    NestingLimitExceeded,

    /// A list pointer's element size is incompatible with the expected
    /// element size.
    InvalidListElementSize,

    /// A schema node graph is malformed or self-inconsistent.
    InvalidSchema,

    /// An enum field holds a value outside the schema-declared range.
    InvalidEnumValue,

    /// A schema type that this implementation does not handle.
    UnsupportedType,

    /// A `Provide` named a recipient that already has a live provision.
    DuplicateProvideRecipient,

    /// A `ThirdPartyAnswer` named an answer id that is not live.
    InvalidThirdPartyAnswerId,

    /// A payload referenced a capability index with no cap table entry.
    MissingCapTable,

    /// An RPC message that requires a payload carried none.
    MissingPayload,

    /// An `Accept` named a recipient for which nothing was provided.
    UnknownProvision,

    /// A `Return` violated question/answer bookkeeping.
    InvalidReturnSemantics,

    /// A `Disembargo` variant other than `accept`.
    UnsupportedDisembargo,

    /// The allocator could not provide a new segment.
    AllocationFailed,
}

impl ErrorKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Overloaded => "overloaded",
            Self::Disconnected => "disconnected",
            Self::Unimplemented => "unimplemented",
            Self::TruncatedMessage => "message ended prematurely",
            Self::InvalidFrame => "invalid frame header",
            Self::FrameTooLarge => "frame exceeds size limit",
            Self::PointerOutOfBounds => "pointer out of bounds",
            Self::TraversalLimitExceeded => "read limit exceeded",
            Self::NestingLimitExceeded => "nesting limit exceeded",
            Self::InvalidListElementSize => "invalid list element size",
            Self::InvalidSchema => "invalid schema",
            Self::InvalidEnumValue => "enum value out of range",
            Self::UnsupportedType => "unsupported type",
            Self::DuplicateProvideRecipient => "duplicate provide recipient",
            Self::InvalidThirdPartyAnswerId => "invalid thirdPartyAnswer answerId",
            Self::MissingCapTable => "missing cap table entry",
            Self::MissingPayload => "missing payload",
            Self::UnknownProvision => "unknown provision",
            Self::InvalidReturnSemantics => "invalid return semantics",
            Self::UnsupportedDisembargo => "unsupported disembargo variant",
            Self::AllocationFailed => "allocation failed",
        }
    }
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            extra: String::new(),
        }
    }

    pub fn failed(extra: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            extra,
        }
    }

    pub fn unimplemented(extra: String) -> Self {
        Self {
            kind: ErrorKind::Unimplemented,
            extra,
        }
    }

    pub fn disconnected(extra: String) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            extra,
        }
    }
}

impl ::core::convert::From<::std::io::Error> for Error {
    fn from(err: ::std::io::Error) -> Self {
        let kind = match err.kind() {
            ::std::io::ErrorKind::UnexpectedEof => ErrorKind::TruncatedMessage,
            _ => ErrorKind::Failed,
        };
        Self {
            kind,
            extra: format!("{err}"),
        }
    }
}

impl ::core::convert::From<NotInSchema> for Error {
    fn from(e: NotInSchema) -> Self {
        Self {
            kind: ErrorKind::InvalidEnumValue,
            extra: format!("{e}"),
        }
    }
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if self.extra.is_empty() {
            write!(fmt, "{}", self.kind.describe())
        } else {
            write!(fmt, "{}: {}", self.kind.describe(), self.extra)
        }
    }
}

impl ::std::error::Error for Error {}
