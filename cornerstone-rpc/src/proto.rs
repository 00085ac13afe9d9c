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

//! The RPC message layer: typed readers and builders over the `rpc.capnp`
//! wire shapes. Inbound frames decode to one [Incoming] variant per message
//! kind; outbound frames are assembled by the `build_*` constructors.
//!
//! Layout deviations from the upstream schema, driven by the protocol
//! semantics implemented here: `Accept` carries an optional embargo *tag*
//! (text, pointer 1) that `Disembargo.accept` echoes (text, pointer 1), and
//! `ThirdPartyAnswer` sits at discriminant 14.

use cornerstone::any_pointer;
use cornerstone::message::{self, ReaderSegments};
use cornerstone::private::layout::{ElementSize, StructBuilder, StructReader, StructSize};
use cornerstone::{Error, ErrorKind, Result};

pub mod message_kind {
    pub const UNIMPLEMENTED: u16 = 0;
    pub const ABORT: u16 = 1;
    pub const CALL: u16 = 2;
    pub const RETURN: u16 = 3;
    pub const FINISH: u16 = 4;
    pub const RESOLVE: u16 = 5;
    pub const RELEASE: u16 = 6;
    pub const BOOTSTRAP: u16 = 8;
    pub const PROVIDE: u16 = 10;
    pub const ACCEPT: u16 = 11;
    pub const JOIN: u16 = 12;
    pub const DISEMBARGO: u16 = 13;
    pub const THIRD_PARTY_ANSWER: u16 = 14;
}

pub mod exception_kind {
    pub const FAILED: u16 = 0;
    pub const OVERLOADED: u16 = 1;
    pub const DISCONNECTED: u16 = 2;
    pub const UNIMPLEMENTED: u16 = 3;
}

/// One inbound protocol message, decoded into the tagged sum the peer
/// dispatches on.
pub enum Incoming<'a> {
    Unimplemented,
    Abort(Exception<'a>),
    Call(Call<'a>),
    Return(Return<'a>),
    Finish(Finish<'a>),
    Resolve(Resolve<'a>),
    Release(Release<'a>),
    Bootstrap(Bootstrap<'a>),
    Provide(Provide<'a>),
    Accept(Accept<'a>),
    Join(Join<'a>),
    Disembargo(Disembargo<'a>),
    ThirdPartyAnswer(ThirdPartyAnswer<'a>),
}

/// Decodes the root of a frame.
pub fn decode<'a, S: ReaderSegments>(message: &'a message::Reader<S>) -> Result<Incoming<'a>> {
    let root: any_pointer::Reader<'a> = message.get_root()?;
    let outer = root.get_struct()?;
    let kind = outer.get_u16(0);
    let inner = outer.get_pointer_field(0);
    Ok(match kind {
        message_kind::UNIMPLEMENTED => Incoming::Unimplemented,
        message_kind::ABORT => Incoming::Abort(Exception {
            reader: inner.get_struct()?,
        }),
        message_kind::CALL => Incoming::Call(Call {
            reader: inner.get_struct()?,
        }),
        message_kind::RETURN => Incoming::Return(Return {
            reader: inner.get_struct()?,
        }),
        message_kind::FINISH => Incoming::Finish(Finish {
            reader: inner.get_struct()?,
        }),
        message_kind::RESOLVE => Incoming::Resolve(Resolve {
            reader: inner.get_struct()?,
        }),
        message_kind::RELEASE => Incoming::Release(Release {
            reader: inner.get_struct()?,
        }),
        message_kind::BOOTSTRAP => Incoming::Bootstrap(Bootstrap {
            reader: inner.get_struct()?,
        }),
        message_kind::PROVIDE => Incoming::Provide(Provide {
            reader: inner.get_struct()?,
        }),
        message_kind::ACCEPT => Incoming::Accept(Accept {
            reader: inner.get_struct()?,
        }),
        message_kind::JOIN => Incoming::Join(Join {
            reader: inner.get_struct()?,
        }),
        message_kind::DISEMBARGO => Incoming::Disembargo(Disembargo {
            reader: inner.get_struct()?,
        }),
        message_kind::THIRD_PARTY_ANSWER => Incoming::ThirdPartyAnswer(ThirdPartyAnswer {
            reader: inner.get_struct()?,
        }),
        other => {
            return Err(Error {
                kind: ErrorKind::Failed,
                extra: format!("unrecognized message discriminant: {other}"),
            })
        }
    })
}

#[derive(Clone, Copy)]
pub struct Exception<'a> {
    reader: StructReader<'a>,
}

impl<'a> Exception<'a> {
    pub fn get_kind(&self) -> u16 {
        self.reader.get_u16(2)
    }

    pub fn get_reason(&self) -> Result<&'a str> {
        self.reader.get_pointer_field(0).get_text()
    }

    pub fn to_error(&self) -> Error {
        let kind = match self.get_kind() {
            exception_kind::OVERLOADED => ErrorKind::Overloaded,
            exception_kind::DISCONNECTED => ErrorKind::Disconnected,
            exception_kind::UNIMPLEMENTED => ErrorKind::Unimplemented,
            _ => ErrorKind::Failed,
        };
        Error {
            kind,
            extra: self.get_reason().unwrap_or("<unreadable reason>").to_string(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Call<'a> {
    reader: StructReader<'a>,
}

impl<'a> Call<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_method_id(&self) -> u16 {
        self.reader.get_u16(2)
    }

    pub fn get_interface_id(&self) -> u64 {
        self.reader.get_u64(1)
    }

    pub fn get_target(&self) -> Result<MessageTarget<'a>> {
        Ok(MessageTarget {
            reader: self.reader.get_pointer_field(0).get_struct()?,
        })
    }

    pub fn get_params(&self) -> Result<Payload<'a>> {
        if self.reader.get_pointer_field(1).is_null() {
            return Err(Error::from_kind(ErrorKind::MissingPayload));
        }
        Ok(Payload {
            reader: self.reader.get_pointer_field(1).get_struct()?,
        })
    }
}

#[derive(Clone, Copy)]
pub struct Return<'a> {
    reader: StructReader<'a>,
}

pub enum ReturnWhich<'a> {
    Results(Payload<'a>),
    Exception(Exception<'a>),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(u32),
    AcceptFromThirdParty(any_pointer::Reader<'a>),
}

impl<'a> Return<'a> {
    pub fn get_answer_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_release_param_caps(&self) -> bool {
        // Defaults to true, hence the mask.
        self.reader.get_bool_field_mask(32, true)
    }

    pub fn which(&self) -> Result<ReturnWhich<'a>> {
        Ok(match self.reader.get_u16(3) {
            0 => ReturnWhich::Results(Payload {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            1 => ReturnWhich::Exception(Exception {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            2 => ReturnWhich::Canceled,
            3 => ReturnWhich::ResultsSentElsewhere,
            4 => ReturnWhich::TakeFromOtherQuestion(self.reader.get_u32(2)),
            5 => ReturnWhich::AcceptFromThirdParty(any_pointer::Reader::new(
                self.reader.get_pointer_field(0),
            )),
            other => {
                return Err(Error {
                    kind: ErrorKind::InvalidReturnSemantics,
                    extra: format!("unknown return variant: {other}"),
                })
            }
        })
    }
}

#[derive(Clone, Copy)]
pub struct Finish<'a> {
    reader: StructReader<'a>,
}

impl<'a> Finish<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_release_result_caps(&self) -> bool {
        self.reader.get_bool_field_mask(32, true)
    }
}

#[derive(Clone, Copy)]
pub struct Resolve<'a> {
    reader: StructReader<'a>,
}

pub enum ResolveWhich<'a> {
    Cap(CapDescriptor<'a>),
    Exception(Exception<'a>),
}

impl<'a> Resolve<'a> {
    pub fn get_promise_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn which(&self) -> Result<ResolveWhich<'a>> {
        Ok(match self.reader.get_u16(2) {
            0 => ResolveWhich::Cap(CapDescriptor {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            1 => ResolveWhich::Exception(Exception {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            other => {
                return Err(Error {
                    kind: ErrorKind::Failed,
                    extra: format!("unknown resolve variant: {other}"),
                })
            }
        })
    }
}

#[derive(Clone, Copy)]
pub struct Release<'a> {
    reader: StructReader<'a>,
}

impl<'a> Release<'a> {
    pub fn get_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_reference_count(&self) -> u32 {
        self.reader.get_u32(1)
    }
}

#[derive(Clone, Copy)]
pub struct Bootstrap<'a> {
    reader: StructReader<'a>,
}

impl<'a> Bootstrap<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }
}

#[derive(Clone, Copy)]
pub struct Provide<'a> {
    reader: StructReader<'a>,
}

impl<'a> Provide<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_target(&self) -> Result<MessageTarget<'a>> {
        Ok(MessageTarget {
            reader: self.reader.get_pointer_field(0).get_struct()?,
        })
    }

    pub fn get_recipient(&self) -> any_pointer::Reader<'a> {
        any_pointer::Reader::new(self.reader.get_pointer_field(1))
    }
}

#[derive(Clone, Copy)]
pub struct Accept<'a> {
    reader: StructReader<'a>,
}

impl<'a> Accept<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_provision(&self) -> any_pointer::Reader<'a> {
        any_pointer::Reader::new(self.reader.get_pointer_field(0))
    }

    /// The embargo tag, or `None` when the accept is not embargoed.
    pub fn get_embargo_tag(&self) -> Result<Option<&'a str>> {
        let pointer = self.reader.get_pointer_field(1);
        if pointer.is_null() {
            Ok(None)
        } else {
            Ok(Some(pointer.get_text()?))
        }
    }
}

#[derive(Clone, Copy)]
pub struct Join<'a> {
    reader: StructReader<'a>,
}

impl<'a> Join<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_key_part(&self) -> any_pointer::Reader<'a> {
        any_pointer::Reader::new(self.reader.get_pointer_field(1))
    }

    /// Reads `partCount` out of the key part, treating it as a join key
    /// struct; zero or one means a single-part join.
    pub fn get_key_part_count(&self) -> Result<u16> {
        let pointer = self.reader.get_pointer_field(1);
        if pointer.is_null() {
            return Ok(1);
        }
        Ok(pointer.get_struct()?.get_u16(2))
    }
}

#[derive(Clone, Copy)]
pub struct Disembargo<'a> {
    reader: StructReader<'a>,
}

pub enum DisembargoWhich<'a> {
    SenderLoopback(u32),
    ReceiverLoopback(u32),
    Accept(&'a str),
    Provide(u32),
}

impl<'a> Disembargo<'a> {
    pub fn which(&self) -> Result<DisembargoWhich<'a>> {
        Ok(match self.reader.get_u16(2) {
            0 => DisembargoWhich::SenderLoopback(self.reader.get_u32(0)),
            1 => DisembargoWhich::ReceiverLoopback(self.reader.get_u32(0)),
            2 => DisembargoWhich::Accept(self.reader.get_pointer_field(1).get_text()?),
            3 => DisembargoWhich::Provide(self.reader.get_u32(0)),
            other => {
                return Err(Error {
                    kind: ErrorKind::UnsupportedDisembargo,
                    extra: format!("unknown disembargo variant: {other}"),
                })
            }
        })
    }
}

#[derive(Clone, Copy)]
pub struct ThirdPartyAnswer<'a> {
    reader: StructReader<'a>,
}

impl<'a> ThirdPartyAnswer<'a> {
    pub fn get_answer_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    pub fn get_completion(&self) -> any_pointer::Reader<'a> {
        any_pointer::Reader::new(self.reader.get_pointer_field(0))
    }
}

#[derive(Clone, Copy)]
pub struct MessageTarget<'a> {
    reader: StructReader<'a>,
}

pub enum TargetWhich<'a> {
    ImportedCap(u32),
    PromisedAnswer(PromisedAnswer<'a>),
}

impl<'a> MessageTarget<'a> {
    pub fn which(&self) -> Result<TargetWhich<'a>> {
        Ok(match self.reader.get_u16(2) {
            0 => TargetWhich::ImportedCap(self.reader.get_u32(0)),
            1 => TargetWhich::PromisedAnswer(PromisedAnswer {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            other => {
                return Err(Error {
                    kind: ErrorKind::Failed,
                    extra: format!("unknown call target variant: {other}"),
                })
            }
        })
    }
}

#[derive(Clone, Copy)]
pub struct PromisedAnswer<'a> {
    reader: StructReader<'a>,
}

impl<'a> PromisedAnswer<'a> {
    pub fn get_question_id(&self) -> u32 {
        self.reader.get_u32(0)
    }

    /// Copies the transform ops out of the frame.
    pub fn get_ops(&self) -> Result<Vec<crate::PipelineOp>> {
        let pointer = self.reader.get_pointer_field(0);
        if pointer.is_null() {
            return Ok(Vec::new());
        }
        let list = pointer.get_list(ElementSize::InlineComposite)?;
        let mut ops = Vec::with_capacity(list.len() as usize);
        for i in 0..list.len() {
            let op = list.get_struct_element(i);
            match op.get_u16(0) {
                0 => ops.push(crate::PipelineOp::Noop),
                1 => ops.push(crate::PipelineOp::GetPointerField(op.get_u16(1))),
                other => {
                    return Err(Error {
                        kind: ErrorKind::Failed,
                        extra: format!("unknown promised-answer op: {other}"),
                    })
                }
            }
        }
        Ok(ops)
    }
}

#[derive(Clone, Copy)]
pub struct Payload<'a> {
    reader: StructReader<'a>,
}

impl<'a> Payload<'a> {
    pub fn get_content(&self) -> any_pointer::Reader<'a> {
        any_pointer::Reader::new(self.reader.get_pointer_field(0))
    }

    pub fn get_cap_table(&self) -> Result<Vec<CapDescriptor<'a>>> {
        let pointer = self.reader.get_pointer_field(1);
        if pointer.is_null() {
            return Ok(Vec::new());
        }
        let list = pointer.get_list(ElementSize::InlineComposite)?;
        let mut descriptors = Vec::with_capacity(list.len() as usize);
        for i in 0..list.len() {
            descriptors.push(CapDescriptor {
                reader: list.get_struct_element(i),
            });
        }
        Ok(descriptors)
    }
}

#[derive(Clone, Copy)]
pub struct CapDescriptor<'a> {
    reader: StructReader<'a>,
}

pub enum CapDescriptorWhich<'a> {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer(PromisedAnswer<'a>),
    ThirdPartyHosted(any_pointer::Reader<'a>),
}

impl<'a> CapDescriptor<'a> {
    pub fn which(&self) -> Result<CapDescriptorWhich<'a>> {
        Ok(match self.reader.get_u16(0) {
            0 => CapDescriptorWhich::None,
            1 => CapDescriptorWhich::SenderHosted(self.reader.get_u32(1)),
            2 => CapDescriptorWhich::SenderPromise(self.reader.get_u32(1)),
            3 => CapDescriptorWhich::ReceiverHosted(self.reader.get_u32(1)),
            4 => CapDescriptorWhich::ReceiverAnswer(PromisedAnswer {
                reader: self.reader.get_pointer_field(0).get_struct()?,
            }),
            5 => CapDescriptorWhich::ThirdPartyHosted(any_pointer::Reader::new(
                self.reader.get_pointer_field(0),
            )),
            other => {
                return Err(Error {
                    kind: ErrorKind::MissingCapTable,
                    extra: format!("unknown cap descriptor variant: {other}"),
                })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Outbound construction
// ---------------------------------------------------------------------------

const MESSAGE_SIZE: StructSize = StructSize {
    data: 1,
    pointers: 1,
};
const CALL_SIZE: StructSize = StructSize {
    data: 3,
    pointers: 3,
};
const RETURN_SIZE: StructSize = StructSize {
    data: 2,
    pointers: 1,
};
const ONE_WORD: StructSize = StructSize {
    data: 1,
    pointers: 0,
};
const ONE_WORD_ONE_POINTER: StructSize = StructSize {
    data: 1,
    pointers: 1,
};
const ONE_WORD_TWO_POINTERS: StructSize = StructSize {
    data: 1,
    pointers: 2,
};
const EXCEPTION_SIZE: StructSize = StructSize {
    data: 1,
    pointers: 1,
};
const PAYLOAD_SIZE: StructSize = StructSize {
    data: 0,
    pointers: 2,
};
const CAP_DESCRIPTOR_SIZE: StructSize = StructSize {
    data: 1,
    pointers: 1,
};
const PROMISED_ANSWER_SIZE: StructSize = StructSize {
    data: 1,
    pointers: 1,
};
const PIPELINE_OP_SIZE: StructSize = StructSize {
    data: 1,
    pointers: 0,
};

/// Builds a one-struct message with the given discriminant, handing the
/// variant struct to `fill`.
fn build_message(
    kind: u16,
    size: StructSize,
    fill: impl FnOnce(StructBuilder<'_>) -> Result<()>,
) -> Result<Vec<u8>> {
    let mut message = message::Builder::new_default();
    {
        let root: any_pointer::Builder = message.init_root()?;
        let outer = root.init_struct(MESSAGE_SIZE)?;
        outer.set_u16(0, kind);
        let inner = outer.get_pointer_field(0).init_struct(size)?;
        fill(inner)?;
    }
    Ok(cornerstone::serialize::write_message_to_words(&message))
}

pub fn build_abort(kind: u16, reason: &str) -> Result<Vec<u8>> {
    build_message(message_kind::ABORT, EXCEPTION_SIZE, |exception| {
        exception.set_u16(2, kind);
        exception.get_pointer_field(0).set_text(reason)
    })
}

pub fn build_finish(question_id: u32, release_result_caps: bool) -> Result<Vec<u8>> {
    build_message(message_kind::FINISH, ONE_WORD, |finish| {
        finish.set_u32(0, question_id);
        finish.set_bool_field_mask(32, release_result_caps, true);
        Ok(())
    })
}

pub fn build_release(id: u32, reference_count: u32) -> Result<Vec<u8>> {
    build_message(message_kind::RELEASE, ONE_WORD, |release| {
        release.set_u32(0, id);
        release.set_u32(1, reference_count);
        Ok(())
    })
}

pub fn build_bootstrap(question_id: u32) -> Result<Vec<u8>> {
    build_message(message_kind::BOOTSTRAP, ONE_WORD_ONE_POINTER, |bootstrap| {
        bootstrap.set_u32(0, question_id);
        Ok(())
    })
}

pub fn build_return_exception(answer_id: u32, kind: u16, reason: &str) -> Result<Vec<u8>> {
    build_message(message_kind::RETURN, RETURN_SIZE, |ret| {
        ret.set_u32(0, answer_id);
        ret.set_bool_field_mask(32, false, true);
        ret.set_u16(3, 1);
        let exception = ret.get_pointer_field(0).init_struct(EXCEPTION_SIZE)?;
        exception.set_u16(2, kind);
        exception.get_pointer_field(0).set_text(reason)
    })
}

/// A descriptor to emit into a payload's cap table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutDescriptor {
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
}

pub fn write_descriptor(builder: StructBuilder<'_>, descriptor: OutDescriptor) {
    match descriptor {
        OutDescriptor::SenderHosted(id) => {
            builder.set_u16(0, 1);
            builder.set_u32(1, id);
        }
        OutDescriptor::SenderPromise(id) => {
            builder.set_u16(0, 2);
            builder.set_u32(1, id);
        }
        OutDescriptor::ReceiverHosted(id) => {
            builder.set_u16(0, 3);
            builder.set_u32(1, id);
        }
    }
}

fn write_payload_caps(payload: &StructBuilder<'_>, descriptors: &[OutDescriptor]) -> Result<()> {
    let list = payload
        .get_pointer_field(1)
        .init_struct_list(descriptors.len() as u32, CAP_DESCRIPTOR_SIZE)?;
    for (i, descriptor) in descriptors.iter().enumerate() {
        write_descriptor(list.get_struct_element(i as u32), *descriptor);
    }
    Ok(())
}

/// Builds a `Return` whose results payload carries exactly one capability,
/// referenced by the content pointer.
pub fn build_return_cap(answer_id: u32, descriptor: OutDescriptor) -> Result<Vec<u8>> {
    build_message(message_kind::RETURN, RETURN_SIZE, |ret| {
        ret.set_u32(0, answer_id);
        ret.set_bool_field_mask(32, false, true);
        ret.set_u16(3, 0);
        let payload = ret.get_pointer_field(0).init_struct(PAYLOAD_SIZE)?;
        payload.get_pointer_field(0).set_capability(0);
        write_payload_caps(&payload, &[descriptor])
    })
}

/// Builds a `Return` with results copied from `content`, rewriting cap
/// pointers through `cap_map` and attaching `descriptors`.
pub fn build_return_results(
    answer_id: u32,
    content: cornerstone::private::layout::PointerReader<'_>,
    cap_map: &mut dyn FnMut(u32) -> Result<u32>,
    descriptors: &[OutDescriptor],
) -> Result<Vec<u8>> {
    build_message(message_kind::RETURN, RETURN_SIZE, |ret| {
        ret.set_u32(0, answer_id);
        ret.set_bool_field_mask(32, false, true);
        ret.set_u16(3, 0);
        let payload = ret.get_pointer_field(0).init_struct(PAYLOAD_SIZE)?;
        payload.get_pointer_field(0).copy_from_mapped(content, cap_map)?;
        write_payload_caps(&payload, descriptors)
    })
}

/// Target of an outbound call, already lowered to wire terms.
pub enum OutTarget<'a> {
    ImportedCap(u32),
    PromisedAnswer {
        question_id: u32,
        ops: &'a [crate::PipelineOp],
    },
}

fn write_target(target_builder: StructBuilder<'_>, target: &OutTarget<'_>) -> Result<()> {
    match target {
        OutTarget::ImportedCap(id) => {
            target_builder.set_u16(2, 0);
            target_builder.set_u32(0, *id);
        }
        OutTarget::PromisedAnswer { question_id, ops } => {
            target_builder.set_u16(2, 1);
            let promised = target_builder
                .get_pointer_field(0)
                .init_struct(PROMISED_ANSWER_SIZE)?;
            promised.set_u32(0, *question_id);
            let list = promised
                .get_pointer_field(0)
                .init_struct_list(ops.len() as u32, PIPELINE_OP_SIZE)?;
            for (i, op) in ops.iter().enumerate() {
                let out = list.get_struct_element(i as u32);
                match op {
                    crate::PipelineOp::Noop => out.set_u16(0, 0),
                    crate::PipelineOp::GetPointerField(index) => {
                        out.set_u16(0, 1);
                        out.set_u16(1, *index);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Builds a `Call`, copying params from `content` with cap rewriting.
#[allow(clippy::too_many_arguments)]
pub fn build_call(
    question_id: u32,
    interface_id: u64,
    method_id: u16,
    target: &OutTarget<'_>,
    content: cornerstone::private::layout::PointerReader<'_>,
    cap_map: &mut dyn FnMut(u32) -> Result<u32>,
    descriptors: &[OutDescriptor],
) -> Result<Vec<u8>> {
    build_message(message_kind::CALL, CALL_SIZE, |call| {
        call.set_u32(0, question_id);
        call.set_u16(2, method_id);
        call.set_u64(1, interface_id);
        write_target(call.get_pointer_field(0).init_struct(ONE_WORD_ONE_POINTER)?, target)?;
        let payload = call.get_pointer_field(1).init_struct(PAYLOAD_SIZE)?;
        payload.get_pointer_field(0).copy_from_mapped(content, cap_map)?;
        write_payload_caps(&payload, descriptors)
    })
}

pub fn build_provide(
    question_id: u32,
    target: &OutTarget<'_>,
    recipient: cornerstone::private::layout::PointerReader<'_>,
) -> Result<Vec<u8>> {
    build_message(message_kind::PROVIDE, ONE_WORD_TWO_POINTERS, |provide| {
        provide.set_u32(0, question_id);
        write_target(
            provide.get_pointer_field(0).init_struct(ONE_WORD_ONE_POINTER)?,
            target,
        )?;
        provide.get_pointer_field(1).copy_from(recipient, false)
    })
}

pub fn build_accept(
    question_id: u32,
    provision: cornerstone::private::layout::PointerReader<'_>,
    embargo_tag: Option<&str>,
) -> Result<Vec<u8>> {
    build_message(message_kind::ACCEPT, ONE_WORD_TWO_POINTERS, |accept| {
        accept.set_u32(0, question_id);
        accept.get_pointer_field(0).copy_from(provision, false)?;
        if let Some(tag) = embargo_tag {
            accept.get_pointer_field(1).set_text(tag)?;
        }
        Ok(())
    })
}

pub fn build_disembargo_accept(tag: &str) -> Result<Vec<u8>> {
    build_message(message_kind::DISEMBARGO, ONE_WORD_TWO_POINTERS, |disembargo| {
        disembargo.set_u16(2, 2);
        disembargo.get_pointer_field(1).set_text(tag)
    })
}

pub fn build_join(
    question_id: u32,
    key_part: cornerstone::private::layout::PointerReader<'_>,
) -> Result<Vec<u8>> {
    build_message(message_kind::JOIN, ONE_WORD_TWO_POINTERS, |join| {
        join.set_u32(0, question_id);
        join.get_pointer_field(1).copy_from(key_part, false)
    })
}

pub fn build_disembargo_sender_loopback(embargo_id: u32) -> Result<Vec<u8>> {
    build_message(message_kind::DISEMBARGO, ONE_WORD_TWO_POINTERS, |disembargo| {
        disembargo.set_u16(2, 0);
        disembargo.set_u32(0, embargo_id);
        Ok(())
    })
}

/// Builds a `Resolve` carrying a cap descriptor for a promise import.
pub fn build_resolve_cap(promise_id: u32, descriptor: OutDescriptor) -> Result<Vec<u8>> {
    build_message(message_kind::RESOLVE, ONE_WORD_ONE_POINTER, |resolve| {
        resolve.set_u32(0, promise_id);
        resolve.set_u16(2, 0);
        let cap = resolve.get_pointer_field(0).init_struct(CAP_DESCRIPTOR_SIZE)?;
        write_descriptor(cap, descriptor);
        Ok(())
    })
}

pub fn build_third_party_answer(answer_id: u32) -> Result<Vec<u8>> {
    build_message(
        message_kind::THIRD_PARTY_ANSWER,
        ONE_WORD_ONE_POINTER,
        |tpa| {
            tpa.set_u32(0, answer_id);
            Ok(())
        },
    )
}
