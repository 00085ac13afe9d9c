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

//! The connection state machine: one [Peer] per connection, driven entirely
//! by [Peer::handle_frame]. The peer never blocks and never performs I/O;
//! outbound frames go through the host's `send_frame` hook, and inbound calls
//! are dispatched through the host's call handler, which completes each
//! answer by consuming a [ReturnSender] (immediately or later).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use cornerstone::any_pointer;
use cornerstone::message::{self, ReaderOptions};
use cornerstone::private::layout::PointerReader;
use cornerstone::{Error, ErrorKind, Result};

use crate::proto::{self, exception_kind, Incoming, OutDescriptor, OutTarget};
use crate::table::{Export, Import, ImportResolution, ImportTable, ReceiverAnswerStore, SlotTable};

pub type QuestionId = u32;
pub type AnswerId = u32;
pub type ExportId = u32;
pub type ImportId = u32;

/// One step of a promised-answer transform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// Where a call is directed.
#[derive(Clone, Debug)]
pub enum CallTarget {
    /// A capability the peer hosts, named by its export id on that side.
    Import(ImportId),
    /// A capability this vat hosts. Usable only for local dispatch; it has
    /// no wire encoding as a call target.
    Export(ExportId),
    /// The (future) result of an outstanding question.
    PromisedAnswer {
        question_id: QuestionId,
        ops: Vec<PipelineOp>,
    },
}

impl CallTarget {
    pub fn promised(question_id: QuestionId, ops: Vec<PipelineOp>) -> Self {
        Self::PromisedAnswer { question_id, ops }
    }
}

/// A method address produced by generated clients.
#[derive(Clone, Debug)]
pub struct Request {
    pub target: CallTarget,
    pub interface_id: u64,
    pub method_id: u16,
}

impl Request {
    pub fn new(target: CallTarget, interface_id: u64, method_id: u16) -> Self {
        Self {
            target,
            interface_id,
            method_id,
        }
    }
}

/// The eventual results of an issued call. Accessors build promised-answer
/// call targets, so further calls can address the results before the return
/// arrives; generated clients wrap this with field-typed accessors. `T` is
/// the results type's `Owned` marker and carries no data.
pub struct Promise<T> {
    question_id: QuestionId,
    marker: ::core::marker::PhantomData<T>,
}

impl<T> Promise<T> {
    pub fn new(question_id: QuestionId) -> Self {
        Self {
            question_id,
            marker: ::core::marker::PhantomData,
        }
    }

    pub fn question_id(&self) -> QuestionId {
        self.question_id
    }

    /// A call target addressing the capability stored in pointer field
    /// `pointer_index` of the eventual results.
    pub fn pipeline_field(&self, pointer_index: u16) -> CallTarget {
        CallTarget::promised(
            self.question_id,
            vec![PipelineOp::GetPointerField(pointer_index)],
        )
    }

    /// A call target for an arbitrary transform into the eventual results.
    pub fn pipeline(&self, ops: Vec<PipelineOp>) -> CallTarget {
        CallTarget::promised(self.question_id, ops)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self::new(self.question_id)
    }
}

impl<T> Copy for Promise<T> {}

/// Raw cap-table references for outbound payloads: the value written with
/// `set_capability` encodes what the capability is, and payload encoding
/// rewrites it to a dense index plus a descriptor.
pub mod payload_cap {
    const IMPORT_BIT: u32 = 0x8000_0000;

    /// References one of this vat's exports.
    pub fn export(id: super::ExportId) -> u32 {
        debug_assert!(id & IMPORT_BIT == 0);
        id
    }

    /// References a capability imported from the receiver, producing a
    /// `receiverHosted` descriptor with the original import id.
    pub fn import(id: super::ImportId) -> u32 {
        debug_assert!(id & IMPORT_BIT == 0);
        id | IMPORT_BIT
    }

    pub(crate) fn split(raw: u32) -> (bool, u32) {
        (raw & IMPORT_BIT != 0, raw & !IMPORT_BIT)
    }
}

/// One entry of an inbound payload's capability table, translated into this
/// vat's terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundCap {
    None,
    /// Hosted by the sender; `id` is now a live import.
    SenderHosted(ImportId),
    /// A promise hosted by the sender, subject to a later `Resolve`.
    SenderPromise(ImportId),
    /// One of this vat's own exports, reflected back.
    ReceiverHosted(ExportId),
    /// A pointer into one of this vat's outstanding answers; the transform
    /// ops live in stable storage under this handle.
    ReceiverAnswer(u32),
}

/// The capability table attached to an inbound call, with retain-or-release
/// semantics: entries not retained are released when this is dropped.
pub struct InboundCaps {
    state: Weak<RefCell<PeerState>>,
    entries: Vec<InboundCap>,
    retained: RefCell<Vec<bool>>,
}

impl InboundCaps {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Result<&InboundCap> {
        self.entries
            .get(index as usize)
            .ok_or_else(|| Error::from_kind(ErrorKind::MissingCapTable))
    }

    /// Resolves a cap-table index to a call target and keeps the underlying
    /// reference alive past this call's lifetime.
    pub fn retain(&self, index: u32) -> Result<CallTarget> {
        let cap = self.get(index)?.clone();
        if let Some(flag) = self.retained.borrow_mut().get_mut(index as usize) {
            *flag = true;
        }
        match cap {
            InboundCap::SenderHosted(id) | InboundCap::SenderPromise(id) => {
                Ok(CallTarget::Import(id))
            }
            InboundCap::ReceiverHosted(id) => {
                if let Some(state) = self.state.upgrade() {
                    if let Some(export) = state.borrow_mut().exports.get_mut(id) {
                        export.refcount += 1;
                    }
                }
                Ok(CallTarget::Export(id))
            }
            InboundCap::ReceiverAnswer(handle) => {
                let state = self
                    .state
                    .upgrade()
                    .ok_or_else(|| Error::disconnected("connection is gone".into()))?;
                let state = state.borrow();
                let stored = state
                    .receiver_answers
                    .get(handle)
                    .ok_or_else(|| Error::from_kind(ErrorKind::MissingCapTable))?;
                Ok(CallTarget::PromisedAnswer {
                    question_id: stored.answer_id,
                    ops: stored.ops.clone(),
                })
            }
            InboundCap::None => Err(Error::from_kind(ErrorKind::MissingCapTable)),
        }
    }
}

impl Drop for InboundCaps {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        {
            let mut s = state.borrow_mut();
            let retained = self.retained.borrow();
            for (i, cap) in self.entries.iter().enumerate() {
                if retained.get(i).copied().unwrap_or(false) {
                    continue;
                }
                if let InboundCap::SenderHosted(id) | InboundCap::SenderPromise(id) = cap {
                    s.release_import(*id, 1);
                }
            }
        }
        flush(&state);
    }
}

/// An inbound call, as handed to the host's call handler.
pub struct CallContext<'a> {
    pub interface_id: u64,
    pub method_id: u16,
    /// The export the call is addressed to.
    pub target: ExportId,
    pub params: any_pointer::Reader<'a>,
    pub caps: InboundCaps,
}

/// Completion token for an inbound call. The handler may consume it
/// immediately or hold it and complete the answer later; either way,
/// consuming it emits the `Return` frame (unless the answer was finished in
/// the meantime, in which case nothing is emitted).
pub struct ReturnSender {
    state: Weak<RefCell<PeerState>>,
    answer_id: AnswerId,
}

impl ReturnSender {
    pub fn answer_id(&self) -> AnswerId {
        self.answer_id
    }

    /// Completes the answer with results built by `build`. Capability
    /// pointers in the results use [payload_cap] references.
    pub fn send_results_with(
        self,
        build: impl FnOnce(any_pointer::Builder<'_>) -> Result<()>,
    ) -> Result<()> {
        let Some(state) = self.state.upgrade() else {
            return Ok(());
        };
        let mut scratch = message::Builder::new_default();
        {
            let root: any_pointer::Builder = scratch.init_root()?;
            build(root)?;
        }
        let scratch = scratch.into_reader();
        let content: any_pointer::Reader = scratch.get_root()?;

        let pending = {
            let mut guard = state.borrow_mut();
            let s = &mut *guard;
            if s.dead.is_some() {
                return Err(Error::disconnected("connection was aborted".into()));
            }
            let Some(answer) = s.answers.get(&self.answer_id) else {
                // Finished while the handler held the sender.
                return Ok(());
            };
            if matches!(answer.state, AnswerState::Returned) {
                return Err(Error::from_kind(ErrorKind::InvalidReturnSemantics));
            }
            let answer_id = self.answer_id;
            let content_reader = content.reader();
            let (frame, result_exports) =
                encode_with_caps(&mut s.exports, &mut |cap_map, descriptors| {
                    proto::build_return_results(answer_id, content_reader, cap_map, descriptors)
                })?;
            let answer = s.answers.get_mut(&self.answer_id).expect("checked above");
            answer.state = AnswerState::Returned;
            answer.results_frame = Some(frame.clone());
            answer.result_exports = result_exports;
            let pending = std::mem::take(&mut answer.pending_calls);
            s.outbox.push(frame);
            pending
        };
        flush(&state);
        for frame in pending {
            let _ = process_frame(&state, &frame);
        }
        flush(&state);
        Ok(())
    }

    /// Completes the answer with an empty struct, as the runtime does for
    /// each acknowledged segment of a streaming method.
    pub fn send_empty(self) -> Result<()> {
        self.send_results_with(|_| Ok(()))
    }

    /// Completes the answer with an exception. Handler errors never
    /// terminate the connection.
    pub fn send_exception(self, error: Error) -> Result<()> {
        let Some(state) = self.state.upgrade() else {
            return Ok(());
        };
        let pending = {
            let mut s = state.borrow_mut();
            let Some(answer) = s.answers.get_mut(&self.answer_id) else {
                return Ok(());
            };
            if matches!(answer.state, AnswerState::Returned) {
                return Err(Error::from_kind(ErrorKind::InvalidReturnSemantics));
            }
            answer.state = AnswerState::Returned;
            let pending = std::mem::take(&mut answer.pending_calls);
            let frame = proto::build_return_exception(
                self.answer_id,
                exception_code(error.kind),
                &error.to_string(),
            )?;
            s.outbox.push(frame);
            pending
        };
        flush(&state);
        for frame in pending {
            let _ = process_frame(&state, &frame);
        }
        flush(&state);
        Ok(())
    }
}

/// Results of a completed outbound call, copied out of the return frame so
/// they outlive it.
pub struct Response {
    message: message::Reader<message::Segments>,
    pub caps: Vec<InboundCap>,
}

impl Response {
    pub fn results(&self) -> Result<any_pointer::Reader<'_>> {
        self.message.get_root()
    }
}

type OnReturn = Box<dyn FnOnce(Result<Response>)>;
type CallHandler = Box<dyn FnMut(CallContext<'_>, ReturnSender) -> Result<()>>;
type SendFrame = Box<dyn FnMut(&[u8])>;

enum AnswerState {
    /// Handed to the call handler; a `ReturnSender` is outstanding.
    Dispatched,
    /// The return frame has been emitted (or the answer is a completed
    /// accept/bootstrap).
    Returned,
    /// An accepted provision waiting for its disembargo.
    Embargoed,
    /// A `Provide` question: no return is ever emitted.
    Provide,
}

struct Answer {
    state: AnswerState,
    /// The emitted return frame, kept for promised-answer resolution.
    results_frame: Option<Vec<u8>>,
    /// Exports referenced by the emitted return, for `Finish` release.
    result_exports: Vec<ExportId>,
    /// Calls that arrived before this answer completed, replayed in order.
    pending_calls: Vec<Vec<u8>>,
    /// Copied third-party completion payload.
    third_party: Option<Vec<u8>>,
}

impl Answer {
    fn new(state: AnswerState) -> Self {
        Self {
            state,
            results_frame: None,
            result_exports: Vec::new(),
            pending_calls: Vec::new(),
            third_party: None,
        }
    }
}

struct Question {
    on_return: Option<OnReturn>,
    /// Exports sent in this call's params, released if the peer's return
    /// asks for it.
    param_exports: Vec<ExportId>,
}

struct Provision {
    export_id: ExportId,
    provide_question: AnswerId,
}

struct Embargo {
    answer_id: AnswerId,
    export_id: ExportId,
    pending_calls: Vec<Vec<u8>>,
}

struct PeerState {
    sink: Option<SendFrame>,
    handler: Option<CallHandler>,
    outbox: Vec<Vec<u8>>,
    bootstrap_export: Option<ExportId>,

    exports: SlotTable<Export>,
    imports: ImportTable,
    questions: SlotTable<Question>,
    answers: HashMap<AnswerId, Answer>,
    provisions: HashMap<Vec<u8>, Provision>,
    embargoes: HashMap<String, Embargo>,
    receiver_answers: ReceiverAnswerStore,

    dead: Option<Error>,
}

impl PeerState {
    fn release_export(&mut self, id: ExportId, count: u32) {
        if let Some(export) = self.exports.get_mut(id) {
            export.refcount = export.refcount.saturating_sub(count);
            if export.refcount == 0 {
                self.exports.erase(id);
                debug!(export = id, "export fully released");
            }
        }
    }

    /// Gives back `count` references on an import, telling the peer so, and
    /// drops the table entry once none remain.
    fn release_import(&mut self, id: ImportId, count: u32) {
        if let Some(import) = self.imports.get_mut(&id) {
            let released = count.min(import.refcount);
            if released == 0 {
                return;
            }
            import.refcount -= released;
            let gone = import.refcount == 0;
            if gone {
                self.imports.remove(&id);
            }
            if let Ok(frame) = proto::build_release(id, released) {
                self.outbox.push(frame);
            }
        }
    }
}

/// Rewrites raw payload cap references to dense indices, recording the
/// descriptor for each newly-encountered reference.
#[derive(Default)]
struct CapEncoder {
    seen: HashMap<u32, u32>,
    descriptors: Vec<OutDescriptor>,
    exports_touched: Vec<ExportId>,
}

impl CapEncoder {
    fn map(&mut self, exports: &mut SlotTable<Export>, raw: u32) -> Result<u32> {
        if let Some(&dense) = self.seen.get(&raw) {
            return Ok(dense);
        }
        let (is_import, id) = payload_cap::split(raw);
        let descriptor = if is_import {
            OutDescriptor::ReceiverHosted(id)
        } else {
            let export = exports
                .get_mut(id)
                .ok_or_else(|| Error::from_kind(ErrorKind::MissingCapTable))?;
            // Note the outbound reference before the frame is sent, so the
            // peer's eventual Release finds a consistent count.
            export.refcount += 1;
            self.exports_touched.push(id);
            if export.is_promise {
                OutDescriptor::SenderPromise(id)
            } else {
                OutDescriptor::SenderHosted(id)
            }
        };
        let dense = self.descriptors.len() as u32;
        self.descriptors.push(descriptor);
        self.seen.insert(raw, dense);
        Ok(dense)
    }
}

/// A single RPC connection endpoint.
pub struct Peer {
    state: Rc<RefCell<PeerState>>,
}

impl Peer {
    pub fn new(send_frame: impl FnMut(&[u8]) + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(PeerState {
                sink: Some(Box::new(send_frame)),
                handler: None,
                outbox: Vec::new(),
                bootstrap_export: None,
                exports: SlotTable::new(),
                imports: HashMap::new(),
                questions: SlotTable::new(),
                answers: HashMap::new(),
                provisions: HashMap::new(),
                embargoes: HashMap::new(),
                receiver_answers: ReceiverAnswerStore::new(),
                dead: None,
            })),
        }
    }

    /// Installs the host's inbound-call hook.
    pub fn set_call_handler(
        &self,
        handler: impl FnMut(CallContext<'_>, ReturnSender) -> Result<()> + 'static,
    ) {
        self.state.borrow_mut().handler = Some(Box::new(handler));
    }

    /// Designates the export answered to inbound `Bootstrap` requests.
    pub fn set_bootstrap(&self, export_id: ExportId) {
        self.state.borrow_mut().bootstrap_export = Some(export_id);
    }

    /// Registers a local object, returning its export id. Ids are
    /// monotonically increasing and reused only after a full release.
    pub fn add_export(&self) -> ExportId {
        self.state.borrow_mut().exports.push(Export {
            refcount: 1,
            is_promise: false,
        })
    }

    /// Future descriptors for this export use `senderPromise`.
    pub fn mark_export_promise(&self, id: ExportId) -> Result<()> {
        match self.state.borrow_mut().exports.get_mut(id) {
            Some(export) => {
                export.is_promise = true;
                Ok(())
            }
            None => Err(Error::from_kind(ErrorKind::MissingCapTable)),
        }
    }

    pub fn has_export(&self, id: ExportId) -> bool {
        self.state.borrow().exports.get(id).is_some()
    }

    /// Whether the given import is still an unresolved promise.
    pub fn import_is_promise(&self, id: ImportId) -> bool {
        self.state
            .borrow()
            .imports
            .get(&id)
            .map(|import| import.is_promise)
            .unwrap_or(false)
    }

    /// The final target of a formerly-promise import, once its `Resolve` has
    /// arrived.
    pub fn resolved_import(
        &self,
        id: ImportId,
    ) -> Option<::core::result::Result<InboundCap, Error>> {
        let state = self.state.borrow();
        let import = state.imports.get(&id)?;
        match import.resolution.as_ref()? {
            ImportResolution::Cap(cap) => Some(Ok(cap.clone())),
            ImportResolution::Exception(error) => Some(Err(error.clone())),
        }
    }

    /// The copied completion payload of a `ThirdPartyAnswer`, if one has
    /// arrived for this answer.
    pub fn third_party_completion(&self, answer_id: AnswerId) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .answers
            .get(&answer_id)
            .and_then(|answer| answer.third_party.clone())
    }

    /// Issues a call. `build_params` fills the params payload; capability
    /// pointers use [payload_cap] references and are rewritten to dense
    /// indices with matching descriptors. `on_return` fires when the peer's
    /// `Return` arrives (or the connection dies).
    pub fn send_call(
        &self,
        request: &Request,
        build_params: impl FnOnce(any_pointer::Builder<'_>) -> Result<()>,
        on_return: impl FnOnce(Result<Response>) + 'static,
    ) -> Result<QuestionId> {
        let mut scratch = message::Builder::new_default();
        {
            let root: any_pointer::Builder = scratch.init_root()?;
            build_params(root)?;
        }
        let scratch = scratch.into_reader();
        let content: any_pointer::Reader = scratch.get_root()?;

        let question_id = {
            let mut guard = self.state.borrow_mut();
            let s = &mut *guard;
            if let Some(err) = &s.dead {
                return Err(err.clone());
            }
            let target = match &request.target {
                CallTarget::Import(id) => OutTarget::ImportedCap(*id),
                CallTarget::PromisedAnswer { question_id, ops } => OutTarget::PromisedAnswer {
                    question_id: *question_id,
                    ops,
                },
                CallTarget::Export(_) => {
                    return Err(Error::unimplemented(
                        "calls to local exports do not cross the wire".into(),
                    ))
                }
            };
            let question_id = s.questions.push(Question {
                on_return: Some(Box::new(on_return)),
                param_exports: Vec::new(),
            });
            let content_reader = content.reader();
            let interface_id = request.interface_id;
            let method_id = request.method_id;
            let (frame, param_exports) =
                encode_with_caps(&mut s.exports, &mut |cap_map, descriptors| {
                    proto::build_call(
                        question_id,
                        interface_id,
                        method_id,
                        &target,
                        content_reader,
                        cap_map,
                        descriptors,
                    )
                })?;
            s.questions
                .get_mut(question_id)
                .expect("just pushed")
                .param_exports = param_exports;
            s.outbox.push(frame);
            question_id
        };
        flush(&self.state);
        trace!(question = question_id, "call sent");
        Ok(question_id)
    }

    /// Requests the peer's bootstrap capability.
    pub fn send_bootstrap(
        &self,
        on_return: impl FnOnce(Result<Response>) + 'static,
    ) -> Result<QuestionId> {
        let question_id = {
            let mut s = self.state.borrow_mut();
            if let Some(err) = &s.dead {
                return Err(err.clone());
            }
            let question_id = s.questions.push(Question {
                on_return: Some(Box::new(on_return)),
                param_exports: Vec::new(),
            });
            let frame = proto::build_bootstrap(question_id)?;
            s.outbox.push(frame);
            question_id
        };
        flush(&self.state);
        Ok(question_id)
    }

    /// Feeds one inbound frame through the state machine. This is the only
    /// entry point that advances connection state.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<()> {
        {
            let s = self.state.borrow();
            if let Some(err) = &s.dead {
                return Err(err.clone());
            }
        }
        let result = process_frame(&self.state, bytes);
        flush(&self.state);
        result
    }
}

fn exception_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Overloaded => exception_kind::OVERLOADED,
        ErrorKind::Disconnected => exception_kind::DISCONNECTED,
        ErrorKind::Unimplemented => exception_kind::UNIMPLEMENTED,
        _ => exception_kind::FAILED,
    }
}

fn flush(state: &Rc<RefCell<PeerState>>) {
    loop {
        let (frame, mut sink) = {
            let mut s = state.borrow_mut();
            if s.outbox.is_empty() {
                return;
            }
            let frame = s.outbox.remove(0);
            (frame, s.sink.take())
        };
        if let Some(send) = sink.as_mut() {
            send(&frame);
        }
        state.borrow_mut().sink = sink;
    }
}

/// Queues an abort frame, poisons the connection, and returns the error the
/// caller should surface.
fn abort_connection(state: &Rc<RefCell<PeerState>>, kind: ErrorKind, reason: &str) -> Error {
    warn!(reason, "aborting connection");
    let error = Error {
        kind,
        extra: reason.to_string(),
    };
    let callbacks = {
        let mut s = state.borrow_mut();
        if let Ok(frame) = proto::build_abort(exception_kind::FAILED, reason) {
            s.outbox.push(frame);
        }
        teardown(&mut s, error.clone())
    };
    for callback in callbacks {
        callback(Err(error.clone()));
    }
    error
}

/// Clears every table; returns the question callbacks to fail.
fn teardown(s: &mut PeerState, error: Error) -> Vec<OnReturn> {
    s.dead = Some(error);
    let callbacks = s
        .questions
        .clear()
        .into_iter()
        .filter_map(|q| q.on_return)
        .collect();
    s.answers.clear();
    s.provisions.clear();
    s.embargoes.clear();
    s.imports.clear();
    s.exports.clear();
    s.receiver_answers.clear();
    callbacks
}

/// A deterministic byte key for an AnyPointer value: its canonical encoding.
fn canonical_key(pointer: PointerReader<'_>) -> Result<Vec<u8>> {
    let mut scratch = message::Builder::new_default();
    {
        let root: any_pointer::Builder = scratch.init_root()?;
        root.builder().copy_from(pointer, true)?;
    }
    let segments = scratch.get_segments_for_output().into_vec();
    Ok(segments.concat())
}

/// Copies an arbitrary pointer into its own owned message.
fn copy_to_owned(pointer: PointerReader<'_>) -> Result<message::Reader<message::Segments>> {
    let mut scratch = message::Builder::new_default();
    {
        let root: any_pointer::Builder = scratch.init_root()?;
        root.builder().copy_from(pointer, false)?;
    }
    Ok(scratch.into_reader())
}

/// Translates a payload's descriptor list into this vat's terms, creating or
/// bumping import entries as descriptors are encountered.
fn translate_descriptors(
    s: &mut PeerState,
    payload: &proto::Payload<'_>,
) -> Result<Vec<InboundCap>> {
    let mut entries = Vec::new();
    for descriptor in payload.get_cap_table()? {
        let entry = match descriptor.which()? {
            proto::CapDescriptorWhich::None => InboundCap::None,
            proto::CapDescriptorWhich::SenderHosted(id) => {
                let import = s.imports.entry(id).or_insert(Import {
                    refcount: 0,
                    is_promise: false,
                    resolution: None,
                });
                import.refcount += 1;
                InboundCap::SenderHosted(id)
            }
            proto::CapDescriptorWhich::SenderPromise(id) => {
                let import = s.imports.entry(id).or_insert(Import {
                    refcount: 0,
                    is_promise: true,
                    resolution: None,
                });
                import.refcount += 1;
                InboundCap::SenderPromise(id)
            }
            proto::CapDescriptorWhich::ReceiverHosted(id) => InboundCap::ReceiverHosted(id),
            proto::CapDescriptorWhich::ReceiverAnswer(promised) => {
                let handle = s
                    .receiver_answers
                    .note(promised.get_question_id(), promised.get_ops()?);
                InboundCap::ReceiverAnswer(handle)
            }
            proto::CapDescriptorWhich::ThirdPartyHosted(_) => InboundCap::None,
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn translate_inbound_caps(
    state: &Rc<RefCell<PeerState>>,
    s: &mut PeerState,
    payload: &proto::Payload<'_>,
) -> Result<InboundCaps> {
    let entries = translate_descriptors(s, payload)?;
    let retained = RefCell::new(vec![false; entries.len()]);
    Ok(InboundCaps {
        state: Rc::downgrade(state),
        entries,
        retained,
    })
}

/// Encodes an outbound payload twice: the first pass discovers, in traversal
/// order, which cap references the content uses (building the descriptor
/// list); the second emits the final frame with that list attached. Export
/// refcounts end up bumped exactly once per referenced export.
fn encode_with_caps(
    exports: &mut SlotTable<Export>,
    build: &mut dyn FnMut(
        &mut dyn FnMut(u32) -> Result<u32>,
        &[OutDescriptor],
    ) -> Result<Vec<u8>>,
) -> Result<(Vec<u8>, Vec<ExportId>)> {
    let mut first = CapEncoder::default();
    build(&mut |raw| first.map(exports, raw), &[])?;
    let mut second = CapEncoder::default();
    let frame = build(&mut |raw| second.map(exports, raw), &first.descriptors)?;
    for id in &first.exports_touched {
        if let Some(export) = exports.get_mut(*id) {
            export.refcount -= 1;
        }
    }
    Ok((frame, second.exports_touched))
}

/// Follows a promised-answer transform through an emitted return frame to
/// the export it lands on.
fn resolve_returned_answer(answer: &Answer, ops: &[PipelineOp]) -> Result<ExportId> {
    let frame = answer
        .results_frame
        .as_ref()
        .ok_or_else(|| Error::failed("answer completed without results".into()))?;
    let mut slice = &frame[..];
    let message = cornerstone::serialize::read_message_from_flat_slice(
        &mut slice,
        *ReaderOptions::new().traversal_limit_in_words(None),
    )?;
    let decoded = proto::decode(&message)?;
    let Incoming::Return(ret) = decoded else {
        return Err(Error::failed("stored answer frame is not a return".into()));
    };
    let payload = match ret.which()? {
        proto::ReturnWhich::Results(payload) => payload,
        proto::ReturnWhich::Exception(e) => return Err(e.to_error()),
        _ => {
            return Err(Error::failed(
                "answer's return carries no pipelinable results".into(),
            ))
        }
    };
    let mut pointer = payload.get_content().reader();
    for op in ops {
        match op {
            PipelineOp::Noop => {}
            PipelineOp::GetPointerField(index) => {
                pointer = pointer.get_struct()?.get_pointer_field(*index);
            }
        }
    }
    let index = pointer.get_capability()?;
    let descriptors = payload.get_cap_table()?;
    let descriptor = descriptors
        .get(index as usize)
        .ok_or_else(|| Error::from_kind(ErrorKind::MissingCapTable))?;
    match descriptor.which()? {
        proto::CapDescriptorWhich::SenderHosted(id)
        | proto::CapDescriptorWhich::SenderPromise(id) => Ok(id),
        _ => Err(Error::failed(
            "pipelined target is not a locally-hosted capability".into(),
        )),
    }
}

fn queue_return_exception(s: &mut PeerState, answer_id: AnswerId, error: &Error) {
    if let Ok(frame) =
        proto::build_return_exception(answer_id, exception_code(error.kind), &error.to_string())
    {
        s.outbox.push(frame);
    }
    let answer = s
        .answers
        .entry(answer_id)
        .or_insert_with(|| Answer::new(AnswerState::Returned));
    answer.state = AnswerState::Returned;
}

/// Emits the return that hands `export_id` to the peer as the result of
/// `answer_id`, recording it for later pipelined calls.
fn queue_return_cap(s: &mut PeerState, answer_id: AnswerId, export_id: ExportId) -> Result<()> {
    let is_promise = s
        .exports
        .get(export_id)
        .map(|e| e.is_promise)
        .unwrap_or(false);
    let descriptor = if is_promise {
        OutDescriptor::SenderPromise(export_id)
    } else {
        OutDescriptor::SenderHosted(export_id)
    };
    if let Some(export) = s.exports.get_mut(export_id) {
        export.refcount += 1;
    }
    let frame = proto::build_return_cap(answer_id, descriptor)?;
    let answer = s
        .answers
        .entry(answer_id)
        .or_insert_with(|| Answer::new(AnswerState::Returned));
    answer.state = AnswerState::Returned;
    answer.results_frame = Some(frame.clone());
    answer.result_exports.push(export_id);
    s.outbox.push(frame);
    Ok(())
}

fn process_frame(state: &Rc<RefCell<PeerState>>, bytes: &[u8]) -> Result<()> {
    let mut slice = bytes;
    let message =
        cornerstone::serialize::read_message_from_flat_slice(&mut slice, ReaderOptions::new())?;
    let decoded = proto::decode(&message)?;

    match decoded {
        Incoming::Unimplemented => {
            trace!("peer reported an unimplemented message; ignoring");
            Ok(())
        }

        Incoming::Abort(exception) => {
            let error = exception.to_error();
            warn!(reason = %error, "peer aborted the connection");
            let callbacks = {
                let mut s = state.borrow_mut();
                teardown(&mut s, error.clone())
            };
            for callback in callbacks {
                callback(Err(error.clone()));
            }
            Err(error)
        }

        Incoming::Call(call) => handle_call(state, bytes, call),

        Incoming::Return(ret) => {
            let answer_id = ret.get_answer_id();
            trace!(question = answer_id, "return received");
            let (callback, response) = {
                let mut guard = state.borrow_mut();
                let s = &mut *guard;
                let Some(question) = s.questions.get_mut(answer_id) else {
                    return Err(Error {
                        kind: ErrorKind::InvalidReturnSemantics,
                        extra: format!("return for unknown question {answer_id}"),
                    });
                };
                let callback = question.on_return.take();
                let param_exports = std::mem::take(&mut question.param_exports);

                if ret.get_release_param_caps() {
                    for id in param_exports {
                        s.release_export(id, 1);
                    }
                }

                let response = match ret.which()? {
                    proto::ReturnWhich::Results(payload) => {
                        let caps = translate_descriptors(s, &payload)?;
                        Ok(Response {
                            message: copy_to_owned(payload.get_content().reader())?,
                            caps,
                        })
                    }
                    proto::ReturnWhich::Exception(exception) => Err(exception.to_error()),
                    proto::ReturnWhich::Canceled => Err(Error::failed("call was canceled".into())),
                    proto::ReturnWhich::ResultsSentElsewhere => Err(Error::failed(
                        "results were sent elsewhere (third-party handoff)".into(),
                    )),
                    proto::ReturnWhich::TakeFromOtherQuestion(other) => Err(Error::failed(
                        format!("results redirected to question {other}"),
                    )),
                    proto::ReturnWhich::AcceptFromThirdParty(_) => Err(Error::failed(
                        "third-party acceptance is not routed by this peer".into(),
                    )),
                };

                // The question retires: acknowledge with Finish and free the
                // id for reuse.
                s.questions.erase(answer_id);
                s.outbox.push(proto::build_finish(answer_id, false)?);
                (callback, response)
            };
            flush(state);
            if let Some(callback) = callback {
                callback(response);
            }
            Ok(())
        }

        Incoming::Finish(finish) => {
            let answer_id = finish.get_question_id();
            trace!(answer = answer_id, "finish received");
            let mut s = state.borrow_mut();
            if let Some(answer) = s.answers.remove(&answer_id) {
                if finish.get_release_result_caps() {
                    for id in answer.result_exports {
                        s.release_export(id, 1);
                    }
                }
                if matches!(answer.state, AnswerState::Provide) {
                    s.provisions
                        .retain(|_, p| p.provide_question != answer_id);
                }
            }
            // Any embargo keyed to this answer dies silently; a later
            // disembargo for its tag produces no output.
            s.embargoes.retain(|_, e| e.answer_id != answer_id);
            Ok(())
        }

        Incoming::Resolve(resolve) => {
            let promise_id = resolve.get_promise_id();
            let mut s = state.borrow_mut();
            let resolution = match resolve.which()? {
                proto::ResolveWhich::Cap(descriptor) => match descriptor.which()? {
                    proto::CapDescriptorWhich::None => ImportResolution::Cap(InboundCap::None),
                    proto::CapDescriptorWhich::SenderHosted(id) => {
                        ImportResolution::Cap(InboundCap::SenderHosted(id))
                    }
                    proto::CapDescriptorWhich::SenderPromise(id) => {
                        ImportResolution::Cap(InboundCap::SenderPromise(id))
                    }
                    proto::CapDescriptorWhich::ReceiverHosted(id) => {
                        ImportResolution::Cap(InboundCap::ReceiverHosted(id))
                    }
                    proto::CapDescriptorWhich::ReceiverAnswer(promised) => {
                        let handle = s
                            .receiver_answers
                            .note(promised.get_question_id(), promised.get_ops()?);
                        ImportResolution::Cap(InboundCap::ReceiverAnswer(handle))
                    }
                    proto::CapDescriptorWhich::ThirdPartyHosted(_) => {
                        ImportResolution::Cap(InboundCap::None)
                    }
                },
                proto::ResolveWhich::Exception(exception) => {
                    ImportResolution::Exception(exception.to_error())
                }
            };
            match s.imports.get_mut(&promise_id) {
                Some(import) => {
                    import.is_promise = false;
                    import.resolution = Some(resolution);
                    debug!(import = promise_id, "promise import resolved");
                }
                None => {
                    trace!(import = promise_id, "resolve for unknown import; ignoring");
                }
            }
            Ok(())
        }

        Incoming::Release(release) => {
            let mut s = state.borrow_mut();
            s.release_export(release.get_id(), release.get_reference_count());
            Ok(())
        }

        Incoming::Bootstrap(bootstrap) => {
            let question_id = bootstrap.get_question_id();
            trace!(answer = question_id, "bootstrap requested");
            let mut s = state.borrow_mut();
            match s.bootstrap_export {
                Some(export_id) => queue_return_cap(&mut s, question_id, export_id)?,
                None => queue_return_exception(
                    &mut s,
                    question_id,
                    &Error::failed("no bootstrap capability".into()),
                ),
            }
            Ok(())
        }

        Incoming::Provide(provide) => {
            let question_id = provide.get_question_id();
            let export_id = {
                let target = provide.get_target()?;
                match target.which()? {
                    proto::TargetWhich::ImportedCap(id) => id,
                    proto::TargetWhich::PromisedAnswer(_) => {
                        let mut s = state.borrow_mut();
                        queue_return_exception(
                            &mut s,
                            question_id,
                            &Error::unimplemented(
                                "provide of a promised answer is not supported".into(),
                            ),
                        );
                        return Ok(());
                    }
                }
            };
            let key = canonical_key(provide.get_recipient().reader())?;
            {
                let mut s = state.borrow_mut();
                if s.exports.get(export_id).is_none() {
                    queue_return_exception(
                        &mut s,
                        question_id,
                        &Error::failed(format!("provide target {export_id} is not exported")),
                    );
                    return Ok(());
                }
                if s.provisions.contains_key(&key) {
                    drop(s);
                    return Err(abort_connection(
                        state,
                        ErrorKind::DuplicateProvideRecipient,
                        "duplicate provide recipient",
                    ));
                }
                s.provisions.insert(
                    key,
                    Provision {
                        export_id,
                        provide_question: question_id,
                    },
                );
                s.answers
                    .insert(question_id, Answer::new(AnswerState::Provide));
                debug!(answer = question_id, export = export_id, "provision recorded");
            }
            // Success emits nothing; the recipient's Accept consumes it.
            Ok(())
        }

        Incoming::Accept(accept) => {
            let question_id = accept.get_question_id();
            let key = canonical_key(accept.get_provision().reader())?;
            let tag = accept.get_embargo_tag()?.map(|t| t.to_string());
            let mut s = state.borrow_mut();
            let provision_export = s.provisions.get(&key).map(|p| p.export_id);
            let Some(export_id) = provision_export else {
                queue_return_exception(
                    &mut s,
                    question_id,
                    &Error::from_kind(ErrorKind::UnknownProvision),
                );
                return Ok(());
            };
            match tag {
                None => {
                    queue_return_cap(&mut s, question_id, export_id)?;
                    trace!(answer = question_id, "accept returned immediately");
                }
                Some(tag) => {
                    if s.embargoes.contains_key(&tag) {
                        queue_return_exception(
                            &mut s,
                            question_id,
                            &Error::failed(format!("embargo tag {tag:?} already in use")),
                        );
                        return Ok(());
                    }
                    s.answers
                        .insert(question_id, Answer::new(AnswerState::Embargoed));
                    s.embargoes.insert(
                        tag.clone(),
                        Embargo {
                            answer_id: question_id,
                            export_id,
                            pending_calls: Vec::new(),
                        },
                    );
                    debug!(answer = question_id, tag = %tag, "accept embargoed");
                    // No frame until the disembargo arrives.
                }
            }
            Ok(())
        }

        Incoming::Join(join) => {
            let question_id = join.get_question_id();
            let mut s = state.borrow_mut();
            if join.get_key_part_count()? > 1 {
                queue_return_exception(
                    &mut s,
                    question_id,
                    &Error::unimplemented("multi-part join".into()),
                );
                return Ok(());
            }
            let key = canonical_key(join.get_key_part().reader())?;
            let provision_export = s.provisions.get(&key).map(|p| p.export_id);
            match provision_export {
                Some(export_id) => {
                    queue_return_cap(&mut s, question_id, export_id)?;
                }
                None => {
                    queue_return_exception(
                        &mut s,
                        question_id,
                        &Error::from_kind(ErrorKind::UnknownProvision),
                    );
                }
            }
            Ok(())
        }

        Incoming::Disembargo(disembargo) => match disembargo.which()? {
            proto::DisembargoWhich::Accept(tag) => {
                let removed = {
                    let mut s = state.borrow_mut();
                    s.embargoes.remove(tag)
                };
                let Some(embargo) = removed else {
                    // Either never established or already canceled by a
                    // Finish; both are silent.
                    trace!(tag, "disembargo for unknown tag; ignoring");
                    return Ok(());
                };
                {
                    let mut s = state.borrow_mut();
                    queue_return_cap(&mut s, embargo.answer_id, embargo.export_id)?;
                    debug!(answer = embargo.answer_id, tag, "embargo lifted");
                }
                flush(state);
                // Replay pipelined calls in arrival order, after the accept's
                // return.
                for frame in embargo.pending_calls {
                    let _ = process_frame(state, &frame);
                }
                Ok(())
            }
            _ => Err(Error {
                kind: ErrorKind::UnsupportedDisembargo,
                extra: "only Disembargo.accept is routed".into(),
            }),
        },

        Incoming::ThirdPartyAnswer(tpa) => {
            let answer_id = tpa.get_answer_id();
            let live = {
                let s = state.borrow();
                s.answers.contains_key(&answer_id)
            };
            if !live {
                return Err(abort_connection(
                    state,
                    ErrorKind::InvalidThirdPartyAnswerId,
                    "invalid thirdPartyAnswer answerId",
                ));
            }
            // Copy the completion payload; it must outlive the frame.
            let completion = tpa.get_completion().reader();
            let copied = if completion.is_null() {
                Vec::new()
            } else {
                canonical_key(completion)?
            };
            let mut s = state.borrow_mut();
            if let Some(answer) = s.answers.get_mut(&answer_id) {
                answer.third_party = Some(copied);
            }
            Ok(())
        }
    }
}

fn handle_call(
    state: &Rc<RefCell<PeerState>>,
    raw_frame: &[u8],
    call: proto::Call<'_>,
) -> Result<()> {
    let question_id = call.get_question_id();
    let target = call.get_target()?;

    // Resolve the call target to a concrete export, or queue the frame if
    // it is gated on an embargo or an incomplete answer.
    let export_id = match target.which()? {
        proto::TargetWhich::ImportedCap(id) => {
            let s = state.borrow();
            if s.exports.get(id).is_none() {
                drop(s);
                let mut s = state.borrow_mut();
                queue_return_exception(
                    &mut s,
                    question_id,
                    &Error::failed(format!("call target {id} is not exported")),
                );
                return Ok(());
            }
            id
        }
        proto::TargetWhich::PromisedAnswer(promised) => {
            let answer_id = promised.get_question_id();
            let ops = promised.get_ops()?;

            enum Gate {
                Unknown,
                Embargoed,
                Pending,
                Provide,
                Returned,
            }
            let mut guard = state.borrow_mut();
            let s = &mut *guard;
            let gate = match s.answers.get(&answer_id) {
                None => Gate::Unknown,
                Some(answer) => match answer.state {
                    AnswerState::Embargoed => Gate::Embargoed,
                    AnswerState::Dispatched => Gate::Pending,
                    AnswerState::Provide => Gate::Provide,
                    AnswerState::Returned => Gate::Returned,
                },
            };
            match gate {
                Gate::Unknown => {
                    queue_return_exception(
                        s,
                        question_id,
                        &Error::failed(format!("call targets unknown answer {answer_id}")),
                    );
                    return Ok(());
                }
                Gate::Embargoed => {
                    // Ordering invariant: nothing dispatches against an
                    // embargoed accept until its disembargo. The embargo
                    // owns the queue.
                    for embargo in s.embargoes.values_mut() {
                        if embargo.answer_id == answer_id {
                            embargo.pending_calls.push(raw_frame.to_vec());
                            break;
                        }
                    }
                    trace!(answer = answer_id, "call queued behind embargo");
                    return Ok(());
                }
                Gate::Pending => {
                    let answer = s.answers.get_mut(&answer_id).expect("gated above");
                    answer.pending_calls.push(raw_frame.to_vec());
                    trace!(answer = answer_id, "call queued behind pending answer");
                    return Ok(());
                }
                Gate::Provide => {
                    queue_return_exception(
                        s,
                        question_id,
                        &Error::failed("cannot call into a provide question".into()),
                    );
                    return Ok(());
                }
                Gate::Returned => {
                    let answer = s.answers.get(&answer_id).expect("gated above");
                    match resolve_returned_answer(answer, &ops) {
                        Ok(export_id) => export_id,
                        Err(error) => {
                            queue_return_exception(s, question_id, &error);
                            return Ok(());
                        }
                    }
                }
            }
        }
    };

    let params = call.get_params()?;
    let (caps, sender) = {
        let mut s = state.borrow_mut();
        let caps = translate_inbound_caps(state, &mut s, &params)?;
        s.answers
            .insert(question_id, Answer::new(AnswerState::Dispatched));
        (
            caps,
            ReturnSender {
                state: Rc::downgrade(state),
                answer_id: question_id,
            },
        )
    };

    let context = CallContext {
        interface_id: call.get_interface_id(),
        method_id: call.get_method_id(),
        target: export_id,
        params: params.get_content(),
        caps,
    };

    let handler = state.borrow_mut().handler.take();
    let result = match handler {
        Some(mut h) => {
            let r = h(context, sender);
            state.borrow_mut().handler = Some(h);
            r
        }
        None => Err(Error::failed("no call handler installed".into())),
    };

    // Handler-originated failures ride an exception return; they never tear
    // the connection down.
    if let Err(error) = result {
        let mut s = state.borrow_mut();
        let still_open = s
            .answers
            .get(&question_id)
            .map(|answer| !matches!(answer.state, AnswerState::Returned))
            .unwrap_or(false);
        if still_open {
            queue_return_exception(&mut s, question_id, &error);
        }
    }
    Ok(())
}
