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

//! An implementation of the Cap'n Proto remote procedure call protocol:
//! the four-party object-capability protocol with promise pipelining,
//! embargoes, and third-party handoff.
//!
//! The core is a single-threaded cooperative state machine. The host owns
//! the transport: it pumps bytes through a [Framer], hands complete frames to
//! [Peer::handle_frame], and supplies a `send_frame` hook for outbound
//! frames. There is no internal I/O and nothing blocks; pending work is
//! explicit state that advances when the matching frame arrives.

pub mod framer;
pub mod peer;
pub mod proto;
mod table;

pub use framer::{Framer, DEFAULT_MAX_FRAME_WORDS};
pub use peer::{
    payload_cap, AnswerId, CallContext, CallTarget, ExportId, ImportId, InboundCap, InboundCaps,
    Peer, PipelineOp, Promise, QuestionId, Request, Response, ReturnSender,
};
