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

//! Protocol-level tests: scripted frame sequences against a peer with a
//! recording send hook, asserting the exact frames emitted and their order.

use std::cell::RefCell;
use std::rc::Rc;

use cornerstone::any_pointer;
use cornerstone::message::{self, ReaderOptions};
use cornerstone::private::layout::{PointerReader, StructSize};
use cornerstone::ErrorKind;

use cornerstone_rpc::proto::{self, Incoming, OutDescriptor, OutTarget};
use cornerstone_rpc::{payload_cap, CallTarget, Peer, Request};

type Sent = Rc<RefCell<Vec<Vec<u8>>>>;

fn recording_peer() -> (Peer, Sent) {
    let sent: Sent = Rc::new(RefCell::new(Vec::new()));
    let sink = sent.clone();
    let peer = Peer::new(move |frame: &[u8]| {
        sink.borrow_mut().push(frame.to_vec());
    });
    (peer, sent)
}

/// A message holding one struct whose first data word is `value`; used as an
/// opaque recipient/key value.
fn recipient_message(value: u64) -> message::Builder<message::HeapAllocator> {
    let mut builder = message::Builder::new_default();
    {
        let root: any_pointer::Builder = builder.init_root().unwrap();
        let st = root
            .init_struct(StructSize {
                data: 1,
                pointers: 0,
            })
            .unwrap();
        st.set_u64(0, value);
    }
    builder
}

fn with_recipient<R>(value: u64, f: impl FnOnce(PointerReader<'_>) -> R) -> R {
    let reader = recipient_message(value).into_reader();
    let root: any_pointer::Reader = reader.get_root().unwrap();
    f(root.reader())
}

/// A join key part: joinId, partCount, partNum.
fn with_join_key<R>(
    join_id: u32,
    part_count: u16,
    f: impl FnOnce(PointerReader<'_>) -> R,
) -> R {
    let mut builder = message::Builder::new_default();
    {
        let root: any_pointer::Builder = builder.init_root().unwrap();
        let st = root
            .init_struct(StructSize {
                data: 1,
                pointers: 0,
            })
            .unwrap();
        st.set_u32(0, join_id);
        st.set_u16(2, part_count);
    }
    let reader = builder.into_reader();
    let root: any_pointer::Reader = reader.get_root().unwrap();
    f(root.reader())
}

enum FrameKind {
    Return {
        answer_id: u32,
        cap: Option<OutDescriptor>,
        exception: Option<String>,
    },
    Abort(String),
    Finish(u32),
    Call(u32),
    Other,
}

fn classify(frame: &[u8]) -> FrameKind {
    let mut slice = frame;
    let message = cornerstone::serialize::read_message_from_flat_slice(
        &mut slice,
        ReaderOptions::new(),
    )
    .unwrap();
    match proto::decode(&message).unwrap() {
        Incoming::Return(ret) => match ret.which().unwrap() {
            proto::ReturnWhich::Results(payload) => {
                let cap = payload
                    .get_cap_table()
                    .unwrap()
                    .first()
                    .map(|d| match d.which().unwrap() {
                        proto::CapDescriptorWhich::SenderHosted(id) => {
                            OutDescriptor::SenderHosted(id)
                        }
                        proto::CapDescriptorWhich::SenderPromise(id) => {
                            OutDescriptor::SenderPromise(id)
                        }
                        proto::CapDescriptorWhich::ReceiverHosted(id) => {
                            OutDescriptor::ReceiverHosted(id)
                        }
                        _ => panic!("unexpected descriptor"),
                    });
                FrameKind::Return {
                    answer_id: ret.get_answer_id(),
                    cap,
                    exception: None,
                }
            }
            proto::ReturnWhich::Exception(e) => FrameKind::Return {
                answer_id: ret.get_answer_id(),
                cap: None,
                exception: Some(e.get_reason().unwrap().to_string()),
            },
            _ => FrameKind::Other,
        },
        Incoming::Abort(e) => FrameKind::Abort(e.get_reason().unwrap().to_string()),
        Incoming::Finish(f) => FrameKind::Finish(f.get_question_id()),
        Incoming::Call(c) => FrameKind::Call(c.get_question_id()),
        _ => FrameKind::Other,
    }
}

#[test]
fn provide_then_accept_returns_the_provided_cap() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();

    let provide =
        with_recipient(0xabba, |r| {
            proto::build_provide(100, &OutTarget::ImportedCap(export), r).unwrap()
        });
    peer.handle_frame(&provide).unwrap();
    assert!(sent.borrow().is_empty(), "provide succeeds silently");

    let accept = with_recipient(0xabba, |r| proto::build_accept(101, r, None).unwrap());
    peer.handle_frame(&accept).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return {
            answer_id,
            cap,
            exception,
        } => {
            assert_eq!(answer_id, 101);
            assert_eq!(cap, Some(OutDescriptor::SenderHosted(export)));
            assert!(exception.is_none());
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn accept_of_unknown_provision_returns_an_exception() {
    let (peer, sent) = recording_peer();
    let accept = with_recipient(7, |r| proto::build_accept(50, r, None).unwrap());
    peer.handle_frame(&accept).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return {
            answer_id,
            exception,
            ..
        } => {
            assert_eq!(answer_id, 50);
            assert!(exception.unwrap().contains("unknown provision"));
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn embargoed_accept_holds_all_output_until_disembargo() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();
    peer.set_call_handler(move |_ctx, responder| responder.send_results_with(|_| Ok(())));

    let provide = with_recipient(9, |r| {
        proto::build_provide(210, &OutTarget::ImportedCap(export), r).unwrap()
    });
    peer.handle_frame(&provide).unwrap();

    let accept = with_recipient(9, |r| proto::build_accept(211, r, Some("T")).unwrap());
    peer.handle_frame(&accept).unwrap();
    assert!(sent.borrow().is_empty(), "embargoed accept emits nothing");

    // A pipelined call against the embargoed accept is queued, not
    // dispatched.
    let call = proto::build_call(
        232,
        0x1111,
        0,
        &OutTarget::PromisedAnswer {
            question_id: 211,
            ops: &[],
        },
        PointerReader::new_default(),
        &mut |i| Ok(i),
        &[],
    )
    .unwrap();
    peer.handle_frame(&call).unwrap();
    assert!(sent.borrow().is_empty(), "call is held behind the embargo");

    peer.handle_frame(&proto::build_disembargo_accept("T").unwrap())
        .unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 2, "exactly the return and the replayed call's return");
    match classify(&frames[0]) {
        FrameKind::Return { answer_id, cap, .. } => {
            assert_eq!(answer_id, 211);
            assert_eq!(cap, Some(OutDescriptor::SenderHosted(export)));
        }
        _ => panic!("first frame must be the accept's return"),
    }
    match classify(&frames[1]) {
        FrameKind::Return {
            answer_id,
            exception,
            ..
        } => {
            assert_eq!(answer_id, 232);
            assert!(exception.is_none());
        }
        _ => panic!("second frame must be the pipelined call's return"),
    }
}

#[test]
fn finish_cancels_an_embargoed_accept() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();

    let provide = with_recipient(5, |r| {
        proto::build_provide(220, &OutTarget::ImportedCap(export), r).unwrap()
    });
    peer.handle_frame(&provide).unwrap();
    let accept = with_recipient(5, |r| proto::build_accept(221, r, Some("T")).unwrap());
    peer.handle_frame(&accept).unwrap();

    peer.handle_frame(&proto::build_finish(221, false).unwrap())
        .unwrap();
    // The disembargo now refers to a retired embargo: silence, not output.
    peer.handle_frame(&proto::build_disembargo_accept("T").unwrap())
        .unwrap();
    assert!(sent.borrow().is_empty());
}

#[test]
fn duplicate_provide_recipient_aborts() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();

    let provide = |question| {
        with_recipient(3, |r| {
            proto::build_provide(question, &OutTarget::ImportedCap(export), r).unwrap()
        })
    };
    peer.handle_frame(&provide(300)).unwrap();
    let err = peer.handle_frame(&provide(301)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateProvideRecipient);

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Abort(reason) => assert_eq!(reason, "duplicate provide recipient"),
        _ => panic!("expected an abort"),
    }
}

#[test]
fn third_party_answer_for_dead_answer_aborts() {
    let (peer, sent) = recording_peer();
    let err = peer
        .handle_frame(&proto::build_third_party_answer(500).unwrap())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidThirdPartyAnswerId);

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Abort(reason) => assert_eq!(reason, "invalid thirdPartyAnswer answerId"),
        _ => panic!("expected an abort"),
    }
}

#[test]
fn non_accept_disembargo_is_unsupported() {
    let (peer, _sent) = recording_peer();
    let err = peer
        .handle_frame(&proto::build_disembargo_sender_loopback(4).unwrap())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedDisembargo);
}

#[test]
fn join_behaves_like_accept_for_single_part_keys() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();

    // The provide's recipient value is the same value the join key carries.
    let provide = with_join_key(77, 1, |r| {
        proto::build_provide(400, &OutTarget::ImportedCap(export), r).unwrap()
    });
    peer.handle_frame(&provide).unwrap();

    let join = {
        let mut builder = message::Builder::new_default();
        {
            let root: any_pointer::Builder = builder.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 0,
                })
                .unwrap();
            st.set_u32(0, 77);
            st.set_u16(2, 1);
        }
        let reader = builder.into_reader();
        let root: any_pointer::Reader = reader.get_root().unwrap();
        proto::build_join(401, root.reader()).unwrap()
    };
    peer.handle_frame(&join).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return { answer_id, cap, .. } => {
            assert_eq!(answer_id, 401);
            assert_eq!(cap, Some(OutDescriptor::SenderHosted(export)));
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn multi_part_join_is_unimplemented() {
    let (peer, sent) = recording_peer();
    let join = with_join_key(88, 2, |r| proto::build_join(402, r).unwrap());
    peer.handle_frame(&join).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return { exception, .. } => {
            assert!(exception.unwrap().contains("multi-part join"));
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn call_payload_caps_are_rewritten_to_dense_indices() {
    let (peer, sent) = recording_peer();
    let mut export = 0;
    for _ in 0..43 {
        export = peer.add_export();
    }
    assert_eq!(export, 42);
    peer.mark_export_promise(42).unwrap();

    let request = Request::new(CallTarget::Import(7), 0xfeed, 3);
    peer.send_call(
        &request,
        |params| {
            params.set_capability(payload_cap::export(42));
            Ok(())
        },
        |_outcome| {},
    )
    .unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    let mut slice = &frames[0][..];
    let message =
        cornerstone::serialize::read_message_from_flat_slice(&mut slice, ReaderOptions::new())
            .unwrap();
    let Incoming::Call(call) = proto::decode(&message).unwrap() else {
        panic!("expected a call");
    };
    let payload = call.get_params().unwrap();
    // The content's cap pointer is the dense index 0...
    assert_eq!(payload.get_content().get_capability().unwrap(), 0);
    // ...and the descriptor names the promise-marked export 42.
    let descriptors = payload.get_cap_table().unwrap();
    assert_eq!(descriptors.len(), 1);
    match descriptors[0].which().unwrap() {
        proto::CapDescriptorWhich::SenderPromise(id) => assert_eq!(id, 42),
        _ => panic!("expected senderPromise"),
    }
}

#[test]
fn unmarked_exports_encode_as_sender_hosted() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();

    peer.send_call(
        &Request::new(CallTarget::Import(0), 0xfeed, 0),
        |params| {
            params.set_capability(payload_cap::export(export));
            Ok(())
        },
        |_outcome| {},
    )
    .unwrap();

    let frames = sent.borrow();
    let mut slice = &frames[0][..];
    let message =
        cornerstone::serialize::read_message_from_flat_slice(&mut slice, ReaderOptions::new())
            .unwrap();
    let Incoming::Call(call) = proto::decode(&message).unwrap() else {
        panic!("expected a call");
    };
    let descriptors = call.get_params().unwrap().get_cap_table().unwrap();
    match descriptors[0].which().unwrap() {
        proto::CapDescriptorWhich::SenderHosted(id) => assert_eq!(id, export),
        _ => panic!("expected senderHosted"),
    }
}

#[test]
fn inbound_call_dispatches_and_returns_results() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    peer.set_call_handler(move |ctx, responder| {
        seen2
            .borrow_mut()
            .push((ctx.interface_id, ctx.method_id, ctx.target));
        let param = ctx.params.get_struct()?.get_u32(0);
        responder.send_results_with(|results| {
            let st = results.init_struct(StructSize {
                data: 1,
                pointers: 0,
            })?;
            st.set_u32(0, param + 1);
            Ok(())
        })
    });

    let call = {
        let mut builder = message::Builder::new_default();
        {
            let root: any_pointer::Builder = builder.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 0,
                })
                .unwrap();
            st.set_u32(0, 99);
        }
        let reader = builder.into_reader();
        let root: any_pointer::Reader = reader.get_root().unwrap();
        proto::build_call(
            1,
            0x1234,
            5,
            &OutTarget::ImportedCap(export),
            root.reader(),
            &mut |i| Ok(i),
            &[],
        )
        .unwrap()
    };
    peer.handle_frame(&call).unwrap();

    assert_eq!(seen.borrow().as_slice(), &[(0x1234u64, 5u16, export)]);
    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    let mut slice = &frames[0][..];
    let message =
        cornerstone::serialize::read_message_from_flat_slice(&mut slice, ReaderOptions::new())
            .unwrap();
    let Incoming::Return(ret) = proto::decode(&message).unwrap() else {
        panic!("expected a return");
    };
    assert_eq!(ret.get_answer_id(), 1);
    let proto::ReturnWhich::Results(payload) = ret.which().unwrap() else {
        panic!("expected results");
    };
    assert_eq!(
        payload.get_content().get_struct().unwrap().get_u32(0),
        100
    );
}

#[test]
fn handler_errors_become_exception_returns() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();
    peer.set_call_handler(|_ctx, _responder| {
        Err(cornerstone::Error::failed("handler blew up".into()))
    });

    let call = proto::build_call(
        9,
        0,
        0,
        &OutTarget::ImportedCap(export),
        PointerReader::new_default(),
        &mut |i| Ok(i),
        &[],
    )
    .unwrap();
    // Handler failure is not a connection failure.
    peer.handle_frame(&call).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return {
            answer_id,
            exception,
            ..
        } => {
            assert_eq!(answer_id, 9);
            assert!(exception.unwrap().contains("handler blew up"));
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn pipelined_call_waits_for_deferred_completion() {
    let (peer, sent) = recording_peer();
    let service = peer.add_export();
    let inner = peer.add_export();

    let stash: Rc<RefCell<Option<cornerstone_rpc::ReturnSender>>> =
        Rc::new(RefCell::new(None));
    let stash2 = stash.clone();
    let calls = Rc::new(RefCell::new(0u32));
    let calls2 = calls.clone();
    peer.set_call_handler(move |_ctx, responder| {
        *calls2.borrow_mut() += 1;
        if *calls2.borrow() == 1 {
            // Hold the completion token: the answer stays pending.
            *stash2.borrow_mut() = Some(responder);
            Ok(())
        } else {
            responder.send_results_with(|_| Ok(()))
        }
    });

    let first = proto::build_call(
        10,
        0,
        0,
        &OutTarget::ImportedCap(service),
        PointerReader::new_default(),
        &mut |i| Ok(i),
        &[],
    )
    .unwrap();
    peer.handle_frame(&first).unwrap();
    assert!(sent.borrow().is_empty(), "answer deferred");

    // Pipelined call against the pending answer: queued in FIFO order.
    let second = proto::build_call(
        11,
        0,
        0,
        &OutTarget::PromisedAnswer {
            question_id: 10,
            ops: &[],
        },
        PointerReader::new_default(),
        &mut |i| Ok(i),
        &[],
    )
    .unwrap();
    peer.handle_frame(&second).unwrap();
    assert!(sent.borrow().is_empty());

    // Deferred completion: the first answer resolves to `inner`, and the
    // queued call replays against it.
    let responder = stash.borrow_mut().take().unwrap();
    responder
        .send_results_with(|results| {
            results.set_capability(payload_cap::export(inner));
            Ok(())
        })
        .unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 2);
    match classify(&frames[0]) {
        FrameKind::Return { answer_id, .. } => assert_eq!(answer_id, 10),
        _ => panic!("expected the deferred return first"),
    }
    match classify(&frames[1]) {
        FrameKind::Return { answer_id, .. } => assert_eq!(answer_id, 11),
        _ => panic!("expected the replayed call's return second"),
    }
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn release_retires_exports() {
    let (peer, _sent) = recording_peer();
    let export = peer.add_export();
    assert!(peer.has_export(export));
    peer.handle_frame(&proto::build_release(export, 1).unwrap())
        .unwrap();
    assert!(!peer.has_export(export));
}

#[test]
fn bootstrap_returns_the_designated_export() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();
    peer.set_bootstrap(export);

    peer.handle_frame(&proto::build_bootstrap(7).unwrap())
        .unwrap();
    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    match classify(&frames[0]) {
        FrameKind::Return { answer_id, cap, .. } => {
            assert_eq!(answer_id, 7);
            assert_eq!(cap, Some(OutDescriptor::SenderHosted(export)));
        }
        _ => panic!("expected a return"),
    }
}

#[test]
fn return_completes_question_and_emits_finish() {
    let (peer, sent) = recording_peer();
    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    let question = peer
        .send_call(
            &Request::new(CallTarget::Import(4), 0xabc, 1),
            |_params| Ok(()),
            move |result| {
                *outcome2.borrow_mut() = Some(result.map(|response| {
                    response
                        .results()
                        .unwrap()
                        .get_struct()
                        .unwrap()
                        .get_u32(0)
                }));
            },
        )
        .unwrap();

    // The peer answers.
    let results = {
        let mut builder = message::Builder::new_default();
        {
            let root: any_pointer::Builder = builder.init_root().unwrap();
            let st = root
                .init_struct(StructSize {
                    data: 1,
                    pointers: 0,
                })
                .unwrap();
            st.set_u32(0, 31337);
        }
        let reader = builder.into_reader();
        let root: any_pointer::Reader = reader.get_root().unwrap();
        proto::build_return_results(question, root.reader(), &mut |i| Ok(i), &[]).unwrap()
    };
    peer.handle_frame(&results).unwrap();

    assert_eq!(*outcome.borrow(), Some(Ok(31337)));
    let frames = sent.borrow();
    assert_eq!(frames.len(), 2, "the call, then the finish");
    match classify(&frames[1]) {
        FrameKind::Finish(id) => assert_eq!(id, question),
        _ => panic!("expected a finish"),
    }
}

#[test]
fn abort_fails_all_questions_and_poisons_the_peer() {
    let (peer, _sent) = recording_peer();
    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    peer.send_call(
        &Request::new(CallTarget::Import(1), 0, 0),
        |_params| Ok(()),
        move |result| {
            *outcome2.borrow_mut() = Some(result.map(|_| ()));
        },
    )
    .unwrap();

    let abort = proto::build_abort(proto::exception_kind::FAILED, "going away").unwrap();
    let err = peer.handle_frame(&abort).unwrap_err();
    assert!(err.extra.contains("going away"));
    assert!(matches!(*outcome.borrow(), Some(Err(_))));

    // Everything after the abort is refused.
    let late = peer.handle_frame(&proto::build_bootstrap(1).unwrap());
    assert!(late.is_err());
}

#[test]
fn resolve_updates_a_promise_import() {
    let (peer, _sent) = recording_peer();
    let export = peer.add_export();
    let retained = Rc::new(RefCell::new(None));
    let retained2 = retained.clone();
    peer.set_call_handler(move |ctx, responder| {
        *retained2.borrow_mut() = Some(ctx.caps.retain(0)?);
        responder.send_results_with(|_| Ok(()))
    });

    // A call whose params carry a promise-typed capability from the peer.
    let call = {
        let mut builder = message::Builder::new_default();
        {
            let root: any_pointer::Builder = builder.init_root().unwrap();
            root.set_capability(0);
        }
        let reader = builder.into_reader();
        let root: any_pointer::Reader = reader.get_root().unwrap();
        proto::build_call(
            2,
            0,
            0,
            &OutTarget::ImportedCap(export),
            root.reader(),
            &mut |i| Ok(i),
            &[OutDescriptor::SenderPromise(5)],
        )
        .unwrap()
    };
    peer.handle_frame(&call).unwrap();
    assert!(retained.borrow().is_some());
    assert!(peer.import_is_promise(5));

    peer.handle_frame(
        &proto::build_resolve_cap(5, OutDescriptor::SenderHosted(9)).unwrap(),
    )
    .unwrap();
    assert!(!peer.import_is_promise(5));
    assert_eq!(
        peer.resolved_import(5),
        Some(Ok(cornerstone_rpc::InboundCap::SenderHosted(9)))
    );
}

#[test]
fn third_party_answer_attaches_to_live_answers() {
    let (peer, sent) = recording_peer();
    let export = peer.add_export();
    let stash: Rc<RefCell<Option<cornerstone_rpc::ReturnSender>>> =
        Rc::new(RefCell::new(None));
    let stash2 = stash.clone();
    peer.set_call_handler(move |_ctx, responder| {
        *stash2.borrow_mut() = Some(responder);
        Ok(())
    });

    let call = proto::build_call(
        20,
        0,
        0,
        &OutTarget::ImportedCap(export),
        PointerReader::new_default(),
        &mut |i| Ok(i),
        &[],
    )
    .unwrap();
    peer.handle_frame(&call).unwrap();
    assert!(sent.borrow().is_empty(), "answer is deferred");

    peer.handle_frame(&proto::build_third_party_answer(20).unwrap())
        .unwrap();
    assert_eq!(peer.third_party_completion(20), Some(Vec::new()));
}

#[test]
fn promise_pipelining_targets_pending_results() {
    let (peer, sent) = recording_peer();

    let question = peer
        .send_call(
            &Request::new(CallTarget::Import(3), 0xcafe, 2),
            |_params| Ok(()),
            |_outcome| {},
        )
        .unwrap();
    let promise: cornerstone_rpc::Promise<()> = cornerstone_rpc::Promise::new(question);

    // A second call addressed through the promise, before any return.
    peer.send_call(
        &Request::new(promise.pipeline_field(0), 0xcafe, 3),
        |_params| Ok(()),
        |_outcome| {},
    )
    .unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), 2);
    let mut slice = &frames[1][..];
    let message =
        cornerstone::serialize::read_message_from_flat_slice(&mut slice, ReaderOptions::new())
            .unwrap();
    let Incoming::Call(call) = proto::decode(&message).unwrap() else {
        panic!("expected a call");
    };
    match call.get_target().unwrap().which().unwrap() {
        proto::TargetWhich::PromisedAnswer(promised) => {
            assert_eq!(promised.get_question_id(), question);
            assert_eq!(
                promised.get_ops().unwrap(),
                vec![cornerstone_rpc::PipelineOp::GetPointerField(0)]
            );
        }
        _ => panic!("expected a promised-answer target"),
    }
}
