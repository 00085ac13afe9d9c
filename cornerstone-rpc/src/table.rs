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

//! Per-connection capability bookkeeping: exports, imports, questions, and
//! the stable store for promised-answer transform ops.

use std::collections::HashMap;

/// Id-keyed slot table for ids we allocate (exports, questions). Ids are
/// handed out monotonically and reused only after a full release.
pub(crate) struct SlotTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn push(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id as usize].is_none());
                self.slots[id as usize] = Some(value);
                id
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize)?.take();
        if value.is_some() {
            self.free.push(id);
        }
        value
    }

    pub fn clear(&mut self) -> Vec<T> {
        self.free.clear();
        self.slots.drain(..).flatten().collect()
    }
}

/// A capability this vat has exposed to the peer.
pub(crate) struct Export {
    pub refcount: u32,
    pub is_promise: bool,
}

/// A capability the peer hosts and this vat references. Keyed by the peer's
/// export id.
pub(crate) struct Import {
    pub refcount: u32,
    pub is_promise: bool,
    pub resolution: Option<ImportResolution>,
}

/// Final state of a `senderPromise` import after `Resolve`.
pub(crate) enum ImportResolution {
    /// Resolved to another capability, described by the peer.
    Cap(crate::InboundCap),
    Exception(cornerstone::Error),
}

pub(crate) type ImportTable = HashMap<u32, Import>;

/// Stable storage for promised-answer transform op lists, so frames that
/// refer to an answer keep working after the original frame is gone.
pub(crate) struct ReceiverAnswerStore {
    entries: SlotTable<StoredAnswer>,
}

pub(crate) struct StoredAnswer {
    pub answer_id: u32,
    pub ops: Vec<crate::PipelineOp>,
}

impl ReceiverAnswerStore {
    pub fn new() -> Self {
        Self {
            entries: SlotTable::new(),
        }
    }

    /// Copies `ops` into stable storage, returning a handle usable for the
    /// rest of the connection's life.
    pub fn note(&mut self, answer_id: u32, ops: Vec<crate::PipelineOp>) -> u32 {
        self.entries.push(StoredAnswer { answer_id, ops })
    }

    pub fn get(&self, handle: u32) -> Option<&StoredAnswer> {
        self.entries.get(handle)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ids_are_monotonic_until_released() {
        let mut table: SlotTable<&str> = SlotTable::new();
        assert_eq!(table.push("a"), 0);
        assert_eq!(table.push("b"), 1);
        assert_eq!(table.push("c"), 2);

        assert_eq!(table.erase(1), Some("b"));
        assert!(table.get(1).is_none());
        // The freed id is reused before any new id is minted.
        assert_eq!(table.push("d"), 1);
        assert_eq!(table.push("e"), 3);
    }

    #[test]
    fn erase_twice_is_harmless() {
        let mut table: SlotTable<u8> = SlotTable::new();
        let id = table.push(9);
        assert_eq!(table.erase(id), Some(9));
        assert_eq!(table.erase(id), None);
        assert_eq!(table.erase(999), None);
    }

    #[test]
    fn receiver_answer_store_retains_ops() {
        let mut store = ReceiverAnswerStore::new();
        let handle = store.note(7, vec![crate::PipelineOp::GetPointerField(2)]);
        let stored = store.get(handle).unwrap();
        assert_eq!(stored.answer_id, 7);
        assert_eq!(stored.ops, vec![crate::PipelineOp::GetPointerField(2)]);
    }
}
