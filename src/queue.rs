//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! The per-tag bounded send queue: coalesces entries into pop-able chunks
//! and enforces the four independent size/length limits from the flush
//! trigger table.

use crate::codec::EventMode;
use crate::error::{FluentError, SharedError};
use crate::event_time::EventTime;
use crate::record::Record;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// What an `emit` call eventually settles to.
#[derive(Debug)]
pub enum Settlement {
    Delivered,
    Failed(SharedError),
}

pub type ResultSender = oneshot::Sender<Settlement>;
pub type ResultReceiver = oneshot::Receiver<Settlement>;

struct QueuedEntry {
    time: EventTime,
    record: Record,
    size: usize,
    result: ResultSender,
}

/// An optional `{size?, length?}` limit pair; either side may be unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeLengthLimit {
    pub size: Option<usize>,
    pub length: Option<usize>,
}

impl SizeLengthLimit {
    pub fn exceeded_by(&self, size: usize, length: usize) -> bool {
        self.size.map(|s| size > s).unwrap_or(false) || self.length.map(|l| length > l).unwrap_or(false)
    }

    pub fn is_unset(&self) -> bool {
        self.size.is_none() && self.length.is_none()
    }
}

/// The four independently-configurable queue limits.
#[derive(Debug, Clone, Default)]
pub struct QueueLimits {
    pub max: SizeLengthLimit,
    pub not_flushable: SizeLengthLimit,
    pub interval_flush: SizeLengthLimit,
    pub sync_flush: SizeLengthLimit,
}

/// Outcome of a `push`, telling the caller which flush trigger (if any)
/// fired as a side effect of this entry landing in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    None,
    /// Cancel the scheduled flush timer and flush immediately.
    Immediate,
    /// Flush in-line before `emit` returns to the caller.
    Sync,
}

/// A batch of entries popped for one tag, ready to be framed and written.
pub struct Chunk {
    pub tag: String,
    pub entries: Vec<(EventTime, Record)>,
    pub results: Vec<ResultSender>,
}

#[derive(Default)]
struct TagQueue {
    entries: VecDeque<QueuedEntry>,
    length: usize,
    size: usize,
}

/// Per-tag bounded queue with size/length limits and flush triggers.
pub struct SendQueue {
    tags: HashMap<String, TagQueue>,
    order: VecDeque<String>,
    limits: QueueLimits,
    total_length: usize,
    total_size: usize,
}

impl SendQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            tags: HashMap::new(),
            order: VecDeque::new(),
            limits,
            total_length: 0,
            total_size: 0,
        }
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn has_pending(&self) -> bool {
        self.total_length > 0
    }

    /// Enqueue one entry. Returns the flush trigger the caller should act on,
    /// or a rejection if a hard limit was exceeded by this entry.
    pub fn push(
        &mut self,
        tag: &str,
        time: EventTime,
        record: Record,
        socket_writable: bool,
        result: ResultSender,
    ) -> Result<FlushTrigger, (ResultSender, FluentError)> {
        let size = record.size_estimate();
        let tag_queue = self.tags.get(tag);
        let (cur_len, cur_size) = tag_queue.map(|q| (q.length, q.size)).unwrap_or((0, 0));

        let new_len = cur_len + 1;
        let new_size = cur_size + size;

        if self.limits.max.exceeded_by(new_size, new_len) {
            return Err((result, FluentError::dropped("sendQueueMaxLimit exceeded")));
        }
        if !socket_writable && self.limits.not_flushable.exceeded_by(new_size, new_len) {
            return Err((
                result,
                FluentError::dropped("sendQueueNotFlushableLimit exceeded"),
            ));
        }

        let entry = QueuedEntry {
            time,
            record,
            size,
            result,
        };

        let is_new_tag = !self.tags.contains_key(tag);
        let q = self.tags.entry(tag.to_string()).or_default();
        q.entries.push_back(entry);
        q.length = new_len;
        q.size = new_size;
        if is_new_tag {
            self.order.push_back(tag.to_string());
        }

        self.total_length += 1;
        self.total_size += size;

        if self.limits.interval_flush.exceeded_by(new_size, new_len) {
            return Ok(FlushTrigger::Immediate);
        }
        if self.limits.sync_flush.exceeded_by(new_size, new_len) {
            return Ok(FlushTrigger::Sync);
        }
        Ok(FlushTrigger::None)
    }

    /// Pop the oldest pending tag's entries, bounded by `max_size` (packed
    /// modes only) and `max_length`. `Message` mode returns at most one
    /// entry regardless of the limits.
    pub fn pop_chunk(
        &mut self,
        mode: EventMode,
        max_size: Option<usize>,
        max_length: Option<usize>,
    ) -> Option<Chunk> {
        let tag = self.order.front()?.clone();
        let q = self.tags.get_mut(&tag)?;

        let cap = if mode == EventMode::Message {
            1
        } else {
            max_length.unwrap_or(usize::MAX)
        };

        let mut entries = Vec::new();
        let mut results = Vec::new();
        let mut popped_size = 0usize;

        while let Some(front) = q.entries.front() {
            if entries.len() >= cap {
                break;
            }
            if mode != EventMode::Message {
                if let Some(limit) = max_size {
                    if popped_size + front.size > limit && !entries.is_empty() {
                        break;
                    }
                }
            }
            let popped = q.entries.pop_front().unwrap();
            popped_size += popped.size;
            q.length -= 1;
            q.size -= popped.size;
            entries.push((popped.time, popped.record));
            results.push(popped.result);
        }

        self.total_length -= entries.len();
        self.total_size -= popped_size;

        if q.entries.is_empty() {
            self.tags.remove(&tag);
            self.order.pop_front();
        } else {
            // Keep FIFO across tags: move this tag to the back so other
            // pending tags get a turn before we return to it.
            self.order.pop_front();
            self.order.push_back(tag.clone());
        }

        Some(Chunk {
            tag,
            entries,
            results,
        })
    }

    /// Reject and remove every pending entry across all tags.
    pub fn drop_all(&mut self, err: SharedError) {
        for (_, mut q) in self.tags.drain() {
            while let Some(entry) = q.entries.pop_front() {
                let _ = entry.result.send(Settlement::Failed(err.clone()));
            }
        }
        self.order.clear();
        self.total_length = 0;
        self.total_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> Record {
        let mut r = Record::new();
        r.insert("event", "foo bar");
        r
    }

    #[test]
    fn length_and_size_track_contents() {
        let mut q = SendQueue::new(QueueLimits::default());
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        q.push("a", EventTime::now(), rec(), true, tx1).unwrap();
        q.push("a", EventTime::now(), rec(), true, tx2).unwrap();
        assert_eq!(q.total_length(), 2);
        assert!(q.total_size() > 0);

        let chunk = q.pop_chunk(EventMode::Forward, None, None).unwrap();
        assert_eq!(chunk.entries.len(), 2);
        assert_eq!(q.total_length(), 0);
        assert_eq!(q.total_size(), 0);
    }

    #[test]
    fn max_limit_rejects_new_entry() {
        let mut q = SendQueue::new(QueueLimits {
            max: SizeLengthLimit {
                size: Some(20),
                length: None,
            },
            ..Default::default()
        });
        let (tx1, _rx1) = oneshot::channel();
        let err = q
            .push("a", EventTime::now(), rec(), false, tx1)
            .unwrap_err();
        assert!(matches!(err.1, FluentError::Dropped(_)));

        let mut small = Record::new();
        small.insert("e", "x");
        let (tx2, _rx2) = oneshot::channel();
        assert!(q.push("b", EventTime::now(), small, false, tx2).is_ok());
    }

    #[test]
    fn not_flushable_limit_only_applies_when_unwritable() {
        let mut q = SendQueue::new(QueueLimits {
            not_flushable: SizeLengthLimit {
                size: Some(1),
                length: None,
            },
            ..Default::default()
        });
        let (tx1, _rx1) = oneshot::channel();
        assert!(q.push("a", EventTime::now(), rec(), true, tx1).is_ok());

        let (tx2, _rx2) = oneshot::channel();
        assert!(q.push("a", EventTime::now(), rec(), false, tx2).is_err());
    }

    #[test]
    fn message_mode_pops_one_entry_at_a_time() {
        let mut q = SendQueue::new(QueueLimits::default());
        for _ in 0..3 {
            let (tx, _rx) = oneshot::channel();
            q.push("a", EventTime::now(), rec(), true, tx).unwrap();
        }
        let chunk = q.pop_chunk(EventMode::Message, None, None).unwrap();
        assert_eq!(chunk.entries.len(), 1);
        assert_eq!(q.total_length(), 2);
    }

    #[test]
    fn fifo_order_across_tags() {
        let mut q = SendQueue::new(QueueLimits::default());
        let (tx_a, _ra) = oneshot::channel();
        let (tx_b, _rb) = oneshot::channel();
        q.push("a", EventTime::now(), rec(), true, tx_a).unwrap();
        q.push("b", EventTime::now(), rec(), true, tx_b).unwrap();

        let first = q.pop_chunk(EventMode::Forward, None, None).unwrap();
        assert_eq!(first.tag, "a");
        let second = q.pop_chunk(EventMode::Forward, None, None).unwrap();
        assert_eq!(second.tag, "b");
    }

    #[test]
    fn drop_all_settles_every_handle() {
        let mut q = SendQueue::new(QueueLimits::default());
        let (tx, rx) = oneshot::channel();
        q.push("a", EventTime::now(), rec(), true, tx).unwrap();
        q.drop_all(FluentError::dropped("shutdown").into());

        let settlement = rx.try_recv().unwrap();
        assert!(matches!(settlement, Settlement::Failed(_)));
        assert_eq!(q.total_length(), 0);
        assert_eq!(q.total_size(), 0);
    }
}
