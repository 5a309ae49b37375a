//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Maps in-flight chunk ids to the result handles waiting on their ack,
//! with per-chunk timeout and bulk cancellation on shutdown.

use crate::error::{FluentError, SharedError};
use crate::queue::{ResultSender, Settlement};
use std::collections::HashMap;
use std::time::Instant;

struct InFlight {
    results: Vec<ResultSender>,
    deadline: Instant,
}

/// Tracks chunks written to the socket while awaiting their ack.
#[derive(Default)]
pub struct AckTracker {
    inflight: HashMap<String, InFlight>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chunk_id: String, results: Vec<ResultSender>, deadline: Instant) {
        self.inflight.insert(chunk_id, InFlight { results, deadline });
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Settle every handle for `chunk_id` as delivered. No-op (with a
    /// `false` return) if the chunk is unknown — e.g. a duplicate or
    /// late ack after timeout already fired.
    pub fn resolve(&mut self, chunk_id: &str) -> bool {
        if let Some(entry) = self.inflight.remove(chunk_id) {
            for result in entry.results {
                let _ = result.send(Settlement::Delivered);
            }
            true
        } else {
            false
        }
    }

    /// Reject every in-flight chunk with the same shared error — used on
    /// socket disconnect (`AckShutdownError`) and client shutdown.
    pub fn cancel_all(&mut self, err: SharedError) {
        for (_, entry) in self.inflight.drain() {
            for result in entry.results {
                let _ = result.send(Settlement::Failed(err.clone()));
            }
        }
    }

    /// Drive expiry: settle any chunk whose deadline has passed with
    /// `AckTimeoutError`, and drop it from the in-flight map.
    pub fn on_timer_tick(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for chunk_id in expired {
            if let Some(entry) = self.inflight.remove(&chunk_id) {
                let err: SharedError = FluentError::AckTimeout {
                    chunk_id: chunk_id.clone(),
                }
                .into();
                for result in entry.results {
                    let _ = result.send(Settlement::Failed(err.clone()));
                }
            }
        }
    }

    /// The earliest deadline among in-flight chunks, if any — used to size
    /// the next timer tick rather than polling on a fixed interval.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight.values().map(|e| e.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn resolve_settles_all_handles_as_delivered() {
        let mut tracker = AckTracker::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.register(
            "chunk1".into(),
            vec![tx1, tx2],
            Instant::now() + Duration::from_secs(10),
        );

        assert!(tracker.resolve("chunk1"));
        assert!(matches!(rx1.await.unwrap(), Settlement::Delivered));
        assert!(matches!(rx2.await.unwrap(), Settlement::Delivered));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn unknown_chunk_resolve_is_noop() {
        let mut tracker = AckTracker::new();
        assert!(!tracker.resolve("nope"));
    }

    #[tokio::test]
    async fn timeout_settles_with_ack_timeout_error() {
        let mut tracker = AckTracker::new();
        let (tx, rx) = oneshot::channel();
        let past = Instant::now() - Duration::from_secs(1);
        tracker.register("chunk1".into(), vec![tx], past);

        tracker.on_timer_tick(Instant::now());
        match rx.await.unwrap() {
            Settlement::Failed(e) => assert!(matches!(&*e.0, FluentError::AckTimeout { .. })),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_rejects_every_inflight_chunk() {
        let mut tracker = AckTracker::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.register("c1".into(), vec![tx1], Instant::now() + Duration::from_secs(5));
        tracker.register("c2".into(), vec![tx2], Instant::now() + Duration::from_secs(5));

        tracker.cancel_all(
            FluentError::AckShutdown {
                chunk_id: "*".into(),
            }
            .into(),
        );

        assert!(matches!(rx1.await.unwrap(), Settlement::Failed(_)));
        assert!(matches!(rx2.await.unwrap(), Settlement::Failed(_)));
        assert!(tracker.is_empty());
    }
}
