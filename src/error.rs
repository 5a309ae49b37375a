//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Unified error hierarchy for the Fluent Forward client/server.

use thiserror::Error;

/// Error kinds surfaced across the client and server cores.
///
/// The taxonomy is intentionally flat: every kind here maps to exactly one
/// row in the protocol's error table, and call sites match on kind rather
/// than threading separate error enums through each component.
#[derive(Error, Debug)]
pub enum FluentError {
    /// Invalid construction option (event mode, queue limits, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid record or timestamp passed to `emit`.
    #[error("invalid event data: {0}")]
    DataType(String),

    /// Queue limit exceeded, or the client has shut down.
    #[error("event dropped: {0}")]
    Dropped(String),

    /// Ack deadline elapsed before the chunk was acknowledged.
    #[error("ack timed out waiting for chunk {chunk_id}")]
    AckTimeout { chunk_id: String },

    /// Socket closed (or client shut down) while a chunk's ack was pending.
    #[error("ack shutdown for chunk {chunk_id}")]
    AckShutdown { chunk_id: String },

    /// Auth digest mismatch, or a handshake frame arrived out of order.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Transport-level write failure.
    #[error("write failed: {0}")]
    Write(String),

    /// The decoder encountered a top-level value shape it doesn't recognize.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Out-of-range EventTime seconds (>= 2^32).
    #[error("event time out of range: {0}")]
    EventTimeRange(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FluentError>;

impl FluentError {
    pub fn dropped(reason: impl Into<String>) -> Self {
        FluentError::Dropped(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        FluentError::Config(reason.into())
    }

    pub fn data_type(reason: impl Into<String>) -> Self {
        FluentError::DataType(reason.into())
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        FluentError::Handshake(reason.into())
    }
}

/// Cheaply cloneable error, used when the same failure must settle many
/// pending result handles (a dropped chunk rejects every entry it carried).
#[derive(Clone, Debug)]
pub struct SharedError(pub std::sync::Arc<FluentError>);

impl From<FluentError> for SharedError {
    fn from(e: FluentError) -> Self {
        SharedError(std::sync::Arc::new(e))
    }
}

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedError {}
