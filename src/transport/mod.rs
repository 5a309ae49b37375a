//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//
// transport/mod.rs - Transport abstraction for the Fluent Forward client/server
//
// Provides a pluggable byte-stream transport interface so the managed socket
// doesn't know or care whether it's driving a plain TCP connection or
// something else entirely.

use crate::error::Result;
use std::net::SocketAddr;

pub mod tcp;

/// A bidirectional ordered byte channel: connect, write, read, close.
///
/// This is the "Stream transport" external collaborator from the protocol
/// spec — the managed socket consumes an already-established channel like
/// this one and layers handshake/framing semantics on top of it.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, addr: SocketAddr) -> Result<()>;

    /// Write `bytes` to the channel, returning once they've been handed to
    /// the OS (not necessarily acked by the peer).
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read whatever bytes are currently available into `buf`, returning the
    /// count read. `Ok(0)` signals the peer closed the channel (end).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;

    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// Transport configuration options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}
