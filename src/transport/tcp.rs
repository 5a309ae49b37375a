//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//
// transport/tcp.rs - TCP transport implementation
//
// Provides TCP-based transport for the Fluent Forward wire protocol.

use super::{Transport, TransportConfig};
use crate::error::{FluentError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// TCP transport implementation.
pub struct TcpTransport {
    config: TransportConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Create a new TCP transport with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Wrap an already-connected stream (used on the server side, where the
    /// listener hands us an accepted connection rather than us dialing out).
    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> Result<Self> {
        stream.set_nodelay(true).map_err(FluentError::Io)?;
        Ok(Self {
            config,
            stream: Some(stream),
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FluentError::Write("connection timed out".into()))?
            .map_err(FluentError::Io)?;

        stream.set_nodelay(true).map_err(FluentError::Io)?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.config.max_message_size {
            return Err(FluentError::Write(format!(
                "message too large: {} bytes (max {})",
                bytes.len(),
                self.config.max_message_size
            )));
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FluentError::Write("transport not connected".into()))?;

        stream
            .write_all(bytes)
            .await
            .map_err(|e| FluentError::Write(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| FluentError::Write(e.to_string()))?;

        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FluentError::Write("transport not connected".into()))?;

        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let n = timeout(read_timeout, stream.read(buf))
            .await
            .map_err(|_| FluentError::Write("read timed out".into()))?
            .map_err(FluentError::Io)?;
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.map_err(FluentError::Io)?;
        }
        Ok(())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream
            .as_ref()
            .ok_or_else(|| FluentError::Write("transport not connected".into()))?
            .peer_addr()
            .map_err(FluentError::Io)
    }
}
