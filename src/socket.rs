//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! The managed socket: owns one transport, drives the connect/handshake/
//! reconnect lifecycle, and frames the stream of inbound MessagePack values.
//!
//! There is no background task here. A `FluentClient` drives this state
//! machine from its own single run loop; every suspension point (dialing,
//! the handshake round-trip, a backoff sleep) is an `.await` inside that
//! loop, not a hand-off to another task.

use crate::auth::{password_hexdigest, random_bytes, shared_key_hexdigest};
use crate::codec::{decode_helo, decode_pong, encode_ping, Ping, StreamDecoder};
use crate::error::{FluentError, Result};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{Transport, TransportConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Handshaking,
    Established,
    Closing,
    Fatal,
}

/// Result of one non-blocking [`ManagedSocket::connect_once`] attempt.
#[derive(Debug)]
pub enum ConnectOutcome {
    Established,
    /// The attempt failed but the retry policy says to try again after
    /// `delay`; the error is carried along so the caller can surface it.
    RetryAfter(Duration, FluentError),
    /// The retry policy gave up; the socket is now `Fatal`.
    GiveUp(FluentError),
}

/// Credentials offered during the PING/PONG handshake. `shared_key` and
/// `username`/`password` are independent; either may be empty when that
/// auth layer isn't configured on the server.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub shared_key: Vec<u8>,
    pub client_hostname: String,
    pub username: String,
    pub password: String,
}

pub struct ManagedSocket {
    transport: Box<dyn Transport>,
    addr: SocketAddr,
    state: SocketState,
    decoder: StreamDecoder,
    retry: RetryPolicy,
    attempt: u32,
    read_buf: Vec<u8>,
}

impl ManagedSocket {
    pub fn new(transport: Box<dyn Transport>, addr: SocketAddr, retry: RetryPolicy) -> Self {
        Self {
            transport,
            addr,
            state: SocketState::Disconnected,
            decoder: StreamDecoder::new(),
            retry,
            attempt: 0,
            read_buf: vec![0u8; 64 * 1024],
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_writable(&self) -> bool {
        self.state == SocketState::Established
    }

    /// Dial and complete the HELO/PING/PONG handshake, retrying the dial
    /// with exponential backoff on failure. Returns once the socket is
    /// `Established`, or `FluentError::Handshake` if the server rejected
    /// our credentials (a non-retryable outcome — the caller decides
    /// whether to give up entirely).
    ///
    /// This blocks for as long as the retry policy keeps retrying — fine
    /// for a caller with nothing else to service while connecting, but the
    /// client core drives reconnection through [`Self::connect_once`]
    /// instead, so its run loop stays responsive to commands and timers
    /// while a backoff delay elapses.
    pub async fn connect(&mut self, auth: &AuthConfig) -> Result<()> {
        loop {
            match self.connect_once(auth).await {
                ConnectOutcome::Established => return Ok(()),
                ConnectOutcome::RetryAfter(delay, _err) => {
                    debug!(?delay, "backing off before reconnect");
                    sleep(delay).await;
                }
                ConnectOutcome::GiveUp(err) => return Err(err),
            }
        }
    }

    /// Attempt the dial/handshake exactly once — no internal backoff sleep.
    /// The caller consults the returned [`ConnectOutcome`] to decide what
    /// to do next (wait out a delay, stop, or proceed).
    pub async fn connect_once(&mut self, auth: &AuthConfig) -> ConnectOutcome {
        if self.state == SocketState::Fatal {
            return ConnectOutcome::GiveUp(FluentError::Handshake(
                "socket is fatal; reconnect is disabled after exhausting maxReconnectAttempts"
                    .into(),
            ));
        }

        self.state = SocketState::Connecting;
        self.attempt += 1;

        match self.dial_and_handshake(auth).await {
            Ok(()) => {
                self.state = SocketState::Established;
                self.attempt = 0;
                ConnectOutcome::Established
            }
            Err(err) => {
                // HandshakeError is retried like any other connect failure, up to
                // the configured attempt cap — a single bad digest doesn't
                // necessarily mean the server will reject us forever (e.g. a
                // mid-rotation shared key on the server side).
                warn!(attempt = self.attempt, error = %err, "connect attempt failed");
                match self.retry.decide(self.attempt) {
                    RetryDecision::RetryAfter(delay) => {
                        self.state = SocketState::Disconnected;
                        ConnectOutcome::RetryAfter(delay, err)
                    }
                    RetryDecision::GiveUp => {
                        self.state = SocketState::Fatal;
                        ConnectOutcome::GiveUp(err)
                    }
                }
            }
        }
    }

    async fn dial_and_handshake(&mut self, auth: &AuthConfig) -> Result<()> {
        self.transport.connect(self.addr).await?;
        self.state = SocketState::Handshaking;
        self.decoder = StreamDecoder::new();

        let helo = self.read_frame_raw(decode_helo).await?;
        info!(keepalive = helo.keepalive, "received HELO");

        let shared_key_salt = random_bytes(16);
        let shared_key_hexdigest = shared_key_hexdigest(
            &shared_key_salt,
            &auth.client_hostname,
            &helo.nonce,
            &auth.shared_key,
        );
        let password_hexdigest = match &helo.auth_salt {
            Some(salt) => password_hexdigest(salt, &auth.username, &auth.password),
            None => String::new(),
        };

        let ping = Ping {
            client_hostname: auth.client_hostname.clone(),
            shared_key_salt: shared_key_salt.clone(),
            shared_key_hexdigest,
            username: auth.username.clone(),
            password_hexdigest,
        };
        let bytes = encode_ping(&ping)?;
        self.transport.write_all(&bytes).await?;

        let pong = self.read_frame_raw(decode_pong).await?;
        if !pong.auth_ok {
            return Err(FluentError::Handshake(if pong.reason.is_empty() {
                "server rejected credentials".into()
            } else {
                pong.reason
            }));
        }

        // Response digest covers (nonce, server hostname, our salt, shared key) —
        // a different field order than the PING digest, so the two can't be
        // replayed against each other.
        let expected = shared_key_hexdigest(&helo.nonce, &pong.hostname, &shared_key_salt, &auth.shared_key);
        if !crate::auth::digests_match(&expected, &pong.shared_key_hexdigest) {
            return Err(FluentError::Handshake("PONG digest mismatch".into()));
        }
        Ok(())
    }

    /// Block until one decodable value arrives and hand it to `decode`.
    /// Used only during the handshake, before steady-state framing begins.
    async fn read_frame_raw<T>(&mut self, decode: impl Fn(&rmpv::Value) -> Result<T>) -> Result<T> {
        loop {
            let values = self.decoder.drain()?;
            if let Some(value) = values.into_iter().next() {
                return decode(&value);
            }
            let n = self.transport.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(FluentError::Handshake("connection closed during handshake".into()));
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state != SocketState::Established {
            return Err(FluentError::Write("socket is not established".into()));
        }
        self.transport.write_all(bytes).await
    }

    /// Read the next framed MessagePack value off the wire, or `None` if
    /// the peer closed the connection (end). Cancellation-safe: if the
    /// caller drops this future mid-poll (e.g. a `select!` branch lost the
    /// race), no bytes already decoded into `decoder` are lost.
    pub async fn read_frame(&mut self) -> Result<Option<rmpv::Value>> {
        loop {
            let mut values = self.decoder.drain()?;
            if !values.is_empty() {
                return Ok(Some(values.remove(0)));
            }
            let n = self.transport.read(&mut self.read_buf).await?;
            if n == 0 {
                self.state = SocketState::Disconnected;
                return Ok(None);
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.state = SocketState::Closing;
        self.transport.close().await?;
        self.state = SocketState::Disconnected;
        Ok(())
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != SocketState::Fatal {
            self.state = SocketState::Disconnected;
        }
    }
}

/// Construct the default TCP-backed socket for `addr`.
pub fn tcp_socket(addr: SocketAddr, retry: RetryPolicy) -> ManagedSocket {
    let transport = crate::transport::tcp::TcpTransport::new(TransportConfig::default());
    ManagedSocket::new(Box::new(transport), addr, retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_helo, encode_pong, Helo, Pong};
    use crate::retry::BackoffConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_succeeds_against_a_cooperative_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let helo = Helo {
                nonce: b"nonce1234".to_vec(),
                auth_salt: None,
                keepalive: true,
            };
            stream.write_all(&encode_helo(&helo).unwrap()).await.unwrap();

            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let ping = crate::codec::decode_ping(
                &rmpv::decode::read_value(&mut std::io::Cursor::new(&buf[..n])).unwrap(),
            )
            .unwrap();

            let hostname = "srv".to_string();
            let response_digest = crate::auth::shared_key_hexdigest(
                &helo.nonce,
                &hostname,
                &ping.shared_key_salt,
                b"secret",
            );
            let pong = Pong {
                auth_ok: true,
                reason: String::new(),
                hostname,
                shared_key_hexdigest: response_digest,
            };
            stream.write_all(&encode_pong(&pong).unwrap()).await.unwrap();
        });

        let mut socket = tcp_socket(addr, RetryPolicy::new(BackoffConfig::default()));
        let auth = AuthConfig {
            shared_key: b"secret".to_vec(),
            client_hostname: "client1".into(),
            username: String::new(),
            password: String::new(),
        };
        socket.connect(&auth).await.unwrap();
        assert_eq!(socket.state(), SocketState::Established);
        assert!(socket.is_writable());

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_handshake_gives_up_after_configured_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let helo = Helo {
                nonce: b"nonce".to_vec(),
                auth_salt: Some(b"authsalt".to_vec()),
                keepalive: true,
            };
            stream.write_all(&encode_helo(&helo).unwrap()).await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            let pong = Pong {
                auth_ok: false,
                reason: "bad credentials".into(),
                hostname: "srv".into(),
                shared_key_hexdigest: String::new(),
            };
            stream.write_all(&encode_pong(&pong).unwrap()).await.unwrap();
        });

        let mut socket = tcp_socket(
            addr,
            RetryPolicy::new(BackoffConfig {
                max_attempts: Some(1),
                ..Default::default()
            }),
        );
        let err = socket.connect(&AuthConfig::default()).await.unwrap_err();
        assert!(matches!(err, FluentError::Handshake(_)));
        assert_eq!(socket.state(), SocketState::Fatal);
    }

    #[tokio::test]
    async fn give_up_after_max_attempts_against_a_dead_port() {
        // Bind and immediately drop, so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut socket = tcp_socket(
            addr,
            RetryPolicy::new(BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 1.0,
                jitter: 0.0,
                max_attempts: Some(2),
                on_error: None,
            }),
        );
        let err = socket.connect(&AuthConfig::default()).await.unwrap_err();
        assert!(matches!(err, FluentError::Io(_)));
        assert_eq!(socket.state(), SocketState::Fatal);
    }
}
