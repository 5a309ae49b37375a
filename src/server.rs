//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Accept loop and per-connection state machine for the forward protocol
//! server: HELO, verify PING, PONG, then decode-and-dispatch entries.

use crate::auth::{digests_match, random_bytes, shared_key_hexdigest};
use crate::codec::{
    decode_entry_frame, decode_ping, encode_ack, encode_helo, encode_pong, EntryFrame, Helo, Pong,
    StreamDecoder,
};
use crate::error::{FluentError, Result};
use crate::event_time::EventTime;
use crate::record::Record;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Credential verification handed to the server by its caller.
///
/// `authorize` checks a username/password pair when user auth is
/// configured (`auth_salt` is `Some`); it's never consulted otherwise.
pub struct Security {
    pub server_hostname: String,
    pub shared_key: Vec<u8>,
    pub auth_salt: Option<Vec<u8>>,
    pub authorize: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            server_hostname: "fluent-forward-server".into(),
            shared_key: Vec::new(),
            auth_salt: None,
            authorize: Arc::new(|_, _| true),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub security: Arc<Security>,
    pub keepalive: bool,
    /// How long a connection may sit idle (no new frame) before the server
    /// drops it. Guards against a client that completes the handshake and
    /// then never sends anything, which would otherwise leak the task.
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            security: Arc::new(Security::default()),
            keepalive: true,
            read_timeout: Duration::from_millis(30_000),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `FLUENT_*` environment variables, loading a
    /// `.env` file first if one is present. Mirrors the platform service's
    /// `Config::from_env` convention. The listen port is returned alongside
    /// the config since [`FluentServer::listen`] takes it as a separate
    /// argument.
    pub fn from_env() -> anyhow::Result<(Self, u16)> {
        dotenvy::dotenv().ok();

        let port = std::env::var("FLUENT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::DEFAULT_PORT);

        let server_hostname = std::env::var("FLUENT_HOSTNAME")
            .unwrap_or_else(|_| "fluent-forward-server".to_string());

        let shared_key = std::env::var("FLUENT_SHARED_KEY")
            .unwrap_or_default()
            .into_bytes();

        let keepalive = std::env::var("FLUENT_KEEPALIVE")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE"))
            .unwrap_or(true);

        let read_timeout_ms: u64 = std::env::var("FLUENT_READ_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);

        let security = Security {
            server_hostname,
            shared_key,
            auth_salt: None,
            authorize: Arc::new(|_, _| true),
        };

        Ok((
            ServerConfig {
                security: Arc::new(security),
                keepalive,
                read_timeout: Duration::from_millis(read_timeout_ms),
            },
            port,
        ))
    }
}

/// Invoked once per decoded frame with its tag and entries. Handlers run
/// sequentially per connection; a connection's entries are always
/// delivered in wire order.
pub type OnEntries = Arc<dyn Fn(&str, &[(EventTime, Record)]) + Send + Sync>;

pub struct FluentServer {
    config: ServerConfig,
    on_entries: OnEntries,
}

impl FluentServer {
    pub fn new(config: ServerConfig, on_entries: OnEntries) -> Self {
        Self { config, on_entries }
    }

    pub async fn listen(self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(FluentError::Io)?;
        info!(port, "listening for forward protocol connections");
        let server = Arc::new(self);

        loop {
            let (stream, peer) = listener.accept().await.map_err(FluentError::Io)?;
            stream.set_nodelay(true).map_err(FluentError::Io)?;
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    warn!(%peer, error = %e, "connection closed with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!(%peer, "accepted connection");
        let nonce = random_bytes(16);
        let auth_salt = self.config.security.auth_salt.clone();

        let helo = Helo {
            nonce: nonce.clone(),
            auth_salt: auth_salt.clone(),
            keepalive: self.config.keepalive,
        };
        stream.write_all(&encode_helo(&helo)?).await.map_err(FluentError::Io)?;

        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 64 * 1024];
        let ping_value = read_one_frame(&mut stream, &mut decoder, &mut buf).await?;
        let ping = decode_ping(&ping_value)?;

        let (auth_ok, reason) = self.verify(&ping, &nonce, &auth_salt);

        let response_digest = shared_key_hexdigest(
            &nonce,
            &self.config.security.server_hostname,
            &ping.shared_key_salt,
            &self.config.security.shared_key,
        );
        let pong = Pong {
            auth_ok,
            reason: reason.clone(),
            hostname: self.config.security.server_hostname.clone(),
            shared_key_hexdigest: response_digest,
        };
        stream.write_all(&encode_pong(&pong)?).await.map_err(FluentError::Io)?;

        if !auth_ok {
            return Err(FluentError::handshake(reason));
        }

        loop {
            let value = match timeout(
                self.config.read_timeout,
                read_one_frame(&mut stream, &mut decoder, &mut buf),
            )
            .await
            {
                Ok(Ok(v)) => v,
                Ok(Err(FluentError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(%peer, "connection closed by peer");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(%peer, "closing idle connection");
                    return Ok(());
                }
            };

            let frame: EntryFrame = decode_entry_frame(&value)?;
            (self.on_entries)(&frame.tag, &frame.entries);

            if let Some(chunk_id) = &frame.chunk {
                stream
                    .write_all(&encode_ack(chunk_id)?)
                    .await
                    .map_err(FluentError::Io)?;
            }

            if !self.config.keepalive {
                return Ok(());
            }
        }
    }

    fn verify(&self, ping: &crate::codec::Ping, nonce: &[u8], auth_salt: &Option<Vec<u8>>) -> (bool, String) {
        let expected_shared = shared_key_hexdigest(
            &ping.shared_key_salt,
            &ping.client_hostname,
            nonce,
            &self.config.security.shared_key,
        );
        if !digests_match(&expected_shared, &ping.shared_key_hexdigest) {
            return (false, "shared key mismatch".into());
        }

        if auth_salt.is_some() {
            // The client sends a password digest it derived itself; a hash
            // can't be inverted, so credential checks delegate to the
            // caller's `authorize` callback rather than comparing here.
            if !(self.config.security.authorize)(&ping.username, &ping.password_hexdigest) {
                return (false, "invalid credentials".into());
            }
        }

        (true, String::new())
    }
}

async fn read_one_frame(
    stream: &mut TcpStream,
    decoder: &mut StreamDecoder,
    buf: &mut [u8],
) -> Result<rmpv::Value> {
    loop {
        let mut values = decoder.drain()?;
        if !values.is_empty() {
            return Ok(values.remove(0));
        }
        let n = stream.read(buf).await.map_err(FluentError::Io)?;
        if n == 0 {
            return Err(FluentError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        decoder.feed(&buf[..n]);
    }
}
