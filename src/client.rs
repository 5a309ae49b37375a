//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! The client core: a single task that owns the send queue, the ack
//! tracker, and the managed socket, reachable from the outside only
//! through a cheaply-cloneable [`ClientHandle`].
//!
//! This is the "single serializing task per client" from the concurrency
//! model expressed the idiomatic-tokio way: an actor task plus channels,
//! rather than a `Mutex` shared between callers.

use crate::ack::AckTracker;
use crate::codec::{encode_entries, EventMode};
use crate::error::{FluentError, Result, SharedError};
use crate::event_time::EventTime;
use crate::queue::{FlushTrigger, QueueLimits, ResultReceiver, ResultSender, SendQueue, Settlement};
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::socket::{AuthConfig, ConnectOutcome, ManagedSocket, SocketState};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, warn};

/// Timestamp as passed to `emit`, before it's coerced to an [`EventTime`].
#[derive(Debug, Clone)]
pub enum EmitTimestamp {
    /// An integer timestamp: epoch seconds, or epoch milliseconds if
    /// `milliseconds` is set in the client config.
    Integer(u64),
    Date(DateTime<Utc>),
}

/// The fixed registry of socket-derived signals a caller can subscribe to.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Writable,
    Ack(String),
    Error(String),
    End,
}

#[derive(Debug, Clone)]
pub struct AckConfig {
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub tag_prefix: Option<String>,
    pub event_mode: EventMode,
    pub milliseconds: bool,
    pub ack: Option<AckConfig>,
    pub flush_interval: Option<Duration>,
    pub queue_limits: QueueLimits,
    pub write_retry: Option<RetryPolicy>,
    pub wait_for_pending_on_disconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tag_prefix: None,
            event_mode: EventMode::Forward,
            milliseconds: false,
            ack: None,
            flush_interval: None,
            queue_limits: QueueLimits::default(),
            write_retry: None,
            wait_for_pending_on_disconnect: true,
        }
    }
}

enum Command {
    Emit {
        tag: String,
        time: EventTime,
        record: Record,
        reply: ResultSender,
    },
    Flush,
    SyncFlush {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable front door to a running client task.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    tag_prefix: Option<String>,
    milliseconds: bool,
}

impl ClientHandle {
    /// Coerce inputs, validate the record, and enqueue. The timestamp rule
    /// and tag-prefix rule run here (on the caller's task) since they need
    /// no access to shared state; only the queue push happens on the
    /// client's own task.
    pub fn emit(
        &self,
        suffix: Option<&str>,
        record: Record,
        timestamp: Option<EmitTimestamp>,
    ) -> ResultReceiver {
        let (tx, rx) = oneshot::channel();

        let time = match timestamp {
            None => EventTime::now(),
            Some(EmitTimestamp::Date(d)) => match EventTime::from_date(d) {
                Ok(t) => t,
                Err(e) => {
                    let _ = tx.send(Settlement::Failed(SharedError::from(e)));
                    return rx;
                }
            },
            Some(EmitTimestamp::Integer(v)) => {
                let parsed = if self.milliseconds {
                    EventTime::from_millis(v)
                } else {
                    EventTime::from_epoch(v, 0)
                };
                match parsed {
                    Ok(t) => t,
                    Err(e) => {
                        let _ = tx.send(Settlement::Failed(SharedError::from(e)));
                        return rx;
                    }
                }
            }
        };

        let tag = match (&self.tag_prefix, suffix) {
            (Some(prefix), Some(suffix)) => format!("{prefix}.{suffix}"),
            (Some(prefix), None) => prefix.clone(),
            (None, Some(suffix)) => suffix.to_string(),
            (None, None) => {
                let _ = tx.send(Settlement::Failed(
                    FluentError::data_type("emit requires a tag or tag_prefix").into(),
                ));
                return rx;
            }
        };

        let _ = self.commands.send(Command::Emit {
            tag,
            time,
            record,
            reply: tx,
        });
        rx
    }

    pub fn flush(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    pub async fn sync_flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::SyncFlush { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn socket_on(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// The actor state. Constructed and immediately handed to [`FluentClient::spawn`],
/// which moves it onto its own task and returns a [`ClientHandle`].
pub struct FluentClient {
    config: ClientConfig,
    auth: AuthConfig,
    socket: ManagedSocket,
    queue: SendQueue,
    tracker: AckTracker,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    was_writable: bool,
    flush_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    pending_disconnect: Option<oneshot::Sender<()>>,
}

impl FluentClient {
    /// Spawn the client actor and return a handle to it. The actor attempts
    /// its first connection lazily, on the first flush.
    pub fn spawn(config: ClientConfig, auth: AuthConfig, socket: ManagedSocket) -> ClientHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, _) = broadcast::channel(256);

        let handle = ClientHandle {
            commands: cmd_tx,
            events: evt_tx.clone(),
            tag_prefix: config.tag_prefix.clone(),
            milliseconds: config.milliseconds,
        };

        let actor = FluentClient {
            queue: SendQueue::new(config.queue_limits.clone()),
            tracker: AckTracker::new(),
            config,
            auth,
            socket,
            commands: cmd_rx,
            events: evt_tx,
            was_writable: false,
            flush_deadline: None,
            reconnect_deadline: None,
            pending_disconnect: None,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        loop {
            let ack_sleep = match self.tracker.next_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline.into()),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            let flush_sleep = match self.flush_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            let reconnect_sleep = match self.reconnect_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = self.socket.read_frame(), if self.socket.is_writable() => {
                    self.handle_inbound(frame).await;
                }
                _ = ack_sleep => {
                    self.tracker.on_timer_tick(Instant::now());
                }
                _ = flush_sleep => {
                    self.flush_deadline = None;
                    self.flush_now().await;
                }
                _ = reconnect_sleep => {
                    self.reconnect_deadline = None;
                    self.try_connect_once().await;
                    if self.socket.is_writable() {
                        self.flush_now().await;
                    }
                }
            }
        }
    }

    /// Returns `true` when the actor should terminate (after shutdown).
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Emit { tag, time, record, reply } => {
                self.ensure_connected().await;
                match self.queue.push(&tag, time, record, self.socket.is_writable(), reply) {
                    Ok(FlushTrigger::None) => {
                        if self.config.flush_interval.is_none() {
                            self.flush_now().await;
                        } else if self.flush_deadline.is_none() {
                            self.flush_deadline =
                                Some(Instant::now() + self.config.flush_interval.unwrap());
                        }
                    }
                    Ok(FlushTrigger::Immediate) => {
                        self.flush_deadline = None;
                        self.flush_now().await;
                    }
                    Ok(FlushTrigger::Sync) => {
                        self.flush_now().await;
                    }
                    Err((reply, err)) => {
                        let _ = reply.send(Settlement::Failed(err.into()));
                    }
                }
                false
            }
            Command::Flush => {
                self.flush_now().await;
                false
            }
            Command::SyncFlush { reply } => {
                self.flush_now().await;
                let _ = reply.send(());
                false
            }
            Command::Disconnect { reply } => {
                if self.config.wait_for_pending_on_disconnect && self.queue.has_pending() {
                    self.pending_disconnect = Some(reply);
                } else {
                    self.flush_now().await;
                    let _ = self.socket.close().await;
                    let _ = self.events.send(ClientEvent::End);
                    let _ = reply.send(());
                }
                false
            }
            Command::Shutdown { reply } => {
                self.flush_deadline = None;
                self.queue.drop_all(FluentError::dropped("client shutdown").into());
                self.tracker.cancel_all(
                    FluentError::AckShutdown {
                        chunk_id: "*".into(),
                    }
                    .into(),
                );
                let _ = self.socket.close().await;
                let _ = self.events.send(ClientEvent::End);
                let _ = reply.send(());
                true
            }
        }
    }

    async fn handle_inbound(&mut self, frame: Result<Option<rmpv::Value>>) {
        match frame {
            Ok(Some(value)) => match crate::codec::decode_ack(&value) {
                Ok(chunk_id) => {
                    if self.tracker.resolve(&chunk_id) {
                        let _ = self.events.send(ClientEvent::Ack(chunk_id));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "ignoring frame that is not an ack");
                }
            },
            Ok(None) => {
                self.on_disconnect().await;
            }
            Err(e) => {
                error!(error = %e, "socket read failed");
                let _ = self.events.send(ClientEvent::Error(e.to_string()));
                self.on_disconnect().await;
            }
        }
    }

    async fn on_disconnect(&mut self) {
        self.socket.mark_disconnected();
        self.tracker.cancel_all(
            FluentError::AckShutdown {
                chunk_id: "*".into(),
            }
            .into(),
        );
        let _ = self.events.send(ClientEvent::End);
    }

    /// Try to (re)connect if the socket is down and no backoff delay is
    /// currently in effect. A single dial/handshake attempt, never an
    /// internal retry loop — called from both the command handler (so an
    /// `emit` while disconnected tries immediately) and the reconnect
    /// timer (so a backed-off attempt retries without any command having
    /// to arrive first). Bounded by the transport's own connect/read
    /// timeouts rather than looping, so the run loop in `run()` keeps
    /// servicing commands and timers while the socket is down.
    async fn ensure_connected(&mut self) {
        if self.socket.is_writable() || self.socket.state() == SocketState::Fatal {
            return;
        }
        if let Some(deadline) = self.reconnect_deadline {
            if Instant::now() < deadline {
                return;
            }
        }
        self.try_connect_once().await;
    }

    async fn try_connect_once(&mut self) {
        match self.socket.connect_once(&self.auth).await {
            ConnectOutcome::Established => {
                self.reconnect_deadline = None;
                let _ = self.events.send(ClientEvent::Connected);
                if !self.was_writable {
                    let _ = self.events.send(ClientEvent::Writable);
                    self.was_writable = true;
                }
            }
            ConnectOutcome::RetryAfter(delay, err) => {
                warn!(error = %err, "client failed to (re)connect");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                self.was_writable = false;
                self.reconnect_deadline = Some(Instant::now() + delay);
            }
            ConnectOutcome::GiveUp(err) => {
                warn!(error = %err, "client gave up reconnecting");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                self.was_writable = false;
                self.reconnect_deadline = None;
            }
        }
    }

    /// Single-flight: pop and write chunks while the socket is writable and
    /// the queue has pending entries.
    async fn flush_now(&mut self) {
        while self.socket.is_writable() && self.queue.has_pending() {
            let (max_size, max_length) = (
                self.config.queue_limits.max.size,
                self.config.queue_limits.max.length,
            );
            let chunk = match self.queue.pop_chunk(self.config.event_mode, max_size, max_length) {
                Some(c) => c,
                None => break,
            };

            let chunk_id = self.config.ack.as_ref().map(|_| new_chunk_id());
            let bytes = match encode_entries(
                self.config.event_mode,
                &chunk.tag,
                &chunk.entries,
                chunk_id.as_deref(),
            ) {
                Ok(b) => b,
                Err(e) => {
                    let shared = SharedError::from(e);
                    for result in chunk.results {
                        let _ = result.send(Settlement::Failed(shared.clone()));
                    }
                    continue;
                }
            };

            match self.write_with_retry(&bytes).await {
                Ok(()) => match (&self.config.ack, chunk_id) {
                    (Some(ack_cfg), Some(chunk_id)) => {
                        self.tracker.register(
                            chunk_id,
                            chunk.results,
                            Instant::now() + ack_cfg.timeout,
                        );
                    }
                    _ => {
                        for result in chunk.results {
                            let _ = result.send(Settlement::Delivered);
                        }
                    }
                },
                Err(e) => {
                    self.socket.mark_disconnected();
                    let _ = self.events.send(ClientEvent::Error(e.to_string()));
                    let shared = SharedError::from(e);
                    for result in chunk.results {
                        let _ = result.send(Settlement::Failed(shared.clone()));
                    }
                    break;
                }
            }
        }

        if !self.queue.has_pending() {
            if let Some(reply) = self.pending_disconnect.take() {
                let _ = self.socket.close().await;
                let _ = self.events.send(ClientEvent::End);
                let _ = reply.send(());
            }
        }
    }

    /// Write `bytes`, retrying the same write per `eventRetry` if
    /// configured. A chunk write is the unit of retry: individual entries
    /// inside it are never retried separately.
    async fn write_with_retry(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(policy) = self.config.write_retry.clone() else {
            return self.socket.write(bytes).await;
        };

        let mut attempt = 0u32;
        loop {
            match self.socket.write(bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    policy.notify_error(&e, attempt);
                    match policy.decide(attempt) {
                        crate::retry::RetryDecision::RetryAfter(delay) => {
                            tokio::time::sleep(delay).await;
                        }
                        crate::retry::RetryDecision::GiveUp => return Err(e),
                    }
                }
            }
        }
    }
}

fn new_chunk_id() -> String {
    let bytes = crate::auth::random_bytes(16);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_helo, encode_pong, Helo, Pong};
    use crate::retry::BackoffConfig;
    use crate::transport::Transport;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    /// A transport that plays the server side of the handshake (computing a
    /// correct PONG digest against whatever salt the client's PING carries),
    /// then fails one post-handshake write before succeeding on the retry.
    struct FlakyTransport {
        helo_nonce: Vec<u8>,
        reads: VecDeque<Vec<u8>>,
        write_count: u32,
        fail_on_write: u32,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&mut self, _addr: SocketAddr) -> Result<()> {
            Ok(())
        }

        async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.write_count += 1;

            if self.write_count == 1 {
                let value = rmpv::decode::read_value(&mut std::io::Cursor::new(bytes))
                    .map_err(|e| FluentError::Handshake(e.to_string()))?;
                let ping = crate::codec::decode_ping(&value)?;
                let digest = crate::auth::shared_key_hexdigest(
                    &self.helo_nonce,
                    "srv",
                    &ping.shared_key_salt,
                    b"",
                );
                let pong = Pong {
                    auth_ok: true,
                    reason: String::new(),
                    hostname: "srv".into(),
                    shared_key_hexdigest: digest,
                };
                self.reads.push_back(encode_pong(&pong).unwrap());
                return Ok(());
            }

            if self.write_count == self.fail_on_write {
                return Err(FluentError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "simulated write failure",
                )));
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn write_retry_recovers_from_a_single_failed_write() {
        let helo = Helo {
            nonce: b"nonce1234".to_vec(),
            auth_salt: None,
            keepalive: true,
        };

        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = FlakyTransport {
            helo_nonce: helo.nonce.clone(),
            reads: VecDeque::from([encode_helo(&helo).unwrap()]),
            write_count: 0,
            // Call 1 is the handshake PING; call 2 is the first chunk write attempt.
            fail_on_write: 2,
            writes: writes.clone(),
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = ManagedSocket::new(
            Box::new(transport),
            addr,
            RetryPolicy::new(BackoffConfig::default()),
        );

        let config = ClientConfig {
            tag_prefix: Some("test".into()),
            write_retry: Some(RetryPolicy::new(BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 1.0,
                jitter: 0.0,
                max_attempts: Some(3),
                on_error: None,
            })),
            ..ClientConfig::default()
        };
        let handle = FluentClient::spawn(config, AuthConfig::default(), socket);

        let mut record = Record::new();
        record.insert("event", "retried");
        let rx = handle.emit(Some("foo"), record, None);
        let settlement = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(settlement, Settlement::Delivered));

        // Exactly one chunk reached the transport: the failed first attempt
        // never recorded bytes, so only the retried write shows up here.
        assert_eq!(writes.lock().unwrap().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn write_retry_invokes_on_error_exactly_once_per_failed_attempt() {
        let helo = Helo {
            nonce: b"nonce5678".to_vec(),
            auth_salt: None,
            keepalive: true,
        };

        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = FlakyTransport {
            helo_nonce: helo.nonce.clone(),
            reads: VecDeque::from([encode_helo(&helo).unwrap()]),
            write_count: 0,
            fail_on_write: 2,
            writes: writes.clone(),
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = ManagedSocket::new(
            Box::new(transport),
            addr,
            RetryPolicy::new(BackoffConfig::default()),
        );

        let error_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let error_count_clone = error_count.clone();
        let config = ClientConfig {
            tag_prefix: Some("test".into()),
            write_retry: Some(RetryPolicy::new(BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 1.0,
                jitter: 0.0,
                max_attempts: Some(3),
                on_error: Some(Arc::new(move |_err, _attempt| {
                    error_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })),
            })),
            ..ClientConfig::default()
        };
        let handle = FluentClient::spawn(config, AuthConfig::default(), socket);

        let mut record = Record::new();
        record.insert("event", "retried");
        let rx = handle.emit(Some("foo"), record, None);
        let settlement = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(settlement, Settlement::Delivered));
        assert_eq!(error_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        handle.shutdown().await;
    }
}
