//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! CLI demo: reads newline-delimited text from stdin and emits each line
//! as one event to a forward-protocol server.

use anyhow::{Context, Result};
use clap::Parser;
use fluent_forward::client::{AckConfig, ClientConfig, EmitTimestamp, FluentClient};
use fluent_forward::codec::EventMode;
use fluent_forward::queue::QueueLimits;
use fluent_forward::retry::{BackoffConfig, RetryPolicy};
use fluent_forward::socket::{tcp_socket, AuthConfig};
use fluent_forward::{Record, DEFAULT_PORT};
use std::io::BufRead;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fluent-client", version, about = "Fluentd Forward Protocol demo client")]
struct Args {
    /// Server address to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Tag prefix applied to every emitted event.
    #[arg(long, default_value = "demo")]
    tag_prefix: String,

    /// Shared key for the handshake, if the server requires one.
    #[arg(long, default_value = "")]
    shared_key: String,

    /// Wait for an ack on every emitted chunk.
    #[arg(long)]
    ack: bool,

    /// Event mode: message, forward, packed_forward, compressed_packed_forward.
    #[arg(long, default_value = "forward")]
    event_mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid host/port")?;

    let event_mode: EventMode = args.event_mode.parse().context("invalid event mode")?;

    let config = ClientConfig {
        tag_prefix: Some(args.tag_prefix),
        event_mode,
        ack: args.ack.then_some(AckConfig {
            timeout: Duration::from_secs(5),
        }),
        queue_limits: QueueLimits::default(),
        write_retry: Some(RetryPolicy::new(BackoffConfig::default())),
        ..ClientConfig::default()
    };

    let auth = AuthConfig {
        shared_key: args.shared_key.into_bytes(),
        client_hostname: hostname(),
        username: String::new(),
        password: String::new(),
    };

    let socket = tcp_socket(addr, RetryPolicy::new(BackoffConfig::default()));
    let client = FluentClient::spawn(config, auth, socket);

    let mut events = client.socket_on();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "socket event");
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let mut record = Record::new();
        record.insert("message", line.as_str());
        let rx = client.emit(None, record, None::<EmitTimestamp>);
        if args.ack {
            let settlement = rx.await.context("emit handle dropped")?;
            tracing::info!(?settlement, "emit settled");
        }
    }

    client.shutdown().await;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fluent-client".to_string())
}
