//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! CLI demo: runs a forward-protocol server that logs every decoded entry
//! to stdout via `tracing`.

use anyhow::{Context, Result};
use clap::Parser;
use fluent_forward::server::{FluentServer, Security, ServerConfig};
use fluent_forward::DEFAULT_PORT;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fluent-server", version, about = "Fluentd Forward Protocol demo server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Hostname this server reports to clients during the handshake.
    #[arg(long, default_value = "fluent-forward-server")]
    hostname: String,

    /// Shared key clients must present. Empty means no shared-key auth.
    #[arg(long, default_value = "")]
    shared_key: String,

    /// Close each connection after one batch instead of keeping it open.
    #[arg(long)]
    no_keepalive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let security = Security {
        server_hostname: args.hostname,
        shared_key: args.shared_key.into_bytes(),
        auth_salt: None,
        authorize: Arc::new(|_, _| true),
    };
    let config = ServerConfig {
        security: Arc::new(security),
        keepalive: !args.no_keepalive,
        ..ServerConfig::default()
    };

    let server = FluentServer::new(
        config,
        Arc::new(|tag, entries| {
            for (time, record) in entries {
                tracing::info!(tag, ?time, ?record, "received entry");
            }
        }),
    );

    server
        .listen(args.port)
        .await
        .context("forward protocol server exited")?;
    Ok(())
}
