mod cache;
mod config;
mod error;
mod flood;
mod forwarder;
mod proto;
mod server;

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::AnswerCache;
use crate::config::{Overrides, build_settings};
use crate::flood::FloodGuard;
use crate::forwarder::{Forwarder, UpstreamClient};
use crate::server::{Server, bind_udp};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Caching DNS server. Only works as a forwarder.",
    after_help = "Usage example: floodcache 8.8.8.8"
)]
struct Args {
    /// Upstream DNS server every cache miss is forwarded to
    server: Option<String>,
    /// Port of the upstream DNS server [default: 53]
    #[arg(short = 'p', value_name = "SERVER_PORT")]
    upstream_port: Option<u16>,
    /// Port to listen on for incoming queries [default: 53]
    #[arg(short = 'l', value_name = "LISTEN_PORT")]
    listen_port: Option<u16>,
    /// Seconds to wait for an upstream answer [default: 5]
    #[arg(short = 't', value_name = "TIMEOUT")]
    timeout: Option<u64>,
    /// Optional JSON config file; command-line values take precedence
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let settings = build_settings(
        args.config.as_deref(),
        Overrides {
            upstream: args.server,
            upstream_port: args.upstream_port,
            listen_port: args.listen_port,
            timeout_secs: args.timeout,
        },
    )
    .context("load settings")?;

    let listen = settings.listen_socket_addr();
    let socket = bind_udp(listen).map_err(|err| {
        if err.kind() == ErrorKind::PermissionDenied {
            anyhow::anyhow!(
                "not permitted to bind {listen}: use a port above 1024 \
                 or run with elevated privileges"
            )
        } else {
            anyhow::Error::new(err).context(format!("bind udp {listen}"))
        }
    })?;

    let upstream_addr = settings.resolve_upstream().await?;
    let upstream = UpstreamClient::connect(upstream_addr, settings.upstream_timeout())
        .await
        .with_context(|| format!("open upstream socket to {upstream_addr}"))?;
    let forwarder = Forwarder::new(AnswerCache::new(settings.cache_capacity), upstream);
    let flood = FloodGuard::new(settings.flood_window(), settings.flood_max_repeats);
    let mut server = Server::new(socket, forwarder, flood, settings.poll_interval());

    let bound = server.local_addr().context("read bound address")?;
    info!(listen = %bound, upstream = %upstream_addr, "dns server started");

    tokio::select! {
        _ = server.run() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("wait for shutdown signal")?;
            info!("dns server shut down");
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
