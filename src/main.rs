// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use roo_sniffer::proxy::{run_proxy, ProxyState};
use roo_sniffer::{CertificateAuthority, Config, ObservationSink, WatchList};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "roo-sniffer")]
#[command(about = "Intercepting HTTP/HTTPS proxy that records API calls")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    listen_port: Option<u16>,

    /// Path to append request records as JSONL
    #[arg(long)]
    log: Option<String>,

    /// Watched domain substring; matching hosts are TLS-intercepted
    /// (repeatable)
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// Record request headers and response previews
    #[arg(long)]
    verbose: bool,

    /// Directory holding the CA certificate and key
    #[arg(long)]
    cert_dir: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    fn apply_over(self, mut cfg: Config) -> Config {
        if let Some(port) = self.listen_port {
            cfg.listen_port = port;
        }
        if let Some(log) = self.log {
            cfg.log_path = log;
        }
        if !self.watch.is_empty() {
            cfg.watch_domains = self.watch;
        }
        if self.verbose {
            cfg.verbose = true;
        }
        if let Some(dir) = self.cert_dir {
            cfg.cert_dir = dir;
        }
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // Config file first (defaults on failure), CLI flags override.
    let cfg = match args.config.clone() {
        Some(ref p) => {
            let file_cfg = Config::load_from_path(p).await.unwrap_or_else(|e| {
                warn!(%p, %e, "failed to load config, using defaults");
                Config::default()
            });
            args.apply_over(file_cfg)
        }
        None => args.apply_over(Config::default()),
    };
    cfg.validate()?;

    let ca = CertificateAuthority::load_or_init(Path::new(&cfg.cert_dir)).await?;
    info!(
        ca_cert = %ca.ca_cert_path().display(),
        "install this certificate as a trust root to intercept watched hosts"
    );

    let sink = ObservationSink::new(cfg.log_path.clone()).await?;
    let watch = Arc::new(WatchList::new(cfg.watch_domains.clone()));
    if watch.snapshot().is_empty() {
        info!("watch list is empty; all CONNECT traffic will be tunneled opaquely");
    } else {
        info!(domains = ?watch.snapshot(), "watching");
    }

    let listen: SocketAddr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let state = ProxyState::new(Arc::new(cfg), watch, ca, sink);
    let server = run_proxy(listen, state);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
