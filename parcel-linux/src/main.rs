// Parcel Linux: TCP session provider, console and resource inbox.

mod config;
mod inbox;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parcel_core::{Error, MessageManager, MessagePayload, PeerId, SessionProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("parcel-linux {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cfg = config::load(config_path.as_deref())?;

    let manager = MessageManager::with_config(parcel_core::Config {
        resource_container: Some(cfg.resource_dir.clone()),
        pending_ttl: cfg.pending_ttl(),
        ..parcel_core::Config::default()
    })?;
    let inbox = Arc::new(inbox::Inbox);
    manager.set_delegate(&inbox);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let provider =
            transport::TcpSessionProvider::bind(PeerId::new(cfg.node_name.clone()), cfg.listen_port)
                .await
                .with_context(|| format!("listening on port {}", cfg.listen_port))?;
        let session: Arc<dyn SessionProvider> = provider.clone();
        manager.set_session_provider(Some(session));
        for addr in &cfg.peers {
            provider.connect(*addr);
        }
        info!(node = %cfg.node_name, inbox = %cfg.resource_dir.display(), "parcel ready");

        tokio::spawn(purge_loop(manager.clone()));
        tokio::select! {
            result = console(&manager) => result?,
            result = shutdown_signal() => result?,
        }
        manager.set_session_provider(None);
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Line-oriented console on stdin. Returns on `/quit`; a closed stdin leaves the
/// daemon running until a signal arrives.
async fn console(manager: &MessageManager) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            info!("stdin closed; console disabled");
            std::future::pending::<()>().await;
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            return Ok(());
        }
        if line == "/peers" {
            let peers = manager
                .session_provider()
                .map(|provider| provider.connected_peers())
                .unwrap_or_default();
            if peers.is_empty() {
                println!("no connected peers");
            }
            for peer in peers {
                println!("{peer}");
            }
            continue;
        }
        let file_args = line
            .strip_prefix("/file")
            .filter(|rest| rest.is_empty() || rest.starts_with(' '));
        let payload = match file_args {
            Some(rest) => match file_payload(rest).await {
                Ok(payload) => payload,
                Err(e) => {
                    println!("{e:#}");
                    continue;
                }
            },
            None => MessagePayload::text(line),
        };
        manager.send(&payload, None, report(payload.id()));
    }
}

/// `/file <path> [text]`
async fn file_payload(args: &str) -> anyhow::Result<MessagePayload> {
    let args = args.trim();
    let (path, text) = args.split_once(' ').unwrap_or((args, ""));
    anyhow::ensure!(!path.is_empty(), "usage: /file <path> [text]");
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {path}"))?;
    anyhow::ensure!(metadata.is_file(), "{path} is not a file");
    Ok(MessagePayload::new(text.trim(), Some(PathBuf::from(path))))
}

fn report(id: Uuid) -> impl FnOnce(Result<(), Error>) + Send + 'static {
    move |result| match result {
        Ok(()) => info!(%id, "message sent"),
        Err(Error::PartialErrors(errors)) => {
            for (peer, error) in errors {
                warn!(%id, %peer, %error, "resource not delivered");
            }
        }
        Err(e) => warn!(%id, error = %e, "send failed"),
    }
}

async fn purge_loop(manager: MessageManager) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let evicted = manager.purge_stale_transfers();
        if evicted > 0 {
            info!(evicted, "purged stale transfers");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    Ok(())
}
