use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{Instrument, debug, error, info, info_span, warn};

use libsessiond::{SessionsBackground, SharedBackground, enqueue_message};
use sessiond_protocol::{Event, MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, ServerMessage};

use crate::config::RuntimeConfig;

type Connections = Arc<RwLock<Vec<JoinHandle<()>>>>;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub async fn run(cfg: RuntimeConfig) -> Result<()> {
    // Installed before the socket is bound.
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received");
        signal_tx.send_replace(true);
    });

    if let Some(runtime_dir) = &cfg.runtime_dir {
        ensure_runtime_dir(runtime_dir)?;
    }
    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&cfg.socket_path)?;

    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    fs::write(&cfg.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", cfg.pid_file.display()))?;

    info!(
        pid = std::process::id(),
        socket = %cfg.socket_path.display(),
        protocol_version = PROTOCOL_VERSION,
        "sessiond-server started"
    );

    let background = SessionsBackground::create(cfg.service_config()).into_shared();
    let connections: Connections = Arc::new(RwLock::new(Vec::new()));

    let accept_result = accept_loop(
        listener,
        Arc::clone(&background),
        cfg.clone(),
        shutdown_rx,
        Arc::clone(&connections),
    )
    .await;

    shutdown_tx.send_replace(true);
    for handle in connections.write().await.drain(..) {
        handle.abort();
    }
    background.lock().await.dispose();

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);
    info!("sessiond-server stopped");

    accept_result
}

async fn accept_loop(
    listener: UnixListener,
    background: SharedBackground,
    cfg: RuntimeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    connections: Connections,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                if let Err(err) = verify_peer_uid(&stream, cfg.allowed_uid) {
                    warn!("rejected peer: {err}");
                    continue;
                }

                let conn = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(
                    handle_connection(stream, Arc::clone(&background), cfg.outbound_queue)
                        .instrument(info_span!("connection", conn)),
                );
                let mut active = connections.write().await;
                active.retain(|h| !h.is_finished());
                active.push(handle);
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: UnixStream, background: SharedBackground, outbound_queue: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(
        async move {
            while let Some(message) = out_rx.recv().await {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        error!("failed to encode message: {err}");
                        continue;
                    }
                };

                if let Err(err) = writer.send(line).await {
                    warn!("socket write failed: {err}");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let events = background.lock().await.subscribe();
    let mut forwarder =
        tokio::spawn(forward_events(events, out_tx.clone()).in_current_span());
    debug!("client connected");

    loop {
        let line = tokio::select! {
            line = reader.next() => line,
            _ = &mut forwarder => {
                warn!("event delivery failed, disconnecting client");
                break;
            }
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("socket read failed: {err}");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = background.lock().await.handle_line(&line);
        if let Err(err) = enqueue_message(&out_tx, ServerMessage::Response(response)) {
            warn!("dropping client: {err}");
            break;
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer_task.await;
    debug!("client disconnected");
}

/// Push broadcast events onto one client's outbound queue until it closes.
async fn forward_events(mut events: broadcast::Receiver<Event>, out_tx: mpsc::Sender<ServerMessage>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(err) = enqueue_message(&out_tx, ServerMessage::Event { event }) {
                    warn!("event not delivered: {err}");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn ensure_runtime_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<()> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(())
}
