//! WebSocket accept loop for subscriber connections.
//!
//! One task per connection reads inbound frames and dispatches them to
//! the manager; a paired writer task drains the connection's outbound
//! channel. The manager owns all lifecycle state; this module only
//! moves frames.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::rooms::connection::Frame;
use crate::rooms::manager::ConnectionManager;

pub async fn bind(addr: &str) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {addr}"))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Accept loop. Runs until `stop` flips to true; connections accepted
/// before the stop keep running until their transport closes.
pub async fn run(
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "websocket server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound tcp connection");
                        let mgr = Arc::clone(&manager);
                        tokio::spawn(async move {
                            handle_socket(stream, peer, mgr).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("websocket server stopping");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, manager: Arc<ConnectionManager>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let id = manager.connect(tx);

    // Writer half: drains the manager-facing channel onto the wire.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Frame::Text(t) => Message::text(t),
                Frame::Ping => Message::Ping(Default::default()),
            };
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Reader half: every inbound frame confirms liveness.
    while let Some(next) = read.next().await {
        match next {
            Ok(msg) if msg.is_text() => match msg.to_text() {
                Ok(raw) => manager.handle_message(id, raw).await,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "non-utf8 text frame");
                    manager.record_activity(id);
                }
            },
            Ok(msg) if msg.is_pong() => manager.record_pong(id),
            // tungstenite queues the protocol-level pong reply itself.
            Ok(msg) if msg.is_ping() => manager.record_activity(id),
            Ok(msg) if msg.is_close() => {
                debug!(connection_id = %id, "client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %id, error = %e, "websocket read error");
                break;
            }
        }
    }

    manager.disconnect(id);
    writer.abort();
}
