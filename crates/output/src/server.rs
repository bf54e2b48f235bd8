// Copyright 2025-2026 CEMAXECUTER LLC

use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_tungstenite::tungstenite::Message;
use futures_util::{SinkExt, StreamExt};
use rad_arena::Buffer;
use rad_protocol::FrameKind;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::link::{Outbound, ProtocolLink};

/// Grace period for peers to receive their Close before the runtime exits.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Network thread: accepts WebSocket peers and publishes aggregated spectra
/// through a shared [`ProtocolLink`].
pub struct NetworkServer {
    port: u16,
    link: Arc<ProtocolLink>,
}

impl NetworkServer {
    pub fn new(port: u16, link: Arc<ProtocolLink>) -> Self {
        Self { port, link }
    }

    /// Bind the listener and start the network thread. The thread runs
    /// until `frames` is closed by the aggregation side. Ctrl-C clears
    /// `running` so the receiver stops and the pipeline drains.
    pub fn spawn(
        self,
        frames: UnboundedReceiver<(FrameKind, Buffer)>,
        running: Arc<AtomicBool>,
    ) -> Result<(JoinHandle<()>, SocketAddr), String> {
        let listener = StdListener::bind(("0.0.0.0", self.port))
            .map_err(|e| format!("failed to bind port {}: {}", self.port, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("failed to configure listener: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| format!("failed to read listener address: {}", e))?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("failed to create tokio runtime: {}", e))?;

        log::info!("listening for WebSocket peers on {}", addr);
        let link = self.link;
        let handle = thread::Builder::new()
            .name("network".into())
            .spawn(move || {
                rt.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => serve(listener, link, frames, running).await,
                        Err(e) => log::error!("failed to register listener: {}", e),
                    }
                });
            })
            .map_err(|e| format!("failed to spawn network thread: {}", e))?;
        Ok((handle, addr))
    }
}

async fn serve(
    listener: TcpListener,
    link: Arc<ProtocolLink>,
    mut frames: UnboundedReceiver<(FrameKind, Buffer)>,
    running: Arc<AtomicBool>,
) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(handle_peer(stream, peer_addr, Arc::clone(&link)));
                }
                Err(e) => log::warn!("accept failed: {}", e),
            },
            frame = frames.recv() => match frame {
                Some((kind, spectrum)) => {
                    link.publish(kind, spectrum);
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                log::info!("interrupted, stopping receiver");
                interrupted = true;
                running.store(false, Ordering::SeqCst);
            }
        }
    }

    log::info!("spectrum stream ended, closing {} peers", link.peer_count());
    link.close_all();
    tokio::time::sleep(CLOSE_GRACE).await;
}

async fn handle_peer(stream: TcpStream, addr: SocketAddr, link: Arc<ProtocolLink>) {
    let socket = match async_tungstenite::tokio::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (id, mut outbound) = link.add_peer(&addr.to_string());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let result = match msg {
                Outbound::Binary(bytes) => ws_sender.send(Message::Binary(bytes)).await,
                Outbound::Text(text) => ws_sender.send(Message::Text(text)).await,
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                link.handle_text(id, &text);
            }
            Message::Binary(data) => link.handle_binary(id, &data),
            Message::Close(_) => break,
            _ => {}
        }
    }

    link.remove_peer(id);
    send_task.abort();
}
