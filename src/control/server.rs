//! Control-plane TCP server: one accept loop, one task per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::control::handlers::{ControlContext, dispatch};
use crate::control::protocol::{ControlMessage, Frame, FrameDecoder, MAX_MESSAGE_BYTES};

type LiveSet = Arc<Mutex<HashMap<u64, SocketAddr>>>;

/// A running control server. Dropping it leaves the server running; call
/// [`ControlServer::shutdown`] to stop accepting.
#[derive(Debug)]
pub struct ControlServer {
    local_addr: SocketAddr,
    live: LiveSet,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `addr` and start accepting.
    pub async fn start(addr: &str, ctx: Arc<ControlContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind control server on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "control server listening");

        let live: LiveSet = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(accept_loop(listener, ctx, Arc::clone(&live)));

        Ok(Self {
            local_addr,
            live,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.live.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ControlContext>, live: LiveSet) {
    let next_id = AtomicU64::new(0);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, id, "control connection accepted");
                if let Ok(mut set) = live.lock() {
                    set.insert(id, peer);
                }

                let ctx = Arc::clone(&ctx);
                let live = Arc::clone(&live);
                tokio::spawn(async move {
                    serve_connection(stream, peer, &ctx).await;
                    if let Ok(mut set) = live.lock() {
                        set.remove(&id);
                    }
                    debug!(peer = %peer, id, "control connection closed");
                });
            }
            Err(e) => {
                error!(error = %e, "control listener accept error");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve until the peer closes or an I/O error occurs. Each message is
/// answered before the next read.
async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ControlContext) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; MAX_MESSAGE_BYTES];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %peer, error = %e, "control read failed");
                return;
            }
        };

        for frame in decoder.push(&chunk[..n]) {
            let reply = match frame {
                Frame::Message(raw) => dispatch(ctx, &raw).await,
                Frame::TooLong => ControlMessage::error("message too long"),
            };
            if let Err(e) = stream.write_all(&reply.to_frame()).await {
                debug!(peer = %peer, error = %e, "control write failed");
                return;
            }
        }
    }
}
