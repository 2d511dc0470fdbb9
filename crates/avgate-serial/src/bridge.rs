use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const BUSY_NOTICE: &[u8] = b"avgate serial port busy\r\n";

// per-tick cap on bytes pulled from the client
const MAX_INBOUND: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected(SocketAddr),
    Rejected(SocketAddr),
    Disconnected(SocketAddr),
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Single-client line-view relay. Accepting runs on its own task; all client
/// I/O is non-blocking and driven from the serial manager's pump.
pub struct Bridge {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(TcpStream, SocketAddr)>,
    client: Option<Client>,
}

pub async fn bind(addr: &str) -> Result<Bridge> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("bind bridge listener {}", addr))?;
    let local_addr = listener.local_addr().context("bridge local addr")?;
    let (tx, incoming) = mpsc::channel(4);
    tokio::spawn(accept_loop(listener, tx));
    info!("bridge: listening on {}", local_addr);
    Ok(Bridge { local_addr, incoming, client: None })
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                if tx.send(conn).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("bridge: accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn reject(mut stream: TcpStream) {
    let _ = stream.write_all(BUSY_NOTICE).await;
    let _ = stream.shutdown().await;
}

impl Bridge {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|c| c.peer)
    }

    /// Pulls inbound client bytes into `inbound`, notices a dropped client,
    /// then admits a waiting connection or turns extras away. Must run inside
    /// the tokio runtime: rejections are written from a spawned task.
    pub fn service(&mut self, inbound: &mut Vec<u8>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();

        if let Some(client) = self.client.as_ref() {
            let mut buf = [0u8; 256];
            let mut dropped = false;
            while inbound.len() < MAX_INBOUND {
                match client.stream.try_read(&mut buf) {
                    Ok(0) => {
                        dropped = true;
                        break;
                    }
                    Ok(n) => inbound.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("bridge: read from {} failed: {}", client.peer, e);
                        dropped = true;
                        break;
                    }
                }
            }
            if dropped {
                events.push(BridgeEvent::Disconnected(client.peer));
                self.client = None;
            }
        }

        while let Ok((stream, peer)) = self.incoming.try_recv() {
            if self.client.is_none() {
                let _ = stream.set_nodelay(true);
                self.client = Some(Client { stream, peer });
                events.push(BridgeEvent::Connected(peer));
            } else {
                tokio::spawn(reject(stream));
                events.push(BridgeEvent::Rejected(peer));
            }
        }

        events
    }

    /// Best-effort mirror to the client; a full socket buffer drops the chunk.
    pub fn write(&mut self, bytes: &[u8]) {
        let Some(client) = self.client.as_ref() else { return };
        match client.stream.try_write(bytes) {
            Ok(n) if n < bytes.len() => debug!("bridge: short write {}/{} to {}", n, bytes.len(), client.peer),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => debug!("bridge: client {} not ready, dropped {} bytes", client.peer, bytes.len()),
            Err(e) => debug!("bridge: write to {} failed: {}", client.peer, e),
        }
    }
}
