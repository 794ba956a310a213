//! WebSocket bus for peers living in different processes
//!
//! `BusHub` relays frames between connected peers, `HubBus` is the peer side.
//! A peer's first text frame names the group it joins; every later frame is
//! relayed verbatim to the other members of that group.

use crate::bus::{BroadcastBus, BusChannel, GROUP_CHANNEL_CAPACITY};
use crate::error::BridgeError;
use crate::types::BridgeFrame;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

#[derive(Debug, Clone)]
struct HubFrame {
    /// Connection that posted the frame
    from: u64,
    data: String,
}

#[derive(Debug, Default, Clone)]
pub struct HubStats {
    pub frames_relayed: u64,
    pub peers_connected: usize,
}

/// Relay server fanning frames out within groups
pub struct BusHub {
    /// Fan-out channel per group
    groups: Arc<DashMap<String, broadcast::Sender<HubFrame>>>,
    /// Stats
    stats: Arc<RwLock<HubStats>>,
    /// Connection id source
    next_peer: Arc<AtomicU64>,
}

impl BusHub {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(HubStats::default())),
            next_peer: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start accepting peers; returns the bound address
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        tracing::info!("Bus hub listening on {}", local_addr);

        let groups = self.groups.clone();
        let stats = self.stats.clone();
        let next_peer = self.next_peer.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::info!("Peer connected from {}", peer_addr);
                        let connection = next_peer.fetch_add(1, Ordering::SeqCst);
                        let groups = groups.clone();
                        let stats = stats.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_peer_connection(stream, connection, groups, stats).await
                            {
                                tracing::warn!("Peer connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Get number of connected peers
    pub fn connected_peers(&self) -> usize {
        self.stats.read().peers_connected
    }

    pub fn stats(&self) -> HubStats {
        self.stats.read().clone()
    }
}

impl Default for BusHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_peer_connection(
    stream: TcpStream,
    connection: u64,
    groups: Arc<DashMap<String, broadcast::Sender<HubFrame>>>,
    stats: Arc<RwLock<HubStats>>,
) -> Result<(), BridgeError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Connect(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first text frame names the group
    let group = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(group))) => break group,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(BridgeError::Connect(e.to_string())),
        }
    };

    let tx = groups
        .entry(group.clone())
        .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
        .clone();
    let mut rx = tx.subscribe();
    stats.write().peers_connected += 1;
    tracing::debug!("Connection {} joined group {}", connection, group);

    // Spawn task to forward group frames to this peer
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) if frame.from == connection => {}
                Ok(frame) => {
                    if ws_sender.send(Message::Text(frame.data)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Connection {} lagged {} frames", connection, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(data)) => {
                let _ = tx.send(HubFrame {
                    from: connection,
                    data,
                });
                stats.write().frames_relayed += 1;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    stats.write().peers_connected -= 1;
    tracing::info!("Connection {} left group {}", connection, group);

    Ok(())
}

/// Peer side of a `BusHub`
#[derive(Debug, Clone)]
pub struct HubBus {
    url: String,
}

impl HubBus {
    /// `url` is the hub's WebSocket address, e.g. `ws://127.0.0.1:9400`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BroadcastBus for HubBus {
    async fn open(&self, group: &str) -> Result<Arc<dyn BusChannel>, BridgeError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender
            .send(Message::Text(group.to_string()))
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        tracing::info!("Joined hub group {} at {}", group, self.url);

        let (inbound, _) = broadcast::channel(GROUP_CHANNEL_CAPACITY);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        // Spawn receiver task
        let inbound_tx = inbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(data)) => match BridgeFrame::from_json(&data) {
                        Ok(frame) => {
                            let _ = inbound_tx.send(frame);
                        }
                        Err(e) => {
                            tracing::warn!("Dropping undecodable hub frame: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::warn!("Hub closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Spawn sender task
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(data)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        Ok(Arc::new(HubChannel {
            inbound,
            outbound: Mutex::new(Some(outbound)),
            reader,
        }))
    }
}

struct HubChannel {
    inbound: broadcast::Sender<BridgeFrame>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reader: JoinHandle<()>,
}

impl BusChannel for HubChannel {
    fn post(&self, frame: BridgeFrame) -> Result<(), BridgeError> {
        let data = frame.to_json()?;
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(data).map_err(|_| BridgeError::Closed),
            None => Err(BridgeError::Closed),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeFrame> {
        self.inbound.subscribe()
    }

    fn close(&self) {
        // Dropping the sender ends the writer, which closes the socket
        self.outbound.lock().take();
        self.reader.abort();
    }
}
