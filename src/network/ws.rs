//! WebSocket Transport
//!
//! Peers connect to each other over WebSocket. Every link starts with a
//! hello exchange naming both player indices; after that each binary
//! message is one encoded frame.
//!
//! I/O runs on tokio tasks. Outbound frames go through one unbounded
//! channel per link, inbound frames land in a shared queue that the session
//! drains with [`Transport::try_recv`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use super::transport::{InboundFrame, InboundReceiver, InboundSender, Transport, TransportError};

/// First message on every link, followed by the sender's player index.
const HELLO_MAGIC: [u8; 4] = *b"RTSH";

type Links = Arc<Mutex<BTreeMap<u8, mpsc::UnboundedSender<Vec<u8>>>>>;

fn hello(player: u8) -> Vec<u8> {
    let mut bytes = HELLO_MAGIC.to_vec();
    bytes.push(player);
    bytes
}

fn parse_hello(message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>) -> Result<u8, TransportError> {
    match message {
        Some(Ok(Message::Binary(bytes))) if bytes.len() == 5 && bytes[..4] == HELLO_MAGIC => Ok(bytes[4]),
        Some(Ok(other)) => Err(TransportError::Handshake(format!("unexpected {} byte message", other.len()))),
        Some(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        None => Err(TransportError::Handshake("closed before hello".to_string())),
    }
}

fn io_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

/// WebSocket links to every other peer.
pub struct WsTransport {
    local: u8,
    links: Links,
    inbound_tx: InboundSender,
    inbound: InboundReceiver,
    shutdown_tx: broadcast::Sender<()>,
}

impl WsTransport {
    /// Create a transport for `local` with no links yet.
    pub fn new(local: u8) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            local,
            links: Arc::new(Mutex::new(BTreeMap::new())),
            inbound_tx,
            inbound,
            shutdown_tx,
        }
    }

    /// Players with an open link.
    pub fn connected(&self) -> Vec<u8> {
        self.links
            .lock()
            .map(|links| links.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Accept peer connections on `addr`. Returns the bound address.
    #[instrument(skip(self), fields(player = self.local))]
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(io_error)?;
        let bound = listener.local_addr().map_err(io_error)?;
        info!(%bound, "listening for peers");

        let local = self.local;
        let links = Arc::clone(&self.links);
        let inbound = self.inbound_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "incoming connection");
                            let links = Arc::clone(&links);
                            let inbound = inbound.clone();
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = accept_peer(stream, local, links, inbound, shutdown_rx).await {
                                    warn!(%peer_addr, error = %e, "peer handshake failed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("listener stopped");
        });

        Ok(bound)
    }

    /// Open a link to `player` at `url` (e.g. `ws://10.0.0.2:7400`).
    #[instrument(skip(self), fields(local = self.local))]
    pub async fn connect(&self, player: u8, url: &str) -> Result<(), TransportError> {
        let (mut ws, _) = connect_async(url).await.map_err(io_error)?;
        ws.send(Message::Binary(hello(self.local))).await.map_err(io_error)?;
        let remote = parse_hello(ws.next().await)?;
        if remote != player {
            return Err(TransportError::Handshake(format!(
                "expected player {player}, {url} is player {remote}"
            )));
        }
        info!(player, url, "connected to peer");
        spawn_link(
            player,
            ws,
            Arc::clone(&self.links),
            self.inbound_tx.clone(),
            self.shutdown_tx.subscribe(),
        );
        Ok(())
    }

    /// Close every link and stop listening.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Transport for WsTransport {
    fn send(&mut self, to: u8, frame: &[u8]) -> Result<(), TransportError> {
        let links = self
            .links
            .lock()
            .map_err(|_| TransportError::Io("link table poisoned".to_string()))?;
        let link = links.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        link.send(frame.to_vec()).map_err(|_| TransportError::Closed(to))
    }

    fn try_recv(&mut self) -> Option<InboundFrame> {
        self.inbound.try_recv().ok()
    }
}

async fn accept_peer(
    stream: TcpStream,
    local: u8,
    links: Links,
    inbound: InboundSender,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let mut ws = accept_async(stream).await.map_err(io_error)?;
    let player = parse_hello(ws.next().await)?;
    ws.send(Message::Binary(hello(local))).await.map_err(io_error)?;
    info!(player, "peer connected");
    spawn_link(player, ws, links, inbound, shutdown_rx);
    Ok(())
}

/// Register the link and run its writer task and reader loop.
fn spawn_link<S>(
    player: u8,
    ws: WebSocketStream<S>,
    links: Links,
    inbound: InboundSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Ok(mut map) = links.lock() {
        if map.insert(player, tx.clone()).is_some() {
            debug!(player, "replacing existing link");
        }
    }

    let (mut ws_sender, mut ws_receiver) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Binary(bytes)).await {
                warn!(player, error = %e, "write failed");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if inbound.send(InboundFrame { from: player, bytes }).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(player, error = %e, "read failed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        if let Ok(mut map) = links.lock() {
            if map.get(&player).map_or(false, |current| current.same_channel(&tx)) {
                map.remove(&player);
            }
        }
        drop(tx);
        writer.abort();
        info!(player, "peer link closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv_within(transport: &mut WsTransport) -> InboundFrame {
        for _ in 0..300 {
            if let Some(frame) = transport.try_recv() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no frame arrived");
    }

    #[tokio::test]
    async fn test_frames_cross_link_both_ways() {
        let mut server = WsTransport::new(0);
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut client = WsTransport::new(1);
        client.connect(0, &format!("ws://{addr}")).await.unwrap();
        assert_eq!(client.connected(), vec![0]);

        client.send(0, b"first").unwrap();
        client.send(0, b"second").unwrap();
        let a = recv_within(&mut server).await;
        let b = recv_within(&mut server).await;
        assert_eq!((a.from, a.bytes.as_slice()), (1, &b"first"[..]));
        assert_eq!(b.bytes, b"second");

        server.send(1, b"reply").unwrap();
        let reply = recv_within(&mut client).await;
        assert_eq!(reply.from, 0);
        assert_eq!(reply.bytes, b"reply");

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_handshake_checks_player_index() {
        let server = WsTransport::new(4);
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client = WsTransport::new(1);
        let result = client.connect(2, &format!("ws://{addr}")).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert!(client.connected().is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_link() {
        let mut transport = WsTransport::new(0);
        assert_eq!(transport.send(3, b"x"), Err(TransportError::UnknownPeer(3)));
        assert!(transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = WsTransport::new(1);
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let result = client.connect(0, &format!("ws://{addr}")).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
