//! WebSocket transport. One bidirectional byte channel per link.
//!
//! A [`Connection`] owns two background tasks: a writer that drains the
//! outbound queue onto the socket in order, and a reader that pushes every
//! received frame into the inbound queue. Callers never touch the socket
//! directly, so a slow consumer can not stall the writer and vice versa.
//!
//! The outbound queue has a single lane so frames leave in send order.
//! Droppable frames are counted while they wait; once a slow socket lets
//! too many pile up, new ones are refused instead of growing the queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, warn};

use crate::error::{FabricError, Result};

/// Frames buffered between the reader task and the consumer.
const INBOUND_QUEUE: usize = 1024;

/// Droppable frames allowed to wait on one connection by default.
pub const DEFAULT_DROPPABLE_LIMIT: usize = 256;

/// How long `close` waits for the writer to flush its queue.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Counts live connections. Every [`Connection`] holds one slot until it is
/// closed or dropped.
#[derive(Debug, Clone, Default)]
pub struct HandleCounter(Arc<AtomicUsize>);

impl HandleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently open.
    pub fn open(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> HandleGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        HandleGuard(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
struct HandleGuard(Arc<AtomicUsize>);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    droppable: bool,
}

/// A handle to an active WebSocket connection with a peer.
#[derive(Debug)]
pub struct Connection {
    peer: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Droppable frames enqueued but not yet taken by the writer.
    queued_droppable: Arc<AtomicUsize>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
    lost: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    guard: Mutex<Option<HandleGuard>>,
}

impl Connection {
    fn spawn<S>(ws: WebSocketStream<S>, peer: String, counter: &HandleCounter) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(INBOUND_QUEUE);
        let lost = Arc::new(AtomicBool::new(false));
        let queued_droppable = Arc::new(AtomicUsize::new(0));

        let writer_peer = peer.clone();
        let writer_lost = Arc::clone(&lost);
        let writer_queued = Arc::clone(&queued_droppable);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if frame.droppable {
                    writer_queued.fetch_sub(1, Ordering::SeqCst);
                }
                if let Err(e) = sink.send(Message::Binary(frame.bytes.into())).await {
                    debug!("Write to {writer_peer} failed: {e}");
                    writer_lost.store(true, Ordering::SeqCst);
                    return;
                }
            }
            // Queue closed by `close()`: everything enqueued has been written.
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let reader_peer = peer.clone();
        let reader_lost = Arc::clone(&lost);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let bytes = match msg {
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(Message::Close(_)) => {
                        debug!("Peer {reader_peer} sent close");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Read error from {reader_peer}: {e}");
                        break;
                    }
                };
                if in_tx.send(bytes).await.is_err() {
                    break;
                }
            }
            reader_lost.store(true, Ordering::SeqCst);
        });

        Self {
            peer,
            outbound: Mutex::new(Some(out_tx)),
            queued_droppable,
            inbound: tokio::sync::Mutex::new(in_rx),
            closed: AtomicBool::new(false),
            lost,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            guard: Mutex::new(Some(counter.acquire())),
        }
    }

    /// Transport address of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the connection is still usable.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.lost.load(Ordering::SeqCst)
    }

    /// Enqueue a frame for sending. Never waits for the socket.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.enqueue(Frame {
            bytes,
            droppable: false,
        })
    }

    /// Enqueue a frame that may be shed. Returns `Ok(false)` without
    /// queueing it when `limit` droppable frames are already waiting.
    pub fn send_droppable(&self, bytes: Vec<u8>, limit: usize) -> Result<bool> {
        let reserved = self
            .queued_droppable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1));
        if reserved.is_err() {
            return Ok(false);
        }
        let result = self.enqueue(Frame {
            bytes,
            droppable: true,
        });
        if result.is_err() {
            self.queued_droppable.fetch_sub(1, Ordering::SeqCst);
        }
        result.map(|()| true)
    }

    /// Droppable frames waiting for the writer.
    pub fn queued_droppable(&self) -> usize {
        self.queued_droppable.load(Ordering::SeqCst)
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FabricError::Closed);
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(FabricError::ConnectionLost(self.peer.clone()));
        }
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| FabricError::ConnectionLost(self.peer.clone())),
            None => Err(FabricError::Closed),
        }
    }

    /// Wait for the next frame. `None` waits indefinitely.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        let next = match timeout {
            Some(limit) => tokio::time::timeout(limit, inbound.recv())
                .await
                .map_err(|_| FabricError::Timeout(limit))?,
            None => inbound.recv().await,
        };
        next.ok_or_else(|| {
            if self.closed.load(Ordering::SeqCst) {
                FabricError::Closed
            } else {
                FabricError::ConnectionLost(self.peer.clone())
            }
        })
    }

    /// Flush queued frames, close the socket and release the handle.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the writer drain and send a close frame.
        self.outbound.lock().take();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("Flushing connection to {} timed out", self.peer);
                abort.abort();
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.guard.lock().take();
        debug!("Closed connection to {}", self.peer);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Connect to a remote node as a client.
pub async fn connect(addr: &str, counter: &HandleCounter) -> Result<Connection> {
    let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };

    let (ws_stream, _) = connect_async(&url)
        .await
        .map_err(|e| FabricError::ConnectionRefused(format!("{addr}: {e}")))?;

    debug!("Connected to {addr}");
    Ok(Connection::spawn(ws_stream, addr.to_string(), counter))
}

/// Accepts inbound connections from child nodes.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Wait for the next TCP connection. The WebSocket handshake happens in
    /// [`Incoming::upgrade`] so the accept loop never blocks on a slow peer.
    pub async fn accept(&self) -> Result<Incoming> {
        let (stream, peer_addr) = self.inner.accept().await?;
        Ok(Incoming { stream, peer_addr })
    }
}

/// A TCP connection that has not completed the WebSocket handshake yet.
pub struct Incoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn upgrade(self, counter: &HandleCounter) -> Result<Connection> {
        let ws_stream = accept_async(self.stream)
            .await
            .map_err(|e| FabricError::ConnectionLost(format!("{}: {e}", self.peer_addr)))?;
        Ok(Connection::spawn(ws_stream, self.peer_addr.to_string(), counter))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair(counter: &HandleCounter) -> (Connection, Connection) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_counter = counter.clone();
        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming.upgrade(&server_counter).await.unwrap()
        });
        let client = connect(&addr.to_string(), counter).await.unwrap();
        let server = server.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let counter = HandleCounter::new();
        let (client, server) = connected_pair(&counter).await;
        assert_eq!(counter.open(), 2);

        for i in 0..50u8 {
            client.send(vec![i; 3]).unwrap();
        }
        for i in 0..50u8 {
            let frame = server
                .receive(Some(Duration::from_secs(2)))
                .await
                .unwrap();
            assert_eq!(frame, vec![i; 3]);
        }

        server.send(b"pong".to_vec()).unwrap();
        let reply = client.receive(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply, b"pong");

        client.close().await;
        server.close().await;
        assert_eq!(counter.open(), 0);
    }

    #[tokio::test]
    async fn test_droppable_frames_shed_at_limit() {
        let counter = HandleCounter::new();
        let (client, server) = connected_pair(&counter).await;

        // Nothing droppable may wait: shed, while ordinary frames still go.
        assert!(!client.send_droppable(b"chunk".to_vec(), 0).unwrap());
        client.send(b"heartbeat".to_vec()).unwrap();
        let frame = server.receive(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(frame, b"heartbeat");

        assert!(client.send_droppable(b"chunk".to_vec(), 8).unwrap());
        let frame = server.receive(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(frame, b"chunk");
        // The writer released its slot once it took the frame.
        assert_eq!(client.queued_droppable(), 0);

        client.close().await;
        assert!(matches!(
            client.send_droppable(vec![1], 8),
            Err(FabricError::Closed)
        ));
        assert_eq!(client.queued_droppable(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let counter = HandleCounter::new();
        let (client, server) = connected_pair(&counter).await;
        let result = server.receive(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(FabricError::Timeout(_))));
        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_connection_lost() {
        let counter = HandleCounter::new();
        let (client, server) = connected_pair(&counter).await;
        client.close().await;

        let result = server.receive(Some(Duration::from_secs(2))).await;
        assert!(matches!(result, Err(FabricError::ConnectionLost(_))));
        server.close().await;
        assert_eq!(counter.open(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_flushes() {
        let counter = HandleCounter::new();
        let (client, server) = connected_pair(&counter).await;
        client.send(b"last words".to_vec()).unwrap();
        client.close().await;
        client.close().await;
        assert!(matches!(client.send(vec![1]), Err(FabricError::Closed)));

        let frame = server.receive(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(frame, b"last words");
        server.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let counter = HandleCounter::new();
        let result = connect(&addr.to_string(), &counter).await;
        assert!(matches!(result, Err(FabricError::ConnectionRefused(_))));
        assert_eq!(counter.open(), 0);
    }

    #[test]
    fn test_handle_counter_guard() {
        let counter = HandleCounter::new();
        let a = counter.acquire();
        let b = counter.acquire();
        assert_eq!(counter.open(), 2);
        drop(a);
        assert_eq!(counter.open(), 1);
        drop(b);
        assert_eq!(counter.open(), 0);
    }
}
