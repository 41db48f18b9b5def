//! Backend connection manager
//!
//! One long-lived TCP connection per agent handle, speaking a
//! length-prefixed frame protocol:
//!
//! ```text
//! +----------------------+------------------+
//! | length: u32 (LE)     | payload (length) |
//! +----------------------+------------------+
//! ```
//!
//! Frames read from the backend pass through the configured
//! [`FrameTransform`](crate::transform::FrameTransform) before they are
//! handed to the caller.

use crate::transform::{SharedTransform, TransformError};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Frame length prefix size
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame accepted from the backend (32 MiB)
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Upper bound on one frame write when none is configured
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to connect to backend {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to backend {0}")]
    ConnectTimeout(SocketAddr),

    #[error("Backend connection for handle '{0}' is closed")]
    Closed(String),

    #[error("Backend for handle '{0}' did not accept a frame within {1:?}")]
    SendTimeout(String, Duration),

    #[error("Frame of {0} bytes exceeds the {1}-byte limit")]
    FrameTooLarge(usize, usize),

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),
}

/// Outcome of a frame read that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Payload(Vec<u8>),
    /// Nothing arrived before the deadline, or the frame was empty
    Empty,
}

struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

/// One backend socket owned on behalf of an agent handle
pub struct Connection {
    handle: String,
    reader: Mutex<FrameReader>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    transform: SharedTransform,
    send_timeout: Duration,
}

impl Connection {
    fn new(
        handle: &str,
        stream: TcpStream,
        transform: SharedTransform,
        send_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            handle: handle.to_string(),
            reader: Mutex::new(FrameReader {
                half: read_half,
                buf: BytesMut::with_capacity(4096),
            }),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
            transform,
            send_timeout,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("Backend connection for handle '{}' closed", self.handle);
        }
    }

    /// Write one frame: 4-byte little-endian length followed by the payload.
    ///
    /// A backend that stops reading fails the write after the send timeout
    /// and the connection is closed, since a partial frame may be on the wire.
    pub async fn send_frame(&self, payload: &[u8]) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed(self.handle.clone()));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| BackendError::FrameTooLarge(payload.len(), u32::MAX as usize))?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32_le(len);
        frame.put_slice(payload);

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.send_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_closed();
                return Err(BackendError::Io(e));
            }
            Err(_) => {
                self.mark_closed();
                return Err(BackendError::SendTimeout(
                    self.handle.clone(),
                    self.send_timeout,
                ));
            }
        }

        log::debug!(
            "[→BACKEND] handle '{}' sent frame of {} bytes",
            self.handle,
            payload.len()
        );
        Ok(())
    }

    /// Read one frame, waiting at most `timeout` for it to complete.
    ///
    /// Bytes that arrive before the deadline stay buffered, so a frame split
    /// across several polls is still read whole and in order.
    pub async fn recv_frame(&self, timeout: Duration) -> Result<Received, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed(self.handle.clone()));
        }

        let deadline = Instant::now() + timeout;
        let mut reader = self.reader.lock().await;

        let frame = loop {
            match take_frame(&mut reader.buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(e) => {
                    // Framing is lost once a bogus length is seen
                    self.mark_closed();
                    return Err(e);
                }
            }

            let FrameReader { half, buf } = &mut *reader;
            match tokio::time::timeout_at(deadline, half.read_buf(buf)).await {
                Err(_) => return Ok(Received::Empty),
                Ok(Ok(0)) => {
                    self.mark_closed();
                    return Err(BackendError::Closed(self.handle.clone()));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    self.mark_closed();
                    return Err(BackendError::Io(e));
                }
            }
        };
        drop(reader);

        log::debug!(
            "[←BACKEND] handle '{}' received frame of {} bytes",
            self.handle,
            frame.len()
        );

        if frame.is_empty() {
            return Ok(Received::Empty);
        }

        let transformed = self.transform.apply(&frame)?;
        if transformed.is_empty() {
            return Ok(Received::Empty);
        }
        Ok(Received::Payload(transformed))
    }

    /// Shut the socket down; later sends and reads fail with `Closed`
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("Shutdown of handle '{}' failed: {}", self.handle, e);
        }
        self.mark_closed();
    }
}

/// Split a complete frame off the front of the buffer, if one is there
fn take_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, BackendError> {
    if buf.len() < FRAME_HEADER_LEN {
        buf.reserve(FRAME_HEADER_LEN - buf.len());
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BackendError::FrameTooLarge(len, MAX_FRAME_LEN));
    }

    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(len).to_vec()))
}

/// Handle → connection registry shared by the session machines
pub struct ConnectionRegistry {
    backend_addr: SocketAddr,
    connect_timeout: Duration,
    send_timeout: Duration,
    transform: SharedTransform,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(backend_addr: SocketAddr, connect_timeout: Duration, transform: SharedTransform) -> Self {
        Self {
            backend_addr,
            connect_timeout,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            transform,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Bound frame writes on connections opened from now on
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Return the open connection for `handle`, dialing the backend if there
    /// is none or the previous one was closed by the peer.
    pub async fn open(&self, handle: &str) -> Result<Arc<Connection>, BackendError> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(handle) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            log::info!("Re-dialing backend for handle '{}'", handle);
        }

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(self.backend_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(BackendError::Connect {
                    addr: self.backend_addr,
                    source,
                })
            }
            Err(_) => return Err(BackendError::ConnectTimeout(self.backend_addr)),
        };
        let _ = stream.set_nodelay(true);

        let connection = Arc::new(Connection::new(
            handle,
            stream,
            self.transform.clone(),
            self.send_timeout,
        ));
        connections.insert(handle.to_string(), connection.clone());
        log::info!(
            "Opened backend connection {} for handle '{}'",
            self.backend_addr,
            handle
        );
        Ok(connection)
    }

    /// Connection previously opened for `handle`, even if since closed
    pub async fn get(&self, handle: &str) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(handle).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every connection
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (handle, connection) in drained {
            log::debug!("Closing backend connection for handle '{}'", handle);
            connection.close().await;
        }
    }
}
