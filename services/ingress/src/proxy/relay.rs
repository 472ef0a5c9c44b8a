//! Bidirectional byte relay between a client and a backend.
//!
//! ```text
//! client read half  --reader task--> [chan] --\
//!                                               coordinator --> write halves
//! backend read half --reader task--> [chan] --/
//! ```
//!
//! Each reader task loops over a fixed 1 KiB buffer, copies exactly the
//! bytes it read into a fresh `Bytes`, and publishes them to the
//! coordinator. End-of-stream or a read error publishes `Closed` and stops
//! the reader. The coordinator writes every chunk in full to the opposite
//! side and ends the session on the first `Closed` from either direction
//! or on any write error. It does not wait for the other direction to
//! drain.
//!
//! Each direction holds at most one pending chunk and the channels hold one
//! more, so a slow destination stalls its reader, which in turn stalls the
//! source socket. The opposite direction keeps flowing.

use std::io;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

/// Read buffer size for each direction.
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// One side of a relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Backend => "backend",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message from a reader task to the coordinator.
#[derive(Debug)]
enum Chunk {
    Data(Bytes),
    /// End-of-stream (`None`) or read error.
    Closed(Option<io::Error>),
}

/// Why a session ended.
#[derive(Debug)]
pub enum RelayEnd {
    /// `side` reached end-of-stream (`error` is `None`) or failed a read.
    Closed {
        side: Side,
        error: Option<io::Error>,
    },
    /// Writing to `side` failed.
    WriteFailed { side: Side, error: io::Error },
}

impl RelayEnd {
    /// The side whose socket ended the session.
    pub fn side(&self) -> Side {
        match self {
            RelayEnd::Closed { side, .. } | RelayEnd::WriteFailed { side, .. } => *side,
        }
    }

    /// True when the session ended on a clean end-of-stream.
    pub fn is_clean(&self) -> bool {
        matches!(self, RelayEnd::Closed { error: None, .. })
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes written to the backend.
    pub bytes_to_backend: u64,
    /// Bytes written to the client.
    pub bytes_to_client: u64,
    pub end: RelayEnd,
}

/// Relay bytes between `client` and `backend` until either side closes.
///
/// Both streams are consumed; when this returns, both have been shut down
/// and dropped.
pub async fn relay<C, B>(client: C, backend: B) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (backend_read, mut backend_write) = tokio::io::split(backend);

    let (from_client_tx, mut from_client) = mpsc::channel(1);
    let (from_backend_tx, mut from_backend) = mpsc::channel(1);

    let client_reader = tokio::spawn(read_loop(client_read, from_client_tx).in_current_span());
    let backend_reader = tokio::spawn(read_loop(backend_read, from_backend_tx).in_current_span());

    let mut bytes_to_backend = 0u64;
    let mut bytes_to_client = 0u64;

    // At most one chunk in flight per direction. Writes go through the
    // cancel-safe `write`, so a stalled destination only stalls its own
    // direction.
    let mut to_backend = Bytes::new();
    let mut to_client = Bytes::new();

    let end = loop {
        tokio::select! {
            chunk = from_client.recv(), if to_backend.is_empty() => match chunk {
                Some(Chunk::Data(data)) => to_backend = data,
                Some(Chunk::Closed(error)) => break RelayEnd::Closed { side: Side::Client, error },
                None => break RelayEnd::Closed { side: Side::Client, error: None },
            },
            chunk = from_backend.recv(), if to_client.is_empty() => match chunk {
                Some(Chunk::Data(data)) => to_client = data,
                Some(Chunk::Closed(error)) => break RelayEnd::Closed { side: Side::Backend, error },
                None => break RelayEnd::Closed { side: Side::Backend, error: None },
            },
            written = backend_write.write(&to_backend), if !to_backend.is_empty() => {
                match advance(&mut to_backend, written) {
                    Ok(n) => bytes_to_backend += n as u64,
                    Err(error) => break RelayEnd::WriteFailed { side: Side::Backend, error },
                }
            },
            written = client_write.write(&to_client), if !to_client.is_empty() => {
                match advance(&mut to_client, written) {
                    Ok(n) => bytes_to_client += n as u64,
                    Err(error) => break RelayEnd::WriteFailed { side: Side::Client, error },
                }
            },
        }
    };

    match &end {
        RelayEnd::Closed { side, error: None } => debug!(side = %side, "EOF"),
        RelayEnd::Closed {
            side,
            error: Some(e),
        } => debug!(side = %side, error = %e, "Read error"),
        RelayEnd::WriteFailed { side, error } => debug!(side = %side, error = %error, "Write error"),
    }

    // Readers may be parked in read() or waiting on a full channel; either
    // way they hold a read half. Abort and reap them so every half is gone
    // before returning.
    client_reader.abort();
    backend_reader.abort();
    let _ = client_reader.await;
    let _ = backend_reader.await;

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;
    drop(backend_write);
    drop(client_write);

    RelayOutcome {
        bytes_to_backend,
        bytes_to_client,
        end,
    }
}

/// Drop the written prefix of `pending`. A zero-length write means the
/// destination can take no more.
fn advance(pending: &mut Bytes, written: io::Result<usize>) -> io::Result<usize> {
    match written? {
        0 => Err(io::ErrorKind::WriteZero.into()),
        n => {
            pending.advance(n);
            Ok(n)
        }
    }
}

/// Read `source` until end-of-stream or error, publishing each read.
async fn read_loop<S: AsyncRead>(mut source: ReadHalf<S>, sink: mpsc::Sender<Chunk>) {
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    loop {
        let chunk = match source.read(&mut buf).await {
            Ok(0) => Chunk::Closed(None),
            // Copy out so the next read can reuse `buf`.
            Ok(n) => Chunk::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => Chunk::Closed(Some(e)),
        };
        let closed = matches!(chunk, Chunk::Closed(_));
        if sink.send(chunk).await.is_err() || closed {
            return;
        }
    }
}
