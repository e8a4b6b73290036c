use std::{io, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{Event, ProtocolError};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Failure while moving an event across a connection.
///
/// `Protocol` leaves the stream aligned on the next frame, so callers may keep
/// reading; `Io` means the connection is unusable.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads one length-prefixed event.
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, WireError>
where
    R: AsyncRead + Unpin,
{
    let Some(body) = read_frame(reader).await? else {
        return Ok(None);
    };
    Ok(Some(Event::decode(&body)?))
}

/// Writes one event as a `u32` big-endian length followed by its JSON body.
pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = event.encode()?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "event too large"))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    // A zero-byte read before any prefix byte is a clean close.
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write half of a connection shared between tasks.
///
/// Every write takes the lock, so frames from concurrent senders never
/// interleave. Closing is idempotent and does not wait behind a stalled
/// write: sends in flight or queued on the lock are abandoned with
/// `NotConnected` as soon as `close` starts.
#[derive(Clone)]
pub struct EventWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    closing: CancellationToken,
}

impl EventWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
            closing: CancellationToken::new(),
        }
    }

    pub async fn send(&self, event: &Event) -> Result<(), WireError> {
        select! {
            biased;
            _ = self.closing.cancelled() => Err(not_connected().into()),
            sent = self.write(event) => sent,
        }
    }

    async fn write(&self, event: &Event) -> Result<(), WireError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or_else(not_connected)?;
        write_event(writer, event).await
    }

    /// Shuts the write half down. Returns `true` only for the call that closed it.
    pub async fn close(&self) -> bool {
        self.closing.cancel();
        let Some(mut writer) = self.inner.lock().await.take() else {
            return false;
        };
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shut down writer cleanly");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "writer closed")
}
