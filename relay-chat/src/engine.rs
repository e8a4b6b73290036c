//! Generic client side of the protocol.
//!
//! A [`ClientEngine`] owns one connection. [`ClientEngine::run`] splits it into
//! a send loop fed by an [`EventSource`] and a receive loop feeding an
//! [`EventSink`], both running on the shared [`WorkerPool`]. Front-ends differ
//! only in the source and sink they plug in.

use std::{future::Future, io, net::SocketAddr};

use thiserror::Error;
use tokio::{
    io::BufReader,
    net::{TcpStream, ToSocketAddrs, tcp::OwnedReadHalf},
    select,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::{EventWriter, WireError, read_event},
    event::Event,
    pool::WorkerPool,
};

/// Produces outbound events. `None` means "nothing to send this time".
pub trait EventSource: Send + 'static {
    fn next_event(&mut self) -> impl Future<Output = Option<Event>> + Send;
}

/// Consumes inbound events, one at a time.
pub trait EventSink: Send + 'static {
    fn handle_event(&mut self, event: Event) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine was cancelled")]
    Cancelled,
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("engine task failed: {0}")]
    Task(#[from] JoinError),
}

pub struct ClientEngine {
    reader: BufReader<OwnedReadHalf>,
    writer: EventWriter,
    cancel: CancellationToken,
    pool: WorkerPool,
    peer: SocketAddr,
}

impl ClientEngine {
    /// Makes a single connection attempt.
    pub async fn connect(addr: impl ToSocketAddrs, pool: WorkerPool) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        debug!(%peer, "connected");

        Ok(Self {
            reader: BufReader::new(reader),
            writer: EventWriter::new(writer),
            cancel: CancellationToken::new(),
            pool,
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            writer: self.writer.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Starts the send and receive loops.
    pub fn run<S, K>(self, source: S, sink: K) -> RunHandle
    where
        S: EventSource,
        K: EventSink,
    {
        let sender = self.sender();
        let ClientEngine {
            reader,
            writer,
            cancel,
            pool,
            peer,
        } = self;
        // Fired by the receive loop when the peer goes away.
        let closed = cancel.child_token();

        let send_loop = pool.spawn(send_loop(
            source,
            writer,
            cancel.clone(),
            closed.clone(),
        ));
        let receive_loop = pool.spawn(receive_loop(reader, sink, cancel, closed, peer));

        RunHandle {
            send_loop,
            receive_loop,
            sender,
        }
    }
}

async fn send_loop<S: EventSource>(
    mut source: S,
    writer: EventWriter,
    cancel: CancellationToken,
    closed: CancellationToken,
) -> Result<(), EngineError> {
    loop {
        let next = select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = closed.cancelled() => return Ok(()),
            next = source.next_event() => next,
        };

        let Some(event) = next else {
            tokio::task::yield_now().await;
            continue;
        };

        let sent = select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            sent = writer.send(&event) => sent,
        };
        match sent {
            Ok(()) => {}
            Err(WireError::Io(error)) => {
                closed.cancel();
                return Err(EngineError::Io(error));
            }
            Err(WireError::Protocol(error)) => {
                warn!(%error, "dropping event that could not be encoded");
            }
        }
    }
}

async fn receive_loop<K: EventSink>(
    mut reader: BufReader<OwnedReadHalf>,
    mut sink: K,
    cancel: CancellationToken,
    closed: CancellationToken,
    peer: SocketAddr,
) -> Result<(), EngineError> {
    let result = async {
        loop {
            let next = select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = read_event(&mut reader) => next,
            };

            match next {
                Ok(Some(event)) => {
                    select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = sink.handle_event(event) => {}
                    }
                }
                Ok(None) => {
                    debug!(%peer, "server closed the connection");
                    return Ok(());
                }
                Err(WireError::Protocol(error)) => {
                    warn!(%peer, %error, "skipping malformed event");
                }
                Err(WireError::Io(error)) => return Err(EngineError::Io(error)),
            }
        }
    }
    .await;

    closed.cancel();
    result
}

/// Cloneable handle for writing to and stopping a running engine.
#[derive(Clone)]
pub struct EventSender {
    writer: EventWriter,
    cancel: CancellationToken,
}

impl EventSender {
    pub async fn send(&self, event: &Event) -> Result<(), WireError> {
        self.writer.send(event).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes the transport. Safe to call any number of times from anywhere.
    pub async fn dispose(&self) {
        if self.writer.close().await {
            info!("disconnected");
        }
    }
}

/// The two loops started by [`ClientEngine::run`].
pub struct RunHandle {
    send_loop: JoinHandle<Result<(), EngineError>>,
    receive_loop: JoinHandle<Result<(), EngineError>>,
    sender: EventSender,
}

impl RunHandle {
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Waits for both loops.
    ///
    /// Cancellation wins over any other outcome, then the first transport
    /// error; a peer close is `Ok(())`.
    pub async fn wait(self) -> Result<(), EngineError> {
        let (sent, received) = tokio::join!(self.send_loop, self.receive_loop);
        let results = [flatten(sent), flatten(received)];

        if results
            .iter()
            .any(|result| matches!(result, Err(EngineError::Cancelled)))
        {
            return Err(EngineError::Cancelled);
        }
        results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
    }
}

fn flatten(result: Result<Result<(), EngineError>, JoinError>) -> Result<(), EngineError> {
    result?
}
