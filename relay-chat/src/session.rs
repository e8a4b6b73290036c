//! Server-side actor for one established connection.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncWrite, BufReader},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    codec::{BoxedReader, WireError, read_event},
    event::{ChangeName, DirectMessage, Event, MessageSend, ProtocolError, UserJoin},
    registry::{Registry, Subscriber, SubscriberId},
};

/// Why a session's run loop stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client said `GOODBYE`.
    Goodbye,
    /// Clean EOF from the client.
    Disconnected,
    Failed(io::Error),
    /// A frame arrived that could not be decoded as an event.
    Malformed(ProtocolError),
    /// The outbound half was closed under the session, by the shutdown drain
    /// or because the peer stopped reading.
    Closed,
    /// The server is shutting down.
    Shutdown,
}

pub struct ClientSession {
    id: SubscriberId,
    name: String,
    join: UserJoin,
    peer: Option<SocketAddr>,
    reader: BufReader<BoxedReader>,
    subscriber: Arc<Subscriber>,
    registry: Arc<Registry>,
}

impl ClientSession {
    pub fn new<W>(
        id: SubscriberId,
        peer: Option<SocketAddr>,
        join: UserJoin,
        reader: BufReader<BoxedReader>,
        writer: W,
        registry: Arc<Registry>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            name: join.name.clone(),
            join,
            peer,
            reader,
            subscriber: Arc::new(Subscriber::new(id, writer)),
            registry,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Current display name; changes only through a successful rename.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `USER_JOIN` this session was admitted with.
    pub fn join_info(&self) -> &UserJoin {
        &self.join
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn subscriber(&self) -> Arc<Subscriber> {
        Arc::clone(&self.subscriber)
    }

    pub async fn close(&mut self) -> bool {
        self.subscriber.close().await
    }

    /// Reads and dispatches events until the client leaves, the connection
    /// fails, or `shutdown` fires.
    ///
    /// Frames with an opcode this server does not know are skipped. Any other
    /// decoding failure ends the session.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> SessionEnd {
        loop {
            let next = select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = self.subscriber.closed() => return SessionEnd::Closed,
                next = read_event(&mut self.reader) => next,
            };

            match next {
                Ok(Some(event)) => {
                    if !self.dispatch(event).await {
                        return SessionEnd::Goodbye;
                    }
                }
                Ok(None) => return SessionEnd::Disconnected,
                Err(WireError::Protocol(ProtocolError::UnknownOpCode(opcode))) => {
                    debug!(name = %self.name, opcode, "skipping unknown opcode");
                }
                Err(WireError::Protocol(error)) => return SessionEnd::Malformed(error),
                Err(WireError::Io(error)) => return SessionEnd::Failed(error),
            }
        }
    }

    /// Returns `false` once the client has said goodbye.
    async fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::ChangeName(change) => self.change_name(change).await,
            Event::Message(message) => self.message(message).await,
            Event::DirectMessage(direct) => self.direct_message(direct).await,
            Event::Goodbye => return false,
            other => {
                debug!(name = %self.name, opcode = ?other.opcode(), "ignoring event");
            }
        }
        true
    }

    async fn change_name(&mut self, change: ChangeName) {
        let new_name = change.new_name.trim().to_string();
        if new_name.is_empty() || !self.registry.try_rename(&self.name, &new_name).await {
            debug!(name = %self.name, requested = %change.new_name, "rename refused");
            return;
        }

        let previous = std::mem::replace(&mut self.name, new_name);
        debug!(old = %previous, new = %self.name, "renamed");
        self.registry
            .broadcast(Event::change_name(previous, self.name.clone()))
            .await;
    }

    async fn message(&mut self, mut message: MessageSend) {
        message.author = self.name.clone();
        self.registry.broadcast(Event::Message(message)).await;
    }

    async fn direct_message(&mut self, mut direct: DirectMessage) {
        direct.sender_name = self.name.clone();
        let Some(target) = self.registry.get(&direct.target_name).await else {
            debug!(name = %self.name, target = %direct.target_name, "direct message target not found");
            return;
        };

        let event = Event::DirectMessage(direct);
        if let Err(error) = target.send(&event).await {
            debug!(name = %self.name, ?error, "failed to deliver direct message");
        }
        if target.id() == self.id {
            return;
        }
        if let Err(error) = self.subscriber.send(&event).await {
            debug!(name = %self.name, ?error, "failed to echo direct message");
        }
    }
}
