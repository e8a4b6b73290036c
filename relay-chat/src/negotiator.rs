use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tracing::debug;

use crate::{
    codec::{BoxedReader, WireError, read_event, write_event},
    event::{Event, OpCode, UserJoin},
    registry::{Registry, SubscriberId},
    session::ClientSession,
};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to send hello: {0}")]
    Hello(#[source] WireError),
    #[error("failed to read join: {0}")]
    Read(#[source] WireError),
    #[error("connection closed before joining")]
    Closed,
    #[error("expected USER_JOIN, got {0:?}")]
    UnexpectedOpCode(OpCode),
    #[error("join name is blank")]
    BlankName,
}

/// Upgrades a freshly accepted connection into a [`ClientSession`].
///
/// Sends `HELLO`, then waits for exactly one event. Anything but a `USER_JOIN`
/// with a non-blank name shuts the connection down and yields an error; there
/// are no retries. Registering the session is left to the caller.
pub async fn negotiate<S>(
    stream: S,
    id: SubscriberId,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
) -> Result<ClientSession, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(Box::new(reader) as BoxedReader);

    debug!(?peer, "starting handshake");
    let join = match await_join(&mut reader, &mut writer).await {
        Ok(join) => join,
        Err(error) => {
            reject(writer).await;
            return Err(error);
        }
    };

    debug!(?peer, name = %join.name, "identified");
    Ok(ClientSession::new(id, peer, join, reader, writer, registry))
}

async fn await_join<S>(
    reader: &mut BufReader<BoxedReader>,
    writer: &mut WriteHalf<S>,
) -> Result<UserJoin, HandshakeError>
where
    S: AsyncRead + AsyncWrite,
{
    write_event(writer, &Event::hello())
        .await
        .map_err(HandshakeError::Hello)?;

    let join = match read_event(reader).await.map_err(HandshakeError::Read)? {
        Some(Event::UserJoin(join)) => join,
        Some(other) => return Err(HandshakeError::UnexpectedOpCode(other.opcode())),
        None => return Err(HandshakeError::Closed),
    };

    let name = join.name.trim();
    if name.is_empty() {
        return Err(HandshakeError::BlankName);
    }
    Ok(UserJoin {
        name: name.to_string(),
    })
}

async fn reject<S>(mut writer: WriteHalf<S>)
where
    S: AsyncRead + AsyncWrite,
{
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down rejected connection");
    }
}
