use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures::future::join_all;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::{CommandOutcome, CommandRegistry, CommandService, ExecutionResult, parse_line},
    event::Event,
    negotiator::negotiate,
    pool::WorkerPool,
    registry::{Registry, SubscriberId},
    session::SessionEnd,
};

/// Author stamped on operator broadcasts.
pub const SERVER_AUTHOR: &str = "[SERVER]";

/// How long shutdown waits to hand each session its `GOODBYE`.
pub const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    pool: WorkerPool,
}

struct ServerState {
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl ServerState {
    fn next_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Server {
    pub fn new(listener: TcpListener, pool: WorkerPool) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState {
                registry: Arc::new(Registry::new()),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
            pool,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Token that stops the accept loop and every session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Accepts connections until `shutdown` resolves or the shutdown token fires.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener, state, ..
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = state.shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        handle_shutdown(&state).await;
        Ok(())
    }

    /// Like [`Server::run_until`], with an operator console reading commands
    /// from `input`.
    pub async fn run_with_console<I, F>(self, input: I, shutdown: F) -> Result<()>
    where
        I: AsyncBufRead + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let commands = Arc::new(server_commands().build(self.pool.clone()));
        let context = ServerContext::new(self.registry(), self.shutdown_token());
        tokio::spawn(run_console(input, commands, context));
        self.run_until(shutdown).await
    }
}

async fn handle_shutdown(state: &ServerState) {
    info!("server shutting down");
    let farewells = state
        .registry
        .drain()
        .await
        .into_iter()
        .map(|(name, subscriber)| async move {
            match timeout(GOODBYE_TIMEOUT, subscriber.send(&Event::goodbye())).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => debug!(%name, ?error, "failed to send goodbye"),
                Err(_) => debug!(%name, "peer not reading, skipping goodbye"),
            }
            subscriber.close().await;
        });
    join_all(farewells).await;
    state.shutdown.cancel();
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(handle_connection(stream, peer, state));
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let id = state.next_id();
    let mut session = match negotiate(stream, id, Some(peer), Arc::clone(&state.registry)).await {
        Ok(session) => session,
        Err(error) => {
            debug!(%peer, %error, "handshake rejected");
            return;
        }
    };

    if !state
        .registry
        .try_add(session.name(), session.subscriber())
        .await
    {
        debug!(%peer, name = %session.name(), "already has an existing session");
        session.close().await;
        return;
    }

    info!(%peer, name = %session.name(), "client joined");
    state
        .registry
        .broadcast(Event::user_join(session.name()))
        .await;

    let end = session.run(&state.shutdown).await;
    match &end {
        SessionEnd::Failed(error) => debug!(%peer, name = %session.name(), ?error, "session failed"),
        SessionEnd::Malformed(error) => {
            warn!(%peer, name = %session.name(), %error, "closing session after malformed event")
        }
        other => debug!(%peer, name = %session.name(), reason = ?other, "session ended"),
    }

    let name = session.name().to_string();
    let removed = state.registry.remove(&name, session.id()).await;
    if removed && matches!(end, SessionEnd::Shutdown) {
        // Joined after the shutdown drain; say goodbye here instead.
        let goodbye = session.subscriber();
        match timeout(GOODBYE_TIMEOUT, goodbye.send(&Event::goodbye())).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(%peer, ?error, "failed to send goodbye"),
            Err(_) => debug!(%peer, "peer not reading, skipping goodbye"),
        }
    }
    session.close().await;

    if removed {
        info!(%peer, %name, "client left");
        state.registry.broadcast(Event::user_leave(name)).await;
    }
}

/// What server console commands operate on.
#[derive(Clone)]
pub struct ServerContext {
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(registry: Arc<Registry>, shutdown: CancellationToken) -> Self {
        Self { registry, shutdown }
    }
}

pub fn server_commands() -> CommandRegistry<ServerContext> {
    CommandRegistry::new()
        .register("BROADCAST", broadcast_command)
        .register("LIST", list_command)
        .register("EXIT", exit_command)
}

async fn broadcast_command(ctx: ServerContext, args: Vec<String>) -> Result<ExecutionResult> {
    if args.is_empty() {
        return Ok(ExecutionResult::failure("nothing to broadcast"));
    }
    ctx.registry
        .broadcast(Event::message(SERVER_AUTHOR, args.join(" ")))
        .await;
    Ok(ExecutionResult::success())
}

async fn list_command(ctx: ServerContext, _args: Vec<String>) -> Result<ExecutionResult> {
    let names = ctx.registry.names().await;
    info!("{} users online: {}", names.len(), names.join(", "));
    Ok(ExecutionResult::success())
}

async fn exit_command(ctx: ServerContext, _args: Vec<String>) -> Result<ExecutionResult> {
    info!("exit requested from console");
    ctx.shutdown.cancel();
    Ok(ExecutionResult::success())
}

/// Reads operator commands line by line until the server stops or `input`
/// reaches EOF. EOF leaves the server running.
pub async fn run_console<I>(
    mut input: I,
    commands: Arc<CommandService<ServerContext>>,
    context: ServerContext,
) where
    I: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = select! {
            biased;
            _ = context.shutdown.cancelled() => return,
            read = input.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => {
                debug!("operator console closed");
                return;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(?error, "failed to read operator console");
                return;
            }
        }

        let Some((name, args)) = parse_line(&line) else {
            continue;
        };
        match commands.execute(context.clone(), &name, args).await {
            CommandOutcome::NotFound => warn!(command = %name, "no such command exists"),
            outcome if !outcome.is_success() => warn!("{name}: {}", outcome.reason()),
            _ => {}
        }
    }
}
