use std::time::Duration;

use anyhow::Result;
use relay_chat::{
    backoff::connect_with_backoff,
    engine::{ClientEngine, EngineError, EventSender, EventSink, EventSource},
    event::Event,
    pool::WorkerPool,
    server::Server,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::{Instant, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

struct ChannelSource(mpsc::UnboundedReceiver<Event>);

impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Option<Event> {
        match self.0.recv().await {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }
}

/// Joins as `name` on `HELLO` and forwards everything else to the test.
struct JoiningSink {
    name: String,
    sender: EventSender,
    inbox: mpsc::UnboundedSender<Event>,
}

impl EventSink for JoiningSink {
    async fn handle_event(&mut self, event: Event) {
        if event == Event::Hello {
            let _ = self.sender.send(&Event::user_join(self.name.as_str())).await;
            return;
        }
        let _ = self.inbox.send(event);
    }
}

struct Harness {
    outbox: mpsc::UnboundedSender<Event>,
    inbox: mpsc::UnboundedReceiver<Event>,
    sender: EventSender,
    handle: relay_chat::engine::RunHandle,
}

async fn start_client(addr: std::net::SocketAddr, name: &str) -> Result<Harness> {
    let engine = ClientEngine::connect(addr, WorkerPool::new(4)).await?;
    Ok(attach(engine, name))
}

fn attach(engine: ClientEngine, name: &str) -> Harness {
    let sender = engine.sender();
    let (outbox, source_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let sink = JoiningSink {
        name: name.to_string(),
        sender: sender.clone(),
        inbox: inbox_tx,
    };
    let handle = engine.run(ChannelSource(source_rx), sink);
    Harness {
        outbox,
        inbox,
        sender,
        handle,
    }
}

impl Harness {
    async fn expect(&mut self, wanted: &Event) -> Result<()> {
        loop {
            let event = timeout(WAIT, self.inbox.recv())
                .await?
                .ok_or_else(|| anyhow::anyhow!("engine stopped waiting for {wanted:?}"))?;
            if &event == wanted {
                return Ok(());
            }
        }
    }
}

async fn start_server() -> Result<(std::net::SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener, WorkerPool::new(4));
    let addr = server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = server
            .run_until(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    Ok((addr, shutdown_tx))
}

#[tokio::test]
async fn engine_joins_and_relays_messages() -> Result<()> {
    let (addr, _shutdown) = start_server().await?;
    let mut alice = start_client(addr, "alice").await?;
    alice.expect(&Event::user_join("alice")).await?;

    alice.outbox.send(Event::message("", "hello"))?;
    alice.expect(&Event::message("alice", "hello")).await?;
    Ok(())
}

#[tokio::test]
async fn cancel_stops_both_loops_and_dispose_is_idempotent() -> Result<()> {
    let (addr, _shutdown) = start_server().await?;
    let mut alice = start_client(addr, "alice").await?;
    alice.expect(&Event::user_join("alice")).await?;

    alice.sender.cancel();
    let outcome = timeout(WAIT, alice.handle.wait()).await?;
    assert!(matches!(outcome, Err(EngineError::Cancelled)));

    alice.sender.dispose().await;
    alice.sender.dispose().await;
    Ok(())
}

#[tokio::test]
async fn server_shutdown_ends_the_engine_cleanly() -> Result<()> {
    let (addr, shutdown) = start_server().await?;
    let mut alice = start_client(addr, "alice").await?;
    alice.expect(&Event::user_join("alice")).await?;

    let _ = shutdown.send(());
    alice.expect(&Event::goodbye()).await?;

    let outcome = timeout(WAIT, alice.handle.wait()).await?;
    assert!(outcome.is_ok(), "unexpected outcome {outcome:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backoff_retries_until_the_server_appears() -> Result<()> {
    // Take a free port and release it so the first connects are refused.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = reserved.local_addr()?;
    drop(reserved);

    let mut attempts = Vec::new();
    let engine = connect_with_backoff(3, || {
        attempts.push(Instant::now());
        if attempts.len() == 3 {
            let listener = std::net::TcpListener::bind(addr).expect("rebind reserved port");
            listener.set_nonblocking(true).expect("nonblocking listener");
            let server = Server::new(
                TcpListener::from_std(listener).expect("tokio listener"),
                WorkerPool::new(4),
            );
            tokio::spawn(server.run_until(std::future::pending::<()>()));
        }
        ClientEngine::connect(addr, WorkerPool::new(4))
    })
    .await;

    // Real sockets from here on, so let the clock run again for the timeouts.
    tokio::time::resume();

    let gaps: Vec<Duration> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(gaps.len(), 2, "expected two refused attempts before success");
    for (gap, delay) in gaps.iter().zip([3, 9]) {
        let delay = Duration::from_secs(delay);
        assert!(*gap >= delay && *gap < delay + Duration::from_secs(1), "gap {gap:?}");
    }
    assert_eq!(engine.peer_addr(), addr);

    let mut alice = attach(engine, "alice");
    alice.expect(&Event::user_join("alice")).await?;
    alice.outbox.send(Event::message("", "made it"))?;
    alice.expect(&Event::message("alice", "made it")).await?;
    Ok(())
}
