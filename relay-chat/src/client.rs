use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::{
    backoff::connect_with_backoff,
    cli::ClientArgs,
    command::{CommandRegistry, CommandService, ExecutionResult, parse_line},
    engine::{ClientEngine, EngineError, EventSender, EventSink, EventSource},
    event::Event,
    pool::WorkerPool,
};

/// First reconnect delay for the interactive client, in seconds.
pub const INITIAL_BACKOFF_SECS: u64 = 2;

pub async fn run(args: ClientArgs, pool: WorkerPool) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let name = match args.name {
        Some(name) => name,
        None => prompt_name(&mut stdin, &mut tokio::io::stdout()).await?,
    };

    let address = args.cca.as_str();
    let port = args.ccp;
    let engine = connect_with_backoff(INITIAL_BACKOFF_SECS, || {
        ClientEngine::connect((address, port), pool.clone())
    })
    .await;
    info!("connected to {}", engine.peer_addr());

    let sender = engine.sender();
    let commands = Arc::new(client_commands().build(pool.clone()));
    let source = ConsoleSource::new(stdin, commands, ClientContext::new(sender.clone()));
    let sink = ConsoleSink::new(name, tokio::io::stdout(), sender.clone());
    let handle = engine.run(source, sink);

    let interrupt = sender.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => interrupt.cancel(),
            Err(error) => warn!(?error, "failed to install ctrl-c handler"),
        }
    });

    match handle.wait().await {
        Ok(()) | Err(EngineError::Cancelled) => {}
        Err(error) => warn!("client stopped: {error}"),
    }
    sender.dispose().await;
    Ok(())
}

async fn prompt_name<I, W>(input: &mut I, output: &mut W) -> Result<String>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        output.write_all(b"Enter your name: ").await?;
        output.flush().await?;

        line.clear();
        let read = input
            .read_line(&mut line)
            .await
            .context("failed to read name")?;
        if read == 0 {
            bail!("no name given");
        }
        let name = line.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
}

/// What client commands act on: the running engine.
#[derive(Clone)]
pub struct ClientContext {
    sender: EventSender,
}

impl ClientContext {
    pub fn new(sender: EventSender) -> Self {
        Self { sender }
    }
}

pub fn client_commands() -> CommandRegistry<ClientContext> {
    CommandRegistry::new()
        .register("EXIT", exit_command)
        .register("NICK", nick_command)
        .register("DM", dm_command)
}

async fn exit_command(ctx: ClientContext, _args: Vec<String>) -> Result<ExecutionResult> {
    leave(&ctx.sender).await;
    Ok(ExecutionResult::success())
}

async fn nick_command(ctx: ClientContext, args: Vec<String>) -> Result<ExecutionResult> {
    let [name] = args.as_slice() else {
        return Ok(ExecutionResult::failure("only one parameter accepted"));
    };
    // The server fills in the old name.
    ctx.sender.send(&Event::change_name("", name.as_str())).await?;
    Ok(ExecutionResult::success())
}

async fn dm_command(ctx: ClientContext, args: Vec<String>) -> Result<ExecutionResult> {
    let Some((target, words)) = args.split_first().filter(|(_, words)| !words.is_empty()) else {
        return Ok(ExecutionResult::failure("usage: DM <target> <message>"));
    };
    ctx.sender
        .send(&Event::direct_message("", target.as_str(), words.join(" ")))
        .await?;
    Ok(ExecutionResult::success())
}

async fn leave(sender: &EventSender) {
    if let Err(error) = sender.send(&Event::goodbye()).await {
        debug!(?error, "failed to send goodbye");
    }
    sender.cancel();
    sender.dispose().await;
}

/// Turns console lines into outbound events, running client commands in place.
pub struct ConsoleSource<I> {
    input: I,
    line: String,
    commands: Arc<CommandService<ClientContext>>,
    context: ClientContext,
}

impl<I> ConsoleSource<I> {
    pub fn new(
        input: I,
        commands: Arc<CommandService<ClientContext>>,
        context: ClientContext,
    ) -> Self {
        Self {
            input,
            line: String::new(),
            commands,
            context,
        }
    }
}

impl<I> EventSource for ConsoleSource<I>
where
    I: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_event(&mut self) -> Option<Event> {
        self.line.clear();
        match self.input.read_line(&mut self.line).await {
            Ok(0) => {
                leave(&self.context.sender).await;
                return None;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(?error, "failed to read console input");
                leave(&self.context.sender).await;
                return None;
            }
        }

        let (name, args) = parse_line(&self.line)?;
        if self.commands.contains(&name) {
            let outcome = self
                .commands
                .execute(self.context.clone(), &name, args)
                .await;
            if !outcome.is_success() {
                warn!("{name}: {}", outcome.reason());
            }
            return None;
        }

        Some(Event::message("", self.line.trim_end()))
    }
}

/// Prints inbound events and answers the server's `HELLO`.
pub struct ConsoleSink<W> {
    name: String,
    output: W,
    sender: EventSender,
}

impl<W> ConsoleSink<W> {
    pub fn new(name: String, output: W, sender: EventSender) -> Self {
        Self {
            name,
            output,
            sender,
        }
    }
}

impl<W> EventSink for ConsoleSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn handle_event(&mut self, event: Event) {
        if event == Event::Hello {
            if let Err(error) = self.sender.send(&Event::user_join(self.name.as_str())).await {
                warn!(?error, "failed to join");
            }
            return;
        }

        if let Some(line) = render(&event) {
            if let Err(error) = write_line(&mut self.output, &line).await {
                debug!(?error, "failed to write to console");
            }
        }
        if event == Event::Goodbye {
            self.sender.cancel();
        }
    }
}

/// Console text for an inbound event, if it has any.
pub fn render(event: &Event) -> Option<String> {
    let line = match event {
        Event::Hello => return None,
        Event::Goodbye => "*** server closed the connection".to_string(),
        Event::UserJoin(join) => format!("*** {} joined", join.name),
        Event::UserLeave(leave) => format!("*** {} left", leave.name),
        Event::Message(message) => format!("<{}> {}", message.author, message.content),
        Event::DirectMessage(direct) => format!(
            "[{} -> {}] {}",
            direct.sender_name, direct.target_name, direct.content
        ),
        Event::ChangeName(change) => {
            format!("*** {} is now known as {}", change.old_name, change.new_name)
        }
    };
    Some(line)
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_chat_events() {
        assert_eq!(
            render(&Event::message("alice", "hi")).as_deref(),
            Some("<alice> hi")
        );
        assert_eq!(
            render(&Event::direct_message("alice", "bob", "psst")).as_deref(),
            Some("[alice -> bob] psst")
        );
        assert_eq!(
            render(&Event::change_name("alice", "carol")).as_deref(),
            Some("*** alice is now known as carol")
        );
        assert_eq!(
            render(&Event::user_join("bob")).as_deref(),
            Some("*** bob joined")
        );
        assert_eq!(render(&Event::hello()), None);
    }

    #[tokio::test]
    async fn prompt_skips_blank_lines() {
        let mut input = BufReader::new(&b"\n   \n  alice \n"[..]);
        let mut output = Vec::new();

        let name = prompt_name(&mut input, &mut output).await.expect("name");
        assert_eq!(name, "alice");
        assert_eq!(
            String::from_utf8(output).expect("utf8"),
            "Enter your name: ".repeat(3)
        );
    }

    #[tokio::test]
    async fn prompt_fails_on_eof() {
        let mut input = BufReader::new(&b""[..]);
        let mut output = Vec::new();
        assert!(prompt_name(&mut input, &mut output).await.is_err());
    }

    #[test]
    fn client_commands_are_registered() {
        let commands = client_commands().build(WorkerPool::new(1));
        assert_eq!(commands.names(), vec!["DM", "EXIT", "NICK"]);
    }
}
