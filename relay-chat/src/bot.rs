//! Automated participant that answers chat commands.
//!
//! The bot never produces events on its own; everything it sends is a reply
//! to a `MESSAGE` whose first word names one of its commands.

use std::sync::Arc;

use anyhow::Result;
use rand::{seq::SliceRandom, thread_rng};
use tracing::{debug, info, warn};

use crate::{
    backoff::connect_with_backoff,
    cli::BotArgs,
    command::{CommandOutcome, CommandRegistry, CommandService, ExecutionResult, parse_line},
    engine::{ClientEngine, EngineError, EventSender, EventSink, EventSource},
    event::{Event, MessageSend},
    pool::WorkerPool,
};

/// The bot retries immediately; a zero delay never grows.
pub const INITIAL_BACKOFF_SECS: u64 = 0;

pub const DEFAULT_BOT_NAME: &str = "ChatBot";

const DAD_JOKES: &[&str] = &[
    "What does a clock do when it's hungry? It goes back four seconds!",
    "Did you hear about the bread factory burning down? They say the business is toast.",
    "When do doctors get angry? When they run out of patients.",
    "Parallel lines have so much in common. It's a shame they'll never meet.",
    "Why don't skeletons ride roller coasters? They don't have the stomach for it.",
    "What do you call someone with no nose? Nobody knows.",
    "R.I.P. boiled water. You will be mist.",
    "I wouldn't buy anything with velcro. It's a total rip-off.",
    "I knew I shouldn't steal a mixer from work, but it was a whisk I was willing to take.",
];

pub async fn run(args: BotArgs, pool: WorkerPool) -> Result<()> {
    let address = args.cca.as_str();
    let port = args.ccp;
    info!("connecting to {address}:{port}");
    let engine = connect_with_backoff(INITIAL_BACKOFF_SECS, || {
        ClientEngine::connect((address, port), pool.clone())
    })
    .await;
    info!("connected to {}", engine.peer_addr());

    let sender = engine.sender();
    let commands = Arc::new(bot_commands().build(pool.clone()));
    let sink = BotSink::new(args.name, sender.clone(), commands);
    let handle = engine.run(IdleSource, sink);

    let interrupt = sender.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match handle.wait().await {
        Ok(()) | Err(EngineError::Cancelled) => {}
        Err(error) => warn!("the server connection was aborted: {error}"),
    }
    sender.dispose().await;
    Ok(())
}

/// Source that never yields; the send loop just waits for cancellation.
pub struct IdleSource;

impl EventSource for IdleSource {
    async fn next_event(&mut self) -> Option<Event> {
        std::future::pending().await
    }
}

#[derive(Clone)]
pub struct BotContext {
    sender: EventSender,
}

impl BotContext {
    pub fn new(sender: EventSender) -> Self {
        Self { sender }
    }

    async fn say(&self, content: impl Into<String>) -> Result<()> {
        self.sender.send(&Event::message("", content)).await?;
        Ok(())
    }
}

pub fn bot_commands() -> CommandRegistry<BotContext> {
    CommandRegistry::new()
        .register("ECHO", echo_command)
        .register("DADJOKE", dad_joke_command)
        .register("HELP", help_command)
}

async fn echo_command(ctx: BotContext, args: Vec<String>) -> Result<ExecutionResult> {
    ctx.say(args.join(" ")).await?;
    Ok(ExecutionResult::success())
}

async fn dad_joke_command(ctx: BotContext, _args: Vec<String>) -> Result<ExecutionResult> {
    let joke = pick_joke();
    ctx.say(joke).await?;
    Ok(ExecutionResult::success())
}

fn pick_joke() -> &'static str {
    DAD_JOKES
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or("I forgot the punchline.")
}

async fn help_command(ctx: BotContext, _args: Vec<String>) -> Result<ExecutionResult> {
    ctx.say(help_text()).await?;
    Ok(ExecutionResult::success())
}

fn help_text() -> String {
    [
        "BOT HELP",
        "I'm a chat bot!",
        "ECHO    : Echoes any provided text right back to you!",
        "DADJOKE : Tells you a really, really funny joke.",
        "HELP    : Shows this menu",
    ]
    .join("\n")
}

/// Joins on `HELLO` and runs commands found in other participants' messages.
pub struct BotSink {
    name: String,
    sender: EventSender,
    commands: Arc<CommandService<BotContext>>,
}

impl BotSink {
    /// `name` is trimmed the same way the server trims join names, so the
    /// bot recognizes its own messages once they come back stamped.
    pub fn new(
        name: impl AsRef<str>,
        sender: EventSender,
        commands: Arc<CommandService<BotContext>>,
    ) -> Self {
        let name = match name.as_ref().trim() {
            "" => DEFAULT_BOT_NAME,
            trimmed => trimmed,
        };
        Self {
            name: name.to_string(),
            sender,
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, message: MessageSend) {
        if message.author == self.name {
            return;
        }
        let Some((command, args)) = parse_line(&message.content) else {
            return;
        };

        let context = BotContext::new(self.sender.clone());
        match self.commands.execute(context, &command, args).await {
            CommandOutcome::NotFound => {}
            outcome if outcome.is_success() => debug!(%command, "executed a command"),
            outcome => warn!("a command ran unsuccessfully: {}", outcome.reason()),
        }
    }
}

impl EventSink for BotSink {
    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Hello => {
                debug!("received server handshake");
                if let Err(error) = self.sender.send(&Event::user_join(self.name.as_str())).await {
                    warn!(?error, "failed to join");
                }
            }
            Event::Message(message) => self.on_message(message).await,
            Event::Goodbye => {
                info!("server said goodbye");
                self.sender.cancel();
            }
            _ => {}
        }
    }
}
