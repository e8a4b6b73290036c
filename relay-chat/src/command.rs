//! Named text commands shared by the server console, the human client, and the bot.
//!
//! A front-end lists its commands once at startup with [`CommandRegistry`], then
//! freezes the table into a [`CommandService`]. Each execution receives its own
//! clone of the caller's context and runs on the shared [`WorkerPool`], so a slow
//! handler never runs on the caller's task. Handler errors and panics are turned
//! into failed results; they never reach the caller.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::BoxFuture;

use crate::pool::WorkerPool;

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub reason: String,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            success: true,
            reason: String::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// Result of [`CommandService::execute`].
///
/// `NotFound` is deliberately separate from a failed execution so callers can
/// treat unknown tokens as plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    NotFound,
    Executed(ExecutionResult),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Executed(result) if result.success)
    }

    pub fn reason(&self) -> &str {
        match self {
            CommandOutcome::NotFound => "command not found",
            CommandOutcome::Executed(result) => &result.reason,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<ExecutionResult>>;

type Handler<C> = Arc<dyn Fn(C, Vec<String>) -> HandlerFuture + Send + Sync>;

/// Mutable table of commands, used only while a front-end is starting up.
pub struct CommandRegistry<C> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C: Send + 'static> CommandRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Adds a command. Registering a name again replaces the earlier handler.
    pub fn register<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(C, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ExecutionResult>> + Send + 'static,
    {
        let handler: Handler<C> =
            Arc::new(move |context: C, args: Vec<String>| -> HandlerFuture {
                Box::pin(handler(context, args))
            });
        self.handlers.insert(name.to_string(), handler);
        self
    }

    /// Folds another table into this one; its entries win on conflicts.
    pub fn merge(mut self, other: CommandRegistry<C>) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn build(self, pool: WorkerPool) -> CommandService<C> {
        CommandService {
            handlers: self.handlers,
            pool,
        }
    }
}

impl<C: Send + 'static> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable command table bound to a worker pool.
pub struct CommandService<C> {
    handlers: HashMap<String, Handler<C>>,
    pool: WorkerPool,
}

impl<C: Send + 'static> CommandService<C> {
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs `name` with `args` against `context`.
    ///
    /// Unknown names resolve immediately without touching the pool. Names are
    /// case-sensitive.
    pub async fn execute(&self, context: C, name: &str, args: Vec<String>) -> CommandOutcome {
        let Some(handler) = self.handlers.get(name) else {
            return CommandOutcome::NotFound;
        };

        let handler = Arc::clone(handler);
        let task = self.pool.spawn(async move { handler(context, args).await });
        let result = match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => ExecutionResult::failure(format!("{error:#}")),
            Err(error) if error.is_panic() => ExecutionResult::failure("command panicked"),
            Err(_) => ExecutionResult::failure("command was cancelled"),
        };
        CommandOutcome::Executed(result)
    }
}

impl<C> fmt::Debug for CommandService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("CommandService")
            .field("commands", &names)
            .finish()
    }
}

/// Splits a console line into a command token and its arguments.
pub fn parse_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next()?.to_string();
    let args = tokens.map(str::to_string).collect();
    Some((name, args))
}
