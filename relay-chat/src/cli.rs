use clap::{Args, Parser, Subcommand};

use crate::{bot::DEFAULT_BOT_NAME, pool::DEFAULT_WORKERS};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 14001;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Size of the worker pool shared by engine loops and commands.
    #[arg(long, default_value_t = DEFAULT_WORKERS, global = true)]
    pub workers: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server with an operator console on stdin.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
    /// Connect a bot that answers ECHO, DADJOKE and HELP.
    Bot(BotArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the server binds to.
    #[arg(long = "csa", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Port the server binds to. Use 0 for an ephemeral port.
    #[arg(long = "csp", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host of the server to connect to.
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub cca: String,

    /// Port of the server to connect to.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub ccp: u16,

    /// Name to join with. Prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct BotArgs {
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub cca: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub ccp: u16,

    #[arg(long, default_value = DEFAULT_BOT_NAME)]
    pub name: String,
}

/// Rewrites single-dash long flags (`-name bob`) into the `--name bob` form
/// clap expects. Short flags such as `-h` are left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            if arg.len() > 2 && arg.starts_with('-') && !arg.starts_with("--") {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}
