//! Length-prefixed JSON chat relay over TCP.
//!
//! One binary runs in three modes: a server that relays events between
//! named sessions, an interactive terminal client, and a command bot. Each
//! module focuses on a concrete responsibility:
//!
//! - [`event`] and [`codec`] define the envelope, its opcodes, and the
//!   `u32`-prefixed frames they travel in.
//! - [`negotiator`], [`session`], and [`registry`] make up the server core:
//!   the `HELLO`/`USER_JOIN` handshake, the per-connection dispatch loop, and
//!   the name-keyed subscriber map used for broadcast and direct delivery.
//! - [`server`] accepts connections and runs the operator console.
//! - [`engine`] and [`backoff`] are the client core shared by [`client`] and
//!   [`bot`]: duplex send/receive loops with cancellation, and the reconnect
//!   delay schedule.
//! - [`command`] and [`pool`] route text commands to handlers on a bounded
//!   worker pool.
//! - [`cli`] parses the command-line interface for all three modes.
//!
//! Integration tests drive a real [`server::Server`] over loopback TCP.

pub mod backoff;
pub mod bot;
pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod engine;
pub mod event;
pub mod negotiator;
pub mod pool;
pub mod registry;
pub mod server;
pub mod session;
