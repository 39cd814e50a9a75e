//! Management-channel protocol client.
//!
//! The managed tunnel process exposes a line-oriented control interface over
//! a loopback socket. This module owns everything on tunctl's side of it:
//!
//! - **Transport** ([`channel`]) — per-connection listener, reader task with
//!   partial-read staging, and the writer handle kept on the session.
//! - **Commands** ([`command`]) — the FIFO command queue with a single
//!   in-flight slot, argument escaping, and zero-on-release secrets.
//! - **Parsing** ([`parser`]) — inbound lines classified into async notices
//!   and command replies.

pub mod channel;
pub mod command;
pub mod parser;

pub use channel::{ChannelId, ChannelWriter, LineAssembler};
pub use command::{CommandQueue, ManageCommand, Secret};
pub use parser::{MgmtLine, Notice, Reply, StateKind};
