#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunctl library — building blocks of the tunnel connection supervisor.
//!
//! - `config` — TOML + env-var configuration
//! - `connections` — the registry and per-connection state machine
//! - `dispatcher` — the central event loop and the [`Supervisor`] handle
//! - `manage` — management-channel transport, parsing and command queue
//! - `launcher` — direct process launch and signalling
//! - `service` — bridge to the privileged helper service

pub mod config;
pub mod connections;
pub mod dispatcher;
pub mod error;
pub mod launcher;
pub mod manage;
pub mod service;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use connections::{ConnId, ConnState, Registry, RegistrySnapshot};
pub use dispatcher::Supervisor;
pub use error::{Error, Result};
