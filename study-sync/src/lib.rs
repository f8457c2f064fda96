//! # Study Sync
//!
//! Front end for the study-sync engine: an HTTP client for the remote
//! document service and the `study-sync` command-line tool.
//!
//! Each invocation opens the local mirrors, signs in when a user is given,
//! runs one command, and waits for remote propagation before exiting.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod commands;
pub mod http;

pub use cli::{Cli, Command, DomainArg};
pub use commands::{execute, run};
pub use http::HttpBackend;
