//! Command-line interface for songstream.
//!
//! Without a subcommand the server is started. The other subcommands work on
//! the catalog files directly, without a running server.

mod commands;

pub use commands::{Cli, Commands, run_command};
