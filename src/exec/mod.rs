//! Command execution subsystem (server mode).
//!
//! # Data Flow
//! ```text
//! CommandListener::next_command()
//!     → ShellExecutor::serve (one tracked task per command)
//!     → <shell> -c <input>
//!     → child stdout/stderr, read in `read_buffer_size` pieces
//!     → OutputSink::write ... close
//! ```
//!
//! # Design Decisions
//! - Spawn failures, read failures and non-zero exit statuses are written to
//!   the stderr stream as text before it is closed
//! - Both sinks are closed on every path so the controller always sees two terminal chunks

pub mod shell;

pub use shell::{ExecError, Shell, ShellExecutor};
