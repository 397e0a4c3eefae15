//! # lockstep-pty
//!
//! Pty and pipe primitives for the lockstep half-duplex driver.
//!
//! This crate is deliberately thin: it allocates the pseudoterminal pair,
//! switches the line discipline to raw mode, attaches the slave end as a
//! controlling terminal after fork, and hands out the cloexec pipe pairs the
//! driver and stub talk over. Everything job-control related lives in
//! `lockstep-core`; nothing here sends a signal or touches a process group.

mod pipe;
mod pty;

use thiserror::Error;

pub use pipe::{cloexec_pipe, set_cloexec, set_nonblocking};
pub use pty::{make_controlling_terminal, open_pty, set_raw, PtyPair};

/// Errors from pty and pipe setup.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(#[source] nix::errno::Errno),

    #[error("failed to configure termios: {0}")]
    Termios(#[source] nix::errno::Errno),

    #[error("failed to acquire controlling terminal: {0}")]
    ControllingTerminal(#[source] nix::errno::Errno),

    #[error("failed to create pipe: {0}")]
    Pipe(#[source] nix::errno::Errno),

    #[error("failed to change descriptor flags: {0}")]
    Fcntl(#[source] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, PtyError>;
