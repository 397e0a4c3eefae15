//! # lockstep-core
//!
//! A synchronous, request/response driver for child processes that normally
//! talk over a full-duplex terminal. The driver queues a buffer of input,
//! then blocks until the child has consumed every byte and is waiting for
//! more, at which point all output produced in response comes back as a
//! single chunk. An interactive terminal program can be called like a remote
//! procedure.
//!
//! Three processes cooperate: the caller's process (the driver, owning a
//! [`Session`]), a stub forked as the session leader inside the pty, and the
//! user-supplied command (the slave) forked by the stub. The stub cycles the
//! slave between terminal foreground and background with `tcsetpgrp` and
//! SIGSTOP/SIGCONT until the kernel stops it for reading the terminal from
//! the background, which is the observable sign that the slave has gone
//! back to waiting for input.
//!
//! ```no_run
//! use std::time::Duration;
//! use lockstep_core::Session;
//!
//! # fn main() -> lockstep_core::Result<()> {
//! let mut session = Session::new();
//! session.spawn(&["bc", "-q"])?;
//! session.write(b"2+2\n");
//! let answer = session.recv(Some(Duration::from_secs(5)))?;
//! assert_eq!(answer.as_deref(), Some(&b"4\n"[..]));
//! session.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Full-duplex streaming is out of scope: if the child writes while nobody
//! is inside [`Session::recv`], the turn-taking contract no longer holds.

mod error;
mod protocol;
mod session;
mod stub;

pub use error::{Error, Result};
pub use session::{KillOutcome, Session, SlaveStatus, DEFAULT_KILL_POLICY};

pub use nix::sys::signal::Signal;
