use thiserror::Error;

/// Errors from session setup and the driver side of the protocol.
///
/// Slave death is not an error: it is reported through
/// [`Session::exit_status`](crate::Session::exit_status) and the session
/// going inactive. Timeouts are not errors either; `recv` signals them with
/// `Ok(None)` and leaves all state intact.
#[derive(Debug, Error)]
pub enum Error {
    #[error("pty setup failed: {0}")]
    Pty(#[from] lockstep_pty::PtyError),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::errno::Errno),

    #[error("command is empty")]
    EmptyCommand,

    #[error("command contains a NUL byte")]
    InvalidCommand,

    #[error("short read during slave pid handshake")]
    Handshake,

    #[error("malformed event on info pipe (tag {0:#04x})")]
    Protocol(u8),

    #[error("session is already active")]
    AlreadyActive,

    #[error("session i/o failed: {0}")]
    Io(#[source] nix::errno::Errno),

    #[error("signal delivery failed: {0}")]
    Kill(#[source] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
