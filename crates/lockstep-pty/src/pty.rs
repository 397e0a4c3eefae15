//! Pseudoterminal allocation and configuration.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::pty::openpty;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::unistd::setsid;

use crate::{PtyError, Result};

/// Both ends of a freshly allocated pseudoterminal.
///
/// The master stays with the caller; the slave is handed to the forked child
/// where it becomes the controlling terminal and stdio. Each end closes on
/// drop, so the side a process does not own should be dropped right after
/// fork.
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a pty pair.
pub fn open_pty() -> Result<PtyPair> {
    let pty = openpty(None, None).map_err(PtyError::Open)?;
    Ok(PtyPair {
        master: pty.master,
        slave: pty.slave,
    })
}

/// Put the pty's line discipline in raw mode.
///
/// Disables canonical assembly, echo, signal generation, and output
/// post-processing so byte streams pass through verbatim in both directions.
/// The master and slave share one line discipline; configuring it through
/// either end is equivalent.
pub fn set_raw<F: AsFd>(fd: F) -> Result<()> {
    let mut termios = tcgetattr(&fd).map_err(PtyError::Termios)?;
    cfmakeraw(&mut termios);
    tcsetattr(&fd, SetArg::TCSANOW, &termios).map_err(PtyError::Termios)
}

/// In the child after fork: start a new session and make `slave` its
/// controlling terminal.
///
/// Must run before the slave end is duplicated onto stdio. The caller is
/// expected to be a freshly forked child that is not yet a session leader.
pub fn make_controlling_terminal<F: AsFd>(slave: F) -> Result<()> {
    setsid().map_err(PtyError::ControllingTerminal)?;
    // SAFETY: TIOCSCTTY on a valid slave fd in a session-leader child.
    let rc = unsafe { nix::libc::ioctl(slave.as_fd().as_raw_fd(), nix::libc::TIOCSCTTY as _, 0) };
    if rc < 0 {
        return Err(PtyError::ControllingTerminal(Errno::last()));
    }
    Ok(())
}
