//! Pipe pairs and descriptor-flag helpers.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;

use crate::{PtyError, Result};

/// Create a unidirectional cloexec pipe, returned as `(read, write)`.
///
/// Cloexec matters here: the stub execs nothing itself, but the slave it
/// forks does, and a leaked pipe end held open across that exec would keep
/// the channel from ever reporting EOF.
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(PtyError::Pipe)
}

/// Switch a descriptor to non-blocking mode.
pub fn set_nonblocking<F: AsFd>(fd: F) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(PtyError::Fcntl)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(PtyError::Fcntl)?;
    Ok(())
}

/// Mark a descriptor close-on-exec.
pub fn set_cloexec<F: AsFd>(fd: F) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFD).map_err(PtyError::Fcntl)?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(raw, FcntlArg::F_SETFD(flags)).map_err(PtyError::Fcntl)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::FdFlag;
    use nix::unistd::{read, write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_round_trips_bytes() {
        let (rx, tx) = cloexec_pipe().expect("pipe");
        write(&tx, b"ok").expect("write");
        let mut buf = [0u8; 2];
        assert_eq!(read(rx.as_raw_fd(), &mut buf).expect("read"), 2);
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn pipe_ends_are_cloexec() {
        let (rx, tx) = cloexec_pipe().expect("pipe");
        for fd in [&rx, &tx] {
            let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).expect("F_GETFD");
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn set_nonblocking_is_reflected_in_flags() {
        let (rx, _tx) = cloexec_pipe().expect("pipe");
        set_nonblocking(&rx).expect("set nonblocking");
        let flags = fcntl(rx.as_raw_fd(), FcntlArg::F_GETFL).expect("F_GETFL");
        assert!(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK));
    }
}
