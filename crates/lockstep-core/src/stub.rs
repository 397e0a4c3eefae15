//! The stub process: the job-control engine between driver and slave.
//!
//! The stub is forked by [`Session::spawn`](crate::Session::spawn) and is
//! the session leader inside the pty; the slave pty is its controlling
//! terminal and its stdio. It forks the slave command into a process group
//! of its own and then, one control-pipe request at a time, cycles that
//! group between terminal foreground and background until the kernel stops
//! it with SIGTTIN for reading the terminal from the background. A stop
//! with the input buffer already empty means the slave consumed everything
//! and went back to waiting: that is the "ready" the driver blocks on.
//!
//! Nothing here may write to stdout or stderr: both are the pty, and any
//! stray byte would land in the driver's read buffer. The info pipe is the
//! stub's only output channel.

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::process;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, raise, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, getpgrp, read, setpgid, tcsetpgrp, write, ForkResult, Pid};

use crate::protocol;

/// First foreground slice granted to the slave per step.
///
/// BSD kernels charge a background process roughly half a second per
/// terminal read attempt, so a coarser opening slice keeps the number of
/// attempts down; Linux can afford to probe much sooner.
#[cfg(target_os = "linux")]
const INITIAL_LAG: Duration = Duration::from_millis(20);
#[cfg(not(target_os = "linux"))]
const INITIAL_LAG: Duration = Duration::from_millis(150);

/// Each failed step grows the slice conservatively; retries are costly.
const LAG_MULTIPLIER: f64 = 1.5;

const LAG_CAP: Duration = Duration::from_millis(500);

/// Ceiling on consecutive failed steps within one request. A slave stopped
/// from outside (a user SIGTSTP, say) can pin unread input indefinitely;
/// past this bound the stop is reported as ready rather than hanging the
/// driver forever. Together with `LAG_CAP` this keeps a wedged request
/// bounded to a few seconds.
const MAX_STEP_RETRIES: u32 = 16;

/// Entered in the forked child after the pty slave has become the
/// controlling terminal and stdio. Never returns.
pub(crate) fn run(argv: Vec<CString>, ctl_read: OwnedFd, info_write: OwnedFd) -> ! {
    let code = match Stub::start(argv, ctl_read, info_write) {
        Ok(mut stub) => stub.serve(),
        Err(_) => 1,
    };
    process::exit(code)
}

enum StepOutcome {
    /// Slave blocked on terminal input with nothing left to read.
    Ready,
    /// Slave stopped but bytes remain unread; it needs more foreground time.
    Busy,
    Died { signal: u8, status: u8 },
}

struct Stub {
    ctl_read: OwnedFd,
    info_write: OwnedFd,
    slave_pgid: Pid,
    own_pgid: Pid,
}

impl Stub {
    fn start(argv: Vec<CString>, ctl_read: OwnedFd, info_write: OwnedFd) -> nix::Result<Self> {
        // tcsetpgrp from a background group would stop us without this.
        unsafe { signal(Signal::SIGTTOU, SigHandler::SigIgn) }?;

        // SAFETY: single-threaded; the child only execs or exits.
        let slave = match unsafe { fork() }? {
            ForkResult::Child => exec_slave(&argv),
            ForkResult::Parent { child } => child,
        };

        let mut stub = Stub {
            ctl_read,
            info_write,
            slave_pgid: slave,
            own_pgid: getpgrp(),
        };

        // The slave raises SIGSTOP on itself before exec. Observing that
        // stop before the pid goes out means that once the driver's
        // handshake completes, the slave group exists and is stopped; a
        // kill issued straight after spawn cannot miss it.
        let initial = stub.wait_for_stop()?;
        stub.emit(&protocol::encode_pid(slave.as_raw()))?;
        if let Some((signal, status)) = initial {
            stub.emit(&protocol::died_record(signal, status))?;
            process::exit(0);
        }
        Ok(stub)
    }

    /// Serve step requests until the driver hangs up or the slave dies.
    fn serve(&mut self) -> i32 {
        loop {
            let mut byte = [0u8; 1];
            match read(self.ctl_read.as_raw_fd(), &mut byte) {
                Ok(0) => return 0,
                Ok(_) => {
                    if byte[0] != protocol::STEP_REQUEST {
                        return 1;
                    }
                    match self.synchronize() {
                        Ok(true) => {}
                        Ok(false) => return 0,
                        Err(_) => return 1,
                    }
                }
                Err(Errno::EINTR) => {}
                Err(_) => return 1,
            }
        }
    }

    /// Run steps with growing lag until one ends at a clean input block.
    ///
    /// Returns `Ok(true)` after emitting ready, `Ok(false)` after emitting
    /// the death record (nothing left to serve).
    fn synchronize(&mut self) -> nix::Result<bool> {
        let mut lag = INITIAL_LAG;
        let mut retries = 0u32;
        loop {
            match self.step(lag)? {
                StepOutcome::Ready => {
                    self.emit(&protocol::ready_record())?;
                    return Ok(true);
                }
                StepOutcome::Died { signal, status } => {
                    self.emit(&protocol::died_record(signal, status))?;
                    return Ok(false);
                }
                StepOutcome::Busy => {
                    retries += 1;
                    if retries >= MAX_STEP_RETRIES {
                        self.emit(&protocol::ready_record())?;
                        return Ok(true);
                    }
                    lag = lag.mul_f64(LAG_MULTIPLIER).min(LAG_CAP);
                }
            }
        }
    }

    /// One synchronization cycle. Precondition: slave stopped, in the
    /// background, with our group owning the terminal.
    fn step(&mut self, lag: Duration) -> nix::Result<StepOutcome> {
        // Grant the terminal and let the slave run.
        let _ = tcsetpgrp(self.tty(), self.slave_pgid);
        self.signal_slave(Signal::SIGCONT)?;

        // Foreground slice: this is the time the slave has to consume input.
        thread::sleep(lag);

        // Freeze it; the wait tells us whether it is still alive at all.
        self.signal_slave(Signal::SIGSTOP)?;
        if let Some((signal, status)) = self.wait_for_stop()? {
            return Ok(StepOutcome::Died { signal, status });
        }

        // Take the terminal back and unfreeze. From here the slave runs in
        // the background, and its next terminal read stops it with SIGTTIN.
        tcsetpgrp(self.tty(), self.own_pgid)?;
        self.signal_slave(Signal::SIGCONT)?;

        self.kick_blocked_readers()?;

        // May block indefinitely: a slave that is computing or sleeping
        // only stops once it comes back to the terminal for more input.
        if let Some((signal, status)) = self.wait_for_stop()? {
            return Ok(StepOutcome::Died { signal, status });
        }

        if self.tty_has_pending_input()? {
            Ok(StepOutcome::Busy)
        } else {
            Ok(StepOutcome::Ready)
        }
    }

    /// Signal the slave's whole group, tolerating a group that just died.
    fn signal_slave(&self, sig: Signal) -> nix::Result<()> {
        match killpg(self.slave_pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn wait_for_stop(&self) -> nix::Result<Option<(u8, u8)>> {
        loop {
            match waitpid(self.slave_pgid, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Exited(_, status)) => return Ok(Some((0, status as u8))),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(Some((sig as i32 as u8, 0))),
                Ok(WaitStatus::Stopped(_, _)) => return Ok(None),
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Zero-timeout readability probe on the terminal: unread input means
    /// the slave stopped mid-consumption, not at a clean block.
    fn tty_has_pending_input(&self) -> nix::Result<bool> {
        let tty = self.tty();
        let mut fds = [PollFd::new(tty, PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let readable = fds[0]
                        .revents()
                        .is_some_and(|r| r.contains(PollFlags::POLLIN));
                    return Ok(readable);
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// BSD kernels leave a process that was already blocked in a terminal
    /// read when it lost the foreground sleeping in the read queue instead
    /// of stopping it. Any termios write wakes the queue so eligibility is
    /// re-checked; bump VMIN and put it straight back.
    #[cfg(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "macos"
    ))]
    fn kick_blocked_readers(&self) -> nix::Result<()> {
        use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices};

        let tty = self.tty();
        let orig = tcgetattr(tty)?;
        let mut bumped = orig.clone();
        let vmin = SpecialCharacterIndices::VMIN as usize;
        bumped.control_chars[vmin] = bumped.control_chars[vmin].saturating_add(1);
        tcsetattr(tty, SetArg::TCSANOW, &bumped)?;
        tcsetattr(tty, SetArg::TCSANOW, &orig)?;
        Ok(())
    }

    #[cfg(not(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "macos"
    )))]
    fn kick_blocked_readers(&self) -> nix::Result<()> {
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> nix::Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match write(&self.info_write, rest) {
                Ok(n) => rest = &rest[n..],
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stdin is the pty slave end; it doubles as the terminal handle for
    /// tcsetpgrp, termios, and the pending-input probe.
    fn tty(&self) -> BorrowedFd<'static> {
        // SAFETY: fd 0 was dup'd from the pty slave before the stub started
        // and stays open for the stub's lifetime.
        unsafe { BorrowedFd::borrow_raw(0) }
    }
}

/// Child half of the slave fork: isolate into a fresh process group, put
/// the job-control dispositions back, stop, and exec. Never returns.
fn exec_slave(argv: &[CString]) -> ! {
    let prepared = (|| -> nix::Result<()> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
        // SIGPIPE is in the list because the Rust runtime ignores it
        // process-wide and an ignored disposition survives exec.
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGTTIN,
            Signal::SIGTSTP,
            Signal::SIGCONT,
            Signal::SIGPIPE,
        ] {
            unsafe { signal(sig, SigHandler::SigDfl) }?;
        }
        // Start stopped so the first step finds a known state.
        raise(Signal::SIGSTOP)?;
        Ok(())
    })();

    if prepared.is_ok() {
        let _ = execvp(&argv[0], argv);
    }
    // Exec target missing or setup failed; 127 is the shell convention.
    process::exit(127)
}
