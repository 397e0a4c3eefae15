//! The driver side: session lifecycle, buffering, and the recv event loop.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, read, write, ForkResult, Pid};
use tracing::{debug, warn};

use lockstep_pty::{
    cloexec_pipe, make_controlling_terminal, open_pty, set_cloexec, set_nonblocking, set_raw,
    PtyPair,
};

use crate::protocol::{self, InfoDecoder, InfoEvent};
use crate::stub;
use crate::{Error, Result};

/// Escalation used by [`Session::kill`] when no policy is given: ask nicely,
/// wait, then insist.
pub const DEFAULT_KILL_POLICY: &[(Signal, Duration)] = &[
    (Signal::SIGTERM, Duration::from_secs(3)),
    (Signal::SIGKILL, Duration::from_secs(3)),
];

/// How long to keep draining pty output after the stub hangs up without a
/// death report. BSD ptys hold the final output until it is read.
const STUB_EOF_GRACE: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 4096;

/// How the slave ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStatus {
    Exited(i32),
    Signaled(i32),
}

/// Result of a [`Session::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The slave exited during one of the waits (or was already gone).
    Exited,
    /// Every signal was delivered but the slave outlived the policy.
    Alive,
}

/// A half-duplex session around one slave process.
///
/// The session owns the pty master, the control and info pipe ends, and the
/// two byte buffers. It is strictly synchronous: all I/O happens inside
/// [`spawn`](Session::spawn), [`recv`](Session::recv),
/// [`kill`](Session::kill), and [`close`](Session::close), on the calling
/// thread. After the slave dies the same session can be respawned.
#[derive(Debug, Default)]
pub struct Session {
    pty_master: Option<OwnedFd>,
    ctl_write: Option<OwnedFd>,
    info_read: Option<OwnedFd>,
    stub_pid: Option<Pid>,
    slave_pgid: Option<Pid>,
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
    decoder: InfoDecoder,
    sent_sync: bool,
    active: bool,
    pty_eof: bool,
    exit_status: Option<SlaveStatus>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork the stub (which in turn forks `argv` as the slave) and complete
    /// the pid handshake.
    ///
    /// Fails if the session is already active, on any pty/pipe/fork error,
    /// and with [`Error::Handshake`] if the stub dies before reporting the
    /// slave pid.
    pub fn spawn<S: AsRef<str>>(&mut self, argv: &[S]) -> Result<()> {
        if self.active {
            return Err(Error::AlreadyActive);
        }
        if argv.is_empty() {
            return Err(Error::EmptyCommand);
        }
        // Built before fork: the child must not allocate.
        let argv: Vec<CString> = argv
            .iter()
            .map(|arg| CString::new(arg.as_ref()).map_err(|_| Error::InvalidCommand))
            .collect::<std::result::Result<_, _>>()?;

        self.release();

        let pty = open_pty()?;
        set_raw(&pty.master)?;
        let PtyPair { master, slave } = pty;
        let (ctl_read, ctl_write) = cloexec_pipe()?;
        let (info_read, info_write) = cloexec_pipe()?;

        // SAFETY: the child never returns into caller code; it becomes the
        // stub and exits on its own.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Child => {
                drop(ctl_write);
                drop(info_read);
                become_stub(argv, master, slave, ctl_read, info_write)
            }
            ForkResult::Parent { child } => {
                drop(ctl_read);
                drop(info_write);
                drop(slave);

                self.pty_master = Some(master);
                self.ctl_write = Some(ctl_write);
                self.info_read = Some(info_read);
                self.stub_pid = Some(child);

                match self.handshake() {
                    Ok(slave_pid) => {
                        self.slave_pgid = Some(slave_pid);
                        self.active = true;
                        self.exit_status = None;
                        debug!(stub = %child, slave = %slave_pid, "session spawned");
                        Ok(())
                    }
                    Err(e) => {
                        self.release();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Queue bytes for the slave's stdin. Performs no I/O; the buffer is
    /// drained inside [`recv`](Session::recv). Discarded with a warning on
    /// an inactive session.
    pub fn write(&mut self, bytes: &[u8]) {
        if !self.active {
            warn!(len = bytes.len(), "write on inactive session discarded");
            return;
        }
        self.write_buffer.extend_from_slice(bytes);
    }

    /// Deliver everything queued by [`write`](Session::write), wait until
    /// the slave has consumed it and gone back to waiting for input, and
    /// return all output produced in between.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first; buffers and the
    /// outstanding sync survive, so a later `recv` resumes where this one
    /// left off. Returns `Ok(None)` (with a warning) on an inactive
    /// session. When the slave dies mid-call the output it produced first
    /// is still returned, and [`exit_status`](Session::exit_status) is
    /// populated.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if !self.active {
            warn!("recv on inactive session");
            return Ok(None);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.pump()?;
            if self.active && !self.sent_sync {
                self.send_step()?;
            }
            while self.active && self.sent_sync {
                if !self.wait_for_event(deadline)? {
                    debug!("recv deadline reached; state preserved");
                    return Ok(None);
                }
            }
            if !self.active || self.write_buffer.is_empty() {
                break;
            }
        }

        self.drain_pty()?;
        Ok(Some(std::mem::take(&mut self.read_buffer)))
    }

    /// Signal the slave's process group and wait for it to die, one
    /// `(signal, grace)` pair at a time; `None` applies
    /// [`DEFAULT_KILL_POLICY`]. During each non-zero grace period the
    /// session keeps cycling [`recv`](Session::recv) (output discarded) so
    /// a stopped slave is continued and its death observed.
    ///
    /// Errors only when signal delivery itself fails.
    pub fn kill(&mut self, policy: Option<&[(Signal, Duration)]>) -> Result<KillOutcome> {
        if !self.active {
            return Ok(KillOutcome::Exited);
        }
        let policy = policy.unwrap_or(DEFAULT_KILL_POLICY);
        for (sig, grace) in policy {
            let Some(pgid) = self.slave_pgid else { break };
            debug!(%pgid, signal = %sig, "signalling slave group");
            killpg(pgid, *sig).map_err(Error::Kill)?;

            if grace.is_zero() {
                continue;
            }
            let deadline = Instant::now() + *grace;
            while self.active {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let _ = self.recv(Some(remaining))?;
            }
            if !self.active {
                return Ok(KillOutcome::Exited);
            }
        }
        Ok(if self.active {
            KillOutcome::Alive
        } else {
            KillOutcome::Exited
        })
    }

    /// Kill with the default policy and release the pty and pipes. The
    /// session can be respawned afterwards; until then write/recv are
    /// inactive-session no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.active {
            if let Err(error) = self.kill(None) {
                warn!(%error, "kill during close failed");
            }
        }
        self.release();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// How the last slave ended, once a death has been observed.
    pub fn exit_status(&self) -> Option<SlaveStatus> {
        self.exit_status
    }

    /// Pid of the running slave (also its process-group id).
    pub fn slave_pid(&self) -> Option<i32> {
        self.slave_pgid.map(Pid::as_raw)
    }

    /// Read the slave pid the stub reports right after spawn and make the
    /// master non-blocking for the recv loops.
    fn handshake(&mut self) -> Result<Pid> {
        let mut pid_bytes = [0u8; protocol::PID_HANDSHAKE_LEN];
        let info = self.info_read.as_ref().ok_or(Error::Handshake)?;
        read_handshake(info, &mut pid_bytes)?;
        let master = self.pty_master.as_ref().ok_or(Error::Handshake)?;
        set_nonblocking(master)?;
        set_cloexec(master)?;
        Ok(Pid::from_raw(protocol::decode_pid(pid_bytes)))
    }

    /// Send phase: drain the write buffer without ever blocking, reading
    /// pty output and info events as they arrive so the kernel buffers
    /// cannot fill and wedge the slave.
    fn pump(&mut self) -> Result<()> {
        while self.active && !self.write_buffer.is_empty() {
            let (readable, writable, info) = self.poll_session(true, PollTimeout::ZERO)?;
            if !readable && !writable && !info {
                break;
            }
            if readable {
                self.drain_pty()?;
            }
            if info {
                self.service_info()?;
            }
            if writable && self.active {
                self.flush_write_buffer()?;
            }
        }
        Ok(())
    }

    /// Wait phase: block (bounded by the deadline) for pty output or an
    /// info event and service whatever arrives. Returns `false` once the
    /// deadline has passed.
    fn wait_for_event(&mut self, deadline: Option<Instant>) -> Result<bool> {
        let timeout = match deadline {
            None => PollTimeout::NONE,
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                clamp_timeout(remaining)
            }
        };
        let (readable, _, info) = self.poll_session(false, timeout)?;
        if readable {
            self.drain_pty()?;
        }
        if info {
            self.service_info()?;
        }
        Ok(true)
    }

    /// Poll readiness over the pty master and the info pipe. The pty's read
    /// side drops out once it has hit EOF so a hung-up master cannot spin
    /// the loop.
    fn poll_session(
        &self,
        want_pty_write: bool,
        timeout: PollTimeout,
    ) -> Result<(bool, bool, bool)> {
        let (Some(master), Some(info)) = (self.pty_master.as_ref(), self.info_read.as_ref())
        else {
            return Ok((false, false, false));
        };

        let mut pty_flags = PollFlags::empty();
        if !self.pty_eof {
            pty_flags |= PollFlags::POLLIN;
        }
        if want_pty_write {
            pty_flags |= PollFlags::POLLOUT;
        }

        let mut fds = Vec::with_capacity(2);
        let pty_slot = if pty_flags.is_empty() {
            None
        } else {
            fds.push(PollFd::new(master.as_fd(), pty_flags));
            Some(0)
        };
        let info_slot = fds.len();
        fds.push(PollFd::new(info.as_fd(), PollFlags::POLLIN));

        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok((false, false, false)),
                Ok(_) => {
                    let revents = |slot: usize, flags: PollFlags| {
                        fds[slot].revents().is_some_and(|r| r.intersects(flags))
                    };
                    let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
                    let readable = pty_slot
                        .is_some_and(|slot| revents(slot, PollFlags::POLLIN | hangup));
                    let writable =
                        pty_slot.is_some_and(|slot| revents(slot, PollFlags::POLLOUT));
                    let info_ready =
                        revents(info_slot, PollFlags::POLLIN | PollFlags::POLLHUP);
                    return Ok((readable, writable, info_ready));
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Read the pty master dry. On Linux a read racing the session leader's
    /// exit fails with EIO; both that and a clean zero read mean EOF here.
    fn drain_pty(&mut self) -> Result<()> {
        let Some(master) = self.pty_master.as_ref() else {
            return Ok(());
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match read(master.as_raw_fd(), &mut chunk) {
                Ok(0) => {
                    self.pty_eof = true;
                    return Ok(());
                }
                Ok(n) => self.read_buffer.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(Errno::EIO) => {
                    self.pty_eof = true;
                    return Ok(());
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        let Some(master) = self.pty_master.as_ref() else {
            return Ok(());
        };
        match write(master, &self.write_buffer) {
            Ok(n) => {
                self.write_buffer.drain(..n);
            }
            Err(Errno::EAGAIN | Errno::EINTR) => {}
            Err(Errno::EIO) => self.pty_eof = true,
            Err(e) => return Err(Error::Io(e)),
        }
        Ok(())
    }

    /// Ask the stub for one synchronization cycle. At most one request is
    /// ever outstanding; `sent_sync` stays true until the answering event
    /// arrives.
    fn send_step(&mut self) -> Result<()> {
        let outcome = loop {
            let Some(ctl) = self.ctl_write.as_ref() else {
                return Ok(());
            };
            match write(ctl, &[protocol::STEP_REQUEST]) {
                Ok(_) => break Ok(true),
                Err(Errno::EINTR) => {}
                Err(Errno::EPIPE) => break Ok(false),
                Err(e) => break Err(e),
            }
        };
        match outcome {
            Ok(true) => {
                self.sent_sync = true;
                Ok(())
            }
            Ok(false) => self.handle_stub_eof(),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn service_info(&mut self) -> Result<()> {
        let mut chunk = [0u8; 8];
        let n = loop {
            let Some(info) = self.info_read.as_ref() else {
                return Ok(());
            };
            match read(info.as_raw_fd(), &mut chunk) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        };
        if n == 0 {
            return self.handle_stub_eof();
        }

        let mut events = Vec::new();
        if let Err(tag) = self.decoder.feed(&chunk[..n], &mut events) {
            warn!(tag, "unparseable info event; poisoning session");
            self.poison();
            return Err(Error::Protocol(tag));
        }
        for event in events {
            self.apply_info_event(event);
        }
        Ok(())
    }

    fn apply_info_event(&mut self, event: InfoEvent) {
        match event {
            InfoEvent::Ready => {
                debug!("slave back at input block");
                self.sent_sync = false;
            }
            InfoEvent::Died { signal, status } => {
                let status = status_from_wire(signal, status);
                debug!(?status, "slave died");
                self.exit_status = Some(status);
                self.deactivate();
                let _ = self.wait_stub();
            }
        }
    }

    /// Info pipe EOF without a death record: the stub crashed. Drain what
    /// the pty still holds, reap the stub, and let its own termination
    /// status stand in for the slave's.
    fn handle_stub_eof(&mut self) -> Result<()> {
        warn!("stub hung up without a death report");
        self.drain_pty_grace()?;
        let stub_status = self.wait_stub();
        if self.exit_status.is_none() {
            self.exit_status = match stub_status {
                Some(WaitStatus::Exited(_, code)) => Some(SlaveStatus::Exited(code)),
                Some(WaitStatus::Signaled(_, sig, _)) => Some(SlaveStatus::Signaled(sig as i32)),
                _ => None,
            };
        }
        self.deactivate();
        Ok(())
    }

    /// Keep reading the master until EOF or a quiet grace period. BSD ptys
    /// hold final output hostage until somebody reads it.
    fn drain_pty_grace(&mut self) -> Result<()> {
        let deadline = Instant::now() + STUB_EOF_GRACE;
        loop {
            self.drain_pty()?;
            if self.pty_eof {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let Some(master) = self.pty_master.as_ref() else {
                return Ok(());
            };
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, clamp_timeout(remaining)) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Blocking reap of the stub, returning its wait status. The stub exits
    /// immediately after its last info byte, so this never waits long.
    fn wait_stub(&mut self) -> Option<WaitStatus> {
        let pid = self.stub_pid.take()?;
        loop {
            match waitpid(pid, None) {
                Ok(status) => return Some(status),
                Err(Errno::EINTR) => {}
                Err(_) => return None,
            }
        }
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.sent_sync = false;
        self.slave_pgid = None;
        self.ctl_write = None;
    }

    /// Protocol corruption: nothing about the stub can be trusted any more.
    /// Kill the slave group outright, hang up on the stub, and reap it.
    fn poison(&mut self) {
        if let Some(pgid) = self.slave_pgid.take() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        self.deactivate();
        let _ = self.wait_stub();
    }

    /// Drop every per-spawn resource. Safe on any state; used by spawn (to
    /// clear a previous life), close, and drop.
    fn release(&mut self) {
        self.ctl_write = None;
        self.info_read = None;
        self.pty_master = None;
        self.reap_stub_bounded();
        self.slave_pgid = None;
        self.write_buffer.clear();
        self.read_buffer.clear();
        self.decoder = InfoDecoder::new();
        self.sent_sync = false;
        self.active = false;
        self.pty_eof = false;
    }

    /// Non-blocking reap with a short patience window: the stub exits as
    /// soon as it sees the control pipe hang up, but it may still be inside
    /// a step.
    fn reap_stub_bounded(&mut self) {
        let Some(pid) = self.stub_pid.take() else {
            return;
        };
        for _ in 0..200 {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(5)),
                _ => return,
            }
        }
        warn!(%pid, "stub did not exit after hangup; abandoning");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.active {
            if let Some(pgid) = self.slave_pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
        self.release();
    }
}

fn status_from_wire(signal: u8, status: u8) -> SlaveStatus {
    if signal != 0 {
        SlaveStatus::Signaled(signal as i32)
    } else {
        SlaveStatus::Exited(status as i32)
    }
}

/// Blocking read of the whole pid handshake; EOF first is a handshake
/// failure (the stub died during setup).
fn read_handshake(info: &OwnedFd, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(info.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => return Err(Error::Handshake),
            Ok(n) => filled += n,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn clamp_timeout(remaining: Duration) -> PollTimeout {
    let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis.max(1))
}

/// Child half of the session fork. Wires the pty slave up as controlling
/// terminal and stdio, then hands over to the stub engine. Never returns.
fn become_stub(
    argv: Vec<CString>,
    master: OwnedFd,
    slave: OwnedFd,
    ctl_read: OwnedFd,
    info_write: OwnedFd,
) -> ! {
    if make_controlling_terminal(&slave).is_err() {
        process::exit(1);
    }
    // SAFETY: async-signal-safe calls on fds owned by this child.
    let wired = unsafe {
        nix::libc::dup2(slave.as_raw_fd(), 0) >= 0
            && nix::libc::dup2(slave.as_raw_fd(), 1) >= 0
            && nix::libc::dup2(slave.as_raw_fd(), 2) >= 0
    };
    if !wired {
        process::exit(1);
    }
    drop(slave);
    drop(master);
    stub::run(argv, ctl_read, info_write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_distinguishes_exit_from_signal() {
        assert_eq!(status_from_wire(0, 0), SlaveStatus::Exited(0));
        assert_eq!(status_from_wire(0, 2), SlaveStatus::Exited(2));
        assert_eq!(status_from_wire(15, 0), SlaveStatus::Signaled(15));
        assert_eq!(status_from_wire(9, 0), SlaveStatus::Signaled(9));
    }

    #[test]
    fn fresh_session_is_inactive_and_benign() {
        let mut session = Session::new();
        assert!(!session.is_active());
        assert!(session.exit_status().is_none());
        session.write(b"discarded");
        assert_eq!(session.recv(None).expect("recv"), None);
        assert_eq!(session.kill(None).expect("kill"), KillOutcome::Exited);
    }

    #[test]
    fn spawn_rejects_empty_and_nul_commands() {
        let mut session = Session::new();
        assert!(matches!(
            session.spawn::<&str>(&[]),
            Err(Error::EmptyCommand)
        ));
        assert!(matches!(
            session.spawn(&["ec\0ho"]),
            Err(Error::InvalidCommand)
        ));
    }

    #[test]
    fn timeout_clamp_never_produces_zero() {
        assert_eq!(clamp_timeout(Duration::from_micros(10)), PollTimeout::from(1u16));
        assert_eq!(clamp_timeout(Duration::from_millis(250)), PollTimeout::from(250u16));
        assert_eq!(clamp_timeout(Duration::from_secs(120)), PollTimeout::from(u16::MAX));
    }
}
