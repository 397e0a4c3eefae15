#[cfg(unix)]
mod session_integration {
    use std::time::Duration;

    use lockstep_core::{KillOutcome, Session, Signal, SlaveStatus};

    const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

    fn spawn_script(script: &str) -> Session {
        let mut session = Session::new();
        session.spawn(&["/bin/sh", "-c", script]).expect("spawn");
        session
    }

    fn recv(session: &mut Session) -> Vec<u8> {
        session
            .recv(RECV_TIMEOUT)
            .expect("recv")
            .expect("recv timed out")
    }

    #[test]
    fn round_trips_a_line() {
        let mut session = spawn_script(r#"echo 2; read line; echo "got $line"; read _"#);

        assert_eq!(recv(&mut session), b"2\n");

        session.write(b"3\n");
        assert_eq!(recv(&mut session), b"got 3\n");

        session.close().expect("close");
        assert!(!session.is_active());
    }

    #[test]
    fn queued_writes_arrive_in_order() {
        let mut session = spawn_script(r#"read a; read b; echo "$a$b"; read _"#);

        session.write(b"x\n");
        session.write(b"y\n");
        assert_eq!(recv(&mut session), b"xy\n");

        session.close().expect("close");
    }

    #[test]
    fn slow_output_is_not_cut_short() {
        // The pause between the two bursts must not end the turn early: the
        // slave only counts as done once it comes back to read the terminal.
        let mut session = spawn_script("printf 4; sleep 1; printf 5; read _");

        assert_eq!(recv(&mut session), b"45");

        session.close().expect("close");
    }

    #[test]
    fn partially_consumed_input_is_retried_until_drained() {
        // Both lines are queued before the turn starts, but the slave naps
        // between its reads. When it comes back for the second line it is
        // stopped with input still unread; the turn must not end there, only
        // once the second line is consumed too and the slave blocks clean.
        let mut session =
            spawn_script(r#"read a; sleep 1; read b; echo "done $a$b"; read _"#);

        session.write(b"first\n");
        session.write(b"second\n");
        assert_eq!(recv(&mut session), b"done firstsecond\n");

        session.close().expect("close");
    }

    #[test]
    fn slave_stopping_without_reading_cannot_hang_recv() {
        // A slave that keeps stopping itself while input sits unread never
        // produces a clean input block. Every cycle ends stopped-with-
        // pending-input, so the turn has to finish through the bounded
        // retry fallback rather than block forever.
        let mut session =
            spawn_script(r#"echo up; while true; do kill -s STOP $$; done"#);

        assert_eq!(recv(&mut session), b"up\n");

        session.write(b"pinned\n");
        let out = session
            .recv(Some(Duration::from_secs(30)))
            .expect("recv")
            .expect("bounded retries should end the turn");
        assert_eq!(out, b"");
        assert!(session.is_active());

        session.close().expect("close");
        assert!(!session.is_active());
    }

    #[test]
    fn empty_turn_returns_empty_output() {
        let mut session = spawn_script("echo hello; read _; read _");

        assert_eq!(recv(&mut session), b"hello\n");
        assert_eq!(recv(&mut session), b"");

        session.close().expect("close");
    }

    #[test]
    fn death_during_recv_reports_status() {
        let mut session = spawn_script("printf 8; exit 0");

        assert!(session.is_active());
        assert_eq!(recv(&mut session), b"8");
        assert!(!session.is_active());
        assert_eq!(session.exit_status(), Some(SlaveStatus::Exited(0)));

        // The session is gone; further reads are a benign None.
        assert_eq!(session.recv(RECV_TIMEOUT).expect("recv"), None);
    }

    #[test]
    fn nonzero_exit_code_is_preserved() {
        let mut session = spawn_script("exit 3");

        assert_eq!(recv(&mut session), b"");
        assert_eq!(session.exit_status(), Some(SlaveStatus::Exited(3)));
    }

    #[test]
    fn missing_command_reports_exit_127() {
        let mut session = Session::new();
        session
            .spawn(&["/nonexistent/lockstep-no-such-command"])
            .expect("spawn itself succeeds; exec fails in the slave");

        assert_eq!(recv(&mut session), b"");
        assert!(!session.is_active());
        assert_eq!(session.exit_status(), Some(SlaveStatus::Exited(127)));
    }

    #[test]
    fn timeout_preserves_the_turn() {
        let mut session = spawn_script("sleep 1; printf done; read _");

        let first = session
            .recv(Some(Duration::from_millis(100)))
            .expect("recv");
        assert_eq!(first, None);
        assert!(session.is_active());

        // The interrupted turn resumes and completes.
        assert_eq!(recv(&mut session), b"done");

        session.close().expect("close");
    }

    #[test]
    fn kill_default_policy_ends_a_blocked_slave() {
        let mut session = spawn_script("read _");

        let outcome = session.kill(None).expect("kill");
        assert_eq!(outcome, KillOutcome::Exited);
        assert!(!session.is_active());
        assert_eq!(
            session.exit_status(),
            Some(SlaveStatus::Signaled(Signal::SIGTERM as i32))
        );
    }

    #[test]
    fn session_is_reusable_after_kill() {
        let mut session = spawn_script("read _");
        session.kill(None).expect("kill");
        assert!(!session.is_active());

        session
            .spawn(&["/bin/sh", "-c", "echo again; read _"])
            .expect("respawn");
        assert_eq!(recv(&mut session), b"again\n");

        session.close().expect("close");
    }

    #[test]
    fn recv_returns_only_after_input_is_consumed() {
        // The slave records what it read before blocking again; by the time
        // recv comes back, the receipt must already be on disk.
        let dir = tempfile::TempDir::new().expect("temp dir");
        let receipt = dir.path().join("receipt");
        let script = format!(
            r#"read line; printf %s "$line" > "{}"; read _"#,
            receipt.display()
        );
        let mut session = spawn_script(&script);

        session.write(b"42\n");
        assert_eq!(recv(&mut session), b"");
        assert_eq!(std::fs::read(&receipt).expect("receipt"), b"42");

        session.close().expect("close");
    }

    #[test]
    fn slave_leads_its_own_process_group() {
        use nix::unistd::{getpgid, Pid};

        let mut session = spawn_script("read _");
        let pid = session.slave_pid().expect("slave pid");
        assert!(pid > 0);
        let pgid = getpgid(Some(Pid::from_raw(pid))).expect("getpgid");
        assert_eq!(pgid.as_raw(), pid);

        session.close().expect("close");
        assert_eq!(session.slave_pid(), None);
    }
}
