use super::*;
use crate::config_store::ConfigStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use termvisor_core::{HeartbeatState, ServerEvent, SupervisorError, SupervisorResult};

// ── Doubles ──────────────────────────────────────────────────────────

/// How a broken terminal fails writes and resizes.
#[derive(Clone, Copy, Debug)]
enum Fault {
    /// The worker side has gone away.
    Closed,
    /// Any other OS failure.
    Broken,
}

impl Fault {
    fn error(self) -> SupervisorError {
        match self {
            Fault::Closed => SupervisorError::ChannelClosed,
            Fault::Broken => SupervisorError::Other("ioctl failed".into()),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockTerminal {
    fault: Mutex<Option<Fault>>,
    output: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    size: Mutex<(u16, u16)>,
}

impl MockTerminal {
    fn push(&self, bytes: &[u8]) {
        self.output.lock().unwrap().push_back(bytes.to_vec());
        self.ready.notify_all();
    }

    fn break_with(&self, fault: Fault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

impl Terminal for MockTerminal {
    fn wait_readable(&self, timeout: Duration) -> SupervisorResult<bool> {
        let output = self.output.lock().unwrap();
        let (output, _) = self
            .ready
            .wait_timeout_while(output, timeout, |q| q.is_empty())
            .unwrap();
        Ok(!output.is_empty())
    }

    fn read(&self, buf: &mut [u8]) -> SupervisorResult<usize> {
        let mut output = self.output.lock().unwrap();
        let Some(mut chunk) = output.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            output.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> SupervisorResult<()> {
        if let Some(fault) = *self.fault.lock().unwrap() {
            return Err(fault.error());
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> SupervisorResult<bool> {
        if let Some(fault) = *self.fault.lock().unwrap() {
            return Err(fault.error());
        }
        let mut size = self.size.lock().unwrap();
        if *size == (rows, cols) {
            return Ok(false);
        }
        *size = (rows, cols);
        self.resizes.lock().unwrap().push((rows, cols));
        Ok(true)
    }

    fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }
}

/// Which signal, if any, makes the mock worker exit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitOn {
    Interrupt,
    Kill,
    Never,
}

pub(crate) struct MockChild {
    pid: u32,
    exit_on: ExitOn,
    status: Mutex<Option<i32>>,
    exited: Condvar,
    signals: Mutex<Vec<Signal>>,
}

impl MockChild {
    fn new(pid: u32, exit_on: ExitOn) -> Self {
        Self {
            pid,
            exit_on,
            status: Mutex::new(None),
            exited: Condvar::new(),
            signals: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.status.lock().unwrap().is_some()
    }

    fn exit(&self, code: i32) {
        let mut status = self.status.lock().unwrap();
        if status.is_none() {
            *status = Some(code);
        }
        self.exited.notify_all();
    }

    fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

impl ChildProcess for MockChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn wait(&self) -> SupervisorResult<i32> {
        let status = self.status.lock().unwrap();
        let status = self.exited.wait_while(status, |s| s.is_none()).unwrap();
        Ok(status.unwrap_or(-1))
    }

    fn signal(&self, signal: Signal) -> SupervisorResult<()> {
        self.signals.lock().unwrap().push(signal);
        match (signal, self.exit_on) {
            (Signal::Interrupt, ExitOn::Interrupt) => self.exit(130),
            (Signal::Kill, ExitOn::Interrupt | ExitOn::Kill) => self.exit(137),
            _ => {}
        }
        Ok(())
    }
}

pub(crate) struct MockLauncher {
    exit_on: Mutex<ExitOn>,
    fail: AtomicBool,
    specs: Mutex<Vec<LaunchSpec>>,
    spawned: Mutex<Vec<(Arc<MockTerminal>, Arc<MockChild>)>>,
}

impl MockLauncher {
    pub(crate) fn new(exit_on: ExitOn) -> Arc<Self> {
        Arc::new(Self {
            exit_on: Mutex::new(exit_on),
            fail: AtomicBool::new(false),
            specs: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn launches(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    fn last_spec(&self) -> LaunchSpec {
        self.specs.lock().unwrap().last().cloned().unwrap()
    }

    pub(crate) fn session(&self, index: usize) -> (Arc<MockTerminal>, Arc<MockChild>) {
        self.spawned.lock().unwrap()[index].clone()
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, spec: &LaunchSpec) -> SupervisorResult<Spawned> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SupervisorError::LaunchFailed("no such file".into()));
        }
        let mut specs = self.specs.lock().unwrap();
        specs.push(spec.clone());
        let terminal = Arc::new(MockTerminal::default());
        let child = Arc::new(MockChild::new(
            1000 + specs.len() as u32,
            *self.exit_on.lock().unwrap(),
        ));
        self.spawned
            .lock()
            .unwrap()
            .push((terminal.clone(), child.clone()));
        Ok(Spawned { terminal, child })
    }
}

/// Keeps a per-viewer inbox of everything each viewer would have received.
#[derive(Default)]
struct RecordingBroadcaster {
    attached: Mutex<Vec<ViewerId>>,
    inboxes: Mutex<HashMap<ViewerId, Vec<String>>>,
    broadcasts: Mutex<Vec<String>>,
}

impl RecordingBroadcaster {
    fn inbox(&self, viewer: ViewerId) -> String {
        self.inboxes
            .lock()
            .unwrap()
            .get(&viewer)
            .map(|v| v.concat())
            .unwrap_or_default()
    }

    fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }
}

fn output_text(event: ServerEvent) -> String {
    match event {
        ServerEvent::Output { data } => data,
        other => panic!("unexpected event {other:?}"),
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, event: ServerEvent) {
        let text = output_text(event);
        let attached = self.attached.lock().unwrap().clone();
        let mut inboxes = self.inboxes.lock().unwrap();
        for viewer in attached {
            inboxes.entry(viewer).or_default().push(text.clone());
        }
        self.broadcasts.lock().unwrap().push(text);
    }

    fn send_to(&self, viewer: ViewerId, event: ServerEvent) {
        let text = output_text(event);
        self.inboxes
            .lock()
            .unwrap()
            .entry(viewer)
            .or_default()
            .push(text);
    }

    fn attach(&self, viewer: ViewerId) {
        let mut attached = self.attached.lock().unwrap();
        if !attached.contains(&viewer) {
            attached.push(viewer);
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    controller: SessionController,
    launcher: Arc<MockLauncher>,
    viewers: Arc<RecordingBroadcaster>,
}

fn harness(exit_on: ExitOn) -> Harness {
    let launcher = MockLauncher::new(exit_on);
    let viewers = Arc::new(RecordingBroadcaster::default());
    let settings = LaunchSettings {
        command: "worker".into(),
        args: vec!["--basedir".into(), "/data".into()],
        instant_flag: "--instant".into(),
        config_env: "EK_CONFIG".into(),
        history_bytes: 64 * 1024,
    };
    let timing = Timing {
        poll_timeout: Duration::from_millis(20),
        reattach_settle: Duration::ZERO,
        kill_poll_interval: Duration::from_millis(10),
        kill_poll_attempts: 50,
    };
    let controller = SessionController::new(
        launcher.clone(),
        viewers.clone(),
        Arc::new(ConfigStore::new("YSA9IDEK")),
        settings,
        timing,
    );
    Harness {
        controller,
        launcher,
        viewers,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn eventually_idle(controller: &SessionController) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while controller.info().await.is_some() {
        assert!(Instant::now() < deadline, "session never went idle");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Start / reattach ─────────────────────────────────────────────────

#[tokio::test]
async fn fresh_start_launches_once_and_applies_size() {
    let h = harness(ExitOn::Interrupt);

    let outcome = h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert_eq!(outcome, StartOutcome::Launched { pid: Some(1001) });
    assert_eq!(h.launcher.launches(), 1);

    let (terminal, _) = h.launcher.session(0);
    assert_eq!(terminal.resizes(), vec![(24, 80)]);

    let info = h.controller.info().await.unwrap();
    assert!(info.alive);
    assert_eq!(info.pid, Some(1001));

    h.controller.kill().await;
}

#[tokio::test]
async fn repeated_start_never_runs_two_workers() {
    let h = harness(ExitOn::Interrupt);

    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    for viewer in 2..6 {
        let outcome = h.controller.start(Some(viewer), 24, 80, false).await.unwrap();
        assert_eq!(outcome, StartOutcome::Reattached);
    }
    assert_eq!(h.launcher.launches(), 1);

    h.controller.kill().await;
}

#[tokio::test]
async fn launch_args_carry_instant_flag_and_config_blob() {
    let h = harness(ExitOn::Interrupt);

    h.controller.start(Some(1), 24, 80, true).await.unwrap();
    let spec = h.launcher.last_spec();
    assert_eq!(spec.command, "worker");
    assert_eq!(spec.args, vec!["--basedir", "/data", "--instant"]);
    assert_eq!(spec.env, vec![("EK_CONFIG".to_string(), "YSA9IDEK".to_string())]);

    h.controller.kill().await;
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert_eq!(h.launcher.last_spec().args, vec!["--basedir", "/data"]);

    h.controller.kill().await;
}

#[tokio::test]
async fn reattach_replays_history_to_requester_only() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (terminal, _) = h.launcher.session(0);

    terminal.push(b"first ");
    terminal.push(b"second ");
    eventually("live output", || h.viewers.inbox(1) == "first second ").await;

    let outcome = h.controller.start(Some(2), 30, 100, false).await.unwrap();
    assert_eq!(outcome, StartOutcome::Reattached);
    assert_eq!(h.viewers.inbox(2), "first second ");
    // Viewer 1 did not get the replay.
    assert_eq!(h.viewers.inbox(1), "first second ");
    assert_eq!(terminal.resizes(), vec![(24, 80), (30, 100)]);

    terminal.push(b"third");
    eventually("output after reattach", || h.viewers.inbox(2).ends_with("third")).await;
    assert_eq!(h.viewers.inbox(1), "first second third");
    assert_eq!(h.viewers.inbox(2), "first second third");

    h.controller.kill().await;
}

#[tokio::test]
async fn split_multibyte_output_reaches_viewers_intact() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (terminal, _) = h.launcher.session(0);

    let bytes = "naïve ✓".as_bytes();
    terminal.push(&bytes[..3]);
    terminal.push(&bytes[3..]);
    eventually("decoded output", || h.viewers.inbox(1) == "naïve ✓").await;
    assert!(h.viewers.broadcasts().iter().all(|b| !b.contains('\u{FFFD}')));

    h.controller.kill().await;
}

#[tokio::test]
async fn launch_failure_leaves_supervisor_idle() {
    let h = harness(ExitOn::Interrupt);
    h.launcher.fail.store(true, Ordering::SeqCst);

    let err = h.controller.start(Some(1), 24, 80, false).await.unwrap_err();
    assert!(err.is_launch_failure());
    assert!(h.controller.info().await.is_none());

    h.launcher.fail.store(false, Ordering::SeqCst);
    let outcome = h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Launched { .. }));

    h.controller.kill().await;
}

#[tokio::test]
async fn ensure_running_reports_restarted_then_running() {
    let h = harness(ExitOn::Interrupt);

    let (state, pid) = h.controller.ensure_running(true).await.unwrap();
    assert_eq!(state, HeartbeatState::Restarted);
    assert_eq!(pid, Some(1001));
    assert!(h.launcher.last_spec().args.contains(&"--instant".to_string()));

    let (state, pid) = h.controller.ensure_running(false).await.unwrap();
    assert_eq!(state, HeartbeatState::Running);
    assert_eq!(pid, Some(1001));
    assert_eq!(h.launcher.launches(), 1);

    h.controller.kill().await;
}

// ── Input / resize ───────────────────────────────────────────────────

#[tokio::test]
async fn input_while_running_writes_exactly_once() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (terminal, _) = h.launcher.session(0);

    h.controller.input(b"ls\n").await;
    assert_eq!(terminal.writes(), vec![b"ls\n".to_vec()]);

    h.controller.kill().await;
}

#[tokio::test]
async fn input_and_resize_while_idle_are_noops() {
    let h = harness(ExitOn::Interrupt);
    h.controller.input(b"ls\n").await;
    h.controller.resize(40, 120).await;
    assert_eq!(h.launcher.launches(), 0);
    assert!(h.controller.info().await.is_none());
}

#[tokio::test]
async fn repeated_resize_is_idempotent() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (terminal, _) = h.launcher.session(0);

    h.controller.resize(40, 120).await;
    h.controller.resize(40, 120).await;
    assert_eq!(terminal.resizes(), vec![(24, 80), (40, 120)]);
    assert_eq!(terminal.size(), (40, 120));
    assert!(h.viewers.broadcasts().is_empty());

    h.controller.kill().await;
}

#[tokio::test]
async fn dead_terminal_input_and_resize_are_swallowed() {
    for fault in [Fault::Closed, Fault::Broken] {
        let h = harness(ExitOn::Interrupt);
        h.controller.start(Some(1), 24, 80, false).await.unwrap();
        let before = h.controller.info().await.unwrap();
        let (terminal, _) = h.launcher.session(0);
        terminal.break_with(fault);

        h.controller.input(b"ls\n").await;
        h.controller.resize(50, 132).await;

        assert!(terminal.writes().is_empty(), "{fault:?}");
        assert_eq!(terminal.resizes(), vec![(24, 80)], "{fault:?}");
        assert!(h.viewers.broadcasts().is_empty(), "{fault:?}");
        assert_eq!(h.controller.info().await, Some(before), "{fault:?}");

        h.controller.kill().await;
    }
}

// ── Kill ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn kill_without_session_is_noop() {
    let h = harness(ExitOn::Interrupt);
    assert_eq!(h.controller.kill().await, KillOutcome::NotRunning);
}

#[tokio::test]
async fn kill_interrupts_cooperative_worker() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (_, child) = h.launcher.session(0);

    assert_eq!(h.controller.kill().await, KillOutcome::Exited);
    assert_eq!(child.signals(), vec![Signal::Interrupt]);
    assert!(h.controller.info().await.is_none());
}

#[tokio::test]
async fn kill_forces_stubborn_worker() {
    let h = harness(ExitOn::Kill);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (_, child) = h.launcher.session(0);

    assert_eq!(h.controller.kill().await, KillOutcome::ForceKilled);
    assert_eq!(child.signals(), vec![Signal::Interrupt, Signal::Kill]);
}

#[tokio::test]
async fn start_after_kill_is_fresh_session() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let first = h.controller.info().await.unwrap();

    h.controller.kill().await;
    let outcome = h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert_eq!(outcome, StartOutcome::Launched { pid: Some(1002) });

    let second = h.controller.info().await.unwrap();
    assert!(second.generation > first.generation);
    assert_eq!(second.history_len, 0);
    assert_eq!(h.launcher.launches(), 2);

    h.controller.kill().await;
}

#[tokio::test]
async fn detached_session_is_replaced_before_teardown_finishes() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (_, first) = h.launcher.session(0);

    let teardown = h.controller.detach().await.unwrap();
    let outcome = h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert_eq!(outcome, StartOutcome::Launched { pid: Some(1002) });

    assert_eq!(teardown.finish().await, KillOutcome::Exited);
    assert!(first.has_exited());
    let current = h.controller.info().await.unwrap();
    assert!(current.alive);
    assert_eq!(current.pid, Some(1002));

    h.controller.kill().await;
}

// ── Exit detection ───────────────────────────────────────────────────

#[tokio::test]
async fn worker_exit_is_announced_once_and_goes_idle() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (_, child) = h.launcher.session(0);

    child.exit(1);
    eventually_idle(&h.controller).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let notices: Vec<_> = h
        .viewers
        .broadcasts()
        .into_iter()
        .filter(|b| b.contains("exited with code 1"))
        .collect();
    assert_eq!(notices, vec![exit_notice(1)]);

    // An exited session is never reattached.
    let outcome = h.controller.start(Some(1), 24, 80, false).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Launched { .. }));
    h.controller.kill().await;
}

#[tokio::test]
async fn final_output_precedes_exit_notice() {
    let h = harness(ExitOn::Interrupt);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (terminal, child) = h.launcher.session(0);

    terminal.push(b"bye\r\n");
    child.exit(0);
    eventually_idle(&h.controller).await;

    assert_eq!(h.viewers.inbox(1), format!("bye\r\n{}", exit_notice(0)));
}

#[tokio::test]
async fn stale_exit_never_reaches_replacement_session() {
    let h = harness(ExitOn::Never);
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let (_, first) = h.launcher.session(0);

    // The first worker ignores both signals, so it is still running when
    // its replacement starts.
    assert_eq!(h.controller.kill().await, KillOutcome::ForceKilled);
    *h.launcher.exit_on.lock().unwrap() = ExitOn::Interrupt;
    h.controller.start(Some(1), 24, 80, false).await.unwrap();
    let replacement = h.controller.info().await.unwrap();

    first.exit(9);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.viewers.broadcasts().iter().all(|b| !b.contains("code 9")));
    let current = h.controller.info().await.unwrap();
    assert_eq!(current.generation, replacement.generation);
    assert!(current.alive);

    h.controller.kill().await;
}
