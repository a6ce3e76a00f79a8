//! Decoder process supervision.
//!
//! The supervisor runs on the controller thread and owns:
//! - the single live decoder process (if any)
//! - the frame reassembler fed by that process's stdout
//! - the subscriber list
//!
//! Lifecycle:
//! - `Idle`: no process. `start` spawns one.
//! - `Running`: one process. A clean exit (status 0) moves to `Restarting`;
//!   any other exit, a kill, or fatal stderr output moves to `Idle`.
//! - `Restarting`: no process, a spawn is due at a deadline. `start` spawns
//!   immediately, `stop` cancels.
//!
//! An exit is acted on only after both pipes reach EOF (or a grace period
//! passes), so trailing frames and stderr output are seen first. Under
//! `StderrPolicy::Fatal` the process is stopped at the first stderr chunk,
//! and the rest of its stderr is collected until the pipe closes and
//! reported as one `error` event.

use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use super::reader::{spawn_reader, Output, OutputEvent, Pipe};
use crate::config::{StderrPolicy, StreamConfig};
use crate::controller::{StreamEvent, StreamStats};
use crate::error::{Result, StreamError};
use crate::frame::FrameReassembler;

/// How often the controller thread checks for process exit and restart
/// deadlines while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long an exited (or killed) process may keep its pipes open before
/// the exit is handled anyway (e.g. a grandchild inherited the pipe).
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on stderr bytes kept for a single fatal report.
const STDERR_REPORT_LIMIT: usize = 16 * 1024;

pub(crate) enum Message {
    Command(Command),
    Output(Output),
}

pub(crate) enum Command {
    Start(Sender<Result<()>>),
    Stop(Sender<Result<()>>),
    Restart(Sender<Result<()>>),
    Subscribe(Subscriber),
    Stats(Sender<StreamStats>),
    Shutdown,
}

pub(crate) enum Subscriber {
    /// Unbounded: every event is queued until the receiver takes it.
    Channel(Sender<StreamEvent>),
    /// Bounded: events that do not fit are dropped for this subscriber.
    Bounded(SyncSender<StreamEvent>),
    Callback(Box<dyn FnMut(&StreamEvent) + Send>),
}

enum Delivery {
    Delivered,
    Dropped,
    Gone,
}

impl Subscriber {
    fn deliver(&mut self, event: &StreamEvent) -> Delivery {
        match self {
            Subscriber::Channel(tx) => match tx.send(event.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Gone,
            },
            Subscriber::Bounded(tx) => match tx.try_send(event.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Disconnected(_)) => Delivery::Gone,
            },
            Subscriber::Callback(callback) => {
                callback(event);
                Delivery::Delivered
            }
        }
    }
}

/// Decoder arguments: quiet logging, the input, frame rate, quality and size,
/// passthrough arguments, then a single continuously updated JPEG on stdout.
pub fn build_args(config: &StreamConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-loglevel".into(),
        "quiet".into(),
        "-i".into(),
        config.input().to_string(),
        "-r".into(),
        config.rate().to_string(),
    ];
    if config.quality() > 0 {
        args.push("-q:v".into());
        args.push(config.quality().to_string());
    }
    if let Some(resolution) = config.resolution() {
        args.push("-s".into());
        args.push(resolution.to_string());
    }
    args.extend(config.arguments().iter().cloned());
    args.extend(
        ["-f", "image2", "-update", "1", "-"]
            .into_iter()
            .map(String::from),
    );
    args
}

enum Phase {
    Idle,
    Running(RunningProcess),
    Restarting { due: Instant },
}

struct RunningProcess {
    child: Child,
    generation: u64,
    stdout_open: bool,
    stderr_open: bool,
    exited: Option<(ExitStatus, Instant)>,
}

impl RunningProcess {
    fn pipes_closed(&self) -> bool {
        !self.stdout_open && !self.stderr_open
    }
}

/// Stderr of a process stopped under `StderrPolicy::Fatal`, still being
/// collected.
struct StderrReport {
    generation: u64,
    output: Vec<u8>,
    since: Instant,
}

impl StderrReport {
    fn append(&mut self, chunk: &[u8]) {
        let room = STDERR_REPORT_LIMIT.saturating_sub(self.output.len());
        self.output.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

pub(crate) struct Supervisor {
    config: StreamConfig,
    tx: Sender<Message>,
    phase: Phase,
    generation: u64,
    reassembler: FrameReassembler,
    subscribers: Vec<Subscriber>,
    stderr_report: Option<StderrReport>,
    stats: StreamStats,
}

impl Supervisor {
    pub(crate) fn new(config: StreamConfig, tx: Sender<Message>) -> Self {
        let reassembler = FrameReassembler::new(config.boundary());
        Self {
            config,
            tx,
            phase: Phase::Idle,
            generation: 0,
            reassembler,
            subscribers: Vec::new(),
            stderr_report: None,
            stats: StreamStats::default(),
        }
    }

    /// Controller thread body. Returns on `Command::Shutdown`.
    pub(crate) fn run(mut self, rx: Receiver<Message>) {
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Message::Command(Command::Shutdown)) => break,
                Ok(Message::Command(command)) => self.handle_command(command),
                Ok(Message::Output(output)) => self.handle_output(output),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll();
        }
        if let Phase::Running(process) = std::mem::replace(&mut self.phase, Phase::Idle) {
            kill_and_reap(process);
        }
        log::debug!("frame relay controller for {} exited", self.config.input());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(Ok(()));
            }
            Command::Restart(reply) => {
                let _ = reply.send(self.restart());
            }
            Command::Subscribe(subscriber) => self.subscribers.push(subscriber),
            Command::Stats(reply) => {
                let mut stats = self.stats.clone();
                stats.running = matches!(self.phase, Phase::Running(_));
                let _ = reply.send(stats);
            }
            Command::Shutdown => {}
        }
    }

    fn start(&mut self) -> Result<()> {
        if matches!(self.phase, Phase::Running(_)) {
            log::debug!("decoder already running; start ignored");
            return Ok(());
        }
        self.finish_stderr_report();
        let process = match self.spawn() {
            Ok(process) => process,
            Err(err) => {
                // A failed spawn is never retried, even if a restart was due.
                self.phase = Phase::Idle;
                return Err(err);
            }
        };
        log::info!(
            "decoder started: {} (generation {})",
            self.config.input(),
            process.generation
        );
        self.phase = Phase::Running(process);
        self.reassembler.reset();
        self.stats.spawns += 1;
        self.emit(StreamEvent::Start);
        Ok(())
    }

    fn stop(&mut self) {
        self.finish_stderr_report();
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running(process) => {
                log::info!("stopping decoder (generation {})", process.generation);
                kill_and_reap(process);
            }
            Phase::Restarting { .. } => log::info!("pending decoder restart cancelled"),
            Phase::Idle => {}
        }
        self.reassembler.reset();
        self.emit(StreamEvent::Stop);
    }

    fn restart(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Running(_)) {
            return Ok(());
        }
        self.stop();
        self.start()
    }

    fn spawn(&mut self) -> Result<RunningProcess> {
        let cmd = self.config.cmd().to_string();
        let args = build_args(&self.config);
        log::debug!("spawning {} {}", cmd, args.join(" "));
        let mut child = ProcessCommand::new(&cmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => {
                    StreamError::ExecutableNotFound { cmd: cmd.clone() }
                }
                _ => StreamError::Spawn {
                    cmd: cmd.clone(),
                    source,
                },
            })?;

        self.generation += 1;
        let generation = self.generation;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let attached = stdout
            .map(|pipe| spawn_reader(pipe, Pipe::Stdout, generation, self.tx.clone()))
            .transpose()
            .and_then(|_| {
                stderr
                    .map(|pipe| spawn_reader(pipe, Pipe::Stderr, generation, self.tx.clone()))
                    .transpose()
            });
        let mut process = RunningProcess {
            child,
            generation,
            stdout_open: true,
            stderr_open: true,
            exited: None,
        };
        if let Err(err) = attached {
            let _ = process.child.kill();
            let _ = process.child.wait();
            return Err(err.into());
        }
        Ok(process)
    }

    fn handle_output(&mut self, output: Output) {
        let reporting = self
            .stderr_report
            .as_ref()
            .is_some_and(|report| report.generation == output.generation);
        if reporting {
            match (output.pipe, output.event) {
                (Pipe::Stderr, OutputEvent::Chunk(chunk)) => {
                    if let Some(report) = &mut self.stderr_report {
                        report.append(&chunk);
                    }
                }
                (Pipe::Stderr, OutputEvent::Closed) => self.finish_stderr_report(),
                (Pipe::Stdout, _) => {}
            }
            return;
        }
        let current = match &self.phase {
            Phase::Running(process) => process.generation,
            _ => return,
        };
        if output.generation != current {
            return;
        }
        match (output.pipe, output.event) {
            (Pipe::Stdout, OutputEvent::Chunk(chunk)) => {
                self.stats.bytes_received += chunk.len() as u64;
                for frame in self.reassembler.push(&chunk) {
                    self.stats.frames_emitted += 1;
                    log::debug!("frame #{} ({} bytes)", frame.seq(), frame.len());
                    self.emit(StreamEvent::Data(frame));
                }
            }
            (Pipe::Stdout, OutputEvent::Closed) => {
                if let Phase::Running(process) = &mut self.phase {
                    process.stdout_open = false;
                }
            }
            (Pipe::Stderr, OutputEvent::Chunk(chunk)) => match self.config.stderr_policy() {
                StderrPolicy::Log => {
                    for line in String::from_utf8_lossy(&chunk).lines() {
                        if !line.trim().is_empty() {
                            log::warn!("decoder stderr: {}", line.trim_end());
                        }
                    }
                }
                StderrPolicy::Fatal => {
                    log::error!(
                        "decoder wrote to stderr; stopping (generation {})",
                        current
                    );
                    self.stop();
                    let mut report = StderrReport {
                        generation: current,
                        output: Vec::new(),
                        since: Instant::now(),
                    };
                    report.append(&chunk);
                    self.stderr_report = Some(report);
                }
            },
            (Pipe::Stderr, OutputEvent::Closed) => {
                if let Phase::Running(process) = &mut self.phase {
                    process.stderr_open = false;
                }
            }
        }
    }

    /// Emit the collected fatal stderr output, if any, as one `error` event.
    fn finish_stderr_report(&mut self) {
        let Some(report) = self.stderr_report.take() else {
            return;
        };
        let text = String::from_utf8_lossy(&report.output).trim().to_string();
        log::error!("decoder stderr (generation {}): {}", report.generation, text);
        self.emit(StreamEvent::Error(StreamError::Stderr(text).into()));
    }

    /// Check for process exit and due restarts.
    fn poll(&mut self) {
        let now = Instant::now();
        if let Some(report) = &self.stderr_report {
            if now.duration_since(report.since) >= EXIT_DRAIN_GRACE {
                self.finish_stderr_report();
            }
        }
        match &mut self.phase {
            Phase::Running(process) => {
                if process.exited.is_none() {
                    match process.child.try_wait() {
                        Ok(Some(status)) => process.exited = Some((status, now)),
                        Ok(None) => return,
                        Err(err) => {
                            log::error!("failed to poll decoder status: {}", err);
                            self.stop();
                            self.emit(StreamEvent::Error(StreamError::Io(err).into()));
                            return;
                        }
                    }
                }
                if let Some((status, seen)) = process.exited {
                    if process.pipes_closed() || now.duration_since(seen) >= EXIT_DRAIN_GRACE {
                        self.handle_exit(status);
                    }
                }
            }
            Phase::Restarting { due } => {
                if now >= *due {
                    self.auto_restart();
                }
            }
            Phase::Idle => {}
        }
    }

    fn handle_exit(&mut self, status: ExitStatus) {
        self.phase = Phase::Idle;
        self.reassembler.reset();
        if status.success() {
            let delay = self.config.restart_delay();
            log::warn!(
                "decoder exited cleanly; restarting in {}ms",
                delay.as_millis()
            );
            self.emit(StreamEvent::Stop);
            self.phase = Phase::Restarting {
                due: Instant::now() + delay,
            };
        } else {
            log::warn!("decoder exited with {}; not restarting", status);
            self.emit(StreamEvent::Stop);
            self.emit(StreamEvent::Error(
                StreamError::ProcessFailed {
                    code: status.code(),
                }
                .into(),
            ));
        }
    }

    fn auto_restart(&mut self) {
        self.phase = Phase::Idle;
        match self.start() {
            Ok(()) => self.stats.auto_restarts += 1,
            Err(err) => {
                log::error!("automatic decoder restart failed: {}", err);
                self.emit(StreamEvent::Error(err.into()));
            }
        }
    }

    fn emit(&mut self, event: StreamEvent) {
        let mut dropped = 0;
        self.subscribers.retain_mut(|subscriber| match subscriber.deliver(&event) {
            Delivery::Delivered => true,
            Delivery::Dropped => {
                dropped += 1;
                true
            }
            Delivery::Gone => false,
        });
        if dropped > 0 {
            log::debug!(
                "{} event dropped for {} full subscriber(s)",
                event.name(),
                dropped
            );
            self.stats.events_dropped += dropped;
        }
    }
}

fn kill_and_reap(mut process: RunningProcess) {
    // Fails only if the process already exited; it is reaped either way.
    let _ = process.child.kill();
    if let Err(err) = process.child.wait() {
        log::warn!(
            "failed to reap decoder (generation {}): {}",
            process.generation,
            err
        );
    }
}
