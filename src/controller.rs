//! Public façade over one supervised decoder.
//!
//! `StreamController` owns a dedicated controller thread. Every operation is
//! a message to that thread, and every event is emitted from it, so process
//! output, lifecycle changes and caller requests are handled one at a time in
//! arrival order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use crate::config::{StreamConfig, StreamOptions};
use crate::error::{Result, StreamError, StreamFault};
use crate::frame::Frame;
use crate::ingest::supervisor::{Command, Message, Subscriber, Supervisor};

/// Events delivered to subscribers.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A decoder process was spawned.
    Start,
    /// The decoder process is gone, either stopped or exited.
    Stop,
    /// One complete frame.
    Data(Frame),
    /// A fault raised after `start` returned.
    Error(StreamFault),
}

impl StreamEvent {
    /// Event name: `start`, `stop`, `data` or `error`.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start => "start",
            StreamEvent::Stop => "stop",
            StreamEvent::Data(_) => "data",
            StreamEvent::Error(_) => "error",
        }
    }
}

/// Counters for one controller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_emitted: u64,
    pub bytes_received: u64,
    pub spawns: u64,
    pub auto_restarts: u64,
    /// Events not delivered because a bounded subscriber was full.
    pub events_dropped: u64,
    pub running: bool,
}

pub struct StreamController {
    config: StreamConfig,
    tx: Sender<Message>,
    join: Option<JoinHandle<()>>,
}

impl StreamController {
    /// Create a controller. No process is spawned until `start`.
    pub fn new(config: StreamConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let supervisor = Supervisor::new(config.clone(), tx.clone());
        let join = std::thread::Builder::new()
            .name("frame-relay".to_string())
            .spawn(move || supervisor.run(rx))?;
        Ok(Self {
            config,
            tx,
            join: Some(join),
        })
    }

    pub fn from_options(options: StreamOptions) -> Result<Self> {
        Self::new(options.resolve()?)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn the decoder unless one is already running.
    ///
    /// Emits `start` before returning. Spawn failures, including a missing
    /// executable, are returned here and never retried.
    pub fn start(&self) -> Result<()> {
        self.request(Command::Start)
    }

    /// Kill the decoder if one is running and emit `stop`.
    ///
    /// Always emits `stop`, even when nothing was running. Any partially
    /// accumulated frame is discarded and a pending automatic restart is
    /// cancelled.
    pub fn stop(&self) -> Result<()> {
        self.request(Command::Stop)
    }

    /// Stop then start, but only if a decoder is running. Otherwise nothing
    /// happens and no event is emitted.
    pub fn restart(&self) -> Result<()> {
        self.request(Command::Restart)
    }

    /// Receive every event emitted after this call.
    ///
    /// The channel is unbounded: a receiver that falls behind queues every
    /// frame until it catches up. Use [`subscribe_bounded`](Self::subscribe_bounded)
    /// when the consumer may be slower than the decoder.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel();
        self.add_subscriber(Subscriber::Channel(tx));
        rx
    }

    /// Receive events emitted after this call, holding at most `capacity`
    /// undelivered events. While the receiver is full, new events are
    /// dropped for it and counted in [`StreamStats::events_dropped`].
    pub fn subscribe_bounded(&self, capacity: usize) -> Receiver<StreamEvent> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        self.add_subscriber(Subscriber::Bounded(tx));
        rx
    }

    fn add_subscriber(&self, subscriber: Subscriber) {
        // If the controller thread is gone the receiver simply disconnects.
        let _ = self
            .tx
            .send(Message::Command(Command::Subscribe(subscriber)));
    }

    /// Register a callback for every event emitted after this call.
    ///
    /// The callback runs on the controller thread and must not call back into
    /// this controller.
    pub fn on_event<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&StreamEvent) + Send + 'static,
    {
        self.tx
            .send(Message::Command(Command::Subscribe(Subscriber::Callback(
                Box::new(callback),
            ))))
            .map_err(|_| StreamError::ControllerGone)
    }

    pub fn stats(&self) -> Result<StreamStats> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(Message::Command(Command::Stats(reply)))
            .map_err(|_| StreamError::ControllerGone)?;
        rx.recv().map_err(|_| StreamError::ControllerGone)
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.stats()?.running)
    }

    fn request(&self, command: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(Message::Command(command(reply)))
            .map_err(|_| StreamError::ControllerGone)?;
        rx.recv().map_err(|_| StreamError::ControllerGone)?
    }
}

impl Drop for StreamController {
    /// Kills any running decoder and joins the controller thread.
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Command(Command::Shutdown));
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("frame relay controller thread panicked");
            }
        }
    }
}
