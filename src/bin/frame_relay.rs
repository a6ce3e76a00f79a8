//! frame_relay - run one supervised decoder and keep the latest frame on disk
//!
//! This binary:
//! 1. Resolves stream options (RELAY_CONFIG file, RELAY_* env, then flags)
//! 2. Spawns the decoder and restarts it after clean exits
//! 3. Writes every completed frame to `--output`, replacing the previous one
//! 4. Stops the decoder on Ctrl-C, on `--max-frames`, or on a stream error
//!
//! With `--stdin` no decoder is spawned; an MJPEG byte stream piped on stdin
//! is split into frames instead.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rtsp_frame_relay::{
    BoundaryMode, Frame, FrameReader, StderrPolicy, StreamController, StreamEvent, StreamOptions,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_WAIT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay JPEG frames from a live stream")]
struct Args {
    /// Stream URI, e.g. rtsp://camera.local:554/stream.
    #[arg(long)]
    input: Option<String>,
    /// Frame rate requested from the decoder.
    #[arg(long)]
    rate: Option<u32>,
    /// Output size as WxH.
    #[arg(long)]
    resolution: Option<String>,
    /// JPEG quality (1-31, lower is better).
    #[arg(long)]
    quality: Option<u32>,
    /// Decoder executable.
    #[arg(long)]
    cmd: Option<String>,
    /// Extra decoder argument; repeat for several.
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    arguments: Vec<String>,
    /// Frame boundary detection (scan|chunk_tail).
    #[arg(long)]
    boundary: Option<BoundaryMode>,
    /// Decoder stderr handling (fatal|log).
    #[arg(long)]
    stderr_policy: Option<StderrPolicy>,
    /// File that always holds the most recent frame.
    #[arg(long, env = "RELAY_OUTPUT", default_value = "latest.jpg")]
    output: PathBuf,
    /// Exit after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Split an MJPEG stream read from stdin instead of spawning a decoder.
    #[arg(long)]
    stdin: bool,
}

impl Args {
    fn apply(&self, options: &mut StreamOptions) {
        if let Some(input) = &self.input {
            options.input = Some(input.clone());
        }
        if let Some(rate) = self.rate {
            options.rate = Some(rate);
        }
        if let Some(resolution) = &self.resolution {
            options.resolution = Some(resolution.clone());
        }
        if let Some(quality) = self.quality {
            options.quality = Some(quality);
        }
        if let Some(cmd) = &self.cmd {
            options.cmd = Some(cmd.clone());
        }
        if !self.arguments.is_empty() {
            options.arguments = Some(self.arguments.clone());
        }
        if let Some(boundary) = self.boundary {
            options.boundary = Some(boundary);
        }
        if let Some(policy) = self.stderr_policy {
            options.stderr_policy = Some(policy);
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut options = StreamOptions::load()?;
    args.apply(&mut options);

    if args.stdin {
        return relay_stdin(&args, options.boundary.unwrap_or_default());
    }

    let controller = StreamController::from_options(options).context("configure stream")?;
    let events = controller.subscribe();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || shutdown_handler.store(true, Ordering::SeqCst))
        .context("install Ctrl-C handler")?;

    controller.start().context("start decoder")?;
    log::info!(
        "frame_relay running. input={} output={}",
        controller.config().input(),
        args.output.display()
    );

    let mut frames = 0u64;
    let mut last_health_log = Instant::now();
    let outcome = loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutdown signal received");
            break Ok(());
        }

        match events.recv_timeout(EVENT_WAIT) {
            Ok(StreamEvent::Data(frame)) => {
                write_frame(&args.output, &frame)?;
                frames += 1;
                if args.max_frames.is_some_and(|max| frames >= max) {
                    log::info!("wrote {} frames; stopping", frames);
                    break Ok(());
                }
            }
            Ok(StreamEvent::Start) => log::info!("decoder started"),
            Ok(StreamEvent::Stop) => log::info!("decoder stopped"),
            Ok(StreamEvent::Error(fault)) => break Err(anyhow!(fault).context("stream failed")),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                break Err(anyhow!("stream controller exited unexpectedly"));
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = controller.stats()?;
            log::info!(
                "relay running={} frames={} bytes={} spawns={} auto_restarts={}",
                stats.running,
                stats.frames_emitted,
                stats.bytes_received,
                stats.spawns,
                stats.auto_restarts
            );
            last_health_log = Instant::now();
        }
    };

    controller.stop()?;
    outcome
}

fn relay_stdin(args: &Args, boundary: BoundaryMode) -> Result<()> {
    let stdin = std::io::stdin().lock();
    let mut frames = 0u64;
    for frame in FrameReader::new(stdin, boundary) {
        let frame = frame.context("read frame from stdin")?;
        write_frame(&args.output, &frame)?;
        frames += 1;
        if args.max_frames.is_some_and(|max| frames >= max) {
            break;
        }
    }
    log::info!("wrote {} frames from stdin", frames);
    Ok(())
}

/// Replace `path` with the frame via a rename so readers never see a partial
/// image.
fn write_frame(path: &Path, frame: &Frame) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, frame.as_slice())
        .with_context(|| format!("write frame to {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    log::debug!("frame #{} written ({} bytes)", frame.seq(), frame.len());
    Ok(())
}
