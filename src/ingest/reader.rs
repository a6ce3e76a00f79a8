use std::io::{self, Read};
use std::sync::mpsc::Sender;

use super::supervisor::Message;
use crate::frame::READ_CHUNK_BYTES;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pipe {
    Stdout,
    Stderr,
}

impl Pipe {
    fn label(self) -> &'static str {
        match self {
            Pipe::Stdout => "stdout",
            Pipe::Stderr => "stderr",
        }
    }
}

/// Output of one decoder process, tagged with its generation so that bytes
/// from a killed process are never mixed into the next one.
#[derive(Debug)]
pub(crate) struct Output {
    pub generation: u64,
    pub pipe: Pipe,
    pub event: OutputEvent,
}

#[derive(Debug)]
pub(crate) enum OutputEvent {
    Chunk(Vec<u8>),
    Closed,
}

/// Forward everything read from `source` to the controller thread until EOF.
pub(crate) fn spawn_reader<R>(
    mut source: R,
    pipe: Pipe,
    generation: u64,
    tx: Sender<Message>,
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("decoder-{}-{}", pipe.label(), generation))
        .spawn(move || {
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let event = match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => OutputEvent::Chunk(chunk[..n].to_vec()),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::warn!("decoder {} read failed: {}", pipe.label(), err);
                        break;
                    }
                };
                let output = Output {
                    generation,
                    pipe,
                    event,
                };
                if tx.send(Message::Output(output)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Message::Output(Output {
                generation,
                pipe,
                event: OutputEvent::Closed,
            }));
        })?;
    Ok(())
}
