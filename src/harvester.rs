// Owns one open file handle; tails a single file. See spec section 4.B.

use crate::identity::{system_time_to_utc, FileIdentity};
use crate::line_reader::{LineOutcome, LineReader, Source};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// The literal path that activates the stdin harvester.
pub const STDIN_SENTINEL: &str = "-";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A record sent to the spooler for each framed line.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub source_path: PathBuf,
    pub identity: FileIdentity,
    pub offset_after_line: u64,
    pub line_bytes: Vec<u8>,
    pub read_timestamp: chrono::DateTime<chrono::Utc>,
}

/// Explicit two-state mailbox a harvester uses to post its final offset to
/// the prospector that spawned it: *running* (empty) or *stopped-with-offset*
/// (filled). Deliberately not a generic channel — checking a queue's length
/// as a liveness proxy is the footgun this type exists to remove.
#[derive(Clone, Debug)]
pub struct HarvesterHandle {
    slot: Arc<Mutex<Option<u64>>>,
}

impl HarvesterHandle {
    pub fn new() -> Self {
        HarvesterHandle {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle that starts out already stopped, carrying `offset`. Used
    /// when the prospector decides not to start a harvester at all (e.g. an
    /// ignore-older file) but still needs a "stopped" entry for later resume.
    pub fn pre_stopped(offset: u64) -> Self {
        HarvesterHandle {
            slot: Arc::new(Mutex::new(Some(offset))),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Read the stopped offset without clearing the slot.
    pub fn peek_offset(&self) -> Option<u64> {
        *self.slot.lock().unwrap()
    }

    /// Read and clear the stopped offset, returning the prospector's entry
    /// to "running" so a freshly spawned harvester can fill it again later.
    pub fn take_offset(&self) -> Option<u64> {
        self.slot.lock().unwrap().take()
    }

    fn post(&self, offset: u64) {
        *self.slot.lock().unwrap() = Some(offset);
    }
}

impl Default for HarvesterHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a harvester should begin reading.
#[derive(Debug, Clone, Copy)]
pub enum StartOffset {
    Offset(u64),
    EndOfFile,
}

pub struct Harvester {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub start: StartOffset,
    pub buffer_size: usize,
    pub ignore_older: Duration,
    pub handle: HarvesterHandle,
    pub spooler_tx: mpsc::Sender<FileEvent>,
    pub shutdown: watch::Receiver<bool>,
    /// Set by the prospector when it has detected this harvester's file was
    /// rotated out from under it; checked only on `Idle`, never interrupts a
    /// line in flight.
    pub rotated: watch::Receiver<bool>,
    pub is_stdin: bool,
}

impl Harvester {
    /// Spawn this harvester as a long-lived task. The task posts its final
    /// offset to `handle` on every exit path.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn open(&self) -> io::Result<(Source, u64)> {
        if self.is_stdin {
            return Ok((Source::Stdin(tokio::io::stdin()), 0));
        }
        let mut file = tokio::fs::File::open(&self.path).await?;
        let offset = match self.start {
            StartOffset::Offset(o) => o,
            StartOffset::EndOfFile => file.metadata().await?.len(),
        };
        use tokio::io::AsyncSeekExt;
        file.seek(io::SeekFrom::Start(offset)).await?;
        Ok((Source::File(file), offset))
    }

    /// The offset this harvester was asked to start from, known without
    /// having to open the file. Used when `open` itself fails, so a
    /// transient open error doesn't lose a resumed offset.
    fn intended_start_offset(&self) -> u64 {
        match self.start {
            StartOffset::Offset(o) => o,
            StartOffset::EndOfFile => 0,
        }
    }

    async fn run(mut self) {
        let (source, start_offset) = match self.open().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "harvester: open failed, exiting immediately");
                // Post the offset we intended to start from, not 0: an
                // open error is a transient failure (spec section 7), not
                // truncation. Losing the intended offset here would make
                // the next restart re-read from scratch and duplicate
                // already-acknowledged events.
                self.handle.post(self.intended_start_offset());
                return;
            }
        };

        let mut reader = LineReader::new(source, self.buffer_size);
        let mut offset = start_offset;
        let mut backoff = INITIAL_BACKOFF;
        let mut idle_elapsed = Duration::ZERO;

        tracing::debug!(path = %self.path.display(), offset, "harvester: started");

        'outer: loop {
            if !self.is_stdin && *self.shutdown.borrow() {
                break;
            }
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.changed(), if !self.is_stdin => {
                    if *self.shutdown.borrow() {
                        break 'outer;
                    }
                    continue;
                }
                outcome = reader.next_line() => outcome,
            };

            match outcome {
                Ok(LineOutcome::Line {
                    line,
                    bytes_consumed,
                }) => {
                    offset += bytes_consumed;
                    idle_elapsed = Duration::ZERO;
                    backoff = INITIAL_BACKOFF;
                    let event = FileEvent {
                        source_path: self.path.clone(),
                        identity: self.identity,
                        offset_after_line: offset,
                        line_bytes: line,
                        read_timestamp: system_time_to_utc(std::time::SystemTime::now()),
                    };
                    if self.spooler_tx.send(event).await.is_err() {
                        tracing::debug!(path = %self.path.display(), "harvester: spooler gone, exiting");
                        break;
                    }
                }
                Ok(LineOutcome::Idle) => {
                    if !self.is_stdin && *self.rotated.borrow() {
                        tracing::debug!(path = %self.path.display(), "harvester: rotation signalled, exiting");
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    idle_elapsed += backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    // `ignore_older == 0` is the documented "never age out"
                    // sentinel (config.rs); only age-exit when it's set.
                    if !self.is_stdin
                        && self.ignore_older != Duration::ZERO
                        && idle_elapsed > self.ignore_older
                    {
                        tracing::debug!(path = %self.path.display(), "harvester: idle past ignore_older, exiting");
                        break;
                    }
                }
                Ok(LineOutcome::Truncated) => {
                    tracing::info!(path = %self.path.display(), "harvester: truncation detected, resetting to 0");
                    if let Err(e) = reader.reset_after_truncation().await {
                        tracing::warn!(path = %self.path.display(), error = %e, "harvester: failed to reseek after truncation");
                        break;
                    }
                    offset = 0;
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "harvester: read error, exiting");
                    break;
                }
            }
        }

        self.handle.post(offset);
        tracing::debug!(path = %self.path.display(), offset, "harvester: stopped");
    }
}

/// Upper bound callers (the crawler's shutdown path) should wait for a
/// harvester task to drain before abandoning it.
pub fn shutdown_grace() -> Duration {
    SHUTDOWN_GRACE
}
