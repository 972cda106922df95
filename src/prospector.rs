// Periodically expands globs, reconciles the observed file set against
// known state, and starts/stops harvesters. See spec section 4.D. The
// entry map below is mutated only by the owning prospector task (Design
// Notes: "confine the map to the owning task").

use crate::config::ProspectorConfig;
use crate::harvester::{
    Harvester, HarvesterHandle, StartOffset, STDIN_SENTINEL,
};
use crate::identity::{self, FileIdentity, FileStat};
use crate::registrar::{FileState, RegistrarHandle};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// One observed path's state, mutated only by the owning prospector.
struct ProspectorEntry {
    stat: FileStat,
    handle: HarvesterHandle,
    last_iteration: u32,
    rotate_tx: watch::Sender<bool>,
    /// The offset a harvester was actually launched at for this path, or
    /// `None` if this entry never launched one of its own (an ignore-older
    /// pre-stopped stub, or a handle adopted wholesale from a rename). Used
    /// to tell "harvester stopped having made no progress" (retry next
    /// iteration regardless of mtime, per spec section 7's open/read error
    /// handling) apart from "harvester stopped normally" (retry only once
    /// mtime moves).
    started_offset: Option<u64>,
}

/// Modular comparison tolerant of the iteration counter wrapping (Design
/// Notes: "treat counters as modular... since the source tolerates
/// overflow").
fn iteration_is_stale(last_iteration: u32, current_iteration: u32) -> bool {
    (current_iteration.wrapping_sub(last_iteration) as i32) > 0
}

pub struct Prospector {
    config: ProspectorConfig,
    entries: HashMap<PathBuf, ProspectorEntry>,
    missing: HashMap<PathBuf, FileStat>,
    iteration: u32,
    lastscan: chrono::DateTime<chrono::Utc>,
    spooler_tx: mpsc::Sender<crate::harvester::FileEvent>,
    persist_tx: mpsc::Sender<FileState>,
    registrar: RegistrarHandle,
    shutdown: watch::Receiver<bool>,
}

impl Prospector {
    pub fn new(
        config: ProspectorConfig,
        spooler_tx: mpsc::Sender<crate::harvester::FileEvent>,
        persist_tx: mpsc::Sender<FileState>,
        registrar: RegistrarHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Prospector {
            config,
            entries: HashMap::new(),
            missing: HashMap::new(),
            iteration: 0,
            lastscan: chrono::Utc::now(),
            spooler_tx,
            persist_tx,
            registrar,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut paths: Vec<String> = self.config.paths.clone();

        if let Some(pos) = paths.iter().position(|p| p == STDIN_SENTINEL) {
            paths.remove(pos);
            self.spawn_stdin_harvester();
        }

        self.lastscan = chrono::Utc::now();
        let mut seen_this_pass = HashSet::new();
        for pattern in &paths {
            self.scan(pattern, &mut seen_this_pass).await;
        }

        // Initial reconciliation is complete; tell the registrar it may
        // start honoring acknowledgments for durability snapshots.
        let _ = self
            .persist_tx
            .send(FileState {
                source_path: None,
                identity: FileIdentity { device: 0, inode: 0 },
                offset: 0,
            })
            .await;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let newlastscan = chrono::Utc::now();
            // A fresh seen-set per pass: the initial scan above and this
            // loop's first pass can share the same `iteration` value, so
            // dedup must key off "already matched this pass", not off the
            // iteration counter.
            let mut seen_this_pass = HashSet::new();
            for pattern in &paths {
                self.scan(pattern, &mut seen_this_pass).await;
            }
            self.lastscan = newlastscan;

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.scan_frequency) => {}
            }

            self.garbage_collect();
            self.iteration = self.iteration.wrapping_add(1);
        }
    }

    fn garbage_collect(&mut self) {
        let iteration = self.iteration;
        self.entries.retain(|path, entry| {
            let stale = entry.handle.is_stopped() && iteration_is_stale(entry.last_iteration, iteration);
            if stale {
                tracing::debug!(path = %path.display(), "prospector: forgetting vanished file");
            }
            !stale
        });
    }

    fn spawn_stdin_harvester(&mut self) {
        let handle = HarvesterHandle::new();
        let (_rotate_tx, rotate_rx) = watch::channel(false);
        let harvester = Harvester {
            path: PathBuf::from(STDIN_SENTINEL),
            identity: FileIdentity::STDIN,
            start: StartOffset::Offset(0),
            buffer_size: self.config.harvester_buffer_size,
            ignore_older: Duration::MAX,
            handle,
            spooler_tx: self.spooler_tx.clone(),
            shutdown: self.shutdown.clone(),
            rotated: rotate_rx,
            is_stdin: true,
        };
        harvester.spawn();
    }

    /// Evaluate one glob pattern, reconciling matches against known entries.
    async fn scan(&mut self, pattern: &str, seen_this_pass: &mut HashSet<PathBuf>) {
        let matches: Vec<PathBuf> = match glob::glob(pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "prospector: glob failed, skipping this iteration");
                return;
            }
        };
        let matched_set: std::collections::HashSet<&Path> =
            matches.iter().map(PathBuf::as_path).collect();

        self.missing = self
            .entries
            .iter()
            .filter(|(path, _)| !matched_set.contains(path.as_path()))
            .map(|(path, entry)| (path.clone(), entry.stat))
            .collect();

        for path in matches {
            if !seen_this_pass.insert(path.clone()) {
                // Same absolute path matched by an earlier pattern this
                // same pass: one entry, not two.
                continue;
            }

            let metadata = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "prospector: stat failed, skipping");
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }
            let stat = FileStat::from_metadata(&metadata);

            let is_known = self.entries.contains_key(&path);
            if is_known {
                self.check_existing_file(path, stat).await;
            } else {
                self.check_new_file(path, stat).await;
            }
        }
    }

    async fn check_new_file(&mut self, path: PathBuf, stat: FileStat) {
        let ignore_older = self.config.ignore_older;
        let ignore_older_chrono = chrono::Duration::seconds(ignore_older.as_secs() as i64)
            + chrono::Duration::nanoseconds(ignore_older.subsec_nanos() as i64);
        let old_enough = stat.mtime < self.lastscan
            && ignore_older != Duration::ZERO
            && chrono::Utc::now().signed_duration_since(stat.mtime) > ignore_older_chrono;

        if old_enough {
            let (offset, resuming) = self.registrar.lookup(path.clone(), stat).await;
            if resuming {
                tracing::debug!(path = %path.display(), offset, "prospector: resuming harvester on previously-harvested old file");
                self.start_harvester(path, stat, StartOffset::Offset(offset));
            } else {
                tracing::debug!(path = %path.display(), "prospector: skipping file older than ignore_older");
                // Known tension with spec section 8 invariant 5: this only
                // pre-fills the in-memory handle slot, so a registrar
                // restart before this file is ever modified again won't see
                // an offset-at-file-size record for it. Matches spec
                // section 4.D and the original Go prospector (which pushes
                // size to the harvester channel, not the registrar) as-is;
                // not resolved here.
                let handle = HarvesterHandle::pre_stopped(stat.size);
                self.insert_entry(path, stat, handle);
            }
            return;
        }

        if let Some(old_path) = identity::is_rename_of(&stat, &self.missing).map(Path::to_path_buf) {
            tracing::debug!(old = %old_path.display(), new = %path.display(), "prospector: rename detected on new file");
            let adopted = self.entries.get(&old_path).map(|e| e.handle.clone());
            let handle = adopted.unwrap_or_else(HarvesterHandle::new);
            self.insert_entry(path, stat, handle);
            return;
        }

        let (offset, resuming) = self.registrar.lookup(path.clone(), stat).await;
        if resuming {
            tracing::debug!(path = %path.display(), offset, "prospector: resuming harvester on previously-harvested file");
        } else {
            tracing::debug!(path = %path.display(), "prospector: launching harvester on new file");
        }
        self.start_harvester(path, stat, StartOffset::Offset(offset));
    }

    async fn check_existing_file(&mut self, path: PathBuf, stat: FileStat) {
        let old_stat = self.entries.get(&path).map(|e| e.stat).expect("existing entry");

        if !identity::same_identity(&old_stat, &stat) {
            if let Some(old_path) =
                identity::is_rename_of(&stat, &self.missing).map(Path::to_path_buf)
            {
                tracing::debug!(old = %old_path.display(), new = %path.display(), "prospector: rename detected on existing path");
                let adopted = self.entries.get(&old_path).map(|e| e.handle.clone());
                let handle = adopted.unwrap_or_else(HarvesterHandle::new);
                self.insert_entry(path, stat, handle);
            } else {
                tracing::info!(path = %path.display(), "prospector: rotation detected, starting fresh harvester");
                // Tell the orphaned harvester (still tailing the old inode)
                // that its file has rotated out from under it.
                if let Some(old_entry) = self.entries.get(&path) {
                    let _ = old_entry.rotate_tx.send(true);
                }
                let start = if self.config.tail_on_rotate {
                    StartOffset::EndOfFile
                } else {
                    StartOffset::Offset(0)
                };
                self.start_harvester(path.clone(), stat, start);
                // Keep the old stat in `missing` so a later match on the
                // rotated-away name (e.g. "a.log.1") can still detect the
                // rename this same iteration.
                self.missing.insert(path, old_stat);
            }
            return;
        }

        let entry = self.entries.get(&path).expect("existing entry");
        let made_no_progress = match (entry.started_offset, entry.handle.peek_offset()) {
            (Some(started), Some(stopped)) => started == stopped,
            _ => false,
        };
        if entry.handle.is_stopped() && (made_no_progress || old_stat.mtime != stat.mtime) {
            let offset = entry.handle.take_offset().unwrap_or(0);
            if made_no_progress {
                // No bytes were read before the harvester stopped (an open
                // or read error, spec section 7): retry next iteration
                // regardless of mtime, rather than waiting for the file to
                // be touched again.
                tracing::debug!(path = %path.display(), offset, "prospector: retrying harvester after open/read error");
            } else {
                tracing::debug!(path = %path.display(), offset, "prospector: resuming harvester on modified idle file");
            }
            self.start_harvester(path, stat, StartOffset::Offset(offset));
        } else {
            // Unchanged; just re-stamp last_iteration so GC doesn't reap it.
            if let Some(entry) = self.entries.get_mut(&path) {
                entry.stat = stat;
                entry.last_iteration = self.iteration;
            }
        }
    }

    fn start_harvester(&mut self, path: PathBuf, stat: FileStat, start: StartOffset) {
        let handle = HarvesterHandle::new();
        let (rotate_tx, rotate_rx) = watch::channel(false);
        let started_offset = match start {
            StartOffset::Offset(o) => o,
            StartOffset::EndOfFile => stat.size,
        };
        let harvester = Harvester {
            path: path.clone(),
            identity: stat.identity,
            start,
            buffer_size: self.config.harvester_buffer_size,
            ignore_older: self.config.ignore_older,
            handle: handle.clone(),
            spooler_tx: self.spooler_tx.clone(),
            shutdown: self.shutdown.clone(),
            rotated: rotate_rx,
            is_stdin: false,
        };
        harvester.spawn();
        self.entries.insert(
            path,
            ProspectorEntry {
                stat,
                handle,
                last_iteration: self.iteration,
                rotate_tx,
                started_offset: Some(started_offset),
            },
        );
    }

    /// Install an entry without launching a harvester of our own: either an
    /// ignore-older stub (pre-stopped handle) or a rename-adopted handle
    /// still owned by whichever harvester originally started it. Neither
    /// case has a `started_offset` of ours to compare against, so the
    /// "retry regardless of mtime" path in `check_existing_file` never
    /// fires for them.
    fn insert_entry(&mut self, path: PathBuf, stat: FileStat, handle: HarvesterHandle) {
        let (rotate_tx, _rotate_rx) = watch::channel(false);
        self.entries.insert(
            path,
            ProspectorEntry {
                stat,
                handle,
                last_iteration: self.iteration,
                rotate_tx,
                started_offset: None,
            },
        );
    }
}
