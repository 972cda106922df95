// Persists last-read offsets per tracked file identity and serves them back
// at startup. See spec section 4.E. The map is owned exclusively by the
// registrar's task; every other task reaches it through `RegistrarHandle`'s
// request channel (Design Notes: "confine the map to the owning task").
//
// Snapshot persistence (tmp file + fsync + rename) is grounded in
// `AetherXHub-eventfold`'s `src/snapshot.rs`.

use crate::config::RegistrarConfig;
use crate::errors::RegistrarError;
use crate::identity::FileStat;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot, watch};

/// `{path, identity, offset}` sent from the publisher to the registrar.
/// `source_path = None` is the initial-reconciliation sentinel.
#[derive(Debug, Clone)]
pub struct FileState {
    pub source_path: Option<PathBuf>,
    pub identity: crate::identity::FileIdentity,
    pub offset: u64,
}

/// A durable per-path record. Keyed by `path` in the registrar's map.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistrarRecord {
    pub path: PathBuf,
    pub identity: crate::identity::FileIdentity,
    pub offset: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub mtime: chrono::DateTime<chrono::Utc>,
}

pub enum RegistrarRequest {
    Lookup {
        path: PathBuf,
        stat: FileStat,
        reply: oneshot::Sender<(u64, bool)>,
    },
    Acknowledge(FileState),
    InitialReconciliationDone,
    /// Force an immediate snapshot (used by the crawler's shutdown path).
    Snapshot {
        reply: oneshot::Sender<Result<(), RegistrarError>>,
    },
}

/// Cheap, cloneable client handle for sending requests into the registrar's
/// task. Prospectors use it for lookups; the crawler uses it to forward
/// acknowledgements and the initial-reconciliation sentinel.
#[derive(Clone)]
pub struct RegistrarHandle {
    tx: mpsc::Sender<RegistrarRequest>,
}

impl RegistrarHandle {
    pub async fn lookup(&self, path: PathBuf, stat: FileStat) -> (u64, bool) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(RegistrarRequest::Lookup {
                path,
                stat,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return (0, false);
        }
        reply_rx.await.unwrap_or((0, false))
    }

    pub async fn acknowledge(&self, state: FileState) {
        let _ = self.tx.send(RegistrarRequest::Acknowledge(state)).await;
    }

    pub async fn initial_reconciliation_done(&self) {
        let _ = self.tx.send(RegistrarRequest::InitialReconciliationDone).await;
    }

    pub async fn snapshot(&self) -> Result<(), RegistrarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(RegistrarRequest::Snapshot { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Ok(()))
    }
}

pub struct Registrar {
    records: HashMap<PathBuf, RegistrarRecord>,
    config: RegistrarConfig,
    acks_since_snapshot: u64,
    reconciled: bool,
    consecutive_snapshot_failures: u32,
}

impl Registrar {
    /// Load the durable snapshot from disk, or start empty if it's missing
    /// or unreadable (a corrupt snapshot is treated as a full rebuild, same
    /// policy as `AetherXHub-eventfold`'s `snapshot::load`).
    pub fn load(config: RegistrarConfig) -> Self {
        let records = load_snapshot(&config.path).unwrap_or_else(|| {
            tracing::warn!(path = %config.path.display(), "registrar: no usable snapshot, starting empty");
            HashMap::new()
        });
        Registrar {
            records,
            config,
            acks_since_snapshot: 0,
            reconciled: false,
            consecutive_snapshot_failures: 0,
        }
    }

    /// `lookup(path, stat)`: per spec 4.E.
    fn lookup(&self, path: &Path, stat: &FileStat) -> (u64, bool) {
        match self.records.get(path) {
            Some(record)
                if record.identity == stat.identity && record.offset <= stat.size =>
            {
                (record.offset, true)
            }
            _ => (0, false),
        }
    }

    fn acknowledge(&mut self, state: FileState) {
        let Some(path) = state.source_path else {
            return;
        };
        self.records.insert(
            path.clone(),
            RegistrarRecord {
                path,
                identity: state.identity,
                offset: state.offset,
                mtime: chrono::Utc::now(),
            },
        );
        if self.reconciled {
            self.acks_since_snapshot += 1;
        }
    }

    fn snapshot_now(&mut self) -> Result<(), RegistrarError> {
        let records: Vec<&RegistrarRecord> = self.records.values().collect();
        match save_snapshot(&self.config.path, &records) {
            Ok(()) => {
                self.acks_since_snapshot = 0;
                self.consecutive_snapshot_failures = 0;
                Ok(())
            }
            Err(source) => {
                self.consecutive_snapshot_failures += 1;
                tracing::error!(
                    path = %self.config.path.display(),
                    error = %source,
                    consecutive_failures = self.consecutive_snapshot_failures,
                    "registrar: snapshot failed, serving from memory"
                );
                if self.consecutive_snapshot_failures >= self.config.max_consecutive_snapshot_failures
                {
                    return Err(RegistrarError::PersistenceEscalated {
                        count: self.consecutive_snapshot_failures,
                        last: source.to_string(),
                    });
                }
                Err(RegistrarError::Snapshot {
                    path: self.config.path.clone(),
                    source,
                })
            }
        }
    }

    /// Run as a long-lived task. Returns an error only when persistence has
    /// escalated to fatal (spec section 7); the caller maps that to exit
    /// code 2.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RegistrarRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RegistrarError> {
        let mut flush_interval = tokio::time::interval(self.config.flush_interval);
        flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = flush_interval.tick() => {
                    if self.reconciled && self.acks_since_snapshot > 0 {
                        if let Err(e) = self.snapshot_now() {
                            if matches!(&e, RegistrarError::PersistenceEscalated { .. }) {
                                return Err(e);
                            }
                        }
                    }
                }
                req = rx.recv() => {
                    match req {
                        Some(RegistrarRequest::Lookup { path, stat, reply }) => {
                            let _ = reply.send(self.lookup(&path, &stat));
                        }
                        Some(RegistrarRequest::Acknowledge(state)) => {
                            self.acknowledge(state);
                            if self.reconciled
                                && self.acks_since_snapshot >= self.config.flush_every_acks
                            {
                                if let Err(e) = self.snapshot_now() {
                                    if matches!(&e, RegistrarError::PersistenceEscalated { .. }) {
                                        return Err(e);
                                    }
                                }
                            }
                        }
                        Some(RegistrarRequest::InitialReconciliationDone) => {
                            tracing::info!("registrar: initial reconciliation complete, honoring acknowledgments");
                            self.reconciled = true;
                        }
                        Some(RegistrarRequest::Snapshot { reply }) => {
                            let result = self.snapshot_now();
                            let escalated = matches!(&result, Err(RegistrarError::PersistenceEscalated { .. }));
                            let _ = reply.send(result);
                            if escalated {
                                // Caller already has the error via `reply`; keep running so
                                // it can still drain any response, but stop serving.
                                return Err(RegistrarError::PersistenceEscalated {
                                    count: self.consecutive_snapshot_failures,
                                    last: "snapshot persistence escalated".to_string(),
                                });
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Graceful shutdown: one last best-effort snapshot.
        let _ = self.snapshot_now();
        Ok(())
    }
}

pub fn spawn(
    config: RegistrarConfig,
    shutdown: watch::Receiver<bool>,
) -> (RegistrarHandle, tokio::task::JoinHandle<Result<(), RegistrarError>>) {
    let registrar = Registrar::load(config);
    let (tx, rx) = mpsc::channel(1024);
    let join = tokio::spawn(registrar.run(rx, shutdown));
    (RegistrarHandle { tx }, join)
}

fn save_snapshot(path: &Path, records: &[&RegistrarRecord]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(records)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&json)?;
    file.sync_data()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
pub fn save_snapshot_for_test(
    path: &Path,
    source_path: &Path,
    identity: crate::identity::FileIdentity,
    offset: u64,
) {
    let record = RegistrarRecord {
        path: source_path.to_path_buf(),
        identity,
        offset,
        mtime: chrono::Utc::now(),
    };
    save_snapshot(path, &[&record]).unwrap();
}

fn load_snapshot(path: &Path) -> Option<HashMap<PathBuf, RegistrarRecord>> {
    let contents = std::fs::read(path).ok()?;
    let records: Vec<RegistrarRecord> = serde_json::from_slice(&contents).ok()?;
    Some(
        records
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect(),
    )
}
