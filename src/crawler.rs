// The supervisor: owns all prospectors and the registrar, wires channels,
// manages shutdown. See spec section 4.F.

use crate::config::Config;
use crate::errors::RegistrarError;
use crate::harvester::{shutdown_grace, FileEvent};
use crate::prospector::Prospector;
use crate::registrar::{self, FileState, RegistrarHandle};
use tokio::sync::{mpsc, watch};

pub struct Crawler {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    registrar: RegistrarHandle,
    registrar_join: tokio::task::JoinHandle<Result<(), RegistrarError>>,
    prospector_joins: Vec<tokio::task::JoinHandle<()>>,
    persist_forward_join: tokio::task::JoinHandle<()>,
}

/// Everything an external caller needs to wire the core into the rest of a
/// running agent: the channel the spooler reads `FileEvent`s from, and the
/// channel an external publisher posts `FileState` acknowledgments on.
pub struct CrawlerWiring {
    pub crawler: Crawler,
    pub spooler_rx: mpsc::Receiver<FileEvent>,
    pub ack_tx: mpsc::Sender<FileState>,
}

impl Crawler {
    /// Build and start the crawler: load the registrar's snapshot, spawn the
    /// registrar task, then spawn one prospector task per configured
    /// stanza.
    pub fn start(config: Config) -> CrawlerWiring {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (spooler_tx, spooler_rx) = mpsc::channel::<FileEvent>(1024);
        let (persist_tx, mut persist_rx) = mpsc::channel::<FileState>(1024);
        let (ack_tx, mut ack_rx) = mpsc::channel::<FileState>(1024);

        let (registrar, registrar_join) = registrar::spawn(config.registrar, shutdown_rx.clone());

        // Fan-in: forward both prospector sentinels (via persist_tx, held by
        // prospectors) and external publisher acknowledgments (via ack_rx,
        // exposed to the caller) into the registrar's request channel.
        let fanin_registrar = registrar.clone();
        let persist_forward_join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(state) = persist_rx.recv() => {
                        forward_to_registrar(&fanin_registrar, state).await;
                    }
                    Some(state) = ack_rx.recv() => {
                        forward_to_registrar(&fanin_registrar, state).await;
                    }
                    else => break,
                }
            }
        });

        let mut prospector_joins = Vec::new();
        for prospector_config in config.prospectors {
            let prospector = Prospector::new(
                prospector_config,
                spooler_tx.clone(),
                persist_tx.clone(),
                registrar.clone(),
                shutdown_rx.clone(),
            );
            prospector_joins.push(prospector.spawn());
        }
        drop(spooler_tx);
        drop(persist_tx);

        CrawlerWiring {
            crawler: Crawler {
                shutdown_tx,
                shutdown_rx,
                registrar,
                registrar_join,
                prospector_joins,
                persist_forward_join,
            },
            spooler_rx,
            ack_tx,
        }
    }

    /// Signal all prospectors/harvesters to stop, wait up to the shutdown
    /// grace period for them to drain, snapshot the registrar, and exit.
    /// Returns the exit code per spec section 6 (0 success, 2 registrar
    /// persistence escalation).
    pub async fn shutdown(self) -> i32 {
        let _ = self.shutdown_tx.send(true);

        let drain = futures_join_all(self.prospector_joins);
        if tokio::time::timeout(shutdown_grace(), drain).await.is_err() {
            tracing::warn!("crawler: shutdown grace period elapsed, abandoning stragglers");
        }

        let _ = self.persist_forward_join.await;

        match self.registrar_join.await {
            Ok(Ok(())) => crate::errors::exit_code::SUCCESS,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "crawler: registrar persistence escalated to fatal");
                crate::errors::exit_code::REGISTRAR_ERROR
            }
            Err(e) => {
                tracing::error!(error = %e, "crawler: registrar task panicked");
                crate::errors::exit_code::REGISTRAR_ERROR
            }
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

async fn forward_to_registrar(registrar: &RegistrarHandle, state: FileState) {
    if state.source_path.is_none() {
        registrar.initial_reconciliation_done().await;
    } else {
        registrar.acknowledge(state).await;
    }
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProspectorConfig, RegistrarConfig};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn test_config(dir: &tempfile::TempDir, pattern: String) -> Config {
        Config {
            prospectors: vec![ProspectorConfig {
                paths: vec![pattern],
                scan_frequency: Duration::from_millis(20),
                ignore_older: Duration::ZERO,
                harvester_buffer_size: 4096,
                tail_on_rotate: false,
            }],
            registrar: RegistrarConfig {
                path: dir.path().join("registry.json"),
                flush_every_acks: 1,
                flush_interval: Duration::from_secs(3600),
                max_consecutive_snapshot_failures: 5,
            },
        }
    }

    #[tokio::test]
    async fn fresh_file_is_tailed_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        tokio::fs::write(&path, "first\nsecond\n").await.unwrap();

        let config = test_config(&dir, dir.path().join("*.log").to_string_lossy().into_owned());
        let wiring = Crawler::start(config);
        let mut spooler_rx = wiring.spooler_rx;

        let first = spooler_rx.recv().await.unwrap();
        assert_eq!(first.line_bytes, b"first");
        let second = spooler_rx.recv().await.unwrap();
        assert_eq!(second.line_bytes, b"second");

        // simulate the publisher acknowledging what it shipped
        wiring
            .ack_tx
            .send(FileState {
                source_path: Some(path.clone()),
                identity: second.identity,
                offset: second.offset_after_line,
            })
            .await
            .unwrap();

        let code = wiring.crawler.shutdown().await;
        assert_eq!(code, crate::errors::exit_code::SUCCESS);

        let saved = tokio::fs::read_to_string(dir.path().join("registry.json"))
            .await
            .unwrap();
        assert!(saved.contains("second"));
    }

    #[tokio::test]
    async fn resumes_from_registrar_snapshot_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"first\n").await.unwrap();
        file.flush().await.unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        let stat = crate::identity::FileStat::from_metadata(&metadata);

        crate::registrar::save_snapshot_for_test(
            &dir.path().join("registry.json"),
            &path,
            stat.identity,
            6,
        );

        file.write_all(b"second\n").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let pattern = dir.path().join("*.log").to_string_lossy().into_owned();
        let config = test_config(&dir, pattern);
        let wiring = Crawler::start(config);
        let mut spooler_rx = wiring.spooler_rx;

        let only = spooler_rx.recv().await.unwrap();
        assert_eq!(only.line_bytes, b"second");

        let code = wiring.crawler.shutdown().await;
        assert_eq!(code, crate::errors::exit_code::SUCCESS);
    }
}
