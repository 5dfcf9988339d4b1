//! Configuration archiver
//!
//! Every registry mutation produces a snapshot directory under the archive
//! root:
//!
//! ```text
//! <root>/20250114_093012_481/
//!     services.json      full descriptor set
//!     checksum.sha256    hex SHA-256 of services.json
//! ```
//!
//! Snapshots are written into `.tmp-<id>` and renamed into place, so a
//! reader never sees a partial snapshot. All writes go through one writer
//! task.
//!
//! The same task keeps `state.json` next to the snapshots: the last known
//! lifecycle state, restart count and error of each service, so they
//! survive a restart of the orchestrator. The previous file is kept as
//! `state.backup.json`.

use crate::config::{EcosystemFile, ServiceDescriptor};
use crate::error::{OrchestratorError, Result};
use crate::runtime::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const SERVICES_FILE: &str = "services.json";
pub const CHECKSUM_FILE: &str = "checksum.sha256";
pub const STATE_FILE: &str = "state.json";
pub const STATE_BACKUP_FILE: &str = "state.backup.json";
const TMP_PREFIX: &str = ".tmp-";
const STATE_VERSION: &str = "1";

/// On-disk content of `services.json`
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    id: String,
    created_at: String,
    services: Vec<ServiceDescriptor>,
}

/// A written, immutable configuration snapshot
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of `services.json`
    pub checksum: String,
    /// Snapshot directory
    pub path: PathBuf,
    pub descriptors: Vec<ServiceDescriptor>,
}

/// Runtime state of one service as saved in `state.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedServiceState {
    pub name: String,
    pub state: ServiceState,
    pub restarts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// RFC 3339 time of the last transition
    pub changed_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: String,
    saved_at: String,
    services: Vec<SavedServiceState>,
}

enum ArchiveCommand {
    Write(Vec<ServiceDescriptor>),
    RecordState(SavedServiceState),
    ForgetState(String),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking handle to the archive writer task
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: mpsc::UnboundedSender<ArchiveCommand>,
}

impl ArchiveHandle {
    /// Queue a snapshot of `descriptors`; never blocks the caller
    pub fn request(&self, descriptors: Vec<ServiceDescriptor>) {
        if self.tx.send(ArchiveCommand::Write(descriptors)).is_err() {
            log::warn!("Archive writer is gone, snapshot request dropped");
        }
    }

    /// Queue an update of one service's saved runtime state
    pub fn record_state(&self, state: SavedServiceState) {
        if self.tx.send(ArchiveCommand::RecordState(state)).is_err() {
            log::debug!("Archive writer is gone, state update dropped");
        }
    }

    /// Drop a service from the saved runtime state
    pub fn forget_state(&self, name: &str) {
        let _ = self.tx.send(ArchiveCommand::ForgetState(name.to_string()));
    }

    /// Wait until every previously queued snapshot has been processed
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ArchiveCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Writes, lists and restores snapshots under one root directory
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the single writer task
    pub fn spawn_writer(self: &Arc<Self>) -> (ArchiveHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let archiver = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut states: BTreeMap<String, SavedServiceState> = BTreeMap::new();
            while let Some(command) = rx.recv().await {
                match command {
                    ArchiveCommand::Write(descriptors) => {
                        match archiver.write_snapshot(&descriptors).await {
                            Ok(snapshot) => log::info!(
                                "Archived {} services as snapshot {}",
                                snapshot.descriptors.len(),
                                snapshot.id
                            ),
                            // The next mutation writes the full set again
                            Err(e) => log::error!("{}", e),
                        }
                    }
                    ArchiveCommand::RecordState(state) => {
                        states.insert(state.name.clone(), state);
                        archiver.save_state_logged(&states).await;
                    }
                    ArchiveCommand::ForgetState(name) => {
                        if states.remove(&name).is_some() {
                            archiver.save_state_logged(&states).await;
                        }
                    }
                    ArchiveCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Archive writer stopped");
        });

        (ArchiveHandle { tx }, task)
    }

    /// Write a snapshot of `descriptors` atomically
    pub async fn write_snapshot(&self, descriptors: &[ServiceDescriptor]) -> Result<ConfigSnapshot> {
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| OrchestratorError::ArchiveWrite { path, source }
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(write_err(&self.root))?;

        let created_at = Utc::now();
        let id = self.unused_id(&created_at).await;
        let final_dir = self.root.join(&id);
        let tmp_dir = self.root.join(format!("{}{}", TMP_PREFIX, id));

        let document = SnapshotDocument {
            id: id.clone(),
            created_at: created_at.to_rfc3339(),
            services: descriptors.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| write_err(&final_dir)(std::io::Error::other(e)))?;
        let checksum = hex::encode(Sha256::digest(&content));

        if tokio::fs::try_exists(&tmp_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&tmp_dir)
                .await
                .map_err(write_err(&tmp_dir))?;
        }
        tokio::fs::create_dir(&tmp_dir)
            .await
            .map_err(write_err(&tmp_dir))?;

        write_synced(&tmp_dir.join(SERVICES_FILE), &content)
            .await
            .map_err(write_err(&tmp_dir))?;
        write_synced(&tmp_dir.join(CHECKSUM_FILE), format!("{}\n", checksum).as_bytes())
            .await
            .map_err(write_err(&tmp_dir))?;

        tokio::fs::rename(&tmp_dir, &final_dir)
            .await
            .map_err(write_err(&final_dir))?;

        Ok(ConfigSnapshot {
            id,
            created_at,
            checksum,
            path: final_dir,
            descriptors: descriptors.to_vec(),
        })
    }

    async fn save_state_logged(&self, states: &BTreeMap<String, SavedServiceState>) {
        let services: Vec<SavedServiceState> = states.values().cloned().collect();
        if let Err(e) = self.save_state(&services).await {
            log::error!("{}", e);
        }
    }

    /// Replace `state.json`, keeping the previous file as the backup
    pub async fn save_state(&self, services: &[SavedServiceState]) -> Result<()> {
        let path = self.root.join(STATE_FILE);
        let write_err = |source: std::io::Error| OrchestratorError::ArchiveWrite {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(write_err)?;
        let document = StateDocument {
            version: STATE_VERSION.to_string(),
            saved_at: Utc::now().to_rfc3339(),
            services: services.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| write_err(std::io::Error::other(e)))?;

        match tokio::fs::copy(&path, self.root.join(STATE_BACKUP_FILE)).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_err(e)),
        }

        let tmp = self.root.join(format!("{}.tmp", STATE_FILE));
        write_synced(&tmp, &content).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
        Ok(())
    }

    /// Read the saved runtime state, falling back to the backup when
    /// `state.json` is missing or unreadable. Empty when neither is usable.
    pub async fn load_state(&self) -> Vec<SavedServiceState> {
        for file in [STATE_FILE, STATE_BACKUP_FILE] {
            let path = self.root.join(file);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    log::warn!("Cannot read {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<StateDocument>(&content) {
                Ok(document) => {
                    log::debug!(
                        "Loaded state of {} services from {} (saved {})",
                        document.services.len(),
                        file,
                        document.saved_at
                    );
                    return document.services;
                }
                Err(e) => log::warn!("Ignoring malformed {}: {}", path.display(), e),
            }
        }
        Vec::new()
    }

    /// Timestamp id, suffixed with `-N` when the millisecond is taken
    async fn unused_id(&self, created_at: &DateTime<Utc>) -> String {
        let base = created_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        let mut id = base.clone();
        let mut n = 0;
        while tokio::fs::try_exists(self.root.join(&id)).await.unwrap_or(false) {
            n += 1;
            id = format!("{}-{}", base, n);
        }
        id
    }

    /// Snapshot ids, oldest first
    pub async fn list_snapshots(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::ArchiveWrite {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };

        let mut ids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort_by_key(|id| sort_key(id));
        Ok(ids)
    }

    /// Most recent snapshot id
    pub async fn latest_snapshot(&self) -> Result<Option<String>> {
        Ok(self.list_snapshots().await?.pop())
    }

    /// Read and verify a snapshot.
    ///
    /// Fails with `RestoreValidation` when the snapshot is missing, its
    /// checksum does not match, or it holds an invalid descriptor set.
    pub async fn restore(&self, id: &str) -> Result<ConfigSnapshot> {
        let invalid = |reason: String| OrchestratorError::RestoreValidation {
            snapshot: id.to_string(),
            reason,
        };

        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(invalid("invalid snapshot id".to_string()));
        }

        let dir = self.root.join(id);
        let content = tokio::fs::read(dir.join(SERVICES_FILE))
            .await
            .map_err(|e| invalid(format!("cannot read {}: {}", SERVICES_FILE, e)))?;
        let expected = tokio::fs::read_to_string(dir.join(CHECKSUM_FILE))
            .await
            .map_err(|e| invalid(format!("cannot read {}: {}", CHECKSUM_FILE, e)))?;

        let actual = hex::encode(Sha256::digest(&content));
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            log::error!("Snapshot {} failed checksum verification", id);
            return Err(invalid("checksum mismatch".to_string()));
        }

        let document: SnapshotDocument = serde_json::from_slice(&content)
            .map_err(|e| invalid(format!("malformed {}: {}", SERVICES_FILE, e)))?;

        EcosystemFile::new(document.services.clone())
            .validate()
            .map_err(|e| invalid(e.to_string()))?;

        let created_at = DateTime::parse_from_rfc3339(&document.created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| invalid(format!("invalid timestamp: {}", e)))?;

        Ok(ConfigSnapshot {
            id: id.to_string(),
            created_at,
            checksum: actual,
            path: dir,
            descriptors: document.services,
        })
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

/// Order `base-N` suffixes numerically after `base`
fn sort_key(id: &str) -> (String, u32) {
    match id.split_once('-') {
        Some((base, n)) => (base.to_string(), n.parse().unwrap_or(u32::MAX)),
        None => (id.to_string(), 0),
    }
}
