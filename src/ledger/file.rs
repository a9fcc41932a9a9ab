//! File-backed ledger shared by independent stage processes.
//!
//! Layout under the ledger root:
//!
//! ```text
//! <root>/
//!   services.json            registry documents (see `publish_registry`)
//!   experiments/
//!     <encoded id>.json      one committed node per file
//!     .tmp-*                 in-flight commits, never read
//! ```
//!
//! A commit writes the node to a uniquely named temp file, syncs it, and
//! hard-links it to its final name. `link` refuses to replace an existing
//! name, so across processes exactly one writer per id wins, and a reader
//! can never observe a partially written node.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

use super::{ExperimentNode, Ledger};
use crate::registry::Registry;
use crate::{Error, Result};

const EXPERIMENTS_DIR: &str = "experiments";
const REGISTRY_FILE: &str = "services.json";
const NODE_EXTENSION: &str = ".json";
const TEMP_PREFIX: &str = ".tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Durable ledger rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
    experiments: PathBuf,
}

impl FileLedger {
    /// Open (creating if needed) a ledger rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the root cannot be created
    /// or is not a directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let experiments = root.join(EXPERIMENTS_DIR);
        tokio::fs::create_dir_all(&experiments).await.map_err(|e| {
            Error::StorageUnavailable(format!("cannot open ledger at {}: {e}", root.display()))
        })?;
        tracing::debug!(root = %root.display(), "file ledger opened");
        Ok(Self { root, experiments })
    }

    /// Ledger root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the published registry documents.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Publish registry documents so every stage process loads the same schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the documents cannot be written.
    pub async fn publish_registry(&self, registry: &Registry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&registry.to_documents())?;
        let temp = temp_path(&self.root, REGISTRY_FILE);
        write_synced(&temp, &bytes).await?;
        tokio::fs::rename(&temp, self.registry_path()).await?;
        Ok(())
    }

    /// Load the published registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no registry was published or it is invalid.
    pub async fn load_registry(&self) -> Result<Registry> {
        let path = self.registry_path();
        let json = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::Config(format!("cannot read registry {}: {e}", path.display()))
        })?;
        Registry::from_json(&json)
    }

    fn node_path(&self, id: &str) -> PathBuf {
        self.experiments
            .join(format!("{}{NODE_EXTENSION}", encode_id(id)))
    }

    async fn commit_via(&self, temp: &Path, node: &ExperimentNode) -> Result<()> {
        let target = self.node_path(node.id());
        let bytes = serde_json::to_vec_pretty(node)?;

        if let Err(e) = write_synced(temp, &bytes).await {
            // An existing temp file belongs to another writer.
            if e.kind() != ErrorKind::AlreadyExists {
                let _ = tokio::fs::remove_file(temp).await;
            }
            return Err(e.into());
        }

        let linked = tokio::fs::hard_link(temp, &target).await;
        // The temp name is private to this call; losing it only leaves litter.
        let _ = tokio::fs::remove_file(temp).await;

        match linked {
            Ok(()) => {
                tracing::debug!(id = node.id(), path = %target.display(), "node committed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::DuplicateId {
                id: node.id().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(dir: &Path, name: &str) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{TEMP_PREFIX}{name}-{}-{seq}", std::process::id()))
}

impl Ledger for FileLedger {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.node_path(id)).await?)
    }

    async fn create_node(&self, node: ExperimentNode) -> Result<()> {
        let temp = temp_path(&self.experiments, &encode_id(node.id()));
        self.commit_via(&temp, &node).await
    }

    async fn get_node(&self, id: &str) -> Result<ExperimentNode> {
        let bytes = match tokio::fs::read(self.node_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound { id: id.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::CorruptLedger(format!("node '{id}' is unreadable: {e}")))
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.experiments).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Some(stem) = name.strip_suffix(NODE_EXTENSION) {
                if let Some(id) = decode_id(stem) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Encode an arbitrary id as a portable file stem.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`. The mapping is injective, so distinct ids never share a file.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
