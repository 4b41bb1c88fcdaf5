//! Remembered live remote kernels, per notebook.
//!
//! When a notebook was last attached to a live kernel on a remote server, the
//! kernel id is persisted keyed by the notebook URI. On reopen, a live session
//! with that id outranks every kernelspec-based candidate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Most recent entries kept in the persisted list.
pub const MAX_REMEMBERED_KERNELS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum RemoteKernelIdError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize remembered kernel ids: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait PreferredRemoteKernelIdProvider: Send + Sync {
    async fn get_preferred_remote_kernel_id(&self, uri: &str) -> Option<String>;

    /// Remember `kernel_id` for `uri`; `None` forgets it.
    async fn store_preferred_remote_kernel_id(
        &self,
        uri: &str,
        kernel_id: Option<&str>,
    ) -> Result<(), RemoteKernelIdError>;
}

/// Non-persistent provider.
#[derive(Default)]
pub struct InMemoryRemoteKernelIdStore {
    entries: StdMutex<HashMap<String, String>>,
}

impl InMemoryRemoteKernelIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferredRemoteKernelIdProvider for InMemoryRemoteKernelIdStore {
    async fn get_preferred_remote_kernel_id(&self, uri: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
    }

    async fn store_preferred_remote_kernel_id(
        &self,
        uri: &str,
        kernel_id: Option<&str>,
    ) -> Result<(), RemoteKernelIdError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match kernel_id {
            Some(id) => {
                entries.insert(uri.to_string(), id.to_string());
            }
            None => {
                entries.remove(uri);
            }
        }
        Ok(())
    }
}

/// One persisted association.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteKernelEntry {
    pub uri: String,
    pub kernel_id: String,
}

/// Provider persisted as a JSON list, newest first.
///
/// The file is read on first use. A missing or unreadable file starts an
/// empty list; the next store overwrites it.
pub struct JsonRemoteKernelIdStore {
    path: PathBuf,
    entries: Mutex<Option<Vec<RemoteKernelEntry>>>,
}

impl JsonRemoteKernelIdStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(None),
        }
    }

    async fn load(&self) -> Vec<RemoteKernelEntry> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("[remote-kernels] Cannot read {:?}: {}", self.path, e);
                return Vec::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[remote-kernels] Ignoring corrupt {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    async fn persist(&self, entries: &[RemoteKernelEntry]) -> Result<(), RemoteKernelIdError> {
        let io_err = |source| RemoteKernelIdError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, json).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl PreferredRemoteKernelIdProvider for JsonRemoteKernelIdStore {
    async fn get_preferred_remote_kernel_id(&self, uri: &str) -> Option<String> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await);
        }
        guard
            .as_ref()
            .and_then(|entries| entries.iter().find(|e| e.uri == uri))
            .map(|e| e.kernel_id.clone())
    }

    async fn store_preferred_remote_kernel_id(
        &self,
        uri: &str,
        kernel_id: Option<&str>,
    ) -> Result<(), RemoteKernelIdError> {
        let mut guard = self.entries.lock().await;
        let mut entries = match guard.take() {
            Some(entries) => entries,
            None => self.load().await,
        };

        entries.retain(|e| e.uri != uri);
        if let Some(id) = kernel_id {
            entries.insert(
                0,
                RemoteKernelEntry {
                    uri: uri.to_string(),
                    kernel_id: id.to_string(),
                },
            );
        }
        entries.truncate(MAX_REMEMBERED_KERNELS);

        let result = self.persist(&entries).await;
        debug!(
            "[remote-kernels] {} remembered kernel(s) after update for {}",
            entries.len(),
            uri
        );
        *guard = Some(entries);
        result
    }
}
