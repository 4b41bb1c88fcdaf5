//! kernel-select - Kernel connection ranking and preferred-kernel selection.
//!
//! Given a notebook document (with optional kernelspec / language_info
//! metadata) and the set of discovered kernel connections (local interpreters,
//! local kernelspecs, remote kernelspecs, live remote sessions), this crate
//! decides which connection is *preferred* for the notebook and keeps that
//! choice in sync as notebooks open and close, discovery passes add or remove
//! connections, and the user switches kernels.
//!
//! The pieces, leaf-first:
//!
//! - [`connection`]: the `KernelConnectionMetadata` sum type
//! - [`registry`]: controllers (connection + view type) and change notifications
//! - [`discovery`]: kernel finders that feed the registry
//! - [`ranking`]: orders candidates by how well they match notebook metadata
//! - [`default_controller`]: the fallback when metadata gives no hints
//! - [`preferred`]: the per-document orchestrator with cancellation

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub mod connection;
pub mod controller;
pub mod default_controller;
pub mod discovery;
pub mod interpreter;
pub mod language;
pub mod metadata;
pub mod preferred;
pub mod ranking;
pub mod registry;
pub mod remote_kernel_ids;
pub mod settings;

pub use connection::{ConnectionKind, KernelConnectionMetadata};
pub use controller::{Controller, ControllerAffinity};
pub use metadata::{NotebookDocument, NotebookMetadata, ViewType};
pub use preferred::{ControllerPreferredService, PreferredController};
pub use registry::ControllerRegistry;
pub use settings::{LaunchMode, SelectionSettings};

/// Hash an interpreter path the way notebooks record it in
/// `metadata.interpreter.hash`.
///
/// Returns the full lowercase hex SHA-256 of the path string.
pub fn interpreter_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// Short form of [`interpreter_hash`] used inside connection ids.
///
/// Returns the first 12 hex characters.
pub fn short_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(&hasher.finalize()[..6]) // 6 bytes = 12 hex chars
}

/// Base directory for persisted selection state.
///
/// `~/.cache/runt/kernel-select/`
pub fn state_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("runt")
        .join("kernel-select")
}

/// Default path of the persisted preferred-remote-kernel-id list.
pub fn default_remote_kernel_ids_path() -> PathBuf {
    state_dir().join("preferred-remote-kernels.json")
}

/// Path to the selection settings file.
pub fn settings_json_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-notebook")
        .join("kernel-selection.json")
}
