//! Controllers: a kernel connection materialized for one view type.
//!
//! A controller carries per-document affinity, the hint an editor uses to
//! decide which kernel to pre-select. At most one controller should report
//! [`ControllerAffinity::Preferred`] for a given document; the preferred
//! service resets the old one before marking the new one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::connection::KernelConnectionMetadata;
use crate::metadata::ViewType;

/// Affinity of a controller for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerAffinity {
    #[default]
    Default,
    Preferred,
}

/// A kernel connection paired with a notebook view type.
#[derive(Debug)]
pub struct Controller {
    id: String,
    view_type: ViewType,
    connection: RwLock<Arc<KernelConnectionMetadata>>,
    affinities: RwLock<HashMap<String, ControllerAffinity>>,
}

impl Controller {
    pub fn new(connection: Arc<KernelConnectionMetadata>, view_type: ViewType) -> Self {
        Self {
            id: controller_id(connection.id(), view_type),
            view_type,
            connection: RwLock::new(connection),
            affinities: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    /// Current connection. Rediscovery may swap in a superseding value with
    /// the same id.
    pub fn connection(&self) -> Arc<KernelConnectionMetadata> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn connection_id(&self) -> String {
        self.connection().id().to_string()
    }

    pub(crate) fn replace_connection(&self, connection: Arc<KernelConnectionMetadata>) {
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = connection;
    }

    pub fn affinity(&self, document_uri: &str) -> ControllerAffinity {
        self.affinities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_uri)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_affinity(&self, document_uri: &str, affinity: ControllerAffinity) {
        let mut affinities = self.affinities.write().unwrap_or_else(|e| e.into_inner());
        match affinity {
            ControllerAffinity::Default => {
                affinities.remove(document_uri);
            }
            ControllerAffinity::Preferred => {
                affinities.insert(document_uri.to_string(), affinity);
            }
        }
    }

    /// Documents this controller is currently preferred for.
    pub fn preferred_documents(&self) -> Vec<String> {
        let mut docs: Vec<String> = self
            .affinities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, a)| **a == ControllerAffinity::Preferred)
            .map(|(uri, _)| uri.clone())
            .collect();
        docs.sort();
        docs
    }
}

/// Controller id for a connection/view-type pair.
pub fn controller_id(connection_id: &str, view_type: ViewType) -> String {
    match view_type {
        ViewType::JupyterNotebookView => connection_id.to_string(),
        ViewType::InteractiveWindowView => format!("{connection_id} (Interactive)"),
    }
}
