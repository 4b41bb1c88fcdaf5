//! Controller registry.
//!
//! Holds every known kernel connection (in discovery order) and the
//! controllers materialized for them. Controllers are created lazily, on the
//! first `add_or_update` for a (connection, view type) pair.
//!
//! Changes to the set of known connections are broadcast as
//! [`RegistryChange`] so the preferred service can re-run its search for open
//! documents. Superseding a connection with an equal id is not a change.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::{broadcast, watch};

use crate::connection::KernelConnectionMetadata;
use crate::controller::{controller_id, Controller};
use crate::metadata::ViewType;

/// Connections added to or removed from the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryChange {
    pub added: Vec<Arc<KernelConnectionMetadata>>,
    /// Ids of connections that are gone.
    pub removed: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    connections: Vec<Arc<KernelConnectionMetadata>>,
    controllers: HashMap<String, Arc<Controller>>,
    /// Controller ids in creation order.
    controller_order: Vec<String>,
    /// Connection ids that survive discovery passes that don't report them.
    active_interpreters: HashSet<String>,
}

impl RegistryState {
    fn position(&self, connection_id: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.id() == connection_id)
    }

    fn supersede(&mut self, connection: Arc<KernelConnectionMetadata>) {
        for view_type in ViewType::ALL {
            if let Some(controller) = self.controllers.get(&controller_id(connection.id(), view_type)) {
                controller.replace_connection(connection.clone());
            }
        }
    }

    fn drop_controllers(&mut self, connection_id: &str) {
        for view_type in ViewType::ALL {
            let id = controller_id(connection_id, view_type);
            if self.controllers.remove(&id).is_some() {
                self.controller_order.retain(|c| c != &id);
            }
        }
    }
}

/// Registry of kernel connections and their controllers.
pub struct ControllerRegistry {
    state: Mutex<RegistryState>,
    changes: broadcast::Sender<RegistryChange>,
    loaded: watch::Sender<bool>,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        let (loaded, _) = watch::channel(false);
        Self {
            state: Mutex::new(RegistryState::default()),
            changes,
            loaded,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, change: RegistryChange) {
        if change.is_empty() {
            return;
        }
        debug!(
            "[registry] {} connection(s) added, {} removed",
            change.added.len(),
            change.removed.len()
        );
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Every known connection, in discovery order.
    pub fn all(&self) -> Vec<Arc<KernelConnectionMetadata>> {
        self.lock().connections.clone()
    }

    /// Every materialized controller, in creation order.
    pub fn registered(&self) -> Vec<Arc<Controller>> {
        let state = self.lock();
        state
            .controller_order
            .iter()
            .filter_map(|id| state.controllers.get(id).cloned())
            .collect()
    }

    pub fn get(&self, connection_id: &str, view_type: ViewType) -> Option<Arc<Controller>> {
        self.lock()
            .controllers
            .get(&controller_id(connection_id, view_type))
            .cloned()
    }

    /// Register (or supersede) a connection and make sure it has a controller
    /// for each requested view type. Returns those controllers in the order of
    /// `view_types`.
    pub fn add_or_update(
        &self,
        connection: KernelConnectionMetadata,
        view_types: &[ViewType],
    ) -> Vec<Arc<Controller>> {
        let connection = Arc::new(connection);
        let mut change = RegistryChange::default();

        let controllers: Vec<Arc<Controller>> = {
            let mut state = self.lock();
            match state.position(connection.id()) {
                Some(i) => {
                    state.connections[i] = connection.clone();
                    state.supersede(connection.clone());
                }
                None => {
                    state.connections.push(connection.clone());
                    change.added.push(connection.clone());
                }
            }

            view_types
                .iter()
                .map(|view_type| {
                    let id = controller_id(connection.id(), *view_type);
                    if let Some(existing) = state.controllers.get(&id) {
                        return existing.clone();
                    }
                    debug!("[registry] Creating controller {}", id);
                    let controller = Arc::new(Controller::new(connection.clone(), *view_type));
                    state.controllers.insert(id.clone(), controller.clone());
                    state.controller_order.push(id);
                    controller
                })
                .collect()
        };

        self.notify(change);
        controllers
    }

    /// Apply one discovery pass.
    ///
    /// New connections are appended, known ones superseded, and connections
    /// the pass no longer reports are removed together with their controllers,
    /// unless they are tracked active-interpreter connections.
    pub fn set_connections(&self, discovered: Vec<KernelConnectionMetadata>) -> RegistryChange {
        let mut change = RegistryChange::default();

        {
            let mut state = self.lock();
            let mut next: Vec<Arc<KernelConnectionMetadata>> = Vec::with_capacity(discovered.len());
            let mut seen = HashSet::new();

            for connection in discovered {
                if !seen.insert(connection.id().to_string()) {
                    continue;
                }
                let connection = Arc::new(connection);
                if state.position(connection.id()).is_some() {
                    state.supersede(connection.clone());
                } else {
                    change.added.push(connection.clone());
                }
                next.push(connection);
            }

            let previous = std::mem::take(&mut state.connections);
            for old in previous {
                if seen.contains(old.id()) {
                    continue;
                }
                if state.active_interpreters.contains(old.id()) {
                    next.push(old);
                    continue;
                }
                state.drop_controllers(old.id());
                change.removed.push(old.id().to_string());
            }

            state.connections = next;
        }

        if !change.is_empty() {
            info!(
                "[registry] Discovery pass: +{} -{} connection(s)",
                change.added.len(),
                change.removed.len()
            );
        }
        self.notify(change.clone());
        change
    }

    /// Keep these controllers' connections alive across discovery passes.
    pub fn track_active_interpreter_controllers(&self, controllers: &[Arc<Controller>]) {
        let mut state = self.lock();
        for controller in controllers {
            state.active_interpreters.insert(controller.connection_id());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// Mark the first discovery pass as complete.
    pub fn mark_loaded(&self) {
        self.loaded.send_replace(true);
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once the first discovery pass has completed.
    pub async fn loaded(&self) {
        let mut rx = self.loaded.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|loaded| *loaded).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{KernelSpec, PythonInterpreter};

    fn spec_conn(id: &str, name: &str) -> KernelConnectionMetadata {
        KernelConnectionMetadata::LocalKernelSpec {
            id: id.to_string(),
            kernel_spec: KernelSpec {
                name: name.to_string(),
                display_name: name.to_string(),
                language: "python".to_string(),
                argv: vec![],
                spec_dir: None,
                interpreter_path: None,
            },
        }
    }

    #[test]
    fn test_add_or_update_is_idempotent() {
        let registry = ControllerRegistry::new();
        let first = registry.add_or_update(spec_conn("a", "python3"), &[ViewType::JupyterNotebookView]);
        let second = registry.add_or_update(spec_conn("a", "python3"), &[ViewType::JupyterNotebookView]);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.registered().len(), 1);
    }

    #[test]
    fn test_controllers_per_view_type() {
        let registry = ControllerRegistry::new();
        let controllers = registry.add_or_update(spec_conn("a", "python3"), &ViewType::ALL);
        assert_eq!(controllers.len(), 2);
        assert_eq!(controllers[0].view_type(), ViewType::JupyterNotebookView);
        assert_eq!(controllers[1].view_type(), ViewType::InteractiveWindowView);
        assert!(registry.get("a", ViewType::InteractiveWindowView).is_some());
        assert!(registry.get("b", ViewType::JupyterNotebookView).is_none());
    }

    #[test]
    fn test_set_connections_supersedes_and_removes() {
        let registry = ControllerRegistry::new();
        registry.set_connections(vec![spec_conn("a", "python3"), spec_conn("b", "old")]);
        let controller = registry.add_or_update(spec_conn("b", "old"), &[ViewType::JupyterNotebookView]);

        let change = registry.set_connections(vec![spec_conn("b", "renamed"), spec_conn("c", "new")]);
        assert_eq!(change.removed, vec!["a".to_string()]);
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.added[0].id(), "c");

        // Superseded connection flows through to the existing controller.
        assert_eq!(controller[0].connection().kernelspec_name(), Some("renamed"));
        let ids: Vec<_> = registry.all().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_removed_connections_lose_controllers() {
        let registry = ControllerRegistry::new();
        registry.add_or_update(spec_conn("a", "python3"), &[ViewType::JupyterNotebookView]);
        registry.set_connections(vec![]);
        assert!(registry.get("a", ViewType::JupyterNotebookView).is_none());
        assert!(registry.registered().is_empty());
    }

    #[test]
    fn test_active_interpreters_survive_discovery() {
        let registry = ControllerRegistry::new();
        let conn = KernelConnectionMetadata::python_interpreter(PythonInterpreter::new("/usr/bin/python3"));
        let id = conn.id().to_string();
        let controllers = registry.add_or_update(conn, &[ViewType::JupyterNotebookView]);
        registry.track_active_interpreter_controllers(&controllers);

        let change = registry.set_connections(vec![spec_conn("a", "python3")]);
        assert!(change.removed.is_empty());
        assert!(registry.get(&id, ViewType::JupyterNotebookView).is_some());
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let registry = ControllerRegistry::new();
        let mut rx = registry.subscribe();

        registry.add_or_update(spec_conn("a", "python3"), &[ViewType::JupyterNotebookView]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.added[0].id(), "a");

        // Re-adding a known connection is silent.
        registry.add_or_update(spec_conn("a", "python3"), &[ViewType::InteractiveWindowView]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loaded_resolves_after_mark() {
        let registry = Arc::new(ControllerRegistry::new());
        assert!(!registry.is_loaded());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.loaded().await })
        };
        registry.mark_loaded();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_loaded());
    }
}
