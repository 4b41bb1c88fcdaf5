//! The fallback controller for documents without usable kernel hints.
//!
//! Locally that is the active Python interpreter. Against a remote server it is
//! the best remote kernelspec: a remembered live session first, then a
//! kernelspec named like the notebook's, then `python`/`python3`, then one
//! running the notebook's language, then whatever was discovered first.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionKind, KernelConnectionMetadata, PythonInterpreter};
use crate::controller::Controller;
use crate::interpreter::InterpreterService;
use crate::language::KernelLanguage;
use crate::metadata::{NotebookDocument, ViewType};
use crate::registry::ControllerRegistry;
use crate::remote_kernel_ids::PreferredRemoteKernelIdProvider;
use crate::settings::{LaunchMode, SelectionSettings};

/// The default controller could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum DefaultControllerError {
    /// Local launches always need an interpreter; reaching this means
    /// interpreter discovery is broken in this environment.
    #[error("No active Python interpreter found for {resource}")]
    NoActiveInterpreter { resource: String },
}

/// Kernelspec names treated as "the Python kernel" on a remote server.
const PYTHON_KERNELSPEC_NAMES: &[&str] = &["python", "python3"];

pub struct ControllerDefaultService {
    registry: Arc<ControllerRegistry>,
    interpreters: Arc<dyn InterpreterService>,
    remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
    launch_mode: LaunchMode,
    web_only: bool,
}

impl ControllerDefaultService {
    pub fn new(
        registry: Arc<ControllerRegistry>,
        interpreters: Arc<dyn InterpreterService>,
        remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
        settings: &SelectionSettings,
    ) -> Self {
        Self {
            registry,
            interpreters,
            remote_kernel_ids,
            launch_mode: settings.launch_mode,
            web_only: settings.web_only,
        }
    }

    /// Default controller for `document` in `view_type`.
    ///
    /// `Ok(None)` means nothing is resolvable yet (remote discovery still in
    /// progress, web-only environment) or the search was cancelled.
    pub async fn compute_default_controller(
        &self,
        document: &NotebookDocument,
        view_type: ViewType,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Controller>>, DefaultControllerError> {
        match self.launch_mode {
            LaunchMode::Local => self.active_interpreter_controller(document, view_type, cancel).await,
            LaunchMode::Remote => Ok(self.remote_default_controller(document, view_type, cancel).await),
        }
    }

    async fn active_interpreter_controller(
        &self,
        document: &NotebookDocument,
        view_type: ViewType,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Controller>>, DefaultControllerError> {
        let resource = Some(document.uri.as_str());
        let mut interpreter = self.interpreters.active_interpreter(resource).await;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if interpreter.is_none() {
            debug!("[default-controller] No active interpreter, refreshing");
            self.interpreters.refresh_interpreters().await;
            if cancel.is_cancelled() {
                return Ok(None);
            }
            interpreter = self.interpreters.active_interpreter(resource).await;
            if cancel.is_cancelled() {
                return Ok(None);
            }
        }

        let connection = match interpreter {
            Some(interpreter) => self.interpreter_connection(interpreter),
            None => match self.first_registered_interpreter() {
                Some(connection) => {
                    info!(
                        "[default-controller] No active interpreter, using registered {}",
                        connection.id()
                    );
                    connection
                }
                None if self.web_only => {
                    debug!("[default-controller] No interpreter in web-only environment");
                    return Ok(None);
                }
                None => {
                    return Err(DefaultControllerError::NoActiveInterpreter {
                        resource: document.uri.clone(),
                    })
                }
            },
        };

        let controllers = self.registry.add_or_update(connection, &[view_type]);
        self.registry.track_active_interpreter_controllers(&controllers);
        Ok(controllers.into_iter().next())
    }

    /// Registered connection for `interpreter`, or a synthesized one.
    fn interpreter_connection(&self, interpreter: PythonInterpreter) -> KernelConnectionMetadata {
        let registered = self.registry.all().into_iter().find(|c| {
            c.kind() == ConnectionKind::StartUsingPythonInterpreter
                && c.interpreter_path() == Some(interpreter.path.as_path())
        });
        match registered {
            Some(connection) => (*connection).clone(),
            None => {
                debug!(
                    "[default-controller] Synthesizing connection for {}",
                    interpreter.path.display()
                );
                KernelConnectionMetadata::python_interpreter(interpreter)
            }
        }
    }

    fn first_registered_interpreter(&self) -> Option<KernelConnectionMetadata> {
        self.registry
            .all()
            .into_iter()
            .find(|c| c.kind() == ConnectionKind::StartUsingPythonInterpreter)
            .map(|c| (*c).clone())
    }

    async fn remote_default_controller(
        &self,
        document: &NotebookDocument,
        view_type: ViewType,
        cancel: &CancellationToken,
    ) -> Option<Arc<Controller>> {
        let remembered = self
            .remote_kernel_ids
            .get_preferred_remote_kernel_id(&document.uri)
            .await;
        if cancel.is_cancelled() {
            return None;
        }

        let all = self.registry.all();

        if let Some(kernel_id) = remembered {
            if let Some(live) = all
                .iter()
                .find(|c| c.live_kernel_id() == Some(kernel_id.as_str()))
            {
                debug!("[default-controller] Using remembered live kernel {}", kernel_id);
                return self.controller_for(live, view_type);
            }
        }

        let candidates: Vec<&Arc<KernelConnectionMetadata>> = all
            .iter()
            .filter(|c| c.kind() == ConnectionKind::StartUsingRemoteKernelSpec)
            .collect();
        if candidates.is_empty() {
            warn!(
                "[default-controller] No remote controllers registered yet for {}",
                document.uri
            );
            return None;
        }

        let metadata_name = document.metadata.as_ref().and_then(|m| m.kernelspec_name());
        let language = document
            .metadata
            .as_ref()
            .and_then(|m| m.language())
            .or_else(|| document.detected_language())
            .unwrap_or(KernelLanguage::Python);

        let chosen = metadata_name
            .and_then(|name| candidates.iter().find(|c| c.kernelspec_name() == Some(name)))
            .or_else(|| {
                candidates.iter().find(|c| {
                    c.kernelspec_name()
                        .is_some_and(|name| PYTHON_KERNELSPEC_NAMES.contains(&name))
                })
            })
            .or_else(|| candidates.iter().find(|c| c.language() == language))
            .or_else(|| candidates.first())
            .copied();

        chosen.and_then(|connection| self.controller_for(connection, view_type))
    }

    fn controller_for(
        &self,
        connection: &Arc<KernelConnectionMetadata>,
        view_type: ViewType,
    ) -> Option<Arc<Controller>> {
        self.registry
            .get(connection.id(), view_type)
            .or_else(|| {
                self.registry
                    .add_or_update((**connection).clone(), &[view_type])
                    .into_iter()
                    .next()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{KernelSpec, LiveKernelModel};
    use crate::interpreter::StaticInterpreterService;
    use crate::metadata::{KernelspecMetadata, NotebookMetadata};
    use crate::remote_kernel_ids::InMemoryRemoteKernelIdStore;

    fn remote_spec(name: &str, language: &str) -> KernelConnectionMetadata {
        KernelConnectionMetadata::remote_kernelspec(
            "srv",
            "http://localhost:8888",
            KernelSpec {
                name: name.to_string(),
                display_name: name.to_string(),
                language: language.to_string(),
                argv: vec![],
                spec_dir: None,
                interpreter_path: None,
            },
        )
    }

    fn service(
        registry: Arc<ControllerRegistry>,
        interpreter: Option<PythonInterpreter>,
        store: Arc<InMemoryRemoteKernelIdStore>,
        launch_mode: LaunchMode,
        web_only: bool,
    ) -> ControllerDefaultService {
        let settings = SelectionSettings {
            launch_mode,
            web_only,
            ..Default::default()
        };
        ControllerDefaultService::new(
            registry,
            Arc::new(StaticInterpreterService::new(interpreter)),
            store,
            &settings,
        )
    }

    fn notebook() -> NotebookDocument {
        NotebookDocument::new("file:///a.ipynb", ViewType::JupyterNotebookView)
    }

    #[tokio::test]
    async fn test_local_synthesizes_active_interpreter() {
        let registry = Arc::new(ControllerRegistry::new());
        let svc = service(
            registry.clone(),
            Some(PythonInterpreter::new("/usr/bin/python3")),
            Arc::new(InMemoryRemoteKernelIdStore::new()),
            LaunchMode::Local,
            false,
        );
        let controller = svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            controller.connection().kind(),
            ConnectionKind::StartUsingPythonInterpreter
        );
        assert_eq!(registry.all().len(), 1);

        // Tracked: survives a discovery pass that doesn't report it.
        registry.set_connections(vec![]);
        assert_eq!(registry.all().len(), 1);
    }

    #[tokio::test]
    async fn test_local_reuses_registered_interpreter_connection() {
        let registry = Arc::new(ControllerRegistry::new());
        registry.set_connections(vec![KernelConnectionMetadata::PythonInterpreter {
            id: "py1".to_string(),
            interpreter: PythonInterpreter::new("/usr/bin/python3"),
        }]);
        let svc = service(
            registry.clone(),
            Some(PythonInterpreter::new("/usr/bin/python3")),
            Arc::new(InMemoryRemoteKernelIdStore::new()),
            LaunchMode::Local,
            false,
        );
        let controller = svc
            .compute_default_controller(&notebook(), ViewType::InteractiveWindowView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.connection_id(), "py1");
        assert_eq!(controller.view_type(), ViewType::InteractiveWindowView);
    }

    #[tokio::test]
    async fn test_local_without_interpreter() {
        let registry = Arc::new(ControllerRegistry::new());
        let store = Arc::new(InMemoryRemoteKernelIdStore::new());

        let strict = service(registry.clone(), None, store.clone(), LaunchMode::Local, false);
        let err = strict
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DefaultControllerError::NoActiveInterpreter { .. }));

        let web = service(registry, None, store, LaunchMode::Local, true);
        assert!(web
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remote_prefers_python_named_kernelspec() {
        let registry = Arc::new(ControllerRegistry::new());
        registry.set_connections(vec![
            remote_spec("julia-1.10", "julia"),
            remote_spec("conda-env-py", "python"),
            remote_spec("python3", "python"),
        ]);
        let svc = service(registry, None, Arc::new(InMemoryRemoteKernelIdStore::new()), LaunchMode::Remote, false);
        let controller = svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.connection().kernelspec_name(), Some("python3"));
    }

    #[tokio::test]
    async fn test_remote_metadata_name_wins() {
        let registry = Arc::new(ControllerRegistry::new());
        registry.set_connections(vec![remote_spec("python3", "python"), remote_spec("ir", "r")]);
        let svc = service(registry, None, Arc::new(InMemoryRemoteKernelIdStore::new()), LaunchMode::Remote, false);
        let doc = notebook().with_metadata(NotebookMetadata {
            kernelspec: Some(KernelspecMetadata {
                name: "ir".to_string(),
                display_name: "R".to_string(),
                language: Some("R".to_string()),
            }),
            language_info: None,
            interpreter: None,
        });
        let controller = svc
            .compute_default_controller(&doc, ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.connection().kernelspec_name(), Some("ir"));
    }

    #[tokio::test]
    async fn test_remote_language_then_first() {
        let registry = Arc::new(ControllerRegistry::new());
        registry.set_connections(vec![remote_spec("scala", "scala"), remote_spec("julia-1.10", "julia")]);
        let svc = service(registry, None, Arc::new(InMemoryRemoteKernelIdStore::new()), LaunchMode::Remote, false);

        let julia_doc = notebook().with_cell_languages(["julia"]);
        let controller = svc
            .compute_default_controller(&julia_doc, ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.connection().kernelspec_name(), Some("julia-1.10"));

        let untyped = svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untyped.connection().kernelspec_name(), Some("scala"));
    }

    #[tokio::test]
    async fn test_remote_remembered_live_kernel_wins() {
        let registry = Arc::new(ControllerRegistry::new());
        registry.set_connections(vec![
            remote_spec("python3", "python"),
            KernelConnectionMetadata::live_remote_kernel(
                "srv",
                "http://localhost:8888",
                LiveKernelModel {
                    id: "k-1".to_string(),
                    name: "python3".to_string(),
                    language: Some("python".to_string()),
                    display_name: None,
                    execution_state: None,
                },
            ),
        ]);
        let store = Arc::new(InMemoryRemoteKernelIdStore::new());
        store
            .store_preferred_remote_kernel_id("file:///a.ipynb", Some("k-1"))
            .await
            .unwrap();
        let svc = service(registry, None, store, LaunchMode::Remote, false);
        let controller = svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.connection().live_kernel_id(), Some("k-1"));
    }

    #[tokio::test]
    async fn test_remote_empty_registry() {
        let svc = service(
            Arc::new(ControllerRegistry::new()),
            None,
            Arc::new(InMemoryRemoteKernelIdStore::new()),
            LaunchMode::Remote,
            false,
        );
        assert!(svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancelled_returns_none() {
        let token = CancellationToken::new();
        token.cancel();
        let svc = service(
            Arc::new(ControllerRegistry::new()),
            Some(PythonInterpreter::new("/usr/bin/python3")),
            Arc::new(InMemoryRemoteKernelIdStore::new()),
            LaunchMode::Local,
            false,
        );
        assert!(svc
            .compute_default_controller(&notebook(), ViewType::JupyterNotebookView, &token)
            .await
            .unwrap()
            .is_none());
    }
}
