//! Kernel discovery.
//!
//! Finders enumerate candidate connections from one source each (local
//! kernelspecs, the active interpreter, a remote server snapshot). A discovery
//! pass merges their results into the [`ControllerRegistry`], which notifies
//! subscribers of what was added or removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify_debouncer_mini::DebounceEventResult;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::connection::{KernelConnectionMetadata, KernelSpec, LiveKernelModel};
use crate::interpreter::InterpreterService;
use crate::registry::{ControllerRegistry, RegistryChange};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to read remote snapshot {path}: {source}")]
    SnapshotIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid remote snapshot {path}: {source}")]
    SnapshotParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One source of candidate connections.
#[async_trait]
pub trait KernelFinder: Send + Sync {
    fn name(&self) -> &str;

    async fn list_connections(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<KernelConnectionMetadata>>;
}

/// Kernelspecs installed in the local Jupyter data directories.
#[derive(Debug, Default)]
pub struct LocalKernelspecFinder;

/// Interpreter path a python kernelspec launches, if its argv names one.
fn python_argv_interpreter(argv: &[String]) -> Option<PathBuf> {
    let program = Path::new(argv.first()?);
    let file_name = program.file_name()?.to_string_lossy().to_lowercase();
    (program.is_absolute() && file_name.contains("python")).then(|| program.to_path_buf())
}

#[async_trait]
impl KernelFinder for LocalKernelspecFinder {
    fn name(&self) -> &str {
        "kernelspecs"
    }

    async fn list_connections(
        &self,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<KernelConnectionMetadata>> {
        let specs = runtimelib::list_kernelspecs().await;
        Ok(specs
            .into_iter()
            .map(|s| {
                let interpreter_path = python_argv_interpreter(&s.kernelspec.argv);
                KernelConnectionMetadata::local_kernelspec(KernelSpec {
                    name: s.kernel_name,
                    display_name: s.kernelspec.display_name,
                    language: s.kernelspec.language,
                    argv: s.kernelspec.argv,
                    spec_dir: Some(s.path),
                    interpreter_path,
                })
            })
            .collect())
    }
}

/// The active Python interpreter as a connection.
pub struct InterpreterFinder {
    interpreters: Arc<dyn InterpreterService>,
}

impl InterpreterFinder {
    pub fn new(interpreters: Arc<dyn InterpreterService>) -> Self {
        Self { interpreters }
    }
}

#[async_trait]
impl KernelFinder for InterpreterFinder {
    fn name(&self) -> &str {
        "interpreters"
    }

    async fn list_connections(
        &self,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<KernelConnectionMetadata>> {
        Ok(self
            .interpreters
            .active_interpreter(None)
            .await
            .map(KernelConnectionMetadata::python_interpreter)
            .into_iter()
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotKernelspec {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    argv: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotSession {
    id: String,
    name: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    execution_state: Option<String>,
}

/// What a Jupyter server reports: its kernelspecs and running kernels.
#[derive(Debug, Deserialize)]
struct ServerSnapshot {
    server_id: String,
    base_url: String,
    #[serde(default)]
    kernelspecs: Vec<SnapshotKernelspec>,
    #[serde(default)]
    sessions: Vec<SnapshotSession>,
}

impl ServerSnapshot {
    fn into_connections(self) -> Vec<KernelConnectionMetadata> {
        let mut connections = Vec::with_capacity(self.kernelspecs.len() + self.sessions.len());
        for spec in self.kernelspecs {
            connections.push(KernelConnectionMetadata::remote_kernelspec(
                &self.server_id,
                &self.base_url,
                KernelSpec {
                    display_name: spec.display_name.unwrap_or_else(|| spec.name.clone()),
                    name: spec.name,
                    language: spec.language,
                    argv: spec.argv,
                    spec_dir: None,
                    interpreter_path: None,
                },
            ));
        }
        for session in self.sessions {
            connections.push(KernelConnectionMetadata::live_remote_kernel(
                &self.server_id,
                &self.base_url,
                LiveKernelModel {
                    id: session.id,
                    display_name: session.display_name,
                    name: session.name,
                    language: session.language,
                    execution_state: session.execution_state,
                },
            ));
        }
        connections
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Servers(Vec<ServerSnapshot>),
    Server(ServerSnapshot),
}

/// Remote kernelspecs and live sessions read from a JSON snapshot of one or
/// more servers. Stands in for querying the server's REST API.
#[derive(Debug, Clone)]
pub struct RemoteSnapshotFinder {
    path: PathBuf,
}

impl RemoteSnapshotFinder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> Result<Vec<KernelConnectionMetadata>, DiscoveryError> {
        let path = self.path.display().to_string();
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DiscoveryError::SnapshotIo {
                path: path.clone(),
                source,
            })?;
        let snapshot: SnapshotFile = serde_json::from_str(&contents)
            .map_err(|source| DiscoveryError::SnapshotParse { path, source })?;
        Ok(match snapshot {
            SnapshotFile::Server(server) => server.into_connections(),
            SnapshotFile::Servers(servers) => servers
                .into_iter()
                .flat_map(ServerSnapshot::into_connections)
                .collect(),
        })
    }
}

#[async_trait]
impl KernelFinder for RemoteSnapshotFinder {
    fn name(&self) -> &str {
        "remote-snapshot"
    }

    async fn list_connections(
        &self,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<KernelConnectionMetadata>> {
        Ok(self.read().await?)
    }
}

/// Runs finders and publishes their combined results to the registry.
pub struct KernelDiscovery {
    finders: Vec<Box<dyn KernelFinder>>,
    registry: Arc<ControllerRegistry>,
}

impl KernelDiscovery {
    pub fn new(registry: Arc<ControllerRegistry>) -> Self {
        Self {
            finders: Vec::new(),
            registry,
        }
    }

    pub fn with_finder(mut self, finder: impl KernelFinder + 'static) -> Self {
        self.finders.push(Box::new(finder));
        self
    }

    /// Run every finder once and apply the result.
    ///
    /// Finders run in registration order; on duplicate ids the first finder
    /// wins. A failing finder is logged and skipped. Returns `None` without
    /// touching the registry if `cancel` fires.
    pub async fn discover(&self, cancel: &CancellationToken) -> Option<RegistryChange> {
        let mut connections: Vec<KernelConnectionMetadata> = Vec::new();
        for finder in &self.finders {
            let found = tokio::select! {
                _ = cancel.cancelled() => return None,
                found = finder.list_connections(cancel) => found,
            };
            match found {
                Ok(found) => {
                    debug!("[discovery] {} found {} connection(s)", finder.name(), found.len());
                    for connection in found {
                        if !connections.iter().any(|c| c.id() == connection.id()) {
                            connections.push(connection);
                        }
                    }
                }
                Err(e) => warn!("[discovery] {} failed: {:#}", finder.name(), e),
            }
        }
        if cancel.is_cancelled() {
            return None;
        }

        let change = self.registry.set_connections(connections);
        self.registry.mark_loaded();
        Some(change)
    }
}

/// Jupyter data directories that may contain a `kernels/` folder.
pub fn default_kernelspec_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if let Ok(jupyter_path) = std::env::var("JUPYTER_PATH") {
        dirs_out.extend(std::env::split_paths(&jupyter_path).map(|p| p.join("kernels")));
    }
    if let Some(data) = dirs::data_dir() {
        dirs_out.push(data.join("jupyter").join("kernels"));
    }
    if let Some(home) = dirs::home_dir() {
        dirs_out.push(home.join(".local/share/jupyter/kernels"));
    }
    dirs_out.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
    dirs_out.push(PathBuf::from("/usr/share/jupyter/kernels"));
    dirs_out.dedup();
    dirs_out
}

/// Re-run discovery whenever a kernelspec directory changes, until `cancel`
/// fires.
///
/// Directories that don't exist are skipped. Returns immediately if none of
/// them could be watched.
pub async fn watch_kernelspec_dirs(
    dirs_to_watch: Vec<PathBuf>,
    discovery: Arc<KernelDiscovery>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<DebounceEventResult>(16);

    let debouncer_result = notify_debouncer_mini::new_debouncer(
        Duration::from_millis(500),
        move |res: DebounceEventResult| {
            let _ = tx.blocking_send(res);
        },
    );
    let mut debouncer = match debouncer_result {
        Ok(d) => d,
        Err(e) => {
            error!("[kernelspec-watch] Failed to create file watcher: {}", e);
            return;
        }
    };

    let mut watched = 0;
    for dir in dirs_to_watch.iter().filter(|d| d.is_dir()) {
        match debouncer
            .watcher()
            .watch(dir, notify::RecursiveMode::Recursive)
        {
            Ok(()) => watched += 1,
            Err(e) => warn!("[kernelspec-watch] Failed to watch {:?}: {}", dir, e),
        }
    }
    if watched == 0 {
        warn!("[kernelspec-watch] No kernelspec directories to watch");
        return;
    }
    info!("[kernelspec-watch] Watching {} kernelspec dir(s)", watched);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(Ok(events)) => {
                    debug!("[kernelspec-watch] {} change(s), rediscovering", events.len());
                    discovery.discover(&cancel).await;
                }
                Some(Err(e)) => warn!("[kernelspec-watch] Watch error: {:?}", e),
                None => break,
            },
        }
    }
    info!("[kernelspec-watch] Stopped");
}
