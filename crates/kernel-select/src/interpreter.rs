//! Python interpreter discovery.
//!
//! The default controller needs "the active interpreter" for a resource. The
//! [`InterpreterService`] trait is the seam; [`EnvironmentInterpreterService`]
//! resolves it the way a shell would (activated venv, then activated conda
//! env, then `python3`/`python` on `PATH`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};

use crate::connection::PythonInterpreter;

#[async_trait]
pub trait InterpreterService: Send + Sync {
    /// Interpreter that should run kernels for `resource` (a document URI).
    async fn active_interpreter(&self, resource: Option<&str>) -> Option<PythonInterpreter>;

    /// Re-scan for interpreters.
    async fn refresh_interpreters(&self);
}

/// Always answers with the same interpreter (or none).
pub struct StaticInterpreterService {
    interpreter: Option<PythonInterpreter>,
}

impl StaticInterpreterService {
    pub fn new(interpreter: Option<PythonInterpreter>) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl InterpreterService for StaticInterpreterService {
    async fn active_interpreter(&self, _resource: Option<&str>) -> Option<PythonInterpreter> {
        self.interpreter.clone()
    }

    async fn refresh_interpreters(&self) {}
}

/// Environment variables the scan looks at.
#[derive(Debug, Clone, Default)]
pub struct SearchEnv {
    pub virtual_env: Option<PathBuf>,
    pub conda_prefix: Option<PathBuf>,
    pub conda_env_name: Option<String>,
    pub path: Option<OsString>,
}

impl SearchEnv {
    pub fn from_process() -> Self {
        Self {
            virtual_env: std::env::var_os("VIRTUAL_ENV").map(PathBuf::from),
            conda_prefix: std::env::var_os("CONDA_PREFIX").map(PathBuf::from),
            conda_env_name: std::env::var("CONDA_DEFAULT_ENV").ok(),
            path: std::env::var_os("PATH"),
        }
    }
}

/// Resolves the active interpreter from the process environment.
///
/// The result is cached until [`InterpreterService::refresh_interpreters`].
pub struct EnvironmentInterpreterService {
    fixed_env: Option<SearchEnv>,
    cache: Mutex<Option<Option<PythonInterpreter>>>,
}

impl Default for EnvironmentInterpreterService {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentInterpreterService {
    /// Reads the process environment on every scan.
    pub fn new() -> Self {
        Self {
            fixed_env: None,
            cache: Mutex::new(None),
        }
    }

    /// Scans a fixed environment instead of the process one.
    pub fn with_env(env: SearchEnv) -> Self {
        Self {
            fixed_env: Some(env),
            cache: Mutex::new(None),
        }
    }

    fn scan(&self) -> Option<PythonInterpreter> {
        let env = self.fixed_env.clone().unwrap_or_else(SearchEnv::from_process);
        let found = find_active_interpreter(&env);
        match &found {
            Some(interpreter) => info!(
                "[interpreter] Active interpreter: {}",
                interpreter.path.display()
            ),
            None => info!("[interpreter] No Python interpreter found"),
        }
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(found.clone());
        found
    }
}

#[async_trait]
impl InterpreterService for EnvironmentInterpreterService {
    async fn active_interpreter(&self, _resource: Option<&str>) -> Option<PythonInterpreter> {
        let cached = self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match cached {
            Some(result) => result,
            None => self.scan(),
        }
    }

    async fn refresh_interpreters(&self) {
        debug!("[interpreter] Refreshing interpreters");
        self.scan();
    }
}

#[cfg(windows)]
fn env_python(prefix: &Path) -> Vec<PathBuf> {
    vec![prefix.join("Scripts").join("python.exe"), prefix.join("python.exe")]
}

#[cfg(not(windows))]
fn env_python(prefix: &Path) -> Vec<PathBuf> {
    vec![prefix.join("bin").join("python"), prefix.join("bin").join("python3")]
}

#[cfg(windows)]
const PATH_CANDIDATES: &[&str] = &["python3.exe", "python.exe"];

#[cfg(not(windows))]
const PATH_CANDIDATES: &[&str] = &["python3", "python"];

fn env_name(prefix: &Path) -> Option<String> {
    prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Activated venv, then activated conda env, then the first match on `PATH`.
pub fn find_active_interpreter(env: &SearchEnv) -> Option<PythonInterpreter> {
    if let Some(venv) = &env.virtual_env {
        if let Some(path) = env_python(venv).into_iter().find(|p| p.is_file()) {
            return Some(PythonInterpreter {
                path,
                env_name: env_name(venv),
                display_name: None,
                version: None,
            });
        }
    }

    if let Some(prefix) = &env.conda_prefix {
        if let Some(path) = env_python(prefix).into_iter().find(|p| p.is_file()) {
            return Some(PythonInterpreter {
                path,
                env_name: env.conda_env_name.clone().or_else(|| env_name(prefix)),
                display_name: None,
                version: None,
            });
        }
    }

    let path_var = env.path.as_ref()?;
    for dir in std::env::split_paths(path_var) {
        for candidate in PATH_CANDIDATES {
            let path = dir.join(candidate);
            if path.is_file() {
                return Some(PythonInterpreter::new(path));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[cfg(not(windows))]
    #[test]
    fn test_virtual_env_wins() {
        let temp = TempDir::new().unwrap();
        let venv = temp.path().join("myenv");
        touch(&venv.join("bin/python"));
        let bin = temp.path().join("usr/bin");
        touch(&bin.join("python3"));

        let env = SearchEnv {
            virtual_env: Some(venv.clone()),
            conda_prefix: None,
            conda_env_name: None,
            path: Some(bin.into_os_string()),
        };
        let found = find_active_interpreter(&env).unwrap();
        assert_eq!(found.path, venv.join("bin/python"));
        assert_eq!(found.env_name.as_deref(), Some("myenv"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_conda_env_name() {
        let temp = TempDir::new().unwrap();
        let prefix = temp.path().join("envs/science");
        touch(&prefix.join("bin/python"));

        let env = SearchEnv {
            virtual_env: None,
            conda_prefix: Some(prefix),
            conda_env_name: Some("science".to_string()),
            path: None,
        };
        let found = find_active_interpreter(&env).unwrap();
        assert_eq!(found.env_name.as_deref(), Some("science"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_path_search_order() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        touch(&first.join("python"));
        touch(&second.join("python3"));

        let path = std::env::join_paths([first.clone(), second]).unwrap();
        let env = SearchEnv {
            path: Some(path),
            ..Default::default()
        };
        // Directory order beats executable name order.
        assert_eq!(find_active_interpreter(&env).unwrap().path, first.join("python"));
    }

    #[test]
    fn test_nothing_found() {
        let temp = TempDir::new().unwrap();
        let env = SearchEnv {
            path: Some(temp.path().as_os_str().to_owned()),
            ..Default::default()
        };
        assert!(find_active_interpreter(&env).is_none());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_service_caches_until_refresh() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let service = EnvironmentInterpreterService::with_env(SearchEnv {
            path: Some(bin.clone().into_os_string()),
            ..Default::default()
        });

        assert!(service.active_interpreter(None).await.is_none());
        touch(&bin.join("python3"));
        assert!(service.active_interpreter(None).await.is_none());

        service.refresh_interpreters().await;
        assert_eq!(
            service.active_interpreter(None).await.unwrap().path,
            bin.join("python3")
        );
    }
}
