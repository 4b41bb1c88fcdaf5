//! Kernel connection metadata.
//!
//! A [`KernelConnectionMetadata`] describes one way to start or attach to a
//! kernel. Finders create them; they are never mutated afterwards. When a
//! later discovery pass finds the same connection again it produces a value
//! with the same `id`, which supersedes the old one in the registry.
//!
//! Serialized with a `kind` tag so remote snapshots and persisted state use the
//! same names the Jupyter tooling uses (`startUsingLocalKernelSpec`, ...).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::language::KernelLanguage;

/// Discriminant of [`KernelConnectionMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionKind {
    StartUsingLocalKernelSpec,
    StartUsingPythonInterpreter,
    StartUsingRemoteKernelSpec,
    ConnectToLiveRemoteKernel,
    StartUsingDefaultKernel,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionKind::StartUsingLocalKernelSpec => "startUsingLocalKernelSpec",
            ConnectionKind::StartUsingPythonInterpreter => "startUsingPythonInterpreter",
            ConnectionKind::StartUsingRemoteKernelSpec => "startUsingRemoteKernelSpec",
            ConnectionKind::ConnectToLiveRemoteKernel => "connectToLiveRemoteKernel",
            ConnectionKind::StartUsingDefaultKernel => "startUsingDefaultKernel",
        };
        f.write_str(s)
    }
}

/// A kernelspec as found on disk or reported by a Jupyter server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Kernel name (e.g. `"python3"`, `"julia-1.10"`).
    pub name: String,
    /// Human-readable display name (e.g. `"Python 3 (ipykernel)"`).
    pub display_name: String,
    /// Programming language (e.g. `"python"`).
    #[serde(default)]
    pub language: String,
    /// Launch command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,
    /// Directory holding `kernel.json`, for local kernelspecs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_dir: Option<PathBuf>,
    /// Interpreter the kernelspec launches, when it is a Python kernel with an
    /// absolute interpreter path in `argv[0]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_path: Option<PathBuf>,
}

/// A Python interpreter that can host an ipykernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonInterpreter {
    /// Absolute path to the interpreter executable.
    pub path: PathBuf,
    /// Environment name (venv directory name, conda env name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Interpreter version (e.g. `"3.11.5"`), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PythonInterpreter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_name: None,
            display_name: None,
            version: None,
        }
    }

    /// Label shown for the interpreter: display name, env name, or path.
    pub fn label(&self) -> String {
        if let Some(name) = &self.display_name {
            return name.clone();
        }
        match &self.env_name {
            Some(env) => format!("Python ({env})"),
            None => format!("Python ({})", self.path.display()),
        }
    }
}

/// A running kernel on a remote Jupyter server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveKernelModel {
    /// Server-assigned kernel id.
    pub id: String,
    /// Kernelspec name the kernel was started from.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Last reported execution state (`"idle"`, `"busy"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
}

/// One way to start or attach to a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum KernelConnectionMetadata {
    #[serde(rename = "startUsingLocalKernelSpec")]
    LocalKernelSpec { id: String, kernel_spec: KernelSpec },

    #[serde(rename = "startUsingPythonInterpreter")]
    PythonInterpreter {
        id: String,
        interpreter: PythonInterpreter,
    },

    #[serde(rename = "startUsingRemoteKernelSpec")]
    RemoteKernelSpec {
        id: String,
        kernel_spec: KernelSpec,
        server_id: String,
        base_url: String,
    },

    #[serde(rename = "connectToLiveRemoteKernel")]
    LiveRemoteKernel {
        id: String,
        kernel_model: LiveKernelModel,
        server_id: String,
        base_url: String,
    },

    #[serde(rename = "startUsingDefaultKernel")]
    DefaultKernel {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kernel_spec: Option<KernelSpec>,
    },
}

impl KernelConnectionMetadata {
    /// Local kernelspec connection. The id is derived from the kernel name and
    /// the directory it was found in, so two specs with the same name in
    /// different Jupyter data dirs stay distinct.
    pub fn local_kernelspec(kernel_spec: KernelSpec) -> Self {
        let location = kernel_spec
            .spec_dir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| kernel_spec.name.clone());
        let id = format!(
            "kernelspec:{}:{}",
            kernel_spec.name,
            crate::short_hash(&location)
        );
        Self::LocalKernelSpec { id, kernel_spec }
    }

    /// Interpreter-backed connection, keyed by the interpreter path hash.
    pub fn python_interpreter(interpreter: PythonInterpreter) -> Self {
        let hash = crate::interpreter_hash(&interpreter.path);
        let id = format!("python:{}", &hash[..12]);
        Self::PythonInterpreter { id, interpreter }
    }

    pub fn remote_kernelspec(
        server_id: impl Into<String>,
        base_url: impl Into<String>,
        kernel_spec: KernelSpec,
    ) -> Self {
        let server_id = server_id.into();
        let id = format!("remote:{}:{}", server_id, kernel_spec.name);
        Self::RemoteKernelSpec {
            id,
            kernel_spec,
            server_id,
            base_url: base_url.into(),
        }
    }

    pub fn live_remote_kernel(
        server_id: impl Into<String>,
        base_url: impl Into<String>,
        kernel_model: LiveKernelModel,
    ) -> Self {
        let server_id = server_id.into();
        let id = format!("live:{}:{}", server_id, kernel_model.id);
        Self::LiveRemoteKernel {
            id,
            kernel_model,
            server_id,
            base_url: base_url.into(),
        }
    }

    /// The server's (or local Jupyter's) default kernel.
    pub fn default_kernel(server_id: Option<String>) -> Self {
        let id = match &server_id {
            Some(server) => format!("default:{server}"),
            None => "default:local".to_string(),
        };
        Self::DefaultKernel {
            id,
            server_id,
            kernel_spec: None,
        }
    }

    /// Stable identifier, used for equality and as a cache key.
    pub fn id(&self) -> &str {
        match self {
            Self::LocalKernelSpec { id, .. }
            | Self::PythonInterpreter { id, .. }
            | Self::RemoteKernelSpec { id, .. }
            | Self::LiveRemoteKernel { id, .. }
            | Self::DefaultKernel { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::LocalKernelSpec { .. } => ConnectionKind::StartUsingLocalKernelSpec,
            Self::PythonInterpreter { .. } => ConnectionKind::StartUsingPythonInterpreter,
            Self::RemoteKernelSpec { .. } => ConnectionKind::StartUsingRemoteKernelSpec,
            Self::LiveRemoteKernel { .. } => ConnectionKind::ConnectToLiveRemoteKernel,
            Self::DefaultKernel { .. } => ConnectionKind::StartUsingDefaultKernel,
        }
    }

    /// Language the connection runs. Interpreter-backed connections are
    /// always Python; default kernels without a spec are assumed Python.
    pub fn language(&self) -> KernelLanguage {
        match self {
            Self::LocalKernelSpec { kernel_spec, .. } | Self::RemoteKernelSpec { kernel_spec, .. } => {
                KernelLanguage::from_name(&kernel_spec.language)
            }
            Self::PythonInterpreter { .. } => KernelLanguage::Python,
            Self::LiveRemoteKernel { kernel_model, .. } => kernel_model
                .language
                .as_deref()
                .map(KernelLanguage::from_name)
                .unwrap_or_else(|| KernelLanguage::from_name(&kernel_model.name)),
            Self::DefaultKernel { kernel_spec, .. } => kernel_spec
                .as_ref()
                .map(|spec| KernelLanguage::from_name(&spec.language))
                .unwrap_or(KernelLanguage::Python),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::LocalKernelSpec { kernel_spec, .. } | Self::RemoteKernelSpec { kernel_spec, .. } => {
                kernel_spec.display_name.clone()
            }
            Self::PythonInterpreter { interpreter, .. } => interpreter.label(),
            Self::LiveRemoteKernel { kernel_model, .. } => kernel_model
                .display_name
                .clone()
                .unwrap_or_else(|| format!("{} ({})", kernel_model.name, kernel_model.id)),
            Self::DefaultKernel { kernel_spec, .. } => kernel_spec
                .as_ref()
                .map(|spec| spec.display_name.clone())
                .unwrap_or_else(|| "Default kernel".to_string()),
        }
    }

    /// Kernelspec name, or the kernel model's spec name for live sessions.
    pub fn kernelspec_name(&self) -> Option<&str> {
        match self {
            Self::LocalKernelSpec { kernel_spec, .. } | Self::RemoteKernelSpec { kernel_spec, .. } => {
                Some(&kernel_spec.name)
            }
            Self::LiveRemoteKernel { kernel_model, .. } => Some(&kernel_model.name),
            Self::DefaultKernel { kernel_spec, .. } => kernel_spec.as_ref().map(|s| s.name.as_str()),
            Self::PythonInterpreter { .. } => None,
        }
    }

    pub fn kernel_spec(&self) -> Option<&KernelSpec> {
        match self {
            Self::LocalKernelSpec { kernel_spec, .. } | Self::RemoteKernelSpec { kernel_spec, .. } => {
                Some(kernel_spec)
            }
            Self::DefaultKernel { kernel_spec, .. } => kernel_spec.as_ref(),
            Self::PythonInterpreter { .. } | Self::LiveRemoteKernel { .. } => None,
        }
    }

    /// Interpreter path backing this connection, if any.
    pub fn interpreter_path(&self) -> Option<&Path> {
        match self {
            Self::PythonInterpreter { interpreter, .. } => Some(&interpreter.path),
            Self::LocalKernelSpec { kernel_spec, .. } => kernel_spec.interpreter_path.as_deref(),
            Self::RemoteKernelSpec { .. }
            | Self::LiveRemoteKernel { .. }
            | Self::DefaultKernel { .. } => None,
        }
    }

    /// Server-side kernel id for live sessions.
    pub fn live_kernel_id(&self) -> Option<&str> {
        match self {
            Self::LiveRemoteKernel { kernel_model, .. } => Some(&kernel_model.id),
            _ => None,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::RemoteKernelSpec { server_id, .. } | Self::LiveRemoteKernel { server_id, .. } => {
                Some(server_id)
            }
            Self::DefaultKernel { server_id, .. } => server_id.as_deref(),
            Self::LocalKernelSpec { .. } | Self::PythonInterpreter { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.server_id().is_some()
    }

    pub fn is_local(&self) -> bool {
        !self.is_remote()
    }
}

impl std::fmt::Display for KernelConnectionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] ({})", self.display_name(), self.kind(), self.id())
    }
}
