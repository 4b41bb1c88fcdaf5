//! Notebook documents and the kernel-related parts of their metadata.
//!
//! Only the fields that drive kernel selection are typed here: `kernelspec`,
//! `language_info`, and the `interpreter.hash` some editors record when a
//! notebook was last run against a specific Python interpreter. Everything
//! else in the notebook metadata is ignored.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::language::KernelLanguage;

/// Error reading notebook metadata from disk.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to read notebook {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Notebook {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Jupyter `kernelspec` metadata (`metadata.kernelspec`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelspecMetadata {
    /// Kernel name (e.g. `"python3"`, `"julia-1.10"`).
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Jupyter `language_info` metadata (subset).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguageInfoMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Interpreter a notebook was last run with (`metadata.interpreter`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterpreterMetadata {
    /// SHA-256 hex of the interpreter path.
    pub hash: String,
}

/// Kernel hints persisted in a notebook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotebookMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelspec: Option<KernelspecMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_info: Option<LanguageInfoMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterMetadata>,
}

impl NotebookMetadata {
    /// Build from the raw notebook-level metadata object.
    ///
    /// Malformed sub-objects are treated as absent rather than failing the
    /// whole read.
    pub fn from_metadata_value(metadata: &serde_json::Value) -> Self {
        let kernelspec = metadata
            .get("kernelspec")
            .and_then(|v| serde_json::from_value::<KernelspecMetadata>(v.clone()).ok());

        let language_info = metadata
            .get("language_info")
            .and_then(|v| serde_json::from_value::<LanguageInfoMetadata>(v.clone()).ok());

        let interpreter = metadata
            .get("interpreter")
            .and_then(|v| serde_json::from_value::<InterpreterMetadata>(v.clone()).ok());

        NotebookMetadata {
            kernelspec,
            language_info,
            interpreter,
        }
    }

    /// A notebook with neither a kernelspec nor language_info is untyped.
    pub fn has_hints(&self) -> bool {
        self.kernelspec.is_some() || self.language_info.is_some()
    }

    /// Language recorded in the metadata: `kernelspec.language` first, then
    /// `language_info.name`.
    pub fn language(&self) -> Option<KernelLanguage> {
        self.kernelspec
            .as_ref()
            .and_then(|k| k.language.as_deref())
            .or_else(|| self.language_info.as_ref().map(|l| l.name.as_str()))
            .filter(|s| !s.trim().is_empty())
            .map(KernelLanguage::from_name)
    }

    pub fn kernelspec_name(&self) -> Option<&str> {
        self.kernelspec.as_ref().map(|k| k.name.as_str())
    }

    pub fn interpreter_hash(&self) -> Option<&str> {
        self.interpreter.as_ref().map(|i| i.hash.as_str())
    }
}

/// Which kind of editor surface a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewType {
    #[serde(rename = "jupyter-notebook")]
    JupyterNotebookView,
    #[serde(rename = "interactive")]
    InteractiveWindowView,
}

impl ViewType {
    pub const ALL: [ViewType; 2] = [ViewType::JupyterNotebookView, ViewType::InteractiveWindowView];
}

impl std::fmt::Display for ViewType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewType::JupyterNotebookView => write!(f, "jupyter-notebook"),
            ViewType::InteractiveWindowView => write!(f, "interactive"),
        }
    }
}

/// An open notebook (or interactive window) as seen by kernel selection.
#[derive(Debug, Clone, PartialEq)]
pub struct NotebookDocument {
    /// Stable document identity. Every per-document cache is keyed by it.
    pub uri: String,
    pub view_type: ViewType,
    pub metadata: Option<NotebookMetadata>,
    /// Languages of the code cells, in document order.
    pub cell_languages: Vec<String>,
}

impl NotebookDocument {
    pub fn new(uri: impl Into<String>, view_type: ViewType) -> Self {
        Self {
            uri: uri.into(),
            view_type,
            metadata: None,
            cell_languages: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: NotebookMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_cell_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cell_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Most frequent code-cell language. Ties go to the language seen first;
    /// markdown and raw cells never count.
    pub fn detected_language(&self) -> Option<KernelLanguage> {
        let mut counts: HashMap<KernelLanguage, (usize, usize)> = HashMap::new();
        for (position, name) in self
            .cell_languages
            .iter()
            .filter(|l| !KernelLanguage::is_markup(l) && !l.trim().is_empty())
            .enumerate()
        {
            let entry = counts
                .entry(KernelLanguage::from_name(name))
                .or_insert((0, position));
            entry.0 += 1;
        }
        counts
            .into_iter()
            .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
                count_a.cmp(count_b).then(first_b.cmp(first_a))
            })
            .map(|(language, _)| language)
    }

    /// Metadata hints, if any were persisted.
    pub fn hints(&self) -> Option<&NotebookMetadata> {
        self.metadata.as_ref().filter(|m| m.has_hints())
    }

    /// Build a document from a parsed `.ipynb` value.
    ///
    /// Cell languages come from `metadata.vscode.languageId` on code cells,
    /// which is the only per-cell language hint nbformat files carry.
    pub fn from_ipynb_value(uri: impl Into<String>, notebook: &serde_json::Value) -> Self {
        let metadata = notebook
            .get("metadata")
            .map(NotebookMetadata::from_metadata_value);

        let cell_languages = notebook
            .get("cells")
            .and_then(|c| c.as_array())
            .map(|cells| {
                cells
                    .iter()
                    .filter(|cell| cell.get("cell_type").and_then(|t| t.as_str()) == Some("code"))
                    .filter_map(|cell| {
                        cell.pointer("/metadata/vscode/languageId")
                            .and_then(|l| l.as_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            uri: uri.into(),
            view_type: ViewType::JupyterNotebookView,
            metadata,
            cell_languages,
        }
    }

    /// Read an `.ipynb` file. The document URI is the canonical `file://` path.
    pub async fn load_ipynb(path: &Path) -> Result<Self, MetadataError> {
        let display = path.display().to_string();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MetadataError::Io {
                path: display.clone(),
                source,
            })?;
        let value: serde_json::Value =
            serde_json::from_str(&contents).map_err(|source| MetadataError::Parse {
                path: display,
                source,
            })?;
        let absolute = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        Ok(Self::from_ipynb_value(
            format!("file://{}", absolute.display()),
            &value,
        ))
    }
}
