//! Kernel language names, normalized for comparison.
//!
//! Kernelspecs, `language_info` and cell documents spell the same language in
//! different ways (`python`, `Python`, `python3`, `ipython`). Matching always
//! goes through [`KernelLanguage`] so those compare equal. Unknown values are
//! preserved via `Other(String)` (lowercased) so they still match each other.

use schemars::JsonSchema;

/// A kernel or notebook language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum KernelLanguage {
    #[default]
    Python,
    TypeScript,
    Julia,
    R,
    /// Any other language, lowercased.
    Other(String),
}

impl KernelLanguage {
    /// Normalize a language name. Never fails.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "python" | "python2" | "python3" | "py" | "ipython" | "ipython3" => {
                KernelLanguage::Python
            }
            "typescript" | "ts" | "deno" => KernelLanguage::TypeScript,
            "julia" => KernelLanguage::Julia,
            "r" => KernelLanguage::R,
            other => KernelLanguage::Other(other.to_string()),
        }
    }

    pub fn is_python(&self) -> bool {
        matches!(self, KernelLanguage::Python)
    }

    /// Cell languages that never pick a kernel.
    pub fn is_markup(name: &str) -> bool {
        matches!(
            name.trim().to_lowercase().as_str(),
            "markdown" | "raw" | "plaintext"
        )
    }
}

// ── Serde ────────────────────────────────────────────────────────────

impl serde::Serialize for KernelLanguage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for KernelLanguage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(KernelLanguage::from_name(&s))
    }
}

// ── JSON Schema ─────────────────────────────────────────────────────

impl JsonSchema for KernelLanguage {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "KernelLanguage".into()
    }

    fn json_schema(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "string",
            "examples": ["python", "typescript", "julia", "r"]
        })
    }
}

// ── Display / FromStr ───────────────────────────────────────────────

impl std::fmt::Display for KernelLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelLanguage::Python => write!(f, "python"),
            KernelLanguage::TypeScript => write!(f, "typescript"),
            KernelLanguage::Julia => write!(f, "julia"),
            KernelLanguage::R => write!(f, "r"),
            KernelLanguage::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for KernelLanguage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(KernelLanguage::from_name(s))
    }
}
