//! Ranking kernel connections against a notebook.
//!
//! Every candidate lands in a [`MatchTier`]. The ranked list is ascending: the
//! last element is the best candidate. Within a tier, discovery order decides,
//! with the first-discovered connection ranked highest. Labels never take
//! part in ordering.

use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::connection::{KernelConnectionMetadata, PythonInterpreter};
use crate::language::KernelLanguage;
use crate::metadata::NotebookMetadata;
use crate::remote_kernel_ids::PreferredRemoteKernelIdProvider;

/// How well a candidate matches a notebook, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchTier {
    NoMatch,
    /// Candidate runs the notebook's language.
    LanguageMatch,
    /// Python notebook, candidate backed by the preferred interpreter.
    PreferredInterpreter,
    /// Identifying fields equal the notebook's persisted kernel metadata.
    ExactMatch,
    /// Live remote session this notebook was last attached to.
    RememberedLiveSession,
}

/// What a notebook looks like to the ranking.
#[derive(Debug, Clone, Copy)]
pub struct RankRequest<'a> {
    pub notebook_uri: &'a str,
    pub metadata: Option<&'a NotebookMetadata>,
    pub preferred_interpreter: Option<&'a PythonInterpreter>,
    /// Most common cell language, for notebooks without metadata hints.
    pub cell_language: Option<&'a KernelLanguage>,
}

impl RankRequest<'_> {
    /// Metadata language, then cell language, then Python.
    pub fn notebook_language(&self) -> KernelLanguage {
        self.metadata
            .and_then(|m| m.language())
            .or_else(|| self.cell_language.cloned())
            .unwrap_or(KernelLanguage::Python)
    }
}

/// True when the candidate's identifying fields equal the persisted metadata.
///
/// Kernelspec-backed connections and live sessions compare the kernelspec
/// name; interpreter-backed connections compare the interpreter path hash.
pub fn metadata_exact_match(
    candidate: &KernelConnectionMetadata,
    metadata: Option<&NotebookMetadata>,
) -> bool {
    let Some(metadata) = metadata else {
        return false;
    };
    match candidate {
        KernelConnectionMetadata::LocalKernelSpec { kernel_spec, .. }
        | KernelConnectionMetadata::RemoteKernelSpec { kernel_spec, .. } => {
            metadata.kernelspec_name() == Some(kernel_spec.name.as_str())
        }
        KernelConnectionMetadata::LiveRemoteKernel { kernel_model, .. } => {
            metadata.kernelspec_name() == Some(kernel_model.name.as_str())
        }
        KernelConnectionMetadata::PythonInterpreter { interpreter, .. } => metadata
            .interpreter_hash()
            .is_some_and(|hash| hash == crate::interpreter_hash(&interpreter.path)),
        KernelConnectionMetadata::DefaultKernel { .. } => false,
    }
}

/// Tier of one candidate. `remembered_kernel_id` is the live kernel id
/// persisted for the notebook, if any.
pub fn tier_of(
    candidate: &KernelConnectionMetadata,
    request: &RankRequest<'_>,
    notebook_language: &KernelLanguage,
    remembered_kernel_id: Option<&str>,
) -> MatchTier {
    if let (Some(live), Some(remembered)) = (candidate.live_kernel_id(), remembered_kernel_id) {
        if live == remembered {
            return MatchTier::RememberedLiveSession;
        }
    }

    if metadata_exact_match(candidate, request.metadata) {
        return MatchTier::ExactMatch;
    }

    if notebook_language.is_python() {
        if let (Some(preferred), Some(path)) =
            (request.preferred_interpreter, candidate.interpreter_path())
        {
            if preferred.path == path {
                return MatchTier::PreferredInterpreter;
            }
        }
    }

    if &candidate.language() == notebook_language {
        return MatchTier::LanguageMatch;
    }

    MatchTier::NoMatch
}

/// Orders candidate connections for a notebook.
pub struct KernelRankingHelper {
    remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
}

impl KernelRankingHelper {
    pub fn new(remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>) -> Self {
        Self { remote_kernel_ids }
    }

    /// Rank `connections`, weakest first, keeping each candidate's tier.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn rank_with_tiers(
        &self,
        request: &RankRequest<'_>,
        connections: &[Arc<KernelConnectionMetadata>],
        cancel: &CancellationToken,
    ) -> Option<Vec<(MatchTier, Arc<KernelConnectionMetadata>)>> {
        if cancel.is_cancelled() {
            return None;
        }
        if connections.is_empty() {
            return Some(Vec::new());
        }

        let remembered = self
            .remote_kernel_ids
            .get_preferred_remote_kernel_id(request.notebook_uri)
            .await;
        if cancel.is_cancelled() {
            return None;
        }

        let language = request.notebook_language();
        let mut scored: Vec<(MatchTier, usize, Arc<KernelConnectionMetadata>)> = connections
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let tier = tier_of(candidate, request, &language, remembered.as_deref());
                (tier, index, candidate.clone())
            })
            .collect();

        // Ascending tier; inside a tier, earlier discovery sorts later (better).
        scored.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        if let Some((tier, _, best)) = scored.last() {
            debug!(
                "[ranking] {} candidate(s) for {}, best {} ({:?})",
                scored.len(),
                request.notebook_uri,
                best.id(),
                tier
            );
        }

        Some(
            scored
                .into_iter()
                .map(|(tier, _, candidate)| (tier, candidate))
                .collect(),
        )
    }

    /// Rank `connections`, weakest first. The last element is the best.
    pub async fn rank_kernels(
        &self,
        request: &RankRequest<'_>,
        connections: &[Arc<KernelConnectionMetadata>],
        cancel: &CancellationToken,
    ) -> Option<Vec<Arc<KernelConnectionMetadata>>> {
        self.rank_with_tiers(request, connections, cancel)
            .await
            .map(|ranked| ranked.into_iter().map(|(_, c)| c).collect())
    }

    /// Whether `candidate` is an exact match for the notebook.
    ///
    /// Stronger than ranking first: a live session counts only when it is the
    /// one remembered for this notebook or its kernel name equals the
    /// persisted kernelspec name.
    pub async fn is_exact_match(
        &self,
        notebook_uri: &str,
        candidate: &KernelConnectionMetadata,
        metadata: Option<&NotebookMetadata>,
    ) -> bool {
        if metadata.is_none() {
            return false;
        }
        if let Some(live) = candidate.live_kernel_id() {
            let remembered = self
                .remote_kernel_ids
                .get_preferred_remote_kernel_id(notebook_uri)
                .await;
            if remembered.as_deref() == Some(live) {
                return true;
            }
        }
        metadata_exact_match(candidate, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{KernelSpec, LiveKernelModel};
    use crate::metadata::{InterpreterMetadata, KernelspecMetadata, LanguageInfoMetadata};
    use crate::remote_kernel_ids::InMemoryRemoteKernelIdStore;
    use std::path::PathBuf;

    fn kernelspec(id: &str, name: &str, language: &str) -> Arc<KernelConnectionMetadata> {
        Arc::new(KernelConnectionMetadata::LocalKernelSpec {
            id: id.to_string(),
            kernel_spec: KernelSpec {
                name: name.to_string(),
                display_name: name.to_string(),
                language: language.to_string(),
                argv: vec![],
                spec_dir: None,
                interpreter_path: None,
            },
        })
    }

    fn interpreter(id: &str, path: &str) -> Arc<KernelConnectionMetadata> {
        Arc::new(KernelConnectionMetadata::PythonInterpreter {
            id: id.to_string(),
            interpreter: PythonInterpreter::new(path),
        })
    }

    fn live(id: &str, kernel_id: &str, name: &str) -> Arc<KernelConnectionMetadata> {
        Arc::new(KernelConnectionMetadata::LiveRemoteKernel {
            id: id.to_string(),
            kernel_model: LiveKernelModel {
                id: kernel_id.to_string(),
                name: name.to_string(),
                language: Some("python".to_string()),
                display_name: None,
                execution_state: None,
            },
            server_id: "srv".to_string(),
            base_url: "http://localhost:8888".to_string(),
        })
    }

    fn metadata(name: &str, language: &str) -> NotebookMetadata {
        NotebookMetadata {
            kernelspec: Some(KernelspecMetadata {
                name: name.to_string(),
                display_name: name.to_string(),
                language: Some(language.to_string()),
            }),
            language_info: None,
            interpreter: None,
        }
    }

    fn helper() -> (KernelRankingHelper, Arc<InMemoryRemoteKernelIdStore>) {
        let store = Arc::new(InMemoryRemoteKernelIdStore::new());
        (KernelRankingHelper::new(store.clone()), store)
    }

    fn request<'a>(uri: &'a str, metadata: Option<&'a NotebookMetadata>) -> RankRequest<'a> {
        RankRequest {
            notebook_uri: uri,
            metadata,
            preferred_interpreter: None,
            cell_language: None,
        }
    }

    fn ids(ranked: &[Arc<KernelConnectionMetadata>]) -> Vec<&str> {
        ranked.iter().map(|c| c.id()).collect()
    }

    #[tokio::test]
    async fn test_exact_name_beats_language() {
        let (helper, _) = helper();
        let meta = metadata("julia", "julia");
        let connections = vec![
            kernelspec("spec-julia", "julia", "julia"),
            kernelspec("spec-python3", "python3", "python"),
        ];
        let ranked = helper
            .rank_kernels(&request("nb", Some(&meta)), &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().id(), "spec-julia");
        assert!(helper.is_exact_match("nb", &ranked[1], Some(&meta)).await);
        assert!(!helper.is_exact_match("nb", &ranked[0], Some(&meta)).await);
    }

    #[tokio::test]
    async fn test_ties_keep_discovery_order() {
        let (helper, _) = helper();
        let meta = metadata("python3", "python");
        let connections = vec![
            kernelspec("first", "python3", "python"),
            kernelspec("other", "ir", "r"),
            kernelspec("second", "python3", "python"),
        ];
        let ranked = helper
            .rank_kernels(&request("nb", Some(&meta)), &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&ranked), vec!["other", "second", "first"]);
    }

    #[tokio::test]
    async fn test_labels_do_not_affect_order() {
        let (helper, _) = helper();
        let meta = metadata("unknown", "python");
        let connections = vec![
            kernelspec("zzz", "zeta", "python"),
            kernelspec("aaa", "alpha", "python"),
        ];
        let ranked = helper
            .rank_kernels(&request("nb", Some(&meta)), &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().id(), "zzz");
    }

    #[tokio::test]
    async fn test_remembered_live_session_is_boosted() {
        let (helper, store) = helper();
        store.store_preferred_remote_kernel_id("nb", Some("k-42")).await.unwrap();
        let meta = metadata("python3", "python");
        let connections = vec![
            kernelspec("spec-python3", "python3", "python"),
            live("live-a", "k-42", "something-else"),
            live("live-b", "k-7", "python3"),
        ];
        let ranked = helper
            .rank_with_tiers(&request("nb", Some(&meta)), &connections, &CancellationToken::new())
            .await
            .unwrap();
        let (tier, best) = ranked.last().unwrap();
        assert_eq!(best.id(), "live-a");
        assert_eq!(*tier, MatchTier::RememberedLiveSession);
        assert!(helper.is_exact_match("nb", best, Some(&meta)).await);
    }

    #[tokio::test]
    async fn test_interpreter_hash_exact_match() {
        let (helper, _) = helper();
        let path = PathBuf::from("/opt/envs/ml/bin/python");
        let meta = NotebookMetadata {
            kernelspec: None,
            language_info: Some(LanguageInfoMetadata {
                name: "python".to_string(),
                version: None,
            }),
            interpreter: Some(InterpreterMetadata {
                hash: crate::interpreter_hash(&path),
            }),
        };
        let connections = vec![
            interpreter("sys", "/usr/bin/python3"),
            interpreter("ml", "/opt/envs/ml/bin/python"),
        ];
        let ranked = helper
            .rank_with_tiers(&request("nb", Some(&meta)), &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().1.id(), "ml");
        assert_eq!(ranked.last().unwrap().0, MatchTier::ExactMatch);
        assert!(!helper.is_exact_match("nb", &connections[0], Some(&meta)).await);
    }

    #[tokio::test]
    async fn test_preferred_interpreter_beats_language_match() {
        let (helper, _) = helper();
        let meta = metadata("python3", "python");
        let preferred = PythonInterpreter::new("/opt/venv/bin/python");
        let connections = vec![
            interpreter("sys", "/usr/bin/python3"),
            interpreter("venv", "/opt/venv/bin/python"),
        ];
        let req = RankRequest {
            preferred_interpreter: Some(&preferred),
            ..request("nb", Some(&meta))
        };
        let ranked = helper
            .rank_with_tiers(&req, &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().1.id(), "venv");
        assert_eq!(ranked.last().unwrap().0, MatchTier::PreferredInterpreter);
        assert_eq!(ranked[0].0, MatchTier::LanguageMatch);
    }

    #[tokio::test]
    async fn test_untyped_uses_cell_language() {
        let (helper, _) = helper();
        let julia = KernelLanguage::Julia;
        let connections = vec![
            kernelspec("py", "python3", "python"),
            kernelspec("jl", "julia-1.10", "julia"),
        ];
        let req = RankRequest {
            cell_language: Some(&julia),
            ..request("nb", None)
        };
        let ranked = helper
            .rank_kernels(&req, &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().id(), "jl");
        assert!(!helper.is_exact_match("nb", &connections[1], None).await);
    }

    #[tokio::test]
    async fn test_untyped_falls_back_to_python() {
        let (helper, _) = helper();
        let connections = vec![
            kernelspec("jl", "julia-1.10", "julia"),
            kernelspec("py", "python3", "python"),
        ];
        let ranked = helper
            .rank_kernels(&request("nb", None), &connections, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ranked.last().unwrap().id(), "py");
    }

    #[tokio::test]
    async fn test_empty_and_cancelled() {
        let (helper, _) = helper();
        let token = CancellationToken::new();
        let empty = helper.rank_kernels(&request("nb", None), &[], &token).await;
        assert_eq!(empty.map(|v| v.len()), Some(0));

        token.cancel();
        let connections = vec![kernelspec("py", "python3", "python")];
        assert!(helper
            .rank_kernels(&request("nb", None), &connections, &token)
            .await
            .is_none());
    }

    #[test]
    fn test_default_kernel_is_never_exact() {
        let meta = metadata("python3", "python");
        let conn = KernelConnectionMetadata::default_kernel(None);
        assert!(!metadata_exact_match(&conn, Some(&meta)));
    }
}
