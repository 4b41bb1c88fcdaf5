//! Preferred-controller orchestration.
//!
//! For every open document the service runs a *search*: it resolves the
//! connection the document should use, materializes its controller, marks it
//! [`ControllerAffinity::Preferred`] and caches it. Per document:
//!
//! ```text
//! Idle ──open / registry change / compute_preferred──▶ Searching
//! Searching ──close / newer search / caller cancel──▶ Cancelled
//! Searching ──winner found──▶ Resolved ──registry change──▶ Searching
//! ```
//!
//! At most one search per document is live. Starting a search cancels the
//! previous one's token, and side effects (affinity updates, cache writes) are
//! applied under the tracker lock only if the search's token is still the
//! current one and not cancelled. A stale search therefore can never touch a
//! controller once its successor has started.
//!
//! Resolution order for notebooks:
//!
//! 1. live remote session remembered for the document
//! 2. untyped python notebooks: default controller
//! 3. ranked candidates: exact match, then the preferred interpreter
//! 4. python notebooks: default controller
//! 5. language match
//! 6. default controller
//!
//! Interactive windows have no persisted metadata and always use the default
//! controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::KernelConnectionMetadata;
use crate::controller::{Controller, ControllerAffinity};
use crate::default_controller::ControllerDefaultService;
use crate::interpreter::InterpreterService;
use crate::metadata::{NotebookDocument, ViewType};
use crate::ranking::{KernelRankingHelper, MatchTier, RankRequest};
use crate::registry::ControllerRegistry;
use crate::remote_kernel_ids::PreferredRemoteKernelIdProvider;
use crate::settings::{LaunchMode, SelectionSettings};

/// Result of a preferred-controller search. Both fields are `None` when
/// nothing was found, the search was cancelled, or it failed.
#[derive(Debug, Clone, Default)]
pub struct PreferredController {
    pub connection: Option<Arc<KernelConnectionMetadata>>,
    pub controller: Option<Arc<Controller>>,
}

impl PreferredController {
    pub fn is_empty(&self) -> bool {
        self.controller.is_none()
    }
}

/// Handle for one in-flight search.
#[derive(Debug, Clone)]
pub struct SearchHandle {
    pub token: CancellationToken,
    generation: u64,
}

struct SearchEntry {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct TrackerState {
    preferred: HashMap<String, Arc<Controller>>,
    searches: HashMap<String, SearchEntry>,
    open: HashMap<String, NotebookDocument>,
    next_generation: u64,
}

impl TrackerState {
    /// `handle` is the current search for `uri` and has not been cancelled.
    fn is_live(&self, uri: &str, handle: &SearchHandle) -> bool {
        self.searches
            .get(uri)
            .is_some_and(|entry| entry.generation == handle.generation)
            && !handle.token.is_cancelled()
    }
}

/// Per-document preferred controllers, search tokens and open documents,
/// keyed by document URI.
#[derive(Default)]
pub struct PreferenceTracker {
    state: Mutex<TrackerState>,
}

impl PreferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a search for `uri`, cancelling any search already running.
    ///
    /// The new token is a child of `parent` so the caller can cancel it too.
    pub fn begin_search(&self, uri: &str, parent: Option<&CancellationToken>) -> SearchHandle {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let previous = state.searches.insert(
            uri.to_string(),
            SearchEntry {
                token: token.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            debug!("[preferred] Superseding search for {}", uri);
            previous.token.cancel();
        }
        SearchHandle { token, generation }
    }

    /// Forget the search entry if it still belongs to `handle`.
    pub fn finish_search(&self, uri: &str, handle: &SearchHandle) {
        let mut state = self.lock();
        if state
            .searches
            .get(uri)
            .is_some_and(|entry| entry.generation == handle.generation)
        {
            state.searches.remove(uri);
        }
    }

    /// Token of the search currently running for `uri`.
    pub fn search_token(&self, uri: &str) -> Option<CancellationToken> {
        self.lock().searches.get(uri).map(|e| e.token.clone())
    }

    /// Record `controller` as preferred for `uri` if `handle` is still the
    /// live search. Returns false for stale or cancelled searches.
    pub fn apply_search_result(
        &self,
        uri: &str,
        controller: &Arc<Controller>,
        handle: &SearchHandle,
    ) -> bool {
        let mut state = self.lock();
        if !state.is_live(uri, handle) {
            return false;
        }
        set_preferred(&mut state, uri, controller);
        true
    }

    /// Forget the preferred controller for `uri` after the live search came
    /// back empty. Stale or cancelled searches leave the entry alone.
    pub fn clear_search_result(&self, uri: &str, handle: &SearchHandle) -> bool {
        let mut state = self.lock();
        if !state.is_live(uri, handle) {
            return false;
        }
        if let Some(previous) = state.preferred.remove(uri) {
            previous.set_affinity(uri, ControllerAffinity::Default);
        }
        true
    }

    /// Record a controller chosen outside a search (the user switched
    /// kernels). Cancels any running search so it can't override the choice.
    pub fn apply_selection(&self, uri: &str, controller: &Arc<Controller>) {
        let mut state = self.lock();
        if let Some(entry) = state.searches.remove(uri) {
            entry.token.cancel();
        }
        set_preferred(&mut state, uri, controller);
    }

    pub fn get_preferred(&self, uri: &str) -> Option<Arc<Controller>> {
        self.lock().preferred.get(uri).cloned()
    }

    pub fn open(&self, document: NotebookDocument) {
        self.lock().open.insert(document.uri.clone(), document);
    }

    pub fn is_open(&self, uri: &str) -> bool {
        self.lock().open.contains_key(uri)
    }

    pub fn open_documents(&self) -> Vec<NotebookDocument> {
        let mut docs: Vec<NotebookDocument> = self.lock().open.values().cloned().collect();
        docs.sort_by(|a, b| a.uri.cmp(&b.uri));
        docs
    }

    /// Cancel every running search.
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        for (_, entry) in state.searches.drain() {
            entry.token.cancel();
        }
    }

    /// Drop everything known about `uri`: cancels its search, forgets the
    /// preferred controller and clears that controller's affinity.
    pub fn remove(&self, uri: &str) {
        let mut state = self.lock();
        state.open.remove(uri);
        if let Some(entry) = state.searches.remove(uri) {
            entry.token.cancel();
        }
        if let Some(previous) = state.preferred.remove(uri) {
            previous.set_affinity(uri, ControllerAffinity::Default);
        }
    }
}

/// Reset the old preferred controller before marking the new one so two
/// controllers never report `Preferred` for the same document.
fn set_preferred(state: &mut TrackerState, uri: &str, controller: &Arc<Controller>) {
    if let Some(previous) = state.preferred.get(uri) {
        if Arc::ptr_eq(previous, controller) {
            return;
        }
        previous.set_affinity(uri, ControllerAffinity::Default);
    }
    controller.set_affinity(uri, ControllerAffinity::Preferred);
    state.preferred.insert(uri.to_string(), controller.clone());
}

/// Finds, marks and caches the preferred controller for open documents.
pub struct ControllerPreferredService {
    registry: Arc<ControllerRegistry>,
    interpreters: Arc<dyn InterpreterService>,
    remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
    default_service: ControllerDefaultService,
    ranking: KernelRankingHelper,
    settings: SelectionSettings,
    tracker: PreferenceTracker,
    shutdown: CancellationToken,
}

impl ControllerPreferredService {
    pub fn new(
        registry: Arc<ControllerRegistry>,
        interpreters: Arc<dyn InterpreterService>,
        remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
        settings: SelectionSettings,
    ) -> Arc<Self> {
        let default_service = ControllerDefaultService::new(
            registry.clone(),
            interpreters.clone(),
            remote_kernel_ids.clone(),
            &settings,
        );
        let ranking = KernelRankingHelper::new(remote_kernel_ids.clone());
        Arc::new(Self {
            registry,
            interpreters,
            remote_kernel_ids,
            default_service,
            ranking,
            settings,
            tracker: PreferenceTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &PreferenceTracker {
        &self.tracker
    }

    /// Cached preferred controller. Never computes.
    pub fn get_preferred(&self, document: &NotebookDocument) -> Option<Arc<Controller>> {
        self.tracker.get_preferred(&document.uri)
    }

    /// Resolve, mark and cache the preferred controller for `document`.
    ///
    /// Supersedes any search already running for the document. Never fails:
    /// errors are logged and produce an empty result.
    pub async fn compute_preferred(
        &self,
        document: &NotebookDocument,
        cancel: Option<&CancellationToken>,
    ) -> PreferredController {
        let handle = self.tracker.begin_search(&document.uri, cancel);
        self.run_search(document, handle).await
    }

    async fn run_search(&self, document: &NotebookDocument, handle: SearchHandle) -> PreferredController {
        let uri = document.uri.as_str();
        let outcome = match self.search(document, &handle.token).await {
            Ok(Some(connection)) => self.apply(document, connection, &handle),
            Ok(None) => {
                debug!("[preferred] No preferred kernel for {}", uri);
                self.tracker.clear_search_result(uri, &handle);
                PreferredController::default()
            }
            Err(e) => {
                warn!("[preferred] Failed to compute preferred kernel for {}: {:#}", uri, e);
                self.tracker.clear_search_result(uri, &handle);
                PreferredController::default()
            }
        };

        self.tracker.finish_search(uri, &handle);
        outcome
    }

    fn apply(
        &self,
        document: &NotebookDocument,
        connection: Arc<KernelConnectionMetadata>,
        handle: &SearchHandle,
    ) -> PreferredController {
        if handle.token.is_cancelled() {
            return PreferredController::default();
        }
        let controller = self
            .registry
            .get(connection.id(), document.view_type)
            .or_else(|| {
                self.registry
                    .add_or_update((*connection).clone(), &[document.view_type])
                    .into_iter()
                    .next()
            });
        let Some(controller) = controller else {
            return PreferredController::default();
        };

        if !self
            .tracker
            .apply_search_result(&document.uri, &controller, handle)
        {
            debug!("[preferred] Discarding stale result for {}", document.uri);
            return PreferredController::default();
        }

        info!(
            "[preferred] {} -> {}",
            document.uri,
            controller.connection().display_name()
        );
        PreferredController {
            connection: Some(controller.connection()),
            controller: Some(controller),
        }
    }

    fn supports(&self, connection: &KernelConnectionMetadata) -> bool {
        match self.settings.launch_mode {
            LaunchMode::Local => connection.is_local(),
            LaunchMode::Remote => connection.is_remote(),
        }
    }

    async fn default_connection(
        &self,
        document: &NotebookDocument,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<Arc<KernelConnectionMetadata>>> {
        let controller = self
            .default_service
            .compute_default_controller(document, document.view_type, cancel)
            .await?;
        Ok(controller.map(|c| c.connection()))
    }

    async fn search(
        &self,
        document: &NotebookDocument,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<Arc<KernelConnectionMetadata>>> {
        let debounce = self.settings.search_debounce();
        if !debounce.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(debounce) => {}
            }
        }

        if document.view_type == ViewType::InteractiveWindowView {
            return self.default_connection(document, cancel).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = self.registry.loaded() => {}
        }

        let remembered = self
            .remote_kernel_ids
            .get_preferred_remote_kernel_id(&document.uri)
            .await;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(kernel_id) = remembered.as_deref() {
            if let Some(live) = self
                .registry
                .all()
                .into_iter()
                .filter(|c| self.supports(c))
                .find(|c| c.live_kernel_id() == Some(kernel_id))
            {
                debug!("[preferred] Remembered live kernel {} for {}", kernel_id, document.uri);
                return Ok(Some(live));
            }
        }

        let metadata = document.hints();
        let cell_language = document.detected_language();
        if metadata.is_none() && cell_language.as_ref().map_or(true, |l| l.is_python()) {
            return self.default_connection(document, cancel).await;
        }

        let preferred_interpreter = match self.settings.launch_mode {
            LaunchMode::Local => {
                self.interpreters
                    .active_interpreter(Some(document.uri.as_str()))
                    .await
            }
            LaunchMode::Remote => None,
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let candidates: Vec<Arc<KernelConnectionMetadata>> = self
            .registry
            .all()
            .into_iter()
            .filter(|c| self.supports(c))
            .collect();
        let request = RankRequest {
            notebook_uri: &document.uri,
            metadata,
            preferred_interpreter: preferred_interpreter.as_ref(),
            cell_language: cell_language.as_ref(),
        };
        let Some(ranked) = self.ranking.rank_with_tiers(&request, &candidates, cancel).await else {
            return Ok(None);
        };

        let python_locally =
            request.notebook_language().is_python() && self.settings.launch_mode == LaunchMode::Local;

        match ranked.last() {
            Some((tier, best)) if *tier >= MatchTier::PreferredInterpreter => {
                debug!("[preferred] {:?} for {}: {}", tier, document.uri, best.id());
                Ok(Some(best.clone()))
            }
            Some((MatchTier::LanguageMatch, best)) => {
                if python_locally {
                    match self.default_connection(document, cancel).await {
                        Ok(Some(default)) => return Ok(Some(default)),
                        Ok(None) => {}
                        Err(e) => debug!("[preferred] Keeping language match: {}", e),
                    }
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                }
                Ok(Some(best.clone()))
            }
            _ => self.default_connection(document, cancel).await,
        }
    }

    /// Track `document` and start its search in the background.
    pub fn on_did_open_notebook_document(
        self: &Arc<Self>,
        document: NotebookDocument,
    ) -> JoinHandle<PreferredController> {
        self.tracker.open(document.clone());
        // Registered before spawning so a close that races the task still
        // finds a token to cancel.
        let handle = self.tracker.begin_search(&document.uri, None);
        let this = self.clone();
        tokio::spawn(async move { this.run_search(&document, handle).await })
    }

    /// Cancel the document's search and forget its preferred controller.
    pub fn on_did_close_notebook_document(&self, document: &NotebookDocument) {
        debug!("[preferred] Closing {}", document.uri);
        self.tracker.remove(&document.uri);
    }

    /// The user picked `controller` for `document`.
    ///
    /// Live remote sessions are remembered for the document; picking anything
    /// else forgets a remembered session.
    pub async fn on_controller_selected(
        &self,
        document: &NotebookDocument,
        controller: &Arc<Controller>,
    ) {
        self.tracker.apply_selection(&document.uri, controller);

        let connection = controller.connection();
        let kernel_id = connection.live_kernel_id();
        if let Err(e) = self
            .remote_kernel_ids
            .store_preferred_remote_kernel_id(&document.uri, kernel_id)
            .await
        {
            warn!("[preferred] Failed to remember kernel for {}: {}", document.uri, e);
        }
    }

    /// Re-run the search for every open document.
    pub async fn recompute_open_documents(&self) -> Vec<PreferredController> {
        let documents = self.tracker.open_documents();
        if documents.is_empty() {
            return Vec::new();
        }
        debug!("[preferred] Re-running search for {} document(s)", documents.len());
        join_all(
            documents
                .iter()
                .map(|document| self.compute_preferred(document, None)),
        )
        .await
    }

    /// Start the observer that re-runs searches when the registry changes.
    ///
    /// Bursts of changes within the retrigger window are coalesced. Stops on
    /// [`ControllerPreferredService::shutdown`].
    pub fn activate(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut changes = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }

                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.settings.retrigger_debounce()) => {}
                }
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }

                this.recompute_open_documents().await;
            }
            debug!("[preferred] Registry observer stopped");
        })
    }

    /// Stop the registry observer and cancel every running search.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PythonInterpreter;

    fn controller(path: &str) -> Arc<Controller> {
        let conn = KernelConnectionMetadata::python_interpreter(PythonInterpreter::new(path));
        Arc::new(Controller::new(Arc::new(conn), ViewType::JupyterNotebookView))
    }

    #[test]
    fn test_begin_search_cancels_previous() {
        let tracker = PreferenceTracker::new();
        let first = tracker.begin_search("a", None);
        let second = tracker.begin_search("a", None);
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        // Other documents are independent.
        let other = tracker.begin_search("b", None);
        assert!(!second.token.is_cancelled());
        assert!(!other.token.is_cancelled());
    }

    #[test]
    fn test_parent_token_cancels_search() {
        let tracker = PreferenceTracker::new();
        let parent = CancellationToken::new();
        let handle = tracker.begin_search("a", Some(&parent));
        parent.cancel();
        assert!(handle.token.is_cancelled());
    }

    #[test]
    fn test_stale_search_cannot_apply() {
        let tracker = PreferenceTracker::new();
        let c1 = controller("/usr/bin/python3");
        let c2 = controller("/opt/venv/bin/python");

        let stale = tracker.begin_search("a", None);
        let live = tracker.begin_search("a", None);
        assert!(!tracker.apply_search_result("a", &c1, &stale));
        assert_eq!(c1.affinity("a"), ControllerAffinity::Default);

        assert!(tracker.apply_search_result("a", &c2, &live));
        assert_eq!(c2.affinity("a"), ControllerAffinity::Preferred);
        assert!(Arc::ptr_eq(&tracker.get_preferred("a").unwrap(), &c2));
    }

    #[test]
    fn test_switching_resets_previous_affinity() {
        let tracker = PreferenceTracker::new();
        let c1 = controller("/usr/bin/python3");
        let c2 = controller("/opt/venv/bin/python");

        let h1 = tracker.begin_search("a", None);
        assert!(tracker.apply_search_result("a", &c1, &h1));
        tracker.finish_search("a", &h1);

        let h2 = tracker.begin_search("a", None);
        assert!(tracker.apply_search_result("a", &c2, &h2));
        assert_eq!(c1.affinity("a"), ControllerAffinity::Default);
        assert_eq!(c2.affinity("a"), ControllerAffinity::Preferred);
    }

    #[test]
    fn test_finish_search_only_removes_own_entry() {
        let tracker = PreferenceTracker::new();
        let old = tracker.begin_search("a", None);
        let new = tracker.begin_search("a", None);
        tracker.finish_search("a", &old);
        assert!(tracker.search_token("a").is_some());
        tracker.finish_search("a", &new);
        assert!(tracker.search_token("a").is_none());
    }

    #[test]
    fn test_empty_result_clears_only_for_live_search() {
        let tracker = PreferenceTracker::new();
        let c1 = controller("/usr/bin/python3");
        let h1 = tracker.begin_search("a", None);
        assert!(tracker.apply_search_result("a", &c1, &h1));
        tracker.finish_search("a", &h1);

        let stale = tracker.begin_search("a", None);
        let live = tracker.begin_search("a", None);
        assert!(!tracker.clear_search_result("a", &stale));
        assert_eq!(c1.affinity("a"), ControllerAffinity::Preferred);

        assert!(tracker.clear_search_result("a", &live));
        assert!(tracker.get_preferred("a").is_none());
        assert_eq!(c1.affinity("a"), ControllerAffinity::Default);
    }

    #[test]
    fn test_remove_cancels_and_clears() {
        let tracker = PreferenceTracker::new();
        let c1 = controller("/usr/bin/python3");
        let handle = tracker.begin_search("a", None);
        assert!(tracker.apply_search_result("a", &c1, &handle));

        let in_flight = tracker.begin_search("a", None);
        tracker.remove("a");
        assert!(in_flight.token.is_cancelled());
        assert!(tracker.get_preferred("a").is_none());
        assert_eq!(c1.affinity("a"), ControllerAffinity::Default);
    }

    #[test]
    fn test_selection_cancels_running_search() {
        let tracker = PreferenceTracker::new();
        let chosen = controller("/opt/venv/bin/python");
        let handle = tracker.begin_search("a", None);
        tracker.apply_selection("a", &chosen);
        assert!(handle.token.is_cancelled());
        assert!(!tracker.apply_search_result("a", &controller("/usr/bin/python3"), &handle));
        assert!(Arc::ptr_eq(&tracker.get_preferred("a").unwrap(), &chosen));
    }
}
