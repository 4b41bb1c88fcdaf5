//! kernel-select CLI entry point.
//!
//! Discovers kernel connections on this machine (or from a remote server
//! snapshot) and shows which one a notebook would be attached to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;

use kernel_select::connection::PythonInterpreter;
use kernel_select::discovery::{
    default_kernelspec_dirs, watch_kernelspec_dirs, InterpreterFinder, KernelDiscovery,
    LocalKernelspecFinder, RemoteSnapshotFinder,
};
use kernel_select::interpreter::{EnvironmentInterpreterService, InterpreterService, StaticInterpreterService};
use kernel_select::ranking::{KernelRankingHelper, MatchTier, RankRequest};
use kernel_select::remote_kernel_ids::{JsonRemoteKernelIdStore, PreferredRemoteKernelIdProvider};
use kernel_select::settings::{load_settings, load_settings_from, settings_schema};
use kernel_select::{
    ControllerPreferredService, ControllerRegistry, KernelConnectionMetadata, LaunchMode,
    NotebookDocument, SelectionSettings, ViewType,
};

#[derive(Parser, Debug)]
#[command(name = "kernel-select")]
#[command(about = "Pick the kernel a Jupyter notebook should run on")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Settings file (default: <config dir>/runt-notebook/kernel-selection.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Use kernels from a remote server snapshot instead of local ones
    #[arg(long, global = true)]
    remote_snapshot: Option<PathBuf>,

    /// Treat this interpreter as the active one
    #[arg(long, global = true)]
    python: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List discovered kernel connections
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rank every connection against a notebook, best first
    Rank {
        /// Notebook (.ipynb) to rank for
        notebook: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the preferred kernel for a notebook
    Preferred {
        /// Notebook (.ipynb) to resolve
        notebook: PathBuf,

        /// Resolve for an interactive window instead of the notebook editor
        #[arg(long)]
        interactive: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Keep notebooks' preferred kernels up to date as kernelspecs change
    Watch {
        /// Notebooks (.ipynb) to track
        #[arg(required = true)]
        notebooks: Vec<PathBuf>,
    },

    /// Print the JSON Schema of the settings file
    Schema,
}

#[derive(Tabled)]
struct ConnectionRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&KernelConnectionMetadata> for ConnectionRow {
    fn from(connection: &KernelConnectionMetadata) -> Self {
        ConnectionRow {
            name: connection.display_name(),
            language: connection.language().to_string(),
            kind: connection.kind().to_string(),
            id: connection.id().to_string(),
        }
    }
}

#[derive(Tabled)]
struct RankRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "MATCH")]
    tier: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
}

#[derive(Serialize)]
struct RankedJson<'a> {
    tier: String,
    connection: &'a KernelConnectionMetadata,
}

#[derive(Serialize)]
struct PreferredJson {
    notebook: String,
    view_type: String,
    controller_id: Option<String>,
    connection: Option<KernelConnectionMetadata>,
}

/// Everything the subcommands share.
struct Context {
    settings: SelectionSettings,
    registry: Arc<ControllerRegistry>,
    interpreters: Arc<dyn InterpreterService>,
    remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider>,
    discovery: Arc<KernelDiscovery>,
}

impl Context {
    fn new(cli: &Cli) -> Self {
        let mut settings = match &cli.settings {
            Some(path) => load_settings_from(path),
            None => load_settings(),
        };
        if let Some(snapshot) = &cli.remote_snapshot {
            settings.remote_snapshot = Some(snapshot.clone());
            settings.launch_mode = LaunchMode::Remote;
        }

        let interpreters: Arc<dyn InterpreterService> = match &cli.python {
            Some(path) => Arc::new(StaticInterpreterService::new(Some(PythonInterpreter::new(
                path.clone(),
            )))),
            None => Arc::new(EnvironmentInterpreterService::new()),
        };
        let remote_kernel_ids: Arc<dyn PreferredRemoteKernelIdProvider> =
            Arc::new(JsonRemoteKernelIdStore::new(settings.remote_kernel_ids_path()));

        let registry = Arc::new(ControllerRegistry::new());
        let discovery = match (settings.launch_mode, &settings.remote_snapshot) {
            (LaunchMode::Remote, Some(snapshot)) => KernelDiscovery::new(registry.clone())
                .with_finder(RemoteSnapshotFinder::new(snapshot.clone())),
            _ => KernelDiscovery::new(registry.clone())
                .with_finder(InterpreterFinder::new(interpreters.clone()))
                .with_finder(LocalKernelspecFinder),
        };

        info!("Launch mode: {}", settings.launch_mode);
        Self {
            settings,
            registry,
            interpreters,
            remote_kernel_ids,
            discovery: Arc::new(discovery),
        }
    }

    async fn discover(&self) {
        self.discovery.discover(&CancellationToken::new()).await;
    }

    fn preferred_service(&self) -> Arc<ControllerPreferredService> {
        ControllerPreferredService::new(
            self.registry.clone(),
            self.interpreters.clone(),
            self.remote_kernel_ids.clone(),
            self.settings.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match &cli.command {
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&settings_schema())?);
            Ok(())
        }
        Commands::List { json } => list(&Context::new(&cli), *json).await,
        Commands::Rank { notebook, json } => rank(&Context::new(&cli), notebook, *json).await,
        Commands::Preferred {
            notebook,
            interactive,
            json,
        } => {
            let view_type = if *interactive {
                ViewType::InteractiveWindowView
            } else {
                ViewType::JupyterNotebookView
            };
            preferred(&Context::new(&cli), notebook, view_type, *json).await
        }
        Commands::Watch { notebooks } => watch(&Context::new(&cli), notebooks).await,
    }
}

async fn list(ctx: &Context, json: bool) -> Result<()> {
    ctx.discover().await;
    let connections = ctx.registry.all();

    if json {
        let plain: Vec<&KernelConnectionMetadata> = connections.iter().map(|c| c.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&plain)?);
        return Ok(());
    }

    if connections.is_empty() {
        println!("No kernels found");
        return Ok(());
    }
    let rows: Vec<ConnectionRow> = connections.iter().map(|c| ConnectionRow::from(c.as_ref())).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn rank(ctx: &Context, notebook: &Path, json: bool) -> Result<()> {
    let document = NotebookDocument::load_ipynb(notebook).await?;
    ctx.discover().await;

    let preferred_interpreter = match ctx.settings.launch_mode {
        LaunchMode::Local => ctx.interpreters.active_interpreter(Some(document.uri.as_str())).await,
        LaunchMode::Remote => None,
    };
    let cell_language = document.detected_language();
    let request = RankRequest {
        notebook_uri: &document.uri,
        metadata: document.hints(),
        preferred_interpreter: preferred_interpreter.as_ref(),
        cell_language: cell_language.as_ref(),
    };

    let ranking = KernelRankingHelper::new(ctx.remote_kernel_ids.clone());
    let mut ranked = ranking
        .rank_with_tiers(&request, &ctx.registry.all(), &CancellationToken::new())
        .await
        .unwrap_or_default();
    ranked.reverse();

    if json {
        let out: Vec<RankedJson> = ranked
            .iter()
            .map(|(tier, connection)| RankedJson {
                tier: tier_label(*tier).to_string(),
                connection: connection.as_ref(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if ranked.is_empty() {
        println!("No kernels found");
        return Ok(());
    }
    let rows: Vec<RankRow> = ranked
        .iter()
        .enumerate()
        .map(|(i, (tier, connection))| RankRow {
            rank: i + 1,
            tier: tier_label(*tier).to_string(),
            name: connection.display_name(),
            kind: connection.kind().to_string(),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn tier_label(tier: MatchTier) -> &'static str {
    match tier {
        MatchTier::RememberedLiveSession => "remembered session",
        MatchTier::ExactMatch => "exact",
        MatchTier::PreferredInterpreter => "active interpreter",
        MatchTier::LanguageMatch => "language",
        MatchTier::NoMatch => "-",
    }
}

async fn preferred(ctx: &Context, notebook: &Path, view_type: ViewType, json: bool) -> Result<()> {
    let mut document = NotebookDocument::load_ipynb(notebook).await?;
    document.view_type = view_type;
    ctx.discover().await;

    let service = ctx.preferred_service();
    let result = service.compute_preferred(&document, None).await;

    if json {
        let out = PreferredJson {
            notebook: document.uri.clone(),
            view_type: view_type.to_string(),
            controller_id: result.controller.as_ref().map(|c| c.id().to_string()),
            connection: result.connection.as_deref().cloned(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match result.connection {
        Some(connection) => println!("{} ({})", connection.display_name(), connection.id()),
        None => println!("No preferred kernel for {}", notebook.display()),
    }
    Ok(())
}

async fn watch(ctx: &Context, notebooks: &[PathBuf]) -> Result<()> {
    ctx.discover().await;

    let service = ctx.preferred_service();
    let observer = service.activate();

    for path in notebooks {
        let document = NotebookDocument::load_ipynb(path).await?;
        let result = service.on_did_open_notebook_document(document).await?;
        match result.connection {
            Some(connection) => println!("{}: {}", path.display(), connection.display_name()),
            None => println!("{}: no preferred kernel", path.display()),
        }
    }

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_kernelspec_dirs(
        default_kernelspec_dirs(),
        ctx.discovery.clone(),
        cancel.clone(),
    ));

    info!("Watching for kernel changes, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    cancel.cancel();
    service.shutdown();
    let _ = watcher.await;
    let _ = observer.await;

    for document in service.tracker().open_documents() {
        match service.get_preferred(&document) {
            Some(controller) => println!("{}: {}", document.uri, controller.connection().display_name()),
            None => println!("{}: no preferred kernel", document.uri),
        }
    }
    Ok(())
}
