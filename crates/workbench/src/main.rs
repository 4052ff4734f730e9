//! workbench CLI entry point.
//!
//! Manages notebooks and kernels on a Jupyter server and runs notebooks
//! cell by cell from the terminal.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::Value;
use uuid::Uuid;

use workbench::credentials::CredentialStore;
use workbench::settings::{load_settings, AppSettings};
use workbench::{
    execute_cell, Cell, ContentStore, ExecuteError, FailedRunCount, JupyterClient, KernelSession,
    Mutation, Notebook, NotebookStore, OutputRecord, SessionError,
};

#[derive(Parser, Debug)]
#[command(name = "workbench")]
#[command(about = "Run notebooks against kernels on a Jupyter server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Jupyter server URL (default from settings)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Server user (default from settings)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Access token (default: WORKBENCH_TOKEN or the stored token)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store an access token
    Login { token: String },

    /// Forget the stored access token
    Logout,

    /// Manage notebooks
    Notebooks {
        #[command(subcommand)]
        command: NotebookCommands,
    },

    /// Manage kernels
    Kernels {
        #[command(subcommand)]
        command: KernelCommands,
    },

    /// Execute every code cell of a notebook, in order
    Run {
        /// Notebook path on the server
        path: String,

        /// Use a running kernel instead of starting one
        #[arg(long)]
        kernel: Option<String>,
    },

    /// Execute a snippet of code
    Exec {
        code: String,

        /// Use a running kernel instead of starting one
        #[arg(long)]
        kernel: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum NotebookCommands {
    List,
    Create { name: String },
    Delete { path: String },
}

#[derive(Subcommand, Debug)]
enum KernelCommands {
    List,
    Start {
        /// Kernel spec name (default from settings)
        #[arg(long)]
        name: Option<String>,
    },
    Stop { id: String },
}

/// Content store for scratch notebooks that are never saved.
struct Discard;

impl ContentStore for Discard {
    async fn save_notebook(&self, _path: &str, _document: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if let Some(url) = cli.server_url {
        settings.server_url = url;
    }
    if let Some(user) = cli.user {
        settings.username = user;
    }
    let credentials = CredentialStore::default();
    let token = cli.token.or_else(|| credentials.load());

    match cli.command {
        Commands::Login { token } => {
            credentials.save(&token)?;
            println!("Token saved to {}", credentials.path().display());
            Ok(())
        }
        Commands::Logout => {
            credentials.clear()?;
            println!("Token removed");
            Ok(())
        }
        Commands::Notebooks { command } => {
            let client = client(&settings, token)?;
            notebooks(&client, command).await
        }
        Commands::Kernels { command } => {
            let client = client(&settings, token)?;
            kernels(&client, &settings, command).await
        }
        Commands::Run { path, kernel } => {
            let client = client(&settings, token.clone())?;
            let notebook = client.load_notebook(&path).await?;
            run(&client, &settings, token, notebook, kernel, true).await
        }
        Commands::Exec { code, kernel } => {
            let client = client(&settings, token.clone())?;
            let mut notebook = Notebook::new("scratch", "scratch.ipynb");
            notebook.push_cell(Cell::with_source(Uuid::new_v4().to_string(), code));
            run(&client, &settings, token, notebook, kernel, false).await
        }
    }
}

fn client(settings: &AppSettings, token: Option<String>) -> anyhow::Result<JupyterClient> {
    JupyterClient::new(&settings.server_url, settings.username.clone(), token)
        .with_context(|| format!("bad server url {}", settings.server_url))
}

async fn notebooks(client: &JupyterClient, command: NotebookCommands) -> anyhow::Result<()> {
    match command {
        NotebookCommands::List => {
            for nb in client.list_notebooks().await? {
                println!(
                    "{}\t{}",
                    nb.path,
                    nb.last_modified.as_deref().unwrap_or("-")
                );
            }
        }
        NotebookCommands::Create { name } => {
            let model = client.create_notebook(&name).await?;
            println!("{}", model.path);
        }
        NotebookCommands::Delete { path } => {
            client.delete_notebook(&path).await?;
        }
    }
    Ok(())
}

async fn kernels(
    client: &JupyterClient,
    settings: &AppSettings,
    command: KernelCommands,
) -> anyhow::Result<()> {
    match command {
        KernelCommands::List => {
            for kernel in client.list_kernels().await? {
                println!(
                    "{}\t{}\t{}",
                    kernel.id,
                    kernel.name,
                    kernel.execution_state.as_deref().unwrap_or("-")
                );
            }
        }
        KernelCommands::Start { name } => {
            let name = name.unwrap_or_else(|| settings.kernel_name.clone());
            let kernel = client.create_kernel(&name).await?;
            println!("{}", kernel.id);
        }
        KernelCommands::Stop { id } => {
            client.delete_kernel(&id).await?;
        }
    }
    Ok(())
}

fn print_output(output: &OutputRecord) {
    match output {
        OutputRecord::Stream {
            source_stream: kernel_wire::StreamName::Stderr,
            text,
        } => eprint!("{text}"),
        OutputRecord::Stream { text, .. } => print!("{text}"),
        OutputRecord::Error { .. } => eprintln!("{}", output.to_text()),
        _ => println!("{}", output.to_text()),
    }
}

/// Execute every cell of `notebook` on a kernel, printing outputs as each
/// cell finishes. Stops at the first lost connection.
async fn run(
    client: &JupyterClient,
    settings: &AppSettings,
    token: Option<String>,
    notebook: Notebook,
    kernel: Option<String>,
    save: bool,
) -> anyhow::Result<()> {
    let (kernel_id, started) = match kernel {
        Some(id) => (id, false),
        None => (client.create_kernel(&settings.kernel_name).await?.id, true),
    };

    let url = client.kernel_channels_url(&kernel_id, &Uuid::new_v4().to_string())?;
    let mut session = KernelSession::new(url).with_connect_timeout(settings.connect_timeout());
    if let Some(token) = token {
        session = session.with_token(token);
    }

    let result = run_cells(
        client,
        &mut session,
        settings.failed_run_count,
        notebook,
        &kernel_id,
        save,
    )
    .await;

    session.disconnect();
    if started {
        if let Err(e) = client.delete_kernel(&kernel_id).await {
            warn!("Failed to stop kernel {}: {}", kernel_id, e);
        }
    }
    result
}

async fn run_cells(
    client: &JupyterClient,
    session: &mut KernelSession,
    policy: FailedRunCount,
    notebook: Notebook,
    kernel_id: &str,
    save: bool,
) -> anyhow::Result<()> {
    session.connect().await?;

    let store = NotebookStore::new();
    let notebook_id = notebook.id.clone();
    let cell_ids: Vec<String> = notebook.cells().iter().map(|c| c.id.clone()).collect();
    store.apply(Mutation::AddNotebook(notebook))?;
    store.apply(Mutation::SetKernel {
        notebook_id: notebook_id.clone(),
        kernel_id: Some(kernel_id.to_string()),
    })?;

    let mut failed = 0;
    for cell_id in &cell_ids {
        let outcome = if save {
            execute_cell(&store, session, client, &notebook_id, cell_id, policy).await
        } else {
            execute_cell(&store, session, &Discard, &notebook_id, cell_id, policy).await
        };

        if let Some(cell) = store.snapshot().cell(&notebook_id, cell_id) {
            cell.outputs().iter().for_each(|o| print_output(o));
        }

        match outcome {
            Ok(summary) => {
                info!("Cell {} -> {:?}", cell_id, summary.status);
                if summary.status != kernel_wire::ReplyStatus::Ok {
                    failed += 1;
                }
            }
            Err(ExecuteError::Session(SessionError::ConnectionError(e))) => {
                bail!("lost connection to kernel {kernel_id}: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if save {
        let snapshot = store.snapshot();
        if let Some(nb) = snapshot.notebook(&notebook_id) {
            client.save_notebook(&nb.path, nb.to_document()).await?;
        }
    }

    if failed > 0 {
        bail!("{failed} cell(s) failed");
    }
    Ok(())
}
