//! labcomm CLI entry point.
//!
//! Connects to a backend's action channel (a Unix socket or TCP address
//! speaking newline-delimited JSON) and drives it headlessly: status checks,
//! backend startup, and notebook conversion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labcomm::frontend::{CollisionChoice, LogFrontEnd, NudgeChoice};
use labcomm::line_transport::LineTransport;
use labcomm::notebook::NotebookRef;
use labcomm::settings::{load_settings, load_settings_from, save_settings_to, settings_path};
use labcomm::workflow::WorkflowOutcome;
use labcomm::{Bridge, Settings};
use log::info;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Parser, Debug)]
#[command(name = "labcomm")]
#[command(about = "Drive a notebook backend over its action channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Settings file (default: <config dir>/labcomm/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Notebook server URL (overrides the settings file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Directory relative notebook paths resolve against
    #[arg(long, global = true)]
    server_root: Option<PathBuf>,

    /// Delay between backend status probes, in milliseconds
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query backend status
    Status {
        #[command(flatten)]
        target: Target,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start the backend and wait until it is up and licensed
    EnsureReady {
        #[command(flatten)]
        target: Target,
    },

    /// Convert a notebook to a live script and open it in the backend editor
    Convert {
        #[command(flatten)]
        target: Target,

        /// Also open the backend UI in a browser tab
        #[arg(long)]
        open: bool,

        /// Overwrite an existing live script
        #[arg(long, conflicts_with = "new_name")]
        overwrite: bool,

        /// Write to this file name instead if the live script exists
        #[arg(long)]
        new_name: Option<String>,
    },

    /// Stay attached and act on backend nudges until interrupted
    Listen {
        #[command(flatten)]
        target: Target,

        /// Convert and open when nudged instead of ignoring
        #[arg(long)]
        accept_nudges: bool,
    },

    /// Print the effective settings
    Settings {
        /// Write the effective settings back to the settings file
        #[arg(long)]
        save: bool,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Backend channel: a Unix socket path or host:port
    #[arg(long)]
    connect: String,

    /// Notebook the channel belongs to
    #[arg(long, default_value = "notebook.ipynb")]
    notebook: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    if let Some(server_root) = cli.server_root {
        settings.server_root = Some(server_root);
    }
    if let Some(interval) = cli.poll_interval_ms {
        settings.poll_interval_ms = interval;
    }

    match cli.command {
        Commands::Status { target, json } => status(settings, target, json).await,
        Commands::EnsureReady { target } => ensure_ready(settings, target).await,
        Commands::Convert {
            target,
            open,
            overwrite,
            new_name,
        } => {
            let collision = match (overwrite, new_name) {
                (true, _) => CollisionChoice::Overwrite,
                (false, Some(name)) => CollisionChoice::Rename(name),
                (false, None) => CollisionChoice::Cancel,
            };
            convert(settings, target, open, collision).await
        }
        Commands::Listen {
            target,
            accept_nudges,
        } => listen(settings, target, accept_nudges).await,
        Commands::Settings { save } => {
            let path = cli.settings.unwrap_or_else(settings_path);
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                save_settings_to(&path, &settings)?;
            }
            Ok(())
        }
    }
}

struct Session {
    bridge: Arc<Bridge>,
    notebook: NotebookRef,
}

impl Session {
    async fn open(settings: Settings, target: &Target, frontend: LogFrontEnd) -> Result<Self> {
        let (reader, writer) = connect(&target.connect).await?;
        let (transport, inbound) = LineTransport::spawn(reader, writer);

        let notebook = NotebookRef::new(target.notebook.to_string_lossy(), target.notebook.clone())
            .with_language(settings.target_language.clone());
        let bridge = Bridge::new(settings, Arc::new(frontend));
        if bridge
            .attach(notebook.clone(), Box::new(transport), inbound)
            .is_none()
        {
            bail!("{} is not a managed notebook", target.notebook.display());
        }
        Ok(Self { bridge, notebook })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.bridge.shutdown();
    }
}

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

async fn connect(endpoint: &str) -> Result<(BoxedRead, BoxedWrite)> {
    if let Ok(addr) = endpoint.parse::<std::net::SocketAddr>() {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let (read, write) = stream.into_split();
        return Ok((Box::new(read), Box::new(write)));
    }
    connect_local(endpoint).await
}

#[cfg(unix)]
async fn connect_local(path: &str) -> Result<(BoxedRead, BoxedWrite)> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| format!("Failed to connect to {}", path))?;
    let (read, write) = stream.into_split();
    Ok((Box::new(read), Box::new(write)))
}

#[cfg(not(unix))]
async fn connect_local(endpoint: &str) -> Result<(BoxedRead, BoxedWrite)> {
    bail!("{} is not a host:port address", endpoint)
}

async fn status(settings: Settings, target: Target, json: bool) -> Result<()> {
    let session = Session::open(settings, &target, LogFrontEnd::new()).await?;
    let record = session
        .bridge
        .dispatcher()
        .status(&session.notebook.id)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Backend: {}", record.status);
        println!("Licensed: {}", if record.is_licensed { "yes" } else { "no" });
    }
    Ok(())
}

async fn ensure_ready(settings: Settings, target: Target) -> Result<()> {
    let session = Session::open(settings, &target, LogFrontEnd::new()).await?;
    let orchestrator = session.bridge.orchestrator().clone();
    let id = session.notebook.id.clone();

    let record = tokio::select! {
        record = orchestrator.ensure_backend_ready(&id) => record?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            bail!("Interrupted");
        }
    };
    println!("Backend {} and licensed", record.status);
    Ok(())
}

async fn convert(
    settings: Settings,
    target: Target,
    open: bool,
    collision: CollisionChoice,
) -> Result<()> {
    let frontend = LogFrontEnd::new().with_collision(collision);
    let session = Session::open(settings, &target, frontend).await?;
    let orchestrator = session.bridge.orchestrator().clone();
    let notebook = session.notebook.clone();

    let run = async {
        if open {
            orchestrator.convert_and_open(&notebook).await
        } else {
            orchestrator.convert_and_edit(&notebook).await
        }
    };
    let outcome = tokio::select! {
        outcome = run => outcome?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            bail!("Interrupted");
        }
    };

    match outcome {
        WorkflowOutcome::Completed { mlx_file_path } => {
            println!("{}", mlx_file_path);
            if open {
                // The browser tab opens after a short delay
                tokio::time::sleep(orchestrator.config().open_delay).await;
                tokio::task::yield_now().await;
            }
        }
        WorkflowOutcome::Aborted => info!("Conversion cancelled"),
    }
    Ok(())
}

async fn listen(settings: Settings, target: Target, accept_nudges: bool) -> Result<()> {
    let nudge = if accept_nudges {
        NudgeChoice::Open
    } else {
        NudgeChoice::Ignore
    };
    let session = Session::open(settings, &target, LogFrontEnd::new().with_nudge(nudge)).await?;
    info!(
        "Listening on {} for {}",
        target.connect,
        session.notebook.path.display()
    );

    let bridge = &session.bridge;
    let closed = async {
        while bridge.notebook(&session.notebook.id).is_some() {
            tokio::time::sleep(bridge.settings().poll_interval()).await;
        }
    };

    tokio::select! {
        _ = closed => info!("Channel closed by backend"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    Ok(())
}
