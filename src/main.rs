//! Reference driver: runs one scan job against a local or cloud scanner.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use twain_direct::{
    CloudSession, Error, ReceivedImage, Result, ScannerDescriptor, Session, SessionEvent,
    SessionOptions, TokenPair,
};

// ============================================================================
// Constants
// ============================================================================

/// One black-and-white sheet.
const DEFAULT_TASK: &str = r#"{"actions":[{"action":"configure","streams":[{"sources":[{"source":"any","pixelFormats":[{"pixelFormat":"bw1","attributes":[{"attribute":"compression","values":[{"value":"autoVersion1"}]},{"attribute":"numberOfSheets","values":[{"value":1}]}]}]}]}]}]}"#;

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Parser)]
#[command(version, about = "TWAIN Direct scanning client")]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scan job.
    Run {
        #[command(subcommand)]
        target: Target,

        /// Task document to send instead of the default one-sheet task.
        #[arg(long, global = true)]
        task: Option<PathBuf>,

        /// Directory to copy received images into.
        #[arg(long, global = true)]
        output: Option<PathBuf>,

        /// Log at debug level.
        #[arg(long, global = true)]
        debug: bool,
    },
}

#[derive(Debug, Subcommand)]
enum Target {
    /// Scanner on the local network.
    Local {
        /// Scanner base URL, e.g. `https://scanner.local:34034/`.
        url: Url,

        /// Resolve the scanner's host to this address.
        #[arg(long)]
        ip: Option<IpAddr>,
    },

    /// Scanner behind the cloud relay.
    Cloud {
        api_root: Url,
        scanner_id: String,
        auth_token: String,
        refresh_token: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let Arguments { command } = Arguments::parse();
    let Command::Run {
        target,
        task,
        output,
        debug,
    } = command;

    init_logging(debug);

    match run(target, task.as_deref(), output.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Scan failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug {
        "twain_direct=debug"
    } else {
        "twain_direct=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ============================================================================
// Scan Job
// ============================================================================

async fn run(target: Target, task: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let task = load_task(task).await?;
    if let Some(dir) = output {
        tokio::fs::create_dir_all(dir).await?;
    }

    match target {
        Target::Local { url, ip } => {
            info!(%url, "Opening local session");
            let descriptor = ScannerDescriptor::local(url, ip);
            let (session, events) = Session::local(&descriptor, SessionOptions::new())?;
            scan(&session, events, task, output).await
        }
        Target::Cloud {
            api_root,
            scanner_id,
            auth_token,
            refresh_token,
        } => {
            info!(%api_root, %scanner_id, "Opening cloud session");
            let tokens = TokenPair::new(auth_token, refresh_token);
            let (cloud, events) =
                CloudSession::connect(api_root, &scanner_id, tokens, SessionOptions::cloud())
                    .await?;
            scan(cloud.session(), events, task, output).await
        }
    }
}

async fn load_task(path: Option<&Path>) -> Result<Value> {
    let text = match path {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => DEFAULT_TASK.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

async fn scan(
    session: &Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    task: Value,
    output: Option<&Path>,
) -> Result<()> {
    let session_id = session.open().await?;
    info!(%session_id, "Session open");

    let reply = session.send_task(task).await?;
    info!(task = %reply, "Task accepted");

    session.start_capturing().await?;
    info!("Capturing");

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(Error::ConnectionClosed);
                };
                match event {
                    SessionEvent::ImageReceived(image) => save_image(&image, output).await?,
                    SessionEvent::StateChanged(state) => info!(%state, "State changed"),
                    SessionEvent::StatusChanged(status) => {
                        warn!(detected = status.detected.as_str(), "Scanner status");
                    }
                    SessionEvent::DoneCapturing => {
                        info!("Done capturing");
                        return Ok(());
                    }
                    SessionEvent::ConnectionError(e) => return Err(e),
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, stopping capture");
                session.stop().await?;
            }
        }
    }
}

async fn save_image(image: &ReceivedImage, output: Option<&Path>) -> Result<()> {
    info!(
        path = %image.path.display(),
        first_block = image.first_block,
        last_block = image.last_block,
        "Image received"
    );

    if let Some(dir) = output
        && let Some(name) = image.path.file_name()
    {
        let target = dir.join(name);
        tokio::fs::copy(&image.path, &target).await?;
        info!(path = %target.display(), "Image saved");
    }
    tokio::fs::remove_file(&image.path).await?;
    Ok(())
}
