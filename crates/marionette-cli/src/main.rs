//! marionette CLI entry point.

mod args;
mod driver;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use marionette_core::content::ScreenImage;
use marionette_core::elements::Element;
use marionette_core::error::ClientError;
use marionette_core::target::TapTarget;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::args::{CallArgs, Cli, Commands, ElementsArgs, PeerCommand, ScreenshotArgs, TapArgs};
use crate::driver::{DriverConfig, Session};

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let command = match &cli.command {
        Commands::Examples => {
            println!("{}", crate::args::EXAMPLES_TEXT);
            return;
        }
        Commands::Peer(command) => command,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(&cli, command)) {
        match e.downcast_ref::<ClientError>() {
            Some(client_error) => {
                eprintln!("Error: {:#} (hint: {})", e, client_error.suggestion())
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

/// Apply command-line flags on top of the environment.
fn build_config(cli: &Cli) -> DriverConfig {
    let mut config = DriverConfig::from_env();
    if let Some(peer) = &cli.peer {
        config.peer_command = peer.split_whitespace().map(str::to_string).collect();
    }
    if let Some(uri) = &cli.uri {
        config.endpoint_uri = Some(uri.clone());
    }
    if let Some(ms) = cli.timeout {
        config.call_timeout = Duration::from_millis(ms);
    }
    config
}

/// Start a session, run one command, and stop the peer on every path.
async fn run(cli: &Cli, command: &PeerCommand) -> anyhow::Result<()> {
    let mut session = Session::start(build_config(cli)).await?;
    log_notifications(&session);

    let result = tokio::select! {
        result = run_command(&mut session, command) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, stopping peer");
            Err(anyhow!("interrupted"))
        }
    };

    session.shutdown().await;
    result
}

/// Log whatever the peer announces while a command runs.
fn log_notifications(session: &Session) {
    let mut notifications = session.client().subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(note) => info!(
                    target: "marionette::peer",
                    "{} {}",
                    note.method,
                    note.params.unwrap_or_default()
                ),
                Err(RecvError::Lagged(missed)) => {
                    debug!("Skipped {} peer notifications", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_command(session: &mut Session, command: &PeerCommand) -> anyhow::Result<()> {
    match command {
        PeerCommand::Probe => {
            let result = session
                .initialize_result()
                .context("Handshake did not produce a result")?;
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        PeerCommand::Tools => {
            for tool in session.list_tools().await? {
                let summary = tool
                    .description
                    .as_deref()
                    .and_then(|d| d.lines().next())
                    .unwrap_or_default();
                println!("{:<28} {}", tool.name, summary);
            }
        }
        PeerCommand::Connect => {
            let connected = connect(session).await?;
            println!("{}", connected);
        }
        PeerCommand::Elements(args) => print_elements(session, args).await?,
        PeerCommand::Tap(args) => tap(session, args).await?,
        PeerCommand::Screenshot(args) => screenshot(session, args).await?,
        PeerCommand::Call(args) => call(session, args).await?,
    }
    Ok(())
}

/// Attach to the configured endpoint. Returns the peer's status text.
async fn connect(session: &mut Session) -> anyhow::Result<String> {
    let uri = session.config().endpoint_uri.clone().ok_or_else(|| {
        anyhow!("No debug endpoint configured: pass --uri or set MARIONETTE_VM_URI")
    })?;
    let connected = session.connect(&uri).await?;
    info!("{}", connected.message);
    Ok(connected.message)
}

async fn print_elements(session: &mut Session, args: &ElementsArgs) -> anyhow::Result<()> {
    connect(session).await?;
    let listing = session.list_interactive_elements().await?;

    if args.raw {
        println!("{}", listing.raw);
    } else if args.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for element in listing.iter() {
            println!("{}", describe(element));
        }
        println!("{} interactive elements", listing.len());
    }
    Ok(())
}

fn describe(element: &Element) -> String {
    let mut line = element.kind.clone();
    if let Some(text) = &element.text {
        line.push_str(&format!(" {:?}", text));
    }
    if let Some(key) = &element.key {
        line.push_str(&format!(" key={}", key));
    }
    if let Some(bounds) = element.bounds {
        let (x, y) = bounds.center();
        line.push_str(&format!(" at {:.0},{:.0}", x, y));
    }
    line
}

async fn tap(session: &mut Session, args: &TapArgs) -> anyhow::Result<()> {
    let target = match (&args.target, &args.at) {
        (_, Some(point)) => TapTarget::parse_point(point)?,
        (Some(locator), None) => TapTarget::text_or_key(locator.as_str())?,
        (None, None) => bail!("Nothing to tap: give a text or key, or --at X,Y"),
    };

    connect(session).await?;
    let outcome = session.tap(&target).await?;
    if !outcome.success {
        bail!("Tap on {} failed: {}", target, outcome.message);
    }
    println!("{}", outcome.message);
    Ok(())
}

async fn screenshot(session: &mut Session, args: &ScreenshotArgs) -> anyhow::Result<()> {
    connect(session).await?;
    let images = session.capture_screen().await?;

    for (index, image) in images.iter().enumerate() {
        let path = screenshot_path(args.output.as_deref(), image, index);
        std::fs::write(&path, &image.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {} ({} bytes)", path.display(), image.len());
    }
    Ok(())
}

/// `screenshot_<YYYYmmdd_HHMMSS>.<ext>` unless a path was given. Images
/// after the first get `_<n>` before the extension.
fn screenshot_path(output: Option<&Path>, image: &ScreenImage, index: usize) -> PathBuf {
    let base = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            PathBuf::from(format!("screenshot_{}.{}", stamp, image.extension()))
        }
    };
    if index == 0 {
        return base;
    }

    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "screenshot".to_string());
    let extension = base
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.extension().to_string());
    base.with_file_name(format!("{}_{}.{}", stem, index + 1, extension))
}

async fn call(session: &mut Session, args: &CallArgs) -> anyhow::Result<()> {
    let arguments: Value =
        serde_json::from_str(&args.args).context("--args must be a JSON object")?;
    if !arguments.is_object() {
        bail!("--args must be a JSON object, got {}", arguments);
    }

    connect(session).await?;
    let result = session.call_tool(&args.tool, arguments).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.is_error {
        bail!("Tool '{}' reported an error", args.tool);
    }
    Ok(())
}
