//! Quill engine probe
//!
//! Starts the engine, opens each file given on the command line and logs
//! every event the engine sends until it exits or Ctrl-C is pressed.
//!
//! ```text
//! quill-probe [--config engine.json] [--theme NAME] [FILE]...
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use quill_core::rpc::EngineNotification;
use quill_core::{DelegateEvent, EngineClient, EngineConfig, ForwardingDelegate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "quill-probe")]
#[command(about = "Start the Quill engine, open files and log engine events")]
struct Args {
    /// Engine configuration file (JSON); defaults to QUILL_ENGINE
    #[arg(long)]
    config: Option<PathBuf>,

    /// Theme to select after startup
    #[arg(long)]
    theme: Option<String>,

    /// Files to open, one view each
    files: Vec<PathBuf>,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?.apply_env_overrides(),
        None => EngineConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("Starting engine: {}", config.binary_path.display());

    let (delegate, events) = ForwardingDelegate::new();
    let client = EngineClient::spawn(&config, Arc::new(delegate))
        .with_context(|| format!("failed to start {}", config.binary_path.display()))?;
    let event_log = tokio::spawn(log_events(events));

    let config_dir = dirs::config_dir().map(|dir| dir.join("quill"));
    client.client_started(config_dir.as_deref(), None)?;

    if let Some(theme) = &args.theme {
        client.set_theme(theme)?;
    }

    for file in &args.files {
        match tokio::time::timeout(CALL_TIMEOUT, client.new_view(Some(file))).await {
            Ok(Ok(view_id)) => info!("Opened {} as {}", file.display(), view_id),
            Ok(Err(e)) => error!("Failed to open {}: {}", file.display(), e),
            Err(_) => warn!("Engine did not answer new_view for {}", file.display()),
        }
    }

    let mut state = client.connection().subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down engine");
            client.shutdown().await;
        }
        closed = state.wait_for(|state| state.is_closed()) => {
            if let Ok(state) = closed {
                info!("Engine connection {}", *state);
            }
        }
    }

    let diagnostics = client.connection().diagnostics();
    info!(
        "Responses: {}, notifications: {}, engine requests: {}, framing errors: {}, protocol errors: {}",
        diagnostics.responses,
        diagnostics.notifications,
        diagnostics.engine_requests,
        diagnostics.framing_errors,
        diagnostics.protocol_errors
    );

    drop(client);
    let _ = event_log.await;
    Ok(())
}

async fn log_events(mut events: UnboundedReceiver<DelegateEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DelegateEvent::Notification(EngineNotification::Update(params)) => {
                info!(
                    "update {}: {} op(s), pristine={}",
                    params.view_id,
                    params.update.ops.len(),
                    params.update.pristine
                );
            }
            DelegateEvent::Notification(EngineNotification::Alert(params)) => {
                warn!("engine alert: {}", params.msg);
            }
            DelegateEvent::Notification(notification) => {
                info!("{}: {}", notification.method(), summarize(&notification));
            }
            DelegateEvent::Closed(reason) => {
                info!("Connection closed: {}", reason);
                break;
            }
        }
    }
}

fn summarize(notification: &EngineNotification) -> String {
    let text = format!("{:?}", notification);
    if text.len() > 160 {
        let mut end = 160;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}
