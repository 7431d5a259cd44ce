use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use claimnav::{
    bridge_tabs::BridgeTabHost,
    extension_bridge::{BridgeTransport, ExtensionBridge},
    form::FormConfig,
    store::MemoryStore,
    HostConfig, HostSelectors, Timings,
};

mod host;
mod logging;

use host::{Host, SystemClipboard};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Claim handoff host - connects the portal and claim application tabs through the browser extension"
)]
struct Args {
    /// Origin of the claim application
    #[arg(long, env = "CLAIMNAV_TARGET_ORIGIN")]
    target_origin: Option<String>,

    /// Path of the claim application's entry page
    #[arg(long, env = "CLAIMNAV_ENTRY_PATH")]
    entry_path: Option<String>,

    /// Address the extension bridge listens on
    #[arg(long, env = "CLAIMNAV_BRIDGE_ADDR")]
    bridge_addr: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "CLAIMNAV_LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory for the rolling log files
    #[arg(long, env = "CLAIMNAV_LOG_DIR")]
    log_dir: Option<String>,

    /// JSON file overriding selectors and labels
    #[arg(long)]
    selectors: Option<PathBuf>,

    /// JSON file overriding timeouts and retry counts
    #[arg(long)]
    timings: Option<PathBuf>,

    /// JSON file with the form server location
    #[arg(long)]
    form_config: Option<PathBuf>,
}

impl Args {
    fn host_config(&self) -> Result<HostConfig> {
        let mut cfg = HostConfig::from_env()?;
        if let Some(v) = &self.target_origin {
            cfg.target_origin = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = &self.entry_path {
            cfg.entry_path = v.clone();
        }
        if let Some(v) = &self.bridge_addr {
            cfg.bridge_addr = v.clone();
        }
        if let Some(v) = &self.log_level {
            cfg.log_level = v.clone();
        }
        if self.log_dir.is_some() {
            cfg.log_dir = self.log_dir.clone();
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.host_config()?;
    let _log_guard = logging::init_logging(&config.log_level, config.log_dir.as_deref())?;

    let selectors = match &args.selectors {
        Some(p) => HostSelectors::from_json_file(p).context("loading selectors")?,
        None => HostSelectors::default(),
    };
    let timings = match &args.timings {
        Some(p) => Timings::from_json_file(p).context("loading timings")?,
        None => Timings::default(),
    };
    let form = match &args.form_config {
        Some(p) => serde_json::from_str::<FormConfig>(&std::fs::read_to_string(p)?)
            .context("parsing form config")?,
        None => FormConfig::default(),
    };

    tracing::info!(
        target_origin = %config.target_origin,
        bridge = %config.bridge_addr,
        "Starting claimnav host..."
    );

    let bridge = ExtensionBridge::global(&config.bridge_addr).await;
    let transport: Arc<dyn BridgeTransport> = bridge;
    let tabs = Arc::new(BridgeTabHost::new(
        transport.clone(),
        timings.delivery_timeout(),
    ));
    let host = Arc::new(Host::new(
        transport,
        tabs,
        Arc::new(MemoryStore::new()),
        config,
        selectors,
        timings,
        form,
        Arc::new(SystemClipboard),
    ));

    println!("claimnav host running; press Ctrl+C to stop");
    tokio::select! {
        _ = host.run() => {}
        r = tokio::signal::ctrl_c() => {
            r?;
            tracing::info!("Shutting down claimnav host");
        }
    }
    Ok(())
}
