//! mdlink - watch a folder on the metadata server
//!
//! Connects with a device signing key, registers for updates on one folder
//! and logs every update until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Watch a folder with the default config
//! mdlink --folder 000102030405060708090a0b0c0d0e16 --seed <hex> --device-kid <kid>
//!
//! # Point at another server
//! mdlink --server-url wss://md.example.com --folder ... --seed ... --device-kid ...
//!
//! # Custom config file
//! mdlink --config /path/to/config.toml --folder ...
//! ```

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use mdserver_link::config::default_config_path;
use mdserver_link::{
    Collaborators, Config, Ed25519Signer, Kid, KeyProvider, MdServerError, MetadataClient, MetadataRevision,
    TlfId, WsTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mdlink")]
#[command(about = "Watch a folder on the metadata server")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Metadata server WebSocket URL
    #[arg(long, env = "MDSERVER_URL")]
    server_url: Option<String>,

    /// Folder ID to watch (hex)
    #[arg(long)]
    folder: TlfId,

    /// Ed25519 signing seed for auth tokens (32 bytes, hex)
    #[arg(long, env = "MDLINK_SIGNING_SEED", hide_env_values = true)]
    seed: String,

    /// This device's crypt public key ID
    #[arg(long, env = "MDLINK_DEVICE_KID")]
    device_kid: String,
}

/// The device key never changes for the life of the process.
struct StaticKey(Kid);

#[async_trait]
impl KeyProvider for StaticKey {
    async fn current_crypt_public_key(&self) -> Result<Kid, MdServerError> {
        Ok(self.0.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mdserver_link=info".parse()?))
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(url) = args.server_url {
        config.server_url = url;
    }

    let signer = Ed25519Signer::from_hex(&args.seed).context("reading signing seed")?;
    info!(
        server = %config.server_url,
        folder = %args.folder,
        verifying_key = %signer.verifying_key_hex(),
        "Starting mdlink"
    );

    let client = MetadataClient::new(
        &config,
        Collaborators {
            transport: Arc::new(WsTransport::from_config(&config)),
            signer: Arc::new(signer),
            keys: Arc::new(StaticKey(args.device_kid)),
            rekey: None,
        },
    );

    let cancel = CancellationToken::new();
    let watcher = watch_folder(&client, &cancel, args.folder);

    tokio::select! {
        result = watcher => {
            if let Err(e) = result {
                warn!(error = %e, "Watcher stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Register, wait, log, repeat. Only cancellation or shutdown ends the loop.
async fn watch_folder(client: &MetadataClient, cancel: &CancellationToken, folder: TlfId) -> Result<(), MdServerError> {
    let mut updates = 0u64;
    loop {
        let receiver = match client
            .register_for_update(cancel, folder, MetadataRevision::UNINITIALIZED)
            .await
        {
            Ok(receiver) => receiver,
            Err(e) if e.is_throttle() => {
                warn!(error = %e, "Throttled, waiting before registering again");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        match receiver.await {
            Ok(Ok(())) => {
                updates += 1;
                info!(folder = %folder, updates = updates, "Folder updated");
            }
            Ok(Err(e)) => info!(folder = %folder, reason = %e, "Update wait ended, registering again"),
            Err(_) => info!(folder = %folder, "Update wait abandoned, registering again"),
        }
    }
}
