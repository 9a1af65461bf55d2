//! Coffre keygen - one-shot provisioning of a new encryption key version.
//!
//! Generates a fresh RSA-4096 encryption key, wraps it under the master key,
//! and writes `encryption_key_v_<N>.pem` into the key directory. Refuses to
//! overwrite an existing version: encryption key versions are immutable once
//! created.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coffre_crypto::AsymmetricKey;
use coffre_envelope::key_file_path;

#[derive(Parser)]
#[command(name = "coffre-keygen")]
#[command(about = "Coffre keygen - Provision a new encryption key version")]
#[command(version)]
struct Cli {
    /// Master key material, PEM/PKCS#1
    #[arg(long, env = "MASTER_KEY", hide_env_values = true)]
    master_key: String,

    /// Directory holding encryption key files
    #[arg(long, default_value = "encryption_keys", env = "ENCRYPTION_KEY_PATH")]
    key_dir: PathBuf,

    /// Version number for the new encryption key
    #[arg(short = 'v', long, default_value_t = 1)]
    key_version: i64,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let master_key =
        AsymmetricKey::from_pem(cli.master_key.as_bytes()).context("loading master key")?;

    let path = key_file_path(&cli.key_dir, cli.key_version);
    if path.exists() {
        bail!(
            "key version {} already exists: {}",
            cli.key_version,
            path.display()
        );
    }

    tracing::info!(version = cli.key_version, "generating encryption key");
    let key = AsymmetricKey::generate().context("generating encryption key")?;

    let raw_key = key.to_pem().context("serializing encryption key")?;
    let wrapped = master_key
        .encrypt(&raw_key)
        .context("wrapping encryption key under master key")?;

    std::fs::create_dir_all(&cli.key_dir)
        .with_context(|| format!("creating key directory {}", cli.key_dir.display()))?;
    std::fs::write(&path, wrapped)
        .with_context(|| format!("writing key file {}", path.display()))?;

    tracing::info!(path = %path.display(), "key file created");

    Ok(())
}
