//! Instruments master download
//!
//! The exchange publishes the contracts file as gzipped JSON. Download is
//! streamed to a temporary file, extracted, sanity-parsed, and moved into
//! place. Entirely outside the token lifecycle.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ContractsSettings;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Download and extract the instruments master. Returns the extracted
/// file's path.
pub async fn download(settings: &ContractsSettings) -> Result<PathBuf> {
    let uri = settings
        .uri
        .as_deref()
        .context("CONTRACTS_URI is not configured")?;
    let target = settings
        .instruments_path
        .as_deref()
        .context("INSTRUMENTS_JSON is not configured")?;

    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    tracing::info!("downloading contracts from {}", uri);
    println!("Downloading contracts from {}...", uri);

    let client = reqwest::Client::new();
    let mut resp = client
        .get(uri)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .context("Contracts download failed")?;

    let status = resp.status();
    if !status.is_success() {
        bail!("Contracts download rejected (HTTP {})", status.as_u16());
    }

    let mut gz_path = target.as_os_str().to_owned();
    gz_path.push(".gz");
    let gz_path = PathBuf::from(gz_path);

    let mut downloaded: u64 = 0;
    {
        let mut gz_file = File::create(&gz_path)
            .with_context(|| format!("Failed to create {}", gz_path.display()))?;
        while let Some(chunk) = resp.chunk().await.context("Contracts download failed")? {
            gz_file
                .write_all(&chunk)
                .with_context(|| format!("Failed to write {}", gz_path.display()))?;
            downloaded += chunk.len() as u64;
        }
    }
    tracing::info!("downloaded {} bytes", downloaded);

    let result = extract(&gz_path, target);
    // The temporary archive goes away on both paths.
    if let Err(e) = fs::remove_file(&gz_path) {
        tracing::warn!("could not remove {}: {}", gz_path.display(), e);
    }
    result?;

    match validate_json(target) {
        Ok(()) => tracing::info!("contracts JSON validated"),
        Err(e) => tracing::warn!("contracts JSON validation failed: {:#}", e),
    }

    let size = fs::metadata(target).map(|m| m.len()).unwrap_or(0);
    println!(
        "Contracts extracted to {} ({} bytes)",
        target.display(),
        size
    );
    Ok(target.to_path_buf())
}

fn extract(gz_path: &Path, target: &Path) -> Result<()> {
    let gz_file =
        File::open(gz_path).with_context(|| format!("Failed to open {}", gz_path.display()))?;
    let mut decoder = GzDecoder::new(BufReader::new(gz_file));
    let mut out =
        File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    std::io::copy(&mut decoder, &mut out)
        .with_context(|| format!("Failed to extract {}", gz_path.display()))?;
    Ok(())
}

fn validate_json(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let _: serde_json::Value =
        serde_json::from_reader(BufReader::new(file)).context("Extracted file is not JSON")?;
    Ok(())
}

/// Print what we know about the local instruments file.
pub fn print_info(settings: &ContractsSettings) {
    let path = match settings.instruments_path.as_deref() {
        Some(p) => p,
        None => {
            println!("INSTRUMENTS_JSON is not configured.");
            return;
        }
    };

    println!("Contracts file: {}", path.display());
    match fs::metadata(path) {
        Ok(meta) => {
            println!(
                "  size:     {:.2} MB ({} bytes)",
                meta.len() as f64 / (1024.0 * 1024.0),
                meta.len()
            );
            if let Ok(modified) = meta.modified() {
                let modified: chrono::DateTime<chrono::Local> = modified.into();
                println!("  modified: {}", modified.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        Err(_) => {
            println!("  not found; run 'upstox-auth contracts' to download it.");
        }
    }
}
