//! Fetching, hashing, durable file writes and campaign repositories.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod fetch;
pub mod postgres;
pub mod repository;

pub use fetch::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestIdentity,
    RetryDisposition, TokenBucket,
};
pub use postgres::PgCampaignRepository;
pub use repository::{
    CampaignRepository, InMemoryCampaignRepository, JsonFileCampaignRepository, StoreError,
};

pub const CRATE_NAME: &str = "cashmap-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace `path` with `bytes` so readers see either the old file or the new one.
///
/// The data goes to a hidden sibling first and is synced before the rename. A failed
/// rename removes the sibling.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let stem = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cashmap".to_string());
    let staging = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4().simple()));

    let staged = async {
        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&staging, path).await
    }
    .await;

    if let Err(err) = staged {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}
