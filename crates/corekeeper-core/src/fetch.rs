//! Downloading release assets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use corekeeper_store::StoreError;

use crate::error::{CoreError, Result};
use crate::release::Asset;

/// Moves an asset's bytes into a local directory.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download `asset` into `dest_dir` and return the path of the complete
    /// file. Nothing is left at the returned path unless the call succeeds.
    async fn fetch(
        &self,
        asset: &Asset,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// Final and in-progress paths for `asset` under `dest_dir`. The asset name
/// must be a plain file name.
pub fn download_paths(asset: &Asset, dest_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let plain = Path::new(&asset.name)
        .file_name()
        .is_some_and(|f| f == asset.name.as_str());
    if !plain || asset.name.starts_with('.') {
        return Err(CoreError::Download {
            url: asset.download_url.clone(),
            message: format!("refusing unsafe asset name {:?}", asset.name),
        });
    }
    Ok((
        dest_dir.join(&asset.name),
        dest_dir.join(format!("{}.partial", asset.name)),
    ))
}

/// Streams assets over HTTP(S).
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("corekeeper/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| CoreError::Download {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn stream_to(
        &self,
        asset: &Asset,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let fail = |message: String| CoreError::Download {
            url: asset.download_url.clone(),
            message,
        };

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled(format!("download of {}", asset.name))),
            sent = self.client.get(&asset.download_url).send() => sent.map_err(|e| fail(e.to_string()))?,
        };
        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| StoreError::from_write(partial, e))?;
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled(format!("download of {}", asset.name))),
                chunk = response.chunk() => chunk.map_err(|e| fail(e.to_string()))?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk)
                .await
                .map_err(|e| StoreError::from_write(partial, e))?;
            written += chunk.len() as u64;
        }
        file.sync_all()
            .await
            .map_err(|e| StoreError::from_write(partial, e))?;

        if asset.size > 0 && written != asset.size {
            return Err(fail(format!(
                "size mismatch: expected {} bytes, got {written}",
                asset.size
            )));
        }
        Ok(written)
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(
        &self,
        asset: &Asset,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let (dest, partial) = download_paths(asset, dest_dir)?;
        debug!(asset = %asset.name, url = %asset.download_url, "downloading asset");

        match self.stream_to(asset, &partial, cancel).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &dest)
                    .await
                    .map_err(|e| StoreError::from_write(&dest, e))?;
                info!(asset = %asset.name, bytes, "asset downloaded");
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}
