//! Release feed: where release documents come from.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::release::{Asset, Release};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Source of published releases, newest first.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn releases(&self) -> Result<Vec<Release>>;

    /// Newest non-prerelease.
    async fn latest(&self) -> Result<Option<Release>> {
        Ok(self.releases().await?.into_iter().find(|r| !r.prerelease))
    }

    /// Release whose tag is `tag`, with or without the leading `v`.
    async fn by_tag(&self, tag: &str) -> Result<Option<Release>> {
        Ok(self
            .releases()
            .await?
            .into_iter()
            .find(|r| r.matches_tag(tag)))
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

impl From<GithubRelease> for Release {
    fn from(gh: GithubRelease) -> Self {
        Release {
            tag_name: gh.tag_name,
            name: gh.name.filter(|n| !n.is_empty()),
            published_at: gh
                .published_at
                .as_deref()
                .and_then(|raw| corekeeper_store::timestamp::parse(raw).ok()),
            prerelease: gh.prerelease,
            assets: gh
                .assets
                .into_iter()
                .map(|a| Asset {
                    name: a.name,
                    download_url: a.browser_download_url,
                    size: a.size,
                    digest: a.digest,
                    content_type: a.content_type,
                })
                .collect(),
        }
    }
}

/// Decode a GitHub `GET /repos/{owner}/{repo}/releases` body. Drafts are
/// dropped; order is preserved.
pub fn parse_github_releases(body: &[u8]) -> Result<Vec<Release>> {
    let raw: Vec<GithubRelease> =
        serde_json::from_slice(body).map_err(|e| CoreError::Download {
            url: "releases".into(),
            message: format!("malformed release feed: {e}"),
        })?;
    Ok(raw
        .into_iter()
        .filter(|r| !r.draft)
        .map(Release::from)
        .collect())
}

/// Releases of one GitHub repository.
pub struct GithubReleaseFeed {
    client: reqwest::Client,
    api_base: String,
    repo: String,
}

impl GithubReleaseFeed {
    pub fn new(api_base: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("corekeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::Download {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            repo: repo.into(),
        })
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn releases_url(&self) -> String {
        format!("{}/repos/{}/releases?per_page=30", self.api_base, self.repo)
    }
}

#[async_trait]
impl ReleaseFeed for GithubReleaseFeed {
    async fn releases(&self) -> Result<Vec<Release>> {
        let url = self.releases_url();
        let fail = |message: String| CoreError::Download {
            url: url.clone(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status}")));
        }
        let body = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        let releases = parse_github_releases(&body)?;
        debug!(repo = %self.repo, count = releases.len(), "release feed fetched");
        Ok(releases)
    }
}
