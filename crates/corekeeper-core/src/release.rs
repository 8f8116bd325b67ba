//! Fetched releases, their assets, and platform asset selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arch::{HostArch, HostPlatform};
use crate::error::{CoreError, Result};

/// Archive container of a release asset, by filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Classify a filename, ignoring case. Unknown suffixes yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }

    /// Lower ranks are preferred.
    fn rank(&self) -> u8 {
        match self {
            ArchiveKind::TarGz => 0,
            ArchiveKind::Zip => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub name: String,
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    /// Declared digest, `algo:hex`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Asset {
    /// Hex value of a declared `sha256:` digest. Other algorithms are not
    /// trusted and yield `None`, as does a malformed value.
    pub fn sha256_digest(&self) -> Option<&str> {
        let (algo, value) = self.digest.as_deref()?.split_once(':')?;
        let value = value.trim();
        let well_formed = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        (algo.trim().eq_ignore_ascii_case("sha256") && well_formed).then_some(value)
    }

    pub fn archive_kind(&self) -> Option<ArchiveKind> {
        ArchiveKind::from_name(&self.name)
    }
}

/// One published release. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        with = "corekeeper_store::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Release {
    /// Tag with a single leading `v` stripped: `v6.6.103-0` becomes `6.6.103-0`.
    pub fn version_string(&self) -> String {
        version_from_tag(&self.tag_name)
    }

    /// Whether `tag` names this release, with or without the leading `v`.
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tag_name == tag || self.version_string() == version_from_tag(tag)
    }
}

pub fn version_from_tag(tag: &str) -> String {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
        .to_string()
}

/// True when `token` appears in `name` delimited by separators or the ends.
fn has_token(name: &str, token: &str) -> bool {
    let is_sep = |c: char| matches!(c, '_' | '-' | '.' | ' ');
    name.match_indices(token).any(|(start, _)| {
        let before = name[..start].chars().next_back();
        let after = name[start + token.len()..].chars().next();
        before.map_or(true, is_sep) && after.map_or(true, is_sep)
    })
}

fn best_for<'a>(candidates: &[&'a Asset], arch: HostArch) -> Option<&'a Asset> {
    candidates
        .iter()
        .copied()
        .filter(|asset| {
            let lower = asset.name.to_ascii_lowercase();
            arch.asset_tokens().iter().any(|t| has_token(&lower, t))
        })
        .min_by_key(|asset| asset.archive_kind().map_or(u8::MAX, |k| k.rank()))
}

/// Pick the one asset of `release` this host should install.
///
/// Only archives of a known kind whose name carries the host OS token are
/// considered. Among those matching the native architecture, `.tar.gz`/`.tgz`
/// wins over `.zip`, then feed order. An x86_64 asset is used only when the
/// host can translate it.
pub fn select_asset<'a>(release: &'a Release, platform: &HostPlatform) -> Result<&'a Asset> {
    let candidates: Vec<&Asset> = release
        .assets
        .iter()
        .filter(|asset| asset.archive_kind().is_some())
        .filter(|asset| {
            let lower = asset.name.to_ascii_lowercase();
            platform.os.asset_tokens().iter().any(|t| has_token(&lower, t))
        })
        .collect();

    if let Some(asset) = best_for(&candidates, platform.arch) {
        return Ok(asset);
    }
    if platform.arch != HostArch::X86_64 && platform.can_run(HostArch::X86_64) {
        if let Some(asset) = best_for(&candidates, HostArch::X86_64) {
            tracing::info!(asset = %asset.name, "using x86_64 asset under translation");
            return Ok(asset);
        }
    }

    Err(CoreError::NoMatchingAsset {
        tag: release.tag_name.clone(),
        platform: platform.to_string(),
    })
}
