//! Release check against the project's GitHub releases.

use std::cmp::Ordering;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TtsConfig;
use crate::error::UpdateError;

const GITHUB_API: &str = "https://api.github.com";

/// Dot-separated numeric version. Non-numeric components are dropped and
/// missing trailing components compare as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let s = s.strip_prefix(['v', 'V']).unwrap_or(s);
        let mut parts: Vec<u64> = s.split('.').filter_map(|part| part.trim().parse().ok()).collect();
        // `1.0` and `1` are the same version.
        while parts.last() == Some(&0) {
            parts.pop();
        }
        Version(parts)
    }

    fn component(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

/// True when `remote` is strictly newer than `local`.
pub fn is_newer_version(remote: &str, local: &str) -> bool {
    Version::parse(remote) > Version::parse(local)
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ReleaseInfo {
    pub tag_name: String,
    pub version: String,
    pub notes: String,
    pub download_url: String,
    pub published_at: String,
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

pub struct UpdateChecker {
    client: Client,
    api_base: String,
    repo: String,
}

impl UpdateChecker {
    pub fn new(config: &TtsConfig) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            api_base: GITHUB_API.to_string(),
            repo: config.update_repo.clone(),
        })
    }

    /// Point at another API root, e.g. a local fixture server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// The latest release when it is newer than `current`, otherwise `None`.
    pub async fn check_latest(&self, current: &str) -> Result<Option<ReleaseInfo>, UpdateError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, self.repo);
        debug!(url = %url, "Checking for updates");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpdateError::Http(response.status().as_u16()));
        }
        let release: GithubRelease = response.json().await?;

        let asset = release
            .assets
            .iter()
            .find(|a| a.name.ends_with(".apk"))
            .or_else(|| release.assets.first())
            .ok_or(UpdateError::NoAsset)?;

        let version = release
            .tag_name
            .strip_prefix('v')
            .unwrap_or(&release.tag_name)
            .to_string();
        if !is_newer_version(&version, current) {
            debug!(latest = %version, current, "Already up to date");
            return Ok(None);
        }

        info!(latest = %version, current, "Update available");
        Ok(Some(ReleaseInfo {
            download_url: asset.browser_download_url.clone(),
            tag_name: release.tag_name.clone(),
            version,
            notes: release.body.unwrap_or_default(),
            published_at: release.published_at.unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_component_wise() {
        assert!(is_newer_version("0.2.0", "0.1.9"));
        assert!(is_newer_version("1.0", "0.9.9"));
        assert!(is_newer_version("1.10", "1.9"));
        assert!(!is_newer_version("1.0.0", "1.0"));
        assert!(!is_newer_version("1.0", "1.0.0"));
        assert!(!is_newer_version("0.1.9", "0.2.0"));
    }

    #[test]
    fn strips_prefix_and_ignores_junk() {
        assert!(is_newer_version("v1.2.1", "1.2.0"));
        assert_eq!(Version::parse("v1.beta.2"), Version(vec![1, 2]));
        assert!(!is_newer_version("", "0"));
    }

    #[test]
    fn trailing_zeros_are_equal() {
        assert_eq!(Version::parse("1.0"), Version::parse("1"));
        assert_eq!(Version::parse("v2.0.0"), Version::parse("2"));
        assert_eq!(Version::parse("1.0").cmp(&Version::parse("1.0.0")), Ordering::Equal);
        assert_ne!(Version::parse("1.0.1"), Version::parse("1"));

        let mut seen = std::collections::BTreeSet::new();
        seen.insert(Version::parse("1.0"));
        assert!(!seen.insert(Version::parse("1")));
        assert!(!is_newer_version("1.0.0", "1"));
    }

    #[test]
    fn ordering_is_consistent() {
        let versions = ["0.1", "0.1.1", "0.2", "1", "1.0.1", "2.0"];
        for (i, a) in versions.iter().enumerate() {
            for (j, b) in versions.iter().enumerate() {
                assert_eq!(is_newer_version(a, b), i > j, "{a} vs {b}");
            }
        }
    }
}
