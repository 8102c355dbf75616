use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use semver::Version;
use serde::Deserialize;
use tracing::debug;

use crate::error::{GenError, Result};

const DEFAULT_API_URL: &str = "https://api.github.com";
const BAZEL_REPOSITORY: &str = "bazelbuild/bazel";

/// Parses a Bazel release string and drops any pre-release or build suffix, so
/// `7.0.0-pre.20230724.1` compares as `7.0.0`.
pub fn parse_base_version(version: &str) -> Result<Version> {
    let trimmed = version.trim();
    let parsed = Version::parse(trimmed).map_err(|e| GenError::Version {
        version: version.to_string(),
        message: e.to_string(),
    })?;
    Ok(Version::new(parsed.major, parsed.minor, parsed.patch))
}

/// Source of the latest Bazel release, consulted when no version was given.
pub trait VersionResolver {
    fn latest(&self) -> Result<String>;
}

/// Always answers with the same version.
#[derive(Debug, Clone)]
pub struct FixedVersion(pub String);

impl VersionResolver for FixedVersion {
    fn latest(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Looks up the latest published Bazel release on GitHub.
pub struct GithubReleaseResolver {
    client: Client,
    api_url: String,
}

impl GithubReleaseResolver {
    pub fn new() -> Result<Self> {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("rbe-configs-gen"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| GenError::VersionResolution {
                message: format!("failed to construct GitHub client: {}", e),
            })?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

impl VersionResolver for GithubReleaseResolver {
    fn latest(&self) -> Result<String> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, BAZEL_REPOSITORY);
        debug!("Resolving latest Bazel release from {}", url);
        let resolution_error = |message: String| GenError::VersionResolution { message };

        let release: Release = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| resolution_error(format!("request to {} failed: {}", url, e)))?
            .json()
            .map_err(|e| resolution_error(format!("unexpected response from {}: {}", url, e)))?;

        let version = release.tag_name.trim_start_matches('v').to_string();
        parse_base_version(&version)?;
        Ok(version)
    }
}
