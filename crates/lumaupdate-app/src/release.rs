//! Release catalog fetching and payload download
//!
//! Stable releases come from the GitHub releases API, hourly builds from a
//! plain-text "last commit" marker per branch. Downloaded archives are checked
//! against whatever integrity metadata the server offered and the payload is
//! extracted in memory.

use std::collections::BTreeMap;

use lumaupdate_core::archive::{open_archive, ArchiveError, ArchiveFormat, ExtractedFile};
use lumaupdate_core::MAX_PAYLOAD_SIZE;
use serde_json::Value;
use thiserror::Error;

use crate::config::SourcesConfig;
use crate::http::{HttpClient, HttpError};

/// Most JSON tokens (objects, arrays, keys and values) a manifest may hold
pub const MAX_JSON_TOKENS: usize = 1024;

/// Payload member inside stable 7z archives
pub const STABLE_PAYLOAD_MEMBER: &str = "arm9loaderhax.bin";

/// Payload member inside hourly zip archives
pub const HOURLY_PAYLOAD_MEMBER: &str = "out/arm9loaderhax.bin";

/// Errors that can occur while fetching releases
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("Could not fetch release data: {0}")]
    Fetch(#[from] HttpError),

    #[error("Failed to parse release manifest: {0}")]
    Parse(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("File is too big to be a valid payload ({size} bytes)")]
    PayloadTooLarge { size: usize },
}

/// Release channel a version belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stable,
    Hourly,
}

impl Channel {
    /// Container format of this channel's archives
    pub fn archive_format(self) -> ArchiveFormat {
        match self {
            Channel::Stable => ArchiveFormat::SevenZip,
            Channel::Hourly => ArchiveFormat::Zip,
        }
    }

    /// Path of the payload inside this channel's archives
    pub fn payload_member(self) -> &'static str {
        match self {
            Channel::Stable => STABLE_PAYLOAD_MEMBER,
            Channel::Hourly => HOURLY_PAYLOAD_MEMBER,
        }
    }
}

/// A downloadable release asset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseVersion {
    /// Asset file name (commit id for hourly builds)
    pub filename: String,
    /// Name shown to the user
    pub friendly_name: String,
    /// Download URL
    pub url: String,
    /// Size declared by the server, 0 if unknown
    pub size: u64,
}

impl ReleaseVersion {
    /// Developer build assets carry `-dev.` in their name
    pub fn is_dev(&self) -> bool {
        self.filename.contains("-dev.")
    }
}

/// A release and its downloadable variants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseCatalog {
    /// Version tag (stable) or commit id (hourly)
    pub name: String,
    /// Changelog
    pub description: String,
    /// Variants, normal before developer
    pub versions: Vec<ReleaseVersion>,
    /// Branch label -> latest commit (hourly only)
    pub commits: BTreeMap<String, String>,
}

impl ReleaseCatalog {
    /// A catalog is usable when it offers at least one version
    pub fn is_valid(&self) -> bool {
        !self.versions.is_empty()
    }
}

/// Outcome of comparing an `ETag` with the downloaded body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtagCheck {
    Verified,
    Mismatch,
    /// The tag is not a content hash this client understands
    Unsupported,
}

/// Compare an `ETag` header with the MD5 of `body`.
pub fn check_etag(etag: &str, body: &[u8]) -> EtagCheck {
    let tag = etag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    let tag = tag.trim_matches('"');

    if tag.len() != 32 || !tag.chars().all(|c| c.is_ascii_hexdigit()) {
        return EtagCheck::Unsupported;
    }

    let digest = format!("{:x}", md5::compute(body));
    if digest.eq_ignore_ascii_case(tag) {
        EtagCheck::Verified
    } else {
        EtagCheck::Mismatch
    }
}

/// Count JSON tokens the way a flat tokenizer would
fn count_tokens(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(|v| 1 + count_tokens(v)).sum::<usize>(),
        Value::Array(items) => 1 + items.iter().map(count_tokens).sum::<usize>(),
        _ => 1,
    }
}

/// Decode a manifest, enforcing the token budget
pub(crate) fn parse_manifest(data: &[u8]) -> Result<Value, ReleaseError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| ReleaseError::Parse(e.to_string()))?;

    let tokens = count_tokens(&value);
    if tokens > MAX_JSON_TOKENS {
        return Err(ReleaseError::Parse(format!(
            "too many tokens ({} > {})",
            tokens, MAX_JSON_TOKENS
        )));
    }

    if !value.is_object() {
        return Err(ReleaseError::Parse("manifest is not an object".into()));
    }
    Ok(value)
}

/// Version tag of a release: `tag_name`, else `name`, without a leading `v`
pub(crate) fn release_tag(release: &Value) -> Option<&str> {
    let tag = release["tag_name"]
        .as_str()
        .or_else(|| release["name"].as_str())?;
    Some(tag.strip_prefix('v').unwrap_or(tag))
}

/// Parse a GitHub release manifest into a catalog
pub fn parse_stable_release(data: &[u8]) -> Result<ReleaseCatalog, ReleaseError> {
    let release = parse_manifest(data)?;

    let name = release_tag(&release)
        .ok_or_else(|| ReleaseError::Parse("Missing tag_name".to_string()))?
        .to_string();
    log::info!("Release found: {}", name);

    let description = release["body"].as_str().unwrap_or("").to_string();

    let mut versions = Vec::new();
    for asset in release["assets"].as_array().into_iter().flatten() {
        let (Some(filename), Some(url)) = (
            asset["name"].as_str(),
            asset["browser_download_url"].as_str(),
        ) else {
            continue;
        };

        let mut version = ReleaseVersion {
            filename: filename.to_string(),
            friendly_name: String::new(),
            url: url.to_string(),
            size: asset["size"].as_u64().unwrap_or(0),
        };
        log::debug!("Found version: {}", version.filename);

        // Normal version in front, developer version at the back
        if version.is_dev() {
            version.friendly_name = "developer version".into();
            versions.push(version);
        } else {
            version.friendly_name = "normal version".into();
            versions.insert(0, version);
        }
    }

    Ok(ReleaseCatalog {
        name,
        description,
        versions,
        commits: BTreeMap::new(),
    })
}

/// Fetches release catalogs and payloads
pub struct ReleaseClient<H: HttpClient> {
    http: H,
    sources: SourcesConfig,
}

impl<H: HttpClient> ReleaseClient<H> {
    pub fn new(http: H, sources: SourcesConfig) -> Self {
        Self { http, sources }
    }

    /// The underlying HTTP client
    pub fn http(&self) -> &H {
        &self.http
    }

    /// Latest stable release from the releases API
    pub fn get_latest_stable(&self) -> Result<ReleaseCatalog, ReleaseError> {
        let url = &self.sources.stable_release_url;
        log::info!("Downloading {}", url);

        let response = self.http.get(url)?;
        log::debug!("Downloaded {} bytes", response.body.len());

        parse_stable_release(&response.body)
    }

    /// Latest hourly build of every configured branch.
    ///
    /// Branches that cannot be fetched are skipped; if all fail the returned
    /// catalog is empty (see [`ReleaseCatalog::is_valid`]).
    pub fn get_latest_hourly(&self) -> ReleaseCatalog {
        let mut hourly = ReleaseCatalog::default();

        for branch in &self.sources.hourly_branches {
            log::info!("Downloading {}", branch.last_commit_url);
            let response = match self.http.get(&branch.last_commit_url) {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("Could not fetch {} hourly: {}", branch.label, e);
                    continue;
                }
            };

            let commit = String::from_utf8_lossy(&response.body).trim().to_string();
            if commit.is_empty() {
                log::warn!("Empty commit marker for {} hourly", branch.label);
                continue;
            }

            if hourly.name.is_empty() {
                hourly.name = commit.clone();
            }
            hourly.versions.push(ReleaseVersion {
                filename: commit.clone(),
                friendly_name: format!("{} ({})", branch.friendly_name, commit),
                url: branch.build_url_for(&commit),
                size: 0,
            });
            hourly.commits.insert(branch.label.clone(), commit);
        }

        if !hourly.is_valid() {
            log::warn!("No hourly build could be fetched");
        }
        hourly
    }

    /// Download `release`, verify it and extract the payload.
    pub fn get_payload(
        &self,
        release: &ReleaseVersion,
        channel: Channel,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<ExtractedFile, ReleaseError> {
        log::info!("Downloading {}", release.url);
        let response = self.http.get_with_progress(&release.url, on_progress)?;
        log::info!("Download complete! Size: {}", response.body.len());

        verify_download(release, response.etag.as_deref(), &response.body)?;

        log::info!("Decompressing archive in memory");
        let member = channel.payload_member();
        let payload = {
            let mut archive = open_archive(channel.archive_format(), &response.body)?;
            archive.extract_file(member)?
        };
        drop(response);
        log::info!("File extracted successfully ({} bytes)", payload.len());

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ReleaseError::PayloadTooLarge {
                size: payload.len(),
            });
        }

        Ok(payload)
    }
}

/// Check a downloaded body against the declared size and `ETag`, if present.
pub fn verify_download(
    release: &ReleaseVersion,
    etag: Option<&str>,
    body: &[u8],
) -> Result<(), ReleaseError> {
    if release.size == 0 {
        log::info!("Skipping size check (no size declared)");
    } else if release.size != body.len() as u64 {
        return Err(ReleaseError::Integrity(format!(
            "size mismatch (expected {} got {})",
            release.size,
            body.len()
        )));
    }

    match etag {
        None => log::info!("Skipping integrity check (no ETag found)"),
        Some(tag) => match check_etag(tag, body) {
            EtagCheck::Verified => log::info!("Integrity check OK"),
            EtagCheck::Mismatch => {
                return Err(ReleaseError::Integrity(
                    "MD5 mismatch between server's and local file".into(),
                ))
            }
            EtagCheck::Unsupported => {
                log::info!("Skipping integrity check (ETag {} is not a content hash)", tag)
            }
        },
    }

    Ok(())
}
