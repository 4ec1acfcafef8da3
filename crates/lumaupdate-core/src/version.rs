//! Installed Luma3DS version detection
//!
//! The running firmware can be asked for its version through a Luma-specific
//! supervisor call. When that is not available (other firmware, other
//! platform, or a payload file that is not running, such as a backup) the
//! version is recovered by scanning the payload for its banner string.

use std::fmt;
use std::path::Path;

use crate::scan::{self, Encoding};

/// Banner prefix preceding the version in every payload
pub const VERSION_MARKER: &[u8] = b"Luma3DS v";

/// Text following the version in the banner
pub const VERSION_TERMINATOR: &[u8] = b" configuration";

/// Tag appended to developer builds
const DEV_TAG: &str = "(dev)";

/// A detected or advertised Luma3DS version.
///
/// An empty `release` means the version could not be determined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version {
    /// Dotted numeric release, e.g. "6.1" or "6.1.2"
    pub release: String,
    /// Short commit hash, empty when unknown
    pub commit: String,
    /// Developer build
    pub is_dev: bool,
}

impl Version {
    /// The "could not detect" version
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        !self.release.is_empty()
    }

    /// Parse the text found between the banner prefix and terminator,
    /// e.g. `6.1-59ab44a` or `6.1-59ab44a (dev)`.
    pub fn parse(raw: &str) -> Self {
        let Some((release, rest)) = raw.split_once('-') else {
            return Self {
                release: raw.to_string(),
                commit: String::new(),
                is_dev: false,
            };
        };

        match rest.split_once(' ') {
            Some((commit, _)) => Self {
                release: release.to_string(),
                commit: commit.to_string(),
                is_dev: rest.contains(DEV_TAG),
            },
            None => Self {
                release: release.to_string(),
                commit: rest.to_string(),
                is_dev: false,
            },
        }
    }

    /// Version text as it appears in a payload banner
    pub fn to_banner_string(&self) -> String {
        self.display(true)
    }

    /// Version text, optionally with the developer tag
    pub fn display(&self, with_branch: bool) -> String {
        let mut out = self.release.clone();
        if !self.commit.is_empty() {
            out.push('-');
            out.push_str(&self.commit);
        }
        if with_branch && self.is_dev {
            out.push(' ');
            out.push_str(DEV_TAG);
        }
        out
    }

    /// Numeric components of the release (non-numeric components count as 0)
    pub fn release_components(&self) -> Vec<u64> {
        parse_components(&self.release)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display(false))
    }
}

/// Split a dotted release into numbers, using the leading digits of each part.
pub fn parse_components(release: &str) -> Vec<u64> {
    release
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare two dotted releases numerically; missing components count as 0.
pub fn compare_releases(a: &str, b: &str) -> std::cmp::Ordering {
    let a = parse_components(a);
    let b = parse_components(b);
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Scan a payload image for its version banner.
///
/// Returns [`Version::invalid`] if the banner is missing or unterminated.
pub fn scan_version(data: &[u8]) -> Version {
    let Some(marker) = scan::find(data, VERSION_MARKER, Encoding::Ascii) else {
        log::debug!("Version marker not found in payload");
        return Version::invalid();
    };

    let start = marker + VERSION_MARKER.len();
    let Some(length) = scan::find(&data[start..], VERSION_TERMINATOR, Encoding::Ascii) else {
        log::debug!("Version marker found but not terminated");
        return Version::invalid();
    };

    let raw = String::from_utf8_lossy(&data[start..start + length]);
    Version::parse(&raw)
}

/// Read a payload file and scan it for its version banner.
///
/// A missing or unreadable file is not an error: it yields an invalid version.
pub fn scan_version_file(path: &Path) -> Version {
    match std::fs::read(path) {
        Ok(data) => {
            log::debug!(
                "Loaded {} ({} bytes), searching for version number",
                path.display(),
                data.len()
            );
            scan_version(&data)
        }
        Err(e) => {
            log::info!("Could not open payload {}: {}", path.display(), e);
            Version::invalid()
        }
    }
}

/// Version record returned by the firmware's version supervisor call
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvcVersionInfo {
    pub magic: [u8; 4],
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub flags: u8,
    pub commit: u32,
    pub config: u32,
}

impl SvcVersionInfo {
    /// Expected magic for a Luma3DS reply
    pub const MAGIC: [u8; 4] = *b"LUMA";

    /// Flag bit set on developer builds
    pub const FLAG_DEV: u8 = 0x1;

    /// Convert to a [`Version`]: `major.minor[.build]`, hex commit if non-zero.
    pub fn to_version(&self) -> Version {
        let mut release = format!("{}.{}", self.major, self.minor);
        if self.build > 0 {
            release.push_str(&format!(".{}", self.build));
        }

        let commit = if self.commit != 0 {
            format!("{:x}", self.commit)
        } else {
            String::new()
        };

        Version {
            release,
            commit,
            is_dev: self.flags & Self::FLAG_DEV != 0,
        }
    }
}

/// Source of the live firmware version
pub trait FirmwareQuery {
    /// Returns `None` when the running firmware does not answer the call
    fn query_version(&self) -> Option<SvcVersionInfo>;
}

/// Queries the firmware the process is running on
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFirmware;

impl FirmwareQuery for SystemFirmware {
    fn query_version(&self) -> Option<SvcVersionInfo> {
        query_firmware_version()
    }
}

/// Issue the Luma3DS version supervisor call (`svc 0x2E`).
#[cfg(all(target_arch = "arm", target_os = "horizon"))]
pub fn query_firmware_version() -> Option<SvcVersionInfo> {
    let mut info = SvcVersionInfo::default();
    let result: i32;
    // SAFETY: the call writes at most size_of::<SvcVersionInfo>() bytes to r0
    unsafe {
        core::arch::asm!(
            "svc 0x2E",
            inout("r0") &mut info as *mut SvcVersionInfo => result,
            out("r1") _,
            out("r2") _,
            out("r3") _,
            out("r12") _,
            options(nostack),
        );
    }
    if result != 0 || info.magic != SvcVersionInfo::MAGIC {
        return None;
    }
    Some(info)
}

/// The version call only exists on the console.
#[cfg(not(all(target_arch = "arm", target_os = "horizon")))]
pub fn query_firmware_version() -> Option<SvcVersionInfo> {
    None
}

/// Detects installed and backup payload versions
pub struct VersionDetector<Q: FirmwareQuery = SystemFirmware> {
    firmware: Q,
}

impl<Q: FirmwareQuery> VersionDetector<Q> {
    pub fn new(firmware: Q) -> Self {
        Self { firmware }
    }

    /// Version of the installed payload: firmware call first, then file scan.
    pub fn detect_installed(&self, payload: &Path) -> Version {
        if let Some(info) = self.firmware.query_version() {
            let version = info.to_version();
            log::info!("Firmware reports Luma3DS {}", version.display(true));
            return version;
        }

        log::debug!("Firmware version call unavailable, scanning {}", payload.display());
        scan_version_file(payload)
    }

    /// Version of a payload file that is not running (e.g. a backup).
    pub fn detect_file(&self, payload: &Path) -> Version {
        scan_version_file(payload)
    }
}

impl Default for VersionDetector<SystemFirmware> {
    fn default() -> Self {
        Self::new(SystemFirmware)
    }
}
