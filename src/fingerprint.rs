use sha2::{Digest, Sha256};
use std::fs;

/// One-way digest used for every identifier that leaves the device.
///
/// Deterministic by construction: the same raw input always yields the same
/// hex string, which is what makes the ROM-version-change comparison work.
pub fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Opaque string-producing queries against the running platform.
///
/// Every query is independent and allowed to fail; `collect` decides the
/// fallback per field. Implementations must never return raw identifiers to
/// anything but `collect`, which hashes them before they enter a report.
pub trait PlatformQuery: Send + Sync {
    /// Primary stable device identifier (e.g. the machine id).
    fn primary_device_id(&self) -> Option<String>;
    /// Secondary hardware identifier used when the primary is unavailable
    /// (e.g. a network-interface hardware address).
    fn hardware_address(&self) -> Option<String>;
    fn device_name(&self) -> Option<String>;
    fn device_version(&self) -> Option<String>;
    fn country_code(&self) -> Option<String>;
    fn carrier_name(&self) -> Option<String>;
    fn carrier_id(&self) -> Option<String>;
    /// Digest material for the build's signing certificate, if any.
    fn signing_cert(&self) -> Option<String>;
}

/// Transient, immutable report snapshot. Built fresh per submission attempt,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// Hashed device identifier; absent when both identifier sources failed.
    /// A partial report is still sent (the endpoint tolerates a missing hash).
    pub device_hash: Option<String>,
    pub device_name: String,
    pub device_version: String,
    pub device_country: String,
    pub device_carrier: String,
    pub device_carrier_id: String,
    pub rom_name: String,
    pub rom_version: String,
    /// Hashed signing certificate; absent for unsigned builds.
    pub sign_cert: Option<String>,
}

/// Build a report snapshot from platform queries plus the build properties.
pub fn collect(platform: &dyn PlatformQuery, rom_name: &str, rom_version: &str) -> DeviceReport {
    let device_hash = platform
        .primary_device_id()
        .filter(|id| !id.is_empty())
        .or_else(|| platform.hardware_address().filter(|mac| !mac.is_empty()))
        .map(|raw| digest(&raw));

    DeviceReport {
        device_hash,
        device_name: non_empty_or(platform.device_name(), "Unknown"),
        device_version: non_empty_or(platform.device_version(), "Unknown"),
        device_country: non_empty_or(platform.country_code(), "Unknown"),
        device_carrier: non_empty_or(platform.carrier_name(), "Unknown"),
        device_carrier_id: non_empty_or(platform.carrier_id(), "0"),
        rom_name: rom_name.to_string(),
        rom_version: rom_version.to_string(),
        sign_cert: platform
            .signing_cert()
            .filter(|cert| !cert.is_empty())
            .map(|raw| digest(&raw)),
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

// ── Host platform ─────────────────────────────────────────────────

/// Platform queries against the local host: machine id as the primary
/// identifier, first non-loopback interface address as the secondary.
pub struct HostPlatform;

impl PlatformQuery for HostPlatform {
    fn primary_device_id(&self) -> Option<String> {
        read_trimmed("/etc/machine-id")
    }

    fn hardware_address(&self) -> Option<String> {
        let entries = fs::read_dir("/sys/class/net").ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_str() == Some("lo") {
                continue;
            }
            if let Some(addr) = read_trimmed(entry.path().join("address")) {
                if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                    return Some(addr);
                }
            }
        }
        None
    }

    fn device_name(&self) -> Option<String> {
        hostname::get().ok().and_then(|h| h.into_string().ok())
    }

    fn device_version(&self) -> Option<String> {
        let contents = fs::read_to_string("/etc/os-release").ok()?;
        contents
            .lines()
            .find_map(|line| line.strip_prefix("PRETTY_NAME="))
            .map(|v| v.trim_matches('"').to_string())
    }

    fn country_code(&self) -> Option<String> {
        std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .and_then(|locale| {
                let region = locale.split('.').next()?.split('_').nth(1)?;
                Some(region.to_string())
            })
    }

    fn carrier_name(&self) -> Option<String> {
        None
    }

    fn carrier_id(&self) -> Option<String> {
        None
    }

    fn signing_cert(&self) -> Option<String> {
        None
    }
}

fn read_trimmed(path: impl AsRef<std::path::Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
