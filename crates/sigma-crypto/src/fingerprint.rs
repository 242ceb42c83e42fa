//! Device fingerprinting: stable hardware identifiers → device key.
//!
//! Each platform has one collection strategy, picked once by
//! [`Collector::detect`]. Strategies degrade per field: a source that cannot
//! be read contributes an empty value and a `debug!` event, never an error.
//! Only the 32-byte [`DeviceFingerprint::hash`] is ever persisted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{FINGERPRINT_HASH_SIZE, MASTER_KEY_SIZE};

const HASH_CONTEXT: &str = "sigma fingerprint hash v1";
const DEVICE_KEY_CONTEXT: &str = "sigma fingerprint device key v1";

/// Identifiers as a strategy collected them, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFingerprintParts {
    pub cpu_id: String,
    pub disk_serials: Vec<String>,
    pub mac_addresses: Vec<String>,
    pub boot_uuid: String,
    pub platform_info: String,
    pub tpm_id: Option<String>,
}

/// A source of device identifiers.
pub trait FingerprintSource {
    fn collect(&self) -> RawFingerprintParts;
    fn name(&self) -> &'static str;
}

/// Normalized device identity. List fields are sorted and de-duplicated so
/// collection order never changes the hash.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceFingerprint {
    cpu_id: String,
    disk_serials: Vec<String>,
    mac_addresses: Vec<String>,
    boot_uuid: String,
    platform_info: String,
    tpm_id: Option<String>,
}

impl DeviceFingerprint {
    pub fn from_parts(parts: RawFingerprintParts) -> Self {
        Self {
            cpu_id: parts.cpu_id.trim().to_string(),
            disk_serials: normalize_list(parts.disk_serials, false),
            mac_addresses: normalize_list(parts.mac_addresses, true),
            boot_uuid: parts.boot_uuid.trim().to_lowercase(),
            platform_info: parts.platform_info.trim().to_string(),
            tpm_id: parts
                .tpm_id
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    /// Length-prefixed canonical byte encoding.
    pub fn canonical_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(256));
        put_field(&mut out, self.cpu_id.as_bytes());
        put_list(&mut out, &self.disk_serials);
        put_list(&mut out, &self.mac_addresses);
        put_field(&mut out, self.boot_uuid.as_bytes());
        put_field(&mut out, self.platform_info.as_bytes());
        match &self.tpm_id {
            Some(tpm) => {
                out.push(1);
                put_field(&mut out, tpm.as_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Persistable hash of the fingerprint.
    pub fn hash(&self) -> [u8; FINGERPRINT_HASH_SIZE] {
        blake3::derive_key(HASH_CONTEXT, &self.canonical_bytes())
    }

    /// 512-bit device key fed to the hybrid mixer. Never persisted.
    pub fn device_key(&self) -> Zeroizing<[u8; MASTER_KEY_SIZE]> {
        let mut hasher = blake3::Hasher::new_derive_key(DEVICE_KEY_CONTEXT);
        hasher.update(&self.canonical_bytes());
        let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        hasher.finalize_xof().fill(&mut key[..]);
        key
    }

    /// Whether any hardware-bound field was collected. A fingerprint with only
    /// platform info is still usable but weak.
    pub fn has_hardware_ids(&self) -> bool {
        !self.cpu_id.is_empty()
            || !self.disk_serials.is_empty()
            || !self.mac_addresses.is_empty()
            || !self.boot_uuid.is_empty()
            || self.tpm_id.is_some()
    }
}

impl std::fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFingerprint")
            .field("hash", &hex::encode(&self.hash()[..8]))
            .field("disk_serials", &self.disk_serials.len())
            .field("mac_addresses", &self.mac_addresses.len())
            .field("tpm", &self.tpm_id.is_some())
            .finish()
    }
}

fn normalize_list(items: Vec<String>, lowercase: bool) -> Vec<String> {
    let mut out: Vec<String> = items
        .into_iter()
        .map(|s| {
            let s = s.trim();
            if lowercase {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        })
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_list(out: &mut Vec<u8>, items: &[String]) {
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        put_field(out, item.as_bytes());
    }
}

/// The closed set of collection strategies.
#[derive(Debug, Clone)]
pub enum Collector {
    Linux,
    MacOs,
    Windows,
    /// Container, VM, or unknown OS: OS/arch only.
    Restricted,
    /// Caller-provided identifiers.
    Static(RawFingerprintParts),
}

impl Collector {
    /// Pick the strategy for the running host.
    pub fn detect() -> Self {
        let collector = if cfg!(target_os = "linux") {
            if in_container() {
                Collector::Restricted
            } else {
                Collector::Linux
            }
        } else if cfg!(target_os = "macos") {
            Collector::MacOs
        } else if cfg!(target_os = "windows") {
            Collector::Windows
        } else {
            Collector::Restricted
        };
        debug!(strategy = collector.name(), "fingerprint strategy selected");
        collector
    }

    /// Collect and normalize a fresh fingerprint.
    pub fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint::from_parts(self.collect())
    }
}

impl FingerprintSource for Collector {
    fn collect(&self) -> RawFingerprintParts {
        match self {
            Collector::Linux => linux::collect(),
            Collector::MacOs => macos::collect(),
            Collector::Windows => windows::collect(),
            Collector::Restricted => restricted(),
            Collector::Static(parts) => parts.clone(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Collector::Linux => "linux",
            Collector::MacOs => "macos",
            Collector::Windows => "windows",
            Collector::Restricted => "restricted",
            Collector::Static(_) => "static",
        }
    }
}

fn in_container() -> bool {
    if Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() {
        return true;
    }
    read_trimmed("/proc/1/cgroup")
        .map(|cg| {
            ["docker", "kubepods", "containerd", "lxc", "libpod"]
                .iter()
                .any(|marker| cg.contains(marker))
        })
        .unwrap_or(false)
}

/// OS and architecture. The host name is left out: renaming a machine must
/// not change its key.
fn platform_string() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn restricted() -> RawFingerprintParts {
    RawFingerprintParts {
        platform_info: platform_string(),
        ..Default::default()
    }
}

/// Read a file, trimmed. Missing or unreadable files log at debug and yield `None`.
fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(s) => {
            let s = s.trim().to_string();
            (!s.is_empty()).then_some(s)
        }
        Err(e) => {
            debug!(path = %path.display(), "fingerprint source unreadable: {e}");
            None
        }
    }
}

/// Run a command and capture stdout. Failures log at debug and yield `None`.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    match std::process::Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(program, status = ?out.status, "fingerprint command failed");
            None
        }
        Err(e) => {
            debug!(program, "fingerprint command unavailable: {e}");
            None
        }
    }
}

mod linux {
    use super::*;

    const CPU_KEYS: &[&str] = &[
        "vendor_id",
        "model name",
        "cpu family",
        "model",
        "stepping",
        "CPU implementer",
        "CPU part",
        "Serial",
    ];

    pub(super) fn collect() -> RawFingerprintParts {
        RawFingerprintParts {
            cpu_id: read_trimmed("/proc/cpuinfo")
                .map(|info| cpu_id_from_cpuinfo(&info))
                .unwrap_or_default(),
            disk_serials: disk_serials(),
            mac_addresses: mac_addresses(),
            boot_uuid: read_trimmed("/etc/machine-id")
                .or_else(|| read_trimmed("/var/lib/dbus/machine-id"))
                .unwrap_or_default(),
            platform_info: platform_string(),
            tpm_id: tpm_id(),
        }
    }

    /// Identity lines of the first processor block.
    pub(super) fn cpu_id_from_cpuinfo(info: &str) -> String {
        let mut fields = Vec::new();
        for line in info.lines() {
            if line.trim().is_empty() {
                if !fields.is_empty() {
                    break;
                }
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if CPU_KEYS.contains(&key) {
                    fields.push(format!("{key}={}", value.trim()));
                }
            }
        }
        fields.join(";")
    }

    /// Block devices that are not expected to come and go.
    const VOLATILE_BLOCK_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "nbd"];

    fn disk_serials() -> Vec<String> {
        disk_serials_in(Path::new("/sys/block"))
    }

    /// Serials of fixed disks under a `/sys/block`-shaped directory. Virtual,
    /// removable and USB-attached devices are skipped.
    pub(super) fn disk_serials_in(root: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(root) else {
            debug!(path = %root.display(), "fingerprint source unreadable");
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                !VOLATILE_BLOCK_PREFIXES.iter().any(|p| name.starts_with(p))
            })
            .filter(|e| read_trimmed(e.path().join("removable")).as_deref() != Some("1"))
            .filter(|e| !on_usb_bus(&e.path()))
            .filter_map(|e| {
                let device = e.path().join("device");
                read_trimmed(device.join("serial")).or_else(|| read_trimmed(device.join("wwid")))
            })
            .collect()
    }

    fn mac_addresses() -> Vec<String> {
        mac_addresses_in(Path::new("/sys/class/net"))
    }

    /// Permanent addresses of physical, non-USB interfaces under a
    /// `/sys/class/net`-shaped directory.
    pub(super) fn mac_addresses_in(root: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(root) else {
            debug!(path = %root.display(), "fingerprint source unreadable");
            return Vec::new();
        };
        entries
            .flatten()
            // Virtual interfaces (bridges, veth, tun, docker) have no backing device.
            .filter(|e| e.path().join("device").exists())
            .filter(|e| !on_usb_bus(&e.path()) && !on_usb_bus(&e.path().join("device")))
            // 0 = burned-in; random or userspace-assigned addresses change.
            .filter(|e| {
                !matches!(read_trimmed(e.path().join("addr_assign_type")).as_deref(), Some(t) if t != "0")
            })
            .filter_map(|e| read_trimmed(e.path().join("address")))
            .filter(|mac| mac != "00:00:00:00:00:00")
            .collect()
    }

    /// Whether a sysfs entry resolves through a USB controller.
    fn on_usb_bus(path: &Path) -> bool {
        std::fs::canonicalize(path)
            .or_else(|_| std::fs::read_link(path))
            .map(|target| {
                target
                    .components()
                    .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"))
            })
            .unwrap_or(false)
    }

    fn tpm_id() -> Option<String> {
        let base = Path::new("/sys/class/tpm/tpm0");
        if !base.exists() {
            return None;
        }
        let parts: Vec<String> = ["device/description", "tpm_version_major", "device/firmware_node/hid"]
            .iter()
            .filter_map(|p| read_trimmed(base.join(p)))
            .collect();
        Some(if parts.is_empty() {
            "tpm0".to_string()
        } else {
            parts.join(";")
        })
    }
}

mod macos {
    use super::*;

    pub(super) fn collect() -> RawFingerprintParts {
        let platform = command_output("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).unwrap_or_default();
        RawFingerprintParts {
            cpu_id: command_output("sysctl", &["-n", "machdep.cpu.brand_string"]).unwrap_or_default(),
            disk_serials: ioreg_value(&platform, "IOPlatformSerialNumber").into_iter().collect(),
            mac_addresses: command_output("ifconfig", &[])
                .map(|out| {
                    out.lines()
                        .filter_map(|l| l.trim().strip_prefix("ether "))
                        .map(|mac| mac.trim().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            boot_uuid: ioreg_value(&platform, "IOPlatformUUID").unwrap_or_default(),
            platform_info: platform_string(),
            tpm_id: None,
        }
    }

    /// Extract `"Key" = "value"` from ioreg output.
    pub(super) fn ioreg_value(output: &str, key: &str) -> Option<String> {
        let needle = format!("\"{key}\"");
        output.lines().find_map(|line| {
            let (_, rest) = line.split_once(&needle)?;
            let (_, value) = rest.split_once('=')?;
            Some(value.trim().trim_matches('"').to_string())
        })
    }
}

mod windows {
    use super::*;

    pub(super) fn collect() -> RawFingerprintParts {
        let guid = command_output(
            "reg",
            &["query", r"HKLM\SOFTWARE\Microsoft\Cryptography", "/v", "MachineGuid"],
        )
        .and_then(|out| {
            out.lines()
                .find(|l| l.contains("MachineGuid"))
                .and_then(|l| l.split_whitespace().last().map(str::to_string))
        });
        RawFingerprintParts {
            cpu_id: std::env::var("PROCESSOR_IDENTIFIER").unwrap_or_default(),
            disk_serials: Vec::new(),
            mac_addresses: command_output("getmac", &["/fo", "csv", "/nh"])
                .map(|out| {
                    out.lines()
                        .filter_map(|l| l.split(',').next())
                        .map(|mac| mac.trim_matches('"').replace('-', ":"))
                        .collect()
                })
                .unwrap_or_default(),
            boot_uuid: guid.unwrap_or_default(),
            platform_info: platform_string(),
            tpm_id: None,
        }
    }
}
