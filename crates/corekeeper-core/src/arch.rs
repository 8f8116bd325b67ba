//! Host platform detection and installed-binary sniffing.
//!
//! Architecture comes from the kernel-reported machine type, not from the
//! architecture this crate was compiled for: an x86_64 build running under
//! translation on Apple silicon must still pick the arm64 release.

use std::io::Read;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};

/// CPU architectures release assets are published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostArch {
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl HostArch {
    /// Map an OS-reported machine string (`uname -m`).
    pub fn parse_machine(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "arm64" | "aarch64" => Ok(HostArch::Arm64),
            "x86_64" | "amd64" => Ok(HostArch::X86_64),
            other => Err(CoreError::UnsupportedPlatform(format!(
                "unsupported machine type '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostArch::Arm64 => "arm64",
            HostArch::X86_64 => "x86_64",
        }
    }

    /// Tokens vendors use for this architecture in asset filenames.
    pub fn asset_tokens(&self) -> &'static [&'static str] {
        match self {
            HostArch::Arm64 => &["arm64", "aarch64"],
            HostArch::X86_64 => &["amd64", "x86_64"],
        }
    }
}

impl std::fmt::Display for HostArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating systems release assets are published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsToken {
    Darwin,
    Linux,
}

impl OsToken {
    /// Map a `std::env::consts::OS` value.
    pub fn from_os(os: &str) -> Result<Self> {
        match os {
            "macos" | "darwin" => Ok(OsToken::Darwin),
            "linux" => Ok(OsToken::Linux),
            other => Err(CoreError::UnsupportedPlatform(format!(
                "unsupported operating system '{other}'"
            ))),
        }
    }

    pub fn current() -> Result<Self> {
        Self::from_os(std::env::consts::OS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsToken::Darwin => "darwin",
            OsToken::Linux => "linux",
        }
    }

    pub fn asset_tokens(&self) -> &'static [&'static str] {
        match self {
            OsToken::Darwin => &["darwin", "macos"],
            OsToken::Linux => &["linux"],
        }
    }
}

/// Everything asset selection needs to know about the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPlatform {
    pub os: OsToken,
    /// Native architecture, after undoing translation.
    pub arch: HostArch,
    /// This process itself runs translated.
    pub translated: bool,
    /// x86_64 binaries can run on this host via translation.
    pub translation_available: bool,
}

impl HostPlatform {
    pub fn new(os: OsToken, arch: HostArch) -> Self {
        Self {
            os,
            arch,
            translated: false,
            translation_available: false,
        }
    }

    pub fn with_translation(mut self, available: bool) -> Self {
        self.translation_available = available;
        self
    }

    /// Combine raw probe results into a platform description.
    pub fn resolve(
        os: OsToken,
        machine: &str,
        translated: bool,
        translation_available: bool,
    ) -> Result<Self> {
        let reported = HostArch::parse_machine(machine)?;
        let arch = if translated && reported == HostArch::X86_64 {
            HostArch::Arm64
        } else {
            reported
        };
        Ok(Self {
            os,
            arch,
            translated,
            translation_available: arch == HostArch::Arm64 && translation_available,
        })
    }

    /// Probe the running host.
    pub fn detect() -> Result<Self> {
        let os = OsToken::current()?;
        let machine = machine_type()?;
        let translated = is_translated();
        let available = os == OsToken::Darwin && translation_available();
        let platform = Self::resolve(os, &machine, translated, available)?;
        debug!(
            os = platform.os.as_str(),
            arch = %platform.arch,
            translated = platform.translated,
            translation_available = platform.translation_available,
            "host platform detected"
        );
        Ok(platform)
    }

    /// Whether a binary built for `arch` can execute here.
    pub fn can_run(&self, arch: HostArch) -> bool {
        arch == self.arch || (arch == HostArch::X86_64 && self.translation_available)
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os.as_str(), self.arch)
    }
}

#[cfg(unix)]
fn machine_type() -> Result<String> {
    let uts = nix::sys::utsname::uname()
        .map_err(|e| CoreError::UnsupportedPlatform(format!("uname failed: {e}")))?;
    Ok(uts.machine().to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn machine_type() -> Result<String> {
    Ok(std::env::consts::ARCH.to_string())
}

/// True when this process runs under instruction-set translation.
pub fn is_translated() -> bool {
    if OsToken::current().ok() != Some(OsToken::Darwin) {
        return false;
    }
    Command::new("/usr/sbin/sysctl")
        .args(["-n", "sysctl.proc_translated"])
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "1")
        .unwrap_or(false)
}

/// True when x86_64 binaries can be run on this host. A probe that cannot
/// even be launched counts as unavailable.
pub fn translation_available() -> bool {
    Command::new("/usr/bin/arch")
        .args(["-x86_64", "/usr/bin/true"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Executable container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryFormat {
    #[serde(rename = "mach-o")]
    MachO,
    #[serde(rename = "mach-o-universal")]
    MachOUniversal,
    #[serde(rename = "elf")]
    Elf,
    #[serde(rename = "unknown")]
    Unknown,
}

impl BinaryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryFormat::MachO => "mach-o",
            BinaryFormat::MachOUniversal => "mach-o-universal",
            BinaryFormat::Elf => "elf",
            BinaryFormat::Unknown => "unknown",
        }
    }
}

const MACHO_64_LE: [u8; 4] = [0xcf, 0xfa, 0xed, 0xfe];
const MACHO_32_LE: [u8; 4] = [0xce, 0xfa, 0xed, 0xfe];
const FAT_MAGIC: [u8; 4] = [0xca, 0xfe, 0xba, 0xbe];
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const EM_X86_64: u16 = 0x3e;
const EM_AARCH64: u16 = 0xb7;

/// Largest fat header worth reading; anything claiming more slices is not
/// a universal binary (Java class files share the magic).
const MAX_FAT_ARCHS: u32 = 16;

/// Format and architectures read from an executable's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedBinary {
    pub format: BinaryFormat,
    pub archs: Vec<HostArch>,
}

impl SniffedBinary {
    pub fn sniff(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| corekeeper_store::StoreError::from_io(path, e))?;
        let mut header = Vec::with_capacity(512);
        file.by_ref()
            .take(8 + 20 * MAX_FAT_ARCHS as u64)
            .read_to_end(&mut header)
            .map_err(|e| corekeeper_store::StoreError::from_io(path, e))?;
        Ok(Self::from_header(&header))
    }

    pub fn from_header(header: &[u8]) -> Self {
        let unknown = SniffedBinary {
            format: BinaryFormat::Unknown,
            archs: Vec::new(),
        };
        let Some(magic) = header.get(..4) else {
            return unknown;
        };

        if magic == MACHO_64_LE || magic == MACHO_32_LE {
            let archs = read_u32(header, 4, false)
                .and_then(macho_arch)
                .into_iter()
                .collect();
            return SniffedBinary {
                format: BinaryFormat::MachO,
                archs,
            };
        }

        if magic == FAT_MAGIC {
            let Some(count) = read_u32(header, 4, true).filter(|n| *n > 0 && *n <= MAX_FAT_ARCHS)
            else {
                return unknown;
            };
            let mut archs = Vec::new();
            for slice in 0..count as usize {
                if let Some(arch) = read_u32(header, 8 + slice * 20, true).and_then(macho_arch) {
                    if !archs.contains(&arch) {
                        archs.push(arch);
                    }
                }
            }
            return SniffedBinary {
                format: BinaryFormat::MachOUniversal,
                archs,
            };
        }

        if magic == ELF_MAGIC {
            let little_endian = header.get(5) == Some(&1);
            let archs = read_u16(header, 18, !little_endian)
                .and_then(|machine| match machine {
                    EM_AARCH64 => Some(HostArch::Arm64),
                    EM_X86_64 => Some(HostArch::X86_64),
                    _ => None,
                })
                .into_iter()
                .collect();
            return SniffedBinary {
                format: BinaryFormat::Elf,
                archs,
            };
        }

        unknown
    }

    /// `arm64`, `x86_64`, or `arm64+x86_64` for universal binaries.
    pub fn arch_label(&self) -> Option<String> {
        if self.archs.is_empty() {
            return None;
        }
        Some(
            self.archs
                .iter()
                .map(HostArch::as_str)
                .collect::<Vec<_>>()
                .join("+"),
        )
    }
}

fn macho_arch(cpu_type: u32) -> Option<HostArch> {
    match cpu_type {
        CPU_TYPE_ARM64 => Some(HostArch::Arm64),
        CPU_TYPE_X86_64 => Some(HostArch::X86_64),
        _ => None,
    }
}

fn read_u32(buf: &[u8], at: usize, big_endian: bool) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    })
}

fn read_u16(buf: &[u8], at: usize, big_endian: bool) -> Option<u16> {
    let bytes: [u8; 2] = buf.get(at..at + 2)?.try_into().ok()?;
    Some(if big_endian {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corekeeper_store::ErrorKind;

    #[test]
    fn test_parse_machine() {
        assert_eq!(HostArch::parse_machine("arm64").unwrap(), HostArch::Arm64);
        assert_eq!(HostArch::parse_machine("aarch64\n").unwrap(), HostArch::Arm64);
        assert_eq!(HostArch::parse_machine("x86_64").unwrap(), HostArch::X86_64);
        assert_eq!(HostArch::parse_machine("AMD64").unwrap(), HostArch::X86_64);

        let err = HostArch::parse_machine("riscv64").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
    }

    #[test]
    fn test_asset_tokens() {
        assert_eq!(HostArch::X86_64.asset_tokens(), &["amd64", "x86_64"]);
        assert!(HostArch::Arm64.asset_tokens().contains(&"aarch64"));
        assert_eq!(OsToken::from_os("macos").unwrap(), OsToken::Darwin);
        assert!(OsToken::from_os("windows").is_err());
    }

    #[test]
    fn test_translated_process_resolves_to_native() {
        let platform = HostPlatform::resolve(OsToken::Darwin, "x86_64", true, true).unwrap();
        assert_eq!(platform.arch, HostArch::Arm64);
        assert!(platform.translated);
        assert!(platform.can_run(HostArch::X86_64));
    }

    #[test]
    fn test_translation_only_meaningful_on_arm() {
        let platform = HostPlatform::resolve(OsToken::Linux, "x86_64", false, true).unwrap();
        assert_eq!(platform.arch, HostArch::X86_64);
        assert!(!platform.translation_available);
        assert!(!platform.can_run(HostArch::Arm64));
    }

    #[test]
    fn test_translation_probe_tolerates_missing_tool() {
        // Must return a bool, never panic, regardless of host.
        let _ = translation_available();
        let _ = is_translated();
    }

    #[test]
    fn test_sniff_macho_thin() {
        let mut header = MACHO_64_LE.to_vec();
        header.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        let sniffed = SniffedBinary::from_header(&header);
        assert_eq!(sniffed.format, BinaryFormat::MachO);
        assert_eq!(sniffed.arch_label().as_deref(), Some("arm64"));
    }

    #[test]
    fn test_sniff_macho_universal() {
        let mut header = FAT_MAGIC.to_vec();
        header.extend_from_slice(&2u32.to_be_bytes());
        for cpu in [CPU_TYPE_X86_64, CPU_TYPE_ARM64] {
            header.extend_from_slice(&cpu.to_be_bytes());
            header.extend_from_slice(&[0u8; 16]);
        }
        let sniffed = SniffedBinary::from_header(&header);
        assert_eq!(sniffed.format, BinaryFormat::MachOUniversal);
        assert_eq!(sniffed.arch_label().as_deref(), Some("x86_64+arm64"));
    }

    #[test]
    fn test_sniff_elf_and_unknown() {
        let mut header = ELF_MAGIC.to_vec();
        header.extend_from_slice(&[2, 1, 1, 0]);
        header.resize(18, 0);
        header.extend_from_slice(&EM_AARCH64.to_le_bytes());
        let sniffed = SniffedBinary::from_header(&header);
        assert_eq!(sniffed.format, BinaryFormat::Elf);
        assert_eq!(sniffed.archs, vec![HostArch::Arm64]);

        let script = SniffedBinary::from_header(b"#!/bin/sh\n");
        assert_eq!(script.format, BinaryFormat::Unknown);
        assert!(script.arch_label().is_none());
    }

    #[test]
    fn test_fat_magic_with_absurd_count_is_not_universal() {
        let mut header = FAT_MAGIC.to_vec();
        header.extend_from_slice(&50u32.to_be_bytes());
        assert_eq!(SniffedBinary::from_header(&header).format, BinaryFormat::Unknown);
    }
}
