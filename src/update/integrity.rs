//! Structural verification of downloaded packages.
//!
//! A package passes when it is at least the configured minimum size, matches
//! the advertised length, starts with the executable magic for its platform
//! and, when a digest was published, hashes to that digest.

use crate::error::UpdateError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Executable container expected for the running platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    /// Windows PE (`MZ`).
    Pe,
    /// Linux ELF.
    Elf,
    /// macOS Mach-O, thin or universal.
    MachO,
    /// No header check (archives, unknown platforms).
    Any,
}

impl PackageFormat {
    pub fn for_current_platform() -> Self {
        if cfg!(target_os = "windows") {
            PackageFormat::Pe
        } else if cfg!(target_os = "macos") {
            PackageFormat::MachO
        } else if cfg!(target_os = "linux") {
            PackageFormat::Elf
        } else {
            PackageFormat::Any
        }
    }

    fn accepts(self, header: &[u8]) -> bool {
        const MACHO_MAGICS: [[u8; 4]; 6] = [
            [0xfe, 0xed, 0xfa, 0xce],
            [0xce, 0xfa, 0xed, 0xfe],
            [0xfe, 0xed, 0xfa, 0xcf],
            [0xcf, 0xfa, 0xed, 0xfe],
            [0xca, 0xfe, 0xba, 0xbe],
            [0xbe, 0xba, 0xfe, 0xca],
        ];
        match self {
            PackageFormat::Pe => header.starts_with(b"MZ"),
            PackageFormat::Elf => header.starts_with(b"\x7fELF"),
            PackageFormat::MachO => MACHO_MAGICS.iter().any(|m| header.starts_with(m)),
            PackageFormat::Any => true,
        }
    }
}

/// What a package has to satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityPolicy {
    pub format: PackageFormat,
    pub min_bytes: u64,
    /// Exact size from `Content-Length`, or the size the registry advertised.
    pub expected_len: Option<u64>,
    /// Lowercase hex SHA-256.
    pub sha256: Option<String>,
}

impl IntegrityPolicy {
    pub fn new(format: PackageFormat, min_bytes: u64) -> Self {
        Self {
            format,
            min_bytes,
            expected_len: None,
            sha256: None,
        }
    }
}

/// Check `path` against `policy`.
pub fn verify_package(path: &Path, policy: &IntegrityPolicy) -> Result<(), UpdateError> {
    let len = std::fs::metadata(path)
        .map_err(|e| UpdateError::io(path, e))?
        .len();

    if let Some(expected) = policy.expected_len {
        if len != expected {
            return Err(UpdateError::CorruptPackage(format!(
                "truncated: expected {} bytes, got {}",
                expected, len
            )));
        }
    }
    if len < policy.min_bytes {
        return Err(UpdateError::CorruptPackage(format!(
            "too small: {} bytes, minimum is {}",
            len, policy.min_bytes
        )));
    }

    let mut header = [0u8; 4];
    let read = File::open(path)
        .and_then(|mut f| read_up_to(&mut f, &mut header))
        .map_err(|e| UpdateError::io(path, e))?;
    if !policy.format.accepts(&header[..read]) {
        return Err(UpdateError::CorruptPackage(format!(
            "not a valid {:?} executable",
            policy.format
        )));
    }

    if let Some(expected) = &policy.sha256 {
        let actual = sha256_file(path).map_err(|e| UpdateError::io(path, e))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::CorruptPackage(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }
    }

    Ok(())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract the digest from a `sha256sum`-style line (`<hex>  <name>`).
pub fn parse_checksum(text: &str) -> Option<String> {
    text.split_whitespace().next().and_then(hex_digest)
}

/// Extract the digest from a registry asset field of the form `sha256:<hex>`.
/// Other algorithms are ignored.
pub fn parse_digest(field: &str) -> Option<String> {
    let (algorithm, hex) = field.trim().split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return None;
    }
    hex_digest(hex)
}

fn hex_digest(token: &str) -> Option<String> {
    (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}
