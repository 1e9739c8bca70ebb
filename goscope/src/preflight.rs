//! Pre-flight checks for goscope
//!
//! Validates system requirements and the target binary before attempting to
//! load eBPF programs. Provides clear, actionable error messages when
//! requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::warn;
use object::{Object, ObjectSection, ObjectSymbol};
use std::path::Path;

/// Minimum kernel version required for the BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Oldest Go release whose `runtime.g` matches the built-in layout mirror
const MIN_GO_MINOR: u32 = 23;

/// Runtime functions the lifecycle probes attach to
pub const RUNTIME_SYMBOLS: [&str; 2] = ["runtime.newproc1", "runtime.goexit1"];

const BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";
/// Flag bit set when version and module info are stored inline
const BUILDINFO_FLAG_INLINE: u8 = 0x2;
const BUILDINFO_HEADER_LEN: usize = 32;

/// Run all pre-flight checks before eBPF loading
///
/// `custom_offset` is true when the task identifier offset was given on the
/// command line, in which case an old Go release is not worth a warning.
///
/// # Errors
/// Returns an error if a requirement is not met.
pub fn run_preflight_checks(target_path: &Path, custom_offset: bool, quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(target_path)?;

    let file_data = std::fs::read(target_path)
        .with_context(|| format!("Failed to read binary: {}", target_path.display()))?;
    let obj = object::File::parse(&*file_data)
        .with_context(|| format!("Not an ELF executable: {}", target_path.display()))?;

    check_runtime_symbols(&obj, target_path)?;
    if !custom_offset {
        check_go_version(&obj, quiet);
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: goscope requires root privileges to load eBPF programs.\n\n\
         Run with: sudo goscope ..."
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to read kernel release from /proc/sys/kernel/osrelease")?;
    let release = release.trim();

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             goscope requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// Parse "6.1.0-arch1-1" into (6, 1)
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the target binary exists and is a file
fn check_binary_exists(target_path: &Path) -> Result<()> {
    if !target_path.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            target_path.display()
        );
    }
    if !target_path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --path must point to an executable file, not a directory.",
            target_path.display()
        );
    }
    Ok(())
}

/// The probes attach by symbol name, so a stripped binary cannot be traced
fn check_runtime_symbols(obj: &object::File<'_>, target_path: &Path) -> Result<()> {
    let missing = missing_runtime_symbols(obj.symbols().filter_map(|s| s.name().ok()));
    if !missing.is_empty() {
        bail!(
            "Symbols not found in {}: {}\n\n\
             goscope needs the Go runtime symbols; the binary may be stripped (-ldflags=\"-s\").",
            target_path.display(),
            missing.join(", ")
        );
    }
    Ok(())
}

fn missing_runtime_symbols<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'static str> {
    let mut found = [false; RUNTIME_SYMBOLS.len()];
    for name in names {
        if let Some(i) = RUNTIME_SYMBOLS.iter().position(|s| *s == name) {
            found[i] = true;
        }
    }
    RUNTIME_SYMBOLS.iter().zip(found).filter(|(_, ok)| !ok).map(|(s, _)| *s).collect()
}

/// Warn when the default `goid` offset may not match the traced build
fn check_go_version(obj: &object::File<'_>, quiet: bool) {
    let version = obj
        .section_by_name(".go.buildinfo")
        .and_then(|section| section.data().ok())
        .and_then(parse_go_version);

    match version {
        Some(v) if is_supported_go_version(&v) => {
            if !quiet {
                println!("go: {v}");
            }
        }
        Some(v) => warn!(
            "{v} predates go1.{MIN_GO_MINOR}; the default goroutine id offset is probably wrong \
             (go1.22 builds use --task-id-offset 152)"
        ),
        None => warn!("Could not read Go build info; goroutine ids may be wrong"),
    }
}

/// Extract the Go version string from a `.go.buildinfo` section
fn parse_go_version(data: &[u8]) -> Option<String> {
    if data.len() < BUILDINFO_HEADER_LEN || !data.starts_with(BUILDINFO_MAGIC) {
        return None;
    }
    // Go 1.18+ stores the strings inline after the header
    if data[15] & BUILDINFO_FLAG_INLINE == 0 {
        return None;
    }
    let (len, used) = read_uvarint(&data[BUILDINFO_HEADER_LEN..])?;
    let start = BUILDINFO_HEADER_LEN + used;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    let version = data.get(start..end)?;
    String::from_utf8(version.to_vec()).ok()
}

fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// "go1.23.4", "go1.24rc1" → true; "go1.22.8", "devel" → false
fn is_supported_go_version(version: &str) -> bool {
    let Some(rest) = version.strip_prefix("go1.") else {
        return false;
    };
    let minor: String = rest.chars().take_while(char::is_ascii_digit).collect();
    minor.parse::<u32>().is_ok_and(|m| m >= MIN_GO_MINOR)
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing.
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buildinfo(version: &str) -> Vec<u8> {
        let mut data = BUILDINFO_MAGIC.to_vec();
        data.push(8); // pointer size
        data.push(BUILDINFO_FLAG_INLINE);
        data.resize(BUILDINFO_HEADER_LEN, 0);
        data.push(u8::try_from(version.len()).unwrap());
        data.extend_from_slice(version.as_bytes());
        data.push(0);
        data
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_binary_not_found() {
        let result = check_binary_exists(Path::new("/nonexistent/path/to/binary"));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Binary not found"));
    }

    #[test]
    fn test_process_not_found() {
        let result = check_process_exists(999_999_999);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    fn test_parse_go_version() {
        assert_eq!(parse_go_version(&buildinfo("go1.23.4")).as_deref(), Some("go1.23.4"));
    }

    #[test]
    fn test_parse_go_version_rejects_old_layout() {
        let mut data = buildinfo("go1.17");
        data[15] = 0;
        assert_eq!(parse_go_version(&data), None);
        assert_eq!(parse_go_version(b"not a buildinfo section at all, really"), None);
    }

    #[test]
    fn test_supported_go_versions() {
        assert!(is_supported_go_version("go1.23.0"));
        assert!(is_supported_go_version("go1.24rc1"));
        assert!(!is_supported_go_version("go1.22.8"));
        assert!(!is_supported_go_version("devel +abc"));
    }

    #[test]
    fn test_missing_runtime_symbols() {
        let names = ["main.main", "runtime.newproc1"];
        assert_eq!(missing_runtime_symbols(names.into_iter()), vec!["runtime.goexit1"]);
        let names = ["runtime.goexit1", "runtime.newproc1"];
        assert!(missing_runtime_symbols(names.into_iter()).is_empty());
    }
}
