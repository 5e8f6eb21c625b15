//! Install method detection for memdoc.
//!
//! Decides whether this binary may replace itself, or whether the user should
//! update through a package manager or is running a development build.

use super::InstallMethod;
use std::path::Path;
use std::process::Command;

/// Detect how memdoc was installed.
///
/// Checks in order:
/// 1. Development build (binary under a cargo `target/` directory)
/// 2. pacman (Arch/AUR)
/// 3. dpkg (Debian/Ubuntu)
/// 4. brew (macOS Homebrew)
/// 5. winget (Windows)
/// 6. Path heuristic (/usr/bin = likely system-managed)
/// 7. Fallback to SelfManaged
pub fn detect_install_method(bin_path: &Path) -> InstallMethod {
    if is_development_build(bin_path) {
        return InstallMethod::Development;
    }

    let bin_str = bin_path.to_string_lossy().to_string();

    let probes: [(&str, &[&str], &str, &str); 4] = [
        ("pacman", &["-Qo", &bin_str], "pacman/AUR", "yay -S memdoc"),
        (
            "dpkg",
            &["-S", &bin_str],
            "dpkg",
            "sudo apt update && sudo apt upgrade memdoc",
        ),
        (
            "brew",
            &["list", "--cask", "memdoc"],
            "Homebrew",
            "brew upgrade --cask memdoc",
        ),
        (
            "winget",
            &["list", "--exact", "--id", "swahed.MemDoc"],
            "winget",
            "winget upgrade swahed.MemDoc",
        ),
    ];

    for (program, args, name, upgrade_cmd) in probes {
        let owned = Command::new(program)
            .args(args)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if owned {
            return InstallMethod::PackageManager {
                name: name.to_string(),
                upgrade_cmd: upgrade_cmd.to_string(),
            };
        }
    }

    detect_from_path(bin_path)
}

/// A binary built by cargo lives in `target/debug` or `target/release`.
pub fn is_development_build(path: &Path) -> bool {
    let mut components = path
        .parent()
        .into_iter()
        .flat_map(|p| p.components().rev().take(2))
        .map(|c| c.as_os_str().to_string_lossy().into_owned());
    let profile = components.next();
    let target = components.next();
    matches!(profile.as_deref(), Some("debug") | Some("release"))
        && target.as_deref() == Some("target")
}

/// Detect install method based on the binary path.
///
/// Binaries in system directories are likely system-managed.
pub fn detect_from_path(path: &Path) -> InstallMethod {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/usr/bin/") || path_str.starts_with("/usr/sbin/") {
        return InstallMethod::PackageManager {
            name: "system".to_string(),
            upgrade_cmd: "your system package manager".to_string(),
        };
    }

    InstallMethod::SelfManaged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_path_usr_bin() {
        match detect_from_path(Path::new("/usr/bin/memdoc")) {
            InstallMethod::PackageManager { name, .. } => assert_eq!(name, "system"),
            other => panic!("Expected PackageManager, got {:?}", other),
        }
    }

    #[test]
    fn test_detect_from_path_user_dirs() {
        for path in [
            "/home/user/.local/bin/memdoc",
            "/opt/memdoc/bin/memdoc",
            "C:/Users/u/AppData/Local/MemDoc/MemDoc.exe",
        ] {
            assert!(matches!(
                detect_from_path(Path::new(path)),
                InstallMethod::SelfManaged
            ));
        }
    }

    #[test]
    fn test_development_build() {
        assert!(is_development_build(Path::new("/src/memdoc/target/debug/memdoc")));
        assert!(is_development_build(Path::new("/src/memdoc/target/release/memdoc")));
        assert!(!is_development_build(Path::new("/opt/release/memdoc")));
        assert!(!is_development_build(Path::new("/home/u/.cargo/bin/memdoc")));
        assert!(matches!(
            detect_install_method(Path::new("/src/memdoc/target/debug/memdoc")),
            InstallMethod::Development
        ));
    }
}
