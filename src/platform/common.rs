use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[cfg(windows)]
use std::fs::OpenOptions;

/// Replace `path` with `content` via a synced sibling `.tmp` file and a rename
///
/// Readers see either the old file or the new one, never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    write_via_temp(path, content, false)
}

/// Like [`atomic_write`], but the file is only readable by its owner
///
/// Used for files holding credentials.
pub fn atomic_write_private(path: &Path, content: &[u8]) -> Result<()> {
    write_via_temp(path, content, true)
}

fn write_via_temp(path: &Path, content: &[u8], private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        if private {
            restrict_to_owner(&temp_path)?;
        }

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Create `path` and its parents unless it already exists
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    Ok(())
}

/// Make a file readable and writable by its owner only (0600 on Unix)
pub fn restrict_to_owner(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    #[cfg(windows)]
    {
        // ProgramData ACLs already limit writes to administrators; just
        // ensure the file is not read-only so later saves succeed.
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_readonly(false);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    Ok(())
}

/// Fail unless the process is elevated
///
/// Packet interception and terminating other users' processes need it.
pub fn ensure_admin_privileges() -> Result<()> {
    #[cfg(unix)]
    {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            anyhow::bail!(
                "family-guard needs root (running as EUID {})",
                euid
            );
        }
    }

    #[cfg(windows)]
    {
        // Writing to the system temp directory requires elevation
        let test_path = std::path::PathBuf::from(r"C:\Windows\Temp\family-guard-test.tmp");
        match OpenOptions::new().write(true).create(true).open(&test_path) {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
            }
            Err(_) => {
                anyhow::bail!(
                    "family-guard needs an elevated (Administrator) prompt"
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("state.json");

        atomic_write(&test_file, b"first").unwrap();
        atomic_write(&test_file, b"second").unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), b"second");
        assert!(!test_file.with_extension("tmp").exists());
    }

    #[test]
    fn test_atomic_write_nested_path() {
        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("nested").join("path").join("state.json");

        atomic_write(&test_file, b"nested content").unwrap();
        assert_eq!(std::fs::read(&test_file).unwrap(), b"nested content");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_private_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("state.json");
        atomic_write_private(&test_file, b"secret").unwrap();

        let mode = std::fs::metadata(&test_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_ensure_directory_exists_idempotent() {
        let temp_dir = tempdir().unwrap();
        let test_dir = temp_dir.path().join("idempotent_test");

        ensure_directory_exists(&test_dir).unwrap();
        ensure_directory_exists(&test_dir).unwrap();
        assert!(test_dir.is_dir());
    }
}
