//! Atomic file persistence shared by the deploy-state and WAL stores.

use std::fs;
use std::path::Path;
use teneo_types::{SdkError, SdkResult};

/// Write `data` to `path` atomically: write a sibling `.tmp` file with
/// owner-only permissions, then rename over the target. A crash mid-write
/// leaves the previous file intact.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> SdkResult<()> {
    let tmp_path = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });

    write_owner_only(&tmp_path, data)
        .map_err(|e| SdkError::Internal(format!("failed to write {}: {e}", tmp_path.display())))?;

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SdkError::Internal(format!(
            "failed to rename {} over {}: {e}",
            tmp_path.display(),
            path.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn write_owner_only(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

/// Create `dir` (and parents) with owner-only permissions.
pub(crate) fn ensure_private_dir(dir: &Path) -> SdkResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| {
                SdkError::Internal(format!("failed to create {}: {e}", dir.display()))
            })?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
            .map_err(|e| SdkError::Internal(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secret.json");
        atomic_write(&path, b"{}").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
