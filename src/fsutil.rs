//! Small filesystem helpers shared across the agent.

use std::io;
use std::path::{Path, PathBuf};

/// Error from a filesystem helper, carrying the operation and path involved.
#[derive(Debug, thiserror::Error)]
#[error("failed to {op} `{path}`: {source}")]
pub struct FsError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

fn fs_err(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> FsError {
    let path = path.to_path_buf();
    move |source| FsError { op, path, source }
}

/// Reads a file to a string and trims surrounding whitespace.
pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String, FsError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(fs_err("read", path))?;
    Ok(content.trim().to_owned())
}

/// Creates an empty file at `path`, truncating an existing one.
pub fn touch(path: impl AsRef<Path>) -> Result<(), FsError> {
    let path = path.as_ref();
    std::fs::File::create(path).map_err(fs_err("create", path))?;
    Ok(())
}

/// Removes the file at `path`, treating a missing file as success.
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<(), FsError> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(fs_err("remove", path)(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_trimmed() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("dev");
        std::fs::write(&path, "13:64\n").unwrap();
        assert_eq!(read_trimmed(&path).unwrap(), "13:64");
    }

    #[test]
    fn test_read_trimmed_missing_file() {
        let err = read_trimmed("/definitely/does/not/exist").unwrap_err();
        assert_eq!(err.path, PathBuf::from("/definitely/does/not/exist"));
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_touch_and_remove() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("ready");
        touch(&path).unwrap();
        assert!(path.exists());
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
        // removing again is not an error
        remove_if_exists(&path).unwrap();
    }
}
