use ignore::WalkBuilder;
use log::debug;
use std::{
    fmt, fs, io,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::models::BuildSource;

/// Feeds any `Hash` value into a blake3 digest.
pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                panic!();
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("build source directory not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid build source: {0}")]
    InvalidSource(String),
    #[error("failed to read build source")]
    Io(#[from] io::Error),
}

/// Content hash of a build source, used as an image tag for change
/// detection. The content itself is the cache key; there is no separate
/// build cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the deterministic content hash of a build source.
///
/// Directory sources hash the raw contents of every regular file under the
/// directory, concatenated in lexicographic path order, so the result does
/// not depend on the filesystem's own listing order. Inline sources hash
/// the build-file text followed by each auxiliary file in declared order.
pub fn fingerprint(source: &BuildSource) -> Result<Fingerprint, FingerprintError> {
    let mut hasher = blake3::Hasher::new();

    match source {
        BuildSource::Directory(path) => {
            if !path.exists() {
                return Err(FingerprintError::NotFound(path.clone()));
            }
            if !path.is_dir() {
                return Err(FingerprintError::InvalidSource(format!(
                    "{} is not a directory",
                    path.display()
                )));
            }
            for file in source_files(path)? {
                hasher.update(&fs::read(&file)?);
            }
        }
        BuildSource::Inline { text, add_files } => {
            hasher.update(text.as_bytes());
            for file in add_files {
                hasher.update(&fs::read(file)?);
            }
        }
    }

    let fingerprint = Fingerprint(hasher.finalize().to_hex().to_string());
    debug!("fingerprint {:?} -> {}", source, fingerprint);
    Ok(fingerprint)
}

/// All regular files under `path` in lexicographic path order.
fn source_files(path: &Path) -> Result<Vec<PathBuf>, FingerprintError> {
    let walk = WalkBuilder::new(path)
        .ignore(false)
        .git_global(false)
        .git_ignore(false)
        .git_exclude(false)
        .hidden(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    let mut files = Vec::new();
    for result in walk {
        let entry = result.map_err(|err| FingerprintError::InvalidSource(err.to_string()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dir_source(path: &Path) -> BuildSource {
        BuildSource::Directory(path.to_path_buf())
    }

    #[test]
    fn deterministic_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::write(dir.path().join("b.txt"), "y").unwrap();

        let first = fingerprint(&dir_source(dir.path())).unwrap();
        let second = fingerprint(&dir_source(dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn changing_one_byte_changes_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::write(dir.path().join("b.txt"), "y").unwrap();
        let before = fingerprint(&dir_source(dir.path())).unwrap();

        fs::write(dir.path().join("b.txt"), "z").unwrap();
        let after = fingerprint(&dir_source(dir.path())).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn independent_of_creation_order() {
        let forward = tempfile::tempdir().unwrap();
        fs::write(forward.path().join("a.txt"), "x").unwrap();
        fs::write(forward.path().join("b.txt"), "y").unwrap();

        let reverse = tempfile::tempdir().unwrap();
        fs::write(reverse.path().join("b.txt"), "y").unwrap();
        fs::write(reverse.path().join("a.txt"), "x").unwrap();

        assert_eq!(
            fingerprint(&dir_source(forward.path())).unwrap(),
            fingerprint(&dir_source(reverse.path())).unwrap()
        );
    }

    #[test]
    fn nested_files_are_included() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        let flat = fingerprint(&dir_source(dir.path())).unwrap();

        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.txt"), "deep").unwrap();
        let nested = fingerprint(&dir_source(dir.path())).unwrap();
        assert_ne!(flat, nested);
    }

    #[test]
    fn missing_directory_is_not_found() {
        let err = fingerprint(&dir_source(Path::new("/nonexistent/gantry-src"))).unwrap_err();
        match err {
            FingerprintError::NotFound(_) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn file_as_directory_source_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Dockerfile");
        fs::write(&file, "FROM busybox").unwrap();

        let err = fingerprint(&BuildSource::Directory(file)).unwrap_err();
        match err {
            FingerprintError::InvalidSource(_) => {}
            other => panic!("expected InvalidSource, got {:?}", other),
        }
    }

    #[test]
    fn inline_source_tracks_text_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let aux = dir.path().join("setup.sh");
        fs::write(&aux, "echo hi").unwrap();

        let base = BuildSource::Inline {
            text: "FROM busybox".into(),
            add_files: vec![aux.clone()],
        };
        let first = fingerprint(&base).unwrap();
        let second = fingerprint(&base).unwrap();
        assert_eq!(first, second);

        let changed_text = BuildSource::Inline {
            text: "FROM alpine".into(),
            add_files: vec![aux.clone()],
        };
        assert_ne!(first, fingerprint(&changed_text).unwrap());

        fs::write(&aux, "echo bye").unwrap();
        assert_ne!(first, fingerprint(&base).unwrap());
    }
}
