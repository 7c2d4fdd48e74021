//! Content hashing for files and rendered strings.
//!
//! Files are streamed through SHA-256 in 128 KiB blocks. Digests are
//! memoized per process keyed by `(path, mtime)` so repeated lookups of an
//! unchanged file do not reopen it; the memo is never persisted because
//! mtimes are not stable across filesystems.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 128 * 1024;

/// Intra-run file digest cache.
#[derive(Debug, Default)]
pub struct Hasher {
    memo: HashMap<(PathBuf, SystemTime), String>,
}

impl Hasher {
    /// SHA-256 of the file contents, lowercase hex. A repeated call for the
    /// same `(path, mtime)` returns the memoized digest.
    pub fn hash_file(&mut self, path: &Path) -> Result<String> {
        let mtime = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let key = (path.to_path_buf(), mtime);
        if let Some(digest) = self.memo.get(&key) {
            return Ok(digest.clone());
        }

        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut block = vec![0u8; BLOCK_SIZE];
        loop {
            let n = file
                .read(&mut block)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }

        let digest = to_hex(&hasher.finalize());
        self.memo.insert(key, digest.clone());
        Ok(digest)
    }

    /// Digest an artifact path into one or more `(key, digest)` entries.
    ///
    /// A plain file yields a single entry under its own key. A directory
    /// expands to every contained file, each hashed under its full path.
    pub fn hash_artifact(&mut self, key: &str, path: &Path) -> Result<Vec<(String, String)>> {
        if path.is_dir() {
            let mut entries = Vec::new();
            for file in files_in_directory(path)? {
                let digest = self.hash_file(&file)?;
                entries.push((file.display().to_string(), digest));
            }
            Ok(entries)
        } else {
            let digest = self.hash_file(path)?;
            Ok(vec![(key.to_string(), digest)])
        }
    }
}

/// SHA-256 of the UTF-8 bytes, lowercase hex.
pub fn hash_string(string: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(string.as_bytes());
    to_hex(&hasher.finalize())
}

/// All files below `dir`, sorted for deterministic iteration.
pub fn files_in_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("**").join("*");
    let pattern = pattern.to_string_lossy();
    let mut files = Vec::new();
    for entry in glob::glob(&pattern)
        .with_context(|| format!("invalid glob pattern {pattern}"))?
    {
        let path = entry.context("failed to walk directory")?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_string_matches_known_vectors() {
        assert_eq!(
            hash_string("a"),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
        assert_eq!(
            hash_string("Hello/alsdkasd/{{}}asdsad"),
            "86d6fce6d34c8a84a7f84906ad5b0db146efa8d60cff0cd73e5e2122bb9930cf"
        );
    }

    #[test]
    fn hash_file_matches_hash_of_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.txt");
        fs::write(&path, "a").unwrap();

        let mut hasher = Hasher::default();
        assert_eq!(hasher.hash_file(&path).unwrap(), hash_string("a"));
    }

    #[test]
    fn memo_is_keyed_by_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.txt");
        fs::write(&path, "first").unwrap();

        let mut hasher = Hasher::default();
        let first = hasher.hash_file(&path).unwrap();

        // Same mtime, changed bytes: the memoized digest is returned.
        let mtime = filetime::FileTime::from_last_modification_time(
            &fs::metadata(&path).unwrap(),
        );
        fs::write(&path, "second").unwrap();
        filetime::set_file_mtime(&path, mtime).unwrap();
        assert_eq!(hasher.hash_file(&path).unwrap(), first);

        // A new mtime invalidates the entry.
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(2_000_000_000, 0))
            .unwrap();
        assert_eq!(hasher.hash_file(&path).unwrap(), hash_string("second"));
    }

    #[test]
    fn hash_file_streams_large_input() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.bin");
        let contents = "x".repeat(BLOCK_SIZE * 2 + 17);
        fs::write(&path, &contents).unwrap();

        let mut hasher = Hasher::default();
        assert_eq!(hasher.hash_file(&path).unwrap(), hash_string(&contents));
    }

    #[test]
    fn directory_artifact_expands_to_contained_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("nested").join("b.txt"), "b").unwrap();

        let mut hasher = Hasher::default();
        let entries = hasher.hash_artifact("data", &dir).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, dir.join("a.txt").display().to_string());
        assert_eq!(entries[0].1, hash_string("a"));
        assert_eq!(
            entries[1].0,
            dir.join("nested").join("b.txt").display().to_string()
        );
    }

    #[test]
    fn file_artifact_keeps_its_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.csv");
        fs::write(&path, "1,2\n").unwrap();

        let mut hasher = Hasher::default();
        let entries = hasher.hash_artifact("bld/out.csv", &path).unwrap();
        assert_eq!(entries, vec![("bld/out.csv".to_string(), hash_string("1,2\n"))]);
    }
}
