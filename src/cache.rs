//! On-disk metadata cache for the reader.
//!
//! Scanning a large collection of input files is expensive, so the source
//! stage caches its reported metadata under a content hash of everything
//! that could change the report: framework version, absolute data path,
//! the ordered file list and every reader property. The cache file is the
//! plain binary serialization of the metadata, named `.<40-hex>.tmd` and
//! searched through `[HOME, cwd, data root, user dir]`; the first
//! readable and parseable copy wins. Corrupt or unreadable copies fall
//! through to the next path and finally to a fresh scan. Writes use
//! create-exclusive semantics so concurrent scanners cannot interleave.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::metadata::Metadata;

/// Environment override disabling the cache entirely.
pub const DISABLE_ENV: &str = "STRATUS_SKIP_METADATA_CACHE";

const EXTENSION: &str = "tmd";
const HASH_LEN: usize = 40;

pub struct MetadataCache {
    search_paths: Vec<PathBuf>,
    enabled: bool,
}

impl MetadataCache {
    /// Builds the search path list for a given data root and optional
    /// user-configured directory.
    pub fn new(data_root: &Path, user_dir: Option<&Path>) -> Self {
        let mut search_paths = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            search_paths.push(PathBuf::from(home));
        }
        if let Ok(cwd) = std::env::current_dir() {
            search_paths.push(cwd);
        }
        search_paths.push(data_root.to_path_buf());
        if let Some(dir) = user_dir {
            search_paths.push(dir.to_path_buf());
        }
        Self {
            search_paths,
            enabled: std::env::var_os(DISABLE_ENV).is_none(),
        }
    }

    /// A cache rooted at explicit directories; used by tests.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            enabled: true,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// 40 hex characters over version ‖ data path ‖ file list ‖ reader
    /// properties.
    pub fn hash(data_path: &str, files: &[String], properties: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
        hasher.update(data_path.as_bytes());
        for file in files {
            hasher.update(file.as_bytes());
        }
        hasher.update(properties.as_bytes());
        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(HASH_LEN);
        hex
    }

    fn file_name(hash: &str) -> String {
        format!(".{hash}.{EXTENSION}")
    }

    /// The first cached metadata readable under `hash`, if any.
    pub fn load(&self, hash: &str) -> Option<Metadata> {
        if !self.enabled {
            return None;
        }
        let name = Self::file_name(hash);
        for dir in &self.search_paths {
            let path = dir.join(&name);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            match Metadata::from_bytes(bytes) {
                Ok(metadata) => {
                    tracing::info!(path = %path.display(), "loaded metadata from cache");
                    return Some(metadata);
                }
                Err(e) => {
                    // Possibly a concurrent writer; try the next path.
                    tracing::warn!(path = %path.display(), "ignoring unreadable cache file: {e}");
                }
            }
        }
        None
    }

    /// Writes `metadata` into the first writable search directory,
    /// preferring the most specific one (user dir, then data root).
    pub fn store(&self, hash: &str, metadata: &Metadata) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let name = Self::file_name(hash);
        for dir in self.search_paths.iter().rev() {
            let path = dir.join(&name);
            match create_exclusive(&path, &metadata.to_bytes()) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "wrote metadata cache");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), "cache write failed: {e}");
                }
            }
        }
        tracing::warn!("no writable cache directory, metadata not cached");
        Ok(())
    }
}

fn create_exclusive(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // World readable, group writable.
        options.mode(0o664);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        let mut md = Metadata::new();
        md.set_u64("number_of_time_steps", 10);
        md.set_strings("variables", vec!["T".to_string()]);
        md
    }

    #[test]
    fn hash_is_40_hex_and_property_sensitive() {
        let files = vec!["a.cfb".to_string(), "b.cfb".to_string()];
        let h1 = MetadataCache::hash("/data", &files, "x_axis=lon");
        assert_eq!(h1.len(), 40);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));

        let h2 = MetadataCache::hash("/data", &files, "x_axis=longitude");
        assert_ne!(h1, h2);

        let h3 = MetadataCache::hash("/data", &["a.cfb".to_string()], "x_axis=lon");
        assert_ne!(h1, h3);

        // Unchanged inputs hash identically.
        assert_eq!(h1, MetadataCache::hash("/data", &files, "x_axis=lon"));
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::with_search_paths(vec![dir.path().to_path_buf()]);
        let md = sample();
        let hash = MetadataCache::hash("/data", &[], "p=1");
        cache.store(&hash, &md).unwrap();
        assert_eq!(cache.load(&hash), Some(md));
    }

    #[test]
    fn corrupt_cache_falls_through_to_next_path() {
        let bad = tempfile::tempdir().unwrap();
        let good = tempfile::tempdir().unwrap();
        let hash = MetadataCache::hash("/data", &[], "p=1");
        let name = format!(".{hash}.tmd");
        std::fs::write(bad.path().join(&name), b"garbage").unwrap();
        let md = sample();
        std::fs::write(good.path().join(&name), md.to_bytes()).unwrap();

        let cache = MetadataCache::with_search_paths(vec![
            bad.path().to_path_buf(),
            good.path().to_path_buf(),
        ]);
        assert_eq!(cache.load(&hash), Some(md));
    }

    #[test]
    fn store_skips_unwritable_directories() {
        let missing = PathBuf::from("/nonexistent-cache-dir");
        let good = tempfile::tempdir().unwrap();
        let cache =
            MetadataCache::with_search_paths(vec![missing, good.path().to_path_buf()]);
        let hash = MetadataCache::hash("/data", &[], "p=2");
        cache.store(&hash, &sample()).unwrap();
        assert!(cache.load(&hash).is_some());
    }

    #[test]
    fn existing_cache_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::with_search_paths(vec![dir.path().to_path_buf()]);
        let hash = MetadataCache::hash("/data", &[], "p=3");
        cache.store(&hash, &sample()).unwrap();
        let mut other = sample();
        other.set_u64("number_of_time_steps", 99);
        // Second store is create-exclusive; the first copy survives.
        cache.store(&hash, &other).unwrap();
        assert_eq!(cache.load(&hash), Some(sample()));
    }
}
