// Cache path utilities.
// Maps durable-store keys to files inside the cache directory and back.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

const ENTRY_EXTENSION: &str = "json";

/// Get the base cache directory (~/.cache/wecare on Linux).
pub fn cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "wecare").map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Directory holding durable store entries.
pub fn store_dir() -> Option<PathBuf> {
    cache_dir().map(|dir| dir.join("store"))
}

/// Path of the file backing `key` inside `dir`.
///
/// Keys are hex-encoded so any string is a valid, reversible file name.
pub fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", hex::encode(key.as_bytes()), ENTRY_EXTENSION))
}

/// Recover the key from an entry file name, or None for foreign files.
pub fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{}", ENTRY_EXTENSION))?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}
