//! Parses `storage.config`: one cache path (plus ignored size hint) per line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::primitives::file_size;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub size_bytes: u64,
}

/// Resolves every cache path named in `contents` and stat's it via
/// [`file_size`], which works for block devices where `fs::metadata` reports
/// a zero length.
pub fn parse(contents: &str, config_dir: &Path) -> Result<HashMap<PathBuf, CacheEntry>> {
    let mut ret = HashMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let raw = line.split_whitespace().next().unwrap_or("");
        let resolved = resolve_cache_path(raw, config_dir)?;
        let size = file_size(&resolved)?;
        ret.insert(resolved, CacheEntry { size_bytes: size });
    }

    Ok(ret)
}

fn resolve_cache_path(raw: &str, config_dir: &Path) -> Result<PathBuf> {
    let candidate = Path::new(raw);

    if candidate.is_file() {
        return std::fs::canonicalize(candidate).map_err(CacheError::Io);
    }

    if candidate.is_dir() {
        let db = std::fs::canonicalize(candidate)
            .map_err(CacheError::Io)?
            .join("cache.db");
        if !db.is_file() {
            return Err(CacheError::ConfigInvalid(format!(
                "storage.config entry '{raw}' names a directory with no cache.db inside"
            )));
        }
        return Ok(db);
    }

    if candidate.is_absolute() {
        return Err(CacheError::ConfigInvalid(format!(
            "storage.config entry '{raw}' does not exist"
        )));
    }

    // Relative path: resolved against the parent of whichever of 'etc' or
    // 'config' appears in the configuration directory, matching the
    // original loader's fallback for paths given relative to an ATS install
    // root rather than to the current working directory.
    let dir_str = config_dir.to_string_lossy();
    let base = dir_str
        .find("etc")
        .or_else(|| dir_str.find("config"))
        .map(|idx| &dir_str[..idx])
        .ok_or_else(|| {
            CacheError::ConfigInvalid(format!(
                "couldn't find cache file specified in storage.config: '{raw}'"
            ))
        })?;

    let resolved = Path::new(base).join(raw);
    std::fs::canonicalize(&resolved).map_err(CacheError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_absolute_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        let contents = format!("{}\n", tmp.path().display());
        let dir = tempfile::tempdir().unwrap();
        let parsed = parse(&contents, dir.path()).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = parse("# comment\n\n", dir.path()).unwrap();
        assert!(parsed.is_empty());
    }
}
