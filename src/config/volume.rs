//! Parses `volume.config`: `volume=N size=V` pairs, `V` either an absolute
//! MiB count or a percentage of the total configured storage.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{CacheError, Result};
use crate::primitives::CacheType;

use super::storage::CacheEntry;

#[derive(Debug, Clone, Copy)]
pub struct Volume {
    pub cache_type: CacheType,
    pub size_bytes: u64,
}

pub fn parse(
    contents: &str,
    storage: &HashMap<PathBuf, CacheEntry>,
) -> Result<HashMap<u32, Volume>> {
    let mut ret = HashMap::new();
    let mut total_percent: u64 = 0;
    let total_storage: u64 = storage.values().map(|c| c.size_bytes).sum();

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || !line.contains("volume=") {
            continue;
        }

        let volume_no = extract_field(line, "volume=")
            .ok_or_else(|| CacheError::ConfigInvalid(format!("malformed line: {line}")))?
            .parse::<u32>()
            .map_err(|_| CacheError::ConfigInvalid(format!("bad volume number: {line}")))?;

        if ret.contains_key(&volume_no) {
            return Err(CacheError::ConfigInvalid(format!(
                "duplicate specification of volume #{volume_no}"
            )));
        }

        let size_field = extract_field(line, "size=")
            .ok_or_else(|| CacheError::ConfigInvalid(format!("malformed line: {line}")))?
            .to_lowercase();

        let size_bytes = if let Some(pct) = size_field.strip_suffix('%') {
            if storage.is_empty() {
                return Err(CacheError::ConfigInvalid(
                    "cannot allocate a percentage of a cache with no storage.config entries"
                        .to_string(),
                ));
            }
            let pct: u64 = pct
                .parse()
                .map_err(|_| CacheError::ConfigInvalid(format!("bad percent size: {line}")))?;
            total_percent += pct;
            if total_percent > 100 {
                return Err(CacheError::ConfigInvalid(format!(
                    "line '{line}' causes more than 100% of space to be used"
                )));
            }
            pct * total_storage / 100
        } else {
            let mib: u64 = size_field
                .parse()
                .map_err(|_| CacheError::ConfigInvalid(format!("bad size: {line}")))?;
            mib * 0x100000
        };

        ret.insert(
            volume_no,
            Volume {
                cache_type: CacheType::Http,
                size_bytes,
            },
        );
    }

    Ok(ret)
}

fn extract_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    Some(rest.split_whitespace().next().unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_mib_size() {
        let storage = HashMap::new();
        let volumes = parse("volume=1 size=256\n", &storage).unwrap();
        assert_eq!(volumes[&1].size_bytes, 256 * 0x100000);
    }

    #[test]
    fn rejects_duplicate_volume() {
        let storage = HashMap::new();
        let err = parse("volume=1 size=1\nvolume=1 size=2\n", &storage);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_percent_over_100() {
        let mut storage = HashMap::new();
        storage.insert(
            PathBuf::from("/cache.db"),
            CacheEntry {
                size_bytes: 1024 * 1024 * 1024,
            },
        );
        let err = parse("volume=1 size=60%\nvolume=2 size=50%\n", &storage);
        assert!(err.is_err());
    }

    #[test]
    fn percent_without_storage_fails() {
        let storage = HashMap::new();
        let err = parse("volume=1 size=100%\n", &storage);
        assert!(err.is_err());
    }
}
