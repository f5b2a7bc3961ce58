//! Configuration loading: `records.config`, `storage.config`, `volume.config`.
//!
//! Mirrors the five process-wide values the original tool kept as module
//! globals (records, storage, volumes, FIPS flag, load-average cap) as fields
//! of a single value constructed once at startup and threaded by reference
//! from there on; nothing here is a global.

mod records;
mod storage;
mod volume;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use records::{SettingValue, Settings};
pub use storage::CacheEntry;
pub use volume::Volume;

use crate::error::{CacheError, Result};
use crate::primitives::{CacheType, FipsMode};

/// A fully loaded, read-only configuration. Construct with [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    settings: Settings,
    storage: HashMap<PathBuf, CacheEntry>,
    volumes: HashMap<u32, Volume>,
    fips: FipsMode,
    max_loadavg: Option<(f64, f64, f64)>,
}

impl Config {
    /// Reads `records.config`, `storage.config` and `volume.config` from `dir`.
    pub fn load(dir: impl AsRef<Path>, fips: FipsMode) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CacheError::ConfigMissing(format!(
                "configuration directory {} does not exist",
                dir.display()
            )));
        }

        let records_path = dir.join("records.config");
        let records_text = std::fs::read_to_string(&records_path).map_err(|e| {
            CacheError::ConfigMissing(format!("{}: {e}", records_path.display()))
        })?;
        let settings = records::parse(&records_text)?;

        let storage_path = dir.join("storage.config");
        let storage_text = std::fs::read_to_string(&storage_path).map_err(|e| {
            CacheError::ConfigMissing(format!("{}: {e}", storage_path.display()))
        })?;
        let storage = storage::parse(&storage_text, dir)?;

        let volume_path = dir.join("volume.config");
        let volume_text = std::fs::read_to_string(&volume_path).map_err(|e| {
            CacheError::ConfigMissing(format!("{}: {e}", volume_path.display()))
        })?;
        let volumes = volume::parse(&volume_text, &storage)?;

        tracing::info!(
            settings = settings.len(),
            spans = storage.len(),
            volumes = volumes.len(),
            "configuration loaded"
        );

        Ok(Config {
            settings,
            storage,
            volumes,
            fips,
            max_loadavg: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resolves a setting, retrying with the `proxy.config.` prefix on miss.
    pub fn get_setting(&self, name: &str) -> Option<&SettingValue> {
        self.settings
            .get(name)
            .or_else(|| self.settings.get(&format!("proxy.config.{name}")))
    }

    pub fn spans(&self) -> impl Iterator<Item = (&Path, &CacheEntry)> {
        let mut entries: Vec<_> = self.storage.iter().map(|(p, c)| (p.as_path(), c)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    pub fn volumes(&self) -> &HashMap<u32, Volume> {
        &self.volumes
    }

    pub fn fips(&self) -> FipsMode {
        self.fips
    }

    pub fn ink_md5_size(&self) -> usize {
        self.fips.ink_md5_size()
    }

    pub fn total_cache_size_available(&self) -> u64 {
        self.storage.values().map(|c| c.size_bytes).sum()
    }

    /// The default cache type assumed for volumes parsed from `volume.config`.
    pub fn default_cache_type(&self) -> CacheType {
        CacheType::Http
    }

    /// Sets a hard cap on the 1/5/15-minute load average, not to be exceeded
    /// while spawning enumeration workers. Returns the current load average if
    /// it is already at or past the requested cap.
    pub fn set_max_loadavg(&mut self, cap: (f64, f64, f64)) -> Option<(f64, f64, f64)> {
        let current = current_loadavg();
        self.max_loadavg = Some(cap);
        if current.0 >= cap.0 || current.1 >= cap.1 || current.2 >= cap.2 {
            Some(current)
        } else {
            None
        }
    }

    /// Number of worker processes/threads allowed without exceeding the
    /// configured load-average cap. No cap set ⇒ available parallelism.
    pub fn allowed_processes(&self) -> usize {
        let Some(cap) = self.max_loadavg else {
            return std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        };

        let current = current_loadavg();
        let slack = [cap.0 - current.0, cap.1 - current.1, cap.2 - current.2]
            .into_iter()
            .fold(f64::INFINITY, f64::min);

        slack.max(0.0) as usize
    }
}

#[cfg(target_os = "linux")]
fn current_loadavg() -> (f64, f64, f64) {
    match std::fs::read_to_string("/proc/loadavg") {
        Ok(contents) => {
            let mut fields = contents.split_whitespace();
            let parse = |f: Option<&str>| f.and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            (
                parse(fields.next()),
                parse(fields.next()),
                parse(fields.next()),
            )
        }
        Err(_) => (0.0, 0.0, 0.0),
    }
}

#[cfg(not(target_os = "linux"))]
fn current_loadavg() -> (f64, f64, f64) {
    tracing::debug!("load-average reporting is not available on this platform");
    (0.0, 0.0, 0.0)
}
