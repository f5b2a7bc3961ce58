use std::path::PathBuf;

use clap::Parser;

/// Offline analyzer for Apache Traffic Server's on-disk HTTP cache format.
#[derive(Parser, Debug)]
#[command(name = "stripescan", about = "Inspects ATS cache spans offline", version)]
pub struct Cli {
    /// Directory containing records.config, storage.config and volume.config.
    #[arg(short = 'c', long = "config-dir", default_value = "/opt/trafficserver/etc/trafficserver")]
    pub config_dir: PathBuf,

    /// Treat the cache as built with FIPS mode enabled (doubles hash-key size).
    #[arg(short = 'f', long = "fips")]
    pub fips: bool,

    /// Caps worker spawning to keep the 1/5/15-minute load average under
    /// "a,b,c" (e.g. "4,3,2").
    #[arg(short = 'l', long = "loadavg")]
    pub loadavg: Option<String>,

    /// Dumps every stored object for one span, or all spans if no path given.
    #[arg(short = 'd', long = "dump")]
    pub dump: Option<Option<PathBuf>>,

    /// Dumps a per-host rollup instead of a per-object listing.
    #[arg(short = 'D', long = "dump-breakdown")]
    pub dump_breakdown: Option<Option<PathBuf>>,

    /// Disables load-average and I/O-priority limiting entirely.
    #[arg(long = "tgm")]
    pub tgm: bool,

    /// Emits verbose trace output to standard error.
    #[arg(long)]
    pub debug: bool,
}

/// Parses a `"a,b,c"` load-average cap string into its three components.
pub fn parse_loadavg(raw: &str) -> Result<(f64, f64, f64), String> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected \"a,b,c\", got \"{raw}\""));
    }
    let mut values = [0.0; 3];
    for (slot, part) in values.iter_mut().zip(parts.iter()) {
        *slot = part
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("not a number: \"{part}\""))?;
    }
    Ok((values[0], values[1], values[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loadavg_triple() {
        assert_eq!(parse_loadavg("4,3,2"), Ok((4.0, 3.0, 2.0)));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(parse_loadavg("1,2").is_err());
    }
}
