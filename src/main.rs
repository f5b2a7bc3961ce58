use std::process::ExitCode;

use clap::Parser;
use stripescan::cache::iterate::{self, ObjectEntry};
use stripescan::cache::span::Span;
use stripescan::cache::stripe::{self, Stripe};
use stripescan::cli::{self, Cli};
use stripescan::config::Config;
use stripescan::display;
use stripescan::primitives::FipsMode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(Failure::Interrupted) => ExitCode::from(2),
        Err(Failure::Other(e)) => {
            tracing::error!(error = %e, "stripescan failed");
            ExitCode::from(1)
        }
    }
}

enum Failure {
    Interrupted,
    Other(stripescan::CacheError),
}

impl From<stripescan::CacheError> for Failure {
    fn from(e: stripescan::CacheError) -> Self {
        match e {
            stripescan::CacheError::Interrupted => Failure::Interrupted,
            other => Failure::Other(other),
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<(), Failure> {
    let fips = FipsMode(cli.fips);
    let mut config = Config::load(&cli.config_dir, fips)?;

    if !cli.tgm {
        if let Some(raw) = &cli.loadavg {
            let cap = cli::parse_loadavg(raw).map_err(|msg| {
                Failure::Other(stripescan::CacheError::ConfigInvalid(msg))
            })?;
            if let Some(current) = config.set_max_loadavg(cap) {
                tracing::warn!(
                    one = current.0,
                    five = current.1,
                    fifteen = current.2,
                    "load average already past the requested cap at startup"
                );
            }
        }
    }

    let avg_obj_size = config
        .get_setting("cache.min_average_object_size")
        .and_then(|v| v.as_int())
        .filter(|&n| n > 0)
        .map(|n| n as u64)
        .unwrap_or(stripe::DEFAULT_AVG_OBJECT_SIZE);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    display::write_header(&mut out).map_err(|e| Failure::Other(e.into()))?;

    let dump_target = cli.dump.as_ref().or(cli.dump_breakdown.as_ref());
    let breakdown = cli.dump_breakdown.is_some();

    for (path, _entry) in config.spans() {
        if let Some(Some(wanted)) = dump_target {
            if wanted.as_path() != path {
                continue;
            }
        }

        let span = match Span::open(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(span = %path.display(), error = %e, "skipping unreadable span");
                continue;
            }
        };

        let mut objects = Vec::new();
        for header in &span.stripe_headers {
            if header.free {
                continue;
            }
            let mut stripe = match Stripe::read(path.to_path_buf(), *header, avg_obj_size) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(span = %path.display(), error = %e, "skipping unreadable stripe");
                    continue;
                }
            };

            let worker_count = if cli.tgm { 0 } else { config.allowed_processes() };
            let fetched: Vec<ObjectEntry> = if worker_count > 1 {
                match iterate::stored_objects_parallel(&mut stripe, path, fips, worker_count) {
                    Ok(stream) => {
                        let mut items = Vec::new();
                        for item in stream {
                            items.push(item?);
                        }
                        items
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                iterate::stored_objects(&mut stripe, path, fips)?
            };
            objects.extend(fetched);
        }

        if breakdown {
            let rollups = display::rollup_by_host(&objects);
            display::write_breakdown(
                &mut out,
                &rollups,
                config.total_cache_size_available(),
                objects.iter().map(|o| o.total_length).sum(),
            )
            .map_err(|e| Failure::Other(e.into()))?;
        } else {
            display::write_span_objects(&mut out, &path.display().to_string(), &objects)
                .map_err(|e| Failure::Other(e.into()))?;
        }
    }

    Ok(())
}
